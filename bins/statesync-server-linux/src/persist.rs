//! Periodic persistence for services that change too often to write on
//! every update.

use std::sync::Arc;
use std::time::Duration;

use statesync_core::FsPersistence;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Write `persistence` once per `period`, skipping periods with no change.
pub async fn persist_every<T: Send + 'static>(persistence: Arc<FsPersistence<T>>, period: Duration) {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        flush(persistence.clone()).await;
    }
}

/// Write pending changes off the async workers.
pub async fn flush<T: Send + 'static>(persistence: Arc<FsPersistence<T>>) {
    let key = persistence.key().to_string();
    match tokio::task::spawn_blocking(move || persistence.write_if_changed()).await {
        Ok(Ok(true)) => tracing::debug!(key, "periodic write"),
        Ok(Ok(false)) => {}
        Ok(Err(e)) => tracing::warn!(key, error = %e, "periodic write failed"),
        Err(e) => tracing::error!(key, "Periodic write task failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use statesync_core::{
        ConfigError, ConfigStorage, JsonCodec, MemoryConfigStorage, PedometerData, StateCodec,
        StateUpdateResult, StatefulService,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PERIOD: Duration = Duration::from_secs(30);

    #[derive(Default)]
    struct CountingStorage {
        inner: MemoryConfigStorage,
        saves: AtomicUsize,
    }

    impl ConfigStorage for CountingStorage {
        fn load(&self, key: &str) -> Result<Option<Value>, ConfigError> {
            self.inner.load(key)
        }

        fn save(&self, key: &str, value: &Value) -> Result<(), ConfigError> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            self.inner.save(key, value)
        }

        fn has_key(&self, key: &str) -> bool {
            self.inner.has_key(key)
        }

        fn delete_key(&self, key: &str) -> Result<(), ConfigError> {
            self.inner.delete_key(key)
        }
    }

    /// Blocking writes run on their own threads, so wait for them in real time.
    fn wait_for_saves(storage: &CountingStorage, n: usize) {
        for _ in 0..200 {
            if storage.saves.load(Ordering::SeqCst) >= n {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn step(service: &StatefulService<PedometerData>) {
        service.update_with_without_propagation(|data| {
            if data.record_step(0.5) {
                StateUpdateResult::Changed
            } else {
                StateUpdateResult::Unchanged
            }
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_most_one_write_per_period() {
        let storage = Arc::new(CountingStorage::default());
        let service = Arc::new(StatefulService::new(PedometerData::default()));
        let codec: Arc<dyn StateCodec<PedometerData>> =
            Arc::new(JsonCodec::<PedometerData>::new());
        let persistence = Arc::new(FsPersistence::new(
            service.clone(),
            codec,
            storage.clone(),
            "pedometer",
        ));
        let handle = tokio::spawn(persist_every(persistence, PERIOD));

        service.update_with_without_propagation(|data| {
            data.start_session(chrono::Utc::now());
            StateUpdateResult::Changed
        });
        for _ in 0..40 {
            step(&service);
        }
        tokio::time::sleep(PERIOD / 2).await;
        assert_eq!(storage.saves.load(Ordering::SeqCst), 0);

        tokio::time::sleep(PERIOD).await;
        wait_for_saves(&storage, 1);
        assert_eq!(storage.saves.load(Ordering::SeqCst), 1);
        assert_eq!(
            storage.load("pedometer").unwrap().unwrap()["sessions"][0]["steps"],
            40
        );

        // Quiet periods write nothing.
        tokio::time::sleep(PERIOD * 3).await;
        wait_for_saves(&storage, 2);
        assert_eq!(storage.saves.load(Ordering::SeqCst), 1);

        for _ in 0..40 {
            step(&service);
        }
        tokio::time::sleep(PERIOD).await;
        wait_for_saves(&storage, 2);
        assert_eq!(storage.saves.load(Ordering::SeqCst), 2);

        handle.abort();
    }

    #[tokio::test]
    async fn test_flush_writes_pending_changes() {
        let storage = Arc::new(CountingStorage::default());
        let service = Arc::new(StatefulService::new(PedometerData::default()));
        let codec: Arc<dyn StateCodec<PedometerData>> =
            Arc::new(JsonCodec::<PedometerData>::new());
        let persistence = Arc::new(FsPersistence::new(
            service.clone(),
            codec,
            storage.clone(),
            "pedometer",
        ));

        flush(persistence.clone()).await;
        flush(persistence.clone()).await;
        assert_eq!(storage.saves.load(Ordering::SeqCst), 1);

        service.update_with_without_propagation(|data| {
            data.magnets = 2.0;
            StateUpdateResult::Changed
        });
        flush(persistence).await;
        assert_eq!(storage.saves.load(Ordering::SeqCst), 2);
    }
}
