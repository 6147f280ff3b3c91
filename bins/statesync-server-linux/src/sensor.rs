//! Simulated hall-effect step sensor.
//!
//! Produces a repeating pattern: a session opens, a run of steps follows,
//! the session closes and the wheel rests for a while.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use statesync_core::{HubError, OriginId, PedometerService};

const RUN_STEPS: u64 = 20;
const REST_TICKS: u64 = 10;
const CYCLE: u64 = RUN_STEPS + REST_TICKS + 2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SensorAction {
    Start,
    /// Seconds since the previous pulse.
    Step(f32),
    End,
    Idle,
}

/// What the sensor does on tick `tick`.
pub fn action_for(tick: u64, period: Duration) -> SensorAction {
    match tick % CYCLE {
        0 => SensorAction::Start,
        n if n <= RUN_STEPS => {
            // Small deterministic jitter around the tick period.
            let jitter = (n % 5) as f32 * 0.02;
            SensorAction::Step(period.as_secs_f32() + jitter)
        }
        n if n == RUN_STEPS + 1 => SensorAction::End,
        _ => SensorAction::Idle,
    }
}

/// Apply one action. Returns whether the pedometer changed.
pub fn apply(
    action: SensorAction,
    pedometer: &PedometerService,
    now: DateTime<Utc>,
    origin: &OriginId,
) -> Result<bool, HubError> {
    match action {
        SensorAction::Start => {
            pedometer.start_session(now, origin);
            Ok(true)
        }
        SensorAction::Step(elapsed) => pedometer.record_step(elapsed, origin),
        SensorAction::End => Ok(pedometer.end_session(now, origin)),
        SensorAction::Idle => Ok(false),
    }
}

/// Drive `pedometer` forever, one action per `period`.
pub async fn run(pedometer: Arc<PedometerService>, period: Duration) {
    let origin = OriginId::new("sensor");
    let mut interval = tokio::time::interval(period);
    let mut tick = 0u64;

    loop {
        interval.tick().await;
        let action = action_for(tick, period);
        tick += 1;

        if action == SensorAction::Idle {
            continue;
        }

        // Update handlers may block on storage.
        let pedometer = pedometer.clone();
        let origin = origin.clone();
        match tokio::task::spawn_blocking(move || apply(action, &pedometer, Utc::now(), &origin))
            .await
        {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "step not announced"),
            Err(e) => tracing::error!("Sensor update failed: {}", e),
        }
    }
}
