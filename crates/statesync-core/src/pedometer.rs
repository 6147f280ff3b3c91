//! Hamster-wheel pedometer state.
//!
//! A hall-effect sensor reports one pulse per magnet pass. Pulses are
//! grouped into sessions; distance follows from the wheel diameter and the
//! number of magnets on it.

use std::f32::consts::PI;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::hub::{EventHub, HubError};
use crate::state::{OriginId, StateUpdateResult, StatefulService, Validate, ValidationError};

/// Full pedometer state, sent on subscribe and whenever a session opens,
/// closes or is cleared.
pub const PEDOMETER_EVENT: &str = "pedometer";

/// Per-step notification, `{"time_elapsed": <seconds>}`.
pub const STEP_EVENT: &str = "step";

/// Inbound command clearing all sessions.
pub const RESET_EVENT: &str = "reset_pedometer";

/// Sessions kept. Starting one more drops the oldest.
pub const MAX_SESSIONS: usize = 50;

/// Step intervals kept per session. Steps past this are still counted.
pub const MAX_STEP_TIMES: usize = 2000;

/// One run on the wheel. `start` and `end` are unix seconds, `end` is 0
/// while the session is open. `times` holds seconds since the previous
/// step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionSlot {
    pub start: i64,
    pub end: i64,
    pub steps: u32,
    pub times: Vec<f32>,
}

impl SessionSlot {
    pub fn is_open(&self) -> bool {
        self.end == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PedometerData {
    pub magnets: f32,
    /// Wheel diameter in metres.
    pub diameter: f32,
    pub sessions: Vec<SessionSlot>,
}

impl Default for PedometerData {
    fn default() -> Self {
        Self {
            magnets: 1.0,
            diameter: 0.19,
            sessions: Vec::new(),
        }
    }
}

impl PedometerData {
    /// Open a new session. An open session is closed first and the oldest
    /// sessions are dropped to stay within [`MAX_SESSIONS`].
    pub fn start_session(&mut self, now: DateTime<Utc>) {
        self.end_session(now);
        if self.sessions.len() >= MAX_SESSIONS {
            let excess = self.sessions.len() + 1 - MAX_SESSIONS;
            self.sessions.drain(..excess);
        }
        self.sessions.push(SessionSlot {
            start: now.timestamp(),
            ..SessionSlot::default()
        });
    }

    /// Count one step in the open session.
    ///
    /// Returns `false` if there is no open session.
    pub fn record_step(&mut self, elapsed_secs: f32) -> bool {
        match self.sessions.last_mut() {
            Some(session) if session.is_open() => {
                session.steps = session.steps.saturating_add(1);
                if session.times.len() < MAX_STEP_TIMES {
                    session.times.push(elapsed_secs);
                }
                true
            }
            _ => false,
        }
    }

    /// Close the open session, if any. Returns whether one was closed.
    pub fn end_session(&mut self, now: DateTime<Utc>) -> bool {
        match self.sessions.last_mut() {
            Some(session) if session.is_open() => {
                session.end = now.timestamp().max(session.start).max(1);
                true
            }
            _ => false,
        }
    }

    pub fn has_open_session(&self) -> bool {
        self.sessions.last().is_some_and(SessionSlot::is_open)
    }

    pub fn reset(&mut self) {
        self.sessions.clear();
    }

    pub fn total_steps(&self) -> u64 {
        self.sessions.iter().map(|s| u64::from(s.steps)).sum()
    }

    /// Wheel circumference in metres.
    pub fn circumference(&self) -> f32 {
        PI * self.diameter
    }

    /// Metres covered across all sessions.
    pub fn distance(&self) -> f32 {
        self.total_steps() as f32 / self.magnets * self.circumference()
    }
}

impl Validate for PedometerData {
    fn validate(self) -> Result<Self, ValidationError> {
        if !(self.magnets.is_finite() && self.magnets >= 1.0) {
            return Err(ValidationError::new("magnets", "must be at least 1"));
        }
        if !(self.diameter.is_finite() && self.diameter > 0.0) {
            return Err(ValidationError::new("diameter", "must be positive"));
        }
        if self.sessions.len() > MAX_SESSIONS {
            return Err(ValidationError::new(
                "sessions",
                format!("at most {MAX_SESSIONS} sessions"),
            ));
        }
        for (i, session) in self.sessions.iter().enumerate() {
            if session.end != 0 && session.end < session.start {
                return Err(ValidationError::new(
                    format!("sessions[{i}].end"),
                    "before start",
                ));
            }
            if session.times.len() > MAX_STEP_TIMES {
                return Err(ValidationError::new(
                    format!("sessions[{i}].times"),
                    format!("at most {MAX_STEP_TIMES} entries"),
                ));
            }
        }
        Ok(self)
    }
}

/// Drives a pedometer service from sensor pulses.
///
/// Session changes go through the service and reach subscribers of
/// [`PEDOMETER_EVENT`] as a full snapshot. Steps only touch the state
/// silently and are announced with a small [`STEP_EVENT`] frame, so a
/// running wheel does not resend or rewrite the whole history.
pub struct PedometerService {
    service: Arc<StatefulService<PedometerData>>,
    hub: Arc<EventHub>,
}

impl PedometerService {
    pub fn new(service: Arc<StatefulService<PedometerData>>, hub: Arc<EventHub>) -> Self {
        Self { service, hub }
    }

    pub fn service(&self) -> &Arc<StatefulService<PedometerData>> {
        &self.service
    }

    /// Register the step notification and the reset command.
    pub fn begin(&self) -> Result<(), HubError> {
        self.hub.register_event(STEP_EVENT)?;
        self.hub.register_event(RESET_EVENT)?;

        let service = Arc::downgrade(&self.service);
        self.hub.on_event(RESET_EVENT, move |_payload, origin| {
            if let Some(service) = service.upgrade() {
                info!(connection = %origin, "resetting pedometer");
                service.update_with(
                    |data| {
                        if data.sessions.is_empty() {
                            StateUpdateResult::Unchanged
                        } else {
                            data.reset();
                            StateUpdateResult::Changed
                        }
                    },
                    origin,
                );
            }
            Ok(())
        })
    }

    pub fn start_session(&self, now: DateTime<Utc>, origin: &OriginId) {
        self.service.update_with(
            |data| {
                data.start_session(now);
                StateUpdateResult::Changed
            },
            origin,
        );
    }

    /// Returns whether a session was closed.
    pub fn end_session(&self, now: DateTime<Utc>, origin: &OriginId) -> bool {
        self.service
            .update_with(
                |data| {
                    if data.end_session(now) {
                        StateUpdateResult::Changed
                    } else {
                        StateUpdateResult::Unchanged
                    }
                },
                origin,
            )
            .is_changed()
    }

    /// Count a step and announce it. Returns `Ok(false)` when no session
    /// is open.
    pub fn record_step(&self, elapsed_secs: f32, origin: &OriginId) -> Result<bool, HubError> {
        let counted = self
            .service
            .update_with_without_propagation(|data| {
                if data.record_step(elapsed_secs) {
                    StateUpdateResult::Changed
                } else {
                    StateUpdateResult::Unchanged
                }
            })
            .is_changed();

        if counted {
            self.hub.emit(
                STEP_EVENT,
                &json!({ "time_elapsed": elapsed_secs }),
                origin,
                false,
            )?;
        }
        Ok(counted)
    }
}
