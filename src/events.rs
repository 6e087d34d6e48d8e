// src/events.rs
//
// Typed event stream from the core to presenters. Subsystems publish
// events instead of reaching into each other's state; any number of
// presenters subscribe and render.

use crate::types::{TrafficDensity, TrafficLight, ViolationRecord};
use opencv::core::Mat;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Action,
    Violation,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Action => "ACTION",
            LogLevel::Violation => "VIOLATION",
        }
    }
}

#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// Emitted only when the count actually changes.
    VehicleCountChanged { approach: usize, count: usize },
    /// Emitted only when the bucket actually changes.
    DensityChanged {
        approach: usize,
        density: TrafficDensity,
    },
    /// Emitted only on a light transition.
    TrafficLightChanged {
        approach: usize,
        light: TrafficLight,
    },
    /// Emitted once per processed frame, with tracker overlays drawn.
    FrameUpdated { approach: usize, frame: Mat },
    /// Emitted exactly once per violation.
    ViolationDetected(ViolationRecord),
    CameraStatusChanged { approach: usize, connected: bool },
    ArduinoStatusChanged { connected: bool, port: String },
    EnergySavingStatusChanged { active: bool },
    LogMessage { message: String, level: LogLevel },
}

/// Broadcast fan-out for `CoreEvent`s. Publishing never blocks; a
/// subscriber that falls behind sees a lag error on its receiver rather
/// than stalling the control loop.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: CoreEvent) {
        // A send error only means nobody is subscribed.
        let _ = self.tx.send(event);
    }

    /// Publish a `LogMessage` event and mirror it onto the tracing sink.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Info | LogLevel::Action => info!("{message}"),
            LogLevel::Warning => warn!("{message}"),
            LogLevel::Error => error!("{message}"),
            LogLevel::Violation => warn!("VIOLATION: {message}"),
        }
        self.publish(CoreEvent::LogMessage { message, level });
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receivers", &self.tx.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_arrive_in_publish_order() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(CoreEvent::VehicleCountChanged {
            approach: 0,
            count: 3,
        });
        bus.publish(CoreEvent::DensityChanged {
            approach: 0,
            density: TrafficDensity::Low,
        });

        match rx.try_recv().unwrap() {
            CoreEvent::VehicleCountChanged { approach: 0, count } => assert_eq!(count, 3),
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.try_recv().unwrap() {
            CoreEvent::DensityChanged { density, .. } => {
                assert_eq!(density, TrafficDensity::Low)
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new(4);
        bus.publish(CoreEvent::EnergySavingStatusChanged { active: true });
    }
}
