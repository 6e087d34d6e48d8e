// src/lib.rs
//
// Adaptive traffic-control engine for a four-way signalized
// intersection: camera frames are fused into per-approach vehicle
// densities that drive the green-phase lengths, while a tracker and an
// IR ground sensor independently record red-light violations. The
// GUI-facing surface is the `CoreEvent` stream plus the `SystemHandle`
// command set; everything else is internal.

pub mod arduino;
pub mod camera;
pub mod config;
pub mod controller;
pub mod density;
pub mod detector;
pub mod events;
pub mod system;
pub mod tracker;
pub mod types;
pub mod violations;
pub mod worker;

pub use config::Settings;
pub use events::{CoreEvent, LogLevel};
pub use system::{list_serial_ports, SystemHandle, TrafficSystem};
pub use types::{Roi, TrafficDensity, TrafficLight, ViolationRecord};
