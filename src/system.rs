// src/system.rs
//
// The control loop: owns the phase state machine, the cameras, the
// serial link and the frame-dispatch scheduler, all on one task. The
// detection worker is the only other thread; it communicates through the
// single-slot mailbox and the results channel. Presenters talk to the
// loop through `SystemHandle` commands and the broadcast event stream.

use crate::arduino::{self, ArduinoLink, IrMonitor, LineBuffer, SerialEvent};
use crate::camera::Camera;
use crate::config::Settings;
use crate::controller::{PhaseController, PhaseOutput};
use crate::density;
use crate::detector::{resolve_asset_path, VehicleDetector};
use crate::events::{CoreEvent, EventBus, LogLevel};
use crate::types::{Roi, TrafficDensity, TrafficLight, ViolationRecord, NUM_APPROACHES};
use crate::violations::{timestamp_now, ViolationStore};
use crate::worker::{FrameJob, SharedThresholds, WorkerHandle, WorkerMessage};
use anyhow::{Context, Result};
use opencv::core::Mat;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

const SCHEDULER_PERIOD: Duration = Duration::from_millis(50);
const COUNTDOWN_PERIOD: Duration = Duration::from_secs(1);
const SENSOR_POLL_PERIOD: Duration = Duration::from_millis(250);

/// Operations a presenter can request, one per configuration-surface
/// entry. Applied in arrival order on the control loop.
#[derive(Debug, Clone)]
pub enum ControlCommand {
    SetLightTiming {
        density: TrafficDensity,
        seconds: u32,
    },
    SetYellowDuration { seconds: u32 },
    SetEnergySavingEnabled(bool),
    SetViolationDetectionEnabled(bool),
    SetRoadRoi { approach: usize, roi: Roi },
    SetYoloThresholds { confidence: f32, nms: f32 },
    ConnectCamera { approach: usize, uri: String },
    DisconnectCamera { approach: usize },
    InitializeArduino { port: Option<String> },
    SetSimulationMode(bool),
    Start,
    Stop,
    Shutdown,
}

#[derive(Clone)]
pub struct SystemHandle {
    tx: mpsc::UnboundedSender<ControlCommand>,
}

impl SystemHandle {
    fn send(&self, command: ControlCommand) {
        // A send failure only means the system already shut down.
        let _ = self.tx.send(command);
    }

    pub fn set_light_timing(&self, density: TrafficDensity, seconds: u32) {
        self.send(ControlCommand::SetLightTiming { density, seconds });
    }

    pub fn set_yellow_duration(&self, seconds: u32) {
        self.send(ControlCommand::SetYellowDuration { seconds });
    }

    pub fn set_energy_saving_enabled(&self, enabled: bool) {
        self.send(ControlCommand::SetEnergySavingEnabled(enabled));
    }

    pub fn set_violation_detection_enabled(&self, enabled: bool) {
        self.send(ControlCommand::SetViolationDetectionEnabled(enabled));
    }

    pub fn set_road_roi(&self, approach: usize, roi: Roi) {
        self.send(ControlCommand::SetRoadRoi { approach, roi });
    }

    pub fn set_yolo_thresholds(&self, confidence: f32, nms: f32) {
        self.send(ControlCommand::SetYoloThresholds { confidence, nms });
    }

    pub fn connect_camera(&self, approach: usize, uri: impl Into<String>) {
        self.send(ControlCommand::ConnectCamera {
            approach,
            uri: uri.into(),
        });
    }

    pub fn disconnect_camera(&self, approach: usize) {
        self.send(ControlCommand::DisconnectCamera { approach });
    }

    pub fn initialize_arduino(&self, port: Option<String>) {
        self.send(ControlCommand::InitializeArduino { port });
    }

    pub fn set_simulation_mode(&self, simulation: bool) {
        self.send(ControlCommand::SetSimulationMode(simulation));
    }

    pub fn start_system(&self) {
        self.send(ControlCommand::Start);
    }

    pub fn stop_system(&self) {
        self.send(ControlCommand::Stop);
    }

    /// Stop the system and terminate the control loop.
    pub fn shutdown(&self) {
        self.send(ControlCommand::Shutdown);
    }
}

pub fn list_serial_ports() -> Vec<String> {
    arduino::available_ports()
}

struct ApproachState {
    camera: Option<Camera>,
    /// Latest decoded frame, shared with the delayed IR-capture tasks.
    current_frame: Arc<Mutex<Option<Mat>>>,
    vehicle_count: usize,
    density: TrafficDensity,
    roi: Roi,
    /// Vehicle IDs already recorded during the current red phase.
    violated_ids: HashSet<u32>,
}

impl ApproachState {
    fn new() -> Self {
        Self {
            camera: None,
            current_frame: Arc::new(Mutex::new(None)),
            vehicle_count: 0,
            density: TrafficDensity::Off,
            roi: Roi::default(),
            violated_ids: HashSet::new(),
        }
    }

    fn connected(&self) -> bool {
        self.camera.is_some()
    }

    /// Return to the not-connected baseline: camera handle dropped,
    /// count/density/ROI and violation bookkeeping cleared, the shared
    /// frame slot emptied. Connect after disconnect therefore starts
    /// from the same state as the very first connect.
    fn reset(&mut self) {
        self.camera = None;
        self.vehicle_count = 0;
        self.density = TrafficDensity::Off;
        self.roi = Roi::default();
        self.violated_ids.clear();
        match self.current_frame.lock() {
            Ok(mut guard) => *guard = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }

    fn clone_current_frame(&self) -> Option<Mat> {
        clone_shared_frame(&self.current_frame)
    }
}

/// Admission gate for the 20 Hz scheduler: the next approach to serve,
/// or `None` while the system is stopped or a detection job is already
/// in flight. Rotation always advances by one, so a slow or disconnected
/// camera cannot starve the others.
fn next_dispatch_index(running: bool, worker_busy: bool, current: usize) -> Option<usize> {
    if !running || worker_busy {
        return None;
    }
    Some((current + 1) % NUM_APPROACHES)
}

fn clone_shared_frame(shared: &Arc<Mutex<Option<Mat>>>) -> Option<Mat> {
    let guard = match shared.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    guard.clone()
}

pub struct TrafficSystem {
    approaches: [ApproachState; NUM_APPROACHES],
    controller: PhaseController,
    arduino: ArduinoLink,
    line_buffer: LineBuffer,
    ir_monitor: IrMonitor,
    worker: WorkerHandle,
    worker_busy: bool,
    dispatch_index: usize,
    violation_detection_enabled: bool,
    events: EventBus,
    store: ViolationStore,
    cmd_rx: Option<mpsc::UnboundedReceiver<ControlCommand>>,
    worker_rx: Option<mpsc::UnboundedReceiver<WorkerMessage>>,
    serial_rx: Option<mpsc::UnboundedReceiver<SerialEvent>>,
    serial_tx: mpsc::UnboundedSender<SerialEvent>,
}

impl TrafficSystem {
    /// Build the core. The only fatal failure is the detector: missing
    /// model or class files refuse to initialize, per the fail-fast rule.
    pub fn new(settings: &Settings) -> Result<(Self, SystemHandle)> {
        let model_path = resolve_asset_path(&settings.model_path);
        let class_names_path = resolve_asset_path(&settings.class_names_path);
        let detector = VehicleDetector::new(&model_path, &class_names_path)
            .context("failed to initialize ML models; system cannot start")?;

        let thresholds = Arc::new(SharedThresholds::new(
            settings.confidence_threshold,
            settings.nms_threshold,
        ));
        let mut worker = WorkerHandle::spawn(detector, thresholds)?;
        let worker_rx = worker.take_messages();

        let controller = PhaseController::new(
            settings.green_durations,
            settings.yellow_duration,
            settings.energy_saving_enabled,
        );

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (serial_tx, serial_rx) = mpsc::unbounded_channel();

        let system = Self {
            approaches: std::array::from_fn(|_| ApproachState::new()),
            controller,
            arduino: ArduinoLink::new(),
            line_buffer: LineBuffer::new(),
            ir_monitor: IrMonitor::new(),
            worker,
            worker_busy: false,
            dispatch_index: 0,
            violation_detection_enabled: settings.violation_detection_enabled,
            events: EventBus::new(256),
            store: ViolationStore::new(),
            cmd_rx: Some(cmd_rx),
            worker_rx: Some(worker_rx),
            serial_rx: Some(serial_rx),
            serial_tx,
        };

        Ok((system, SystemHandle { tx: cmd_tx }))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    pub fn violation_directory(&self) -> &std::path::Path {
        self.store.directory()
    }

    /// Run the control loop until `shutdown` is requested or every
    /// handle is dropped.
    pub async fn run(mut self) -> Result<()> {
        let mut cmd_rx = self.cmd_rx.take().context("control loop already running")?;
        let mut worker_rx = self.worker_rx.take().context("control loop already running")?;
        let mut serial_rx = self.serial_rx.take().context("control loop already running")?;

        let mut scheduler = interval(SCHEDULER_PERIOD);
        let mut countdown = interval(COUNTDOWN_PERIOD);
        let mut sensor_poll = interval(SENSOR_POLL_PERIOD);
        for timer in [&mut scheduler, &mut countdown, &mut sensor_poll] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        }

        self.events.log(LogLevel::Info, "Traffic system core initialized.");

        loop {
            tokio::select! {
                _ = scheduler.tick() => {
                    self.on_scheduler_tick();
                }
                _ = countdown.tick() => {
                    let outputs = self.controller.tick_second();
                    self.apply_outputs(outputs).await;
                    if self.controller.take_countdown_restart() {
                        countdown.reset();
                    }
                }
                _ = sensor_poll.tick() => {
                    self.on_sensor_poll().await;
                }
                Some(event) = serial_rx.recv() => {
                    self.on_serial_event(event).await;
                    if self.controller.take_countdown_restart() {
                        countdown.reset();
                    }
                }
                Some(message) = worker_rx.recv() => {
                    self.on_worker_message(message).await;
                    if self.controller.take_countdown_restart() {
                        countdown.reset();
                    }
                }
                command = cmd_rx.recv() => {
                    match command {
                        Some(ControlCommand::Shutdown) | None => {
                            self.shutdown().await;
                            break;
                        }
                        Some(command) => {
                            self.apply_command(command).await;
                            if self.controller.take_countdown_restart() {
                                countdown.reset();
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Scheduler
    // ------------------------------------------------------------------

    /// 20 Hz frame dispatch. Admission control: nothing is read while a
    /// job is in flight, and rotation advances even past approaches with
    /// nothing to offer, so a slow camera cannot starve the others.
    fn on_scheduler_tick(&mut self) {
        let Some(index) = next_dispatch_index(
            self.controller.is_running(),
            self.worker_busy,
            self.dispatch_index,
        ) else {
            return;
        };
        self.dispatch_index = index;
        let light = self.controller.light(index);

        let approach = &mut self.approaches[index];
        let Some(camera) = approach.camera.as_mut() else {
            return;
        };
        if !camera.is_opened() {
            return;
        }
        // A failed read skips this tick for this approach; only the
        // operator disconnects cameras.
        let Some(frame) = camera.read() else {
            return;
        };

        let frame_for_worker = frame.clone();
        match approach.current_frame.lock() {
            Ok(mut guard) => *guard = Some(frame),
            Err(poisoned) => *poisoned.into_inner() = Some(frame),
        }

        if self.worker.try_dispatch(FrameJob {
            approach: index,
            frame: frame_for_worker,
            roi: approach.roi,
            light,
        }) {
            self.worker_busy = true;
        }
    }

    // ------------------------------------------------------------------
    // Worker results
    // ------------------------------------------------------------------

    async fn on_worker_message(&mut self, message: WorkerMessage) {
        match message {
            WorkerMessage::Log { message, level } => self.events.log(level, message),
            WorkerMessage::Result(result) => {
                self.worker_busy = false;
                let index = result.approach;
                if index >= NUM_APPROACHES {
                    return;
                }

                if self.approaches[index].vehicle_count != result.vehicle_count {
                    self.approaches[index].vehicle_count = result.vehicle_count;
                    self.events.publish(CoreEvent::VehicleCountChanged {
                        approach: index,
                        count: result.vehicle_count,
                    });

                    let new_density = density::classify(result.vehicle_count);
                    if self.approaches[index].density != new_density {
                        self.approaches[index].density = new_density;
                        self.events.publish(CoreEvent::DensityChanged {
                            approach: index,
                            density: new_density,
                        });
                    }
                }

                self.events.publish(CoreEvent::FrameUpdated {
                    approach: index,
                    frame: result.display_frame,
                });

                if self.violation_detection_enabled {
                    for id in result.violating_ids {
                        if self.approaches[index].violated_ids.insert(id) {
                            self.record_tracker_violation(index, id);
                        }
                    }
                }

                let outputs = self
                    .controller
                    .on_processing_result(index, result.vehicle_count);
                self.apply_outputs(outputs).await;
            }
        }
    }

    fn record_tracker_violation(&mut self, approach: usize, vehicle_id: u32) {
        let timestamp = timestamp_now();
        let reason = format!("Vehicle ID {vehicle_id} ran red light");
        let frame = self.approaches[approach].clone_current_frame();

        if let Some(frame) = &frame {
            let filename = ViolationStore::tracker_filename(&timestamp, approach);
            if let Err(e) = self.store.save(&filename, frame) {
                self.events
                    .log(LogLevel::Error, format!("Failed to save violation image: {e:#}"));
            }
        }

        self.events.log(LogLevel::Violation, reason.clone());
        self.events.publish(CoreEvent::ViolationDetected(ViolationRecord {
            approach,
            timestamp,
            reason,
            frame,
        }));
    }

    // ------------------------------------------------------------------
    // Serial link
    // ------------------------------------------------------------------

    async fn on_sensor_poll(&mut self) {
        if !self.controller.is_running() || !self.arduino.connected {
            return;
        }
        if let Err(e) = self.arduino.send_command("GET_SENSORS").await {
            self.handle_serial_failure(e.to_string());
        }
    }

    async fn on_serial_event(&mut self, event: SerialEvent) {
        match event {
            SerialEvent::Data { generation, bytes } => {
                if generation != self.arduino.generation() {
                    return;
                }
                let lines = self.line_buffer.push(&bytes);
                for line in lines {
                    if let Some(states) = arduino::parse_sensor_line(&line) {
                        self.on_sensor_states(states).await;
                    } else {
                        debug!("unrecognized serial line: {line}");
                    }
                }
            }
            SerialEvent::Closed { generation, error } => {
                if generation != self.arduino.generation() {
                    return;
                }
                self.handle_serial_failure(error);
            }
        }
    }

    async fn on_sensor_states(&mut self, states: [bool; NUM_APPROACHES]) {
        let eligible = std::array::from_fn(|i| {
            self.controller.light(i) == TrafficLight::Red && self.violation_detection_enabled
        });
        let triggered = self
            .ir_monitor
            .update(states, eligible, std::time::Instant::now());
        for approach in triggered {
            self.record_ir_violation(approach);
        }
    }

    /// An IR trigger captures three frames: one immediately and two more
    /// at +500 ms and +1000 ms, giving the vehicle time to clear the
    /// stop line in the evidence sequence.
    fn record_ir_violation(&mut self, approach: usize) {
        let timestamp = timestamp_now();
        let reason = format!("IR sensor triggered on red light for Road {}", approach + 1);
        let frame = self.approaches[approach].clone_current_frame();

        if let Some(frame) = &frame {
            let filename = ViolationStore::ir_filename(&timestamp, approach, 1);
            if let Err(e) = self.store.save(&filename, frame) {
                self.events
                    .log(LogLevel::Error, format!("Failed to save IR violation image: {e:#}"));
            }
        }

        self.events.log(LogLevel::Violation, reason.clone());
        self.events.publish(CoreEvent::ViolationDetected(ViolationRecord {
            approach,
            timestamp: timestamp.clone(),
            reason,
            frame,
        }));

        for (delay, image_num) in [(Duration::from_millis(500), 2), (Duration::from_millis(1000), 3)]
        {
            let shared = Arc::clone(&self.approaches[approach].current_frame);
            let store = self.store.clone();
            let events = self.events.clone();
            let timestamp = timestamp.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(frame) = clone_shared_frame(&shared) {
                    let filename = ViolationStore::ir_filename(&timestamp, approach, image_num);
                    if let Err(e) = store.save(&filename, &frame) {
                        events.log(
                            LogLevel::Error,
                            format!("Failed to save IR violation image: {e:#}"),
                        );
                    }
                }
            });
        }
    }

    fn handle_serial_failure(&mut self, error: String) {
        if !self.arduino.connected {
            return;
        }
        self.events
            .log(LogLevel::Error, format!("Arduino error: {error}"));
        self.arduino.close();
        self.events.publish(CoreEvent::ArduinoStatusChanged {
            connected: false,
            port: String::new(),
        });
    }

    // ------------------------------------------------------------------
    // Phase outputs
    // ------------------------------------------------------------------

    async fn apply_outputs(&mut self, outputs: Vec<PhaseOutput>) {
        for output in outputs {
            match output {
                PhaseOutput::Light { approach, light } => {
                    self.events
                        .publish(CoreEvent::TrafficLightChanged { approach, light });
                    if self.arduino.connected {
                        let command = format!("L_{}_{}", approach, light.wire_letter());
                        if let Err(e) = self.arduino.send_command(&command).await {
                            self.handle_serial_failure(e.to_string());
                        }
                    }
                }
                PhaseOutput::ClearViolations { approach } => {
                    self.approaches[approach].violated_ids.clear();
                }
                PhaseOutput::EnergySaving { active } => {
                    self.events
                        .publish(CoreEvent::EnergySavingStatusChanged { active });
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Presenter commands
    // ------------------------------------------------------------------

    async fn apply_command(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::SetLightTiming { density, seconds } => {
                self.controller.set_light_timing(density, seconds);
                self.events.log(
                    LogLevel::Action,
                    format!("Green duration for {density} set to {seconds}s"),
                );
            }
            ControlCommand::SetYellowDuration { seconds } => {
                self.controller.set_yellow_duration(seconds);
                self.events
                    .log(LogLevel::Action, format!("Yellow duration set to {seconds}s"));
            }
            ControlCommand::SetEnergySavingEnabled(enabled) => {
                self.controller.set_energy_saving_enabled(enabled);
                self.events.log(
                    LogLevel::Action,
                    format!("Energy saving {}", if enabled { "enabled" } else { "disabled" }),
                );
            }
            ControlCommand::SetViolationDetectionEnabled(enabled) => {
                self.violation_detection_enabled = enabled;
                self.events.log(
                    LogLevel::Action,
                    format!(
                        "Violation detection {}",
                        if enabled { "enabled" } else { "disabled" }
                    ),
                );
            }
            ControlCommand::SetRoadRoi { approach, roi } => {
                if approach < NUM_APPROACHES {
                    self.approaches[approach].roi = roi;
                    self.events.log(
                        LogLevel::Action,
                        format!("ROI updated for Road {}", approach + 1),
                    );
                }
            }
            ControlCommand::SetYoloThresholds { confidence, nms } => {
                self.worker.set_thresholds(confidence, nms);
                self.events.log(
                    LogLevel::Action,
                    format!("Detector thresholds set: confidence={confidence}, nms={nms}"),
                );
            }
            ControlCommand::ConnectCamera { approach, uri } => {
                self.connect_camera(approach, &uri);
            }
            ControlCommand::DisconnectCamera { approach } => {
                self.disconnect_camera(approach);
            }
            ControlCommand::InitializeArduino { port } => {
                self.initialize_arduino(port).await;
            }
            ControlCommand::SetSimulationMode(simulation) => {
                self.set_simulation_mode(simulation).await;
            }
            ControlCommand::Start => {
                if !self.controller.is_running() {
                    let outputs = self.controller.start();
                    self.apply_outputs(outputs).await;
                    self.events.log(LogLevel::Info, "Traffic system started.");
                }
            }
            ControlCommand::Stop => {
                if self.controller.is_running() {
                    let outputs = self.controller.stop();
                    self.apply_outputs(outputs).await;
                    self.events.log(LogLevel::Info, "Traffic system stopped.");
                }
            }
            // Handled by the run loop.
            ControlCommand::Shutdown => {}
        }
    }

    fn connect_camera(&mut self, approach: usize, uri: &str) {
        if approach >= NUM_APPROACHES {
            return;
        }
        self.disconnect_camera(approach);

        match Camera::open(uri) {
            Ok(camera) => {
                self.approaches[approach].camera = Some(camera);
                self.controller.set_camera_connected(approach, true);
                self.events.publish(CoreEvent::CameraStatusChanged {
                    approach,
                    connected: true,
                });
                self.events.log(
                    LogLevel::Info,
                    format!("Camera {} connected to source: {uri}", approach + 1),
                );
            }
            Err(e) => {
                self.events
                    .log(LogLevel::Error, format!("Failed to open camera source: {e:#}"));
            }
        }
    }

    fn disconnect_camera(&mut self, approach: usize) {
        if approach >= NUM_APPROACHES || !self.approaches[approach].connected() {
            return;
        }

        let state = &mut self.approaches[approach];
        let had_count = state.vehicle_count;
        let had_density = state.density;
        state.reset();

        if had_count != 0 {
            self.events.publish(CoreEvent::VehicleCountChanged {
                approach,
                count: 0,
            });
        }
        if had_density != TrafficDensity::Off {
            self.events.publish(CoreEvent::DensityChanged {
                approach,
                density: TrafficDensity::Off,
            });
        }

        self.controller.set_camera_connected(approach, false);
        self.events.publish(CoreEvent::CameraStatusChanged {
            approach,
            connected: false,
        });
        self.events
            .log(LogLevel::Info, format!("Camera {} disconnected.", approach + 1));
    }

    async fn initialize_arduino(&mut self, port: Option<String>) {
        let port = port
            .filter(|p| !p.is_empty())
            .or_else(|| arduino::available_ports().into_iter().next());
        let Some(port) = port else {
            self.events.log(
                LogLevel::Warning,
                "No serial ports found. Running without the light controller.",
            );
            return;
        };

        match self.arduino.connect(&port, self.serial_tx.clone()).await {
            Ok(()) => {
                // Fresh connection: stale partial lines and edge state
                // from a previous port must not leak in.
                self.line_buffer = LineBuffer::new();
                self.ir_monitor = IrMonitor::new();
                self.events.publish(CoreEvent::ArduinoStatusChanged {
                    connected: true,
                    port: port.clone(),
                });
                self.events
                    .log(LogLevel::Info, format!("Arduino connected on port {port}"));
            }
            Err(e) => {
                self.events
                    .log(LogLevel::Error, format!("Failed to open Arduino port {port}: {e:#}"));
            }
        }
    }

    async fn set_simulation_mode(&mut self, simulation: bool) {
        if simulation && self.arduino.connected {
            self.arduino.close();
            self.events.publish(CoreEvent::ArduinoStatusChanged {
                connected: false,
                port: "Simulation".to_string(),
            });
            self.events
                .log(LogLevel::Info, "Simulation mode: serial link closed.");
        } else if !simulation && !self.arduino.connected {
            self.initialize_arduino(None).await;
        }
    }

    async fn shutdown(&mut self) {
        if self.controller.is_running() {
            let outputs = self.controller.stop();
            self.apply_outputs(outputs).await;
        }
        self.arduino.close();
        self.events.log(LogLevel::Info, "Traffic system shut down.");
        // Dropping `self.worker` joins the detection thread; pending
        // mailbox jobs are discarded.
        if self.worker_busy {
            warn!("shutting down with a detection job in flight; result discarded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_gate_refuses_dispatch_while_stopped_or_busy() {
        assert_eq!(next_dispatch_index(false, false, 0), None);
        assert_eq!(next_dispatch_index(true, true, 0), None);
        assert_eq!(next_dispatch_index(false, true, 0), None);
        assert_eq!(next_dispatch_index(true, false, 0), Some(1));
    }

    #[test]
    fn scheduler_rotates_round_robin_over_all_approaches() {
        let mut index = NUM_APPROACHES - 1;
        let mut served = Vec::new();
        for _ in 0..2 * NUM_APPROACHES {
            index = next_dispatch_index(true, false, index).unwrap();
            served.push(index);
        }
        assert_eq!(served, vec![0, 1, 2, 3, 0, 1, 2, 3]);
    }

    #[test]
    fn slow_worker_never_accumulates_jobs() {
        // A detector that takes 500ms spans ten 50ms scheduler ticks.
        // The busy flag blocks every one of them, so the number of jobs
        // in flight never exceeds one.
        let mut busy = false;
        let mut in_flight = 0usize;
        let mut index = 0;
        for tick in 0..40 {
            if let Some(next) = next_dispatch_index(true, busy, index) {
                index = next;
                in_flight += 1;
                busy = true;
            }
            assert!(in_flight <= 1, "mailbox depth exceeded 1 at tick {tick}");
            if busy && tick % 10 == 9 {
                // Result arrives; the flag clears and the next tick may
                // dispatch again.
                in_flight -= 1;
                busy = false;
            }
        }
    }

    #[test]
    fn disconnect_reset_restores_initial_approach_state() {
        let mut state = ApproachState::new();
        state.vehicle_count = 5;
        state.density = TrafficDensity::Medium;
        state.roi = Roi::new(10, 10, 200, 150);
        state.violated_ids.insert(7);
        match state.current_frame.lock() {
            Ok(mut guard) => *guard = Some(Mat::default()),
            Err(poisoned) => *poisoned.into_inner() = Some(Mat::default()),
        }

        state.reset();

        let fresh = ApproachState::new();
        assert!(!state.connected());
        assert_eq!(state.vehicle_count, fresh.vehicle_count);
        assert_eq!(state.density, fresh.density);
        assert_eq!(state.roi, fresh.roi);
        assert!(state.violated_ids.is_empty());
        assert!(state.clone_current_frame().is_none());
    }
}
