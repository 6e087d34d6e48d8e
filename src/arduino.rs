// src/arduino.rs
//
// Serial link to the light/sensor microcontroller. Wire format is
// LF-terminated ASCII at 9600 baud:
//
//   out: INIT            once, after a 2s boot grace period
//        L_<road>_<c>    light command, c in {R, Y, G, F}
//        GET_SENSORS     poll request
//   in:  SENSORS:b0,b1,b2,b3   IR sensor bitmap, b in {0, 1}
//
// Reading is split into a forwarding task (raw chunks over a channel,
// tagged with a connection generation so stale events from a replaced
// port are ignored); framing, parsing and edge detection stay on the
// control loop.

use anyhow::{Context, Result};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info};

use crate::types::NUM_APPROACHES;

pub const BAUD_RATE: u32 = 9600;
/// Minimum interval between IR-triggered violations per approach.
pub const IR_COOLDOWN: Duration = Duration::from_secs(5);
/// Grace period after opening the port, letting the microcontroller
/// finish its own boot before `INIT`.
pub const INIT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub enum SerialEvent {
    Data { generation: u64, bytes: Vec<u8> },
    /// The reader hit EOF or a transport error.
    Closed { generation: u64, error: String },
}

// ============================================================================
// Framing and parsing (no I/O)
// ============================================================================

/// Accumulates raw bytes and yields complete LF-terminated lines.
/// Partial lines are held until the terminator arrives.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..pos]);
            lines.push(text.trim_end_matches('\r').to_string());
        }
        lines
    }
}

/// Parse a `SENSORS:b0,b1,b2,b3` line into the per-approach IR states.
pub fn parse_sensor_line(line: &str) -> Option<[bool; NUM_APPROACHES]> {
    let payload = line.strip_prefix("SENSORS:")?;
    let fields: Vec<&str> = payload.split(',').filter(|s| !s.is_empty()).collect();
    if fields.len() != NUM_APPROACHES {
        return None;
    }
    let mut states = [false; NUM_APPROACHES];
    for (i, field) in fields.iter().enumerate() {
        states[i] = field.trim() == "1";
    }
    Some(states)
}

/// Rising-edge detector with a per-approach cooldown, debouncing a single
/// vehicle crossing the sensor into one violation.
#[derive(Debug, Default)]
pub struct IrMonitor {
    previous: [bool; NUM_APPROACHES],
    cooldown_until: [Option<Instant>; NUM_APPROACHES],
}

impl IrMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one sensor bitmap. `eligible[i]` is whether a trigger on
    /// approach `i` would count right now (red light, detection enabled).
    /// Returns the approaches that fired; the cooldown starts only for
    /// those, so an ineligible edge neither fires nor arms a cooldown.
    pub fn update(
        &mut self,
        states: [bool; NUM_APPROACHES],
        eligible: [bool; NUM_APPROACHES],
        now: Instant,
    ) -> Vec<usize> {
        let mut triggered = Vec::new();
        for i in 0..NUM_APPROACHES {
            let rising = states[i] && !self.previous[i];
            let cooling = self.cooldown_until[i].map_or(false, |t| now < t);
            if rising && !cooling && eligible[i] {
                triggered.push(i);
                self.cooldown_until[i] = Some(now + IR_COOLDOWN);
            }
        }
        self.previous = states;
        triggered
    }
}

// ============================================================================
// Port handling
// ============================================================================

pub fn available_ports() -> Vec<String> {
    tokio_serial::available_ports()
        .map(|ports| ports.into_iter().map(|p| p.port_name).collect())
        .unwrap_or_default()
}

pub struct ArduinoLink {
    writer: Option<WriteHalf<SerialStream>>,
    reader: Option<JoinHandle<()>>,
    pub connected: bool,
    pub port_name: String,
    generation: u64,
}

impl ArduinoLink {
    pub fn new() -> Self {
        Self {
            writer: None,
            reader: None,
            connected: false,
            port_name: String::new(),
            generation: 0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Open `port_name`, wait out the boot grace period, send `INIT` and
    /// start forwarding inbound bytes to `events`.
    pub async fn connect(
        &mut self,
        port_name: &str,
        events: mpsc::UnboundedSender<SerialEvent>,
    ) -> Result<()> {
        self.close();

        let stream = tokio_serial::new(port_name, BAUD_RATE)
            .open_native_async()
            .with_context(|| format!("failed to open serial port {port_name}"))?;

        tokio::time::sleep(INIT_GRACE).await;

        let (mut read_half, write_half) = tokio::io::split(stream);
        self.generation += 1;
        let generation = self.generation;

        self.reader = Some(tokio::spawn(async move {
            let mut chunk = [0u8; 256];
            loop {
                match read_half.read(&mut chunk).await {
                    Ok(0) => {
                        let _ = events.send(SerialEvent::Closed {
                            generation,
                            error: "serial port closed".to_string(),
                        });
                        break;
                    }
                    Ok(n) => {
                        if events
                            .send(SerialEvent::Data {
                                generation,
                                bytes: chunk[..n].to_vec(),
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = events.send(SerialEvent::Closed {
                            generation,
                            error: e.to_string(),
                        });
                        break;
                    }
                }
            }
        }));

        self.writer = Some(write_half);
        self.connected = true;
        self.port_name = port_name.to_string();

        self.send_command("INIT").await?;
        info!("microcontroller link up on {port_name}");
        Ok(())
    }

    /// Write one LF-terminated command. Writes go out strictly in call
    /// order; the control loop is the only writer.
    pub async fn send_command(&mut self, command: &str) -> Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        debug!("serial tx: {command}");
        writer
            .write_all(format!("{command}\n").as_bytes())
            .await
            .context("serial write failed")?;
        Ok(())
    }

    /// Release the port. Safe to call when already closed.
    pub fn close(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.writer = None;
        self.connected = false;
        self.port_name.clear();
    }
}

impl Drop for ArduinoLink {
    fn drop(&mut self) {
        self.close();
    }
}
