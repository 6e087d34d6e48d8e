// src/controller.rs
//
// Four-approach round-robin phase state machine. Pure: inputs are ticks,
// processing results and operator settings; outputs are light commands
// and bookkeeping effects for the event loop to apply. No clocks, no I/O.
//
// Timing contract: the owner calls `tick_second` at 1 Hz; the countdown
// only runs while `countdown_active` (the equivalent of an armed timer).

use crate::config::GreenDurations;
use crate::density;
use crate::types::{TrafficDensity, TrafficLight, NUM_APPROACHES};
use tracing::debug;

/// Effects requested by a state transition, applied by the owner in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseOutput {
    /// The light for `approach` changed; forward to the wire and the
    /// event stream.
    Light {
        approach: usize,
        light: TrafficLight,
    },
    /// Forget recorded violators for `approach` (red phase boundary).
    ClearViolations { approach: usize },
    EnergySaving { active: bool },
}

#[derive(Debug)]
pub struct PhaseController {
    running: bool,
    current_index: usize,
    yellow_active: bool,
    time_remaining: u32,
    countdown_active: bool,
    countdown_restarted: bool,
    energy_saving_active: bool,
    energy_saving_enabled: bool,
    lights: [TrafficLight; NUM_APPROACHES],
    counts: [usize; NUM_APPROACHES],
    connected: [bool; NUM_APPROACHES],
    green_durations: GreenDurations,
    yellow_duration: u32,
}

impl PhaseController {
    pub fn new(green_durations: GreenDurations, yellow_duration: u32, energy_saving_enabled: bool) -> Self {
        Self {
            running: false,
            current_index: 0,
            yellow_active: false,
            time_remaining: 0,
            countdown_active: false,
            countdown_restarted: false,
            energy_saving_active: false,
            energy_saving_enabled,
            lights: [TrafficLight::Off; NUM_APPROACHES],
            counts: [0; NUM_APPROACHES],
            connected: [false; NUM_APPROACHES],
            green_durations,
            yellow_duration,
        }
    }

    // ------------------------------------------------------------------
    // Operator settings
    // ------------------------------------------------------------------

    pub fn set_light_timing(&mut self, density: TrafficDensity, seconds: u32) {
        self.green_durations.set(density, seconds);
    }

    pub fn set_yellow_duration(&mut self, seconds: u32) {
        self.yellow_duration = seconds;
    }

    /// Takes effect on the next processing result (the same evaluation
    /// point the energy-saving condition is checked at).
    pub fn set_energy_saving_enabled(&mut self, enabled: bool) {
        self.energy_saving_enabled = enabled;
    }

    pub fn set_camera_connected(&mut self, approach: usize, connected: bool) {
        self.connected[approach] = connected;
        if !connected {
            self.counts[approach] = 0;
        }
    }

    // ------------------------------------------------------------------
    // Inputs
    // ------------------------------------------------------------------

    pub fn start(&mut self) -> Vec<PhaseOutput> {
        if self.running {
            return Vec::new();
        }
        self.running = true;
        self.current_index = 0;
        self.yellow_active = false;
        self.time_remaining = 0;
        self.countdown_active = false;

        let mut out = Vec::new();
        if self.energy_saving_active {
            self.energy_saving_active = false;
            out.push(PhaseOutput::EnergySaving { active: false });
        }
        out.extend(self.process_cycle());
        out
    }

    pub fn stop(&mut self) -> Vec<PhaseOutput> {
        if !self.running {
            return Vec::new();
        }
        self.running = false;
        self.countdown_active = false;

        // Fail-safe: dark intersection only when the operator opted into
        // energy saving; otherwise all approaches hold red.
        let fallback = if self.energy_saving_enabled {
            TrafficLight::Off
        } else {
            TrafficLight::Red
        };
        let mut out = Vec::new();
        for i in 0..NUM_APPROACHES {
            out.extend(self.set_light(i, fallback));
        }
        out
    }

    /// 1 Hz countdown tick.
    pub fn tick_second(&mut self) -> Vec<PhaseOutput> {
        if !self.countdown_active {
            return Vec::new();
        }
        if !self.running || self.energy_saving_active {
            self.countdown_active = false;
            return Vec::new();
        }
        if self.time_remaining > 0 {
            self.time_remaining -= 1;
        }
        if self.time_remaining == 0 {
            self.countdown_active = false;
            return self.switch_to_next();
        }
        Vec::new()
    }

    /// A detection result arrived for `approach`: refresh its count and
    /// re-evaluate energy saving / sleep recovery.
    pub fn on_processing_result(&mut self, approach: usize, count: usize) -> Vec<PhaseOutput> {
        self.counts[approach] = count;
        if !self.running {
            return Vec::new();
        }

        let mut out = self.process_energy_saving();
        if self.energy_saving_active {
            return out;
        }
        if self.lights[self.current_index] == TrafficLight::Off
            && self.counts[self.current_index] > 0
        {
            out.extend(self.process_cycle());
        }
        out
    }

    // ------------------------------------------------------------------
    // State queries
    // ------------------------------------------------------------------

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn light(&self, approach: usize) -> TrafficLight {
        self.lights[approach]
    }

    pub fn lights(&self) -> [TrafficLight; NUM_APPROACHES] {
        self.lights
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn energy_saving_active(&self) -> bool {
        self.energy_saving_active
    }

    pub fn time_remaining(&self) -> u32 {
        self.time_remaining
    }

    pub fn vehicle_count(&self, approach: usize) -> usize {
        self.counts[approach]
    }

    /// True once after each countdown (re)arm, letting the owner restart
    /// its 1 Hz decrementer so the first second is a full one.
    pub fn take_countdown_restart(&mut self) -> bool {
        std::mem::take(&mut self.countdown_restarted)
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    /// Begin (or resume) a green phase at `current_index`.
    fn process_cycle(&mut self) -> Vec<PhaseOutput> {
        if !self.running || self.energy_saving_active || self.yellow_active || self.countdown_active
        {
            return Vec::new();
        }

        let mut out = Vec::new();
        for i in 0..NUM_APPROACHES {
            let light = if i == self.current_index {
                TrafficLight::Green
            } else {
                TrafficLight::Red
            };
            out.extend(self.set_light(i, light));
        }

        let bucket = density::classify(self.counts[self.current_index]);
        self.time_remaining = self.green_durations.get(bucket);
        self.countdown_active = true;
        self.countdown_restarted = true;
        debug!(
            "approach {} green for {}s ({bucket})",
            self.current_index, self.time_remaining
        );
        out
    }

    /// Green expired: interpose yellow. Yellow expired: go red, rotate.
    fn switch_to_next(&mut self) -> Vec<PhaseOutput> {
        if self.energy_saving_active {
            return Vec::new();
        }

        let mut out = Vec::new();
        if !self.yellow_active {
            out.extend(self.set_light(self.current_index, TrafficLight::Yellow));
            self.yellow_active = true;
            self.time_remaining = self.yellow_duration;
            self.countdown_active = true;
            self.countdown_restarted = true;
        } else {
            self.yellow_active = false;
            out.extend(self.set_light(self.current_index, TrafficLight::Red));
            out.push(PhaseOutput::ClearViolations {
                approach: self.current_index,
            });
            self.current_index = (self.current_index + 1) % NUM_APPROACHES;
            out.push(PhaseOutput::ClearViolations {
                approach: self.current_index,
            });
            out.extend(self.process_cycle());
        }
        out
    }

    /// A no-op when the light already shows the requested state, so a
    /// cycle restarting at the same approach cannot emit GREEN → GREEN.
    fn set_light(&mut self, approach: usize, light: TrafficLight) -> Option<PhaseOutput> {
        if self.lights[approach] == light {
            return None;
        }
        self.lights[approach] = light;
        Some(PhaseOutput::Light { approach, light })
    }

    fn process_energy_saving(&mut self) -> Vec<PhaseOutput> {
        if !self.energy_saving_enabled {
            if self.energy_saving_active {
                self.energy_saving_active = false;
                let mut out = vec![PhaseOutput::EnergySaving { active: false }];
                out.extend(self.process_cycle());
                return out;
            }
            return Vec::new();
        }

        let all_empty = (0..NUM_APPROACHES).all(|i| !self.connected[i] || self.counts[i] == 0);

        if all_empty && !self.energy_saving_active {
            self.energy_saving_active = true;
            self.countdown_active = false;
            let mut out = Vec::new();
            for i in 0..NUM_APPROACHES {
                out.extend(self.set_light(i, TrafficLight::Off));
            }
            out.push(PhaseOutput::EnergySaving { active: true });
            out
        } else if !all_empty && self.energy_saving_active {
            self.energy_saving_active = false;
            let mut out = vec![PhaseOutput::EnergySaving { active: false }];
            out.extend(self.process_cycle());
            out
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> PhaseController {
        PhaseController::new(GreenDurations::default(), 3, true)
    }

    fn lights_of(outputs: &[PhaseOutput]) -> Vec<(usize, TrafficLight)> {
        outputs
            .iter()
            .filter_map(|o| match o {
                PhaseOutput::Light { approach, light } => Some((*approach, *light)),
                _ => None,
            })
            .collect()
    }

    fn assert_single_green(ctl: &PhaseController) {
        let greens = ctl
            .lights()
            .iter()
            .filter(|l| **l == TrafficLight::Green)
            .count();
        assert!(greens <= 1, "at most one approach may be green: {:?}", ctl.lights());
    }

    #[test]
    fn start_serves_approach_zero_first() {
        let mut ctl = controller();
        let out = ctl.start();
        let lights = lights_of(&out);
        assert!(lights.contains(&(0, TrafficLight::Green)));
        assert!(lights.contains(&(1, TrafficLight::Red)));
        assert!(lights.contains(&(2, TrafficLight::Red)));
        assert!(lights.contains(&(3, TrafficLight::Red)));
        assert_single_green(&ctl);
    }

    #[test]
    fn adaptive_green_length_follows_density() {
        // Approach 0 holds 8 vehicles (HIGH -> 18s); the rest are empty.
        let mut ctl = controller();
        ctl.set_camera_connected(0, true);
        ctl.on_processing_result(0, 8);
        ctl.start();
        assert_eq!(ctl.time_remaining(), 18);

        // 17 ticks leave the phase green; the 18th turns it yellow.
        for _ in 0..17 {
            let out = ctl.tick_second();
            assert!(lights_of(&out).is_empty());
            assert_single_green(&ctl);
        }
        let out = ctl.tick_second();
        assert_eq!(lights_of(&out), vec![(0, TrafficLight::Yellow)]);
        assert_eq!(ctl.time_remaining(), 3);

        // Yellow runs its fixed 3 seconds, then approach 1 gets the
        // OFF-bucket minimum of 5 seconds.
        ctl.tick_second();
        ctl.tick_second();
        let out = ctl.tick_second();
        let lights = lights_of(&out);
        assert!(lights.contains(&(0, TrafficLight::Red)));
        assert!(lights.contains(&(1, TrafficLight::Green)));
        assert_eq!(ctl.current_index(), 1);
        assert_eq!(ctl.time_remaining(), 5);
        assert_single_green(&ctl);
    }

    #[test]
    fn green_always_exits_through_yellow_then_red() {
        let mut ctl = controller();
        ctl.set_camera_connected(0, true);
        ctl.on_processing_result(0, 1);
        ctl.start();

        let mut prev = ctl.lights();
        for _ in 0..120 {
            for (approach, light) in lights_of(&ctl.tick_second()) {
                if prev[approach] == TrafficLight::Green {
                    assert_eq!(light, TrafficLight::Yellow, "green must yield to yellow");
                }
                if prev[approach] == TrafficLight::Yellow {
                    assert_eq!(light, TrafficLight::Red, "yellow must yield to red");
                }
                assert_ne!(prev[approach], light, "no self-transitions");
                prev[approach] = light;
            }
            assert_single_green(&ctl);
        }
    }

    #[test]
    fn violated_ids_cleared_on_both_sides_of_rotation() {
        let mut ctl = controller();
        ctl.set_camera_connected(0, true);
        ctl.on_processing_result(0, 1);
        ctl.start();

        // Count 1 is the OFF bucket: 5s of green, then 3s of yellow.
        let mut clears = Vec::new();
        for _ in 0..(5 + 3) {
            for o in ctl.tick_second() {
                if let PhaseOutput::ClearViolations { approach } = o {
                    clears.push(approach);
                }
            }
        }
        // Outgoing approach 0 and incoming approach 1.
        assert_eq!(clears, vec![0, 1]);
    }

    #[test]
    fn energy_saving_entry_and_exit() {
        let mut ctl = controller();
        for i in 0..NUM_APPROACHES {
            ctl.set_camera_connected(i, true);
        }
        ctl.start();

        let out = ctl.on_processing_result(0, 0);
        assert!(out.contains(&PhaseOutput::EnergySaving { active: true }));
        assert_eq!(ctl.lights(), [TrafficLight::Off; 4]);
        assert!(ctl.energy_saving_active());

        // One non-empty approach wakes the cycle at the current index.
        let out = ctl.on_processing_result(2, 4);
        assert!(out.contains(&PhaseOutput::EnergySaving { active: false }));
        assert!(!ctl.energy_saving_active());
        assert_eq!(ctl.light(ctl.current_index()), TrafficLight::Green);
        assert_single_green(&ctl);
    }

    #[test]
    fn energy_saving_ignores_disconnected_approaches() {
        let mut ctl = controller();
        ctl.set_camera_connected(0, true);
        ctl.start();
        // Approaches 1..3 are disconnected; only 0 matters.
        let out = ctl.on_processing_result(0, 0);
        assert!(out.contains(&PhaseOutput::EnergySaving { active: true }));
    }

    #[test]
    fn disabling_energy_saving_resumes_cycle() {
        let mut ctl = controller();
        ctl.set_camera_connected(0, true);
        ctl.start();
        ctl.on_processing_result(0, 0);
        assert!(ctl.energy_saving_active());

        ctl.set_energy_saving_enabled(false);
        let out = ctl.on_processing_result(0, 0);
        assert!(out.contains(&PhaseOutput::EnergySaving { active: false }));
        assert_eq!(ctl.light(ctl.current_index()), TrafficLight::Green);
    }

    #[test]
    fn stop_holds_all_red_when_energy_saving_disabled() {
        let mut ctl = PhaseController::new(GreenDurations::default(), 3, false);
        ctl.start();
        ctl.stop();
        assert_eq!(ctl.lights(), [TrafficLight::Red; 4]);
        assert!(!ctl.is_running());
    }

    #[test]
    fn stop_darkens_intersection_when_energy_saving_enabled() {
        let mut ctl = controller();
        ctl.start();
        ctl.stop();
        assert_eq!(ctl.lights(), [TrafficLight::Off; 4]);
    }

    #[test]
    fn ticks_are_inert_while_stopped() {
        let mut ctl = controller();
        assert!(ctl.tick_second().is_empty());
        ctl.start();
        ctl.stop();
        assert!(ctl.tick_second().is_empty());
    }

    #[test]
    fn repeated_configuration_is_idempotent() {
        let mut once = controller();
        let mut twice = controller();
        once.set_yellow_duration(4);
        twice.set_yellow_duration(4);
        twice.set_yellow_duration(4);
        once.set_light_timing(TrafficDensity::High, 20);
        twice.set_light_timing(TrafficDensity::High, 20);
        twice.set_light_timing(TrafficDensity::High, 20);

        for ctl in [&mut once, &mut twice] {
            ctl.set_camera_connected(0, true);
            ctl.on_processing_result(0, 8);
        }
        let a = once.start();
        let b = twice.start();
        assert_eq!(a, b);
        assert_eq!(once.time_remaining(), twice.time_remaining());

        for _ in 0..40 {
            assert_eq!(once.tick_second(), twice.tick_second());
        }
    }

    #[test]
    fn restart_does_not_reemit_green_for_green() {
        let mut ctl = controller();
        ctl.set_camera_connected(0, true);
        ctl.on_processing_result(0, 5);
        ctl.start();
        assert_eq!(ctl.light(0), TrafficLight::Green);

        // A wake-from-sleep style restart at the same approach must not
        // produce a GREEN -> GREEN transition.
        let out = ctl.on_processing_result(0, 6);
        assert!(!lights_of(&out).contains(&(0, TrafficLight::Green)));
    }
}
