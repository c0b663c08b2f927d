//! Tactile button semantics for virtual outputs.
//!
//! The gateway handles its native fixtures beautifully: taps jump
//! brightness a discrete step, holding fades smoothly, double-taps jump
//! to full or off. For "dummy" fixtures and daemon-local virtual outputs
//! it does none of that; it just reports a final value on release. This
//! module replicates the native behavior for the outputs the daemon
//! drives, and classifies taps (count, long-press) for external
//! listeners.
//!
//! All of it keys off the per-keypad [`DimState`](crate::schema::DimState)
//! scratchpad and the monotonic millisecond clock.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, warn};

use crate::controller::{
    Controller, Sched, DIM_LEVELS, DIM_RATE, DOUBLE_TAP_MS, LONG_DOUBLE_TAP_MS, LONG_PICO_MS,
};
use crate::schema::{ButtonKind, DeviceKind};

/// Tick interval of the smooth-dim ramp.
const DIM_TICK: Duration = Duration::from_millis(50);
/// Taps further apart than this start a new tap streak.
const TAP_STREAK_MS: u64 = 5000;
/// Floor for the release-based classification delay.
const MIN_DECISION_MS: u64 = 300;

impl Controller {
    /// A button press or release arrived for `(kp, bt)`.
    pub(crate) fn button_event(&mut self, sched: &mut Sched, kp: i32, bt: i32, released: bool) {
        let now = self.now_ms();
        let Some((kind, assignments)) = self
            .devices
            .get(&kp)
            .and_then(|d| d.components.get(&bt))
            .map(|c| (c.kind, c.assignments.clone()))
        else {
            return;
        };

        // Listeners get an immediate press notification; the classified
        // event follows once the tap pattern is decided.
        if !released {
            for listener in self.button_listeners.get(&(kp, bt)).cloned().unwrap_or_default() {
                listener(self, sched, kp, bt, false, false, 0);
            }
        }

        let mut first_release = false;
        if released && kind.is_actionable() {
            // Some keypads report press/release pairs, others only
            // presses; which one this is can only be learned by seeing a
            // release.
            let dim = &mut self.devices.get_mut(&kp).expect("device exists").dim;
            first_release = !dim.supports_release;
            dim.supports_release = true;
        }

        if kind.is_actionable() {
            self.classify_taps(sched, kp, bt, released, now);
        }

        match kind {
            ButtonKind::Toggle | ButtonKind::AdvancedToggle => {
                if self.should_actuate(kp, released, first_release) {
                    self.toggle_assignments(sched, kp, &assignments);
                }
            }
            ButtonKind::SingleAction => {
                if self.should_actuate(kp, released, first_release) {
                    // Scene buttons set every virtual assignment to its
                    // programmed level; native ones the gateway handles.
                    for a in assignments.iter().filter(|a| a.output < 0) {
                        self.set_virtual_or_native(sched, a.output, a.level, true, false, false);
                    }
                }
            }
            ButtonKind::Lower | ButtonKind::Raise => {
                if released {
                    self.dimmer_released(sched, kp, now);
                } else {
                    self.dimmer_pressed(sched, kp, kind, now);
                }
            }
            ButtonKind::Unknown => {
                debug!("unsupported button {kp}/{bt}");
            }
        }
    }

    /// Toggle and scene buttons act once per physical activation: on
    /// release for keypads that emit releases, on press for those that
    /// do not. The release that first reveals release support does not
    /// re-fire (its press already did).
    fn should_actuate(&self, kp: i32, released: bool, first_release: bool) -> bool {
        let supports = self
            .devices
            .get(&kp)
            .map(|d| d.dim.supports_release)
            .unwrap_or(false);
        if released {
            supports && !first_release
        } else {
            !supports
        }
    }

    /// Toggle: on iff any assigned output currently has a level; then
    /// drive every virtual assignment to the opposite state. Relay
    /// assignments (level -1) have no state and pulse on every
    /// activation.
    fn toggle_assignments(
        &mut self,
        sched: &mut Sched,
        kp: i32,
        assignments: &[crate::schema::Assignment],
    ) {
        let mut on = false;
        for a in assignments {
            if a.level == -1 {
                continue;
            }
            on |= self.get_current_level(a.output) > 0;
        }
        for a in assignments.iter().filter(|a| a.output < 0) {
            let level = if a.level == -1 {
                -1
            } else if on {
                0
            } else {
                a.level
            };
            self.set_virtual_or_native(sched, a.output, level, true, false, false);
        }
        let dim = &mut self.devices.get_mut(&kp).expect("device exists").dim;
        dim.on = !on;
    }

    /// Track the tap pattern and schedule the decision timer that fires
    /// the classified listener callback.
    fn classify_taps(&mut self, sched: &mut Sched, kp: i32, bt: i32, released: bool, now: u64) {
        let kind = self.device_kind(kp);
        let dim = &mut self.devices.get_mut(&kp).expect("device exists").dim;

        if dim.dim_direction != 0 || dim.last_button != bt || dim.first_tap == 0 {
            dim.last_button = bt;
            dim.dim_direction = 0;
            dim.start_of_dim = now;
            dim.first_tap = now;
            dim.num_taps = 1;
            dim.on = false;
        } else {
            if !released {
                dim.num_taps += 1;
            }
            dim.start_of_dim = now;
        }
        dim.released = if released { now } else { 0 };

        let delay = if released {
            // A release pins down the press length; wait roughly one and
            // a half times what the user has taken so far, bounded per
            // keypad family.
            let cap = if kind == DeviceKind::PicoKeypad {
                DOUBLE_TAP_MS
            } else {
                LONG_DOUBLE_TAP_MS
            };
            (now.saturating_sub(dim.first_tap) * 3 / 2)
                .min(cap)
                .max(MIN_DECISION_MS)
        } else if kind == DeviceKind::PicoKeypad {
            LONG_PICO_MS
        } else {
            LONG_DOUBLE_TAP_MS
        };

        let snapshot = (dim.first_tap, dim.num_taps, dim.released);
        sched.add_timeout(Duration::from_millis(delay), move |c, s| {
            let Some(dim) = c.devices.get_mut(&kp).map(|d| &mut d.dim) else {
                return;
            };
            if (dim.first_tap, dim.num_taps, dim.released) != snapshot {
                // More taps arrived; a later decision timer owns this.
                return;
            }
            let (_, num_taps, released_at) = snapshot;
            let is_long = dim.supports_release && released_at == 0;
            dim.num_taps = 0;
            dim.first_tap = 0;
            let on = dim.on;
            for listener in c.button_listeners.get(&(kp, bt)).cloned().unwrap_or_default() {
                listener(c, s, kp, bt, on, is_long, num_taps);
            }
        });
    }

    /// Raise/Lower pressed: snapshot the starting level of every
    /// daemon-dimmed assignment of the keypad's last-used button and
    /// start the smooth ramp.
    fn dimmer_pressed(&mut self, _sched: &mut Sched, kp: i32, kind: ButtonKind, now: u64) {
        let Some(assignments) = self.last_button_assignments(kp) else {
            warn!("no last button known for keypad {kp}");
            return;
        };

        let mut snapshots: BTreeMap<i32, i32> = BTreeMap::new();
        let mut suppress = Vec::new();
        for a in &assignments {
            if a.level == 0 {
                continue;
            }
            if a.output < 0 {
                if let Some(named) = self.named_outputs.get((-a.output - 1) as usize) {
                    snapshots.insert(a.output, named.level);
                }
            } else if let Some(out) = self.outputs.get(&a.output) {
                if out.is_inline_dummy() {
                    // A gateway dummy fronting a daemon-driven load: we
                    // dim it, so the gateway's reports must be ignored.
                    snapshots.insert(a.output, out.level);
                    suppress.push(a.output);
                }
            }
        }

        {
            let dim = &mut self.devices.get_mut(&kp).expect("device exists").dim;
            let direction = if kind == ButtonKind::Lower { -1 } else { 1 };
            if dim.dim_direction != direction {
                dim.dim_direction = direction;
                dim.start_of_dim = 0;
                dim.first_tap = 0;
                dim.num_taps = 0;
            }

            // Keep counting a rapid tap streak; an isolated press starts
            // over.
            if dim.start_of_dim != 0 && now.saturating_sub(dim.start_of_dim) <= TAP_STREAK_MS {
                dim.num_taps += 1;
            } else {
                dim.num_taps = 1;
            }
            dim.start_of_dim = now;
            if dim.num_taps == 1 {
                dim.first_tap = now;
            }
            dim.starting_levels = snapshots;
        }
        for id in suppress {
            self.suppress_dimmer(id, true);
        }

        let has_work = !self
            .devices
            .get(&kp)
            .expect("device exists")
            .dim
            .starting_levels
            .is_empty();
        if has_work {
            // Start ticking once the gateway has acknowledged anything
            // queued ahead of us; the barrier keeps ramp start aligned
            // with the gateway's own reaction to the press.
            self.command(
                "",
                Some(Box::new(move |c: &mut Controller, s: &mut Sched, _| {
                    c.dim_smooth(s, kp)
                })),
                None,
            );
        }
    }

    /// One 50 ms ramp step: walk every snapshot toward the direction of
    /// travel at DIM_RATE, pushing levels to the sinks only; entries
    /// that saturate drop out, and ticking stops when none remain.
    pub(crate) fn dim_smooth(&mut self, sched: &mut Sched, kp: i32) {
        let (direction, start_of_dim, entries) = {
            let Some(dev) = self.devices.get(&kp) else {
                return;
            };
            if dev.dim.starting_levels.is_empty() {
                return;
            }
            (
                dev.dim.dim_direction,
                dev.dim.start_of_dim,
                dev.dim.starting_levels.clone(),
            )
        };
        let delta =
            (self.now_ms().saturating_sub(start_of_dim) as i64) * DIM_RATE / 10 * direction as i64;
        for (id, start) in entries {
            let level = (i64::from(start) + delta).clamp(0, 10_000) as i32;
            self.set_virtual_or_native(sched, id, level, false, true, true);
            if level == 0 || level == 10_000 {
                self.devices
                    .get_mut(&kp)
                    .expect("device exists")
                    .dim
                    .starting_levels
                    .remove(&id);
            }
        }
        sched.add_timeout(DIM_TICK, move |c, s| c.dim_smooth(s, kp));
    }

    /// Raise/Lower released: snap each daemon-dimmed fixture to the next
    /// discrete step (never undoing ramp progress), or handle the
    /// double-tap jump to full/off.
    fn dimmer_released(&mut self, sched: &mut Sched, kp: i32, now: u64) {
        let Some(assignments) = self.last_button_assignments(kp) else {
            warn!("no last button known for keypad {kp}");
            return;
        };

        let (direction, num_taps, first_tap, start_of_dim) = {
            let dim = &self.devices.get(&kp).expect("device exists").dim;
            (dim.dim_direction, dim.num_taps, dim.first_tap, dim.start_of_dim)
        };

        let mut targets: BTreeMap<i32, i32> = BTreeMap::new();
        for a in &assignments {
            let level = if a.output < 0 {
                if a.level == -1 {
                    // A relay; there is nothing to dim.
                    continue;
                }
                match self.named_outputs.get((-a.output - 1) as usize) {
                    Some(named) => named.level,
                    None => continue,
                }
            } else {
                match self.outputs.get(&a.output) {
                    // Only inline-configured dummies are ours to finish;
                    // native fixtures the gateway lands by itself.
                    Some(out) if out.is_inline_dummy() => out.level,
                    _ => continue,
                }
            };

            // A missing snapshot means the ramp already saturated; the
            // current level is final. Otherwise snap one discrete step
            // from the starting level, but never undo ramp progress.
            let mut level = i64::from(level);
            let snapshot = self
                .devices
                .get(&kp)
                .expect("device exists")
                .dim
                .starting_levels
                .get(&a.output)
                .copied();
            if let Some(start) = snapshot {
                let bucket = (DIM_LEVELS * i64::from(start) + 5000) / 10_000;
                if direction < 0 {
                    level = level.min((bucket - 1) * 10_000 / DIM_LEVELS);
                } else if direction > 0 {
                    level = level.max((bucket + 1) * 10_000 / DIM_LEVELS);
                }
            }
            targets.insert(a.output, level.clamp(0, 10_000) as i32);
        }

        if direction != 0 && num_taps == 2 && now.saturating_sub(first_tap) < DOUBLE_TAP_MS {
            // Probably a double-tap, but a third tap may still be
            // coming (users stepping through discrete levels). Apply the
            // snapped values locally only, and decide after roughly one
            // inter-tap interval.
            let jumped_level = if direction > 0 { 10_000 } else { 0 };
            let decision_ms = start_of_dim.saturating_sub(first_tap);
            for (&id, &level) in &targets {
                self.set_virtual_or_native(sched, id, level, true, true, true);
            }
            sched.add_timeout(Duration::from_millis(decision_ms), move |c, s| {
                let taps_now = match c.devices.get(&kp) {
                    Some(dev) => dev.dim.num_taps,
                    None => return,
                };
                if taps_now != 2 {
                    // Part of a longer streak; a later tap already sent
                    // a fresher level.
                    return;
                }
                {
                    let dim = &mut c.devices.get_mut(&kp).expect("device exists").dim;
                    dim.num_taps = 0;
                    dim.first_tap = 0;
                }
                let Some(assignments) = c.last_button_assignments(kp) else {
                    return;
                };
                for a in &assignments {
                    c.set_virtual_or_native(s, a.output, jumped_level, true, true, false);
                }
            });
        } else {
            for (&id, &level) in &targets {
                self.set_virtual_or_native(sched, id, level, true, true, false);
            }
        }

        let dim = &mut self.devices.get_mut(&kp).expect("device exists").dim;
        dim.start_of_dim = now;
        dim.starting_levels.clear();
    }

    fn last_button_assignments(&self, kp: i32) -> Option<Vec<crate::schema::Assignment>> {
        let dev = self.devices.get(&kp)?;
        dev.components
            .get(&dev.dim.last_button)
            .map(|c| c.assignments.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::controller::Controller;
    use crate::schema::DeviceKind;
    use crate::testkit::*;

    type Levels = Rc<RefCell<Vec<i32>>>;

    /// Keypad 11 with a virtual assignment on toggle button 2 and a
    /// sink capturing every level pushed to the actuator.
    fn with_virtual_fixture(c: &mut Controller, percent: i32) -> (i32, Levels) {
        c.devices = seetouch_keypad();
        c.outputs = native_outputs();
        let levels: Levels = Rc::default();
        let captured = levels.clone();
        let id = c.add_output(
            "porch",
            Rc::new(move |_, _, level, _| captured.borrow_mut().push(level)),
        );
        c.add_to_button(11, 2, id, percent, false);
        (id, levels)
    }

    fn arm_dimmer(c: &mut Controller, id: i32, level: i32) {
        c.devices.get_mut(&11).unwrap().dim.last_button = 2;
        c.named_outputs[(-id - 1) as usize].level = level;
    }

    #[tokio::test(start_paused = true)]
    async fn raise_hold_keeps_ramped_value_past_the_snap() {
        let (mut reactor, inj, link, mut c) = harness();
        let (id, levels) = with_virtual_fixture(&mut c, 40);
        arm_dimmer(&mut c, id, 4000);

        // Press RAISE at t=0, release at t=400ms. At 25%/s the ramp
        // reaches 4000 + 400*25/10 = 5000; the one-bucket snap from
        // 4000 would only reach ((15*4000+5000)/10000 + 1)*10000/15 =
        // 4666, so the ramped value wins.
        line_at(&inj, 0, "~DEVICE,11,18,3");
        line_at(&inj, 401, "~DEVICE,11,18,4");
        exit_at(&inj, 2000);
        reactor.run(&mut c).await;

        let levels = levels.borrow();
        assert_eq!(*levels.last().unwrap(), 5000);
        assert!(!levels.contains(&4666));
        assert_eq!(c.get_current_level(id), 5000);
        // A virtual-only assignment never commands the gateway.
        assert_eq!(link.count_matching("#OUTPUT"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn short_tap_snaps_one_bucket() {
        let (mut reactor, inj, _link, mut c) = harness();
        let (id, levels) = with_virtual_fixture(&mut c, 40);
        arm_dimmer(&mut c, id, 4000);

        // A 40 ms tap barely moves the ramp; the release snaps a full
        // step up.
        line_at(&inj, 0, "~DEVICE,11,18,3");
        line_at(&inj, 40, "~DEVICE,11,18,4");
        exit_at(&inj, 2000);
        reactor.run(&mut c).await;

        assert_eq!(*levels.borrow().last().unwrap(), 4666);
        assert_eq!(c.get_current_level(id), 4666);
    }

    #[tokio::test(start_paused = true)]
    async fn lower_tap_snaps_one_bucket_down() {
        let (mut reactor, inj, _link, mut c) = harness();
        let (id, levels) = with_virtual_fixture(&mut c, 40);
        arm_dimmer(&mut c, id, 4000);

        line_at(&inj, 0, "~DEVICE,11,19,3");
        line_at(&inj, 40, "~DEVICE,11,19,4");
        exit_at(&inj, 2000);
        reactor.run(&mut c).await;

        // ((15*4000+5000)/10000 - 1)*10000/15 = 3333.
        assert_eq!(*levels.borrow().last().unwrap(), 3333);
    }

    #[tokio::test(start_paused = true)]
    async fn ramp_saturates_and_stops() {
        let (mut reactor, inj, _link, mut c) = harness();
        let (id, levels) = with_virtual_fixture(&mut c, 40);
        arm_dimmer(&mut c, id, 9000);

        // Holding RAISE for 600 ms ramps past 10000; the entry
        // saturates, drops out, and the release keeps the ceiling.
        line_at(&inj, 0, "~DEVICE,11,18,3");
        line_at(&inj, 601, "~DEVICE,11,18,4");
        exit_at(&inj, 2000);
        reactor.run(&mut c).await;

        let levels = levels.borrow();
        assert_eq!(*levels.last().unwrap(), 10_000);
        assert!(levels.iter().all(|&l| l <= 10_000));
        assert_eq!(c.get_current_level(id), 10_000);
    }

    #[tokio::test(start_paused = true)]
    async fn double_tap_lower_jumps_to_off_exactly_once() {
        let (mut reactor, inj, link, mut c) = harness();
        let (id, levels) = with_virtual_fixture(&mut c, 40);
        arm_dimmer(&mut c, id, 4000);

        // Tap, tap: release at 101 ms, press again at 300 ms, release
        // at 401 ms, no third tap.
        line_at(&inj, 0, "~DEVICE,11,19,3");
        line_at(&inj, 101, "~DEVICE,11,19,4");
        line_at(&inj, 300, "~DEVICE,11,19,3");
        line_at(&inj, 401, "~DEVICE,11,19,4");
        exit_at(&inj, 3000);
        reactor.run(&mut c).await;

        let levels = levels.borrow();
        assert_eq!(*levels.last().unwrap(), 0);
        assert_eq!(levels.iter().filter(|&&l| l == 0).count(), 1);
        assert_eq!(c.get_current_level(id), 0);
        // The provisional value between the taps went to the sink only.
        assert_eq!(link.count_matching("#OUTPUT"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn triple_tap_steps_without_jumping() {
        let (mut reactor, inj, _link, mut c) = harness();
        let (id, levels) = with_virtual_fixture(&mut c, 40);
        arm_dimmer(&mut c, id, 4000);

        for (t, action) in [
            (0u64, 3),
            (101, 4),
            (250, 3),
            (351, 4),
            (500, 3),
            (601, 4),
        ] {
            let line: &'static str = match action {
                3 => "~DEVICE,11,19,3",
                _ => "~DEVICE,11,19,4",
            };
            line_at(&inj, t, line);
        }
        exit_at(&inj, 3000);
        reactor.run(&mut c).await;

        // Three taps stepped down discrete buckets; nothing jumped to 0.
        assert!(!levels.borrow().contains(&0));
        assert!(c.get_current_level(id) > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn toggle_drives_virtual_outputs_both_ways() {
        let (mut reactor, inj, _link, mut c) = harness();
        let (_id, levels) = with_virtual_fixture(&mut c, 50);

        // Press-only keypad: actuation happens on press.
        line_at(&inj, 0, "~DEVICE,11,2,3");
        line_at(&inj, 6000, "~DEVICE,11,2,3");
        exit_at(&inj, 10_000);
        reactor.run(&mut c).await;

        assert_eq!(*levels.borrow(), vec![5000, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn toggle_with_release_acts_once_per_activation() {
        let (mut reactor, inj, _link, mut c) = harness();
        let (_id, levels) = with_virtual_fixture(&mut c, 50);

        // First press+release pair: the press actuates (release support
        // is unknown), the release that proves support must not
        // re-actuate. Later pairs actuate on release.
        line_at(&inj, 0, "~DEVICE,11,2,3");
        line_at(&inj, 200, "~DEVICE,11,2,4");
        line_at(&inj, 6000, "~DEVICE,11,2,3");
        line_at(&inj, 6200, "~DEVICE,11,2,4");
        exit_at(&inj, 10_000);
        reactor.run(&mut c).await;

        assert_eq!(*levels.borrow(), vec![5000, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn relay_assignment_pulses_every_activation() {
        let (mut reactor, inj, _link, mut c) = harness();
        c.devices = seetouch_keypad();
        c.outputs = native_outputs();
        let pulses: Levels = Rc::default();
        let captured = pulses.clone();
        let id = c.add_output(
            "door",
            Rc::new(move |_, _, level, _| captured.borrow_mut().push(level)),
        );
        c.add_to_button(11, 2, id, -1, false);

        line_at(&inj, 0, "~DEVICE,11,2,3");
        line_at(&inj, 6000, "~DEVICE,11,2,3");
        exit_at(&inj, 10_000);
        reactor.run(&mut c).await;

        assert_eq!(*pulses.borrow(), vec![-1, -1]);
    }

    #[tokio::test(start_paused = true)]
    async fn single_action_sets_programmed_levels() {
        let (mut reactor, inj, _link, mut c) = harness();
        c.devices = seetouch_keypad();
        c.outputs = native_outputs();
        c.devices
            .get_mut(&11)
            .unwrap()
            .components
            .get_mut(&2)
            .unwrap()
            .kind = crate::schema::ButtonKind::SingleAction;
        let levels: Levels = Rc::default();
        let captured = levels.clone();
        let id = c.add_output(
            "scene",
            Rc::new(move |_, _, level, _| captured.borrow_mut().push(level)),
        );
        c.add_to_button(11, 2, id, 60, false);

        line_at(&inj, 0, "~DEVICE,11,2,3");
        exit_at(&inj, 5000);
        reactor.run(&mut c).await;

        assert_eq!(*levels.borrow(), vec![6000]);
    }

    #[tokio::test(start_paused = true)]
    async fn dummy_dimmer_reports_are_suppressed_and_corrected() {
        let (mut reactor, inj, link, mut c) = harness();
        c.devices = seetouch_keypad();
        c.outputs = native_outputs();
        // Point button 2 at the inline-configured dummy output instead.
        {
            let comp = c.devices.get_mut(&11).unwrap().components.get_mut(&2).unwrap();
            comp.assignments.clear();
            comp.assignments.push(crate::schema::Assignment {
                output: 7,
                level: 4000,
            });
        }
        c.outputs.get_mut(&7).unwrap().level = 4000;
        c.devices.get_mut(&11).unwrap().dim.last_button = 2;

        line_at(&inj, 0, "~DEVICE,11,18,3");
        // Mid-ramp the gateway pushes its own idea; it must be ignored.
        line_at(&inj, 60, "~OUTPUT,7,1,10.00");
        line_at(&inj, 101, "~DEVICE,11,18,4");
        // Just after our final value lands, the gateway contradicts it;
        // the daemon re-sends its own level.
        line_at(&inj, 150, "~OUTPUT,7,1,90.00");
        // Once the release window expires the gateway is authoritative
        // again.
        line_at(&inj, 800, "~OUTPUT,7,1,90.00");
        exit_at(&inj, 2000);
        reactor.run(&mut c).await;

        // The mid-ramp report never landed.
        assert!(link
            .commands()
            .iter()
            .all(|cmd| !cmd.starts_with("#OUTPUT,7,1,10")));
        // The release snapped up one bucket from 4000 and the
        // contradiction was corrected with the same value.
        assert_eq!(link.count_matching("#OUTPUT,7,1,46.66"), 2);
        assert_eq!(c.outputs[&7].level, 9000);
    }

    #[tokio::test(start_paused = true)]
    async fn press_listener_fires_immediately_then_classified() {
        let (mut reactor, inj, _link, mut c) = harness();
        c.devices = seetouch_keypad();
        c.outputs = native_outputs();
        let events: Rc<RefCell<Vec<(bool, bool, u32)>>> = Rc::default();
        let captured = events.clone();
        c.add_button_listener(
            11,
            2,
            Rc::new(move |_, _, _kp, _bt, on, is_long, taps| {
                captured.borrow_mut().push((on, is_long, taps));
            }),
        );

        line_at(&inj, 0, "~DEVICE,11,2,3");
        line_at(&inj, 150, "~DEVICE,11,2,4");
        exit_at(&inj, 10_000);
        reactor.run(&mut c).await;

        let events = events.borrow();
        // Immediate press notification, then the classified single tap.
        assert_eq!(events[0], (false, false, 0));
        assert!(events.iter().any(|&(_, is_long, taps)| taps == 1 && !is_long));
    }

    #[tokio::test(start_paused = true)]
    async fn double_tap_classifies_as_two_taps() {
        let (mut reactor, inj, _link, mut c) = harness();
        c.devices = seetouch_keypad();
        c.outputs = native_outputs();
        let events: Rc<RefCell<Vec<(bool, bool, u32)>>> = Rc::default();
        let captured = events.clone();
        c.add_button_listener(
            11,
            2,
            Rc::new(move |_, _, _, _, on, is_long, taps| {
                captured.borrow_mut().push((on, is_long, taps));
            }),
        );

        line_at(&inj, 0, "~DEVICE,11,2,3");
        line_at(&inj, 100, "~DEVICE,11,2,4");
        line_at(&inj, 300, "~DEVICE,11,2,3");
        line_at(&inj, 400, "~DEVICE,11,2,4");
        exit_at(&inj, 10_000);
        reactor.run(&mut c).await;

        let events = events.borrow();
        assert!(events.iter().any(|&(_, _, taps)| taps == 2));
        assert!(!events.iter().any(|&(_, _, taps)| taps == 1));
    }

    #[tokio::test(start_paused = true)]
    async fn held_button_classifies_as_long_press() {
        let (mut reactor, inj, _link, mut c) = harness();
        c.devices = seetouch_keypad();
        c.outputs = native_outputs();
        // The keypad is known to emit releases; a press with none
        // arriving is a hold.
        c.devices.get_mut(&11).unwrap().dim.supports_release = true;
        let events: Rc<RefCell<Vec<(bool, bool, u32)>>> = Rc::default();
        let captured = events.clone();
        c.add_button_listener(
            11,
            2,
            Rc::new(move |_, _, _, _, on, is_long, taps| {
                captured.borrow_mut().push((on, is_long, taps));
            }),
        );

        line_at(&inj, 0, "~DEVICE,11,2,3");
        line_at(&inj, 4000, "~DEVICE,11,2,4");
        exit_at(&inj, 10_000);
        reactor.run(&mut c).await;

        assert!(events.borrow().iter().any(|&(_, is_long, _)| is_long));
    }

    #[tokio::test(start_paused = true)]
    async fn pico_press_only_waits_the_pico_delay() {
        let (mut reactor, inj, _link, mut c) = harness();
        let mut devices = seetouch_keypad();
        devices.get_mut(&11).unwrap().kind = DeviceKind::PicoKeypad;
        c.devices = devices;
        c.outputs = native_outputs();
        let events: Rc<RefCell<Vec<u32>>> = Rc::default();
        let captured = events.clone();
        c.add_button_listener(
            11,
            2,
            Rc::new(move |_, _, _, _, _, _, taps| {
                if taps > 0 {
                    captured.borrow_mut().push(taps);
                }
            }),
        );

        line_at(&inj, 0, "~DEVICE,11,2,3");
        // Check just before and just after the Pico decision delay.
        let at_1400 = events.clone();
        inj.send(move |_, s| {
            s.add_timeout(std::time::Duration::from_millis(1400), move |_, _| {
                assert!(at_1400.borrow().is_empty());
            });
        });
        exit_at(&inj, 2000);
        reactor.run(&mut c).await;

        assert_eq!(*events.borrow(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn dimmer_press_without_last_button_is_ignored() {
        let (mut reactor, inj, _link, mut c) = harness();
        c.devices = seetouch_keypad();
        c.outputs = native_outputs();
        // No button was ever pressed on this keypad.
        line_at(&inj, 0, "~DEVICE,11,18,3");
        line_at(&inj, 100, "~DEVICE,11,18,4");
        exit_at(&inj, 1000);
        reactor.run(&mut c).await;
        // Nothing to assert beyond "did not panic and no state appeared".
        assert!(c.devices[&11].dim.starting_levels.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn led_logic_ignores_dimmer_buttons() {
        let (mut reactor, inj, link, mut c) = harness();
        let mut devices = seetouch_keypad();
        // Give the raise button an LED; its raise/lower logic keeps the
        // recompute pass away from it.
        devices
            .get_mut(&11)
            .unwrap()
            .components
            .get_mut(&18)
            .unwrap()
            .led = 84;
        c.devices = devices;
        c.outputs = native_outputs();

        line_at(&inj, 0, "~OUTPUT,5,1,75.00");
        exit_at(&inj, 1000);
        reactor.run(&mut c).await;

        assert_eq!(link.count_matching("#DEVICE,11,84"), 0);
    }
}
