//! The policy engine.
//!
//! Owns the schema mirror, drives link initialization and refresh,
//! interprets unsolicited updates, recomputes LEDs, emulates tactile
//! button behavior for virtual outputs (see [`crate::dimmer`]), and
//! exposes the extension API that the site adapter and the UI surface
//! program against.
//!
//! Everything here runs in reactor callbacks on the one daemon thread.
//! Failures never unwind across the reactor: they become state
//! transitions and error hooks.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use chrono::Timelike;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use lumenproto::line::{parse_update, Update};
use lumenproto::{action, cmd, monitor};

use crate::link::{CommandId, LinkClient, LinkEvent};
use crate::reactor::{Injector, Scheduler, TimerHandle};
use crate::schema::{
    extract, load_cache, same_schema, save_cache, Assignment, ButtonKind, DeviceKind, Devices,
    LedLogic, NamedOutput, Outputs,
};
use crate::snapshot;

/// Scheduler specialized to the controller context.
pub type Sched = Scheduler<Controller>;

pub type ResultHook = Box<dyn FnOnce(&mut Controller, &mut Sched, String)>;
pub type ErrorHook = Box<dyn FnOnce(&mut Controller, &mut Sched)>;
/// Virtual-output sink: `(level, fade)` plus controller access so sinks
/// can issue gateway commands.
pub type OutputSink = Rc<dyn Fn(&mut Controller, &mut Sched, i32, bool)>;
/// Button listener: `(keypad, button, on, is_long, taps)`.
pub type ButtonListener = Rc<dyn Fn(&mut Controller, &mut Sched, i32, i32, bool, bool, u32)>;
type MonitorSink = Rc<dyn Fn(&mut Controller, &mut Sched, i32)>;

/// Name prefix aliasing a gateway-native output taken over by the daemon.
pub const GW_ALIAS: &str = "GW:";
/// Name prefix aliasing a gateway "dummy" output that fronts a DMX load.
pub const DMX_ALIAS: &str = "DMX:";

// Health-check and emulation timing. The dimmer math in crate::dimmer
// depends on DIM_RATE/DIM_LEVELS exactly as written.
pub const SHORT_REOPEN_TMO: Duration = Duration::from_secs(5);
pub const LONG_REOPEN_TMO: Duration = Duration::from_secs(60);
pub const ALIVE_INTERVAL: Duration = Duration::from_secs(60);
pub const ALIVE_CMD_TMO: Duration = Duration::from_secs(5);
pub const UNCERTAIN_SWEEP: Duration = Duration::from_secs(15 * 60);
pub const DOUBLE_TAP_MS: u64 = 900;
pub const LONG_DOUBLE_TAP_MS: u64 = 2500;
pub const LONG_PICO_MS: u64 = 1500;
/// Discrete brightness steps a short tap snaps between.
pub const DIM_LEVELS: i64 = 15;
/// Percent per second while a dimmer button is held.
pub const DIM_RATE: i64 = 25;
const RECOMPUTE_DELAY: Duration = Duration::from_millis(200);
const LED_QUERY_DELAY: Duration = Duration::from_secs(2);
const RELEASE_WINDOW_MS: u64 = 200;
const DELTA_DEBOUNCE: Duration = Duration::from_millis(100);
/// Maximum clock drift tolerated before resetting the gateway clock.
const DRIFT_LIMIT_SECS: u32 = 3;

/// The link surface the controller programs against. Production uses
/// [`LinkClient`]; tests substitute a recorder.
pub trait LinkPort {
    fn submit(&self, cmd: String, id: CommandId);
    fn close(&self);
    fn init_done(&self);
    fn extend_init(&self);
    fn is_connected(&self) -> bool;
    fn command_pending(&self) -> bool;
    fn connected_addr(&self) -> Option<SocketAddr>;
}

impl LinkPort for LinkClient {
    fn submit(&self, cmd: String, id: CommandId) {
        LinkClient::submit(self, cmd, id)
    }
    fn close(&self) {
        LinkClient::close(self)
    }
    fn init_done(&self) {
        LinkClient::init_done(self)
    }
    fn extend_init(&self) {
        LinkClient::extend_init(self)
    }
    fn is_connected(&self) -> bool {
        LinkClient::is_connected(self)
    }
    fn command_pending(&self) -> bool {
        LinkClient::command_pending(self)
    }
    fn connected_addr(&self) -> Option<SocketAddr> {
        LinkClient::connected_addr(self)
    }
}

struct CommandHooks {
    on_result: Option<ResultHook>,
    on_error: Option<ErrorHook>,
}

/// What to do with the schema document once the background fetch lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchPlan {
    /// No fetch outstanding.
    Idle,
    /// A schema is already live; compare and flag a restart on change.
    Check,
    /// Cold start with no cache; install and continue initialization.
    Install,
}

pub struct Controller {
    pub(crate) link: Rc<dyn LinkPort>,
    injector: Injector<Controller>,

    pub(crate) devices: Devices,
    pub(crate) outputs: Outputs,
    pub(crate) named_outputs: Vec<NamedOutput<OutputSink>>,
    output_monitors: HashMap<i32, MonitorSink>,
    pub(crate) button_listeners: HashMap<(i32, i32), Vec<ButtonListener>>,

    /// Gateway-side dummy dimmers the daemon is currently driving;
    /// their `~OUTPUT` reports are ignored.
    pub(crate) suppressed: HashSet<i32>,
    /// After our own `#OUTPUT` completes, a short window during which a
    /// mismatching gateway-pushed level is corrected by re-sending ours.
    pub(crate) release_window: HashMap<i32, u64>,

    completions: HashMap<CommandId, CommandHooks>,
    next_command_id: CommandId,

    // Health-check state, all monotonic.
    reconnect: Duration,
    check_started: Option<u64>,
    check_finished: Option<u64>,
    uncertain_sweep: Option<u64>,

    cache_path: PathBuf,
    schema_port: u16,
    fetch_plan: FetchPlan,
    fetch_task: Option<tokio::task::JoinHandle<()>>,
    initialized: bool,
    schema_invalid_fired: bool,

    init_hooks: Vec<Box<dyn FnOnce(&mut Controller, &mut Sched)>>,
    on_input: Option<Box<dyn FnMut(&str, &str, bool)>>,
    on_heartbeat: Option<Box<dyn FnMut()>>,
    on_schema_invalid: Option<Box<dyn FnMut()>>,
    broadcast: Option<Box<dyn FnMut(&str)>>,

    deltas: Vec<snapshot::Delta>,
    delta_timer: Option<TimerHandle>,
    recompute: Option<TimerHandle>,

    epoch: Instant,
}

impl Controller {
    pub fn new(link: Rc<dyn LinkPort>, injector: Injector<Controller>, cache_path: PathBuf) -> Self {
        Self {
            link,
            injector,
            devices: Devices::new(),
            outputs: Outputs::new(),
            named_outputs: Vec::new(),
            output_monitors: HashMap::new(),
            button_listeners: HashMap::new(),
            suppressed: HashSet::new(),
            release_window: HashMap::new(),
            completions: HashMap::new(),
            next_command_id: 0,
            reconnect: SHORT_REOPEN_TMO,
            check_started: None,
            check_finished: None,
            uncertain_sweep: None,
            cache_path,
            schema_port: crate::fetch::SCHEMA_PORT,
            fetch_plan: FetchPlan::Idle,
            fetch_task: None,
            initialized: false,
            schema_invalid_fired: false,
            init_hooks: Vec::new(),
            on_input: None,
            on_heartbeat: None,
            on_schema_invalid: None,
            broadcast: None,
            deltas: Vec::new(),
            delta_timer: None,
            recompute: None,
            epoch: Instant::now(),
        }
    }

    /// Monotonic milliseconds since construction. Zero is reserved as
    /// "never", so the clock starts at one.
    pub(crate) fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64 + 1
    }

    // ===== wiring =====

    /// Run `hook` once the first schema is live; this is where the site
    /// adapter augments buttons with virtual outputs.
    pub fn on_init(&mut self, hook: impl FnOnce(&mut Controller, &mut Sched) + 'static) {
        self.init_hooks.push(Box::new(hook));
    }

    /// Every processed line: `(line, context, fade)`, where context names
    /// the affected device or output when known.
    pub fn on_input(&mut self, hook: impl FnMut(&str, &str, bool) + 'static) {
        self.on_input = Some(Box::new(hook));
    }

    /// Pulse per received line, including prompts; feeds the watchdog.
    pub fn on_heartbeat(&mut self, hook: impl FnMut() + 'static) {
        self.on_heartbeat = Some(Box::new(hook));
    }

    /// The gateway's schema no longer matches the live mirror; the
    /// supervisor should restart the process.
    pub fn on_schema_invalid(&mut self, hook: impl FnMut() + 'static) {
        self.on_schema_invalid = Some(Box::new(hook));
    }

    /// Debounced LED/level delta lines for the UI broadcast.
    pub fn on_broadcast(&mut self, hook: impl FnMut(&str) + 'static) {
        self.broadcast = Some(Box::new(hook));
    }

    /// Arm the recurring health check. Also serves as the persistent
    /// reactor registration that keeps the daemon alive.
    pub fn start(&mut self, sched: &mut Sched) {
        self.health_check(sched);
    }

    /// Port of the gateway's web server carrying the schema document.
    /// Standard gateways serve it on 80.
    pub fn set_schema_port(&mut self, port: u16) {
        self.schema_port = port;
    }

    // ===== command plumbing =====

    /// Send a command to the gateway with optional completion hooks.
    ///
    /// One rewrite: synthetic release events aimed at a keypad that does
    /// not emit native releases, on a non-dimmer button, are silently
    /// dropped so downstream consumers see one event stream regardless
    /// of where the press originated.
    pub fn command(
        &mut self,
        cmd: &str,
        on_result: Option<ResultHook>,
        on_error: Option<ErrorHook>,
    ) {
        if self.is_redundant_synthetic_release(cmd) {
            return;
        }
        let id = self.next_command_id;
        self.next_command_id += 1;
        self.completions.insert(
            id,
            CommandHooks {
                on_result,
                on_error,
            },
        );
        self.link.submit(cmd.to_string(), id);
    }

    fn is_redundant_synthetic_release(&self, cmd: &str) -> bool {
        let Some(rest) = cmd.strip_prefix("#DEVICE,") else {
            return false;
        };
        let fields: Vec<&str> = rest.split(',').collect();
        if fields.len() != 3 || fields[2] != "4" {
            return false;
        }
        let (Ok(kp), Ok(bt)) = (fields[0].parse::<i32>(), fields[1].parse::<i32>()) else {
            return false;
        };
        let Some(device) = self.devices.get(&kp) else {
            return false;
        };
        let Some(component) = device.components.get(&bt) else {
            return false;
        };
        !device.dim.supports_release && !component.kind.is_dimmer()
    }

    /// Entry point for all link events, dispatched from the reactor.
    pub fn handle_link_event(&mut self, sched: &mut Sched, event: LinkEvent) {
        match event {
            LinkEvent::Line(line) => self.read_line(sched, &line),
            LinkEvent::InitBegin => self.on_link_init(sched),
            LinkEvent::Closed => self.on_closed(),
            LinkEvent::CommandDone { id, outcome } => {
                let Some(hooks) = self.completions.remove(&id) else {
                    return;
                };
                match outcome {
                    Ok(result) => {
                        if let Some(hook) = hooks.on_result {
                            hook(self, sched, result);
                        }
                    }
                    Err(err) => {
                        debug!("command {id} failed: {err}");
                        if let Some(hook) = hooks.on_error {
                            hook(self, sched);
                        }
                    }
                }
            }
        }
    }

    // ===== line interpretation =====

    fn read_line(&mut self, sched: &mut Sched, line: &str) {
        self.pulse_heartbeat();
        if line.is_empty() {
            return;
        }
        debug!("read line {line:?}");

        let mut suppressed = false;
        let mut context = String::new();
        match parse_update(line) {
            Some(Update::Device {
                device,
                component,
                action: act,
                value,
            }) => {
                context = self.device_update(sched, device, component, act, value);
            }
            Some(Update::Output { id, level }) => {
                (suppressed, context) = self.output_update(sched, id, level);
            }
            Some(Update::Time { h, m, s }) => self.check_clock_drift(h, m, s),
            None => {}
        }

        // A short while after the last update, recompute all LEDs.
        if self.recompute.is_some() || !self.link.command_pending() {
            if let Some(handle) = self.recompute.take() {
                sched.remove_timeout(handle);
            }
            self.recompute = Some(sched.add_timeout(RECOMPUTE_DELAY, |c, s| {
                c.recompute = None;
                c.recompute_leds(s);
            }));
        }

        if !suppressed {
            if let Some(input) = self.on_input.as_mut() {
                input(line, context.trim(), true);
            }
        }
    }

    /// `~DEVICE,...`: either a button press/release or an LED state
    /// report; told apart by whether the component number names a button
    /// or some button's LED.
    fn device_update(
        &mut self,
        sched: &mut Sched,
        device: i32,
        component: i32,
        act: u32,
        value: Option<&str>,
    ) -> String {
        let Some(dev) = self.devices.get(&device) else {
            return String::new();
        };
        if dev.components.contains_key(&component) {
            if value.is_none() && (act == action::PRESS || act == action::RELEASE) {
                let context = dev.components[&component].name.clone();
                self.button_event(sched, device, component, act == action::RELEASE);
                return context;
            }
            return String::new();
        }
        // Not a button: find the button whose LED this is.
        let Some(bt) = dev
            .components
            .values()
            .find(|c| c.led == component)
            .map(|c| c.id)
        else {
            return String::new();
        };
        if act != action::LED_STATE {
            return String::new();
        }
        let Some(value) = value else {
            return String::new();
        };
        // Anything but a definitive 0 or 1 leaves the LED uncertain; the
        // default assumption is that it is off.
        let uncertain = value != "0" && value != "1";
        let (context, assignments, kind) = {
            let dev = self.devices.get_mut(&device).expect("device exists");
            let kind = dev.kind;
            let button = dev.components.get_mut(&bt).expect("component exists");
            button.uncertain = uncertain;
            (button.name.clone(), button.assignments.clone(), kind)
        };
        if !uncertain {
            let on = value == "1";
            if kind.is_seetouch() {
                let level = self.level_for_button(&assignments);
                self.push_delta(sched, device, bt, on, level);
            }
            let dev = self.devices.get_mut(&device).expect("device exists");
            dev.components.get_mut(&bt).expect("component exists").led_state = on;
        }
        context
    }

    /// `~OUTPUT,<id>,1,<level>`: the gateway reports a fixture level.
    fn output_update(&mut self, sched: &mut Sched, id: i32, new_level: i32) -> (bool, String) {
        // While the daemon is smoothly dimming a dummy fixture, the
        // gateway's own reports for it would only cause flicker.
        if self.suppressed.contains(&id) {
            return (true, String::new());
        }
        let Some(out) = self.outputs.get(&id) else {
            return (false, String::new());
        };
        let (old_level, name) = (out.level, out.name.clone());

        if let Some(&until) = self.release_window.get(&id) {
            if self.now_ms() < until && old_level != new_level {
                // The gateway is trying to override the value we just
                // set; push ours back.
                self.command(&cmd::set_output(id, old_level), None, None);
                return (true, String::new());
            }
        }

        self.outputs.get_mut(&id).expect("output exists").level = new_level;

        if let Some(monitor) = self.output_monitors.get(&id).cloned() {
            monitor(self, sched, new_level);
        }

        // Aliased virtual outputs shadow this fixture; keep them in sync
        // and let their sinks act on the change.
        let gw_alias = format!("{GW_ALIAS}{id}");
        let dmx_alias = format!("{DMX_ALIAS}{id}");
        for idx in 0..self.named_outputs.len() {
            let named = &mut self.named_outputs[idx];
            if named.name == gw_alias || named.name == dmx_alias {
                let changed = named.level != new_level;
                named.level = new_level;
                if changed {
                    let sink = named.sink.clone();
                    sched.run_later(move |c, s| sink(c, s, new_level, true));
                }
            }
        }

        self.broadcast_dimmer_changes(sched, id);
        (false, name)
    }

    /// `~SYSTEM,1,HH:MM:SS`: correct the gateway clock when it has
    /// drifted more than a few seconds from ours.
    fn check_clock_drift(&mut self, h: u32, m: u32, s: u32) {
        let local = chrono::Local::now();
        let gateway_secs = s + 60 * (m + 60 * h);
        let local_secs = local.second() + 60 * (local.minute() + 60 * local.hour());
        let mut drift = (gateway_secs + 86_400 - local_secs) % 86_400;
        if drift >= 43_200 {
            drift = 86_400 - drift;
        }
        if drift > DRIFT_LIMIT_SECS {
            info!("gateway clock has drifted {drift} seconds");
            self.command(
                &cmd::set_clock(local.hour(), local.minute(), local.second()),
                None,
                None,
            );
        }
    }

    // ===== initialization =====

    /// The link's on-init window: subscribe to monitoring, bring up the
    /// schema (cache first, network fetch to confirm), and refresh
    /// output state. `init_done` closes the window.
    fn on_link_init(&mut self, sched: &mut Sched) {
        debug!("connection opened");
        if !self.link.is_connected() {
            self.link.close();
            self.link.init_done();
            return;
        }

        for kind in [
            monitor::BUTTON,
            monitor::LED,
            monitor::OCCUPANCY,
            monitor::PHOTOSENSOR,
            monitor::OCCUPANCY_GROUP,
        ] {
            self.command(&cmd::monitoring(kind), None, None);
        }

        let had_schema = !self.devices.is_empty() || !self.outputs.is_empty();
        if !had_schema {
            // Getting the schema from the gateway takes a long time;
            // start from the cache when there is one.
            if let Some(text) = load_cache(&self.cache_path) {
                match extract(&text) {
                    Ok((devices, outputs)) => {
                        info!(
                            "loaded cached schema: {} devices, {} outputs",
                            devices.len(),
                            outputs.len()
                        );
                        self.devices = devices;
                        self.outputs = outputs;
                    }
                    Err(err) => warn!("ignoring unusable schema cache: {err}"),
                }
            }
        }

        let Some(addr) = self.link.connected_addr() else {
            debug!("no connected address; cannot fetch schema");
            self.link.close();
            self.link.init_done();
            return;
        };

        if had_schema {
            // Reconnect after an outage: the mirror may have missed
            // updates, so resync state now. The fetch only verifies that
            // the schema itself is still what we think it is.
            self.start_fetch(addr, FetchPlan::Check);
            self.refresh_current_state(sched, Some(Box::new(|c, _| c.link.init_done())));
        } else if !self.devices.is_empty() || !self.outputs.is_empty() {
            // Warm start from cache: continue speculatively while the
            // fetch races to confirm; a mismatch restarts the process.
            self.start_fetch(addr, FetchPlan::Check);
            self.refresh_current_state(
                sched,
                Some(Box::new(|c, s| {
                    c.run_init_hooks(s);
                    c.link.init_done();
                    c.initialized = true;
                })),
            );
        } else {
            // Cold start: nothing usable until the fetch lands.
            self.start_fetch(addr, FetchPlan::Install);
        }
    }

    fn start_fetch(&mut self, addr: SocketAddr, plan: FetchPlan) {
        self.fetch_plan = plan;
        let addr = SocketAddr::new(addr.ip(), self.schema_port);
        let injector = self.injector.clone();
        let link = self.link.clone();
        let progress_injector = self.injector.clone();
        let handle = tokio::task::spawn_local(async move {
            let progress = move || {
                // Each chunk is progress: keep the link's init deadline
                // and the watchdog satisfied while the download crawls.
                link.extend_init();
                progress_injector.send(|c: &mut Controller, _| c.pulse_heartbeat());
            };
            let result = crate::fetch::fetch_schema(addr, progress).await;
            injector.send(move |c: &mut Controller, s| c.schema_fetched(s, result));
        });
        self.fetch_task = Some(handle);
    }

    fn pulse_heartbeat(&mut self) {
        if let Some(hb) = self.on_heartbeat.as_mut() {
            hb();
        }
    }

    fn schema_fetched(&mut self, sched: &mut Sched, result: Result<String, crate::fetch::FetchError>) {
        self.fetch_task = None;
        let plan = std::mem::replace(&mut self.fetch_plan, FetchPlan::Idle);
        let text = match result {
            Ok(text) => text,
            Err(err) => {
                // Transient: reset the integration connection too; the
                // health check will retry the whole initialization.
                warn!("schema fetch failed: {err}");
                self.link.close();
                if plan == FetchPlan::Install {
                    self.link.init_done();
                }
                return;
            }
        };
        let parsed = match extract(&text) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!("schema document unusable: {err}");
                self.link.close();
                if plan == FetchPlan::Install {
                    self.link.init_done();
                }
                return;
            }
        };

        match plan {
            FetchPlan::Idle => debug!("unexpected schema fetch completion"),
            FetchPlan::Install => {
                if let Err(err) = save_cache(&self.cache_path, &text) {
                    warn!("cannot cache schema: {err}");
                }
                info!(
                    "installed schema: {} devices, {} outputs",
                    parsed.0.len(),
                    parsed.1.len()
                );
                (self.devices, self.outputs) = parsed;
                self.refresh_current_state(
                    sched,
                    Some(Box::new(|c, s| {
                        c.run_init_hooks(s);
                        c.link.init_done();
                        c.initialized = true;
                    })),
                );
            }
            FetchPlan::Check => {
                let current = (
                    std::mem::take(&mut self.devices),
                    std::mem::take(&mut self.outputs),
                );
                let unchanged = same_schema(&current, &parsed);
                (self.devices, self.outputs) = current;
                if unchanged {
                    debug!("cached schema confirmed unchanged");
                } else {
                    info!("gateway schema changed; requesting restart");
                    if let Err(err) = save_cache(&self.cache_path, &text) {
                        warn!("cannot cache schema: {err}");
                    }
                    self.schema_invalid();
                }
            }
        }
    }

    fn schema_invalid(&mut self) {
        if self.schema_invalid_fired {
            return;
        }
        self.schema_invalid_fired = true;
        if let Some(hook) = self.on_schema_invalid.as_mut() {
            hook();
        }
    }

    /// In-process reconfiguration is not supported; a restart request is
    /// outstanding. Controller state must not change any further.
    pub(crate) fn halted(&self) -> bool {
        self.schema_invalid_fired
    }

    fn run_init_hooks(&mut self, sched: &mut Sched) {
        let hooks = std::mem::take(&mut self.init_hooks);
        for hook in hooks {
            sched.run_later(hook);
        }
    }

    /// Query every output's level, then (once the barrier completes)
    /// schedule the LED re-query pass. Each completion extends the init
    /// deadline: this is slow, but it is progress.
    fn refresh_current_state(&mut self, _sched: &mut Sched, cb: Option<ErrorHook>) {
        let ids: Vec<i32> = self.outputs.keys().copied().collect();
        for id in ids {
            self.command(
                &cmd::query_output(id),
                Some(Box::new(|c, _, _| c.link.extend_init())),
                None,
            );
        }
        // The empty command is a completion barrier: its prompt means
        // every query above has resolved.
        self.command(
            "",
            Some(Box::new(move |c: &mut Controller, s: &mut Sched, _| {
                if let Some(cb) = cb {
                    cb(c, s);
                }
                s.add_timeout(LED_QUERY_DELAY, |c, s| c.query_all_leds(s));
            })),
            None,
        );
    }

    fn query_all_leds(&mut self, sched: &mut Sched) {
        let mut queries = Vec::new();
        for dev in self.devices.values_mut() {
            let (dev_id, kind) = (dev.id, dev.kind);
            for comp in dev.components.values_mut() {
                if comp.led < 0 {
                    continue;
                }
                // The gateway does not reliably track LED state; assume
                // off until it answers.
                comp.led_state = false;
                queries.push((dev_id, comp.id, comp.led, kind, comp.assignments.clone()));
            }
        }
        for (dev, bt, led, kind, assignments) in queries {
            if kind.is_seetouch() {
                let level = self.level_for_button(&assignments);
                self.push_delta(sched, dev, bt, false, level);
            }
            self.command(
                &cmd::query_led(dev, led),
                Some(Box::new(|c, _, _| c.link.extend_init())),
                None,
            );
        }
    }

    fn on_closed(&mut self) {
        debug!("connection closed");
        if let Some(task) = self.fetch_task.take() {
            // A half-read schema is worthless; drop any partial state and
            // start over on the next connection.
            debug!("abandoning incomplete schema fetch");
            task.abort();
            if self.fetch_plan == FetchPlan::Install {
                self.devices.clear();
                self.outputs.clear();
            }
            self.fetch_plan = FetchPlan::Idle;
        }
    }

    // ===== levels and LEDs =====

    /// Current level of a gateway output or virtual output; -1 when the
    /// id is unknown.
    pub(crate) fn get_current_level(&self, id: i32) -> i32 {
        if id < 0 {
            match self.named_outputs.get((-id - 1) as usize) {
                Some(named) => named.level.clamp(0, 10_000),
                None => -1,
            }
        } else {
            match self.outputs.get(&id) {
                Some(out) => out.level,
                None => {
                    debug!("can't find output {id}");
                    -1
                }
            }
        }
    }

    /// Best-effort dimmer position for a button: the highest current
    /// level among its assignments with a nonzero programmed level. The
    /// UI renders keypads, not fixtures, so this is what its sliders
    /// show.
    pub(crate) fn level_for_button(&self, assignments: &[Assignment]) -> i32 {
        let mut level = 0;
        for a in assignments {
            if a.level == 0 {
                continue;
            }
            level = level.max(self.get_current_level(a.output).min(10_000));
        }
        level
    }

    /// Recompute the expected state of every monitor/scene LED and fix
    /// mismatches. Idempotent: a second pass without intervening state
    /// changes issues no commands.
    pub(crate) fn recompute_leds(&mut self, sched: &mut Sched) {
        if self.halted() {
            return;
        }
        let mut fixes = Vec::new();
        for dev in self.devices.values() {
            for comp in dev.components.values() {
                if comp.led < 0 || !matches!(comp.logic, LedLogic::Monitor | LedLogic::Scene) {
                    continue;
                }
                let mut led_state = comp.logic == LedLogic::Scene;
                let mut empty = true;
                for a in &comp.assignments {
                    let level = self.get_current_level(a.output);
                    if level < 0 {
                        continue;
                    }
                    empty = false;
                    match comp.logic {
                        LedLogic::Monitor => {
                            if level > 0 {
                                led_state = true;
                            }
                        }
                        _ => {
                            if level != a.level {
                                led_state = false;
                            }
                        }
                    }
                }
                // No fixtures behind the LED means it is always off.
                led_state &= !empty;
                if led_state != comp.led_state {
                    debug!(
                        "LED {:?} ({}) on {:?} should be {}",
                        comp.name,
                        comp.id,
                        dev.name,
                        if led_state { "on" } else { "off" }
                    );
                    fixes.push((
                        dev.id,
                        comp.id,
                        comp.led,
                        led_state,
                        dev.kind,
                        comp.assignments.clone(),
                    ));
                }
            }
        }
        for (dev, bt, led, led_state, kind, assignments) in fixes {
            if kind.is_seetouch() {
                let level = self.level_for_button(&assignments);
                self.push_delta(sched, dev, bt, led_state, level);
            }
            self.command(&cmd::set_led(dev, led, led_state), None, None);
            let device = self.devices.get_mut(&dev).expect("device exists");
            device.components.get_mut(&bt).expect("component exists").led_state = led_state;
        }
    }

    /// The same fixture can sit behind several buttons; refresh every
    /// button's UI dimmer position when one fixture moves.
    pub(crate) fn broadcast_dimmer_changes(&mut self, sched: &mut Sched, id: i32) {
        let mut notify = Vec::new();
        for dev in self.devices.values() {
            for comp in dev.components.values() {
                if comp.assignments.iter().any(|a| a.output == id) {
                    notify.push((dev.id, comp.id, comp.led_state, comp.assignments.clone()));
                }
            }
        }
        for (dev, bt, led_state, assignments) in notify {
            let level = self.level_for_button(&assignments);
            self.push_delta(sched, dev, bt, led_state, level);
        }
    }

    /// Queue a `<kp>,<led>,<onOff>,<level>` tuple for the debounced UI
    /// broadcast. Uncertain LEDs never reach this point.
    pub(crate) fn push_delta(&mut self, sched: &mut Sched, kp: i32, bt: i32, on: bool, level: i32) {
        self.deltas.push(snapshot::Delta {
            keypad: kp,
            button: bt,
            on,
            level,
        });
        if self.delta_timer.is_none() {
            self.delta_timer = Some(sched.add_timeout(DELTA_DEBOUNCE, |c, _| {
                c.delta_timer = None;
                let deltas = std::mem::take(&mut c.deltas);
                if let Some(broadcast) = c.broadcast.as_mut() {
                    broadcast(&snapshot::format_deltas(&deltas));
                }
            }));
        }
    }

    // ===== virtual outputs =====

    /// Set an output to a level, routing to the right place: virtual
    /// outputs go to their sink, gateway outputs get a `#OUTPUT` command.
    /// `suppress` engages the dummy-dimmer suppression for the id;
    /// `no_update` updates local state and sinks without commanding the
    /// gateway (used mid-ramp and for provisional double-tap values).
    pub(crate) fn set_virtual_or_native(
        &mut self,
        sched: &mut Sched,
        id: i32,
        level: i32,
        fade: bool,
        suppress: bool,
        no_update: bool,
    ) {
        if id < 0 {
            let idx = (-id - 1) as usize;
            let Some(named) = self.named_outputs.get_mut(idx) else {
                warn!("invalid virtual output {id}");
                return;
            };
            if named.level != level {
                named.level = level.clamp(0, 10_000);
                let sink = named.sink.clone();
                sink(self, sched, level, fade);
            }
            self.broadcast_dimmer_changes(sched, id);
        } else {
            let Some(out) = self.outputs.get(&id) else {
                warn!("invalid output {id}");
                return;
            };
            let old_level = out.level;
            let name = out.name.clone();
            if suppress {
                self.suppress_dimmer(id, true);
            }
            if !no_update {
                // The final call both flushes our value to the gateway
                // and lifts the suppression when it completes.
                let hook: Option<ResultHook> = if suppress {
                    Some(Box::new(move |c, _, _| c.suppress_dimmer(id, false)))
                } else {
                    None
                };
                self.command(&cmd::set_output(id, level), hook, None);
            }
            if old_level != level {
                self.outputs.get_mut(&id).expect("output exists").level = level;
                self.broadcast_dimmer_changes(sched, id);
                // Our own update may have been filtered out by the
                // suppression machinery; synthesize the input event.
                if let Some(input) = self.on_input.as_mut() {
                    input(
                        &format!("~OUTPUT,{},1,{}", id, lumenproto::format_level(level)),
                        name.trim(),
                        fade,
                    );
                }
            }
        }
    }

    /// Track a gateway dummy dimmer the daemon is driving. Leaving
    /// suppression opens the release window during which late gateway
    /// reports are corrected instead of believed.
    pub(crate) fn suppress_dimmer(&mut self, id: i32, engaged: bool) {
        if engaged {
            self.suppressed.insert(id);
        } else if self.suppressed.remove(&id) {
            self.release_window.insert(id, self.now_ms() + RELEASE_WINDOW_MS);
        }
    }

    // ===== extension API =====

    /// Register (or find by name) a virtual output. Ids are negative and
    /// stable for the process lifetime.
    pub fn add_output(&mut self, name: &str, sink: OutputSink) -> i32 {
        if let Some(idx) = self.named_outputs.iter().position(|n| n.name == name) {
            return -(idx as i32) - 1;
        }
        self.named_outputs.push(NamedOutput {
            name: name.to_string(),
            level: 0,
            sink,
        });
        -(self.named_outputs.len() as i32)
    }

    /// Append an assignment to a keypad button. `level` is percent;
    /// `-1` marks a relay pulse. `make_toggle` coerces the button kind
    /// to `Toggle`, allowed only when it already is one or carries no
    /// native assignments.
    pub fn add_to_button(&mut self, kp: i32, bt: i32, id: i32, level: i32, make_toggle: bool) {
        let Some(device) = self.devices.get_mut(&kp) else {
            warn!("cannot find keypad {kp}");
            return;
        };
        let Some(component) = device.components.get_mut(&bt) else {
            warn!("cannot find component {kp}/{bt}");
            return;
        };
        if component.assignments.iter().any(|a| a.output == id) {
            warn!("duplicate assignment for {kp}/{bt}, fixture {id}");
            return;
        }
        if make_toggle {
            if component.kind != ButtonKind::Toggle && !component.assignments.is_empty() {
                warn!("contradictory constraints; cannot override button type of {kp}/{bt}");
            } else {
                component.kind = ButtonKind::Toggle;
            }
        }
        component.assignments.push(Assignment {
            output: id,
            level: if level == -1 { -1 } else { level * 100 },
        });
    }

    /// Observe every gateway level report for one output.
    pub fn monitor_output(
        &mut self,
        id: i32,
        sink: impl Fn(&mut Controller, &mut Sched, i32) + 'static,
    ) {
        self.output_monitors.insert(id, Rc::new(sink));
    }

    /// Listen for classified button events on a keypad button.
    pub fn add_button_listener(&mut self, kp: i32, bt: i32, listener: ButtonListener) {
        if self
            .devices
            .get(&kp)
            .is_some_and(|d| d.components.contains_key(&bt))
        {
            self.button_listeners.entry((kp, bt)).or_default().push(listener);
        } else {
            warn!("cannot find button {kp}/{bt} for listener");
        }
    }

    /// Flip a gateway output between off and fully on.
    pub fn toggle_output(&mut self, id: i32) {
        let Some(out) = self.outputs.get_mut(&id) else {
            return;
        };
        let level = if out.level != 0 { 0 } else { 10_000 };
        out.level = level;
        self.command(&cmd::set_output(id, level), None, None);
    }

    /// Keypad id by display name, or -1.
    pub fn get_keypad(&self, label: &str) -> i32 {
        self.devices
            .values()
            .find(|d| d.name == label)
            .map(|d| d.id)
            .unwrap_or(-1)
    }

    pub fn device_kind(&self, id: i32) -> DeviceKind {
        self.devices
            .get(&id)
            .map(|d| d.kind)
            .unwrap_or(DeviceKind::Unknown)
    }

    /// JSON snapshot of the keypad view for the UI.
    pub fn keypads_json(&self, order: &[i32]) -> serde_json::Value {
        snapshot::keypads(&self.devices, order, |assignments| {
            self.level_for_button(assignments)
        })
    }

    // ===== health =====

    /// Recurring link supervision: reconnect with backoff while down,
    /// probe liveness while quiet, sweep uncertain LEDs. Re-arms itself;
    /// this standing timer is also what keeps the reactor running.
    pub(crate) fn health_check(&mut self, sched: &mut Sched) {
        let now = self.now_ms();
        if !self.link.is_connected() {
            self.check_started = None;
            self.check_finished = None;
            // The ping is what prods the link into reconnecting.
            self.ping(Some(Box::new(|c, _, _| {
                c.reconnect = SHORT_REOPEN_TMO;
                c.check_finished = Some(c.now_ms());
            })));
            self.reconnect = (self.reconnect * 2).min(LONG_REOPEN_TMO);
        } else {
            self.reconnect = SHORT_REOPEN_TMO;
            if let Some(started) = self.check_started {
                if now.saturating_sub(started) > ALIVE_CMD_TMO.as_millis() as u64 {
                    // The liveness query went unanswered; reset the
                    // connection, that usually clears it.
                    info!("liveness check timed out; resetting connection");
                    self.link.close();
                    self.check_started = None;
                    self.check_finished = None;
                }
            } else if let Some(finished) = self.check_finished {
                if now.saturating_sub(finished) > ALIVE_INTERVAL.as_millis() as u64 {
                    self.check_started = Some(now);
                    self.ping(Some(Box::new(|c, _, _| {
                        c.check_finished = Some(c.now_ms());
                        c.check_started = None;
                    })));
                }
            } else {
                self.check_finished = Some(now);
            }

            match self.uncertain_sweep {
                None => self.uncertain_sweep = Some(now),
                Some(last) if now.saturating_sub(last) > UNCERTAIN_SWEEP.as_millis() as u64 => {
                    self.uncertain_sweep = Some(now);
                    let stale: Vec<(i32, i32)> = self
                        .devices
                        .values()
                        .flat_map(|d| {
                            d.components
                                .values()
                                .filter(|c| c.uncertain && c.led >= 0)
                                .map(move |c| (d.id, c.led))
                        })
                        .collect();
                    for (dev, led) in stale {
                        self.command(&cmd::query_led(dev, led), None, None);
                    }
                }
                Some(_) => {}
            }
        }
        let delay = self.reconnect;
        sched.add_timeout(delay, |c, s| c.health_check(s));
    }

    /// Thin liveness shim over the time-of-day query; the reply also
    /// feeds the clock-drift check through the normal line path.
    fn ping(&mut self, on_result: Option<ResultHook>) {
        self.command(&cmd::query_time(), on_result, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::*;

    const DOC: &str = r#"<?xml version="1.0"?>
<Project>
  <Device IntegrationID="11" Name="Hallway" DeviceType="SEETOUCH_KEYPAD">
    <Component ComponentNumber="2">
      <Button Engraving="Evening" ButtonType="Toggle" LedLogic="1"
              ProgrammingModelID="101">
        <PresetAssignment AssignmentType="2">
          <IntegrationID>5</IntegrationID>
          <Level>75.00</Level>
        </PresetAssignment>
      </Button>
    </Component>
    <Component ComponentNumber="82">
      <LED ProgrammingModelID="101"/>
    </Component>
  </Device>
  <Output IntegrationID="5" Name="Sconces"/>
  <Output IntegrationID="7" Name="Accent:DMX 12"/>
</Project>"#;

    #[tokio::test(start_paused = true)]
    async fn led_recompute_is_idempotent() {
        let (mut reactor, inj, link, mut c) = harness();
        c.devices = seetouch_keypad();
        c.outputs = native_outputs();

        line_at(&inj, 0, "~OUTPUT,5,1,75.00");
        // Same value again: the recompute pass must find nothing to fix.
        line_at(&inj, 400, "~OUTPUT,5,1,75.00");
        exit_at(&inj, 1000);
        reactor.run(&mut c).await;

        assert_eq!(c.outputs[&5].level, 7500);
        assert_eq!(link.count_matching("#DEVICE,11,82,9,1"), 1);
        assert!(c.devices[&11].components[&2].led_state);
    }

    #[tokio::test(start_paused = true)]
    async fn scene_led_requires_exact_levels() {
        let (mut reactor, inj, link, mut c) = harness();
        let mut devices = seetouch_keypad();
        devices
            .get_mut(&11)
            .unwrap()
            .components
            .get_mut(&2)
            .unwrap()
            .logic = LedLogic::Scene;
        c.devices = devices;
        c.outputs = native_outputs();

        // Wrong level: scene LED stays off (no command at all).
        line_at(&inj, 0, "~OUTPUT,5,1,50.00");
        // Exact programmed level: scene LED turns on.
        line_at(&inj, 500, "~OUTPUT,5,1,75.00");
        exit_at(&inj, 1000);
        reactor.run(&mut c).await;

        assert_eq!(link.count_matching("#DEVICE,11,82,9,0"), 0);
        assert_eq!(link.count_matching("#DEVICE,11,82,9,1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn led_state_report_updates_mirror_and_uncertainty() {
        let (mut reactor, inj, _link, mut c) = harness();
        c.devices = seetouch_keypad();
        c.outputs = native_outputs();

        line_at(&inj, 0, "~DEVICE,11,82,9,255");
        exit_at(&inj, 100);
        reactor.run(&mut c).await;
        assert!(c.devices[&11].components[&2].uncertain);
        assert!(!c.devices[&11].components[&2].led_state);

        let (mut reactor, inj, _link, mut c) = harness();
        c.devices = seetouch_keypad();
        c.outputs = native_outputs();
        line_at(&inj, 0, "~DEVICE,11,82,9,1");
        exit_at(&inj, 100);
        reactor.run(&mut c).await;
        assert!(!c.devices[&11].components[&2].uncertain);
        assert!(c.devices[&11].components[&2].led_state);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_queries_every_output_then_leds() {
        let (mut reactor, inj, link, mut c) = harness();
        c.devices = seetouch_keypad();
        c.outputs = native_outputs();

        inj.send(|c: &mut Controller, s| c.refresh_current_state(s, None));
        exit_at(&inj, 3000);
        reactor.run(&mut c).await;

        let commands = link.commands();
        assert!(commands.contains(&"?OUTPUT,5,1".to_string()));
        assert!(commands.contains(&"?OUTPUT,7,1".to_string()));
        // The barrier sits behind the queries.
        assert!(commands.contains(&String::new()));
        // The deferred LED pass queried the one LED.
        assert!(commands.contains(&"?DEVICE,11,82,9".to_string()));
        // Progress extended the init deadline.
        assert!(link.extended.get() > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_backoff_doubles_caps_and_resets() {
        let (mut reactor, inj, link, mut c) = harness();
        link.connected.set(false);
        // An unreachable gateway never answers the liveness pings.
        link.auto_complete.set(false);

        inj.send(|c: &mut Controller, s| c.start(s));
        let l = link.clone();
        inj.send(move |_, s| {
            s.add_timeout(Duration::from_millis(135_000), move |c, s| {
                // Doubling from the 5 s short interval (5, 10, 20, 40)
                // and then the 60 s cap puts the probes at 0, 10, 30,
                // 70, and 130 seconds.
                assert_eq!(l.count_matching("?SYSTEM,1"), 5);
                // A reply resets the backoff to the short interval.
                let id = l.submitted.borrow().last().expect("a ping was sent").0;
                c.handle_link_event(
                    s,
                    LinkEvent::CommandDone {
                        id,
                        outcome: Ok(String::new()),
                    },
                );
            });
        });
        exit_at(&inj, 225_000);
        reactor.run(&mut c).await;

        // After the reset, the next disconnected round (scheduled for
        // 190 s while still backed off) probes at 190, 200, and 220
        // seconds: short-interval pacing again.
        assert_eq!(link.count_matching("?SYSTEM,1"), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn answered_liveness_probe_keeps_the_link_open() {
        let (mut reactor, inj, link, mut c) = harness();
        inj.send(|c: &mut Controller, s| c.start(s));
        exit_at(&inj, 80_000);
        reactor.run(&mut c).await;

        // One quiet minute earns one liveness query; the prompt answer
        // (auto-completed by the fake) keeps the connection alone.
        assert_eq!(link.count_matching("?SYSTEM,1"), 1);
        assert_eq!(link.closed.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_liveness_probe_forces_a_close() {
        let (mut reactor, inj, link, mut c) = harness();
        link.auto_complete.set(false);

        inj.send(|c: &mut Controller, s| c.start(s));
        exit_at(&inj, 80_000);
        reactor.run(&mut c).await;

        // The probe went out after the quiet interval and its reply
        // deadline passed: the connection gets reset.
        assert_eq!(link.count_matching("?SYSTEM,1"), 1);
        assert_eq!(link.closed.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn uncertain_leds_are_requeried_on_the_slow_sweep() {
        let (mut reactor, inj, link, mut c) = harness();
        c.devices = seetouch_keypad();
        c.outputs = native_outputs();
        c.devices
            .get_mut(&11)
            .unwrap()
            .components
            .get_mut(&2)
            .unwrap()
            .uncertain = true;

        inj.send(|c: &mut Controller, s| c.start(s));
        exit_at(&inj, 1_000_000);
        reactor.run(&mut c).await;

        // One sweep ran (at fifteen minutes, well before the second at
        // thirty) and re-queried exactly the uncertain LED.
        assert_eq!(link.count_matching("?DEVICE,11,82,9"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn schema_install_plan_brings_up_state() {
        let (mut reactor, inj, link, mut c) = harness();
        c.fetch_plan = FetchPlan::Install;
        inj.send(|c: &mut Controller, s| c.schema_fetched(s, Ok(DOC.to_string())));
        exit_at(&inj, 5000);
        reactor.run(&mut c).await;

        assert_eq!(c.devices.len(), 1);
        assert_eq!(c.outputs.len(), 2);
        assert!(c.initialized);
        assert_eq!(link.init_done_calls.get(), 1);
        assert!(link.commands().contains(&"?OUTPUT,5,1".to_string()));
        // The document was cached for the next warm start.
        assert!(c.cache_path.exists());
        let _ = std::fs::remove_file(&c.cache_path);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_fetch_resets_the_connection() {
        let (mut reactor, inj, link, mut c) = harness();
        c.fetch_plan = FetchPlan::Install;
        inj.send(|c: &mut Controller, s| {
            c.schema_fetched(s, Err(crate::fetch::FetchError::NoPayload))
        });
        exit_at(&inj, 100);
        reactor.run(&mut c).await;

        // The transient failure tears the integration connection down
        // (the health check retries the whole initialization) and the
        // init window is not left open.
        assert_eq!(link.closed.get(), 1);
        assert_eq!(link.init_done_calls.get(), 1);
        assert!(c.devices.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn init_without_connection_backs_out() {
        let (mut reactor, inj, link, mut c) = harness();
        link.connected.set(false);
        inj.send(|c: &mut Controller, s| c.handle_link_event(s, LinkEvent::InitBegin));
        exit_at(&inj, 100);
        reactor.run(&mut c).await;

        assert_eq!(link.closed.get(), 1);
        assert_eq!(link.init_done_calls.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn init_without_address_subscribes_then_backs_out() {
        let (mut reactor, inj, link, mut c) = harness();
        // Connected but the address is unknown: monitoring subscribes
        // go out, but the schema cannot be fetched.
        inj.send(|c: &mut Controller, s| c.handle_link_event(s, LinkEvent::InitBegin));
        exit_at(&inj, 100);
        reactor.run(&mut c).await;

        assert!(link.count_matching("#MONITORING,") >= 5);
        assert_eq!(link.closed.get(), 1);
        assert_eq!(link.init_done_calls.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn schema_check_accepts_unchanged_and_augmented_schema() {
        let (mut reactor, inj, _link, mut c) = harness();
        let fired = std::rc::Rc::new(std::cell::Cell::new(0u32));
        let f = fired.clone();
        c.on_schema_invalid(move || f.set(f.get() + 1));
        (c.devices, c.outputs) = extract(DOC).unwrap();
        // Augment the way the site adapter would.
        c.add_output("DMX:7", Rc::new(|_, _, _, _| {}));
        c.add_to_button(11, 2, -1, 100, false);
        c.fetch_plan = FetchPlan::Check;

        inj.send(|c: &mut Controller, s| c.schema_fetched(s, Ok(DOC.to_string())));
        exit_at(&inj, 100);
        reactor.run(&mut c).await;

        assert_eq!(fired.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn schema_check_flags_structural_change_once() {
        let (mut reactor, inj, _link, mut c) = harness();
        let fired = std::rc::Rc::new(std::cell::Cell::new(0u32));
        let f = fired.clone();
        c.on_schema_invalid(move || f.set(f.get() + 1));
        (c.devices, c.outputs) = extract(DOC).unwrap();

        let changed = DOC.replace("75.00", "50.00");
        c.fetch_plan = FetchPlan::Check;
        inj.send(move |c: &mut Controller, s| c.schema_fetched(s, Ok(changed)));
        exit_at(&inj, 100);
        reactor.run(&mut c).await;

        assert_eq!(fired.get(), 1);
        // The new document was cached so the restarted process starts
        // from the fresh truth.
        assert!(c.cache_path.exists());
        let _ = std::fs::remove_file(&c.cache_path);
    }

    #[tokio::test(start_paused = true)]
    async fn clock_drift_beyond_limit_is_corrected() {
        let (mut reactor, inj, link, mut c) = harness();

        // Ten seconds ahead of local time: well past the tolerance.
        let now = chrono::Local::now() + chrono::Duration::seconds(10);
        let line = format!(
            "~SYSTEM,1,{:02}:{:02}:{:02}",
            now.hour(),
            now.minute(),
            now.second()
        );
        inj.send(move |c: &mut Controller, s| {
            c.handle_link_event(s, crate::link::LinkEvent::Line(line));
        });
        exit_at(&inj, 100);
        reactor.run(&mut c).await;

        assert_eq!(link.count_matching("#SYSTEM,1,"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn accurate_clock_is_left_alone() {
        let (mut reactor, inj, link, mut c) = harness();

        let now = chrono::Local::now();
        let line = format!(
            "~SYSTEM,1,{:02}:{:02}:{:02}",
            now.hour(),
            now.minute(),
            now.second()
        );
        inj.send(move |c: &mut Controller, s| {
            c.handle_link_event(s, crate::link::LinkEvent::Line(line));
        });
        exit_at(&inj, 100);
        reactor.run(&mut c).await;

        assert_eq!(link.count_matching("#SYSTEM"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn toggle_output_flips_between_off_and_full() {
        let (mut reactor, inj, link, mut c) = harness();
        c.outputs = native_outputs();

        inj.send(|c: &mut Controller, _| {
            c.toggle_output(5);
            c.toggle_output(5);
        });
        exit_at(&inj, 100);
        reactor.run(&mut c).await;

        // Two consecutive toggles leave the output at its original
        // level.
        assert_eq!(c.outputs[&5].level, 0);
        assert_eq!(link.count_matching("#OUTPUT,5,1,100.00"), 1);
        assert_eq!(link.count_matching("#OUTPUT,5,1,0.00"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn virtual_output_ids_are_negative_and_stable() {
        let (_reactor, _inj, _link, mut c) = harness();
        let a = c.add_output("first", Rc::new(|_, _, _, _| {}));
        let b = c.add_output("second", Rc::new(|_, _, _, _| {}));
        let again = c.add_output("first", Rc::new(|_, _, _, _| {}));
        assert_eq!(a, -1);
        assert_eq!(b, -2);
        assert_eq!(again, a);
        // Every negative id indexes the table.
        assert_eq!(c.named_outputs[(-a - 1) as usize].name, "first");
    }

    #[tokio::test(start_paused = true)]
    async fn add_to_button_scales_and_validates() {
        let (_reactor, _inj, _link, mut c) = harness();
        c.devices = seetouch_keypad();
        let id = c.add_output("fixture", Rc::new(|_, _, _, _| {}));

        c.add_to_button(11, 2, id, 40, false);
        let assignments = &c.devices[&11].components[&2].assignments;
        assert_eq!(assignments.last().unwrap().level, 4000);

        // Duplicates are rejected.
        c.add_to_button(11, 2, id, 60, false);
        assert_eq!(
            c.devices[&11].components[&2]
                .assignments
                .iter()
                .filter(|a| a.output == id)
                .count(),
            1
        );

        // Relay marker passes through unscaled.
        let relay = c.add_output("relay", Rc::new(|_, _, _, _| {}));
        c.add_to_button(11, 2, relay, -1, false);
        assert_eq!(c.devices[&11].components[&2].assignments.last().unwrap().level, -1);

        // A button with native assignments cannot be coerced away from
        // its kind.
        c.devices.get_mut(&11).unwrap().components.get_mut(&2).unwrap().kind =
            ButtonKind::SingleAction;
        let other = c.add_output("other", Rc::new(|_, _, _, _| {}));
        c.add_to_button(11, 2, other, 100, true);
        assert_eq!(c.devices[&11].components[&2].kind, ButtonKind::SingleAction);

        // A raise button carries no native assignments, so it can.
        c.add_to_button(11, 18, other, 100, true);
        assert_eq!(c.devices[&11].components[&18].kind, ButtonKind::Toggle);
    }

    #[tokio::test(start_paused = true)]
    async fn synthetic_release_is_dropped_for_pressonly_keypads() {
        let (mut reactor, inj, link, mut c) = harness();
        let mut devices = seetouch_keypad();
        devices.get_mut(&11).unwrap().dim.supports_release = false;
        c.devices = devices;

        inj.send(|c: &mut Controller, _| {
            c.command("#DEVICE,11,2,4", None, None);
            c.command("#DEVICE,11,2,3", None, None);
            // Dimmer buttons always have releases.
            c.command("#DEVICE,11,18,4", None, None);
        });
        exit_at(&inj, 100);
        reactor.run(&mut c).await;

        let commands = link.commands();
        assert!(!commands.contains(&"#DEVICE,11,2,4".to_string()));
        assert!(commands.contains(&"#DEVICE,11,2,3".to_string()));
        assert!(commands.contains(&"#DEVICE,11,18,4".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_output_sees_gateway_reports() {
        let (mut reactor, inj, _link, mut c) = harness();
        c.devices = seetouch_keypad();
        c.outputs = native_outputs();
        let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let s = seen.clone();
        c.monitor_output(5, move |_, _, level| s.borrow_mut().push(level));

        line_at(&inj, 0, "~OUTPUT,5,1,25.00");
        line_at(&inj, 10, "~OUTPUT,5,1,80.00");
        exit_at(&inj, 500);
        reactor.run(&mut c).await;

        assert_eq!(*seen.borrow(), vec![2500, 8000]);
    }

    #[tokio::test(start_paused = true)]
    async fn aliased_output_tracks_gateway_and_fires_sink() {
        let (mut reactor, inj, _link, mut c) = harness();
        c.devices = seetouch_keypad();
        c.outputs = native_outputs();
        let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let s = seen.clone();
        let id = c.add_output("DMX:7", Rc::new(move |_, _, level, _| s.borrow_mut().push(level)));

        line_at(&inj, 0, "~OUTPUT,7,1,60.00");
        line_at(&inj, 10, "~OUTPUT,7,1,60.00");
        exit_at(&inj, 500);
        reactor.run(&mut c).await;

        // The alias level synced and the sink ran once; the repeat
        // report changed nothing.
        assert_eq!(c.get_current_level(id), 6000);
        assert_eq!(*seen.borrow(), vec![6000]);
    }

    #[tokio::test(start_paused = true)]
    async fn deltas_coalesce_into_one_broadcast_line() {
        let (mut reactor, inj, _link, mut c) = harness();
        c.devices = seetouch_keypad();
        c.outputs = native_outputs();
        let lines = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let l = lines.clone();
        c.on_broadcast(move |line| l.borrow_mut().push(line.to_string()));

        line_at(&inj, 0, "~OUTPUT,5,1,10.00");
        line_at(&inj, 20, "~OUTPUT,5,1,20.00");
        exit_at(&inj, 500);
        reactor.run(&mut c).await;

        // Both level changes landed inside one debounce window; the LED
        // recompute that follows produces its own line.
        let lines = lines.borrow();
        assert_eq!(lines[0], "11,2,0,1000 11,2,0,2000");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1], "11,2,1,2000");
    }
}
