//! Shared fixtures for the controller behavior tests.

use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::controller::{Controller, LinkPort};
use crate::link::{CommandId, LinkEvent};
use crate::reactor::{Injector, Reactor};
use crate::schema::{
    Assignment, Component, Device, DeviceKind, Devices, LedLogic, Output, Outputs,
};

/// Recording stand-in for the gateway link. Every submitted command is
/// kept for assertions and, unless auto-completion is disabled,
/// completed with an empty result through the reactor, which is what a
/// cooperative gateway's prompt would do.
pub(crate) struct FakeLink {
    pub submitted: RefCell<Vec<(CommandId, String)>>,
    pub connected: Cell<bool>,
    pub addr: Cell<Option<SocketAddr>>,
    pub closed: Cell<u32>,
    pub init_done_calls: Cell<u32>,
    pub extended: Cell<u32>,
    pub auto_complete: Cell<bool>,
    injector: Injector<Controller>,
}

impl FakeLink {
    pub fn new(injector: Injector<Controller>) -> Rc<Self> {
        Rc::new(Self {
            submitted: RefCell::new(Vec::new()),
            connected: Cell::new(true),
            addr: Cell::new(None),
            closed: Cell::new(0),
            init_done_calls: Cell::new(0),
            extended: Cell::new(0),
            auto_complete: Cell::new(true),
            injector,
        })
    }

    /// All submitted command strings, for containment asserts.
    pub fn commands(&self) -> Vec<String> {
        self.submitted.borrow().iter().map(|(_, c)| c.clone()).collect()
    }

    pub fn count_matching(&self, prefix: &str) -> usize {
        self.submitted
            .borrow()
            .iter()
            .filter(|(_, c)| c.starts_with(prefix))
            .count()
    }
}

impl LinkPort for FakeLink {
    fn submit(&self, cmd: String, id: CommandId) {
        self.submitted.borrow_mut().push((id, cmd));
        if self.auto_complete.get() {
            self.injector.send(move |c: &mut Controller, s| {
                c.handle_link_event(
                    s,
                    LinkEvent::CommandDone {
                        id,
                        outcome: Ok(String::new()),
                    },
                );
            });
        }
    }
    fn close(&self) {
        self.closed.set(self.closed.get() + 1);
    }
    fn init_done(&self) {
        self.init_done_calls.set(self.init_done_calls.get() + 1);
    }
    fn extend_init(&self) {
        self.extended.set(self.extended.get() + 1);
    }
    fn is_connected(&self) -> bool {
        self.connected.get()
    }
    fn command_pending(&self) -> bool {
        false
    }
    fn connected_addr(&self) -> Option<SocketAddr> {
        self.addr.get()
    }
}

pub(crate) fn temp_cache() -> PathBuf {
    static SEQ: AtomicU32 = AtomicU32::new(0);
    std::env::temp_dir().join(format!(
        "lumend-test-{}-{}.xml",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    ))
}

/// Reactor, injector, fake link, and controller, wired together.
pub(crate) fn harness() -> (Reactor<Controller>, Injector<Controller>, Rc<FakeLink>, Controller) {
    let (reactor, injector) = Reactor::new();
    let link = FakeLink::new(injector.clone());
    let controller = Controller::new(link.clone(), injector.clone(), temp_cache());
    (reactor, injector, link, controller)
}

/// One SeeTouch keypad (id 11): toggle button 2 with LED 82 monitoring
/// output 5, and raise/lower buttons 18/19.
pub(crate) fn seetouch_keypad() -> Devices {
    let mut devices = Devices::new();
    let mut kp = Device::new(11, "Hallway".to_string(), DeviceKind::SeetouchKeypad);
    let mut toggle = Component::new(
        2,
        82,
        "Evening".to_string(),
        LedLogic::Monitor,
        crate::schema::ButtonKind::Toggle,
    );
    toggle.assignments.push(Assignment {
        output: 5,
        level: 7500,
    });
    kp.components.insert(2, toggle);
    kp.components.insert(
        18,
        Component::new(
            18,
            -1,
            String::new(),
            LedLogic::RaiseLower,
            crate::schema::ButtonKind::Raise,
        ),
    );
    kp.components.insert(
        19,
        Component::new(
            19,
            -1,
            String::new(),
            LedLogic::RaiseLower,
            crate::schema::ButtonKind::Lower,
        ),
    );
    devices.insert(11, kp);
    devices
}

pub(crate) fn native_outputs() -> Outputs {
    let mut outputs = Outputs::new();
    outputs.insert(5, Output::new(5, "Sconces".to_string()));
    outputs.insert(7, Output::new(7, "Accent:DMX 12".to_string()));
    outputs
}

/// Schedule a link line to arrive at a virtual-time offset.
pub(crate) fn line_at(inj: &Injector<Controller>, ms: u64, line: &'static str) {
    inj.send(move |_, s| {
        s.add_timeout(std::time::Duration::from_millis(ms), move |c, s| {
            c.handle_link_event(s, LinkEvent::Line(line.to_string()));
        });
    });
}

/// Stop the reactor at a virtual-time offset.
pub(crate) fn exit_at(inj: &Injector<Controller>, ms: u64) {
    inj.send(move |_, s| {
        s.add_timeout(std::time::Duration::from_millis(ms), |_, s| s.exit());
    });
}
