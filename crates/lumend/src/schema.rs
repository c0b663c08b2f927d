//! Parsed, diffable mirror of the gateway's automation schema.
//!
//! The gateway's configuration database is a large XML document. Only a
//! small slice of it matters here: keypads with their buttons, LEDs and
//! preset assignments, and the addressable outputs. The extracted form
//! is plain data keyed by integration id; the controller owns it and
//! replaces it wholesale when the gateway's copy changes.
//!
//! Equality is deliberately looser than `==`: the daemon augments the
//! extracted schema with virtual assignments (negative output ids) and
//! may coerce a button to `Toggle`, and a freshly extracted document must
//! still compare equal to the augmented in-memory copy. See
//! [`Device::same_schema`].

use std::collections::BTreeMap;
use std::path::Path;

use thiserror::Error;
use tracing::{debug, warn};

use lumenproto::parse_level;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("schema XML is malformed: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("cannot access schema cache {path}: {source}")]
    Cache {
        path: String,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    PicoKeypad,
    SeetouchKeypad,
    HybridSeetouchKeypad,
    MotionSensor,
    MainRepeater,
    Unknown,
}

impl DeviceKind {
    fn from_schema(name: &str) -> Self {
        match name {
            "PICO_KEYPAD" => Self::PicoKeypad,
            "SEETOUCH_KEYPAD" => Self::SeetouchKeypad,
            "HYBRID_SEETOUCH_KEYPAD" => Self::HybridSeetouchKeypad,
            "MOTION_SENSOR" => Self::MotionSensor,
            "MAIN_REPEATER" => Self::MainRepeater,
            _ => Self::Unknown,
        }
    }

    /// Keypads the UI shows and the LED logic applies to.
    pub fn is_keypad(self) -> bool {
        matches!(
            self,
            Self::PicoKeypad | Self::SeetouchKeypad | Self::HybridSeetouchKeypad
        )
    }

    /// The wired keypad families with controllable LEDs.
    pub fn is_seetouch(self) -> bool {
        matches!(self, Self::SeetouchKeypad | Self::HybridSeetouchKeypad)
    }
}

/// How a button's LED derives its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedLogic {
    Unknown,
    /// On when at least one assigned output is at any level.
    Monitor,
    /// On when all assigned outputs are at their exact programmed level.
    Scene,
    /// Dimmer buttons; the LED does not track output state.
    RaiseLower,
    /// On while the programmed shades are moving.
    ShadeToggle,
}

impl LedLogic {
    fn from_code(code: i32) -> Self {
        match code {
            1 => Self::Monitor,
            2 => Self::Scene,
            4 => Self::RaiseLower,
            11 => Self::ShadeToggle,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonKind {
    Unknown,
    Toggle,
    AdvancedToggle,
    SingleAction,
    Lower,
    Raise,
}

impl ButtonKind {
    fn from_schema(kind: &str, direction: &str) -> Self {
        match kind {
            "Toggle" => Self::Toggle,
            "AdvancedToggle" => Self::AdvancedToggle,
            "SingleAction" => Self::SingleAction,
            // Pico raise/lower buttons activate predefined scenes; they
            // behave like scene buttons, not like master dimmer keys.
            "SingleSceneRaiseLower" => Self::SingleAction,
            // One schema button type covers both master dimmer keys; the
            // direction attribute tells them apart.
            "MasterRaiseLower" if direction == "Raise" => Self::Raise,
            "MasterRaiseLower" => Self::Lower,
            _ => Self::Unknown,
        }
    }

    pub fn is_dimmer(self) -> bool {
        matches!(self, Self::Lower | Self::Raise)
    }

    pub fn is_actionable(self) -> bool {
        matches!(self, Self::Toggle | Self::AdvancedToggle | Self::SingleAction)
    }
}

/// A (output, level) pair attached to a button. Negative output ids name
/// daemon-local virtual outputs; a level of `-1` marks a non-dimmable
/// actuator that is pulsed rather than set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub output: i32,
    pub level: i32,
}

/// A button, with its associated LED when one exists.
#[derive(Debug, Clone)]
pub struct Component {
    pub id: i32,
    /// Component number of the associated LED, or -1.
    pub led: i32,
    pub name: String,
    pub logic: LedLogic,
    pub kind: ButtonKind,
    pub assignments: Vec<Assignment>,
    pub led_state: bool,
    /// The last reported LED state was neither 0 nor 1. No UI
    /// notification goes out for this LED until a definitive state
    /// arrives.
    pub uncertain: bool,
}

impl Component {
    pub fn new(id: i32, led: i32, name: String, logic: LedLogic, kind: ButtonKind) -> Self {
        Self {
            id,
            led,
            name,
            logic,
            kind,
            assignments: Vec::new(),
            led_state: false,
            uncertain: false,
        }
    }

    /// Equality-significant comparison: daemon-injected virtual
    /// assignments are ignored, and a `Toggle` button with no native
    /// assignments matches any kind (augmentation may have coerced it).
    pub fn same_schema(&self, other: &Self) -> bool {
        if self.id != other.id
            || self.led != other.led
            || self.logic != other.logic
            || self.name != other.name
        {
            return false;
        }
        let native = |c: &Self| -> Vec<Assignment> {
            c.assignments.iter().copied().filter(|a| a.output >= 0).collect()
        };
        let a = native(self);
        let b = native(other);
        (self.kind == other.kind
            || (a.is_empty() && self.kind == ButtonKind::Toggle)
            || (b.is_empty() && other.kind == ButtonKind::Toggle))
            && a == b
    }
}

/// Ephemeral per-keypad state for the dim emulation and tap tracking.
/// All timestamps are monotonic milliseconds; zero means "never".
#[derive(Debug, Clone, Default)]
pub struct DimState {
    pub last_button: i32,
    /// -1 lowering, 0 idle, +1 raising.
    pub dim_direction: i32,
    pub start_of_dim: u64,
    pub first_tap: u64,
    pub num_taps: u32,
    /// Monotonic ms of the last release event, 0 if none.
    pub released: u64,
    /// Output id → level at press time, while a raise/lower is active.
    pub starting_levels: BTreeMap<i32, i32>,
    /// Toggle memory.
    pub on: bool,
    pub supports_release: bool,
}

impl DimState {
    pub fn new() -> Self {
        Self {
            last_button: -1,
            ..Self::default()
        }
    }
}

/// One addressable keypad, remote, or repeater.
#[derive(Debug, Clone)]
pub struct Device {
    pub id: i32,
    pub name: String,
    pub kind: DeviceKind,
    pub components: BTreeMap<i32, Component>,
    pub dim: DimState,
}

impl Device {
    pub fn new(id: i32, name: String, kind: DeviceKind) -> Self {
        Self {
            id,
            name,
            kind,
            components: BTreeMap::new(),
            dim: DimState::new(),
        }
    }

    pub fn same_schema(&self, other: &Self) -> bool {
        self.id == other.id
            && self.kind == other.kind
            && self.name == other.name
            && self.components.len() == other.components.len()
            && self
                .components
                .iter()
                .zip(other.components.iter())
                .all(|((ak, av), (bk, bv))| ak == bk && av.same_schema(bv))
    }
}

/// A gateway-native fixture. The name may embed inline configuration
/// after a `:` colon; such outputs are "dummy" fixtures that the daemon
/// dims on the gateway's behalf.
#[derive(Debug, Clone)]
pub struct Output {
    pub id: i32,
    pub name: String,
    /// Cache of the gateway's authoritative level, except while a
    /// raise/lower emulation is in progress for this id.
    pub level: i32,
}

impl Output {
    pub fn new(id: i32, name: String) -> Self {
        Self { id, name, level: 0 }
    }

    /// The daemon dims this output itself when its name carries inline
    /// configuration.
    pub fn is_inline_dummy(&self) -> bool {
        self.name.contains(':')
    }

    pub fn same_schema(&self, other: &Self) -> bool {
        self.id == other.id && self.name == other.name
    }
}

/// A daemon-local virtual output. Ids are negative: index `-id - 1`
/// into the controller's table.
pub struct NamedOutput<Sink> {
    pub name: String,
    pub level: i32,
    pub sink: Sink,
}

/// The two extracted maps.
pub type Devices = BTreeMap<i32, Device>;
pub type Outputs = BTreeMap<i32, Output>;

pub fn same_schema(a: &(Devices, Outputs), b: &(Devices, Outputs)) -> bool {
    a.0.len() == b.0.len()
        && a.1.len() == b.1.len()
        && a.0
            .iter()
            .zip(b.0.iter())
            .all(|((ak, av), (bk, bv))| ak == bk && av.same_schema(bv))
        && a.1
            .iter()
            .zip(b.1.iter())
            .all(|((ak, av), (bk, bv))| ak == bk && av.same_schema(bv))
}

/// Extract devices and outputs from the schema document.
///
/// Per device: id, name, kind. Per button: its component number, the
/// associated LED's component number (linked through the shared
/// `ProgrammingModelID`), engraving, LED logic code, button kind, and the
/// integration-id/level preset assignments of assignment type 2.
pub fn extract(text: &str) -> Result<(Devices, Outputs), SchemaError> {
    let doc = roxmltree::Document::parse(text)?;

    // LEDs live in their own sections; index them by programming model
    // so each button can find its LED's component number.
    let mut leds: BTreeMap<&str, i32> = BTreeMap::new();
    for led in doc.descendants().filter(|n| n.has_tag_name("LED")) {
        if let Some(model) = led.attribute("ProgrammingModelID") {
            let number = led
                .parent_element()
                .and_then(|p| p.attribute("ComponentNumber"))
                .and_then(|v| v.parse().ok())
                .unwrap_or(-1);
            leds.insert(model, number);
        }
    }

    let mut devices = Devices::new();
    for node in doc.descendants().filter(|n| n.has_tag_name("Device")) {
        let id = match node.attribute("IntegrationID").and_then(|v| v.parse().ok()) {
            Some(id) => id,
            None => continue,
        };
        let mut device = Device::new(
            id,
            node.attribute("Name").unwrap_or_default().to_string(),
            DeviceKind::from_schema(node.attribute("DeviceType").unwrap_or_default()),
        );
        for button in node.descendants().filter(|n| n.has_tag_name("Button")) {
            let number = button
                .parent_element()
                .and_then(|p| p.attribute("ComponentNumber"))
                .and_then(|v| v.parse().ok())
                .unwrap_or(-1);
            let led = button
                .attribute("ProgrammingModelID")
                .and_then(|model| leds.get(model))
                .copied()
                .unwrap_or(-1);
            let mut component = Component::new(
                number,
                led,
                button.attribute("Engraving").unwrap_or_default().to_string(),
                LedLogic::from_code(
                    button
                        .attribute("LedLogic")
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0),
                ),
                ButtonKind::from_schema(
                    button.attribute("ButtonType").unwrap_or_default(),
                    button.attribute("Direction").unwrap_or_default(),
                ),
            );
            for assignment in button
                .descendants()
                .filter(|n| n.has_tag_name("PresetAssignment"))
                .filter(|n| n.attribute("AssignmentType") == Some("2"))
            {
                let child_text = |name: &str| {
                    assignment
                        .children()
                        .find(|c| c.has_tag_name(name))
                        .and_then(|c| c.text())
                        .unwrap_or_default()
                };
                component.assignments.push(Assignment {
                    output: child_text("IntegrationID").trim().parse().unwrap_or(0),
                    level: parse_level(child_text("Level").trim()),
                });
            }
            device.components.insert(component.id, component);
        }
        devices.insert(device.id, device);
    }

    let mut outputs = Outputs::new();
    for node in doc.descendants().filter(|n| n.has_tag_name("Output")) {
        let id = match node.attribute("IntegrationID").and_then(|v| v.parse().ok()) {
            Some(id) => id,
            None => continue,
        };
        outputs.insert(
            id,
            Output::new(id, node.attribute("Name").unwrap_or_default().to_string()),
        );
    }

    debug!(
        "extracted {} devices and {} outputs from schema",
        devices.len(),
        outputs.len()
    );
    Ok((devices, outputs))
}

/// Load the cached schema document, if any. A missing or unreadable
/// cache is a cold start, not an error.
pub fn load_cache(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => Some(text),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
        Err(err) => {
            warn!("cannot read schema cache {}: {err}", path.display());
            None
        }
    }
}

/// Persist the schema document for the next warm start.
pub fn save_cache(path: &Path, text: &str) -> Result<(), SchemaError> {
    std::fs::write(path, text).map_err(|source| SchemaError::Cache {
        path: path.display().to_string(),
        source,
    })
}
