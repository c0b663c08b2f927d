//! UI snapshot and delta broadcast formatting.
//!
//! The browser UI renders keypads, not fixtures: each keypad shows its
//! engraved buttons, LED states, and a dimmer position per LED-bearing
//! button. A one-shot JSON document carries the full view; incremental
//! LED/level changes stream as debounced plain-text delta lines.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::schema::{Assignment, ButtonKind, Devices};

/// One `<kp>,<led>,<onOff>,<level>` tuple for the broadcast line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delta {
    pub keypad: i32,
    pub button: i32,
    pub on: bool,
    pub level: i32,
}

/// Space-separated broadcast line for a batch of coalesced deltas.
pub fn format_deltas(deltas: &[Delta]) -> String {
    deltas
        .iter()
        .map(|d| format!("{},{},{},{}", d.keypad, d.button, u8::from(d.on), d.level))
        .collect::<Vec<_>>()
        .join(" ")
}

/// One keypad as the UI sees it. Buttons map to their engraved label,
/// except dimmer keys, which are the booleans `true` (raise) and
/// `false` (lower) so the UI can render them as arrows.
#[derive(Debug, Serialize)]
pub struct KeypadView {
    pub id: i32,
    pub label: String,
    pub leds: BTreeMap<String, u8>,
    pub buttons: BTreeMap<String, ButtonLabel>,
    /// Dimmer position in percent per LED-bearing button.
    pub dimmers: BTreeMap<String, f64>,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(untagged)]
pub enum ButtonLabel {
    Dimmer(bool),
    Label(String),
}

/// Display labels carry inline configuration after a `:` colon; the UI
/// only gets the part before it, whitespace-trimmed.
fn display_name(name: &str) -> &str {
    let name = name.split(':').next().unwrap_or(name);
    name.trim()
}

/// Serialize the keypad view.
///
/// `order` lists preferred keypad ids first; a negative entry hides that
/// keypad. Keypads not mentioned are appended in id order. Only actual
/// keypads appear; repeaters and sensors carry phantom buttons the UI
/// has no use for.
pub fn keypads(
    devices: &Devices,
    order: &[i32],
    level_for: impl Fn(&[Assignment]) -> i32,
) -> Value {
    let mut ids: Vec<i32> = order
        .iter()
        .copied()
        .filter(|id| devices.contains_key(id))
        .collect();
    for (id, dev) in devices {
        if !dev.kind.is_keypad() {
            continue;
        }
        if !ids.contains(id) && !order.contains(&-*id) {
            ids.push(*id);
        }
    }

    let views: Vec<KeypadView> = ids
        .iter()
        .map(|id| {
            let dev = &devices[id];
            let mut view = KeypadView {
                id: dev.id,
                label: display_name(&dev.name).to_string(),
                leds: BTreeMap::new(),
                buttons: BTreeMap::new(),
                dimmers: BTreeMap::new(),
            };
            for comp in dev.components.values() {
                let key = comp.id.to_string();
                if comp.led >= 0 {
                    view.leds.insert(key.clone(), u8::from(comp.led_state));
                    let level = level_for(&comp.assignments);
                    view.dimmers.insert(key.clone(), f64::from(level) / 100.0);
                }
                let label = match comp.kind {
                    ButtonKind::Raise => ButtonLabel::Dimmer(true),
                    ButtonKind::Lower => ButtonLabel::Dimmer(false),
                    _ => ButtonLabel::Label(display_name(&comp.name).to_string()),
                };
                view.buttons.insert(key, label);
            }
            view
        })
        .collect();
    serde_json::to_value(views).expect("keypad views serialize")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Component, Device, DeviceKind, LedLogic};

    fn sample() -> Devices {
        let mut devices = Devices::new();
        let mut kp = Device::new(3, "Hall : hidden config".to_string(), DeviceKind::SeetouchKeypad);
        let mut evening = Component::new(
            2,
            82,
            "Evening".to_string(),
            LedLogic::Monitor,
            ButtonKind::Toggle,
        );
        evening.assignments.push(Assignment {
            output: 5,
            level: 7500,
        });
        evening.led_state = true;
        kp.components.insert(2, evening);
        kp.components.insert(
            18,
            Component::new(18, -1, String::new(), LedLogic::RaiseLower, ButtonKind::Raise),
        );
        kp.components.insert(
            19,
            Component::new(19, -1, String::new(), LedLogic::RaiseLower, ButtonKind::Lower),
        );
        devices.insert(3, kp);

        let mut pico = Device::new(7, "Remote".to_string(), DeviceKind::PicoKeypad);
        pico.components.insert(
            1,
            Component::new(1, -1, "On".to_string(), LedLogic::Unknown, ButtonKind::SingleAction),
        );
        devices.insert(7, pico);

        let repeater = Device::new(1, "Repeater".to_string(), DeviceKind::MainRepeater);
        devices.insert(1, repeater);
        devices
    }

    #[test]
    fn renders_keypads_with_leds_buttons_and_dimmers() {
        let devices = sample();
        let value = keypads(&devices, &[], |_| 4550);
        let list = value.as_array().unwrap();
        // The repeater is not a keypad and is omitted.
        assert_eq!(list.len(), 2);

        let hall = &list[0];
        assert_eq!(hall["id"], 3);
        // Inline configuration after the colon is stripped and trimmed.
        assert_eq!(hall["label"], "Hall");
        assert_eq!(hall["leds"]["2"], 1);
        assert_eq!(hall["buttons"]["2"], "Evening");
        assert_eq!(hall["buttons"]["18"], true);
        assert_eq!(hall["buttons"]["19"], false);
        assert_eq!(hall["dimmers"]["2"], 45.5);

        assert_eq!(list[1]["id"], 7);
    }

    #[test]
    fn order_controls_sequence_and_hides() {
        let devices = sample();
        let value = keypads(&devices, &[7], |_| 0);
        let list = value.as_array().unwrap();
        assert_eq!(list[0]["id"], 7);
        assert_eq!(list[1]["id"], 3);

        let value = keypads(&devices, &[-7], |_| 0);
        let list = value.as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["id"], 3);
    }

    #[test]
    fn formats_delta_lines() {
        let deltas = [
            Delta {
                keypad: 3,
                button: 2,
                on: true,
                level: 4550,
            },
            Delta {
                keypad: 7,
                button: 1,
                on: false,
                level: 0,
            },
        ];
        assert_eq!(format_deltas(&deltas), "3,2,1,4550 7,1,0,0");
        assert_eq!(format_deltas(&[]), "");
    }
}
