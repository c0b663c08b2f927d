//! Site-description adapter.
//!
//! Out of the box the daemon changes nothing about the gateway's
//! behavior. A site description teaches it policy: which DMX fixtures
//! hide behind which gateway dummy outputs, which keypad buttons gain
//! virtual assignments, which buttons pulse relays or forward presses to
//! other keypads. The document is a polymorphic JSON tree; this module
//! is the only place that reads it, converting each rule into typed
//! calls on the controller's extension API. Invalid rules are logged and
//! skipped; the rest of the augmentation proceeds.

use std::rc::Rc;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use lumenproto::cmd;

use crate::controller::{Controller, Sched, DMX_ALIAS, GW_ALIAS};

#[derive(Debug, Error)]
pub enum SiteError {
    #[error("cannot read site description {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("site description {path} is not valid JSON: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}

/// DMX channel sink. The serial framer lives outside the daemon; this
/// is its seam.
pub trait DmxBus {
    fn set(&self, channel: u16, value: u8);
}

/// GPIO relay sink and condition input. The line driver lives outside
/// the daemon.
pub trait RelayBank {
    fn toggle(&self, pin: i32);
    fn get(&self, pin: i32) -> bool;
}

/// Default sinks that only log; used until a real driver is attached.
pub struct LogDmxBus;

impl DmxBus for LogDmxBus {
    fn set(&self, channel: u16, value: u8) {
        debug!("dmx[{channel}] = {value}");
    }
}

pub struct LogRelayBank;

impl RelayBank for LogRelayBank {
    fn toggle(&self, pin: i32) {
        debug!("relay[{pin}] toggled");
    }
    fn get(&self, _pin: i32) -> bool {
        true
    }
}

/// A DMX fixture definition: channels with per-channel gamma and a low
/// trim, optionally fronted by a gateway dummy output.
#[derive(Debug, Clone, PartialEq)]
pub struct DmxFixture {
    /// Integration id of the gateway dummy output shadowing this
    /// fixture, if any.
    pub dummy_id: Option<i32>,
    pub channels: Vec<u16>,
    pub curve: Vec<f64>,
    pub trim: f64,
}

impl DmxFixture {
    /// Parse `[dummyId?, [channels...], [curve...]?, trim?]`.
    pub fn parse(value: &Value) -> Option<Self> {
        let parts = value.as_array()?;
        let offset = usize::from(parts.first().is_some_and(Value::is_number));
        let channels: Vec<u16> = parts
            .get(offset)?
            .as_array()?
            .iter()
            .filter_map(|v| v.as_i64())
            .filter(|&id| id > 0 && id <= 512)
            .map(|id| id as u16)
            .collect();
        Some(Self {
            dummy_id: if offset == 1 {
                parts[0].as_i64().map(|v| v as i32)
            } else {
                None
            },
            channels,
            curve: parts
                .get(offset + 1)
                .and_then(Value::as_array)
                .map(|c| c.iter().map(|v| v.as_f64().unwrap_or(1.0)).collect())
                .unwrap_or_default(),
            trim: parts.get(offset + 2).and_then(Value::as_f64).unwrap_or(0.0),
        })
    }

    /// Drive the fixture: apply trim and the per-channel gamma curve,
    /// then write 8-bit channel values.
    pub fn apply(&self, dmx: &dyn DmxBus, level: i32) {
        for (i, &channel) in self.channels.iter().enumerate() {
            let exp = self.curve.get(i).copied().unwrap_or(1.0);
            let t = self.trim;
            let scaled = (f64::from(level) * (100.0 - t) / 100.0 + t) / 10_000.0;
            let value = (scaled.clamp(0.0, 1.0).powf(exp) * 255.0) as u8;
            dmx.set(channel, value);
        }
    }
}

/// Load and parse a site description file.
pub fn load(path: &std::path::Path) -> Result<Value, SiteError> {
    let text = std::fs::read_to_string(path).map_err(|source| SiteError::Read {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| SiteError::Parse {
        path: path.display().to_string(),
        source,
    })
}

/// Wire the site description onto the controller. Runs inside the
/// controller's on-init hook, once the first schema is live.
pub fn apply(
    site: &Value,
    c: &mut Controller,
    _sched: &mut Sched,
    dmx: Rc<dyn DmxBus>,
    relay: Rc<dyn RelayBank>,
) {
    // DMX fixtures fronted by a gateway dummy output: alias them so the
    // gateway's reports drive the DMX load.
    if let Some(fixtures) = site.get("DMX").and_then(Value::as_object) {
        for (name, value) in fixtures {
            let Some(fixture) = DmxFixture::parse(value) else {
                warn!("cannot parse DMX fixture {name:?}");
                continue;
            };
            let Some(dummy_id) = fixture.dummy_id else {
                continue;
            };
            let dmx = dmx.clone();
            c.add_output(
                &format!("{DMX_ALIAS}{dummy_id}"),
                Rc::new(move |_, _, level, _| fixture.apply(&*dmx, level)),
            );
        }
    }

    let Some(keypads) = site.get("KEYPAD").and_then(Value::as_object) else {
        return;
    };
    for (kp, buttons) in keypads {
        let Ok(kp) = kp.parse::<i32>() else {
            warn!("keypad key {kp:?} is not an integration id");
            continue;
        };
        let Some(buttons) = buttons.as_object() else {
            continue;
        };
        for (bt, rules) in buttons {
            let Ok(bt) = bt.parse::<i32>() else {
                warn!("button key {bt:?} is not a component number");
                continue;
            };
            let Some(rules) = rules.as_object() else {
                continue;
            };
            for (rule_kind, rule) in rules {
                match rule_kind.as_str() {
                    "DMX" => apply_dmx_rule(site, c, kp, bt, rule, &dmx),
                    "TOGGLE" => apply_toggle_rule(c, kp, bt, rule),
                    "DEVICE" => apply_device_rule(c, kp, bt, rule),
                    "RELAY" => apply_relay_rule(site, c, kp, bt, rule, &relay),
                    other => warn!("unknown rule type {other:?} on {kp}/{bt}"),
                }
            }
        }
    }
}

/// Attach named DMX fixtures to a button at given levels. This is the
/// fundamental feature: DMX loads behave exactly like native outputs.
fn apply_dmx_rule(
    site: &Value,
    c: &mut Controller,
    kp: i32,
    bt: i32,
    rule: &Value,
    dmx: &Rc<dyn DmxBus>,
) {
    let Some(rule) = rule.as_object() else {
        warn!("DMX rule on {kp}/{bt} is not an object");
        return;
    };
    for (output, level) in rule {
        let Some(fixture) = site
            .get("DMX")
            .and_then(|f| f.get(output))
            .and_then(DmxFixture::parse)
        else {
            warn!("cannot find DMX fixture {output:?}");
            continue;
        };
        let Some(level) = level.as_i64() else {
            warn!("DMX level for {output:?} on {kp}/{bt} is not a number");
            continue;
        };
        let dmx = dmx.clone();
        let id = c.add_output(
            output,
            Rc::new(move |_, _, level, _| fixture.apply(&*dmx, level)),
        );
        c.add_to_button(kp, bt, id, level as i32, false);
    }
}

/// Force a button to act as a toggle over native outputs by aliasing
/// them; used for remotes whose buttons the gateway only allows to
/// recall scenes.
fn apply_toggle_rule(c: &mut Controller, kp: i32, bt: i32, rule: &Value) {
    let Some(outputs) = rule.as_array() else {
        warn!("TOGGLE rule on {kp}/{bt} is not an array");
        return;
    };
    for out in outputs {
        let Some(out) = out.as_i64().map(|v| v as i32) else {
            warn!("TOGGLE entry on {kp}/{bt} is not an output id");
            continue;
        };
        let id = c.add_output(
            &format!("{GW_ALIAS}{out}"),
            Rc::new(move |c, _, level, _| {
                c.command(&cmd::set_output(out, level), None, None);
            }),
        );
        c.add_to_button(kp, bt, id, 100, true);
    }
}

/// Forward a button press to a button on another keypad.
fn apply_device_rule(c: &mut Controller, kp: i32, bt: i32, rule: &Value) {
    let target = rule.as_array().and_then(|r| {
        Some((
            r.first()?.as_i64()? as i32,
            r.get(1)?.as_i64()? as i32,
        ))
    });
    let Some((other_kp, other_bt)) = target else {
        warn!("cannot parse DEVICE rule on {kp}/{bt}");
        return;
    };
    let id = c.add_output(
        &format!("DEV:{other_kp}/{other_bt}"),
        Rc::new(move |c, _, _, _| {
            c.command(&cmd::press(other_kp, other_bt), None, None);
            c.command(&cmd::release(other_kp, other_bt), None, None);
        }),
    );
    c.add_to_button(kp, bt, id, 0, false);
}

/// Pulse a relay pin, optionally gated on a condition input. Both the
/// rule and the global pin definition may invert the condition with a
/// leading `!`.
fn apply_relay_rule(
    site: &Value,
    c: &mut Controller,
    kp: i32,
    bt: i32,
    rule: &Value,
    relay: &Rc<dyn RelayBank>,
) {
    let parsed = rule.as_array().and_then(|r| {
        Some((r.first()?.as_str()?.to_string(), r.get(1)?.as_str()?.to_string()))
    });
    let Some((mut cond, action)) = parsed else {
        warn!("cannot parse GPIO rule on {kp}/{bt}");
        return;
    };
    let mut sense = !cond.starts_with('!');
    if !sense {
        cond.remove(0);
    }
    let gpio = site.get("GPIO").and_then(Value::as_object);
    let mut cond_pin = -1;
    if !cond.is_empty() {
        let Some(gpio) = gpio else {
            warn!("GPIO rule on {kp}/{bt} without a GPIO section");
            return;
        };
        for (key, pin) in gpio {
            let (inverted, name) = match key.strip_prefix('!') {
                Some(name) => (true, name),
                None => (false, key.as_str()),
            };
            if name == cond {
                cond_pin = pin.as_i64().unwrap_or(-1) as i32;
                sense ^= inverted;
                break;
            }
        }
    }
    let action_pin = gpio
        .and_then(|g| g.get(&action))
        .and_then(Value::as_i64)
        .map(|v| v as i32);
    let Some(action_pin) = action_pin else {
        warn!("cannot parse GPIO rule on {kp}/{bt}: no action pin {action:?}");
        return;
    };
    if !cond.is_empty() && cond_pin < 0 {
        warn!("cannot parse GPIO rule on {kp}/{bt}: no condition pin {cond:?}");
        return;
    }
    let relay = relay.clone();
    let id = c.add_output(
        &format!("RELAY:{cond_pin}/{action_pin}"),
        Rc::new(move |_, _, _, _| {
            if cond_pin < 0 || relay.get(cond_pin) == sense {
                relay.toggle(action_pin);
            }
        }),
    );
    c.add_to_button(kp, bt, id, 0, false);
}
