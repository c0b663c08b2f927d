//! Wire-level protocol for the lighting gateway's telnet-style
//! integration port.
//!
//! The gateway speaks a line-oriented, CRLF-terminated dialogue with three
//! prompts (`GNET> `, `login: `, `password: `). Outbound commands are
//! either queries (`?...`) that produce a `~...` reply line, or actions
//! (`#...`) that produce nothing but the next prompt. Unsolicited status
//! updates also arrive as `~...` lines at any time.
//!
//! This crate holds everything that can be expressed without I/O: the
//! fixed-point level representation, the line scanner that recognizes
//! prompts embedded in the byte stream, line classification, command
//! builders, reply-head matching, and the multicast discovery reply
//! parser. The daemon crate owns the sockets.

pub mod discovery;
pub mod level;
pub mod line;

pub use level::{clamp_level, format_level, parse_level, LEVEL_MAX};
pub use line::{
    matches_reply, query_head, LineScanner, Update, CRLF, LOGIN_PROMPT, PASSWORD_PROMPT, PROMPT,
};

/// Actions carried in `#DEVICE`/`~DEVICE` and `#OUTPUT`/`~OUTPUT` lines.
///
/// The wire protocol reuses several numeric codes depending on context;
/// the duplicate names are intentional and nothing may rely on the values
/// being distinct.
pub mod action {
    pub const ENABLE: u32 = 1;
    pub const DISABLE: u32 = 2;
    pub const PRESS: u32 = 3;
    pub const RELEASE: u32 = 4;
    pub const HOLD: u32 = 5;
    pub const DOUBLE_TAP: u32 = 6;
    pub const SCENE: u32 = 7;
    pub const LED_STATE: u32 = 9;
    pub const LIFT_TILT_LEVEL: u32 = 10;
    pub const START_RAISE_TILT: u32 = 11;
    pub const START_LOWER_TILT: u32 = 12;
    pub const STOP_TILT: u32 = 13;
    pub const START_RAISE_LIFT: u32 = 14;
    pub const START_LOWER_LIFT: u32 = 15;
    pub const STOP_LIFT: u32 = 16;
    pub const LIGHT_LEVEL: u32 = 14;
    pub const ZONE_LOCK: u32 = 15;
    pub const SCENE_LOCK: u32 = 16;
    pub const SEQUENCE: u32 = 17;
    pub const START_RAISE: u32 = 18;
    pub const START_LOWER: u32 = 19;
    pub const STOP_RAISE_LOWER: u32 = 20;
    pub const BATTERY_STATUS: u32 = 22;
    pub const HOLD_RELEASE: u32 = 32;
    pub const TIMECLOCK: u32 = 34;
    pub const CCI_STATE: u32 = 35;
    pub const ACTIVE_LED: u32 = 36;
    pub const INACTIVE_LED: u32 = 37;
}

/// Event categories accepted by `#MONITORING,<type>,1`.
pub mod monitor {
    pub const DIAGNOSTICS: u32 = 1;
    pub const EVENT: u32 = 2;
    pub const BUTTON: u32 = 3;
    pub const LED: u32 = 4;
    pub const ZONE: u32 = 5;
    pub const OCCUPANCY: u32 = 6;
    pub const PHOTOSENSOR: u32 = 7;
    pub const SCENE: u32 = 8;
    pub const SYSVAR: u32 = 10;
    pub const OCCUPANCY_GROUP: u32 = 13;
    pub const HVAC: u32 = 17;
    pub const SHADE_GROUP: u32 = 23;
    pub const TEMPERATURE: u32 = 27;
    pub const ALL: u32 = 255;
}

/// Builders for the outbound command shapes the daemon uses.
pub mod cmd {
    use crate::level::format_level;

    /// `#MONITORING,<type>,1` - subscribe to an event category.
    pub fn monitoring(kind: u32) -> String {
        format!("#MONITORING,{kind},1")
    }

    /// `?SYSTEM,1` - time-of-day query.
    pub fn query_time() -> String {
        "?SYSTEM,1".to_string()
    }

    /// `#SYSTEM,1,HH:MM:SS` - set the gateway clock.
    pub fn set_clock(h: u32, m: u32, s: u32) -> String {
        format!("#SYSTEM,1,{h:02}:{m:02}:{s:02}")
    }

    /// `?OUTPUT,<id>,1` - dimmer level query.
    pub fn query_output(id: i32) -> String {
        format!("?OUTPUT,{id},1")
    }

    /// `#OUTPUT,<id>,1,<LL.DD>` - set a fixture level.
    pub fn set_output(id: i32, level: i32) -> String {
        format!("#OUTPUT,{id},1,{}", format_level(level))
    }

    /// `?DEVICE,<dev>,<comp>,9` - LED state query.
    pub fn query_led(device: i32, component: i32) -> String {
        format!("?DEVICE,{device},{component},{}", crate::action::LED_STATE)
    }

    /// `#DEVICE,<dev>,<comp>,9,<0|1>` - set an LED.
    pub fn set_led(device: i32, component: i32, on: bool) -> String {
        format!(
            "#DEVICE,{device},{component},{},{}",
            crate::action::LED_STATE,
            u8::from(on)
        )
    }

    /// `#DEVICE,<kp>,<bt>,3` - synthesize a button press.
    pub fn press(device: i32, component: i32) -> String {
        format!("#DEVICE,{device},{component},{}", crate::action::PRESS)
    }

    /// `#DEVICE,<kp>,<bt>,4` - synthesize a button release.
    pub fn release(device: i32, component: i32) -> String {
        format!("#DEVICE,{device},{component},{}", crate::action::RELEASE)
    }
}
