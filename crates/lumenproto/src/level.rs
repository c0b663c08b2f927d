//! Fixed-point dimmer levels.
//!
//! The gateway reports and accepts levels as a percentage with two decimal
//! digits (`75.50`). Storing that as a float invites rounding drift when
//! values round-trip through comparisons, so levels are fixed-point
//! integers in `0..=10000` representing `0.00..=100.00` percent.

/// Largest representable level, 100.00%.
pub const LEVEL_MAX: i32 = 10_000;

/// Clamp a level into the representable range.
pub fn clamp_level(level: i32) -> i32 {
    level.clamp(0, LEVEL_MAX)
}

/// Parse a `LL.DD` percentage into a fixed-point level.
///
/// Accepts a bare integer (`"50"` → 5000), one decimal digit (`"50.5"` →
/// 5050), or two (`"50.55"` → 5055); further digits are ignored.
/// Out-of-range inputs clamp to the nearest bound. Leading garbage parses
/// as zero, matching the forgiving gateway-side behavior.
pub fn parse_level(text: &str) -> i32 {
    let bytes = text.as_bytes();
    let mut idx = 0;
    let neg = bytes.first() == Some(&b'-');
    if neg {
        idx = 1;
    }
    let mut whole: i64 = 0;
    while idx < bytes.len() && bytes[idx].is_ascii_digit() {
        whole = whole * 10 + i64::from(bytes[idx] - b'0');
        idx += 1;
        if whole > i64::from(i32::MAX) {
            break;
        }
    }
    let mut level = whole.saturating_mul(100);
    if idx < bytes.len() && bytes[idx] == b'.' {
        if let Some(d) = bytes.get(idx + 1).filter(|b| b.is_ascii_digit()) {
            level += i64::from(d - b'0') * 10;
            if let Some(d) = bytes.get(idx + 2).filter(|b| b.is_ascii_digit()) {
                level += i64::from(d - b'0');
            }
        }
    }
    if neg {
        level = -level;
    }
    clamp_level(level.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32)
}

/// Render a fixed-point level as the `LL.DD` text the gateway expects.
pub fn format_level(level: i32) -> String {
    let level = clamp_level(level);
    format!("{}.{:02}", level / 100, level % 100)
}
