//! Multicast discovery reply parsing.
//!
//! A discovery probe is the literal payload `<LUTRON=1>` sent to the
//! well-known multicast group. The main repeater answers with a run of
//! quasi-XML fragments such as
//!
//! ```text
//! <LUTRON=2><PRODTYPE=MainRepeater><CODEVER=...><IPADDR=010.000.000.001>
//! ```
//!
//! Fragments are delimited by `><`, keys and values by `=`. The reply is
//! accepted only when it identifies itself as a main repeater; the
//! address value is dotted decimal, possibly zero-padded.

use std::net::Ipv4Addr;

/// Multicast group the gateway listens on.
pub const MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(224, 0, 37, 42);
/// Discovery port on the multicast group.
pub const MULTICAST_PORT: u16 = 2647;
/// Probe payload.
pub const PROBE: &[u8] = b"<LUTRON=1>";

/// Parse a discovery reply, returning the repeater address if the reply
/// is from a main repeater.
pub fn parse_reply(reply: &str) -> Option<Ipv4Addr> {
    let mut is_reply = false;
    let mut is_repeater = false;
    let mut addr = None;
    for fragment in reply.split("><") {
        let fragment = fragment.trim_matches(|c| c == '<' || c == '>');
        let Some((key, value)) = fragment.split_once('=') else {
            continue;
        };
        match key {
            "LUTRON" => is_reply = value == "2",
            "PRODTYPE" => is_repeater = value == "MainRepeater",
            "IPADDR" => addr = parse_dotted(value),
            _ => {}
        }
    }
    if is_reply && is_repeater {
        addr
    } else {
        None
    }
}

/// Dotted decimal with possible leading zeros; `Ipv4Addr::from_str`
/// rejects zero-padded octets, so parse by hand.
fn parse_dotted(value: &str) -> Option<Ipv4Addr> {
    let mut octets = [0u8; 4];
    let mut fields = value.split('.');
    for octet in &mut octets {
        let field = fields.next()?;
        if field.is_empty() || field.len() > 3 || !field.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        *octet = field.parse::<u16>().ok().filter(|v| *v <= 255)? as u8;
    }
    if fields.next().is_some() {
        return None;
    }
    Some(Ipv4Addr::from(octets))
}
