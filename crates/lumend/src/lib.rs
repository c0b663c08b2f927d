//! lumend - bridge daemon between a lighting-automation main repeater
//! and non-native actuators.
//!
//! The gateway (the main repeater) owns the automation schema: keypads,
//! buttons, LEDs, and output fixtures. This daemon keeps a live mirror
//! of that schema over the gateway's telnet-style integration protocol,
//! augments it with virtual outputs (DMX fixtures, GPIO relays, command
//! forwards), and reproduces the gateway's tactile button behavior over
//! those outputs so they are indistinguishable from native loads.
//!
//! Module map, leaves first:
//! - [`reactor`]: the single-threaded cooperative scheduler everything
//!   runs on.
//! - [`discovery`], [`fetch`]: finding the gateway and downloading its
//!   schema document.
//! - [`link`]: the integration-protocol client state machine.
//! - [`schema`]: the parsed, diffable schema mirror and its cache.
//! - [`controller`] + [`dimmer`]: the policy engine and the tactile
//!   button emulation.
//! - [`snapshot`]: the UI's JSON view and delta broadcast.
//! - [`site`]: the site-description adapter and actuator seams.
//! - [`watchdog`]: process supervision and the heartbeat pipe.

pub mod controller;
pub mod dimmer;
pub mod discovery;
pub mod fetch;
pub mod link;
pub mod reactor;
pub mod schema;
pub mod site;
pub mod snapshot;
pub mod watchdog;

#[cfg(test)]
pub(crate) mod testkit;
