//! Gateway address resolution.
//!
//! Three strategies, selected by configuration: a directly configured
//! hostname or address, multicast discovery on the gateway's well-known
//! group, or an external helper program whose stdout names the gateway.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{lookup_host, UdpSocket};
use tracing::{debug, warn};

use lumenproto::discovery::{parse_reply, MULTICAST_ADDR, MULTICAST_PORT, PROBE};

/// Telnet-style integration port on the gateway.
pub const INTEGRATION_PORT: u16 = 23;

#[derive(Debug, Clone)]
pub enum GatewaySource {
    /// Hostname or IP address, resolved to all its addresses.
    Direct(String),
    /// Probe the multicast discovery group.
    Multicast,
    /// Run a helper program and read the gateway name from its stdout.
    Helper(PathBuf),
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("cannot resolve {name:?}: {source}")]
    Lookup {
        name: String,
        source: std::io::Error,
    },
    #[error("no gateway answered the multicast probe")]
    NoAnswer,
    #[error("multicast probe failed: {0}")]
    Probe(std::io::Error),
    #[error("helper {helper:?} failed: {reason}")]
    Helper { helper: PathBuf, reason: String },
}

/// Resolve the configured source to candidate integration-port addresses.
pub async fn resolve(
    source: &GatewaySource,
    timeout: Duration,
) -> Result<Vec<SocketAddr>, DiscoveryError> {
    match source {
        GatewaySource::Direct(name) => lookup(name).await,
        GatewaySource::Multicast => {
            let ip = multicast_probe(timeout).await?;
            Ok(vec![SocketAddr::new(IpAddr::V4(ip), INTEGRATION_PORT)])
        }
        GatewaySource::Helper(helper) => {
            let output = tokio::process::Command::new(helper)
                .output()
                .await
                .map_err(|err| DiscoveryError::Helper {
                    helper: helper.clone(),
                    reason: err.to_string(),
                })?;
            if !output.status.success() {
                return Err(DiscoveryError::Helper {
                    helper: helper.clone(),
                    reason: format!("exited with {}", output.status),
                });
            }
            let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if name.is_empty() {
                return Err(DiscoveryError::Helper {
                    helper: helper.clone(),
                    reason: "no address on stdout".to_string(),
                });
            }
            lookup(&name).await
        }
    }
}

async fn lookup(name: &str) -> Result<Vec<SocketAddr>, DiscoveryError> {
    let map_err = |source| DiscoveryError::Lookup {
        name: name.to_string(),
        source,
    };
    // A bare name gets the integration port; an explicit port (also the
    // bracketed IPv6 form) is taken as given.
    let addrs: Vec<SocketAddr> = if name.rsplit_once(':').is_some_and(|(host, port)| {
        port.bytes().all(|b| b.is_ascii_digit()) && !host.ends_with(':')
    }) {
        lookup_host(name).await.map_err(map_err)?.collect()
    } else {
        lookup_host((name, INTEGRATION_PORT))
            .await
            .map_err(map_err)?
            .collect()
    };
    debug!("{name} resolves to {addrs:?}");
    Ok(addrs)
}

/// Send `<LUTRON=1>` to the discovery group and wait for a main repeater
/// to identify itself. Re-probes every second until the deadline.
async fn multicast_probe(timeout: Duration) -> Result<Ipv4Addr, DiscoveryError> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .map_err(DiscoveryError::Probe)?;
    let group = SocketAddr::from((MULTICAST_ADDR, MULTICAST_PORT));
    let deadline = tokio::time::Instant::now() + timeout;
    let mut buf = [0u8; 512];
    loop {
        socket
            .send_to(PROBE, group)
            .await
            .map_err(DiscoveryError::Probe)?;
        let probe_deadline =
            (tokio::time::Instant::now() + Duration::from_secs(1)).min(deadline);
        loop {
            let received = tokio::select! {
                received = socket.recv_from(&mut buf) => received,
                _ = tokio::time::sleep_until(probe_deadline) => break,
            };
            let (len, from) = received.map_err(DiscoveryError::Probe)?;
            let reply = String::from_utf8_lossy(&buf[..len]);
            match parse_reply(&reply) {
                Some(ip) => {
                    debug!("main repeater {ip} announced by {from}");
                    return Ok(ip);
                }
                None => warn!("ignoring discovery reply from {from}: {reply:?}"),
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(DiscoveryError::NoAnswer);
        }
    }
}
