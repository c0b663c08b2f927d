//! Process supervision.
//!
//! The daemon's resilience story ends at the process boundary: a hung
//! event loop or a schema change both require a restart. A supervising
//! parent (`lumend supervise`) respawns the daemon child and watches a
//! one-byte heartbeat protocol on the child's stdout (logs go to
//! stderr): `0x00` means "still alive", `0x01` means "restart me".
//! Silence beyond the watchdog timeout gets the child killed and
//! restarted.

use std::cell::Cell;
use std::io::Write;
use std::process::Stdio;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::time::Instant;
use tracing::{info, warn};

/// Child is healthy.
pub const HEARTBEAT: u8 = 0x00;
/// Child wants to be restarted (the automation schema changed under it).
pub const RESTART_REQUEST: u8 = 0x01;
/// Heartbeat silence tolerated before the child is presumed hung.
pub const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(120);
/// Pause between a death and the respawn, to avoid a crash loop spin.
const RESPAWN_DELAY: Duration = Duration::from_secs(1);
/// Heartbeats are pulsed per received line; writing every one of them
/// would be syscall noise. One per second is plenty for a 120 s watchdog.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Child-side heartbeat writer. Inert unless the daemon runs supervised.
#[derive(Clone)]
pub struct Heartbeat {
    inner: Option<Rc<Cell<Instant>>>,
}

impl Heartbeat {
    pub fn new(supervised: bool) -> Self {
        Self {
            inner: supervised.then(|| Rc::new(Cell::new(Instant::now() - HEARTBEAT_INTERVAL))),
        }
    }

    /// Emit a throttled heartbeat byte. Write failures are ignored: if
    /// the supervisor is gone, its watchdog no longer matters.
    pub fn pulse(&self) {
        let Some(last) = &self.inner else {
            return;
        };
        let now = Instant::now();
        if now.duration_since(last.get()) < HEARTBEAT_INTERVAL {
            return;
        }
        last.set(now);
        let mut out = std::io::stdout();
        let _ = out.write_all(&[HEARTBEAT]);
        let _ = out.flush();
    }

    /// Ask the supervisor for a restart. The caller exits right after.
    pub fn request_restart(&self) {
        if self.inner.is_none() {
            return;
        }
        let mut out = std::io::stdout();
        let _ = out.write_all(&[RESTART_REQUEST]);
        let _ = out.flush();
    }
}

/// Supervisor loop: spawn the daemon child with the given arguments and
/// keep it alive. Returns the process exit code to use.
pub async fn supervise(child_args: Vec<String>) -> Result<i32> {
    let exe = std::env::current_exe().context("cannot locate own executable")?;
    loop {
        info!("starting daemon child");
        let mut child = tokio::process::Command::new(&exe)
            .args(&child_args)
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("cannot spawn daemon child")?;
        let mut stdout = child.stdout.take().context("child has no stdout")?;

        let mut restart_requested = false;
        let mut killed = false;
        let mut buf = [0u8; 64];
        loop {
            let read = tokio::time::timeout(WATCHDOG_TIMEOUT, stdout.read(&mut buf)).await;
            match read {
                Err(_) => {
                    warn!("heartbeat silence; killing daemon child");
                    let _ = child.start_kill();
                    killed = true;
                    break;
                }
                Ok(Err(_)) | Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    if buf[..n].contains(&RESTART_REQUEST) {
                        info!("daemon child requested a restart");
                        restart_requested = true;
                        let _ = child.start_kill();
                        killed = true;
                        break;
                    }
                    // Anything else on the pipe is a heartbeat; reading
                    // it reset the watchdog.
                }
            }
        }

        let status = child.wait().await.context("waitpid failed")?;
        match decide(status.code(), killed, restart_requested) {
            Verdict::Exit(code) => return Ok(code),
            Verdict::Restart => {
                info!("daemon child exited with {:?}; restarting", status.code());
                tokio::time::sleep(RESPAWN_DELAY).await;
            }
        }
    }
}

/// Outcome of one child lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    /// Follow the child down with this exit code.
    Exit(i32),
    /// Spawn a fresh child.
    Restart,
}

/// The restart decision matrix. `code` is the child's exit code (`None`
/// when a signal ended it), `killed` whether this supervisor killed it,
/// `restart_requested` whether the child asked for the restart.
fn decide(code: Option<i32>, killed: bool, restart_requested: bool) -> Verdict {
    match code {
        // Clean shutdown propagates, unless we are the ones who cut the
        // child short.
        Some(0) if !killed => Verdict::Exit(0),
        // Crashes and initialization failures respawn.
        Some(_) => Verdict::Restart,
        // Killed by us, for heartbeat silence or a restart request:
        // respawn.
        None if killed || restart_requested => Verdict::Restart,
        // Killed by anyone else (e.g. the user's Ctrl-C went to the
        // whole process group): follow it down.
        None => Verdict::Exit(1),
    }
}
