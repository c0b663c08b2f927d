//! Gateway integration-protocol client.
//!
//! Maintains at most one authenticated session with the gateway, with at
//! most one command in flight. The dialogue is prompt-driven and
//! half-duplex with warts: queries (`?...`) may answer with a `~...`
//! line, an error line, or nothing at all before the next `GNET> `
//! prompt; unsolicited status lines arrive at any time; errors do not
//! name the command that caused them.
//!
//! The link runs as a single task owning the TCP socket:
//!
//! ```text
//! Disconnected → resolve → Connecting(addr[i]) → Authenticating
//!              → Initializing (on-init window, init-phase queue)
//!              → Ready (user queue, keep-alive)
//!   any state → Disconnected on timeout, socket error, keep-alive miss
//! ```
//!
//! Commands are correlated by caller-assigned [`CommandId`]s; completion,
//! every received line, and connection lifecycle are reported through a
//! [`LinkEvent`] channel in wire order. Commands submitted while the
//! on-init window is open go to a separate init-phase queue that dies
//! with its connection; user commands queued during an outage survive to
//! the next one.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use lumenproto::line::is_error_line;
use lumenproto::{
    matches_reply, query_head, LineScanner, CRLF, LOGIN_PROMPT, PASSWORD_PROMPT, PROMPT,
};

use crate::discovery::{resolve, GatewaySource};

/// Caller-assigned correlation id for a submitted command.
pub type CommandId = u64;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("gateway is not reachable")]
    NotConnected,
    #[error("connection closed with the command outstanding")]
    ConnectionClosed,
    #[error("gateway reported an error: {0}")]
    Protocol(String),
}

/// Everything the controller hears from the link, in wire order.
#[derive(Debug)]
pub enum LinkEvent {
    /// A received line; prompts are reported as the empty string.
    Line(String),
    /// The privileged initialization window opened. Commands submitted
    /// until `init_done` are serviced from the init-phase queue.
    InitBegin,
    /// A previously connected session closed.
    Closed,
    /// A command completed. Queries resolve to their reply line (empty
    /// when the gateway produced a prompt with no reply); non-queries
    /// resolve to the empty string at the prompt.
    CommandDone {
        id: CommandId,
        outcome: Result<String, LinkError>,
    },
}

/// All protocol durations in one place so tests can compress them.
#[derive(Debug, Clone)]
pub struct LinkTiming {
    /// Overall deadline for one command, including any connection and
    /// login setup it triggers.
    pub command: Duration,
    /// Sub-deadline for an expected prompt during login.
    pub prompt: Duration,
    /// Idle time before a keep-alive probe, and again before giving up.
    pub keepalive: Duration,
    /// Per-address TCP connect deadline.
    pub connect: Duration,
}

impl Default for LinkTiming {
    fn default() -> Self {
        Self {
            command: Duration::from_secs(10),
            prompt: Duration::from_secs(5),
            keepalive: Duration::from_secs(5),
            connect: Duration::from_secs(10) / 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub gateway: GatewaySource,
    pub username: String,
    pub password: String,
    pub timing: LinkTiming,
}

impl LinkConfig {
    pub fn new(gateway: GatewaySource) -> Self {
        Self {
            gateway,
            username: "lutron".to_string(),
            password: "integration".to_string(),
            timing: LinkTiming::default(),
        }
    }
}

enum LinkRequest {
    Submit { cmd: String, id: CommandId },
    InitDone,
    Close,
}

#[derive(Default)]
struct LinkShared {
    connected: Cell<bool>,
    in_command: Cell<bool>,
    in_init: Cell<bool>,
    init_busy: Cell<bool>,
    addr: Cell<Option<SocketAddr>>,
}

/// Cheap-clone handle to the link task.
#[derive(Clone)]
pub struct LinkClient {
    tx: mpsc::UnboundedSender<LinkRequest>,
    shared: Rc<LinkShared>,
}

impl LinkClient {
    /// Submit a command. Completion arrives as
    /// [`LinkEvent::CommandDone`]. An empty command sends a bare CRLF
    /// and acts as a completion barrier at the next prompt.
    pub fn submit(&self, cmd: String, id: CommandId) {
        let _ = self.tx.send(LinkRequest::Submit { cmd, id });
    }

    /// Tear down the connection; all pending commands fail.
    pub fn close(&self) {
        let _ = self.tx.send(LinkRequest::Close);
    }

    /// Close the on-init window, transitioning the link to steady state.
    pub fn init_done(&self) {
        let _ = self.tx.send(LinkRequest::InitDone);
    }

    /// Extend the overall command deadline once; called from init work
    /// that is slow but verifiably progressing (the schema download).
    pub fn extend_init(&self) {
        self.shared.init_busy.set(true);
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.get()
    }

    pub fn command_pending(&self) -> bool {
        self.shared.in_command.get()
    }

    pub fn in_init(&self) -> bool {
        self.shared.in_init.get()
    }

    pub fn connected_addr(&self) -> Option<SocketAddr> {
        self.shared.addr.get()
    }
}

/// Spawn the link task on the current `LocalSet`. Events are delivered
/// through `events` in wire order.
pub fn spawn(config: LinkConfig, events: mpsc::UnboundedSender<LinkEvent>) -> LinkClient {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Rc::new(LinkShared::default());
    let client = LinkClient {
        tx,
        shared: shared.clone(),
    };
    let task = LinkTask {
        config,
        rx,
        events,
        shared,
        init_queue: VecDeque::new(),
        user_queue: VecDeque::new(),
        dialogue: RefCell::new(Dialogue::default()),
    };
    tokio::task::spawn_local(task.run());
    client
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    User,
}

struct QueuedCommand {
    cmd: String,
    id: CommandId,
}

/// Book-keeping for the prompt-driven exchange on one live connection.
#[derive(Default)]
struct Dialogue {
    /// Sent queries awaiting their `~` reply: (expected head, id),
    /// oldest first.
    sent_queries: VecDeque<(String, CommandId)>,
    /// The sent non-query command, completed by the next prompt.
    current: Option<CommandId>,
    /// Completions to deliver when the prompt arrives.
    on_prompt: Vec<(CommandId, Result<String, LinkError>)>,
    at_prompt: bool,
    in_flight: bool,
}

enum SessionEnd {
    /// Remote closed, I/O failed, or a deadline expired.
    Failed,
    /// Close requested by the controller.
    Closed,
    /// All request senders are gone; the daemon is shutting down.
    Shutdown,
}

#[derive(Debug, Clone, Copy)]
enum KeepAlive {
    /// Waiting out the idle interval before probing.
    Armed(Instant),
    /// Probe sent; a prompt must arrive before this deadline.
    Probing(Instant),
}

enum Wake {
    Request(Option<LinkRequest>),
    Read(std::io::Result<usize>),
    CommandTimeout,
    SessionTimeout,
    KeepAliveTimeout,
}

struct LinkTask {
    config: LinkConfig,
    rx: mpsc::UnboundedReceiver<LinkRequest>,
    events: mpsc::UnboundedSender<LinkEvent>,
    shared: Rc<LinkShared>,
    init_queue: VecDeque<QueuedCommand>,
    user_queue: VecDeque<QueuedCommand>,
    dialogue: RefCell<Dialogue>,
}

impl LinkTask {
    async fn run(mut self) {
        loop {
            // Disconnected: wait for demand. The health check's liveness
            // ping is what periodically re-triggers connection attempts.
            if self.user_queue.is_empty() {
                match self.rx.recv().await {
                    Some(LinkRequest::Submit { cmd, id }) => {
                        self.user_queue.push_back(QueuedCommand { cmd, id })
                    }
                    Some(LinkRequest::Close) | Some(LinkRequest::InitDone) => continue,
                    None => return,
                }
            }
            if matches!(self.session().await, SessionEnd::Shutdown) {
                return;
            }
        }
    }

    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    fn fail(&self, id: CommandId, error: LinkError) {
        self.emit(LinkEvent::CommandDone {
            id,
            outcome: Err(error),
        });
    }

    /// Fail the command whose submission demanded this connection
    /// attempt. The rest of the user queue stays; each entry gets its
    /// own attempt in turn, which is what paces reconnection when the
    /// health check keeps pinging.
    fn fail_demand(&mut self) {
        if let Some(QueuedCommand { id, cmd }) = self.user_queue.pop_front() {
            debug!("failing command {cmd:?}: gateway unreachable");
            self.fail(id, LinkError::NotConnected);
        }
    }

    /// One full connection lifecycle: connect, authenticate, run the
    /// init window, serve the steady state, tear down.
    async fn session(&mut self) -> SessionEnd {
        // The overall deadline covers resolution, login, and the entire
        // init window; `extend_init` re-arms it while real progress is
        // being made (the schema download is legitimately slow).
        self.shared.init_busy.set(false);
        let mut deadline = Instant::now() + self.config.timing.command;

        let connect = connect_and_auth(self.config.clone(), self.shared.clone());
        tokio::pin!(connect);
        let stream = loop {
            let wake = tokio::select! {
                res = &mut connect => Some(res),
                _ = tokio::time::sleep_until(deadline) => None,
            };
            match wake {
                Some(Some((stream, addr))) => {
                    self.shared.addr.set(Some(addr));
                    break Some(stream);
                }
                Some(None) => break None,
                None => {
                    if self.shared.init_busy.take() {
                        deadline = Instant::now() + self.config.timing.command;
                    } else {
                        debug!("connection setup timed out");
                        break None;
                    }
                }
            }
        };
        let Some(mut stream) = stream else {
            self.fail_demand();
            self.teardown();
            return SessionEnd::Failed;
        };

        self.shared.connected.set(true);
        self.dialogue.borrow_mut().at_prompt = true;

        // Init window: the controller subscribes to monitoring, loads
        // and verifies the schema, and refreshes state before the link
        // is declared ready.
        self.shared.in_init.set(true);
        self.emit(LinkEvent::InitBegin);
        let mut scanner = LineScanner::new();
        let end = self
            .serve(&mut stream, &mut scanner, Phase::Init, Some(&mut deadline))
            .await;
        self.shared.in_init.set(false);
        let end = match end {
            Ok(()) => {
                self.serve(&mut stream, &mut scanner, Phase::User, None)
                    .await
            }
            Err(end) => {
                // The connection died while initializing; the command
                // that demanded it never got a usable session.
                self.fail_demand();
                Err(end)
            }
        };

        let end = end.err().unwrap_or(SessionEnd::Closed);
        self.teardown();
        end
    }

    /// Serve one phase of a live connection. In the init phase the
    /// overall session deadline stays armed and `InitDone` ends the
    /// phase; in the user phase each command gets its own deadline.
    async fn serve(
        &mut self,
        stream: &mut TcpStream,
        scanner: &mut LineScanner,
        phase: Phase,
        mut session_deadline: Option<&mut Instant>,
    ) -> Result<(), SessionEnd> {
        let mut buf = BytesMut::with_capacity(1024);
        let mut cmd_deadline = Instant::now();
        let mut keepalive = KeepAlive::Armed(Instant::now() + self.config.timing.keepalive);

        loop {
            // At most one command in flight, launched only from a prompt
            // and never while a keep-alive probe is outstanding (its
            // prompt would be mistaken for the command completion).
            let can_send = {
                let d = self.dialogue.borrow();
                d.at_prompt && !d.in_flight && !matches!(keepalive, KeepAlive::Probing(_))
            };
            if can_send {
                let next = match phase {
                    Phase::Init => self.init_queue.pop_front(),
                    Phase::User => self.user_queue.pop_front(),
                };
                if let Some(QueuedCommand { cmd, id }) = next {
                    if self.send_command(stream, &cmd, id).await.is_err() {
                        return Err(SessionEnd::Failed);
                    }
                    cmd_deadline = Instant::now() + self.config.timing.command;
                }
            }

            let in_flight = self.dialogue.borrow().in_flight;
            // The session deadline covers init-phase commands; per-command
            // deadlines only apply in steady state.
            let command_wakeup = match (in_flight, phase) {
                (true, Phase::User) => Some(cmd_deadline),
                _ => None,
            };
            let session_wakeup = session_deadline.as_deref().copied();
            let keepalive_wakeup = match (in_flight, keepalive) {
                (false, KeepAlive::Armed(at)) => Some(at),
                (_, KeepAlive::Probing(at)) => Some(at),
                _ => None,
            };

            buf.clear();
            let wake = tokio::select! {
                biased;
                req = self.rx.recv() => Wake::Request(req),
                read = stream.read_buf(&mut buf) => Wake::Read(read),
                _ = sleep_until_opt(command_wakeup) => Wake::CommandTimeout,
                _ = sleep_until_opt(session_wakeup) => Wake::SessionTimeout,
                _ = sleep_until_opt(keepalive_wakeup) => Wake::KeepAliveTimeout,
            };

            match wake {
                Wake::Request(Some(LinkRequest::Submit { cmd, id })) => {
                    let queued = QueuedCommand { cmd, id };
                    match phase {
                        Phase::Init => self.init_queue.push_back(queued),
                        Phase::User => self.user_queue.push_back(queued),
                    }
                }
                Wake::Request(Some(LinkRequest::InitDone)) => {
                    if phase == Phase::Init {
                        return Ok(());
                    }
                }
                Wake::Request(Some(LinkRequest::Close)) => return Err(SessionEnd::Closed),
                Wake::Request(None) => return Err(SessionEnd::Shutdown),
                Wake::Read(Ok(0)) | Wake::Read(Err(_)) => {
                    // Remote closed: flush whatever is buffered so a
                    // final unterminated line is not lost.
                    while let Some(token) = scanner.next_token(None) {
                        self.process_line(&token, &mut keepalive);
                    }
                    if let Some(token) = scanner.take_remainder() {
                        self.process_line(&token, &mut keepalive);
                    }
                    return Err(SessionEnd::Failed);
                }
                Wake::Read(Ok(_)) => {
                    scanner.push(&buf);
                    while let Some(token) = scanner.next_token(None) {
                        self.process_line(&token, &mut keepalive);
                    }
                }
                Wake::CommandTimeout => {
                    debug!("command timed out");
                    return Err(SessionEnd::Failed);
                }
                Wake::SessionTimeout => {
                    if self.shared.init_busy.take() {
                        if let Some(d) = session_deadline.as_deref_mut() {
                            *d = Instant::now() + self.config.timing.command;
                        }
                    } else {
                        debug!("initialization timed out");
                        return Err(SessionEnd::Failed);
                    }
                }
                Wake::KeepAliveTimeout => match keepalive {
                    KeepAlive::Armed(_) => {
                        // Idle: probe with a bare CRLF; the prompt it
                        // elicits re-arms the monitor.
                        if stream.write_all(CRLF.as_bytes()).await.is_err() {
                            return Err(SessionEnd::Failed);
                        }
                        keepalive =
                            KeepAlive::Probing(Instant::now() + self.config.timing.keepalive);
                    }
                    KeepAlive::Probing(_) => {
                        debug!("keep-alive expired");
                        return Err(SessionEnd::Failed);
                    }
                },
            }
        }
    }

    async fn send_command(
        &self,
        stream: &mut TcpStream,
        cmd: &str,
        id: CommandId,
    ) -> std::io::Result<()> {
        debug!("send {cmd:?}");
        {
            let mut d = self.dialogue.borrow_mut();
            d.at_prompt = false;
            d.in_flight = true;
            if cmd.starts_with('?') {
                d.sent_queries.push_back((query_head(cmd).to_string(), id));
            } else {
                d.current = Some(id);
            }
        }
        self.shared.in_command.set(true);
        let wire = format!("{cmd}{CRLF}");
        stream.write_all(wire.as_bytes()).await
    }

    /// The heart of the protocol quirk handling: decide what each
    /// received line means given what is outstanding.
    fn process_line(&self, line: &str, keepalive: &mut KeepAlive) {
        if line == PROMPT {
            *keepalive = KeepAlive::Armed(Instant::now() + self.config.timing.keepalive);
            let completions: Vec<_> = {
                let mut d = self.dialogue.borrow_mut();
                d.at_prompt = true;
                d.in_flight = false;
                // Matched replies and errors deliver at the prompt; any
                // still-unreplied queries are deemed to have produced
                // nothing.
                let on_prompt: Vec<_> = d.on_prompt.drain(..).collect();
                let sent_queries: Vec<_> = d
                    .sent_queries
                    .drain(..)
                    .map(|(_, id)| (id, Ok(String::new())))
                    .collect();
                let current = d.current.take().map(|id| (id, Ok(String::new())));
                on_prompt
                    .into_iter()
                    .chain(sent_queries)
                    .chain(current)
                    .collect()
            };
            self.shared.in_command.set(false);
            self.emit(LinkEvent::Line(String::new()));
            for (id, outcome) in completions {
                self.emit(LinkEvent::CommandDone { id, outcome });
            }
            return;
        }

        self.emit(LinkEvent::Line(line.to_string()));

        let mut d = self.dialogue.borrow_mut();
        if is_error_line(line) {
            // The gateway does not say which command failed; blame the
            // oldest unreplied query.
            if let Some((head, id)) = d.sent_queries.pop_front() {
                debug!("error line {line:?} attributed to query head {head:?}");
                d.on_prompt
                    .push((id, Err(LinkError::Protocol(line.to_string()))));
            }
        } else if line.starts_with('~') {
            if let Some(pos) = d
                .sent_queries
                .iter()
                .position(|(head, _)| matches_reply(head, line))
            {
                let (_, id) = d.sent_queries.remove(pos).expect("position in range");
                d.on_prompt.push((id, Ok(line.to_string())));
            }
        }
    }

    /// Fail everything that cannot survive the connection loss: whatever
    /// was in flight, and the init-phase queue, which was meaningful only
    /// for the connection it was preparing. The user queue persists.
    fn teardown(&mut self) {
        let in_flight: Vec<CommandId> = {
            let mut d = self.dialogue.borrow_mut();
            let on_prompt: Vec<_> = d.on_prompt.drain(..).map(|(id, _)| id).collect();
            let sent_queries: Vec<_> = d.sent_queries.drain(..).map(|(_, id)| id).collect();
            let current = d.current.take();
            let ids = on_prompt
                .into_iter()
                .chain(sent_queries)
                .chain(current)
                .collect();
            d.at_prompt = false;
            d.in_flight = false;
            ids
        };
        for id in in_flight {
            self.fail(id, LinkError::ConnectionClosed);
        }
        let init_ids: Vec<CommandId> = self
            .init_queue
            .drain(..)
            .map(|QueuedCommand { id, .. }| id)
            .collect();
        for id in init_ids {
            self.fail(id, LinkError::ConnectionClosed);
        }
        self.shared.in_command.set(false);
        self.shared.in_init.set(false);
        self.shared.addr.set(None);
        if self.shared.connected.replace(false) {
            self.emit(LinkEvent::Closed);
        }
    }
}

/// Resolve the gateway and authenticate against each address in turn.
/// Returns `None` when every address failed.
async fn connect_and_auth(
    config: LinkConfig,
    shared: Rc<LinkShared>,
) -> Option<(TcpStream, SocketAddr)> {
    let addrs = match resolve(&config.gateway, config.timing.connect).await {
        Ok(addrs) => addrs,
        Err(err) => {
            warn!("gateway resolution failed: {err}");
            return None;
        }
    };
    for addr in addrs {
        shared.init_busy.set(true);
        match tokio::time::timeout(config.timing.connect, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => match authenticate(&config, stream).await {
                Some(stream) => {
                    debug!("authenticated with gateway at {addr}");
                    return Some((stream, addr));
                }
                None => debug!("authentication failed at {addr}"),
            },
            Ok(Err(err)) => debug!("connect to {addr} failed: {err}"),
            Err(_) => debug!("connect to {addr} timed out"),
        }
    }
    None
}

/// Drive the login dialogue: `login: `, username, `password: `,
/// password, then the command prompt.
async fn authenticate(config: &LinkConfig, mut stream: TcpStream) -> Option<TcpStream> {
    let mut scanner = LineScanner::new();
    expect_prompt(config, &mut stream, &mut scanner, LOGIN_PROMPT).await?;
    let user = format!("{}{}", config.username, CRLF);
    stream.write_all(user.as_bytes()).await.ok()?;
    expect_prompt(config, &mut stream, &mut scanner, PASSWORD_PROMPT).await?;
    let pass = format!("{}{}", config.password, CRLF);
    stream.write_all(pass.as_bytes()).await.ok()?;
    expect_prompt(config, &mut stream, &mut scanner, PROMPT).await?;
    Some(stream)
}

async fn expect_prompt(
    config: &LinkConfig,
    stream: &mut TcpStream,
    scanner: &mut LineScanner,
    prompt: &str,
) -> Option<()> {
    let deadline = Instant::now() + config.timing.prompt;
    let expected = if prompt == PROMPT { None } else { Some(prompt) };
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        while let Some(token) = scanner.next_token(expected) {
            if token == prompt {
                return Some(());
            }
            // Banner noise ahead of the prompt is normal; anything else
            // is ignored during login.
            debug!("during login: {token:?}");
        }
        buf.clear();
        let read = tokio::select! {
            read = stream.read_buf(&mut buf) => read,
            _ = tokio::time::sleep_until(deadline) => {
                debug!("timed out waiting for {prompt:?}");
                return None;
            }
        };
        match read {
            Ok(0) | Err(_) => return None,
            Ok(_) => scanner.push(&buf),
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
