//! lumend - bridge daemon between a lighting-automation main repeater
//! and DMX/GPIO actuators.
//!
//! Subcommands:
//! - `lumend run` - run the daemon (optionally under a supervisor)
//! - `lumend supervise` - run the daemon under the restarting watchdog
//! - `lumend cmd <commands...>` - send raw integration commands

use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use lumend::controller::Controller;
use lumend::discovery::GatewaySource;
use lumend::link::{self, LinkConfig, LinkEvent};
use lumend::reactor::Reactor;
use lumend::site::{self, LogDmxBus, LogRelayBank};
use lumend::watchdog::{self, Heartbeat};

#[derive(Parser)]
#[command(name = "lumend")]
#[command(about = "Bridge daemon between a lighting main repeater and DMX/GPIO actuators")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct GatewayArgs {
    /// Gateway hostname or address; multicast discovery when omitted
    #[arg(long)]
    gateway: Option<String>,

    /// Integration login
    #[arg(long)]
    user: Option<String>,

    /// Integration password
    #[arg(long)]
    password: Option<String>,

    /// Helper program printing the gateway address, used when neither
    /// --gateway nor discovery finds one
    #[arg(long)]
    helper: Option<PathBuf>,

    /// Site description file
    #[arg(long, default_value = "site.json")]
    site: PathBuf,
}

#[derive(Args, Clone)]
struct RunArgs {
    #[command(flatten)]
    gateway: GatewayArgs,

    /// Schema cache file for warm starts
    #[arg(long, default_value = ".schema-cache.xml")]
    cache: PathBuf,

    /// Emit the heartbeat protocol on stdout (set by `supervise`)
    #[arg(long, hide = true)]
    supervised: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon
    Run(RunArgs),

    /// Run the daemon under the restarting watchdog
    Supervise(RunArgs),

    /// Send raw integration commands and print the replies
    Cmd {
        #[command(flatten)]
        gateway: GatewayArgs,

        /// Commands to execute, in order
        #[arg(required = true)]
        commands: Vec<String>,
    },
}

fn main() {
    // Logs go to stderr: when supervised, stdout carries the heartbeat
    // protocol.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match run_main(cli) {
        Ok(code) => code,
        Err(err) => {
            warn!("fatal: {err:#}");
            1
        }
    };
    std::process::exit(code);
}

fn run_main(cli: Cli) -> Result<i32> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("cannot build runtime")?;
    let local = tokio::task::LocalSet::new();
    match cli.command {
        Commands::Run(args) => {
            runtime.block_on(local.run_until(serve(args)))?;
            Ok(0)
        }
        Commands::Supervise(args) => {
            let mut child_args = vec!["run".to_string(), "--supervised".to_string()];
            child_args.extend(passthrough_args(&args));
            runtime.block_on(local.run_until(watchdog::supervise(child_args)))
        }
        Commands::Cmd { gateway, commands } => {
            runtime.block_on(local.run_until(run_commands(gateway, commands)))
        }
    }
}

fn passthrough_args(args: &RunArgs) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(gateway) = &args.gateway.gateway {
        out.extend(["--gateway".to_string(), gateway.clone()]);
    }
    if let Some(user) = &args.gateway.user {
        out.extend(["--user".to_string(), user.clone()]);
    }
    if let Some(password) = &args.gateway.password {
        out.extend(["--password".to_string(), password.clone()]);
    }
    if let Some(helper) = &args.gateway.helper {
        out.extend(["--helper".to_string(), helper.display().to_string()]);
    }
    out.extend([
        "--site".to_string(),
        args.gateway.site.display().to_string(),
        "--cache".to_string(),
        args.cache.display().to_string(),
    ]);
    out
}

/// Load the site description; a missing file just means "no policy".
fn load_site(path: &std::path::Path) -> Value {
    match site::load(path) {
        Ok(value) => value,
        Err(err) => {
            info!("no usable site description: {err}");
            Value::Object(Default::default())
        }
    }
}

/// Build the link configuration from flags, the site description, and
/// the environment, in that order of precedence. `REPEATER` is honored
/// as a legacy alias for `GATEWAY`.
fn link_config(args: &GatewayArgs, site: &Value) -> LinkConfig {
    let from_site = |key: &str| {
        site.get(key)
            .and_then(Value::as_str)
            .map(|s| s.to_string())
    };
    let from_env = |key: &str| std::env::var(key).ok().filter(|s| !s.is_empty());
    let gateway = args
        .gateway
        .clone()
        .or_else(|| from_site("GATEWAY"))
        .or_else(|| from_env("GATEWAY"))
        .or_else(|| from_env("REPEATER"));
    let source = match (gateway, &args.helper) {
        (Some(name), _) => GatewaySource::Direct(name),
        (None, Some(helper)) => GatewaySource::Helper(helper.clone()),
        (None, None) => GatewaySource::Multicast,
    };
    let mut config = LinkConfig::new(source);
    if let Some(user) = args
        .user
        .clone()
        .or_else(|| from_site("USER"))
        .or_else(|| from_env("USER"))
    {
        config.username = user;
    }
    if let Some(password) = args
        .password
        .clone()
        .or_else(|| from_site("PASSWORD"))
        .or_else(|| from_env("PASSWORD"))
    {
        config.password = password;
    }
    config
}

async fn serve(args: RunArgs) -> Result<()> {
    let site = load_site(&args.gateway.site);
    let config = link_config(&args.gateway, &site);
    if let Ok(dmxserver) = std::env::var("DMXSERVER") {
        // Debug facility: an external DMX driver proxies our channel
        // writes over multicast UDP instead of the serial framer.
        info!("DMX output proxied to {dmxserver:?}");
    }

    let (mut reactor, injector) = Reactor::new();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<LinkEvent>();
    let link = link::spawn(config, events_tx);

    // Link events become reactor callbacks, preserving wire order.
    let link_injector = injector.clone();
    tokio::task::spawn_local(async move {
        while let Some(event) = events_rx.recv().await {
            link_injector.send(move |c: &mut Controller, s| c.handle_link_event(s, event));
        }
    });

    let mut controller = Controller::new(Rc::new(link), injector, args.cache.clone());

    let heartbeat = Heartbeat::new(args.supervised);
    let hb = heartbeat.clone();
    controller.on_heartbeat(move || hb.pulse());
    controller.on_schema_invalid(move || {
        // In-process reconfiguration is not supported; hand the problem
        // to the supervisor.
        warn!("automation schema changed; requesting restart");
        heartbeat.request_restart();
        std::process::exit(1);
    });
    controller.on_broadcast(|line| {
        // The HTTP/WebSocket surface attaches here.
        debug!("broadcast {line:?}");
    });
    controller.on_init(move |c, s| {
        site::apply(&site, c, s, Rc::new(LogDmxBus), Rc::new(LogRelayBank));
    });

    info!("starting");
    controller.start(reactor.scheduler());
    reactor.run(&mut controller).await;
    Ok(())
}

/// `lumend cmd`: execute raw commands in order, printing progress lines
/// and results, with a time-of-day query as the final barrier.
async fn run_commands(args: GatewayArgs, commands: Vec<String>) -> Result<i32> {
    let site = load_site(&args.site);
    let config = link_config(&args, &site);

    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<LinkEvent>();
    let link = link::spawn(config, events_tx);

    let mut queue: std::collections::VecDeque<(u64, String)> = commands
        .into_iter()
        .chain(std::iter::once("?SYSTEM,1".to_string()))
        .enumerate()
        .map(|(i, cmd)| (i as u64, cmd))
        .collect();
    let total = queue.len() as u64;

    let submit = |link: &link::LinkClient, queue: &mut std::collections::VecDeque<(u64, String)>| {
        if let Some((id, cmd)) = queue.pop_front() {
            println!("{cmd}");
            link.submit(cmd, id);
        }
    };
    submit(&link, &mut queue);

    while let Some(event) = events_rx.recv().await {
        match event {
            LinkEvent::InitBegin => link.init_done(),
            LinkEvent::Line(line) => {
                // Print progress, omitting the login handshake and
                // prompts.
                if !line.is_empty() && !line.contains(':') {
                    println!("{line}");
                }
            }
            LinkEvent::CommandDone { id, outcome } => {
                match outcome {
                    Ok(result) => {
                        if !result.is_empty() {
                            println!("{result}");
                        }
                    }
                    Err(err) => {
                        eprintln!("{err}");
                        return Ok(1);
                    }
                }
                if id + 1 == total {
                    return Ok(0);
                }
                submit(&link, &mut queue);
            }
            LinkEvent::Closed => {
                eprintln!("connection closed");
                return Ok(1);
            }
        }
    }
    Ok(1)
}
