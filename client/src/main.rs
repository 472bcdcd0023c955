use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sandbridge::bridge::SIGTERM;
use sandbridge::{Bridge, BridgeConfig, Environment, Gateway};
use sandbridge_shared::events::EventMask;
use sandbridge_shared::ioctl::TIOCGWINSZ;
use sandbridge_shared::protocol::MountArgs;
use sandbridge_shared::spawn::{Binding, OpenMode, PipeDirection, Redirect, SpawnDescriptor};

#[derive(Parser)]
#[command(name = "sandbridge")]
#[command(version)]
#[command(about = "Ask the sandbox host to perform OS operations", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Host socket (overrides config and SANDBRIDGE_SOCKET)
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the host working directory
    Cwd {
        /// Fail instead of growing the buffer past this size
        #[arg(long)]
        buf_len: Option<usize>,
    },
    /// Change the host working directory (absolute, canonical path)
    Cd { dir: String },
    /// Set or unset an environment variable
    Env {
        #[command(subcommand)]
        action: EnvAction,
    },
    /// Print the process id
    Pid,
    /// Report whether a descriptor is a terminal
    Isatty { fd: u32 },
    /// Turn terminal echo on or off
    Echo {
        #[arg(value_enum)]
        state: Toggle,
    },
    /// Read or write a terminal emulator attribute
    Term {
        #[command(subcommand)]
        action: TermAction,
    },
    /// Print the terminal window size
    Winsize {
        #[arg(default_value_t = 1)]
        fd: u32,
    },
    /// Create an event-source descriptor (e.g. "winch,sigint")
    Events {
        mask: String,
        /// Also route interrupts to the new descriptor
        #[arg(long)]
        attach_sigint: bool,
    },
    /// Route interrupts to an existing event-source descriptor
    AttachSigint { fd: u32 },
    /// Send a signal to a process
    Kill {
        pid: i32,
        #[arg(short = 'n', long, default_value_t = SIGTERM)]
        signal: i32,
    },
    /// Start a process on the host
    Spawn {
        path: String,
        /// Argument vector, including argv[0]
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
        /// Extra environment variable, KEY=VALUE
        #[arg(short, long = "env", value_parser = parse_key_val)]
        env: Vec<(String, String)>,
        /// Redirect in shell notation, applied in order: 1>/out, 2>>/log, 0</in,
        /// 0<>/dev/tty, 2>&1, 3>&-, 0<|7 (pipe in), 1>|8 (pipe out)
        #[arg(short, long = "redirect", value_parser = parse_redirect)]
        redirect: Vec<Redirect>,
        /// Do not wait for the process on the host
        #[arg(short, long)]
        background: bool,
        /// Print the request and resolved descriptors without sending it
        #[arg(long)]
        dry_run: bool,
    },
    /// Mount a filesystem
    Mount {
        source: String,
        target: String,
        #[arg(short = 't', long = "type")]
        filesystemtype: String,
        #[arg(long, default_value_t = 3)]
        source_fd: u32,
        #[arg(long, default_value_t = 3)]
        target_fd: u32,
        #[arg(short, long, default_value_t = 0)]
        flags: u64,
        #[arg(short, long, default_value = "")]
        data: String,
    },
    /// Unmount a filesystem
    Umount { path: String },
    /// Create a device node
    Mknod { path: String, dev: u64 },
    /// Ask the host to drop unreferenced cached handles
    CleanInodes,
}

#[derive(Subcommand)]
enum EnvAction {
    Set { key: String, value: String },
    Unset { key: String },
}

#[derive(Subcommand)]
enum TermAction {
    Get { attrib: String },
    Set { attrib: String, value: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    let mut config = BridgeConfig::resolve(cli.config.as_deref())?;
    if let Some(socket) = cli.socket {
        config.socket = socket;
    }
    config.validate()?;

    if let Commands::Spawn {
        path,
        args,
        env,
        redirect,
        background,
        dry_run: true,
    } = &cli.command
    {
        let desc = build_spawn(path, args, env, redirect, *background);
        return print_dry_run(&desc);
    }

    let gateway = connect(&config)?;
    let mut bridge = Bridge::with_config(gateway, config).with_environment(Environment::from_process());
    run(&mut bridge, cli.command)
}

#[cfg(target_os = "wasi")]
fn connect(_config: &BridgeConfig) -> Result<Box<dyn Gateway>> {
    Ok(Box::new(sandbridge::gateway::ReadlinkGateway::new()))
}

#[cfg(unix)]
fn connect(config: &BridgeConfig) -> Result<Box<dyn Gateway>> {
    info!("Connecting to host: {}", config.socket.display());
    let gateway = sandbridge::gateway::UnixGateway::connect(&config.socket)
        .context("Failed to reach the host")?;
    Ok(Box::new(gateway))
}

#[cfg(not(any(unix, target_os = "wasi")))]
fn connect(_config: &BridgeConfig) -> Result<Box<dyn Gateway>> {
    anyhow::bail!("no host transport is available on this platform")
}

/// Attach the signed status to a bridge error
fn failed(what: &str, e: sandbridge::Error) -> anyhow::Error {
    anyhow::anyhow!("{} failed: {} (status {})", what, e, e.status())
}

fn run(bridge: &mut Bridge<Box<dyn Gateway>>, command: Commands) -> Result<()> {
    match command {
        Commands::Cwd { buf_len } => {
            let cwd = match buf_len {
                Some(len) => bridge.getcwd_with_capacity(len),
                None => bridge.getcwd(),
            }
            .map_err(|e| failed("getcwd", e))?;
            println!("{}", cwd);
        }
        Commands::Cd { dir } => {
            bridge.chdir(&dir).map_err(|e| failed("chdir", e))?;
        }
        Commands::Env { action } => match action {
            EnvAction::Set { key, value } => {
                bridge.set_env(&key, Some(&value)).map_err(|e| failed("set_env", e))?;
            }
            EnvAction::Unset { key } => {
                bridge.unset_env(&key).map_err(|e| failed("set_env", e))?;
            }
        },
        Commands::Pid => {
            println!("{}", bridge.getpid().map_err(|e| failed("getpid", e))?);
        }
        Commands::Isatty { fd } => {
            let tty = bridge.isatty(fd).map_err(|e| failed("isatty", e))?;
            println!("{}", if tty { 1 } else { 0 });
        }
        Commands::Echo { state } => {
            bridge
                .set_echo(matches!(state, Toggle::On))
                .map_err(|e| failed("set_echo", e))?;
        }
        Commands::Term { action } => match action {
            TermAction::Get { attrib } => {
                println!("{}", bridge.hterm_get(&attrib).map_err(|e| failed("hterm", e))?);
            }
            TermAction::Set { attrib, value } => {
                bridge.hterm_set(&attrib, &value).map_err(|e| failed("hterm", e))?;
            }
        },
        Commands::Winsize { fd } => {
            let mut ws = [0u8; 8];
            bridge.ioctl(fd, TIOCGWINSZ, &mut ws).map_err(|e| failed("ioctl", e))?;
            let rows = u16::from_le_bytes([ws[0], ws[1]]);
            let cols = u16::from_le_bytes([ws[2], ws[3]]);
            println!("{} {}", rows, cols);
        }
        Commands::Events { mask, attach_sigint } => {
            let mask = EventMask::parse(&mask)
                .with_context(|| format!("Unknown event in '{}'", mask))?;
            let fd = bridge.event_source_fd(mask).map_err(|e| failed("event_source_fd", e))?;
            if attach_sigint {
                bridge.attach_sigint(fd).map_err(|e| failed("attach_sigint", e))?;
            }
            println!("{}", fd);
        }
        Commands::AttachSigint { fd } => {
            bridge.attach_sigint(fd).map_err(|e| failed("attach_sigint", e))?;
        }
        Commands::Kill { pid, signal } => {
            bridge.kill(pid, signal).map_err(|e| failed("kill", e))?;
        }
        Commands::Spawn {
            path,
            args,
            env,
            redirect,
            background,
            dry_run: _,
        } => {
            let desc = build_spawn(&path, &args, &env, &redirect, background);
            let pid = bridge.spawn(&desc).map_err(|e| failed("spawn", e))?;
            info!("Spawned {} as pid {}", desc.path, pid);
            println!("{}", pid);
        }
        Commands::Mount {
            source,
            target,
            filesystemtype,
            source_fd,
            target_fd,
            flags,
            data,
        } => {
            let args = MountArgs {
                source,
                source_fd,
                target,
                target_fd,
                filesystemtype,
                mountflags: flags,
                data,
            };
            bridge.mount(&args).map_err(|e| failed("mount", e))?;
        }
        Commands::Umount { path } => {
            bridge.umount(&path).map_err(|e| failed("umount", e))?;
        }
        Commands::Mknod { path, dev } => {
            bridge.mknod(&path, dev).map_err(|e| failed("mknod", e))?;
        }
        Commands::CleanInodes => {
            bridge.clean_inodes().map_err(|e| failed("clean_inodes", e))?;
        }
    }
    Ok(())
}

/// argv[0] defaults to the path when no arguments are given
fn build_spawn(
    path: &str,
    args: &[String],
    env: &[(String, String)],
    redirects: &[Redirect],
    background: bool,
) -> SpawnDescriptor {
    let mut desc = SpawnDescriptor::new(path).background(background);
    desc = if args.is_empty() {
        desc.arg(path)
    } else {
        desc.args(args.iter().cloned())
    };
    for (key, value) in env {
        desc = desc.env(key.clone(), value.clone());
    }
    for redirect in redirects {
        desc = desc.redirect(redirect.clone());
    }
    desc
}

fn print_dry_run(desc: &SpawnDescriptor) -> Result<()> {
    desc.validate().map_err(|e| failed("spawn", e))?;
    println!("{}", serde_json::to_string_pretty(desc)?);
    for (fd, binding) in desc.resolved_redirects() {
        let target = match binding {
            Binding::Inherited(src) => format!("inherited fd {}", src),
            Binding::File { path, mode } => format!("{} ({:?})", path, mode),
            Binding::Pipe { fd_src, direction } => format!("pipe fd {} ({:?})", fd_src, direction),
            Binding::Closed => "closed".to_string(),
        };
        println!("fd {} -> {}", fd, target);
    }
    Ok(())
}

fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    if key.is_empty() {
        return Err(format!("empty variable name in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Parse one redirect in shell notation.
fn parse_redirect(s: &str) -> std::result::Result<Redirect, String> {
    let digits = s.chars().take_while(|c| c.is_ascii_digit()).count();
    let (fd_part, rest) = s.split_at(digits);
    let explicit_fd = if fd_part.is_empty() {
        None
    } else {
        Some(fd_part.parse::<u32>().map_err(|e| format!("bad descriptor in '{}': {}", s, e))?)
    };
    let out_fd = explicit_fd.unwrap_or(1);
    let in_fd = explicit_fd.unwrap_or(0);

    let parse_fd = |t: &str| -> std::result::Result<u32, String> {
        t.parse::<u32>().map_err(|_| format!("bad source descriptor in '{}'", s))
    };
    let non_empty = |t: &str| -> std::result::Result<String, String> {
        if t.is_empty() {
            Err(format!("missing path in '{}'", s))
        } else {
            Ok(t.to_string())
        }
    };

    if let Some(t) = rest.strip_prefix(">>") {
        Ok(Redirect::append(out_fd, non_empty(t)?))
    } else if let Some(t) = rest.strip_prefix(">&") {
        if t == "-" {
            Ok(Redirect::close(out_fd))
        } else {
            Ok(Redirect::duplicate(parse_fd(t)?, out_fd))
        }
    } else if let Some(t) = rest.strip_prefix(">|") {
        Ok(Redirect::pipe(parse_fd(t)?, out_fd, PipeDirection::Out))
    } else if let Some(t) = rest.strip_prefix('>') {
        Ok(Redirect::write(out_fd, non_empty(t)?))
    } else if let Some(t) = rest.strip_prefix("<>") {
        Ok(Redirect::open(in_fd, non_empty(t)?, OpenMode::ReadWrite))
    } else if let Some(t) = rest.strip_prefix("<&") {
        if t == "-" {
            Ok(Redirect::close(in_fd))
        } else {
            Ok(Redirect::duplicate(parse_fd(t)?, in_fd))
        }
    } else if let Some(t) = rest.strip_prefix("<|") {
        Ok(Redirect::pipe(parse_fd(t)?, in_fd, PipeDirection::In))
    } else if let Some(t) = rest.strip_prefix('<') {
        Ok(Redirect::read(in_fd, non_empty(t)?))
    } else {
        Err(format!("unrecognized redirect '{}'", s))
    }
}
