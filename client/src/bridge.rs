//! Bridge operations.
//!
//! Each operation is one encode, invoke, decode round trip over the gateway.
//! The only state kept between calls is the environment mirror.

use sandbridge_shared::events::EventMask;
use sandbridge_shared::ioctl::DescriptorCommand;
use sandbridge_shared::protocol::{
    decode_decimal, decode_text, AttachSigintArgs, ChdirArgs, Command, EventSourceArgs,
    GetcwdArgs, HtermArgs, HtermMethod, IsattyArgs, KillArgs, MknodArgs, MountArgs, NoArgs,
    Request, SetEchoArgs, SetEnvArgs, UmountArgs, MAX_MESSAGE_SIZE,
};
use sandbridge_shared::spawn::SpawnDescriptor;
use sandbridge_shared::{Errno, Error, Result};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::BridgeConfig;
use crate::env::{validate_var, EnvWrite, Environment};
use crate::fdctl;
use crate::gateway::Gateway;

/// Host process identifier
pub type Pid = i32;

/// Reply capacity for decimal scalars
const NUMERIC_REPLY_LEN: usize = 16;
/// Reply capacity for isatty
const ISATTY_REPLY_LEN: usize = 64;

pub const SIGINT: i32 = 2;
pub const SIGKILL: i32 = 9;
pub const SIGTERM: i32 = 15;

/// Zeroed reply buffer; no reply frame can exceed `MAX_MESSAGE_SIZE`.
fn reply_buffer(len: usize) -> Result<Vec<u8>> {
    if len > MAX_MESSAGE_SIZE {
        return Err(Error::invalid(format!(
            "reply capacity {} exceeds the {} byte message limit",
            len, MAX_MESSAGE_SIZE
        )));
    }
    Ok(vec![0u8; len])
}

/// Sandbox-side context: a gateway plus the environment mirror.
pub struct Bridge<G> {
    gateway: G,
    env: Environment,
    config: BridgeConfig,
}

impl<G: Gateway> Bridge<G> {
    pub fn new(gateway: G) -> Self {
        Self::with_config(gateway, BridgeConfig::default())
    }

    pub fn with_config(gateway: G, config: BridgeConfig) -> Self {
        Self {
            gateway,
            env: Environment::new(),
            config,
        }
    }

    /// Replace the mirror, e.g. with [`Environment::from_process`].
    pub fn with_environment(mut self, env: Environment) -> Self {
        self.env = env;
        self
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn gateway_mut(&mut self) -> &mut G {
        &mut self.gateway
    }

    pub fn into_gateway(self) -> G {
        self.gateway
    }

    fn call<T: Serialize>(&mut self, command: Command, fields: &T, output: &mut [u8]) -> Result<usize> {
        let request = Request::encode(command, fields)?;
        self.gateway.invoke(request.command, &request.payload, output)
    }

    fn call_status<T: Serialize>(&mut self, command: Command, fields: &T) -> Result<()> {
        self.call(command, fields, &mut []).map(|_| ())
    }

    fn call_decimal<T: Serialize, N: std::str::FromStr>(
        &mut self,
        command: Command,
        fields: &T,
        capacity: usize,
    ) -> Result<N> {
        let mut out = vec![0u8; capacity];
        let written = self.call(command, fields, &mut out)?;
        decode_decimal(&out, written)
    }

    /// Change the host working directory. `dir` must already be canonical.
    pub fn chdir(&mut self, dir: &str) -> Result<()> {
        check_canonical(dir)?;
        self.call_status(Command::Chdir, &ChdirArgs { dir: dir.to_string() })
    }

    /// Single-shot getcwd. Fails with [`Error::Truncated`] if the path does not
    /// fit in `buf_len` bytes.
    pub fn getcwd_with_capacity(&mut self, buf_len: usize) -> Result<String> {
        let mut out = reply_buffer(buf_len)?;
        let written = self.call(Command::Getcwd, &GetcwdArgs { buf_len }, &mut out)?;
        decode_text(&out, written)
    }

    /// getcwd that grows its buffer until the path fits.
    pub fn getcwd(&mut self) -> Result<String> {
        let mut buf_len = self.config.getcwd_initial_len.max(1);
        while buf_len <= self.config.getcwd_max_len {
            match self.getcwd_with_capacity(buf_len) {
                Err(e) if is_too_small(&e) => {
                    debug!("getcwd: {} bytes too small, retrying", buf_len);
                    buf_len = match buf_len.checked_mul(2) {
                        Some(next) => next,
                        None => break,
                    };
                }
                other => return other,
            }
        }
        Err(Error::Host(Errno::NAMETOOLONG))
    }

    pub fn isatty(&mut self, fd: u32) -> Result<bool> {
        let answer: i32 = self.call_decimal(Command::Isatty, &IsattyArgs { fd }, ISATTY_REPLY_LEN)?;
        Ok(answer == 1)
    }

    /// Set (`Some`) or unset (`None`) a variable in the mirror and on the host.
    ///
    /// With [`EnvWrite::LocalFirst`] the mirror is updated even when the host
    /// notification fails; the error is still returned.
    pub fn set_env(&mut self, key: &str, value: Option<&str>) -> Result<()> {
        validate_var(key, value)?;
        let args = SetEnvArgs {
            key: key.to_string(),
            value: value.map(str::to_string),
        };

        match self.config.env_write {
            EnvWrite::LocalFirst => {
                self.env.apply(key, value);
                self.call_status(Command::SetEnv, &args).map_err(|e| {
                    warn!("environment mirror diverged from host on {}: {}", key, e);
                    e
                })
            }
            EnvWrite::HostFirst => {
                self.call_status(Command::SetEnv, &args)?;
                self.env.apply(key, value);
                Ok(())
            }
        }
    }

    pub fn unset_env(&mut self, key: &str) -> Result<()> {
        self.set_env(key, None)
    }

    pub fn getpid(&mut self) -> Result<Pid> {
        let pid: Pid = self.call_decimal(Command::Getpid, &NoArgs {}, NUMERIC_REPLY_LEN)?;
        if pid <= 0 {
            return Err(Error::Protocol(format!("host returned pid {}", pid)));
        }
        Ok(pid)
    }

    pub fn set_echo(&mut self, echo: bool) -> Result<()> {
        self.call_status(Command::SetEcho, &SetEchoArgs { echo })
    }

    /// Read a terminal emulator attribute.
    pub fn hterm_get(&mut self, attrib: &str) -> Result<String> {
        let args = HtermArgs {
            method: HtermMethod::Get,
            attrib: attrib.to_string(),
            val: None,
        };
        let mut out = reply_buffer(self.config.hterm_value_len)?;
        let written = self.call(Command::Hterm, &args, &mut out)?;
        decode_text(&out, written)
    }

    pub fn hterm_set(&mut self, attrib: &str, val: &str) -> Result<()> {
        let args = HtermArgs {
            method: HtermMethod::Set,
            attrib: attrib.to_string(),
            val: Some(val.to_string()),
        };
        self.call_status(Command::Hterm, &args)
    }

    /// Get (`None`) or set (`Some`) an attribute in one call.
    pub fn hterm(&mut self, attrib: &str, val: Option<&str>) -> Result<Option<String>> {
        match val {
            Some(v) => self.hterm_set(attrib, v).map(|_| None),
            None => self.hterm_get(attrib).map(Some),
        }
    }

    /// Create a descriptor that becomes readable when any event in `mask` fires.
    pub fn event_source_fd(&mut self, mask: EventMask) -> Result<u32> {
        if mask.is_empty() || mask.unknown_bits() != 0 {
            return Err(Error::invalid(format!("bad event mask {:#x}", mask.bits())));
        }
        let args = EventSourceArgs { event_mask: mask.bits() };
        self.call_decimal(Command::EventSourceFd, &args, NUMERIC_REPLY_LEN)
    }

    /// Route interrupts to an event-source descriptor.
    pub fn attach_sigint(&mut self, event_source_fd: u32) -> Result<()> {
        self.call_status(Command::AttachSigint, &AttachSigintArgs { event_source_fd })
    }

    /// Ask the host to drop cached handles nothing references any more.
    pub fn clean_inodes(&mut self) -> Result<()> {
        self.call_status(Command::CleanInodes, &NoArgs {})
    }

    /// Start a process. Returns the host-assigned pid.
    pub fn spawn(&mut self, descriptor: &SpawnDescriptor) -> Result<Pid> {
        descriptor.validate()?;
        let pid: Pid = self.call_decimal(Command::Spawn, descriptor, NUMERIC_REPLY_LEN)?;
        if pid <= 0 {
            return Err(Error::Protocol(format!("host returned child pid {}", pid)));
        }
        debug!("spawned {} as pid {} ({} redirects)", descriptor.path, pid, descriptor.redirects.len());
        Ok(pid)
    }

    pub fn kill(&mut self, process_id: Pid, signal: i32) -> Result<()> {
        if signal < 0 {
            return Err(Error::invalid(format!("bad signal {}", signal)));
        }
        self.call_status(Command::Kill, &KillArgs { process_id, signal })
    }

    pub fn mount(&mut self, args: &MountArgs) -> Result<()> {
        if args.target.is_empty() {
            return Err(Error::invalid("mount target is empty"));
        }
        self.call_status(Command::Mount, args)
    }

    pub fn umount(&mut self, path: &str) -> Result<()> {
        if path.is_empty() {
            return Err(Error::invalid("umount path is empty"));
        }
        self.call_status(Command::Umount, &UmountArgs { path: path.to_string() })
    }

    pub fn mknod(&mut self, path: &str, dev: u64) -> Result<()> {
        if path.is_empty() {
            return Err(Error::invalid("mknod path is empty"));
        }
        self.call_status(Command::Mknod, &MknodArgs { path: path.to_string(), dev })
    }

    /// See [`fdctl::ioctl`].
    pub fn ioctl(&mut self, fd: u32, cmd: DescriptorCommand, arg: &mut [u8]) -> Result<()> {
        fdctl::ioctl(&mut self.gateway, fd, cmd, arg)
    }
}

fn is_too_small(e: &Error) -> bool {
    match e {
        Error::Truncated { .. } => true,
        Error::Host(errno) => *errno == Errno::NOBUFS || *errno == Errno::RANGE,
        _ => false,
    }
}

/// The host does no path resolution: accept only absolute paths without
/// `.`/`..` components, repeated or trailing separators.
pub fn check_canonical(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(Error::invalid(format!("{:?} is not absolute", path)));
    }
    if path.contains('\0') {
        return Err(Error::invalid("path contains a NUL byte"));
    }
    if path == "/" {
        return Ok(());
    }
    for component in path[1..].split('/') {
        if component.is_empty() || component == "." || component == ".." {
            return Err(Error::invalid(format!("{:?} is not canonical", path)));
        }
    }
    Ok(())
}
