//! Descriptor control: `ioctl` pass-through and the local `fcntl` subset.
//!
//! `ioctl` is delegated to the host; the packed command's size and direction
//! decide how many argument bytes travel and which way.
//!
//! `fcntl` is handled against our own descriptor table. Moving a descriptor
//! takes several table calls (scan, then renumber) and is not atomic: callers
//! must not run other descriptor-table operations concurrently with it.

use sandbridge_shared::ioctl::DescriptorCommand;
use sandbridge_shared::protocol::{Command, IoctlArgs, Request};
use sandbridge_shared::{Error, Result};
use tracing::debug;

use crate::config::BridgeConfig;
use crate::gateway::Gateway;

/// Default exclusive upper bound of the descriptor scan
pub const DEFAULT_FD_CEILING: u32 = 1024;

/// POSIX close-on-exec flag as seen by callers
pub const FD_CLOEXEC: u32 = 1;

/// Tells the descriptor layer to interpret the extended flag bits
pub const FDFLAG_CTRL_BIT: u16 = 0x0020;
/// Extended close-on-exec bit
pub const FDFLAG_CLOEXEC: u16 = 0x0040;
/// Bits reserved for extended flags
pub const FDFLAG_EXT_MASK: u16 = 0xffc0;

/// Run one ioctl through the gateway.
///
/// `arg` must be exactly `cmd.size` bytes. For read-direction commands the
/// host's reply is written back into `arg`.
pub fn ioctl<G: Gateway + ?Sized>(
    gateway: &mut G,
    fd: u32,
    cmd: DescriptorCommand,
    arg: &mut [u8],
) -> Result<()> {
    cmd.check_argument(arg.len())?;

    let args = IoctlArgs {
        fd,
        cmd: cmd.pack(),
        arg: cmd.direction.sends().then(|| arg.to_vec()),
    };
    let request = Request::encode(Command::Ioctl, &args)?;

    if cmd.direction.receives() {
        let written = gateway.invoke(request.command, &request.payload, arg)?;
        if written != arg.len() {
            return Err(Error::Protocol(format!(
                "ioctl {:#010x} returned {} of {} bytes",
                args.cmd,
                written,
                arg.len()
            )));
        }
    } else {
        gateway.invoke(request.command, &request.payload, &mut [])?;
    }
    Ok(())
}

/// Backing descriptor table the local `fcntl` operations work on.
pub trait DescriptorTable {
    /// Flags of `fd`, or `None` if the slot is unused.
    fn probe(&mut self, fd: u32) -> Result<Option<u16>>;

    /// Move `from` onto the unused slot `to`. On success `to` refers to what
    /// `from` referred to and `from` is closed; on failure `from` is untouched.
    fn renumber(&mut self, from: u32, to: u32) -> Result<()>;

    fn set_flags(&mut self, fd: u32, flags: u16) -> Result<()>;
}

impl<T: DescriptorTable + ?Sized> DescriptorTable for &mut T {
    fn probe(&mut self, fd: u32) -> Result<Option<u16>> {
        (**self).probe(fd)
    }

    fn renumber(&mut self, from: u32, to: u32) -> Result<()> {
        (**self).renumber(from, to)
    }

    fn set_flags(&mut self, fd: u32, flags: u16) -> Result<()> {
        (**self).set_flags(fd, flags)
    }
}

/// Locally implemented `fcntl` commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FcntlCommand {
    /// Move to the lowest unused descriptor `>= floor`, closing the original
    MoveFd { floor: u32 },
    GetFd,
    SetFd(u32),
}

/// `fcntl` over a descriptor table
pub struct DescriptorControl<T> {
    table: T,
    ceiling: u32,
}

impl<T: DescriptorTable> DescriptorControl<T> {
    pub fn new(table: T) -> Self {
        Self::with_ceiling(table, DEFAULT_FD_CEILING)
    }

    pub fn with_ceiling(table: T, ceiling: u32) -> Self {
        Self { table, ceiling }
    }

    pub fn from_config(table: T, config: &BridgeConfig) -> Self {
        Self::with_ceiling(table, config.fd_ceiling)
    }

    pub fn table(&self) -> &T {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut T {
        &mut self.table
    }

    /// Returns the new descriptor for `MoveFd`, the flags for `GetFd`, and `0`
    /// for `SetFd`.
    pub fn fcntl(&mut self, fd: u32, cmd: FcntlCommand) -> Result<u32> {
        match cmd {
            FcntlCommand::MoveFd { floor } => self.move_to_lowest(fd, floor),
            FcntlCommand::GetFd => self.get_flags(fd),
            FcntlCommand::SetFd(flags) => self.set_flags(fd, flags).map(|_| 0),
        }
    }

    pub fn move_to_lowest(&mut self, fd: u32, floor: u32) -> Result<u32> {
        if self.table.probe(fd)?.is_none() {
            return Err(Error::BadDescriptor(fd));
        }
        if floor >= self.ceiling {
            return Err(Error::invalid(format!(
                "descriptor floor {} is not below the ceiling {}",
                floor, self.ceiling
            )));
        }

        for slot in floor..self.ceiling {
            if self.table.probe(slot)?.is_none() {
                self.table.renumber(fd, slot)?;
                debug!("moved fd {} to {}", fd, slot);
                return Ok(slot);
            }
        }

        Err(Error::TooManyOpenFiles {
            floor,
            ceiling: self.ceiling,
        })
    }

    pub fn get_flags(&mut self, fd: u32) -> Result<u32> {
        let flags = self.table.probe(fd)?.ok_or(Error::BadDescriptor(fd))?;
        Ok(if flags & FDFLAG_CLOEXEC != 0 { FD_CLOEXEC } else { 0 })
    }

    pub fn set_flags(&mut self, fd: u32, flags: u32) -> Result<()> {
        if flags & !FD_CLOEXEC != 0 {
            return Err(Error::invalid(format!("unsupported descriptor flags {:#x}", flags)));
        }
        if self.table.probe(fd)?.is_none() {
            return Err(Error::BadDescriptor(fd));
        }
        let mut ext = FDFLAG_CTRL_BIT;
        if flags & FD_CLOEXEC != 0 {
            ext |= FDFLAG_CLOEXEC;
        }
        self.table.set_flags(fd, ext)
    }
}

/// The sandbox's own descriptor table, reached through WASI calls.
#[cfg(target_os = "wasi")]
#[derive(Debug, Default)]
pub struct WasiDescriptors;

#[cfg(target_os = "wasi")]
impl DescriptorTable for WasiDescriptors {
    fn probe(&mut self, fd: u32) -> Result<Option<u16>> {
        // SAFETY: fdstat only reads the descriptor table.
        match unsafe { wasi::fd_fdstat_get(fd) } {
            Ok(stat) => Ok(Some(stat.fs_flags)),
            Err(wasi::ERRNO_BADF) => Ok(None),
            Err(e) => Err(Error::Host(sandbridge_shared::Errno(e.raw()))),
        }
    }

    fn renumber(&mut self, from: u32, to: u32) -> Result<()> {
        // SAFETY: both descriptors are plain integers; the runtime validates them.
        unsafe { wasi::fd_renumber(from, to) }
            .map_err(|e| Error::Host(sandbridge_shared::Errno(e.raw())))
    }

    fn set_flags(&mut self, fd: u32, flags: u16) -> Result<()> {
        // SAFETY: as above.
        unsafe { wasi::fd_fdstat_set_flags(fd, flags) }
            .map_err(|e| Error::Host(sandbridge_shared::Errno(e.raw())))
    }
}
