//! Packed descriptor-control command words.
//!
//! Layout of the 32-bit word, high bits first:
//!
//! ```text
//! 31..30  direction   (none / write / read / both)
//! 29..16  payload size in bytes
//! 15..8   major (command group)
//!  7..0   minor (command number)
//! ```
//!
//! Direction is seen from the caller: `Write` sends the argument buffer to the
//! host, `Read` lets the host fill it.

use crate::{Error, Result};

pub const MINOR_BITS: u32 = 8;
pub const MAJOR_BITS: u32 = 8;
pub const SIZE_BITS: u32 = 14;
pub const DIR_BITS: u32 = 2;

pub const MINOR_SHIFT: u32 = 0;
pub const MAJOR_SHIFT: u32 = MINOR_SHIFT + MINOR_BITS;
pub const SIZE_SHIFT: u32 = MAJOR_SHIFT + MAJOR_BITS;
pub const DIR_SHIFT: u32 = SIZE_SHIFT + SIZE_BITS;

/// Largest payload a command word can describe
pub const MAX_SIZE: u16 = (1 << SIZE_BITS) - 1;

/// Opaque terminal attribute block
pub const TERMIOS_SIZE: u16 = 60;
/// Opaque window size block
pub const WINSIZE_SIZE: u16 = 8;

/// Transfer direction of the argument buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Direction {
    None = 0,
    Write = 1,
    Read = 2,
    Both = 3,
}

impl Direction {
    fn from_bits(bits: u32) -> Self {
        match bits & 0b11 {
            0 => Direction::None,
            1 => Direction::Write,
            2 => Direction::Read,
            _ => Direction::Both,
        }
    }

    /// Whether the argument travels caller to host.
    pub fn sends(self) -> bool {
        matches!(self, Direction::Write | Direction::Both)
    }

    /// Whether the host writes the argument back.
    pub fn receives(self) -> bool {
        matches!(self, Direction::Read | Direction::Both)
    }
}

/// Unpacked descriptor command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorCommand {
    pub direction: Direction,
    pub size: u16,
    pub major: u8,
    pub minor: u8,
}

impl DescriptorCommand {
    /// Build a command. Fails if `size` does not fit the size field.
    pub fn new(direction: Direction, size: u16, major: u8, minor: u8) -> Result<Self> {
        if size > MAX_SIZE {
            return Err(Error::invalid(format!(
                "ioctl payload size {} exceeds {}",
                size, MAX_SIZE
            )));
        }
        if direction == Direction::None && size != 0 {
            return Err(Error::invalid("ioctl without transfer cannot carry a payload"));
        }
        Ok(Self { direction, size, major, minor })
    }

    const fn raw(direction: Direction, size: u16, major: u8, minor: u8) -> Self {
        Self { direction, size, major, minor }
    }

    pub const fn none(major: u8, minor: u8) -> Self {
        Self::raw(Direction::None, 0, major, minor)
    }

    pub fn pack(&self) -> u32 {
        ((self.direction as u32) << DIR_SHIFT)
            | ((self.size as u32) << SIZE_SHIFT)
            | ((self.major as u32) << MAJOR_SHIFT)
            | ((self.minor as u32) << MINOR_SHIFT)
    }

    pub fn unpack(word: u32) -> Self {
        Self {
            direction: Direction::from_bits(word >> DIR_SHIFT),
            size: ((word >> SIZE_SHIFT) & ((1 << SIZE_BITS) - 1)) as u16,
            major: ((word >> MAJOR_SHIFT) & 0xff) as u8,
            minor: ((word >> MINOR_SHIFT) & 0xff) as u8,
        }
    }

    /// The argument buffer must be exactly `size` bytes long.
    pub fn check_argument(&self, len: usize) -> Result<()> {
        if len != self.size as usize {
            return Err(Error::invalid(format!(
                "ioctl {:#010x} expects a {} byte argument, got {}",
                self.pack(),
                self.size,
                len
            )));
        }
        Ok(())
    }
}

/// Terminal command group
pub const TTY_MAJOR: u8 = 1;

pub const TCGETS: DescriptorCommand = DescriptorCommand::raw(Direction::Read, TERMIOS_SIZE, TTY_MAJOR, 1);
pub const TCSETS: DescriptorCommand = DescriptorCommand::raw(Direction::Write, TERMIOS_SIZE, TTY_MAJOR, 2);
pub const TIOCGWINSZ: DescriptorCommand = DescriptorCommand::raw(Direction::Read, WINSIZE_SIZE, TTY_MAJOR, 3);
pub const TIOCSWINSZ: DescriptorCommand = DescriptorCommand::raw(Direction::Write, WINSIZE_SIZE, TTY_MAJOR, 4);
pub const TIOCSRAW: DescriptorCommand = DescriptorCommand::raw(Direction::Write, 4, TTY_MAJOR, 5);
pub const TIOCSECHO: DescriptorCommand = DescriptorCommand::raw(Direction::Write, 4, TTY_MAJOR, 6);
