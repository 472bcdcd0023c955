//! The tunnel gateway: the single channel through which every request
//! reaches the host.
//!
//! One call is one request and one reply, delivered synchronously. A host
//! status is reported as [`Error::Host`]; failing to reach the host at all is
//! [`Error::Unreachable`]; a reply longer than the caller's buffer is
//! [`Error::Truncated`].

use std::io::{Read, Write};

use sandbridge_shared::protocol::{read_reply_frame, write_request_frame, Command, Envelope};
use sandbridge_shared::{Errno, Error, Result};
use tracing::debug;

/// Delivers one request to the host and collects its reply.
pub trait Gateway {
    /// Send `payload` for `command` and copy the host's reply into `output`.
    ///
    /// Returns the number of bytes written. Bytes past that count are
    /// unspecified.
    fn invoke(&mut self, command: Command, payload: &[u8], output: &mut [u8]) -> Result<usize>;
}

impl<G: Gateway + ?Sized> Gateway for &mut G {
    fn invoke(&mut self, command: Command, payload: &[u8], output: &mut [u8]) -> Result<usize> {
        (**self).invoke(command, payload, output)
    }
}

impl<G: Gateway + ?Sized> Gateway for Box<G> {
    fn invoke(&mut self, command: Command, payload: &[u8], output: &mut [u8]) -> Result<usize> {
        (**self).invoke(command, payload, output)
    }
}

fn unreachable(e: Error) -> Error {
    match e {
        Error::Io(io) => Error::Unreachable(io.to_string()),
        other => other,
    }
}

/// Framed transport over any byte stream, payload carried inline.
pub struct StreamGateway<S> {
    stream: S,
}

impl<S: Read + Write> StreamGateway<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: Read + Write> Gateway for StreamGateway<S> {
    fn invoke(&mut self, command: Command, payload: &[u8], output: &mut [u8]) -> Result<usize> {
        let envelope = Envelope {
            command: command.as_str().to_string(),
            buf_len: payload.len(),
            buf_ptr: None,
            out_len: Some(output.len()),
        };
        write_request_frame(&mut self.stream, &envelope, payload).map_err(unreachable)?;
        let (status, body) = read_reply_frame(&mut self.stream).map_err(unreachable)?;

        debug!(
            "{} -> status {} ({} payload bytes, {} reply bytes)",
            envelope.command,
            status,
            payload.len(),
            body.len()
        );

        if let Some(errno) = Errno::from_status(status) {
            return Err(Error::Host(errno));
        }
        if body.len() > output.len() {
            return Err(Error::Truncated {
                needed: body.len(),
                capacity: output.len(),
            });
        }
        output[..body.len()].copy_from_slice(&body);
        Ok(body.len())
    }
}

/// Framed transport over a Unix socket
#[cfg(unix)]
pub type UnixGateway = StreamGateway<std::os::unix::net::UnixStream>;

#[cfg(unix)]
impl UnixGateway {
    pub fn connect(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let stream = std::os::unix::net::UnixStream::connect(path)
            .map_err(|e| Error::Unreachable(format!("{}: {}", path.display(), e)))?;
        Ok(Self::new(stream))
    }
}

/// Address-handoff transport for WASI sandboxes.
///
/// The envelope is passed as the path of a `path_readlink` call on the
/// tunnel descriptor; the host reads `buf_len` bytes at `buf_ptr` straight
/// from our memory and writes its reply into the readlink buffer.
#[cfg(target_os = "wasi")]
pub struct ReadlinkGateway {
    tunnel_fd: u32,
}

#[cfg(target_os = "wasi")]
impl ReadlinkGateway {
    /// Descriptor the host intercepts readlink calls on
    pub const DEFAULT_TUNNEL_FD: u32 = 3;

    pub fn new() -> Self {
        Self {
            tunnel_fd: Self::DEFAULT_TUNNEL_FD,
        }
    }

    pub fn with_fd(tunnel_fd: u32) -> Self {
        Self { tunnel_fd }
    }
}

#[cfg(target_os = "wasi")]
impl Default for ReadlinkGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "wasi")]
impl Gateway for ReadlinkGateway {
    fn invoke(&mut self, command: Command, payload: &[u8], output: &mut [u8]) -> Result<usize> {
        let envelope = Envelope {
            command: command.as_str().to_string(),
            buf_len: payload.len(),
            buf_ptr: Some(format!("{:p}", payload.as_ptr())),
            out_len: None,
        };
        let serialized = serde_json::to_string(&envelope)?;

        // SAFETY: `payload` and `output` outlive the call; the host writes at
        // most `output.len()` bytes.
        let written = unsafe {
            wasi::path_readlink(self.tunnel_fd, &serialized, output.as_mut_ptr(), output.len())
        }
        .map_err(|e| Error::Host(Errno(e.raw())))?;

        debug!("{} -> {} reply bytes", envelope.command, written);
        Ok(written)
    }
}
