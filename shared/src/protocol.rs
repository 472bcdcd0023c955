//! Wire codec for bridge requests.
//!
//! A request is a command name plus a compact JSON payload. Replies come back
//! as raw bytes in a caller-sized buffer: scalar numbers are decimal ASCII,
//! text is raw UTF-8, and ioctl arguments are opaque bytes.
//!
//! The portable transport carries one request per frame:
//!
//! ```text
//! request: u32 LE header_len | header JSON (Envelope) | payload (buf_len bytes)
//! reply:   i32 LE status     | u32 LE body_len        | body
//! ```

use std::io::{Read, Write};
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Maximum frame size (16 MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Commands the host recognizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Chdir,
    Getcwd,
    Isatty,
    SetEnv,
    Getpid,
    SetEcho,
    Hterm,
    EventSourceFd,
    AttachSigint,
    CleanInodes,
    Spawn,
    Kill,
    Mount,
    Umount,
    Ioctl,
    Mknod,
}

impl Command {
    pub const ALL: [Command; 16] = [
        Command::Chdir,
        Command::Getcwd,
        Command::Isatty,
        Command::SetEnv,
        Command::Getpid,
        Command::SetEcho,
        Command::Hterm,
        Command::EventSourceFd,
        Command::AttachSigint,
        Command::CleanInodes,
        Command::Spawn,
        Command::Kill,
        Command::Mount,
        Command::Umount,
        Command::Ioctl,
        Command::Mknod,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Command::Chdir => "chdir",
            Command::Getcwd => "getcwd",
            Command::Isatty => "isatty",
            Command::SetEnv => "set_env",
            Command::Getpid => "getpid",
            Command::SetEcho => "set_echo",
            Command::Hterm => "hterm",
            Command::EventSourceFd => "event_source_fd",
            Command::AttachSigint => "attach_sigint",
            Command::CleanInodes => "clean_inodes",
            Command::Spawn => "spawn",
            Command::Kill => "kill",
            Command::Mount => "mount",
            Command::Umount => "umount",
            Command::Ioctl => "ioctl",
            Command::Mknod => "mknod",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }
}

/// An encoded request, ready for the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub payload: Vec<u8>,
}

impl Request {
    /// Serialize `fields` as the payload of `command`.
    pub fn encode<T: Serialize + ?Sized>(command: Command, fields: &T) -> Result<Self> {
        Ok(Self {
            command,
            payload: serde_json::to_vec(fields)?,
        })
    }

    /// Parse the payload back into its typed shape.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        decode_payload(&self.payload)
    }
}

pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(payload)?)
}

/// Logical envelope handed to the gateway primitive.
///
/// `buf_ptr` is only set by the address-handoff transport; the framed
/// transport ships the payload inline right after the header and uses
/// `out_len` to tell the host how much reply the caller can take.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub command: String,
    pub buf_len: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buf_ptr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_len: Option<usize>,
}

/// Bytes the gateway reports as written, clipped to the buffer.
fn written_slice(buf: &[u8], written: usize) -> &[u8] {
    &buf[..written.min(buf.len())]
}

/// Decode a decimal scalar reply. Trailing NULs and whitespace are ignored.
pub fn decode_decimal<T: FromStr>(buf: &[u8], written: usize) -> Result<T> {
    let raw = written_slice(buf, written);
    let text = std::str::from_utf8(raw)
        .map_err(|_| Error::Protocol("numeric reply is not UTF-8".into()))?;
    let text = text.trim_end_matches('\0').trim();
    text.parse()
        .map_err(|_| Error::Protocol(format!("expected a decimal reply, got {:?}", text)))
}

/// Decode a text reply, stopping at the first NUL if the host wrote one.
pub fn decode_text(buf: &[u8], written: usize) -> Result<String> {
    let raw = written_slice(buf, written);
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8(raw[..end].to_vec())
        .map_err(|_| Error::Protocol("text reply is not UTF-8".into()))
}

pub fn decode_json<T: DeserializeOwned>(buf: &[u8], written: usize) -> Result<T> {
    Ok(serde_json::from_slice(written_slice(buf, written))?)
}

// ---------------------------------------------------------------------------
// Request shapes
// ---------------------------------------------------------------------------

/// Payload of commands that take no fields; serializes as `{}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoArgs {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChdirArgs {
    pub dir: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetcwdArgs {
    pub buf_len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsattyArgs {
    pub fd: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetEnvArgs {
    pub key: String,
    /// `None` unsets the variable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetEchoArgs {
    pub echo: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HtermMethod {
    Get,
    Set,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtermArgs {
    pub method: HtermMethod,
    pub attrib: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub val: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSourceArgs {
    pub event_mask: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachSigintArgs {
    pub event_source_fd: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillArgs {
    pub process_id: i32,
    pub signal: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountArgs {
    pub source: String,
    pub source_fd: u32,
    pub target: String,
    pub target_fd: u32,
    pub filesystemtype: String,
    pub mountflags: u64,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UmountArgs {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoctlArgs {
    pub fd: u32,
    pub cmd: u32,
    /// Argument bytes sent to the host (write-direction commands only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arg: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MknodArgs {
    pub path: String,
    pub dev: u64,
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

fn check_size(len: usize, what: &str) -> Result<()> {
    if len > MAX_MESSAGE_SIZE {
        return Err(Error::Protocol(format!(
            "{} of {} bytes exceeds the {} byte limit",
            what, len, MAX_MESSAGE_SIZE
        )));
    }
    Ok(())
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut word = [0u8; 4];
    r.read_exact(&mut word)?;
    Ok(u32::from_le_bytes(word))
}

fn read_exact_vec<R: Read>(r: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

/// Write one request frame. `envelope.buf_len` must match the payload.
pub fn write_request_frame<W: Write>(w: &mut W, envelope: &Envelope, payload: &[u8]) -> Result<()> {
    if envelope.buf_len != payload.len() {
        return Err(Error::Protocol(format!(
            "envelope announces {} payload bytes but {} were given",
            envelope.buf_len,
            payload.len()
        )));
    }
    let header = serde_json::to_vec(envelope)?;
    check_size(header.len() + payload.len(), "request")?;

    w.write_all(&(header.len() as u32).to_le_bytes())?;
    w.write_all(&header)?;
    w.write_all(payload)?;
    w.flush()?;
    Ok(())
}

/// Read one request frame (host side).
pub fn read_request_frame<R: Read>(r: &mut R) -> Result<(Envelope, Vec<u8>)> {
    let header_len = read_u32(r)? as usize;
    check_size(header_len, "request header")?;
    let header = read_exact_vec(r, header_len)?;
    let envelope: Envelope = serde_json::from_slice(&header)?;
    check_size(header_len + envelope.buf_len, "request")?;
    let payload = read_exact_vec(r, envelope.buf_len)?;
    Ok((envelope, payload))
}

/// Write one reply frame (host side).
pub fn write_reply_frame<W: Write>(w: &mut W, status: i32, body: &[u8]) -> Result<()> {
    check_size(body.len(), "reply")?;
    w.write_all(&status.to_le_bytes())?;
    w.write_all(&(body.len() as u32).to_le_bytes())?;
    w.write_all(body)?;
    w.flush()?;
    Ok(())
}

/// Read one reply frame: host status and body.
pub fn read_reply_frame<R: Read>(r: &mut R) -> Result<(i32, Vec<u8>)> {
    let mut word = [0u8; 4];
    r.read_exact(&mut word)?;
    let status = i32::from_le_bytes(word);
    let len = read_u32(r)? as usize;
    check_size(len, "reply")?;
    let body = read_exact_vec(r, len)?;
    Ok((status, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_command_names() {
        for command in Command::ALL {
            assert_eq!(Command::parse(command.as_str()), Some(command));
            let json = serde_json::to_string(&command).unwrap();
            assert_eq!(json, format!("\"{}\"", command.as_str()));
        }
        assert_eq!(Command::parse("readlink"), None);
    }

    #[test]
    fn test_payload_escaping_roundtrip() {
        let args = SetEnvArgs {
            key: "PS1".to_string(),
            value: Some("say \"hi\"\n\t\u{1b}[0m\\".to_string()),
        };
        let request = Request::encode(Command::SetEnv, &args).unwrap();
        let text = std::str::from_utf8(&request.payload).unwrap();
        assert!(!text.contains('\n'));
        assert!(!text.contains('\u{1b}'));
        assert_eq!(request.decode::<SetEnvArgs>().unwrap(), args);

        let empty = ChdirArgs { dir: String::new() };
        let request = Request::encode(Command::Chdir, &empty).unwrap();
        assert_eq!(request.decode::<ChdirArgs>().unwrap(), empty);
    }

    #[test]
    fn test_roundtrip_every_shape() {
        fn check<T>(command: Command, fields: T)
        where
            T: Serialize + DeserializeOwned + PartialEq + std::fmt::Debug,
        {
            let request = Request::encode(command, &fields).unwrap();
            assert_eq!(request.decode::<T>().unwrap(), fields, "{}", command.as_str());
        }

        let odd = "q\"uo\\te\u{0}\r\n\u{7f}".to_string();
        check(Command::Chdir, ChdirArgs { dir: odd.clone() });
        check(Command::Getcwd, GetcwdArgs { buf_len: 0 });
        check(Command::Isatty, IsattyArgs { fd: u32::MAX });
        check(Command::SetEnv, SetEnvArgs { key: odd.clone(), value: Some(String::new()) });
        check(Command::Getpid, NoArgs {});
        check(Command::SetEcho, SetEchoArgs { echo: true });
        check(
            Command::Hterm,
            HtermArgs { method: HtermMethod::Get, attrib: String::new(), val: None },
        );
        check(Command::EventSourceFd, EventSourceArgs { event_mask: 3 });
        check(Command::AttachSigint, AttachSigintArgs { event_source_fd: 10 });
        check(Command::CleanInodes, NoArgs {});
        check(Command::Kill, KillArgs { process_id: -1, signal: 9 });
        check(
            Command::Mount,
            MountArgs {
                source: odd.clone(),
                source_fd: 3,
                target: "/mnt".into(),
                target_fd: 4,
                filesystemtype: "wasmfs".into(),
                mountflags: u64::MAX,
                data: String::new(),
            },
        );
        check(Command::Umount, UmountArgs { path: "/mnt".into() });
        check(Command::Ioctl, IoctlArgs { fd: 0, cmd: u32::MAX, arg: Some(vec![0, 255]) });
        check(Command::Mknod, MknodArgs { path: odd, dev: 0 });
    }

    #[test]
    fn test_field_names_and_kinds() {
        let request = Request::encode(Command::SetEcho, &SetEchoArgs { echo: false }).unwrap();
        assert_eq!(request.payload, br#"{"echo":false}"#);

        let request = Request::encode(Command::Getpid, &NoArgs {}).unwrap();
        assert_eq!(request.payload, b"{}");

        let unset = SetEnvArgs { key: "A".into(), value: None };
        let request = Request::encode(Command::SetEnv, &unset).unwrap();
        assert_eq!(request.payload, br#"{"key":"A"}"#);

        let kill = KillArgs { process_id: 12, signal: 15 };
        let value: serde_json::Value =
            serde_json::from_slice(&Request::encode(Command::Kill, &kill).unwrap().payload).unwrap();
        assert_eq!(value["process_id"], 12);
        assert_eq!(value["signal"], 15);
    }

    #[test]
    fn test_ioctl_args_empty_and_filled() {
        let bare = IoctlArgs { fd: 1, cmd: 0x4008_0103, arg: None };
        let request = Request::encode(Command::Ioctl, &bare).unwrap();
        assert_eq!(request.decode::<IoctlArgs>().unwrap(), bare);

        let filled = IoctlArgs { fd: 1, cmd: 0x8008_0104, arg: Some(vec![]) };
        let request = Request::encode(Command::Ioctl, &filled).unwrap();
        assert_eq!(request.decode::<IoctlArgs>().unwrap(), filled);
    }

    #[test]
    fn test_decode_replies() {
        let mut buf = [0u8; 16];
        buf[..3].copy_from_slice(b"42\0");
        assert_eq!(decode_decimal::<i32>(&buf, 3).unwrap(), 42);
        assert_eq!(decode_decimal::<i32>(b"7 garbage", 1).unwrap(), 7);
        assert!(decode_decimal::<i32>(b"x", 1).is_err());

        assert_eq!(decode_text(b"/home/user\0junk", 15).unwrap(), "/home/user");
        assert_eq!(decode_text(b"/tmpXXXX", 4).unwrap(), "/tmp");
        assert!(decode_text(&[0xff, 0xfe], 2).is_err());
    }

    #[test]
    fn test_frames() {
        let envelope = Envelope {
            command: "chdir".into(),
            buf_len: 12,
            buf_ptr: None,
            out_len: Some(0),
        };
        let mut wire = Vec::new();
        write_request_frame(&mut wire, &envelope, br#"{"dir":"/a"}"#).unwrap();
        let (decoded, payload) = read_request_frame(&mut Cursor::new(wire)).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(payload, br#"{"dir":"/a"}"#);

        let mut wire = Vec::new();
        write_reply_frame(&mut wire, -44, b"").unwrap();
        assert_eq!(read_reply_frame(&mut Cursor::new(wire)).unwrap(), (-44, vec![]));
    }

    #[test]
    fn test_frame_length_mismatch() {
        let envelope = Envelope {
            command: "getpid".into(),
            buf_len: 5,
            buf_ptr: None,
            out_len: None,
        };
        assert!(write_request_frame(&mut Vec::new(), &envelope, b"{}").is_err());
    }
}
