//! Process launch descriptors and descriptor redirection.
//!
//! Redirects are applied by the host in list order before the new image
//! starts, with dup2 semantics: a later entry for the same destination
//! replaces whatever an earlier entry bound there.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// How a path is opened onto a destination descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenMode {
    Read,
    Write,
    Append,
    ReadWrite,
}

/// Which end of a pipe the child sees
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipeDirection {
    /// Child reads from the pipe
    In,
    /// Child writes into the pipe
    Out,
}

/// What happens to the destination descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RedirectAction {
    Open { path: String, mode: OpenMode },
    /// Make the destination refer to what `fd_src` refers to at this point in the list
    Duplicate { fd_src: u32 },
    /// Attach a pipe endpoint held by the caller as `fd_src`
    Pipe { fd_src: u32, direction: PipeDirection },
    Close,
}

/// One redirection step for the spawned process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redirect {
    /// Descriptor in the spawned process this step affects
    #[serde(rename = "destination_fd")]
    pub fd_dst: u32,
    #[serde(flatten)]
    pub action: RedirectAction,
}

impl Redirect {
    pub fn open(fd_dst: u32, path: impl Into<String>, mode: OpenMode) -> Self {
        Self {
            fd_dst,
            action: RedirectAction::Open { path: path.into(), mode },
        }
    }

    pub fn read(fd_dst: u32, path: impl Into<String>) -> Self {
        Self::open(fd_dst, path, OpenMode::Read)
    }

    pub fn write(fd_dst: u32, path: impl Into<String>) -> Self {
        Self::open(fd_dst, path, OpenMode::Write)
    }

    pub fn append(fd_dst: u32, path: impl Into<String>) -> Self {
        Self::open(fd_dst, path, OpenMode::Append)
    }

    /// `fd_dst` becomes a copy of `fd_src` (shell `dst>&src`).
    pub fn duplicate(fd_src: u32, fd_dst: u32) -> Self {
        Self {
            fd_dst,
            action: RedirectAction::Duplicate { fd_src },
        }
    }

    pub fn pipe(fd_src: u32, fd_dst: u32, direction: PipeDirection) -> Self {
        Self {
            fd_dst,
            action: RedirectAction::Pipe { fd_src, direction },
        }
    }

    pub fn close(fd_dst: u32) -> Self {
        Self {
            fd_dst,
            action: RedirectAction::Close,
        }
    }

    fn validate(&self) -> Result<()> {
        if let RedirectAction::Open { path, .. } = &self.action {
            if path.is_empty() {
                return Err(Error::invalid(format!("redirect of fd {} has an empty path", self.fd_dst)));
            }
            if path.contains('\0') {
                return Err(Error::invalid("redirect path contains a NUL byte"));
            }
        }
        Ok(())
    }
}

/// Final state of a descriptor in the child after all redirects ran
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    /// Still the caller's descriptor with this number
    Inherited(u32),
    File { path: String, mode: OpenMode },
    Pipe { fd_src: u32, direction: PipeDirection },
    Closed,
}

/// Apply `redirects` in order and report where each touched descriptor ends up.
///
/// Untouched descriptors are inherited and do not appear in the map.
pub fn resolve_redirects(redirects: &[Redirect]) -> BTreeMap<u32, Binding> {
    let mut table: BTreeMap<u32, Binding> = BTreeMap::new();
    for redirect in redirects {
        let binding = match &redirect.action {
            RedirectAction::Open { path, mode } => Binding::File {
                path: path.clone(),
                mode: *mode,
            },
            RedirectAction::Duplicate { fd_src } => table
                .get(fd_src)
                .cloned()
                .unwrap_or(Binding::Inherited(*fd_src)),
            RedirectAction::Pipe { fd_src, direction } => Binding::Pipe {
                fd_src: *fd_src,
                direction: *direction,
            },
            RedirectAction::Close => Binding::Closed,
        };
        table.insert(redirect.fd_dst, binding);
    }
    table
}

/// Everything the host needs to start a process.
///
/// Serialized field names are the wire names of the `spawn` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnDescriptor {
    pub path: String,
    pub args: Vec<String>,
    /// Variables added on top of the inherited environment
    #[serde(rename = "extended_env")]
    pub env_overrides: BTreeMap<String, String>,
    pub background: bool,
    pub redirects: Vec<Redirect>,
}

impl SpawnDescriptor {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            args: Vec::new(),
            env_overrides: BTreeMap::new(),
            background: false,
            redirects: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_overrides.insert(key.into(), value.into());
        self
    }

    pub fn background(mut self, background: bool) -> Self {
        self.background = background;
        self
    }

    pub fn redirect(mut self, redirect: Redirect) -> Self {
        self.redirects.push(redirect);
        self
    }

    /// Local checks done before anything is sent to the host.
    pub fn validate(&self) -> Result<()> {
        if self.path.is_empty() {
            return Err(Error::invalid("spawn path is empty"));
        }
        let strings = std::iter::once(&self.path)
            .chain(self.args.iter())
            .chain(self.env_overrides.iter().flat_map(|(k, v)| [k, v]));
        for s in strings {
            if s.contains('\0') {
                return Err(Error::invalid(format!("spawn argument {:?} contains a NUL byte", s)));
            }
        }
        for key in self.env_overrides.keys() {
            if key.is_empty() || key.contains('=') {
                return Err(Error::invalid(format!("invalid environment key {:?}", key)));
            }
        }
        for redirect in &self.redirects {
            redirect.validate()?;
        }
        Ok(())
    }

    pub fn resolved_redirects(&self) -> BTreeMap<u32, Binding> {
        resolve_redirects(&self.redirects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_later_redirect_wins() {
        let redirects = [Redirect::duplicate(2, 1), Redirect::write(1, "/log")];
        let table = resolve_redirects(&redirects);
        assert_eq!(
            table.get(&1),
            Some(&Binding::File { path: "/log".into(), mode: OpenMode::Write })
        );
        assert_eq!(table.get(&2), None);
    }

    #[test]
    fn test_duplicate_follows_earlier_redirects() {
        // cmd > /out 2>&1
        let redirects = [Redirect::write(1, "/out"), Redirect::duplicate(1, 2)];
        let table = resolve_redirects(&redirects);
        assert_eq!(table.get(&1), table.get(&2));

        // cmd 2>&1 > /out
        let redirects = [Redirect::duplicate(1, 2), Redirect::write(1, "/out")];
        let table = resolve_redirects(&redirects);
        assert_eq!(table.get(&2), Some(&Binding::Inherited(1)));
    }

    #[test]
    fn test_close_and_pipe() {
        let redirects = [
            Redirect::pipe(7, 0, PipeDirection::In),
            Redirect::close(3),
            Redirect::duplicate(3, 4),
        ];
        let table = resolve_redirects(&redirects);
        assert_eq!(table.get(&0), Some(&Binding::Pipe { fd_src: 7, direction: PipeDirection::In }));
        assert_eq!(table.get(&3), Some(&Binding::Closed));
        assert_eq!(table.get(&4), Some(&Binding::Closed));
    }

    #[test]
    fn test_redirect_destination_field() {
        let value = serde_json::to_value(Redirect::write(1, "/log")).unwrap();
        assert_eq!(value["destination_fd"], 1);

        let close: Redirect =
            serde_json::from_str(r#"{"destination_fd":2,"action":"close"}"#).unwrap();
        assert_eq!(close, Redirect::close(2));
    }

    #[test]
    fn test_wire_shape() {
        let desc = SpawnDescriptor::new("/bin/echo")
            .args(["echo", "hi"])
            .env("LANG", "C")
            .redirect(Redirect::write(1, "/tmp/out"))
            .redirect(Redirect::duplicate(1, 2));
        let value = serde_json::to_value(&desc).unwrap();
        assert_eq!(value["path"], "/bin/echo");
        assert_eq!(value["args"][1], "hi");
        assert_eq!(value["extended_env"]["LANG"], "C");
        assert_eq!(value["background"], false);
        assert_eq!(value["redirects"][0]["destination_fd"], 1);
        assert!(value["redirects"][0].get("fd_dst").is_none());
        assert_eq!(value["redirects"][0]["action"], "open");
        assert_eq!(value["redirects"][0]["mode"], "write");
        assert_eq!(value["redirects"][1]["action"], "duplicate");
        assert_eq!(value["redirects"][1]["fd_src"], 1);

        let back: SpawnDescriptor = serde_json::from_value(value).unwrap();
        assert_eq!(back, desc);
    }

    #[test]
    fn test_empty_collections_roundtrip() {
        let desc = SpawnDescriptor::new("/bin/true").background(true);
        let text = serde_json::to_string(&desc).unwrap();
        assert!(text.contains(r#""args":[]"#));
        assert!(text.contains(r#""extended_env":{}"#));
        assert!(text.contains(r#""redirects":[]"#));
        assert_eq!(serde_json::from_str::<SpawnDescriptor>(&text).unwrap(), desc);
    }

    #[test]
    fn test_validate() {
        assert!(SpawnDescriptor::new("").validate().is_err());
        assert!(SpawnDescriptor::new("/bin/sh").env("A=B", "1").validate().is_err());
        assert!(SpawnDescriptor::new("/bin/sh").arg("a\0b").validate().is_err());
        assert!(SpawnDescriptor::new("/bin/sh").redirect(Redirect::read(0, "")).validate().is_err());
        assert!(SpawnDescriptor::new("/bin/sh").arg("-c").validate().is_ok());
    }
}
