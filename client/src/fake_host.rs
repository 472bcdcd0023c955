//! In-process host for tests.
//!
//! Decodes real request payloads, applies spawn redirects in order and keeps
//! just enough state to check what the bridge asked for.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use sandbridge_shared::ioctl::{DescriptorCommand, TIOCGWINSZ, TIOCSWINSZ};
use sandbridge_shared::protocol::{
    decode_payload, AttachSigintArgs, ChdirArgs, Command, EventSourceArgs, HtermArgs, HtermMethod,
    IoctlArgs, IsattyArgs, KillArgs, MknodArgs, MountArgs, SetEchoArgs, SetEnvArgs, UmountArgs,
};
use sandbridge_shared::spawn::{Binding, SpawnDescriptor};
use sandbridge_shared::{Errno, Error, Result};

use crate::gateway::Gateway;

const EEXIST: Errno = Errno(20);

pub(crate) struct FakeHost {
    pub calls: Vec<Command>,
    pub failures: HashMap<Command, Errno>,
    pub dirs: BTreeSet<String>,
    pub cwd: String,
    pub chdir_count: usize,
    pub env: BTreeMap<String, String>,
    pub echo: bool,
    pub ttys: BTreeSet<u32>,
    pub term: BTreeMap<String, String>,
    pub event_fds: BTreeMap<u32, u32>,
    pub next_fd: u32,
    pub sigint_fd: Option<u32>,
    pub executables: BTreeSet<String>,
    pub spawned: Vec<(SpawnDescriptor, BTreeMap<u32, Binding>)>,
    pub next_pid: i32,
    pub killed: Vec<(i32, i32)>,
    pub mounts: Vec<MountArgs>,
    pub nodes: BTreeMap<String, u64>,
    pub winsize: [u8; 8],
}

impl FakeHost {
    pub fn new() -> Self {
        let set = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>();
        Self {
            calls: Vec::new(),
            failures: HashMap::new(),
            dirs: set(&["/", "/tmp", "/home", "/home/user"]),
            cwd: "/".to_string(),
            chdir_count: 0,
            env: BTreeMap::new(),
            echo: true,
            ttys: [0, 1, 2].into_iter().collect(),
            term: BTreeMap::new(),
            event_fds: BTreeMap::new(),
            next_fd: 10,
            sigint_fd: None,
            executables: set(&["/bin/echo", "/bin/sh", "/bin/true"]),
            spawned: Vec::new(),
            next_pid: 100,
            killed: Vec::new(),
            mounts: Vec::new(),
            nodes: BTreeMap::new(),
            winsize: [24, 0, 80, 0, 0, 0, 0, 0],
        }
    }

    /// Make every following `command` fail with `errno`.
    pub fn fail(&mut self, command: Command, errno: Errno) {
        self.failures.insert(command, errno);
    }

    pub fn clear_failures(&mut self) {
        self.failures.clear();
    }

    fn serve(&mut self, command: Command, payload: &[u8]) -> Result<Vec<u8>> {
        let reply = match command {
            Command::Chdir => {
                let args: ChdirArgs = decode_payload(payload)?;
                if !self.dirs.contains(&args.dir) {
                    return Err(Error::Host(Errno::NOENT));
                }
                self.cwd = args.dir;
                self.chdir_count += 1;
                Vec::new()
            }
            Command::Getcwd => self.cwd.clone().into_bytes(),
            Command::Isatty => {
                let args: IsattyArgs = decode_payload(payload)?;
                let answer = if self.ttys.contains(&args.fd) { 1 } else { 0 };
                answer.to_string().into_bytes()
            }
            Command::SetEnv => {
                let args: SetEnvArgs = decode_payload(payload)?;
                match args.value {
                    Some(v) => {
                        self.env.insert(args.key, v);
                    }
                    None => {
                        self.env.remove(&args.key);
                    }
                }
                Vec::new()
            }
            Command::Getpid => b"1".to_vec(),
            Command::SetEcho => {
                let args: SetEchoArgs = decode_payload(payload)?;
                self.echo = args.echo;
                Vec::new()
            }
            Command::Hterm => {
                let args: HtermArgs = decode_payload(payload)?;
                match args.method {
                    HtermMethod::Set => {
                        let val = args.val.ok_or(Error::Host(Errno::INVAL))?;
                        self.term.insert(args.attrib, val);
                        Vec::new()
                    }
                    HtermMethod::Get => self
                        .term
                        .get(&args.attrib)
                        .ok_or(Error::Host(Errno::INVAL))?
                        .clone()
                        .into_bytes(),
                }
            }
            Command::EventSourceFd => {
                let args: EventSourceArgs = decode_payload(payload)?;
                let fd = self.next_fd;
                self.next_fd += 1;
                self.event_fds.insert(fd, args.event_mask);
                fd.to_string().into_bytes()
            }
            Command::AttachSigint => {
                let args: AttachSigintArgs = decode_payload(payload)?;
                if !self.event_fds.contains_key(&args.event_source_fd) {
                    return Err(Error::Host(Errno::BADF));
                }
                self.sigint_fd = Some(args.event_source_fd);
                Vec::new()
            }
            Command::CleanInodes => Vec::new(),
            Command::Spawn => {
                let desc: SpawnDescriptor = decode_payload(payload)?;
                if !self.executables.contains(&desc.path) {
                    return Err(Error::Host(Errno::NOENT));
                }
                let bindings = desc.resolved_redirects();
                let pid = self.next_pid;
                self.next_pid += 1;
                self.spawned.push((desc, bindings));
                pid.to_string().into_bytes()
            }
            Command::Kill => {
                let args: KillArgs = decode_payload(payload)?;
                let known = (100..self.next_pid).contains(&args.process_id);
                if !known {
                    return Err(Error::Host(Errno::SRCH));
                }
                self.killed.push((args.process_id, args.signal));
                Vec::new()
            }
            Command::Mount => {
                let args: MountArgs = decode_payload(payload)?;
                self.mounts.push(args);
                Vec::new()
            }
            Command::Umount => {
                let args: UmountArgs = decode_payload(payload)?;
                let before = self.mounts.len();
                self.mounts.retain(|m| m.target != args.path);
                if self.mounts.len() == before {
                    return Err(Error::Host(Errno::INVAL));
                }
                Vec::new()
            }
            Command::Mknod => {
                let args: MknodArgs = decode_payload(payload)?;
                if self.nodes.contains_key(&args.path) {
                    return Err(Error::Host(EEXIST));
                }
                self.nodes.insert(args.path, args.dev);
                Vec::new()
            }
            Command::Ioctl => {
                let args: IoctlArgs = decode_payload(payload)?;
                let cmd = DescriptorCommand::unpack(args.cmd);
                if !self.ttys.contains(&args.fd) {
                    return Err(Error::Host(Errno::NOTTY));
                }
                if cmd == TIOCGWINSZ {
                    self.winsize.to_vec()
                } else if cmd == TIOCSWINSZ {
                    let arg = args.arg.ok_or(Error::Host(Errno::INVAL))?;
                    self.winsize.copy_from_slice(&arg);
                    Vec::new()
                } else {
                    return Err(Error::Host(Errno::NOTTY));
                }
            }
        };
        Ok(reply)
    }
}

impl Gateway for FakeHost {
    fn invoke(&mut self, command: Command, payload: &[u8], output: &mut [u8]) -> Result<usize> {
        self.calls.push(command);
        if let Some(errno) = self.failures.get(&command) {
            return Err(Error::Host(*errno));
        }
        let reply = self.serve(command, payload)?;
        if reply.len() > output.len() {
            return Err(Error::Truncated {
                needed: reply.len(),
                capacity: output.len(),
            });
        }
        output[..reply.len()].copy_from_slice(&reply);
        Ok(reply.len())
    }
}
