//! The syscall surface: a closed request enum, its JSON decoding and the
//! dispatcher that routes each request to the owning subsystem.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{KernelError, KernelResult};
use crate::event_bus::{EventBuilder, EventKind};
use crate::kernel::{ConsoleStream, Kernel, PendingControl};
use crate::manifest::ProgramManifest;
use crate::net::{
    DeliveryHandler, ListenerOwner, ListenerToken, NicInfo, NicKind, Protocol, WifiNetwork,
};
use crate::process::{
    proc_fd_path, FdEntry, FdTarget, JobInfo, Pid, ProcessSpec, PsEntry, Quota, FIRST_FD, SIGTERM,
};
use crate::pty::{self, PtySide};
use crate::snapshot::Snapshot;
use crate::vfs::{
    path, Credentials, FileContent, FsImage, Mode, NodeInfo, NodeKind, OpenFlags, VirtualSource,
};
use crate::window::DrawOptions;

/// Callback installed by `listen`. Programs that issue `listen` by name get
/// a detached listener instead and attach through their executor.
#[derive(Clone)]
pub struct ListenHandler(pub DeliveryHandler);

impl fmt::Debug for ListenHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ListenHandler(..)")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SpawnOptions {
    pub argv: Vec<String>,
    pub name: Option<String>,
    pub manifest: Option<ProgramManifest>,
    pub tty: Option<u32>,
    pub job: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Syscall {
    Open { path: String, flags: String },
    Read { fd: u64, len: usize },
    Write { fd: u64, data: Vec<u8> },
    Close { fd: u64 },
    Spawn { code: String, opts: SpawnOptions },
    Kill { pid: Pid, sig: Option<i32> },
    Reap { pid: Pid },
    Getpid,
    Chdir { path: String },
    Listen { port: u16, proto: Protocol, handler: Option<ListenHandler> },
    Unlisten { token: ListenerToken, proto: Protocol },
    Connect { ip: String, port: u16, proto: Protocol },
    TcpSend { socket: u64, data: Vec<u8> },
    UdpSend { socket: u64, data: Vec<u8> },
    Draw { html: String, opts: DrawOptions },
    Mkdir { path: String, perms: u16 },
    Readdir { path: String },
    Unlink { path: String },
    Rename { old: String, new: String },
    Mount { image: FsImage, path: String },
    Unmount { path: String },
    SetQuota { ms: Option<u64>, mem: Option<u64> },
    Ps,
    Jobs,
    Snapshot,
    SaveSnapshotNamed { name: String },
    LoadSnapshotNamed { name: String },
    Reboot,
    ListNics,
    NicUp { id: String },
    NicDown { id: String },
    NicConfig { id: String, ip: String, netmask: String },
    CreateNic { id: String, mac: String, kind: NicKind },
    RemoveNic { id: String },
    DhcpRequest { id: String },
    WifiScan { id: String },
    WifiJoin { id: String, ssid: String },
    RouteAdd { prefix: String, nic: String },
    RouteDel { prefix: String },
}

impl Syscall {
    /// Name checked against allow-lists.
    pub fn name(&self) -> &'static str {
        match self {
            Syscall::Open { .. } => "open",
            Syscall::Read { .. } => "read",
            Syscall::Write { .. } => "write",
            Syscall::Close { .. } => "close",
            Syscall::Spawn { .. } => "spawn",
            Syscall::Kill { .. } => "kill",
            Syscall::Reap { .. } => "reap",
            Syscall::Getpid => "getpid",
            Syscall::Chdir { .. } => "chdir",
            Syscall::Listen { .. } => "listen",
            Syscall::Unlisten { .. } => "unlisten",
            Syscall::Connect { .. } => "connect",
            Syscall::TcpSend { .. } => "tcp_send",
            Syscall::UdpSend { .. } => "udp_send",
            Syscall::Draw { .. } => "draw",
            Syscall::Mkdir { .. } => "mkdir",
            Syscall::Readdir { .. } => "readdir",
            Syscall::Unlink { .. } => "unlink",
            Syscall::Rename { .. } => "rename",
            Syscall::Mount { .. } => "mount",
            Syscall::Unmount { .. } => "unmount",
            Syscall::SetQuota { .. } => "set_quota",
            Syscall::Ps => "ps",
            Syscall::Jobs => "jobs",
            Syscall::Snapshot => "snapshot",
            Syscall::SaveSnapshotNamed { .. } => "save_snapshot_named",
            Syscall::LoadSnapshotNamed { .. } => "load_snapshot_named",
            Syscall::Reboot => "reboot",
            Syscall::ListNics => "list_nics",
            Syscall::NicUp { .. } => "nic_up",
            Syscall::NicDown { .. } => "nic_down",
            Syscall::NicConfig { .. } => "nic_config",
            Syscall::CreateNic { .. } => "create_nic",
            Syscall::RemoveNic { .. } => "remove_nic",
            Syscall::DhcpRequest { .. } => "dhcp_request",
            Syscall::WifiScan { .. } => "wifi_scan",
            Syscall::WifiJoin { .. } => "wifi_join",
            Syscall::RouteAdd { .. } => "route_add",
            Syscall::RouteDel { .. } => "route_del",
        }
    }

    /// Decode a request the way a program issues it: a call name plus a
    /// JSON object of arguments.
    pub fn from_name(name: &str, args: &Value) -> KernelResult<Self> {
        let args = Args(args);
        let call = match name {
            "open" => Syscall::Open {
                path: args.string("path")?,
                flags: args.opt_string("flags")?.unwrap_or_else(|| "r".into()),
            },
            "read" => Syscall::Read {
                fd: args.u64("fd")?,
                len: args.opt::<usize>("len")?.unwrap_or(usize::MAX),
            },
            "write" => Syscall::Write {
                fd: args.u64("fd")?,
                data: args.data()?,
            },
            "close" => Syscall::Close { fd: args.u64("fd")? },
            "spawn" => Syscall::Spawn {
                code: args.opt_string("code")?.unwrap_or_default(),
                opts: args.opt("opts")?.unwrap_or_default(),
            },
            "kill" => Syscall::Kill {
                pid: args.pid()?,
                sig: args.opt("sig")?,
            },
            "reap" => Syscall::Reap { pid: args.pid()? },
            "getpid" => Syscall::Getpid,
            "chdir" => Syscall::Chdir {
                path: args.string("path")?,
            },
            "listen" => Syscall::Listen {
                port: args.port()?,
                proto: args.proto()?,
                handler: None,
            },
            "unlisten" => Syscall::Unlisten {
                token: ListenerToken::new(args.u64("token")?),
                proto: args.proto()?,
            },
            "connect" => Syscall::Connect {
                ip: args.string("ip")?,
                port: args.port()?,
                proto: args.proto()?,
            },
            "tcp_send" => Syscall::TcpSend {
                socket: args.u64("socket")?,
                data: args.data()?,
            },
            "udp_send" => Syscall::UdpSend {
                socket: args.u64("socket")?,
                data: args.data()?,
            },
            "draw" => Syscall::Draw {
                html: args.string("html")?,
                opts: args.opt("opts")?.unwrap_or_default(),
            },
            "mkdir" => Syscall::Mkdir {
                path: args.string("path")?,
                perms: args.opt("perms")?.unwrap_or(0o755),
            },
            "readdir" => Syscall::Readdir {
                path: args.string("path")?,
            },
            "unlink" => Syscall::Unlink {
                path: args.string("path")?,
            },
            "rename" => Syscall::Rename {
                old: args.string("old")?,
                new: args.string("new")?,
            },
            "mount" => Syscall::Mount {
                image: FsImage::from_json(args.required("image")?)?,
                path: args.string("path")?,
            },
            "unmount" => Syscall::Unmount {
                path: args.string("path")?,
            },
            "set_quota" => Syscall::SetQuota {
                ms: args.opt("ms")?,
                mem: args.opt("mem")?,
            },
            "ps" => Syscall::Ps,
            "jobs" => Syscall::Jobs,
            "snapshot" => Syscall::Snapshot,
            "save_snapshot_named" => Syscall::SaveSnapshotNamed {
                name: args.string("name")?,
            },
            "load_snapshot_named" => Syscall::LoadSnapshotNamed {
                name: args.string("name")?,
            },
            "reboot" => Syscall::Reboot,
            "list_nics" => Syscall::ListNics,
            "nic_up" => Syscall::NicUp { id: args.string("id")? },
            "nic_down" => Syscall::NicDown { id: args.string("id")? },
            "nic_config" => Syscall::NicConfig {
                id: args.string("id")?,
                ip: args.string("ip")?,
                netmask: args.string("netmask")?,
            },
            "create_nic" => Syscall::CreateNic {
                id: args.string("id")?,
                mac: args.string("mac")?,
                kind: match args.opt_string("kind")? {
                    Some(kind) => NicKind::from_str(&kind)
                        .ok_or_else(|| KernelError::invalid(format!("unknown nic kind {kind}")))?,
                    None => NicKind::Wired,
                },
            },
            "remove_nic" => Syscall::RemoveNic { id: args.string("id")? },
            "dhcp_request" => Syscall::DhcpRequest { id: args.string("id")? },
            "wifi_scan" => Syscall::WifiScan { id: args.string("id")? },
            "wifi_join" => Syscall::WifiJoin {
                id: args.string("id")?,
                ssid: args.string("ssid")?,
            },
            "route_add" => Syscall::RouteAdd {
                prefix: args.string("prefix")?,
                nic: args.string("nic")?,
            },
            "route_del" => Syscall::RouteDel {
                prefix: args.string("prefix")?,
            },
            other => return Err(KernelError::UnknownSyscall(other.to_string())),
        };
        Ok(call)
    }
}

struct Args<'a>(&'a Value);

impl Args<'_> {
    fn field(&self, key: &str) -> Option<&Value> {
        self.0.get(key).filter(|value| !value.is_null())
    }

    fn required(&self, key: &str) -> KernelResult<&Value> {
        self.field(key)
            .ok_or_else(|| KernelError::invalid(format!("missing argument `{key}`")))
    }

    fn opt<T: DeserializeOwned>(&self, key: &str) -> KernelResult<Option<T>> {
        self.field(key)
            .map(|value| {
                serde_json::from_value(value.clone())
                    .map_err(|err| KernelError::invalid(format!("argument `{key}`: {err}")))
            })
            .transpose()
    }

    fn string(&self, key: &str) -> KernelResult<String> {
        match self.required(key)? {
            Value::String(value) => Ok(value.clone()),
            _ => Err(KernelError::invalid(format!("argument `{key}` must be a string"))),
        }
    }

    fn opt_string(&self, key: &str) -> KernelResult<Option<String>> {
        self.opt(key)
    }

    fn u64(&self, key: &str) -> KernelResult<u64> {
        self.required(key)?
            .as_u64()
            .ok_or_else(|| KernelError::invalid(format!("argument `{key}` must be an integer")))
    }

    fn pid(&self) -> KernelResult<Pid> {
        let raw = u32::try_from(self.u64("pid")?)
            .map_err(|_| KernelError::invalid("pid out of range"))?;
        Ok(Pid::new(raw))
    }

    fn port(&self) -> KernelResult<u16> {
        u16::try_from(self.u64("port")?).map_err(|_| KernelError::invalid("port out of range"))
    }

    fn proto(&self) -> KernelResult<Protocol> {
        match self.opt_string("proto")? {
            Some(proto) => Protocol::from_str(&proto)
                .ok_or_else(|| KernelError::invalid(format!("unknown protocol {proto}"))),
            None => Ok(Protocol::Tcp),
        }
    }

    /// Payload given either as text under `data` or as `base64`.
    fn data(&self) -> KernelResult<Vec<u8>> {
        if let Some(text) = self.opt_string("data")? {
            return Ok(text.into_bytes());
        }
        let encoded = self.string("base64")?;
        BASE64
            .decode(encoded)
            .map_err(|err| KernelError::invalid(format!("bad base64 payload: {err}")))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyscallReply {
    Unit,
    Fd(u64),
    Data(Vec<u8>),
    Count(usize),
    Status(i32),
    Pid(Pid),
    Token(ListenerToken),
    Socket(u64),
    Window(u32),
    Node(NodeInfo),
    Nodes(Vec<NodeInfo>),
    Quota(Quota),
    Ps(Vec<PsEntry>),
    Jobs(Vec<JobInfo>),
    Snapshot(Box<Snapshot>),
    Nic(NicInfo),
    Nics(Vec<NicInfo>),
    Networks(Vec<WifiNetwork>),
}

impl SyscallReply {
    pub fn to_json(&self) -> Value {
        match self {
            SyscallReply::Unit => Value::Null,
            SyscallReply::Fd(fd) => json!(fd),
            SyscallReply::Data(bytes) => json!({
                "text": String::from_utf8_lossy(bytes),
                "base64": BASE64.encode(bytes),
            }),
            SyscallReply::Count(count) => json!(count),
            SyscallReply::Status(status) => json!(status),
            SyscallReply::Pid(pid) => json!(pid.raw()),
            SyscallReply::Token(token) => json!(token.raw()),
            SyscallReply::Socket(id) => json!(id),
            SyscallReply::Window(id) => json!(id),
            SyscallReply::Node(node) => to_value(node),
            SyscallReply::Nodes(nodes) => to_value(nodes),
            SyscallReply::Quota(quota) => to_value(quota),
            SyscallReply::Ps(rows) => to_value(rows),
            SyscallReply::Jobs(jobs) => to_value(jobs),
            SyscallReply::Snapshot(snapshot) => to_value(snapshot.as_ref()),
            SyscallReply::Nic(nic) => to_value(nic),
            SyscallReply::Nics(nics) => to_value(nics),
            SyscallReply::Networks(networks) => to_value(networks),
        }
    }

    pub fn fd(&self) -> Option<u64> {
        match self {
            SyscallReply::Fd(fd) => Some(*fd),
            _ => None,
        }
    }

    pub fn data(&self) -> Option<&[u8]> {
        match self {
            SyscallReply::Data(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<i32> {
        match self {
            SyscallReply::Status(status) => Some(*status),
            _ => None,
        }
    }

    pub fn pid(&self) -> Option<Pid> {
        match self {
            SyscallReply::Pid(pid) => Some(*pid),
            _ => None,
        }
    }

    pub fn token(&self) -> Option<ListenerToken> {
        match self {
            SyscallReply::Token(token) => Some(*token),
            _ => None,
        }
    }

    pub fn socket(&self) -> Option<u64> {
        match self {
            SyscallReply::Socket(id) => Some(*id),
            _ => None,
        }
    }
}

fn to_value(value: impl Serialize) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

impl Kernel {
    /// Run one syscall for `pid` to completion.
    pub async fn dispatch(&mut self, pid: Pid, call: Syscall) -> KernelResult<SyscallReply> {
        let name = call.name();
        let pcb = self.processes.get(pid)?;
        if pcb.exited {
            return Err(KernelError::InvalidProcess(pid.raw()));
        }
        if !pcb.permits(name) {
            warn!("pid {pid} denied syscall {name}");
            self.events.publish(
                &mut self.clock,
                EventBuilder::new(pid, EventKind::SyscallDenied).detail(json!({ "syscall": name })),
            );
            return Err(KernelError::SyscallNotPermitted(name.to_string()));
        }
        let cred = pcb.credentials();
        let cwd = pcb.cwd.clone();
        debug!("pid {pid} syscall {name}");

        match call {
            Syscall::Open { path, flags } => {
                let path = path::resolve(&cwd, &path)?;
                self.sys_open(pid, &path, &flags, cred).await
            }
            Syscall::Read { fd, len } => self.sys_read(pid, fd, len).await,
            Syscall::Write { fd, data } => self.sys_write(pid, fd, data).await,
            Syscall::Close { fd } => self.sys_close(pid, fd).await,
            Syscall::Spawn { code, opts } => self.sys_spawn(pid, code, opts).await,
            Syscall::Kill { pid: target, sig } => {
                let killed = self.kill(target, sig.unwrap_or(SIGTERM));
                Ok(SyscallReply::Status(if killed { 0 } else { -1 }))
            }
            Syscall::Reap { pid: target } => Ok(SyscallReply::Status(self.reap(target).await?)),
            Syscall::Getpid => Ok(SyscallReply::Pid(pid)),
            Syscall::Chdir { path } => {
                let path = path::resolve(&cwd, &path)?;
                let node = self.fs.stat(&path).await?;
                if node.kind != NodeKind::Directory {
                    return Err(KernelError::NotDirectory(path));
                }
                self.processes.get_mut(pid)?.cwd = path;
                Ok(SyscallReply::Unit)
            }
            Syscall::Listen {
                port,
                proto,
                handler,
            } => {
                let token = self.net.mux_mut(proto).listen(
                    port,
                    ListenerOwner::Process(pid),
                    handler.map(|handler| handler.0),
                )?;
                Ok(SyscallReply::Token(token))
            }
            Syscall::Unlisten { token, proto } => {
                let mux = self.net.mux_mut(proto);
                let owned = mux
                    .listener(token)
                    .is_some_and(|listener| listener.owner == ListenerOwner::Process(pid));
                let removed = owned && mux.unlisten(token);
                Ok(SyscallReply::Status(if removed { 0 } else { -1 }))
            }
            Syscall::Connect { ip, port, proto } => {
                let socket = self.net.mux_mut(proto).connect(&ip, port, Some(pid));
                Ok(SyscallReply::Socket(socket))
            }
            Syscall::TcpSend { socket, data } => self.sys_send(Protocol::Tcp, socket, &data),
            Syscall::UdpSend { socket, data } => self.sys_send(Protocol::Udp, socket, &data),
            Syscall::Draw { html, opts } => {
                Ok(SyscallReply::Window(self.windows.create(pid, html, opts)))
            }
            Syscall::Mkdir { path, perms } => {
                let path = path::resolve(&cwd, &path)?;
                let node = self.fs.mkdir(&path, Mode::new(perms), cred).await?;
                Ok(SyscallReply::Node(node))
            }
            Syscall::Readdir { path } => {
                let path = path::resolve(&cwd, &path)?;
                Ok(SyscallReply::Nodes(self.fs.readdir(&path, cred).await?))
            }
            Syscall::Unlink { path } => {
                let path = path::resolve(&cwd, &path)?;
                self.fs.unlink(&path, cred).await?;
                Ok(SyscallReply::Unit)
            }
            Syscall::Rename { old, new } => {
                let old = path::resolve(&cwd, &old)?;
                let new = path::resolve(&cwd, &new)?;
                self.fs.rename(&old, &new, cred).await?;
                Ok(SyscallReply::Unit)
            }
            Syscall::Mount { image, path } => {
                let path = path::resolve(&cwd, &path)?;
                let copied = self.fs.mount(&image, &path).await?;
                self.events.publish(
                    &mut self.clock,
                    EventBuilder::new(pid, EventKind::Mounted)
                        .detail(json!({ "path": path, "nodes": copied })),
                );
                Ok(SyscallReply::Count(copied))
            }
            Syscall::Unmount { path } => {
                let path = path::resolve(&cwd, &path)?;
                self.fs.unmount(&path).await?;
                self.events.publish(
                    &mut self.clock,
                    EventBuilder::new(pid, EventKind::Unmounted).detail(json!({ "path": path })),
                );
                Ok(SyscallReply::Unit)
            }
            Syscall::SetQuota { ms, mem } => {
                let pcb = self.processes.get_mut(pid)?;
                if let Some(ms) = ms {
                    pcb.quota.quota_ms = ms;
                }
                if let Some(mem) = mem {
                    pcb.quota.quota_mem = mem;
                }
                Ok(SyscallReply::Quota(pcb.quota))
            }
            Syscall::Ps => Ok(SyscallReply::Ps(self.processes.ps())),
            Syscall::Jobs => Ok(SyscallReply::Jobs(self.processes.jobs())),
            Syscall::Snapshot => Ok(SyscallReply::Snapshot(Box::new(self.snapshot().await?))),
            Syscall::SaveSnapshotNamed { name } => {
                self.save_snapshot(&name).await?;
                Ok(SyscallReply::Unit)
            }
            Syscall::LoadSnapshotNamed { name } => {
                if !self.snapshots.contains(&name) {
                    return Err(KernelError::NotFound(name));
                }
                self.pending_control = Some(PendingControl::LoadSnapshot(name));
                Ok(SyscallReply::Unit)
            }
            Syscall::Reboot => {
                self.pending_control = Some(PendingControl::Reboot);
                Ok(SyscallReply::Unit)
            }
            Syscall::ListNics => Ok(SyscallReply::Nics(self.net.list_nics())),
            Syscall::NicUp { id } => Ok(SyscallReply::Nic(self.net.nic_up(&id)?)),
            Syscall::NicDown { id } => Ok(SyscallReply::Nic(self.net.nic_down(&id)?)),
            Syscall::NicConfig { id, ip, netmask } => {
                Ok(SyscallReply::Nic(self.net.nic_config(&id, &ip, &netmask)?))
            }
            Syscall::CreateNic { id, mac, kind } => {
                Ok(SyscallReply::Nic(self.net.create_nic(&id, &mac, kind)?))
            }
            Syscall::RemoveNic { id } => {
                self.net.remove_nic(&id)?;
                Ok(SyscallReply::Unit)
            }
            Syscall::DhcpRequest { id } => Ok(SyscallReply::Nic(self.net.dhcp_request(&id)?)),
            Syscall::WifiScan { id } => Ok(SyscallReply::Networks(self.net.wifi_scan(&id)?)),
            Syscall::WifiJoin { id, ssid } => {
                Ok(SyscallReply::Nic(self.net.wifi_join(&id, &ssid)?))
            }
            Syscall::RouteAdd { prefix, nic } => {
                self.net.route_add(&prefix, &nic)?;
                Ok(SyscallReply::Unit)
            }
            Syscall::RouteDel { prefix } => {
                let removed = self.net.route_del(&prefix);
                Ok(SyscallReply::Status(if removed { 0 } else { -1 }))
            }
        }
    }

    async fn sys_open(
        &mut self,
        pid: Pid,
        path: &str,
        flags: &str,
        cred: Credentials,
    ) -> KernelResult<SyscallReply> {
        let flags = OpenFlags::parse(flags)?;
        let target = match pty::parse_path(path) {
            Some((id, side)) => {
                if !self.ptys.contains(id) {
                    return Err(KernelError::NotFound(path.to_string()));
                }
                FdTarget::Pty { id, side }
            }
            None => {
                let node = self.fs.open(path, flags, cred).await?;
                match self.fs.read(path).await? {
                    FileContent::Virtual(source) if node.is_virtual => FdTarget::Virtual {
                        path: path.to_string(),
                        source,
                    },
                    _ => FdTarget::File {
                        path: path.to_string(),
                    },
                }
            }
        };

        let fd = self
            .processes
            .get_mut(pid)?
            .insert_fd(FdEntry::new(target, flags));
        self.fs
            .insert_virtual(
                &proc_fd_path(pid, fd),
                VirtualSource::ProcFd { pid: pid.raw(), fd },
            )
            .await?;
        Ok(SyscallReply::Fd(fd))
    }

    async fn sys_read(&mut self, pid: Pid, fd: u64, len: usize) -> KernelResult<SyscallReply> {
        match fd {
            0 => {
                let tty = self.processes.get(pid)?.tty;
                let data = match tty {
                    Some(id) if self.ptys.contains(id) => self.ptys.read(id, PtySide::Slave, len)?,
                    _ => Vec::new(),
                };
                return Ok(SyscallReply::Data(data));
            }
            1 | 2 => return Err(KernelError::BadDescriptor(fd)),
            _ => {}
        }

        let entry = self.processes.get(pid)?.fd(fd)?.clone();
        if !entry.flags.read {
            return Err(KernelError::BadDescriptor(fd));
        }
        let content = match &entry.target {
            FdTarget::Pty { id, side } => {
                return Ok(SyscallReply::Data(self.ptys.read(*id, *side, len)?));
            }
            FdTarget::Virtual { source, .. } => self.render_virtual(source)?,
            FdTarget::File { path } => match self.fs.read(path).await? {
                FileContent::Stored(bytes) => bytes,
                FileContent::Virtual(source) => self.render_virtual(&source)?,
            },
        };

        let start = entry.offset.min(content.len());
        let end = start.saturating_add(len).min(content.len());
        self.processes.get_mut(pid)?.fd_mut(fd)?.offset = end;
        Ok(SyscallReply::Data(content[start..end].to_vec()))
    }

    async fn sys_write(&mut self, pid: Pid, fd: u64, data: Vec<u8>) -> KernelResult<SyscallReply> {
        let stream = match fd {
            0 => return Err(KernelError::BadDescriptor(fd)),
            1 => Some(ConsoleStream::Stdout),
            2 => Some(ConsoleStream::Stderr),
            _ => None,
        };
        if let Some(stream) = stream {
            let written = data.len();
            self.console.push(pid, stream, data);
            return Ok(SyscallReply::Count(written));
        }

        let entry = self.processes.get(pid)?.fd(fd)?.clone();
        if !entry.flags.writes() {
            return Err(KernelError::BadDescriptor(fd));
        }
        match &entry.target {
            FdTarget::Pty { id, side } => Ok(SyscallReply::Count(self.ptys.write(*id, *side, &data)?)),
            FdTarget::Virtual { path, .. } => Err(KernelError::PermissionDenied(path.clone())),
            FdTarget::File { path } => {
                let offset = if entry.flags.append {
                    self.fs.append(path, &data).await?;
                    self.fs.stat(path).await?.size
                } else {
                    self.fs.write_at(path, entry.offset, &data).await?;
                    entry.offset + data.len()
                };
                self.processes.get_mut(pid)?.fd_mut(fd)?.offset = offset;
                Ok(SyscallReply::Count(data.len()))
            }
        }
    }

    async fn sys_close(&mut self, pid: Pid, fd: u64) -> KernelResult<SyscallReply> {
        if fd < FIRST_FD || self.processes.get(pid)?.fd(fd).is_err() {
            return Ok(SyscallReply::Status(-1));
        }
        self.fs.remove_tree(&proc_fd_path(pid, fd)).await?;
        self.processes.get_mut(pid)?.fds.remove(&fd);
        Ok(SyscallReply::Status(0))
    }

    async fn sys_spawn(
        &mut self,
        pid: Pid,
        code: String,
        opts: SpawnOptions,
    ) -> KernelResult<SyscallReply> {
        let manifest = match opts.manifest {
            Some(manifest) => Some(manifest),
            None => ProgramManifest::from_source(&code)?,
        };
        if let Some(tty) = opts.tty {
            if !self.ptys.contains(tty) {
                return Err(KernelError::NotFound(pty::slave_path(tty)));
            }
        }

        let parent = self.processes.get(pid)?;
        let inherited = parent.allow_list.clone();
        let mut spec = ProcessSpec::new(code)
            .with_parent(parent)
            .with_argv(opts.argv);
        if let Some(name) = opts.name {
            spec = spec.with_name(name);
        }
        if let Some(tty) = opts.tty {
            spec = spec.with_tty(tty);
        }
        if let Some(job) = opts.job {
            spec = spec.with_job(job);
        }
        if let Some(manifest) = &manifest {
            spec = spec.with_manifest(manifest);
        }
        // A child never holds a syscall its parent was denied.
        spec.allow_list = match (inherited, spec.allow_list.take()) {
            (Some(parent), Some(child)) => Some(parent.intersection(&child).cloned().collect()),
            (Some(parent), None) => Some(parent),
            (None, child) => child,
        };

        Ok(SyscallReply::Pid(self.spawn(spec).await?))
    }

    fn sys_send(&mut self, protocol: Protocol, socket: u64, data: &[u8]) -> KernelResult<SyscallReply> {
        let from = self.net.local_ip();
        self.net.mux_mut(protocol).send(socket, data, &from)?;
        Ok(SyscallReply::Count(data.len()))
    }

    /// Evaluate a `/proc` node against the live process table.
    pub(crate) fn render_virtual(&self, source: &VirtualSource) -> KernelResult<Vec<u8>> {
        let lookup = |pid: u32, what: &str| {
            self.processes
                .get(Pid::new(pid))
                .map_err(|_| KernelError::NotFound(format!("/proc/{pid}/{what}")))
        };
        let rendered = match source {
            VirtualSource::ProcStatus { pid } => lookup(*pid, "status")?.render_status(),
            VirtualSource::ProcCmdline { pid } => lookup(*pid, "cmdline")?.render_cmdline(),
            VirtualSource::ProcFd { pid, fd } => lookup(*pid, "fd")?.fd(*fd)?.target.path(),
        };
        Ok(rendered.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip_through_from_name() {
        let calls = [
            ("open", json!({"path": "/a", "flags": "w"})),
            ("write", json!({"fd": 3, "data": "hi"})),
            ("kill", json!({"pid": 2})),
            ("listen", json!({"port": 80, "proto": "udp"})),
            ("set_quota", json!({"ms": 10})),
            ("create_nic", json!({"id": "wl0", "mac": "AA", "kind": "wifi"})),
            ("route_del", json!({"prefix": "10."})),
            ("ps", json!({})),
        ];
        for (name, args) in calls {
            let call = Syscall::from_name(name, &args).expect(name);
            assert_eq!(call.name(), name);
        }
    }

    #[test]
    fn unknown_names_and_bad_arguments_are_distinct() {
        let err = Syscall::from_name("fork", &json!({})).unwrap_err();
        assert_eq!(err, KernelError::UnknownSyscall("fork".into()));
        assert_eq!(err.errno_name(), "ENOSYS");

        let err = Syscall::from_name("read", &json!({"fd": "three"})).unwrap_err();
        assert_eq!(err.errno_name(), "EINVAL");
        let err = Syscall::from_name("listen", &json!({"port": 70000})).unwrap_err();
        assert_eq!(err.errno_name(), "EINVAL");
    }

    #[test]
    fn payloads_accept_text_or_base64() {
        let Syscall::Write { data, .. } =
            Syscall::from_name("write", &json!({"fd": 1, "base64": "aGk="})).expect("decode")
        else {
            panic!("expected write");
        };
        assert_eq!(data, b"hi");

        let Syscall::Spawn { code, opts } = Syscall::from_name(
            "spawn",
            &json!({"code": "x", "opts": {"argv": ["cat"], "job": "cat"}}),
        )
        .expect("decode") else {
            panic!("expected spawn");
        };
        assert_eq!(code, "x");
        assert_eq!(opts.argv, vec!["cat".to_string()]);
        assert_eq!(opts.job.as_deref(), Some("cat"));
    }

    #[test]
    fn data_replies_render_text_and_base64() {
        let json = SyscallReply::Data(b"hi".to_vec()).to_json();
        assert_eq!(json["text"], "hi");
        assert_eq!(json["base64"], "aGk=");
        assert_eq!(SyscallReply::Status(-1).to_json(), json!(-1));
    }
}
