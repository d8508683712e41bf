//! Whole-machine snapshots.
//!
//! Live state is walked into [`SerializedValue`] envelopes: every ordered
//! map, set, byte buffer and network table carries an explicit `kind` tag,
//! so the document survives any text medium and decodes without guessing.
//! Only deterministic containers are used, so the same state always yields
//! the same text and the same digest.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::{info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::KernelResult;
use crate::event_bus::{EventBuilder, EventKind};
use crate::kernel::Kernel;
use crate::net::{
    Delivery, Frame, LinkStatus, ListenerOwner, ListenerState, ListenerToken, MuxState, Nic,
    NicKind, PeerAddr, Protocol, Route, Socket,
};
use crate::process::{register_proc, unregister_proc, FdEntry, IsolateId, Job, Pcb, Pid, Quota, Usage};
use crate::pty::PtyState;
use crate::service::{delivery_handler, ServiceRecord};
use crate::vfs::{FsNode, FsState, Mode, MountRecord, NodeContent, VirtualSource, PROC_ROOT};
use crate::window::Window;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("expected a {expected} envelope, found {found}")]
    UnexpectedKind {
        expected: &'static str,
        found: &'static str,
    },
    #[error("missing field `{0}`")]
    MissingField(String),
    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: String, reason: String },
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),
    #[error("malformed snapshot document: {0}")]
    Malformed(String),
    #[error("no snapshot named {0}")]
    NotFound(String),
    #[error("snapshot store: {0}")]
    Io(String),
}

fn invalid(field: &str, reason: impl ToString) -> SnapshotError {
    SnapshotError::InvalidField {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

/// Tagged envelope for every non-primitive value in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum SerializedValue {
    Map {
        entries: Vec<(SerializedValue, SerializedValue)>,
    },
    Set {
        items: Vec<SerializedValue>,
    },
    Bytes {
        base64: String,
    },
    NicState {
        id: String,
        mac: String,
        ip: Option<String>,
        netmask: Option<String>,
        status: LinkStatus,
        #[serde(rename = "type")]
        nic_type: NicKind,
        ssid: Option<String>,
        rx: Vec<SerializedValue>,
        tx: Vec<SerializedValue>,
    },
    TcpState(SocketTableState),
    UdpState(SocketTableState),
    Plain {
        value: Value,
    },
}

/// Body shared by the TCP and UDP envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketTableState {
    pub listeners: Vec<SerializedValue>,
    pub sockets: Vec<SerializedValue>,
    pub next_socket: u64,
    pub next_token: u64,
    pub next_ephemeral: u16,
}

type Entries = [(SerializedValue, SerializedValue)];

impl SerializedValue {
    pub fn plain(value: impl Serialize) -> Self {
        SerializedValue::Plain {
            value: serde_json::to_value(value).unwrap_or(Value::Null),
        }
    }

    pub fn bytes(data: &[u8]) -> Self {
        SerializedValue::Bytes {
            base64: BASE64.encode(data),
        }
    }

    /// Ordered sequence encoded as a map keyed by position.
    pub fn list(items: impl IntoIterator<Item = SerializedValue>) -> Self {
        SerializedValue::Map {
            entries: items
                .into_iter()
                .enumerate()
                .map(|(index, item)| (SerializedValue::plain(index), item))
                .collect(),
        }
    }

    fn record(fields: Vec<(&str, SerializedValue)>) -> Self {
        SerializedValue::Map {
            entries: fields
                .into_iter()
                .map(|(name, value)| (SerializedValue::plain(name), value))
                .collect(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SerializedValue::Map { .. } => "Map",
            SerializedValue::Set { .. } => "Set",
            SerializedValue::Bytes { .. } => "Bytes",
            SerializedValue::NicState { .. } => "NicState",
            SerializedValue::TcpState(_) => "TcpState",
            SerializedValue::UdpState(_) => "UdpState",
            SerializedValue::Plain { .. } => "Plain",
        }
    }

    fn unexpected(&self, expected: &'static str) -> SnapshotError {
        SnapshotError::UnexpectedKind {
            expected,
            found: self.kind(),
        }
    }

    pub fn as_map(&self) -> Result<&Entries, SnapshotError> {
        match self {
            SerializedValue::Map { entries } => Ok(entries),
            other => Err(other.unexpected("Map")),
        }
    }

    pub fn as_set(&self) -> Result<&[SerializedValue], SnapshotError> {
        match self {
            SerializedValue::Set { items } => Ok(items),
            other => Err(other.unexpected("Set")),
        }
    }

    pub fn as_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        match self {
            SerializedValue::Bytes { base64 } => BASE64
                .decode(base64)
                .map_err(|err| invalid("base64", err)),
            other => Err(other.unexpected("Bytes")),
        }
    }

    pub fn as_plain<T: DeserializeOwned>(&self) -> Result<T, SnapshotError> {
        match self {
            SerializedValue::Plain { value } => {
                serde_json::from_value(value.clone()).map_err(|err| invalid("value", err))
            }
            other => Err(other.unexpected("Plain")),
        }
    }

    /// Values of a position-keyed map, in order.
    pub fn as_list(&self) -> Result<Vec<&SerializedValue>, SnapshotError> {
        Ok(self.as_map()?.iter().map(|(_, value)| value).collect())
    }
}

/// Named-field view over a `Map` envelope.
struct Record<'a> {
    entries: &'a Entries,
}

impl<'a> Record<'a> {
    fn new(value: &'a SerializedValue) -> Result<Self, SnapshotError> {
        Ok(Self {
            entries: value.as_map()?,
        })
    }

    fn get(&self, name: &str) -> Result<&'a SerializedValue, SnapshotError> {
        self.entries
            .iter()
            .find(|(key, _)| matches!(key, SerializedValue::Plain { value } if value == name))
            .map(|(_, value)| value)
            .ok_or_else(|| SnapshotError::MissingField(name.to_string()))
    }

    fn plain<T: DeserializeOwned>(&self, name: &str) -> Result<T, SnapshotError> {
        self.get(name)?.as_plain().map_err(|err| rename_field(err, name))
    }

    fn bytes(&self, name: &str) -> Result<Vec<u8>, SnapshotError> {
        self.get(name)?.as_bytes().map_err(|err| rename_field(err, name))
    }
}

fn rename_field(err: SnapshotError, name: &str) -> SnapshotError {
    match err {
        SnapshotError::InvalidField { reason, .. } => invalid(name, reason),
        other => other,
    }
}

/// Frozen machine state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub version: u32,
    pub hostname: String,
    pub fs: SerializedValue,
    pub processes: SerializedValue,
    pub fd_tables: SerializedValue,
    pub jobs: SerializedValue,
    pub windows: SerializedValue,
    pub nics: SerializedValue,
    pub tcp: SerializedValue,
    pub udp: SerializedValue,
    pub routes: SerializedValue,
    pub services: SerializedValue,
    pub ptys: SerializedValue,
    pub ready: Vec<Pid>,
    pub next_pid: u32,
    pub next_isolate: u64,
    pub next_job: u32,
    pub next_window: u32,
    pub next_pty: u32,
    pub init_pid: Option<Pid>,
}

impl Snapshot {
    pub fn to_json(&self) -> Result<String, SnapshotError> {
        serde_json::to_string_pretty(self).map_err(|err| SnapshotError::Malformed(err.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, SnapshotError> {
        let snapshot: Snapshot =
            serde_json::from_str(text).map_err(|err| SnapshotError::Malformed(err.to_string()))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(snapshot.version));
        }
        Ok(snapshot)
    }

    /// SHA-256 of the JSON text, hex encoded.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        if let Ok(text) = self.to_json() {
            hasher.update(text.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

fn encode_node(node: &FsNode) -> SerializedValue {
    let (kind, content) = match &node.content {
        NodeContent::File(data) => ("file", SerializedValue::bytes(data)),
        NodeContent::Directory => ("directory", SerializedValue::plain(Value::Null)),
        NodeContent::Virtual(source) => ("virtual", SerializedValue::plain(source)),
    };
    SerializedValue::record(vec![
        ("path", SerializedValue::plain(&node.path)),
        ("kind", SerializedValue::plain(kind)),
        ("mode", SerializedValue::plain(node.mode.bits())),
        ("uid", SerializedValue::plain(node.uid)),
        ("gid", SerializedValue::plain(node.gid)),
        ("created", SerializedValue::plain(node.created)),
        ("modified", SerializedValue::plain(node.modified)),
        ("content", content),
    ])
}

fn decode_node(value: &SerializedValue) -> Result<FsNode, SnapshotError> {
    let record = Record::new(value)?;
    let kind: String = record.plain("kind")?;
    let content = match kind.as_str() {
        "file" => NodeContent::File(record.bytes("content")?),
        "directory" => NodeContent::Directory,
        "virtual" => NodeContent::Virtual(record.plain::<VirtualSource>("content")?),
        other => return Err(invalid("kind", format!("unknown node kind {other}"))),
    };
    Ok(FsNode {
        path: record.plain("path")?,
        mode: Mode::new(record.plain("mode")?),
        uid: record.plain("uid")?,
        gid: record.plain("gid")?,
        created: record.plain("created")?,
        modified: record.plain("modified")?,
        content,
    })
}

fn encode_fs(state: &FsState) -> SerializedValue {
    let nodes = SerializedValue::Map {
        entries: state
            .nodes
            .iter()
            .map(|(path, node)| (SerializedValue::plain(path), encode_node(node)))
            .collect(),
    };
    let mounts = SerializedValue::list(state.mounts.iter().map(|mount| {
        SerializedValue::record(vec![
            ("path", SerializedValue::plain(&mount.path)),
            ("introduced", SerializedValue::plain(&mount.introduced)),
            (
                "shadowed",
                SerializedValue::list(mount.shadowed.iter().map(encode_node)),
            ),
        ])
    }));
    SerializedValue::record(vec![
        ("nodes", nodes),
        ("mounts", mounts),
        ("clock", SerializedValue::plain(state.clock)),
    ])
}

fn decode_fs(value: &SerializedValue) -> Result<FsState, SnapshotError> {
    let record = Record::new(value)?;
    let mut nodes = BTreeMap::new();
    for (_, node) in record.get("nodes")?.as_map()? {
        let node = decode_node(node)?;
        nodes.insert(node.path.clone(), node);
    }
    let mut mounts = Vec::new();
    for mount in record.get("mounts")?.as_list()? {
        let mount = Record::new(mount)?;
        mounts.push(MountRecord {
            path: mount.plain("path")?,
            introduced: mount.plain("introduced")?,
            shadowed: mount
                .get("shadowed")?
                .as_list()?
                .into_iter()
                .map(decode_node)
                .collect::<Result<_, _>>()?,
        });
    }
    Ok(FsState {
        nodes,
        mounts,
        clock: record.plain("clock")?,
    })
}

fn encode_pcb(pcb: &Pcb) -> SerializedValue {
    let allow_list = match &pcb.allow_list {
        Some(allowed) => SerializedValue::Set {
            items: allowed.iter().map(SerializedValue::plain).collect(),
        },
        None => SerializedValue::plain(Value::Null),
    };
    SerializedValue::record(vec![
        ("pid", SerializedValue::plain(pcb.pid)),
        ("ppid", SerializedValue::plain(pcb.ppid)),
        ("isolate", SerializedValue::plain(pcb.isolate)),
        ("name", SerializedValue::plain(&pcb.name)),
        ("uid", SerializedValue::plain(pcb.uid)),
        ("gid", SerializedValue::plain(pcb.gid)),
        ("cwd", SerializedValue::plain(&pcb.cwd)),
        ("sliceMs", SerializedValue::plain(pcb.slice_ms)),
        ("quota", SerializedValue::plain(pcb.quota)),
        ("cpuMs", SerializedValue::plain(pcb.usage.cpu_ms)),
        ("memBytes", SerializedValue::plain(pcb.usage.mem_bytes)),
        ("cpuHistory", SerializedValue::plain(&pcb.usage.history)),
        ("violations", SerializedValue::plain(pcb.violations)),
        ("tty", SerializedValue::plain(pcb.tty)),
        ("allowList", allow_list),
        ("nextFd", SerializedValue::plain(pcb.next_fd)),
        ("pendingCode", SerializedValue::plain(&pcb.pending_code)),
        ("argv", SerializedValue::plain(&pcb.argv)),
        ("exited", SerializedValue::plain(pcb.exited)),
        ("exitCode", SerializedValue::plain(pcb.exit_code)),
        ("signal", SerializedValue::plain(pcb.signal)),
        ("job", SerializedValue::plain(pcb.job)),
    ])
}

fn decode_pcb(
    value: &SerializedValue,
    fds: BTreeMap<u64, FdEntry>,
) -> Result<Pcb, SnapshotError> {
    let record = Record::new(value)?;
    let allow_list = match record.get("allowList")? {
        SerializedValue::Plain { value: Value::Null } => None,
        set => Some(
            set.as_set()?
                .iter()
                .map(SerializedValue::as_plain)
                .collect::<Result<BTreeSet<String>, _>>()?,
        ),
    };
    Ok(Pcb {
        pid: record.plain("pid")?,
        ppid: record.plain("ppid")?,
        isolate: record.plain::<IsolateId>("isolate")?,
        name: record.plain("name")?,
        uid: record.plain("uid")?,
        gid: record.plain("gid")?,
        cwd: record.plain("cwd")?,
        slice_ms: record.plain("sliceMs")?,
        quota: record.plain::<Quota>("quota")?,
        usage: Usage {
            cpu_ms: record.plain("cpuMs")?,
            mem_bytes: record.plain("memBytes")?,
            history: record.plain("cpuHistory")?,
        },
        violations: record.plain("violations")?,
        tty: record.plain("tty")?,
        allow_list,
        fds,
        next_fd: record.plain("nextFd")?,
        pending_code: record.plain("pendingCode")?,
        argv: record.plain("argv")?,
        exited: record.plain("exited")?,
        exit_code: record.plain("exitCode")?,
        signal: record.plain("signal")?,
        job: record.plain("job")?,
    })
}

fn encode_fd_table(pcb: &Pcb) -> SerializedValue {
    SerializedValue::Map {
        entries: pcb
            .fds
            .iter()
            .map(|(fd, entry)| (SerializedValue::plain(fd), SerializedValue::plain(entry)))
            .collect(),
    }
}

fn decode_fd_table(value: &SerializedValue) -> Result<BTreeMap<u64, FdEntry>, SnapshotError> {
    value
        .as_map()?
        .iter()
        .map(|(fd, entry)| Ok((fd.as_plain()?, entry.as_plain()?)))
        .collect()
}

fn encode_frame(frame: &Frame) -> SerializedValue {
    SerializedValue::record(vec![
        ("srcMac", SerializedValue::plain(&frame.src_mac)),
        ("dstMac", SerializedValue::plain(&frame.dst_mac)),
        ("srcIp", SerializedValue::plain(&frame.src_ip)),
        ("dstIp", SerializedValue::plain(&frame.dst_ip)),
        ("payload", SerializedValue::bytes(&frame.payload)),
    ])
}

fn decode_frame(value: &SerializedValue) -> Result<Frame, SnapshotError> {
    let record = Record::new(value)?;
    Ok(Frame {
        src_mac: record.plain("srcMac")?,
        dst_mac: record.plain("dstMac")?,
        src_ip: record.plain("srcIp")?,
        dst_ip: record.plain("dstIp")?,
        payload: record.bytes("payload")?,
    })
}

fn encode_nic(nic: &Nic) -> SerializedValue {
    SerializedValue::NicState {
        id: nic.id.clone(),
        mac: nic.mac.clone(),
        ip: nic.ip.clone(),
        netmask: nic.netmask.clone(),
        status: nic.status,
        nic_type: nic.kind,
        ssid: nic.ssid.clone(),
        rx: nic.rx_frames().map(encode_frame).collect(),
        tx: nic.tx_frames().map(encode_frame).collect(),
    }
}

fn decode_nic(value: &SerializedValue) -> Result<Nic, SnapshotError> {
    let SerializedValue::NicState {
        id,
        mac,
        ip,
        netmask,
        status,
        nic_type,
        ssid,
        rx,
        tx,
    } = value
    else {
        return Err(value.unexpected("NicState"));
    };
    let mut nic = Nic::new(id.clone(), mac.clone(), *nic_type);
    nic.ip = ip.clone();
    nic.netmask = netmask.clone();
    nic.status = *status;
    nic.ssid = ssid.clone();
    nic.restore_queues(
        rx.iter().map(decode_frame).collect::<Result<_, _>>()?,
        tx.iter().map(decode_frame).collect::<Result<_, _>>()?,
    );
    Ok(nic)
}

fn encode_delivery(delivery: &Delivery) -> SerializedValue {
    SerializedValue::record(vec![
        ("port", SerializedValue::plain(delivery.port)),
        ("socket", SerializedValue::plain(delivery.socket)),
        ("data", SerializedValue::bytes(&delivery.data)),
        ("from", SerializedValue::plain(&delivery.from)),
    ])
}

fn decode_delivery(value: &SerializedValue) -> Result<Delivery, SnapshotError> {
    let record = Record::new(value)?;
    Ok(Delivery {
        port: record.plain("port")?,
        socket: record.plain("socket")?,
        data: record.bytes("data")?,
        from: record.plain::<Option<PeerAddr>>("from")?,
    })
}

fn encode_mux(state: &MuxState) -> SocketTableState {
    SocketTableState {
        listeners: state
            .listeners
            .iter()
            .map(|listener| {
                SerializedValue::record(vec![
                    ("token", SerializedValue::plain(listener.token)),
                    ("port", SerializedValue::plain(listener.port)),
                    ("owner", SerializedValue::plain(&listener.owner)),
                    (
                        "backlog",
                        SerializedValue::list(listener.backlog.iter().map(encode_delivery)),
                    ),
                ])
            })
            .collect(),
        sockets: state.sockets.iter().map(SerializedValue::plain).collect(),
        next_socket: state.next_socket,
        next_token: state.next_token,
        next_ephemeral: state.next_ephemeral,
    }
}

fn decode_mux(table: &SocketTableState) -> Result<MuxState, SnapshotError> {
    let mut listeners = Vec::new();
    for listener in &table.listeners {
        let record = Record::new(listener)?;
        listeners.push(ListenerState {
            token: record.plain::<ListenerToken>("token")?,
            port: record.plain("port")?,
            owner: record.plain::<ListenerOwner>("owner")?,
            backlog: record
                .get("backlog")?
                .as_list()?
                .into_iter()
                .map(decode_delivery)
                .collect::<Result<_, _>>()?,
        });
    }
    Ok(MuxState {
        listeners,
        sockets: table
            .sockets
            .iter()
            .map(SerializedValue::as_plain::<Socket>)
            .collect::<Result<_, _>>()?,
        next_socket: table.next_socket,
        next_token: table.next_token,
        next_ephemeral: table.next_ephemeral,
    })
}

fn decode_tcp(value: &SerializedValue) -> Result<MuxState, SnapshotError> {
    match value {
        SerializedValue::TcpState(table) => decode_mux(table),
        other => Err(other.unexpected("TcpState")),
    }
}

fn decode_udp(value: &SerializedValue) -> Result<MuxState, SnapshotError> {
    match value {
        SerializedValue::UdpState(table) => decode_mux(table),
        other => Err(other.unexpected("UdpState")),
    }
}

/// Everything a snapshot decodes to, built before any live table is
/// touched.
struct DecodedState {
    fs: FsState,
    processes: Vec<Pcb>,
    jobs: Vec<Job>,
    windows: Vec<Window>,
    nics: Vec<Nic>,
    tcp: MuxState,
    udp: MuxState,
    routes: Vec<Route>,
    services: Vec<ServiceRecord>,
    ptys: Vec<PtyState>,
}

fn decode(snapshot: &Snapshot) -> Result<DecodedState, SnapshotError> {
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(SnapshotError::UnsupportedVersion(snapshot.version));
    }

    let mut fd_tables = BTreeMap::new();
    for (pid, table) in snapshot.fd_tables.as_map()? {
        fd_tables.insert(pid.as_plain::<Pid>()?, decode_fd_table(table)?);
    }
    let mut processes = Vec::new();
    for (pid, pcb) in snapshot.processes.as_map()? {
        let pid = pid.as_plain::<Pid>()?;
        let fds = fd_tables.remove(&pid).unwrap_or_default();
        let pcb = decode_pcb(pcb, fds)?;
        if pcb.pid != pid {
            return Err(invalid("processes", format!("entry {pid} holds pid {}", pcb.pid)));
        }
        processes.push(pcb);
    }
    if let Some(pid) = fd_tables.keys().next() {
        return Err(invalid("fdTables", format!("no process {pid}")));
    }

    let mut jobs = Vec::new();
    for (_, job) in snapshot.jobs.as_map()? {
        let record = Record::new(job)?;
        jobs.push(Job {
            id: record.plain("id")?,
            pids: record.plain("pids")?,
            command: record.plain("command")?,
        });
    }

    let mut ptys = Vec::new();
    for (id, pair) in snapshot.ptys.as_map()? {
        let record = Record::new(pair)?;
        ptys.push(PtyState {
            id: id.as_plain()?,
            to_master: record.bytes("toMaster")?,
            to_slave: record.bytes("toSlave")?,
        });
    }

    let state = DecodedState {
        fs: decode_fs(&snapshot.fs)?,
        processes,
        jobs,
        windows: snapshot
            .windows
            .as_map()?
            .iter()
            .map(|(_, window)| window.as_plain())
            .collect::<Result<_, _>>()?,
        nics: snapshot
            .nics
            .as_map()?
            .iter()
            .map(|(_, nic)| decode_nic(nic))
            .collect::<Result<_, _>>()?,
        tcp: decode_tcp(&snapshot.tcp)?,
        udp: decode_udp(&snapshot.udp)?,
        routes: snapshot.routes.as_plain()?,
        services: snapshot
            .services
            .as_map()?
            .iter()
            .map(|(_, record)| record.as_plain())
            .collect::<Result<_, _>>()?,
        ptys,
    };
    check_references(snapshot, &state)?;
    Ok(state)
}

/// Cross-table consistency. Restore only mutates once this passes, so
/// everything after the filesystem import cannot fail.
fn check_references(snapshot: &Snapshot, state: &DecodedState) -> Result<(), SnapshotError> {
    if !state.fs.nodes.get("/").is_some_and(FsNode::is_dir) {
        return Err(invalid("fs", "no root directory"));
    }
    if state.fs.nodes.get(PROC_ROOT).is_some_and(|node| !node.is_dir()) {
        return Err(invalid("fs", format!("{PROC_ROOT} is not a directory")));
    }

    let pids: BTreeSet<Pid> = state.processes.iter().map(|pcb| pcb.pid).collect();
    let jobs: BTreeSet<u32> = state.jobs.iter().map(|job| job.id).collect();
    for pcb in &state.processes {
        if pcb.pid.raw() >= snapshot.next_pid {
            return Err(invalid("nextPid", format!("pid {} is not below it", pcb.pid)));
        }
        if pcb.isolate.raw() >= snapshot.next_isolate {
            return Err(invalid("nextIsolate", format!("isolate of pid {} is not below it", pcb.pid)));
        }
        if let Some(job) = pcb.job.filter(|job| !jobs.contains(job)) {
            return Err(invalid("processes", format!("pid {} names unknown job {job}", pcb.pid)));
        }
    }
    if let Some(job) = state.jobs.iter().find(|job| job.id >= snapshot.next_job) {
        return Err(invalid("nextJob", format!("job {} is not below it", job.id)));
    }
    if let Some(pid) = snapshot.ready.iter().find(|pid| !pids.contains(pid)) {
        return Err(invalid("ready", format!("no process {pid}")));
    }

    let nics: BTreeSet<&str> = state.nics.iter().map(|nic| nic.id.as_str()).collect();
    if let Some(route) = state.routes.iter().find(|route| !nics.contains(route.nic.as_str())) {
        return Err(invalid("routes", format!("{} points at unknown nic {}", route.prefix, route.nic)));
    }

    for (field, mux) in [("tcp", &state.tcp), ("udp", &state.udp)] {
        let mut ports = BTreeSet::new();
        let mut tokens = BTreeSet::new();
        for listener in &mux.listeners {
            if !ports.insert(listener.port) {
                return Err(invalid(field, format!("port {} listened twice", listener.port)));
            }
            if !tokens.insert(listener.token) || listener.token.raw() >= mux.next_token {
                return Err(invalid(field, format!("bad listener token {}", listener.token.raw())));
            }
        }
    }
    for record in &state.services {
        let mux = match record.protocol {
            Protocol::Tcp => &state.tcp,
            Protocol::Udp => &state.udp,
        };
        let listening = mux
            .listeners
            .iter()
            .any(|listener| listener.token == record.token && listener.port == record.port);
        if !listening {
            return Err(invalid(
                "services",
                format!(
                    "{} has no {} listener {} on port {}",
                    record.name,
                    record.protocol.as_str(),
                    record.token.raw(),
                    record.port
                ),
            ));
        }
    }
    Ok(())
}

impl Kernel {
    /// Capture the whole machine.
    pub async fn snapshot(&mut self) -> KernelResult<Snapshot> {
        let fs = self.fs.export().await;
        let (next_pid, next_isolate, next_job) = self.processes.counters();
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            hostname: self.config.hostname.clone(),
            fs: encode_fs(&fs),
            processes: SerializedValue::Map {
                entries: self
                    .processes
                    .iter()
                    .map(|pcb| (SerializedValue::plain(pcb.pid), encode_pcb(pcb)))
                    .collect(),
            },
            fd_tables: SerializedValue::Map {
                entries: self
                    .processes
                    .iter()
                    .map(|pcb| (SerializedValue::plain(pcb.pid), encode_fd_table(pcb)))
                    .collect(),
            },
            jobs: SerializedValue::Map {
                entries: self
                    .processes
                    .raw_jobs()
                    .map(|job| {
                        (
                            SerializedValue::plain(job.id),
                            SerializedValue::record(vec![
                                ("id", SerializedValue::plain(job.id)),
                                ("pids", SerializedValue::plain(&job.pids)),
                                ("command", SerializedValue::plain(&job.command)),
                            ]),
                        )
                    })
                    .collect(),
            },
            windows: SerializedValue::Map {
                entries: self
                    .windows
                    .iter()
                    .map(|window| (SerializedValue::plain(window.id), SerializedValue::plain(window)))
                    .collect(),
            },
            nics: SerializedValue::Map {
                entries: self
                    .net
                    .nics()
                    .map(|nic| (SerializedValue::plain(&nic.id), encode_nic(nic)))
                    .collect(),
            },
            tcp: SerializedValue::TcpState(encode_mux(
                &self.net.mux(Protocol::Tcp).export(),
            )),
            udp: SerializedValue::UdpState(encode_mux(
                &self.net.mux(Protocol::Udp).export(),
            )),
            routes: SerializedValue::plain(self.net.routes()),
            services: SerializedValue::Map {
                entries: self
                    .services
                    .records()
                    .map(|record| (SerializedValue::plain(&record.name), SerializedValue::plain(record)))
                    .collect(),
            },
            ptys: SerializedValue::Map {
                entries: self
                    .ptys
                    .export()
                    .iter()
                    .map(|pair| {
                        (
                            SerializedValue::plain(pair.id),
                            SerializedValue::record(vec![
                                ("toMaster", SerializedValue::bytes(&pair.to_master)),
                                ("toSlave", SerializedValue::bytes(&pair.to_slave)),
                            ]),
                        )
                    })
                    .collect(),
            },
            ready: self.resumable_pids(),
            next_pid,
            next_isolate,
            next_job,
            next_window: self.windows.next_id(),
            next_pty: self.ptys.next_id(),
            init_pid: self.init_pid,
        };
        self.events.publish(
            &mut self.clock,
            EventBuilder::new(Pid::KERNEL, EventKind::SnapshotCreated)
                .detail(json!({ "processes": self.processes.len() })),
        );
        Ok(snapshot)
    }

    /// Replace the whole machine with `snapshot`. The document is decoded
    /// and cross-checked in full before any table changes. The filesystem
    /// goes first and is put back if its `/proc` mirror cannot be built;
    /// nothing after that point can fail.
    pub async fn restore(&mut self, snapshot: &Snapshot) -> KernelResult<()> {
        let state = decode(snapshot)?;
        let previous_fs = self.fs.export().await;
        self.fs.import(state.fs).await?;
        if let Err(err) = self.mirror_procs(&state.processes).await {
            warn!("restore aborted while rebuilding /proc: {err}");
            self.fs.import(previous_fs).await?;
            for pcb in self.processes.iter() {
                register_proc(self.fs.as_mut(), pcb).await?;
            }
            return Err(err);
        }

        for pcb in self.processes.iter() {
            self.pending_drops.push(pcb.isolate);
        }
        self.processes.restore(
            state.processes,
            state.jobs,
            (snapshot.next_pid, snapshot.next_isolate, snapshot.next_job),
        );
        self.ready.restore(snapshot.ready.clone());
        self.in_flight.clear();
        self.warm.clear();
        self.pending_control = None;
        self.init_pid = snapshot.init_pid;

        self.windows.restore(state.windows, snapshot.next_window);
        self.net
            .restore(state.nics, state.tcp, state.udp, state.routes);
        self.ptys.import(state.ptys, snapshot.next_pty);

        self.services.clear();
        for record in state.services {
            let instance = self.catalog.instantiate(&record.name);
            match &instance {
                Some(service) => {
                    let reattached = self
                        .net
                        .mux_mut(record.protocol)
                        .reattach(record.token, delivery_handler(Rc::clone(service)));
                    if let Err(err) = reattached {
                        warn!("service {} could not reattach: {err}", record.name);
                    }
                }
                None => warn!(
                    "service {} has no factory, its listener stays detached",
                    record.name
                ),
            }
            self.services.insert(record, instance);
        }

        self.events.publish(
            &mut self.clock,
            EventBuilder::new(Pid::KERNEL, EventKind::SnapshotRestored)
                .detail(json!({ "processes": self.processes.len() })),
        );
        info!("restored snapshot with {} processes", self.processes.len());
        Ok(())
    }

    async fn mirror_procs(&mut self, processes: &[Pcb]) -> KernelResult<()> {
        for pcb in processes {
            if let Err(err) = register_proc(self.fs.as_mut(), pcb).await {
                unregister_proc(self.fs.as_mut(), pcb.pid).await.ok();
                return Err(err);
            }
        }
        Ok(())
    }

    /// Everything that would run again: the rest of the current tick's
    /// batch, running pid first, then the ready queue.
    fn resumable_pids(&self) -> Vec<Pid> {
        let mut seen = BTreeSet::new();
        self.in_flight
            .iter()
            .copied()
            .chain(self.ready.iter())
            .filter(|pid| self.processes.get(*pid).is_ok_and(|pcb| pcb.is_alive()))
            .filter(|pid| seen.insert(*pid))
            .collect()
    }

    pub async fn save_snapshot(&mut self, name: &str) -> KernelResult<()> {
        let snapshot = self.snapshot().await?;
        self.snapshots.save(name, &snapshot)?;
        info!("saved snapshot {name}");
        Ok(())
    }

    pub async fn load_snapshot(&mut self, name: &str) -> KernelResult<()> {
        let snapshot = self.snapshots.load(name)?;
        self.restore(&snapshot).await
    }
}

/// Host-owned storage for named snapshots. It outlives reboots.
pub trait SnapshotStore {
    fn save(&mut self, name: &str, snapshot: &Snapshot) -> Result<(), SnapshotError>;
    fn load(&self, name: &str) -> Result<Snapshot, SnapshotError>;
    fn contains(&self, name: &str) -> bool;
    fn names(&self) -> Vec<String>;
}

fn check_name(name: &str) -> Result<(), SnapshotError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !name.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(invalid("name", format!("bad snapshot name {name:?}")))
    }
}

#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    documents: BTreeMap<String, String>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn save(&mut self, name: &str, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        check_name(name)?;
        self.documents.insert(name.to_string(), snapshot.to_json()?);
        Ok(())
    }

    fn load(&self, name: &str) -> Result<Snapshot, SnapshotError> {
        let text = self
            .documents
            .get(name)
            .ok_or_else(|| SnapshotError::NotFound(name.to_string()))?;
        Snapshot::from_json(text)
    }

    fn contains(&self, name: &str) -> bool {
        self.documents.contains_key(name)
    }

    fn names(&self) -> Vec<String> {
        self.documents.keys().cloned().collect()
    }
}

/// One `<name>.json` file per snapshot.
#[derive(Debug, Clone)]
pub struct DirSnapshotStore {
    dir: PathBuf,
}

impl DirSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, SnapshotError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|err| SnapshotError::Io(format!("{}: {err}", dir.display())))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }
}

impl SnapshotStore for DirSnapshotStore {
    fn save(&mut self, name: &str, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        check_name(name)?;
        let path = self.file(name);
        fs::write(&path, snapshot.to_json()?)
            .map_err(|err| SnapshotError::Io(format!("{}: {err}", path.display())))
    }

    fn load(&self, name: &str) -> Result<Snapshot, SnapshotError> {
        check_name(name)?;
        let path = self.file(name);
        if !path.exists() {
            return Err(SnapshotError::NotFound(name.to_string()));
        }
        let text = fs::read_to_string(&path)
            .map_err(|err| SnapshotError::Io(format!("{}: {err}", path.display())))?;
        Snapshot::from_json(&text)
    }

    fn contains(&self, name: &str) -> bool {
        check_name(name).is_ok() && self.file(name).exists()
    }

    fn names(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .and_then(|file| file.strip_suffix(".json"))
                    .map(str::to_string)
            })
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelopes_carry_their_kind_tag() {
        let value = SerializedValue::Map {
            entries: vec![(SerializedValue::plain("a"), SerializedValue::bytes(b"\x00hi"))],
        };
        let json = serde_json::to_value(&value).expect("serialize");
        assert_eq!(json["kind"], "Map");
        assert_eq!(json["entries"][0][0], json!({"kind": "Plain", "value": "a"}));
        assert_eq!(json["entries"][0][1], json!({"kind": "Bytes", "base64": "AGhp"}));

        let back: SerializedValue = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, value);
    }

    #[test]
    fn socket_tables_are_tagged_by_protocol() {
        let table = SocketTableState {
            listeners: Vec::new(),
            sockets: Vec::new(),
            next_socket: 4,
            next_token: 2,
            next_ephemeral: 49153,
        };
        let json = serde_json::to_value(SerializedValue::UdpState(table.clone())).expect("json");
        assert_eq!(json["kind"], "UdpState");
        assert_eq!(json["nextSocket"], 4);

        let decoded: SerializedValue = serde_json::from_value(json).expect("decode");
        assert!(decode_tcp(&decoded).is_err());
        assert_eq!(decode_udp(&decoded).expect("udp").next_token, 2);
    }

    #[test]
    fn decoding_reports_the_wrong_kind() {
        let err = SerializedValue::plain(1).as_bytes().unwrap_err();
        assert_eq!(
            err,
            SnapshotError::UnexpectedKind {
                expected: "Bytes",
                found: "Plain"
            }
        );
    }

    #[test]
    fn node_records_keep_bytes_and_metadata() {
        let node = FsNode {
            path: "/bin/tool".into(),
            mode: Mode::new(0o750),
            uid: 7,
            gid: 8,
            created: 3,
            modified: 9,
            content: NodeContent::File(vec![0, 159, 255]),
        };
        assert_eq!(decode_node(&encode_node(&node)).expect("decode"), node);

        let missing = SerializedValue::record(vec![("kind", SerializedValue::plain("file"))]);
        assert_eq!(
            decode_node(&missing).unwrap_err(),
            SnapshotError::MissingField("content".into())
        );
    }

    #[test]
    fn store_names_are_validated() {
        assert!(check_name("before-upgrade_1").is_ok());
        assert!(check_name("../etc").is_err());
        assert!(check_name("").is_err());
    }

    #[test]
    fn dir_store_writes_one_file_per_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DirSnapshotStore::new(dir.path().join("snaps")).expect("store");
        assert!(store.names().is_empty());
        assert!(!store.contains("base"));
        assert_eq!(
            store.load("base").unwrap_err(),
            SnapshotError::NotFound("base".into())
        );
    }
}
