use std::collections::{BTreeSet, VecDeque};
use std::rc::Rc;

use anyhow::{Context, Result};
use log::{info, warn};
use serde::Serialize;
use serde_json::json;

use crate::clock::DeterministicClock;
use crate::config::{InitProgram, KernelConfig};
use crate::error::{KernelError, KernelResult};
use crate::event_bus::{EventBuilder, EventBus, EventKind, KernelEvent};
use crate::manifest::ProgramManifest;
use crate::net::{ListenerOwner, ListenerToken, NetworkHub, NetworkStack, SharedHub};
use crate::process::{
    register_proc, unregister_proc, IsolateId, Pcb, Pid, ProcessDefaults, ProcessSpec,
    ProcessTable, Quota,
};
use crate::pty::PtyManager;
use crate::scheduler::{IdleBackoff, ReadyQueue};
use crate::service::{delivery_handler, NetworkService, ServiceCatalog, ServiceRecord, ServiceRegistry};
use crate::snapshot::{MemorySnapshotStore, SnapshotStore};
use crate::vfs::{path, Credentials, FileContent, FileSystem, MemoryFs, Mode, NodeKind};
use crate::window::WindowTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleStream {
    Stdout,
    Stderr,
}

/// Bytes a process wrote to descriptor 1 or 2.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsoleRecord {
    pub pid: Pid,
    pub stream: ConsoleStream,
    pub data: Vec<u8>,
}

/// Host console. Bounded; the oldest records go first.
#[derive(Debug)]
pub struct Console {
    records: VecDeque<ConsoleRecord>,
    capacity: usize,
}

impl Console {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, pid: Pid, stream: ConsoleStream, data: Vec<u8>) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(ConsoleRecord { pid, stream, data });
    }

    pub fn drain(&mut self) -> Vec<ConsoleRecord> {
        self.records.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Kernel-wide actions requested from inside a slice. The scheduler applies
/// them once the slice has returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingControl {
    Reboot,
    LoadSnapshot(String),
}

pub struct Kernel {
    pub(crate) config: KernelConfig,
    pub(crate) fs: Box<dyn FileSystem>,
    pub(crate) processes: ProcessTable,
    pub(crate) ready: ReadyQueue,
    /// The batch the current tick is working through, running pid first.
    pub(crate) in_flight: VecDeque<Pid>,
    pub(crate) idle: IdleBackoff,
    pub(crate) net: NetworkStack,
    pub(crate) ptys: PtyManager,
    pub(crate) windows: WindowTable,
    pub(crate) services: ServiceRegistry,
    pub(crate) catalog: ServiceCatalog,
    pub(crate) snapshots: Box<dyn SnapshotStore>,
    pub(crate) console: Console,
    pub(crate) events: EventBus,
    pub(crate) clock: DeterministicClock,
    pub(crate) init_pid: Option<Pid>,
    /// Isolates the executor should drop at its next safe point.
    pub(crate) pending_drops: Vec<IsolateId>,
    pub(crate) pending_control: Option<PendingControl>,
    /// Isolates that already received their program text.
    pub(crate) warm: BTreeSet<IsolateId>,
}

impl Kernel {
    pub fn new(config: KernelConfig) -> Self {
        let hub = NetworkHub::shared(config.wifi_networks.clone());
        Self {
            fs: Box::new(MemoryFs::new()),
            processes: ProcessTable::new(process_defaults(&config)),
            ready: ReadyQueue::new(),
            in_flight: VecDeque::new(),
            idle: IdleBackoff::new(config.idle_base_ms, config.idle_max_ms),
            net: NetworkStack::new(hub),
            ptys: PtyManager::new(config.pty_capacity),
            windows: WindowTable::new(),
            services: ServiceRegistry::new(),
            catalog: ServiceCatalog::new(),
            snapshots: Box::new(MemorySnapshotStore::new()),
            console: Console::new(config.console_capacity),
            events: EventBus::with_capacity(config.event_capacity),
            clock: DeterministicClock::new(),
            init_pid: None,
            pending_drops: Vec::new(),
            pending_control: None,
            warm: BTreeSet::new(),
            config,
        }
    }

    pub fn with_filesystem(mut self, fs: impl FileSystem + 'static) -> Self {
        self.fs = Box::new(fs);
        self
    }

    /// Attach to a hub shared with other kernels on the same host.
    pub fn with_hub(mut self, hub: SharedHub) -> Self {
        self.net.shutdown();
        self.net = NetworkStack::new(hub);
        self
    }

    pub fn with_snapshot_store(mut self, store: impl SnapshotStore + 'static) -> Self {
        self.snapshots = Box::new(store);
        self
    }

    pub fn with_catalog(mut self, catalog: ServiceCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Create boot directories and NICs, then start the init program.
    /// A missing or unparsable init program aborts the boot.
    pub async fn boot(&mut self) -> Result<Option<Pid>> {
        for dir in self.config.boot_dirs.clone() {
            self.ensure_dir(&dir.path, Mode::new(dir.mode))
                .await
                .with_context(|| format!("creating boot directory {}", dir.path))?;
        }
        for nic in self.config.nics.clone() {
            self.net
                .create_nic(&nic.id, &nic.mac, nic.kind)
                .with_context(|| format!("creating boot nic {}", nic.id))?;
            if let (Some(ip), Some(netmask)) = (&nic.ip, &nic.netmask) {
                self.net
                    .nic_config(&nic.id, ip, netmask)
                    .with_context(|| format!("configuring boot nic {}", nic.id))?;
            }
            if nic.up {
                self.net.nic_up(&nic.id)?;
            }
        }

        let init = match self.config.init.clone() {
            Some(init) => Some(self.start_init(init).await?),
            None => None,
        };
        self.events.publish(
            &mut self.clock,
            EventBuilder::new(Pid::KERNEL, EventKind::Booted).detail(json!({
                "hostname": self.config.hostname,
                "backend": self.fs.backend(),
                "init": init.map(|pid| pid.raw()),
            })),
        );
        info!(
            "kernel {} booted on {} filesystem",
            self.config.hostname,
            self.fs.backend()
        );
        Ok(init)
    }

    async fn ensure_dir(&mut self, dir: &str, mode: Mode) -> KernelResult<()> {
        let dir = path::normalize(dir)?;
        let mut missing = Vec::new();
        let mut cursor = Some(dir.as_str());
        while let Some(current) = cursor {
            if current == "/" || self.fs.exists(current).await {
                break;
            }
            missing.push(current.to_string());
            cursor = path::parent(current);
        }
        for path in missing.into_iter().rev() {
            self.fs.mkdir(&path, mode, Credentials::ROOT).await?;
        }
        let node = self.fs.stat(&dir).await?;
        if node.kind != NodeKind::Directory {
            return Err(KernelError::NotDirectory(dir));
        }
        Ok(())
    }

    async fn start_init(&mut self, init: InitProgram) -> Result<Pid> {
        let path = path::normalize(&init.path)?;
        if let Some(source) = &init.source {
            self.fs
                .write(&path, source.as_bytes(), Credentials::ROOT)
                .await
                .with_context(|| format!("installing init program {path}"))?;
        }
        let code = self
            .read_program(&path)
            .await
            .with_context(|| format!("loading init program {path}"))?;
        let manifest = ProgramManifest::from_source(&code)
            .with_context(|| format!("parsing init program {path}"))?;

        let argv = if init.argv.is_empty() {
            vec![path.clone()]
        } else {
            init.argv
        };
        let mut spec = ProcessSpec::new(code)
            .with_name("init")
            .with_argv(argv)
            .with_credentials(Credentials::ROOT);
        if let Some(manifest) = &manifest {
            spec = spec.with_manifest(manifest);
        }
        let pid = self.spawn(spec).await?;
        self.init_pid = Some(pid);
        Ok(pid)
    }

    /// Program text stored at `path`.
    pub async fn read_program(&self, path: &str) -> KernelResult<String> {
        match self.fs.read(path).await? {
            FileContent::Stored(bytes) => String::from_utf8(bytes)
                .map_err(|_| KernelError::invalid(format!("{path} is not valid utf-8"))),
            FileContent::Virtual(_) => Err(KernelError::invalid(format!("{path} is not a program"))),
        }
    }

    /// Create a process, mirror it into `/proc` and queue it. Nothing is
    /// left behind when registration fails.
    pub async fn spawn(&mut self, spec: ProcessSpec) -> KernelResult<Pid> {
        let counters = self.processes.counters();
        let pid = self.processes.create(spec);
        let registered = match self.processes.get(pid) {
            Ok(pcb) => register_proc(self.fs.as_mut(), pcb).await,
            Err(err) => Err(err),
        };
        if let Err(err) = registered {
            self.processes.abandon(pid, counters);
            unregister_proc(self.fs.as_mut(), pid).await.ok();
            warn!("spawn of pid {pid} rolled back: {err}");
            return Err(err);
        }

        self.ready.push(pid);
        self.idle.reset();
        let pcb = self.processes.get(pid)?;
        self.events.publish(
            &mut self.clock,
            EventBuilder::new(pid, EventKind::Spawned).detail(json!({
                "name": pcb.name,
                "ppid": pcb.ppid.map(|ppid| ppid.raw()),
                "job": pcb.job,
            })),
        );
        info!("spawned pid {pid} ({})", pcb.name);
        Ok(pid)
    }

    /// Spawn `code` as a root process with no parent, honouring a manifest
    /// header when the text carries one.
    pub async fn spawn_program(&mut self, code: &str, argv: Vec<String>) -> KernelResult<Pid> {
        let mut spec = ProcessSpec::new(code).with_argv(argv);
        if let Some(manifest) = ProgramManifest::from_source(code)? {
            spec = spec.with_manifest(&manifest);
        }
        self.spawn(spec).await
    }

    /// Mark `pid` exited by `signal`. A slice already in flight finishes,
    /// but its result is discarded.
    pub fn kill(&mut self, pid: Pid, signal: i32) -> bool {
        let Ok(pcb) = self.processes.get_mut(pid) else {
            return false;
        };
        if pcb.exited {
            return false;
        }
        pcb.kill(signal);
        let isolate = pcb.isolate;
        self.retire(pid, isolate);
        self.events.publish(
            &mut self.clock,
            EventBuilder::new(pid, EventKind::Killed).detail(json!({ "signal": signal })),
        );
        info!("pid {pid} killed by signal {signal}");
        true
    }

    /// Take an exited process out of the table and `/proc`. Returns its
    /// exit code.
    pub async fn reap(&mut self, pid: Pid) -> KernelResult<i32> {
        let pcb = self
            .processes
            .get(pid)
            .map_err(|_| KernelError::NotFound(format!("pid {pid}")))?;
        if pcb.is_alive() {
            return Err(KernelError::invalid(format!("pid {pid} is still running")));
        }
        let code = pcb.exit_code.unwrap_or(0);
        unregister_proc(self.fs.as_mut(), pid).await?;
        self.processes.remove(pid);
        self.events.publish(
            &mut self.clock,
            EventBuilder::new(pid, EventKind::Reaped).detail(json!({ "exit_code": code })),
        );
        Ok(code)
    }

    /// Release everything an exited process held outside its PCB.
    pub(crate) fn retire(&mut self, pid: Pid, isolate: IsolateId) {
        self.ready.remove(pid);
        self.warm.remove(&isolate);
        self.pending_drops.push(isolate);
        let released = self.net.release_owner(pid);
        if released > 0 {
            info!("released {released} sockets held by pid {pid}");
        }
    }

    pub fn register_service(&mut self, service: Rc<dyn NetworkService>) -> KernelResult<ListenerToken> {
        let name = service.name().to_string();
        if self.services.contains(&name) {
            return Err(KernelError::AlreadyExists(name));
        }
        let protocol = service.protocol();
        let port = service.port();
        let token = self.net.mux_mut(protocol).listen(
            port,
            ListenerOwner::Service(name.clone()),
            Some(delivery_handler(Rc::clone(&service))),
        )?;
        self.services.insert(
            ServiceRecord {
                name: name.clone(),
                port,
                protocol,
                token,
            },
            Some(service),
        );
        self.events.publish(
            &mut self.clock,
            EventBuilder::new(Pid::KERNEL, EventKind::ServiceRegistered).detail(json!({
                "name": name,
                "port": port,
                "protocol": protocol.as_str(),
            })),
        );
        info!("service {name} listening on {}/{port}", protocol.as_str());
        Ok(token)
    }

    /// Instantiate a catalog service and register it.
    pub fn start_service(&mut self, name: &str) -> KernelResult<ListenerToken> {
        let service = self
            .catalog
            .instantiate(name)
            .ok_or_else(|| KernelError::NotFound(format!("service {name}")))?;
        self.register_service(service)
    }

    /// Clear every table and boot again. The filesystem contents, the
    /// snapshot store and the service catalog survive; catalog services
    /// that were running are started again.
    pub async fn reboot(&mut self) -> Result<Option<Pid>> {
        let restart: Vec<String> = self
            .services
            .records()
            .map(|record| record.name.clone())
            .filter(|name| self.services.is_live(name))
            .collect();
        let pids: Vec<Pid> = self.processes.iter().map(|pcb| pcb.pid).collect();
        for pcb in self.processes.iter() {
            self.pending_drops.push(pcb.isolate);
        }
        for pid in pids {
            unregister_proc(self.fs.as_mut(), pid).await?;
        }

        self.processes = ProcessTable::new(process_defaults(&self.config));
        self.ready.clear();
        self.in_flight.clear();
        self.idle.reset();
        self.net.shutdown();
        self.ptys = PtyManager::new(self.config.pty_capacity);
        self.windows = WindowTable::new();
        self.services.clear();
        self.warm.clear();
        self.init_pid = None;
        self.pending_control = None;
        self.events.publish(
            &mut self.clock,
            EventBuilder::new(Pid::KERNEL, EventKind::Rebooted),
        );
        info!("kernel {} rebooting", self.config.hostname);

        let init = self.boot().await?;
        for name in restart {
            if let Err(err) = self.start_service(&name) {
                warn!("service {name} did not come back after reboot: {err}");
            }
        }
        Ok(init)
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn fs(&self) -> &dyn FileSystem {
        self.fs.as_ref()
    }

    pub fn fs_mut(&mut self) -> &mut dyn FileSystem {
        self.fs.as_mut()
    }

    pub fn processes(&self) -> &ProcessTable {
        &self.processes
    }

    pub fn process(&self, pid: Pid) -> KernelResult<&Pcb> {
        self.processes.get(pid)
    }

    pub fn net(&self) -> &NetworkStack {
        &self.net
    }

    pub fn net_mut(&mut self) -> &mut NetworkStack {
        &mut self.net
    }

    pub fn ptys(&self) -> &PtyManager {
        &self.ptys
    }

    pub fn ptys_mut(&mut self) -> &mut PtyManager {
        &mut self.ptys
    }

    pub fn windows(&self) -> &WindowTable {
        &self.windows
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub fn catalog_mut(&mut self) -> &mut ServiceCatalog {
        &mut self.catalog
    }

    pub fn snapshot_store(&self) -> &dyn SnapshotStore {
        self.snapshots.as_ref()
    }

    pub fn init_pid(&self) -> Option<Pid> {
        self.init_pid
    }

    pub fn ready_pids(&self) -> Vec<Pid> {
        self.ready.iter().collect()
    }

    pub fn pending_control(&self) -> Option<&PendingControl> {
        self.pending_control.as_ref()
    }

    pub fn take_console(&mut self) -> Vec<ConsoleRecord> {
        self.console.drain()
    }

    pub fn drain_events(&mut self) -> Vec<KernelEvent> {
        self.events.drain()
    }
}

fn process_defaults(config: &KernelConfig) -> ProcessDefaults {
    ProcessDefaults {
        slice_ms: config.slice_ms,
        quota: Quota {
            quota_ms: config.quota_ms,
            quota_mem: config.quota_mem,
        },
        history_len: config.cpu_history,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BootDirectory;

    #[test]
    fn console_is_bounded() {
        let mut console = Console::new(2);
        for byte in [b'a', b'b', b'c'] {
            console.push(Pid::new(1), ConsoleStream::Stdout, vec![byte]);
        }
        let records = console.drain();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].data, b"b");
        assert!(console.is_empty());
    }

    #[tokio::test]
    async fn boot_creates_directories_and_nics() {
        let mut config = KernelConfig::default();
        config.boot_dirs.push(BootDirectory {
            path: "/var/log/kernel".into(),
            mode: 0o750,
        });
        let mut kernel = Kernel::new(config);
        assert_eq!(kernel.boot().await.expect("boot"), None);

        let node = kernel.fs().stat("/var/log/kernel").await.expect("stat");
        assert_eq!(node.mode, Mode::new(0o750));
        assert!(kernel.fs().exists("/var/log").await);
        let nics = kernel.net().list_nics();
        assert_eq!(nics[0].id, "lo");
        assert_eq!(nics[0].ip.as_deref(), Some("127.0.0.1"));

        let events = kernel.drain_events();
        assert_eq!(events.last().expect("event").kind, EventKind::Booted);
    }

    #[tokio::test]
    async fn init_source_is_installed_and_read_back() {
        let config = KernelConfig::default().with_init(InitProgram {
            path: "/bin/init".into(),
            source: Some("//! manifest {\"name\":\"init\",\"syscalls\":[\"ps\"]}\n{}".into()),
            argv: Vec::new(),
        });
        let mut kernel = Kernel::new(config);
        let pid = kernel.boot().await.expect("boot").expect("init pid");

        let pcb = kernel.process(pid).expect("pcb");
        assert_eq!(pcb.argv, vec!["/bin/init".to_string()]);
        assert!(pcb.permits("ps"));
        assert!(!pcb.permits("write"));
        assert_eq!(kernel.init_pid(), Some(pid));
        assert_eq!(kernel.ready_pids(), vec![pid]);
    }

    #[tokio::test]
    async fn missing_init_program_aborts_boot() {
        let config = KernelConfig::default().with_init(InitProgram {
            path: "/bin/absent".into(),
            source: None,
            argv: Vec::new(),
        });
        let err = Kernel::new(config).boot().await.unwrap_err();
        assert!(format!("{err:#}").contains("/bin/absent"));
    }

    #[tokio::test]
    async fn unparsable_init_manifest_aborts_boot() {
        let config = KernelConfig::default().with_init(InitProgram {
            path: "/bin/init".into(),
            source: Some("//! manifest {broken".into()),
            argv: Vec::new(),
        });
        assert!(Kernel::new(config).boot().await.is_err());
    }

    #[tokio::test]
    async fn reap_removes_only_exited_processes() {
        let mut kernel = Kernel::new(KernelConfig::default());
        kernel.boot().await.expect("boot");
        let pid = kernel.spawn_program("{}", vec!["job".into()]).await.expect("spawn");

        assert_eq!(kernel.reap(pid).await.unwrap_err().errno_name(), "EINVAL");
        assert!(kernel.kill(pid, 15));
        assert!(!kernel.kill(pid, 15));
        assert_eq!(kernel.reap(pid).await.expect("reap"), 15);
        assert!(kernel.process(pid).is_err());
        assert!(!kernel.fs().exists("/proc/1").await);
    }
}
