use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};
use crate::manifest::ProgramManifest;
use crate::pty::{self, PtySide};
use crate::vfs::{path, Credentials, FileSystem, OpenFlags, VirtualSource, PROC_ROOT};

/// First descriptor handed out; 0, 1 and 2 are reserved.
pub const FIRST_FD: u64 = 3;
pub const SIGKILL: i32 = 9;
pub const SIGTERM: i32 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Pid(u32);

impl Pid {
    /// Pid used for kernel-originated events.
    pub const KERNEL: Pid = Pid(0);

    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Executor-side execution context of one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct IsolateId(u64);

impl IsolateId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FdTarget {
    File { path: String },
    Virtual { path: String, source: VirtualSource },
    Pty { id: u32, side: PtySide },
}

impl FdTarget {
    pub fn path(&self) -> String {
        match self {
            FdTarget::File { path } | FdTarget::Virtual { path, .. } => path.clone(),
            FdTarget::Pty {
                id,
                side: PtySide::Master,
            } => pty::master_path(*id),
            FdTarget::Pty {
                id,
                side: PtySide::Slave,
            } => pty::slave_path(*id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FdEntry {
    pub target: FdTarget,
    pub offset: usize,
    pub flags: OpenFlags,
}

impl FdEntry {
    pub fn new(target: FdTarget, flags: OpenFlags) -> Self {
        Self {
            target,
            offset: 0,
            flags,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quota {
    pub quota_ms: u64,
    pub quota_mem: u64,
}

/// Cumulative resource usage. Counters only ever grow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Usage {
    pub cpu_ms: u64,
    pub mem_bytes: u64,
    pub history: VecDeque<u64>,
}

impl Usage {
    pub fn record(&mut self, cpu_ms: u64, mem_bytes: u64, history_len: usize) {
        self.cpu_ms = self.cpu_ms.saturating_add(cpu_ms);
        self.mem_bytes = self.mem_bytes.saturating_add(mem_bytes);
        if history_len == 0 {
            return;
        }
        while self.history.len() >= history_len {
            self.history.pop_front();
        }
        self.history.push_back(cpu_ms);
    }
}

/// Process control block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pcb {
    pub pid: Pid,
    pub ppid: Option<Pid>,
    pub isolate: IsolateId,
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub cwd: String,
    pub slice_ms: u64,
    pub quota: Quota,
    pub usage: Usage,
    pub violations: u32,
    pub tty: Option<u32>,
    pub allow_list: Option<BTreeSet<String>>,
    pub fds: BTreeMap<u64, FdEntry>,
    pub next_fd: u64,
    pub pending_code: Option<String>,
    pub argv: Vec<String>,
    pub exited: bool,
    pub exit_code: Option<i32>,
    /// Signal that terminated the process, if any.
    pub signal: Option<i32>,
    pub job: Option<u32>,
}

impl Pcb {
    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.uid, self.gid)
    }

    pub fn is_alive(&self) -> bool {
        !self.exited
    }

    pub fn permits(&self, syscall: &str) -> bool {
        self.allow_list
            .as_ref()
            .map_or(true, |allowed| allowed.contains(syscall))
    }

    pub fn over_quota(&self) -> bool {
        self.usage.cpu_ms > self.quota.quota_ms || self.usage.mem_bytes > self.quota.quota_mem
    }

    pub fn fd(&self, fd: u64) -> KernelResult<&FdEntry> {
        self.fds.get(&fd).ok_or(KernelError::BadDescriptor(fd))
    }

    pub fn fd_mut(&mut self, fd: u64) -> KernelResult<&mut FdEntry> {
        self.fds.get_mut(&fd).ok_or(KernelError::BadDescriptor(fd))
    }

    pub fn insert_fd(&mut self, entry: FdEntry) -> u64 {
        let fd = self.next_fd;
        self.next_fd += 1;
        self.fds.insert(fd, entry);
        fd
    }

    pub fn exit(&mut self, code: i32) {
        self.exited = true;
        self.exit_code = Some(code);
        self.pending_code = None;
    }

    pub fn kill(&mut self, signal: i32) {
        self.exit(signal);
        self.signal = Some(signal);
    }

    pub fn render_status(&self) -> String {
        let state = if self.exited { "Z (zombie)" } else { "R (running)" };
        let exit_code = self
            .exit_code
            .map_or_else(|| "-".to_string(), |code| code.to_string());
        let tty = self
            .tty
            .map_or_else(|| "-".to_string(), pty::slave_path);
        let fds: Vec<String> = self.fds.keys().map(u64::to_string).collect();
        let lines = [
            ("Name", self.name.clone()),
            ("Pid", self.pid.to_string()),
            ("PPid", self.ppid.map_or(0, |p| p.raw()).to_string()),
            ("Uid", self.uid.to_string()),
            ("Gid", self.gid.to_string()),
            ("State", state.to_string()),
            ("ExitCode", exit_code),
            ("Cwd", self.cwd.clone()),
            ("Tty", tty),
            ("CpuMs", self.usage.cpu_ms.to_string()),
            ("MemBytes", self.usage.mem_bytes.to_string()),
            ("QuotaMs", self.quota.quota_ms.to_string()),
            ("QuotaMem", self.quota.quota_mem.to_string()),
            ("Violations", self.violations.to_string()),
            ("Fds", fds.join(" ")),
        ];
        let mut out = String::new();
        for (key, value) in lines {
            out.push_str(key);
            out.push_str(": ");
            out.push_str(&value);
            out.push('\n');
        }
        out
    }

    pub fn render_cmdline(&self) -> String {
        self.argv.join("\0")
    }

    pub fn ps_entry(&self) -> PsEntry {
        PsEntry {
            pid: self.pid,
            argv: self.argv.clone(),
            exited: self.exited,
            cpu_ms: self.usage.cpu_ms,
            mem_bytes: self.usage.mem_bytes,
            tty: self.tty.map(pty::slave_path),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PsEntry {
    pub pid: Pid,
    pub argv: Vec<String>,
    pub exited: bool,
    pub cpu_ms: u64,
    pub mem_bytes: u64,
    pub tty: Option<String>,
}

/// Everything needed to create a process.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub name: String,
    pub code: String,
    pub argv: Vec<String>,
    pub ppid: Option<Pid>,
    pub uid: u32,
    pub gid: u32,
    pub cwd: Option<String>,
    pub tty: Option<u32>,
    pub allow_list: Option<BTreeSet<String>>,
    pub quota_ms: Option<u64>,
    pub quota_mem: Option<u64>,
    pub job: Option<String>,
}

impl ProcessSpec {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_argv(mut self, argv: Vec<String>) -> Self {
        self.argv = argv;
        self
    }

    pub fn with_parent(mut self, parent: &Pcb) -> Self {
        self.ppid = Some(parent.pid);
        self.uid = parent.uid;
        self.gid = parent.gid;
        self.cwd = Some(parent.cwd.clone());
        self.tty = parent.tty;
        self
    }

    pub fn with_credentials(mut self, cred: Credentials) -> Self {
        self.uid = cred.uid;
        self.gid = cred.gid;
        self
    }

    pub fn with_tty(mut self, tty: u32) -> Self {
        self.tty = Some(tty);
        self
    }

    pub fn with_job(mut self, command: impl Into<String>) -> Self {
        self.job = Some(command.into());
        self
    }

    /// Apply a manifest: its name, its allow-list and any quota overrides.
    pub fn with_manifest(mut self, manifest: &ProgramManifest) -> Self {
        if !manifest.name.is_empty() {
            self.name = manifest.name.clone();
        }
        self.allow_list = Some(manifest.syscalls.iter().cloned().collect());
        self.quota_ms = manifest.quota_ms.or(self.quota_ms);
        self.quota_mem = manifest.quota_mem.or(self.quota_mem);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Running,
    Done,
    Killed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: u32,
    pub pids: Vec<Pid>,
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: u32,
    pub pids: Vec<Pid>,
    pub command: String,
    pub status: JobStatus,
}

/// Defaults applied to every new process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessDefaults {
    pub slice_ms: u64,
    pub quota: Quota,
    pub history_len: usize,
}

#[derive(Debug, Clone)]
pub struct ProcessTable {
    procs: BTreeMap<Pid, Pcb>,
    jobs: BTreeMap<u32, Job>,
    next_pid: u32,
    next_isolate: u64,
    next_job: u32,
    defaults: ProcessDefaults,
}

impl ProcessTable {
    pub fn new(defaults: ProcessDefaults) -> Self {
        Self {
            procs: BTreeMap::new(),
            jobs: BTreeMap::new(),
            next_pid: 1,
            next_isolate: 1,
            next_job: 1,
            defaults,
        }
    }

    pub fn defaults(&self) -> ProcessDefaults {
        self.defaults
    }

    pub fn history_len(&self) -> usize {
        self.defaults.history_len
    }

    /// Allocate a pid and build the PCB. `/proc` registration is left to
    /// the caller, which owns the filesystem.
    pub fn create(&mut self, spec: ProcessSpec) -> Pid {
        let pid = Pid::new(self.next_pid);
        self.next_pid += 1;
        let isolate = IsolateId::new(self.next_isolate);
        self.next_isolate += 1;

        let name = if spec.name.is_empty() {
            spec.argv.first().cloned().unwrap_or_else(|| format!("pid{pid}"))
        } else {
            spec.name
        };
        let job = spec.job.map(|command| self.join_job(pid, command));

        let pcb = Pcb {
            pid,
            ppid: spec.ppid,
            isolate,
            name,
            uid: spec.uid,
            gid: spec.gid,
            cwd: spec.cwd.unwrap_or_else(|| "/".to_string()),
            slice_ms: self.defaults.slice_ms,
            quota: Quota {
                quota_ms: spec.quota_ms.unwrap_or(self.defaults.quota.quota_ms),
                quota_mem: spec.quota_mem.unwrap_or(self.defaults.quota.quota_mem),
            },
            usage: Usage::default(),
            violations: 0,
            tty: spec.tty,
            allow_list: spec.allow_list,
            fds: BTreeMap::new(),
            next_fd: FIRST_FD,
            pending_code: Some(spec.code),
            argv: spec.argv,
            exited: false,
            exit_code: None,
            signal: None,
            job,
        };
        self.procs.insert(pid, pcb);
        pid
    }

    /// Join the running job with the same command, or start a new one.
    fn join_job(&mut self, pid: Pid, command: String) -> u32 {
        let running = self
            .jobs
            .values()
            .filter(|job| job.command == command)
            .find(|job| self.job_status(job) == JobStatus::Running)
            .map(|job| job.id);
        match running.and_then(|id| self.jobs.get_mut(&id)) {
            Some(job) => {
                job.pids.push(pid);
                job.id
            }
            None => {
                let id = self.next_job;
                self.next_job += 1;
                self.jobs.insert(
                    id,
                    Job {
                        id,
                        pids: vec![pid],
                        command,
                    },
                );
                id
            }
        }
    }

    pub fn get(&self, pid: Pid) -> KernelResult<&Pcb> {
        self.procs
            .get(&pid)
            .ok_or(KernelError::InvalidProcess(pid.raw()))
    }

    pub fn get_mut(&mut self, pid: Pid) -> KernelResult<&mut Pcb> {
        self.procs
            .get_mut(&pid)
            .ok_or(KernelError::InvalidProcess(pid.raw()))
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.procs.contains_key(&pid)
    }

    pub fn remove(&mut self, pid: Pid) -> Option<Pcb> {
        self.procs.remove(&pid)
    }

    /// Undo a `create` whose pid never became visible: drop the PCB, its
    /// job membership and the counters it advanced.
    pub fn abandon(&mut self, pid: Pid, counters: (u32, u64, u32)) {
        self.procs.remove(&pid);
        self.jobs.retain(|_, job| {
            job.pids.retain(|member| *member != pid);
            !job.pids.is_empty()
        });
        (self.next_pid, self.next_isolate, self.next_job) = counters;
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pcb> {
        self.procs.values()
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }

    pub fn alive(&self) -> impl Iterator<Item = &Pcb> {
        self.procs.values().filter(|pcb| pcb.is_alive())
    }

    pub fn ps(&self) -> Vec<PsEntry> {
        self.procs.values().map(Pcb::ps_entry).collect()
    }

    fn job_status(&self, job: &Job) -> JobStatus {
        let members: Vec<&Pcb> = job.pids.iter().filter_map(|pid| self.procs.get(pid)).collect();
        if members.iter().any(|pcb| pcb.is_alive()) {
            JobStatus::Running
        } else if members.iter().any(|pcb| pcb.signal.is_some()) {
            JobStatus::Killed
        } else {
            JobStatus::Done
        }
    }

    pub fn jobs(&self) -> Vec<JobInfo> {
        self.jobs
            .values()
            .map(|job| JobInfo {
                id: job.id,
                pids: job.pids.clone(),
                command: job.command.clone(),
                status: self.job_status(job),
            })
            .collect()
    }

    pub fn raw_jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn next_pid(&self) -> u32 {
        self.next_pid
    }

    pub fn counters(&self) -> (u32, u64, u32) {
        (self.next_pid, self.next_isolate, self.next_job)
    }

    /// Replace the table with restored state.
    pub fn restore(&mut self, procs: Vec<Pcb>, jobs: Vec<Job>, counters: (u32, u64, u32)) {
        self.procs = procs.into_iter().map(|pcb| (pcb.pid, pcb)).collect();
        self.jobs = jobs.into_iter().map(|job| (job.id, job)).collect();
        (self.next_pid, self.next_isolate, self.next_job) = counters;
    }
}

pub fn proc_dir(pid: Pid) -> String {
    format!("{PROC_ROOT}/{pid}")
}

pub fn proc_fd_path(pid: Pid, fd: u64) -> String {
    format!("{PROC_ROOT}/{pid}/fd/{fd}")
}

/// Mirror a PCB into `/proc/<pid>`: status, cmdline and one node per open
/// descriptor.
pub async fn register_proc(fs: &mut dyn FileSystem, pcb: &Pcb) -> KernelResult<()> {
    let dir = proc_dir(pcb.pid);
    let pid = pcb.pid.raw();
    fs.insert_virtual(&path::join(&dir, "status"), VirtualSource::ProcStatus { pid })
        .await?;
    fs.insert_virtual(&path::join(&dir, "cmdline"), VirtualSource::ProcCmdline { pid })
        .await?;
    for fd in pcb.fds.keys() {
        fs.insert_virtual(&proc_fd_path(pcb.pid, *fd), VirtualSource::ProcFd { pid, fd: *fd })
            .await?;
    }
    Ok(())
}

pub async fn unregister_proc(fs: &mut dyn FileSystem, pid: Pid) -> KernelResult<()> {
    fs.remove_tree(&proc_dir(pid)).await
}
