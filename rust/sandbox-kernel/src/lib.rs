//! Sandbox kernel: a cooperative, single-threaded machine that runs untrusted
//! programs as virtual processes over a permissioned in-memory filesystem,
//! logical sockets and pseudo-terminals, and snapshots all of it losslessly.

pub mod clock;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod kernel;
pub mod manifest;
pub mod net;
pub mod process;
pub mod pty;
pub mod scheduler;
pub mod script;
pub mod service;
pub mod snapshot;
pub mod syscall;
pub mod vfs;
pub mod window;

pub use clock::DeterministicClock;
pub use config::{BootDirectory, BootNic, InitProgram, KernelConfig};
pub use error::{KernelError, KernelResult};
pub use event_bus::{EventBuilder, EventBus, EventKind, KernelEvent};
pub use kernel::{Console, ConsoleRecord, ConsoleStream, Kernel, PendingControl};
pub use manifest::ProgramManifest;
pub use net::{
    Delivery, Frame, LinkStatus, ListenerOwner, ListenerToken, NetworkHub, NetworkStack, Nic,
    NicKind, Protocol, Route, SharedHub,
};
pub use process::{IsolateId, JobInfo, Pcb, Pid, ProcessSpec, PsEntry};
pub use pty::{PtyManager, PtySide};
pub use scheduler::{
    ExecutorError, IdleBackoff, ReadyQueue, SliceExecutor, SliceOutcome, SliceRequest,
    SyscallPort, TickReport,
};
pub use script::{ScriptedExecutor, ScriptedProgram, SharedTranscript, Transcript};
pub use service::{NetworkService, ServiceCatalog, ServiceRecord};
pub use snapshot::{
    DirSnapshotStore, MemorySnapshotStore, SerializedValue, Snapshot, SnapshotError,
    SnapshotStore, SNAPSHOT_VERSION,
};
pub use syscall::{ListenHandler, SpawnOptions, Syscall, SyscallReply};
pub use vfs::{FileSystem, FsImage, MemoryFs, Mode, NodeInfo, OpenFlags, StoreFs};
pub use window::{DrawOptions, Window};
