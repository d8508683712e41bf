use std::collections::VecDeque;

use serde::Serialize;
use serde_json::json;

use crate::clock::DeterministicClock;
use crate::process::Pid;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct KernelEvent {
    pub pid: Pid,
    pub kind: EventKind,
    pub detail: serde_json::Value,
    pub timestamp: u64,
}

impl KernelEvent {
    /// One line of the event log. Kernel-originated events carry pid 0.
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "timestamp": self.timestamp,
            "pid": self.pid.raw(),
            "kind": self.kind.as_str(),
            "detail": self.detail,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Booted,
    Spawned,
    Exited,
    Killed,
    Reaped,
    SliceFailed,
    QuotaWarning,
    QuotaKilled,
    Crash,
    SyscallDenied,
    Mounted,
    Unmounted,
    ServiceRegistered,
    SnapshotCreated,
    SnapshotRestored,
    Rebooted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Booted => "booted",
            EventKind::Spawned => "spawned",
            EventKind::Exited => "exited",
            EventKind::Killed => "killed",
            EventKind::Reaped => "reaped",
            EventKind::SliceFailed => "slice_failed",
            EventKind::QuotaWarning => "quota_warning",
            EventKind::QuotaKilled => "quota_killed",
            EventKind::Crash => "crash",
            EventKind::SyscallDenied => "syscall_denied",
            EventKind::Mounted => "mounted",
            EventKind::Unmounted => "unmounted",
            EventKind::ServiceRegistered => "service_registered",
            EventKind::SnapshotCreated => "snapshot_created",
            EventKind::SnapshotRestored => "snapshot_restored",
            EventKind::Rebooted => "rebooted",
        }
    }
}

/// Bounded audit trail of kernel events. The oldest entries are dropped once
/// `capacity` undrained events have accumulated.
#[derive(Debug)]
pub struct EventBus {
    queue: VecDeque<KernelEvent>,
    capacity: usize,
    dropped: u64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_capacity(4096)
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    pub fn publish(&mut self, clock: &mut DeterministicClock, event: EventBuilder) {
        let timestamp = clock.tick();
        if self.queue.len() == self.capacity {
            self.queue.pop_front();
            self.dropped += 1;
        }
        self.queue.push_back(event.into_event(timestamp));
    }

    pub fn drain(&mut self) -> Vec<KernelEvent> {
        self.queue.drain(..).collect()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

pub struct EventBuilder {
    pid: Pid,
    kind: EventKind,
    detail: serde_json::Value,
}

impl EventBuilder {
    pub fn new(pid: Pid, kind: EventKind) -> Self {
        Self {
            pid,
            kind,
            detail: serde_json::Value::Null,
        }
    }

    pub fn detail(mut self, value: impl Serialize) -> Self {
        self.detail = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
        self
    }

    fn into_event(self, timestamp: u64) -> KernelEvent {
        KernelEvent {
            pid: self.pid,
            kind: self.kind,
            detail: self.detail,
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publishing_events_assigns_monotonic_timestamps() {
        let mut bus = EventBus::new();
        let mut clock = DeterministicClock::new();

        bus.publish(
            &mut clock,
            EventBuilder::new(Pid::new(1), EventKind::Spawned).detail("first"),
        );
        bus.publish(
            &mut clock,
            EventBuilder::new(Pid::new(1), EventKind::Exited).detail("second"),
        );

        let events = bus.drain();
        assert_eq!(events.len(), 2);
        assert!(events[1].timestamp > events[0].timestamp);
    }

    #[test]
    fn full_bus_drops_oldest_events() {
        let mut bus = EventBus::with_capacity(2);
        let mut clock = DeterministicClock::new();
        for _ in 0..3 {
            bus.publish(&mut clock, EventBuilder::new(Pid::new(2), EventKind::Spawned));
        }

        let events = bus.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].timestamp, 2);
        assert_eq!(bus.dropped(), 1);
    }

    #[test]
    fn events_render_as_log_lines() {
        let event = KernelEvent {
            pid: Pid::new(7),
            kind: EventKind::SyscallDenied,
            detail: serde_json::json!({"ok": true}),
            timestamp: 33,
        };

        let json = event.to_json();
        assert_eq!(json["pid"], 7);
        assert_eq!(json["timestamp"], 33);
        assert_eq!(json["kind"], "syscall_denied");
        assert_eq!(json["detail"], serde_json::json!({"ok": true}));
    }
}
