//! Cooperative round-robin scheduling on top of an opaque slice executor.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde_json::json;
use thiserror::Error;

use crate::error::{KernelError, KernelResult};
use crate::event_bus::{EventBuilder, EventKind};
use crate::kernel::{Kernel, PendingControl};
use crate::net::{DeliveryHandler, ListenerOwner, ListenerToken, Protocol};
use crate::process::{IsolateId, Pid, SIGKILL};
use crate::syscall::{Syscall, SyscallReply};

/// What the executor gets for one slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceRequest {
    pub pid: Pid,
    pub isolate: IsolateId,
    /// Program text, present only when the isolate has not seen it yet.
    pub code: Option<String>,
    pub argv: Vec<String>,
    pub slice_ms: u64,
    pub quota_mem: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SliceOutcome {
    pub cpu_ms: u64,
    pub mem_bytes: u64,
    pub running: bool,
    pub exit_code: Option<i32>,
}

impl SliceOutcome {
    pub fn running(cpu_ms: u64, mem_bytes: u64) -> Self {
        Self {
            cpu_ms,
            mem_bytes,
            running: true,
            exit_code: None,
        }
    }

    pub fn exited(cpu_ms: u64, mem_bytes: u64, exit_code: i32) -> Self {
        Self {
            cpu_ms,
            mem_bytes,
            running: false,
            exit_code: Some(exit_code),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("program crashed: {0}")]
    Crashed(String),
    #[error("no isolate {0:?}")]
    MissingIsolate(IsolateId),
    #[error("syscall aborted the slice: {0}")]
    Fatal(KernelError),
}

/// The execution engine that actually runs program text.
#[async_trait(?Send)]
pub trait SliceExecutor {
    async fn run_slice(
        &mut self,
        request: SliceRequest,
        port: &mut SyscallPort<'_>,
    ) -> Result<SliceOutcome, ExecutorError>;

    /// Forget an isolate. Called at the first safe point after its process
    /// was killed or exited.
    fn drop_isolate(&mut self, isolate: IsolateId);
}

/// Syscall entry point handed to the executor for one slice.
pub struct SyscallPort<'k> {
    kernel: &'k mut Kernel,
    pid: Pid,
}

impl<'k> SyscallPort<'k> {
    pub fn new(kernel: &'k mut Kernel, pid: Pid) -> Self {
        Self { kernel, pid }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub async fn call(&mut self, call: Syscall) -> KernelResult<SyscallReply> {
        self.kernel.dispatch(self.pid, call).await
    }

    pub async fn call_named(
        &mut self,
        name: &str,
        args: &serde_json::Value,
    ) -> KernelResult<SyscallReply> {
        let call = Syscall::from_name(name, args)?;
        self.call(call).await
    }

    /// Give a detached listener owned by this process a live callback.
    pub fn reattach_listener(
        &mut self,
        protocol: Protocol,
        token: ListenerToken,
        handler: DeliveryHandler,
    ) -> KernelResult<usize> {
        let mux = self.kernel.net.mux_mut(protocol);
        let owned = mux
            .listener(token)
            .is_some_and(|listener| listener.owner == ListenerOwner::Process(self.pid));
        if !owned {
            return Err(KernelError::invalid(format!(
                "listener {} is not owned by pid {}",
                token.raw(),
                self.pid
            )));
        }
        mux.reattach(token, handler)
    }

    pub fn kernel(&self) -> &Kernel {
        self.kernel
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReadyQueue {
    queue: VecDeque<Pid>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, pid: Pid) {
        if !self.queue.contains(&pid) {
            self.queue.push_back(pid);
        }
    }

    pub fn remove(&mut self, pid: Pid) {
        self.queue.retain(|queued| *queued != pid);
    }

    /// Empty the queue, returning its contents in order.
    pub fn take(&mut self) -> Vec<Pid> {
        self.queue.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = Pid> + '_ {
        self.queue.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn restore(&mut self, pids: Vec<Pid>) {
        self.queue = pids.into();
    }
}

/// Exponential idle wait: base, doubled per idle round, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleBackoff {
    base_ms: u64,
    max_ms: u64,
    current_ms: u64,
}

impl IdleBackoff {
    pub fn new(base_ms: u64, max_ms: u64) -> Self {
        let base_ms = base_ms.max(1);
        Self {
            base_ms,
            max_ms: max_ms.max(base_ms),
            current_ms: base_ms,
        }
    }

    /// Delay for this idle round; the next one will be twice as long.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_ms;
        self.current_ms = self.current_ms.saturating_mul(2).min(self.max_ms);
        Duration::from_millis(delay)
    }

    pub fn reset(&mut self) {
        self.current_ms = self.base_ms;
    }

    pub fn current(&self) -> Duration {
        Duration::from_millis(self.current_ms)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub slices: usize,
    pub exited: Vec<Pid>,
    pub killed: Vec<Pid>,
    pub discarded: usize,
    pub control: Option<PendingControl>,
}

impl Kernel {
    /// Run every process that was ready at the start of the tick for one
    /// slice, in queue order.
    pub async fn tick<E>(&mut self, executor: &mut E) -> TickReport
    where
        E: SliceExecutor + ?Sized,
    {
        let mut report = TickReport::default();
        self.flush_drops(executor);

        self.in_flight = self.ready.take().into();
        while let Some(&pid) = self.in_flight.front() {
            let request = match self.processes.get(pid) {
                Ok(pcb) if pcb.is_alive() => SliceRequest {
                    pid,
                    isolate: pcb.isolate,
                    code: if self.warm.contains(&pcb.isolate) {
                        None
                    } else {
                        pcb.pending_code.clone()
                    },
                    argv: pcb.argv.clone(),
                    slice_ms: pcb.slice_ms,
                    quota_mem: pcb.quota.quota_mem,
                },
                _ => {
                    self.in_flight.pop_front();
                    continue;
                }
            };
            self.warm.insert(request.isolate);

            let result = {
                let mut port = SyscallPort::new(self, pid);
                executor.run_slice(request, &mut port).await
            };
            report.slices += 1;
            self.in_flight.pop_front();
            self.finish_slice(pid, result, &mut report);
            self.flush_drops(executor);

            // A successful reboot or restore empties `in_flight`, ending the tick.
            if let Some(control) = self.pending_control.take() {
                self.apply_control(control.clone()).await;
                self.flush_drops(executor);
                report.control = Some(control);
            }
        }
        report
    }

    fn flush_drops<E>(&mut self, executor: &mut E)
    where
        E: SliceExecutor + ?Sized,
    {
        for isolate in self.pending_drops.drain(..) {
            debug!("dropping isolate {}", isolate.raw());
            executor.drop_isolate(isolate);
        }
    }

    fn finish_slice(
        &mut self,
        pid: Pid,
        result: Result<SliceOutcome, ExecutorError>,
        report: &mut TickReport,
    ) {
        let history_len = self.processes.history_len();
        let Ok(pcb) = self.processes.get_mut(pid) else {
            report.discarded += 1;
            return;
        };
        if pcb.exited {
            debug!("discarding slice result of pid {pid}, killed during its slice");
            report.discarded += 1;
            return;
        }

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!("slice of pid {pid} failed: {err}");
                pcb.exit(1);
                let isolate = pcb.isolate;
                self.retire(pid, isolate);
                self.events.publish(
                    &mut self.clock,
                    EventBuilder::new(pid, EventKind::SliceFailed)
                        .detail(json!({ "error": err.to_string() })),
                );
                report.exited.push(pid);
                return;
            }
        };

        pcb.usage.record(outcome.cpu_ms, outcome.mem_bytes, history_len);
        debug!(
            "pid {pid} used {}ms / {} bytes (total {}ms / {} bytes)",
            outcome.cpu_ms, outcome.mem_bytes, pcb.usage.cpu_ms, pcb.usage.mem_bytes
        );

        if pcb.over_quota() {
            pcb.violations += 1;
            let detail = json!({
                "cpu_ms": pcb.usage.cpu_ms,
                "mem_bytes": pcb.usage.mem_bytes,
                "quota_ms": pcb.quota.quota_ms,
                "quota_mem": pcb.quota.quota_mem,
                "violations": pcb.violations,
            });
            if pcb.violations == 1 {
                warn!("pid {pid} exceeded its quota, next breach kills it");
                self.events.publish(
                    &mut self.clock,
                    EventBuilder::new(pid, EventKind::QuotaWarning).detail(detail),
                );
            } else {
                warn!("pid {pid} exceeded its quota again, killing");
                pcb.kill(SIGKILL);
                let isolate = pcb.isolate;
                self.retire(pid, isolate);
                self.events.publish(
                    &mut self.clock,
                    EventBuilder::new(pid, EventKind::QuotaKilled).detail(detail),
                );
                let crashed = self.windows.mark_crashed(pid);
                if !crashed.is_empty() {
                    warn!("pid {pid} crashed with {} open windows", crashed.len());
                    self.events.publish(
                        &mut self.clock,
                        EventBuilder::new(pid, EventKind::Crash)
                            .detail(json!({ "windows": crashed, "signal": SIGKILL })),
                    );
                }
                report.killed.push(pid);
                return;
            }
        }

        if outcome.running {
            self.ready.push(pid);
            return;
        }
        let code = outcome.exit_code.unwrap_or(0);
        pcb.exit(code);
        let isolate = pcb.isolate;
        self.retire(pid, isolate);
        self.events.publish(
            &mut self.clock,
            EventBuilder::new(pid, EventKind::Exited).detail(json!({ "exit_code": code })),
        );
        info!("pid {pid} exited with {code}");
        report.exited.push(pid);
    }

    async fn apply_control(&mut self, control: PendingControl) {
        let applied = match &control {
            PendingControl::Reboot => self.reboot().await.map(|_| ()),
            PendingControl::LoadSnapshot(name) => {
                self.load_snapshot(name).await.map_err(anyhow::Error::from)
            }
        };
        if let Err(err) = applied {
            error!("kernel control {control:?} failed: {err:#}");
        }
    }

    /// Tick until nothing is runnable or `max_ticks` ran. Returns the
    /// number of ticks.
    pub async fn run_until_idle<E>(&mut self, executor: &mut E, max_ticks: usize) -> usize
    where
        E: SliceExecutor + ?Sized,
    {
        let mut ticks = 0;
        while ticks < max_ticks && !self.ready.is_empty() {
            self.tick(executor).await;
            ticks += 1;
        }
        self.flush_drops(executor);
        ticks
    }

    /// Scheduler loop. Sleeps with exponential backoff while idle and
    /// returns once `stop` says so.
    pub async fn run<E, F>(&mut self, executor: &mut E, mut stop: F)
    where
        E: SliceExecutor + ?Sized,
        F: FnMut(&Kernel) -> bool,
    {
        while !stop(self) {
            if self.ready.is_empty() {
                self.flush_drops(executor);
                let delay = self.idle.next_delay();
                tokio::time::sleep(delay).await;
                continue;
            }
            self.idle.reset();
            self.tick(executor).await;
        }
    }

    pub fn idle_backoff(&self) -> &IdleBackoff {
        &self.idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_cap_and_resets() {
        let mut idle = IdleBackoff::new(4, 20);
        let delays: Vec<u64> = (0..5).map(|_| idle.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![4, 8, 16, 20, 20]);
        idle.reset();
        assert_eq!(idle.next_delay(), Duration::from_millis(4));
    }

    #[test]
    fn ready_queue_keeps_fifo_order_without_duplicates() {
        let mut queue = ReadyQueue::new();
        for raw in [1, 2, 1, 3] {
            queue.push(Pid::new(raw));
        }
        queue.remove(Pid::new(2));
        assert_eq!(queue.take(), vec![Pid::new(1), Pid::new(3)]);
        assert!(queue.is_empty());
    }
}
