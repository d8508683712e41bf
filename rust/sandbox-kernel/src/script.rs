//! A slice executor that replays JSON programs.
//!
//! A program lists its slices up front; each slice issues a fixed batch of
//! syscalls, then reports its cpu and memory use. It is the executor the
//! daemon and the scenario tests drive the kernel with.
//!
//! ```json
//! //! manifest {"name":"pinger","syscalls":["open","write"]}
//! {"slices":[{"cpuMs":5,"calls":[{"call":"open","args":{"path":"/tmp/x","flags":"w"}}]}],
//!  "exitCode":0}
//! ```

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use async_trait::async_trait;
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::net::{Delivery, Protocol};
use crate::process::{IsolateId, Pid};
use crate::scheduler::{ExecutorError, SliceExecutor, SliceOutcome, SliceRequest, SyscallPort};
use crate::syscall::{ListenHandler, Syscall};

/// Exit status of a program with no body.
pub const EMPTY_PROGRAM_EXIT: i32 = 127;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptedCall {
    pub call: String,
    #[serde(default = "empty_args")]
    pub args: Value,
}

fn empty_args() -> Value {
    json!({})
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScriptedSlice {
    pub cpu_ms: u64,
    pub mem_bytes: u64,
    pub calls: Vec<ScriptedCall>,
    /// Crash the slice after its calls with this message.
    pub fail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScriptedProgram {
    pub slices: Vec<ScriptedSlice>,
    pub exit_code: i32,
}

impl ScriptedProgram {
    /// Parse program text, skipping `//!` header lines.
    pub fn parse(code: &str) -> Result<Self, ExecutorError> {
        let body: String = code
            .lines()
            .filter(|line| !line.trim_start().starts_with("//!"))
            .collect::<Vec<_>>()
            .join("\n");
        if body.trim().is_empty() {
            return Ok(Self {
                slices: Vec::new(),
                exit_code: EMPTY_PROGRAM_EXIT,
            });
        }
        serde_json::from_str(&body)
            .map_err(|err| ExecutorError::Crashed(format!("bad program: {err}")))
    }
}

/// One syscall as the program saw it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEntry {
    pub pid: Pid,
    pub call: String,
    pub reply: Value,
}

/// A delivery received by a listener a program opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReceivedDelivery {
    pub pid: Pid,
    pub port: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct Transcript {
    pub calls: Vec<TranscriptEntry>,
    pub deliveries: Vec<ReceivedDelivery>,
}

impl Transcript {
    pub fn replies(&self, pid: Pid, call: &str) -> Vec<&Value> {
        self.calls
            .iter()
            .filter(|entry| entry.pid == pid && entry.call == call)
            .map(|entry| &entry.reply)
            .collect()
    }
}

pub type SharedTranscript = Rc<RefCell<Transcript>>;

#[derive(Debug)]
struct Isolate {
    pid: Pid,
    program: ScriptedProgram,
    cursor: usize,
}

#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    isolates: BTreeMap<IsolateId, Isolate>,
    transcript: SharedTranscript,
    dropped: Vec<IsolateId>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transcript(&self) -> SharedTranscript {
        Rc::clone(&self.transcript)
    }

    pub fn live_isolates(&self) -> usize {
        self.isolates.len()
    }

    pub fn dropped(&self) -> &[IsolateId] {
        &self.dropped
    }

    fn recording_handler(&self, pid: Pid) -> ListenHandler {
        let transcript = Rc::clone(&self.transcript);
        ListenHandler(Rc::new(move |delivery: &Delivery| {
            transcript.borrow_mut().deliveries.push(ReceivedDelivery {
                pid,
                port: delivery.port,
                data: delivery.data.clone(),
            });
        }))
    }

    async fn issue(
        &mut self,
        pid: Pid,
        call: &ScriptedCall,
        port: &mut SyscallPort<'_>,
    ) -> Result<(), ExecutorError> {
        let result = if call.call == "reattach" {
            self.reattach(pid, &call.args, port)
        } else {
            match Syscall::from_name(&call.call, &call.args) {
                Ok(Syscall::Listen { port: number, proto, .. }) => {
                    port.call(Syscall::Listen {
                        port: number,
                        proto,
                        handler: Some(self.recording_handler(pid)),
                    })
                    .await
                    .map(|reply| reply.to_json())
                }
                Ok(syscall) => port.call(syscall).await.map(|reply| reply.to_json()),
                Err(err) => Err(err),
            }
        };

        let reply = match result {
            Ok(reply) => reply,
            Err(err) if err.is_fatal() => return Err(ExecutorError::Fatal(err)),
            Err(err) => err.to_json(),
        };
        trace!("pid {} {} -> {}", pid, call.call, reply);
        self.transcript.borrow_mut().calls.push(TranscriptEntry {
            pid,
            call: call.call.clone(),
            reply,
        });
        Ok(())
    }

    /// Re-arm a listener that came back detached from a snapshot.
    fn reattach(
        &self,
        pid: Pid,
        args: &Value,
        port: &mut SyscallPort<'_>,
    ) -> crate::error::KernelResult<Value> {
        let token = args
            .get("token")
            .cloned()
            .ok_or_else(|| crate::error::KernelError::invalid("missing token"))
            .and_then(|value| {
                serde_json::from_value(value)
                    .map_err(|err| crate::error::KernelError::invalid(err.to_string()))
            })?;
        let proto = match args.get("proto").and_then(Value::as_str) {
            Some(name) => Protocol::from_str(name)
                .ok_or_else(|| crate::error::KernelError::invalid(format!("bad proto {name}")))?,
            None => Protocol::Tcp,
        };
        let ListenHandler(handler) = self.recording_handler(pid);
        let drained = port.reattach_listener(proto, token, handler)?;
        Ok(json!({ "drained": drained }))
    }
}

#[async_trait(?Send)]
impl SliceExecutor for ScriptedExecutor {
    async fn run_slice(
        &mut self,
        request: SliceRequest,
        port: &mut SyscallPort<'_>,
    ) -> Result<SliceOutcome, ExecutorError> {
        if let Some(code) = &request.code {
            let program = ScriptedProgram::parse(code)?;
            debug!(
                "pid {} loaded {} slices into isolate {}",
                request.pid,
                program.slices.len(),
                request.isolate.raw()
            );
            self.isolates.insert(
                request.isolate,
                Isolate {
                    pid: request.pid,
                    program,
                    cursor: 0,
                },
            );
        }

        let (pid, slice, exit_code, last) = {
            let isolate = self
                .isolates
                .get_mut(&request.isolate)
                .ok_or(ExecutorError::MissingIsolate(request.isolate))?;
            let Some(slice) = isolate.program.slices.get(isolate.cursor).cloned() else {
                return Ok(SliceOutcome::exited(0, 0, isolate.program.exit_code));
            };
            isolate.cursor += 1;
            (
                isolate.pid,
                slice,
                isolate.program.exit_code,
                isolate.cursor == isolate.program.slices.len(),
            )
        };

        for call in &slice.calls {
            self.issue(pid, call, port).await?;
        }
        if let Some(message) = slice.fail {
            return Err(ExecutorError::Crashed(message));
        }

        if last {
            Ok(SliceOutcome::exited(slice.cpu_ms, slice.mem_bytes, exit_code))
        } else {
            Ok(SliceOutcome::running(slice.cpu_ms, slice.mem_bytes))
        }
    }

    fn drop_isolate(&mut self, isolate: IsolateId) {
        if self.isolates.remove(&isolate).is_some() {
            self.dropped.push(isolate);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lines_are_skipped() {
        let program = ScriptedProgram::parse(
            "//! manifest {\"name\":\"x\"}\n{\"slices\":[{\"cpuMs\":3}],\"exitCode\":4}",
        )
        .expect("parse");
        assert_eq!(program.slices.len(), 1);
        assert_eq!(program.slices[0].cpu_ms, 3);
        assert!(program.slices[0].calls.is_empty());
        assert_eq!(program.exit_code, 4);
    }

    #[test]
    fn empty_text_is_command_not_found() {
        let program = ScriptedProgram::parse("  \n").expect("parse");
        assert!(program.slices.is_empty());
        assert_eq!(program.exit_code, EMPTY_PROGRAM_EXIT);
    }

    #[test]
    fn garbage_crashes() {
        assert!(matches!(
            ScriptedProgram::parse("print('hi')"),
            Err(ExecutorError::Crashed(_))
        ));
    }

    #[test]
    fn call_args_default_to_an_empty_object() {
        let program = ScriptedProgram::parse("{\"slices\":[{\"calls\":[{\"call\":\"getpid\"}]}]}")
            .expect("parse");
        assert_eq!(program.slices[0].calls[0].args, json!({}));
    }
}
