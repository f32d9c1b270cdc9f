//! Terminal multiplexer: stable ids, per-session sequencing and execution output.
//!
//! Each execution's output is read by its own task. Readers push into one bounded channel owned by the
//! multiplexer and finish with a drain marker, so every chunk of an execution is processed before its
//! exec-end frame.

pub mod label;
mod session;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::connection::FrameSink;
use crate::host::{Execution, ExecutionKey, TerminalInfo, TerminalKey};
use crate::protocol::{
    ExecEnd, ExecStart, Message, OutputStream, TerminalClose, TerminalOpen, TerminalOutput,
    TerminalResize, TerminalSnapshot, TerminalState, TerminalSummary, TerminalTitle,
};
use crate::redact::{redact_secrets, strip_trailing_prompt_line};
use crate::telemetry::{self, PerfGuard};

use session::{ExecutionHandle, Session};

pub use label::cwd_label;

/// Capacity of the channel shared by all execution readers.
pub const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Produced by execution reader tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutput {
    Chunk { exec: ExecutionKey, data: String },
    /// The reader saw the end of its stream; nothing else follows for this execution.
    Drained { exec: ExecutionKey },
}

pub struct TerminalMux {
    sessions: BTreeMap<u32, Session>,
    ids: HashMap<TerminalKey, u32>,
    executions: HashMap<ExecutionKey, ExecutionHandle>,
    next_id: u32,
    active: Option<u32>,
    workspace_folders: Vec<PathBuf>,
    output_tx: mpsc::Sender<ExecOutput>,
    output_rx: mpsc::Receiver<ExecOutput>,
    disposed: bool,
}

impl Default for TerminalMux {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalMux {
    pub fn new() -> Self {
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        Self {
            sessions: BTreeMap::new(),
            ids: HashMap::new(),
            executions: HashMap::new(),
            next_id: 1,
            active: None,
            workspace_folders: Vec::new(),
            output_tx,
            output_rx,
            disposed: false,
        }
    }

    pub fn set_workspace_folders(&mut self, folders: Vec<PathBuf>) {
        self.workspace_folders = folders;
    }

    pub fn terminal_id(&self, key: TerminalKey) -> Option<u32> {
        self.ids.get(&key).copied()
    }

    pub fn active_terminal(&self) -> Option<u32> {
        self.active
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn in_flight_executions(&self) -> usize {
        self.executions.len()
    }

    /// Next event from the execution readers. Never resolves to `None` while the multiplexer lives.
    pub async fn next_output(&mut self) -> Option<ExecOutput> {
        self.output_rx.recv().await
    }

    fn ensure_session(&mut self, info: TerminalInfo) -> u32 {
        if let Some(id) = self.ids.get(&info.key).copied() {
            if let Some(session) = self.sessions.get_mut(&id) {
                session.info = info;
            }
            return id;
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        debug!(target: "beach_cast::terminal", terminal_id = id, name = %info.name, "tracking terminal");
        self.ids.insert(info.key, id);
        self.sessions.insert(id, Session::new(id, info));
        id
    }

    fn id_for_reference(&mut self, key: TerminalKey) -> u32 {
        match self.ids.get(&key) {
            Some(id) => *id,
            None => self.ensure_session(TerminalInfo::new(key, "terminal")),
        }
    }

    fn cwd_label(&self, info: &TerminalInfo) -> Option<String> {
        info.cwd
            .as_deref()
            .map(|cwd| cwd_label(cwd, &self.workspace_folders))
    }

    pub fn on_open(&mut self, info: TerminalInfo, active: bool, sink: &mut dyn FrameSink) {
        if self.disposed {
            return;
        }
        let id = self.ensure_session(info);
        let Some(session) = self.sessions.get(&id) else {
            return;
        };
        let info = &session.info;
        info!(target: "beach_cast::terminal", terminal_id = id, name = %info.name, "terminal opened");
        sink.send(Message::TerminalOpen(TerminalOpen {
            terminal_id: id,
            name: info.name.clone(),
            pid: info.pid,
            cols: info.cols,
            rows: info.rows,
            cwd: self.cwd_label(info),
            shell_integration: info.shell_integration,
            active: active || self.active == Some(id),
            timestamp_ms: now_ms(),
        }));
        if active && self.active != Some(id) {
            // The open frame already marks it active; only a focus move needs the state pair.
            if self.live_active().is_some() {
                self.switch_active(Some(id), sink);
            } else {
                self.active = Some(id);
            }
        }
        self.snapshot_all(sink);
    }

    /// Unknown terminals are ignored.
    pub fn on_close(&mut self, key: TerminalKey, exit_code: Option<i32>, sink: &mut dyn FrameSink) {
        if self.disposed {
            return;
        }
        let Some(id) = self.ids.remove(&key) else {
            trace!(target: "beach_cast::terminal", ?key, "close for untracked terminal");
            return;
        };
        sink.send(Message::TerminalClose(TerminalClose {
            terminal_id: id,
            timestamp_ms: now_ms(),
            exit_code,
        }));
        if let Some(session) = self.sessions.remove(&id) {
            for exec in session.executions {
                if let Some(mut handle) = self.executions.remove(&exec) {
                    handle.abort();
                }
            }
        }
        if self.active == Some(id) {
            self.active = None;
        }
        info!(target: "beach_cast::terminal", terminal_id = id, ?exit_code, "terminal closed");
        self.snapshot_all(sink);
    }

    pub fn on_active_changed(&mut self, key: Option<TerminalKey>, sink: &mut dyn FrameSink) {
        if self.disposed {
            return;
        }
        let next = key.map(|key| self.id_for_reference(key));
        if next == self.active {
            return;
        }
        self.switch_active(next, sink);
        self.snapshot_all(sink);
    }

    fn live_active(&self) -> Option<u32> {
        self.active.filter(|id| self.sessions.contains_key(id))
    }

    /// Sends `active=false` for the outgoing session and `active=true` for the incoming one.
    fn switch_active(&mut self, next: Option<u32>, sink: &mut dyn FrameSink) {
        if let Some(previous) = self.live_active() {
            sink.send(Message::TerminalState(TerminalState {
                terminal_id: previous,
                active: false,
            }));
        }
        if let Some(id) = next {
            sink.send(Message::TerminalState(TerminalState {
                terminal_id: id,
                active: true,
            }));
        }
        self.active = next;
    }

    pub fn on_resize(&mut self, key: TerminalKey, cols: u16, rows: u16, sink: &mut dyn FrameSink) {
        if self.disposed {
            return;
        }
        let Some(session) = self.ids.get(&key).and_then(|id| self.sessions.get_mut(id)) else {
            return;
        };
        session.info.cols = Some(cols);
        session.info.rows = Some(rows);
        sink.send(Message::TerminalResize(TerminalResize {
            terminal_id: session.id,
            cols,
            rows,
        }));
    }

    pub fn on_renamed(&mut self, key: TerminalKey, name: String, sink: &mut dyn FrameSink) {
        if self.disposed {
            return;
        }
        let Some(session) = self.ids.get(&key).and_then(|id| self.sessions.get_mut(id)) else {
            return;
        };
        session.info.name = name.clone();
        sink.send(Message::TerminalTitle(TerminalTitle {
            terminal_id: session.id,
            name,
        }));
    }

    /// Output the host reported outside any tracked execution.
    pub fn on_output_chunk(&mut self, key: TerminalKey, data: &str, sink: &mut dyn FrameSink) {
        if self.disposed {
            return;
        }
        if let Some(id) = self.terminal_id(key) {
            self.emit_output(id, None, data, sink);
        }
    }

    /// Sends exec-start and starts reading the execution's output in the background.
    pub fn on_exec_start(&mut self, execution: Execution, sink: &mut dyn FrameSink) {
        if self.disposed {
            return;
        }
        let Execution {
            key,
            terminal,
            command_line,
            cwd,
            output,
        } = execution;
        let terminal_id = self.id_for_reference(terminal);
        let Some(session) = self.sessions.get_mut(&terminal_id) else {
            return;
        };
        let exec_id = session.allocate_exec_id();
        session.executions.insert(key);
        let cwd = cwd
            .as_deref()
            .map(|cwd| cwd_label(cwd, &self.workspace_folders))
            .or_else(|| {
                session
                    .info
                    .cwd
                    .as_deref()
                    .map(|cwd| cwd_label(cwd, &self.workspace_folders))
            });

        sink.send(Message::ExecStart(ExecStart {
            terminal_id,
            exec_id,
            command: redact_secrets(&command_line),
            cwd,
            timestamp_ms: now_ms(),
        }));

        let reader = match output {
            Some(stream) => {
                let task = tokio::spawn(pump_output(key, stream, self.output_tx.clone()));
                Some(task.abort_handle())
            }
            None => {
                debug!(
                    target: "beach_cast::terminal",
                    terminal_id,
                    exec_id,
                    "execution has no readable output"
                );
                None
            }
        };
        let drained = reader.is_none();
        self.executions.insert(
            key,
            ExecutionHandle {
                terminal_id,
                exec_id,
                reader,
                drained,
                pending_exit: None,
            },
        );
    }

    /// Sends exec-end once the execution's output has been fully forwarded.
    pub fn on_exec_end(&mut self, key: ExecutionKey, exit_code: Option<i32>, sink: &mut dyn FrameSink) {
        if self.disposed {
            return;
        }
        let Some(handle) = self.executions.get_mut(&key) else {
            trace!(target: "beach_cast::terminal", ?key, "end for untracked execution");
            return;
        };
        if handle.drained {
            self.finish_execution(key, exit_code, sink);
        } else {
            handle.pending_exit = Some(exit_code);
        }
    }

    pub fn on_exec_output(&mut self, event: ExecOutput, sink: &mut dyn FrameSink) {
        if self.disposed {
            return;
        }
        match event {
            ExecOutput::Chunk { exec, data } => {
                let Some(handle) = self.executions.get(&exec) else {
                    return;
                };
                let (terminal_id, exec_id) = (handle.terminal_id, handle.exec_id);
                self.emit_output(terminal_id, Some(exec_id), &data, sink);
            }
            ExecOutput::Drained { exec } => {
                let Some(handle) = self.executions.get_mut(&exec) else {
                    return;
                };
                handle.drained = true;
                handle.reader = None;
                if let Some(exit_code) = handle.pending_exit.take() {
                    self.finish_execution(exec, exit_code, sink);
                }
            }
        }
    }

    fn finish_execution(&mut self, key: ExecutionKey, exit_code: Option<i32>, sink: &mut dyn FrameSink) {
        let Some(handle) = self.executions.remove(&key) else {
            return;
        };
        if let Some(session) = self.sessions.get_mut(&handle.terminal_id) {
            session.executions.remove(&key);
        }
        sink.send(Message::ExecEnd(ExecEnd {
            terminal_id: handle.terminal_id,
            exec_id: handle.exec_id,
            exit_code,
            timestamp_ms: now_ms(),
        }));
    }

    fn emit_output(&mut self, terminal_id: u32, exec_id: Option<u32>, data: &str, sink: &mut dyn FrameSink) {
        let _perf = PerfGuard::new("terminal_output");
        let Some(session) = self.sessions.get_mut(&terminal_id) else {
            return;
        };
        let redacted = redact_secrets(data);
        let shaped = strip_trailing_prompt_line(&redacted);
        if shaped.is_empty() {
            return;
        }
        let mut text: &str = &shaped;
        if !session.has_emitted_output {
            session.has_emitted_output = true;
            text = strip_leading_line_break(text);
            if text.is_empty() {
                return;
            }
        }
        telemetry::record_bytes("terminal_output", text.len());
        sink.send(Message::TerminalOutput(TerminalOutput {
            terminal_id,
            exec_id,
            seq: session.take_seq(),
            stream: OutputStream::Stdout,
            data: Bytes::copy_from_slice(text.as_bytes()),
        }));
    }

    pub fn snapshot_all(&self, sink: &mut dyn FrameSink) {
        if self.disposed {
            return;
        }
        let terminals = self
            .sessions
            .values()
            .map(|session| TerminalSummary {
                terminal_id: session.id,
                name: session.info.name.clone(),
                cols: session.info.cols,
                rows: session.info.rows,
                cwd: self.cwd_label(&session.info),
                shell_integration: session.info.shell_integration,
                active: self.active == Some(session.id),
                scrollback: String::new(),
            })
            .collect();
        sink.send(Message::TerminalSnapshot(TerminalSnapshot { terminals }));
    }

    /// Registers every terminal the host reports, then sends one snapshot.
    pub fn discover(
        &mut self,
        terminals: Vec<TerminalInfo>,
        active: Option<TerminalKey>,
        sink: &mut dyn FrameSink,
    ) {
        if self.disposed {
            return;
        }
        for info in terminals {
            self.ensure_session(info);
        }
        self.active = active.map(|key| self.id_for_reference(key));
        self.snapshot_all(sink);
    }

    /// Forgets all sessions and stops every reader. Ids keep counting.
    pub fn reset(&mut self) {
        for handle in self.executions.values_mut() {
            handle.abort();
        }
        self.executions.clear();
        self.sessions.clear();
        self.ids.clear();
        self.active = None;
    }

    pub fn dispose(&mut self) {
        self.reset();
        self.disposed = true;
    }
}

impl Drop for TerminalMux {
    fn drop(&mut self) {
        self.reset();
    }
}

async fn pump_output(exec: ExecutionKey, mut stream: BoxStream<'static, String>, tx: mpsc::Sender<ExecOutput>) {
    while let Some(data) = stream.next().await {
        if tx.send(ExecOutput::Chunk { exec, data }).await.is_err() {
            return;
        }
    }
    let _ = tx.send(ExecOutput::Drained { exec }).await;
}

fn strip_leading_line_break(text: &str) -> &str {
    text.strip_prefix("\r\n")
        .or_else(|| text.strip_prefix('\n'))
        .unwrap_or(text)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
