//! Line-delimited JSON bridge that lets an editor extension drive the engine over stdin.
//!
//! Each input line is one [`SidecarEvent`]. The bridge keeps a [`SidecarWorkspace`] in sync with what the
//! editor reported and turns the events into [`HostEvent`]s for the broadcaster.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use globset::{Glob, GlobSet, GlobSetBuilder};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use url::Url;

use crate::document::MAX_DOCUMENT_BYTES;
use crate::error::{CliError, ConfigError, HostError};
use crate::host::{
    Execution, ExecutionKey, HostEvent, IgnoreStatus, Resource, TerminalInfo, TerminalKey,
    TextChange, Workspace,
};
use crate::protocol::{Metadata, Position, Selection, TextRange};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidecarResource {
    pub uri: String,
    pub path: String,
    #[serde(default)]
    pub language_id: Option<String>,
    /// Full buffer contents; unsaved editor buffers are only known through this.
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidecarChange {
    pub offset: u32,
    #[serde(default)]
    pub delete_length: u32,
    #[serde(default)]
    pub inserted_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidecarTerminal {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub cols: Option<u16>,
    #[serde(default)]
    pub rows: Option<u16>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub shell_integration: bool,
}

impl From<SidecarTerminal> for TerminalInfo {
    fn from(terminal: SidecarTerminal) -> Self {
        TerminalInfo {
            key: TerminalKey(terminal.id),
            name: terminal.name,
            pid: terminal.pid,
            cols: terminal.cols,
            rows: terminal.rows,
            cwd: terminal.cwd,
            shell_integration: terminal.shell_integration,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SidecarEvent {
    #[serde(rename_all = "camelCase")]
    ActiveEditor { resource: Option<SidecarResource> },
    #[serde(rename_all = "camelCase")]
    TextChanged { uri: String, changes: Vec<SidecarChange> },
    #[serde(rename_all = "camelCase")]
    SelectionChanged { uri: String, selections: Vec<Selection> },
    #[serde(rename_all = "camelCase")]
    Highlights { uri: String, ranges: Vec<TextRange> },
    #[serde(rename_all = "camelCase")]
    TerminalOpened {
        terminal: SidecarTerminal,
        #[serde(default)]
        active: bool,
    },
    #[serde(rename_all = "camelCase")]
    TerminalClosed {
        id: u64,
        #[serde(default)]
        exit_code: Option<i32>,
    },
    #[serde(rename_all = "camelCase")]
    ActiveTerminal { id: Option<u64> },
    #[serde(rename_all = "camelCase")]
    TerminalResized { id: u64, cols: u16, rows: u16 },
    #[serde(rename_all = "camelCase")]
    TerminalRenamed { id: u64, name: String },
    #[serde(rename_all = "camelCase")]
    TerminalData { id: u64, data: String },
    #[serde(rename_all = "camelCase")]
    ExecStart {
        exec_id: u64,
        terminal: u64,
        command_line: String,
        #[serde(default)]
        cwd: Option<PathBuf>,
        #[serde(default = "default_true")]
        has_output: bool,
    },
    #[serde(rename_all = "camelCase")]
    ExecOutput { exec_id: u64, data: String },
    #[serde(rename_all = "camelCase")]
    ExecOutputEnd { exec_id: u64 },
    #[serde(rename_all = "camelCase")]
    ExecEnd {
        exec_id: u64,
        #[serde(default)]
        exit_code: Option<i32>,
    },
    #[serde(rename_all = "camelCase")]
    WorkspaceFolders { folders: Vec<PathBuf> },
    Start,
    Stop,
    #[serde(rename_all = "camelCase")]
    Metadata {
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        tags: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    AuthToken { token: Option<String> },
}

#[derive(Debug, Default)]
struct WorkspaceState {
    active_resource: Option<Resource>,
    texts: HashMap<String, String>,
    selections: HashMap<String, Vec<Selection>>,
    highlights: HashMap<String, Vec<TextRange>>,
    terminals: BTreeMap<TerminalKey, TerminalInfo>,
    active_terminal: Option<TerminalKey>,
    folders: Vec<PathBuf>,
}

/// [`Workspace`] answered from the state the editor pushed over the sidecar channel.
#[derive(Debug, Clone, Default)]
pub struct SidecarWorkspace {
    state: Arc<Mutex<WorkspaceState>>,
    ignore: Option<Arc<GlobSet>>,
}

impl SidecarWorkspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ignore_patterns(patterns: &[String]) -> Result<Self, ConfigError> {
        if patterns.is_empty() {
            return Ok(Self::default());
        }
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = Glob::new(pattern).map_err(|err| ConfigError::InvalidIgnorePattern {
                pattern: pattern.clone(),
                reason: err.to_string(),
            })?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|err| ConfigError::InvalidIgnorePattern {
                pattern: patterns.join(","),
                reason: err.to_string(),
            })?;
        Ok(Self {
            state: Arc::default(),
            ignore: Some(Arc::new(set)),
        })
    }

    pub fn set_active_resource(&self, resource: Option<Resource>) {
        self.state.lock().active_resource = resource;
    }

    pub fn set_text(&self, uri: &str, text: &str) {
        self.state.lock().texts.insert(uri.to_owned(), text.to_owned());
    }

    /// Keeps the stored buffer in step with an edit batch; offsets are UTF-16 units.
    pub fn apply_changes(&self, uri: &str, changes: &[TextChange]) {
        let mut state = self.state.lock();
        let Some(text) = state.texts.get_mut(uri) else {
            return;
        };
        let mut units: Vec<u16> = text.encode_utf16().collect();
        let mut ordered: Vec<&TextChange> = changes.iter().collect();
        ordered.sort_by(|a, b| b.offset.cmp(&a.offset));
        for change in ordered {
            let start = (change.offset as usize).min(units.len());
            let end = (start + change.delete_length as usize).min(units.len());
            units.splice(start..end, change.inserted_text.encode_utf16());
        }
        *text = String::from_utf16_lossy(&units);
    }

    pub fn set_selections(&self, uri: &str, selections: Vec<Selection>) {
        self.state
            .lock()
            .selections
            .insert(uri.to_owned(), selections);
    }

    pub fn set_highlights(&self, uri: &str, ranges: Vec<TextRange>) {
        self.state.lock().highlights.insert(uri.to_owned(), ranges);
    }

    pub fn upsert_terminal(&self, info: TerminalInfo) {
        self.state.lock().terminals.insert(info.key, info);
    }

    pub fn remove_terminal(&self, key: TerminalKey) {
        let mut state = self.state.lock();
        state.terminals.remove(&key);
        if state.active_terminal == Some(key) {
            state.active_terminal = None;
        }
    }

    pub fn update_terminal(&self, key: TerminalKey, update: impl FnOnce(&mut TerminalInfo)) {
        if let Some(info) = self.state.lock().terminals.get_mut(&key) {
            update(info);
        }
    }

    pub fn set_active_terminal(&self, key: Option<TerminalKey>) {
        self.state.lock().active_terminal = key;
    }

    pub fn set_workspace_folders(&self, folders: Vec<PathBuf>) {
        self.state.lock().folders = folders;
    }

    fn is_ignored_path(&self, resource: &Resource) -> bool {
        let Some(set) = self.ignore.as_ref() else {
            return false;
        };
        if set.is_match(&resource.path) {
            return true;
        }
        file_path(&resource.uri).is_some_and(|path| set.is_match(path))
    }
}

fn file_path(uri: &str) -> Option<PathBuf> {
    Url::parse(uri).ok()?.to_file_path().ok()
}

#[async_trait]
impl Workspace for SidecarWorkspace {
    async fn resolve_ignore_status(&self, resource: &Resource) -> IgnoreStatus {
        let ignored = self.is_ignored_path(resource);
        let buffered = self
            .state
            .lock()
            .texts
            .get(&resource.uri)
            .map(String::len);
        let size = match buffered {
            Some(len) => Some(len as u64),
            None => match file_path(&resource.uri) {
                Some(path) => tokio::fs::metadata(path).await.ok().map(|meta| meta.len()),
                None => None,
            },
        };
        IgnoreStatus {
            ignored,
            too_large: size.is_some_and(|size| size > MAX_DOCUMENT_BYTES as u64),
        }
    }

    async fn active_resource(&self) -> Option<Resource> {
        self.state.lock().active_resource.clone()
    }

    async fn active_text(&self, resource: &Resource) -> Result<String, HostError> {
        let buffered = self.state.lock().texts.get(&resource.uri).cloned();
        if let Some(text) = buffered {
            return Ok(text);
        }
        let path = file_path(&resource.uri)
            .ok_or_else(|| HostError::ResourceUnavailable(resource.uri.clone()))?;
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|err| HostError::ResourceUnavailable(format!("{}: {err}", path.display())))
    }

    async fn selections(&self, resource: &Resource) -> Vec<Selection> {
        self.state
            .lock()
            .selections
            .get(&resource.uri)
            .cloned()
            .unwrap_or_else(|| vec![Selection::caret(Position::default())])
    }

    async fn document_highlights(
        &self,
        resource: &Resource,
        _position: Position,
    ) -> Result<Vec<TextRange>, HostError> {
        self.state
            .lock()
            .highlights
            .get(&resource.uri)
            .cloned()
            .ok_or_else(|| HostError::Highlights("no highlight provider for resource".into()))
    }

    async fn list_open_terminals(&self) -> Vec<TerminalInfo> {
        self.state.lock().terminals.values().cloned().collect()
    }

    async fn active_terminal(&self) -> Option<TerminalKey> {
        self.state.lock().active_terminal
    }

    fn workspace_folders(&self) -> Vec<PathBuf> {
        self.state.lock().folders.clone()
    }
}

/// Translates sidecar events into host events, feeding execution output into per-execution streams.
#[derive(Debug)]
pub struct SidecarBridge {
    workspace: SidecarWorkspace,
    outputs: HashMap<ExecutionKey, mpsc::UnboundedSender<String>>,
}

impl SidecarBridge {
    pub fn new(workspace: SidecarWorkspace) -> Self {
        Self {
            workspace,
            outputs: HashMap::new(),
        }
    }

    pub fn workspace(&self) -> &SidecarWorkspace {
        &self.workspace
    }

    pub fn translate(&mut self, event: SidecarEvent) -> Option<HostEvent> {
        let workspace = &self.workspace;
        match event {
            SidecarEvent::ActiveEditor { resource } => {
                let resource = resource.map(|resource| {
                    if let Some(text) = resource.text.as_deref() {
                        workspace.set_text(&resource.uri, text);
                    }
                    Resource {
                        uri: resource.uri,
                        path: resource.path,
                        language_id: resource.language_id,
                    }
                });
                workspace.set_active_resource(resource.clone());
                Some(HostEvent::ActiveResourceChanged(resource))
            }
            SidecarEvent::TextChanged { uri, changes } => {
                let changes: Vec<TextChange> = changes
                    .into_iter()
                    .map(|change| TextChange {
                        offset: change.offset,
                        delete_length: change.delete_length,
                        inserted_text: change.inserted_text,
                    })
                    .collect();
                workspace.apply_changes(&uri, &changes);
                Some(HostEvent::TextChanged { uri, changes })
            }
            SidecarEvent::SelectionChanged { uri, selections } => {
                workspace.set_selections(&uri, selections.clone());
                Some(HostEvent::SelectionChanged { uri, selections })
            }
            SidecarEvent::Highlights { uri, ranges } => {
                workspace.set_highlights(&uri, ranges);
                None
            }
            SidecarEvent::TerminalOpened { terminal, active } => {
                let info = TerminalInfo::from(terminal);
                workspace.upsert_terminal(info.clone());
                if active {
                    workspace.set_active_terminal(Some(info.key));
                }
                Some(HostEvent::TerminalOpened(info))
            }
            SidecarEvent::TerminalClosed { id, exit_code } => {
                workspace.remove_terminal(TerminalKey(id));
                Some(HostEvent::TerminalClosed {
                    key: TerminalKey(id),
                    exit_code,
                })
            }
            SidecarEvent::ActiveTerminal { id } => {
                let key = id.map(TerminalKey);
                workspace.set_active_terminal(key);
                Some(HostEvent::ActiveTerminalChanged(key))
            }
            SidecarEvent::TerminalResized { id, cols, rows } => {
                workspace.update_terminal(TerminalKey(id), |info| {
                    info.cols = Some(cols);
                    info.rows = Some(rows);
                });
                Some(HostEvent::TerminalResized {
                    key: TerminalKey(id),
                    cols,
                    rows,
                })
            }
            SidecarEvent::TerminalRenamed { id, name } => {
                workspace.update_terminal(TerminalKey(id), |info| info.name = name.clone());
                Some(HostEvent::TerminalRenamed {
                    key: TerminalKey(id),
                    name,
                })
            }
            SidecarEvent::TerminalData { id, data } => Some(HostEvent::TerminalData {
                key: TerminalKey(id),
                data,
            }),
            SidecarEvent::ExecStart {
                exec_id,
                terminal,
                command_line,
                cwd,
                has_output,
            } => {
                let key = ExecutionKey(exec_id);
                let output = has_output.then(|| {
                    let (tx, rx) = mpsc::unbounded_channel::<String>();
                    self.outputs.insert(key, tx);
                    stream::unfold(rx, |mut rx| async move {
                        rx.recv().await.map(|chunk| (chunk, rx))
                    })
                    .boxed()
                });
                Some(HostEvent::ExecutionStarted(Execution {
                    key,
                    terminal: TerminalKey(terminal),
                    command_line,
                    cwd,
                    output,
                }))
            }
            SidecarEvent::ExecOutput { exec_id, data } => {
                match self.outputs.get(&ExecutionKey(exec_id)) {
                    Some(tx) => {
                        let _ = tx.send(data);
                    }
                    None => trace!(target: "beach_cast::sidecar", exec_id, "output for unknown execution"),
                }
                None
            }
            SidecarEvent::ExecOutputEnd { exec_id } => {
                self.outputs.remove(&ExecutionKey(exec_id));
                None
            }
            SidecarEvent::ExecEnd { exec_id, exit_code } => {
                let key = ExecutionKey(exec_id);
                // No output can follow the end of an execution.
                self.outputs.remove(&key);
                Some(HostEvent::ExecutionEnded { key, exit_code })
            }
            SidecarEvent::WorkspaceFolders { folders } => {
                workspace.set_workspace_folders(folders);
                None
            }
            SidecarEvent::Start => Some(HostEvent::StartStreaming),
            SidecarEvent::Stop => Some(HostEvent::StopStreaming),
            SidecarEvent::Metadata {
                title,
                description,
                tags,
            } => Some(HostEvent::UpdateMetadata(Metadata {
                title,
                description,
                tags,
                live: None,
            })),
            SidecarEvent::AuthToken { token } => Some(HostEvent::AuthTokenChanged(token)),
        }
    }
}

/// Reads events until end of input. Malformed lines are logged and skipped.
///
/// Returns the number of host events forwarded.
pub async fn pump_lines<R>(
    reader: R,
    bridge: &mut SidecarBridge,
    events: &mpsc::Sender<HostEvent>,
) -> Result<usize, CliError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut line_no = 0usize;
    let mut forwarded = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let event: SidecarEvent = match serde_json::from_str(trimmed) {
            Ok(event) => event,
            Err(err) => {
                let err = CliError::InvalidHostEvent {
                    line: line_no,
                    reason: err.to_string(),
                };
                warn!(target: "beach_cast::sidecar", error = %err, "skipping host event");
                continue;
            }
        };
        let Some(host_event) = bridge.translate(event) else {
            continue;
        };
        if events.send(host_event).await.is_err() {
            debug!(target: "beach_cast::sidecar", "broadcaster gone; stopping host reader");
            break;
        }
        forwarded += 1;
    }
    Ok(forwarded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test_timeout::timeout]
    fn parses_camel_case_events() {
        let event: SidecarEvent = serde_json::from_str(
            r#"{"type":"execStart","execId":3,"terminal":1,"commandLine":"ls","hasOutput":false}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            SidecarEvent::ExecStart {
                exec_id: 3,
                terminal: 1,
                command_line: "ls".into(),
                cwd: None,
                has_output: false,
            }
        );
        let event: SidecarEvent = serde_json::from_str(r#"{"type":"activeEditor","resource":null}"#).unwrap();
        assert_eq!(event, SidecarEvent::ActiveEditor { resource: None });
    }

    #[test_timeout::timeout]
    fn buffer_tracks_utf16_edits() {
        let workspace = SidecarWorkspace::new();
        workspace.set_text("file:///a", "a😀b");
        workspace.apply_changes(
            "file:///a",
            &[
                TextChange {
                    offset: 3,
                    delete_length: 1,
                    inserted_text: "c".into(),
                },
                TextChange {
                    offset: 0,
                    delete_length: 1,
                    inserted_text: String::new(),
                },
            ],
        );
        assert_eq!(workspace.state.lock().texts["file:///a"], "😀c");
    }

    #[test_timeout::tokio_timeout_test]
    async fn ignore_patterns_and_size_mark_resources_hidden() {
        let workspace = SidecarWorkspace::with_ignore_patterns(&["**/*.pem".into(), "secrets/**".into()]).unwrap();
        let key = Resource::new("file:///repo/certs/server.pem", "certs/server.pem");
        assert!(workspace.resolve_ignore_status(&key).await.ignored);
        let nested = Resource::new("file:///repo/secrets/prod.env", "secrets/prod.env");
        assert!(workspace.resolve_ignore_status(&nested).await.ignored);

        let big = Resource::new("untitled:big", "big.txt");
        workspace.set_text(&big.uri, &"y".repeat(MAX_DOCUMENT_BYTES + 1));
        let status = workspace.resolve_ignore_status(&big).await;
        assert!(status.too_large && !status.ignored);

        assert!(SidecarWorkspace::with_ignore_patterns(&["[".into()]).is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn execution_output_flows_through_stream() {
        let mut bridge = SidecarBridge::new(SidecarWorkspace::new());
        let Some(HostEvent::ExecutionStarted(execution)) = bridge.translate(SidecarEvent::ExecStart {
            exec_id: 1,
            terminal: 1,
            command_line: "make".into(),
            cwd: None,
            has_output: true,
        }) else {
            panic!("expected execution start");
        };
        bridge.translate(SidecarEvent::ExecOutput {
            exec_id: 1,
            data: "building\n".into(),
        });
        let ended = bridge.translate(SidecarEvent::ExecEnd {
            exec_id: 1,
            exit_code: Some(0),
        });
        assert!(matches!(ended, Some(HostEvent::ExecutionEnded { exit_code: Some(0), .. })));

        let chunks: Vec<String> = execution.output.expect("stream").collect().await;
        assert_eq!(chunks, vec!["building\n".to_string()]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn pump_skips_bad_lines() {
        let input = concat!(
            "{\"type\":\"start\"}\n",
            "not json\n",
            "\n",
            "{\"type\":\"workspaceFolders\",\"folders\":[\"/w\"]}\n",
            "{\"type\":\"activeTerminal\",\"id\":4}\n",
        );
        let mut bridge = SidecarBridge::new(SidecarWorkspace::new());
        let (tx, mut rx) = mpsc::channel(8);
        let forwarded = pump_lines(BufReader::new(input.as_bytes()), &mut bridge, &tx)
            .await
            .unwrap();
        assert_eq!(forwarded, 2);
        assert!(matches!(rx.recv().await, Some(HostEvent::StartStreaming)));
        assert!(matches!(
            rx.recv().await,
            Some(HostEvent::ActiveTerminalChanged(Some(TerminalKey(4))))
        ));
        assert_eq!(bridge.workspace().workspace_folders(), vec![PathBuf::from("/w")]);
    }
}
