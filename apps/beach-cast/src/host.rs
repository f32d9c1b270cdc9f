//! Boundary to the editing environment: the events it pushes and the queries it answers.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::HostError;
use crate::protocol::{Metadata, Position, Selection, TextRange};

/// A text resource the host can show in an editor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Resource {
    pub uri: String,
    /// Workspace-relative display path.
    pub path: String,
    pub language_id: Option<String>,
}

impl Resource {
    pub fn new(uri: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            path: path.into(),
            language_id: None,
        }
    }

    pub fn with_language(mut self, language_id: impl Into<String>) -> Self {
        self.language_id = Some(language_id.into());
        self
    }
}

/// One edit, with offsets in UTF-16 code units relative to the document before the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChange {
    pub offset: u32,
    pub delete_length: u32,
    pub inserted_text: String,
}

/// Host handle for a terminal. Only meaningful to the host; the wire uses assigned ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TerminalKey(pub u64);

/// Host handle for one command execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutionKey(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalInfo {
    pub key: TerminalKey,
    pub name: String,
    pub pid: Option<u32>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub cwd: Option<PathBuf>,
    pub shell_integration: bool,
}

impl TerminalInfo {
    pub fn new(key: TerminalKey, name: impl Into<String>) -> Self {
        Self {
            key,
            name: name.into(),
            pid: None,
            cols: None,
            rows: None,
            cwd: None,
            shell_integration: false,
        }
    }
}

/// A command the host started in a terminal.
///
/// `output` is finite and can be read once. It is absent when the terminal has no shell integration.
pub struct Execution {
    pub key: ExecutionKey,
    pub terminal: TerminalKey,
    pub command_line: String,
    pub cwd: Option<PathBuf>,
    pub output: Option<BoxStream<'static, String>>,
}

impl fmt::Debug for Execution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Execution")
            .field("key", &self.key)
            .field("terminal", &self.terminal)
            .field("command_line", &self.command_line)
            .field("cwd", &self.cwd)
            .field("output", &self.output.as_ref().map(|_| "<stream>"))
            .finish()
    }
}

#[derive(Debug)]
pub enum HostEvent {
    ActiveResourceChanged(Option<Resource>),
    TextChanged {
        uri: String,
        changes: Vec<TextChange>,
    },
    SelectionChanged {
        uri: String,
        selections: Vec<Selection>,
    },
    TerminalOpened(TerminalInfo),
    TerminalClosed {
        key: TerminalKey,
        exit_code: Option<i32>,
    },
    ActiveTerminalChanged(Option<TerminalKey>),
    TerminalResized {
        key: TerminalKey,
        cols: u16,
        rows: u16,
    },
    TerminalRenamed {
        key: TerminalKey,
        name: String,
    },
    /// Output the host surfaced outside any tracked execution.
    TerminalData {
        key: TerminalKey,
        data: String,
    },
    ExecutionStarted(Execution),
    ExecutionEnded {
        key: ExecutionKey,
        exit_code: Option<i32>,
    },
    StartStreaming,
    StopStreaming,
    UpdateMetadata(Metadata),
    AuthTokenChanged(Option<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IgnoreStatus {
    pub ignored: bool,
    pub too_large: bool,
}

impl IgnoreStatus {
    pub fn is_hidden(self) -> bool {
        self.ignored || self.too_large
    }
}

/// Queries the engine makes against the host.
#[async_trait]
pub trait Workspace: Send + Sync {
    async fn resolve_ignore_status(&self, resource: &Resource) -> IgnoreStatus;

    async fn active_resource(&self) -> Option<Resource>;

    async fn active_text(&self, resource: &Resource) -> Result<String, HostError>;

    async fn selections(&self, resource: &Resource) -> Vec<Selection>;

    async fn document_highlights(
        &self,
        resource: &Resource,
        position: Position,
    ) -> Result<Vec<TextRange>, HostError>;

    async fn list_open_terminals(&self) -> Vec<TerminalInfo>;

    async fn active_terminal(&self) -> Option<TerminalKey>;

    fn workspace_folders(&self) -> Vec<PathBuf>;
}

type Disposer = Box<dyn FnOnce() + Send>;

/// Teardown callbacks for host subscriptions, run once in reverse registration order.
#[derive(Default)]
pub struct DisposeBag {
    disposers: Vec<Disposer>,
}

impl DisposeBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, disposer: impl FnOnce() + Send + 'static) {
        self.disposers.push(Box::new(disposer));
    }

    pub fn len(&self) -> usize {
        self.disposers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.disposers.is_empty()
    }

    pub fn dispose(&mut self) {
        while let Some(disposer) = self.disposers.pop() {
            disposer();
        }
    }
}

impl Drop for DisposeBag {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for DisposeBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisposeBag")
            .field("pending", &self.disposers.len())
            .finish()
    }
}
