//! Coordinator that owns the connection, the document engine and the terminal multiplexer.
//!
//! All state changes happen on the task running [`Broadcaster::run`]: host events, transport events and
//! execution output are handled one at a time, each to completion.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::BroadcastConfig;
use crate::connection::{ConnectionManager, ConnectionUpdate, FrameSink};
use crate::document::DocumentSync;
use crate::host::{DisposeBag, HostEvent, Workspace};
use crate::protocol::{GoLive, Message, Metadata};
use crate::terminal::{ExecOutput, TerminalMux};
use crate::transport::{Transport, TransportEvent};

/// Externally observable state, published through a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BroadcastStatus {
    pub connected: bool,
    pub live: bool,
    pub viewers: u32,
}

pub struct Broadcaster {
    connection: ConnectionManager,
    documents: DocumentSync,
    terminals: TerminalMux,
    workspace: Arc<dyn Workspace>,
    metadata: Metadata,
    live: bool,
    viewers: u32,
    welcomed: bool,
    status: watch::Sender<BroadcastStatus>,
    disposables: DisposeBag,
    disposed: bool,
}

impl Broadcaster {
    /// Starts connecting immediately. Nothing is streamed until [`Self::start`].
    pub fn new(
        config: BroadcastConfig,
        transport: Arc<dyn Transport>,
        workspace: Arc<dyn Workspace>,
    ) -> Self {
        let metadata = config.metadata.clone();
        let (status, _) = watch::channel(BroadcastStatus::default());
        Self {
            connection: ConnectionManager::connect(config, transport),
            documents: DocumentSync::new(),
            terminals: TerminalMux::new(),
            workspace,
            metadata,
            live: false,
            viewers: 0,
            welcomed: false,
            status,
            disposables: DisposeBag::new(),
            disposed: false,
        }
    }

    pub fn status(&self) -> watch::Receiver<BroadcastStatus> {
        self.status.subscribe()
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn documents(&self) -> &DocumentSync {
        &self.documents
    }

    pub fn terminals(&self) -> &TerminalMux {
        &self.terminals
    }

    /// Registers teardown for a host subscription; it runs on [`Self::dispose`].
    pub fn register_disposer(&mut self, disposer: impl FnOnce() + Send + 'static) {
        self.disposables.add(disposer);
    }

    fn publish_status(&self) {
        let next = BroadcastStatus {
            connected: self.connection.is_open(),
            live: self.live,
            viewers: self.viewers,
        };
        self.status.send_if_modified(|status| {
            let changed = *status != next;
            *status = next;
            changed
        });
    }

    /// Goes live: announces metadata, then replays the active document and all terminals.
    pub async fn start(&mut self) {
        if self.disposed || self.live {
            return;
        }
        self.live = true;
        info!(target: "beach_cast::broadcaster", room = %self.connection.config().room, "going live");
        self.connection
            .send(Message::UpdateMetadata(self.metadata.clone()));
        self.connection.send(Message::GoLive(GoLive { live: true }));
        self.replay().await;
        self.publish_status();
    }

    /// Stops streaming. Terminal ids keep counting if streaming starts again.
    pub fn stop(&mut self) {
        if self.disposed || !self.live {
            return;
        }
        self.live = false;
        info!(target: "beach_cast::broadcaster", "stopping broadcast");
        self.connection.send(Message::GoLive(GoLive { live: false }));
        self.documents.teardown();
        self.terminals.reset();
        self.publish_status();
    }

    /// Re-sends the active document and a fresh terminal snapshot for viewers who just arrived.
    pub async fn refresh(&mut self) {
        if self.disposed || !self.live {
            return;
        }
        self.replay().await;
    }

    async fn replay(&mut self) {
        let workspace = Arc::clone(&self.workspace);
        self.terminals
            .set_workspace_folders(workspace.workspace_folders());
        self.documents
            .refresh(workspace.as_ref(), &mut self.connection)
            .await;
        let open = workspace.list_open_terminals().await;
        let active = workspace.active_terminal().await;
        self.terminals.discover(open, active, &mut self.connection);
    }

    pub async fn handle(&mut self, event: HostEvent) {
        if self.disposed {
            return;
        }
        let workspace = Arc::clone(&self.workspace);
        match event {
            HostEvent::StartStreaming => self.start().await,
            HostEvent::StopStreaming => self.stop(),
            HostEvent::UpdateMetadata(metadata) => {
                self.metadata = Metadata {
                    live: None,
                    ..metadata
                };
                if self.live {
                    self.connection
                        .send(Message::UpdateMetadata(self.metadata.clone()));
                }
            }
            HostEvent::AuthTokenChanged(token) => {
                info!(target: "beach_cast::broadcaster", "auth token changed; reconnecting");
                self.connection.reconnect(token);
                self.publish_status();
            }
            _ if !self.live => {
                debug!(target: "beach_cast::broadcaster", "ignoring host event while not live");
            }
            HostEvent::ActiveResourceChanged(resource) => {
                self.documents
                    .on_active_resource_changed(resource, false, workspace.as_ref(), &mut self.connection)
                    .await;
            }
            HostEvent::TextChanged { uri, changes } => {
                self.documents
                    .on_text_changed(&uri, &changes, &mut self.connection);
            }
            HostEvent::SelectionChanged { uri, selections } => {
                self.documents
                    .on_selection_changed(&uri, selections, workspace.as_ref(), &mut self.connection)
                    .await;
            }
            HostEvent::TerminalOpened(info) => {
                let active = workspace.active_terminal().await == Some(info.key);
                self.terminals
                    .set_workspace_folders(workspace.workspace_folders());
                self.terminals.on_open(info, active, &mut self.connection);
            }
            HostEvent::TerminalClosed { key, exit_code } => {
                self.terminals.on_close(key, exit_code, &mut self.connection);
            }
            HostEvent::ActiveTerminalChanged(key) => {
                self.terminals.on_active_changed(key, &mut self.connection);
            }
            HostEvent::TerminalResized { key, cols, rows } => {
                self.terminals.on_resize(key, cols, rows, &mut self.connection);
            }
            HostEvent::TerminalRenamed { key, name } => {
                self.terminals.on_renamed(key, name, &mut self.connection);
            }
            HostEvent::TerminalData { key, data } => {
                self.terminals
                    .on_output_chunk(key, &data, &mut self.connection);
            }
            HostEvent::ExecutionStarted(execution) => {
                self.terminals
                    .on_exec_start(execution, &mut self.connection);
            }
            HostEvent::ExecutionEnded { key, exit_code } => {
                self.terminals.on_exec_end(key, exit_code, &mut self.connection);
            }
        }
    }

    pub async fn process_transport_event(&mut self, event: TransportEvent) {
        let Some(update) = self.connection.handle_event(event) else {
            return;
        };
        match update {
            ConnectionUpdate::Opened | ConnectionUpdate::Closed { .. } => {}
            ConnectionUpdate::Welcome(welcome) => {
                let rejoined = self.welcomed;
                self.welcomed = true;
                if let Some(viewers) = welcome.viewers {
                    self.viewers = viewers;
                }
                if rejoined {
                    info!(target: "beach_cast::broadcaster", "relay welcomed us back; replaying state");
                    self.refresh().await;
                }
            }
            ConnectionUpdate::ViewerCount(count) => {
                let grew = count > self.viewers;
                self.viewers = count;
                if grew {
                    debug!(target: "beach_cast::broadcaster", viewers = count, "viewer joined; replaying state");
                    self.refresh().await;
                }
            }
            ConnectionUpdate::Metadata(metadata) => {
                if metadata.live == Some(false) && self.live {
                    warn!(target: "beach_cast::broadcaster", "relay ended the broadcast");
                    self.stop();
                }
            }
        }
        self.publish_status();
    }

    pub fn process_exec_output(&mut self, output: ExecOutput) {
        self.terminals
            .on_exec_output(output, &mut self.connection);
    }

    /// Waits for and handles one transport event.
    pub async fn drive_transport(&mut self) {
        let event = self.connection.next_event().await;
        self.process_transport_event(event).await;
    }

    /// Waits for and handles one event from the execution readers.
    pub async fn drive_exec_output(&mut self) {
        if let Some(output) = self.terminals.next_output().await {
            self.process_exec_output(output);
        }
    }

    /// Runs until the host event channel closes, then disposes everything.
    pub async fn run(mut self, mut events: mpsc::Receiver<HostEvent>) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => {
                        debug!(target: "beach_cast::broadcaster", "host event stream ended");
                        break;
                    }
                },
                event = self.connection.next_event() => self.process_transport_event(event).await,
                Some(output) = self.terminals.next_output() => self.process_exec_output(output),
            }
        }
        self.dispose();
    }

    /// Detaches host subscriptions, drops all state and closes the connection. No frames follow.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.disposables.dispose();
        self.documents.dispose();
        self.terminals.dispose();
        self.connection.close();
        self.live = false;
        self.publish_status();
    }
}

impl Drop for Broadcaster {
    fn drop(&mut self) {
        self.dispose();
    }
}
