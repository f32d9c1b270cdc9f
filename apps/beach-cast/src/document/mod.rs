//! Streams the single active text resource as CRDT state.
//!
//! Every switch to a new resource tears the previous replica down, builds a fresh one seeded with the
//! full current text and sends exactly one snapshot. Edits after that travel as the replica's own
//! incremental updates.

pub mod ignore;
pub mod replica;

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::connection::FrameSink;
use crate::host::{Resource, TextChange, Workspace};
use crate::protocol::{
    CursorUpdate, DocumentUpdate, FileInfo, HighlightsUpdate, Message, Selection,
};
use crate::telemetry::PerfGuard;

pub use ignore::{FileId, IgnoreCache, MAX_DOCUMENT_BYTES};
pub use replica::{ReplicatedText, TextOp, YrsText};

pub type ReplicaFactory = Box<dyn Fn() -> Box<dyn ReplicatedText>>;

struct ActiveDocument {
    resource: Resource,
    file_id: FileId,
    /// `None` while the resource is hidden from viewers.
    replica: Option<Box<dyn ReplicatedText>>,
}

pub struct DocumentSync {
    current: Option<ActiveDocument>,
    ignore: IgnoreCache,
    deltas: Arc<Mutex<Vec<Vec<u8>>>>,
    new_replica: ReplicaFactory,
    disposed: bool,
}

impl Default for DocumentSync {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentSync {
    pub fn new() -> Self {
        Self::with_replica_factory(Box::new(|| Box::new(YrsText::new())))
    }

    pub fn with_replica_factory(new_replica: ReplicaFactory) -> Self {
        Self {
            current: None,
            ignore: IgnoreCache::new(),
            deltas: Arc::new(Mutex::new(Vec::new())),
            new_replica,
            disposed: false,
        }
    }

    pub fn current_resource(&self) -> Option<&Resource> {
        self.current.as_ref().map(|doc| &doc.resource)
    }

    pub fn current_file_id(&self) -> Option<&FileId> {
        self.current.as_ref().map(|doc| &doc.file_id)
    }

    /// True when a replica for the active resource is live.
    pub fn is_streaming(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|doc| doc.replica.is_some())
    }

    pub fn current_text(&self) -> Option<String> {
        self.current
            .as_ref()
            .and_then(|doc| doc.replica.as_ref())
            .map(|replica| replica.text())
    }

    pub async fn on_active_resource_changed(
        &mut self,
        resource: Option<Resource>,
        force: bool,
        workspace: &dyn Workspace,
        sink: &mut dyn FrameSink,
    ) {
        if self.disposed {
            return;
        }
        let Some(resource) = resource else {
            self.teardown();
            return;
        };
        let same = self
            .current
            .as_ref()
            .is_some_and(|doc| doc.resource.uri == resource.uri);
        if same && !force {
            trace!(target: "beach_cast::document", path = %resource.path, "active resource unchanged");
            return;
        }
        let _perf = PerfGuard::new("document_switch");

        // A forced refresh of the live resource keeps the replica's view of the text.
        let reseed = if same { self.current_text() } else { None };
        self.teardown();

        let file_id = FileId::for_path(&resource.path);
        let text = if self.ignore.is_hidden(&resource, workspace).await {
            None
        } else {
            let fetched = match reseed {
                Some(text) => Ok(text),
                None => workspace.active_text(&resource).await,
            };
            match fetched {
                Ok(text) if text.len() > MAX_DOCUMENT_BYTES => {
                    info!(
                        target: "beach_cast::document",
                        path = %resource.path,
                        bytes = text.len(),
                        "resource too large to stream"
                    );
                    self.ignore.mark_too_large(&resource.uri);
                    None
                }
                Ok(text) => Some(text),
                Err(err) => {
                    warn!(
                        target: "beach_cast::document",
                        path = %resource.path,
                        error = %err,
                        "failed to read resource text"
                    );
                    None
                }
            }
        };

        sink.send(Message::FileInfo(FileInfo {
            file_id: file_id.to_string(),
            path: resource.path.clone(),
            language: resource.language_id.clone(),
            ignored: text.is_none(),
        }));

        let Some(text) = text else {
            debug!(target: "beach_cast::document", path = %resource.path, "streaming placeholder for hidden resource");
            self.current = Some(ActiveDocument {
                resource,
                file_id,
                replica: None,
            });
            return;
        };

        let mut replica = (self.new_replica)();
        if !text.is_empty() {
            replica.insert(0, &text);
        }
        let deltas = Arc::clone(&self.deltas);
        replica.set_update_hook(Box::new(move |update| deltas.lock().push(update.to_vec())));

        sink.send(Message::DocumentSnapshot(DocumentUpdate {
            file_id: file_id.to_string(),
            update: Bytes::from(replica.encode_full_state()),
        }));
        info!(
            target: "beach_cast::document",
            path = %resource.path,
            file_id = %file_id,
            forced = force,
            "streaming resource"
        );

        let selections = workspace.selections(&resource).await;
        self.current = Some(ActiveDocument {
            resource,
            file_id,
            replica: Some(replica),
        });
        self.send_cursor(selections, workspace, sink).await;
    }

    /// Applies one host edit batch and forwards the resulting replica updates.
    pub fn on_text_changed(&mut self, uri: &str, changes: &[TextChange], sink: &mut dyn FrameSink) {
        if self.disposed || changes.is_empty() {
            return;
        }
        let Some(doc) = self.current.as_mut() else {
            return;
        };
        if doc.resource.uri != uri {
            return;
        }
        let Some(replica) = doc.replica.as_mut() else {
            return;
        };
        let _perf = PerfGuard::new("document_edit");
        replica.apply_in_transaction(&ops_for_changes(changes));

        let file_id = doc.file_id.to_string();
        let updates: Vec<Vec<u8>> = self.deltas.lock().drain(..).collect();
        for update in updates {
            crate::telemetry::record_bytes("document_delta", update.len());
            sink.send(Message::DocumentDelta(DocumentUpdate {
                file_id: file_id.clone(),
                update: Bytes::from(update),
            }));
        }
    }

    pub async fn on_selection_changed(
        &mut self,
        uri: &str,
        selections: Vec<Selection>,
        workspace: &dyn Workspace,
        sink: &mut dyn FrameSink,
    ) {
        if self.disposed {
            return;
        }
        let tracked = self
            .current
            .as_ref()
            .is_some_and(|doc| doc.resource.uri == uri && doc.replica.is_some());
        if tracked {
            self.send_cursor(selections, workspace, sink).await;
        }
    }

    /// Re-sends the active resource as if it had just been opened.
    pub async fn refresh(&mut self, workspace: &dyn Workspace, sink: &mut dyn FrameSink) {
        let resource = workspace.active_resource().await;
        self.on_active_resource_changed(resource, true, workspace, sink)
            .await;
    }

    async fn send_cursor(
        &self,
        selections: Vec<Selection>,
        workspace: &dyn Workspace,
        sink: &mut dyn FrameSink,
    ) {
        let Some(doc) = self.current.as_ref() else {
            return;
        };
        let position = selections
            .first()
            .map(|selection| selection.active)
            .unwrap_or_default();
        sink.send(Message::Cursor(CursorUpdate {
            file_id: doc.file_id.to_string(),
            selections,
        }));
        match workspace.document_highlights(&doc.resource, position).await {
            Ok(ranges) => sink.send(Message::Highlights(HighlightsUpdate {
                file_id: doc.file_id.to_string(),
                ranges,
            })),
            Err(err) => {
                debug!(target: "beach_cast::document", error = %err, "highlights unavailable");
            }
        }
    }

    /// Drops the replica (and its update subscription) without sending anything.
    pub fn teardown(&mut self) {
        if let Some(doc) = self.current.take() {
            debug!(target: "beach_cast::document", path = %doc.resource.path, "tearing down replica");
        }
        self.deltas.lock().clear();
    }

    pub fn dispose(&mut self) {
        self.teardown();
        self.disposed = true;
    }
}

/// Orders a batch by descending start offset so earlier ranges stay valid while later ones are applied.
pub(crate) fn ops_for_changes(changes: &[TextChange]) -> Vec<TextOp> {
    let mut ordered: Vec<&TextChange> = changes.iter().collect();
    ordered.sort_by(|a, b| b.offset.cmp(&a.offset));
    let mut ops = Vec::with_capacity(ordered.len() * 2);
    for change in ordered {
        if change.delete_length > 0 {
            ops.push(TextOp::Delete {
                offset: change.offset,
                len: change.delete_length,
            });
        }
        if !change.inserted_text.is_empty() {
            ops.push(TextOp::Insert {
                offset: change.offset,
                text: change.inserted_text.clone(),
            });
        }
    }
    ops
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Position;
    use crate::sidecar::SidecarWorkspace;
    use proptest::prelude::*;

    fn change(offset: u32, delete_length: u32, inserted: &str) -> TextChange {
        TextChange {
            offset,
            delete_length,
            inserted_text: inserted.to_string(),
        }
    }

    fn workspace_with(uri: &str, text: &str) -> (SidecarWorkspace, Resource) {
        let workspace = SidecarWorkspace::default();
        let resource = Resource::new(uri, uri.trim_start_matches("file:///")).with_language("rust");
        workspace.set_text(uri, text);
        workspace.set_active_resource(Some(resource.clone()));
        (workspace, resource)
    }

    fn kinds(frames: &[Message]) -> Vec<&'static str> {
        frames
            .iter()
            .map(|message| match message {
                Message::FileInfo(_) => "file-info",
                Message::DocumentSnapshot(_) => "snapshot",
                Message::DocumentDelta(_) => "delta",
                Message::Cursor(_) => "cursor",
                Message::Highlights(_) => "highlights",
                _ => "other",
            })
            .collect()
    }

    #[test_timeout::tokio_timeout_test]
    async fn switch_sends_info_snapshot_and_cursor() {
        let (workspace, resource) = workspace_with("file:///src/main.rs", "fn main() {}\n");
        workspace.set_highlights(
            &resource.uri,
            vec![crate::protocol::TextRange {
                start: Position::default(),
                end: Position {
                    line: 0,
                    character: 2,
                },
            }],
        );
        let mut sync = DocumentSync::new();
        let mut frames = Vec::new();
        sync.on_active_resource_changed(Some(resource.clone()), false, &workspace, &mut frames)
            .await;

        assert_eq!(kinds(&frames), ["file-info", "snapshot", "cursor", "highlights"]);
        let Message::FileInfo(info) = &frames[0] else {
            unreachable!()
        };
        assert_eq!(info.path, "src/main.rs");
        assert_eq!(info.language.as_deref(), Some("rust"));
        assert!(!info.ignored);
        assert_eq!(sync.current_text().as_deref(), Some("fn main() {}\n"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn repeated_switch_is_deduplicated_and_force_resends_once() {
        let (workspace, resource) = workspace_with("file:///a.txt", "alpha");
        let mut sync = DocumentSync::new();
        let mut frames = Vec::new();
        sync.on_active_resource_changed(Some(resource.clone()), false, &workspace, &mut frames)
            .await;
        sync.on_active_resource_changed(Some(resource.clone()), false, &workspace, &mut frames)
            .await;
        let snapshots = |frames: &[Message]| kinds(frames).iter().filter(|k| **k == "snapshot").count();
        assert_eq!(snapshots(&frames), 1);

        sync.on_active_resource_changed(Some(resource), true, &workspace, &mut frames)
            .await;
        assert_eq!(snapshots(&frames), 2);
    }

    #[test_timeout::tokio_timeout_test]
    async fn forced_refresh_reseeds_from_live_replica() {
        let (workspace, resource) = workspace_with("file:///a.txt", "alpha");
        let mut sync = DocumentSync::new();
        let mut frames = Vec::new();
        sync.on_active_resource_changed(Some(resource.clone()), false, &workspace, &mut frames)
            .await;
        sync.on_text_changed(&resource.uri, &[change(5, 0, " beta")], &mut frames);
        // The host copy is stale; the replica has the edit.
        sync.on_active_resource_changed(Some(resource), true, &workspace, &mut frames)
            .await;
        assert_eq!(sync.current_text().as_deref(), Some("alpha beta"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn ignored_resource_announces_placeholder_only() {
        let workspace = SidecarWorkspace::with_ignore_patterns(&["**/.env".to_string()]).unwrap();
        let resource = Resource::new("file:///app/.env", "app/.env");
        workspace.set_text(&resource.uri, "SECRET=1");
        let mut sync = DocumentSync::new();
        let mut frames = Vec::new();
        sync.on_active_resource_changed(Some(resource.clone()), false, &workspace, &mut frames)
            .await;
        assert_eq!(kinds(&frames), ["file-info"]);
        assert!(matches!(&frames[0], Message::FileInfo(info) if info.ignored));

        sync.on_text_changed(&resource.uri, &[change(0, 0, "x")], &mut frames);
        sync.on_selection_changed(&resource.uri, vec![], &workspace, &mut frames)
            .await;
        assert_eq!(frames.len(), 1);
        assert!(!sync.is_streaming());
    }

    #[test_timeout::tokio_timeout_test]
    async fn oversized_text_is_hidden_and_remembered() {
        let big = "x".repeat(MAX_DOCUMENT_BYTES + 1);
        let (workspace, resource) = workspace_with("file:///big.log", &big);
        let mut sync = DocumentSync::new();
        let mut frames = Vec::new();
        sync.on_active_resource_changed(Some(resource.clone()), false, &workspace, &mut frames)
            .await;
        assert!(matches!(&frames[0], Message::FileInfo(info) if info.ignored));
        assert_eq!(sync.ignore.cached(&resource.uri), Some(true));
    }

    #[test_timeout::tokio_timeout_test]
    async fn edits_emit_deltas_only_for_tracked_resource() {
        let (workspace, resource) = workspace_with("file:///a.txt", "hello world");
        let mut sync = DocumentSync::new();
        let mut frames = Vec::new();
        sync.on_active_resource_changed(Some(resource.clone()), false, &workspace, &mut frames)
            .await;
        frames.clear();

        sync.on_text_changed("file:///other.txt", &[change(0, 0, "x")], &mut frames);
        assert!(frames.is_empty());

        sync.on_text_changed(
            &resource.uri,
            &[change(0, 5, "howdy"), change(6, 5, "there")],
            &mut frames,
        );
        assert_eq!(kinds(&frames), ["delta"]);
        assert_eq!(sync.current_text().as_deref(), Some("howdy there"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn switching_to_nothing_and_dispose_stop_all_frames() {
        let (workspace, resource) = workspace_with("file:///a.txt", "abc");
        let mut sync = DocumentSync::new();
        let mut frames = Vec::new();
        sync.on_active_resource_changed(Some(resource.clone()), false, &workspace, &mut frames)
            .await;
        sync.on_active_resource_changed(None, false, &workspace, &mut frames)
            .await;
        assert!(sync.current_resource().is_none());

        frames.clear();
        sync.dispose();
        sync.on_active_resource_changed(Some(resource.clone()), true, &workspace, &mut frames)
            .await;
        sync.on_text_changed(&resource.uri, &[change(0, 0, "x")], &mut frames);
        assert!(frames.is_empty());
    }

    fn apply_model(text: &str, changes: &[TextChange]) -> String {
        let mut units: Vec<u16> = text.encode_utf16().collect();
        let mut ordered = changes.to_vec();
        ordered.sort_by(|a, b| b.offset.cmp(&a.offset));
        for change in ordered {
            let start = change.offset as usize;
            let end = start + change.delete_length as usize;
            units.splice(start..end, change.inserted_text.encode_utf16());
        }
        String::from_utf16_lossy(&units)
    }

    /// Non-overlapping edits in arbitrary order against a document without surrogate pairs.
    fn edit_batch() -> impl Strategy<Value = (String, Vec<TextChange>)> {
        "[a-zé文 \n]{0,40}".prop_flat_map(|text| {
            let len = text.encode_utf16().count() as u32;
            let raw = prop::collection::vec((0..=len, 0..=4u32, "[a-z文]{0,3}"), 0..6);
            (Just(text), raw).prop_map(move |(text, raw)| {
                let mut sorted = raw;
                sorted.sort_by_key(|(offset, _, _)| *offset);
                let mut changes = Vec::new();
                let mut floor = 0u32;
                for (offset, delete, inserted) in sorted {
                    if offset < floor {
                        continue;
                    }
                    let delete = delete.min(len - offset);
                    floor = offset + delete.max(1);
                    changes.push(change(offset, delete, &inserted));
                }
                (text, changes)
            })
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 128, .. ProptestConfig::default() })]

        #[test]
        fn descending_application_matches_string_model((text, changes) in edit_batch()) {
            let mut replica = YrsText::new();
            replica.insert(0, &text);
            replica.apply_in_transaction(&ops_for_changes(&changes));
            prop_assert_eq!(replica.text(), apply_model(&text, &changes));
        }
    }
}
