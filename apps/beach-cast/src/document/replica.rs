//! Replicated text behind a small trait so the sync engine does not depend on a CRDT library.

use std::fmt;

use yrs::{
    Doc, GetString, OffsetKind, Options, ReadTxn, StateVector, Subscription, Text, TextRef,
    Transact,
};

/// Receives every locally generated incremental update.
pub type UpdateHook = Box<dyn Fn(&[u8]) + Send + Sync + 'static>;

/// One mutation inside a batch. Offsets and lengths are UTF-16 code units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextOp {
    Insert { offset: u32, text: String },
    Delete { offset: u32, len: u32 },
}

pub trait ReplicatedText {
    fn len(&self) -> u32;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn text(&self) -> String;

    fn insert(&mut self, offset: u32, text: &str) {
        self.apply_in_transaction(&[TextOp::Insert {
            offset,
            text: text.to_owned(),
        }]);
    }

    fn delete(&mut self, offset: u32, len: u32) {
        self.apply_in_transaction(&[TextOp::Delete { offset, len }]);
    }

    /// Applies all ops atomically; the update hook fires once for the whole batch.
    fn apply_in_transaction(&mut self, ops: &[TextOp]);

    /// Full state, decodable by a peer starting from nothing.
    fn encode_full_state(&self) -> Vec<u8>;

    /// Replaces any previous hook. Mutations made before installation are not reported.
    fn set_update_hook(&mut self, hook: UpdateHook);
}

const TEXT_NAME: &str = "content";

/// [`ReplicatedText`] backed by a `yrs` document indexed in UTF-16 units.
pub struct YrsText {
    doc: Doc,
    text: TextRef,
    subscription: Option<Subscription>,
}

impl YrsText {
    pub fn new() -> Self {
        let doc = Doc::with_options(Options {
            offset_kind: OffsetKind::Utf16,
            ..Options::default()
        });
        let text = doc.get_or_insert_text(TEXT_NAME);
        Self {
            doc,
            text,
            subscription: None,
        }
    }
}

impl Default for YrsText {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for YrsText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("YrsText")
            .field("len", &self.len())
            .field("observed", &self.subscription.is_some())
            .finish()
    }
}

impl ReplicatedText for YrsText {
    fn len(&self) -> u32 {
        let txn = self.doc.transact();
        self.text.len(&txn)
    }

    fn text(&self) -> String {
        let txn = self.doc.transact();
        self.text.get_string(&txn)
    }

    fn apply_in_transaction(&mut self, ops: &[TextOp]) {
        if ops.is_empty() {
            return;
        }
        let mut txn = self.doc.transact_mut();
        for op in ops {
            let len = self.text.len(&txn);
            match op {
                TextOp::Insert { offset, text } => {
                    if !text.is_empty() {
                        self.text.insert(&mut txn, (*offset).min(len), text);
                    }
                }
                TextOp::Delete { offset, len: count } => {
                    let start = (*offset).min(len);
                    let count = (*count).min(len - start);
                    if count > 0 {
                        self.text.remove_range(&mut txn, start, count);
                    }
                }
            }
        }
    }

    fn encode_full_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn set_update_hook(&mut self, hook: UpdateHook) {
        self.subscription = None;
        match self
            .doc
            .observe_update_v1(move |_txn, event| hook(&event.update))
        {
            Ok(subscription) => self.subscription = Some(subscription),
            Err(err) => {
                tracing::warn!(target: "beach_cast::document", error = ?err, "failed to observe replica updates");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use yrs::Update;
    use yrs::updates::decoder::Decode;

    fn capture(replica: &mut YrsText) -> Arc<Mutex<Vec<Vec<u8>>>> {
        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&updates);
        replica.set_update_hook(Box::new(move |update| sink.lock().push(update.to_vec())));
        updates
    }

    fn decode_into_fresh(state: &[u8]) -> String {
        let doc = Doc::with_options(Options {
            offset_kind: OffsetKind::Utf16,
            ..Options::default()
        });
        let text = doc.get_or_insert_text(TEXT_NAME);
        let mut txn = doc.transact_mut();
        let _ = txn.apply_update(Update::decode_v1(state).unwrap());
        text.get_string(&txn)
    }

    #[test_timeout::timeout]
    fn seed_is_not_reported_but_later_edits_are() {
        let mut replica = YrsText::new();
        replica.insert(0, "hello world");
        let updates = capture(&mut replica);
        assert!(updates.lock().is_empty());

        replica.apply_in_transaction(&[
            TextOp::Delete { offset: 6, len: 5 },
            TextOp::Insert {
                offset: 6,
                text: "there".into(),
            },
        ]);
        assert_eq!(replica.text(), "hello there");
        assert_eq!(updates.lock().len(), 1);
    }

    #[test_timeout::timeout]
    fn full_state_rebuilds_text_on_a_peer() {
        let mut replica = YrsText::new();
        replica.insert(0, "fn main() {}\n");
        replica.insert(11, " println!(\"é\"); ");
        assert_eq!(decode_into_fresh(&replica.encode_full_state()), replica.text());
    }

    #[test_timeout::timeout]
    fn offsets_are_utf16_and_clamped() {
        let mut replica = YrsText::new();
        replica.insert(0, "a😀b");
        assert_eq!(replica.len(), 4);
        replica.insert(3, "!");
        assert_eq!(replica.text(), "a😀!b");
        replica.delete(4, 100);
        assert_eq!(replica.text(), "a😀!");
        replica.insert(999, "z");
        assert_eq!(replica.text(), "a😀!z");
    }
}
