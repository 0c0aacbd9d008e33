//! Write operations and results

use serde_json::Value;
use tokio::sync::oneshot;

/// Operation kind; the batcher groups by `(collection, kind)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteKind {
    Create,
    Update,
    Delete,
}

/// Outcome of one write, delivered at most once per op
#[derive(Debug, Clone, Default)]
pub struct WriteResult {
    /// docID assigned (create) or targeted (update/delete)
    pub doc_id: Option<String>,
    pub error: Option<String>,
}

impl WriteResult {
    pub fn ok(doc_id: Option<String>) -> Self {
        Self { doc_id, error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            doc_id: None,
            error: Some(error.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// A single persistence request flowing into the sink
#[derive(Debug)]
pub struct WriteOp {
    pub collection: String,
    pub kind: WriteKind,
    /// Document input (create and update)
    pub doc: Value,
    /// Target docID (update and delete only)
    pub doc_id: Option<String>,
    /// Natural identifying field requested back from batched creates so
    /// out-of-order responses land on the correct caller
    pub match_field: Option<&'static str>,
    /// Back-channel for synchronous callers
    pub(crate) reply: Option<oneshot::Sender<WriteResult>>,
}

impl WriteOp {
    pub fn create(collection: impl Into<String>, doc: Value) -> Self {
        Self {
            collection: collection.into(),
            kind: WriteKind::Create,
            doc,
            doc_id: None,
            match_field: None,
            reply: None,
        }
    }

    /// Create for a typed collection, picking up its match field
    pub fn create_for<C: docstore::Collection + serde::Serialize>(doc: &C) -> Result<Self, serde_json::Error> {
        Ok(Self {
            collection: C::NAME.to_string(),
            kind: WriteKind::Create,
            doc: serde_json::to_value(doc)?,
            doc_id: None,
            match_field: C::MATCH_FIELD,
            reply: None,
        })
    }

    pub fn update(collection: impl Into<String>, doc_id: impl Into<String>, input: Value) -> Self {
        Self {
            collection: collection.into(),
            kind: WriteKind::Update,
            doc: input,
            doc_id: Some(doc_id.into()),
            match_field: None,
            reply: None,
        }
    }

    pub fn delete(collection: impl Into<String>, doc_id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            kind: WriteKind::Delete,
            doc: Value::Null,
            doc_id: Some(doc_id.into()),
            match_field: None,
            reply: None,
        }
    }

    pub fn with_match_field(mut self, field: &'static str) -> Self {
        self.match_field = Some(field);
        self
    }

    /// Attach a one-shot back-channel, returning the receiver
    pub(crate) fn attach_reply(&mut self) -> oneshot::Receiver<WriteResult> {
        let (tx, rx) = oneshot::channel();
        self.reply = Some(tx);
        rx
    }

    /// Deliver the result to the caller, if one is waiting. Consumes the
    /// channel so delivery can only happen once.
    pub(crate) fn deliver(&mut self, result: WriteResult) {
        if let Some(tx) = self.reply.take() {
            // Receiver may have given up (cancelled caller); that's fine
            let _ = tx.send(result);
        }
    }
}
