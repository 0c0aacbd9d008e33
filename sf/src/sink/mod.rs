//! Batched, grouped write sink
//!
//! Decouples producers from the document store: ops queue into a bounded
//! channel, a single batcher task coalesces them into batches, and batches
//! are processed grouped by `(collection, kind)`. Batched creates request
//! the collection's identifying field back so out-of-order store responses
//! still land on the correct caller; updates and deletes run sequentially
//! within their group so one failure never poisons its siblings.

mod op;

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use docstore::StoreHandle;
use futures::StreamExt;
use futures::stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cancel::CancelToken;

pub use op::{WriteKind, WriteOp, WriteResult};

/// Sink configuration with the documented defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SinkConfig {
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub queue_size: usize,
    pub concurrency: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval_ms: 5_000,
            queue_size: 10_000,
            concurrency: 4,
        }
    }
}

/// Errors surfaced to synchronous callers
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("sink is closed")]
    Closed,

    #[error("cancelled while waiting for write result")]
    Cancelled,
}

/// The write sink. Owns its queue, batch buffer, and batcher task.
pub struct WriteSink {
    tx: Mutex<Option<mpsc::Sender<WriteOp>>>,
    flush_tx: mpsc::Sender<()>,
    stopped: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WriteSink {
    /// Start the sink over the given store
    pub fn start(store: Arc<dyn StoreHandle>, config: SinkConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        // Capacity-1 flush channel: pending signals coalesce
        let (flush_tx, flush_rx) = mpsc::channel(1);

        let task = tokio::spawn(run_batcher(store, config, rx, flush_rx));

        Self {
            tx: Mutex::new(Some(tx)),
            flush_tx,
            stopped: AtomicBool::new(false),
            task: Mutex::new(Some(task)),
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<WriteOp>> {
        self.tx.lock().expect("sink lock poisoned").clone()
    }

    /// Fire-and-forget enqueue. Blocks only while the queue is full; a
    /// stopped sink drops the op with a warning.
    pub async fn send(&self, mut op: WriteOp) {
        let Some(tx) = self.sender() else {
            warn!(collection = %op.collection, kind = ?op.kind, "Sink stopped, dropping write");
            op.deliver(WriteResult::failed("sink is closed"));
            return;
        };

        if let Err(mpsc::error::SendError(mut rejected)) = tx.send(op).await {
            warn!(collection = %rejected.collection, "Sink closed during enqueue, dropping write");
            rejected.deliver(WriteResult::failed("sink is closed"));
        }
    }

    /// Enqueue and wait for the store's acknowledgment
    pub async fn send_sync(&self, mut op: WriteOp, cancel: &CancelToken) -> Result<WriteResult, SinkError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SinkError::Closed);
        }

        let rx = op.attach_reply();
        let Some(tx) = self.sender() else {
            return Err(SinkError::Closed);
        };
        tx.send(op).await.map_err(|_| SinkError::Closed)?;

        tokio::select! {
            _ = cancel.cancelled() => Err(SinkError::Cancelled),
            result = rx => result.map_err(|_| SinkError::Closed),
        }
    }

    /// Enqueue all ops and wait for all results, preserving input order
    pub async fn send_many_sync(
        &self,
        ops: Vec<WriteOp>,
        cancel: &CancelToken,
    ) -> Result<Vec<WriteResult>, SinkError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SinkError::Closed);
        }

        let Some(tx) = self.sender() else {
            return Err(SinkError::Closed);
        };

        let mut receivers = Vec::with_capacity(ops.len());
        for mut op in ops {
            receivers.push(op.attach_reply());
            tx.send(op).await.map_err(|_| SinkError::Closed)?;
        }

        let mut results = Vec::with_capacity(receivers.len());
        for rx in receivers {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(SinkError::Cancelled),
                result = rx => result.map_err(|_| SinkError::Closed)?,
            };
            results.push(result);
        }
        Ok(results)
    }

    /// Request an immediate flush. Coalesces with pending signals.
    pub fn flush(&self) {
        let _ = self.flush_tx.try_send(());
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Close the ingress, drain the remaining batch, and wait for the
    /// batcher to exit. Idempotent.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);

        // Dropping the sender closes the ingress channel
        let sender = self.tx.lock().expect("sink lock poisoned").take();
        drop(sender);

        let task = self.task.lock().expect("sink lock poisoned").take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Sink batcher task panicked");
            }
            debug!("Sink stopped");
        }
    }
}

async fn run_batcher(
    store: Arc<dyn StoreHandle>,
    config: SinkConfig,
    mut rx: mpsc::Receiver<WriteOp>,
    mut flush_rx: mpsc::Receiver<()>,
) {
    let mut buffer: Vec<WriteOp> = Vec::with_capacity(config.batch_size);
    let mut ticker = tokio::time::interval(Duration::from_millis(config.flush_interval_ms.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately; skip it
    ticker.tick().await;

    loop {
        tokio::select! {
            maybe_op = rx.recv() => match maybe_op {
                Some(op) => {
                    buffer.push(op);
                    if buffer.len() >= config.batch_size {
                        let batch = std::mem::take(&mut buffer);
                        process_batch(store.as_ref(), config.concurrency, batch).await;
                    }
                }
                // Ingress closed: drain and exit
                None => break,
            },
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    let batch = std::mem::take(&mut buffer);
                    process_batch(store.as_ref(), config.concurrency, batch).await;
                }
            }
            Some(()) = flush_rx.recv() => {
                if !buffer.is_empty() {
                    let batch = std::mem::take(&mut buffer);
                    process_batch(store.as_ref(), config.concurrency, batch).await;
                }
            }
        }
    }

    if !buffer.is_empty() {
        process_batch(store.as_ref(), config.concurrency, buffer).await;
    }
    debug!("Sink batcher drained");
}

async fn process_batch(store: &dyn StoreHandle, concurrency: usize, batch: Vec<WriteOp>) {
    // Group by (collection, kind), preserving arrival order within groups
    let mut groups: Vec<((String, WriteKind), Vec<WriteOp>)> = Vec::new();
    for op in batch {
        let key = (op.collection.clone(), op.kind);
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, ops)) => ops.push(op),
            None => groups.push((key, vec![op])),
        }
    }

    stream::iter(groups)
        .for_each_concurrent(concurrency.max(1), |((collection, kind), ops)| async move {
            match kind {
                WriteKind::Create => process_creates(store, &collection, ops).await,
                WriteKind::Update => process_updates(store, &collection, ops).await,
                WriteKind::Delete => process_deletes(store, &collection, ops).await,
            }
        })
        .await;
}

/// Transient store failures get this many additional attempts per write
const WRITE_RETRIES: u32 = 2;
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Retry a store write while the failure is transient. Protocol errors
/// (GraphQL errors, malformed responses, not-found) surface immediately.
async fn with_write_retries<T, F>(
    collection: &str,
    mut op: impl FnMut() -> F,
) -> Result<T, docstore::StoreError>
where
    F: std::future::Future<Output = Result<T, docstore::StoreError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < WRITE_RETRIES => {
                attempt += 1;
                warn!(collection, attempt, error = %e, "Transient store failure, retrying write");
                tokio::time::sleep(WRITE_RETRY_DELAY * attempt).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn process_creates(store: &dyn StoreHandle, collection: &str, mut ops: Vec<WriteOp>) {
    let docs: Vec<serde_json::Value> = ops.iter().map(|op| op.doc.clone()).collect();
    let match_field = ops.iter().find_map(|op| op.match_field);
    let return_fields: Vec<String> = match_field.map(|f| vec![f.to_string()]).unwrap_or_default();

    let created = match with_write_retries(collection, async || {
        store.create_many(collection, docs.clone(), &return_fields).await
    })
    .await
    {
        Ok(created) => created,
        Err(e) => {
            warn!(collection, count = ops.len(), error = %e, "Batched create failed");
            let message = e.to_string();
            for op in &mut ops {
                op.deliver(WriteResult::failed(&message));
            }
            return;
        }
    };

    debug!(collection, count = created.len(), "Batched create acknowledged");

    match match_field {
        Some(field) => {
            // Field matching: responses may arrive in any order
            let mut claimed = vec![false; created.len()];
            for op in &mut ops {
                let wanted = &op.doc[field];
                let found = created
                    .iter()
                    .enumerate()
                    .find(|(i, doc)| !claimed[*i] && &doc[field] == wanted);

                match found {
                    Some((i, doc)) => {
                        claimed[i] = true;
                        let doc_id = doc["_docID"].as_str().map(String::from);
                        op.deliver(WriteResult::ok(doc_id));
                    }
                    None => {
                        op.deliver(WriteResult::failed(format!(
                            "create response had no document with {field}={wanted}"
                        )));
                    }
                }
            }
        }
        None => {
            // Positional matching
            let mut created = created.into_iter();
            for op in &mut ops {
                match created.next() {
                    Some(doc) => {
                        let doc_id = doc["_docID"].as_str().map(String::from);
                        op.deliver(WriteResult::ok(doc_id));
                    }
                    None => op.deliver(WriteResult::failed("create response was short")),
                }
            }
        }
    }
}

async fn process_updates(store: &dyn StoreHandle, collection: &str, ops: Vec<WriteOp>) {
    for mut op in ops {
        let Some(doc_id) = op.doc_id.clone() else {
            op.deliver(WriteResult::failed("update requires a doc id"));
            continue;
        };

        match with_write_retries(collection, async || store.update(collection, &doc_id, op.doc.clone()).await).await {
            Ok(_) => op.deliver(WriteResult::ok(Some(doc_id))),
            Err(e) => {
                warn!(collection, doc_id = %doc_id, error = %e, "Update failed");
                op.deliver(WriteResult::failed(e.to_string()));
            }
        }
    }
}

async fn process_deletes(store: &dyn StoreHandle, collection: &str, ops: Vec<WriteOp>) {
    for mut op in ops {
        let Some(doc_id) = op.doc_id.clone() else {
            op.deliver(WriteResult::failed("delete requires a doc id"));
            continue;
        };

        match with_write_retries(collection, async || store.delete(collection, &doc_id).await).await {
            Ok(()) => op.deliver(WriteResult::ok(Some(doc_id))),
            Err(e) => {
                warn!(collection, doc_id = %doc_id, error = %e, "Delete failed");
                op.deliver(WriteResult::failed(e.to_string()));
            }
        }
    }
}

#[cfg(test)]
pub mod memstore {
    //! In-memory store used by sink, job, and integration tests

    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

    use async_trait::async_trait;
    use docstore::StoreError;
    use serde_json::{Value, json};

    /// Store fake that records every mutation. `reverse_responses` returns
    /// batched-create results in reverse order to exercise field matching;
    /// `transient_failures` makes the next N writes fail with a 503.
    #[derive(Default)]
    pub struct MemStore {
        next_id: AtomicU64,
        pub reverse_responses: bool,
        pub transient_failures: AtomicU32,
        pub fail_doc_ids: Mutex<HashSet<String>>,
        pub creates: Mutex<Vec<(String, Vec<Value>)>>,
        pub updates: Mutex<Vec<(String, String, Value)>>,
        pub deletes: Mutex<Vec<(String, String)>>,
    }

    impl MemStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn reversing() -> Self {
            Self {
                reverse_responses: true,
                ..Default::default()
            }
        }

        pub fn create_count(&self) -> usize {
            self.creates.lock().unwrap().len()
        }

        fn transient_failure(&self) -> Option<StoreError> {
            let remaining = self.transient_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.transient_failures.fetch_sub(1, Ordering::SeqCst);
                Some(StoreError::Http {
                    status: 503,
                    message: "store briefly unavailable".to_string(),
                })
            } else {
                None
            }
        }
    }

    #[async_trait]
    impl docstore::StoreHandle for MemStore {
        async fn create_many(
            &self,
            collection: &str,
            docs: Vec<Value>,
            return_fields: &[String],
        ) -> Result<Vec<Value>, StoreError> {
            if let Some(e) = self.transient_failure() {
                return Err(e);
            }
            let mut out = Vec::with_capacity(docs.len());
            for doc in &docs {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                let mut created = json!({ "_docID": format!("doc-{id}") });
                for field in return_fields {
                    created[field] = doc[field.as_str()].clone();
                }
                out.push(created);
            }
            self.creates.lock().unwrap().push((collection.to_string(), docs));

            if self.reverse_responses {
                out.reverse();
            }
            Ok(out)
        }

        async fn update(&self, collection: &str, doc_id: &str, input: Value) -> Result<Value, StoreError> {
            if let Some(e) = self.transient_failure() {
                return Err(e);
            }
            if self.fail_doc_ids.lock().unwrap().contains(doc_id) {
                return Err(StoreError::NotFound(format!("{collection}/{doc_id}")));
            }
            self.updates
                .lock()
                .unwrap()
                .push((collection.to_string(), doc_id.to_string(), input));
            Ok(json!({ "_docID": doc_id }))
        }

        async fn delete(&self, collection: &str, doc_id: &str) -> Result<(), StoreError> {
            if let Some(e) = self.transient_failure() {
                return Err(e);
            }
            if self.fail_doc_ids.lock().unwrap().contains(doc_id) {
                return Err(StoreError::NotFound(format!("{collection}/{doc_id}")));
            }
            self.deletes
                .lock()
                .unwrap()
                .push((collection.to_string(), doc_id.to_string()));
            Ok(())
        }
    }
}
