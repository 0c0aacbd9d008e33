//! Integration tests for the Shelf core
//!
//! These tests exercise the public surface end-to-end: limiter admission,
//! sink batching with identifying-field response matching, structured
//! output repair, and configuration loading.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use docstore::{StoreError, StoreHandle};
use shelf::providers::{ChatMessage, ChatRequest, ChatResult, ProviderError, ResponseFormat};
use shelf::sink::{SinkConfig, SinkError, WriteOp, WriteResult, WriteSink};
use shelf::structured::chat_with_repair;
use shelf::{CancelToken, Config, RateLimiter};

// =============================================================================
// Rate Limiter Tests
// =============================================================================

#[tokio::test]
async fn test_limiter_burst_then_denied() {
    // rps = 10: ten consecutive try_consume calls succeed, the 11th fails
    let limiter = RateLimiter::new(10.0);

    for i in 0..10 {
        assert!(limiter.try_consume().await, "token {i} should be available");
    }
    assert!(!limiter.try_consume().await, "11th token must be denied");
}

#[tokio::test]
async fn test_limiter_429_drains_and_stamps() {
    let limiter = RateLimiter::new(10.0);
    assert!(limiter.try_consume().await);

    limiter.record_429(Some(Duration::from_secs(3))).await;

    let status = limiter.status().await;
    assert!(status.tokens < 1.0, "bucket drained, got {}", status.tokens);
    assert!(status.since_last_429.is_some(), "429 timestamp recorded");
    assert!(!limiter.try_consume().await);
}

// =============================================================================
// Write Sink Tests
// =============================================================================

/// In-memory store that answers batched creates in reverse order, the way
/// a real store may return documents out of order.
#[derive(Default)]
struct ReversingStore {
    next_id: AtomicU64,
    creates: Mutex<Vec<(String, usize)>>,
}

#[async_trait]
impl StoreHandle for ReversingStore {
    async fn create_many(
        &self,
        collection: &str,
        docs: Vec<Value>,
        return_fields: &[String],
    ) -> Result<Vec<Value>, StoreError> {
        self.creates.lock().unwrap().push((collection.to_string(), docs.len()));

        let mut out: Vec<Value> = docs
            .iter()
            .map(|doc| {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                let mut created = json!({ "_docID": format!("bae-{id}") });
                for field in return_fields {
                    created[field] = doc[field.as_str()].clone();
                }
                created
            })
            .collect();
        out.reverse();
        Ok(out)
    }

    async fn update(&self, _collection: &str, doc_id: &str, _input: Value) -> Result<Value, StoreError> {
        Ok(json!({ "_docID": doc_id }))
    }

    async fn delete(&self, _collection: &str, _doc_id: &str) -> Result<(), StoreError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_sink_batches_and_matches_out_of_order_responses() {
    let store = Arc::new(ReversingStore::default());
    let sink = WriteSink::start(
        store.clone(),
        SinkConfig {
            batch_size: 3,
            flush_interval_ms: 5_000,
            queue_size: 100,
            concurrency: 2,
        },
    );
    let cancel = CancelToken::new();

    let ops: Vec<WriteOp> = [1u64, 2, 3]
        .into_iter()
        .map(|page_num| {
            WriteOp::create("Page", json!({ "book_id": "b", "page_num": page_num })).with_match_field("page_num")
        })
        .collect();

    let results = sink.send_many_sync(ops, &cancel).await.expect("sink should deliver");

    // One batched create of three documents
    assert_eq!(*store.creates.lock().unwrap(), vec![("Page".to_string(), 3)]);

    // The store answered in reverse order; field matching restores the
    // correspondence: caller 1 gets bae-0, caller 2 gets bae-1, ...
    assert!(results.iter().all(WriteResult::is_ok));
    assert_eq!(results[0].doc_id.as_deref(), Some("bae-0"));
    assert_eq!(results[1].doc_id.as_deref(), Some("bae-1"));
    assert_eq!(results[2].doc_id.as_deref(), Some("bae-2"));

    // Every doc id distinct
    let ids: HashSet<_> = results.iter().filter_map(|r| r.doc_id.clone()).collect();
    assert_eq!(ids.len(), 3);

    sink.stop().await;
}

#[tokio::test]
async fn test_sink_closed_behaviour() {
    let store = Arc::new(ReversingStore::default());
    let sink = WriteSink::start(store, SinkConfig::default());
    sink.stop().await;

    let cancel = CancelToken::new();
    let op = WriteOp::create("Page", json!({ "page_num": 1 }));
    let err = sink.send_sync(op, &cancel).await.unwrap_err();
    assert_eq!(err, SinkError::Closed);

    // Fire-and-forget on a stopped sink drops without panicking
    sink.send(WriteOp::create("Page", json!({ "page_num": 2 }))).await;
}

// =============================================================================
// Structured Output Tests
// =============================================================================

#[tokio::test]
async fn test_structured_repair_round_trip() {
    // Schema requires level in 1..=3; the first reply violates it, the
    // repair round fixes it
    let request = ChatRequest {
        messages: vec![ChatMessage::user("Classify the heading level.")],
        response_format: Some(ResponseFormat {
            name: "level".to_string(),
            schema: json!({
                "type": "object",
                "properties": { "level": { "type": "integer", "minimum": 1, "maximum": 3 } },
                "required": ["level"]
            }),
        }),
        ..Default::default()
    };

    let replies = Mutex::new(vec![r#"{"level": 2}"#, r#"{"level": 5}"#]);
    let repair_requests = Mutex::new(Vec::new());

    let result = chat_with_repair(request, async |req: ChatRequest| {
        if req.messages.len() > 1 {
            repair_requests.lock().unwrap().push(req.messages.len());
        }
        let content = replies.lock().unwrap().pop().unwrap();
        Ok::<_, ProviderError>(ChatResult {
            content: content.to_string(),
            ..Default::default()
        })
    })
    .await
    .expect("repair should recover");

    assert_eq!(result.parsed.unwrap()["level"], 2);
    // Exactly one repair round happened, carrying the appended turns
    assert_eq!(*repair_requests.lock().unwrap(), vec![3]);
}

// =============================================================================
// Configuration Tests
// =============================================================================

#[test]
fn test_config_loads_from_explicit_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shelf.yml");
    std::fs::write(
        &path,
        "store:\n  base-url: http://elsewhere:9181\nsink:\n  batch-size: 7\n",
    )
    .unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.store.base_url, "http://elsewhere:9181");
    assert_eq!(config.sink.batch_size, 7);
    // Everything else keeps defaults
    assert_eq!(config.scheduler.queue_capacity, 1024);
}
