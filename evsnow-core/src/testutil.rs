//! In-memory [`CheckpointStore`] and [`IngestClient`] doubles used by this
//! crate's own unit tests and by `tests/end_to_end.rs`. Grounded on the
//! same "everything lives behind a `Mutex<HashMap<..>>`" shape as
//! [`evsnow_broker::memory::MemoryEventSource`] — spec.md §8 requires "a
//! harness with in-memory broker and in-memory store implementations"
//! to exercise its six literal end-to-end scenarios.

use crate::error::{CheckpointError, IngestChannelError};
use crate::ports::{AckToken, Checkpoint, CheckpointKey, CheckpointStore, ChannelHandle, IngestClient, WaitOutcome};
use async_trait::async_trait;
use chrono::Utc;
use hashbrown::HashMap;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A scripted, queued failure for one `save()` call on one key. Carries
/// enough to rebuild a fresh `CheckpointError` each time it's popped,
/// since `CheckpointError` itself doesn't implement `Clone` (its
/// `PersistFailure` wraps a boxed `dyn Error`).
#[derive(Clone)]
enum ScriptedCheckpointFailure {
    PersistFailure(String),
    SaveTimeout,
}

impl ScriptedCheckpointFailure {
    fn into_error(self) -> CheckpointError {
        match self {
            ScriptedCheckpointFailure::PersistFailure(reason) => {
                CheckpointError::PersistFailure(Box::new(std::io::Error::new(std::io::ErrorKind::Other, reason)))
            }
            ScriptedCheckpointFailure::SaveTimeout => CheckpointError::SaveTimeout,
        }
    }
}

/// An in-memory, process-local [`CheckpointStore`]. Never persists
/// anything past the test process, which is the point: it exists purely
/// to let `PartitionWorker` tests assert on waterlevel transitions
/// without a real Snowflake account. `save()` can be scripted to fail on
/// demand, letting a test simulate a crash between an ingest ack and a
/// persisted checkpoint (spec.md §8 scenario 4).
#[derive(Clone, Default)]
pub struct MemoryCheckpointStore {
    rows: Arc<Mutex<HashMap<CheckpointKey, Checkpoint>>>,
    save_failures: Arc<Mutex<HashMap<CheckpointKey, VecDeque<ScriptedCheckpointFailure>>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: read the current waterlevel for one partition key, if
    /// any checkpoint has been saved for it.
    pub fn waterlevel_of(&self, key: &CheckpointKey) -> Option<u64> {
        self.rows.lock().expect("lock poisoned").get(key).map(|c| c.waterlevel)
    }

    /// Queue a `CheckpointError::PersistFailure` to be returned by the
    /// next `save()` on `key`, before subsequent saves on that key go
    /// through normally.
    pub fn queue_save_failure(&self, key: &CheckpointKey, reason: impl Into<String>) {
        self.save_failures
            .lock()
            .expect("lock poisoned")
            .entry(key.clone())
            .or_default()
            .push_back(ScriptedCheckpointFailure::PersistFailure(reason.into()));
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn ensure_table(&self) -> Result<(), CheckpointError> {
        Ok(())
    }

    async fn load_all(
        &self,
        namespace: &str,
        hub: &str,
        target_db: &str,
        target_schema: &str,
        target_table: &str,
    ) -> Result<HashMap<String, Checkpoint>, CheckpointError> {
        let rows = self.rows.lock().expect("lock poisoned");
        Ok(rows
            .iter()
            .filter(|(k, _)| {
                k.namespace == namespace
                    && k.hub == hub
                    && k.target_db == target_db
                    && k.target_schema == target_schema
                    && k.target_table == target_table
            })
            .map(|(k, v)| (k.partition_id.clone(), v.clone()))
            .collect())
    }

    async fn save(&self, key: &CheckpointKey, waterlevel: u64, metadata: Value) -> Result<(), CheckpointError> {
        if let Some(script) = self.save_failures.lock().expect("lock poisoned").get_mut(key) {
            if let Some(failure) = script.pop_front() {
                return Err(failure.into_error());
            }
        }

        let mut rows = self.rows.lock().expect("lock poisoned");
        rows.insert(
            key.clone(),
            Checkpoint {
                waterlevel,
                ts_inserted: Utc::now(),
                metadata,
            },
        );
        Ok(())
    }
}

/// A scripted, queued response for one `send()` call: either a failure
/// to return instead of succeeding, or nothing (meaning "succeed").
type SendScript = VecDeque<IngestChannelError>;

struct SharedState {
    /// If set, every `IngestClient::open` on this partition fails with
    /// this message and never succeeds — used for scenario 6 (permanent
    /// error isolates a mapping).
    open_failure: Option<String>,
    send_scripts: HashMap<String, SendScript>,
    sent_rows: HashMap<String, Vec<Vec<Value>>>,
    next_token: u64,
}

/// An in-memory [`IngestClient`] whose [`ChannelHandle::send`] can be
/// scripted to fail N times before succeeding, letting tests exercise the
/// worker's retry path deterministically (spec.md §8 scenario 3).
#[derive(Clone)]
pub struct MemoryIngestClient {
    state: Arc<Mutex<SharedState>>,
}

impl Default for MemoryIngestClient {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(SharedState {
                open_failure: None,
                send_scripts: HashMap::new(),
                sent_rows: HashMap::new(),
                next_token: 0,
            })),
        }
    }
}

impl MemoryIngestClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every future `open()` call fail permanently.
    pub fn fail_open_permanently(&self, reason: impl Into<String>) {
        self.state.lock().expect("lock poisoned").open_failure = Some(reason.into());
    }

    /// Queue `error` to be returned by the next `send()` on `partition_id`
    /// before subsequent sends succeed.
    pub fn queue_send_failure(&self, partition_id: &str, error: IngestChannelError) {
        self.state
            .lock()
            .expect("lock poisoned")
            .send_scripts
            .entry(partition_id.to_string())
            .or_default()
            .push_back(error);
    }

    /// All rows ever successfully sent for `partition_id`, batch by batch,
    /// in send order.
    pub fn sent_batches(&self, partition_id: &str) -> Vec<Vec<Value>> {
        self.state
            .lock()
            .expect("lock poisoned")
            .sent_rows
            .get(partition_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl IngestClient for MemoryIngestClient {
    async fn open(&self, partition_id: &str) -> Result<Box<dyn ChannelHandle>, IngestChannelError> {
        let state = self.state.lock().expect("lock poisoned");
        if let Some(reason) = &state.open_failure {
            return Err(IngestChannelError::Permanent(reason.clone()));
        }
        Ok(Box::new(MemoryChannelHandle {
            partition_id: partition_id.to_string(),
            state: self.state.clone(),
        }))
    }

    async fn close(&self) -> Result<(), IngestChannelError> {
        Ok(())
    }
}

struct MemoryChannelHandle {
    partition_id: String,
    state: Arc<Mutex<SharedState>>,
}

#[async_trait]
impl ChannelHandle for MemoryChannelHandle {
    async fn send(&mut self, rows: Vec<Value>) -> Result<AckToken, IngestChannelError> {
        let mut state = self.state.lock().expect("lock poisoned");
        if let Some(script) = state.send_scripts.get_mut(&self.partition_id) {
            if let Some(err) = script.pop_front() {
                return Err(err);
            }
        }
        let token = state.next_token;
        state.next_token += 1;
        state
            .sent_rows
            .entry(self.partition_id.clone())
            .or_default()
            .push(rows);
        Ok(AckToken(token.to_string()))
    }

    async fn wait_for_durable(&mut self, _token: &AckToken, _deadline: Duration) -> Result<WaitOutcome, IngestChannelError> {
        Ok(WaitOutcome::Durable)
    }

    async fn close(&mut self) -> Result<(), IngestChannelError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn checkpoint_store_round_trips() {
        let store = MemoryCheckpointStore::new();
        let key = CheckpointKey::new("ns", "hub", "DB", "PUBLIC", "T", "0");
        store.save(&key, 5, Value::Null).await.unwrap();
        assert_eq!(store.waterlevel_of(&key), Some(5));

        let loaded = store.load_all("ns", "hub", "DB", "PUBLIC", "T").await.unwrap();
        assert_eq!(loaded.get("0").map(|c| c.waterlevel), Some(5));
    }

    #[tokio::test]
    async fn scripted_save_failure_then_success() {
        let store = MemoryCheckpointStore::new();
        let key = CheckpointKey::new("ns", "hub", "DB", "PUBLIC", "T", "0");
        store.queue_save_failure(&key, "control table unreachable");

        let first = store.save(&key, 5, Value::Null).await;
        assert!(first.is_err());
        assert_eq!(store.waterlevel_of(&key), None);

        store.save(&key, 5, Value::Null).await.unwrap();
        assert_eq!(store.waterlevel_of(&key), Some(5));
    }

    #[tokio::test]
    async fn ingest_client_open_failure_is_permanent() {
        let client = MemoryIngestClient::new();
        client.fail_open_permanently("pipe deleted");
        let err = client.open("0").await.unwrap_err();
        assert!(matches!(err, IngestChannelError::Permanent(_)));
    }

    #[tokio::test]
    async fn scripted_send_failure_then_success() {
        let client = MemoryIngestClient::new();
        client.queue_send_failure("0", IngestChannelError::Transient("blip".to_string()));
        let mut handle = client.open("0").await.unwrap();

        let first = handle.send(vec![Value::from(1)]).await;
        assert!(first.is_err());

        let second = handle.send(vec![Value::from(1)]).await;
        assert!(second.is_ok());

        assert_eq!(client.sent_batches("0").len(), 1);
    }
}
