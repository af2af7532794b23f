use crate::{BrokerError, Event, EventSource, PartitionCursor, PartitionId, StartPosition};
use async_trait::async_trait;
use hashbrown::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// An in-memory [`EventSource`] used by unit and end-to-end tests. Events
/// can be seeded up front or pushed while workers are running, to exercise
/// the "broker produces faster than we can drain it" backpressure path.
#[derive(Clone)]
pub struct MemoryEventSource {
    inner: Arc<Mutex<HashMap<PartitionId, Vec<Event>>>>,
}

impl MemoryEventSource {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Seed events for a partition before any worker starts consuming it.
    /// Declares the partition even if `events` is empty.
    pub async fn seed(&self, partition: impl Into<PartitionId>, events: Vec<Event>) {
        let mut guard = self.inner.lock().await;
        guard.entry(partition.into()).or_default().extend(events);
    }

    /// Append a single event to a partition's log, as if the broker had
    /// just produced it. Usable while a cursor is open on that partition.
    pub async fn push(&self, partition: impl Into<PartitionId>, event: Event) {
        let mut guard = self.inner.lock().await;
        guard.entry(partition.into()).or_default().push(event);
    }
}

impl Default for MemoryEventSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSource for MemoryEventSource {
    async fn partitions(&self) -> Result<Vec<PartitionId>, BrokerError> {
        let guard = self.inner.lock().await;
        let mut ids: Vec<_> = guard.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn open_partition(
        &self,
        partition: &PartitionId,
        after_sequence: Option<u64>,
        start: StartPosition,
    ) -> Result<Box<dyn PartitionCursor>, BrokerError> {
        let guard = self.inner.lock().await;
        if !guard.contains_key(partition) {
            return Err(BrokerError::UnknownPartition(partition.clone()));
        }
        let next_sequence = match after_sequence {
            Some(seq) => seq + 1,
            None => match start {
                StartPosition::Earliest => 0,
                // "latest" with no checkpoint means: skip whatever is
                // already buffered, only see events produced from now on.
                StartPosition::Latest => guard
                    .get(partition)
                    .and_then(|events| events.last())
                    .map(|e| e.sequence_number + 1)
                    .unwrap_or(0),
            },
        };
        Ok(Box::new(MemoryPartitionCursor {
            source: self.inner.clone(),
            partition: partition.clone(),
            next_sequence,
        }))
    }
}

struct MemoryPartitionCursor {
    source: Arc<Mutex<HashMap<PartitionId, Vec<Event>>>>,
    partition: PartitionId,
    next_sequence: u64,
}

#[async_trait]
impl PartitionCursor for MemoryPartitionCursor {
    async fn receive(&mut self, max: usize, timeout: Duration) -> Result<Vec<Event>, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let guard = self.source.lock().await;
                if let Some(events) = guard.get(&self.partition) {
                    let batch: Vec<Event> = events
                        .iter()
                        .filter(|e| e.sequence_number >= self.next_sequence)
                        .take(max)
                        .cloned()
                        .collect();
                    if !batch.is_empty() {
                        self.next_sequence = batch.last().unwrap().sequence_number + 1;
                        return Ok(batch);
                    }
                }
            }

            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(Duration::from_millis(5).min(deadline - Instant::now())).await;
        }
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(seq: u64) -> Event {
        Event {
            payload: seq.to_string().into_bytes(),
            partition_id: "0".into(),
            sequence_number: seq,
            offset: seq.to_string(),
            enqueued_time: Utc::now(),
            properties: Default::default(),
            system_properties: Default::default(),
        }
    }

    #[tokio::test]
    async fn resumes_after_checkpoint() {
        let source = MemoryEventSource::new();
        source
            .seed("0", vec![event(1), event(2), event(3)])
            .await;

        let mut cursor = source
            .open_partition(&"0".to_string(), Some(1), StartPosition::Earliest)
            .await
            .unwrap();

        let batch = cursor
            .receive(10, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(
            batch.iter().map(|e| e.sequence_number).collect::<Vec<_>>(),
            vec![2, 3]
        );
    }

    #[tokio::test]
    async fn latest_with_no_checkpoint_skips_buffered_events() {
        let source = MemoryEventSource::new();
        source.seed("0", vec![event(1), event(2)]).await;

        let mut cursor = source
            .open_partition(&"0".to_string(), None, StartPosition::Latest)
            .await
            .unwrap();

        let batch = cursor
            .receive(10, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(batch.is_empty());

        source.push("0", event(3)).await;
        let batch = cursor
            .receive(10, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(
            batch.iter().map(|e| e.sequence_number).collect::<Vec<_>>(),
            vec![3]
        );
    }

    #[tokio::test]
    async fn unknown_partition_errors() {
        let source = MemoryEventSource::new();
        let result = source
            .open_partition(&"missing".to_string(), None, StartPosition::Latest)
            .await;
        assert!(matches!(result, Err(BrokerError::UnknownPartition(_))));
    }
}
