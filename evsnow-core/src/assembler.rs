//! Per-partition batch assembly under size/time bounds (spec.md §4.3).
//! Single-owner, no synchronization: the [`crate::PartitionWorker`] that
//! owns one `BatchAssembler` is the only thing that ever touches it.

use evsnow_broker::Event;
use std::time::{Duration, Instant};

/// An ordered, non-empty run of [`Event`]s from one partition, ready to
/// ingest (spec.md §3). `last_sequence` is the candidate checkpoint.
#[derive(Debug, Clone)]
pub struct Batch {
    pub partition_id: String,
    pub events: Vec<Event>,
    pub last_sequence: u64,
    pub earliest_enqueued: chrono::DateTime<chrono::Utc>,
    pub latest_enqueued: chrono::DateTime<chrono::Utc>,
    pub assembly_started_at: Instant,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Accumulates events for one partition until `max_batch_size` events have
/// arrived or `max_wait` has elapsed since the first event of the current
/// buffer (spec.md §4.3).
pub struct BatchAssembler {
    partition_id: String,
    max_batch_size: usize,
    max_wait: Duration,
    buffer: Vec<Event>,
    buffer_started_at: Option<Instant>,
}

impl BatchAssembler {
    pub fn new(partition_id: impl Into<String>, max_batch_size: usize, max_wait: Duration) -> Self {
        Self {
            partition_id: partition_id.into(),
            max_batch_size,
            max_wait,
            buffer: Vec::with_capacity(max_batch_size),
            buffer_started_at: None,
        }
    }

    /// Add one event to the buffer. Returns `true` once the buffer has
    /// reached either threshold, signalling the caller should `take()`.
    pub fn add(&mut self, event: Event) -> bool {
        if self.buffer.is_empty() {
            self.buffer_started_at = Some(Instant::now());
        }
        self.buffer.push(event);
        self.is_ready()
    }

    /// Whether the buffer currently satisfies either threshold, without
    /// mutating anything. Used by the worker's poll loop to decide
    /// whether a wait-expired buffer should be flushed even with no new
    /// events arriving.
    pub fn is_ready(&self) -> bool {
        if self.buffer.len() >= self.max_batch_size {
            return true;
        }
        match self.buffer_started_at {
            Some(started) => started.elapsed() >= self.max_wait,
            None => false,
        }
    }

    /// Atomically remove and return the buffered events as a [`Batch`],
    /// resetting assembler state. Panics if the buffer is empty — callers
    /// must check `is_ready` or use `flush_if_nonempty` instead.
    pub fn take(&mut self) -> Batch {
        assert!(!self.buffer.is_empty(), "take() called on an empty assembler");
        let assembly_started_at = self.buffer_started_at.take().expect("buffer started_at set alongside events");
        let events = std::mem::take(&mut self.buffer);

        let last_sequence = events.last().expect("non-empty").sequence_number;
        let earliest_enqueued = events.iter().map(|e| e.enqueued_time).min().expect("non-empty");
        let latest_enqueued = events.iter().map(|e| e.enqueued_time).max().expect("non-empty");

        Batch {
            partition_id: self.partition_id.clone(),
            events,
            last_sequence,
            earliest_enqueued,
            latest_enqueued,
            assembly_started_at,
        }
    }

    /// Return whatever is buffered regardless of thresholds, or `None` if
    /// the buffer is empty. Used on shutdown drain (spec.md §4.4).
    pub fn flush_if_nonempty(&mut self) -> Option<Batch> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.take())
        }
    }

    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hashbrown::HashMap;

    fn event(seq: u64) -> Event {
        Event {
            payload: vec![],
            partition_id: "0".to_string(),
            sequence_number: seq,
            offset: seq.to_string(),
            enqueued_time: Utc::now(),
            properties: HashMap::new(),
            system_properties: HashMap::new(),
        }
    }

    #[test]
    fn ready_at_max_batch_size() {
        let mut assembler = BatchAssembler::new("0", 3, Duration::from_secs(10));
        assert!(!assembler.add(event(1)));
        assert!(!assembler.add(event(2)));
        assert!(assembler.add(event(3)));

        let batch = assembler.take();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.last_sequence, 3);
    }

    #[test]
    fn take_resets_state() {
        let mut assembler = BatchAssembler::new("0", 3, Duration::from_secs(10));
        assembler.add(event(1));
        assembler.add(event(2));
        assembler.add(event(3));
        assembler.take();

        assert!(assembler.flush_if_nonempty().is_none());
    }

    #[test]
    fn flush_if_nonempty_on_empty_is_none() {
        let mut assembler = BatchAssembler::new("0", 3, Duration::from_secs(10));
        assert!(assembler.flush_if_nonempty().is_none());
    }

    #[test]
    fn flush_if_nonempty_returns_partial_buffer() {
        let mut assembler = BatchAssembler::new("0", 10, Duration::from_secs(10));
        assembler.add(event(1));
        assembler.add(event(2));

        let batch = assembler.flush_if_nonempty().expect("buffer has events");
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.last_sequence, 2);
    }

    #[test]
    fn ready_after_max_wait_elapses() {
        let mut assembler = BatchAssembler::new("0", 100, Duration::from_millis(1));
        assembler.add(event(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(assembler.is_ready());
    }
}
