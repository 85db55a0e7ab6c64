//! External emission pipeline (spec §6): `Pipeline.send(batch, priority)`.
//!
//! A multi-producer single-consumer queue per worker; back-pressure is
//! drop-oldest for the offending worker only (spec §4.C, §5, and the
//! decision recorded in DESIGN.md for the open back-pressure question).

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::model::TimestampedValue;

/// One emitted batch plus its correlation id (`device_id + sequence`), per spec §6.
#[derive(Debug, Clone)]
pub struct EmissionBatch {
    pub device_id: String,
    pub sequence: u64,
    pub priority: u8,
    pub values: Vec<TimestampedValue>,
}

pub trait Pipeline: Send + Sync + std::fmt::Debug {
    /// Never blocks the poll thread: on a full queue, drops the oldest batch
    /// for this worker and returns `true` to indicate a drop occurred.
    fn send(&self, batch: EmissionBatch) -> bool;
}

/// In-memory bounded pipeline used by the demo binary and tests.
#[derive(Debug)]
pub struct InMemoryPipeline {
    capacity: usize,
    queue: Mutex<VecDeque<EmissionBatch>>,
    dropped: Mutex<u64>,
}

impl InMemoryPipeline {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            dropped: Mutex::new(0),
        }
    }

    pub fn drain(&self) -> Vec<EmissionBatch> {
        self.queue.lock().unwrap().drain(..).collect()
    }

    pub fn dropped_count(&self) -> u64 {
        *self.dropped.lock().unwrap()
    }
}

impl Pipeline for InMemoryPipeline {
    fn send(&self, batch: EmissionBatch) -> bool {
        let mut queue = self.queue.lock().unwrap();
        let mut dropped = false;
        if queue.len() >= self.capacity {
            queue.pop_front();
            *self.dropped.lock().unwrap() += 1;
            dropped = true;
        }
        queue.push_back(batch);
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PointValue, Quality};

    fn batch(seq: u64) -> EmissionBatch {
        EmissionBatch {
            device_id: "d1".into(),
            sequence: seq,
            priority: 0,
            values: vec![TimestampedValue {
                point_id: "p1".into(),
                value: PointValue::U64(seq),
                quality: Quality::Good,
                sequence: seq,
                captured_at_ms: 0,
                changed: true,
            }],
        }
    }

    #[test]
    fn drop_oldest_when_full() {
        let pipeline = InMemoryPipeline::new(2);
        assert!(!pipeline.send(batch(1)));
        assert!(!pipeline.send(batch(2)));
        assert!(pipeline.send(batch(3))); // drops batch 1
        let remaining = pipeline.drain();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].sequence, 2);
        assert_eq!(remaining[1].sequence, 3);
        assert_eq!(pipeline.dropped_count(), 1);
    }
}
