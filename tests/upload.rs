//! Drain semantics of the deferred-write queue.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use deimos::upload::{UploadQueue, UploadTarget};

/// In-memory stand-in for a GPU buffer: records every applied write.
#[derive(Default)]
struct RecordingTarget {
    bytes: Mutex<Vec<u8>>,
    writes: Mutex<Vec<(Vec<u8>, u64)>>,
}

impl RecordingTarget {
    fn with_size(size: usize) -> Arc<Self> {
        Arc::new(RecordingTarget {
            bytes: Mutex::new(vec![0; size]),
            writes: Mutex::new(vec![]),
        })
    }

    fn contents(&self) -> Vec<u8> {
        self.bytes.lock().unwrap().clone()
    }

    fn write_count(&self) -> usize {
        self.writes.lock().unwrap().len()
    }
}

impl UploadTarget for RecordingTarget {
    fn write(&self, payload: &[u8], offset: u64) -> Result<()> {
        let mut bytes = self.bytes.lock().unwrap();
        let offset = offset as usize;
        bytes[offset..offset + payload.len()].copy_from_slice(payload);
        self.writes.lock().unwrap().push((payload.to_vec(), offset as u64));
        Ok(())
    }
}

#[test]
fn drain_applies_writes_in_fifo_order() {
    let queue = UploadQueue::new();
    let target = RecordingTarget::with_size(8);
    queue.request(&target, vec![1, 1, 1, 1], 0);
    queue.request(&target, vec![2, 2], 2);

    assert_eq!(queue.drain().unwrap(), 2);
    // The later request overlaps the earlier one and wins where they overlap.
    assert_eq!(target.contents(), vec![1, 1, 2, 2, 0, 0, 0, 0]);
    let writes = target.writes.lock().unwrap();
    assert_eq!(writes[0], (vec![1, 1, 1, 1], 0));
    assert_eq!(writes[1], (vec![2, 2], 2));
}

#[test]
fn each_request_is_applied_exactly_once() {
    let queue = UploadQueue::new();
    let target = RecordingTarget::with_size(4);
    queue.request(&target, vec![7; 4], 0);

    assert_eq!(queue.drain().unwrap(), 1);
    assert!(queue.is_empty());
    // A second drain has nothing to do: the write does not repeat.
    assert_eq!(queue.drain().unwrap(), 0);
    assert_eq!(target.write_count(), 1);
}

#[test]
fn clones_share_one_queue() {
    let queue = UploadQueue::new();
    let producer_a = queue.clone();
    let producer_b = queue.clone();
    let target = RecordingTarget::with_size(2);

    producer_a.request(&target, vec![1], 0);
    producer_b.request(&target, vec![2], 1);
    assert_eq!(queue.len(), 2);

    // Only the consumer drains; producers never see partial application.
    assert_eq!(queue.drain().unwrap(), 2);
    assert_eq!(target.contents(), vec![1, 2]);
    assert!(producer_a.is_empty() && producer_b.is_empty());
}

#[test]
fn requests_enqueued_after_a_drain_wait_for_the_next_one() {
    let queue = UploadQueue::new();
    let target = RecordingTarget::with_size(1);
    queue.drain().unwrap();

    queue.request(&target, vec![9], 0);
    // Producers must not assume the write landed before the next drain.
    assert_eq!(target.write_count(), 0);
    queue.drain().unwrap();
    assert_eq!(target.contents(), vec![9]);
}
