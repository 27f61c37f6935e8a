//! The deferred-write queue bridging CPU-side producers and GPU buffers.
//!
//! Any part of the engine (pass `update()` hooks, external callers) can
//! request a buffer write at any point in the frame; the orchestrator drains
//! the queue exactly once per frame, before any command recording. Combined
//! with the frame fence this guarantees at most one in-flight write per frame
//! per buffer: by the time the drain runs, the previous frame's GPU reads of
//! these buffers have retired.
//!
//! Producers get exactly one guarantee: the write lands no later than the next
//! drain. They must not assume it is visible immediately. Writes are applied
//! FIFO, so for overlapping requests to the same buffer the last one enqueued
//! wins.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::resource::buffer::Buffer;

/// A destination the upload queue can write into. Implemented by [`Buffer`]
/// through the scoped map/copy/flush/unmap pattern.
pub trait UploadTarget {
    fn write(&self, payload: &[u8], offset: u64) -> Result<()>;
}

impl UploadTarget for Buffer {
    fn write(&self, payload: &[u8], offset: u64) -> Result<()> {
        let mut mapped = self.map()?;
        mapped.copy_data(payload, offset)?;
        mapped.flush()
    }
}

struct Request {
    target: Arc<dyn UploadTarget + Send + Sync>,
    payload: Vec<u8>,
    offset: u64,
}

/// Multi-producer, single-consumer queue of deferred buffer writes.
///
/// Clones share the same queue; any clone may enqueue from any context, only
/// the orchestrator calls [`UploadQueue::drain`].
#[derive(Clone, Default)]
pub struct UploadQueue {
    requests: Arc<Mutex<VecDeque<Request>>>,
}

impl std::fmt::Debug for UploadQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadQueue").field("pending", &self.len()).finish()
    }
}

impl UploadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a write of `payload` into `target` at `offset` bytes.
    pub fn request<T: UploadTarget + Send + Sync + 'static>(
        &self,
        target: &Arc<T>,
        payload: Vec<u8>,
        offset: u64,
    ) {
        let mut requests = self.requests.lock().unwrap();
        requests.push_back(Request {
            target: target.clone(),
            payload,
            offset,
        });
    }

    /// Number of writes waiting for the next drain.
    pub fn len(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// True when no writes are pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply every pending write in FIFO order. Called once per frame by the
    /// orchestrator before command recording; a failed write aborts the drain
    /// and propagates.
    pub fn drain(&self) -> Result<usize> {
        let pending: Vec<Request> = {
            let mut requests = self.requests.lock().unwrap();
            requests.drain(..).collect()
        };
        let count = pending.len();
        for request in pending {
            request.target.write(&request.payload, request.offset)?;
        }
        if count > 0 {
            trace!("Drained {count} buffer write requests");
        }
        Ok(count)
    }
}
