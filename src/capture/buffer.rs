//! buffer.rs
//! Ordered, lock-serialised queue of samples awaiting delivery.
//!
//! The buffer is the sole owner of undelivered samples. Ownership moves out
//! with `drain` (as a `Batch`) and comes back with `requeue`, or ends with
//! `complete` once the batch is delivered. `Batch` cannot be built or cloned
//! outside this module, so a batch can be resolved exactly once.
//!
//! Every drain is stamped with the buffer epoch. `clear` starts a new epoch;
//! batches drained before it are still accounted for, but can no longer be
//! requeued.

use std::collections::VecDeque;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::model::Sample;

/// Samples removed from the buffer for one delivery attempt.
#[derive(Debug)]
pub struct Batch {
    epoch: u64,
    samples: Vec<Sample>,
}

impl Batch {
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

/// Where every appended sample currently is.
/// `appended == buffered + in_flight + delivered + discarded` at all times;
/// `discarded` also counts samples handed out by `take_all`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferAccounting {
    pub appended: u64,
    pub buffered: u64,
    pub in_flight: u64,
    pub delivered: u64,
    pub discarded: u64,
}

impl BufferAccounting {
    pub fn is_balanced(&self) -> bool {
        self.appended == self.buffered + self.in_flight + self.delivered + self.discarded
    }
}

#[derive(Default)]
struct BufferState {
    queue: VecDeque<Sample>,
    epoch: u64,
    appended: u64,
    in_flight: u64,
    delivered: u64,
    discarded: u64,
    high_water: usize,
    over_warn: bool,
}

pub struct SampleBuffer {
    inner: Mutex<BufferState>,
    warn_len: usize,
}

impl SampleBuffer {
    /// `warn_len`: length above which growth is logged as a degradation signal.
    pub fn new(warn_len: usize) -> Self {
        Self {
            inner: Mutex::new(BufferState::default()),
            warn_len,
        }
    }

    /// Adds a sample at the tail and returns the new length. Never blocks on I/O.
    pub fn append(&self, sample: Sample) -> usize {
        let mut s = self.inner.lock();
        self.push_tail(&mut s, sample)
    }

    /// Like `append`, but only while the buffer is still in `epoch`; a sample
    /// for an earlier epoch is dropped and `None` returned.
    pub fn append_in(&self, epoch: u64, sample: Sample) -> Option<usize> {
        let mut s = self.inner.lock();
        if s.epoch != epoch {
            return None;
        }
        Some(self.push_tail(&mut s, sample))
    }

    fn push_tail(&self, s: &mut BufferState, sample: Sample) -> usize {
        s.queue.push_back(sample);
        s.appended += 1;
        let len = s.queue.len();
        s.high_water = s.high_water.max(len);

        if len > self.warn_len && !s.over_warn {
            s.over_warn = true;
            warn!("[Buffer] {} samples waiting for delivery (warn mark {})", len, self.warn_len);
        } else if len <= self.warn_len && s.over_warn {
            s.over_warn = false;
        }
        len
    }

    /// Removes up to `max_count` samples from the head.
    pub fn drain(&self, max_count: usize) -> Batch {
        let mut s = self.inner.lock();
        Self::take_head(&mut s, max_count)
    }

    /// Like `drain`, but only while the buffer is still in `epoch`.
    pub fn drain_from(&self, epoch: u64, max_count: usize) -> Option<Batch> {
        let mut s = self.inner.lock();
        if s.epoch != epoch {
            return None;
        }
        Some(Self::take_head(&mut s, max_count))
    }

    /// Puts a failed batch back at the head, ahead of anything appended since,
    /// in its original order. A batch from an earlier epoch is discarded and
    /// `false` is returned.
    pub fn requeue(&self, batch: Batch) -> bool {
        let mut s = self.inner.lock();
        let n = batch.samples.len() as u64;
        s.in_flight -= n;

        if batch.epoch != s.epoch {
            s.discarded += n;
            debug!("[Buffer] dropped stale batch of {} from epoch {}", n, batch.epoch);
            return false;
        }
        for sample in batch.samples.into_iter().rev() {
            s.queue.push_front(sample);
        }
        let len = s.queue.len();
        s.high_water = s.high_water.max(len);
        true
    }

    /// Marks a batch as delivered and releases it.
    pub fn complete(&self, batch: Batch) -> usize {
        let mut s = self.inner.lock();
        let n = batch.samples.len();
        s.in_flight -= n as u64;
        s.delivered += n as u64;
        n
    }

    /// Discards all buffered samples and starts a new epoch. Returns the discarded count.
    pub fn clear(&self) -> usize {
        let mut s = self.inner.lock();
        let n = s.queue.len();
        s.queue.clear();
        s.discarded += n as u64;
        s.epoch += 1;
        s.over_warn = false;
        n
    }

    /// Hands every buffered sample to the caller, who becomes responsible for it.
    pub fn take_all(&self) -> Vec<Sample> {
        let mut s = self.inner.lock();
        let taken: Vec<Sample> = s.queue.drain(..).collect();
        s.discarded += taken.len() as u64;
        s.over_warn = false;
        taken
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    pub fn epoch(&self) -> u64 {
        self.inner.lock().epoch
    }

    pub fn high_water(&self) -> usize {
        self.inner.lock().high_water
    }

    pub fn snapshot(&self) -> Vec<Sample> {
        self.inner.lock().queue.iter().cloned().collect()
    }

    pub fn accounting(&self) -> BufferAccounting {
        let s = self.inner.lock();
        BufferAccounting {
            appended: s.appended,
            buffered: s.queue.len() as u64,
            in_flight: s.in_flight,
            delivered: s.delivered,
            discarded: s.discarded,
        }
    }

    fn take_head(s: &mut BufferState, max_count: usize) -> Batch {
        let n = max_count.min(s.queue.len());
        let samples: Vec<Sample> = s.queue.drain(..n).collect();
        s.in_flight += n as u64;
        Batch {
            epoch: s.epoch,
            samples,
        }
    }
}
