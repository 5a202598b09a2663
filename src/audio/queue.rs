//! Bounded sample hand-off between a native audio callback and a reader
//!
//! cpal delivers audio on its own callback thread; the capture engine wants
//! blocking reads of a fixed number of frames. The queue bridges the two.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct QueueState {
    samples: VecDeque<f32>,
    failure: Option<String>,
    dropped: u64,
}

/// Interleaved f32 samples waiting to be read
#[derive(Debug)]
pub struct SampleQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
    capacity: usize,
}

/// Outcome of a failed [`SampleQueue::pop`]
#[derive(Debug, Clone, PartialEq)]
pub enum PopError {
    /// The producer reported a stream error
    Failed(String),
    /// Not enough samples arrived in time
    TimedOut { available: usize },
}

impl SampleQueue {
    /// Create a queue holding at most `capacity` samples
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            ready: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append samples, dropping the oldest ones on overflow
    pub fn push(&self, samples: &[f32]) {
        let mut state = self.lock();
        state.samples.extend(samples.iter().copied());
        let len = state.samples.len();
        if len > self.capacity {
            let excess = len - self.capacity;
            state.samples.drain(..excess);
            state.dropped += excess as u64;
        }
        drop(state);
        self.ready.notify_all();
    }

    /// Record a stream failure; pending and future pops report it
    pub fn fail(&self, reason: impl Into<String>) {
        let mut state = self.lock();
        if state.failure.is_none() {
            state.failure = Some(reason.into());
        }
        drop(state);
        self.ready.notify_all();
    }

    /// Wait until `count` samples are queued and remove them
    pub fn pop(&self, count: usize, timeout: Duration) -> Result<Vec<f32>, PopError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();

        loop {
            if let Some(ref reason) = state.failure {
                return Err(PopError::Failed(reason.clone()));
            }
            if state.samples.len() >= count {
                return Ok(state.samples.drain(..count).collect());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(PopError::TimedOut {
                    available: state.samples.len(),
                });
            }

            state = self
                .ready
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    /// Discard everything queued so far
    pub fn clear(&self) -> usize {
        let mut state = self.lock();
        let n = state.samples.len();
        state.samples.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.lock().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Samples lost to overflow since creation
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_pop_returns_in_order() {
        let queue = SampleQueue::new(16);
        queue.push(&[0.1, 0.2, 0.3]);
        queue.push(&[0.4]);
        let out = queue.pop(3, Duration::from_millis(10)).unwrap();
        assert_eq!(out, vec![0.1, 0.2, 0.3]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let queue = SampleQueue::new(4);
        queue.push(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(queue.dropped(), 2);
        let out = queue.pop(4, Duration::from_millis(10)).unwrap();
        assert_eq!(out, vec![3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_pop_times_out() {
        let queue = SampleQueue::new(16);
        queue.push(&[0.0; 3]);
        let err = queue.pop(8, Duration::from_millis(20)).unwrap_err();
        assert_eq!(err, PopError::TimedOut { available: 3 });
    }

    #[test]
    fn test_failure_wakes_reader() {
        let queue = Arc::new(SampleQueue::new(16));
        let producer = Arc::clone(&queue);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.fail("device unplugged");
        });
        let err = queue.pop(8, Duration::from_secs(5)).unwrap_err();
        assert_eq!(err, PopError::Failed("device unplugged".into()));
        handle.join().unwrap();
    }

    #[test]
    fn test_blocking_pop_waits_for_producer() {
        let queue = Arc::new(SampleQueue::new(64));
        let producer = Arc::clone(&queue);
        let handle = std::thread::spawn(move || {
            for _ in 0..4 {
                std::thread::sleep(Duration::from_millis(5));
                producer.push(&[0.5; 4]);
            }
        });
        let out = queue.pop(16, Duration::from_secs(5)).unwrap();
        assert_eq!(out.len(), 16);
        handle.join().unwrap();
    }

    #[test]
    fn test_clear() {
        let queue = SampleQueue::new(16);
        queue.push(&[0.0; 5]);
        assert_eq!(queue.clear(), 5);
        assert!(queue.is_empty());
    }
}
