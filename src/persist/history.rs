use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Bounded sample buffer. When full, the oldest sample is dropped.
#[derive(Debug)]
pub struct SampleHistory<T> {
    name: String,
    capacity: usize,
    samples: Mutex<VecDeque<T>>,
    dropped: AtomicU64,
}

impl<T> SampleHistory<T> {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name: name.into(),
            capacity,
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&self, sample: T) {
        let mut samples = self.samples.lock();
        if samples.len() == self.capacity {
            samples.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        samples.push_back(sample);
    }

    /// Takes every buffered sample, oldest first.
    pub fn drain(&self) -> Vec<T> {
        self.samples.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }

    /// Samples lost to the capacity bound so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drops_oldest_when_full() {
        let h = SampleHistory::new("ports", 3);
        for i in 0..5 {
            h.push(i);
        }
        assert_eq!(h.len(), 3);
        assert_eq!(h.dropped(), 2);
        assert_eq!(h.drain(), vec![2, 3, 4]);
        assert!(h.is_empty());
    }
}
