use std::collections::VecDeque;

use super::LearningSample;

/// Bounded rolling window of the most recent samples; oldest evicted first
#[derive(Debug)]
pub struct LearningBuffer {
    samples: VecDeque<LearningSample>,
    capacity: usize,
}

impl LearningBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a sample, returning the evicted one when full
    pub fn push(&mut self, sample: LearningSample) -> Option<LearningSample> {
        let evicted = if self.samples.len() == self.capacity {
            self.samples.pop_front()
        } else {
            None
        };
        self.samples.push_back(sample);
        evicted
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
