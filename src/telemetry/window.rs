//! Fixed-capacity rolling sample window

use std::collections::VecDeque;

/// Rolling window with a running sum: O(1) add and average
#[derive(Debug, Clone)]
pub struct MetricWindow {
    samples: VecDeque<f64>,
    capacity: usize,
    sum: f64,
}

impl MetricWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            sum: 0.0,
        }
    }

    /// Add a sample, evicting the oldest once full
    pub fn add(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            if let Some(oldest) = self.samples.pop_front() {
                self.sum -= oldest;
            }
        }
        self.samples.push_back(value);
        self.sum += value;
    }

    pub fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            None
        } else {
            Some(self.sum / self.samples.len() as f64)
        }
    }

    /// Population standard deviation of the window
    pub fn stddev(&self) -> Option<f64> {
        let mean = self.average()?;
        let variance = self
            .samples
            .iter()
            .map(|v| (v - mean) * (v - mean))
            .sum::<f64>()
            / self.samples.len() as f64;
        Some(variance.sqrt())
    }

    pub fn latest(&self) -> Option<f64> {
        self.samples.back().copied()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.sum = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rolling_average() {
        let mut window = MetricWindow::new(3);
        assert_eq!(window.average(), None);

        window.add(10.0);
        window.add(20.0);
        window.add(30.0);
        assert_eq!(window.average(), Some(20.0));

        window.add(40.0);
        assert_eq!(window.len(), 3);
        assert_eq!(window.average(), Some(30.0));
        assert_eq!(window.latest(), Some(40.0));
    }

    #[test]
    fn test_stddev() {
        let mut window = MetricWindow::new(10);
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            window.add(v);
        }
        assert!((window.stddev().unwrap() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_clear() {
        let mut window = MetricWindow::new(2);
        window.add(1.0);
        window.clear();
        assert!(window.is_empty());
        window.add(5.0);
        assert_eq!(window.average(), Some(5.0));
    }
}
