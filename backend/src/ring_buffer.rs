use std::collections::VecDeque;

/// Fixed-capacity FIFO that drops the oldest item when full.
#[derive(Debug)]
pub struct RingBuffer<T> {
    max: usize,
    buf: VecDeque<T>,
}

impl<T> RingBuffer<T> {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            buf: VecDeque::with_capacity(max),
        }
    }

    pub fn push(&mut self, item: T) {
        if self.max == 0 {
            return;
        }
        if self.buf.len() == self.max {
            self.buf.pop_front();
        }
        self.buf.push_back(item);
    }

    /// Up to `n` most recent items, newest first.
    pub fn recent(&self, n: usize) -> Vec<&T> {
        self.buf.iter().rev().take(n).collect()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_oldest_when_full() {
        let mut rb = RingBuffer::new(3);
        for i in 0..5 {
            rb.push(i);
        }
        assert_eq!(rb.len(), 3);
        assert_eq!(rb.recent(10), [&4, &3, &2]);
        assert_eq!(rb.recent(1), [&4]);
    }

    #[test]
    fn zero_capacity_holds_nothing() {
        let mut rb = RingBuffer::new(0);
        rb.push("x");
        assert_eq!(rb.len(), 0);
    }
}
