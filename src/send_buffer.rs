//! Single-producer fan-out buffer feeding per-consumer bounded rings.
//!
//! The producer pushes into every live consumer ring; a ring that is full
//! drops its oldest entry first, so a slow subscriber loses old samples
//! instead of ever stalling the producer. Cursors observe samples strictly
//! in enqueue order.

use crate::sample::Sample;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, Weak};

pub struct SendBuffer {
    consumers: Mutex<Vec<Weak<ConsumerInner>>>,
}

struct ConsumerInner {
    max_buffered: usize,
    state: Mutex<RingState>,
    available: Condvar,
}

struct RingState {
    ring: VecDeque<Arc<Sample>>,
    closed: bool,
}

/// A subscriber's read cursor into the send buffer.
///
/// Dropping the cursor closes it; the producer prunes the dead registration
/// on its next push.
pub struct ConsumerQueue {
    inner: Arc<ConsumerInner>,
}

impl Default for SendBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl SendBuffer {
    pub fn new() -> Self {
        SendBuffer {
            consumers: Mutex::new(Vec::new()),
        }
    }

    /// Fans a sample out to all live consumers. Never blocks.
    pub fn push_sample(&self, sample: Arc<Sample>) {
        let mut consumers = self.consumers.lock().unwrap();
        consumers.retain(|weak| match weak.upgrade() {
            Some(consumer) => {
                consumer.push(sample.clone());
                true
            }
            None => false,
        });
    }

    /// Registers a new cursor holding at most `max_buffered` samples.
    pub fn new_consumer(&self, max_buffered: usize) -> ConsumerQueue {
        let inner = Arc::new(ConsumerInner {
            max_buffered: max_buffered.max(1),
            state: Mutex::new(RingState {
                ring: VecDeque::with_capacity(max_buffered.clamp(1, 4096)),
                closed: false,
            }),
            available: Condvar::new(),
        });
        self.consumers.lock().unwrap().push(Arc::downgrade(&inner));
        ConsumerQueue { inner }
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers
            .lock()
            .unwrap()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}

impl ConsumerInner {
    fn push(&self, sample: Arc<Sample>) {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return;
        }
        // overflow policy: advance past the oldest sample
        if state.ring.len() >= self.max_buffered {
            state.ring.pop_front();
        }
        state.ring.push_back(sample);
        drop(state);
        self.available.notify_one();
    }
}

impl ConsumerQueue {
    /// Blocks until a sample is available or the cursor is closed.
    pub fn pop_sample(&self) -> Option<Arc<Sample>> {
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if let Some(sample) = state.ring.pop_front() {
                return Some(sample);
            }
            if state.closed {
                return None;
            }
            state = self.inner.available.wait(state).unwrap();
        }
    }

    /// Returns a sample if one is buffered, without blocking.
    pub fn try_pop_sample(&self) -> Option<Arc<Sample>> {
        self.inner.state.lock().unwrap().ring.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes the cursor; blocked `pop_sample` calls return `None`.
    pub fn close(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.closed = true;
        drop(state);
        self.inner.available.notify_all();
    }
}

impl Drop for ConsumerQueue {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{SampleData, SampleFactory};
    use crate::stream_info::ChannelFormat;
    use std::thread;
    use std::time::Duration;

    fn numbered_sample(i: i32) -> Arc<Sample> {
        Arc::new(Sample {
            timestamp: i as f64,
            pushthrough: false,
            data: SampleData::Int32(vec![i]),
        })
    }

    #[test]
    fn test_fifo_order() {
        let buffer = SendBuffer::new();
        let consumer = buffer.new_consumer(16);
        for i in 0..5 {
            buffer.push_sample(numbered_sample(i));
        }
        for i in 0..5 {
            assert_eq!(consumer.pop_sample().unwrap().timestamp, i as f64);
        }
        assert!(consumer.try_pop_sample().is_none());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let buffer = SendBuffer::new();
        let consumer = buffer.new_consumer(3);
        for i in 0..10 {
            buffer.push_sample(numbered_sample(i));
        }
        // only the newest 3 survive
        assert_eq!(consumer.pop_sample().unwrap().timestamp, 7.0);
        assert_eq!(consumer.pop_sample().unwrap().timestamp, 8.0);
        assert_eq!(consumer.pop_sample().unwrap().timestamp, 9.0);
        assert!(consumer.try_pop_sample().is_none());
    }

    #[test]
    fn test_independent_cursors() {
        let buffer = SendBuffer::new();
        let fast = buffer.new_consumer(16);
        let slow = buffer.new_consumer(2);
        for i in 0..6 {
            buffer.push_sample(numbered_sample(i));
        }
        assert_eq!(fast.len(), 6);
        assert_eq!(slow.len(), 2);
        assert_eq!(slow.pop_sample().unwrap().timestamp, 4.0);
    }

    #[test]
    fn test_dropped_consumer_is_pruned() {
        let buffer = SendBuffer::new();
        let keeper = buffer.new_consumer(4);
        {
            let _short_lived = buffer.new_consumer(4);
            assert_eq!(buffer.consumer_count(), 2);
        }
        buffer.push_sample(numbered_sample(0));
        assert_eq!(buffer.consumer_count(), 1);
        assert_eq!(keeper.len(), 1);
    }

    #[test]
    fn test_ping_wakes_blocked_cursor() {
        let buffer = Arc::new(SendBuffer::new());
        let consumer = buffer.new_consumer(4);
        let producer = Arc::clone(&buffer);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let factory = SampleFactory::new(ChannelFormat::Float32, 1);
            producer.push_sample(Arc::new(factory.new_ping(0.0)));
        });
        let sample = consumer.pop_sample().unwrap();
        assert!(sample.is_ping());
        handle.join().unwrap();
    }

    #[test]
    fn test_close_unblocks_pop() {
        let buffer = SendBuffer::new();
        let consumer = Arc::new(buffer.new_consumer(4));
        let closer = Arc::clone(&consumer);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            closer.close();
        });
        assert!(consumer.pop_sample().is_none());
        handle.join().unwrap();
    }

    #[test]
    fn test_producer_never_blocks_on_slow_consumer() {
        let buffer = Arc::new(SendBuffer::new());
        let consumer = buffer.new_consumer(1000);
        let producer = Arc::clone(&buffer);
        let handle = thread::spawn(move || {
            for i in 0..10_000 {
                producer.push_sample(numbered_sample(i));
            }
        });
        handle.join().unwrap();

        // the consumer sees a strictly increasing suffix of the pushes
        let mut last = -1.0;
        let mut seen = 0;
        while let Some(sample) = consumer.try_pop_sample() {
            assert!(sample.timestamp > last);
            last = sample.timestamp;
            seen += 1;
        }
        assert!(seen <= 1000);
        assert_eq!(last, 9999.0);
    }
}
