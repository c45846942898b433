//! Recorder thread mailbox.
//!
//! Producers post control messages and flush hints; the recorder thread
//! parks on the condvar between periodic passes and wakes early when a
//! message arrives. Posting never blocks beyond the mutex push.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderMessage {
    /// Begin (or resume) recording.
    Start,
    /// Pause recording; buffers stay intact.
    Stop,
    /// Close the current chunk and open the next.
    Rotate,
    /// A full buffer is pending; drain ahead of the periodic tick.
    FullBuffer,
    /// Finalize and exit the recorder thread.
    Shutdown,
}

#[derive(Debug, Default)]
pub struct PostBox {
    queue: Mutex<VecDeque<RecorderMessage>>,
    available: Condvar,
}

impl PostBox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self, message: RecorderMessage) {
        self.queue.lock().push_back(message);
        self.available.notify_one();
    }

    /// Take every pending message, waiting up to `timeout` for the first.
    /// An empty result is the periodic-tick case.
    pub fn collect(&self, timeout: Duration) -> Vec<RecorderMessage> {
        let mut queue = self.queue.lock();
        if queue.is_empty() {
            self.available.wait_for(&mut queue, timeout);
        }
        queue.drain(..).collect()
    }

    /// Non-waiting drain, for the fatal-error path.
    pub fn try_collect(&self) -> Vec<RecorderMessage> {
        match self.queue.try_lock() {
            Some(mut queue) => queue.drain(..).collect(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_messages_arrive_in_order() {
        let postbox = PostBox::new();
        postbox.post(RecorderMessage::Start);
        postbox.post(RecorderMessage::Rotate);
        let messages = postbox.collect(Duration::from_millis(1));
        assert_eq!(
            messages,
            vec![RecorderMessage::Start, RecorderMessage::Rotate]
        );
        assert!(postbox.collect(Duration::from_millis(1)).is_empty());
    }

    #[test]
    fn test_post_wakes_a_waiting_collector() {
        let postbox = Arc::new(PostBox::new());
        let waiter = {
            let postbox = Arc::clone(&postbox);
            std::thread::spawn(move || postbox.collect(Duration::from_secs(10)))
        };
        // Give the waiter a moment to park, then wake it.
        std::thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        postbox.post(RecorderMessage::Shutdown);
        let messages = waiter.join().unwrap();
        assert_eq!(messages, vec![RecorderMessage::Shutdown]);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_try_collect_never_waits() {
        let postbox = PostBox::new();
        assert!(postbox.try_collect().is_empty());
        postbox.post(RecorderMessage::FullBuffer);
        assert_eq!(postbox.try_collect(), vec![RecorderMessage::FullBuffer]);
    }
}
