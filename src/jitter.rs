use crossbeam_channel::{Receiver, Sender, TryRecvError};

use crate::messages::AudioFrame;

/// Unbounded FIFO of fragments that have not started playing.
///
/// Backed by an unbounded crossbeam channel so that the dispatcher can
/// enqueue without ever blocking and the render callback can dequeue with
/// `try_recv`, which never waits on the producer. Clones share the queue.
#[derive(Clone, Debug)]
pub struct JitterBuffer {
    tx: Sender<AudioFrame>,
    rx: Receiver<AudioFrame>,
}

impl JitterBuffer {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }

    pub fn push(&self, frame: AudioFrame) {
        // Both ends live in `self`, so the channel cannot be disconnected.
        let _ = self.tx.send(frame);
    }

    pub fn pop(&self) -> Option<AudioFrame> {
        match self.rx.try_recv() {
            Ok(frame) => Some(frame),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Discards every queued frame, returning how many were dropped.
    pub fn clear(&self) -> usize {
        self.rx.try_iter().count()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Default for JitterBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: &str) -> AudioFrame {
        AudioFrame::new(vec![1; 4], id, 0)
    }

    #[test]
    fn pops_in_arrival_order() {
        let jb = JitterBuffer::new();
        jb.push(frame("a"));
        jb.push(frame("b"));
        assert_eq!(jb.len(), 2);
        assert_eq!(jb.pop().unwrap().source_id, "a");
        assert_eq!(jb.pop().unwrap().source_id, "b");
        assert!(jb.pop().is_none());
    }

    #[test]
    fn clear_drains_everything() {
        let jb = JitterBuffer::new();
        for i in 0..5 {
            jb.push(frame(&i.to_string()));
        }
        assert_eq!(jb.clear(), 5);
        assert!(jb.is_empty());
    }

    #[test]
    fn clones_share_one_queue() {
        let producer = JitterBuffer::new();
        let consumer = producer.clone();
        producer.push(frame("x"));
        assert_eq!(consumer.len(), 1);
        assert_eq!(consumer.pop().unwrap().source_id, "x");
        assert!(producer.is_empty());
    }

    #[test]
    fn concurrent_producer_loses_nothing() {
        let jb = JitterBuffer::new();
        let producer = jb.clone();
        let handle = std::thread::spawn(move || {
            for i in 0..1000 {
                producer.push(AudioFrame::new(vec![i as i16], "p", 0));
            }
        });
        let mut seen = Vec::new();
        while seen.len() < 1000 {
            if let Some(f) = jb.pop() {
                seen.push(f.samples[0]);
            }
        }
        handle.join().unwrap();
        let expected: Vec<i16> = (0..1000).collect();
        assert_eq!(seen, expected);
    }
}
