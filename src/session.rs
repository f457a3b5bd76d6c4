use anyhow::{anyhow, Result};
use crossbeam_channel::Sender;

/// Outbound half of the remote session: raw linear-PCM bytes,
/// order-preserving, no acknowledgement.
pub trait AudioSink: Send {
    fn send_audio(&mut self, pcm: &[u8]) -> Result<()>;
}

impl AudioSink for Sender<Vec<u8>> {
    fn send_audio(&mut self, pcm: &[u8]) -> Result<()> {
        self.send(pcm.to_vec())
            .map_err(|_| anyhow!("outbound audio channel disconnected"))
    }
}

/// Receives every contiguous range of samples actually rendered, faded
/// samples included. Called from the render callback: implementations must
/// not block.
pub trait PlaybackTracker: Send + Sync {
    fn on_play_bytes(&self, item_id: &str, content_index: u32, bytes: &[u8]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_sink_forwards_in_order() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut sink = tx;
        sink.send_audio(&[1, 2]).unwrap();
        sink.send_audio(&[3, 4]).unwrap();
        assert_eq!(rx.try_recv().unwrap(), vec![1, 2]);
        assert_eq!(rx.try_recv().unwrap(), vec![3, 4]);
    }

    #[test]
    fn channel_sink_errors_after_disconnect() {
        let (tx, rx) = crossbeam_channel::unbounded::<Vec<u8>>();
        drop(rx);
        let mut sink = tx;
        assert!(sink.send_audio(&[0, 0]).is_err());
    }
}
