//! # Media Frame Batching
//!
//! Inbound telephony audio arrives as many small frames (20ms each for a
//! typical call). Forwarding every frame upstream individually would flood
//! the AI link, so frames accumulate here until a batch threshold is reached.
//!
//! ## Key Features:
//! - **Ordered**: frames leave in exactly the order they arrived
//! - **Atomic swap**: a full batch is taken out in one step, leaving an empty buffer
//! - **Requeue**: a batch that failed to send goes back to the front, oldest first

use std::collections::VecDeque;

/// One audio chunk received from the telephony side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFrame {
    /// Track the chunk belongs to (`inbound` for the caller's voice)
    pub track: String,

    /// Raw audio bytes in the session's negotiated encoding
    pub payload: Vec<u8>,

    /// Telephony chunk sequence number, when provided
    pub chunk: Option<u64>,

    /// Milliseconds since the stream started, when provided
    pub timestamp_ms: Option<u64>,
}

impl MediaFrame {
    pub fn new(track: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            track: track.into(),
            payload,
            chunk: None,
            timestamp_ms: None,
        }
    }
}

/// Configuration for frame batching.
#[derive(Debug, Clone, Copy)]
pub struct FrameBufferConfig {
    /// Number of frames that triggers a flush
    pub batch_threshold: usize,
}

impl Default for FrameBufferConfig {
    fn default() -> Self {
        Self {
            batch_threshold: 50, // 50 x 20ms = one second of caller audio
        }
    }
}

/// Ordered buffer of frames not yet forwarded upstream.
#[derive(Debug)]
pub struct FrameBuffer {
    frames: VecDeque<MediaFrame>,
    config: FrameBufferConfig,
}

impl FrameBuffer {
    pub fn new(config: FrameBufferConfig) -> Self {
        Self {
            frames: VecDeque::with_capacity(config.batch_threshold),
            config,
        }
    }

    /// Append a frame. Returns `true` once the buffer holds a full batch.
    pub fn push(&mut self, frame: MediaFrame) -> bool {
        self.frames.push_back(frame);
        self.is_ready()
    }

    /// Whether the buffer has reached the batch threshold.
    ///
    /// A requeued batch can leave the buffer above the threshold; the next
    /// frame then flushes everything that has accumulated.
    pub fn is_ready(&self) -> bool {
        self.frames.len() >= self.config.batch_threshold
    }

    /// Swap out every buffered frame, leaving the buffer empty.
    pub fn take_batch(&mut self) -> Vec<MediaFrame> {
        self.frames.drain(..).collect()
    }

    /// Put a failed batch back in front of anything that arrived since.
    pub fn requeue_front(&mut self, batch: Vec<MediaFrame>) {
        for frame in batch.into_iter().rev() {
            self.frames.push_front(frame);
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

/// Concatenate the payloads of a batch into one contiguous buffer.
pub fn concat_payloads(batch: &[MediaFrame]) -> Vec<u8> {
    let total: usize = batch.iter().map(|frame| frame.payload.len()).sum();
    let mut merged = Vec::with_capacity(total);
    for frame in batch {
        merged.extend_from_slice(&frame.payload);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(n: u8) -> MediaFrame {
        MediaFrame::new("inbound", vec![n; 4])
    }

    #[test]
    fn test_ready_at_threshold() {
        let mut buffer = FrameBuffer::new(FrameBufferConfig { batch_threshold: 3 });
        assert!(!buffer.push(frame(1)));
        assert!(!buffer.push(frame(2)));
        assert!(buffer.push(frame(3)));

        let batch = buffer.take_batch();
        assert_eq!(batch.len(), 3);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_requeue_keeps_oldest_first() {
        let mut buffer = FrameBuffer::new(FrameBufferConfig { batch_threshold: 2 });
        buffer.push(frame(1));
        buffer.push(frame(2));
        let batch = buffer.take_batch();

        buffer.push(frame(3));
        buffer.requeue_front(batch);

        let order: Vec<u8> = buffer.take_batch().iter().map(|f| f.payload[0]).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_concat_payloads() {
        let batch = vec![MediaFrame::new("inbound", vec![1, 2]), MediaFrame::new("inbound", vec![3])];
        assert_eq!(concat_payloads(&batch), vec![1, 2, 3]);
    }
}
