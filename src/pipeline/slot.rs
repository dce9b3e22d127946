//! Single-slot "latest frame" mailbox

use bytes::Bytes;

use crate::capture::backend::Completion;
use crate::capture::frame::{FrameHandle, StreamFormat};
use crate::capture::pool::BufferId;
use crate::error::ConsumerProtocolError;

/// Outcome of [`FrameSlot::claim`].
#[derive(Debug)]
pub enum Claim {
    Frame(FrameHandle),
    /// No frame completed since the last claim.
    Empty,
    /// The previous claim has not been released.
    Busy,
}

struct Claimed {
    id: BufferId,
    data: Bytes,
}

/// Holds the most recent completed frame and the frame the consumer is processing.
///
/// Single producer (the capture callback installs), single consumer (claims and releases).
/// Stale frames are never queued: installing over an unclaimed frame hands the old buffer back
/// to the caller for recycling. The slot itself is not synchronized; it lives under the stream
/// mutex together with the buffer pool.
pub struct FrameSlot {
    format: StreamFormat,
    current: Option<Completion>,
    processing: Option<Claimed>,
}

impl FrameSlot {
    pub fn new(format: StreamFormat) -> Self {
        Self {
            format,
            current: None,
            processing: None,
        }
    }

    /// Producer: make `completion` the current frame. Returns the unclaimed frame it
    /// displaced, if any. Never waits for the consumer.
    pub fn install(&mut self, completion: Completion) -> Option<Completion> {
        self.current.replace(completion)
    }

    /// Consumer: take the current frame.
    pub fn claim(&mut self) -> Claim {
        if self.processing.is_some() {
            return Claim::Busy;
        }
        let Some(Completion {
            buffer,
            sequence,
            timestamp,
        }) = self.current.take()
        else {
            return Claim::Empty;
        };

        let id = buffer.id();
        let data = buffer.data.freeze();
        self.processing = Some(Claimed {
            id,
            data: data.clone(),
        });

        Claim::Frame(FrameHandle {
            id,
            sequence,
            timestamp,
            format: self.format,
            data,
        })
    }

    /// Consumer: give back the claimed frame's buffer for recycling.
    pub fn release(&mut self) -> Result<(BufferId, Bytes), ConsumerProtocolError> {
        self.processing
            .take()
            .map(|claimed| (claimed.id, claimed.data))
            .ok_or(ConsumerProtocolError::NothingClaimed)
    }

    /// True iff an unclaimed frame is waiting.
    pub fn has_frame(&self) -> bool {
        self.current.is_some()
    }

    pub fn is_claimed(&self) -> bool {
        self.processing.is_some()
    }

    pub fn current_id(&self) -> Option<BufferId> {
        self.current.as_ref().map(|c| c.buffer.id())
    }

    pub fn processing_id(&self) -> Option<BufferId> {
        self.processing.as_ref().map(|c| c.id)
    }

    /// Drop the unclaimed frame, if any. A claimed frame stays with the consumer.
    pub fn clear_current(&mut self) -> Option<Completion> {
        self.current.take()
    }

    /// Empty both positions, handing their buffers back.
    pub fn clear(&mut self) -> (Option<Completion>, Option<(BufferId, Bytes)>) {
        let current = self.current.take();
        let processing = self.processing.take().map(|c| (c.id, c.data));
        (current, processing)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::BytesMut;

    use super::*;
    use crate::capture::frame::{PixelFormat, Resolution};
    use crate::capture::pool::FrameBuffer;

    fn format() -> StreamFormat {
        StreamFormat::new(Resolution::new(4, 4), PixelFormat::Yuv420).unwrap()
    }

    fn completion(id: u32, sequence: u64) -> Completion {
        let mut buffer = FrameBuffer::new(BufferId(id), BytesMut::with_capacity(24));
        buffer.write(&[sequence as u8; 24]);
        Completion {
            buffer,
            sequence,
            timestamp: Duration::from_millis(sequence * 33),
        }
    }

    #[test]
    fn empty_slot_reports_empty() {
        let mut slot = FrameSlot::new(format());
        assert!(!slot.has_frame());
        assert!(matches!(slot.claim(), Claim::Empty));
    }

    #[test]
    fn install_displaces_unclaimed_frame() {
        let mut slot = FrameSlot::new(format());
        assert!(slot.install(completion(0, 1)).is_none());
        let displaced = slot.install(completion(1, 2)).unwrap();
        assert_eq!(displaced.buffer.id(), BufferId(0));
        let displaced = slot.install(completion(2, 3)).unwrap();
        assert_eq!(displaced.buffer.id(), BufferId(1));

        match slot.claim() {
            Claim::Frame(frame) => {
                assert_eq!(frame.id(), BufferId(2));
                assert_eq!(frame.sequence(), 3);
                assert_eq!(frame.data(), &[3u8; 24][..]);
            }
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn install_does_not_block_on_consumer() {
        let mut slot = FrameSlot::new(format());
        slot.install(completion(0, 1));
        let Claim::Frame(_frame) = slot.claim() else {
            panic!("expected frame");
        };

        assert!(slot.install(completion(1, 2)).is_none());
        assert_eq!(slot.current_id(), Some(BufferId(1)));
        assert_eq!(slot.processing_id(), Some(BufferId(0)));
    }

    #[test]
    fn second_claim_is_busy_and_changes_nothing() {
        let mut slot = FrameSlot::new(format());
        slot.install(completion(0, 1));
        let Claim::Frame(_frame) = slot.claim() else {
            panic!("expected frame");
        };
        slot.install(completion(1, 2));

        assert!(matches!(slot.claim(), Claim::Busy));
        assert_eq!(slot.current_id(), Some(BufferId(1)));
        assert_eq!(slot.processing_id(), Some(BufferId(0)));
    }

    #[test]
    fn double_release_is_a_protocol_error() {
        let mut slot = FrameSlot::new(format());
        slot.install(completion(0, 1));
        let Claim::Frame(frame) = slot.claim() else {
            panic!("expected frame");
        };
        drop(frame);

        let (id, _) = slot.release().unwrap();
        assert_eq!(id, BufferId(0));
        assert_eq!(
            slot.release().err(),
            Some(ConsumerProtocolError::NothingClaimed)
        );
    }

    #[test]
    fn frame_data_is_not_copied() {
        let mut slot = FrameSlot::new(format());
        slot.install(completion(0, 7));
        let Claim::Frame(frame) = slot.claim() else {
            panic!("expected frame");
        };
        let (_, data) = slot.release().unwrap();
        assert_eq!(frame.as_ptr(), data.as_ptr());
        assert_eq!(frame.len(), data.len());
    }

    #[test]
    fn clear_returns_both_buffers() {
        let mut slot = FrameSlot::new(format());
        slot.install(completion(0, 1));
        let Claim::Frame(_frame) = slot.claim() else {
            panic!("expected frame");
        };
        slot.install(completion(1, 2));

        let (current, processing) = slot.clear();
        assert_eq!(current.map(|c| c.buffer.id()), Some(BufferId(1)));
        assert_eq!(processing.map(|(id, _)| id), Some(BufferId(0)));
        assert!(!slot.has_frame());
        assert!(!slot.is_claimed());
    }
}
