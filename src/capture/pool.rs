//! Fixed set of hardware-writable frame buffers.
//!
//! Each buffer moves Free -> Queued (submitted to the hardware) -> Filled (current frame in the
//! slot) -> InUse (claimed by the consumer) -> Free. The memory itself travels with the state:
//! a [`FrameBuffer`] owns its `BytesMut` while writable, and the consumer reads a frozen
//! `Bytes` view. A buffer whose view is still referenced when it comes back stays InUse
//! ("lent") until the last reference is dropped, so the hardware never writes into memory a
//! consumer can still read.
//!
//! The pool has no lock of its own. It is mutated only under the stream mutex, together with
//! the frame slot.

use std::fmt;

use bytes::{Bytes, BytesMut};
use tracing::{debug, error, info, warn};

use crate::capture::backend::CameraDevice;
use crate::error::StreamError;

/// Index of a buffer in the pool; doubles as the hardware handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u32);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Free,
    Queued,
    Filled,
    InUse,
}

/// Writable memory of one pool buffer, as handed to the hardware.
pub struct FrameBuffer {
    id: BufferId,
    pub(crate) data: BytesMut,
}

impl FrameBuffer {
    pub(crate) fn new(id: BufferId, data: BytesMut) -> Self {
        Self { id, data }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Bytes written by the hardware.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// False when the buffer has no memory behind it (a null data pointer).
    pub fn is_mapped(&self) -> bool {
        self.data.capacity() > 0
    }

    /// Replace the contents with `src`, truncated to the buffer capacity. Never reallocates.
    pub fn write(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.data.capacity());
        self.data.clear();
        self.data.extend_from_slice(&src[..n]);
        n
    }

    /// Set the length to `len` (bounded by capacity) and let `f` fill the bytes in place.
    pub fn fill_with(&mut self, len: usize, f: impl FnOnce(&mut [u8])) {
        let n = len.min(self.data.capacity());
        self.data.clear();
        self.data.resize(n, 0);
        f(&mut self.data[..]);
    }

    /// Drop the memory behind this buffer, leaving it unmapped.
    pub fn unmap(&mut self) {
        self.data = BytesMut::new();
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("id", &self.id)
            .field("len", &self.data.len())
            .field("capacity", &self.data.capacity())
            .finish()
    }
}

/// Number of buffers in each state. Always sums to the pool size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolCounts {
    pub free: usize,
    pub queued: usize,
    pub filled: usize,
    pub in_use: usize,
}

impl PoolCounts {
    pub fn total(&self) -> usize {
        self.free + self.queued + self.filled + self.in_use
    }
}

enum Stash {
    /// Memory is with the hardware, the slot or the consumer.
    Away,
    Free(BytesMut),
    /// Returned by the consumer while a handle still references it.
    Lent(Bytes),
}

struct Entry {
    state: BufferState,
    stash: Stash,
}

pub struct BufferPool {
    frame_size: usize,
    entries: Vec<Entry>,
    recycled: u64,
}

impl BufferPool {
    /// Reserve `count` buffers of `frame_size` bytes from the device. All or nothing: on any
    /// failure the device's buffers are freed again.
    pub fn allocate(
        device: &dyn CameraDevice,
        count: u32,
        frame_size: usize,
    ) -> Result<Self, StreamError> {
        let regions = match device.allocate_buffers(count, frame_size) {
            Ok(regions) => regions,
            Err(err) => {
                device.free_buffers();
                return Err(StreamError::Allocation(err.to_string()));
            }
        };

        if regions.len() != count as usize {
            device.free_buffers();
            return Err(StreamError::Allocation(format!(
                "requested {count} buffers, device provided {}",
                regions.len()
            )));
        }
        if let Some(small) = regions.iter().find(|r| r.capacity() < frame_size) {
            let capacity = small.capacity();
            device.free_buffers();
            return Err(StreamError::Allocation(format!(
                "buffer of {capacity} bytes cannot hold a {frame_size} byte frame"
            )));
        }

        info!("Allocated {} buffers of {} bytes", count, frame_size);

        let entries = regions
            .into_iter()
            .map(|data| Entry {
                state: BufferState::Free,
                stash: Stash::Free(data),
            })
            .collect();

        Ok(Self {
            frame_size,
            entries,
            recycled: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn state(&self, id: BufferId) -> Option<BufferState> {
        self.entries.get(id.0 as usize).map(|e| e.state)
    }

    /// Buffers returned to the pool so far (displaced, released, rejected or cancelled).
    pub fn recycled(&self) -> u64 {
        self.recycled
    }

    pub fn counts(&self) -> PoolCounts {
        let mut counts = PoolCounts::default();
        for entry in &self.entries {
            match entry.state {
                BufferState::Free => counts.free += 1,
                BufferState::Queued => counts.queued += 1,
                BufferState::Filled => counts.filled += 1,
                BufferState::InUse => counts.in_use += 1,
            }
        }
        counts
    }

    /// Hand out every free buffer for submission, marking it Queued.
    pub fn take_free(&mut self) -> Vec<FrameBuffer> {
        let mut out = Vec::new();
        for (index, entry) in self.entries.iter_mut().enumerate() {
            if entry.state != BufferState::Free {
                continue;
            }
            if let Stash::Free(data) = std::mem::replace(&mut entry.stash, Stash::Away) {
                entry.state = BufferState::Queued;
                out.push(FrameBuffer::new(BufferId(index as u32), data));
            }
        }
        out
    }

    /// A queued buffer came back from the hardware holding a frame.
    pub fn mark_filled(&mut self, id: BufferId) -> bool {
        self.transition(id, BufferState::Queued, BufferState::Filled)
    }

    /// The current frame was claimed by the consumer.
    pub fn mark_in_use(&mut self, id: BufferId) -> bool {
        self.transition(id, BufferState::Filled, BufferState::InUse)
    }

    /// Return a displaced, rejected or cancelled buffer. It becomes Free and is picked up by
    /// the next [`take_free`](Self::take_free).
    pub fn recycle(&mut self, buffer: FrameBuffer) {
        let FrameBuffer { id, mut data } = buffer;
        let Some(entry) = self.entries.get_mut(id.0 as usize) else {
            error!("Recycled buffer {} does not belong to this pool", id);
            return;
        };
        if entry.state == BufferState::Free || entry.state == BufferState::InUse {
            warn!("Recycling buffer {} in unexpected state {:?}", id, entry.state);
        }

        if !data.is_empty() || data.capacity() < self.frame_size {
            data.clear();
            data.reserve(self.frame_size);
        }
        entry.state = BufferState::Free;
        entry.stash = Stash::Free(data);
        self.recycled += 1;
    }

    /// A buffer the hardware refused. Free again without counting as a recycle.
    pub fn restore(&mut self, buffer: FrameBuffer) {
        let FrameBuffer { id, data } = buffer;
        if let Some(entry) = self.entries.get_mut(id.0 as usize) {
            entry.state = BufferState::Free;
            entry.stash = Stash::Free(data);
        }
    }

    /// Take back a buffer the consumer released. Returns false when a frame handle still
    /// references the memory; the buffer then stays InUse until [`reclaim_lent`] succeeds.
    ///
    /// [`reclaim_lent`]: Self::reclaim_lent
    pub fn check_in(&mut self, id: BufferId, data: Bytes) -> bool {
        let frame_size = self.frame_size;
        let Some(entry) = self.entries.get_mut(id.0 as usize) else {
            error!("Released buffer {} does not belong to this pool", id);
            return false;
        };
        if entry.state != BufferState::InUse {
            warn!("Releasing buffer {} in unexpected state {:?}", id, entry.state);
        }

        match data.try_into_mut() {
            Ok(mut data) => {
                data.clear();
                data.reserve(frame_size);
                entry.state = BufferState::Free;
                entry.stash = Stash::Free(data);
                self.recycled += 1;
                true
            }
            Err(data) => {
                debug!("Buffer {} still referenced by a frame handle", id);
                entry.state = BufferState::InUse;
                entry.stash = Stash::Lent(data);
                false
            }
        }
    }

    /// Retry lent buffers whose handles may have been dropped since. Returns how many came back.
    pub fn reclaim_lent(&mut self) -> usize {
        let mut reclaimed = 0;
        for index in 0..self.entries.len() {
            let entry = &mut self.entries[index];
            if !matches!(entry.stash, Stash::Lent(_)) {
                continue;
            }
            if let Stash::Lent(data) = std::mem::replace(&mut entry.stash, Stash::Away) {
                if self.check_in(BufferId(index as u32), data) {
                    reclaimed += 1;
                }
            }
        }
        reclaimed
    }

    /// Release every buffer back to the device. Reports buffers still held by the consumer,
    /// but always finishes the teardown.
    pub fn release(mut self, device: &dyn CameraDevice) -> Result<(), StreamError> {
        self.reclaim_lent();
        let counts = self.counts();
        if counts.queued + counts.filled > 0 {
            warn!(
                "Releasing pool with {} queued and {} filled buffers",
                counts.queued, counts.filled
            );
        }

        self.entries.clear();
        device.free_buffers();

        if counts.in_use > 0 {
            error!(
                "{} buffer(s) still held by the consumer at teardown",
                counts.in_use
            );
            return Err(StreamError::ResourceLeak(counts.in_use));
        }
        debug!("Buffer pool released");
        Ok(())
    }

    fn transition(&mut self, id: BufferId, from: BufferState, to: BufferState) -> bool {
        match self.entries.get_mut(id.0 as usize) {
            Some(entry) if entry.state == from => {
                entry.state = to;
                true
            }
            Some(entry) => {
                warn!(
                    "Buffer {} expected in {:?} but is {:?}, not moving to {:?}",
                    id, from, entry.state, to
                );
                false
            }
            None => {
                error!("Buffer {} does not belong to this pool", id);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::mock::MockCamera;

    fn pool(count: u32, size: usize) -> (std::sync::Arc<MockCamera>, BufferPool) {
        let camera = MockCamera::new();
        let pool = BufferPool::allocate(camera.as_ref(), count, size).unwrap();
        (camera, pool)
    }

    #[test]
    fn allocate_starts_all_free() {
        let (_camera, pool) = pool(4, 64);
        assert_eq!(pool.len(), 4);
        assert_eq!(pool.counts().free, 4);
    }

    #[test]
    fn failed_allocation_rolls_back() {
        let camera = MockCamera::new();
        camera.fail_allocation(true);
        let err = BufferPool::allocate(camera.as_ref(), 4, 64).err();
        assert!(matches!(err, Some(StreamError::Allocation(_))));
        assert_eq!(camera.allocated_buffers(), 0);
    }

    #[test]
    fn short_allocation_rolls_back() {
        let camera = MockCamera::new();
        camera.limit_allocation(2);
        let err = BufferPool::allocate(camera.as_ref(), 4, 64).err();
        assert!(matches!(err, Some(StreamError::Allocation(_))));
        assert_eq!(camera.allocated_buffers(), 0);
    }

    #[test]
    fn buffer_cycles_through_states() {
        let (camera, mut pool) = pool(3, 16);
        let mut queued = pool.take_free();
        assert_eq!(queued.len(), 3);
        assert_eq!(pool.counts().queued, 3);

        let mut buffer = queued.remove(0);
        let id = buffer.id();
        buffer.write(b"frame");
        assert!(pool.mark_filled(id));
        assert!(pool.mark_in_use(id));
        assert_eq!(pool.state(id), Some(BufferState::InUse));

        assert!(pool.check_in(id, buffer.data.freeze()));
        assert_eq!(pool.state(id), Some(BufferState::Free));
        assert_eq!(pool.recycled(), 1);

        let again = pool.take_free();
        assert_eq!(again.len(), 1);
        assert!(again[0].is_empty());
        assert!(again[0].capacity() >= 16);

        for buffer in queued.into_iter().chain(again) {
            pool.recycle(buffer);
        }
        assert!(pool.release(camera.as_ref()).is_ok());
    }

    #[test]
    fn lent_buffer_is_held_until_handle_drops() {
        let (camera, mut pool) = pool(3, 16);
        let mut buffer = pool.take_free().remove(0);
        let id = buffer.id();
        buffer.write(b"pixels");
        pool.mark_filled(id);
        pool.mark_in_use(id);

        let data = buffer.data.freeze();
        let held = data.clone();
        assert!(!pool.check_in(id, data));
        assert_eq!(pool.state(id), Some(BufferState::InUse));
        assert_eq!(pool.reclaim_lent(), 0);

        drop(held);
        assert_eq!(pool.reclaim_lent(), 1);
        assert_eq!(pool.state(id), Some(BufferState::Free));
        drop(camera);
    }

    #[test]
    fn release_reports_leaked_buffers() {
        let (camera, mut pool) = pool(3, 16);
        let mut buffer = pool.take_free().remove(0);
        let id = buffer.id();
        buffer.write(b"pixels");
        pool.mark_filled(id);
        pool.mark_in_use(id);
        let data = buffer.data.freeze();
        let _held = data.clone();
        pool.check_in(id, data);

        let err = pool.release(camera.as_ref()).err();
        assert!(matches!(err, Some(StreamError::ResourceLeak(1))));
        assert_eq!(camera.allocated_buffers(), 0);
    }

    #[test]
    fn recycle_remaps_null_buffer() {
        let (_camera, mut pool) = pool(3, 32);
        let mut buffer = pool.take_free().remove(0);
        let id = buffer.id();
        buffer.unmap();
        assert!(!buffer.is_mapped());

        pool.recycle(buffer);
        let remapped = pool
            .take_free()
            .into_iter()
            .find(|b| b.id() == id)
            .unwrap();
        assert!(remapped.capacity() >= 32);
    }

    #[test]
    fn write_truncates_to_capacity() {
        let mut buffer = FrameBuffer::new(BufferId(0), BytesMut::with_capacity(4));
        let written = buffer.write(&[1u8; 64]);
        assert!(written < 64);
        assert_eq!(written, buffer.len());
        assert_eq!(buffer.capacity(), written);
    }
}
