//! Frame containers shared between a producer and a consumer
//!
//! Buffers live in an arena and are addressed by integer id. At any moment a
//! buffer sits on exactly one of the `free` or `ready` queues, or is checked
//! out to the device side of the loop. `reset` re-establishes the start
//! state and may only run while transfer is stopped.

use std::collections::VecDeque;

use bitflags::bitflags;

use crate::Direction;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufferFlags: u32 {
        /// Checked out to the consumer side
        const OUT = 1;
    }
}

/// Metadata stamped on a captured buffer
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferHeader {
    /// Frame counter at capture time
    pub seq: u64,
    /// Presentation time, monotonic nanoseconds
    pub pts: i64,
    pub dts_offset: i64,
}

/// The single data descriptor of a buffer
#[derive(Debug, Clone, Copy, Default)]
pub struct Chunk {
    /// Start of valid data, may exceed `maxsize` (circular index)
    pub offset: u32,
    /// Valid bytes
    pub size: u32,
    /// Bytes per frame
    pub stride: u32,
}

#[derive(Debug)]
pub struct Buffer {
    pub id: u32,
    pub header: BufferHeader,
    pub chunk: Chunk,
    pub flags: BufferFlags,
    pub data: Vec<u8>,
}

impl Buffer {
    pub fn maxsize(&self) -> u32 {
        self.data.len() as u32
    }
}

/// Status of the single-slot consumer inbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoStatus {
    #[default]
    Ok,
    /// The producer should refill the ready queue
    NeedBuffer,
    /// A captured buffer waits in the inbox
    HaveBuffer(u32),
}

#[derive(Debug)]
pub struct BufferPool {
    buffers: Vec<Buffer>,
    free: VecDeque<u32>,
    ready: VecDeque<u32>,
}

impl BufferPool {
    pub fn new(n_buffers: usize, maxsize: usize) -> Self {
        let buffers = (0..n_buffers as u32)
            .map(|id| Buffer {
                id,
                header: BufferHeader::default(),
                chunk: Chunk::default(),
                flags: BufferFlags::empty(),
                data: vec![0; maxsize],
            })
            .collect();
        Self {
            buffers,
            free: VecDeque::new(),
            ready: VecDeque::new(),
        }
    }

    pub fn n_buffers(&self) -> usize {
        self.buffers.len()
    }

    /// Re-establishes the start state. For playback all buffers are checked
    /// out (the consumer fills them); for capture all go on the free queue
    /// for the device to fill. Must not run during active transfer.
    pub fn reset(&mut self, direction: Direction) {
        self.free.clear();
        self.ready.clear();
        for b in &mut self.buffers {
            match direction {
                Direction::Playback => b.flags.insert(BufferFlags::OUT),
                Direction::Capture => {
                    b.flags.remove(BufferFlags::OUT);
                    self.free.push_back(b.id);
                }
            }
        }
    }

    pub fn get(&self, id: u32) -> Option<&Buffer> {
        self.buffers.get(id as usize)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Buffer> {
        self.buffers.get_mut(id as usize)
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn ready_is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    pub fn front_ready(&self) -> Option<u32> {
        self.ready.front().copied()
    }

    pub fn pop_ready(&mut self) -> Option<u32> {
        self.ready.pop_front()
    }

    pub fn push_ready(&mut self, id: u32) {
        debug_assert!(!self.ready.contains(&id) && !self.free.contains(&id));
        self.ready.push_back(id);
    }

    pub fn pop_free(&mut self) -> Option<u32> {
        self.free.pop_front()
    }

    pub fn push_free(&mut self, id: u32) {
        debug_assert!(!self.ready.contains(&id) && !self.free.contains(&id));
        self.free.push_back(id);
    }

    /// Number of buffers currently checked out to neither queue
    pub fn in_flight(&self) -> usize {
        self.buffers.len() - self.free.len() - self.ready.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conserved(pool: &BufferPool) -> bool {
        pool.free_len() + pool.ready_len() + pool.in_flight() == pool.n_buffers()
    }

    #[test]
    fn test_reset_playback_checks_all_out() {
        let mut pool = BufferPool::new(4, 4096);
        pool.reset(Direction::Playback);
        assert_eq!(pool.free_len(), 0);
        assert_eq!(pool.ready_len(), 0);
        assert_eq!(pool.in_flight(), 4);
        assert!((0..4).all(|i| pool.get(i).unwrap().flags.contains(BufferFlags::OUT)));
        assert!(conserved(&pool));
    }

    #[test]
    fn test_reset_capture_frees_all() {
        let mut pool = BufferPool::new(4, 4096);
        pool.reset(Direction::Capture);
        assert_eq!(pool.free_len(), 4);
        assert_eq!(pool.in_flight(), 0);
        assert!(conserved(&pool));
    }

    #[test]
    fn test_conservation_across_cycles() {
        let mut pool = BufferPool::new(3, 256);
        for _ in 0..5 {
            pool.reset(Direction::Capture);
            // capture a buffer, hand it out, reclaim it
            let id = pool.pop_free().unwrap();
            assert!(conserved(&pool));
            pool.push_ready(id);
            assert!(conserved(&pool));
            let id = pool.pop_ready().unwrap();
            assert!(conserved(&pool));
            pool.push_free(id);
            assert!(conserved(&pool));

            pool.reset(Direction::Playback);
            assert!(conserved(&pool));
        }
    }

    #[test]
    fn test_fifo_order() {
        let mut pool = BufferPool::new(3, 64);
        pool.reset(Direction::Capture);
        let a = pool.pop_free().unwrap();
        let b = pool.pop_free().unwrap();
        pool.push_ready(a);
        pool.push_ready(b);
        assert_eq!(pool.front_ready(), Some(a));
        assert_eq!(pool.pop_ready(), Some(a));
        assert_eq!(pool.pop_ready(), Some(b));
    }
}
