/// Per-camera bounded frame buffers bridging the capture workers and the
/// live-view transport.
///
/// Policy:
///   - Producer never blocks: when a buffer holds `capacity` frames the
///     incoming frame is discarded and the older queued frames are kept
///   - Consumer never blocks: an empty buffer yields `None`
///   - Frames leave a buffer in the order they were published
///
/// Each queue sits behind its own mutex so cameras never contend with each
/// other; the camera map itself only takes a write lock on registration.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::capture::Frame;
use crate::FRAME_BUFFER_CAPACITY;

struct CameraQueue {
    frames: Mutex<VecDeque<Frame>>,
    dropped: AtomicU64,
}

impl CameraQueue {
    fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            dropped: AtomicU64::new(0),
        }
    }
}

pub struct FrameBuffers {
    capacity: usize,
    queues: RwLock<HashMap<u32, Arc<CameraQueue>>>,
}

impl Default for FrameBuffers {
    fn default() -> Self {
        Self::new(FRAME_BUFFER_CAPACITY)
    }
}

impl FrameBuffers {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "Frame buffer capacity must be non-zero");
        Self {
            capacity,
            queues: RwLock::new(HashMap::new()),
        }
    }

    /// Create the buffer for a camera. Registering an existing camera keeps
    /// its queued frames.
    pub fn register(&self, camera_id: u32) {
        let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        queues
            .entry(camera_id)
            .or_insert_with(|| Arc::new(CameraQueue::new(self.capacity)));
    }

    pub fn contains(&self, camera_id: u32) -> bool {
        self.queue(camera_id).is_some()
    }

    /// Ids of every registered camera, ascending.
    pub fn camera_ids(&self) -> Vec<u32> {
        let queues = self.queues.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<u32> = queues.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Enqueue a frame without blocking. Returns false when the frame was
    /// dropped (buffer full or camera unknown).
    pub fn publish_frame(&self, camera_id: u32, frame: Frame) -> bool {
        let Some(queue) = self.queue(camera_id) else {
            return false;
        };

        let mut frames = queue.frames.lock().unwrap_or_else(PoisonError::into_inner);
        if frames.len() >= self.capacity {
            queue.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        frames.push_back(frame);
        true
    }

    /// Dequeue the oldest frame without blocking.
    pub fn consume_frame(&self, camera_id: u32) -> Option<Frame> {
        let queue = self.queue(camera_id)?;
        let mut frames = queue.frames.lock().unwrap_or_else(PoisonError::into_inner);
        frames.pop_front()
    }

    /// Frames currently queued for a camera.
    pub fn len(&self, camera_id: u32) -> usize {
        self.queue(camera_id)
            .map(|q| q.frames.lock().unwrap_or_else(PoisonError::into_inner).len())
            .unwrap_or(0)
    }

    /// Frames discarded on overflow since the camera was registered.
    pub fn dropped(&self, camera_id: u32) -> u64 {
        self.queue(camera_id)
            .map(|q| q.dropped.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn queue(&self, camera_id: u32) -> Option<Arc<CameraQueue>> {
        let queues = self.queues.read().unwrap_or_else(PoisonError::into_inner);
        queues.get(&camera_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: u8) -> Frame {
        Frame::new(vec![0xFF, 0xD8, tag, 0xFF, 0xD9])
    }

    #[test]
    fn empty_returns_none() {
        let buffers = FrameBuffers::default();
        buffers.register(1);
        assert!(buffers.consume_frame(1).is_none());
    }

    #[test]
    fn unknown_camera_is_noop() {
        let buffers = FrameBuffers::default();
        assert!(!buffers.publish_frame(7, frame(0)));
        assert!(buffers.consume_frame(7).is_none());
        assert!(!buffers.contains(7));
    }

    #[test]
    fn overflow_drops_incoming_frame() {
        let buffers = FrameBuffers::new(3);
        buffers.register(1);

        assert!(buffers.publish_frame(1, frame(1)));
        assert!(buffers.publish_frame(1, frame(2)));
        assert!(buffers.publish_frame(1, frame(3)));
        // Full: the newest frame is the one discarded
        assert!(!buffers.publish_frame(1, frame(4)));
        assert_eq!(buffers.dropped(1), 1);

        let tags: Vec<u8> = std::iter::from_fn(|| buffers.consume_frame(1))
            .map(|f| f.jpeg[2])
            .collect();
        assert_eq!(tags, vec![1, 2, 3]);
    }

    #[test]
    fn fifo_order_per_camera() {
        let buffers = FrameBuffers::default();
        buffers.register(1);
        buffers.register(2);

        for i in 0..5 {
            buffers.publish_frame(1, frame(i));
            buffers.publish_frame(2, frame(100 + i));
        }

        for i in 0..5 {
            assert_eq!(buffers.consume_frame(1).unwrap().jpeg[2], i);
        }
        assert_eq!(buffers.len(2), 5);
        assert_eq!(buffers.consume_frame(2).unwrap().jpeg[2], 100);
    }

    #[test]
    fn reregister_keeps_queue() {
        let buffers = FrameBuffers::default();
        buffers.register(1);
        buffers.publish_frame(1, frame(9));
        buffers.register(1);
        assert_eq!(buffers.len(1), 1);
        assert_eq!(buffers.camera_ids(), vec![1]);
    }
}
