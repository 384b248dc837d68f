use std::sync::Mutex;

/// MTU-sized RTP read buffer.
pub const RTP_BUFFER_SIZE: usize = 1500;

const MAX_POOLED: usize = 256;

/// Process-wide pool of fixed-size buffers for the RTP forwarding loops.
/// Buffers must be returned on every exit path, including read errors.
#[derive(Debug)]
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
    max_pooled: usize,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::with_sizes(RTP_BUFFER_SIZE, MAX_POOLED)
    }

    pub fn with_sizes(buffer_size: usize, max_pooled: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
            buffer_size,
            max_pooled,
        }
    }

    pub fn acquire(&self) -> Vec<u8> {
        if let Some(buf) = self.buffers.lock().unwrap().pop() {
            return buf;
        }
        vec![0u8; self.buffer_size]
    }

    pub fn release(&self, buf: Vec<u8>) {
        if buf.len() != self.buffer_size {
            return;
        }
        let mut buffers = self.buffers.lock().unwrap();
        if buffers.len() < self.max_pooled {
            buffers.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_returns_full_size_buffers() {
        let pool = BufferPool::new();
        let buf = pool.acquire();
        assert_eq!(buf.len(), RTP_BUFFER_SIZE);
    }

    #[test]
    fn released_buffers_are_reused() {
        let pool = BufferPool::with_sizes(64, 4);
        let mut buf = pool.acquire();
        buf[0] = 0xAB;
        pool.release(buf);
        let buf = pool.acquire();
        assert_eq!(buf.len(), 64);
        assert_eq!(buf[0], 0xAB);
    }

    #[test]
    fn wrong_size_buffers_are_dropped() {
        let pool = BufferPool::with_sizes(64, 4);
        pool.release(vec![0u8; 10]);
        let buf = pool.acquire();
        assert_eq!(buf.len(), 64);
    }

    #[test]
    fn pool_is_bounded() {
        let pool = BufferPool::with_sizes(64, 2);
        for _ in 0..8 {
            pool.release(vec![0u8; 64]);
        }
        assert!(pool.buffers.lock().unwrap().len() <= 2);
    }
}
