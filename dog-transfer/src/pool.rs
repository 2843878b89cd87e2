use bytes::BytesMut;
use parking_lot::Mutex;

/// Free list of equally sized chunk buffers.
///
/// At most `max_concurrency + 1` buffers are alive during an upload: one per
/// worker plus the one the producer is filling.
#[derive(Debug)]
pub struct BufferPool {
    buffer_size: usize,
    free: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// A zero-filled buffer of exactly `buffer_size` bytes
    pub fn get(&self) -> BytesMut {
        let mut buffer = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.buffer_size));
        buffer.resize(self.buffer_size, 0);
        buffer
    }

    /// Return a buffer; buffers that lost their capacity are dropped
    pub fn put(&self, mut buffer: BytesMut) {
        buffer.clear();
        if buffer.capacity() >= self.buffer_size {
            self.free.lock().push(buffer);
        }
    }

    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }
}
