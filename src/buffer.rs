//! Send-side byte buffers: the growable `DynamicString`, the process-wide
//! buffer pool backing outgoing queues, and the per-session outgoing FIFO.

use std::collections::VecDeque;
use std::fmt;
use std::io::Write as _;
use std::sync::{Arc, Mutex, OnceLock};

/// A byte buffer with printf-style appends. Grows as required; `len`
/// tracks the bytes appended since the last `clear`.
pub struct DynamicString {
    buf: Vec<u8>,
}

impl DynamicString {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Set the buffer to `count` zero bytes. Download payload content is
    /// unspecified; only its length matters.
    pub fn fill(&mut self, count: usize) {
        self.buf.clear();
        self.buf.resize(count, 0);
    }

    /// Append formatted text, returning the number of bytes written.
    ///
    /// Call as `buf.printf(format_args!("..."))`.
    pub fn printf(&mut self, args: fmt::Arguments<'_>) -> usize {
        let before = self.buf.len();
        // Writing into a Vec cannot fail.
        let _ = self.buf.write_fmt(args);
        self.buf.len() - before
    }
}

/// Buffers travel through outgoing queues while their owning protocol may
/// keep a handle for refilling, so they are shared and internally locked.
pub type QueueBuffer = Arc<Mutex<DynamicString>>;

/// Process-wide pool of queue buffers, LIFO and unbounded.
pub struct BufferPool {
    free: Mutex<Vec<QueueBuffer>>,
}

static BUFFER_POOL: OnceLock<BufferPool> = OnceLock::new();

impl BufferPool {
    fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn global() -> &'static BufferPool {
        BUFFER_POOL.get_or_init(BufferPool::new)
    }

    /// Pop the most recently returned buffer, or create one with at least
    /// `capacity` bytes reserved.
    pub fn borrow(&self, capacity: usize) -> QueueBuffer {
        let recycled = self.free.lock().unwrap().pop();
        match recycled {
            Some(qb) => {
                {
                    let mut buf = qb.lock().unwrap();
                    buf.clear();
                    let cap = buf.capacity();
                    if cap < capacity {
                        buf.buf.reserve(capacity - cap);
                    }
                }
                qb
            }
            None => Arc::new(Mutex::new(DynamicString::with_capacity(capacity))),
        }
    }

    pub fn put_back(&self, qb: QueueBuffer) {
        self.free.lock().unwrap().push(qb);
    }
}

/// FIFO of buffers awaiting write. Buffers are written front-first; the
/// queue tracks how much of the front buffer has already gone out so a
/// partial write can resume.
#[derive(Default)]
pub struct OutgoingQueue {
    inner: Mutex<QueueInner>,
}

#[derive(Default)]
struct QueueInner {
    q: VecDeque<QueueBuffer>,
    front_written: usize,
}

impl OutgoingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a buffer; returns true when the queue was idle, in which
    /// case the caller must start a write.
    pub fn push(&self, qb: QueueBuffer) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let was_idle = inner.q.is_empty();
        inner.q.push_back(qb);
        was_idle
    }

    /// The front buffer plus the count of its bytes already written.
    pub fn front(&self) -> Option<(QueueBuffer, usize)> {
        let inner = self.inner.lock().unwrap();
        inner.q.front().map(|qb| (qb.clone(), inner.front_written))
    }

    /// Record `n` more bytes of the front buffer as written.
    pub fn advance(&self, n: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.front_written += n;
    }

    /// Drop the fully-written front buffer; returns true when the queue
    /// became empty.
    pub fn pop(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.q.pop_front();
        inner.front_written = 0;
        inner.q.is_empty()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.q.clear();
        inner.front_written = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().q.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().q.len()
    }
}
