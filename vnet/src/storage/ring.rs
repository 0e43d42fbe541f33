//! A byte ring buffer with internal synchronization.
//!
//! Both transport buffers are rings of this type: the send side pairs a
//! blocking producer (the application `write`) with a non-blocking consumer
//! (the send loop), the receive side pairs a non-blocking producer (the
//! packet receive path) with a blocking consumer (the application `read`).
use std::sync::{Condvar, Mutex, MutexGuard};

/// The stream ended abnormally while an operation was blocked on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnected;

/// A fixed-capacity byte ring.
#[derive(Debug)]
pub struct Ring {
    inner: Mutex<Inner>,
    readable: Condvar,
    writable: Condvar,
}

#[derive(Debug)]
struct Inner {
    buf: Box<[u8]>,
    head: usize,
    len: usize,
    /// No more bytes will ever be appended (orderly stream end).
    finished: bool,
    /// The stream collapsed, all blocked and future operations fail.
    aborted: bool,
}

impl Ring {
    /// Create a ring with the given fixed capacity.
    pub fn new(capacity: usize) -> Self {
        Ring {
            inner: Mutex::new(Inner {
                buf: vec![0; capacity].into_boxed_slice(),
                head: 0,
                len: 0,
                finished: false,
                aborted: false,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.lock().len
    }

    /// Number of bytes that can be appended without blocking.
    pub fn free(&self) -> usize {
        let inner = self.lock();
        inner.buf.len() - inner.len
    }

    /// Total capacity of the ring.
    pub fn capacity(&self) -> usize {
        self.lock().buf.len()
    }

    /// Whether the producing side has marked the stream as ended.
    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    /// Append from `data`, blocking while the ring is full.
    ///
    /// Returns the number of bytes copied, at least one unless `data` is
    /// empty. Fails once the ring is finished or aborted.
    pub fn write_some(&self, data: &[u8]) -> Result<usize, Disconnected> {
        if data.is_empty() {
            return Ok(0);
        }

        let mut inner = self.lock();
        loop {
            if inner.aborted || inner.finished {
                return Err(Disconnected);
            }
            if inner.len < inner.buf.len() {
                break;
            }
            inner = self.writable.wait(inner).unwrap();
        }

        let n = inner.push(data);
        self.readable.notify_all();
        Ok(n)
    }

    /// Append from `data` without blocking.
    ///
    /// Returns the number of bytes that fit, possibly zero.
    pub fn push_some(&self, data: &[u8]) -> usize {
        let mut inner = self.lock();
        if inner.aborted || inner.finished {
            return 0;
        }

        let n = inner.push(data);
        if n > 0 {
            self.readable.notify_all();
        }
        n
    }

    /// Copy buffered bytes into `out`, blocking while the ring is empty.
    ///
    /// Returns `Ok(0)` only at the orderly end of the stream: the ring is
    /// drained and finished. An aborted ring fails instead.
    pub fn read_some(&self, out: &mut [u8]) -> Result<usize, Disconnected> {
        let mut inner = self.lock();
        loop {
            if inner.aborted {
                return Err(Disconnected);
            }
            if inner.len > 0 || inner.finished {
                break;
            }
            inner = self.readable.wait(inner).unwrap();
        }

        let n = inner.pop(out);
        if n > 0 {
            self.writable.notify_all();
        }
        Ok(n)
    }

    /// Copy up to `out.len()` buffered bytes into `out` without blocking.
    pub fn pop_some(&self, out: &mut [u8]) -> usize {
        let mut inner = self.lock();
        let n = inner.pop(out);
        if n > 0 {
            self.writable.notify_all();
        }
        n
    }

    /// Mark the orderly end of the stream and wake all waiters.
    pub fn finish(&self) {
        let mut inner = self.lock();
        inner.finished = true;
        self.readable.notify_all();
        self.writable.notify_all();
    }

    /// Poison the ring and wake all waiters.
    pub fn abort(&self) {
        let mut inner = self.lock();
        inner.aborted = true;
        self.readable.notify_all();
        self.writable.notify_all();
    }
}

impl Inner {
    fn push(&mut self, data: &[u8]) -> usize {
        let cap = self.buf.len();
        let n = data.len().min(cap - self.len);

        let tail = (self.head + self.len) % cap;
        let first = n.min(cap - tail);
        self.buf[tail..tail + first].copy_from_slice(&data[..first]);
        self.buf[..n - first].copy_from_slice(&data[first..n]);

        self.len += n;
        n
    }

    fn pop(&mut self, out: &mut [u8]) -> usize {
        let cap = self.buf.len();
        let n = out.len().min(self.len);

        let first = n.min(cap - self.head);
        out[..first].copy_from_slice(&self.buf[self.head..self.head + first]);
        out[first..n].copy_from_slice(&self.buf[..n - first]);

        self.head = (self.head + n) % cap;
        self.len -= n;
        n
    }
}
