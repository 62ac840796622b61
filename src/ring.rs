/// Fixed-capacity circular byte buffer retaining the most recent output of
/// a service.
///
/// The write cursor grows monotonically but is normalized into `[0, 2R)` so
/// the wrap math stays simple: a cursor below `R` means the buffer has not
/// wrapped yet, a cursor in `[R, 2R)` means it holds exactly `R` bytes and
/// `cursor - R` is the wrap offset.
#[derive(Debug)]
pub struct RingBuffer {
    buf: Box<[u8]>,
    cursor: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        RingBuffer {
            buf: vec![0u8; capacity].into_boxed_slice(),
            cursor: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Number of retained bytes.
    pub fn len(&self) -> usize {
        self.cursor.min(self.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.cursor == 0
    }

    /// Append bytes, overwriting the oldest data once the logical length
    /// exceeds the capacity.
    pub fn write(&mut self, bytes: &[u8]) {
        let cap = self.capacity();
        if bytes.len() >= cap {
            // Only the newest `cap` bytes survive; realign to offset 0.
            self.buf.copy_from_slice(&bytes[bytes.len() - cap..]);
            self.cursor = cap;
            return;
        }
        let start = self.cursor % cap;
        let end = start + bytes.len();
        if end <= cap {
            self.buf[start..end].copy_from_slice(bytes);
        } else {
            let first = cap - start;
            self.buf[start..].copy_from_slice(&bytes[..first]);
            self.buf[..end - cap].copy_from_slice(&bytes[first..]);
        }
        self.cursor += bytes.len();
        if self.cursor >= 2 * cap {
            self.cursor -= cap;
        }
    }

    /// View of the retained bytes as at most two contiguous segments in
    /// chronological order, suitable for a scatter write into a reply.
    pub fn snapshot(&self) -> (&[u8], &[u8]) {
        let cap = self.capacity();
        if self.cursor <= cap {
            (&self.buf[..self.cursor], &[])
        } else {
            let off = self.cursor - cap;
            (&self.buf[off..], &self.buf[..off])
        }
    }

    /// Retained bytes as one owned vector, oldest first.
    pub fn to_vec(&self) -> Vec<u8> {
        let (a, b) = self.snapshot();
        let mut out = Vec::with_capacity(a.len() + b.len());
        out.extend_from_slice(a);
        out.extend_from_slice(b);
        out
    }
}
