//! Fixed-size frame buffer pool and the per-direction buffer context.
//!
//! Buffers are addressed by slot ([`BufHandle`]), never by address. Slots are
//! allocated lazily up to the pool capacity and recycled through a free list.

/// Slot index of a buffer owned by a [`BufferPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufHandle(u32);

impl BufHandle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Pool of equally sized byte buffers.
pub struct BufferPool {
    name: &'static str,
    buf_size: usize,
    capacity: usize,
    slots: Vec<Box<[u8]>>,
    free_list: Vec<u32>,
    in_use: Vec<bool>, // double-release protection
}

impl BufferPool {
    /// Create a pool of at most `capacity` buffers of `buf_size` bytes each.
    pub fn new(name: &'static str, capacity: usize, buf_size: usize) -> Self {
        Self {
            name,
            buf_size,
            capacity,
            slots: Vec::new(),
            free_list: Vec::new(),
            in_use: Vec::new(),
        }
    }

    /// Take a buffer out of the pool. Returns `None` when every slot is in use.
    pub fn get(&mut self) -> Option<BufHandle> {
        let idx = match self.free_list.pop() {
            Some(idx) => idx,
            None => {
                if self.slots.len() >= self.capacity {
                    return None;
                }
                self.slots.push(vec![0u8; self.buf_size].into_boxed_slice());
                self.in_use.push(false);
                (self.slots.len() - 1) as u32
            }
        };
        self.in_use[idx as usize] = true;
        Some(BufHandle(idx))
    }

    /// Return a buffer to the pool. Releasing twice is ignored.
    pub fn put(&mut self, handle: BufHandle) {
        let i = handle.index();
        debug_assert!(i < self.slots.len(), "{}: bad handle {}", self.name, i);
        if !self.in_use.get(i).copied().unwrap_or(false) {
            return;
        }
        self.in_use[i] = false;
        self.free_list.push(handle.0);
    }

    pub fn buf(&self, handle: BufHandle) -> &[u8] {
        &self.slots[handle.index()]
    }

    pub fn buf_mut(&mut self, handle: BufHandle) -> &mut [u8] {
        &mut self.slots[handle.index()]
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of buffers currently handed out.
    pub fn in_use(&self) -> usize {
        self.in_use.iter().filter(|used| **used).count()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Cursor over one pool buffer: `offset` bytes consumed out of `length`
/// valid bytes.
#[derive(Debug, Default)]
pub struct BufCtx {
    buf: Option<BufHandle>,
    pub(crate) offset: usize,
    pub(crate) length: usize,
}

impl BufCtx {
    pub fn new() -> Self {
        Self::default()
    }

    /// No valid bytes are held.
    pub fn is_empty(&self) -> bool {
        debug_assert!(self.length == 0 || self.buf.is_some());
        self.length == 0
    }

    /// Valid bytes remain past the cursor.
    pub fn need_progress(&self) -> bool {
        debug_assert!(self.offset <= self.length);
        self.offset < self.length
    }

    pub fn remaining(&self) -> usize {
        self.length - self.offset
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn handle(&self) -> Option<BufHandle> {
        self.buf
    }

    pub(crate) fn attach(&mut self, handle: BufHandle) {
        debug_assert!(self.buf.is_none());
        self.buf = Some(handle);
        self.rewind();
    }

    pub(crate) fn rewind(&mut self) {
        self.offset = 0;
        self.length = 0;
    }

    /// Return the buffer to `pool` and rewind.
    pub(crate) fn reset(&mut self, pool: &mut BufferPool) {
        if let Some(handle) = self.buf.take() {
            pool.put(handle);
        }
        self.rewind();
    }
}
