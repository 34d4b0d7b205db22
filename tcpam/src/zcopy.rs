//! Scatter-gather state of an in-flight zero-copy send.

use std::io::IoSlice;
use std::ops::Range;

use bytes::Bytes;

use crate::endpoint::Completion;
use crate::error::Result;

/// One entry of the scatter-gather list.
#[derive(Debug, Clone)]
pub(crate) enum TxSeg {
    /// Bytes living in the endpoint's transmit buffer.
    Local(Range<usize>),
    /// Caller-owned payload.
    Shared(Bytes),
}

impl TxSeg {
    fn len(&self) -> usize {
        match self {
            TxSeg::Local(range) => range.len(),
            TxSeg::Shared(bytes) => bytes.len(),
        }
    }
}

/// Cursor over the unsent part of a zero-copy frame plus its completion.
pub(crate) struct ZcopyCtx {
    segs: Vec<TxSeg>,
    index: usize,
    offset: usize,
    comp: Option<Completion>,
}

impl ZcopyCtx {
    pub(crate) fn new(segs: Vec<TxSeg>, comp: Option<Completion>) -> Self {
        Self {
            segs,
            index: 0,
            offset: 0,
            comp,
        }
    }

    /// Move the cursor forward by `n` sent bytes.
    pub(crate) fn advance(&mut self, mut n: usize) {
        while n > 0 && self.index < self.segs.len() {
            let left = self.segs[self.index].len() - self.offset;
            if n < left {
                self.offset += n;
                return;
            }
            n -= left;
            self.index += 1;
            self.offset = 0;
        }
    }

    /// Append the unsent entries to `out`; `local` is the transmit buffer.
    pub(crate) fn fill_iov<'a>(&'a self, local: &'a [u8], out: &mut Vec<IoSlice<'a>>) {
        for (i, seg) in self.segs.iter().enumerate().skip(self.index) {
            let bytes: &[u8] = match seg {
                TxSeg::Local(range) => &local[range.clone()],
                TxSeg::Shared(bytes) => bytes,
            };
            let skip = if i == self.index { self.offset } else { 0 };
            if skip < bytes.len() {
                out.push(IoSlice::new(&bytes[skip..]));
            }
        }
    }

    pub(crate) fn remaining_segments(&self) -> usize {
        self.segs.len() - self.index
    }

    /// Consume the context and report `status` to the completion, if any.
    pub(crate) fn complete(mut self, status: Result<()>) {
        if let Some(comp) = self.comp.take() {
            comp(status);
        }
    }
}

/// Copy the concatenation of `parts`, minus its first `skip` bytes, into
/// `dst`. Returns the number of bytes copied.
pub(crate) fn gather(parts: &[&[u8]], mut skip: usize, dst: &mut [u8]) -> usize {
    let mut copied = 0;
    for part in parts {
        if skip >= part.len() {
            skip -= part.len();
            continue;
        }
        let src = &part[skip..];
        skip = 0;
        let n = src.len().min(dst.len() - copied);
        dst[copied..copied + n].copy_from_slice(&src[..n]);
        copied += n;
        if copied == dst.len() {
            break;
        }
    }
    copied
}
