//! Reusable I/O operation contexts and their free-list pool.
//!
//! The pool is filled once from the arena and never grows. A context is
//! moved out on `pop` and moved back on `push`, so ownership alone keeps
//! two in-flight operations from sharing one buffer.

use crate::error::{Error, Result};
use crate::runtime::arena::{BufferArena, Segment};
use crate::runtime::op::{IoStatus, OpKind};
use crate::runtime::ConnId;
use std::io;
use std::sync::{Mutex, PoisonError};

/// One in-flight or idle I/O operation bound to an arena segment.
#[derive(Debug)]
pub struct IoContext {
    /// Position in the pool fill order; stable for the process lifetime.
    slot: usize,
    segment: Segment,
    /// Bytes of the segment exposed to the next operation.
    window: usize,
    conn: Option<ConnId>,
    last_op: Option<OpKind>,
    transferred: usize,
    status: IoStatus,
}

impl IoContext {
    fn new(slot: usize, segment: Segment) -> Self {
        let window = segment.len();
        Self {
            slot,
            segment,
            window,
            conn: None,
            last_op: None,
            transferred: 0,
            status: IoStatus::Success,
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Arena offset of the backing segment.
    pub fn offset(&self) -> usize {
        self.segment.offset()
    }

    /// Full segment length.
    pub fn capacity(&self) -> usize {
        self.segment.len()
    }

    pub fn bind(&mut self, conn: ConnId) {
        self.conn = Some(conn);
    }

    pub fn conn(&self) -> Option<ConnId> {
        self.conn
    }

    pub fn last_op(&self) -> Option<OpKind> {
        self.last_op
    }

    pub fn transferred(&self) -> usize {
        self.transferred
    }

    pub fn status(&self) -> IoStatus {
        self.status
    }

    /// Current window into the segment.
    pub fn window(&self) -> &[u8] {
        &self.segment.as_slice()[..self.window]
    }

    pub fn window_mut(&mut self) -> &mut [u8] {
        &mut self.segment.as_mut_slice()[..self.window]
    }

    /// Bytes moved by the last operation.
    pub fn payload(&self) -> &[u8] {
        &self.segment.as_slice()[..self.transferred]
    }

    /// Expose the whole segment to the next operation.
    pub fn reset_window(&mut self) {
        self.window = self.segment.len();
    }

    /// Zero the segment so no bytes from a previous use leak into a send.
    pub fn clear_residue(&mut self) {
        self.segment.as_mut_slice().fill(0);
    }

    /// Copy `payload` to the start of the segment and narrow the window to it.
    pub fn load(&mut self, payload: &[u8]) -> Result<()> {
        let max = self.segment.len();
        if payload.len() > max {
            return Err(Error::PayloadTooLarge {
                len: payload.len(),
                max,
            });
        }
        self.segment.as_mut_slice()[..payload.len()].copy_from_slice(payload);
        self.window = payload.len();
        Ok(())
    }

    /// Record the outcome of an operation.
    pub fn complete(&mut self, op: OpKind, result: io::Result<usize>) {
        self.last_op = Some(op);
        match result {
            Ok(n) => {
                self.transferred = n;
                self.status = IoStatus::Success;
            }
            Err(e) => {
                self.transferred = 0;
                self.status = IoStatus::Failed(e.kind());
            }
        }
    }

    /// Turn the recorded status into a result.
    ///
    /// A successful zero-byte transfer is reported as
    /// [`Error::ZeroLengthTransfer`].
    pub fn outcome(&self) -> Result<usize> {
        match self.status {
            IoStatus::Failed(kind) => Err(Error::Transport(io::Error::from(kind))),
            IoStatus::Success if self.transferred == 0 => Err(Error::ZeroLengthTransfer),
            IoStatus::Success => Ok(self.transferred),
        }
    }

    fn recycle(&mut self) {
        self.conn = None;
        self.last_op = None;
        self.reset_window();
    }
}

/// Fixed-capacity free list of [`IoContext`].
#[derive(Debug)]
pub struct IoContextPool {
    free: Mutex<Vec<IoContext>>,
    capacity: usize,
    segment_size: usize,
}

impl IoContextPool {
    /// Create `n` contexts, each bound to the next arena segment.
    ///
    /// This is the only place contexts are created.
    pub fn fill(arena: &mut BufferArena, n: usize) -> Result<Self> {
        let mut free = Vec::with_capacity(n);
        for slot in 0..n {
            free.push(IoContext::new(slot, arena.issue_segment()?));
        }
        // LIFO order: slot 0 is popped first.
        free.reverse();

        Ok(Self {
            free: Mutex::new(free),
            capacity: n,
            segment_size: arena.segment_size(),
        })
    }

    /// Take a context off the free list.
    ///
    /// Fails fast with [`Error::PoolEmpty`]; callers treat that as an
    /// accounting bug rather than waiting.
    pub fn pop(&self) -> Result<IoContext> {
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .ok_or(Error::PoolEmpty {
                capacity: self.capacity,
            })
    }

    /// Return a context, clearing its connection binding.
    pub fn push(&self, mut ctx: IoContext) {
        ctx.recycle();
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        debug_assert!(free.len() < self.capacity, "pool grew past its fill");
        free.push(ctx);
    }

    /// Number of contexts currently on the free list.
    pub fn available(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }
}
