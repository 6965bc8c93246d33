//! Ordered submission of ops to an [`Engine`].
//!
//! A [`SubmissionStream`] accumulates ops until [`SubmissionStream::submit`] hands them to
//! the engine as one batch. While that batch is in flight the stream is *submitted*: new
//! ops still enqueue, but they land in the next batch. [`SubmissionStream::cleanup`]
//! joins the batch, releases its scratch memory and returns the stream to accumulating.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use thiserror::Error;

use super::{
    device::{Batch, BatchId, DeviceError, Engine, Promise, Ticket, allocator::Allocator},
    layout::LayoutDesc,
    memory::Memory,
    ops::TensorOp,
};

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream error: a batch is already submitted")]
    Submitted,
    #[error("stream error: no batch is submitted")]
    Accumulating,
    #[error(transparent)]
    Device(#[from] DeviceError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Accumulating,
    Submitted,
}

struct PendingOp {
    op: Box<dyn TensorOp>,
    promise: Promise,
    ticket: Ticket,
}

#[derive(Debug)]
struct SubmittedBatch {
    id: BatchId,
    ticket: Ticket,
}

pub struct SubmissionStream {
    engine: Engine,
    pending: Vec<PendingOp>,
    submitted: Option<SubmittedBatch>,
    scratch: Allocator,
}

impl std::fmt::Debug for SubmissionStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pending: Vec<_> = self.pending.iter().map(|pending| pending.op.name()).collect();
        f.debug_struct("SubmissionStream")
            .field("engine", &self.engine.id())
            .field("pending", &pending)
            .field("submitted", &self.submitted)
            .finish()
    }
}

impl SubmissionStream {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            pending: vec![],
            submitted: None,
            scratch: Allocator::default(),
        }
    }

    #[inline]
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    #[inline]
    pub fn state(&self) -> StreamState {
        match self.submitted {
            Some(_) => StreamState::Submitted,
            None => StreamState::Accumulating,
        }
    }

    /// Number of ops waiting for the next submit.
    #[inline]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Returns `true` if the op of `ticket` is still waiting for the next submit.
    pub fn is_queued(&self, ticket: &Ticket) -> bool {
        self.pending.iter().any(|pending| pending.ticket == *ticket)
    }

    /// Appends an op to the next batch.
    pub fn enqueue(&mut self, op: impl TensorOp) -> Ticket {
        let (ticket, promise) = Ticket::new();
        log::trace!("enqueue {} as {}", op.name(), ticket.id());
        let op = Box::new(op);
        self.pending.push(PendingOp {
            op,
            promise,
            ticket: ticket.clone(),
        });
        ticket
    }

    /// Allocates zeroed scratch memory that lives until the next [`cleanup`](Self::cleanup).
    pub fn scratch(&mut self, desc: LayoutDesc) -> Memory {
        self.scratch.alloc(desc)
    }

    #[inline]
    pub fn scratch_allocator(&self) -> &Allocator {
        &self.scratch
    }

    /// Hands every pending op to the engine as one batch.
    ///
    /// With `blocking`, returns only after the whole batch has completed, surfacing the
    /// first failure of the batch. The stream stays submitted either way.
    pub fn submit(&mut self, blocking: bool) -> Result<(), StreamError> {
        if self.submitted.is_some() {
            return Err(StreamError::Submitted);
        }
        let ops = self
            .pending
            .drain(..)
            .map(|PendingOp { op, promise, ticket }| {
                ticket.mark_submitted();
                (op, promise)
            })
            .collect();
        let id = BatchId::default();
        let ticket = self.engine.execute(Batch { id, ops });
        self.submitted = Some(SubmittedBatch {
            id,
            ticket: ticket.clone(),
        });

        if blocking {
            ticket.wait()?;
        }
        Ok(())
    }

    /// Joins the submitted batch, releases its scratch memory and returns to accumulating.
    pub fn cleanup(&mut self) -> Result<(), StreamError> {
        let Some(SubmittedBatch { id, ticket }) = self.submitted.take() else {
            return Err(StreamError::Accumulating);
        };
        let result = ticket.wait();
        self.engine.cleanup(id).wait()?;
        self.scratch.release();
        Ok(result?)
    }

    /// Settles any submitted batch, then submits and joins everything pending.
    pub fn flush(&mut self) -> Result<(), StreamError> {
        if self.submitted.is_some() {
            self.cleanup()?;
        }
        self.submit(false)?;
        self.cleanup()
    }
}

/// An engine paired with the stream that feeds it.
///
/// Every array operation enqueues into its context's stream. The stream sits behind a
/// mutex, so concurrent use is memory safe, but batching across independent threads is
/// not coordinated: a thread may submit ops another thread enqueued. Callers sharing a
/// context between threads must sequence enqueue, submit and cleanup themselves.
#[derive(Debug, Clone)]
pub struct Context {
    engine: Engine,
    stream: Arc<Mutex<SubmissionStream>>,
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.stream, &other.stream)
    }
}

impl Eq for Context {}

impl Context {
    pub fn new(engine: Engine) -> Self {
        let stream = Arc::new(Mutex::new(SubmissionStream::new(engine.clone())));
        Self { engine, stream }
    }

    /// The default context over [`Engine::global`].
    pub fn global() -> &'static Context {
        static CONTEXT: OnceLock<Context> = OnceLock::new();
        CONTEXT.get_or_init(|| Context::new(Engine::global().clone()))
    }

    #[inline]
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    #[inline]
    pub fn stream(&self) -> MutexGuard<'_, SubmissionStream> {
        self.stream.lock().expect("failed to lock")
    }

    #[inline]
    pub fn enqueue(&self, op: impl TensorOp) -> Ticket {
        self.stream().enqueue(op).with_origin(&self.stream)
    }

    /// Makes `memory` readable by ops of this context.
    ///
    /// A memory written by another context may still sit in that context's stream, which
    /// this context never submits. Such a stream is flushed, and the write awaited.
    pub fn settle(&self, memory: &Memory) -> Result<(), StreamError> {
        let Some(ticket) = memory.ticket() else {
            return Ok(());
        };
        if ticket.is_ready() {
            return Ok(());
        }
        match ticket.origin() {
            // ordered by this stream
            Some(origin) if Arc::ptr_eq(&origin, &self.stream) => return Ok(()),
            Some(origin) => {
                let mut stream = origin.lock().expect("failed to lock");
                if stream.is_queued(ticket) {
                    log::debug!("flush a foreign stream for {}", ticket.id());
                    stream.flush()?;
                }
            }
            None => {}
        }
        ticket.wait()?;
        Ok(())
    }

    #[inline]
    pub fn flush(&self) -> Result<(), StreamError> {
        self.stream().flush()
    }

    /// Zeroed scratch memory for ops of the next batch, recycled once the batch is
    /// cleaned up.
    #[inline]
    pub fn scratch(&self, desc: LayoutDesc) -> Memory {
        self.stream().scratch(desc)
    }
}
