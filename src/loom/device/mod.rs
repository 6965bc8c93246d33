use std::sync::{
    Arc, Mutex, Weak,
    atomic::{AtomicBool, Ordering},
};

use derive_more::{Deref, Display};
use futures::{
    FutureExt,
    channel::oneshot,
    future::{BoxFuture, Shared},
};
use thiserror::Error;

use super::{ops::TensorOp, stream::SubmissionStream};

pub use cpu::{Backend, Engine, EngineBuilder};

pub mod allocator;
pub mod cpu;

#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, Deref)]
pub struct DeviceId(uid::Id<DeviceId>);

#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, Deref)]
pub struct TicketId(uid::Id<TicketId>);

#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, Deref)]
pub struct BatchId(uid::Id<BatchId>);

/// Failures observed while executing ops on the engine.
///
/// These are only surfaced when joining a batch or waiting on a ticket.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("op {0} failed: {1}")]
    Kernel(String, String),
    #[error("op {0} aborted after an earlier failure in its batch")]
    Aborted(String),
    #[error("engine is poisoned by an earlier failure")]
    Poisoned,
    #[error("engine disconnected")]
    Disconnected,
    #[error("waiting on ticket {0} that has not been submitted")]
    Unsubmitted(TicketId),
    #[error("violation of write uniqueness rule on chunk {0}")]
    Access(String),
}

/// The sending half of a [`Ticket`]. Dropping it without fulfilling resolves the ticket
/// with [`DeviceError::Disconnected`].
#[derive(Debug)]
pub struct Promise(oneshot::Sender<Result<(), DeviceError>>);

impl Promise {
    #[inline]
    pub fn fulfill(self, result: Result<(), DeviceError>) {
        _ = self.0.send(result)
    }
}

/// Completion handle of one enqueued op or of one whole batch.
#[derive(Clone)]
pub struct Ticket {
    id: TicketId,
    submitted: Arc<AtomicBool>,
    completion: Shared<BoxFuture<'static, Result<(), DeviceError>>>,
    /// The stream the op was enqueued into, if it is shared through a context.
    origin: Option<Weak<Mutex<SubmissionStream>>>,
}

impl std::fmt::Debug for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticket")
            .field("id", &self.id)
            .field("submitted", &self.is_submitted())
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl PartialEq for Ticket {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Ticket {
    pub fn new() -> (Self, Promise) {
        let (sender, receiver) = oneshot::channel();
        let completion = receiver
            .map(|result| result.unwrap_or(Err(DeviceError::Disconnected)))
            .boxed()
            .shared();
        let ticket = Self {
            id: TicketId(uid::Id::new()),
            submitted: Arc::new(AtomicBool::new(false)),
            completion,
            origin: None,
        };
        (ticket, Promise(sender))
    }

    #[inline]
    pub fn id(&self) -> TicketId {
        self.id
    }

    #[inline]
    pub fn is_submitted(&self) -> bool {
        self.submitted.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn with_origin(mut self, stream: &Arc<Mutex<SubmissionStream>>) -> Self {
        self.origin = Some(Arc::downgrade(stream));
        self
    }

    /// The stream holding the op until it is submitted, if it is still alive.
    #[inline]
    pub fn origin(&self) -> Option<Arc<Mutex<SubmissionStream>>> {
        self.origin.as_ref().and_then(Weak::upgrade)
    }

    #[inline]
    pub(crate) fn mark_submitted(&self) {
        self.submitted.store(true, Ordering::Release)
    }

    /// Returns `true` once the op has completed, successfully or not.
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.completion.clone().now_or_never().is_some()
    }

    /// Blocks the calling thread until the op completes.
    pub fn wait(&self) -> Result<(), DeviceError> {
        if !self.is_submitted() && !self.is_ready() {
            return Err(DeviceError::Unsubmitted(self.id));
        }
        futures::executor::block_on(self.completion.clone())
    }

    /// Resolves when the op completes.
    pub async fn wait_async(&self) -> Result<(), DeviceError> {
        self.completion.clone().await
    }
}

/// A batch of ops handed to the engine in one piece.
pub struct Batch {
    pub id: BatchId,
    pub ops: Vec<(Box<dyn TensorOp>, Promise)>,
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ops: Vec<_> = self.ops.iter().map(|(op, _)| op.name()).collect();
        f.debug_struct("Batch")
            .field("id", &self.id)
            .field("ops", &ops)
            .finish()
    }
}

#[derive(Debug)]
pub enum DeviceEvent {
    /// Executes every op of the batch in order, then fulfills `promise`.
    Execute { batch: Batch, promise: Promise },
    /// Drops everything the engine retained for the batch, then fulfills `promise`.
    Cleanup { id: BatchId, promise: Promise },
}
