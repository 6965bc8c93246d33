use std::sync::{
    Arc, OnceLock,
    atomic::{AtomicBool, Ordering},
};

use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;

use super::{Batch, BatchId, DeviceError, DeviceEvent, DeviceId, Ticket};
use crate::loom::{
    ops::{TensorOp, check_io},
    platform,
};

#[derive(Debug, Error)]
pub enum EngineBuildError {
    #[error("failed to start the engine thread")]
    Thread(#[from] std::io::Error),
    #[cfg(feature = "rayon")]
    #[error("failed to build the worker pool")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// Execution context handed to ops on the engine side.
#[derive(Debug, Clone)]
pub struct Backend {
    /// The unique identifier of the device.
    id: DeviceId,
    /// Worker pool for data-parallel kernels.
    #[cfg(feature = "rayon")]
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl Backend {
    #[inline]
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Runs `f` inside the engine's worker pool, if any.
    #[inline]
    pub fn install<R: Send>(&self, f: impl FnOnce() -> R + Send) -> R {
        #[cfg(feature = "rayon")]
        if let Some(pool) = &self.pool {
            return pool.install(f);
        }
        f()
    }
}

/// Handle to the execution context. Cheap to clone; all clones feed the same engine thread.
#[derive(Debug, Clone)]
pub struct Engine {
    /// The unique identifier of the device.
    id: DeviceId,
    /// Sends batches to execute to the engine thread.
    sender: flume::Sender<DeviceEvent>,
    /// Set once an op fails. A poisoned engine refuses further work.
    poisoned: Arc<AtomicBool>,
}

impl Engine {
    /// The process-wide engine, started on first use and kept until exit.
    pub fn global() -> &'static Engine {
        static ENGINE: OnceLock<Engine> = OnceLock::new();
        ENGINE.get_or_init(|| {
            EngineBuilder::new()
                .name("weft-engine")
                .build()
                .expect("failed to start the global engine")
        })
    }

    #[inline]
    pub fn id(&self) -> DeviceId {
        self.id
    }

    #[inline]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Hands a batch to the engine thread. The returned ticket joins the whole batch.
    pub fn execute(&self, batch: Batch) -> Ticket {
        let (ticket, promise) = Ticket::new();
        ticket.mark_submitted();
        log::trace!("engine {}: submit batch {:?}", self.id, batch);
        // a dead engine drops the promises, which resolves every ticket as disconnected
        _ = self.sender.send(DeviceEvent::Execute { batch, promise });
        ticket
    }

    /// Releases whatever the engine retained for a completed batch.
    pub fn cleanup(&self, id: BatchId) -> Ticket {
        let (ticket, promise) = Ticket::new();
        ticket.mark_submitted();
        _ = self.sender.send(DeviceEvent::Cleanup { id, promise });
        ticket
    }
}

#[derive(Debug, Default, Clone)]
pub struct EngineBuilder {
    pub name: Option<String>,
    pub threads: Option<usize>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name of the engine thread.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Number of kernel worker threads. Only has an effect with the `rayon` feature.
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn build(self) -> Result<Engine, EngineBuildError> {
        let id = DeviceId(uid::Id::new());
        let name = self.name.unwrap_or_else(|| format!("weft-engine-{id}"));

        #[cfg(feature = "rayon")]
        let pool = match self.threads {
            Some(threads) => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(move |index| format!("weft-worker-{index}"))
                    .build()?;
                Some(Arc::new(pool))
            }
            None => None,
        };
        #[cfg(not(feature = "rayon"))]
        if self.threads.is_some() {
            log::warn!("engine {name}: worker threads requested without the `rayon` feature");
        }

        let backend = Backend {
            id,
            #[cfg(feature = "rayon")]
            pool,
        };
        let poisoned = Arc::new(AtomicBool::new(false));

        let (sender, receiver) = flume::unbounded();
        platform::spawn_thread(name.clone(), serve(backend, receiver, poisoned.clone()))?;
        log::debug!("engine {name} started");

        Ok(Engine {
            id,
            sender,
            poisoned,
        })
    }
}

/// Runs one op to completion on the blocking pool, returning it to the caller.
async fn execute(
    backend: &Backend,
    op: Box<dyn TensorOp>,
) -> (Option<Box<dyn TensorOp>>, Result<(), DeviceError>) {
    let name = op.name().to_string();
    if let Err(err) = check_io(&op.io()) {
        return (Some(op), Err(err));
    }
    let backend = backend.clone();
    match platform::handle(move || {
        let result = op.execute(&backend);
        (op, result)
    })
    .await
    {
        Ok((op, result)) => (Some(op), result),
        Err(err) => (None, Err(DeviceError::Kernel(name, err.to_string()))),
    }
}

#[cfg_attr(feature = "trace", tracing::instrument(skip_all, fields(device = %backend.id)))]
async fn serve(backend: Backend, receiver: flume::Receiver<DeviceEvent>, poisoned: Arc<AtomicBool>) {
    // ops of executed batches are retained until the stream cleans the batch up
    let mut retain: HashMap<BatchId, Vec<Box<dyn TensorOp>>> = HashMap::default();

    while let Ok(event) = receiver.recv_async().await {
        match event {
            DeviceEvent::Execute { batch, promise } => {
                let Batch { id, ops } = batch;
                let mut result = match poisoned.load(Ordering::Acquire) {
                    true => Err(DeviceError::Poisoned),
                    false => Ok(()),
                };
                let mut retained = Vec::with_capacity(ops.len());
                for (op, op_promise) in ops {
                    if result.is_err() {
                        let err = match &result {
                            Err(DeviceError::Poisoned) => DeviceError::Poisoned,
                            _ => DeviceError::Aborted(op.name().to_string()),
                        };
                        op_promise.fulfill(Err(err));
                        retained.push(op);
                        continue;
                    }

                    let name = op.name();
                    log::trace!("engine {}: execute {name}", backend.id);
                    let (op, op_result) = execute(&backend, op).await;
                    if let Err(err) = &op_result {
                        log::error!("engine {}: {err}", backend.id);
                        poisoned.store(true, Ordering::Release);
                        result = op_result.clone();
                    }
                    op_promise.fulfill(op_result);
                    retained.extend(op);
                }
                retain.insert(id, retained);
                promise.fulfill(result);
            }
            DeviceEvent::Cleanup { id, promise } => {
                retain.remove(&id);
                promise.fulfill(Ok(()));
            }
        }
    }
    log::debug!("engine {} stopped", backend.id);
}
