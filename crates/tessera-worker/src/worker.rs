//! Worker host and main-side handle.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use tessera_chronicle::Chronicle;
use tessera_engine::{ActionRegistry, Engine, EngineConfig, EngineError};
use tessera_events::EventBus;
use tessera_types::{now_millis, Action};

use crate::frames::{FrameResult, WorkerFrame};
use crate::Result;

/// Errors on the worker boundary.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker task is gone.
    #[error("worker channel closed")]
    Closed,

    /// The mirror engine reported a failure or the request expired.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Actor identity of the mirror chronicle.
    pub peer_id: String,
    /// Coalesce dispatches arriving within this window into one batch
    /// frame; `None` sends one frame per dispatch.
    pub batch_window: Option<Duration>,
    /// Default per-request timeout; expired requests resolve with
    /// `TimedOut` and late replies are discarded.
    pub timeout: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            peer_id: "worker".to_string(),
            batch_window: None,
            timeout: None,
        }
    }
}

enum Reply {
    Single(oneshot::Sender<WorkerFrame>),
    Batch(Vec<oneshot::Sender<WorkerFrame>>),
}

struct HandleInner {
    pending: Mutex<HashMap<u64, Reply>>,
    next_id: AtomicU64,
}

impl HandleInner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// The worker executor.
pub struct Worker;

impl Worker {
    /// Spawns a worker hosting a mirror engine.
    ///
    /// The mirror is initialized from `snapshot` (a chronicle binary save)
    /// and resolves handlers from `registry`, whose pack manifest rides in
    /// the init frame. Events pushed from the mirror surface on `main_bus`
    /// as `worker:event {topic, payload}`.
    pub fn spawn(
        config: WorkerConfig,
        registry: ActionRegistry,
        snapshot: Vec<u8>,
        main_bus: EventBus,
    ) -> WorkerHandle {
        let (to_worker, from_main) = mpsc::channel::<WorkerFrame>(64);
        let (to_main, from_worker) = mpsc::unbounded_channel::<WorkerFrame>();
        let (ready_tx, ready_rx) = watch::channel(false);

        let inner = Arc::new(HandleInner {
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        });

        tokio::spawn(worker_loop(
            config.peer_id.clone(),
            registry.clone(),
            from_main,
            to_main,
        ));
        tokio::spawn(reply_loop(
            inner.clone(),
            from_worker,
            main_bus,
            ready_tx,
        ));

        let handle = WorkerHandle {
            config,
            to_worker,
            inner,
            ready: ready_rx,
            batch: Arc::new(Mutex::new(Vec::new())),
        };
        handle.send_init(snapshot, registry.pack_manifest());
        handle
    }
}

async fn worker_loop(
    peer_id: String,
    registry: ActionRegistry,
    mut from_main: mpsc::Receiver<WorkerFrame>,
    to_main: mpsc::UnboundedSender<WorkerFrame>,
) {
    let mut engine: Option<Engine> = None;

    while let Some(frame) = from_main.recv().await {
        match frame {
            WorkerFrame::Init { chronicle, packs } => {
                match build_mirror(&peer_id, &chronicle, registry.clone(), &to_main) {
                    Ok(mirror) => {
                        info!(packs = ?packs, "worker mirror initialized");
                        engine = Some(mirror);
                        let _ = to_main.send(WorkerFrame::InitOk);
                    }
                    Err(err) => {
                        warn!(error = %err, "worker init failed");
                        let _ = to_main.send(WorkerFrame::DispatchErr {
                            id: 0,
                            kind: err.kind().to_string(),
                            message: err.to_string(),
                        });
                    }
                }
            }
            WorkerFrame::Ping { id, sent_at } => {
                let _ = to_main.send(WorkerFrame::Pong {
                    id,
                    sent_at,
                    replied_at: now_millis(),
                });
            }
            WorkerFrame::Dispatch { id, action } => {
                let Some(ref engine) = engine else {
                    let _ = to_main.send(uninitialized(id));
                    continue;
                };
                let _ = to_main.send(run_one(engine, id, action));
            }
            WorkerFrame::Batch { id, actions } => {
                let Some(ref engine) = engine else {
                    let _ = to_main.send(uninitialized(id));
                    continue;
                };
                let results = actions
                    .into_iter()
                    .map(|action| match engine.dispatch(action).result {
                        Ok(result) => FrameResult::Ok { result },
                        Err(err) => FrameResult::Err {
                            kind: err.kind().to_string(),
                            message: err.to_string(),
                        },
                    })
                    .collect();
                let _ = to_main.send(WorkerFrame::BatchOk { id, results });
            }
            WorkerFrame::Snapshot { id } => {
                let Some(ref engine) = engine else {
                    let _ = to_main.send(uninitialized(id));
                    continue;
                };
                let _ = to_main.send(WorkerFrame::SnapshotOk {
                    id,
                    chronicle: BASE64.encode(engine.snapshot()),
                });
            }
            WorkerFrame::Shutdown => {
                debug!("worker shutting down");
                break;
            }
            other => {
                warn!(frame = ?other, "unexpected frame on worker side");
            }
        }
    }
}

fn uninitialized(id: u64) -> WorkerFrame {
    WorkerFrame::DispatchErr {
        id,
        kind: "panic".to_string(),
        message: "worker not initialized".to_string(),
    }
}

fn build_mirror(
    peer_id: &str,
    chronicle_b64: &str,
    registry: ActionRegistry,
    to_main: &mpsc::UnboundedSender<WorkerFrame>,
) -> std::result::Result<Engine, EngineError> {
    let bytes = BASE64
        .decode(chronicle_b64)
        .map_err(|e| EngineError::InvalidPayload(format!("bad init chronicle: {e}")))?;
    let bus = EventBus::new();
    let chronicle = Arc::new(Chronicle::load(&bytes, peer_id, bus.clone())?);
    let engine = Engine::with_chronicle(
        EngineConfig {
            peer_id: peer_id.to_string(),
            ..Default::default()
        },
        chronicle,
        registry,
    );

    // Push every domain event back to the main side.
    let forward = to_main.clone();
    bus.on("*", move |event| {
        let _ = forward.send(WorkerFrame::Event {
            topic: event.topic.clone(),
            payload: event.payload.clone(),
        });
    })
    .detach();

    Ok(engine)
}

fn run_one(engine: &Engine, id: u64, action: Action) -> WorkerFrame {
    let before = engine.chronicle().metrics().change_count;
    match engine.dispatch(action).result {
        Ok(result) => WorkerFrame::DispatchOk {
            id,
            result,
            changes: engine.chronicle().metrics().change_count - before,
        },
        Err(err) => WorkerFrame::DispatchErr {
            id,
            kind: err.kind().to_string(),
            message: err.to_string(),
        },
    }
}

async fn reply_loop(
    inner: Arc<HandleInner>,
    mut from_worker: mpsc::UnboundedReceiver<WorkerFrame>,
    main_bus: EventBus,
    ready: watch::Sender<bool>,
) {
    // Request ids start at 1; id 0 marks an init failure, on which the
    // ready sender is dropped so queued dispatches resolve as closed
    // instead of hanging.
    let mut ready = Some(ready);
    while let Some(frame) = from_worker.recv().await {
        match frame {
            WorkerFrame::InitOk => {
                if let Some(tx) = ready.as_ref() {
                    let _ = tx.send(true);
                }
            }
            WorkerFrame::DispatchErr { id: 0, ref message, .. } => {
                warn!(error = %message, "worker init failed");
                ready = None;
            }
            WorkerFrame::Event { topic, payload } => {
                main_bus.emit(
                    "worker:event",
                    serde_json::json!({ "topic": topic, "payload": payload }),
                );
            }
            WorkerFrame::Pong { id, .. }
            | WorkerFrame::SnapshotOk { id, .. }
            | WorkerFrame::DispatchOk { id, .. }
            | WorkerFrame::DispatchErr { id, .. } => {
                // An absent entry means the request timed out; the late
                // reply is discarded.
                if let Some(Reply::Single(tx)) = inner.pending.lock().remove(&id) {
                    let _ = tx.send(frame);
                }
            }
            WorkerFrame::BatchOk { id, results } => {
                if let Some(Reply::Batch(senders)) = inner.pending.lock().remove(&id) {
                    for (tx, result) in senders.into_iter().zip(results) {
                        let reply = match result {
                            FrameResult::Ok { result } => WorkerFrame::DispatchOk {
                                id,
                                result,
                                changes: 0,
                            },
                            FrameResult::Err { kind, message } => {
                                WorkerFrame::DispatchErr { id, kind, message }
                            }
                        };
                        let _ = tx.send(reply);
                    }
                }
            }
            other => {
                warn!(frame = ?other, "unexpected frame on main side");
            }
        }
    }
}

/// Main-side handle to a spawned worker.
///
/// Dispatches are queued until the worker acknowledges `init`; frames to
/// the worker are FIFO, and results come back in request order.
pub struct WorkerHandle {
    config: WorkerConfig,
    to_worker: mpsc::Sender<WorkerFrame>,
    inner: Arc<HandleInner>,
    ready: watch::Receiver<bool>,
    batch: Arc<Mutex<Vec<(Action, oneshot::Sender<WorkerFrame>)>>>,
}

impl WorkerHandle {
    fn send_init(&self, snapshot: Vec<u8>, packs: Vec<String>) {
        let frame = WorkerFrame::Init {
            chronicle: BASE64.encode(snapshot),
            packs,
        };
        let to_worker = self.to_worker.clone();
        tokio::spawn(async move {
            let _ = to_worker.send(frame).await;
        });
    }

    async fn wait_ready(&self) -> Result<()> {
        let mut ready = self.ready.clone();
        ready
            .wait_for(|initialized| *initialized)
            .await
            .map_err(|_| WorkerError::Closed)?;
        Ok(())
    }

    async fn await_reply(
        &self,
        id: u64,
        rx: oneshot::Receiver<WorkerFrame>,
    ) -> Result<WorkerFrame> {
        let frame = match self.config.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(received) => received.map_err(|_| WorkerError::Closed)?,
                Err(_) => {
                    self.inner.pending.lock().remove(&id);
                    return Err(WorkerError::Engine(EngineError::TimedOut(format!(
                        "request {id} expired after {timeout:?}"
                    ))));
                }
            },
            None => rx.await.map_err(|_| WorkerError::Closed)?,
        };
        Ok(frame)
    }

    /// Dispatches an action on the mirror engine.
    ///
    /// With a batching window configured, consecutive dispatches inside
    /// the window coalesce into a single batch frame applied in order.
    pub async fn dispatch(&self, action: Action) -> Result<serde_json::Value> {
        self.wait_ready().await?;
        let (tx, rx) = oneshot::channel();

        let id = match self.config.batch_window {
            Some(window) => self.enqueue_batched(action, tx, window).await?,
            None => {
                let id = self.inner.next_id();
                self.inner.pending.lock().insert(id, Reply::Single(tx));
                self.to_worker
                    .send(WorkerFrame::Dispatch { id, action })
                    .await
                    .map_err(|_| WorkerError::Closed)?;
                id
            }
        };

        match self.await_reply(id, rx).await? {
            WorkerFrame::DispatchOk { result, .. } => Ok(result),
            WorkerFrame::DispatchErr { kind, message, .. } => {
                Err(WorkerError::Engine(EngineError::from_kind(&kind, &message)))
            }
            _ => Err(WorkerError::Closed),
        }
    }

    async fn enqueue_batched(
        &self,
        action: Action,
        tx: oneshot::Sender<WorkerFrame>,
        window: Duration,
    ) -> Result<u64> {
        let flush_needed = {
            let mut batch = self.batch.lock();
            batch.push((action, tx));
            batch.len() == 1
        };

        if flush_needed {
            let inner = self.inner.clone();
            let to_worker = self.to_worker.clone();
            let batch = self.batch.clone();
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                let entries: Vec<(Action, oneshot::Sender<WorkerFrame>)> =
                    std::mem::take(&mut *batch.lock());
                if entries.is_empty() {
                    return;
                }
                let id = inner.next_id();
                let (actions, senders): (Vec<_>, Vec<_>) = entries.into_iter().unzip();
                inner.pending.lock().insert(id, Reply::Batch(senders));
                let _ = to_worker.send(WorkerFrame::Batch { id, actions }).await;
            });
        }
        // Batched requests share the flusher's id; the per-request oneshot
        // is resolved positionally, so the id here is only for timeout
        // bookkeeping (which batched requests do not use individually).
        Ok(0)
    }

    /// Measures a round trip to the worker.
    pub async fn ping(&self) -> Result<Duration> {
        self.wait_ready().await?;
        let id = self.inner.next_id();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(id, Reply::Single(tx));
        let sent_at = now_millis();
        self.to_worker
            .send(WorkerFrame::Ping { id, sent_at })
            .await
            .map_err(|_| WorkerError::Closed)?;

        match self.await_reply(id, rx).await? {
            WorkerFrame::Pong { sent_at, .. } => {
                Ok(Duration::from_millis((now_millis() - sent_at).max(0) as u64))
            }
            _ => Err(WorkerError::Closed),
        }
    }

    /// Fetches the mirror chronicle's current binary save.
    pub async fn snapshot(&self) -> Result<Vec<u8>> {
        self.wait_ready().await?;
        let id = self.inner.next_id();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(id, Reply::Single(tx));
        self.to_worker
            .send(WorkerFrame::Snapshot { id })
            .await
            .map_err(|_| WorkerError::Closed)?;

        match self.await_reply(id, rx).await? {
            WorkerFrame::SnapshotOk { chronicle, .. } => BASE64
                .decode(chronicle)
                .map_err(|_| WorkerError::Closed),
            _ => Err(WorkerError::Closed),
        }
    }

    /// Stops the worker.
    pub async fn shutdown(&self) {
        let _ = self.to_worker.send(WorkerFrame::Shutdown).await;
    }
}
