//! Orchestration dispatcher
//!
//! Runs turn jobs off the request path. Jobs are grouped into lanes by
//! (entity, conversation): a lane is owned by one worker at a time and
//! drained in submission order, while different lanes run in parallel.
//! Workers pull ready lanes from a shared queue.

use crate::config::DispatcherConfig;
use crate::error::{ChorusError, Result};
use crate::orchestration::job::{FailureReason, JobHandle, JobKey, TurnJob, TurnReport, TurnState};
use crate::orchestration::turn::TurnExecutor;
use crate::types::CooldownKey;
use lru::LruCache;
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct QueuedJob {
    job: TurnJob,
    reply: oneshot::Sender<TurnReport>,
}

/// State shared between the submit side and the workers
struct Lanes<E: ?Sized> {
    executor: Arc<E>,
    /// A key is present while its lane is queued or being drained
    pending: Mutex<HashMap<CooldownKey, VecDeque<QueuedJob>>>,
    queued: AtomicUsize,
    active: AtomicUsize,
}

impl<E> Lanes<E>
where
    E: TurnExecutor + ?Sized,
{
    fn pop(&self, lane: &CooldownKey) -> Option<QueuedJob> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let next = pending.get_mut(lane).and_then(VecDeque::pop_front);
        if next.is_none() {
            pending.remove(lane);
        }
        next
    }

    async fn drain(&self, lane: CooldownKey) {
        while let Some(queued) = self.pop(&lane) {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            self.active.fetch_add(1, Ordering::SeqCst);

            let executor = self.executor.clone();
            let job = queued.job.clone();
            let result = tokio::spawn(async move { executor.execute(job).await }).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            let report = result.unwrap_or_else(|e| {
                warn!(job = %queued.job.key(), error = %e, "Turn task aborted");
                TurnReport::new(
                    &queued.job,
                    TurnState::Failed(FailureReason::Internal(format!("turn task aborted: {}", e))),
                )
            });
            if queued.reply.send(report).is_err() {
                debug!(job = %queued.job.key(), "Job handle dropped before completion");
            }
        }
    }
}

pub struct Dispatcher<E: ?Sized> {
    lanes: Arc<Lanes<E>>,
    ready: Mutex<Option<mpsc::UnboundedSender<CooldownKey>>>,
    seen: Mutex<LruCache<JobKey, ()>>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl<E> Dispatcher<E>
where
    E: TurnExecutor + ?Sized,
{
    /// Start the worker pool; must be called inside a tokio runtime
    pub fn new(executor: Arc<E>, config: &DispatcherConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let lanes = Arc::new(Lanes {
            executor,
            pending: Mutex::new(HashMap::new()),
            queued: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
        });

        let worker_count = config.workers.max(1);
        let workers = (0..worker_count)
            .map(|worker| {
                let rx = rx.clone();
                let lanes = lanes.clone();
                tokio::spawn(async move {
                    loop {
                        let next = {
                            let mut rx = rx.lock().await;
                            rx.recv().await
                        };
                        match next {
                            Some(lane) => lanes.drain(lane).await,
                            None => break,
                        }
                    }
                    debug!(worker, "Dispatcher worker stopped");
                })
            })
            .collect();

        let capacity = NonZeroUsize::new(config.idempotency_capacity).unwrap_or(NonZeroUsize::MIN);
        info!(workers = worker_count, "Dispatcher started");

        Self {
            lanes,
            ready: Mutex::new(Some(tx)),
            seen: Mutex::new(LruCache::new(capacity)),
            workers: tokio::sync::Mutex::new(workers),
        }
    }

    /// Queue a job; never waits for it to run
    ///
    /// A job whose (message, entity) key was already seen is rejected with
    /// `DuplicateJob`.
    pub fn submit(&self, job: TurnJob) -> Result<JobHandle> {
        let key = job.key();
        let ready = self.ready.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = ready.as_ref() else {
            return Err(ChorusError::DispatcherClosed);
        };

        {
            let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
            if seen.contains(&key) {
                debug!(job = %key, "Dropping redelivered job");
                return Err(ChorusError::DuplicateJob(key.to_string()));
            }
            seen.put(key, ());
        }

        let lane = job.lane_key();
        let (reply, rx) = oneshot::channel();
        let mut pending = self.lanes.pending.lock().unwrap_or_else(|e| e.into_inner());
        self.lanes.queued.fetch_add(1, Ordering::SeqCst);
        match pending.get_mut(&lane) {
            Some(queue) => queue.push_back(QueuedJob { job, reply }),
            None => {
                pending.insert(lane, VecDeque::from([QueuedJob { job, reply }]));
                if tx.send(lane).is_err() {
                    pending.remove(&lane);
                    self.lanes.queued.fetch_sub(1, Ordering::SeqCst);
                    return Err(ChorusError::DispatcherClosed);
                }
            }
        }
        debug!(job = %key, lane = %lane, "Job queued");

        Ok(JobHandle::new(key, rx))
    }

    pub fn is_closed(&self) -> bool {
        self.ready.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }

    /// Jobs waiting in a lane
    pub fn queue_depth(&self) -> usize {
        self.lanes.queued.load(Ordering::SeqCst)
    }

    /// Jobs currently executing
    pub fn active_jobs(&self) -> usize {
        self.lanes.active.load(Ordering::SeqCst)
    }

    /// Stop accepting jobs, let workers drain every queued lane, then join them
    pub async fn shutdown(&self) {
        let tx = self.ready.lock().unwrap_or_else(|e| e.into_inner()).take();
        if tx.is_none() {
            return;
        }
        drop(tx);

        let workers: Vec<_> = self.workers.lock().await.drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Dispatcher worker ended abnormally");
            }
        }
        info!("Dispatcher shut down");
    }
}
