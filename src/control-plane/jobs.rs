use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use log::{error, info, warn};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use arkctrl::schema::{ErrorBody, ErrorKind, Job, JobStatus, JobType, PushMessage};

use crate::consts::{JOB_PURGE_INTERVAL, JOB_TTL, JOB_WORKERS};
use crate::db::{JobPatch, Store};
use crate::error::{Error, Result};
use crate::events::{broker::EventBroker, Channel, Event};
use crate::lock::UpdateLock;

/// Handle given to job handlers: progress reporting and cooperative
/// cancellation checkpoints.
pub struct JobContext {
    pub id: Uuid,
    store: Arc<Store>,
    broker: Arc<EventBroker>,
    cancel: CancellationToken,
    high_water: AtomicU8,
}

impl JobContext {
    /// Records progress. Monotone within a job: a lower value than the
    /// current high-water mark is lifted to it.
    pub fn progress(&self, pct: u8, message: impl Into<String>) {
        let pct = pct.min(100);
        let previous = self.high_water.fetch_max(pct, Ordering::SeqCst);
        let pct = pct.max(previous);
        let message = message.into();
        if let Err(e) = self.store.update_job(
            self.id,
            JobPatch {
                progress: Some(pct),
                message: Some(message.clone()),
                ..Default::default()
            },
        ) {
            warn!("failed to persist job progress: {:?}", e);
        }
        broadcast(&self.broker, self.id, JobStatus::Running, pct, &message);
    }

    /// Attaches a partial result to the job. Survives a later failure, which
    /// is how handlers record the checkpoint they died at.
    pub fn set_result(&self, result: serde_json::Value) {
        if let Err(e) = self.store.update_job(
            self.id,
            JobPatch {
                result: Some(result),
                ..Default::default()
            },
        ) {
            warn!("failed to persist job result: {:?}", e);
        }
    }

    /// Cancellation checkpoint. Handlers call this between units of work.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

pub type JobHandler =
    Arc<dyn Fn(Job, Arc<JobContext>) -> BoxFuture<'static, Result<serde_json::Value>> + Send + Sync>;

/// Executes long operations on a bounded worker pool, broadcasting progress
/// and persisting terminal state. Exclusive jobs serialize on the update
/// lock in FIFO order.
pub struct JobEngine {
    store: Arc<Store>,
    broker: Arc<EventBroker>,
    lock: Arc<UpdateLock>,
    handler: JobHandler,
    queue_tx: mpsc::Sender<Uuid>,
    tokens: Arc<RwLock<HashMap<Uuid, CancellationToken>>>,
}

impl JobEngine {
    const QUEUE_DEPTH: usize = 64;

    pub fn new(
        store: Arc<Store>,
        broker: Arc<EventBroker>,
        lock: Arc<UpdateLock>,
        handler: JobHandler,
    ) -> Arc<JobEngine> {
        let (queue_tx, queue_rx) = mpsc::channel(JobEngine::QUEUE_DEPTH);
        let engine = Arc::new(JobEngine {
            store,
            broker,
            lock,
            handler,
            queue_tx,
            tokens: Arc::new(RwLock::new(HashMap::new())),
        });

        let queue_rx = Arc::new(Mutex::new(queue_rx));
        for worker in 0..JOB_WORKERS {
            let engine = Arc::clone(&engine);
            let queue_rx = Arc::clone(&queue_rx);
            tokio::spawn(async move {
                loop {
                    let next = { queue_rx.lock().await.recv().await };
                    match next {
                        Some(id) => engine.run_one(id).await,
                        None => break,
                    }
                }
                info!("job worker {} exiting", worker);
            });
        }

        let purge_engine = Arc::clone(&engine);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(JOB_PURGE_INTERVAL).await;
                let cutoff = Utc::now() - chrono::Duration::from_std(JOB_TTL).unwrap();
                match purge_engine.store.purge_terminal_jobs_before(cutoff) {
                    Ok(0) => {}
                    Ok(purged) => info!("purged {} expired jobs", purged),
                    Err(e) => warn!("job purge failed: {:?}", e),
                }
            }
        });

        engine
    }

    pub async fn submit(&self, job_type: JobType, data: serde_json::Value) -> Result<Uuid> {
        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            job_type,
            status: JobStatus::Pending,
            progress: 0,
            message: String::new(),
            created_at: now,
            updated_at: now,
            data,
            result: None,
            error: None,
        };
        self.store.create_job(&job)?;
        self.tokens
            .write()
            .await
            .insert(job.id, CancellationToken::new());

        broadcast(&self.broker, job.id, JobStatus::Pending, 0, "queued");
        self.queue_tx
            .send(job.id)
            .await
            .map_err(|_| Error::Internal("job queue is closed".to_owned()))?;
        info!("queued {} job {}", job_type, job.id);
        Ok(job.id)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<Job>> {
        self.store.get_job(id)
    }

    pub fn list(&self) -> Result<Vec<Job>> {
        self.store.list_jobs()
    }

    /// Sets the abort signal. Pending jobs terminate immediately; running
    /// handlers observe the signal at their next checkpoint.
    pub async fn cancel(&self, id: Uuid) -> Result<()> {
        let job = self
            .store
            .get_job(id)?
            .ok_or_else(|| Error::NotFound(format!("job {}", id)))?;
        if job.status.is_terminal() {
            return Err(Error::Precondition(format!(
                "job {} is already {}",
                id, job.status
            )));
        }

        if let Some(token) = self.tokens.read().await.get(&id) {
            token.cancel();
        }

        if job.status == JobStatus::Pending {
            self.store.update_job(
                id,
                JobPatch {
                    status: Some(JobStatus::Cancelled),
                    message: Some("cancelled before start".to_owned()),
                    ..Default::default()
                },
            )?;
            broadcast(
                &self.broker,
                id,
                JobStatus::Cancelled,
                job.progress,
                "cancelled before start",
            );
        }
        Ok(())
    }

    async fn run_one(&self, id: Uuid) {
        let job = match self.store.get_job(id) {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(e) => {
                error!("failed to load job {}: {:?}", id, e);
                return;
            }
        };
        // cancelled while queued
        if job.status.is_terminal() {
            self.tokens.write().await.remove(&id);
            return;
        }

        let token = self
            .tokens
            .read()
            .await
            .get(&id)
            .cloned()
            .unwrap_or_default();

        // Exclusive jobs take the update lock before they count as running,
        // so a queued second install stays pending until the first ends.
        let lock_label = format!("{} job {}", job.job_type, id);
        let _guard = if job.job_type.is_exclusive() {
            tokio::select! {
                guard = self.lock.acquire(&lock_label) => Some(guard),
                _ = token.cancelled() => {
                    self.finish(id, JobStatus::Cancelled, job.progress, "cancelled", None, None);
                    self.tokens.write().await.remove(&id);
                    return;
                }
            }
        } else {
            None
        };

        if let Err(e) = self.store.update_job(
            id,
            JobPatch {
                status: Some(JobStatus::Running),
                message: Some("running".to_owned()),
                ..Default::default()
            },
        ) {
            error!("failed to mark job {} running: {:?}", id, e);
        }
        broadcast(&self.broker, id, JobStatus::Running, job.progress, "running");

        let context = Arc::new(JobContext {
            id,
            store: Arc::clone(&self.store),
            broker: Arc::clone(&self.broker),
            cancel: token.clone(),
            high_water: AtomicU8::new(job.progress),
        });

        // Run the handler in its own task so a panic is contained and the
        // worker keeps draining the queue.
        let handler = Arc::clone(&self.handler);
        let handle = tokio::spawn((handler)(job.clone(), Arc::clone(&context)));

        let outcome = handle.await;
        let progress = context.high_water.load(Ordering::SeqCst);
        match outcome {
            Ok(Ok(result)) => {
                self.finish(id, JobStatus::Succeeded, 100, "done", Some(result), None);
            }
            Ok(Err(Error::Cancelled)) => {
                self.finish(id, JobStatus::Cancelled, progress, "cancelled", None, None);
            }
            Ok(Err(e)) => {
                let body = e.to_body();
                let message = body.message.clone();
                self.finish(id, JobStatus::Failed, progress, &message, None, Some(body));
            }
            Err(join_error) => {
                let message = if join_error.is_panic() {
                    format!("job handler panicked: {:?}", join_error)
                } else {
                    "job handler aborted".to_owned()
                };
                error!("{}", message);
                let body = ErrorBody {
                    kind: ErrorKind::Internal,
                    message: message.clone(),
                    retryable: false,
                    cause: None,
                };
                self.finish(id, JobStatus::Failed, progress, &message, None, Some(body));
            }
        }

        self.tokens.write().await.remove(&id);
    }

    fn finish(
        &self,
        id: Uuid,
        status: JobStatus,
        progress: u8,
        message: &str,
        result: Option<serde_json::Value>,
        error: Option<ErrorBody>,
    ) {
        if let Err(e) = self.store.update_job(
            id,
            JobPatch {
                status: Some(status),
                progress: Some(progress),
                message: Some(message.to_owned()),
                result,
                error,
            },
        ) {
            warn!("failed to persist terminal state for job {}: {:?}", id, e);
        }
        broadcast(&self.broker, id, status, progress, message);
        info!("job {} finished: {}", id, status);
    }
}

fn broadcast(broker: &EventBroker, id: Uuid, status: JobStatus, progress: u8, message: &str) {
    let timestamp = Utc::now();
    let payload = PushMessage::JobProgress {
        job_id: id,
        status,
        progress,
        message: message.to_owned(),
        timestamp,
    };
    match serde_json::to_string(&payload) {
        Ok(content) => broker.publish(Event {
            channel: Channel::JobProgress,
            key: id.to_string(),
            timestamp,
            content,
        }),
        Err(e) => warn!("failed to serialize job progress: {:?}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::time::Duration;

    struct Fixture {
        engine: Arc<JobEngine>,
        _base: std::path::PathBuf,
    }

    fn fixture(handler: JobHandler) -> Fixture {
        arkctrl::util::testing::logger_init();
        let base = std::env::temp_dir().join(format!("arkctrl-jobs-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&base).unwrap();
        let store = Arc::new(Store::open(base.join("test.db")).unwrap());
        let broker = Arc::new(EventBroker::new());
        let lock = Arc::new(UpdateLock::new(base.join("update.lock")));
        Fixture {
            engine: JobEngine::new(store, broker, lock, handler),
            _base: base,
        }
    }

    async fn wait_for_status(engine: &JobEngine, id: Uuid, status: JobStatus) -> Job {
        for _ in 0..200 {
            if let Some(job) = engine.get(id).unwrap() {
                if job.status == status {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never reached {}", id, status);
    }

    #[tokio::test]
    async fn successful_jobs_record_result_and_full_progress() {
        let f = fixture(Arc::new(|_job, ctx: Arc<JobContext>| {
            Box::pin(async move {
                ctx.progress(50, "halfway");
                Ok(serde_json::json!({"ok": true}))
            })
        }));

        let id = f
            .engine
            .submit(JobType::CreateCluster, serde_json::json!({}))
            .await
            .unwrap();
        let job = wait_for_status(&f.engine, id, JobStatus::Succeeded).await;
        assert_eq!(job.progress, 100);
        assert_eq!(job.result.unwrap()["ok"], true);
    }

    #[tokio::test]
    async fn handler_errors_mark_the_job_failed() {
        let f = fixture(Arc::new(|_job, _ctx| {
            Box::pin(async move { Err(Error::SteamCmdNotFound) })
        }));

        let id = f
            .engine
            .submit(JobType::InstallSteamcmd, serde_json::json!({}))
            .await
            .unwrap();
        let job = wait_for_status(&f.engine, id, JobStatus::Failed).await;
        let error = job.error.unwrap();
        assert_eq!(error.kind, ErrorKind::SteamCmdFailed);
    }

    #[tokio::test]
    async fn handler_panics_are_contained() {
        let f = fixture(Arc::new(|_job, _ctx| {
            Box::pin(async move { panic!("boom") })
        }));

        let id = f
            .engine
            .submit(JobType::CreateCluster, serde_json::json!({}))
            .await
            .unwrap();
        let job = wait_for_status(&f.engine, id, JobStatus::Failed).await;
        assert!(job.error.unwrap().message.contains("panicked"));

        // the pool keeps working after a panic
        let id2 = f
            .engine
            .submit(JobType::CreateCluster, serde_json::json!({}))
            .await
            .unwrap();
        wait_for_status(&f.engine, id2, JobStatus::Failed).await;
    }

    #[tokio::test]
    async fn running_jobs_cancel_at_checkpoints() {
        let f = fixture(Arc::new(|_job, ctx: Arc<JobContext>| {
            Box::pin(async move {
                loop {
                    ctx.check_cancelled()?;
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
        }));

        let id = f
            .engine
            .submit(JobType::CreateCluster, serde_json::json!({}))
            .await
            .unwrap();
        wait_for_status(&f.engine, id, JobStatus::Running).await;
        f.engine.cancel(id).await.unwrap();
        wait_for_status(&f.engine, id, JobStatus::Cancelled).await;
    }

    #[tokio::test]
    async fn exclusive_jobs_never_overlap() {
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let running_clone = Arc::clone(&running);
        let max_clone = Arc::clone(&max_seen);

        let f = fixture(Arc::new(move |_job, _ctx| {
            let running = Arc::clone(&running_clone);
            let max_seen = Arc::clone(&max_clone);
            Box::pin(async move {
                let now = running.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                max_seen.fetch_max(now, AtomicOrdering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                running.fetch_sub(1, AtomicOrdering::SeqCst);
                Ok(serde_json::Value::Null)
            })
        }));

        let first = f
            .engine
            .submit(JobType::InstallAsaBinaries, serde_json::json!({}))
            .await
            .unwrap();
        let second = f
            .engine
            .submit(JobType::InstallAsaBinaries, serde_json::json!({}))
            .await
            .unwrap();

        // while the first runs, the second must still be pending
        wait_for_status(&f.engine, first, JobStatus::Running).await;
        let snapshot = f.engine.get(second).unwrap().unwrap();
        assert_eq!(snapshot.status, JobStatus::Pending);

        wait_for_status(&f.engine, first, JobStatus::Succeeded).await;
        wait_for_status(&f.engine, second, JobStatus::Succeeded).await;
        assert_eq!(max_seen.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn progress_is_monotone_within_a_job() {
        let f = fixture(Arc::new(|_job, ctx: Arc<JobContext>| {
            Box::pin(async move {
                ctx.progress(60, "far along");
                ctx.progress(30, "trying to go backwards");
                tokio::time::sleep(Duration::from_millis(50)).await;
                Err(Error::Internal("stop here".to_owned()))
            })
        }));

        let id = f
            .engine
            .submit(JobType::CreateCluster, serde_json::json!({}))
            .await
            .unwrap();
        let job = wait_for_status(&f.engine, id, JobStatus::Failed).await;
        assert_eq!(job.progress, 60);
    }

    #[tokio::test]
    async fn pending_jobs_cancel_immediately() {
        // handler blocks forever so queued jobs stay pending behind it
        let f = fixture(Arc::new(|_job, ctx: Arc<JobContext>| {
            Box::pin(async move {
                loop {
                    ctx.check_cancelled()?;
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
        }));

        // exclusive blocker holds the lock
        let blocker = f
            .engine
            .submit(JobType::InstallAsaBinaries, serde_json::json!({}))
            .await
            .unwrap();
        wait_for_status(&f.engine, blocker, JobStatus::Running).await;

        let queued = f
            .engine
            .submit(JobType::UpdateAll, serde_json::json!({}))
            .await
            .unwrap();
        f.engine.cancel(queued).await.unwrap();
        wait_for_status(&f.engine, queued, JobStatus::Cancelled).await;

        f.engine.cancel(blocker).await.unwrap();
        wait_for_status(&f.engine, blocker, JobStatus::Cancelled).await;
    }
}
