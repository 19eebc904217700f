//! Scheduler and worker pool: drives one workflow per job through the
//! fixed activity sequence.
//!
//! Jobs are admitted FIFO into a bounded queue feeding a fixed set of
//! worker tasks. A periodic sweep re-enqueues any non-terminal job that is
//! not currently in flight, which doubles as crash recovery at startup and
//! as back-pressure drain when the queue was full at submit time.
//! Workflows resume from the first activity without a completion marker,
//! so re-running a partially finished job never repeats durable effects.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::{Job, JobStatus, ProgressEvent};
use crate::error::{ActivityError, ErrorKind};
use crate::store::Store;
use crate::workflow::activity::{Activity, ActivityContext, Collaborators, HeartbeatHandle};

/// Why a supervised attempt was interrupted.
enum Interrupt {
    Cancelled,
    HeartbeatLost,
}

type InFlight = Arc<Mutex<HashSet<i64>>>;

/// The workflow scheduler. Owns the worker pool and the sweep task.
pub struct Scheduler {
    collab: Arc<Collaborators>,
    queue_tx: mpsc::Sender<i64>,
    in_flight: InFlight,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawn the worker pool and sweeper.
    pub fn new(collab: Arc<Collaborators>) -> Self {
        let workers = collab.config.worker_pool_size;
        let (queue_tx, queue_rx) = mpsc::channel::<i64>(workers * 2);
        let queue_rx = Arc::new(AsyncMutex::new(queue_rx));
        let in_flight: InFlight = Arc::new(Mutex::new(HashSet::new()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut tasks = Vec::with_capacity(workers + 1);
        for worker_id in 0..workers {
            let queue_rx = Arc::clone(&queue_rx);
            let collab = Arc::clone(&collab);
            let in_flight = Arc::clone(&in_flight);
            let shutdown_rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(worker_loop(
                worker_id,
                queue_rx,
                collab,
                in_flight,
                shutdown_rx,
            )));
        }

        tasks.push(tokio::spawn(sweeper_loop(
            Arc::clone(&collab),
            queue_tx.clone(),
            Arc::clone(&in_flight),
            shutdown_rx,
        )));

        info!(workers, "scheduler started");
        Self {
            collab,
            queue_tx,
            in_flight,
            shutdown_tx,
            tasks,
        }
    }

    /// Admit a job into the worker pool. If the queue is full the job stays
    /// `pending` and the sweeper picks it up once a slot frees.
    pub fn start(&self, job_id: i64) {
        if !try_enqueue(&self.in_flight, &self.queue_tx, job_id) {
            debug!(job_id, "queue full, job waits for the sweeper");
        }
    }

    /// Enqueue every non-terminal job found in the store. Called once at
    /// startup to resume work interrupted by a crash; returns how many jobs
    /// were queued.
    pub fn recover(&self) -> Result<usize, crate::store::StoreError> {
        let jobs = self.collab.store.list_resumable_jobs()?;
        let mut queued = 0;
        for job in &jobs {
            if try_enqueue(&self.in_flight, &self.queue_tx, job.id) {
                queued += 1;
            }
        }
        if queued > 0 {
            info!(queued, "recovered non-terminal jobs");
        }
        Ok(queued)
    }

    /// Request cooperative cancellation. The running activity observes the
    /// flag on its next heartbeat tick; queued jobs fail at pickup.
    pub fn cancel(&self, job_id: i64) -> Result<(), crate::store::StoreError> {
        self.collab.store.request_cancel(job_id)
    }

    /// Stop accepting work and wait for workers to finish their current
    /// attempt boundaries.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        drop(self.queue_tx);
        for task in self.tasks {
            let _ = task.await;
        }
        info!("scheduler stopped");
    }
}

/// Reserve the job in the in-flight set, then queue it. Reservation first
/// keeps a concurrent sweep from double-queuing the same job.
fn try_enqueue(in_flight: &InFlight, queue_tx: &mpsc::Sender<i64>, job_id: i64) -> bool {
    let mut set = in_flight.lock().unwrap();
    if set.contains(&job_id) {
        return false;
    }
    match queue_tx.try_send(job_id) {
        Ok(()) => {
            set.insert(job_id);
            true
        }
        Err(_) => false,
    }
}

async fn worker_loop(
    worker_id: usize,
    queue_rx: Arc<AsyncMutex<mpsc::Receiver<i64>>>,
    collab: Arc<Collaborators>,
    in_flight: InFlight,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!(worker_id, "worker started");
    loop {
        let job_id = {
            let mut rx = queue_rx.lock().await;
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(job_id) => job_id,
                    None => break,
                },
                _ = shutdown_rx.changed() => break,
            }
        };

        run_workflow(&collab, job_id).await;
        in_flight.lock().unwrap().remove(&job_id);
    }
    debug!(worker_id, "worker stopped");
}

async fn sweeper_loop(
    collab: Arc<Collaborators>,
    queue_tx: mpsc::Sender<i64>,
    in_flight: InFlight,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let period = Duration::from_secs(collab.config.sweep_interval_seconds.max(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown_rx.changed() => break,
        }
        match collab.store.list_resumable_jobs() {
            Ok(jobs) => {
                for job in jobs {
                    try_enqueue(&in_flight, &queue_tx, job.id);
                }
            }
            Err(e) => warn!(error = %e, "sweep failed"),
        }
    }
}

/// Drive one job through the activity sequence.
async fn run_workflow(collab: &Arc<Collaborators>, job_id: i64) {
    let store = &collab.store;
    let job = match store.get_job(job_id) {
        Ok(job) => job,
        Err(e) => {
            warn!(job_id, error = %e, "job disappeared before execution");
            return;
        }
    };
    if job.status.is_terminal() {
        return;
    }
    let run_id = Job::workflow_run_id(job_id);
    info!(job_id, %run_id, "workflow starting");

    if cancel_requested(store, job_id) {
        fail_job(collab, job_id, &ActivityError::cancelled());
        return;
    }
    if job.status == JobStatus::Pending {
        if let Err(e) = store.update_status(job_id, JobStatus::Processing, None) {
            error!(job_id, error = %e, "could not mark job processing");
            return;
        }
    }
    collab.bus.publish(
        job_id,
        ProgressEvent::milestone(job_id, JobStatus::Processing, 0),
    );

    for activity in Activity::ALL {
        if cancel_requested(store, job_id) {
            fail_job(collab, job_id, &ActivityError::cancelled());
            return;
        }

        match store.is_activity_complete(&run_id, activity.name()) {
            Ok(true) => {
                debug!(job_id, activity = activity.name(), "already complete, skipping");
            }
            Ok(false) => {
                if let Err(e) = execute_with_retry(collab, &run_id, job_id, activity).await {
                    fail_job(collab, job_id, &e);
                    return;
                }
            }
            Err(e) => {
                fail_job(collab, job_id, &e.into());
                return;
            }
        }

        if activity != Activity::Embed {
            collab.bus.publish(
                job_id,
                ProgressEvent::milestone(job_id, JobStatus::Processing, activity.milestone_pct()),
            );
        }
    }

    match store.update_status(job_id, JobStatus::Completed, None) {
        Ok(()) => {
            collab.bus.publish(
                job_id,
                ProgressEvent::milestone(job_id, JobStatus::Completed, 100),
            );
            info!(job_id, "workflow completed");
        }
        Err(e) => error!(job_id, error = %e, "could not mark job completed"),
    }
}

fn cancel_requested(store: &Store, job_id: i64) -> bool {
    store.is_cancel_requested(job_id).unwrap_or(false)
}

/// Terminal failure: record the error and emit exactly one `failed` event.
fn fail_job(collab: &Arc<Collaborators>, job_id: i64, error: &ActivityError) {
    error!(job_id, error = %error, "workflow failed");
    if let Err(e) = collab
        .store
        .update_status(job_id, JobStatus::Failed, Some(&error.message))
    {
        error!(job_id, error = %e, "could not mark job failed");
    }
    collab
        .bus
        .publish(job_id, ProgressEvent::failed(job_id, error.message.clone()));
}

/// Run an activity with the retry policy, classifying failures by kind.
async fn execute_with_retry(
    collab: &Arc<Collaborators>,
    run_id: &str,
    job_id: i64,
    activity: Activity,
) -> Result<(), ActivityError> {
    let policy = activity.policy();
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let started = Instant::now();
        let result = run_attempt(collab, run_id, job_id, activity).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(payload) => {
                info!(
                    job_id,
                    activity = activity.name(),
                    attempt,
                    elapsed_ms,
                    %payload,
                    "activity completed"
                );
                return Ok(());
            }
            Err(e) if e.kind == ErrorKind::Cancelled => return Err(e),
            Err(e) if e.is_retriable() && policy.should_retry(attempt) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    job_id,
                    activity = activity.name(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "activity failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                error!(
                    job_id,
                    activity = activity.name(),
                    attempt,
                    error = %e,
                    "activity failed permanently"
                );
                return Err(e);
            }
        }
    }
}

/// One supervised attempt: the activity races against cancellation, the
/// heartbeat watchdog and the start-to-close budget. A pacemaker beats on
/// the activity's behalf every heartbeat interval so long externally-bound
/// awaits stay alive.
async fn run_attempt(
    collab: &Arc<Collaborators>,
    run_id: &str,
    job_id: i64,
    activity: Activity,
) -> Result<serde_json::Value, ActivityError> {
    let policy = activity.policy();
    let interval = Duration::from_secs(collab.config.heartbeat_interval_seconds);

    let (beat_tx, beat_rx) = mpsc::channel::<()>(16);
    let heartbeat = HeartbeatHandle::new(beat_tx, Arc::clone(&collab.bus), job_id);
    let ctx = ActivityContext {
        collab: Arc::clone(collab),
        run_id: run_id.to_string(),
        job_id,
        heartbeat: heartbeat.clone(),
    };

    let pacemaker = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            heartbeat.beat();
        }
    });

    let result = tokio::select! {
        result = activity.execute(&ctx) => result,
        interrupt = supervise(Arc::clone(&collab.store), job_id, interval, policy.heartbeat_timeout, beat_rx) => {
            match interrupt {
                Interrupt::Cancelled => Err(ActivityError::cancelled()),
                Interrupt::HeartbeatLost => Err(ActivityError::transient(format!(
                    "no heartbeat within {:?}",
                    policy.heartbeat_timeout
                ))),
            }
        }
        _ = tokio::time::sleep(policy.start_to_close) => {
            Err(ActivityError::transient(format!(
                "start-to-close timeout after {:?}",
                policy.start_to_close
            )))
        }
    };
    pacemaker.abort();
    result
}

/// Watch an attempt from the outside: fail it when the cancel flag is set
/// or when no heartbeat arrives within the timeout.
async fn supervise(
    store: Arc<Store>,
    job_id: i64,
    interval: Duration,
    heartbeat_timeout: Duration,
    mut beats: mpsc::Receiver<()>,
) -> Interrupt {
    let mut last_beat = Instant::now();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;
    let mut beats_open = true;

    loop {
        if beats_open {
            tokio::select! {
                _ = ticker.tick() => {
                    if store.is_cancel_requested(job_id).unwrap_or(false) {
                        return Interrupt::Cancelled;
                    }
                    if last_beat.elapsed() >= heartbeat_timeout {
                        return Interrupt::HeartbeatLost;
                    }
                }
                maybe = beats.recv() => match maybe {
                    Some(()) => last_beat = Instant::now(),
                    None => beats_open = false,
                },
            }
        } else {
            ticker.tick().await;
            if store.is_cancel_requested(job_id).unwrap_or(false) {
                return Interrupt::Cancelled;
            }
            if last_beat.elapsed() >= heartbeat_timeout {
                return Interrupt::HeartbeatLost;
            }
        }
    }
}
