//! Named-job scheduler with per-job run exclusion.
//!
//! Jobs register under a unique name and fire on a fixed interval or on
//! demand. Each launch gets a strictly increasing per-job run id, and at most
//! one run per job name is in flight at a time; different jobs run
//! concurrently. Registering a name twice keeps the first definition and
//! logs a warning, since job wiring is idempotent at startup.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::runner::{BatchJob, RunId};

/// Scheduler timing configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the timer thread scans for due jobs.
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(250),
        }
    }
}

impl SchedulerConfig {
    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no job registered under the name {0:?}")]
    UnknownJob(String),
    #[error("job {0:?} already has a run in progress")]
    AlreadyRunning(String),
    #[error("failed to spawn run thread: {0}")]
    Spawn(String),
}

/// Lifecycle of a job between runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub enum JobState {
    #[default]
    Idle,
    Running,
}

/// How the most recent run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum RunOutcome {
    Completed,
    Failed,
}

/// Per-job scheduling statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct JobStats {
    pub state: JobState,
    pub runs_started: u64,
    pub runs_completed: u64,
    pub runs_failed: u64,
    pub last_run_id: Option<RunId>,
    pub last_outcome: Option<RunOutcome>,
}

struct JobEntry {
    job: Arc<dyn BatchJob>,
    every: Duration,
    running: AtomicBool,
    last_run_id: AtomicU64,
    next_due: Mutex<Instant>,
    stats: Mutex<JobStats>,
}

/// Registry of named jobs plus the launch machinery.
#[derive(Default)]
pub struct Scheduler {
    jobs: RwLock<HashMap<String, Arc<JobEntry>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job to fire every `every`, with the first run due
    /// immediately. A name collision keeps the existing job.
    pub fn register(&self, every: Duration, job: Arc<dyn BatchJob>) {
        let name = job.name().to_string();
        let mut jobs = self.jobs.write().unwrap();
        if jobs.contains_key(&name) {
            warn!(job = %name, "job already registered, keeping the existing definition");
            return;
        }
        info!(job = %name, every_secs = every.as_secs(), "job registered");
        jobs.insert(
            name,
            Arc::new(JobEntry {
                job,
                every,
                running: AtomicBool::new(false),
                last_run_id: AtomicU64::new(0),
                next_due: Mutex::new(Instant::now()),
                stats: Mutex::new(JobStats::default()),
            }),
        );
    }

    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jobs.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Launch a run right now, outside the schedule.
    pub fn trigger_now(&self, name: &str) -> Result<RunId, SchedulerError> {
        let entry = self
            .jobs
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownJob(name.to_string()))?;
        Self::launch(name, &entry)
    }

    pub fn stats(&self, name: &str) -> Option<JobStats> {
        let entry = self.jobs.read().unwrap().get(name).cloned()?;
        // The running flag is the authority on state; the stored counters
        // only ever lag it by a finished run's bookkeeping.
        let state = if entry.running.load(Ordering::SeqCst) {
            JobState::Running
        } else {
            JobState::Idle
        };
        let mut stats = entry.stats.lock().unwrap().clone();
        stats.state = state;
        Some(stats)
    }

    /// Start the timer thread. The scheduler stays usable for on-demand
    /// triggers through other clones of the `Arc`.
    pub fn spawn(self: Arc<Self>, config: SchedulerConfig) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let join = thread::Builder::new()
            .name("credential-scheduler".to_string())
            .spawn(move || scheduler_loop(self, config, shutdown_rx))
            .expect("failed to spawn scheduler thread");

        SchedulerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }

    /// Entries due at `now`, with their next due time already advanced.
    fn due_entries(&self, now: Instant) -> Vec<(String, Arc<JobEntry>)> {
        let jobs = self.jobs.read().unwrap();
        let mut due = Vec::new();
        for (name, entry) in jobs.iter() {
            if entry.running.load(Ordering::SeqCst) {
                continue;
            }
            let mut next_due = entry.next_due.lock().unwrap();
            if *next_due <= now {
                *next_due = now + entry.every;
                due.push((name.clone(), Arc::clone(entry)));
            }
        }
        due
    }

    fn launch(name: &str, entry: &Arc<JobEntry>) -> Result<RunId, SchedulerError> {
        if entry
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SchedulerError::AlreadyRunning(name.to_string()));
        }

        let run_id = entry.last_run_id.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut stats = entry.stats.lock().unwrap();
            stats.runs_started += 1;
            stats.last_run_id = Some(run_id);
        }

        let job_name = name.to_string();
        let entry_for_run = Arc::clone(entry);
        // Run threads are detached: a shutdown stops the timer but lets
        // in-flight runs finish against the store.
        let spawned = thread::Builder::new()
            .name(format!("{job_name}-run"))
            .spawn(move || {
                let result = entry_for_run.job.execute(run_id);
                let mut stats = entry_for_run.stats.lock().unwrap();
                match result {
                    Ok(_) => {
                        stats.runs_completed += 1;
                        stats.last_outcome = Some(RunOutcome::Completed);
                    }
                    Err(err) => {
                        error!(job = %job_name, run_id, error = %err, "run failed");
                        stats.runs_failed += 1;
                        stats.last_outcome = Some(RunOutcome::Failed);
                    }
                }
                // Counters settle before the job is declared idle again.
                drop(stats);
                entry_for_run.running.store(false, Ordering::SeqCst);
            });

        match spawned {
            Ok(_) => Ok(run_id),
            Err(e) => {
                let mut stats = entry.stats.lock().unwrap();
                stats.runs_failed += 1;
                stats.last_outcome = Some(RunOutcome::Failed);
                drop(stats);
                entry.running.store(false, Ordering::SeqCst);
                Err(SchedulerError::Spawn(e.to_string()))
            }
        }
    }
}

/// Handle to the timer thread.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Stop the timer and wait for it to exit. In-flight runs are not
    /// interrupted.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

fn scheduler_loop(
    scheduler: Arc<Scheduler>,
    config: SchedulerConfig,
    shutdown_rx: mpsc::Receiver<()>,
) {
    info!("scheduler started");

    loop {
        match shutdown_rx.recv_timeout(config.tick_interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        for (name, entry) in scheduler.due_entries(Instant::now()) {
            match Scheduler::launch(&name, &entry) {
                Ok(run_id) => debug!(job = %name, run_id, "scheduled run launched"),
                Err(SchedulerError::AlreadyRunning(_)) => {
                    debug!(job = %name, "previous run still in flight, skipping tick");
                }
                Err(e) => warn!(job = %name, error = %e, "failed to launch scheduled run"),
            }
        }
    }

    info!("scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Utc;

    use crate::batch::runner::{JobError, RunReport};

    fn report(job: &str, run_id: RunId) -> RunReport {
        let now = Utc::now();
        RunReport {
            run_id,
            job: job.to_string(),
            started_at: now,
            finished_at: now,
            chunks: 0,
            fetched: 0,
            written: 0,
            failed: 0,
            skipped: 0,
        }
    }

    struct CountingJob {
        name: String,
        runs: Mutex<Vec<RunId>>,
        done_tx: Mutex<mpsc::Sender<RunId>>,
    }

    impl CountingJob {
        fn new(name: &str) -> (Arc<Self>, mpsc::Receiver<RunId>) {
            let (done_tx, done_rx) = mpsc::channel();
            let job = Arc::new(Self {
                name: name.to_string(),
                runs: Mutex::new(Vec::new()),
                done_tx: Mutex::new(done_tx),
            });
            (job, done_rx)
        }
    }

    impl BatchJob for CountingJob {
        fn name(&self) -> &str {
            &self.name
        }

        fn execute(&self, run_id: RunId) -> Result<RunReport, JobError> {
            self.runs.lock().unwrap().push(run_id);
            let _ = self.done_tx.lock().unwrap().send(run_id);
            Ok(report(&self.name, run_id))
        }
    }

    struct BlockingJob {
        name: String,
        started_tx: Mutex<mpsc::Sender<RunId>>,
        gate_rx: Mutex<mpsc::Receiver<()>>,
    }

    impl BlockingJob {
        fn new(name: &str) -> (Arc<Self>, mpsc::Receiver<RunId>, mpsc::Sender<()>) {
            let (started_tx, started_rx) = mpsc::channel();
            let (gate_tx, gate_rx) = mpsc::channel();
            let job = Arc::new(Self {
                name: name.to_string(),
                started_tx: Mutex::new(started_tx),
                gate_rx: Mutex::new(gate_rx),
            });
            (job, started_rx, gate_tx)
        }
    }

    impl BatchJob for BlockingJob {
        fn name(&self) -> &str {
            &self.name
        }

        fn execute(&self, run_id: RunId) -> Result<RunReport, JobError> {
            let _ = self.started_tx.lock().unwrap().send(run_id);
            let gate = self.gate_rx.lock().unwrap();
            let _ = gate.recv_timeout(Duration::from_secs(5));
            Ok(report(&self.name, run_id))
        }
    }

    struct FailingJob {
        name: String,
    }

    impl BatchJob for FailingJob {
        fn name(&self) -> &str {
            &self.name
        }

        fn execute(&self, _run_id: RunId) -> Result<RunReport, JobError> {
            Err(JobError::TaskLost)
        }
    }

    fn wait_until_idle(scheduler: &Scheduler, name: &str) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(stats) = scheduler.stats(name) {
                if stats.state == JobState::Idle {
                    return;
                }
            }
            assert!(Instant::now() < deadline, "job {name} never went idle");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn trigger_now_assigns_monotonic_run_ids() {
        let scheduler = Scheduler::new();
        let (job, done_rx) = CountingJob::new("drain");
        scheduler.register(Duration::from_secs(3600), job.clone());

        for expected in 1..=3u64 {
            let run_id = scheduler.trigger_now("drain").unwrap();
            assert_eq!(run_id, expected);
            assert_eq!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap(), expected);
            wait_until_idle(&scheduler, "drain");
        }

        assert_eq!(*job.runs.lock().unwrap(), vec![1, 2, 3]);
        let stats = scheduler.stats("drain").unwrap();
        assert_eq!(stats.runs_started, 3);
        assert_eq!(stats.runs_completed, 3);
        assert_eq!(stats.last_outcome, Some(RunOutcome::Completed));
    }

    #[test]
    fn duplicate_registration_keeps_the_first_job() {
        let scheduler = Scheduler::new();
        let (first, done_rx) = CountingJob::new("dup");
        let (second, _second_rx) = CountingJob::new("dup");
        scheduler.register(Duration::from_secs(3600), first.clone());
        scheduler.register(Duration::from_secs(3600), second.clone());

        scheduler.trigger_now("dup").unwrap();
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        wait_until_idle(&scheduler, "dup");

        assert_eq!(first.runs.lock().unwrap().len(), 1);
        assert!(second.runs.lock().unwrap().is_empty());
    }

    #[test]
    fn unknown_job_is_rejected() {
        let scheduler = Scheduler::new();
        assert!(matches!(
            scheduler.trigger_now("missing"),
            Err(SchedulerError::UnknownJob(_))
        ));
    }

    #[test]
    fn concurrent_runs_of_one_job_are_rejected() {
        let scheduler = Scheduler::new();
        let (job, started_rx, gate_tx) = BlockingJob::new("slow");
        scheduler.register(Duration::from_secs(3600), job);

        let first = scheduler.trigger_now("slow").unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert!(matches!(
            scheduler.trigger_now("slow"),
            Err(SchedulerError::AlreadyRunning(_))
        ));

        gate_tx.send(()).unwrap();
        wait_until_idle(&scheduler, "slow");

        let second = scheduler.trigger_now("slow").unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        gate_tx.send(()).unwrap();
        wait_until_idle(&scheduler, "slow");
    }

    #[test]
    fn different_jobs_run_concurrently() {
        let scheduler = Scheduler::new();
        let (job_a, started_a, gate_a) = BlockingJob::new("job-a");
        let (job_b, started_b, gate_b) = BlockingJob::new("job-b");
        scheduler.register(Duration::from_secs(3600), job_a);
        scheduler.register(Duration::from_secs(3600), job_b);

        scheduler.trigger_now("job-a").unwrap();
        scheduler.trigger_now("job-b").unwrap();

        // Both runs report started while neither gate has opened.
        started_a.recv_timeout(Duration::from_secs(5)).unwrap();
        started_b.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(scheduler.stats("job-a").unwrap().state, JobState::Running);
        assert_eq!(scheduler.stats("job-b").unwrap().state, JobState::Running);

        gate_a.send(()).unwrap();
        gate_b.send(()).unwrap();
        wait_until_idle(&scheduler, "job-a");
        wait_until_idle(&scheduler, "job-b");
    }

    #[test]
    fn timer_fires_registered_jobs_repeatedly() {
        let scheduler = Arc::new(Scheduler::new());
        let (job, done_rx) = CountingJob::new("periodic");
        scheduler.register(Duration::from_millis(15), job.clone());

        let handle = Arc::clone(&scheduler)
            .spawn(SchedulerConfig::default().with_tick_interval(Duration::from_millis(5)));

        let first = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.shutdown();

        assert!(second > first);
        assert!(job.runs.lock().unwrap().len() >= 2);
    }

    #[test]
    fn failed_runs_are_counted_and_surfaced() {
        let scheduler = Scheduler::new();
        scheduler.register(
            Duration::from_secs(3600),
            Arc::new(FailingJob {
                name: "broken".to_string(),
            }),
        );

        scheduler.trigger_now("broken").unwrap();
        wait_until_idle(&scheduler, "broken");

        let stats = scheduler.stats("broken").unwrap();
        assert_eq!(stats.runs_started, 1);
        assert_eq!(stats.runs_failed, 1);
        assert_eq!(stats.runs_completed, 0);
        assert_eq!(stats.last_outcome, Some(RunOutcome::Failed));
    }
}
