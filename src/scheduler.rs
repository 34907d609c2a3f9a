use crate::error::{ErrorKind, ErrorRecord, FetchError};
use crate::executor::{Executor, Transfer};
use crate::report::{Aggregator, FetchResult, ResultStatus};
use crate::retry::{Decision, RetryPolicy};
use crate::task::FetchTask;
use futures_util::FutureExt;
use log::{debug, info, warn};
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

type Finished = (FetchTask, Result<Transfer, FetchError>, Duration);

struct Queued {
    task: FetchTask,
    ready_at: Option<Instant>,
}

#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub global: usize,
    pub per_host: Option<usize>,
}

/// Admits tasks to the executor under the concurrency limits and routes
/// failures through the retry policy. The limit counters are only touched
/// from the scheduler loop.
pub struct Scheduler {
    executor: Arc<Executor>,
    policy: RetryPolicy,
    limits: Limits,
    aggregator: Arc<Mutex<Aggregator>>,
    cancel: CancellationToken,
    deadline: Option<Instant>,
    in_flight: Arc<AtomicUsize>,
    spawned: HashMap<Id, FetchTask>,
}

impl Scheduler {
    pub fn new(
        executor: Executor,
        policy: RetryPolicy,
        limits: Limits,
        aggregator: Arc<Mutex<Aggregator>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            executor: Arc::new(executor),
            policy,
            limits: Limits {
                global: limits.global.max(1),
                per_host: limits.per_host.map(|l| l.max(1)),
            },
            aggregator,
            cancel,
            deadline: None,
            in_flight: Arc::new(AtomicUsize::new(0)),
            spawned: HashMap::new(),
        }
    }

    /// Cancels the batch once `timeout` has elapsed.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.deadline = timeout.map(|t| Instant::now() + t);
        self
    }

    /// Number of tasks currently in flight, readable from outside.
    pub fn in_flight_gauge(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.in_flight)
    }

    pub async fn run(mut self, tasks: Vec<FetchTask>) {
        let mut pending = tasks
            .into_iter()
            .map(|task| Queued {
                task,
                ready_at: None,
            })
            .collect::<VecDeque<_>>();
        pending.make_contiguous().sort_by_key(|q| q.task.index());

        let mut running: JoinSet<Finished> = JoinSet::new();
        let mut host_load: HashMap<String, usize> = HashMap::new();
        let mut cancel_seen = false;

        info!("Starting batch of {} asset(s)", pending.len());
        loop {
            if !self.cancel.is_cancelled() {
                self.admit(&mut pending, &mut running, &mut host_load);
            }
            if running.is_empty() && (pending.is_empty() || self.cancel.is_cancelled()) {
                break;
            }

            let next_retry = next_wakeup(&pending, Instant::now());
            tokio::select! {
                biased;
                _ = self.cancel.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                    info!("Batch cancelled, draining {} task(s) in flight", running.len());
                }
                Some(joined) = running.join_next_with_id() => match joined {
                    Ok((id, (task, result, elapsed))) => {
                        self.spawned.remove(&id);
                        self.release(task.host(), &mut host_load);
                        self.complete(task, result, elapsed, &mut pending);
                    }
                    Err(e) => self.lost(e, &mut host_load),
                },
                _ = sleep_until_opt(next_retry), if next_retry.is_some() => {}
                _ = sleep_until_opt(self.deadline), if self.deadline.is_some() && !cancel_seen => {
                    warn!("Batch timeout reached");
                    self.cancel.cancel();
                }
            }
        }

        self.finish(pending);
    }

    /// Moves ready tasks into flight in batch order. A task whose host is
    /// saturated is skipped so it does not hold back other hosts.
    fn admit(
        &mut self,
        pending: &mut VecDeque<Queued>,
        running: &mut JoinSet<Finished>,
        host_load: &mut HashMap<String, usize>,
    ) {
        let now = Instant::now();
        let mut i = 0;
        while i < pending.len() && running.len() < self.limits.global {
            let queued = &pending[i];
            let ready = queued.ready_at.map_or(true, |t| t <= now);
            let load = host_load.get(queued.task.host()).copied().unwrap_or(0);
            let host_free = self.limits.per_host.map_or(true, |limit| load < limit);
            if !(ready && host_free) {
                i += 1;
                continue;
            }

            let Some(Queued { mut task, .. }) = pending.remove(i) else {
                break;
            };
            *host_load.entry(task.host().to_string()).or_insert(0) += 1;
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            task.start();
            debug!("Admitted {} (attempt {})", task.key(), task.attempts());

            let executor = Arc::clone(&self.executor);
            let cancel = self.cancel.clone();
            let admitted = task.clone();
            let handle = running.spawn(async move {
                let started = std::time::Instant::now();
                let result = AssertUnwindSafe(executor.fetch(task.descriptor(), &cancel))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        Err(FetchError::io(
                            task.descriptor().destination_path(),
                            std::io::Error::other("transfer panicked"),
                        ))
                    });
                (task, result, started.elapsed())
            });
            self.spawned.insert(handle.id(), admitted);
        }
    }

    fn release(&self, host: &str, host_load: &mut HashMap<String, usize>) {
        if let Some(load) = host_load.get_mut(host) {
            *load = load.saturating_sub(1);
            if *load == 0 {
                host_load.remove(host);
            }
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// A task that could not be joined gives its slot back and is abandoned.
    fn lost(&mut self, error: JoinError, host_load: &mut HashMap<String, usize>) {
        let Some(mut task) = self.spawned.remove(&error.id()) else {
            warn!("Unknown fetch task failed to join: {error}");
            return;
        };
        self.release(task.host(), host_load);
        let record = ErrorRecord {
            kind: ErrorKind::Io,
            message: format!("fetch task failed to join: {error}"),
        };
        warn!("Abandoning {}: {}", task.key(), record.message);
        task.fail(record.clone());
        task.abandon(record.clone());
        self.record(abandoned(&task, record));
    }

    fn complete(
        &mut self,
        mut task: FetchTask,
        result: Result<Transfer, FetchError>,
        elapsed: Duration,
        pending: &mut VecDeque<Queued>,
    ) {
        task.add_elapsed(elapsed);
        match result {
            Ok(transfer) => {
                task.succeed();
                self.record(FetchResult {
                    key: task.key().to_string(),
                    status: ResultStatus::Succeeded,
                    attempts: task.attempts(),
                    bytes_written: transfer.bytes_written,
                    transferred: transfer.transferred,
                    elapsed: task.elapsed(),
                    error: None,
                });
            }
            Err(err) => {
                let record = ErrorRecord::from(&err);
                task.fail(record.clone());
                let decision = if self.cancel.is_cancelled() {
                    Decision::Abandon
                } else {
                    self.policy.decide(record.kind, task.attempts())
                };
                match decision {
                    Decision::Retry(delay) => {
                        warn!(
                            "Attempt {}/{} for {} failed ({err}), retrying in {delay:?}",
                            task.attempts(),
                            self.policy.max_attempts(),
                            task.key()
                        );
                        task.requeue();
                        enqueue(
                            pending,
                            Queued {
                                task,
                                ready_at: Some(Instant::now() + delay),
                            },
                        );
                    }
                    Decision::Abandon => {
                        warn!("Abandoning {} after {} attempt(s): {err}", task.key(), task.attempts());
                        task.abandon(record.clone());
                        self.record(abandoned(&task, record));
                    }
                }
            }
        }
    }

    /// Tasks still waiting for a retry when the batch stops are abandoned;
    /// tasks never started stay not attempted.
    fn finish(&mut self, pending: VecDeque<Queued>) {
        let cancelled = self.cancel.is_cancelled();
        for Queued { mut task, .. } in pending {
            if task.attempts() == 0 {
                continue;
            }
            let last = task
                .last_error()
                .map(|e| e.message.clone())
                .unwrap_or_default();
            let record = ErrorRecord {
                kind: ErrorKind::Cancelled,
                message: format!("cancelled while waiting to retry; last error: {last}"),
            };
            task.abandon(record.clone());
            self.record(abandoned(&task, record));
        }

        let mut aggregator = self.aggregator.lock().unwrap_or_else(PoisonError::into_inner);
        if cancelled {
            aggregator.mark_cancelled();
        }
        let report = aggregator.finish();
        info!("Batch finished: {}", report.outcome());
    }

    fn record(&self, result: FetchResult) {
        self.aggregator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(result);
    }
}

fn abandoned(task: &FetchTask, error: ErrorRecord) -> FetchResult {
    FetchResult {
        key: task.key().to_string(),
        status: ResultStatus::Abandoned,
        attempts: task.attempts(),
        bytes_written: 0,
        transferred: false,
        elapsed: task.elapsed(),
        error: Some(error),
    }
}

/// Keeps the queue ordered by batch position so retried tasks keep their
/// priority.
fn enqueue(pending: &mut VecDeque<Queued>, queued: Queued) {
    let index = queued.task.index();
    let at = pending
        .iter()
        .position(|q| q.task.index() > index)
        .unwrap_or(pending.len());
    pending.insert(at, queued);
}

/// Earliest retry still in the future. Retries already due are admitted as
/// soon as a slot frees, which a join wakes the loop for.
fn next_wakeup(pending: &VecDeque<Queued>, now: Instant) -> Option<Instant> {
    pending
        .iter()
        .filter_map(|q| q.ready_at)
        .filter(|at| *at > now)
        .min()
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::AssetDescriptor;
    use crate::config::{FetchConfig, OverwritePolicy};
    use crate::retry::FixedJitter;

    fn scheduler(dir: &std::path::Path, keys: &[&str], global: usize) -> (Scheduler, Vec<FetchTask>, Arc<Mutex<Aggregator>>) {
        let tasks = keys
            .iter()
            .enumerate()
            .map(|(i, key)| {
                let src = dir.join(format!("{key}.src"));
                std::fs::write(&src, key.as_bytes()).unwrap();
                let descriptor =
                    AssetDescriptor::new(*key, src.to_str().unwrap(), dir.join(format!("out/{key}")));
                FetchTask::new(i, descriptor, "file".to_string())
            })
            .collect::<Vec<_>>();
        let aggregator = Arc::new(Mutex::new(Aggregator::new(keys.iter().copied())));
        let config = FetchConfig::default();
        let executor = Executor::new(
            reqwest::Client::new(),
            None,
            OverwritePolicy::VerifyThenSkip,
            Duration::from_secs(5),
        );
        let scheduler = Scheduler::new(
            executor,
            RetryPolicy::new(&config, Box::new(FixedJitter(0.0))),
            Limits {
                global,
                per_host: None,
            },
            Arc::clone(&aggregator),
            CancellationToken::new(),
        );
        (scheduler, tasks, aggregator)
    }

    #[tokio::test]
    async fn test_runs_all_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, tasks, aggregator) = scheduler(dir.path(), &["a", "b", "c", "d"], 2);
        let gauge = scheduler.in_flight_gauge();
        scheduler.run(tasks).await;

        let report = aggregator.lock().unwrap().snapshot();
        assert!(report.finished);
        assert_eq!(report.summary.succeeded, 4);
        assert_eq!(gauge.load(Ordering::SeqCst), 0);
        assert_eq!(std::fs::read(dir.path().join("out/c")).unwrap(), b"c");
    }

    #[tokio::test]
    async fn test_cancelled_before_start_admits_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, tasks, aggregator) = scheduler(dir.path(), &["a", "b"], 2);
        scheduler.cancel.cancel();
        scheduler.run(tasks).await;

        let report = aggregator.lock().unwrap().snapshot();
        assert!(report.cancelled);
        assert_eq!(report.summary.not_attempted, 2);
        assert!(!dir.path().join("out").exists());
    }

    #[test]
    fn test_enqueue_keeps_batch_order() {
        let mut pending = VecDeque::new();
        for i in [0, 2, 5] {
            let descriptor = AssetDescriptor::new(i.to_string(), "https://x/a", format!("out/{i}"));
            enqueue(
                &mut pending,
                Queued {
                    task: FetchTask::new(i, descriptor, "x".to_string()),
                    ready_at: None,
                },
            );
        }
        let descriptor = AssetDescriptor::new("3", "https://x/a", "out/3");
        enqueue(
            &mut pending,
            Queued {
                task: FetchTask::new(3, descriptor, "x".to_string()),
                ready_at: None,
            },
        );
        let order = pending.iter().map(|q| q.task.index()).collect::<Vec<_>>();
        assert_eq!(order, vec![0, 2, 3, 5]);
    }

    #[test]
    fn test_next_wakeup_ignores_due_retries() {
        let now = Instant::now();
        let queued = |i: usize, ready_at| Queued {
            task: FetchTask::new(
                i,
                AssetDescriptor::new(i.to_string(), "https://x/a", format!("out/{i}")),
                "x".to_string(),
            ),
            ready_at,
        };

        // Due retry blocked on a full slot must not keep the loop awake
        let mut pending = VecDeque::from([queued(0, None), queued(1, Some(now))]);
        assert_eq!(next_wakeup(&pending, now), None);

        let later = now + Duration::from_millis(200);
        pending.push_back(queued(2, Some(later)));
        pending.push_back(queued(3, Some(later + Duration::from_millis(50))));
        assert_eq!(next_wakeup(&pending, now), Some(later));
    }

    #[tokio::test]
    async fn test_lost_task_releases_slot_and_is_abandoned() {
        let dir = tempfile::tempdir().unwrap();
        let (mut scheduler, tasks, aggregator) = scheduler(dir.path(), &["a"], 2);
        let mut pending = tasks
            .into_iter()
            .map(|task| Queued {
                task,
                ready_at: None,
            })
            .collect::<VecDeque<_>>();
        let mut running = JoinSet::new();
        let mut host_load = HashMap::new();

        scheduler.admit(&mut pending, &mut running, &mut host_load);
        assert_eq!(scheduler.in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(host_load.get("file"), Some(&1));

        running.abort_all();
        let Some(Err(err)) = running.join_next_with_id().await else {
            panic!("aborted task should fail to join");
        };
        scheduler.lost(err, &mut host_load);

        assert_eq!(scheduler.in_flight.load(Ordering::SeqCst), 0);
        assert!(host_load.is_empty());
        assert!(scheduler.spawned.is_empty());
        let report = aggregator.lock().unwrap().snapshot();
        let result = report.get("a").unwrap();
        assert_eq!(result.status, ResultStatus::Abandoned);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.error_kind(), Some(ErrorKind::Io));
    }
}
