//! Dispatcher loop
//!
//! A single task makes every admission decision. Workers only perform the
//! network call; the loop keeps each admitted job and routes it to the sink
//! or the retry queue when its worker finishes, so retried work is budgeted
//! like fresh work.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::task::{self, JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::capacity::CapacityTracker;
use super::config::DispatcherConfig;
use super::cost::CostEstimator;
use super::job::{Job, JobResult};
use super::queue::{JobSource, RetryQueue};
use super::sink::ResultSink;
use super::stats::DispatchStats;
use super::worker;
use super::DispatchError;
use crate::llm::{ApiClient, ApiError};

/// What a worker task hands back when joined
type Joined = Result<(task::Id, Result<Value, ApiError>), JoinError>;

/// Mutable state for one run, owned by the loop
struct RunState {
    retries: RetryQueue,
    /// Admitted jobs by the task running their call
    in_flight: HashMap<task::Id, Job>,
    cooldown_until: Option<Instant>,
    stats: DispatchStats,
}

/// Drives jobs against a rate-limited API under request and token budgets
pub struct Dispatcher {
    config: DispatcherConfig,
    client: Arc<dyn ApiClient>,
    estimator: Box<dyn CostEstimator>,
}

impl Dispatcher {
    /// Create a dispatcher, rejecting invalid configuration up front
    pub fn new(
        config: DispatcherConfig,
        client: Arc<dyn ApiClient>,
        estimator: Box<dyn CostEstimator>,
    ) -> Result<Self, DispatchError> {
        debug!(?config, "Dispatcher::new: called");
        config.validate()?;
        Ok(Self {
            config,
            client,
            estimator,
        })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Run every job to a terminal result
    ///
    /// Returns once the source and retry queue are empty and no call is in
    /// flight. Individual job failures end up in the sink as failure
    /// records; only sink errors abort the run.
    pub async fn run<J, S>(&self, jobs: J, sink: &mut S) -> Result<DispatchStats, DispatchError>
    where
        J: IntoIterator<Item = Job>,
        S: ResultSink + ?Sized,
    {
        let run_id = Uuid::now_v7();
        info!(
            %run_id,
            max_requests_per_minute = self.config.max_requests_per_minute,
            max_tokens_per_minute = self.config.max_tokens_per_minute,
            max_attempts = self.config.max_attempts,
            "Dispatch run starting"
        );

        let mut source = JobSource::new(jobs);
        let mut tracker = CapacityTracker::new(
            self.config.max_requests_per_minute,
            self.config.max_tokens_per_minute,
            Instant::now(),
        );
        let mut workers: JoinSet<Result<Value, ApiError>> = JoinSet::new();
        let mut held: Option<Job> = None;
        let mut state = RunState {
            retries: RetryQueue::new(),
            in_flight: HashMap::new(),
            cooldown_until: None,
            stats: DispatchStats::default(),
        };

        loop {
            while let Some(joined) = workers.try_join_next_with_id() {
                self.settle(joined, &mut state, sink)?;
            }

            held = self.fetch(held, &mut source, &mut state.retries);

            let Some(job) = held.take() else {
                if workers.is_empty() {
                    debug!("Dispatcher::run: drained");
                    break;
                }
                debug!(in_flight = workers.len(), "Dispatcher::run: nothing to admit, waiting for workers");
                if let Some(joined) = workers.join_next_with_id().await {
                    self.settle(joined, &mut state, sink)?;
                }
                continue;
            };

            let now = Instant::now();
            let deadline = match state.cooldown_until {
                Some(until) if now < until => {
                    debug!(?until, "Dispatcher::run: cooling down after remote rate limit");
                    until
                }
                _ => {
                    state.cooldown_until = None;
                    tracker.replenish(now);
                    let cost = job.estimated_cost.unwrap_or_default();
                    if tracker.try_reserve(1, cost) {
                        self.admit(job, &mut workers, &mut state);
                        continue;
                    }
                    // Wake when capacity is due, but never sleep past idle_sleep
                    now + tracker.time_until(1, cost).min(self.config.idle_sleep())
                }
            };
            held = Some(job);

            // Backpressure: hold the job until the deadline, collecting outcomes meanwhile
            tokio::select! {
                Some(joined) = workers.join_next_with_id() => {
                    self.settle(joined, &mut state, sink)?;
                }
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }

        info!(%run_id, "Dispatch run finished");
        state.stats.log_summary();
        Ok(state.stats)
    }

    /// Pick the job to admit next
    ///
    /// Retries go first. A fresh job already held is handed back to the
    /// source when a retry is waiting, so retries never queue behind it.
    fn fetch<I>(&self, held: Option<Job>, source: &mut JobSource<I>, retries: &mut RetryQueue) -> Option<Job>
    where
        I: Iterator<Item = Job>,
    {
        let mut job = match held {
            Some(job) if job.is_fresh() && !retries.is_empty() => {
                debug!(job_id = job.id, "Dispatcher::fetch: retry jumps ahead of held job");
                source.push_front(job);
                retries.pop()
            }
            Some(job) => Some(job),
            None => retries.pop().or_else(|| source.next_job()),
        }?;
        job.ensure_cost(self.estimator.as_ref());
        Some(job)
    }

    fn admit(&self, job: Job, workers: &mut JoinSet<Result<Value, ApiError>>, state: &mut RunState) {
        debug!(
            job_id = job.id,
            cost = job.estimated_cost,
            attempts_remaining = job.attempts_remaining,
            "Dispatcher::admit: called"
        );
        let handle = workers.spawn(worker::execute(
            job.id,
            job.payload.clone(),
            Arc::clone(&self.client),
            self.config.request_timeout(),
        ));
        state.in_flight.insert(handle.id(), job);
        state.stats.total_started += 1;
        state.stats.peak_in_flight = state.stats.peak_in_flight.max(state.in_flight.len());
    }

    /// Match a finished worker task back to its job and route the outcome
    ///
    /// A task that panicked or was cancelled counts as a failed attempt.
    fn settle<S>(&self, joined: Joined, state: &mut RunState, sink: &mut S) -> Result<(), DispatchError>
    where
        S: ResultSink + ?Sized,
    {
        let (task_id, result) = match joined {
            Ok((task_id, result)) => (task_id, result),
            Err(join_error) => {
                let reason = if join_error.is_panic() {
                    "worker panicked"
                } else {
                    "worker cancelled"
                };
                error!(task_id = %join_error.id(), %reason, "Worker task ended without an outcome");
                (join_error.id(), Err(ApiError::WorkerFailed(reason.to_string())))
            }
        };

        match state.in_flight.remove(&task_id) {
            Some(job) => self.route(job, result, state, sink),
            None => {
                warn!(%task_id, "Dispatcher::settle: no job recorded for task");
                Ok(())
            }
        }
    }

    /// Send a call outcome to the sink or back to the retry queue
    fn route<S>(
        &self,
        mut job: Job,
        result: Result<Value, ApiError>,
        state: &mut RunState,
        sink: &mut S,
    ) -> Result<(), DispatchError>
    where
        S: ResultSink + ?Sized,
    {
        let error = match result {
            Ok(response) => {
                debug!(job_id = job.id, "Dispatcher::route: success");
                sink.append(&JobResult::success(job, response))?;
                state.stats.total_succeeded += 1;
                return Ok(());
            }
            Err(error) => error,
        };

        state.stats.record_error(&error);

        if error.is_rate_limit() {
            let pause = error.retry_after().unwrap_or_else(|| self.config.rate_limit_cooldown());
            let until = Instant::now() + pause;
            if state.cooldown_until.is_none_or(|current| current < until) {
                state.cooldown_until = Some(until);
            }
            warn!(?pause, "Remote rate limit hit, pausing admissions");
        }

        job.errors.push(error.to_string());
        job.attempts_remaining = job.attempts_remaining.saturating_sub(1);

        if job.attempts_remaining > 0 {
            debug!(
                job_id = job.id,
                attempts_remaining = job.attempts_remaining,
                "Dispatcher::route: queued for retry"
            );
            state.retries.push(job);
            state.stats.total_retried += 1;
        } else {
            error!(job_id = job.id, errors = ?job.errors, "Request failed after all attempts");
            sink.append(&JobResult::failure(job))?;
            state.stats.total_failed += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::job::Outcome;
    use crate::llm::ApiError;
    use crate::llm::client::mock::MockApiClient;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Cost read from the payload's `tokens` field
    struct PayloadCost;

    impl CostEstimator for PayloadCost {
        fn estimate(&self, payload: &mut Value) -> u64 {
            payload.get("tokens").and_then(Value::as_u64).unwrap_or(1)
        }
    }

    /// Records call order; fails each listed id on its first attempt
    struct FlakyClient {
        fail_once: Vec<u64>,
        calls: Mutex<Vec<(u64, Instant)>>,
        rate_limit: bool,
    }

    #[async_trait]
    impl ApiClient for FlakyClient {
        async fn send(&self, payload: &Value) -> Result<Value, ApiError> {
            let id = payload["id"].as_u64().unwrap();
            let mut calls = self.calls.lock().unwrap();
            let first = !calls.iter().any(|(seen, _)| *seen == id);
            calls.push((id, Instant::now()));
            if first && self.fail_once.contains(&id) {
                if self.rate_limit {
                    return Err(ApiError::RateLimited {
                        message: "Rate limit reached".to_string(),
                        retry_after: None,
                    });
                }
                return Err(ApiError::ApiError {
                    status: 500,
                    message: "transient".to_string(),
                });
            }
            Ok(json!({"echo": id}))
        }
    }

    fn jobs(n: u64, max_attempts: u32) -> Vec<Job> {
        (0..n)
            .map(|id| Job::new(id, json!({"id": id}), Some(json!({"row": id})), max_attempts))
            .collect()
    }

    fn config(rpm: u64, tpm: u64, max_attempts: u32) -> DispatcherConfig {
        DispatcherConfig {
            max_requests_per_minute: rpm,
            max_tokens_per_minute: tpm,
            max_attempts,
            ..Default::default()
        }
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let client: Arc<dyn ApiClient> = Arc::new(MockApiClient::new(vec![]));
        let result = Dispatcher::new(config(0, 100, 1), client, Box::new(PayloadCost));
        assert!(matches!(result, Err(DispatchError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_source_finishes_immediately() {
        let client: Arc<dyn ApiClient> = Arc::new(MockApiClient::new(vec![]));
        let dispatcher = Dispatcher::new(config(60, 1000, 1), client, Box::new(PayloadCost)).unwrap();

        let mut results: Vec<JobResult> = Vec::new();
        let stats = dispatcher.run(Vec::new(), &mut results).await.unwrap();

        assert!(results.is_empty());
        assert_eq!(stats, DispatchStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_admitted_before_fresh_jobs() {
        let client = Arc::new(FlakyClient {
            fail_once: vec![0],
            calls: Mutex::new(Vec::new()),
            rate_limit: false,
        });
        let dispatcher = Dispatcher::new(config(60, 1_000_000, 3), client.clone(), Box::new(PayloadCost)).unwrap();

        let mut results: Vec<JobResult> = Vec::new();
        let stats = dispatcher.run(jobs(4, 3), &mut results).await.unwrap();

        let order: Vec<u64> = client.calls.lock().unwrap().iter().map(|(id, _)| *id).collect();
        assert_eq!(order, vec![0, 0, 1, 2, 3]);
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(JobResult::is_success));
        assert_eq!(stats.total_retried, 1);
        assert_eq!(stats.total_started, 5);
        assert_eq!(stats.api_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_descriptor_lists_every_attempt() {
        let client: Arc<dyn ApiClient> = Arc::new(MockApiClient::new(vec![
            Err(ApiError::ApiError {
                status: 502,
                message: "bad gateway".to_string(),
            }),
            Err(ApiError::Timeout(Duration::from_secs(1))),
        ]));
        let dispatcher = Dispatcher::new(config(600, 1_000_000, 2), client, Box::new(PayloadCost)).unwrap();

        let mut results: Vec<JobResult> = Vec::new();
        let stats = dispatcher.run(jobs(1, 2), &mut results).await.unwrap();

        assert_eq!(results.len(), 1);
        match &results[0].outcome {
            Outcome::Failure(errors) => {
                assert_eq!(errors.len(), 2);
                assert!(errors[0].contains("bad gateway"));
                assert!(errors[1].contains("Timeout"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(results[0].metadata, Some(json!({"row": 0})));
        assert_eq!(stats.total_failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_rate_limit_pauses_admissions() {
        let client = Arc::new(FlakyClient {
            fail_once: vec![0],
            calls: Mutex::new(Vec::new()),
            rate_limit: true,
        });
        let cfg = DispatcherConfig {
            rate_limit_cooldown_secs: 15,
            ..config(6_000, 1_000_000, 2)
        };
        let dispatcher = Dispatcher::new(cfg, client.clone(), Box::new(PayloadCost)).unwrap();

        let mut results: Vec<JobResult> = Vec::new();
        let stats = dispatcher.run(jobs(2, 2), &mut results).await.unwrap();

        let calls = client.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 3);
        // The rejection at calls[0] holds everything else back for the cooldown
        assert!(calls[1].1 - calls[0].1 >= Duration::from_secs(15));
        assert_eq!(stats.rate_limit_errors, 1);
        assert!(results.iter().all(JobResult::is_success));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_call_times_out_and_counts_as_attempt() {
        struct SlowClient;

        #[async_trait]
        impl ApiClient for SlowClient {
            async fn send(&self, _payload: &Value) -> Result<Value, ApiError> {
                tokio::time::sleep(Duration::from_secs(600)).await;
                Ok(json!({}))
            }
        }

        let cfg = DispatcherConfig {
            request_timeout_ms: 1_000,
            ..config(600, 1_000_000, 2)
        };
        let dispatcher = Dispatcher::new(cfg, Arc::new(SlowClient), Box::new(PayloadCost)).unwrap();

        let mut results: Vec<JobResult> = Vec::new();
        let stats = dispatcher.run(jobs(1, 2), &mut results).await.unwrap();

        assert_eq!(results.len(), 1);
        assert!(!results[0].is_success());
        assert_eq!(stats.other_errors, 2);
        assert_eq!(stats.total_started, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_call_counts_as_failed_attempt() {
        struct PanickyClient;

        #[async_trait]
        impl ApiClient for PanickyClient {
            async fn send(&self, payload: &Value) -> Result<Value, ApiError> {
                let id = payload["id"].as_u64().unwrap();
                if id == 1 {
                    panic!("client blew up on job {id}");
                }
                Ok(json!({"echo": id}))
            }
        }

        let dispatcher = Dispatcher::new(config(600, 1_000_000, 2), Arc::new(PanickyClient), Box::new(PayloadCost)).unwrap();

        let mut results: Vec<JobResult> = Vec::new();
        let stats = tokio::time::timeout(Duration::from_secs(5), dispatcher.run(jobs(3, 2), &mut results))
            .await
            .expect("run finished")
            .unwrap();

        assert_eq!(results.len(), 3);
        let failed: Vec<&JobResult> = results.iter().filter(|r| !r.is_success()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].metadata, Some(json!({"row": 1})));
        match &failed[0].outcome {
            Outcome::Failure(errors) => {
                assert_eq!(errors.len(), 2);
                assert!(errors.iter().all(|e| e.contains("worker panicked")));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(stats.total_started, 4);
        assert_eq!(stats.total_failed, 1);
        assert_eq!(stats.other_errors, 2);
        assert_eq!(stats.non_retryable_errors, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backpressure_wakes_when_capacity_is_due() {
        let client = Arc::new(FlakyClient {
            fail_once: vec![],
            calls: Mutex::new(Vec::new()),
            rate_limit: false,
        });
        // 4000 rpm: a request accrues every 15 ms, off the 10 ms idle grid
        let dispatcher = Dispatcher::new(config(4_000, 1_000_000, 1), client.clone(), Box::new(PayloadCost)).unwrap();

        let started = Instant::now();
        let mut results: Vec<JobResult> = Vec::new();
        dispatcher.run(jobs(3, 1), &mut results).await.unwrap();

        let offsets: Vec<Duration> = client.calls.lock().unwrap().iter().map(|(_, at)| *at - started).collect();
        assert_eq!(offsets.len(), 3);
        for (k, offset) in offsets.iter().enumerate() {
            let due = Duration::from_millis(15 * (k as u64 + 1));
            assert!(*offset >= due);
            assert!(*offset < due + Duration::from_millis(2));
        }
    }
}
