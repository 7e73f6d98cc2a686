//! Jobs and their terminal results

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use eyre::{Context, Result};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::cost::CostEstimator;

/// One unit of work for the remote API
#[derive(Debug, Clone)]
pub struct Job {
    /// Position in the job source, used only for logging
    pub id: u64,
    /// Opaque request body
    pub payload: Value,
    /// Caller-supplied correlation data, echoed back unmodified
    pub metadata: Option<Value>,
    /// Attempts left before the job is abandoned
    pub attempts_remaining: u32,
    /// Token cost, computed once before the first admission
    pub estimated_cost: Option<u64>,
    /// Error text from each failed attempt, oldest first
    pub errors: Vec<String>,
}

impl Job {
    pub fn new(id: u64, payload: Value, metadata: Option<Value>, max_attempts: u32) -> Self {
        Self {
            id,
            payload,
            metadata,
            attempts_remaining: max_attempts,
            estimated_cost: None,
            errors: Vec::new(),
        }
    }

    /// Build a job from one request line, splitting off its `metadata` key
    pub fn from_request(id: u64, mut request: Value, max_attempts: u32) -> Self {
        let metadata = request.as_object_mut().and_then(|obj| obj.remove("metadata"));
        Self::new(id, request, metadata, max_attempts)
    }

    /// True until the job has failed at least once
    pub fn is_fresh(&self) -> bool {
        self.errors.is_empty()
    }

    /// Token cost, estimating (and truncating the payload) on first use
    pub fn ensure_cost(&mut self, estimator: &dyn CostEstimator) -> u64 {
        if let Some(cost) = self.estimated_cost {
            return cost;
        }
        let cost = estimator.estimate(&mut self.payload);
        debug!(job_id = self.id, %cost, "Job::ensure_cost: estimated");
        self.estimated_cost = Some(cost);
        cost
    }
}

/// Terminal outcome of a job
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Decoded response body
    Success(Value),
    /// One error message per failed attempt
    Failure(Vec<String>),
}

/// Terminal record for a job
#[derive(Debug, Clone, PartialEq)]
pub struct JobResult {
    pub request: Value,
    pub outcome: Outcome,
    pub metadata: Option<Value>,
}

impl JobResult {
    pub fn success(job: Job, response: Value) -> Self {
        Self {
            request: job.payload,
            outcome: Outcome::Success(response),
            metadata: job.metadata,
        }
    }

    pub fn failure(job: Job) -> Self {
        Self {
            request: job.payload,
            outcome: Outcome::Failure(job.errors),
            metadata: job.metadata,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success(_))
    }

    /// Encode as `[request, response-or-errors, metadata?]`
    pub fn to_record(&self) -> Value {
        let second = match &self.outcome {
            Outcome::Success(response) => response.clone(),
            Outcome::Failure(errors) => Value::Array(errors.iter().cloned().map(Value::String).collect()),
        };
        let mut record = vec![self.request.clone(), second];
        if let Some(metadata) = &self.metadata {
            record.push(metadata.clone());
        }
        Value::Array(record)
    }

    /// Decode a record written by `to_record`
    ///
    /// A second element that is a non-empty array of strings is a failure;
    /// anything else, including `[]`, is a response body. A failure always
    /// carries at least one error since it follows at least one attempt.
    pub fn from_record(record: Value) -> Option<Self> {
        let Value::Array(items) = record else {
            return None;
        };
        let mut items = items.into_iter();
        let request = items.next()?;
        let second = items.next()?;
        let metadata = items.next();

        let outcome = match second {
            Value::Array(errors) if !errors.is_empty() && errors.iter().all(Value::is_string) => Outcome::Failure(
                errors
                    .into_iter()
                    .filter_map(|e| e.as_str().map(str::to_string))
                    .collect(),
            ),
            response => Outcome::Success(response),
        };

        Some(Self {
            request,
            outcome,
            metadata,
        })
    }
}

/// Read a JSONL file of requests into jobs
///
/// Lines that are blank or not valid JSON are skipped with a warning; the
/// second value returned is how many were skipped.
pub fn read_jobs(path: &Path, max_attempts: u32) -> Result<(Vec<Job>, usize)> {
    debug!(?path, %max_attempts, "read_jobs: called");
    let file = File::open(path).context(format!("Failed to open requests file {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut jobs = Vec::new();
    let mut skipped = 0usize;
    for (line_no, line) in reader.lines().enumerate() {
        let line = line.context("Failed to read requests file")?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(&line) {
            Ok(request) => {
                let id = jobs.len() as u64;
                jobs.push(Job::from_request(id, request, max_attempts));
            }
            Err(e) => {
                warn!(line = line_no + 1, error = %e, "read_jobs: skipping malformed request line");
                skipped += 1;
            }
        }
    }

    info!("Read {} jobs from {} ({} malformed lines skipped)", jobs.len(), path.display(), skipped);
    Ok((jobs, skipped))
}
