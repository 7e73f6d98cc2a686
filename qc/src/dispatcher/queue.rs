//! Job source and retry queue

use std::collections::VecDeque;

use super::job::Job;

/// Ordered supply of not-yet-attempted jobs
///
/// A fetched job can be handed back with `push_front` when a retry has to
/// jump ahead of it; it is then the next job returned.
pub struct JobSource<I: Iterator<Item = Job>> {
    jobs: I,
    returned: Option<Job>,
}

impl<I: Iterator<Item = Job>> JobSource<I> {
    pub fn new(jobs: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            jobs: jobs.into_iter(),
            returned: None,
        }
    }

    pub fn next_job(&mut self) -> Option<Job> {
        self.returned.take().or_else(|| self.jobs.next())
    }

    pub fn push_front(&mut self, job: Job) {
        debug_assert!(self.returned.is_none(), "only one job can be handed back at a time");
        self.returned = Some(job);
    }
}

/// FIFO of jobs that failed but still have attempts left
#[derive(Debug, Default)]
pub struct RetryQueue {
    jobs: VecDeque<Job>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, job: Job) {
        self.jobs.push_back(job);
    }

    pub fn pop(&mut self) -> Option<Job> {
        self.jobs.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(id: u64) -> Job {
        Job::new(id, json!({}), Some(json!({"id": id})), 1)
    }

    #[test]
    fn test_source_preserves_order() {
        let mut source = JobSource::new(vec![job(0), job(1), job(2)]);
        assert_eq!(source.next_job().unwrap().id, 0);
        assert_eq!(source.next_job().unwrap().id, 1);
        assert_eq!(source.next_job().unwrap().id, 2);
        assert!(source.next_job().is_none());
    }

    #[test]
    fn test_source_push_front() {
        let mut source = JobSource::new(vec![job(0), job(1)]);
        let first = source.next_job().unwrap();
        source.push_front(first);
        assert_eq!(source.next_job().unwrap().id, 0);
        assert_eq!(source.next_job().unwrap().id, 1);
    }

    #[test]
    fn test_retry_queue_fifo() {
        let mut queue = RetryQueue::new();
        assert!(queue.is_empty());
        queue.push(job(5));
        queue.push(job(3));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap().id, 5);
        assert_eq!(queue.pop().unwrap().id, 3);
        assert!(queue.pop().is_none());
    }
}
