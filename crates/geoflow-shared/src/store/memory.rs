//! # In-Memory State Store
//!
//! Mutex-guarded twin of the PostgreSQL store for the test harness. One
//! lock covers every operation, which trivially satisfies the
//! serialization the terminal writes require; the interesting part is
//! that the compare-and-set semantics match the SQL byte for byte, so
//! orchestration tests exercise the real protocol.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::errors::StoreError;
use crate::models::{JobRecord, JobStatus, StageTaskResult, TaskRecord, TaskStatus};

use super::{MarkProcessingOutcome, TaskCounts, TerminalWrite};

#[derive(Debug, Default)]
struct MemoryState {
    jobs: BTreeMap<String, JobRecord>,
    tasks: BTreeMap<String, TaskRecord>,
}

/// In-memory state store with PostgreSQL-equivalent semantics
#[derive(Debug, Clone, Default)]
pub struct InMemoryStateStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().expect("store state mutex poisoned")
    }

    pub fn insert_job_if_absent(
        &self,
        record: &JobRecord,
    ) -> Result<(JobRecord, bool), StoreError> {
        let mut state = self.lock();
        if let Some(existing) = state.jobs.get(&record.job_id) {
            return Ok((existing.clone(), false));
        }
        state.jobs.insert(record.job_id.clone(), record.clone());
        Ok((record.clone(), true))
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.lock().jobs.get(job_id).cloned())
    }

    pub fn update_job_status(
        &self,
        job_id: &str,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        match state.jobs.get_mut(job_id) {
            Some(job) if job.status == from => {
                job.status = to;
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn insert_tasks(&self, tasks: &[TaskRecord]) -> Result<u64, StoreError> {
        let mut state = self.lock();
        let mut inserted = 0;
        for task in tasks {
            if !state.tasks.contains_key(&task.task_id) {
                state.tasks.insert(task.task_id.clone(), task.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.lock().tasks.get(task_id).cloned())
    }

    pub fn get_stage_tasks(
        &self,
        job_id: &str,
        stage: i32,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        // BTreeMap iteration is already ordered by task_id
        Ok(self
            .lock()
            .tasks
            .values()
            .filter(|t| t.job_id == job_id && t.stage == stage)
            .cloned()
            .collect())
    }

    pub fn mark_task_processing(
        &self,
        task_id: &str,
    ) -> Result<MarkProcessingOutcome, StoreError> {
        let mut state = self.lock();
        let Some(task) = state.tasks.get_mut(task_id) else {
            return Ok(MarkProcessingOutcome::NotFound);
        };
        Ok(match task.status {
            TaskStatus::Queued => {
                task.status = TaskStatus::Processing;
                task.heartbeat = Some(Utc::now());
                task.updated_at = Utc::now();
                MarkProcessingOutcome::Started
            }
            TaskStatus::Processing => MarkProcessingOutcome::AlreadyProcessing,
            TaskStatus::Completed | TaskStatus::Failed => MarkProcessingOutcome::AlreadyTerminal,
        })
    }

    pub fn complete_task(
        &self,
        task_id: &str,
        result: &Value,
    ) -> Result<TerminalWrite, StoreError> {
        let mut state = self.lock();
        let Some(task) = state.tasks.get_mut(task_id) else {
            return Ok(TerminalWrite::Rejected);
        };
        if task.status != TaskStatus::Processing {
            return Ok(TerminalWrite::Rejected);
        }
        task.status = TaskStatus::Completed;
        task.result_data = Some(result.clone());
        task.updated_at = Utc::now();
        let (job_id, stage) = (task.job_id.clone(), task.stage);

        Ok(TerminalWrite::Applied {
            remaining: remaining_in_stage(&state, &job_id, stage),
        })
    }

    pub fn fail_task(
        &self,
        task_id: &str,
        error: &str,
        error_type: Option<&str>,
    ) -> Result<TerminalWrite, StoreError> {
        let mut state = self.lock();
        let Some(task) = state.tasks.get_mut(task_id) else {
            return Ok(TerminalWrite::Rejected);
        };
        if task.status.is_terminal() {
            return Ok(TerminalWrite::Rejected);
        }
        task.status = TaskStatus::Failed;
        task.error_message = Some(error.to_string());
        task.error_type = error_type.map(str::to_string);
        task.updated_at = Utc::now();
        let (job_id, stage) = (task.job_id.clone(), task.stage);

        Ok(TerminalWrite::Applied {
            remaining: remaining_in_stage(&state, &job_id, stage),
        })
    }

    pub fn load_stage_task_results(
        &self,
        job_id: &str,
        stage: i32,
    ) -> Result<Vec<StageTaskResult>, StoreError> {
        Ok(self
            .lock()
            .tasks
            .values()
            .filter(|t| t.job_id == job_id && t.stage == stage)
            .map(StageTaskResult::from_record)
            .collect())
    }

    pub fn advance_job_stage(
        &self,
        job_id: &str,
        from_stage: i32,
        to_stage: i32,
        stage_results: &[StageTaskResult],
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        match state.jobs.get_mut(job_id) {
            Some(job) if job.stage == from_stage && job.status == JobStatus::Processing => {
                job.stage = to_stage;
                job.stage_results
                    .insert(from_stage.to_string(), stage_results.to_vec());
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn finalize_job(
        &self,
        job_id: &str,
        status: JobStatus,
        result_data: Option<&Value>,
        error_message: Option<&str>,
        final_stage_results: Option<(i32, &[StageTaskResult])>,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        match state.jobs.get_mut(job_id) {
            Some(job) if job.status == JobStatus::Processing => {
                job.status = status;
                job.result_data = result_data.cloned();
                job.error_message = error_message.map(str::to_string);
                if let Some((stage, results)) = final_stage_results {
                    job.stage_results
                        .insert(stage.to_string(), results.to_vec());
                }
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn task_progress(&self, job_id: &str) -> Result<TaskCounts, StoreError> {
        let state = self.lock();
        let mut counts = TaskCounts::default();
        for task in state.tasks.values().filter(|t| t.job_id == job_id) {
            counts.total += 1;
            match task.status {
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                _ => {}
            }
        }
        Ok(counts)
    }

    pub fn find_stale_processing_tasks(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        Ok(self
            .lock()
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Processing
                    && t.heartbeat.unwrap_or(t.updated_at) < cutoff
            })
            .take(limit)
            .cloned()
            .collect())
    }

    pub fn requeue_task(&self, task_id: &str) -> Result<bool, StoreError> {
        let mut state = self.lock();
        match state.tasks.get_mut(task_id) {
            Some(task) if task.status == TaskStatus::Processing => {
                task.status = TaskStatus::Queued;
                task.retry_count += 1;
                task.heartbeat = None;
                task.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn find_jobs_by_status_older_than(
        &self,
        status: JobStatus,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        Ok(self
            .lock()
            .jobs
            .values()
            .filter(|j| j.status == status && j.updated_at < cutoff)
            .take(limit)
            .cloned()
            .collect())
    }
}

fn remaining_in_stage(state: &MemoryState, job_id: &str, stage: i32) -> i64 {
    state
        .tasks
        .values()
        .filter(|t| t.job_id == job_id && t.stage == stage && !t.status.is_terminal())
        .count() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StateStore;
    use serde_json::json;

    fn seed_job(store: &InMemoryStateStore, job_id: &str, tasks: usize) {
        let mut job = JobRecord::new(job_id, "wf", json!({}), 1);
        job.status = JobStatus::Processing;
        store.insert_job_if_absent(&job).unwrap();

        let records: Vec<TaskRecord> = (0..tasks)
            .map(|i| TaskRecord::new(format!("{job_id}_s1_{i}"), job_id, 1, "noop", json!({})))
            .collect();
        store.insert_tasks(&records).unwrap();
    }

    #[test]
    fn insert_job_is_idempotent() {
        let store = InMemoryStateStore::new();
        let job = JobRecord::new("j1", "wf", json!({"n": 1}), 2);
        let (_, inserted) = store.insert_job_if_absent(&job).unwrap();
        assert!(inserted);

        let mut second = job.clone();
        second.parameters = json!({"n": 999});
        let (stored, inserted) = store.insert_job_if_absent(&second).unwrap();
        assert!(!inserted);
        // first writer wins; the colliding record is discarded
        assert_eq!(stored.parameters, json!({"n": 1}));
    }

    #[test]
    fn duplicate_task_insertion_is_a_no_op() {
        let store = InMemoryStateStore::new();
        seed_job(&store, "j1", 2);
        let again = vec![TaskRecord::new("j1_s1_0", "j1", 1, "noop", json!({}))];
        assert_eq!(store.insert_tasks(&again).unwrap(), 0);
    }

    #[test]
    fn mark_processing_succeeds_at_most_once() {
        let store = InMemoryStateStore::new();
        seed_job(&store, "j1", 1);

        assert_eq!(
            store.mark_task_processing("j1_s1_0").unwrap(),
            MarkProcessingOutcome::Started
        );
        assert_eq!(
            store.mark_task_processing("j1_s1_0").unwrap(),
            MarkProcessingOutcome::AlreadyProcessing
        );

        store.complete_task("j1_s1_0", &json!({})).unwrap();
        assert_eq!(
            store.mark_task_processing("j1_s1_0").unwrap(),
            MarkProcessingOutcome::AlreadyTerminal
        );
    }

    #[test]
    fn complete_requires_processing_status() {
        let store = InMemoryStateStore::new();
        seed_job(&store, "j1", 1);
        assert_eq!(
            store.complete_task("j1_s1_0", &json!({})).unwrap(),
            TerminalWrite::Rejected
        );
    }

    #[test]
    fn fail_accepts_queued_tasks() {
        let store = InMemoryStateStore::new();
        seed_job(&store, "j1", 1);
        let write = store
            .fail_task("j1_s1_0", "poison message", Some("MaxRetriesExceeded"))
            .unwrap();
        assert_eq!(write, TerminalWrite::Applied { remaining: 0 });
    }

    #[test]
    fn remaining_counts_descend_to_zero_once() {
        let store = InMemoryStateStore::new();
        seed_job(&store, "j1", 3);
        for i in 0..3 {
            store.mark_task_processing(&format!("j1_s1_{i}")).unwrap();
        }

        let mut zeros = 0;
        for i in 0..3 {
            match store.complete_task(&format!("j1_s1_{i}"), &json!({})).unwrap() {
                TerminalWrite::Applied { remaining } => {
                    if remaining == 0 {
                        zeros += 1;
                    }
                }
                TerminalWrite::Rejected => panic!("unexpected rejection"),
            }
        }
        assert_eq!(zeros, 1);
    }

    #[test]
    fn exactly_one_completer_observes_zero_under_concurrency() {
        let store = InMemoryStateStore::new();
        let task_count = 16;
        seed_job(&store, "j1", task_count);
        for i in 0..task_count {
            store.mark_task_processing(&format!("j1_s1_{i}")).unwrap();
        }

        let mut handles = Vec::new();
        for i in 0..task_count {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                match store
                    .complete_task(&format!("j1_s1_{i}"), &json!({"i": i}))
                    .unwrap()
                {
                    TerminalWrite::Applied { remaining } => remaining == 0,
                    TerminalWrite::Rejected => false,
                }
            }));
        }
        let zeros = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(zeros, 1);
    }

    #[test]
    fn advance_cas_includes_current_stage() {
        let store = InMemoryStateStore::new();
        let mut job = JobRecord::new("j1", "wf", json!({}), 3);
        job.status = JobStatus::Processing;
        store.insert_job_if_absent(&job).unwrap();

        assert!(store.advance_job_stage("j1", 1, 2, &[]).unwrap());
        // a second (duplicate) advance from stage 1 is rejected
        assert!(!store.advance_job_stage("j1", 1, 2, &[]).unwrap());

        let job = store.get_job("j1").unwrap().unwrap();
        assert_eq!(job.stage, 2);
        assert!(job.stage_results.contains_key("1"));
    }

    #[test]
    fn finalize_requires_processing() {
        let store = InMemoryStateStore::new();
        let job = JobRecord::new("j1", "wf", json!({}), 1);
        store.insert_job_if_absent(&job).unwrap();

        // still QUEUED
        assert!(!store
            .finalize_job("j1", JobStatus::Failed, None, Some("boom"), None)
            .unwrap());

        store
            .update_job_status("j1", JobStatus::Queued, JobStatus::Processing)
            .unwrap();
        assert!(store
            .finalize_job("j1", JobStatus::Completed, Some(&json!({"ok": true})), None, None)
            .unwrap());

        // terminal statuses never change
        assert!(!store
            .finalize_job("j1", JobStatus::Failed, None, Some("late"), None)
            .unwrap());
    }

    #[test]
    fn stage_results_are_ordered_by_task_id() {
        let store = InMemoryStateStore::new();
        seed_job(&store, "j1", 3);
        let results = store.load_stage_task_results("j1", 1).unwrap();
        let ids: Vec<&str> = results.iter().map(|r| r.task_id.as_str()).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn requeue_bumps_retry_count_and_clears_heartbeat() {
        let store = InMemoryStateStore::new();
        seed_job(&store, "j1", 1);
        store.mark_task_processing("j1_s1_0").unwrap();

        assert!(store.requeue_task("j1_s1_0").unwrap());
        let task = store.get_task("j1_s1_0").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.retry_count, 1);
        assert!(task.heartbeat.is_none());

        // only PROCESSING tasks can be reclaimed
        assert!(!store.requeue_task("j1_s1_0").unwrap());
    }

    #[tokio::test]
    async fn enum_dispatch_reaches_the_memory_backend() {
        let store = StateStore::in_memory();
        let job = JobRecord::new("j1", "wf", json!({}), 1);
        let (_, inserted) = store.insert_job_if_absent(&job).await.unwrap();
        assert!(inserted);
        assert!(store.get_job("j1").await.unwrap().is_some());
    }
}
