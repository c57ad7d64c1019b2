//! In-memory implementation of every storage seam, with failure injection.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use courier_common::types::{Message, MessageStatus};
use courier_engine::messages::MessageRepository;
use courier_engine::store::{Store, StoreError, StoreTx};
use courier_queue::{Job, JobQueue, NewJob, QueueError};

#[derive(Default)]
struct State {
    messages: BTreeMap<String, Message>,
    jobs: BTreeMap<String, Job>,
    history: HashMap<String, Vec<MessageStatus>>,
}

#[derive(Default)]
struct Faults {
    upsert: AtomicBool,
    insert_job: AtomicBool,
    commit: AtomicBool,
    reserve: AtomicBool,
    status_updates: AtomicUsize,
}

#[derive(Default)]
struct Counters {
    begins: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

/// Messages and jobs held in memory. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    faults: Arc<Faults>,
    counters: Arc<Counters>,
    lease: Duration,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl MemoryStore {
    pub fn new(lease: Duration) -> Self {
        Self {
            state: Arc::default(),
            faults: Arc::default(),
            counters: Arc::default(),
            lease,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // Failure injection

    pub fn fail_upserts(&self, fail: bool) {
        self.faults.upsert.store(fail, Ordering::SeqCst);
    }

    pub fn fail_job_inserts(&self, fail: bool) {
        self.faults.insert_job.store(fail, Ordering::SeqCst);
    }

    pub fn fail_commits(&self, fail: bool) {
        self.faults.commit.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reserves(&self, fail: bool) {
        self.faults.reserve.store(fail, Ordering::SeqCst);
    }

    /// Fail the next `count` status updates; `usize::MAX` fails them all.
    pub fn fail_status_updates(&self, count: usize) {
        self.faults.status_updates.store(count, Ordering::SeqCst);
    }

    // Inspection

    pub fn begins(&self) -> usize {
        self.counters.begins.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.counters.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.counters.rollbacks.load(Ordering::SeqCst)
    }

    pub fn message(&self, id: &str) -> Option<Message> {
        self.lock().messages.get(id).cloned()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.lock().messages.values().cloned().collect()
    }

    pub fn status(&self, id: &str) -> Option<MessageStatus> {
        self.message(id).map(|m| m.status)
    }

    /// Every status the message has been given, in order, creation included.
    pub fn history(&self, id: &str) -> Vec<MessageStatus> {
        self.lock().history.get(id).cloned().unwrap_or_default()
    }

    pub fn job(&self, message_id: &str) -> Option<Job> {
        self.lock().jobs.get(message_id).cloned()
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.lock().jobs.values().cloned().collect()
    }

    // Direct manipulation

    /// Insert a message row as if it had been written at `updated_at`.
    pub fn insert_message(&self, id: &str, status: MessageStatus, updated_at: DateTime<Utc>) {
        let mut state = self.lock();
        state.messages.insert(
            id.to_string(),
            Message {
                id: id.to_string(),
                status,
                created_at: updated_at,
                updated_at,
            },
        );
        state.history.entry(id.to_string()).or_default().push(status);
    }

    /// Insert a job without a transaction, eligible immediately.
    pub fn insert_job(&self, job: NewJob) {
        let now = Utc::now();
        self.lock().jobs.insert(job.message_id.clone(), new_job_row(job, now));
    }

    /// Make every job eligible now, as if its backoff had elapsed.
    pub fn skip_backoff(&self) {
        let now = Utc::now();
        for job in self.lock().jobs.values_mut() {
            if job.active_at > now {
                job.active_at = now;
            }
        }
    }

    /// Expire every outstanding lease.
    pub fn expire_leases(&self) {
        let past = Utc::now() - TimeDelta::seconds(1);
        for job in self.lock().jobs.values_mut() {
            if job.locked_by.is_some() {
                job.locked_until = Some(past);
            }
        }
    }

    fn holds_lease(current: &Job, job: &Job) -> bool {
        current.locked_by.is_some() && current.locked_by == job.locked_by
    }
}

fn new_job_row(job: NewJob, now: DateTime<Utc>) -> Job {
    Job {
        message_id: job.message_id,
        payload: job.payload,
        attempts: 0,
        active_at: now,
        created_at: now,
        locked_by: None,
        locked_until: None,
    }
}

fn injected(what: &str) -> StoreError {
    StoreError::Storage(format!("injected {what} failure"))
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        self.counters.begins.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryTx {
            store: self.clone(),
            messages: Vec::new(),
            jobs: Vec::new(),
        }))
    }
}

/// Buffers writes and applies them all at once on commit.
struct MemoryTx {
    store: MemoryStore,
    messages: Vec<(String, MessageStatus)>,
    jobs: Vec<NewJob>,
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn upsert_message(&mut self, id: &str, status: MessageStatus) -> Result<(), StoreError> {
        if self.store.faults.upsert.load(Ordering::SeqCst) {
            return Err(injected("upsert"));
        }
        self.messages.push((id.to_string(), status));
        Ok(())
    }

    async fn insert_job(&mut self, job: &NewJob) -> Result<(), StoreError> {
        if self.store.faults.insert_job.load(Ordering::SeqCst) {
            return Err(injected("job insert"));
        }
        self.jobs.push(job.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        if this.store.faults.commit.load(Ordering::SeqCst) {
            return Err(injected("commit"));
        }

        let now = Utc::now();
        let mut state = this.store.lock();
        if let Some(job) = this.jobs.iter().find(|j| state.jobs.contains_key(&j.message_id)) {
            return Err(StoreError::Storage(format!(
                "duplicate job for message {}",
                job.message_id
            )));
        }

        for (id, status) in this.messages {
            let created_at = state.messages.get(&id).map_or(now, |m| m.created_at);
            state.messages.insert(
                id.clone(),
                Message {
                    id: id.clone(),
                    status,
                    created_at,
                    updated_at: now,
                },
            );
            state.history.entry(id).or_default().push(status);
        }
        for job in this.jobs {
            state.jobs.insert(job.message_id.clone(), new_job_row(job, now));
        }
        drop(state);

        this.store.counters.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.store.counters.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl MessageRepository for MemoryStore {
    async fn find(&self, id: &str) -> Result<Option<Message>, StoreError> {
        Ok(self.message(id))
    }

    async fn update_status(
        &self,
        id: &str,
        status: MessageStatus,
        holder: &str,
    ) -> Result<bool, StoreError> {
        let remaining = self.faults.status_updates.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != usize::MAX {
                self.faults.status_updates.fetch_sub(1, Ordering::SeqCst);
            }
            return Err(injected("status update"));
        }

        let mut state = self.lock();
        let leased = state
            .jobs
            .get(id)
            .is_some_and(|job| job.locked_by.as_deref() == Some(holder));
        if !leased {
            return Ok(false);
        }
        let Some(message) = state.messages.get_mut(id) else {
            return Ok(false);
        };
        message.status = status;
        message.updated_at = Utc::now();
        state.history.entry(id.to_string()).or_default().push(status);
        Ok(true)
    }

    async fn delete_expired(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.lock();
        let State { messages, jobs, .. } = &mut *state;

        let before = messages.len();
        messages.retain(|id, message| {
            !(message.status.is_terminal()
                && message.updated_at < cutoff
                && !jobs.contains_key(id))
        });
        Ok((before - messages.len()) as u64)
    }
}

#[async_trait]
impl JobQueue for MemoryStore {
    async fn enqueue(&self, job: NewJob) -> Result<(), QueueError> {
        let mut state = self.lock();
        if state.jobs.contains_key(&job.message_id) {
            return Err(QueueError::Storage(format!(
                "duplicate job for message {}",
                job.message_id
            )));
        }
        state
            .jobs
            .insert(job.message_id.clone(), new_job_row(job, Utc::now()));
        Ok(())
    }

    async fn reserve(&self, worker_id: &str) -> Result<Option<Job>, QueueError> {
        if self.faults.reserve.load(Ordering::SeqCst) {
            return Err(QueueError::Storage("injected reserve failure".to_string()));
        }

        let now = Utc::now();
        let lease = TimeDelta::from_std(self.lease).unwrap_or(TimeDelta::MAX);
        let mut state = self.lock();

        let next = state
            .jobs
            .values_mut()
            .filter(|job| job.active_at <= now)
            .filter(|job| job.locked_until.is_none_or(|until| until < now))
            .min_by_key(|job| (job.active_at, job.created_at));

        Ok(next.map(|job| {
            job.locked_by = Some(worker_id.to_string());
            job.locked_until = Some(now + lease);
            job.clone()
        }))
    }

    async fn retry(&self, job: &Job, delay: Duration) -> Result<bool, QueueError> {
        let delay = TimeDelta::from_std(delay).unwrap_or(TimeDelta::MAX);
        let mut state = self.lock();
        let Some(current) = state.jobs.get_mut(&job.message_id) else {
            return Ok(false);
        };
        if !Self::holds_lease(current, job) {
            return Ok(false);
        }

        current.attempts += 1;
        current.active_at = Utc::now() + delay;
        current.locked_by = None;
        current.locked_until = None;
        Ok(true)
    }

    async fn delete(&self, job: &Job) -> Result<bool, QueueError> {
        let mut state = self.lock();
        match state.jobs.get(&job.message_id) {
            Some(current) if Self::holds_lease(current, job) => {
                state.jobs.remove(&job.message_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn len(&self) -> Result<u64, QueueError> {
        Ok(self.lock().jobs.len() as u64)
    }
}
