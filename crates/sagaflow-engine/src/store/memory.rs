//! In-memory store for tests and the demo CLI.
//!
//! Backed by `parking_lot` maps plus per-execution tokio mutexes for
//! leases. Queued triggers and task dispatches live in plain deques
//! standing in for the job transport; the test helpers drain them.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::event::{Event, EventPayload};
use crate::store::{
    ExecutionChanges, ExecutionLease, ExecutionRecord, QueuedTrigger, SignalMessage, SignalStatus,
    Store, StoreError, TaskDispatch, Timer, TimerStatus, TriggerReason,
};
use crate::Context;

/// Non-durable [`Store`] implementation
#[derive(Default)]
pub struct MemoryStore {
    executions: RwLock<HashMap<Uuid, ExecutionRecord>>,
    events: RwLock<HashMap<Uuid, Vec<Event>>>,
    timers: RwLock<HashMap<Uuid, Timer>>,
    signals: RwLock<HashMap<Uuid, Vec<SignalMessage>>>,
    triggers: Mutex<VecDeque<QueuedTrigger>>,
    task_queue: Mutex<VecDeque<TaskDispatch>>,
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next queued runner trigger, if any
    pub fn pop_trigger(&self) -> Option<QueuedTrigger> {
        self.triggers.lock().pop_front()
    }

    /// Next queued task dispatch, if any
    pub fn pop_task(&self) -> Option<TaskDispatch> {
        self.task_queue.lock().pop_front()
    }

    pub fn pending_triggers(&self) -> usize {
        self.triggers.lock().len()
    }

    pub fn pending_tasks(&self) -> usize {
        self.task_queue.lock().len()
    }

    pub fn event_count(&self, execution_id: Uuid) -> usize {
        self.events
            .read()
            .get(&execution_id)
            .map_or(0, Vec::len)
    }

    pub fn get_timer(&self, timer_id: Uuid) -> Option<Timer> {
        self.timers.read().get(&timer_id).cloned()
    }

    pub fn timers_for(&self, execution_id: Uuid) -> Vec<Timer> {
        let mut timers: Vec<_> = self
            .timers
            .read()
            .values()
            .filter(|timer| timer.execution_id == execution_id)
            .cloned()
            .collect();
        timers.sort_by_key(|timer| timer.run_at);
        timers
    }

    pub fn clear(&self) {
        self.executions.write().clear();
        self.events.write().clear();
        self.timers.write().clear();
        self.signals.write().clear();
        self.triggers.lock().clear();
        self.task_queue.lock().clear();
        self.locks.lock().clear();
    }

    fn ensure_execution(&self, execution_id: Uuid) -> Result<(), StoreError> {
        if self.executions.read().contains_key(&execution_id) {
            Ok(())
        } else {
            Err(StoreError::ExecutionNotFound(execution_id))
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_execution(&self, record: ExecutionRecord) -> Result<(), StoreError> {
        self.events.write().entry(record.id).or_default();
        self.executions.write().insert(record.id, record);
        Ok(())
    }

    async fn get_execution(&self, execution_id: Uuid) -> Result<ExecutionRecord, StoreError> {
        self.executions
            .read()
            .get(&execution_id)
            .cloned()
            .ok_or(StoreError::ExecutionNotFound(execution_id))
    }

    async fn update_execution(
        &self,
        execution_id: Uuid,
        changes: ExecutionChanges,
    ) -> Result<(), StoreError> {
        let mut executions = self.executions.write();
        let record = executions
            .get_mut(&execution_id)
            .ok_or(StoreError::ExecutionNotFound(execution_id))?;
        if let Some(state) = changes.state {
            record.state = state;
        }
        if let Some((index, step)) = changes.cursor {
            record.cursor_index = index;
            record.cursor_step = step;
        }
        if let Some(last_error) = changes.last_error {
            record.last_error = last_error;
        }
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn persist_context(&self, execution_id: Uuid, ctx: Context) -> Result<(), StoreError> {
        let mut executions = self.executions.write();
        let record = executions
            .get_mut(&execution_id)
            .ok_or(StoreError::ExecutionNotFound(execution_id))?;
        record.ctx = ctx;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn lock_execution(
        &self,
        execution_id: Uuid,
        block: bool,
    ) -> Result<Option<ExecutionLease>, StoreError> {
        let mutex = {
            let mut locks = self.locks.lock();
            Arc::clone(locks.entry(execution_id).or_default())
        };
        if block {
            let guard = mutex.lock_owned().await;
            Ok(Some(ExecutionLease::new(guard)))
        } else {
            match mutex.try_lock_owned() {
                Ok(guard) => Ok(Some(ExecutionLease::new(guard))),
                Err(_) => Ok(None),
            }
        }
    }

    async fn load_history(&self, execution_id: Uuid) -> Result<Vec<Event>, StoreError> {
        self.events
            .read()
            .get(&execution_id)
            .cloned()
            .ok_or(StoreError::ExecutionNotFound(execution_id))
    }

    async fn append_event(
        &self,
        execution_id: Uuid,
        payload: EventPayload,
        idempotency_key: Option<String>,
    ) -> Result<Event, StoreError> {
        let mut events = self.events.write();
        let history = events
            .get_mut(&execution_id)
            .ok_or(StoreError::ExecutionNotFound(execution_id))?;
        let event = Event {
            id: Uuid::now_v7(),
            execution_id,
            sequence: history.len() as u64 + 1,
            payload,
            idempotency_key,
            recorded_at: Utc::now(),
        };
        history.push(event.clone());
        Ok(event)
    }

    async fn enqueue_execution(
        &self,
        execution_id: Uuid,
        reason: TriggerReason,
    ) -> Result<(), StoreError> {
        self.ensure_execution(execution_id)?;
        self.triggers.lock().push_back(QueuedTrigger {
            execution_id,
            reason,
            enqueued_at: Utc::now(),
        });
        Ok(())
    }

    async fn schedule_task(&self, dispatch: TaskDispatch) -> Result<(), StoreError> {
        self.ensure_execution(dispatch.execution_id)?;
        self.task_queue.lock().push_back(dispatch);
        Ok(())
    }

    async fn insert_timer(&self, timer: Timer) -> Result<(), StoreError> {
        self.ensure_execution(timer.execution_id)?;
        self.timers.write().insert(timer.id, timer);
        Ok(())
    }

    async fn fire_timer(&self, timer_id: Uuid) -> Result<Option<Timer>, StoreError> {
        let mut timers = self.timers.write();
        let timer = timers
            .get_mut(&timer_id)
            .ok_or(StoreError::TimerNotFound(timer_id))?;
        if timer.status != TimerStatus::Scheduled {
            return Ok(None);
        }
        timer.status = TimerStatus::Fired;
        timer.fired_at = Some(Utc::now());
        Ok(Some(timer.clone()))
    }

    async fn due_timers(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Timer>, StoreError> {
        let mut due: Vec<_> = self
            .timers
            .read()
            .values()
            .filter(|timer| timer.status == TimerStatus::Scheduled && timer.run_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|timer| timer.run_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn insert_signal_message(&self, message: SignalMessage) -> Result<(), StoreError> {
        self.ensure_execution(message.execution_id)?;
        self.signals
            .write()
            .entry(message.execution_id)
            .or_default()
            .push(message);
        Ok(())
    }

    async fn consume_signal_message(
        &self,
        execution_id: Uuid,
        signal_name: &str,
    ) -> Result<Option<SignalMessage>, StoreError> {
        let mut signals = self.signals.write();
        let Some(messages) = signals.get_mut(&execution_id) else {
            return Ok(None);
        };
        let message = messages
            .iter_mut()
            .filter(|m| m.signal_name == signal_name && m.status == SignalStatus::Pending)
            .min_by_key(|m| m.received_at);
        match message {
            Some(message) => {
                message.status = SignalStatus::Consumed;
                message.consumed_at = Some(Utc::now());
                Ok(Some(message.clone()))
            }
            None => Ok(None),
        }
    }
}
