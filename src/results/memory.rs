use super::types::*;
use crate::error::StoreError;
use crate::executor::types::TaskId;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// In-process Result Store.
///
/// The check-and-set of a transition runs under the DashMap shard lock, so two
/// workers racing on the same id cannot both win a terminal write.
pub struct MemoryResultStore {
    records: DashMap<TaskId, TaskRecord>,
    online: AtomicBool,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            online: AtomicBool::new(true),
        }
    }

    /// Simulates the store becoming unreachable.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn ensure_online(&self) -> Result<(), StoreError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-process result store is offline".to_string()))
        }
    }
}

impl Default for MemoryResultStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn get(&self, task_id: &TaskId) -> Result<Option<TaskRecord>, StoreError> {
        self.ensure_online()?;
        Ok(self.records.get(task_id).map(|entry| entry.value().clone()))
    }

    async fn transition(
        &self,
        task_id: &TaskId,
        name: &str,
        next: TaskState,
    ) -> Result<bool, StoreError> {
        self.ensure_online()?;

        match self.records.entry(task_id.clone()) {
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                if !record.state.can_transition_to(&next) {
                    tracing::debug!(
                        "Refused transition of task {} from {} to {}",
                        task_id,
                        record.state.label(),
                        next.label()
                    );
                    return Ok(false);
                }
                if next == TaskState::Started {
                    record.attempts += 1;
                }
                record.state = next;
                record.updated_at = Utc::now();
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                let attempts = u32::from(next == TaskState::Started);
                vacant.insert(TaskRecord {
                    task_id: task_id.clone(),
                    name: name.to_string(),
                    state: next,
                    attempts,
                    updated_at: Utc::now(),
                });
                Ok(true)
            }
        }
    }
}
