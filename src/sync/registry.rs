//! Table of running subscription tasks.
//!
//! Each subscription owns exactly one spawned task, which is the only place its timer lives.
//! Inserting over an existing id aborts the previous task first, so two timers can never run for
//! the same subscription.

use super::types::SubscriptionId;
use crate::utils::lock;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

struct TaskSlot<E> {
	entry: Arc<E>,
	handle: JoinHandle<()>,
}

pub(crate) struct TaskRegistry<E> {
	tasks: Mutex<HashMap<SubscriptionId, TaskSlot<E>>>,
}

impl<E> TaskRegistry<E> {
	pub(crate) fn new() -> Self {
		Self {
			tasks: Mutex::new(HashMap::new()),
		}
	}

	/// Register a running task. Returns the entry it displaced, whose task has been aborted.
	pub(crate) fn insert(
		&self,
		id: SubscriptionId,
		entry: Arc<E>,
		handle: JoinHandle<()>,
	) -> Option<Arc<E>> {
		let previous = lock(&self.tasks).insert(id, TaskSlot { entry, handle });
		previous.map(|slot| {
			slot.handle.abort();
			slot.entry
		})
	}

	/// Abort and forget the task for `id`.
	pub(crate) fn remove(&self, id: &SubscriptionId) -> Option<Arc<E>> {
		let slot = lock(&self.tasks).remove(id)?;
		slot.handle.abort();
		Some(slot.entry)
	}

	/// Abort and forget every task.
	pub(crate) fn drain(&self) -> Vec<(SubscriptionId, Arc<E>)> {
		let slots: Vec<_> = lock(&self.tasks).drain().collect();
		slots
			.into_iter()
			.map(|(id, slot)| {
				slot.handle.abort();
				(id, slot.entry)
			})
			.collect()
	}

	pub(crate) fn get(&self, id: &SubscriptionId) -> Option<Arc<E>> {
		lock(&self.tasks).get(id).map(|slot| slot.entry.clone())
	}

	pub(crate) fn contains(&self, id: &SubscriptionId) -> bool {
		lock(&self.tasks).contains_key(id)
	}

	pub(crate) fn len(&self) -> usize {
		lock(&self.tasks).len()
	}

	pub(crate) fn ids(&self) -> Vec<SubscriptionId> {
		lock(&self.tasks).keys().cloned().collect()
	}
}
