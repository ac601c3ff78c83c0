//! Concurrency gate bounding in-flight polls across all subscriptions of a scheduler.
//!
//! The gate is a counter plus a FIFO queue of waiters. Slots are handed out as tickets, so a
//! slot released on behalf of a subscription (see [`ConcurrencyGate::cancel`]) can never be
//! released a second time by the permit that originally held it.

use super::types::SubscriptionId;
use crate::utils::lock;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::trace;

type Ticket = u64;

struct Waiter {
	ticket: Ticket,
	id: SubscriptionId,
	tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct GateState {
	next_ticket: Ticket,
	/// Tickets currently holding a slot.
	holders: HashMap<Ticket, SubscriptionId>,
	waiters: VecDeque<Waiter>,
}

impl GateState {
	fn issue(&mut self) -> Ticket {
		self.next_ticket += 1;
		self.next_ticket
	}

	/// Hand freed slots to queued waiters in arrival order.
	fn grant_waiters(&mut self, max: usize) {
		while self.holders.len() < max {
			let Some(waiter) = self.waiters.pop_front() else {
				break;
			};
			self.holders.insert(waiter.ticket, waiter.id.clone());
			if waiter.tx.send(()).is_err() {
				// The waiting future is gone; recycle the slot.
				self.holders.remove(&waiter.ticket);
			} else {
				trace!("Gate slot handed to queued subscription {}", waiter.id);
			}
		}
	}
}

/// Counter-and-queue limiter for simultaneous requests.
pub struct ConcurrencyGate {
	max: usize,
	state: Mutex<GateState>,
}

impl ConcurrencyGate {
	/// Create a gate admitting at most `max` holders (at least one).
	pub fn new(max: usize) -> Arc<Self> {
		Arc::new(Self {
			max: max.max(1),
			state: Mutex::new(GateState::default()),
		})
	}

	pub fn capacity(&self) -> usize {
		self.max
	}

	/// Number of slots currently held.
	pub fn in_flight(&self) -> usize {
		lock(&self.state).holders.len()
	}

	/// Number of subscriptions queued for a slot.
	pub fn waiting(&self) -> usize {
		lock(&self.state).waiters.len()
	}

	/// Wait for a slot on behalf of `id`.
	///
	/// Returns `None` if the wait was cancelled through [`ConcurrencyGate::cancel`].
	pub async fn acquire(self: &Arc<Self>, id: &SubscriptionId) -> Option<GatePermit> {
		let (ticket, rx) = {
			let mut state = lock(&self.state);
			let ticket = state.issue();
			// Newcomers never overtake queued waiters.
			if state.holders.len() < self.max && state.waiters.is_empty() {
				state.holders.insert(ticket, id.clone());
				return Some(GatePermit {
					gate: self.clone(),
					ticket,
				});
			}
			let (tx, rx) = oneshot::channel();
			state.waiters.push_back(Waiter {
				ticket,
				id: id.clone(),
				tx,
			});
			(ticket, rx)
		};

		trace!("Subscription {} queued at the gate", id);
		let mut guard = PendingWait {
			gate: self.clone(),
			ticket,
			armed: true,
		};
		let granted = rx.await.is_ok();
		guard.armed = false;

		granted.then(|| GatePermit {
			gate: self.clone(),
			ticket,
		})
	}

	/// Drop every queued wait and release every slot held by `id`. Returns the number of slots released.
	pub fn cancel(&self, id: &SubscriptionId) -> usize {
		let mut state = lock(&self.state);
		state.waiters.retain(|waiter| &waiter.id != id);
		let before = state.holders.len();
		state.holders.retain(|_, holder| holder != id);
		let released = before - state.holders.len();
		state.grant_waiters(self.max);
		released
	}

	fn release(&self, ticket: Ticket) {
		let mut state = lock(&self.state);
		if state.holders.remove(&ticket).is_some() {
			state.grant_waiters(self.max);
		}
	}

	/// A wait that ended without consuming its grant: give back whatever it held.
	fn abandon(&self, ticket: Ticket) {
		let mut state = lock(&self.state);
		state.waiters.retain(|waiter| waiter.ticket != ticket);
		if state.holders.remove(&ticket).is_some() {
			state.grant_waiters(self.max);
		}
	}
}

/// A held slot. Dropping it frees the slot unless it was already cancelled.
pub struct GatePermit {
	gate: Arc<ConcurrencyGate>,
	ticket: Ticket,
}

impl Drop for GatePermit {
	fn drop(&mut self) {
		self.gate.release(self.ticket);
	}
}

struct PendingWait {
	gate: Arc<ConcurrencyGate>,
	ticket: Ticket,
	armed: bool,
}

impl Drop for PendingWait {
	fn drop(&mut self) {
		if self.armed {
			self.gate.abandon(self.ticket);
		}
	}
}
