//! The multi-listener stage ("hub"): a user-definable replay cache fanning
//! out to any number of child edges.
//!
//! Every preset policy (`continuous`, `playback`, `multicast`, …) is this
//! one mechanism with a preset updater. Replay to a joining child happens
//! under the hub's critical section, so a new subscriber can never observe
//! a live value before its replay prefix. The critical section is a
//! reentrant mutex over interior cells; re-entrant deliveries (a processor
//! looping back into its own hub) are queued and drained by the outermost
//! invocation instead of recursing.

use std::{
	cell::{Cell, RefCell},
	collections::VecDeque,
	panic::{catch_unwind, AssertUnwindSafe},
	sync::{Arc, Weak},
};

use headwater::Exec;
use parking_lot::{Mutex, ReentrantMutex};

use crate::{
	event::{End, Event, ProcessorPanicked},
	node::{panic_message, AttachOptions, Delivery, Node, Sink, SinkRef, SourceHook},
};

/// Mutates the replay cache for every event passing the stage.
pub(crate) type Updater<T> = Box<dyn Send + FnMut(&mut Vec<T>, &mut Option<End>, Event<T>)>;

#[derive(Clone, Copy, Debug)]
pub(crate) struct ReplayPolicy {
	/// Absorb events arriving ahead of the first activation.
	pub(crate) buffer_inactive: bool,
	/// Clear cached values when the last subscriber departs.
	pub(crate) clear_when_idle: bool,
	/// Flush the cache to the first subscriber and stop caching afterwards.
	pub(crate) replay_once: bool,
}

impl ReplayPolicy {
	pub(crate) const CACHING: Self = Self {
		buffer_inactive: true,
		clear_when_idle: false,
		replay_once: false,
	};
	pub(crate) const WHILE_ACTIVE: Self = Self {
		buffer_inactive: false,
		clear_when_idle: true,
		replay_once: false,
	};
	pub(crate) const UNTIL_ACTIVE: Self = Self {
		buffer_inactive: true,
		clear_when_idle: false,
		replay_once: true,
	};
	pub(crate) const PASSTHROUGH: Self = Self {
		buffer_inactive: false,
		clear_when_idle: false,
		replay_once: false,
	};
}

struct HubCache<T: Send + 'static> {
	updater: Updater<T>,
	values: Vec<T>,
	end: Option<End>,
	policy: ReplayPolicy,
	replayed_once: bool,
	children: Vec<Weak<Node<T>>>,
	active_children: usize,
}

/// Shared state behind the reentrant critical section.
struct HubCritical<T: Send + 'static> {
	cache: RefCell<HubCache<T>>,
	/// Re-entrant deliveries park here and drain in the outermost call.
	queue: RefCell<VecDeque<(Event<T>, Delivery)>>,
	draining: Cell<bool>,
}

pub(crate) struct Hub<T: Send + Clone + 'static> {
	this: Weak<Hub<T>>,
	critical: ReentrantMutex<HubCritical<T>>,
	/// The edge feeding this hub. Children anchor the whole upstream path
	/// through the hub; the edge holds the hub weakly in return.
	source: Arc<Node<T>>,
}

impl<T: Send + Clone + 'static> Hub<T> {
	pub(crate) fn new(
		source: Arc<Node<T>>,
		exec: Exec,
		initial: Vec<T>,
		updater: Updater<T>,
		policy: ReplayPolicy,
	) -> Arc<Self> {
		let hub = Arc::new_cyclic(|this| Self {
			this: this.clone(),
			critical: ReentrantMutex::new(HubCritical {
				cache: RefCell::new(HubCache {
					updater,
					values: initial,
					end: None,
					policy,
					replayed_once: false,
					children: Vec::new(),
					active_children: 0,
				}),
				queue: RefCell::new(VecDeque::new()),
				draining: Cell::new(false),
			}),
			source,
		});
		let sink: Weak<dyn Sink<T>> = hub.this.clone();
		hub.source.attach(
			exec,
			SinkRef::Weak(sink),
			AttachOptions {
				paused: false,
				inline_inactive: policy.buffer_inactive,
				activate: false,
			},
		);
		hub
	}

	/// Derives a fresh single-listener edge fed by this hub.
	///
	/// The edge stays unregistered until something downstream activates it;
	/// joining and departing then run through [`Hub::adopt`]/[`Hub::orphan`].
	pub(crate) fn spawn_child(self: &Arc<Self>) -> Arc<Node<T>> {
		Node::new(
			Vec::new(),
			Some(Arc::new(HubAttachment {
				hub: Arc::clone(self),
				child: Mutex::new(Weak::new()),
			})),
		)
	}

	/// Joins `child`: activates the upstream edge iff this is the first
	/// subscriber, replays the cache snapshot synchronously, then registers
	/// the child for live delivery. Atomic relative to live delivery.
	fn adopt(&self, child: &Arc<Node<T>>) {
		let lock = self.critical.lock();
		let first = lock.cache.borrow().active_children == 0;
		if first {
			// Upstream activation replay lands in `process` on this thread
			// and reaches the cache before the snapshot below.
			self.source.activate();
		}
		let (snapshot, end) = {
			let mut cache = lock.cache.borrow_mut();
			cache.active_children += 1;
			if cache.policy.replay_once && cache.replayed_once {
				(Vec::new(), cache.end.clone())
			} else {
				let snapshot = if cache.policy.replay_once {
					cache.replayed_once = true;
					std::mem::take(&mut cache.values)
				} else {
					cache.values.clone()
				};
				(snapshot, cache.end.clone())
			}
		};
		for value in snapshot {
			if child
				.send_with(Event::Value(value), Delivery::Replay)
				.is_err()
			{
				break;
			}
		}
		if let Some(end) = end {
			let _ = child.send_with(Event::End(end), Delivery::Replay);
		}
		lock.cache
			.borrow_mut()
			.children
			.push(Arc::downgrade(child));
	}

	/// Mirror of [`Hub::adopt`].
	fn orphan(&self, child: &Weak<Node<T>>) {
		let lock = self.critical.lock();
		let idle = {
			let mut cache = lock.cache.borrow_mut();
			cache.children.retain(|entry| !entry.ptr_eq(child));
			cache.active_children = cache.active_children.saturating_sub(1);
			if cache.active_children == 0 && cache.policy.clear_when_idle {
				cache.values.clear();
			}
			cache.active_children == 0
		};
		if idle {
			self.source.deactivate();
		}
	}

	fn handle(&self, critical: &HubCritical<T>, event: Event<T>, delivery: Delivery) -> Option<End> {
		let mut failure = None;
		let targets: Vec<Arc<Node<T>>> = {
			let mut cache = critical.cache.borrow_mut();
			let caching = !(cache.policy.replay_once && cache.replayed_once);
			if caching {
				let HubCache {
					updater,
					values,
					end,
					..
				} = &mut *cache;
				let update = catch_unwind(AssertUnwindSafe(|| {
					updater(values, end, event.clone());
				}));
				if let Err(payload) = update {
					let end = End::other(ProcessorPanicked(panic_message(&payload)));
					cache.end.get_or_insert_with(|| end.clone());
					failure = Some(end);
				}
			} else if let Some(end) = event.as_end() {
				// Values caching is over after the flush, but the terminal
				// end still matters to late joiners.
				cache.end.get_or_insert(end.clone());
			}
			cache.children.retain(|child| child.strong_count() > 0);
			cache.children.iter().filter_map(Weak::upgrade).collect()
		};
		if let Some(end) = &failure {
			for child in targets {
				let _ = child.send_with(Event::End(end.clone()), delivery);
			}
			return failure;
		}
		for child in targets {
			let _ = child.send_with(event.clone(), delivery);
		}
		None
	}
}

impl<T: Send + Clone + 'static> Sink<T> for Hub<T> {
	fn process(&self, event: Event<T>, delivery: Delivery) -> Option<End> {
		let lock = self.critical.lock();
		if lock.draining.get() {
			lock.queue.borrow_mut().push_back((event, delivery));
			return None;
		}
		lock.draining.set(true);
		let mut failure = self.handle(&lock, event, delivery);
		while failure.is_none() {
			let queued = lock.queue.borrow_mut().pop_front();
			let Some((event, delivery)) = queued else {
				break;
			};
			failure = self.handle(&lock, event, delivery);
		}
		lock.draining.set(false);
		failure
	}
}

/// Source hook of a hub child edge: joining the hub *is* its activation.
struct HubAttachment<T: Send + Clone + 'static> {
	hub: Arc<Hub<T>>,
	child: Mutex<Weak<Node<T>>>,
}

impl<T: Send + Clone + 'static> SourceHook<T> for HubAttachment<T> {
	fn on_activate(&self, node: &Arc<Node<T>>) {
		*self.child.lock() = Arc::downgrade(node);
		self.hub.adopt(node);
	}

	fn on_deactivate(&self) {
		let child = self.child.lock().clone();
		self.hub.orphan(&child);
	}
}

/// Keeps the most recent value (and the terminal end).
pub(crate) fn continuous_updater<T: Send>() -> Updater<T> {
	Box::new(|values, end, event| match event {
		Event::Value(value) => {
			values.clear();
			values.push(value);
		}
		Event::End(e) => {
			end.get_or_insert(e);
		}
	})
}

/// Keeps every value ever emitted, in order. Unbounded.
pub(crate) fn playback_updater<T: Send>() -> Updater<T> {
	Box::new(|values, end, event| match event {
		Event::Value(value) => values.push(value),
		Event::End(e) => {
			end.get_or_insert(e);
		}
	})
}

/// Caches nothing; still records the terminal end for post-end joiners.
pub(crate) fn passive_updater<T: Send>() -> Updater<T> {
	Box::new(|_values, end, event| {
		if let Event::End(e) = event {
			end.get_or_insert(e);
		}
	})
}
