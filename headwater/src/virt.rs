//! Virtual time for deterministic replay.
//!
//! [`VirtualClock`] owns a queue of tasks and timers keyed by virtual
//! deadline; [`VirtualClock::context`] derives [`Exec`] handles whose
//! invocations and timers land on that queue instead of real threads.
//! Driving the clock with [`advance`](`VirtualClock::advance`) and
//! [`run_until_idle`](`VirtualClock::run_until_idle`) then executes
//! everything on the driving thread, in deadline order, FIFO at equal
//! deadlines — so any scheduling-dependent test replays identically.

use std::{
	collections::BTreeMap,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	time::Duration,
};

use parking_lot::Mutex;

use crate::{
	context::{ExecutionContext, Task, TimerTask, Timestamp},
	Exec, Lifetime,
};

/// A deterministic clock that stands in for real threads and timers.
pub struct VirtualClock {
	state: Mutex<State>,
}

struct State {
	now: Duration,
	next_seq: u64,
	// Keyed by virtual deadline, tie-broken by scheduling order.
	due: BTreeMap<(Duration, u64), Entry>,
	draining: bool,
}

enum Entry {
	Once(Task),
	Timer {
		period: Option<Duration>,
		task: Arc<Mutex<TimerTask>>,
		cancelled: Arc<AtomicBool>,
	},
}

impl VirtualClock {
	/// Creates a clock at virtual instant zero.
	#[must_use]
	pub fn new() -> Arc<Self> {
		Arc::new(Self {
			state: Mutex::new(State {
				now: Duration::ZERO,
				next_seq: 0,
				due: BTreeMap::new(),
				draining: false,
			}),
		})
	}

	/// Derives an execution context scheduling onto this clock.
	///
	/// Each derived context is serial and non-immediate: invocations queue at
	/// the current virtual instant and run when the clock is driven.
	#[must_use]
	pub fn context(self: &Arc<Self>) -> Exec {
		Exec::custom(Arc::new(VirtualExec {
			clock: Arc::clone(self),
		}))
	}

	/// The current virtual instant.
	#[must_use]
	pub fn now(&self) -> Timestamp {
		Timestamp::from_offset(self.state.lock().now)
	}

	/// Runs everything due at the current virtual instant, including work
	/// scheduled by the tasks themselves.
	pub fn run_until_idle(&self) {
		let target = self.state.lock().now;
		self.drain(target);
	}

	/// Moves the clock forward by `by`, running every queued task and timer
	/// due on the way, in deadline order.
	pub fn advance(&self, by: Duration) {
		let target = self.state.lock().now + by;
		self.drain(target);
	}

	fn schedule(&self, delay: Duration, entry: Entry) {
		let mut state = self.state.lock();
		let deadline = state.now + delay;
		let seq = state.next_seq;
		state.next_seq += 1;
		state.due.insert((deadline, seq), entry);
	}

	fn drain(&self, target: Duration) {
		let mut state = self.state.lock();
		assert!(
			!state.draining,
			"Can't drive a `VirtualClock` from within one of its own tasks."
		);
		state.draining = true;
		loop {
			let Some((&(deadline, seq), _)) = state.due.first_key_value() else {
				break;
			};
			if deadline > target {
				break;
			}
			let entry = state.due.remove(&(deadline, seq)).expect("peeked above");
			state.now = state.now.max(deadline);
			drop(state);
			match entry {
				Entry::Once(task) => task(),
				Entry::Timer {
					period,
					task,
					cancelled,
				} => {
					if !cancelled.load(Ordering::Acquire) {
						{
							let mut task = task.lock();
							(*task)();
						}
						if let Some(period) = period {
							if !cancelled.load(Ordering::Acquire) {
								let mut state = self.state.lock();
								let seq = state.next_seq;
								state.next_seq += 1;
								state.due.insert(
									(deadline + period, seq),
									Entry::Timer {
										period: Some(period),
										task,
										cancelled,
									},
								);
							}
						}
					}
				}
			}
			state = self.state.lock();
		}
		state.now = state.now.max(target);
		state.draining = false;
	}
}

struct VirtualExec {
	clock: Arc<VirtualClock>,
}

impl ExecutionContext for VirtualExec {
	fn is_immediate(&self) -> bool {
		false
	}

	fn is_reentrant(&self) -> bool {
		false
	}

	fn invoke(&self, task: Task) {
		self.clock.schedule(Duration::ZERO, Entry::Once(task));
	}

	fn invoke_async(&self, task: Task) {
		self.clock.schedule(Duration::ZERO, Entry::Once(task));
	}

	fn invoke_sync(&self, task: &mut dyn FnMut()) {
		// There is no worker to hop to; the driving thread is the context.
		task();
	}

	fn schedule_timer(
		&self,
		after: Duration,
		period: Option<Duration>,
		task: TimerTask,
	) -> Lifetime {
		let cancelled = Arc::new(AtomicBool::new(false));
		self.clock.schedule(
			after,
			Entry::Timer {
				period,
				task: Arc::new(Mutex::new(task)),
				cancelled: Arc::clone(&cancelled),
			},
		);
		Lifetime::new(move || cancelled.store(true, Ordering::Release))
	}

	fn timestamp(&self) -> Timestamp {
		self.clock.now()
	}
}
