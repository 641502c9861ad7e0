use std::{
	collections::VecDeque,
	sync::Arc,
	thread::{self, ThreadId},
	time::Duration,
};

use event_listener::{Event, Listener};
use parking_lot::{Condvar, Mutex};

use crate::{
	context::{BorrowedTask, ExecutionContext, Task, TimerTask, Timestamp},
	timer, Lifetime,
};

/// A dedicated worker thread draining a FIFO mailbox.
///
/// With `affine` set, the queue doubles as a thread-affine context: invoking
/// from the worker thread itself runs inline (and is reentrant there).
pub(crate) struct SerialQueue {
	inner: Arc<Inner>,
	affine: bool,
	worker: ThreadId,
}

struct Inner {
	state: Mutex<QueueState>,
	available: Condvar,
}

struct QueueState {
	tasks: VecDeque<Task>,
	shutdown: bool,
}

impl SerialQueue {
	pub(crate) fn spawn(affine: bool) -> Self {
		let inner = Arc::new(Inner {
			state: Mutex::new(QueueState {
				tasks: VecDeque::new(),
				shutdown: false,
			}),
			available: Condvar::new(),
		});
		let handle = thread::Builder::new()
			.name("headwater-serial".to_owned())
			.spawn({
				let inner = Arc::clone(&inner);
				move || inner.work()
			})
			.expect("failed to spawn serial queue worker");
		tracing::debug!(affine, "serial queue started");
		Self {
			inner,
			affine,
			worker: handle.thread().id(),
		}
	}

	fn on_worker(&self) -> bool {
		thread::current().id() == self.worker
	}

	fn enqueue(&self, task: Task) {
		let mut state = self.inner.state.lock();
		state.tasks.push_back(task);
		drop(state);
		self.inner.available.notify_one();
	}
}

impl Inner {
	fn work(self: Arc<Self>) {
		let mut state = self.state.lock();
		loop {
			if let Some(task) = state.tasks.pop_front() {
				drop(state);
				task();
				state = self.state.lock();
			} else if state.shutdown {
				return;
			} else {
				self.available.wait(&mut state);
			}
		}
	}
}

impl Drop for SerialQueue {
	fn drop(&mut self) {
		// The worker drains what's left, then exits. Never joined: dropping
		// from the worker thread itself must not deadlock.
		self.inner.state.lock().shutdown = true;
		self.inner.available.notify_one();
	}
}

impl ExecutionContext for SerialQueue {
	fn is_immediate(&self) -> bool {
		self.affine && self.on_worker()
	}

	fn is_reentrant(&self) -> bool {
		self.affine && self.on_worker()
	}

	fn invoke(&self, task: Task) {
		if self.affine && self.on_worker() {
			task();
		} else {
			self.enqueue(task);
		}
	}

	fn invoke_async(&self, task: Task) {
		self.enqueue(task);
	}

	fn invoke_sync(&self, task: &mut dyn FnMut()) {
		if self.on_worker() {
			// Reentrant call detected; queueing would deadlock.
			task();
			return;
		}
		let done = Arc::new(Event::new());
		let listener = done.listen();
		let task = BorrowedTask::new(task);
		self.enqueue(Box::new({
			let done = Arc::clone(&done);
			move || {
				//SAFETY: The caller below blocks until `done` is notified.
				unsafe { task.run() };
				done.notify(1);
			}
		}));
		listener.wait();
	}

	fn schedule_timer(
		&self,
		after: Duration,
		period: Option<Duration>,
		task: TimerTask,
	) -> Lifetime {
		let inner = Arc::downgrade(&self.inner);
		let task = Arc::new(Mutex::new(task));
		timer::schedule(
			after,
			period,
			Box::new(move || {
				let Some(inner) = inner.upgrade() else { return };
				let task = Arc::clone(&task);
				let mut state = inner.state.lock();
				state.tasks.push_back(Box::new(move || {
					let mut task = task.lock();
					(*task)();
				}));
				drop(state);
				inner.available.notify_one();
			}),
		)
	}

	fn timestamp(&self) -> Timestamp {
		timer::real_timestamp()
	}
}
