use std::{
	collections::VecDeque,
	sync::{Arc, OnceLock},
	thread,
	time::Duration,
};

use parking_lot::{Condvar, Mutex};

use crate::{
	context::{ExecutionContext, Task, TimerTask, Timestamp},
	timer, Lifetime,
};

/// Handle to the shared concurrent pool behind [`Exec::global`](`crate::Exec::global`).
pub(crate) struct Global;

struct Inner {
	state: Mutex<VecDeque<Task>>,
	available: Condvar,
}

//TODO: Wind the workers down when the process goes idle for long.
fn pool() -> &'static Arc<Inner> {
	static POOL: OnceLock<Arc<Inner>> = OnceLock::new();
	POOL.get_or_init(|| {
		let inner = Arc::new(Inner {
			state: Mutex::new(VecDeque::new()),
			available: Condvar::new(),
		});
		let workers = thread::available_parallelism().map_or(2, |n| n.get().max(2));
		for n in 0..workers {
			thread::Builder::new()
				.name(format!("headwater-pool-{n}"))
				.spawn({
					let inner = Arc::clone(&inner);
					move || loop {
						let mut state = inner.state.lock();
						match state.pop_front() {
							Some(task) => {
								drop(state);
								task();
							}
							None => inner.available.wait(&mut state),
						}
					}
				})
				.expect("failed to spawn pool worker");
		}
		tracing::debug!(workers, "global pool started");
		inner
	})
}

/// Queues `task` onto the shared pool.
pub(crate) fn spawn(task: Task) {
	let inner = pool();
	inner.state.lock().push_back(task);
	inner.available.notify_one();
}

impl ExecutionContext for Global {
	fn is_immediate(&self) -> bool {
		false
	}

	fn is_reentrant(&self) -> bool {
		true
	}

	fn invoke(&self, task: Task) {
		spawn(task);
	}

	fn invoke_async(&self, task: Task) {
		spawn(task);
	}

	fn invoke_sync(&self, task: &mut dyn FnMut()) {
		// The pool imposes no serialisation discipline, so the calling scope
		// is as good as any worker.
		task();
	}

	fn schedule_timer(
		&self,
		after: Duration,
		period: Option<Duration>,
		task: TimerTask,
	) -> Lifetime {
		let task = Arc::new(Mutex::new(task));
		timer::schedule(
			after,
			period,
			Box::new(move || {
				let task = Arc::clone(&task);
				spawn(Box::new(move || {
					let mut task = task.lock();
					(*task)();
				}));
			}),
		)
	}

	fn timestamp(&self) -> Timestamp {
		timer::real_timestamp()
	}
}
