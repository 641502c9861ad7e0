use std::{
	collections::BTreeMap,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, OnceLock,
	},
	thread,
	time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::context::{TimerTask, Timestamp};
use crate::Lifetime;

fn epoch() -> Instant {
	static EPOCH: OnceLock<Instant> = OnceLock::new();
	*EPOCH.get_or_init(Instant::now)
}

pub(crate) fn real_timestamp() -> Timestamp {
	Timestamp::from_offset(epoch().elapsed())
}

struct Shared {
	state: Mutex<State>,
	changed: Condvar,
}

struct State {
	// Keyed by deadline, tie-broken by arming order.
	entries: BTreeMap<(Instant, u64), Entry>,
	next_id: u64,
}

struct Entry {
	period: Option<Duration>,
	task: TimerTask,
	cancelled: Arc<AtomicBool>,
}

fn shared() -> &'static Arc<Shared> {
	static SHARED: OnceLock<Arc<Shared>> = OnceLock::new();
	SHARED.get_or_init(|| {
		let shared = Arc::new(Shared {
			state: Mutex::new(State {
				entries: BTreeMap::new(),
				next_id: 0,
			}),
			changed: Condvar::new(),
		});
		thread::Builder::new()
			.name("headwater-timer".to_owned())
			.spawn({
				let shared = Arc::clone(&shared);
				move || shared.work()
			})
			.expect("failed to spawn timer thread");
		shared
	})
}

impl Shared {
	fn work(self: Arc<Self>) {
		let mut state = self.state.lock();
		loop {
			let Some((&(deadline, _), _)) = state.entries.first_key_value() else {
				self.changed.wait(&mut state);
				continue;
			};
			if deadline > Instant::now() {
				let _ = self.changed.wait_until(&mut state, deadline);
				continue;
			}
			let ((deadline, id), mut entry) = state.entries.pop_first().expect("peeked above");
			drop(state);
			if !entry.cancelled.load(Ordering::Acquire) {
				tracing::trace!(id, "timer fired");
				(entry.task)();
			}
			state = self.state.lock();
			if let Some(period) = entry.period {
				if !entry.cancelled.load(Ordering::Acquire) {
					state.entries.insert((deadline + period, id), entry);
				}
			}
		}
	}
}

/// Arms a timer on the shared deadline thread.
///
/// The handler runs *on the timer thread*; contexts wanting their own
/// discipline wrap the handler with a hop before calling this.
pub(crate) fn schedule(after: Duration, period: Option<Duration>, task: TimerTask) -> Lifetime {
	let shared = shared();
	let cancelled = Arc::new(AtomicBool::new(false));
	let deadline = Instant::now() + after;
	let id;
	{
		let mut state = shared.state.lock();
		id = state.next_id;
		state.next_id += 1;
		state.entries.insert(
			(deadline, id),
			Entry {
				period,
				task,
				cancelled: Arc::clone(&cancelled),
			},
		);
	}
	shared.changed.notify_one();
	tracing::trace!(id, ?after, periodic = period.is_some(), "timer armed");
	Lifetime::new(move || {
		cancelled.store(true, Ordering::Release);
		tracing::trace!(id, "timer cancelled");
	})
}

#[cfg(test)]
mod tests {
	use std::{
		sync::{
			atomic::{AtomicUsize, Ordering},
			Arc,
		},
		thread,
		time::Duration,
	};

	#[test]
	fn single_timer_fires_once() {
		let count = Arc::new(AtomicUsize::new(0));
		let lifetime = super::schedule(Duration::from_millis(10), None, {
			let count = Arc::clone(&count);
			Box::new(move || {
				count.fetch_add(1, Ordering::Relaxed);
			})
		});
		thread::sleep(Duration::from_millis(100));
		assert_eq!(count.load(Ordering::Relaxed), 1);
		drop(lifetime);
	}

	#[test]
	fn cancelled_timer_does_not_fire() {
		let count = Arc::new(AtomicUsize::new(0));
		let lifetime = super::schedule(Duration::from_millis(30), None, {
			let count = Arc::clone(&count);
			Box::new(move || {
				count.fetch_add(1, Ordering::Relaxed);
			})
		});
		lifetime.cancel();
		thread::sleep(Duration::from_millis(100));
		assert_eq!(count.load(Ordering::Relaxed), 0);
	}

	#[test]
	fn periodic_timer_repeats_until_cancelled() {
		let count = Arc::new(AtomicUsize::new(0));
		let lifetime = super::schedule(Duration::from_millis(5), Some(Duration::from_millis(5)), {
			let count = Arc::clone(&count);
			Box::new(move || {
				count.fetch_add(1, Ordering::Relaxed);
			})
		});
		thread::sleep(Duration::from_millis(100));
		lifetime.cancel();
		let fired = count.load(Ordering::Relaxed);
		assert!(fired >= 2, "expected repeated fires, saw {fired}");
		thread::sleep(Duration::from_millis(50));
		assert!(count.load(Ordering::Relaxed) <= fired + 1);
	}
}
