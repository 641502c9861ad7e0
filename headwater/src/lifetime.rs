use std::mem;

use parking_lot::Mutex;

/// A cancel-on-drop handle.
///
/// Every attachment and timer hands one of these back; holding it keeps the
/// attached resource alive, dropping it releases the resource.
///
/// # Logic
///
/// [`cancel`](`Lifetime::cancel`) **must** be idempotent: the cleanup closure
/// runs at most once, whether triggered explicitly or by dropping.
#[must_use = "A `Lifetime` cancels when dropped. Bind it to keep the resource alive."]
pub struct Lifetime(Mutex<Inner>);

enum Inner {
	Armed(Box<dyn 'static + Send + FnOnce()>),
	Spent,
}

impl Lifetime {
	/// Creates a [`Lifetime`] that runs `on_cancel` when cancelled or dropped.
	pub fn new(on_cancel: impl 'static + Send + FnOnce()) -> Self {
		Self(Mutex::new(Inner::Armed(Box::new(on_cancel))))
	}

	/// Creates an already-spent [`Lifetime`]. Cancelling it does nothing.
	pub fn empty() -> Self {
		Self(Mutex::new(Inner::Spent))
	}

	/// Bundles several [`Lifetime`]s into one that cancels all of them in order.
	pub fn aggregate(lifetimes: impl IntoIterator<Item = Lifetime>) -> Self {
		let lifetimes: Vec<Lifetime> = lifetimes.into_iter().collect();
		Self::new(move || {
			for lifetime in &lifetimes {
				lifetime.cancel();
			}
		})
	}

	/// Runs the cleanup closure now, iff it hasn't run yet.
	pub fn cancel(&self) {
		let on_cancel = match mem::replace(&mut *self.0.lock(), Inner::Spent) {
			Inner::Armed(on_cancel) => on_cancel,
			Inner::Spent => return,
		};
		// Runs with the slot unlocked, so cleanup may recurse into this handle.
		on_cancel();
	}

	/// Whether the cleanup closure already ran.
	#[must_use]
	pub fn is_spent(&self) -> bool {
		matches!(&*self.0.lock(), Inner::Spent)
	}
}

impl Drop for Lifetime {
	fn drop(&mut self) {
		self.cancel();
	}
}

impl std::fmt::Debug for Lifetime {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_tuple("Lifetime")
			.field(&if self.is_spent() { "Spent" } else { "Armed" })
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::{
		atomic::{AtomicUsize, Ordering},
		Arc,
	};

	use super::Lifetime;

	#[test]
	fn cancel_is_idempotent() {
		let count = Arc::new(AtomicUsize::new(0));
		let lifetime = Lifetime::new({
			let count = Arc::clone(&count);
			move || {
				count.fetch_add(1, Ordering::Relaxed);
			}
		});
		lifetime.cancel();
		lifetime.cancel();
		drop(lifetime);
		assert_eq!(count.load(Ordering::Relaxed), 1);
	}

	#[test]
	fn aggregate_cancels_in_order() {
		let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
		let entry = |n: usize| {
			let log = Arc::clone(&log);
			Lifetime::new(move || log.lock().push(n))
		};
		let bundle = Lifetime::aggregate([entry(1), entry(2), entry(3)]);
		bundle.cancel();
		assert_eq!(*log.lock(), [1, 2, 3]);
	}
}
