#![allow(dead_code)]

use std::{
	collections::VecDeque,
	fmt::Debug,
	sync::{Arc, Mutex},
	thread,
	time::{Duration, Instant},
};

/// Ordered observation log shared between test bodies and handlers.
#[derive(Clone)]
pub struct Validator<T>(Arc<Mutex<VecDeque<T>>>);

impl<T> Validator<T> {
	pub fn new() -> Self {
		Self(Arc::new(Mutex::new(VecDeque::new())))
	}

	pub fn push(&self, value: T) {
		self.0.lock().unwrap().push_back(value);
	}

	pub fn len(&self) -> usize {
		self.0.lock().unwrap().len()
	}

	/// Spins until `len` observations arrived. Panics after five seconds.
	#[track_caller]
	pub fn wait_for(&self, len: usize) {
		let deadline = Instant::now() + Duration::from_secs(5);
		while self.len() < len {
			assert!(
				Instant::now() < deadline,
				"timed out waiting for {len} observations, saw {}",
				self.len()
			);
			thread::sleep(Duration::from_millis(1));
		}
	}

	#[track_caller]
	pub fn expect(&self, expected: impl IntoIterator<Item = T>)
	where
		T: Debug + Eq,
	{
		let mut binding = self.0.lock().unwrap();
		let mut a = binding.drain(..);
		let mut b = expected.into_iter();
		loop {
			match (a.next(), b.next()) {
				(None, None) => break,
				(a, b) => assert_eq!(a, b),
			}
		}
	}
}
