use std::{fmt::Debug, mem, sync::Arc, time::Duration};

use parking_lot::{Mutex, ReentrantMutex};

use crate::{pool, queue, timer, Lifetime};

/// A deferred unit of work.
pub type Task = Box<dyn 'static + Send + FnOnce()>;

/// A timer handler. Invoked once per fire; periodic timers fire repeatedly.
pub type TimerTask = Box<dyn 'static + Send + FnMut()>;

/// A monotonic instant, measured as offset from an epoch owned by the
/// issuing context.
///
/// # Logic
///
/// Timestamps from the same context are totally ordered and never decrease.
/// Timestamps from *different* contexts (e.g. a real and a virtual one) are
/// not comparable in any meaningful way, even though `Ord` is implemented.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(Duration);

impl Timestamp {
	/// The context epoch itself.
	pub const ZERO: Self = Self(Duration::ZERO);

	pub(crate) fn from_offset(offset: Duration) -> Self {
		Self(offset)
	}

	/// The offset from the issuing context's epoch.
	#[must_use]
	pub fn offset(self) -> Duration {
		self.0
	}

	/// Duration elapsed since `earlier`, saturating to zero.
	#[must_use]
	pub fn elapsed_since(self, earlier: Self) -> Duration {
		self.0.saturating_sub(earlier.0)
	}
}

/// Where and when closures run.
///
/// Implemented by the stock contexts behind [`Exec`] and by user extensions
/// (see [`crate::virt`] for the deterministic test pair).
///
/// # Logic
///
/// - [`invoke`](`ExecutionContext::invoke`) **must** respect the context's
///   serialisation discipline and **must** run the task in the calling scope
///   iff the context [is immediate](`ExecutionContext::is_immediate`).
/// - [`invoke_async`](`ExecutionContext::invoke_async`) **must** return
///   before the task runs.
/// - [`invoke_sync`](`ExecutionContext::invoke_sync`) **must not** return
///   before the task ran to completion. Iff the context is non-reentrant and
///   already invoking on the current thread, this **may** deadlock — that is
///   the documented caller responsibility, not a defect.
pub trait ExecutionContext: Send + Sync {
	/// Whether [`invoke`](`ExecutionContext::invoke`) runs its task in the
	/// calling scope (possibly after blocking on the discipline).
	fn is_immediate(&self) -> bool;

	/// Whether tasks on this context may re-enter it from within themselves
	/// without deadlocking.
	fn is_reentrant(&self) -> bool;

	/// Runs `task` under the context's discipline.
	fn invoke(&self, task: Task);

	/// Runs `task` under the context's discipline, strictly after returning.
	fn invoke_async(&self, task: Task);

	/// Runs `task` to completion before returning.
	///
	/// The object-safe kernel behind [`Exec::invoke_sync`].
	fn invoke_sync(&self, task: &mut dyn FnMut());

	/// Arms a timer that fires `task` once `after` elapsed, then every
	/// `period` iff one is given. The handler runs under the context's
	/// discipline. Dropping the returned [`Lifetime`] cancels pending fires.
	fn schedule_timer(&self, after: Duration, period: Option<Duration>, task: TimerTask)
		-> Lifetime;

	/// A monotonic instant on this context's clock.
	fn timestamp(&self) -> Timestamp;
}

/// Cloneable handle to an [`ExecutionContext`].
///
/// This is the value passed to every stage constructor that accepts a
/// `context`. The default for signal work is [`Exec::direct`].
#[derive(Clone)]
pub struct Exec(Arc<dyn ExecutionContext>);

impl Debug for Exec {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Exec")
			.field("immediate", &self.0.is_immediate())
			.field("reentrant", &self.0.is_reentrant())
			.finish_non_exhaustive()
	}
}

impl Exec {
	/// Runs tasks inline in the calling scope. No serialisation, reentrant.
	#[must_use]
	pub fn direct() -> Self {
		Self(Arc::new(Direct))
	}

	/// Runs tasks inline behind a mutex. One at a time, non-reentrant:
	/// re-entering from a task deadlocks.
	#[must_use]
	pub fn sync_serial() -> Self {
		Self(Arc::new(SyncSerial {
			lock: Arc::new(Mutex::new(())),
		}))
	}

	/// Runs tasks inline behind a reentrant mutex. One at a time, reentrant.
	#[must_use]
	pub fn recursive_serial() -> Self {
		Self(Arc::new(RecursiveSerial {
			lock: Arc::new(ReentrantMutex::new(())),
		}))
	}

	/// Queues tasks onto a dedicated worker thread in FIFO order.
	///
	/// Non-immediate and non-reentrant, but [`Exec::invoke_sync`] from the
	/// worker thread itself is detected and runs inline.
	#[must_use]
	pub fn serial_async() -> Self {
		Self(Arc::new(queue::SerialQueue::spawn(false)))
	}

	/// Like [`Exec::serial_async`], but immediate iff the caller already is
	/// the context's own thread (and reentrant in that case).
	#[must_use]
	pub fn thread_affine() -> Self {
		Self(Arc::new(queue::SerialQueue::spawn(true)))
	}

	/// The shared concurrent pool. Unordered, non-immediate, reentrant.
	#[must_use]
	pub fn global() -> Self {
		Self(Arc::new(pool::Global))
	}

	/// Wraps a user-provided context.
	#[must_use]
	pub fn custom(context: Arc<dyn ExecutionContext>) -> Self {
		Self(context)
	}

	/// Whether [`invoke`](`Exec::invoke`) runs its task in the calling scope.
	#[must_use]
	pub fn is_immediate(&self) -> bool {
		self.0.is_immediate()
	}

	/// Whether tasks may re-enter this context from within themselves.
	#[must_use]
	pub fn is_reentrant(&self) -> bool {
		self.0.is_reentrant()
	}

	/// Runs `task` under the context's discipline.
	pub fn invoke(&self, task: impl 'static + Send + FnOnce()) {
		self.0.invoke(Box::new(task));
	}

	/// Runs `task` under the context's discipline, strictly after returning.
	pub fn invoke_async(&self, task: impl 'static + Send + FnOnce()) {
		self.0.invoke_async(Box::new(task));
	}

	/// Runs `task` to completion before returning and passes its result back.
	///
	/// # Logic
	///
	/// **May** deadlock iff called re-entrantly on a non-reentrant context;
	/// see [`ExecutionContext::invoke_sync`].
	pub fn invoke_sync<R>(&self, task: impl FnOnce() -> R) -> R {
		let mut task = Some(task);
		let mut result = None;
		self.0.invoke_sync(&mut || {
			result = Some(task.take().expect("called at most once")());
		});
		result.expect("ran to completion")
	}

	/// Arms a one-shot timer. See [`ExecutionContext::schedule_timer`].
	pub fn single_timer(
		&self,
		interval: Duration,
		handler: impl 'static + Send + FnOnce(),
	) -> Lifetime {
		let mut handler = Some(handler);
		self.0.schedule_timer(
			interval,
			None,
			Box::new(move || {
				if let Some(handler) = handler.take() {
					handler();
				}
			}),
		)
	}

	/// Arms a periodic timer. See [`ExecutionContext::schedule_timer`].
	pub fn periodic_timer(
		&self,
		interval: Duration,
		handler: impl 'static + Send + FnMut(),
	) -> Lifetime {
		self.0
			.schedule_timer(interval, Some(interval), Box::new(handler))
	}

	/// A monotonic instant on this context's clock.
	#[must_use]
	pub fn timestamp(&self) -> Timestamp {
		self.0.timestamp()
	}
}

impl Default for Exec {
	fn default() -> Self {
		Self::direct()
	}
}

struct Direct;

impl ExecutionContext for Direct {
	fn is_immediate(&self) -> bool {
		true
	}

	fn is_reentrant(&self) -> bool {
		true
	}

	fn invoke(&self, task: Task) {
		task();
	}

	fn invoke_async(&self, task: Task) {
		pool::spawn(task);
	}

	fn invoke_sync(&self, task: &mut dyn FnMut()) {
		task();
	}

	fn schedule_timer(
		&self,
		after: Duration,
		period: Option<Duration>,
		task: TimerTask,
	) -> Lifetime {
		timer::schedule(after, period, task)
	}

	fn timestamp(&self) -> Timestamp {
		timer::real_timestamp()
	}
}

struct SyncSerial {
	lock: Arc<Mutex<()>>,
}

impl ExecutionContext for SyncSerial {
	fn is_immediate(&self) -> bool {
		true
	}

	fn is_reentrant(&self) -> bool {
		false
	}

	fn invoke(&self, task: Task) {
		let _guard = self.lock.lock();
		task();
	}

	fn invoke_async(&self, task: Task) {
		let lock = Arc::clone(&self.lock);
		pool::spawn(Box::new(move || {
			let _guard = lock.lock();
			task();
		}));
	}

	fn invoke_sync(&self, task: &mut dyn FnMut()) {
		let _guard = self.lock.lock();
		task();
	}

	fn schedule_timer(
		&self,
		after: Duration,
		period: Option<Duration>,
		mut task: TimerTask,
	) -> Lifetime {
		let lock = Arc::clone(&self.lock);
		timer::schedule(
			after,
			period,
			Box::new(move || {
				let _guard = lock.lock();
				task();
			}),
		)
	}

	fn timestamp(&self) -> Timestamp {
		timer::real_timestamp()
	}
}

struct RecursiveSerial {
	lock: Arc<ReentrantMutex<()>>,
}

impl ExecutionContext for RecursiveSerial {
	fn is_immediate(&self) -> bool {
		true
	}

	fn is_reentrant(&self) -> bool {
		true
	}

	fn invoke(&self, task: Task) {
		let _guard = self.lock.lock();
		task();
	}

	fn invoke_async(&self, task: Task) {
		let lock = Arc::clone(&self.lock);
		pool::spawn(Box::new(move || {
			let _guard = lock.lock();
			task();
		}));
	}

	fn invoke_sync(&self, task: &mut dyn FnMut()) {
		let _guard = self.lock.lock();
		task();
	}

	fn schedule_timer(
		&self,
		after: Duration,
		period: Option<Duration>,
		mut task: TimerTask,
	) -> Lifetime {
		let lock = Arc::clone(&self.lock);
		timer::schedule(
			after,
			period,
			Box::new(move || {
				let _guard = lock.lock();
				task();
			}),
		)
	}

	fn timestamp(&self) -> Timestamp {
		timer::real_timestamp()
	}
}

/// Extends a closure reference to `'static` so it can cross into a worker.
///
/// # Safety
///
/// The caller **must not** return before the wrapped closure ran (or is
/// guaranteed never to run). `invoke_sync` implementations uphold this by
/// blocking on a completion event.
pub(crate) struct BorrowedTask(*mut (dyn FnMut() + 'static));

unsafe impl Send for BorrowedTask {}

impl BorrowedTask {
	pub(crate) fn new(task: &mut dyn FnMut()) -> Self {
		//SAFETY: Lifetime extension only. The pointer never outlives the
		//        borrow because every user blocks until the task completed.
		Self(unsafe {
			mem::transmute::<*mut (dyn FnMut() + '_), *mut (dyn FnMut() + 'static)>(task)
		})
	}

	pub(crate) unsafe fn run(&self) {
		(*self.0)();
	}
}
