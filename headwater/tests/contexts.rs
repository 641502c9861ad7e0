use std::{
	sync::{
		atomic::{AtomicBool, AtomicUsize, Ordering},
		Arc, Mutex,
	},
	thread,
	time::Duration,
};

use headwater::Exec;

#[test]
fn direct_runs_in_the_calling_scope() {
	let exec = Exec::direct();
	assert!(exec.is_immediate());
	let here = thread::current().id();
	let there = Arc::new(Mutex::new(None));
	exec.invoke({
		let there = Arc::clone(&there);
		move || *there.lock().unwrap() = Some(thread::current().id())
	});
	assert_eq!(*there.lock().unwrap(), Some(here));
}

#[test]
fn sync_serial_runs_one_at_a_time() {
	let exec = Exec::sync_serial();
	assert!(exec.is_immediate());
	assert!(!exec.is_reentrant());
	let busy = Arc::new(AtomicBool::new(false));
	let overlaps = Arc::new(AtomicUsize::new(0));
	let mut workers = Vec::new();
	for _ in 0..4 {
		workers.push(thread::spawn({
			let exec = exec.clone();
			let busy = Arc::clone(&busy);
			let overlaps = Arc::clone(&overlaps);
			move || {
				for _ in 0..50 {
					exec.invoke({
						let busy = Arc::clone(&busy);
						let overlaps = Arc::clone(&overlaps);
						move || {
							if busy.swap(true, Ordering::SeqCst) {
								overlaps.fetch_add(1, Ordering::SeqCst);
							}
							busy.store(false, Ordering::SeqCst);
						}
					});
				}
			}
		}));
	}
	for worker in workers {
		worker.join().unwrap();
	}
	assert_eq!(overlaps.load(Ordering::SeqCst), 0);
}

#[test]
fn recursive_serial_may_reenter_itself() {
	let exec = Exec::recursive_serial();
	assert!(exec.is_reentrant());
	let ran = Arc::new(AtomicBool::new(false));
	exec.invoke({
		let exec = exec.clone();
		let ran = Arc::clone(&ran);
		move || {
			exec.invoke(move || ran.store(true, Ordering::SeqCst));
		}
	});
	assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn serial_async_preserves_order() {
	let exec = Exec::serial_async();
	assert!(!exec.is_immediate());
	let log = Arc::new(Mutex::new(Vec::new()));
	for n in 0..100 {
		exec.invoke({
			let log = Arc::clone(&log);
			move || log.lock().unwrap().push(n)
		});
	}
	// `invoke_sync` queues behind everything above.
	exec.invoke_sync(|| ());
	assert_eq!(*log.lock().unwrap(), (0..100).collect::<Vec<_>>());
}

#[test]
fn invoke_sync_passes_the_result_back() {
	for exec in [
		Exec::direct(),
		Exec::sync_serial(),
		Exec::recursive_serial(),
		Exec::serial_async(),
		Exec::thread_affine(),
		Exec::global(),
	] {
		assert_eq!(exec.invoke_sync(|| 6 * 7), 42);
	}
}

#[test]
fn invoke_sync_from_the_queue_thread_runs_inline() {
	let exec = Exec::serial_async();
	let value = exec.invoke_sync({
		let exec = exec.clone();
		move || exec.invoke_sync(|| 9)
	});
	assert_eq!(value, 9);
}

#[test]
fn thread_affine_is_immediate_only_on_its_own_thread() {
	let exec = Exec::thread_affine();
	assert!(!exec.is_immediate());
	let immediate_inside = exec.invoke_sync({
		let exec = exec.clone();
		move || exec.is_immediate()
	});
	assert!(immediate_inside);
}

#[test]
fn global_pool_runs_work_eventually() {
	let exec = Exec::global();
	let count = Arc::new(AtomicUsize::new(0));
	for _ in 0..32 {
		exec.invoke({
			let count = Arc::clone(&count);
			move || {
				count.fetch_add(1, Ordering::SeqCst);
			}
		});
	}
	let deadline = std::time::Instant::now() + Duration::from_secs(5);
	while count.load(Ordering::SeqCst) < 32 {
		assert!(std::time::Instant::now() < deadline, "pool stalled");
		thread::sleep(Duration::from_millis(1));
	}
}

#[test]
fn timestamps_are_monotonic() {
	let exec = Exec::direct();
	let a = exec.timestamp();
	thread::sleep(Duration::from_millis(5));
	let b = exec.timestamp();
	assert!(b > a);
	assert!(b.elapsed_since(a) >= Duration::from_millis(5));
}
