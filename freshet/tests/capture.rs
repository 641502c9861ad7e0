use freshet::{End, Exec, Signal};

mod _validator;
use _validator::Validator;

#[test]
fn capture_snaps_activation_values_without_going_live() {
	let capture = Signal::from_sequence([1, 2, 3]).capture();
	assert_eq!(capture.values(), [1, 2, 3]);
	assert_eq!(capture.end(), Some(End::Closed));
}

#[test]
fn capture_of_an_open_stream_holds_the_path_paused() {
	let (input, signal) = Signal::create();
	let multi = signal.continuous();
	input.send(1).unwrap();

	let capture = multi.capture();
	assert_eq!(capture.values(), [1]);
	assert_eq!(capture.end(), None);

	// Live values sent while captured are discarded at the paused edge…
	input.send(2).unwrap();
	assert_eq!(capture.values(), [1]);
}

#[test]
fn capture_resumes_with_resend() {
	let (input, signal) = Signal::create();
	let multi = signal.continuous();
	input.send(1).unwrap();
	let capture = multi.capture();
	input.send(2).unwrap();

	let v = Validator::new();
	let _output = capture.subscribe_values(true, Exec::direct(), {
		let v = v.clone();
		move |n: i32| v.push(n)
	});
	input.send(3).unwrap();
	// The captured prefix replays first, then live flow resumes. The value
	// sent while paused was discarded.
	v.expect([1, 3]);
}

#[test]
fn capture_resumes_without_resend() {
	let (input, signal) = Signal::create();
	let multi = signal.continuous();
	input.send(1).unwrap();
	let capture = multi.capture();

	let v = Validator::new();
	let _output = capture.subscribe_values(false, Exec::direct(), {
		let v = v.clone();
		move |n: i32| v.push(n)
	});
	input.send(2).unwrap();
	v.expect([2]);
}

#[test]
fn dropping_a_capture_releases_the_path() {
	let (input, signal) = Signal::create();
	let multi = signal.continuous_while_active();
	let capture = multi.capture();
	input.send(1).unwrap();
	drop(capture);
	// The path deactivated with the capture; the while-active cache cleared.
	let v = Validator::new();
	let _output = multi.subscribe_values(Exec::direct(), {
		let v = v.clone();
		move |n: i32| v.push(n)
	});
	input.send(2).unwrap();
	v.expect([2]);
}

#[test]
fn capture_observes_an_end_arriving_while_paused() {
	let (input, signal) = Signal::create();
	let multi = signal.continuous();
	input.send(1).unwrap();
	let capture = multi.capture();
	input.close().unwrap();
	assert_eq!(capture.values(), [1]);
	assert_eq!(capture.end(), Some(End::Closed));
}
