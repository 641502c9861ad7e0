use std::time::Duration;

use freshet::{Exec, SendError, Signal, SignalInput};
use headwater::virt::VirtualClock;

mod _validator;
use _validator::Validator;

#[test]
fn detaching_the_only_output_leaves_the_stage_reattachable() {
	let (input, signal) = Signal::create();
	let copy = signal.clone();

	let first = Validator::new();
	let output = signal.subscribe_values(Exec::direct(), {
		let first = first.clone();
		move |n: i32| first.push(n)
	});
	input.send(1).unwrap();
	drop(output);

	// Equivalent to the pre-attachment state: sends are discarded again…
	assert_eq!(input.send(2), Err(SendError::Inactive));

	// …and a fresh subscription works.
	let second = Validator::new();
	let _output = copy.subscribe_values(Exec::direct(), {
		let second = second.clone();
		move |n: i32| second.push(n)
	});
	input.send(3).unwrap();
	first.expect([1]);
	second.expect([3]);
}

#[test]
fn generate_sees_each_activation_and_deactivation() {
	let log = Validator::new();
	let signal = Signal::generate(Exec::direct(), {
		let log = log.clone();
		let mut held: Option<SignalInput<i32>> = None;
		move |input| match input {
			Some(input) => {
				log.push("up");
				held = Some(input);
			}
			None => {
				log.push("down");
				held = None;
			}
		}
	});
	let copy = signal.clone();

	let output = signal.subscribe(Exec::direct(), |_| {});
	log.expect(["up"]);
	drop(output);
	log.expect(["down"]);

	let output = copy.subscribe(Exec::direct(), |_| {});
	log.expect(["up"]);
	drop(output);
	log.expect(["down"]);
}

#[test]
fn deactivation_releases_pending_timers() {
	let clock = VirtualClock::new();
	let exec = clock.context();
	let signal = Signal::timer(exec, Duration::from_secs(1), 7);

	let missed = Validator::new();
	let output = signal.clone().subscribe_values(Exec::direct(), {
		let missed = missed.clone();
		move |n: i32| missed.push(n)
	});
	drop(output);
	clock.advance(Duration::from_secs(2));
	missed.expect([]);

	// Re-activation arms a fresh timer.
	let hit = Validator::new();
	let _output = signal.subscribe_values(Exec::direct(), {
		let hit = hit.clone();
		move |n: i32| hit.push(n)
	});
	clock.advance(Duration::from_secs(1));
	hit.expect([7]);
}

#[test]
fn one_shot_sources_complete_instead_of_deactivating() {
	let signal = Signal::from_sequence([1, 2]);
	let copy = signal.clone();

	let first = Validator::new();
	let output = signal.subscribe_values(Exec::direct(), {
		let first = first.clone();
		move |n: i32| first.push(n)
	});
	first.expect([1, 2]);
	drop(output);

	// The sequence played once; a later subscriber only learns the outcome.
	let second = Validator::new();
	let _output = copy.subscribe(Exec::direct(), {
		let second = second.clone();
		move |event| second.push(event)
	});
	assert_eq!(second.len(), 1);
}
