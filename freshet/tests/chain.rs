use freshet::{End, Event, Exec, SendError, Signal};

mod _validator;
use _validator::Validator;

fn tag(event: Event<i32>) -> i32 {
	match event {
		Event::Value(n) => n,
		Event::End(End::Closed) => -1,
		Event::End(End::Cancelled) => -2,
		Event::End(End::Other(_)) => -3,
	}
}

#[test]
fn values_arrive_in_send_order_through_a_direct_chain() {
	let v = Validator::new();
	let (input, signal) = Signal::create();
	let doubled = signal.transform(Exec::direct(), |event, emitter| {
		emitter.send_event(event.map(|n: i32| n * 2));
	});
	let _output = doubled.subscribe(Exec::direct(), {
		let v = v.clone();
		move |event| v.push(tag(event))
	});
	input.send_iter(1..=5).unwrap();
	input.close().unwrap();
	v.expect([2, 4, 6, 8, 10, -1]);
}

#[test]
fn order_survives_async_contexts() {
	let v = Validator::new();
	let (input, signal) = Signal::create();
	let staged = signal
		.transform(Exec::serial_async(), |event, emitter| {
			emitter.send_event(event);
		})
		.transform(Exec::global(), |event, emitter| emitter.send_event(event));
	let _output = staged.subscribe(Exec::serial_async(), {
		let v = v.clone();
		move |event| v.push(tag(event))
	});
	for n in 0..100 {
		input.send(n).unwrap();
	}
	input.close().unwrap();
	v.wait_for(101);
	v.expect((0..100).chain([-1]));
}

#[test]
fn generated_sequence_maps_through() {
	// Generate {1, 2, 3}, map v → v * 2, collect: 2, 4, 6, closed.
	let v = Validator::new();
	let doubled = Signal::generate(Exec::direct(), |input| {
		if let Some(input) = input {
			let _ = input.send_iter([1, 2, 3]);
			let _ = input.close();
		}
	})
	.transform(Exec::direct(), |event, emitter| {
		emitter.send_event(event.map(|n: i32| n * 2));
	});
	let _output = doubled.subscribe(Exec::direct(), {
		let v = v.clone();
		move |event| v.push(tag(event))
	});
	v.expect([2, 4, 6, -1]);
}

#[test]
fn subscribe_until_end_anchors_itself_and_releases_after_the_end() {
	let v = Validator::new();
	let (input, signal) = Signal::create();
	// No handle is held, yet the subscription anchors the path by itself.
	signal.subscribe_until_end(Exec::direct(), {
		let v = v.clone();
		move |event| v.push(tag(event))
	});
	input.send(1).unwrap();
	input.close().unwrap();
	v.expect([1, -1]);
	// The handler observed the end and released; the graph is gone.
	assert_eq!(input.send(2), Err(SendError::Disconnected));
}

#[test]
fn subscribe_until_end_handles_an_already_finished_source() {
	let v = Validator::new();
	Signal::from_sequence([1, 2]).subscribe_until_end(Exec::direct(), {
		let v = v.clone();
		move |event| v.push(tag(event))
	});
	v.expect([1, 2, -1]);
}

#[test]
fn a_sequence_may_end_with_a_chosen_reason() {
	let v = Validator::new();
	let _output = Signal::from_sequence_ending([1, 2], End::Cancelled).subscribe(Exec::direct(), {
		let v = v.clone();
		move |event| v.push(tag(event))
	});
	v.expect([1, 2, -2]);
}

#[test]
fn thread_affine_stages_deliver_in_order() {
	let v = Validator::new();
	let (input, signal) = Signal::create();
	let staged = signal.transform(Exec::thread_affine(), |event, emitter| {
		emitter.send_event(event);
	});
	let _output = staged.subscribe(Exec::direct(), {
		let v = v.clone();
		move |event| v.push(tag(event))
	});
	for n in 0..20 {
		input.send(n).unwrap();
	}
	input.close().unwrap();
	v.wait_for(21);
	v.expect((0..20).chain([-1]));
}

#[test]
fn first_end_is_final_on_an_edge() {
	let v = Validator::new();
	let (input, signal) = Signal::create();
	let _output = signal.subscribe(Exec::direct(), {
		let v = v.clone();
		move |event| v.push(tag(event))
	});
	input.send(1).unwrap();
	input.close().unwrap();
	assert_eq!(input.send(2), Err(SendError::Disconnected));
	assert_eq!(input.close(), Err(SendError::Disconnected));
	v.expect([1, -1]);
}

#[test]
fn sends_without_a_listener_are_discarded() {
	let (input, signal) = Signal::<i32>::create();
	assert_eq!(input.send(1), Err(SendError::Inactive));
	let v = Validator::new();
	let _output = signal.subscribe(Exec::direct(), {
		let v = v.clone();
		move |event| v.push(tag(event))
	});
	input.send(2).unwrap();
	v.expect([2]);
}

#[test]
fn dropping_the_whole_graph_disconnects_the_input() {
	let (input, signal) = Signal::<i32>::create();
	drop(signal);
	assert_eq!(input.send(1), Err(SendError::Disconnected));
}

#[test]
fn processor_panics_convert_to_other() {
	let v = Validator::new();
	let (input, signal) = Signal::create();
	let fragile = signal.transform(Exec::direct(), |event, emitter| {
		if let Event::Value(13) = &event {
			panic!("unlucky number");
		}
		emitter.send_event(event);
	});
	let _output = fragile.subscribe(Exec::direct(), {
		let v = v.clone();
		move |event| v.push(tag(event))
	});
	input.send(1).unwrap();
	input.send(13).unwrap();
	// The stage completed; the producer is disconnected from here on.
	assert_eq!(input.send(2), Err(SendError::Disconnected));
	v.expect([1, -3]);
}

#[test]
fn transforms_may_emit_zero_or_many_events() {
	let v = Validator::new();
	let (input, signal) = Signal::create();
	let stuttered = signal.transform(Exec::direct(), |event, emitter| match event {
		Event::Value(n) if n % 2 == 0 => {}
		Event::Value(n) => {
			emitter.send(n);
			emitter.send(n * 10);
		}
		Event::End(end) => emitter.end(end),
	});
	let _output = stuttered.subscribe(Exec::direct(), {
		let v = v.clone();
		move |event| v.push(tag(event))
	});
	input.send_iter([1, 2, 3]).unwrap();
	input.close().unwrap();
	v.expect([1, 10, 3, 30, -1]);
}

#[test]
fn nothing_emits_past_a_processor_emitted_end() {
	let v = Validator::new();
	let (input, signal) = Signal::create();
	let clipped = signal.transform(Exec::direct(), |event, emitter| {
		if let Event::Value(n) = event {
			emitter.send(n);
			if n == 2 {
				emitter.close();
				// Discarded: the edge already ended.
				emitter.send(99);
			}
		}
	});
	let _output = clipped.subscribe(Exec::direct(), {
		let v = v.clone();
		move |event| v.push(tag(event))
	});
	input.send_iter([1, 2]).unwrap();
	// The downstream edge ended; the upstream stage deactivated with it.
	assert_eq!(input.send(3), Err(SendError::Inactive));
	v.expect([1, 2, -1]);
}
