use std::time::Duration;

use freshet::{Combined2, Combined3, End, Event, Exec, Signal};
use headwater::virt::VirtualClock;

mod _validator;
use _validator::Validator;

#[test]
fn per_input_ends_arrive_tagged_and_do_not_close_the_stage() {
	let (first, first_signal) = Signal::<i32>::create();
	let (second, second_signal) = Signal::<i32>::create();
	let v = Validator::new();
	let combined = first_signal.combine(second_signal, Exec::direct(), |tagged, emitter| {
		match tagged {
			Combined2::First(Event::Value(n)) => emitter.send(format!("a{n}")),
			Combined2::Second(Event::Value(n)) => emitter.send(format!("b{n}")),
			Combined2::First(Event::End(_)) => emitter.send("a-end".to_owned()),
			Combined2::Second(Event::End(_)) => {
				emitter.send("b-end".to_owned());
				emitter.close();
			}
		}
	});
	let _output = combined.subscribe(Exec::direct(), {
		let v = v.clone();
		move |event| match event {
			Event::Value(s) => v.push(s),
			Event::End(_) => v.push("end".to_owned()),
		}
	});
	first.send(1).unwrap();
	second.send(2).unwrap();
	first.close().unwrap();
	// The stage survives the first input's end and keeps serving the second.
	second.send(3).unwrap();
	second.close().unwrap();
	v.expect(
		["a1", "b2", "a-end", "b3", "b-end", "end"]
			.map(str::to_owned),
	);
}

#[test]
fn three_way_combine_tags_each_origin() {
	let (a, sa) = Signal::<i32>::create();
	let (b, sb) = Signal::<i32>::create();
	let (c, sc) = Signal::<i32>::create();
	let v = Validator::new();
	let combined = sa.combine3(sb, sc, Exec::direct(), |tagged, emitter| {
		let label = match tagged {
			Combined3::First(Event::Value(n)) => format!("a{n}"),
			Combined3::Second(Event::Value(n)) => format!("b{n}"),
			Combined3::Third(Event::Value(n)) => format!("c{n}"),
			_ => return,
		};
		emitter.send(label);
	});
	let _output = combined.subscribe_values(Exec::direct(), {
		let v = v.clone();
		move |s: String| v.push(s)
	});
	b.send(1).unwrap();
	a.send(2).unwrap();
	c.send(3).unwrap();
	v.expect(["b1", "a2", "c3"].map(str::to_owned));
}

#[test]
fn earliest_timer_wins_and_closes() {
	// T1 fires 1.0 at 1.0s, T2 fires 0.5 at 0.5s; the combine emits the
	// first value and closes: 0.5, closed.
	let clock = VirtualClock::new();
	let exec = clock.context();
	let t1 = Signal::timer(exec.clone(), Duration::from_secs(1), 1.0f64);
	let t2 = Signal::timer(exec, Duration::from_millis(500), 0.5f64);
	let v = Validator::new();
	let combined = t1.combine(t2, Exec::direct(), |tagged, emitter| match tagged {
		Combined2::First(Event::Value(n)) | Combined2::Second(Event::Value(n)) => {
			emitter.send(n);
			emitter.close();
		}
		Combined2::First(Event::End(_)) | Combined2::Second(Event::End(_)) => {}
	});
	let _output = combined.subscribe(Exec::direct(), {
		let v = v.clone();
		move |event| match event {
			Event::Value(n) => v.push(format!("{n}")),
			Event::End(End::Closed) => v.push("closed".to_owned()),
			Event::End(_) => v.push("other".to_owned()),
		}
	});
	clock.advance(Duration::from_secs(2));
	v.expect(["0.5", "closed"].map(str::to_owned));
}

#[test]
fn five_way_combine_reaches_every_arm() {
	use freshet::Combined5;

	let (a, sa) = Signal::<i32>::create();
	let (b, sb) = Signal::<i32>::create();
	let (c, sc) = Signal::<i32>::create();
	let (d, sd) = Signal::<i32>::create();
	let (e, se) = Signal::<i32>::create();
	let v = Validator::new();
	let combined = sa.combine5(sb, sc, sd, se, Exec::direct(), |tagged, emitter| {
		let label = match tagged {
			Combined5::First(Event::Value(n)) => format!("a{n}"),
			Combined5::Second(Event::Value(n)) => format!("b{n}"),
			Combined5::Third(Event::Value(n)) => format!("c{n}"),
			Combined5::Fourth(Event::Value(n)) => format!("d{n}"),
			Combined5::Fifth(Event::Value(n)) => format!("e{n}"),
			_ => return,
		};
		emitter.send(label);
	});
	let _output = combined.subscribe_values(Exec::direct(), {
		let v = v.clone();
		move |s: String| v.push(s)
	});
	e.send(5).unwrap();
	a.send(1).unwrap();
	d.send(4).unwrap();
	b.send(2).unwrap();
	c.send(3).unwrap();
	v.expect(["e5", "a1", "d4", "b2", "c3"].map(str::to_owned));
}

#[derive(Debug)]
struct Timeout;

impl std::fmt::Display for Timeout {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str("timed out")
	}
}

impl std::error::Error for Timeout {}

#[test]
fn a_timer_composes_into_a_timeout() {
	// The value arrives after 2.0s, the deadline after 1.0s: end(timeout).
	let clock = VirtualClock::new();
	let exec = clock.context();
	let slow = Signal::timer(exec.clone(), Duration::from_secs(2), "hello");
	let deadline = Signal::timer(exec, Duration::from_secs(1), ());
	let v = Validator::new();
	let timed = slow.combine(deadline, Exec::direct(), |tagged, emitter| match tagged {
		Combined2::First(Event::Value(s)) => {
			emitter.send(s);
			emitter.close();
		}
		Combined2::Second(Event::Value(())) => emitter.end(End::other(Timeout)),
		Combined2::First(Event::End(_)) | Combined2::Second(Event::End(_)) => {}
	});
	let _output = timed.subscribe(Exec::direct(), {
		let v = v.clone();
		move |event| match event {
			Event::Value(s) => v.push(s.to_owned()),
			Event::End(End::Other(error)) => v.push(format!("end:{error}")),
			Event::End(_) => v.push("end".to_owned()),
		}
	});
	clock.advance(Duration::from_secs(3));
	v.expect(["end:timed out".to_owned()]);
}
