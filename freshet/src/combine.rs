//! The fan-in primitive: 2–5 typed input edges feeding one stage.
//!
//! Each input's events arrive at the processor *tagged* with their origin —
//! including that input's end, which is visible as a tagged value and never
//! terminates the stage by itself. Only an end the processor emits (or a
//! caught processor panic) completes the combine stage. The stage is
//! non-reentrant across all of its inputs: while the processor runs, events
//! from every input defer.

use std::sync::{Arc, Weak};

use headwater::Exec;

use crate::{
	event::{End, Event},
	node::{AttachOptions, Delivery, Node, Sink, SinkRef, Upstream},
	signal::{Emitter, ProcessorSink, Signal},
};

/// Event of a two-way combine, tagged by origin.
#[derive(Clone, Debug, PartialEq)]
pub enum Combined2<A, B> {
	/// From the first input.
	First(Event<A>),
	/// From the second input.
	Second(Event<B>),
}

/// Event of a three-way combine, tagged by origin.
#[derive(Clone, Debug, PartialEq)]
pub enum Combined3<A, B, C> {
	/// From the first input.
	First(Event<A>),
	/// From the second input.
	Second(Event<B>),
	/// From the third input.
	Third(Event<C>),
}

/// Event of a four-way combine, tagged by origin.
#[derive(Clone, Debug, PartialEq)]
pub enum Combined4<A, B, C, D> {
	/// From the first input.
	First(Event<A>),
	/// From the second input.
	Second(Event<B>),
	/// From the third input.
	Third(Event<C>),
	/// From the fourth input.
	Fourth(Event<D>),
}

/// Event of a five-way combine, tagged by origin.
#[derive(Clone, Debug, PartialEq)]
pub enum Combined5<A, B, C, D, E> {
	/// From the first input.
	First(Event<A>),
	/// From the second input.
	Second(Event<B>),
	/// From the third input.
	Third(Event<C>),
	/// From the fourth input.
	Fourth(Event<D>),
	/// From the fifth input.
	Fifth(Event<E>),
}

/// Wraps one input's events into the stage's tagged sum. The input edge
/// completes itself after its end; the tagged end already went through.
struct AdapterSink<In: Send + 'static, Mid: Send + 'static> {
	dest: Weak<Node<Mid>>,
	wrap: fn(Event<In>) -> Mid,
}

impl<In: Send + 'static, Mid: Send + 'static> Sink<In> for AdapterSink<In, Mid> {
	fn process(&self, event: Event<In>, delivery: Delivery) -> Option<End> {
		if let Some(dest) = self.dest.upgrade() {
			let _ = dest.send_with(Event::Value((self.wrap)(event)), delivery);
		}
		None
	}
}

fn attach_arm<In: Send + 'static, Mid: Send + 'static>(
	source: &Arc<Node<In>>,
	mid: &Arc<Node<Mid>>,
	wrap: fn(Event<In>) -> Mid,
) {
	let sink: Arc<dyn Sink<In>> = Arc::new(AdapterSink {
		dest: Arc::downgrade(mid),
		wrap,
	});
	source.attach(Exec::direct(), SinkRef::Strong(sink), AttachOptions::PASSIVE);
}

fn attach_stage<Mid: Send + 'static, Out: Send + 'static>(
	mid: &Arc<Node<Mid>>,
	exec: Exec,
	mut processor: impl 'static + Send + FnMut(Mid, &mut Emitter<Out>),
) -> Signal<Out> {
	let pred: Arc<dyn Upstream> = mid.clone();
	let out = Node::new(vec![pred], None);
	let sink: Arc<dyn Sink<Mid>> = Arc::new(ProcessorSink::new(
		move |event: Event<Mid>, emitter: &mut Emitter<Out>| match event {
			Event::Value(tagged) => processor(tagged, emitter),
			Event::End(end) => emitter.end(end),
		},
		Arc::downgrade(&out),
	));
	mid.attach(exec, SinkRef::Strong(sink), AttachOptions::PASSIVE);
	Signal::from_node(out)
}

impl<T: Send + 'static> Signal<T> {
	/// Combines two signals into one stage. See the module documentation.
	pub fn combine<B, U>(
		self,
		second: Signal<B>,
		exec: Exec,
		processor: impl 'static + Send + FnMut(Combined2<T, B>, &mut Emitter<U>),
	) -> Signal<U>
	where
		B: Send + 'static,
		U: Send + 'static,
	{
		let a = self.into_node();
		let b = second.into_node();
		let pa: Arc<dyn Upstream> = a.clone();
		let pb: Arc<dyn Upstream> = b.clone();
		let mid: Arc<Node<Combined2<T, B>>> = Node::new(vec![pa, pb], None);
		attach_arm(&a, &mid, Combined2::First);
		attach_arm(&b, &mid, Combined2::Second);
		attach_stage(&mid, exec, processor)
	}

	/// Combines three signals into one stage.
	pub fn combine3<B, C, U>(
		self,
		second: Signal<B>,
		third: Signal<C>,
		exec: Exec,
		processor: impl 'static + Send + FnMut(Combined3<T, B, C>, &mut Emitter<U>),
	) -> Signal<U>
	where
		B: Send + 'static,
		C: Send + 'static,
		U: Send + 'static,
	{
		let a = self.into_node();
		let b = second.into_node();
		let c = third.into_node();
		let pa: Arc<dyn Upstream> = a.clone();
		let pb: Arc<dyn Upstream> = b.clone();
		let pc: Arc<dyn Upstream> = c.clone();
		let mid: Arc<Node<Combined3<T, B, C>>> = Node::new(vec![pa, pb, pc], None);
		attach_arm(&a, &mid, Combined3::First);
		attach_arm(&b, &mid, Combined3::Second);
		attach_arm(&c, &mid, Combined3::Third);
		attach_stage(&mid, exec, processor)
	}

	/// Combines four signals into one stage.
	pub fn combine4<B, C, D, U>(
		self,
		second: Signal<B>,
		third: Signal<C>,
		fourth: Signal<D>,
		exec: Exec,
		processor: impl 'static + Send + FnMut(Combined4<T, B, C, D>, &mut Emitter<U>),
	) -> Signal<U>
	where
		B: Send + 'static,
		C: Send + 'static,
		D: Send + 'static,
		U: Send + 'static,
	{
		let a = self.into_node();
		let b = second.into_node();
		let c = third.into_node();
		let d = fourth.into_node();
		let pa: Arc<dyn Upstream> = a.clone();
		let pb: Arc<dyn Upstream> = b.clone();
		let pc: Arc<dyn Upstream> = c.clone();
		let pd: Arc<dyn Upstream> = d.clone();
		let mid: Arc<Node<Combined4<T, B, C, D>>> = Node::new(vec![pa, pb, pc, pd], None);
		attach_arm(&a, &mid, Combined4::First);
		attach_arm(&b, &mid, Combined4::Second);
		attach_arm(&c, &mid, Combined4::Third);
		attach_arm(&d, &mid, Combined4::Fourth);
		attach_stage(&mid, exec, processor)
	}

	/// Combines five signals into one stage.
	#[allow(clippy::many_single_char_names)]
	pub fn combine5<B, C, D, E, U>(
		self,
		second: Signal<B>,
		third: Signal<C>,
		fourth: Signal<D>,
		fifth: Signal<E>,
		exec: Exec,
		processor: impl 'static + Send + FnMut(Combined5<T, B, C, D, E>, &mut Emitter<U>),
	) -> Signal<U>
	where
		B: Send + 'static,
		C: Send + 'static,
		D: Send + 'static,
		E: Send + 'static,
		U: Send + 'static,
	{
		let a = self.into_node();
		let b = second.into_node();
		let c = third.into_node();
		let d = fourth.into_node();
		let e = fifth.into_node();
		let pa: Arc<dyn Upstream> = a.clone();
		let pb: Arc<dyn Upstream> = b.clone();
		let pc: Arc<dyn Upstream> = c.clone();
		let pd: Arc<dyn Upstream> = d.clone();
		let pe: Arc<dyn Upstream> = e.clone();
		let mid: Arc<Node<Combined5<T, B, C, D, E>>> = Node::new(vec![pa, pb, pc, pd, pe], None);
		attach_arm(&a, &mid, Combined5::First);
		attach_arm(&b, &mid, Combined5::Second);
		attach_arm(&c, &mid, Combined5::Third);
		attach_arm(&d, &mid, Combined5::Fourth);
		attach_arm(&e, &mid, Combined5::Fifth);
		attach_stage(&mid, exec, processor)
	}
}
