//! The user-facing handles: [`Signal`], [`SignalMulti`], the [`Emitter`]
//! handed to processors, and the source constructors.

use std::{
	panic::{catch_unwind, AssertUnwindSafe},
	sync::{Arc, Weak},
	time::Duration,
};

use headwater::Exec;
use parking_lot::Mutex;
use tap::Pipe;

use crate::{
	event::{End, Event, ProcessorPanicked},
	hub::{
		continuous_updater, passive_updater, playback_updater, Hub, ReplayPolicy, Updater,
	},
	input::{SignalInput, SignalMergedInput, SignalMultiInput},
	node::{panic_message, AttachOptions, Delivery, Node, Sink, SinkRef, SourceHook, Upstream},
	output::{
		CaptureSink, OutputSink, PollingSink, SignalCapture, SignalJunction, SignalOutput,
		SignalPollingEndpoint, UntilEndSink,
	},
};

/// Emission handle passed to processors.
///
/// A processor may emit zero or more events per invocation. After the first
/// end, further emissions are discarded: the terminal end is the last event
/// on any edge.
pub struct Emitter<T: Send + 'static> {
	dest: Weak<Node<T>>,
	delivery: Delivery,
	done: bool,
}

impl<T: Send + 'static> Emitter<T> {
	/// Emits one value downstream.
	pub fn send(&mut self, value: T) {
		self.send_event(Event::Value(value));
	}

	/// Emits a full [`Event`], values and ends alike.
	pub fn send_event(&mut self, event: Event<T>) {
		if self.done {
			return;
		}
		if event.is_end() {
			self.done = true;
		}
		if let Some(dest) = self.dest.upgrade() {
			let _ = dest.send_with(event, self.delivery);
		}
	}

	/// Terminates the downstream edge with `end`.
	pub fn end(&mut self, end: End) {
		self.send_event(Event::End(end));
	}

	/// Terminates the downstream edge with `Closed`.
	pub fn close(&mut self) {
		self.end(End::Closed);
	}
}

pub(crate) struct ProcessorSink<In: Send + 'static, Out: Send + 'static> {
	processor: Mutex<Box<dyn Send + FnMut(Event<In>, &mut Emitter<Out>)>>,
	dest: Weak<Node<Out>>,
}

impl<In: Send + 'static, Out: Send + 'static> ProcessorSink<In, Out> {
	pub(crate) fn new(
		processor: impl 'static + Send + FnMut(Event<In>, &mut Emitter<Out>),
		dest: Weak<Node<Out>>,
	) -> Self {
		Self {
			processor: Mutex::new(Box::new(processor)),
			dest,
		}
	}
}

impl<In: Send + 'static, Out: Send + 'static> Sink<In> for ProcessorSink<In, Out> {
	fn process(&self, event: Event<In>, delivery: Delivery) -> Option<End> {
		let mut emitter = Emitter {
			dest: self.dest.clone(),
			delivery,
			done: false,
		};
		let run = catch_unwind(AssertUnwindSafe(|| {
			let mut processor = self.processor.lock();
			(*processor)(event, &mut emitter);
		}));
		match run {
			Ok(()) => None,
			Err(payload) => {
				let end = End::other(ProcessorPanicked(panic_message(&payload)));
				emitter.done = false;
				emitter.end(end.clone());
				Some(end)
			}
		}
	}
}

/// A typed, one-way stream of [`Event`]s along one edge of the graph.
///
/// Handles are cheap reference clones of the same edge. The edge itself is
/// single-listener: attaching a transform, subscriber or other consumer a
/// second time is a programming error and panics. Fan out through the
/// multi-listener stages ([`Signal::continuous`], [`Signal::multicast`], …)
/// instead.
#[must_use = "Signals are inert and dropped entirely unless something attaches to them."]
pub struct Signal<T: Send + 'static> {
	node: Arc<Node<T>>,
}

impl<T: Send + 'static> Clone for Signal<T> {
	fn clone(&self) -> Self {
		Self {
			node: Arc::clone(&self.node),
		}
	}
}

impl<T: Send + 'static> std::fmt::Debug for Signal<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Signal").finish_non_exhaustive()
	}
}

impl<T: Send + 'static> Signal<T> {
	pub(crate) fn from_node(node: Arc<Node<T>>) -> Self {
		Self { node }
	}

	pub(crate) fn into_node(self) -> Arc<Node<T>> {
		self.node
	}

	/// Creates an unconnected producer/stream pair.
	///
	/// Values sent ahead of any subscription are discarded with
	/// [`SendError::Inactive`](`crate::SendError::Inactive`); put a caching
	/// stage behind the pair to buffer instead.
	pub fn create() -> (SignalInput<T>, Signal<T>) {
		let node = Node::new(Vec::new(), None);
		(SignalInput::new(Arc::downgrade(&node)), Self { node })
	}

	/// A source driven by an activation hook.
	///
	/// On each activation, `on_change` receives a fresh [`SignalInput`] for
	/// the new path; on deactivation it receives [`None`] and should drop
	/// whatever producer state it holds. The hook runs in `exec`; with a
	/// non-immediate context, initial values are delivered asynchronously
	/// rather than as activation values.
	pub fn generate(
		exec: Exec,
		on_change: impl 'static + Send + FnMut(Option<SignalInput<T>>),
	) -> Signal<T> {
		Node::new(
			Vec::new(),
			Some(Arc::new(GenerateHook {
				exec,
				on_change: Arc::new(Mutex::new(Box::new(on_change))),
			})),
		)
		.pipe(Self::from_node)
	}

	/// A one-shot source emitting `values` in order, then `Closed`, as
	/// activation values of the first activation.
	pub fn from_sequence(values: impl IntoIterator<Item = T>) -> Signal<T> {
		Self::from_sequence_ending(values, End::Closed)
	}

	/// [`from_sequence`](`Signal::from_sequence`) with a chosen terminal end.
	pub fn from_sequence_ending(values: impl IntoIterator<Item = T>, end: End) -> Signal<T> {
		Node::new(
			Vec::new(),
			Some(Arc::new(SequenceHook {
				values: Mutex::new(Some(values.into_iter().collect())),
				end,
			})),
		)
		.pipe(Self::from_node)
	}

	/// A one-shot source emitting exactly `value`, then `Closed`.
	pub fn just(value: T) -> Signal<T> {
		Self::from_sequence([value])
	}

	/// A source that is already over: emits `Closed` on activation.
	pub fn preclosed() -> Signal<T> {
		Self::from_sequence([])
	}

	/// A cloneable fan-in producer and its stream. See [`SignalMultiInput`].
	pub fn multi_input() -> (SignalMultiInput<T>, Signal<T>) {
		let node = Node::new(Vec::new(), None);
		(SignalMultiInput::new(Arc::downgrade(&node)), Self { node })
	}

	/// A fan-in producer with per-source end policies. See [`SignalMergedInput`].
	pub fn merged_input() -> (SignalMergedInput<T>, Signal<T>) {
		let node = Node::new(Vec::new(), None);
		(SignalMergedInput::new(Arc::downgrade(&node)), Self { node })
	}

	/// The first of the four primitives: one input edge, one output edge,
	/// `processor` invoked exactly once per incoming event, serialised per
	/// stage, emitting through the [`Emitter`].
	///
	/// A processor panic is caught and converted into
	/// [`End::Other`]`(`[`ProcessorPanicked`]`)` downstream.
	pub fn transform<U: Send + 'static>(
		self,
		exec: Exec,
		processor: impl 'static + Send + FnMut(Event<T>, &mut Emitter<U>),
	) -> Signal<U> {
		let pred: Arc<dyn Upstream> = self.node.clone();
		let dest = Node::new(vec![pred], None);
		let sink: Arc<dyn Sink<T>> =
			Arc::new(ProcessorSink::new(processor, Arc::downgrade(&dest)));
		self.node
			.attach(exec, SinkRef::Strong(sink), AttachOptions::PASSIVE);
		Signal { node: dest }
	}

	/// Subscribes `handler` to every event, anchoring the path.
	pub fn subscribe(
		self,
		exec: Exec,
		handler: impl 'static + Send + FnMut(Event<T>),
	) -> SignalOutput<T> {
		let sink: Arc<dyn Sink<T>> = Arc::new(OutputSink::new(Box::new(handler)));
		self.node
			.attach(exec, SinkRef::Strong(sink), AttachOptions::LIVE);
		SignalOutput::new(self.node)
	}

	/// As [`subscribe`](`Signal::subscribe`), but the subscription anchors
	/// itself: no handle is returned, and the handler is released as soon as
	/// it observed the terminal end.
	///
	/// # Logic
	///
	/// Iff the stream never ends and its producer never goes away, the
	/// subscription stays anchored indefinitely.
	pub fn subscribe_until_end(
		self,
		exec: Exec,
		handler: impl 'static + Send + FnMut(Event<T>),
	) {
		let sink: Arc<dyn Sink<T>> = Arc::new(UntilEndSink::new(
			Box::new(handler),
			Arc::clone(&self.node),
		));
		self.node
			.attach(exec, SinkRef::Strong(sink), AttachOptions::LIVE);
	}

	/// As [`subscribe`](`Signal::subscribe`), silently dropping ends.
	/// Callers that care about the cause must use the full subscribe.
	pub fn subscribe_values(
		self,
		exec: Exec,
		mut handler: impl 'static + Send + FnMut(T),
	) -> SignalOutput<T> {
		self.subscribe(exec, move |event| {
			if let Event::Value(value) = event {
				handler(value);
			}
		})
	}

	/// Snaps the activation values of this signal without going live. See
	/// [`SignalCapture`].
	pub fn capture(self) -> SignalCapture<T> {
		let sink = Arc::new(CaptureSink::default());
		let erased: Arc<dyn Sink<T>> = sink.clone();
		self.node
			.attach(Exec::direct(), SinkRef::Strong(erased), AttachOptions::PAUSED);
		SignalCapture::new(self.node, sink)
	}

	/// A re-bindable splice point over this signal. See [`SignalJunction`].
	pub fn junction(self) -> SignalJunction<T> {
		SignalJunction::new(self.node)
	}

	/// A latest-event snapshot holder. See [`SignalPollingEndpoint`].
	pub fn polling_output(self) -> SignalPollingEndpoint<T> {
		let sink = Arc::new(PollingSink::default());
		let erased: Arc<dyn Sink<T>> = sink.clone();
		self.node
			.attach(Exec::direct(), SinkRef::Strong(erased), AttachOptions::LIVE);
		SignalPollingEndpoint::new(self.node, sink)
	}

	/// Splices this signal into a fan-in. See [`SignalMultiInput::bind`].
	pub fn bind(self, to: &SignalMultiInput<T>) {
		to.bind(self);
	}
}

impl<T: Send + Clone + 'static> Signal<T> {
	/// A source that emits `value` once `interval` elapsed after activation,
	/// then closes. Deactivating releases the pending timer; re-activation
	/// re-arms it.
	pub fn timer(exec: Exec, interval: Duration, value: T) -> Signal<T> {
		Node::new(
			Vec::new(),
			Some(Arc::new(TimerHook {
				exec,
				interval,
				value: Mutex::new(value),
				periodic: false,
			})),
		)
		.pipe(Self::from_node)
	}

	/// A source that emits `value` every `interval` while activated.
	pub fn periodic_timer(exec: Exec, interval: Duration, value: T) -> Signal<T> {
		Node::new(
			Vec::new(),
			Some(Arc::new(TimerHook {
				exec,
				interval,
				value: Mutex::new(value),
				periodic: true,
			})),
		)
		.pipe(Self::from_node)
	}

	/// The fourth primitive: a user-defined replay cache. Every event passes
	/// through `updater`, which mutates the cached values and end; a new
	/// subscriber receives a snapshot of the cache synchronously before any
	/// live value. `initial` seeds the cache as if sent before any real
	/// event — the updater alone decides replacement.
	pub fn custom_activation(
		self,
		initial: Vec<T>,
		exec: Exec,
		updater: impl 'static + Send + FnMut(&mut Vec<T>, &mut Option<End>, Event<T>),
	) -> SignalMulti<T> {
		self.into_multi(exec, initial, Box::new(updater), ReplayPolicy::CACHING)
	}

	/// Multi-listener stage replaying the most recent value (and terminal
	/// end) to new subscribers.
	pub fn continuous(self) -> SignalMulti<T> {
		self.into_multi(
			Exec::direct(),
			Vec::new(),
			continuous_updater(),
			ReplayPolicy::CACHING,
		)
	}

	/// [`continuous`](`Signal::continuous`) seeded with an initial value.
	pub fn continuous_with(self, initial: T) -> SignalMulti<T> {
		self.into_multi(
			Exec::direct(),
			vec![initial],
			continuous_updater(),
			ReplayPolicy::CACHING,
		)
	}

	/// Like [`continuous`](`Signal::continuous`), but the cache clears when
	/// the last subscriber departs.
	pub fn continuous_while_active(self) -> SignalMulti<T> {
		self.into_multi(
			Exec::direct(),
			Vec::new(),
			continuous_updater(),
			ReplayPolicy::WHILE_ACTIVE,
		)
	}

	/// Multi-listener stage replaying *every* value ever emitted, in order.
	/// Unbounded.
	pub fn playback(self) -> SignalMulti<T> {
		self.into_multi(
			Exec::direct(),
			Vec::new(),
			playback_updater(),
			ReplayPolicy::CACHING,
		)
	}

	/// Caches values emitted ahead of the first activation, flushes them to
	/// the first subscriber and caches nothing thereafter.
	pub fn cache_until_active(self) -> SignalMulti<T> {
		self.into_multi(
			Exec::direct(),
			Vec::new(),
			playback_updater(),
			ReplayPolicy::UNTIL_ACTIVE,
		)
	}

	/// Multi-listener stage with no cache: new subscribers receive only
	/// future values.
	pub fn multicast(self) -> SignalMulti<T> {
		self.into_multi(
			Exec::direct(),
			Vec::new(),
			passive_updater(),
			ReplayPolicy::PASSTHROUGH,
		)
	}

	fn into_multi(
		self,
		exec: Exec,
		initial: Vec<T>,
		updater: Updater<T>,
		policy: ReplayPolicy,
	) -> SignalMulti<T> {
		SignalMulti {
			hub: Hub::new(self.node, exec, initial, updater, policy),
		}
	}
}

/// A multi-listener stream: any number of subscribers, each brought up to
/// speed per the stage's replay policy before seeing live values.
#[must_use = "Multi-listener signals are inert and dropped entirely unless something attaches to them."]
pub struct SignalMulti<T: Send + Clone + 'static> {
	hub: Arc<Hub<T>>,
}

impl<T: Send + Clone + 'static> Clone for SignalMulti<T> {
	fn clone(&self) -> Self {
		Self {
			hub: Arc::clone(&self.hub),
		}
	}
}

impl<T: Send + Clone + 'static> std::fmt::Debug for SignalMulti<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SignalMulti").finish_non_exhaustive()
	}
}

impl<T: Send + Clone + 'static> SignalMulti<T> {
	/// Derives a fresh single-listener edge from this stage. Activating the
	/// edge joins it; replay happens synchronously at that point.
	pub fn signal(&self) -> Signal<T> {
		Signal::from_node(self.hub.spawn_child())
	}

	/// Subscribes a fresh edge. See [`Signal::subscribe`].
	pub fn subscribe(
		&self,
		exec: Exec,
		handler: impl 'static + Send + FnMut(Event<T>),
	) -> SignalOutput<T> {
		self.signal().subscribe(exec, handler)
	}

	/// Subscribes a fresh edge, dropping ends. See [`Signal::subscribe_values`].
	pub fn subscribe_values(
		&self,
		exec: Exec,
		handler: impl 'static + Send + FnMut(T),
	) -> SignalOutput<T> {
		self.signal().subscribe_values(exec, handler)
	}

	/// Subscribes a fresh self-anchoring edge. See
	/// [`Signal::subscribe_until_end`].
	pub fn subscribe_until_end(
		&self,
		exec: Exec,
		handler: impl 'static + Send + FnMut(Event<T>),
	) {
		self.signal().subscribe_until_end(exec, handler);
	}

	/// Captures this stage's replay prefix. See [`Signal::capture`].
	pub fn capture(&self) -> SignalCapture<T> {
		self.signal().capture()
	}
}

struct GenerateHook<T: Send + 'static> {
	exec: Exec,
	#[allow(clippy::type_complexity)]
	on_change: Arc<Mutex<Box<dyn Send + FnMut(Option<SignalInput<T>>)>>>,
}

impl<T: Send + 'static> SourceHook<T> for GenerateHook<T> {
	fn on_activate(&self, node: &Arc<Node<T>>) {
		let input = SignalInput::with_generation(Arc::downgrade(node), node.generation());
		let on_change = Arc::clone(&self.on_change);
		self.exec.invoke(move || {
			let mut on_change = on_change.lock();
			(*on_change)(Some(input));
		});
	}

	fn on_deactivate(&self) {
		let on_change = Arc::clone(&self.on_change);
		self.exec.invoke(move || {
			let mut on_change = on_change.lock();
			(*on_change)(None);
		});
	}
}

struct SequenceHook<T: Send + 'static> {
	values: Mutex<Option<Vec<T>>>,
	end: End,
}

impl<T: Send + 'static> SourceHook<T> for SequenceHook<T> {
	fn on_activate(&self, node: &Arc<Node<T>>) {
		// One-shot: the sequence plays as activation values, then the source
		// completes for good.
		let Some(values) = self.values.lock().take() else {
			return;
		};
		for value in values {
			if node
				.send_with(Event::Value(value), Delivery::Replay)
				.is_err()
			{
				return;
			}
		}
		let _ = node.send_with(Event::End(self.end.clone()), Delivery::Replay);
	}

	fn on_deactivate(&self) {}
}

struct TimerHook<T: Send + Clone + 'static> {
	exec: Exec,
	interval: Duration,
	// Behind a mutex only so the hook is shareable for `Send`-only values.
	value: Mutex<T>,
	periodic: bool,
}

impl<T: Send + Clone + 'static> SourceHook<T> for TimerHook<T> {
	fn on_activate(&self, node: &Arc<Node<T>>) {
		let weak = Arc::downgrade(node);
		let resource = if self.periodic {
			let value = self.value.lock().clone();
			self.exec.periodic_timer(self.interval, move || {
				if let Some(node) = weak.upgrade() {
					let _ = node.send(Event::Value(value.clone()));
				}
			})
		} else {
			let value = self.value.lock().clone();
			self.exec.single_timer(self.interval, move || {
				if let Some(node) = weak.upgrade() {
					let _ = node.send(Event::Value(value));
					let _ = node.send(Event::End(End::Closed));
				}
			})
		};
		node.add_resource(resource);
	}

	fn on_deactivate(&self) {}
}
