//! The stage node: per-stage serialisation, the activation state machine and
//! the deferred-event deque that guards against processor re-entrancy.
//!
//! Ownership runs *upstream*: a node strongly anchors its predecessor nodes
//! (so an output handle keeps its whole path alive) and strongly owns the
//! consumer sink attached to it, while everything pointing *downstream* —
//! the sink's destination, a hub's children — is a weak lookup checked at
//! send time. Input handles reference their node weakly and report
//! [`SendError::Disconnected`] once the graph is gone.

use std::{
	collections::VecDeque,
	mem,
	sync::{Arc, Weak},
	thread::{self, ThreadId},
};

use headwater::{Exec, Lifetime};
use parking_lot::Mutex;
use scopeguard::{guard, ScopeGuard};

use crate::event::{End, Event, SendError};

/// How an event reached a stage.
///
/// Replay is the synchronous delivery of cached activation values during
/// attachment; it bypasses the consumer's context and runs inline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Delivery {
	Live,
	Replay,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Phase {
	Inactive,
	Activating,
	Active,
	Complete,
}

/// A consumer of one edge's events.
///
/// Returning [`Some`] reports that the consuming stage failed (a caught
/// processor panic); the node then completes with that end. Ends a processor
/// emits *itself* flow through its emitter instead and need no report here.
pub(crate) trait Sink<T: Send>: Send + Sync {
	fn process(&self, event: Event<T>, delivery: Delivery) -> Option<End>;
}

/// Type-erased upstream anchor used for activation propagation.
pub(crate) trait Upstream: Send + Sync {
	fn activate(&self);
	fn deactivate(&self);
	/// Whether `target` is reachable from here walking upstream. Used for
	/// the attach-time cycle check on dynamic binds.
	fn reaches(&self, target: *const ()) -> bool;
}

/// Hook run when a source node gains or loses its downstream subscription.
pub(crate) trait SourceHook<T: Send + 'static>: Send + Sync {
	fn on_activate(&self, node: &Arc<Node<T>>);
	fn on_deactivate(&self);
}

/// Strong or weak reference to a consumer sink.
///
/// Processors are owned by the node they consume from; hubs are owned by
/// their handles and children instead, so the node holds them weakly to
/// avoid an ownership cycle through the hub's source anchor.
pub(crate) enum SinkRef<T: Send + 'static> {
	Strong(Arc<dyn Sink<T>>),
	Weak(Weak<dyn Sink<T>>),
}

impl<T: Send + 'static> SinkRef<T> {
	fn get(&self) -> Option<Arc<dyn Sink<T>>> {
		match self {
			Self::Strong(sink) => Some(Arc::clone(sink)),
			Self::Weak(sink) => sink.upgrade(),
		}
	}
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct AttachOptions {
	/// Capture endpoints attach paused: replay reaches them, live values are
	/// discarded until resumed.
	pub(crate) paused: bool,
	/// Caching multi-listener stages absorb events ahead of activation.
	pub(crate) inline_inactive: bool,
	/// Whether attaching immediately drives activation. Operators attach
	/// their processors passively; endpoints attach live.
	pub(crate) activate: bool,
}

impl AttachOptions {
	pub(crate) const LIVE: Self = Self {
		paused: false,
		inline_inactive: false,
		activate: true,
	};
	pub(crate) const PASSIVE: Self = Self {
		paused: false,
		inline_inactive: false,
		activate: false,
	};
	pub(crate) const PAUSED: Self = Self {
		paused: true,
		inline_inactive: false,
		activate: true,
	};
}

struct ConsumerSlot<T: Send + 'static> {
	exec: Exec,
	sink: SinkRef<T>,
	paused: bool,
}

struct State<T: Send + 'static> {
	phase: Phase,
	consumer: Option<ConsumerSlot<T>>,
	/// Re-entrancy queue and async mailbox. Loopback sends append, contended
	/// foreign sends prepend, the drain always pops the front.
	deferred: VecDeque<Event<T>>,
	busy: bool,
	busy_thread: Option<ThreadId>,
	activating_thread: Option<ThreadId>,
	inline_inactive: bool,
	/// Bumped per activation; producer handles from earlier activations are
	/// inert and must not cancel the stage when dropped.
	generation: u64,
	preds: Vec<Arc<dyn Upstream>>,
	source: Option<Arc<dyn SourceHook<T>>>,
	resources: Vec<Lifetime>,
	terminal: Option<End>,
}

/// One stage of the graph, producing events of type `T` for its consumer.
pub(crate) struct Node<T: Send + 'static> {
	this: Weak<Node<T>>,
	state: Mutex<State<T>>,
}

impl<T: Send + 'static> Node<T> {
	pub(crate) fn new(
		preds: Vec<Arc<dyn Upstream>>,
		source: Option<Arc<dyn SourceHook<T>>>,
	) -> Arc<Self> {
		Arc::new_cyclic(|this| Self {
			this: this.clone(),
			state: Mutex::new(State {
				phase: Phase::Inactive,
				consumer: None,
				deferred: VecDeque::new(),
				busy: false,
				busy_thread: None,
				activating_thread: None,
				inline_inactive: false,
				generation: 0,
				preds,
				source,
				resources: Vec::new(),
				terminal: None,
			}),
		})
	}

	fn arc(&self) -> Arc<Self> {
		self.this.upgrade().expect("alive while reachable")
	}

	/// Enqueues one event for the consumer, upholding per-edge FIFO and
	/// non-reentrant invocation.
	pub(crate) fn send(&self, event: Event<T>) -> Result<(), SendError> {
		self.send_with(event, Delivery::Live)
	}

	pub(crate) fn send_with(&self, event: Event<T>, delivery: Delivery) -> Result<(), SendError> {
		let mut state = self.state.lock();
		match state.phase {
			Phase::Complete => return Err(SendError::Disconnected),
			Phase::Inactive => {
				if !state.inline_inactive {
					return Err(SendError::Inactive);
				}
				// A caching stage absorbs pre-activation traffic inline.
			}
			Phase::Activating => {
				let replaying = delivery == Delivery::Replay
					|| state.activating_thread == Some(thread::current().id());
				if !replaying {
					if state.consumer.as_ref().is_some_and(|slot| slot.paused) {
						// A paused capture discards live values but still
						// observes the terminal end.
						if !event.is_end() {
							return Err(SendError::Inactive);
						}
					} else {
						// Live traffic waits for replay to finish.
						state.deferred.push_back(event);
						return Ok(());
					}
				}
			}
			Phase::Active => {}
		}

		let Some(slot) = state.consumer.as_ref() else {
			return Err(SendError::Inactive);
		};
		let Some(sink) = slot.sink.get() else {
			return Err(SendError::Disconnected);
		};
		let exec = slot.exec.clone();

		// Replay is synchronous by contract, regardless of the context.
		if exec.is_immediate() || delivery == Delivery::Replay {
			if state.busy {
				if delivery == Delivery::Replay
					|| state.busy_thread == Some(thread::current().id())
				{
					// Loopback from the running invocation keeps FIFO.
					state.deferred.push_back(event);
				} else {
					// Contended foreign senders are admitted newest-first.
					state.deferred.push_front(event);
				}
				return Ok(());
			}
			state.busy = true;
			state.busy_thread = Some(thread::current().id());
			drop(state);
			self.run_inline(&exec, &sink, event, delivery);
		} else {
			state.deferred.push_back(event);
			if !state.busy {
				state.busy = true;
				state.busy_thread = None;
				let node = self.arc();
				drop(state);
				exec.invoke(move || node.drain_scheduled());
			}
		}
		Ok(())
	}

	/// Runs `first` and then the deferred queue on the calling thread,
	/// releasing and reacquiring the mutex around each dispatch.
	fn run_inline(&self, exec: &Exec, sink: &Arc<dyn Sink<T>>, first: Event<T>, delivery: Delivery) {
		// Leaves the stage usable even if a subscriber handler unwinds.
		let reset = guard((), |()| {
			let mut state = self.state.lock();
			state.busy = false;
			state.busy_thread = None;
		});
		let mut next = Some((first, delivery));
		let mut terminal = None;
		while let Some((event, delivery)) = next.take() {
			let event_end = event.as_end().cloned();
			let failure = self.invoke_sink(exec, sink, event, delivery);
			if let Some(end) = failure.or(event_end) {
				terminal = Some(end);
				break;
			}
			let mut state = self.state.lock();
			match state.deferred.pop_front() {
				Some(event) => {
					drop(state);
					next = Some((event, Delivery::Live));
				}
				None => {
					state.busy = false;
					state.busy_thread = None;
				}
			}
		}
		// `finish` both completes and clears `busy` under one lock, so no
		// late send can slip in between.
		ScopeGuard::into_inner(reset);
		match terminal {
			Some(end) => self.finish(end),
			None => {
				let mut state = self.state.lock();
				state.busy = false;
				state.busy_thread = None;
			}
		}
	}

	fn invoke_sink(
		&self,
		exec: &Exec,
		sink: &Arc<dyn Sink<T>>,
		event: Event<T>,
		delivery: Delivery,
	) -> Option<End> {
		if delivery == Delivery::Replay {
			sink.process(event, Delivery::Replay)
		} else {
			let sink = Arc::clone(sink);
			let failure = Arc::new(Mutex::new(None));
			let report = Arc::clone(&failure);
			exec.invoke(move || {
				*report.lock() = sink.process(event, Delivery::Live);
			});
			let outcome = failure.lock().take();
			outcome
		}
	}

	/// Drains the mailbox on the consumer's context. At most one of these is
	/// in flight per stage, so the stage never runs concurrently with itself
	/// even on a concurrent pool.
	fn drain_scheduled(self: &Arc<Self>) {
		{
			let mut state = self.state.lock();
			state.busy_thread = Some(thread::current().id());
		}
		let reset = guard((), |()| {
			let mut state = self.state.lock();
			state.busy = false;
			state.busy_thread = None;
		});
		let mut terminal = None;
		loop {
			let mut state = self.state.lock();
			let Some(event) = state.deferred.pop_front() else {
				state.busy = false;
				state.busy_thread = None;
				break;
			};
			let Some(sink) = state.consumer.as_ref().and_then(|slot| slot.sink.get()) else {
				state.busy = false;
				state.busy_thread = None;
				break;
			};
			drop(state);
			let event_end = event.as_end().cloned();
			let failure = sink.process(event, Delivery::Live);
			if let Some(end) = failure.or(event_end) {
				terminal = Some(end);
				break;
			}
		}
		ScopeGuard::into_inner(reset);
		if let Some(end) = terminal {
			self.finish(end);
		}
	}

	/// Attaches the consumer. Panics on a second attachment: signals are
	/// single-listener unless made multi explicitly.
	pub(crate) fn attach(&self, exec: Exec, sink: SinkRef<T>, options: AttachOptions) {
		let mut state = self.state.lock();
		if state.phase == Phase::Complete {
			let terminal = state.terminal.clone().unwrap_or(End::Cancelled);
			drop(state);
			if let Some(sink) = sink.get() {
				let _ = sink.process(Event::End(terminal), Delivery::Replay);
			}
			return;
		}
		assert!(
			state.consumer.is_none(),
			"Attempted a second subscription to a single-listener signal. \
			 Fan out through a multi-listener stage (`continuous`, `multicast`, …) instead."
		);
		state.consumer = Some(ConsumerSlot {
			exec,
			sink,
			paused: options.paused,
		});
		state.inline_inactive = options.inline_inactive;
		drop(state);
		if options.activate {
			self.activate();
		}
	}

	/// Removes the consumer and deactivates. The node is re-attachable
	/// afterwards unless it completed.
	pub(crate) fn detach(&self) {
		{
			let mut state = self.state.lock();
			if state.consumer.take().is_none() {
				return;
			}
			state.inline_inactive = false;
		}
		self.deactivate();
	}

	/// Replaces a paused capture consumer with a live one, delivering
	/// `resend` first. Atomic relative to live sends under the stage mutex.
	pub(crate) fn resume_with(&self, exec: Exec, sink: SinkRef<T>, resend: Vec<Event<T>>) {
		let mut state = self.state.lock();
		if state.phase == Phase::Complete {
			let terminal = state.terminal.clone().unwrap_or(End::Cancelled);
			drop(state);
			if let Some(sink) = sink.get() {
				for event in resend {
					if sink.process(event, Delivery::Replay).is_some() {
						return;
					}
				}
				let _ = sink.process(Event::End(terminal), Delivery::Replay);
			}
			return;
		}
		state.consumer = Some(ConsumerSlot {
			exec,
			sink,
			paused: false,
		});
		if state.phase == Phase::Activating {
			state.phase = Phase::Active;
			state.activating_thread = None;
		}
		drop(state);
		for event in resend {
			let _ = self.send_with(event, Delivery::Replay);
		}
		self.kick();
	}

	/// Drives `inactive → activating → active`, recursing upstream first so
	/// that cached activation values replay down the just-created path
	/// before the stage goes live.
	pub(crate) fn activate(&self) {
		let mut state = self.state.lock();
		if state.phase != Phase::Inactive {
			return;
		}
		state.phase = Phase::Activating;
		state.activating_thread = Some(thread::current().id());
		state.generation += 1;
		let preds = state.preds.clone();
		let source = state.source.clone();
		drop(state);
		tracing::trace!("stage activating");
		for pred in &preds {
			pred.activate();
		}
		if let Some(source) = source {
			source.on_activate(&self.arc());
		}
		let mut state = self.state.lock();
		// Cancellation during activation wins; a paused capture holds the
		// stage in `Activating` until resumed.
		if state.phase == Phase::Activating {
			state.activating_thread = None;
			if state.consumer.as_ref().is_some_and(|slot| slot.paused) {
				return;
			}
			state.phase = Phase::Active;
			drop(state);
			tracing::trace!("stage active");
			self.kick();
		}
	}

	/// Mirror of [`activate`](`Node::activate`): releases resources in FIFO
	/// order, notifies the source hook, then recurses upstream.
	pub(crate) fn deactivate(&self) {
		let mut state = self.state.lock();
		match state.phase {
			Phase::Inactive | Phase::Complete => return,
			Phase::Activating | Phase::Active => {}
		}
		state.phase = Phase::Inactive;
		state.activating_thread = None;
		state.deferred.clear();
		let resources = mem::take(&mut state.resources);
		let source = state.source.clone();
		let preds = state.preds.clone();
		drop(state);
		tracing::trace!("stage deactivated");
		for resource in &resources {
			resource.cancel();
		}
		if let Some(source) = source {
			source.on_deactivate();
		}
		for pred in &preds {
			pred.deactivate();
		}
	}

	/// Completes the stage after its terminal end was handed downstream:
	/// freezes the phase, discards deferred events and releases the
	/// processor, predecessors and resources with no locks held.
	pub(crate) fn finish(&self, end: End) {
		let mut state = self.state.lock();
		if state.phase == Phase::Complete {
			return;
		}
		state.phase = Phase::Complete;
		state.terminal = Some(end);
		state.busy = false;
		state.busy_thread = None;
		state.activating_thread = None;
		state.deferred.clear();
		let consumer = state.consumer.take();
		let preds = mem::take(&mut state.preds);
		let source = state.source.take();
		let resources = mem::take(&mut state.resources);
		drop(state);
		tracing::debug!("stage complete");
		for resource in &resources {
			resource.cancel();
		}
		if let Some(source) = &source {
			source.on_deactivate();
		}
		for pred in &preds {
			pred.deactivate();
		}
		drop(consumer);
	}

	/// Sends the terminal `end` downstream, or completes directly iff it
	/// cannot be delivered. Termination beats an in-flight activation.
	pub(crate) fn close_with(&self, end: End) {
		let phase = self.state.lock().phase;
		match phase {
			Phase::Complete => {}
			Phase::Activating => self.finish(end),
			// An inactive stage may still have a caching consumer that must
			// record the end for late joiners, so the send is attempted.
			Phase::Inactive | Phase::Active => match self.send(Event::End(end.clone())) {
				Ok(()) | Err(SendError::Disconnected) => {}
				Err(SendError::Inactive) => self.finish(end),
			},
		}
	}

	/// [`close_with`](`Node::close_with`) for the producer-released case.
	pub(crate) fn cancel(&self) {
		self.close_with(End::Cancelled);
	}

	pub(crate) fn generation(&self) -> u64 {
		self.state.lock().generation
	}

	/// A producer handle was dropped without closing.
	///
	/// Handles minted for an earlier activation are inert, and a dormant
	/// source keeps its stage re-activatable: the hook mints a fresh handle
	/// next time. Everything else cancels.
	pub(crate) fn producer_dropped(&self, generation: Option<u64>) {
		{
			let state = self.state.lock();
			if let Some(generation) = generation {
				if state.generation != generation {
					return;
				}
				if state.source.is_some() && state.phase == Phase::Inactive {
					return;
				}
			}
		}
		self.cancel();
	}

	/// Dispatches deferred events, used after activation and resume.
	fn kick(&self) {
		let mut state = self.state.lock();
		if state.busy || state.deferred.is_empty() || state.phase != Phase::Active {
			return;
		}
		let Some(slot) = state.consumer.as_ref() else {
			return;
		};
		if slot.paused {
			return;
		}
		let Some(sink) = slot.sink.get() else {
			return;
		};
		let exec = slot.exec.clone();
		state.busy = true;
		if exec.is_immediate() {
			state.busy_thread = Some(thread::current().id());
			let event = state.deferred.pop_front().expect("checked above");
			drop(state);
			self.run_inline(&exec, &sink, event, Delivery::Live);
		} else {
			state.busy_thread = None;
			let node = self.arc();
			drop(state);
			exec.invoke(move || node.drain_scheduled());
		}
	}

	/// Splices a dynamic predecessor in (multi-input, merged-input and
	/// junction binds). The caller wires the delivery sink and then drives
	/// activation iff this stage [is live](`Node::is_live`).
	///
	/// # Panics
	///
	/// Iff the bind would close a cycle: the static graph must stay a DAG.
	/// Loops are created by feeding a held input from a processor instead.
	pub(crate) fn add_pred(&self, pred: Arc<dyn Upstream>) {
		assert!(
			!pred.reaches((self as *const Self).cast()),
			"Attempted to bind a signal to its own ancestor; the graph must stay acyclic. \
			 Re-feed a held input from a processor to loop instead."
		);
		let mut state = self.state.lock();
		if state.phase == Phase::Complete {
			return;
		}
		state.preds.push(pred);
	}

	pub(crate) fn is_live(&self) -> bool {
		matches!(self.state.lock().phase, Phase::Active | Phase::Activating)
	}

	/// Severs a dynamic predecessor by identity and deactivates it.
	pub(crate) fn remove_pred(&self, pred: *const ()) {
		let mut removed = None;
		{
			let mut state = self.state.lock();
			if let Some(index) = state
				.preds
				.iter()
				.position(|p| Arc::as_ptr(p).cast::<()>() == pred)
			{
				removed = Some(state.preds.remove(index));
			}
		}
		if let Some(removed) = removed {
			removed.deactivate();
		}
	}

	/// Holds a resource (a timer, a generator handle) until deactivation.
	pub(crate) fn add_resource(&self, resource: Lifetime) {
		self.state.lock().resources.push(resource);
	}

	pub(crate) fn is_complete(&self) -> bool {
		self.state.lock().phase == Phase::Complete
	}

	#[cfg(test)]
	pub(crate) fn phase(&self) -> Phase {
		self.state.lock().phase
	}

	#[cfg(test)]
	pub(crate) fn deferred_len(&self) -> usize {
		self.state.lock().deferred.len()
	}
}

/// Renders a caught panic payload for [`crate::ProcessorPanicked`].
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
	if let Some(message) = payload.downcast_ref::<&str>() {
		(*message).to_owned()
	} else if let Some(message) = payload.downcast_ref::<String>() {
		message.clone()
	} else {
		"non-string panic payload".to_owned()
	}
}

impl<T: Send + 'static> Upstream for Node<T> {
	fn activate(&self) {
		Node::activate(self);
	}

	fn deactivate(&self) {
		Node::deactivate(self);
	}

	fn reaches(&self, target: *const ()) -> bool {
		if (self as *const Self).cast::<()>() == target {
			return true;
		}
		let preds = self.state.lock().preds.clone();
		preds.iter().any(|pred| pred.reaches(target))
	}
}

#[cfg(test)]
mod tests {
	use std::sync::{Arc, Weak};

	use headwater::Exec;
	use parking_lot::Mutex;

	use super::{AttachOptions, Node, Phase, Sink, SinkRef};
	use crate::{
		event::{End, Event, SendError},
		output::OutputSink,
	};

	fn collecting(node: &Arc<Node<i32>>) -> Arc<Mutex<Vec<Event<i32>>>> {
		let log = Arc::new(Mutex::new(Vec::new()));
		let sink: Arc<dyn Sink<i32>> = Arc::new(OutputSink::new(Box::new({
			let log = Arc::clone(&log);
			move |event| log.lock().push(event)
		})));
		node.attach(Exec::direct(), SinkRef::Strong(sink), AttachOptions::LIVE);
		log
	}

	#[test]
	fn phases_follow_attachment() {
		let node: Arc<Node<i32>> = Node::new(Vec::new(), None);
		assert_eq!(node.phase(), Phase::Inactive);
		assert_eq!(node.send(Event::Value(1)), Err(SendError::Inactive));

		let log = collecting(&node);
		assert_eq!(node.phase(), Phase::Active);
		node.send(Event::Value(2)).unwrap();
		assert_eq!(*log.lock(), [Event::Value(2)]);

		node.detach();
		assert_eq!(node.phase(), Phase::Inactive);
		assert_eq!(node.send(Event::Value(3)), Err(SendError::Inactive));
	}

	#[test]
	fn first_end_completes_and_freezes() {
		let node: Arc<Node<i32>> = Node::new(Vec::new(), None);
		let log = collecting(&node);
		node.send(Event::Value(1)).unwrap();
		node.send(Event::End(End::Closed)).unwrap();
		assert_eq!(node.phase(), Phase::Complete);
		assert_eq!(node.send(Event::Value(2)), Err(SendError::Disconnected));
		assert_eq!(
			*log.lock(),
			[Event::Value(1), Event::End(End::Closed)]
		);
	}

	#[test]
	fn loopback_sends_defer_in_order() {
		let node: Arc<Node<i32>> = Node::new(Vec::new(), None);
		let log = Arc::new(Mutex::new(Vec::new()));
		let weak: Weak<Node<i32>> = Arc::downgrade(&node);
		let sink: Arc<dyn Sink<i32>> = Arc::new(OutputSink::new(Box::new({
			let log = Arc::clone(&log);
			move |event| {
				if let Event::Value(value) = &event {
					if *value == 1 {
						let node = weak.upgrade().expect("alive");
						node.send(Event::Value(10)).unwrap();
						node.send(Event::Value(11)).unwrap();
					}
				}
				log.lock().push(event);
			}
		})));
		node.attach(Exec::direct(), SinkRef::Strong(sink), AttachOptions::LIVE);

		node.send(Event::Value(1)).unwrap();
		assert_eq!(
			*log.lock(),
			[Event::Value(1), Event::Value(10), Event::Value(11)]
		);
		assert_eq!(node.deferred_len(), 0);
	}

	#[test]
	fn cancel_before_activation_completes_directly() {
		let node: Arc<Node<i32>> = Node::new(Vec::new(), None);
		node.cancel();
		assert_eq!(node.phase(), Phase::Complete);
		// A late subscriber still learns the outcome.
		let log = collecting(&node);
		assert_eq!(*log.lock(), [Event::End(End::Cancelled)]);
	}
}
