//! The consumer-side handle family: subscription outputs, the re-bindable
//! junction, the synchronous capture and the polling endpoint.

use std::sync::{Arc, Weak};

use headwater::Exec;
use parking_lot::Mutex;

use crate::{
	event::{End, Event},
	input::{ClosePropagation, ForwardSink, SignalInput},
	node::{AttachOptions, Delivery, Node, Sink, SinkRef, Upstream},
};

pub(crate) struct OutputSink<T: Send + 'static> {
	handler: Mutex<Box<dyn Send + FnMut(Event<T>)>>,
}

impl<T: Send + 'static> OutputSink<T> {
	pub(crate) fn new(handler: Box<dyn Send + FnMut(Event<T>)>) -> Self {
		Self {
			handler: Mutex::new(handler),
		}
	}
}

impl<T: Send + 'static> Sink<T> for OutputSink<T> {
	fn process(&self, event: Event<T>, _delivery: Delivery) -> Option<End> {
		let mut handler = self.handler.lock();
		(*handler)(event);
		None
	}
}

/// [`OutputSink`] that anchors its own stage and lets go after the end.
///
/// The anchor closes an ownership loop with the stage on purpose: the
/// subscription keeps itself alive with no handle held by the caller. The
/// loop resolves when the terminal end is observed (the anchor drops here)
/// or when the stage completes (the stage drops its consumer slot).
pub(crate) struct UntilEndSink<T: Send + 'static> {
	handler: Mutex<Box<dyn Send + FnMut(Event<T>)>>,
	anchor: Mutex<Option<Arc<Node<T>>>>,
}

impl<T: Send + 'static> UntilEndSink<T> {
	pub(crate) fn new(handler: Box<dyn Send + FnMut(Event<T>)>, anchor: Arc<Node<T>>) -> Self {
		Self {
			handler: Mutex::new(handler),
			anchor: Mutex::new(Some(anchor)),
		}
	}
}

impl<T: Send + 'static> Sink<T> for UntilEndSink<T> {
	fn process(&self, event: Event<T>, _delivery: Delivery) -> Option<End> {
		let ended = event.is_end();
		{
			let mut handler = self.handler.lock();
			(*handler)(event);
		}
		if ended {
			// Self-release. The sender still holds the stage for the rest of
			// this dispatch.
			drop(self.anchor.lock().take());
		}
		None
	}
}

/// A consumer-side lifetime anchor owning a handler closure.
///
/// Holding it keeps the anchored path active; dropping (or
/// [`cancel`](`SignalOutput::cancel`)) releases the handler and deactivates
/// the path upstream.
#[must_use = "Dropping a `SignalOutput` detaches it and deactivates its path."]
pub struct SignalOutput<T: Send + 'static> {
	node: Option<Arc<Node<T>>>,
}

impl<T: Send + 'static> SignalOutput<T> {
	pub(crate) fn new(node: Arc<Node<T>>) -> Self {
		Self { node: Some(node) }
	}

	/// Detaches now instead of at drop. Idempotent.
	pub fn cancel(&mut self) {
		if let Some(node) = self.node.take() {
			node.detach();
		}
	}

	/// Whether the observed stream already delivered its terminal end.
	#[must_use]
	pub fn is_complete(&self) -> bool {
		self.node.as_ref().is_none_or(|node| node.is_complete())
	}
}

impl<T: Send + 'static> Drop for SignalOutput<T> {
	fn drop(&mut self) {
		self.cancel();
	}
}

/// A detach/attach splice point for rebinding streams.
///
/// Unbound, the junction holds its upstream inactive. [`bind`]ing it to a
/// [`SignalInput`] activates the upstream path and forwards every event into
/// the input's stage; [`disconnect`] severs the splice and deactivates the
/// upstream again, after which the junction can be re-bound.
///
/// [`bind`]: `SignalJunction::bind`
/// [`disconnect`]: `SignalJunction::disconnect`
#[must_use]
pub struct SignalJunction<T: Send + 'static> {
	node: Arc<Node<T>>,
	bound: Mutex<Option<Weak<Node<T>>>>,
}

impl<T: Send + 'static> SignalJunction<T> {
	pub(crate) fn new(node: Arc<Node<T>>) -> Self {
		Self {
			node,
			bound: Mutex::new(None),
		}
	}

	/// Splices the junction's upstream into `to`'s stage.
	///
	/// # Panics
	///
	/// Iff the junction is already bound; [`disconnect`](`SignalJunction::disconnect`) first.
	pub fn bind(&self, to: &SignalInput<T>) {
		let mut bound = self.bound.lock();
		assert!(
			bound.is_none(),
			"Junction is already bound. Call `disconnect` before rebinding."
		);
		let target = to.node();
		let Some(target_node) = target.upgrade() else {
			// The target graph is gone; there is nothing to drive.
			return;
		};
		let pred: Arc<dyn Upstream> = self.node.clone();
		// Cycle check happens here, ahead of any wiring.
		target_node.add_pred(Arc::clone(&pred));
		let sink = ForwardSink::new(
			target.clone(),
			Arc::downgrade(&self.node),
			ClosePropagation::All,
		);
		self.node.attach(
			Exec::direct(),
			SinkRef::Strong(Arc::new(sink)),
			AttachOptions::PASSIVE,
		);
		if target_node.is_live() {
			pred.activate();
		}
		*bound = Some(target);
	}

	/// Severs the splice and deactivates the upstream path. Idempotent.
	pub fn disconnect(&self) {
		let mut bound = self.bound.lock();
		if let Some(target) = bound.take().and_then(|weak| weak.upgrade()) {
			target.remove_pred(Arc::as_ptr(&self.node).cast());
		}
		self.node.detach();
	}

	/// Whether the junction currently drives a target.
	#[must_use]
	pub fn is_bound(&self) -> bool {
		self.bound.lock().is_some()
	}
}

impl<T: Send + 'static> Drop for SignalJunction<T> {
	fn drop(&mut self) {
		self.disconnect();
	}
}

pub(crate) struct CaptureSink<T: Send + 'static> {
	seen: Mutex<(Vec<T>, Option<End>)>,
}

impl<T: Send + 'static> Default for CaptureSink<T> {
	fn default() -> Self {
		Self {
			seen: Mutex::new((Vec::new(), None)),
		}
	}
}

impl<T: Send + 'static> Sink<T> for CaptureSink<T> {
	fn process(&self, event: Event<T>, _delivery: Delivery) -> Option<End> {
		let mut seen = self.seen.lock();
		match event {
			Event::Value(value) => seen.0.push(value),
			Event::End(end) => {
				seen.1.get_or_insert(end);
			}
		}
		None
	}
}

/// A synchronous peek at a signal's activation values.
///
/// Creating the capture activates the path upstream and records the replayed
/// activation values without going live: the captured edge stays paused,
/// discarding live values, until [`subscribe`](`SignalCapture::subscribe`)
/// resumes the stream — with or without resending the captured prefix.
#[must_use]
pub struct SignalCapture<T: Send + 'static> {
	node: Option<Arc<Node<T>>>,
	sink: Arc<CaptureSink<T>>,
}

impl<T: Send + 'static> SignalCapture<T> {
	pub(crate) fn new(node: Arc<Node<T>>, sink: Arc<CaptureSink<T>>) -> Self {
		Self {
			node: Some(node),
			sink,
		}
	}

	/// The captured activation values, in replay order.
	#[must_use]
	pub fn values(&self) -> Vec<T>
	where
		T: Clone,
	{
		self.sink.seen.lock().0.clone()
	}

	/// The captured terminal end, iff the stream already ended.
	#[must_use]
	pub fn end(&self) -> Option<End> {
		self.sink.seen.lock().1.clone()
	}

	/// Resumes the stream into `handler`.
	///
	/// With `resend`, the captured values are delivered to the handler first,
	/// ahead of anything live. The handover is atomic under the stage mutex.
	pub fn subscribe(
		mut self,
		resend: bool,
		exec: Exec,
		handler: impl 'static + Send + FnMut(Event<T>),
	) -> SignalOutput<T>
	where
		T: Clone,
	{
		let node = self.node.take().expect("present until consumed");
		let resend_events = if resend {
			self.sink
				.seen
				.lock()
				.0
				.iter()
				.cloned()
				.map(Event::Value)
				.collect()
		} else {
			Vec::new()
		};
		let sink: Arc<dyn Sink<T>> = Arc::new(OutputSink::new(Box::new(handler)));
		node.resume_with(exec, SinkRef::Strong(sink), resend_events);
		SignalOutput::new(node)
	}

	/// As [`subscribe`](`SignalCapture::subscribe`), dropping ends.
	pub fn subscribe_values(
		self,
		resend: bool,
		exec: Exec,
		mut handler: impl 'static + Send + FnMut(T),
	) -> SignalOutput<T>
	where
		T: Clone,
	{
		self.subscribe(resend, exec, move |event| {
			if let Event::Value(value) = event {
				handler(value);
			}
		})
	}
}

impl<T: Send + 'static> Drop for SignalCapture<T> {
	fn drop(&mut self) {
		if let Some(node) = self.node.take() {
			node.detach();
		}
	}
}

pub(crate) struct PollingSink<T: Send + 'static> {
	latest: Mutex<Option<Event<T>>>,
}

impl<T: Send + 'static> Default for PollingSink<T> {
	fn default() -> Self {
		Self {
			latest: Mutex::new(None),
		}
	}
}

impl<T: Send + 'static> Sink<T> for PollingSink<T> {
	fn process(&self, event: Event<T>, _delivery: Delivery) -> Option<End> {
		*self.latest.lock() = Some(event);
		None
	}
}

/// Holds the latest observed [`Event`] for synchronous polling from any
/// thread. Anchors its path like any output; dropping detaches.
#[must_use]
pub struct SignalPollingEndpoint<T: Send + 'static> {
	node: Arc<Node<T>>,
	sink: Arc<PollingSink<T>>,
}

impl<T: Send + 'static> SignalPollingEndpoint<T> {
	pub(crate) fn new(node: Arc<Node<T>>, sink: Arc<PollingSink<T>>) -> Self {
		Self { node, sink }
	}

	/// The most recent event, value or end.
	#[must_use]
	pub fn latest(&self) -> Option<Event<T>>
	where
		T: Clone,
	{
		self.sink.latest.lock().clone()
	}

	/// The most recent value, ignoring a terminal end.
	#[must_use]
	pub fn latest_value(&self) -> Option<T>
	where
		T: Clone,
	{
		match &*self.sink.latest.lock() {
			Some(Event::Value(value)) => Some(value.clone()),
			_ => None,
		}
	}
}

impl<T: Send + 'static> Drop for SignalPollingEndpoint<T> {
	fn drop(&mut self) {
		self.node.detach();
	}
}
