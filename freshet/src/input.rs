//! The producer-side handle family.
//!
//! Three tagged variants with a shared send surface instead of an
//! inheritance chain: [`SignalInput`] (single, consumes its stage),
//! [`SignalMultiInput`] (parallel fan-in, per-source ends detach silently)
//! and [`SignalMergedInput`] (fan-in with a per-source
//! [`ClosePropagation`] policy).

use std::sync::{
	atomic::{AtomicBool, Ordering},
	Arc, Weak,
};

use headwater::Exec;

use crate::{
	event::{End, Event, SendError},
	node::{AttachOptions, Delivery, Node, Sink, SinkRef, Upstream},
	signal::Signal,
};

/// The single producer handle for one stage.
///
/// At most one concrete input exists per stage; the handle is therefore not
/// cloneable. Dropping it without closing sends `Cancelled` downstream.
#[must_use]
pub struct SignalInput<T: Send + 'static> {
	node: Weak<Node<T>>,
	closed: AtomicBool,
	/// Present on handles minted per activation by generator sources; stale
	/// handles are inert on drop.
	generation: Option<u64>,
}

impl<T: Send + 'static> SignalInput<T> {
	pub(crate) fn new(node: Weak<Node<T>>) -> Self {
		Self {
			node,
			closed: AtomicBool::new(false),
			generation: None,
		}
	}

	pub(crate) fn with_generation(node: Weak<Node<T>>, generation: u64) -> Self {
		Self {
			node,
			closed: AtomicBool::new(false),
			generation: Some(generation),
		}
	}

	pub(crate) fn node(&self) -> Weak<Node<T>> {
		self.node.clone()
	}

	/// Sends one value downstream.
	///
	/// # Errors
	///
	/// [`SendError::Inactive`] iff no live output anchors the stage (the
	/// value was discarded), [`SendError::Disconnected`] iff the graph
	/// completed or no longer exists.
	pub fn send(&self, value: T) -> Result<(), SendError> {
		self.send_event(Event::Value(value))
	}

	/// Sends a full [`Event`], values and ends alike.
	///
	/// # Errors
	///
	/// As [`send`](`SignalInput::send`).
	pub fn send_event(&self, event: Event<T>) -> Result<(), SendError> {
		let Some(node) = self.node.upgrade() else {
			return Err(SendError::Disconnected);
		};
		if event.is_end() {
			self.closed.store(true, Ordering::Relaxed);
		}
		node.send(event)
	}

	/// Sends each value in order, stopping at the first failure.
	///
	/// # Errors
	///
	/// As [`send`](`SignalInput::send`).
	pub fn send_iter(&self, values: impl IntoIterator<Item = T>) -> Result<(), SendError> {
		for value in values {
			self.send(value)?;
		}
		Ok(())
	}

	/// Ends the stream with `Closed`.
	///
	/// # Errors
	///
	/// As [`send`](`SignalInput::send`).
	pub fn close(&self) -> Result<(), SendError> {
		self.send_event(Event::End(End::Closed))
	}
}

impl<T: Send + 'static> Drop for SignalInput<T> {
	fn drop(&mut self) {
		if !self.closed.load(Ordering::Relaxed) {
			if let Some(node) = self.node.upgrade() {
				node.producer_dropped(self.generation);
			}
		}
	}
}

impl<T: Send + 'static> std::fmt::Debug for SignalInput<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SignalInput")
			.field("closed", &self.closed.load(Ordering::Relaxed))
			.finish_non_exhaustive()
	}
}

/// Which ends of a bound source reach the fan-in's downstream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClosePropagation {
	/// The source is detached silently; nothing propagates.
	None,
	/// `Other` errors propagate; `Closed` and `Cancelled` detach silently.
	ErrorsOnly,
	/// Every end propagates and terminates the downstream.
	All,
}

/// Forwards a bound source's events into a fan-in stage and unhooks the
/// source when it ends, honouring its [`ClosePropagation`].
pub(crate) struct ForwardSink<T: Send + 'static> {
	target: Weak<Node<T>>,
	source: Weak<Node<T>>,
	policy: ClosePropagation,
}

impl<T: Send + 'static> ForwardSink<T> {
	pub(crate) fn new(
		target: Weak<Node<T>>,
		source: Weak<Node<T>>,
		policy: ClosePropagation,
	) -> Self {
		Self {
			target,
			source,
			policy,
		}
	}
}

impl<T: Send + 'static> Sink<T> for ForwardSink<T> {
	fn process(&self, event: Event<T>, delivery: Delivery) -> Option<End> {
		let Some(target) = self.target.upgrade() else {
			return None;
		};
		match event {
			Event::Value(value) => {
				let _ = target.send_with(Event::Value(value), delivery);
			}
			Event::End(end) => {
				let propagate = match self.policy {
					ClosePropagation::All => true,
					ClosePropagation::ErrorsOnly => end.is_error(),
					ClosePropagation::None => false,
				};
				if propagate {
					let _ = target.send_with(Event::End(end), delivery);
				}
				// The source is spent either way; unhook its anchor.
				target.remove_pred(Weak::as_ptr(&self.source).cast());
			}
		}
		None
	}
}

fn bind_in<T: Send + 'static>(target: &Weak<Node<T>>, signal: Signal<T>, policy: ClosePropagation) {
	let Some(target_node) = target.upgrade() else {
		return;
	};
	let source = signal.into_node();
	let pred: Arc<dyn Upstream> = source.clone();
	// Cycle check happens here, ahead of any wiring.
	target_node.add_pred(Arc::clone(&pred));
	let sink = ForwardSink::new(target.clone(), Arc::downgrade(&source), policy);
	source.attach(
		Exec::direct(),
		SinkRef::Strong(Arc::new(sink)),
		AttachOptions::PASSIVE,
	);
	if target_node.is_live() {
		pred.activate();
	}
}

struct FanInCore<T: Send + 'static> {
	node: Weak<Node<T>>,
}

impl<T: Send + 'static> Drop for FanInCore<T> {
	fn drop(&mut self) {
		// The last handle going away closes the downstream.
		if let Some(node) = self.node.upgrade() {
			node.close_with(End::Closed);
		}
	}
}

/// A cloneable producer handle accepting any number of parallel senders and
/// [`bind`](`SignalMultiInput::bind`) attachments.
///
/// Ends of bound sources never propagate; the source is detached instead.
/// Dropping the last handle closes the downstream.
#[must_use]
pub struct SignalMultiInput<T: Send + 'static> {
	core: Arc<FanInCore<T>>,
}

impl<T: Send + 'static> Clone for SignalMultiInput<T> {
	fn clone(&self) -> Self {
		Self {
			core: Arc::clone(&self.core),
		}
	}
}

impl<T: Send + 'static> SignalMultiInput<T> {
	pub(crate) fn new(node: Weak<Node<T>>) -> Self {
		Self {
			core: Arc::new(FanInCore { node }),
		}
	}

	/// Sends one value downstream.
	///
	/// # Errors
	///
	/// As [`SignalInput::send`].
	pub fn send(&self, value: T) -> Result<(), SendError> {
		let Some(node) = self.core.node.upgrade() else {
			return Err(SendError::Disconnected);
		};
		node.send(Event::Value(value))
	}

	/// Splices `signal` into the fan-in. Its values flow downstream; its
	/// end merely detaches it.
	pub fn bind(&self, signal: Signal<T>) {
		bind_in(&self.core.node, signal, ClosePropagation::None);
	}
}

/// A fan-in handle whose [`bind_with`](`SignalMergedInput::bind_with`)
/// attachments each carry their own [`ClosePropagation`] policy.
#[must_use]
pub struct SignalMergedInput<T: Send + 'static> {
	core: Arc<FanInCore<T>>,
}

impl<T: Send + 'static> Clone for SignalMergedInput<T> {
	fn clone(&self) -> Self {
		Self {
			core: Arc::clone(&self.core),
		}
	}
}

impl<T: Send + 'static> SignalMergedInput<T> {
	pub(crate) fn new(node: Weak<Node<T>>) -> Self {
		Self {
			core: Arc::new(FanInCore { node }),
		}
	}

	/// Sends one value downstream.
	///
	/// # Errors
	///
	/// As [`SignalInput::send`].
	pub fn send(&self, value: T) -> Result<(), SendError> {
		let Some(node) = self.core.node.upgrade() else {
			return Err(SendError::Disconnected);
		};
		node.send(Event::Value(value))
	}

	/// Splices `signal` into the fan-in under the given end policy.
	pub fn bind_with(&self, signal: Signal<T>, policy: ClosePropagation) {
		bind_in(&self.core.node, signal, policy);
	}
}
