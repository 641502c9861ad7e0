use std::{error::Error, fmt::Debug, sync::Arc};

/// Shared payload of [`End::Other`].
pub type OtherError = Arc<dyn Error + Send + Sync>;

/// Why a stream ended.
///
/// The first end observed on an edge is final: no further [`Event`]s
/// propagate past it on that edge.
#[derive(Clone, Debug)]
pub enum End {
	/// Expected end-of-stream, sent by the producer.
	Closed,
	/// The producer (or an owner along the path) was released.
	Cancelled,
	/// Any unexpected error, including caught processor panics.
	Other(OtherError),
}

impl End {
	/// Wraps `error` as [`End::Other`].
	pub fn other(error: impl 'static + Error + Send + Sync) -> Self {
		Self::Other(Arc::new(error))
	}

	/// Whether this end is an unexpected error rather than an expected or
	/// cancellation-driven termination.
	#[must_use]
	pub fn is_error(&self) -> bool {
		matches!(self, Self::Other(_))
	}
}

impl PartialEq for End {
	fn eq(&self, other: &Self) -> bool {
		match (self, other) {
			(Self::Closed, Self::Closed) | (Self::Cancelled, Self::Cancelled) => true,
			// Error payloads compare by identity; there is no useful deep equality here.
			(Self::Other(a), Self::Other(b)) => Arc::ptr_eq(a, b),
			_ => false,
		}
	}
}

/// One stream item: a value or the terminating end.
#[derive(Clone, Debug, PartialEq)]
pub enum Event<T> {
	/// A value flowing down the edge.
	Value(T),
	/// The edge's terminal end.
	End(End),
}

impl<T> Event<T> {
	/// The contained value, discarding ends.
	pub fn value(self) -> Option<T> {
		match self {
			Self::Value(value) => Some(value),
			Self::End(_) => None,
		}
	}

	/// The contained end, discarding values.
	pub fn end(self) -> Option<End> {
		match self {
			Self::Value(_) => None,
			Self::End(end) => Some(end),
		}
	}

	/// Whether this is a terminal end.
	#[must_use]
	pub fn is_end(&self) -> bool {
		matches!(self, Self::End(_))
	}

	/// Maps the value, carrying ends through unchanged.
	pub fn map<U>(self, map: impl FnOnce(T) -> U) -> Event<U> {
		match self {
			Self::Value(value) => Event::Value(map(value)),
			Self::End(end) => Event::End(end),
		}
	}

	pub(crate) fn as_end(&self) -> Option<&End> {
		match self {
			Self::Value(_) => None,
			Self::End(end) => Some(end),
		}
	}
}

impl<T> From<T> for Event<T> {
	fn from(value: T) -> Self {
		Self::Value(value)
	}
}

/// Why a send was not delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
	/// No live output anchors the receiving stage; the event was discarded.
	#[error("the receiving stage is not active and discarded the event")]
	Inactive,
	/// The receiving graph completed or no longer exists.
	#[error("the receiving graph completed or no longer exists")]
	Disconnected,
}

/// Payload of the [`End::Other`] emitted when a processor panicked.
#[derive(Debug, thiserror::Error)]
#[error("signal processor panicked: {0}")]
pub struct ProcessorPanicked(pub String);

#[cfg(test)]
mod tests {
	use super::{End, Event};

	#[test]
	fn ends_compare_by_variant_and_error_identity() {
		assert_eq!(End::Closed, End::Closed);
		assert_ne!(End::Closed, End::Cancelled);
		let a = End::other(super::ProcessorPanicked("a".to_owned()));
		assert_eq!(a, a.clone());
		assert_ne!(a, End::other(super::ProcessorPanicked("a".to_owned())));
	}

	#[test]
	fn map_carries_ends_through() {
		assert_eq!(Event::Value(2).map(|n: i32| n * 2), Event::Value(4));
		assert_eq!(
			Event::<i32>::End(End::Closed).map(|n| n * 2),
			Event::End(End::Closed)
		);
	}
}
