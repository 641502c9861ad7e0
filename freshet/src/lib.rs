#![warn(clippy::pedantic)]
#![warn(missing_docs)]
#![warn(unreachable_pub)]
#![doc = include_str!("../README.md")]

mod combine;
mod event;
mod hub;
mod input;
mod node;
mod output;
mod signal;

pub use combine::{Combined2, Combined3, Combined4, Combined5};
pub use event::{End, Event, OtherError, ProcessorPanicked, SendError};
pub use input::{ClosePropagation, SignalInput, SignalMergedInput, SignalMultiInput};
pub use output::{SignalCapture, SignalJunction, SignalOutput, SignalPollingEndpoint};
pub use signal::{Emitter, Signal, SignalMulti};

pub use headwater::{Exec, ExecutionContext, Lifetime, Timestamp};

#[doc = include_str!("../README.md")]
mod readme {}
