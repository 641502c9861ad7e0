#![warn(clippy::pedantic)]
#![warn(missing_docs)]
#![warn(unreachable_pub)]
#![doc = include_str!("../README.md")]

mod context;
mod lifetime;
mod pool;
mod queue;
mod timer;

pub mod virt;

pub use context::{Exec, ExecutionContext, Task, Timestamp, TimerTask};
pub use lifetime::Lifetime;

#[doc = include_str!("../README.md")]
mod readme {}
