//! # Strom Core
//!
//! Strom Core contains everything you need to build streaming units for the
//! strom runtime: result codes, packets and their pools, refcounted data
//! ranges over external memory pools, connectors, the packet parser and
//! formatter, the base unit machinery (pending-packet ingress, threaded
//! loops), the thread signal, and the message timer.
//!
//! ## Re-exports
//! strom_core re-exports all of strom_primitives. This keeps the tick time
//! base consistent among unit implementors and the graph runtime.

pub mod clock;
mod command;
mod connector;
mod error;
mod formatter;
mod message;
mod packet;
pub mod parser;
mod pool;
mod range;
pub mod support;
mod tag;
mod thread;
pub mod timer;
mod unit;

pub use command::*;
pub use connector::*;
pub use error::*;
pub use formatter::*;
pub use message::*;
pub use packet::*;
pub use pool::*;
pub use range::*;
pub use strom_primitives::*;
pub use tag::*;
pub use thread::*;
pub use unit::*;
