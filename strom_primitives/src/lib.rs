//! # Strom Primitives
//!
//! This crate contains the value types shared by the strom streaming
//! runtime: the 108 MHz tick time base, the 16.16 fractional playback
//! speed, and the packet flag word.
//!
//! # Codebase conventions
//!
//! - All timing is expressed in 108 MHz ticks with 64-bit times and
//!   durations. Milliseconds appear only at API edges.

// Reexport to not make the structure part of the public API and to reduce noise in paths.
mod flags;
pub use flags::*;
mod time;
pub use time::*;
