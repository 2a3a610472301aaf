#![warn(missing_docs)]

//! zipweld is a [sans-io](https://sans-io.readthedocs.io/how-to-sans-io.html) library
//! for reading and writing zip files.
//!
//! It's made up of a bunch of types representing the various parts of a zip
//! file, winnow parsers that can turn byte buffers into those types (and
//! serializers that turn them back into bytes), and state machines that can
//! use those parsers to read zip files from a stream.
//!
//! This crate is low-level, you may be interested in
//! [zipweld-sync](https://crates.io/crates/zipweld-sync), which adds blocking
//! readers and writers on top of std I/O traits, along with split-archive
//! support and a parallel writer.

pub mod bitstream;
pub mod encoding;
pub mod error;
pub mod fsm;
pub mod options;
pub mod parse;
