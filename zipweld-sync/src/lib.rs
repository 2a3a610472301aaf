//! A library for reading and writing zip files synchronously using std I/O
//! traits, built on top of [zipweld](https://crates.io/crates/zipweld).
//!
//! Reading comes in two flavors: random access over anything that can hand
//! out cursors ([ReadZip]/[ReadZipWithSize]), and one-pass streaming over a
//! plain [std::io::Read] ([ReadZipStreaming]). Split archives are read
//! through [MultiSegmentChannel]. Writing goes through [ArchiveWriter], with
//! [SplitSink] for `.z01`-style segmented output and [ParallelZipCreator]
//! for scatter/gather assembly from many threads.

#![warn(missing_docs)]

mod entry_reader;
mod parallel;
mod read_zip;
mod split;
mod streaming_entry_reader;
mod writer;

// re-exports
pub use zipweld;

pub use entry_reader::EntryReader;
pub use parallel::ParallelZipCreator;
pub use read_zip::{
    HasCursor, ReadZip, ReadZipStreaming, ReadZipWithSize, SyncArchive, SyncEntry,
};
pub use split::MultiSegmentChannel;
pub use streaming_entry_reader::StreamingEntryReader;
pub use writer::{
    ArchiveWriter, RawEntry, SeekSink, Sink, SplitSink, StreamSink, UnicodeExtraPolicy,
    WriteOptions, Zip64Mode,
};
