//! Options accepted by the readers.
//!
//! Everything is explicit: no process-global state, no default-charset
//! lookups. The defaults match what the vast majority of archives need.

use crate::encoding::Encoding;
use crate::parse::ExtraFieldParseMode;

/// How entry names and comments without the UTF-8 flag are decoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EncodingPolicy {
    /// Guess the encoding from the bytes themselves (chardet-ng over the
    /// central directory for random access, CP-437 for streaming reads).
    #[default]
    Detect,

    /// Use this encoding, no guessing.
    Forced(Encoding),
}

/// Options recognized by both readers.
#[derive(Debug, Clone, Copy)]
pub struct ReadOptions {
    /// Encoding for names and comments that don't carry the UTF-8 flag.
    pub encoding: EncodingPolicy,

    /// Honor unicode path/comment extra fields (when their CRC-32 matches
    /// the raw bytes they override). On by default.
    pub use_unicode_extra_fields: bool,

    /// Allow reading STORED entries that use a data descriptor from a
    /// non-seekable source. This requires scanning the entry body for the
    /// descriptor, which involves guesswork; off by default.
    pub allow_stored_with_data_descriptor: bool,

    /// Skip the 4-byte split marker at the start of the first segment of a
    /// split archive instead of failing.
    pub skip_split_signature: bool,

    /// Don't enrich entries with data parsed from their local file header
    /// when opening them from a random-access archive.
    pub ignore_local_file_header: bool,

    /// How forgiving the extra-field walk is. Best-effort by default.
    pub extra_field_mode: ExtraFieldParseMode,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            encoding: EncodingPolicy::default(),
            use_unicode_extra_fields: true,
            allow_stored_with_data_descriptor: false,
            skip_split_signature: false,
            ignore_local_file_header: false,
            extra_field_mode: ExtraFieldParseMode::default(),
        }
    }
}
