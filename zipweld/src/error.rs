//! All error types used in this crate

use crate::parse::Method;

use super::encoding;

/// Any zip-related error, from invalid archives to encoding problems.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Not a valid zip file, or a variant that is unsupported.
    #[error("format: {0}")]
    Format(#[from] FormatError),

    /// Something is not supported by this crate
    #[error("unsupported: {0}")]
    Unsupported(#[from] UnsupportedError),

    /// The writer was asked to produce an archive that needs zip64
    /// structures while zip64 mode was set to `Never`.
    #[error("zip64 required: {0}")]
    Zip64Required(#[from] Zip64Error),

    /// Invalid UTF-8, Shift-JIS, or any problem encountered while decoding
    /// or encoding text in general.
    #[error("encoding: {0:?}")]
    Encoding(#[from] encoding::DecodingError),

    /// A caller-supplied argument was rejected: bad compression level,
    /// invalid alignment, removal of an absent extra field, and so on.
    #[error("bad argument: {0}")]
    BadArgument(&'static str),

    /// I/O-related error
    #[error("io: {0}")]
    IO(#[from] std::io::Error),

    /// Decompression-related error
    #[error("{method:?} decompression error: {msg}")]
    Decompression {
        /// The compression method that failed
        method: Method,
        /// Additional information
        msg: String,
    },

    /// Could not read as a zip because size could not be determined
    #[error("size must be known to open zip file")]
    UnknownSize,
}

impl Error {
    /// Create a new error indicating that the given method is not supported.
    pub fn method_not_supported(method: Method) -> Self {
        Self::Unsupported(UnsupportedError::MethodNotSupported(method))
    }

    /// Create a new error indicating that the given method is not enabled.
    pub fn method_not_enabled(method: Method) -> Self {
        Self::Unsupported(UnsupportedError::MethodNotEnabled(method))
    }
}

/// Some part of the zip format is not supported by this crate.
#[derive(Debug, thiserror::Error)]
pub enum UnsupportedError {
    /// The compression method is not supported.
    #[error("compression method not supported: {0:?}")]
    MethodNotSupported(Method),

    /// The compression method is supported, but not enabled in this build.
    #[error("compression method supported, but not enabled in this build: {0:?}")]
    MethodNotEnabled(Method),

    /// The entry is encrypted. Encryption is detected, never decrypted.
    #[error("encrypted entries are not supported")]
    Encrypted,

    /// A STORED entry uses a data descriptor and the caller did not opt into
    /// the lookahead scan required to read it from a non-seekable source.
    #[error("STORED entry with data descriptor (enable allow_stored_with_data_descriptor)")]
    DataDescriptor,

    /// The entry's compressed size is unknown and the method is not
    /// self-terminating, so the entry body cannot be delimited.
    #[error("compressed size unknown for method {0:?}")]
    UnknownCompressedSize(Method),

    /// The input is a split (multi-segment) archive and the caller did not
    /// opt into skipping the split signature.
    #[error("split archives are not supported here (enable skip_split_signature)")]
    Splitting,
}

/// Reasons the writer raises [Error::Zip64Required] in `Never` mode.
#[derive(Debug, thiserror::Error)]
pub enum Zip64Error {
    /// An entry's size or compressed size does not fit in 32 bits.
    #[error("entry too big")]
    EntryTooBig,

    /// An entry's local header offset does not fit in 32 bits.
    #[error("archive too big")]
    ArchiveTooBig,

    /// More than 65535 entries.
    #[error("too many entries")]
    TooManyEntries,

    /// Disk number of an entry or of the central directory exceeds 65534.
    #[error("too many disks")]
    TooManyDisks,

    /// Central directory size does not fit in 32 bits.
    #[error("central directory too big")]
    CentralDirectoryTooBig,

    /// Offset of the central directory does not fit in 32 bits.
    #[error("central directory offset too big")]
    CentralDirectoryOffsetTooBig,

    /// More than 65535 entries on a single disk.
    #[error("too many entries on one disk")]
    TooManyEntriesOnDisk,
}

/// Specific zip format errors, mostly due to invalid zip archives but that could also stem from
/// implementation shortcomings.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    /// The end of central directory record was not found.
    ///
    /// This usually indicates that the file being read is not a zip archive.
    #[error("end of central directory record not found")]
    DirectoryEndSignatureNotFound,

    /// The zip64 end of central directory record could not be parsed.
    ///
    /// This is only returned when a zip64 end of central directory *locator* was found,
    /// so the archive should be zip64, but isn't.
    #[error("zip64 end of central directory record not found")]
    Directory64EndRecordInvalid,

    /// Corrupted/partial zip file: the offset we found for the central directory
    /// points outside of the current file.
    #[error("directory offset points outside of file")]
    DirectoryOffsetPointsOutsideFile,

    /// The central record is corrupted somewhat.
    ///
    /// This can happen when the end of central directory record advertises
    /// a certain number of files, but we weren't able to read the same number of central directory
    /// headers.
    #[error("invalid central record: expected to read {expected} files, got {actual}")]
    InvalidCentralRecord {
        /// expected number of files
        expected: u16,
        /// actual number of files
        actual: u16,
    },

    /// An extra field (that we support) was not decoded correctly under a
    /// strict parsing mode.
    #[error("could not decode extra field 0x{tag:04x}")]
    InvalidExtraField {
        /// header id of the offending field
        tag: u16,
    },

    /// An extra-field region did not follow the (id, length, payload)
    /// pattern, under a parsing mode that refuses to keep the trailer.
    #[error("extra field region is malformed")]
    MalformedExtraFieldRegion,

    /// The entry declared 0xFFFFFFFF sentinels but its zip64 extended
    /// information extra field is missing or carries mismatched fields.
    #[error("invalid or missing zip64 extra field")]
    InvalidZip64ExtraField,

    /// The local file header (before the file data) could not be parsed correctly.
    #[error("invalid local file header")]
    InvalidLocalHeader,

    /// An unexpected record signature was encountered where a local file
    /// header should have been.
    #[error("unexpected record signature: 0x{signature:08x}")]
    UnexpectedRecordSignature {
        /// the 32-bit little-endian signature that was read
        signature: u32,
    },

    /// The data descriptor (after the file data) could not be parsed correctly.
    #[error("invalid data descriptor")]
    InvalidDataDescriptor,

    /// A split archive was expected but the first segment does not start
    /// with the split signature.
    #[error("not a split archive")]
    NotASplitArchive,

    /// The archive ends in the middle of a record.
    #[error("truncated archive")]
    TruncatedArchive,

    /// The uncompressed size didn't match
    #[error("uncompressed size didn't match: expected {expected}, got {actual}")]
    WrongSize {
        /// expected size in bytes (from the local header, data descriptor, etc.)
        expected: u64,
        /// actual size in bytes (from decompressing the entry)
        actual: u64,
    },

    /// The CRC-32 checksum didn't match.
    #[error("checksum didn't match: expected {expected:x?}, got {actual:x?}")]
    WrongChecksum {
        /// expected checksum (from the data descriptor, etc.)
        expected: u32,
        /// actual checksum (from decompressing the entry)
        actual: u32,
    },
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::IO(e) => e,
            e => std::io::Error::other(e),
        }
    }
}
