use std::cmp;

use oval::Buffer;
use tracing::trace;
use winnow::{
    error::ErrMode,
    stream::{AsBytes, Offset},
    Parser, Partial,
};

mod store_dec;

#[cfg(feature = "deflate")]
mod deflate_dec;

mod implode_dec;
mod shrink_dec;

use crate::{
    error::{Error, FormatError, UnsupportedError},
    options::ReadOptions,
    parse::{
        flag_encrypted, DataDescriptorRecord, DirectoryHeader, Entry,
        EndOfCentralDirectoryRecord, LocalFileHeader, Method,
    },
};

use super::FsmResult;

const DD_SIGNATURE: &[u8] = b"PK\x07\x08";
const SPLIT_SIGNATURE: &[u8] = b"PK00";
const ARCHIVE_EXTRA_DATA_SIGNATURE: &[u8] = b"PK\x06\x08";
const APK_SIGNING_BLOCK_MAGIC: &[u8] = b"APK Sig Block 42";

// An APK signing block bigger than this is assumed to be garbage that
// happened to look like one.
const APK_SIGNING_BLOCK_MAX: u64 = 64 * 1024 * 1024;

struct EntryReadMetrics {
    uncompressed_size: u64,
    crc32: u32,
}

/// What was found where a local file header was expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    /// A local file header was parsed; the entry is available through
    /// [EntryFsm::entry].
    Entry,

    /// The central directory (or an equivalent terminal structure: archive
    /// extra data record, end of central directory, APK signing block) was
    /// found: there are no more entries.
    EndOfEntries,
}

#[derive(Default)]
enum State {
    /// Waiting for enough data to parse the local file header (or to
    /// recognize that there are no more entries).
    ReadLocalHeader,

    /// Streaming the entry body through a decompressor.
    ReadData {
        /// CRC32 hash of the decompressed data
        hasher: crc32fast::Hasher,

        /// The decompression method we're using
        decompressor: AnyDecompressor,

        /// Compressed size, None when it can only be learned from the
        /// data descriptor
        csize: Option<u64>,

        /// Whether a data descriptor follows the body
        has_data_descriptor: bool,

        /// Whether the data descriptor carries 64-bit sizes
        is_zip64: bool,
    },

    /// STORED entry of unknown size: scan the raw bytes for the data
    /// descriptor, emitting everything before it as body.
    ScanBody {
        hasher: crc32fast::Hasher,

        /// body bytes emitted so far
        body: u64,

        /// once the descriptor has been located, how many body bytes are
        /// still buffered ahead of it
        remaining_to_descriptor: Option<u64>,

        is_zip64: bool,
    },

    /// Discarding the rest of the body without decompressing it.
    SkipData {
        remaining: u64,
        has_data_descriptor: bool,
        is_zip64: bool,
    },

    /// Reading the data descriptor. `metrics` is None when the body was
    /// skipped, in which case nothing can be validated.
    ReadDataDescriptor {
        metrics: Option<EntryReadMetrics>,
        is_zip64: bool,
    },

    /// Reading a data descriptor found by [State::ScanBody]: its size width
    /// must be probed rather than derived from a zip64 extra.
    ReadScannedDataDescriptor {
        metrics: EntryReadMetrics,
        is_zip64: bool,
    },

    /// Comparing what we decompressed against what was declared.
    Validate {
        metrics: Option<EntryReadMetrics>,
        descriptor: Option<DataDescriptorRecord>,
    },

    /// Consuming a suspected APK signing block up to its magic.
    SkipApkBlock {
        remaining_to_magic: u64,
    },

    /// No more entries in this archive.
    End,

    #[default]
    Transition,
}

/// A state machine that can parse a zip entry.
///
/// Constructed either from central directory metadata (random access) or
/// from nothing at all (streaming): in the latter case the local file header
/// is the only source of truth, and [EntryFsm::process_till_header] exposes
/// the entry it described.
pub struct EntryFsm {
    state: State,
    entry: Option<Entry>,
    options: ReadOptions,
    buffer: Buffer,
    eof: bool,
    at_archive_start: bool,
    split_checked: bool,
    compressed_bytes: u64,
    uncompressed_bytes: u64,
}

impl EntryFsm {
    const DEFAULT_BUFFER_SIZE: usize = 256 * 1024;

    /// Create a new state machine.
    ///
    /// `entry` carries central-directory metadata when reading from a
    /// random-access archive, or None when reading a bare stream of local
    /// headers.
    pub fn new(entry: Option<Entry>, options: ReadOptions) -> Self {
        Self::with_buffer(entry, Buffer::with_capacity(Self::DEFAULT_BUFFER_SIZE), options)
    }

    /// Like [Self::new], but reusing leftover buffered data from a previous
    /// entry's state machine.
    pub fn with_buffer(entry: Option<Entry>, buffer: Buffer, options: ReadOptions) -> Self {
        Self {
            state: State::ReadLocalHeader,
            entry,
            options,
            buffer,
            eof: false,
            at_archive_start: false,
            split_checked: false,
            compressed_bytes: 0,
            uncompressed_bytes: 0,
        }
    }

    /// Mark this state machine as sitting at the very start of an archive,
    /// where a split marker may precede the first local file header.
    pub fn at_archive_start(mut self) -> Self {
        self.at_archive_start = true;
        self
    }

    /// The entry being read, once known. Always available in random-access
    /// mode; available after the header was parsed in streaming mode.
    pub fn entry(&self) -> Option<&Entry> {
        self.entry.as_ref()
    }

    /// Bytes of compressed data consumed so far.
    pub fn compressed_bytes(&self) -> u64 {
        self.compressed_bytes
    }

    /// Bytes of uncompressed data produced so far.
    pub fn uncompressed_bytes(&self) -> u64 {
        self.uncompressed_bytes
    }

    /// If this returns true, the caller should read data into [Self::space]
    /// — without forgetting to call [Self::fill] with the number of bytes
    /// written.
    pub fn wants_read(&self) -> bool {
        match self.state {
            State::Validate { .. } | State::End => false,
            State::Transition => unreachable!(),
            _ => self.buffer.available_space() > 0,
        }
    }

    /// Advance through the header phase.
    ///
    /// Returns `Ok(None)` when more input is needed, or the outcome: either
    /// an entry (query it with [Self::entry]) or the end of all entries.
    pub fn process_till_header(&mut self) -> Result<Option<EntryOutcome>, Error> {
        match self.state {
            State::ReadLocalHeader => {}
            State::SkipApkBlock { .. } => return self.process_apk_block(),
            State::End => return Ok(Some(EntryOutcome::EndOfEntries)),
            // already past the header
            _ => return Ok(Some(EntryOutcome::Entry)),
        }

        if self.at_archive_start && !self.split_checked {
            let data = self.buffer.data();
            if data.len() < 4 && !self.eof {
                return Ok(None);
            }
            if data.len() >= 4 && (&data[..4] == DD_SIGNATURE || &data[..4] == SPLIT_SIGNATURE) {
                if !self.options.skip_split_signature {
                    return Err(UnsupportedError::Splitting.into());
                }
                trace!("skipping split marker at archive start");
                self.buffer.consume(4);
            }
            self.split_checked = true;
        }

        let mut input = Partial::new(self.buffer.data());
        match LocalFileHeader::parser.parse_next(&mut input) {
            Ok(header) => {
                let consumed = input.as_bytes().offset_from(&self.buffer.data());
                trace!(local_file_header = ?header, consumed, "parsed local file header");
                self.buffer.consume(consumed);
                self.setup_entry(header, consumed as u64)?;
                Ok(Some(EntryOutcome::Entry))
            }
            Err(ErrMode::Incomplete(_)) => {
                if self.eof {
                    if self.buffer.data().is_empty() {
                        // a clean end: no more records at all
                        self.state = State::End;
                        return Ok(Some(EntryOutcome::EndOfEntries));
                    }
                    return Err(FormatError::TruncatedArchive.into());
                }
                Ok(None)
            }
            Err(_) => self.recognize_non_entry(),
        }
    }

    /// Called when the 4 bytes where a local file header signature should be
    /// are something else: end-of-entries records, an APK signing block, or
    /// corruption.
    fn recognize_non_entry(&mut self) -> Result<Option<EntryOutcome>, Error> {
        let data = self.buffer.data();
        if data.len() < 4 {
            return Err(FormatError::TruncatedArchive.into());
        }
        let sig = &data[..4];
        if sig == DirectoryHeader::SIGNATURE.as_bytes()
            || sig == ARCHIVE_EXTRA_DATA_SIGNATURE
            || sig == EndOfCentralDirectoryRecord::SIGNATURE.as_bytes()
        {
            trace!("found a terminal record, no more entries");
            self.state = State::End;
            return Ok(Some(EntryOutcome::EndOfEntries));
        }

        // the APK signing block sits right before the central directory and
        // starts with a 64-bit length; the magic sits at its very end
        if data.len() >= 8 {
            let block_len = u64::from_le_bytes(data[..8].try_into().unwrap());
            if (24..APK_SIGNING_BLOCK_MAX).contains(&block_len) {
                self.state = State::SkipApkBlock {
                    remaining_to_magic: 8 + block_len - 16,
                };
                return self.process_apk_block();
            }
        }

        let signature = u32::from_le_bytes(sig.try_into().unwrap());
        Err(FormatError::UnexpectedRecordSignature { signature }.into())
    }

    fn process_apk_block(&mut self) -> Result<Option<EntryOutcome>, Error> {
        let State::SkipApkBlock { remaining_to_magic } = &mut self.state else {
            unreachable!()
        };

        if *remaining_to_magic > 0 {
            let available = self.buffer.available_data() as u64;
            let consume = cmp::min(*remaining_to_magic, available) as usize;
            self.buffer.consume(consume);
            *remaining_to_magic -= consume as u64;
            if *remaining_to_magic > 0 {
                if self.eof {
                    return Err(FormatError::TruncatedArchive.into());
                }
                return Ok(None);
            }
        }

        let data = self.buffer.data();
        if data.len() < APK_SIGNING_BLOCK_MAGIC.len() {
            if self.eof {
                return Err(FormatError::TruncatedArchive.into());
            }
            return Ok(None);
        }
        if &data[..APK_SIGNING_BLOCK_MAGIC.len()] == APK_SIGNING_BLOCK_MAGIC {
            trace!("found APK signing block, treating as end of entries");
            self.state = State::End;
            return Ok(Some(EntryOutcome::EndOfEntries));
        }
        // it wasn't an APK signing block after all
        Err(FormatError::InvalidLocalHeader.into())
    }

    /// Decide how the entry body will be read, based on the local file
    /// header and (when present) central directory metadata.
    fn setup_entry(&mut self, header: LocalFileHeader, header_len: u64) -> Result<(), Error> {
        let entry = match self.entry.take() {
            // random access: the central directory is the source of truth,
            // the local header only enriches it
            Some(mut entry) => {
                if !self.options.ignore_local_file_header {
                    entry.data_offset = Some(entry.header_offset + header_len);
                    let settings = crate::parse::ExtraFieldSettings::local(
                        header.uncompressed_size,
                        header.compressed_size,
                    );
                    if let Ok(local_fields) = crate::parse::parse_extra_fields(
                        &header.extra.0,
                        settings,
                        self.options.extra_field_mode,
                    ) {
                        for field in local_fields {
                            let tag = field.tag();
                            let seen = entry.extra_fields.iter().any(|f| f.tag() == tag);
                            if !seen {
                                entry.extra_fields.push(field);
                            }
                        }
                    }
                }
                entry
            }
            None => header.as_entry(&self.options)?,
        };

        if flag_encrypted(entry.flags) {
            return Err(UnsupportedError::Encrypted.into());
        }

        let has_data_descriptor = entry.has_data_descriptor();
        let csize = if entry.compressed_size != 0 || !has_data_descriptor {
            Some(entry.compressed_size)
        } else {
            None
        };
        let method = entry.method;
        let is_zip64 = entry.is_zip64;
        let flags = entry.flags;

        let state = match (method, csize) {
            (Method::Store, None) => {
                if !self.options.allow_stored_with_data_descriptor {
                    return Err(UnsupportedError::DataDescriptor.into());
                }
                State::ScanBody {
                    hasher: crc32fast::Hasher::new(),
                    body: 0,
                    remaining_to_descriptor: None,
                    is_zip64,
                }
            }
            (Method::Deflate, _) | (_, Some(_)) => {
                // a zero size next to a data descriptor flag means "unknown",
                // not "empty"
                let usize_hint = if entry.uncompressed_size != 0 || !has_data_descriptor {
                    Some(entry.uncompressed_size)
                } else {
                    None
                };
                State::ReadData {
                    hasher: crc32fast::Hasher::new(),
                    decompressor: AnyDecompressor::new(method, flags, usize_hint)?,
                    csize,
                    has_data_descriptor,
                    is_zip64,
                }
            }
            (method, None) => {
                // not self-terminating, cannot be delimited without a size
                return Err(UnsupportedError::UnknownCompressedSize(method).into());
            }
        };

        self.entry = Some(entry);
        self.state = state;
        Ok(())
    }

    /// Process buffered input, writing decompressed output into `out`.
    ///
    /// `FsmResult::Continue` means the machine needs more input or more
    /// output room; `FsmResult::Done` carries the leftover buffer, which
    /// holds the first bytes of whatever follows this entry.
    pub fn process(
        mut self,
        out: &mut [u8],
    ) -> Result<FsmResult<(Self, DecompressOutcome), Buffer>, Error> {
        use State as S;
        match &mut self.state {
            S::ReadLocalHeader | S::SkipApkBlock { .. } => {
                match self.process_till_header()? {
                    None => Ok(FsmResult::Continue((self, Default::default()))),
                    Some(EntryOutcome::Entry) => self.process(out),
                    Some(EntryOutcome::EndOfEntries) => {
                        Err(FormatError::InvalidLocalHeader.into())
                    }
                }
            }
            S::ReadData {
                hasher,
                decompressor,
                csize,
                ..
            } => {
                let in_buf = self.buffer.data();

                // don't feed the decompressor bytes beyond the entry's
                // compressed size, when we know it
                let in_buf = match csize {
                    Some(csize) => {
                        let cap = cmp::min(
                            in_buf.len() as u64,
                            *csize - self.compressed_bytes,
                        ) as usize;
                        &in_buf[..cap]
                    }
                    None => in_buf,
                };

                let fed_bytes_after_this = self.compressed_bytes + in_buf.len() as u64;
                let has_more_input = match csize {
                    Some(csize) => {
                        if fed_bytes_after_this == *csize {
                            HasMoreInput::No
                        } else {
                            HasMoreInput::Yes
                        }
                    }
                    None => {
                        if self.eof {
                            HasMoreInput::No
                        } else {
                            HasMoreInput::Yes
                        }
                    }
                };

                let outcome = decompressor.decompress(in_buf, out, has_more_input)?;
                trace!(
                    ?outcome,
                    compressed_bytes = self.compressed_bytes,
                    uncompressed_bytes = self.uncompressed_bytes,
                    eof = self.eof,
                    "decompressed"
                );
                self.buffer.consume(outcome.bytes_read);
                self.compressed_bytes += outcome.bytes_read as u64;

                let input_done = match csize {
                    Some(csize) => self.compressed_bytes == *csize,
                    None => decompressor.is_done() || (self.eof && self.buffer.data().is_empty()),
                };

                if outcome.bytes_written == 0 && input_done {
                    // we're done, read the data descriptor (if there's one)
                    let uncompressed_size = self.uncompressed_bytes;
                    transition!(self.state => (S::ReadData { hasher, has_data_descriptor, is_zip64, .. }) {
                        let metrics = EntryReadMetrics {
                            uncompressed_size,
                            crc32: hasher.finalize(),
                        };

                        if has_data_descriptor {
                            S::ReadDataDescriptor { metrics: Some(metrics), is_zip64 }
                        } else {
                            S::Validate { metrics: Some(metrics), descriptor: None }
                        }
                    });
                    return self.process(out);
                }

                if outcome.bytes_written == 0 && outcome.bytes_read == 0 {
                    if self.eof {
                        // not done, nothing read, nothing written, no more
                        // input coming: the archive stops mid-entry
                        return Err(FormatError::TruncatedArchive.into());
                    }
                    // starved: needs more input
                    return Ok(FsmResult::Continue((self, outcome)));
                }

                // write the decompressed data to the hasher
                if let S::ReadData { hasher, .. } = &mut self.state {
                    hasher.update(&out[..outcome.bytes_written]);
                }
                self.uncompressed_bytes += outcome.bytes_written as u64;

                Ok(FsmResult::Continue((self, outcome)))
            }
            S::ScanBody {
                hasher,
                body,
                remaining_to_descriptor,
                is_zip64,
            } => {
                let is_zip64 = *is_zip64;
                let data = self.buffer.data();

                if remaining_to_descriptor.is_none() {
                    *remaining_to_descriptor =
                        scan_for_data_descriptor(data, is_zip64).map(|cutoff| cutoff as u64);
                }

                // bytes we're certain belong to the body
                let certain = match *remaining_to_descriptor {
                    Some(remaining) => remaining,
                    None => {
                        // a descriptor (plus its optional signature, plus a
                        // partial next-record signature) may start inside the
                        // unscanned tail, hold it back
                        let holdback = expected_descriptor_len(is_zip64) + 4 + 3;
                        data.len().saturating_sub(holdback) as u64
                    }
                };

                let emit = cmp::min(cmp::min(certain, out.len() as u64), data.len() as u64) as usize;
                if emit > 0 {
                    out[..emit].copy_from_slice(&data[..emit]);
                    hasher.update(&out[..emit]);
                    *body += emit as u64;
                    if let Some(remaining) = remaining_to_descriptor {
                        *remaining -= emit as u64;
                    }
                    self.buffer.consume(emit);
                    self.compressed_bytes += emit as u64;
                    self.uncompressed_bytes += emit as u64;
                    let outcome = DecompressOutcome {
                        bytes_read: emit,
                        bytes_written: emit,
                    };
                    return Ok(FsmResult::Continue((self, outcome)));
                }

                if *remaining_to_descriptor == Some(0) {
                    let uncompressed_size = *body;
                    transition!(self.state => (S::ScanBody { hasher, .. }) {
                        let metrics = EntryReadMetrics {
                            uncompressed_size,
                            crc32: hasher.finalize(),
                        };
                        S::ReadScannedDataDescriptor { metrics, is_zip64 }
                    });
                    return self.process(out);
                }

                if self.eof {
                    // a stored entry with a data descriptor must be followed
                    // by at least one more record
                    return Err(FormatError::TruncatedArchive.into());
                }
                Ok(FsmResult::Continue((self, Default::default())))
            }
            S::SkipData { remaining, .. } => {
                let available = self.buffer.available_data() as u64;
                let consume = cmp::min(*remaining, available) as usize;
                self.buffer.consume(consume);
                *remaining -= consume as u64;
                self.compressed_bytes += consume as u64;
                if *remaining > 0 {
                    if self.eof {
                        return Err(FormatError::TruncatedArchive.into());
                    }
                    return Ok(FsmResult::Continue((self, Default::default())));
                }
                transition!(self.state => (S::SkipData { has_data_descriptor, is_zip64, .. }) {
                    if has_data_descriptor {
                        S::ReadDataDescriptor { metrics: None, is_zip64 }
                    } else {
                        S::Validate { metrics: None, descriptor: None }
                    }
                });
                self.process(out)
            }
            S::ReadDataDescriptor { is_zip64, .. } => {
                let is_zip64 = *is_zip64;
                let mut input = Partial::new(self.buffer.data());
                match DataDescriptorRecord::mk_parser(is_zip64).parse_next(&mut input) {
                    Ok(descriptor) => {
                        self.buffer
                            .consume(input.as_bytes().offset_from(&self.buffer.data()));
                        trace!("data descriptor = {:#?}", descriptor);
                        transition!(self.state => (S::ReadDataDescriptor { metrics, .. }) {
                            S::Validate { metrics, descriptor: Some(descriptor) }
                        });
                        self.process(out)
                    }
                    Err(ErrMode::Incomplete(_)) => {
                        if self.eof {
                            return Err(FormatError::InvalidDataDescriptor.into());
                        }
                        Ok(FsmResult::Continue((self, Default::default())))
                    }
                    Err(_e) => Err(FormatError::InvalidDataDescriptor.into()),
                }
            }
            S::ReadScannedDataDescriptor { .. } => {
                let data = self.buffer.data();
                match parse_scanned_data_descriptor(data, self.eof) {
                    ScannedDescriptor::NeedMoreData => {
                        if self.eof {
                            return Err(FormatError::InvalidDataDescriptor.into());
                        }
                        Ok(FsmResult::Continue((self, Default::default())))
                    }
                    ScannedDescriptor::Parsed { record, consumed } => {
                        self.buffer.consume(consumed);
                        trace!("scanned data descriptor = {:#?}", record);
                        transition!(self.state => (S::ReadScannedDataDescriptor { metrics, .. }) {
                            S::Validate { metrics: Some(metrics), descriptor: Some(record) }
                        });
                        self.process(out)
                    }
                }
            }
            S::Validate {
                metrics,
                descriptor,
            } => {
                if let (Some(metrics), Some(entry)) = (metrics.as_ref(), self.entry.as_mut()) {
                    let expected_crc32 = if entry.crc32 != 0 {
                        entry.crc32
                    } else if let Some(descriptor) = descriptor.as_ref() {
                        descriptor.crc32
                    } else {
                        0
                    };

                    let expected_size = if entry.uncompressed_size != 0 {
                        entry.uncompressed_size
                    } else if let Some(descriptor) = descriptor.as_ref() {
                        descriptor.uncompressed_size
                    } else {
                        0
                    };

                    // fill in what the descriptor taught us
                    if let Some(descriptor) = descriptor.as_ref() {
                        if entry.crc32 == 0 {
                            entry.crc32 = descriptor.crc32;
                        }
                        if entry.uncompressed_size == 0 {
                            entry.uncompressed_size = descriptor.uncompressed_size;
                        }
                        if entry.compressed_size == 0 {
                            entry.compressed_size = descriptor.compressed_size;
                        }
                    }

                    if expected_size != 0 && expected_size != metrics.uncompressed_size {
                        return Err(FormatError::WrongSize {
                            expected: expected_size,
                            actual: metrics.uncompressed_size,
                        }
                        .into());
                    }

                    if expected_crc32 != 0 && expected_crc32 != metrics.crc32 {
                        return Err(FormatError::WrongChecksum {
                            expected: expected_crc32,
                            actual: metrics.crc32,
                        }
                        .into());
                    }
                }

                let buffer = std::mem::replace(&mut self.buffer, Buffer::with_capacity(1));
                Ok(FsmResult::Done(buffer))
            }
            S::End | S::Transition => {
                unreachable!("process() called in a terminal state")
            }
        }
    }

    /// Ask the machine to discard the rest of the body instead of
    /// decompressing it. Only possible when the compressed size is known;
    /// returns false otherwise (the caller then reads through normally).
    pub fn request_skip(&mut self) -> bool {
        use State as S;
        match &self.state {
            S::ReadData {
                csize: Some(csize),
                has_data_descriptor,
                is_zip64,
                ..
            } => {
                let (csize, has_data_descriptor, is_zip64) =
                    (*csize, *has_data_descriptor, *is_zip64);
                self.state = S::SkipData {
                    remaining: csize - self.compressed_bytes,
                    has_data_descriptor,
                    is_zip64,
                };
                true
            }
            S::SkipData { .. } => true,
            _ => false,
        }
    }

    /// Returns a mutable slice with all the available space to write to.
    ///
    /// After writing to this, call [Self::fill] with the number of bytes written.
    #[inline]
    pub fn space(&mut self) -> &mut [u8] {
        if self.buffer.available_space() == 0 {
            self.buffer.shift();
        }
        self.buffer.space()
    }

    /// After having written data to [Self::space], call this to indicate how
    /// many bytes were written.
    ///
    /// If this is called with zero, it indicates eof.
    #[inline]
    pub fn fill(&mut self, count: usize) -> usize {
        if count == 0 {
            self.eof = true;
        }
        self.buffer.fill(count)
    }
}

/// How long the data descriptor is expected to be, excluding the optional
/// signature: crc32 plus two sizes.
fn expected_descriptor_len(is_zip64: bool) -> usize {
    if is_zip64 {
        4 + 2 * 8
    } else {
        4 + 2 * 4
    }
}

/// Scan `data` for the structure terminating a stored entry of unknown size:
/// either a data descriptor's own signature, or the next record's signature
/// with room for a descriptor before it. Returns the offset at which the
/// entry's body ends (and the descriptor begins).
fn scan_for_data_descriptor(data: &[u8], is_zip64: bool) -> Option<usize> {
    let expected_len = expected_descriptor_len(is_zip64);
    for i in 0..data.len().saturating_sub(3) {
        let sig = &data[i..i + 4];
        if sig == DD_SIGNATURE {
            return Some(i);
        }
        if sig == LocalFileHeader::SIGNATURE.as_bytes()
            || sig == DirectoryHeader::SIGNATURE.as_bytes()
        {
            if let Some(mut cutoff) = i.checked_sub(expected_len) {
                // the descriptor may carry the optional signature too
                if cutoff >= 4 && &data[cutoff - 4..cutoff] == DD_SIGNATURE {
                    cutoff -= 4;
                }
                return Some(cutoff);
            }
            // no room for a descriptor before this match: a false positive
        }
    }
    None
}

enum ScannedDescriptor {
    NeedMoreData,
    Parsed {
        record: DataDescriptorRecord,
        consumed: usize,
    },
}

/// Parse a data descriptor whose size width is unknown: read the crc, then
/// probe whether the bytes 8 past it look like the next record's signature
/// (4-byte sizes) or not (8-byte sizes).
fn parse_scanned_data_descriptor(data: &[u8], eof: bool) -> ScannedDescriptor {
    let mut pos = 0;
    if data.len() >= 4 && &data[..4] == DD_SIGNATURE {
        pos = 4;
    }
    if data.len() < pos + 4 {
        return ScannedDescriptor::NeedMoreData;
    }
    let crc32 = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap());
    let sizes = &data[pos + 4..];

    let four_byte_sizes = if sizes.len() >= 12 {
        is_record_signature(&sizes[8..12])
    } else if eof {
        true
    } else {
        return ScannedDescriptor::NeedMoreData;
    };

    if four_byte_sizes {
        if sizes.len() < 8 {
            return ScannedDescriptor::NeedMoreData;
        }
        let compressed_size = u32::from_le_bytes(sizes[0..4].try_into().unwrap()) as u64;
        let uncompressed_size = u32::from_le_bytes(sizes[4..8].try_into().unwrap()) as u64;
        ScannedDescriptor::Parsed {
            record: DataDescriptorRecord {
                crc32,
                compressed_size,
                uncompressed_size,
            },
            consumed: pos + 4 + 8,
        }
    } else {
        if sizes.len() < 16 {
            return ScannedDescriptor::NeedMoreData;
        }
        let compressed_size = u64::from_le_bytes(sizes[0..8].try_into().unwrap());
        let uncompressed_size = u64::from_le_bytes(sizes[8..16].try_into().unwrap());
        ScannedDescriptor::Parsed {
            record: DataDescriptorRecord {
                crc32,
                compressed_size,
                uncompressed_size,
            },
            consumed: pos + 4 + 16,
        }
    }
}

fn is_record_signature(sig: &[u8]) -> bool {
    sig == LocalFileHeader::SIGNATURE.as_bytes()
        || sig == DirectoryHeader::SIGNATURE.as_bytes()
        || sig == EndOfCentralDirectoryRecord::SIGNATURE.as_bytes()
}

enum AnyDecompressor {
    Store(store_dec::StoreDec),
    #[cfg(feature = "deflate")]
    Deflate(Box<deflate_dec::DeflateDec>),
    Shrink(Box<shrink_dec::ShrinkDec>),
    Implode(Box<implode_dec::ImplodeDec>),
}

/// What one call to [EntryFsm::process] did.
#[derive(Default, Debug)]
pub struct DecompressOutcome {
    /// Number of bytes read from input
    pub bytes_read: usize,

    /// Number of bytes written to output
    pub bytes_written: usize,
}

pub(crate) enum HasMoreInput {
    Yes,
    No,
}

pub(crate) trait Decompressor {
    fn decompress(
        &mut self,
        in_buf: &[u8],
        out: &mut [u8],
        has_more_input: HasMoreInput,
    ) -> Result<DecompressOutcome, Error>;

    /// True once the decoder knows no more output will ever come,
    /// regardless of further input. Only self-terminating formats can tell.
    fn is_done(&self) -> bool {
        false
    }
}

impl AnyDecompressor {
    fn new(method: Method, flags: u16, uncompressed_size: Option<u64>) -> Result<Self, Error> {
        let dec = match method {
            Method::Store => Self::Store(Default::default()),

            #[cfg(feature = "deflate")]
            Method::Deflate => Self::Deflate(Default::default()),
            #[cfg(not(feature = "deflate"))]
            Method::Deflate => {
                let err = Error::Unsupported(UnsupportedError::MethodNotEnabled(method));
                return Err(err);
            }

            Method::Shrink => Self::Shrink(Box::new(shrink_dec::ShrinkDec::new(
                uncompressed_size,
            ))),
            Method::Implode => Self::Implode(Box::new(implode_dec::ImplodeDec::new(
                flags,
                uncompressed_size,
            ))),

            _ => {
                let err = Error::Unsupported(UnsupportedError::MethodNotSupported(method));
                return Err(err);
            }
        };
        Ok(dec)
    }
}

impl Decompressor for AnyDecompressor {
    #[inline]
    fn decompress(
        &mut self,
        in_buf: &[u8],
        out: &mut [u8],
        has_more_input: HasMoreInput,
    ) -> Result<DecompressOutcome, Error> {
        // forward to the appropriate decompressor
        match self {
            Self::Store(dec) => dec.decompress(in_buf, out, has_more_input),
            #[cfg(feature = "deflate")]
            Self::Deflate(dec) => dec.decompress(in_buf, out, has_more_input),
            Self::Shrink(dec) => dec.decompress(in_buf, out, has_more_input),
            Self::Implode(dec) => dec.decompress(in_buf, out, has_more_input),
        }
    }

    #[inline]
    fn is_done(&self) -> bool {
        match self {
            Self::Store(dec) => dec.is_done(),
            #[cfg(feature = "deflate")]
            Self::Deflate(dec) => dec.is_done(),
            Self::Shrink(dec) => dec.is_done(),
            Self::Implode(dec) => dec.is_done(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_scan_finds_own_signature() {
        let mut data = b"hello world".to_vec();
        data.extend_from_slice(DD_SIGNATURE);
        data.extend_from_slice(&[0u8; 12]);
        assert_eq!(scan_for_data_descriptor(&data, false), Some(11));
    }

    #[test]
    fn descriptor_scan_backtracks_from_next_header() {
        let mut data = b"some stored bytes".to_vec();
        data.extend_from_slice(&[0u8; 12]); // descriptor without signature
        data.extend_from_slice(LocalFileHeader::SIGNATURE.as_bytes());
        assert_eq!(scan_for_data_descriptor(&data, false), Some(17));
    }

    #[test]
    fn descriptor_scan_skips_impossible_matches() {
        // a central directory signature too early to leave room for a
        // descriptor is a false positive
        let mut data = Vec::new();
        data.extend_from_slice(&DirectoryHeader::SIGNATURE.as_bytes()[..4]);
        data.extend_from_slice(&[0u8; 30]);
        assert_eq!(scan_for_data_descriptor(&data, false), None);
    }

    #[test]
    fn scanned_descriptor_probes_size_width() {
        // 4-byte sizes followed by a local header signature
        let mut data = Vec::new();
        data.extend_from_slice(DD_SIGNATURE);
        data.extend_from_slice(&0xAABBCCDDu32.to_le_bytes());
        data.extend_from_slice(&3u32.to_le_bytes());
        data.extend_from_slice(&3u32.to_le_bytes());
        data.extend_from_slice(LocalFileHeader::SIGNATURE.as_bytes());
        match parse_scanned_data_descriptor(&data, false) {
            ScannedDescriptor::Parsed { record, consumed } => {
                assert_eq!(record.crc32, 0xAABBCCDD);
                assert_eq!(record.compressed_size, 3);
                assert_eq!(consumed, 16);
            }
            _ => panic!("should have parsed"),
        }

        // 8-byte sizes: nothing at offset 8 looks like a signature
        let mut data = Vec::new();
        data.extend_from_slice(DD_SIGNATURE);
        data.extend_from_slice(&0xAABBCCDDu32.to_le_bytes());
        data.extend_from_slice(&(5u64).to_le_bytes());
        data.extend_from_slice(&(5u64).to_le_bytes());
        match parse_scanned_data_descriptor(&data, false) {
            ScannedDescriptor::Parsed { record, consumed } => {
                assert_eq!(record.compressed_size, 5);
                assert_eq!(record.uncompressed_size, 5);
                assert_eq!(consumed, 24);
            }
            _ => panic!("should have parsed"),
        }
    }
}
