//! Assembles zip archives entry by entry, to seekable or non-seekable sinks,
//! with zip64 handled transparently.

use std::io::{self, Read, Seek, SeekFrom, Write};

use cfg_if::cfg_if;
use tracing::trace;
use zipweld::{
    encoding::Encoding,
    error::{Error, FormatError, Zip64Error},
    parse::{
        DataDescriptorRecord, DirectoryHeader, EndOfCentralDirectory64Locator,
        EndOfCentralDirectory64Record, EndOfCentralDirectoryRecord, Entry, EntrySpec, ExtraField,
        ExtraResourceAlignmentField, ExtraUnicodeField, ExtraZip64Field, HostSystem,
        LocalFileHeader, Method, MsdosTimestamp, Version, ZipBytes, ZipString,
    },
};

mod split_writer;
pub use split_writer::SplitSink;

const ZIP64_MAGIC: u64 = 0xFFFF_FFFF;
const ZIP64_MAGIC_DISK: u32 = 0xFFFF;

/// When zip64 extensions are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Zip64Mode {
    /// Every entry gets a zip64 extra field, and the zip64 end of central
    /// directory structures are always present.
    Always,

    /// Zip64 structures appear exactly when some counter demands them.
    ///
    /// The local header must budget for a zip64 extra before any data is
    /// written, so entries that may exceed 4 GiB have to declare their size
    /// up front ([EntrySpec::set_size]); an undeclared entry that overflows
    /// 32 bits fails with [Error::Zip64Required] when it closes. Archives
    /// that stay under every limit come out byte-identical to
    /// [Zip64Mode::Never].
    #[default]
    AsNeeded,

    /// No zip64 structures, ever: any counter overflow fails with
    /// [Error::Zip64Required].
    Never,
}

/// When unicode path/comment extra fields are attached to entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnicodeExtraPolicy {
    /// Never write unicode extras.
    #[default]
    Never,

    /// Only when the name or comment cannot be encoded in the configured
    /// charset.
    NotEncodeable,

    /// Always.
    Always,
}

/// Options recognized by the writer.
#[derive(Debug, Clone)]
pub struct WriteOptions {
    /// Charset for names and comments. UTF-8 names set the
    /// language-encoding flag (see [Self::use_utf8_flag]).
    pub encoding: Encoding,

    /// Whether to announce UTF-8 names via general-purpose bit 11.
    pub use_utf8_flag: bool,

    /// When to attach unicode path/comment extra fields.
    pub unicode_extras: UnicodeExtraPolicy,

    /// When a name can't be encoded in the configured charset, fall back to
    /// UTF-8 instead of writing `%UXXXX` escapes.
    pub fallback_to_utf8: bool,

    /// Zip64 policy.
    pub zip64: Zip64Mode,

    /// Deflate compression level, 0 through 9.
    pub compression_level: u32,

    /// Method for entries that don't specify one.
    pub default_method: Method,

    /// Archive-level comment.
    pub comment: Option<String>,
}

impl Default for WriteOptions {
    fn default() -> Self {
        cfg_if! {
            if #[cfg(feature = "deflate")] {
                let default_method = Method::Deflate;
            } else {
                let default_method = Method::Store;
            }
        }
        Self {
            encoding: Encoding::Utf8,
            use_utf8_flag: true,
            unicode_extras: UnicodeExtraPolicy::default(),
            fallback_to_utf8: true,
            zip64: Zip64Mode::default(),
            compression_level: 6,
            default_method,
            comment: None,
        }
    }
}

/// Where archive bytes go.
///
/// `position` is the *logical* archive offset: for split sinks it spans all
/// segments and excludes the 4-byte split marker, so that header offsets
/// written to the central directory stay valid when the segments are
/// concatenated back together.
pub trait Sink: io::Write {
    /// Logical bytes written so far.
    fn position(&self) -> u64;

    /// Current disk number (0 for single-file sinks).
    fn disk(&self) -> u32 {
        0
    }

    /// True when already-written bytes can be rewritten in place.
    fn is_seekable(&self) -> bool {
        false
    }

    /// Rewrite `bytes` at logical `offset`. Only for seekable sinks.
    fn rewrite(&mut self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        let _ = (offset, bytes);
        Err(io::Error::other("sink is not seekable"))
    }

    /// Guarantee the next `len` bytes land on a single disk (split sinks
    /// roll over to a fresh segment if needed).
    fn reserve(&mut self, len: u64) -> io::Result<()> {
        let _ = len;
        Ok(())
    }
}

/// A plain byte-counting sink over any [Write]: entries of unknown size get
/// data descriptors, nothing is ever rewritten.
pub struct StreamSink<W> {
    w: W,
    count: u64,
}

impl<W: Write> StreamSink<W> {
    /// Wrap a writer.
    pub fn new(w: W) -> Self {
        Self { w, count: 0 }
    }

    /// Hand back the inner writer.
    pub fn into_inner(self) -> W {
        self.w
    }
}

impl<W: Write> Write for StreamSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.w.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.w.flush()
    }
}

impl<W: Write> Sink for StreamSink<W> {
    fn position(&self) -> u64 {
        self.count
    }
}

/// A sink over [Write] + [Seek]: local headers are patched in place after
/// each entry, no data descriptors needed.
///
/// The writer must start at offset zero of what will become the archive.
pub struct SeekSink<W> {
    w: W,
    pos: u64,
}

impl<W: Write + Seek> SeekSink<W> {
    /// Wrap a writer positioned at the start of the future archive.
    pub fn new(w: W) -> Self {
        Self { w, pos: 0 }
    }

    /// Hand back the inner writer.
    pub fn into_inner(self) -> W {
        self.w
    }
}

impl<W: Write + Seek> Write for SeekSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.w.write(buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.w.flush()
    }
}

impl<W: Write + Seek> Sink for SeekSink<W> {
    fn position(&self) -> u64 {
        self.pos
    }

    fn is_seekable(&self) -> bool {
        true
    }

    fn rewrite(&mut self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        self.w.seek(SeekFrom::Start(offset))?;
        self.w.write_all(bytes)?;
        self.w.seek(SeekFrom::Start(self.pos))?;
        Ok(())
    }
}

/// An entry to be copied verbatim: its compressed bytes are ingested as-is,
/// bypassing the compressor, with checksum and sizes already known.
#[derive(Debug, Clone)]
pub struct RawEntry {
    /// Name, timestamps, attributes, extra fields.
    pub spec: EntrySpec,

    /// CRC-32 of the (uncompressed) content.
    pub crc32: u32,

    /// Size of the compressed bytes about to be ingested.
    pub compressed_size: u64,

    /// Size of the content once decompressed.
    pub uncompressed_size: u64,

    /// Original general-purpose bits; method-specific bits (implode
    /// dictionary size and tree count, deflate strength) are preserved.
    pub flags: u16,
}

impl From<&Entry> for RawEntry {
    fn from(entry: &Entry) -> Self {
        Self {
            spec: EntrySpec::from(entry),
            crc32: entry.crc32,
            compressed_size: entry.compressed_size,
            uncompressed_size: entry.uncompressed_size,
            flags: entry.flags,
        }
    }
}

enum Compressor {
    Store,
    #[cfg(feature = "deflate")]
    Deflate(Box<flate2::Compress>),
}

struct OpenEntry {
    prepared: PreparedEntry,
    hasher: crc32fast::Hasher,
    uncompressed: u64,
    data_start: u64,
    compressor: Compressor,
    declared: Option<(u32, u64)>, // (crc32, size) promised up front
}

/// Everything decided when the local file header was written.
struct PreparedEntry {
    name: Vec<u8>,
    comment: Vec<u8>,
    method: Method,
    flags: u16,
    modified: MsdosTimestamp,
    internal_attrs: u16,
    external_attrs: u32,
    host_system: HostSystem,
    header_offset: u64,
    disk_nbr_start: u32,
    name_len: usize,
    central_extras: Vec<ExtraField>,
    zip64_local: bool,
    uses_descriptor: bool,
}

/// A closed entry, waiting for the central directory.
struct CentralEntry {
    name: Vec<u8>,
    comment: Vec<u8>,
    method: Method,
    flags: u16,
    modified: MsdosTimestamp,
    internal_attrs: u16,
    external_attrs: u32,
    host_system: HostSystem,
    header_offset: u64,
    disk_nbr_start: u32,
    crc32: u32,
    compressed_size: u64,
    uncompressed_size: u64,
    extras: Vec<ExtraField>,
    uses_descriptor: bool,
}

#[derive(PartialEq, Eq)]
enum WriterState {
    Open,
    Finished,
}

/// Writes a zip archive to a [Sink], one entry at a time:
/// [put_entry](Self::put_entry), [write](Self::write),
/// [close_entry](Self::close_entry), repeated at will, then
/// [finish](Self::finish) (or [close](Self::close), which implies it).
pub struct ArchiveWriter<S: Sink> {
    sink: S,
    options: WriteOptions,
    entries: Vec<CentralEntry>,
    current: Option<OpenEntry>,
    state: WriterState,
}

impl<W: Write> ArchiveWriter<StreamSink<W>> {
    /// Write to a non-seekable byte stream; deflated entries are followed by
    /// data descriptors, stored entries must declare size and crc up front.
    pub fn new_streaming(w: W) -> Self {
        Self::from_sink(StreamSink::new(w), WriteOptions::default())
    }

    /// Like [Self::new_streaming], with explicit options.
    pub fn new_streaming_with_options(w: W, options: WriteOptions) -> Self {
        Self::from_sink(StreamSink::new(w), options)
    }
}

impl<W: Write + Seek> ArchiveWriter<SeekSink<W>> {
    /// Write to a seekable sink; local headers are patched in place when
    /// entries close.
    pub fn new(w: W) -> Self {
        Self::from_sink(SeekSink::new(w), WriteOptions::default())
    }

    /// Like [Self::new], with explicit options.
    pub fn with_options(w: W, options: WriteOptions) -> Self {
        Self::from_sink(SeekSink::new(w), options)
    }
}

impl<S: Sink> ArchiveWriter<S> {
    /// Write to any [Sink] implementation.
    pub fn from_sink(sink: S, options: WriteOptions) -> Self {
        Self {
            sink,
            options,
            entries: Vec::new(),
            current: None,
            state: WriterState::Open,
        }
    }

    /// Begin a new entry. Fails if another entry is still open, or if the
    /// entry can be told to violate the zip64 policy already.
    pub fn put_entry(&mut self, spec: &EntrySpec) -> Result<(), Error> {
        self.check_open()?;
        if self.current.is_some() {
            return Err(Error::BadArgument(
                "close_entry must be called before the next put_entry",
            ));
        }

        let mut method = spec.method().unwrap_or(self.options.default_method);
        if spec.is_directory() && spec.method().is_none() {
            method = Method::Store;
        }
        match method {
            Method::Store => {}
            #[cfg(feature = "deflate")]
            Method::Deflate => {}
            other => return Err(Error::method_not_supported(other)),
        }

        let seekable = self.sink.is_seekable();
        let uses_descriptor = !seekable && method != Method::Store;

        if method == Method::Store && !seekable && !spec.is_directory() {
            // nothing will come back to patch the header, sizes must be
            // known before any data is written
            if spec.size().is_none() || spec.crc32().is_none() {
                return Err(Error::BadArgument(
                    "STORED entries on non-seekable sinks need size and crc32 up front",
                ));
            }
        }

        let declared_size = spec.size();
        let zip64_local = match self.options.zip64 {
            Zip64Mode::Always => true,
            Zip64Mode::Never => {
                if declared_size.unwrap_or(0) >= ZIP64_MAGIC {
                    return Err(Zip64Error::EntryTooBig.into());
                }
                if self.sink.position() >= ZIP64_MAGIC {
                    return Err(Zip64Error::ArchiveTooBig.into());
                }
                false
            }
            // a zip64 extra can't be erased from a header that data already
            // follows, so it is only allocated when the declared size calls
            // for it; undeclared entries that overflow 32 bits fail at close
            Zip64Mode::AsNeeded => declared_size.is_some_and(|size| size >= ZIP64_MAGIC),
        };

        let known = match (method, spec.size(), spec.crc32()) {
            (Method::Store, Some(size), Some(crc)) => Some((crc, size, size)),
            // directories have no body at all
            (Method::Store, None, None) if spec.is_directory() => Some((0, 0, 0)),
            _ => None,
        };

        let prepared = self.write_local_header(
            spec,
            method,
            known,
            zip64_local,
            uses_descriptor,
            0,
        )?;

        let data_start = self.sink.position();
        let compressor = self.make_compressor(method)?;
        self.current = Some(OpenEntry {
            prepared,
            hasher: crc32fast::Hasher::new(),
            uncompressed: 0,
            data_start,
            compressor,
            declared: known.map(|(crc, size, _)| (crc, size)),
        });
        Ok(())
    }

    /// Append content bytes to the currently open entry.
    pub fn write(&mut self, buf: &[u8]) -> Result<(), Error> {
        let entry = self
            .current
            .as_mut()
            .ok_or(Error::BadArgument("no entry is open"))?;
        entry.hasher.update(buf);
        entry.uncompressed += buf.len() as u64;
        match &mut entry.compressor {
            Compressor::Store => {
                self.sink.write_all(buf)?;
            }
            #[cfg(feature = "deflate")]
            Compressor::Deflate(deflate) => {
                let mut input = buf;
                let mut out = [0u8; 32 * 1024];
                while !input.is_empty() {
                    let before_in = deflate.total_in();
                    let before_out = deflate.total_out();
                    deflate
                        .compress(input, &mut out, flate2::FlushCompress::None)
                        .map_err(|e| Error::Decompression {
                            method: Method::Deflate,
                            msg: e.to_string(),
                        })?;
                    let consumed = (deflate.total_in() - before_in) as usize;
                    let produced = (deflate.total_out() - before_out) as usize;
                    self.sink.write_all(&out[..produced])?;
                    input = &input[consumed..];
                }
            }
        }
        Ok(())
    }

    /// Finalize the currently open entry: flush the compressor, settle CRC
    /// and sizes, patch the header or emit a data descriptor.
    pub fn close_entry(&mut self) -> Result<(), Error> {
        let mut entry = self
            .current
            .take()
            .ok_or(Error::BadArgument("no entry is open"))?;

        match &mut entry.compressor {
            Compressor::Store => {}
            #[cfg(feature = "deflate")]
            Compressor::Deflate(deflate) => loop {
                let mut out = [0u8; 32 * 1024];
                let before_out = deflate.total_out();
                let status = deflate
                    .compress(&[], &mut out, flate2::FlushCompress::Finish)
                    .map_err(|e| Error::Decompression {
                        method: Method::Deflate,
                        msg: e.to_string(),
                    })?;
                let produced = (deflate.total_out() - before_out) as usize;
                self.sink.write_all(&out[..produced])?;
                if status == flate2::Status::StreamEnd {
                    break;
                }
            },
        }

        let crc32 = entry.hasher.finalize();
        let uncompressed_size = entry.uncompressed;
        let compressed_size = self.sink.position() - entry.data_start;

        if let Some((declared_crc, declared_size)) = entry.declared {
            if declared_size != uncompressed_size {
                return Err(FormatError::WrongSize {
                    expected: declared_size,
                    actual: uncompressed_size,
                }
                .into());
            }
            if declared_crc != crc32 {
                return Err(FormatError::WrongChecksum {
                    expected: declared_crc,
                    actual: crc32,
                }
                .into());
            }
        }

        self.settle_entry(entry.prepared, crc32, compressed_size, uncompressed_size)
    }

    /// Ingest an entry whose compressed form is already known: `data` must
    /// yield exactly [RawEntry::compressed_size] bytes, which are copied to
    /// the sink untouched.
    pub fn add_raw_entry<R: Read>(&mut self, raw: &RawEntry, mut data: R) -> Result<(), Error> {
        self.check_open()?;
        if self.current.is_some() {
            return Err(Error::BadArgument(
                "close_entry must be called before add_raw_entry",
            ));
        }

        let method = raw.spec.method().unwrap_or(self.options.default_method);
        let needs_zip64 =
            raw.compressed_size >= ZIP64_MAGIC || raw.uncompressed_size >= ZIP64_MAGIC;
        let zip64_local = match self.options.zip64 {
            Zip64Mode::Always => true,
            Zip64Mode::AsNeeded => needs_zip64,
            Zip64Mode::Never => {
                if needs_zip64 {
                    return Err(Zip64Error::EntryTooBig.into());
                }
                if self.sink.position() >= ZIP64_MAGIC {
                    return Err(Zip64Error::ArchiveTooBig.into());
                }
                false
            }
        };

        let prepared = self.write_local_header(
            &raw.spec,
            method,
            Some((raw.crc32, raw.uncompressed_size, raw.compressed_size)),
            zip64_local,
            false,
            raw.flags & 0b110,
        )?;

        let copied = io::copy(&mut data, &mut self.sink)?;
        if copied != raw.compressed_size {
            return Err(FormatError::WrongSize {
                expected: raw.compressed_size,
                actual: copied,
            }
            .into());
        }

        self.settle_entry(prepared, raw.crc32, raw.compressed_size, raw.uncompressed_size)
    }

    /// Write the central directory, the zip64 end-of-central-directory pair
    /// when called for, and the end-of-central-directory record.
    pub fn finish(&mut self) -> Result<(), Error> {
        self.check_open()?;
        if self.current.is_some() {
            return Err(Error::BadArgument(
                "close_entry must be called before finish",
            ));
        }

        let never = self.options.zip64 == Zip64Mode::Never;
        let always = self.options.zip64 == Zip64Mode::Always;

        let cd_offset = self.sink.position();
        let cd_disk = self.sink.disk();

        for entry in &self.entries {
            let size64 = always || entry.uncompressed_size >= ZIP64_MAGIC;
            let csize64 = always || entry.compressed_size >= ZIP64_MAGIC;
            let offset64 = always || entry.header_offset >= ZIP64_MAGIC;
            let disk64 = entry.disk_nbr_start > 0xFFFE;
            if never {
                if size64 || csize64 {
                    return Err(Zip64Error::EntryTooBig.into());
                }
                if offset64 {
                    return Err(Zip64Error::ArchiveTooBig.into());
                }
                if disk64 {
                    return Err(Zip64Error::TooManyDisks.into());
                }
            }

            let mut extras = entry.extras.clone();
            if size64 || csize64 || offset64 || disk64 {
                let zip64 = ExtraZip64Field {
                    uncompressed_size: size64.then_some(entry.uncompressed_size),
                    compressed_size: csize64.then_some(entry.compressed_size),
                    header_offset: offset64.then_some(entry.header_offset),
                    disk_start: disk64.then_some(entry.disk_nbr_start),
                };
                extras.insert(0, ExtraField::Zip64(zip64));
            }
            let is_zip64 = size64 || csize64 || offset64 || disk64;

            let header = DirectoryHeader {
                creator_version: Version {
                    host_system: entry.host_system,
                    version: if is_zip64 {
                        Version::ZIP64
                    } else {
                        Version::DEFLATE
                    },
                },
                reader_version: Version {
                    host_system: HostSystem::MsDos,
                    version: version_needed(is_zip64, entry.uses_descriptor, entry.method),
                },
                flags: entry.flags,
                method: entry.method.into(),
                modified: entry.modified,
                crc32: entry.crc32,
                compressed_size: clamp32(entry.compressed_size, csize64),
                uncompressed_size: clamp32(entry.uncompressed_size, size64),
                disk_nbr_start: if disk64 {
                    ZIP64_MAGIC_DISK as u16
                } else {
                    entry.disk_nbr_start as u16
                },
                internal_attrs: entry.internal_attrs,
                external_attrs: entry.external_attrs,
                header_offset: clamp32(entry.header_offset, offset64),
                name: ZipString(entry.name.clone()),
                extra: ZipBytes(zipweld::parse::serialize_extra_fields(&extras, false)),
                comment: ZipString(entry.comment.clone()),
            };
            self.sink.write_all(&header.to_bytes())?;
        }

        let cd_size = self.sink.position() - cd_offset;
        let records = self.entries.len() as u64;

        let needs_zip64_eocd = always
            || records > 0xFFFF
            || cd_size >= ZIP64_MAGIC
            || cd_offset >= ZIP64_MAGIC
            || cd_disk > 0xFFFE;
        if never {
            if records > 0xFFFF {
                return Err(Zip64Error::TooManyEntries.into());
            }
            if cd_size >= ZIP64_MAGIC {
                return Err(Zip64Error::CentralDirectoryTooBig.into());
            }
            if cd_offset >= ZIP64_MAGIC {
                return Err(Zip64Error::CentralDirectoryOffsetTooBig.into());
            }
            if cd_disk > 0xFFFE {
                return Err(Zip64Error::TooManyDisks.into());
            }
        }

        let comment = match &self.options.comment {
            Some(comment) => encode_text(&self.options, comment).0,
            None => Vec::new(),
        };

        // the end group must not straddle a segment boundary
        let mut group_len = 22 + comment.len() as u64;
        if needs_zip64_eocd {
            group_len += (EndOfCentralDirectory64Record::LENGTH
                + EndOfCentralDirectory64Locator::LENGTH) as u64;
        }
        self.sink.reserve(group_len)?;

        if needs_zip64_eocd {
            let eocd64_offset = self.sink.position();
            let record = EndOfCentralDirectory64Record {
                record_size: 44,
                creator_version: Version::ZIP64 as u16,
                reader_version: Version::ZIP64 as u16,
                disk_nbr: self.sink.disk(),
                dir_disk_nbr: cd_disk,
                dir_records_this_disk: records,
                directory_records: records,
                directory_size: cd_size,
                directory_offset: cd_offset,
            };
            self.sink.write_all(&record.to_bytes())?;

            let locator = EndOfCentralDirectory64Locator {
                dir_disk_number: self.sink.disk(),
                directory_offset: eocd64_offset,
                total_disks: self.sink.disk() + 1,
            };
            self.sink.write_all(&locator.to_bytes())?;
        }

        let eocd = EndOfCentralDirectoryRecord {
            disk_nbr: clamp_disk(self.sink.disk()),
            dir_disk_nbr: clamp_disk(cd_disk),
            dir_records_this_disk: records.min(0xFFFF) as u16,
            directory_records: records.min(0xFFFF) as u16,
            directory_size: clamp32(cd_size, cd_size >= ZIP64_MAGIC),
            directory_offset: clamp32(cd_offset, cd_offset >= ZIP64_MAGIC),
            comment,
        };
        self.sink.write_all(&eocd.to_bytes())?;
        self.sink.flush()?;

        self.state = WriterState::Finished;
        Ok(())
    }

    /// Finish (if not already done) and hand back the sink.
    pub fn close(mut self) -> Result<S, Error> {
        if self.state == WriterState::Open {
            self.finish()?;
        }
        Ok(self.sink)
    }

    /// The options this writer runs with.
    pub fn options(&self) -> &WriteOptions {
        &self.options
    }

    fn check_open(&self) -> Result<(), Error> {
        match self.state {
            WriterState::Open => Ok(()),
            WriterState::Finished => Err(Error::BadArgument("the archive is already finished")),
        }
    }

    fn make_compressor(&self, method: Method) -> Result<Compressor, Error> {
        match method {
            Method::Store => Ok(Compressor::Store),
            #[cfg(feature = "deflate")]
            Method::Deflate => {
                let level = self.options.compression_level;
                if level > 9 {
                    return Err(Error::BadArgument("compression level must be 0 through 9"));
                }
                Ok(Compressor::Deflate(Box::new(flate2::Compress::new(
                    flate2::Compression::new(level),
                    false,
                ))))
            }
            other => Err(Error::method_not_supported(other)),
        }
    }

    /// Encode names and extras, decide the flag bits, write the local file
    /// header (padding for alignment if requested).
    #[allow(clippy::too_many_arguments)]
    fn write_local_header(
        &mut self,
        spec: &EntrySpec,
        method: Method,
        known: Option<(u32, u64, u64)>, // (crc, uncompressed, compressed)
        zip64_local: bool,
        uses_descriptor: bool,
        extra_flags: u16,
    ) -> Result<PreparedEntry, Error> {
        let (name, name_is_utf8) = encode_text(&self.options, spec.name());
        if name.len() > u16::MAX as usize {
            return Err(Error::BadArgument("entry name is longer than 65535 bytes"));
        }
        let (comment, comment_is_utf8) = match spec.comment() {
            Some(comment) => encode_text(&self.options, comment),
            None => (Vec::new(), false),
        };

        let mut flags = extra_flags;
        if self.options.use_utf8_flag && (name_is_utf8 || comment_is_utf8) {
            flags |= 0x800;
        }
        if uses_descriptor {
            flags |= 0b1000;
        }

        // extras other than zip64, which is the writer's own business
        let mut base_extras: Vec<ExtraField> = spec
            .extra_fields()
            .iter()
            .filter(|f| f.tag() != Some(0x0001))
            .cloned()
            .collect();

        let attach_unicode = match self.options.unicode_extras {
            UnicodeExtraPolicy::Never => false,
            UnicodeExtraPolicy::Always => true,
            UnicodeExtraPolicy::NotEncodeable => !self.options.encoding.can_encode(spec.name()),
        };
        if attach_unicode {
            upsert_extra(
                &mut base_extras,
                ExtraField::UnicodePath(ExtraUnicodeField {
                    crc32: crc32fast::hash(&name),
                    utf8: spec.name().as_bytes().to_vec(),
                }),
            );
            if let Some(entry_comment) = spec.comment() {
                upsert_extra(
                    &mut base_extras,
                    ExtraField::UnicodeComment(ExtraUnicodeField {
                        crc32: crc32fast::hash(&comment),
                        utf8: entry_comment.as_bytes().to_vec(),
                    }),
                );
            }
        }

        let alignment = spec.alignment();
        let mut alignment_extra = spec.resource_alignment().copied();
        if alignment > 1 && alignment_extra.is_none() {
            alignment_extra = Some(ExtraResourceAlignmentField {
                alignment,
                allow_method_change: false,
                padding: 0,
            });
        }

        let central_extras: Vec<ExtraField> = base_extras
            .iter()
            .filter(|f| f.tag() != Some(0xA11E))
            .cloned()
            .chain(alignment_extra.map(ExtraField::ResourceAlignment))
            .collect();

        // local layout: [zip64?][other extras][alignment extra with padding]
        let mut local_extras: Vec<ExtraField> = Vec::with_capacity(base_extras.len() + 2);
        if zip64_local {
            local_extras.push(ExtraField::Zip64(ExtraZip64Field {
                uncompressed_size: Some(known.map(|(_, size, _)| size).unwrap_or(0)),
                compressed_size: Some(known.map(|(_, _, csize)| csize).unwrap_or(0)),
                header_offset: None,
                disk_start: None,
            }));
        }
        local_extras.extend(
            base_extras
                .into_iter()
                .filter(|f| f.tag() != Some(0xA11E)),
        );

        let header_offset = self.sink.position();
        let disk_nbr_start = self.sink.disk();

        if let Some(mut extra) = alignment_extra {
            extra.padding = 0;
            local_extras.push(ExtraField::ResourceAlignment(extra));
            if alignment > 1 {
                let base_len =
                    zipweld::parse::serialize_extra_fields(&local_extras, true).len() as u64;
                let base_data_offset =
                    header_offset + LocalFileHeader::LENGTH as u64 + name.len() as u64 + base_len;
                let padding =
                    ((alignment as u64 - base_data_offset % alignment as u64) % alignment as u64)
                        as usize;
                if let Some(ExtraField::ResourceAlignment(a)) = local_extras.last_mut() {
                    a.padding = padding;
                }
            }
        }

        let extra_bytes = zipweld::parse::serialize_extra_fields(&local_extras, true);
        if extra_bytes.len() > u16::MAX as usize {
            return Err(Error::BadArgument("extra fields are longer than 65535 bytes"));
        }

        let (crc32, compressed_size, uncompressed_size) = match (zip64_local, known) {
            (true, known) => (
                known.map(|(crc, _, _)| crc).unwrap_or(0),
                ZIP64_MAGIC as u32,
                ZIP64_MAGIC as u32,
            ),
            (false, Some((crc, size, csize))) => (crc, csize as u32, size as u32),
            // either a descriptor will carry them, or the header gets
            // patched once they're known
            (false, None) => (0, 0, 0),
        };

        let header = LocalFileHeader {
            reader_version: Version {
                host_system: HostSystem::MsDos,
                version: version_needed(zip64_local, uses_descriptor, method),
            },
            flags,
            method,
            modified: MsdosTimestamp::from_datetime(spec.modified()),
            crc32,
            compressed_size,
            uncompressed_size,
            name: ZipString(name.clone()),
            extra: ZipBytes(extra_bytes),
        };
        trace!(name = spec.name(), offset = header_offset, "writing local file header");
        self.sink.write_all(&header.to_bytes())?;

        Ok(PreparedEntry {
            name_len: name.len(),
            name,
            comment,
            method,
            flags,
            modified: header.modified,
            internal_attrs: spec.internal_attrs(),
            external_attrs: spec.external_attrs(),
            host_system: spec.host_system(),
            header_offset,
            disk_nbr_start,
            central_extras,
            zip64_local,
            uses_descriptor,
        })
    }

    /// With the body written and CRC/sizes final: patch the header (or its
    /// zip64 extra), or emit a data descriptor, then record the entry for
    /// the central directory.
    fn settle_entry(
        &mut self,
        prepared: PreparedEntry,
        crc32: u32,
        compressed_size: u64,
        uncompressed_size: u64,
    ) -> Result<(), Error> {
        let fits = compressed_size < ZIP64_MAGIC && uncompressed_size < ZIP64_MAGIC;
        if !fits && !prepared.zip64_local {
            // the header has 32-bit slots and nothing to spill into
            return Err(Zip64Error::EntryTooBig.into());
        }

        let seekable = self.sink.is_seekable();
        if prepared.uses_descriptor {
            let descriptor = DataDescriptorRecord {
                crc32,
                compressed_size,
                uncompressed_size,
            };
            self.sink
                .write_all(&descriptor.to_bytes(prepared.zip64_local))?;
        } else if seekable {
            if prepared.zip64_local {
                // real sizes go into the zip64 extra payload, which sits
                // first in the extra region; the fixed fields keep their
                // sentinels
                let mut payload = Vec::with_capacity(16);
                payload.extend_from_slice(&uncompressed_size.to_le_bytes());
                payload.extend_from_slice(&compressed_size.to_le_bytes());
                let extra_offset = prepared.header_offset
                    + LocalFileHeader::LENGTH as u64
                    + prepared.name_len as u64
                    + 4;
                self.sink.rewrite(extra_offset, &payload)?;
            }

            let mut fixed = Vec::with_capacity(12);
            fixed.extend_from_slice(&crc32.to_le_bytes());
            if prepared.zip64_local {
                fixed.extend_from_slice(&(ZIP64_MAGIC as u32).to_le_bytes());
                fixed.extend_from_slice(&(ZIP64_MAGIC as u32).to_le_bytes());
            } else {
                fixed.extend_from_slice(&(compressed_size as u32).to_le_bytes());
                fixed.extend_from_slice(&(uncompressed_size as u32).to_le_bytes());
            }
            self.sink.rewrite(prepared.header_offset + 14, &fixed)?;
        }
        // phased entries (raw copies, stored-with-known-sizes on streams)
        // wrote their final values in the header already

        self.entries.push(CentralEntry {
            name: prepared.name,
            comment: prepared.comment,
            method: prepared.method,
            flags: prepared.flags,
            modified: prepared.modified,
            internal_attrs: prepared.internal_attrs,
            external_attrs: prepared.external_attrs,
            host_system: prepared.host_system,
            header_offset: prepared.header_offset,
            disk_nbr_start: prepared.disk_nbr_start,
            crc32,
            compressed_size,
            uncompressed_size,
            extras: prepared.central_extras,
            uses_descriptor: prepared.uses_descriptor,
        });
        Ok(())
    }
}

fn version_needed(zip64: bool, uses_descriptor: bool, method: Method) -> u8 {
    if zip64 {
        Version::ZIP64
    } else if uses_descriptor || method == Method::Deflate {
        Version::DEFLATE
    } else {
        Version::STORE_ONLY
    }
}

fn clamp32(value: u64, sentinel: bool) -> u32 {
    if sentinel {
        ZIP64_MAGIC as u32
    } else {
        value as u32
    }
}

fn clamp_disk(disk: u32) -> u16 {
    disk.min(0xFFFF) as u16
}

fn upsert_extra(extras: &mut Vec<ExtraField>, field: ExtraField) {
    let tag = field.tag();
    match extras.iter_mut().find(|f| f.tag() == tag) {
        Some(existing) => *existing = field,
        None => extras.push(field),
    }
}

fn encode_text(options: &WriteOptions, text: &str) -> (Vec<u8>, bool) {
    let encoding = options.encoding;
    if encoding.is_utf8() {
        return (text.as_bytes().to_vec(), true);
    }
    match encoding.encode(text) {
        Ok(bytes) => (bytes, false),
        Err(_) if options.fallback_to_utf8 => (text.as_bytes().to_vec(), true),
        Err(_) => (encoding.encode_with_fallback(text), false),
    }
}
