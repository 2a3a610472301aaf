use std::collections::HashMap;

use chrono::{offset::Utc, DateTime, TimeZone};
use winnow::{binary::le_u16, PResult, Partial};

use crate::encoding::Encoding;
use crate::parse::{Mode, Version};

use super::{zero_datetime, ExtraField, NtfsAttr};

/// An Archive contains general information about a zip file, along with a list
/// of [entries][Entry].
///
/// It is obtained through a state machine like
/// [ArchiveFsm](crate::fsm::ArchiveFsm), although end-users tend to use
/// higher-level interfaces like
/// [zipweld-sync](https://crates.io/crates/zipweld-sync).
pub struct Archive {
    pub(crate) size: u64,
    pub(crate) encoding: Encoding,
    pub(crate) entries: Vec<Entry>,
    pub(crate) comment: Option<String>,
    // name -> indices into entries, preserving central directory order;
    // duplicates are legal in zip archives
    pub(crate) by_name: HashMap<String, Vec<usize>>,
}

impl Archive {
    pub(crate) fn new(
        size: u64,
        encoding: Encoding,
        entries: Vec<Entry>,
        comment: Option<String>,
    ) -> Self {
        let mut by_name: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, entry) in entries.iter().enumerate() {
            by_name.entry(entry.name.clone()).or_default().push(idx);
        }
        Self {
            size,
            encoding,
            entries,
            comment,
            by_name,
        }
    }

    /// The size of .zip file that was read, in bytes.
    #[inline(always)]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Iterate over all files in this zip, in central directory order.
    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    /// Iterate over all files sorted by the physical location of their data:
    /// by starting disk, then by local header offset.
    pub fn entries_in_physical_order(&self) -> Vec<&Entry> {
        let mut sorted: Vec<&Entry> = self.entries.iter().collect();
        sorted.sort_by_key(|e| (e.disk_nbr_start, e.header_offset));
        sorted
    }

    /// Attempts to look up an entry by name. This is usually a bad idea,
    /// as names aren't necessarily normalized in zip archives.
    ///
    /// If several entries share the name, the first one in central directory
    /// order is returned.
    pub fn by_name<N: AsRef<str>>(&self, name: N) -> Option<&Entry> {
        let indices = self.by_name.get(name.as_ref())?;
        indices.first().map(|&idx| &self.entries[idx])
    }

    /// All entries carrying the given name, in central directory order.
    pub fn entries_by_name<N: AsRef<str>>(&self, name: N) -> impl Iterator<Item = &Entry> {
        self.by_name
            .get(name.as_ref())
            .map(|v| &v[..])
            .unwrap_or_default()
            .iter()
            .map(move |&idx| &self.entries[idx])
    }

    /// Returns the detected character encoding for text fields
    /// (names, comments) inside this zip archive.
    #[inline(always)]
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Returns the comment for this archive, if any. When reading
    /// a zip file with an empty comment field, this will return None.
    #[inline(always)]
    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }
}

/// Where an entry's name was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NameSource {
    /// The raw name bytes, decoded with the archive's encoding.
    #[default]
    Name,

    /// The raw name bytes, decoded as UTF-8 because the entry sets the
    /// language-encoding general-purpose bit.
    NameWithEfsFlag,

    /// A [unicode path extra field](super::ExtraUnicodeField) whose CRC-32
    /// matched the raw name bytes.
    UnicodeExtraField,
}

/// Where an entry's comment was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommentSource {
    /// The raw comment bytes, decoded with the archive's encoding.
    #[default]
    Comment,

    /// A unicode comment extra field whose CRC-32 matched the raw bytes.
    UnicodeExtraField,
}

/// Describes a zip archive entry (a file, a directory, a symlink)
#[derive(Debug, Clone)]
pub struct Entry {
    /// Name of the file
    ///
    /// This should be a relative path, separated by `/`. However, there are zip
    /// files in the wild with all sorts of evil variants, so, be conservative
    /// in what you accept.
    ///
    /// See also [Self::sanitized_name], which returns a sanitized version of
    /// the name, working around zip slip vulnerabilities.
    pub name: String,

    /// The undecoded bytes the name came from.
    pub raw_name: Vec<u8>,

    /// Where [Self::name] came from.
    pub name_source: NameSource,

    /// Compression method: Store, Deflate, Shrink, Implode, etc.
    pub method: Method,

    /// Comment is any arbitrary user-defined string shorter than 64KiB
    pub comment: Option<String>,

    /// The undecoded bytes the comment came from.
    pub raw_comment: Vec<u8>,

    /// Where [Self::comment] came from.
    pub comment_source: CommentSource,

    /// This entry's "last modified" timestamp - with caveats
    ///
    /// Due to the history of the ZIP file format, this may be inaccurate. It may be offset
    /// by a few hours, if there is no extended timestamp information. It may have a resolution
    /// as low as two seconds, if only MSDOS timestamps are present. It may default to the Unix
    /// epoch, if something went really wrong.
    ///
    /// If you're reading this after the year 2038, or after the year 2108, godspeed.
    pub modified: DateTime<Utc>,

    /// This entry's "created" timestamp, if available.
    ///
    /// See [Self::modified] for caveats.
    pub created: Option<DateTime<Utc>>,

    /// This entry's "last accessed" timestamp, if available.
    ///
    /// See [Self::modified] for caveats.
    pub accessed: Option<DateTime<Utc>>,

    /// Offset of the local file header in the zip file
    ///
    /// ```text
    /// [optional non-zip data]
    /// [local file header 1] <------ header_offset points here
    /// [encryption header 1]
    /// [file data 1]
    /// [data descriptor 1]
    /// ...
    /// [central directory]
    /// [optional zip64 end of central directory info]
    /// [end of central directory record]
    /// ```
    pub header_offset: u64,

    /// Offset of the entry's data, resolved lazily from the local file
    /// header on first open. `None` until then.
    pub data_offset: Option<u64>,

    /// Version of the software that created this archive, and the host
    /// system it ran on.
    pub creator_version: Version,

    /// Version of zip needed to extract this archive.
    pub reader_version: Version,

    /// General purpose bit flag
    ///
    /// In the zip format, the most noteworthy flag (bit 11) is for UTF-8 names.
    /// Other flags can indicate: encryption (unsupported), various compression
    /// settings (depending on the [Method] used). For imploded entries, bits
    /// 1 and 2 select the sliding dictionary size and the number of
    /// Shannon-Fano trees.
    pub flags: u16,

    /// Unix user ID
    ///
    /// Only present if a Unix extra field or New Unix extra field was found.
    pub uid: Option<u32>,

    /// Unix group ID
    ///
    /// Only present if a Unix extra field or New Unix extra field was found.
    pub gid: Option<u32>,

    /// CRC-32 hash as found in the central directory.
    ///
    /// Note that this may be zero, and the actual CRC32 might be in the local header, or (more
    /// commonly) in the data descriptor instead.
    pub crc32: u32,

    /// Size in bytes, after compression
    pub compressed_size: u64,

    /// Size in bytes, before compression
    ///
    /// This will be zero for directories.
    pub uncompressed_size: u64,

    /// File mode.
    pub mode: Mode,

    /// Internal attributes (bit 0: the entry is apparently an ASCII/text file)
    pub internal_attrs: u16,

    /// External attributes (host-system dependent)
    pub external_attrs: u32,

    /// Number of the disk this entry's data starts on.
    pub disk_nbr_start: u32,

    /// Whether this entry carries zip64 extended information.
    pub is_zip64: bool,

    /// Typed extra fields, in the order they appeared, with at most one
    /// trailing [ExtraField::Unparseable] block.
    pub extra_fields: Vec<ExtraField>,
}

impl Entry {
    /// Returns a sanitized version of the entry's name, if it
    /// seems safe. In particular, if this method feels like the
    /// entry name is trying to do a zip slip (cf.
    /// <https://snyk.io/research/zip-slip-vulnerability>), it'll return
    /// None.
    ///
    /// Other than that, it will strip any leading slashes on non-Windows OSes.
    pub fn sanitized_name(&self) -> Option<&str> {
        let name = self.name.as_str();

        // refuse entries with traversed/absolute path to mitigate zip slip
        if name.contains("..") {
            return None;
        }

        #[cfg(windows)]
        {
            if name.contains(":\\") || name.starts_with("\\") {
                return None;
            }
            Some(name)
        }

        #[cfg(not(windows))]
        {
            // strip absolute prefix on entries pointing to root path
            let mut entry_chars = name.chars();
            let mut name = name;
            while name.starts_with('/') {
                entry_chars.next();
                name = entry_chars.as_str()
            }
            Some(name)
        }
    }

    /// True if the entry's name ends with `/`, which marks directories.
    pub fn is_directory(&self) -> bool {
        self.name.ends_with('/')
    }

    /// Check for the presence of the bit flag that indicates a data
    /// descriptor follows the file data.
    pub fn has_data_descriptor(&self) -> bool {
        flag_data_descriptor(self.flags)
    }

    /// True if the entry is encrypted (classic or strong encryption).
    /// Encryption is detected but never decrypted by this crate.
    pub fn is_encrypted(&self) -> bool {
        flag_encrypted(self.flags)
    }

    /// Sliding dictionary size for imploded entries, from general-purpose
    /// bit 1: 8 KiB when set, 4 KiB otherwise.
    pub fn implode_dictionary_size(&self) -> usize {
        implode_dictionary_size(self.flags)
    }

    /// Number of Shannon-Fano trees for imploded entries, from
    /// general-purpose bit 2: 3 when set, 2 otherwise.
    pub fn implode_tree_count(&self) -> usize {
        implode_tree_count(self.flags)
    }

    /// Apply the extra field to the entry, updating its metadata.
    pub(crate) fn set_extra_field(&mut self, ef: &ExtraField) {
        match &ef {
            ExtraField::Zip64(z64) => {
                if let Some(n) = z64.uncompressed_size {
                    self.uncompressed_size = n;
                }
                if let Some(n) = z64.compressed_size {
                    self.compressed_size = n;
                }
                if let Some(n) = z64.header_offset {
                    self.header_offset = n;
                }
                if let Some(n) = z64.disk_start {
                    self.disk_nbr_start = n;
                }
                self.is_zip64 = true;
            }
            ExtraField::Timestamp(ts) => {
                if let Some(mtime) = ts.mtime {
                    self.modified = Utc
                        .timestamp_opt(mtime as i64, 0)
                        .single()
                        .unwrap_or_else(zero_datetime);
                }
                if let Some(atime) = ts.atime {
                    self.accessed = Utc.timestamp_opt(atime as i64, 0).single();
                }
                if let Some(ctime) = ts.ctime {
                    self.created = Utc.timestamp_opt(ctime as i64, 0).single();
                }
            }
            ExtraField::Ntfs(nf) => {
                for attr in &nf.attrs {
                    // note: other attributes are unsupported
                    if let NtfsAttr::Attr1(attr) = attr {
                        self.modified = attr.mtime.to_datetime().unwrap_or_else(zero_datetime);
                        self.created = attr.ctime.to_datetime();
                        self.accessed = attr.atime.to_datetime();
                    }
                }
            }
            ExtraField::UnixAsi(uf) => {
                self.mode = crate::parse::UnixMode(uf.mode as u32).into();
                if self.uid.is_none() {
                    self.uid = Some(uf.uid as u32);
                }
                if self.gid.is_none() {
                    self.gid = Some(uf.gid as u32);
                }
            }
            ExtraField::InfoZipUnix(uf) => {
                self.modified = Utc
                    .timestamp_opt(uf.mtime as i64, 0)
                    .single()
                    .unwrap_or_else(zero_datetime);
                if self.uid.is_none() {
                    self.uid = uf.uid.map(u32::from);
                }
                if self.gid.is_none() {
                    self.gid = uf.gid.map(u32::from);
                }
            }
            ExtraField::NewUnix(uf) => {
                self.uid = Some(uf.uid as u32);
                self.gid = Some(uf.gid as u32);
            }
            _ => {}
        };
    }

    /// Replace name/comment with unicode extra-field overrides, when the
    /// extra's CRC-32 matches the raw bytes it overrides.
    pub(crate) fn apply_unicode_overrides(&mut self) {
        let mut new_name = None;
        let mut new_comment = None;
        for field in &self.extra_fields {
            match field {
                ExtraField::UnicodePath(u) => {
                    if crc32fast::hash(&self.raw_name) == u.crc32 {
                        if let Ok(s) = std::str::from_utf8(&u.utf8) {
                            new_name = Some(s.to_string());
                        }
                    }
                }
                ExtraField::UnicodeComment(u) => {
                    if crc32fast::hash(&self.raw_comment) == u.crc32 {
                        if let Ok(s) = std::str::from_utf8(&u.utf8) {
                            new_comment = Some(s.to_string());
                        }
                    }
                }
                _ => {}
            }
        }
        if let Some(name) = new_name {
            self.name = name;
            self.name_source = NameSource::UnicodeExtraField;
        }
        if let Some(comment) = new_comment {
            self.comment = Some(comment);
            self.comment_source = CommentSource::UnicodeExtraField;
        }
    }

}

/// The entry's file type: a directory, a file, or a symbolic link.
#[derive(Debug, Eq, PartialEq)]
pub enum EntryKind {
    /// The entry is a directory
    Directory,

    /// The entry is a file
    File,

    /// The entry is a symbolic link
    Symlink,
}

impl Entry {
    /// Determine the kind of this entry based on its mode.
    pub fn kind(&self) -> EntryKind {
        if self.mode.has(Mode::SYMLINK) {
            EntryKind::Symlink
        } else if self.mode.has(Mode::DIR) {
            EntryKind::Directory
        } else {
            EntryKind::File
        }
    }
}

// General-purpose bit helpers, shared between entries and raw header records.

pub(crate) fn flag_data_descriptor(flags: u16) -> bool {
    // 4.3.9.1 This descriptor MUST exist if bit 3 of the general
    // purpose bit flag is set
    flags & 0b1000 != 0
}

pub(crate) fn flag_encrypted(flags: u16) -> bool {
    // bit 0: classic encryption, bit 6: strong encryption
    flags & 0x0041 != 0
}

pub(crate) fn flag_utf8(flags: u16) -> bool {
    flags & 0x800 != 0
}

pub(crate) fn implode_dictionary_size(flags: u16) -> usize {
    if flags & 0b010 != 0 {
        8192
    } else {
        4096
    }
}

pub(crate) fn implode_tree_count(flags: u16) -> usize {
    if flags & 0b100 != 0 {
        3
    } else {
        2
    }
}

/// Compression method used for a file entry.
///
/// In archives that follow [ISO/IEC 21320-1:2015](https://www.iso.org/standard/60101.html), only
/// [Store][Method::Store] and [Deflate][Method::Deflate] should be used.
///
/// However, in the wild, it is not too uncommon to encounter legacy methods
/// like [Shrink][Method::Shrink] and [Implode][Method::Implode], or newer
/// ones like [Bzip2][Method::Bzip2] or [Lzma][Method::Lzma].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// No compression is applied
    Store,

    /// Dynamic LZW with partial table clearing, from PKZIP 1.0
    Shrink,

    /// Shannon-Fano coding over a sliding dictionary, from PKZIP 1.01
    Implode,

    /// [DEFLATE (RFC 1951)](https://www.ietf.org/rfc/rfc1951.txt)
    Deflate,

    /// [DEFLATE64](https://deflate64.com/), aka enhanced deflate
    Deflate64,

    /// [BZIP-2](https://github.com/dsnet/compress/blob/master/doc/bzip2-format.pdf)
    Bzip2,

    /// [LZMA](https://github.com/jljusten/LZMA-SDK/blob/master/DOC/lzma-specification.txt)
    Lzma,

    /// [zstd](https://datatracker.ietf.org/doc/html/rfc8878)
    Zstd,

    /// [MP3](https://www.iso.org/obp/ui/#iso:std:iso-iec:11172:-3:ed-1:v1:en)
    Mp3,

    /// [XZ](https://tukaani.org/xz/xz-file-format.txt)
    Xz,

    /// [JPEG](https://jpeg.org/jpeg/)
    Jpeg,

    /// [WavPack](https://www.wavpack.com/)
    WavPack,

    /// [PPMd](https://en.wikipedia.org/wiki/Prediction_by_partial_matching)
    Ppmd,

    /// AE-x encryption marker (see Appendix E of appnote)
    Aex,

    /// A compression method that isn't recognized by this crate.
    Unrecognized(u16),
}

impl Method {
    const STORE: u16 = 0;
    const SHRINK: u16 = 1;
    const IMPLODE: u16 = 6;
    const DEFLATE: u16 = 8;
    const DEFLATE64: u16 = 9;
    const BZIP2: u16 = 12;
    const LZMA: u16 = 14;
    const ZSTD: u16 = 93;
    const MP3: u16 = 94;
    const XZ: u16 = 95;
    const JPEG: u16 = 96;
    const WAV_PACK: u16 = 97;
    const PPMD: u16 = 98;
    const AEX: u16 = 99;

    /// Parse a method from a byte slice
    pub fn parser(i: &mut Partial<&[u8]>) -> PResult<Self> {
        le_u16(i).map(From::from)
    }
}

impl From<u16> for Method {
    fn from(u: u16) -> Self {
        match u {
            Self::STORE => Self::Store,
            Self::SHRINK => Self::Shrink,
            Self::IMPLODE => Self::Implode,
            Self::DEFLATE => Self::Deflate,
            Self::DEFLATE64 => Self::Deflate64,
            Self::BZIP2 => Self::Bzip2,
            Self::LZMA => Self::Lzma,
            Self::ZSTD => Self::Zstd,
            Self::MP3 => Self::Mp3,
            Self::XZ => Self::Xz,
            Self::JPEG => Self::Jpeg,
            Self::WAV_PACK => Self::WavPack,
            Self::PPMD => Self::Ppmd,
            Self::AEX => Self::Aex,
            u => Self::Unrecognized(u),
        }
    }
}

impl From<Method> for u16 {
    fn from(method: Method) -> Self {
        match method {
            Method::Store => Method::STORE,
            Method::Shrink => Method::SHRINK,
            Method::Implode => Method::IMPLODE,
            Method::Deflate => Method::DEFLATE,
            Method::Deflate64 => Method::DEFLATE64,
            Method::Bzip2 => Method::BZIP2,
            Method::Lzma => Method::LZMA,
            Method::Zstd => Method::ZSTD,
            Method::Mp3 => Method::MP3,
            Method::Xz => Method::XZ,
            Method::Jpeg => Method::JPEG,
            Method::WavPack => Method::WAV_PACK,
            Method::Ppmd => Method::PPMD,
            Method::Aex => Method::AEX,
            Method::Unrecognized(u) => u,
        }
    }
}
