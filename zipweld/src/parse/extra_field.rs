use winnow::{
    binary::{le_u16, le_u32, le_u64, le_u8, length_take},
    error::{ErrMode, ErrorKind, ParserError},
    seq,
    token::{literal, take},
    PResult, Parser, Partial,
};

use crate::error::{Error, FormatError};
use crate::parse::NtfsTimestamp;

use super::raw::PutLe;

/// Context needed to parse an extra-field region.
///
/// Useful because the zip64 extended information extra field has fixed order
/// *but* optional fields. From the appnote:
///
/// If one of the size or offset fields in the Local or Central directory record
/// is too small to hold the required data, a Zip64 extended information record
/// is created. The order of the fields in the zip64 extended information record
/// is fixed, but the fields MUST only appear if the corresponding Local or
/// Central directory record field is set to 0xFFFF or 0xFFFFFFFF.
#[derive(Debug, Clone, Copy)]
pub struct ExtraFieldSettings {
    /// True when parsing a local file header's extra region, false for a
    /// central directory header's. Some fields serialize differently in the
    /// two locations.
    pub local: bool,

    /// The uncompressed size field read from a local or central directory record.
    /// If this is 0xFFFF_FFFF, then the zip64 extra field uncompressed size
    /// field will be present.
    pub uncompressed_size_u32: u32,

    /// The compressed size field read from a local or central directory record.
    /// If this is 0xFFFF_FFFF, then the zip64 extra field compressed size
    /// field will be present.
    pub compressed_size_u32: u32,

    /// The header offset field read from a central directory record (or zero
    /// for local file headers). If this is 0xFFFF_FFFF, then the zip64
    /// extra field header offset field will be present.
    pub header_offset_u32: u32,

    /// The disk number start read from a central directory record (or zero
    /// for local file headers). If this is 0xFFFF, then the zip64 extra
    /// field disk start field will be present.
    pub disk_start_u16: u16,
}

impl ExtraFieldSettings {
    /// Settings for a local file header's extra region.
    pub fn local(uncompressed_size_u32: u32, compressed_size_u32: u32) -> Self {
        Self {
            local: true,
            uncompressed_size_u32,
            compressed_size_u32,
            header_offset_u32: 0,
            disk_start_u16: 0,
        }
    }

    /// Settings for a central directory header's extra region.
    pub fn central(
        uncompressed_size_u32: u32,
        compressed_size_u32: u32,
        header_offset_u32: u32,
        disk_start_u16: u16,
    ) -> Self {
        Self {
            local: false,
            uncompressed_size_u32,
            compressed_size_u32,
            header_offset_u32,
            disk_start_u16,
        }
    }
}

/// How forgiving the extra-field walk is about data that does not parse.
///
/// Two kinds of trouble exist: a region that stops following the
/// `(id, length, payload)` pattern (a malformed trailer), and a field whose
/// id we recognize but whose payload we cannot decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtraFieldParseMode {
    /// Keep the malformed trailer as an [ExtraField::Unparseable] block,
    /// downgrade undecodable known fields to [ExtraField::Unrecognized].
    #[default]
    BestEffort,

    /// Silently drop the malformed trailer, downgrade undecodable known
    /// fields to [ExtraField::Unrecognized].
    OnlyParseableLenient,

    /// Keep the malformed trailer as an [ExtraField::Unparseable] block,
    /// fail on undecodable known fields.
    StrictForKnown,

    /// Silently drop the malformed trailer, fail on undecodable known fields.
    OnlyParseableStrict,

    /// Fail on anything that does not parse.
    Draconic,
}

impl ExtraFieldParseMode {
    fn keeps_trailer(self) -> bool {
        matches!(self, Self::BestEffort | Self::StrictForKnown)
    }

    fn fails_on_trailer(self) -> bool {
        matches!(self, Self::Draconic)
    }

    fn fails_on_bad_known(self) -> bool {
        matches!(
            self,
            Self::StrictForKnown | Self::OnlyParseableStrict | Self::Draconic
        )
    }
}

/// Information stored in the local file header or central directory header
/// `extra` field.
///
/// This typically contains timestamps, file sizes and offsets, file mode,
/// uid/gid, unicode overrides for name and comment, etc.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtraField {
    /// Zip64 extended information extra field (0x0001)
    Zip64(ExtraZip64Field),
    /// Extended timestamp (0x5455)
    Timestamp(ExtraTimestampField),
    /// NTFS (Win9x/WinNT FileTimes) (0x000A)
    Ntfs(ExtraNtfsField),
    /// ASi UNIX (0x756E): mode, uid/gid, symlink target, CRC-protected
    UnixAsi(ExtraUnixAsiField),
    /// Info-Zip UNIX, first version (0x5855)
    InfoZipUnix(ExtraInfoZipUnixField),
    /// Info-Zip New Unix (0x7875): variable-width uid/gid
    NewUnix(ExtraNewUnixField),
    /// Info-Zip Unicode Path (0x7075): CRC-tagged UTF-8 override of the name
    UnicodePath(ExtraUnicodeField),
    /// Info-Zip Unicode Comment (0x6375): CRC-tagged UTF-8 override of the comment
    UnicodeComment(ExtraUnicodeField),
    /// Android resource alignment (0xA11E)
    ResourceAlignment(ExtraResourceAlignmentField),
    /// Jar marker (0xCAFE), an empty field identifying jar files
    JarMarker,
    /// PKWare strong-encryption related fields
    /// (0x0014/0x0015/0x0016/0x0017/0x0019), carried raw
    StrongEncryption(ExtraStrongEncryptionField),
    /// Unknown extra field: tag and raw payload preserved for round-trips
    Unrecognized {
        /// tag of the extra field
        tag: u16,
        /// raw payload bytes
        payload: Vec<u8>,
    },
    /// Data that did not follow the (id, length, payload) pattern. At most
    /// one of these exists per entry and it is always last.
    Unparseable {
        /// everything from where the region stopped making sense to its end
        payload: Vec<u8>,
    },
}

impl ExtraField {
    /// The field's 16-bit header id, if it has one ([ExtraField::Unparseable]
    /// does not).
    pub fn tag(&self) -> Option<u16> {
        Some(match self {
            ExtraField::Zip64(_) => ExtraZip64Field::TAG,
            ExtraField::Timestamp(_) => ExtraTimestampField::TAG,
            ExtraField::Ntfs(_) => ExtraNtfsField::TAG,
            ExtraField::UnixAsi(_) => ExtraUnixAsiField::TAG,
            ExtraField::InfoZipUnix(_) => ExtraInfoZipUnixField::TAG,
            ExtraField::NewUnix(_) => ExtraNewUnixField::TAG,
            ExtraField::UnicodePath(_) => ExtraUnicodeField::TAG_PATH,
            ExtraField::UnicodeComment(_) => ExtraUnicodeField::TAG_COMMENT,
            ExtraField::ResourceAlignment(_) => ExtraResourceAlignmentField::TAG,
            ExtraField::JarMarker => 0xCAFE,
            ExtraField::StrongEncryption(f) => f.tag,
            ExtraField::Unrecognized { tag, .. } => *tag,
            ExtraField::Unparseable { .. } => return None,
        })
    }

    /// Serialize this field's payload (without the id/length header) for a
    /// local file header (`local == true`) or a central directory header.
    pub fn data(&self, local: bool) -> Vec<u8> {
        match self {
            ExtraField::Zip64(f) => f.data(local),
            ExtraField::Timestamp(f) => f.data(local),
            ExtraField::Ntfs(f) => f.data(),
            ExtraField::UnixAsi(f) => f.data(),
            ExtraField::InfoZipUnix(f) => f.data(local),
            ExtraField::NewUnix(f) => f.data(),
            ExtraField::UnicodePath(f) | ExtraField::UnicodeComment(f) => f.data(),
            ExtraField::ResourceAlignment(f) => f.data(local),
            ExtraField::JarMarker => Vec::new(),
            ExtraField::StrongEncryption(f) => f.payload.clone(),
            ExtraField::Unrecognized { payload, .. } => payload.clone(),
            ExtraField::Unparseable { payload } => payload.clone(),
        }
    }
}

/// Walk an extra-field region, producing typed fields.
///
/// `settings` carries the zip64 sentinels of the surrounding record and
/// whether the region comes from a local file header; `mode` decides what
/// happens to data that does not parse.
pub fn parse_extra_fields(
    data: &[u8],
    settings: ExtraFieldSettings,
    mode: ExtraFieldParseMode,
) -> Result<Vec<ExtraField>, Error> {
    let mut fields = Vec::new();
    let mut pos = 0usize;

    while data.len() - pos >= 4 {
        let tag = u16::from_le_bytes([data[pos], data[pos + 1]]);
        let claimed = u16::from_le_bytes([data[pos + 2], data[pos + 3]]) as usize;
        if pos + 4 + claimed > data.len() {
            // region stops following the (id, length, payload) pattern
            return finish_with_trailer(fields, &data[pos..], mode);
        }
        let payload = &data[pos + 4..pos + 4 + claimed];
        match parse_one(tag, payload, settings) {
            Ok(field) => fields.push(field),
            Err(()) if mode.fails_on_bad_known() => {
                return Err(FormatError::InvalidExtraField { tag }.into());
            }
            Err(()) => {
                tracing::trace!(tag, "downgrading undecodable extra field");
                fields.push(ExtraField::Unrecognized {
                    tag,
                    payload: payload.to_vec(),
                });
            }
        }
        pos += 4 + claimed;
    }

    if pos < data.len() {
        // 1 to 3 stray bytes at the end of the region
        return finish_with_trailer(fields, &data[pos..], mode);
    }
    Ok(fields)
}

fn finish_with_trailer(
    mut fields: Vec<ExtraField>,
    trailer: &[u8],
    mode: ExtraFieldParseMode,
) -> Result<Vec<ExtraField>, Error> {
    if mode.fails_on_trailer() {
        return Err(FormatError::MalformedExtraFieldRegion.into());
    }
    if mode.keeps_trailer() {
        fields.push(ExtraField::Unparseable {
            payload: trailer.to_vec(),
        });
    }
    Ok(fields)
}

/// Serialize a sequence of fields back to an extra-field region.
///
/// Typed fields are emitted as `(id, length, payload)` triples. A trailing
/// [ExtraField::Unparseable] block is written raw, with no header, which is
/// exactly how it was found.
pub fn serialize_extra_fields(fields: &[ExtraField], local: bool) -> Vec<u8> {
    let mut out = Vec::new();
    for (idx, field) in fields.iter().enumerate() {
        match field.tag() {
            Some(tag) => {
                let data = field.data(local);
                out.put_u16(tag);
                out.put_u16(data.len() as u16);
                out.extend_from_slice(&data);
            }
            None => {
                if idx == fields.len() - 1 {
                    out.extend_from_slice(&field.data(local));
                }
                // a non-trailing unparseable block cannot be written back
                // without corrupting what follows it, so it is dropped
            }
        }
    }
    out
}

fn parse_one(tag: u16, payload: &[u8], settings: ExtraFieldSettings) -> Result<ExtraField, ()> {
    use ExtraField as EF;
    let field = match tag {
        ExtraZip64Field::TAG => run(payload, ExtraZip64Field::mk_parser(settings)).map(EF::Zip64),
        ExtraTimestampField::TAG => ExtraTimestampField::parse(payload).map(EF::Timestamp),
        ExtraNtfsField::TAG => run(payload, ExtraNtfsField::parser).map(EF::Ntfs),
        ExtraUnixAsiField::TAG => ExtraUnixAsiField::parse(payload).map(EF::UnixAsi),
        ExtraInfoZipUnixField::TAG => {
            ExtraInfoZipUnixField::parse(payload, settings.local).map(EF::InfoZipUnix)
        }
        ExtraNewUnixField::TAG => run(payload, ExtraNewUnixField::parser).map(EF::NewUnix),
        ExtraUnicodeField::TAG_PATH => ExtraUnicodeField::parse(payload).map(EF::UnicodePath),
        ExtraUnicodeField::TAG_COMMENT => ExtraUnicodeField::parse(payload).map(EF::UnicodeComment),
        ExtraResourceAlignmentField::TAG => {
            ExtraResourceAlignmentField::parse(payload).map(EF::ResourceAlignment)
        }
        0xCAFE if payload.is_empty() => Some(EF::JarMarker),
        0xCAFE => None,
        0x0014 | 0x0015 | 0x0016 | 0x0017 | 0x0019 => {
            Some(EF::StrongEncryption(ExtraStrongEncryptionField {
                tag,
                payload: payload.to_vec(),
            }))
        }
        _ => {
            return Ok(EF::Unrecognized {
                tag,
                payload: payload.to_vec(),
            })
        }
    };
    field.ok_or(())
}

// Run a winnow parser over a payload, turning any error (including an
// out-of-range read) into None.
fn run<'a, T>(
    payload: &'a [u8],
    mut parser: impl FnMut(&mut Partial<&'a [u8]>) -> PResult<T>,
) -> Option<T> {
    let mut input = Partial::new(payload);
    parser(&mut input).ok()
}

/// 4.5.3 -Zip64 Extended Information Extra Field (0x0001)
///
/// Which fields are present depends on which sentinels the surrounding
/// record uses; absent slots are `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtraZip64Field {
    /// 64-bit uncompressed size
    pub uncompressed_size: Option<u64>,

    /// 64-bit compressed size
    pub compressed_size: Option<u64>,

    /// 64-bit header offset
    pub header_offset: Option<u64>,

    /// 32-bit disk start number
    pub disk_start: Option<u32>,
}

impl ExtraZip64Field {
    pub(crate) const TAG: u16 = 0x0001;

    pub(crate) fn mk_parser(
        settings: ExtraFieldSettings,
    ) -> impl FnMut(&mut Partial<&'_ [u8]>) -> PResult<Self> {
        move |i| {
            // slots appear in fixed order, but only when the corresponding
            // u32/u16 field holds its sentinel
            let uncompressed_size = if settings.uncompressed_size_u32 == 0xFFFF_FFFF {
                Some(le_u64.parse_next(i)?)
            } else {
                None
            };
            let compressed_size = if settings.compressed_size_u32 == 0xFFFF_FFFF {
                Some(le_u64.parse_next(i)?)
            } else {
                None
            };
            let header_offset = if settings.header_offset_u32 == 0xFFFF_FFFF {
                Some(le_u64.parse_next(i)?)
            } else {
                None
            };
            let disk_start = if settings.disk_start_u16 == 0xFFFF {
                Some(le_u32.parse_next(i)?)
            } else {
                None
            };

            Ok(Self {
                uncompressed_size,
                compressed_size,
                header_offset,
                disk_start,
            })
        }
    }

    fn data(&self, local: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(28);
        if local {
            // a local zip64 extra must carry both sizes
            out.put_u64(self.uncompressed_size.unwrap_or(0));
            out.put_u64(self.compressed_size.unwrap_or(0));
        } else {
            if let Some(n) = self.uncompressed_size {
                out.put_u64(n);
            }
            if let Some(n) = self.compressed_size {
                out.put_u64(n);
            }
            if let Some(n) = self.header_offset {
                out.put_u64(n);
            }
            if let Some(n) = self.disk_start {
                out.put_u32(n);
            }
        }
        out
    }
}

/// Extended timestamp extra field (0x5455)
///
/// Up to three seconds-since-epoch stamps, selected by a flags byte. The
/// central directory copy traditionally only carries the modification time,
/// whatever the flags claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtraTimestampField {
    /// bit 0: mtime present, bit 1: atime present, bit 2: ctime present
    pub flags: u8,

    /// seconds since epoch of last modification
    pub mtime: Option<u32>,

    /// seconds since epoch of last access
    pub atime: Option<u32>,

    /// seconds since epoch of creation
    pub ctime: Option<u32>,
}

impl ExtraTimestampField {
    pub(crate) const TAG: u16 = 0x5455;

    fn parse(payload: &[u8]) -> Option<Self> {
        let (&flags, mut rest) = payload.split_first()?;
        let mut next = |wanted: bool| -> Option<u32> {
            if !wanted || rest.len() < 4 {
                return None;
            }
            let (head, tail) = rest.split_at(4);
            rest = tail;
            Some(u32::from_le_bytes(head.try_into().unwrap()))
        };
        let mtime = next(flags & 0b001 != 0);
        let atime = next(flags & 0b010 != 0);
        let ctime = next(flags & 0b100 != 0);
        if flags & 0b001 != 0 && mtime.is_none() {
            // flags promised a modification time that isn't there
            return None;
        }
        Some(Self {
            flags,
            mtime,
            atime,
            ctime,
        })
    }

    fn data(&self, local: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(13);
        out.push(self.flags);
        if local {
            for stamp in [self.mtime, self.atime, self.ctime].into_iter().flatten() {
                out.put_u32(stamp);
            }
        } else if let Some(mtime) = self.mtime {
            out.put_u32(mtime);
        }
        out
    }
}

/// 4.5.5 -NTFS Extra Field (0x000a)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraNtfsField {
    /// NTFS attributes
    pub attrs: Vec<NtfsAttr>,
}

impl ExtraNtfsField {
    pub(crate) const TAG: u16 = 0x000a;

    fn parser(i: &mut Partial<&'_ [u8]>) -> PResult<Self> {
        let _ = take(4_usize).parse_next(i)?; // reserved (unused)
        let mut attrs = Vec::new();
        while !i.is_empty() {
            attrs.push(NtfsAttr::parser(i)?);
        }
        Ok(Self { attrs })
    }

    fn data(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.put_u32(0); // reserved
        for attr in &self.attrs {
            match attr {
                NtfsAttr::Attr1(attr) => {
                    out.put_u16(0x0001);
                    out.put_u16(24);
                    out.put_u64(attr.mtime.timestamp);
                    out.put_u64(attr.atime.timestamp);
                    out.put_u64(attr.ctime.timestamp);
                }
                NtfsAttr::Unknown { tag, payload } => {
                    out.put_u16(*tag);
                    out.put_u16(payload.len() as u16);
                    out.extend_from_slice(payload);
                }
            }
        }
        out
    }
}

/// NTFS attribute for zip entries (mostly timestamps)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NtfsAttr {
    /// NTFS attribute 1, which contains modified/accessed/created timestamps
    Attr1(NtfsAttr1),

    /// Unknown NTFS attribute
    Unknown {
        /// tag of the attribute
        tag: u16,
        /// raw payload, kept for round-trips
        payload: Vec<u8>,
    },
}

impl NtfsAttr {
    fn parser(i: &mut Partial<&'_ [u8]>) -> PResult<Self> {
        let tag = le_u16.parse_next(i)?;
        let payload = length_take(le_u16).parse_next(i)?;

        match tag {
            0x0001 => NtfsAttr1::parser
                .parse_peek(Partial::new(payload))
                .map(|(_, attr)| NtfsAttr::Attr1(attr)),
            _ => Ok(NtfsAttr::Unknown {
                tag,
                payload: payload.to_vec(),
            }),
        }
    }
}

/// NTFS attribute 1, which contains modified/accessed/created timestamps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NtfsAttr1 {
    /// modified time
    pub mtime: NtfsTimestamp,

    /// accessed time
    pub atime: NtfsTimestamp,

    /// created time
    pub ctime: NtfsTimestamp,
}

impl NtfsAttr1 {
    fn parser(i: &mut Partial<&'_ [u8]>) -> PResult<Self> {
        seq! {Self {
            mtime: NtfsTimestamp::parser,
            atime: NtfsTimestamp::parser,
            ctime: NtfsTimestamp::parser,
        }}
        .parse_next(i)
    }
}

/// ASi UNIX extra field (0x756E)
///
/// ```text
/// Value         Size        Description
/// -----         ----        -----------
/// 0x756E        Short       tag ("nu")
/// TSize         Short       total data size for this block
/// CRC           Long        CRC-32 of the remaining fields
/// Mode          Short       Unix file mode
/// SizDev        Long        symlink target length or major/minor device
/// UID           Short       user id
/// GID           Short       group id
/// (var)         Variable    symlink target
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraUnixAsiField {
    /// Unix file mode (type bits and permissions)
    pub mode: u16,
    /// user id
    pub uid: u16,
    /// group id
    pub gid: u16,
    /// symlink target, empty unless the entry is a symlink
    pub link_target: Vec<u8>,
}

impl ExtraUnixAsiField {
    pub(crate) const TAG: u16 = 0x756E;

    fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 14 {
            return None;
        }
        let stored_crc = u32::from_le_bytes(payload[0..4].try_into().unwrap());
        if crc32fast::hash(&payload[4..]) != stored_crc {
            return None;
        }
        let mode = u16::from_le_bytes(payload[4..6].try_into().unwrap());
        let link_len = u32::from_le_bytes(payload[6..10].try_into().unwrap()) as usize;
        let uid = u16::from_le_bytes(payload[10..12].try_into().unwrap());
        let gid = u16::from_le_bytes(payload[12..14].try_into().unwrap());
        let link_target = payload[14..].to_vec();
        if link_len != link_target.len() && link_len != 0 {
            return None;
        }
        Some(Self {
            mode,
            uid,
            gid,
            link_target,
        })
    }

    fn data(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(10 + self.link_target.len());
        body.put_u16(self.mode);
        body.put_u32(self.link_target.len() as u32);
        body.put_u16(self.uid);
        body.put_u16(self.gid);
        body.extend_from_slice(&self.link_target);

        let mut out = Vec::with_capacity(4 + body.len());
        out.put_u32(crc32fast::hash(&body));
        out.extend_from_slice(&body);
        out
    }
}

/// Info-ZIP UNIX extra field, first version (0x5855)
///
/// Timestamps as seconds since epoch; the local copy may additionally carry
/// uid/gid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtraInfoZipUnixField {
    /// file last access time
    pub atime: u32,
    /// file last modification time
    pub mtime: u32,
    /// file user id, local header only
    pub uid: Option<u16>,
    /// file group id, local header only
    pub gid: Option<u16>,
}

impl ExtraInfoZipUnixField {
    pub(crate) const TAG: u16 = 0x5855;

    fn parse(payload: &[u8], local: bool) -> Option<Self> {
        if payload.len() < 8 {
            return None;
        }
        let atime = u32::from_le_bytes(payload[0..4].try_into().unwrap());
        let mtime = u32::from_le_bytes(payload[4..8].try_into().unwrap());
        let (uid, gid) = if local && payload.len() >= 12 {
            (
                Some(u16::from_le_bytes(payload[8..10].try_into().unwrap())),
                Some(u16::from_le_bytes(payload[10..12].try_into().unwrap())),
            )
        } else {
            (None, None)
        };
        Some(Self {
            atime,
            mtime,
            uid,
            gid,
        })
    }

    fn data(&self, local: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(12);
        out.put_u32(self.atime);
        out.put_u32(self.mtime);
        if local {
            if let (Some(uid), Some(gid)) = (self.uid, self.gid) {
                out.put_u16(uid);
                out.put_u16(gid);
            }
        }
        out
    }
}

/// Info-ZIP New Unix Extra Field (0x7875)
///
/// ```text
/// Value         Size        Description
/// -----         ----        -----------
/// 0x7875        Short       tag for this extra block type ("ux")
/// TSize         Short       total data size for this block
/// Version       1 byte      version of this extra field, currently 1
/// UIDSize       1 byte      Size of UID field
/// UID           Variable    UID for this entry
/// GIDSize       1 byte      Size of GID field
/// GID           Variable    GID for this entry
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtraNewUnixField {
    /// file user id
    pub uid: u64,

    /// file group id
    pub gid: u64,
}

impl ExtraNewUnixField {
    pub(crate) const TAG: u16 = 0x7875;

    fn parser(i: &mut Partial<&'_ [u8]>) -> PResult<Self> {
        let _ = literal("\x01").parse_next(i)?;
        seq! {Self {
            uid: Self::parse_variable_length_integer,
            gid: Self::parse_variable_length_integer,
        }}
        .parse_next(i)
    }

    fn parse_variable_length_integer(i: &mut Partial<&'_ [u8]>) -> PResult<u64> {
        let slice = length_take(le_u8).parse_next(i)?;
        if slice.is_empty() || slice.len() > 8 {
            return Err(ErrMode::from_error_kind(i, ErrorKind::Alt));
        }
        let mut buf = [0u8; 8];
        buf[..slice.len()].copy_from_slice(slice);
        Ok(u64::from_le_bytes(buf))
    }

    fn data(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(19);
        out.push(1);
        for n in [self.uid, self.gid] {
            // little-endian with leading zeroes trimmed, at least one byte
            let bytes = n.to_le_bytes();
            let len = (8 - n.leading_zeros() as usize / 8).max(1);
            out.push(len as u8);
            out.extend_from_slice(&bytes[..len]);
        }
        out
    }
}

/// Info-ZIP Unicode Path (0x7075) and Unicode Comment (0x6375) extra fields
///
/// A UTF-8 override of the entry's name or comment. Only meaningful when the
/// stored CRC-32 matches the raw bytes the override replaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraUnicodeField {
    /// CRC-32 of the raw (archive-encoded) name or comment bytes
    pub crc32: u32,

    /// UTF-8 replacement text
    pub utf8: Vec<u8>,
}

impl ExtraUnicodeField {
    pub(crate) const TAG_PATH: u16 = 0x7075;
    pub(crate) const TAG_COMMENT: u16 = 0x6375;

    fn parse(payload: &[u8]) -> Option<Self> {
        // only version 1 was ever defined
        if payload.len() < 5 || payload[0] != 1 {
            return None;
        }
        Some(Self {
            crc32: u32::from_le_bytes(payload[1..5].try_into().unwrap()),
            utf8: payload[5..].to_vec(),
        })
    }

    fn data(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + self.utf8.len());
        out.push(1);
        out.put_u32(self.crc32);
        out.extend_from_slice(&self.utf8);
        out
    }
}

/// Android resource alignment extra field (0xA11E)
///
/// The requested alignment for the entry's data, plus however much padding
/// the writer needed to achieve it, carried inside the field itself so it
/// round-trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtraResourceAlignmentField {
    /// requested alignment, a power of two
    pub alignment: u16,

    /// whether the archiver may change the compression method to achieve
    /// the alignment
    pub allow_method_change: bool,

    /// number of padding bytes carried by the local copy of the field
    pub padding: usize,
}

impl ExtraResourceAlignmentField {
    pub(crate) const TAG: u16 = 0xA11E;

    fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 2 {
            return None;
        }
        let value = u16::from_le_bytes(payload[0..2].try_into().unwrap());
        Some(Self {
            alignment: value & 0x7FFF,
            allow_method_change: value & 0x8000 != 0,
            padding: payload.len() - 2,
        })
    }

    fn data(&self, local: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.padding);
        let value = self.alignment | if self.allow_method_change { 0x8000 } else { 0 };
        out.put_u16(value);
        if local {
            out.resize(2 + self.padding, 0);
        }
        out
    }
}

/// PKWare strong-encryption related extra fields, carried raw: this crate
/// detects encryption but never decrypts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraStrongEncryptionField {
    /// one of 0x0014, 0x0015, 0x0016, 0x0017, 0x0019
    pub tag: u16,
    /// raw payload bytes
    pub payload: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(tag: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.put_u16(tag);
        out.put_u16(payload.len() as u16);
        out.extend_from_slice(payload);
        out
    }

    fn local_settings() -> ExtraFieldSettings {
        ExtraFieldSettings::local(0, 0)
    }

    #[test]
    fn zip64_slots_follow_sentinels() {
        let mut payload = Vec::new();
        payload.put_u64(0x1_0000_0001);
        payload.put_u64(0x2_0000_0002);
        let region = field(0x0001, &payload);

        let settings = ExtraFieldSettings::central(0xFFFF_FFFF, 0xFFFF_FFFF, 0, 0);
        let fields =
            parse_extra_fields(&region, settings, ExtraFieldParseMode::default()).unwrap();
        assert_eq!(
            fields,
            vec![ExtraField::Zip64(ExtraZip64Field {
                uncompressed_size: Some(0x1_0000_0001),
                compressed_size: Some(0x2_0000_0002),
                header_offset: None,
                disk_start: None,
            })]
        );

        // round-trip
        assert_eq!(serialize_extra_fields(&fields, false), region);
    }

    #[test]
    fn timestamp_central_copy_only_carries_mtime() {
        let f = ExtraTimestampField {
            flags: 0b111,
            mtime: Some(100),
            atime: Some(200),
            ctime: Some(300),
        };
        assert_eq!(f.data(true).len(), 13);
        assert_eq!(f.data(false).len(), 5);

        let reparsed = ExtraTimestampField::parse(&f.data(false)).unwrap();
        assert_eq!(reparsed.mtime, Some(100));
        assert_eq!(reparsed.atime, None);
    }

    #[test]
    fn asi_crc_is_verified() {
        let good = ExtraUnixAsiField {
            mode: 0o100644,
            uid: 1000,
            gid: 1000,
            link_target: vec![],
        };
        let mut payload = good.data();
        assert_eq!(ExtraUnixAsiField::parse(&payload), Some(good));

        // flip a bit in the mode, the crc no longer matches
        payload[4] ^= 1;
        assert_eq!(ExtraUnixAsiField::parse(&payload), None);
    }

    #[test]
    fn new_unix_trims_leading_zeroes() {
        let f = ExtraNewUnixField { uid: 1000, gid: 0 };
        let data = f.data();
        // version, uid size 2, uid, gid size 1, gid
        assert_eq!(data, vec![1, 2, 0xE8, 0x03, 1, 0]);

        let mut input = Partial::new(&data[..]);
        let reparsed = ExtraNewUnixField::parser(&mut input).unwrap();
        assert_eq!(reparsed, f);
    }

    #[test]
    fn unicode_path_round_trips() {
        let f = ExtraUnicodeField {
            crc32: 0xDEADBEEF,
            utf8: "日本語.txt".as_bytes().to_vec(),
        };
        let region = field(0x7075, &f.data());
        let fields =
            parse_extra_fields(&region, local_settings(), ExtraFieldParseMode::default()).unwrap();
        assert_eq!(fields, vec![ExtraField::UnicodePath(f)]);
        assert_eq!(serialize_extra_fields(&fields, true), region);
    }

    #[test]
    fn malformed_trailer_per_mode() {
        // a valid unknown field followed by a field whose claimed length
        // overruns the region
        let mut region = field(0x1234, b"ok");
        region.extend_from_slice(&[0x99, 0x99, 0xFF, 0x00, 0x01]);

        use ExtraFieldParseMode as M;
        let best = parse_extra_fields(&region, local_settings(), M::BestEffort).unwrap();
        assert_eq!(best.len(), 2);
        assert!(matches!(best[1], ExtraField::Unparseable { .. }));

        let lenient = parse_extra_fields(&region, local_settings(), M::OnlyParseableLenient).unwrap();
        assert_eq!(lenient.len(), 1);

        let strict = parse_extra_fields(&region, local_settings(), M::StrictForKnown).unwrap();
        assert_eq!(strict.len(), 2);

        assert!(parse_extra_fields(&region, local_settings(), M::Draconic).is_err());
    }

    #[test]
    fn bad_known_field_per_mode() {
        // unicode path with a bad version byte
        let region = field(0x7075, &[9, 0, 0, 0, 0, b'x']);

        use ExtraFieldParseMode as M;
        let best = parse_extra_fields(&region, local_settings(), M::BestEffort).unwrap();
        assert!(matches!(best[0], ExtraField::Unrecognized { tag: 0x7075, .. }));

        assert!(parse_extra_fields(&region, local_settings(), M::StrictForKnown).is_err());
        assert!(parse_extra_fields(&region, local_settings(), M::OnlyParseableStrict).is_err());
    }

    #[test]
    fn unrecognized_fields_round_trip() {
        let region = field(0x4242, &[1, 2, 3, 4]);
        let fields =
            parse_extra_fields(&region, local_settings(), ExtraFieldParseMode::default()).unwrap();
        assert_eq!(serialize_extra_fields(&fields, true), region);
    }

    #[test]
    fn resource_alignment_padding_is_local_only() {
        let f = ExtraResourceAlignmentField {
            alignment: 4096,
            allow_method_change: true,
            padding: 10,
        };
        assert_eq!(f.data(true).len(), 12);
        assert_eq!(f.data(false).len(), 2);

        let reparsed = ExtraResourceAlignmentField::parse(&f.data(true)).unwrap();
        assert_eq!(reparsed, f);
    }
}
