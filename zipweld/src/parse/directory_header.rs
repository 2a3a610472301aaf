use winnow::{
    binary::{le_u16, le_u32},
    token::tag,
    PResult, Parser, Partial,
};

use crate::{
    encoding::{detect_utf8, Encoding},
    error::{Error, FormatError},
    options::ReadOptions,
    parse::{
        flag_utf8, CommentSource, Entry, ExtraFieldSettings, HostSystem, Method, Mode, MsdosMode,
        MsdosTimestamp, NameSource, UnixMode, Version, ZipBytes, ZipString,
    },
};

use super::raw::PutLe;

/// 4.3.12 Central directory structure: File header
#[derive(Debug, Clone)]
pub struct DirectoryHeader {
    /// version made by
    pub creator_version: Version,
    /// version needed to extract
    pub reader_version: Version,
    /// general purpose bit flag
    pub flags: u16,
    /// compression method
    pub method: u16,
    /// last mod file datetime
    pub modified: MsdosTimestamp,
    /// crc32
    pub crc32: u32,
    /// compressed size
    pub compressed_size: u32,
    /// uncompressed size
    pub uncompressed_size: u32,
    /// disk number start
    pub disk_nbr_start: u16,
    /// internal file attributes
    pub internal_attrs: u16,
    /// external file attributes
    pub external_attrs: u32,
    /// relative offset of local header
    pub header_offset: u32,

    /// name
    pub name: ZipString,
    /// extra
    pub extra: ZipBytes,
    /// comment
    pub comment: ZipString,
}

impl DirectoryHeader {
    /// Signature for a central directory header
    pub const SIGNATURE: &'static str = "PK\x01\x02";

    /// Size of the fixed portion, including the signature
    pub const LENGTH: usize = 46;

    /// Parser for the central directory file header
    pub fn parser(i: &mut Partial<&'_ [u8]>) -> PResult<Self> {
        _ = tag(Self::SIGNATURE).parse_next(i)?;
        let creator_version = Version::parser.parse_next(i)?;
        let reader_version = Version::parser.parse_next(i)?;
        let flags = le_u16.parse_next(i)?;
        let method = le_u16.parse_next(i)?;
        let modified = MsdosTimestamp::parser.parse_next(i)?;
        let crc32 = le_u32.parse_next(i)?;
        let compressed_size = le_u32.parse_next(i)?;
        let uncompressed_size = le_u32.parse_next(i)?;
        let name_len = le_u16.parse_next(i)?;
        let extra_len = le_u16.parse_next(i)?;
        let comment_len = le_u16.parse_next(i)?;
        let disk_nbr_start = le_u16.parse_next(i)?;
        let internal_attrs = le_u16.parse_next(i)?;
        let external_attrs = le_u32.parse_next(i)?;
        let header_offset = le_u32.parse_next(i)?;

        let name = ZipString::parser(name_len).parse_next(i)?;
        let extra = ZipBytes::parser(extra_len).parse_next(i)?;
        let comment = ZipString::parser(comment_len).parse_next(i)?;

        Ok(Self {
            creator_version,
            reader_version,
            flags,
            method,
            modified,
            crc32,
            compressed_size,
            uncompressed_size,
            disk_nbr_start,
            internal_attrs,
            external_attrs,
            header_offset,
            name,
            extra,
            comment,
        })
    }

    /// Whether this entry's name and comment are definitely not UTF-8.
    pub fn is_non_utf8(&self) -> bool {
        let (valid1, require1) = detect_utf8(&self.name.0[..]);
        let (valid2, require2) = detect_utf8(&self.comment.0[..]);
        if !valid1 || !valid2 {
            // definitely not utf-8
            return true;
        }

        if !require1 && !require2 {
            // name and comment only use single-byte runes that overlap with UTF-8
            return false;
        }

        // Might be UTF-8, might be some other encoding; preserve existing flag.
        // Some ZIP writers use UTF-8 encoding without setting the UTF-8 flag.
        // Since it is impossible to always distinguish valid UTF-8 from some
        // other encoding (e.g., GBK or Shift-JIS), we trust the flag.
        self.flags & 0x800 == 0
    }

    /// Materialize an [Entry] from this header.
    ///
    /// `global_offset` is how much non-zip data precedes the archive (split
    /// signature, self-extracting stub); header offsets are shifted by it.
    pub fn as_entry(
        &self,
        encoding: Encoding,
        options: &ReadOptions,
        global_offset: u64,
    ) -> Result<Entry, Error> {
        let entry_encoding = if flag_utf8(self.flags) {
            Encoding::Utf8
        } else {
            encoding
        };
        let name = entry_encoding.decode(&self.name.0)?;
        let name_source = if flag_utf8(self.flags) {
            NameSource::NameWithEfsFlag
        } else {
            NameSource::Name
        };

        let mut comment: Option<String> = None;
        if let Some(comment_field) = self.comment.clone().into_option() {
            comment = Some(entry_encoding.decode(&comment_field.0)?);
        }

        let settings = ExtraFieldSettings::central(
            self.uncompressed_size,
            self.compressed_size,
            self.header_offset,
            self.disk_nbr_start,
        );
        let extra_fields = crate::parse::parse_extra_fields(
            &self.extra.0,
            settings,
            options.extra_field_mode,
        )?;

        let mut mode: Mode = match self.creator_version.host_system {
            HostSystem::Unix | HostSystem::Osx => UnixMode(self.external_attrs >> 16).into(),
            HostSystem::WindowsNtfs | HostSystem::Vfat | HostSystem::MsDos => {
                MsdosMode(self.external_attrs).into()
            }
            _ => Mode(0),
        };
        if name.ends_with('/') {
            // believe it or not, this is straight from the APPNOTE
            mode |= Mode::DIR
        };

        let mut entry = Entry {
            name,
            raw_name: self.name.0.clone(),
            name_source,
            method: Method::from(self.method),
            comment,
            raw_comment: self.comment.0.clone(),
            comment_source: CommentSource::Comment,
            modified: self
                .modified
                .to_datetime()
                .unwrap_or_else(super::zero_datetime),
            created: None,
            accessed: None,
            header_offset: self.header_offset as u64,
            data_offset: None,
            creator_version: self.creator_version,
            reader_version: self.reader_version,
            flags: self.flags,
            uid: None,
            gid: None,
            crc32: self.crc32,
            compressed_size: self.compressed_size as u64,
            uncompressed_size: self.uncompressed_size as u64,
            mode,
            internal_attrs: self.internal_attrs,
            external_attrs: self.external_attrs,
            disk_nbr_start: self.disk_nbr_start as u32,
            is_zip64: false,
            extra_fields,
        };

        for field in entry.extra_fields.clone() {
            entry.set_extra_field(&field);
        }

        // sentinels without a zip64 extra to resolve them are corruption
        let wants_zip64 = self.uncompressed_size == 0xFFFF_FFFF
            || self.compressed_size == 0xFFFF_FFFF
            || self.header_offset == 0xFFFF_FFFF;
        if wants_zip64 && !entry.is_zip64 {
            return Err(FormatError::InvalidZip64ExtraField.into());
        }

        entry.header_offset += global_offset;

        if options.use_unicode_extra_fields && !flag_utf8(self.flags) {
            entry.apply_unicode_overrides();
        }

        Ok(entry)
    }

    /// Serialize to on-disk bytes, including the signature.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            Self::LENGTH + self.name.0.len() + self.extra.0.len() + self.comment.0.len(),
        );
        out.extend_from_slice(Self::SIGNATURE.as_bytes());
        out.put_u16(self.creator_version.to_u16());
        out.put_u16(self.reader_version.to_u16());
        out.put_u16(self.flags);
        out.put_u16(self.method);
        out.extend_from_slice(&self.modified.to_bytes());
        out.put_u32(self.crc32);
        out.put_u32(self.compressed_size);
        out.put_u32(self.uncompressed_size);
        out.put_u16(self.name.byte_len());
        out.put_u16(self.extra.byte_len());
        out.put_u16(self.comment.byte_len());
        out.put_u16(self.disk_nbr_start);
        out.put_u16(self.internal_attrs);
        out.put_u32(self.external_attrs);
        out.put_u32(self.header_offset);
        self.name.put(&mut out);
        self.extra.put(&mut out);
        self.comment.put(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_header_round_trips() {
        let header = DirectoryHeader {
            creator_version: Version::from(0x031E),
            reader_version: Version::from(20),
            flags: 0,
            method: 8,
            modified: MsdosTimestamp {
                time: 0x6000,
                date: 0x5A21,
            },
            crc32: 0xDEADBEEF,
            compressed_size: 10,
            uncompressed_size: 20,
            disk_nbr_start: 0,
            internal_attrs: 1,
            external_attrs: 0o100644 << 16,
            header_offset: 42,
            name: ZipString(b"x/y.txt".to_vec()),
            extra: ZipBytes(vec![]),
            comment: ZipString(b"hi".to_vec()),
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), 46 + 7 + 2);

        let mut input = Partial::new(&bytes[..]);
        let reparsed = DirectoryHeader::parser(&mut input).unwrap();
        assert_eq!(reparsed.creator_version, header.creator_version);
        assert_eq!(reparsed.method, header.method);
        assert_eq!(reparsed.external_attrs, header.external_attrs);
        assert_eq!(reparsed.header_offset, header.header_offset);
        assert_eq!(reparsed.name, header.name);
        assert_eq!(reparsed.comment, header.comment);
    }

    #[test]
    fn unix_entries_get_unix_modes() {
        let header = DirectoryHeader {
            creator_version: Version::from(0x031E),
            reader_version: Version::from(20),
            flags: 0,
            method: 0,
            modified: MsdosTimestamp { time: 0, date: 33 },
            crc32: 0,
            compressed_size: 0,
            uncompressed_size: 0,
            disk_nbr_start: 0,
            internal_attrs: 0,
            external_attrs: 0o100755 << 16,
            header_offset: 0,
            name: ZipString(b"bin/tool".to_vec()),
            extra: ZipBytes(vec![]),
            comment: ZipString(vec![]),
        };
        let entry = header
            .as_entry(Encoding::Utf8, &ReadOptions::default(), 0)
            .unwrap();
        assert_eq!(entry.mode.0 & 0o777, 0o755);
    }
}
