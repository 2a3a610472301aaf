use winnow::{
    binary::{le_u16, le_u32},
    token::tag,
    PResult, Parser, Partial,
};

use crate::{
    encoding::Encoding,
    error::{Error, FormatError},
    options::{EncodingPolicy, ReadOptions},
    parse::{
        flag_data_descriptor, flag_utf8, CommentSource, Entry, ExtraFieldSettings, Method, Mode,
        MsdosTimestamp, NameSource, Version, ZipBytes, ZipString,
    },
};

use super::raw::PutLe;

/// 4.3.7 Local file header
#[derive(Debug, Clone)]
pub struct LocalFileHeader {
    /// version needed to extract
    pub reader_version: Version,

    /// general purpose bit flag
    pub flags: u16,

    /// compression method
    pub method: Method,

    /// last mod file datetime
    pub modified: MsdosTimestamp,

    /// crc-32
    pub crc32: u32,

    /// compressed size
    pub compressed_size: u32,

    /// uncompressed size
    pub uncompressed_size: u32,

    /// file name
    pub name: ZipString,

    /// extra field
    pub extra: ZipBytes,
}

impl LocalFileHeader {
    /// The signature for a local file header
    pub const SIGNATURE: &'static str = "PK\x03\x04";

    /// Size of the fixed portion, including the signature
    pub const LENGTH: usize = 30;

    /// Parser for the local file header
    pub fn parser(i: &mut Partial<&'_ [u8]>) -> PResult<Self> {
        let _ = tag(Self::SIGNATURE).parse_next(i)?;

        let reader_version = Version::parser.parse_next(i)?;
        let flags = le_u16.parse_next(i)?;
        let method = le_u16.parse_next(i).map(Method::from)?;
        let modified = MsdosTimestamp::parser.parse_next(i)?;
        let crc32 = le_u32.parse_next(i)?;
        let compressed_size = le_u32.parse_next(i)?;
        let uncompressed_size = le_u32.parse_next(i)?;

        let name_len = le_u16.parse_next(i)?;
        let extra_len = le_u16.parse_next(i)?;

        let name = ZipString::parser(name_len).parse_next(i)?;
        let extra = ZipBytes::parser(extra_len).parse_next(i)?;

        Ok(Self {
            reader_version,
            flags,
            method,
            modified,
            crc32,
            compressed_size,
            uncompressed_size,
            name,
            extra,
        })
    }

    /// Check for the presence of the bit flag that indicates a data descriptor
    /// is present after the file data.
    pub fn has_data_descriptor(&self) -> bool {
        flag_data_descriptor(self.flags)
    }

    /// Build an [Entry] from this header alone: the streaming reader's view,
    /// where no central directory information exists yet.
    pub fn as_entry(&self, options: &ReadOptions) -> Result<Entry, Error> {
        let encoding = if flag_utf8(self.flags) {
            Encoding::Utf8
        } else {
            match options.encoding {
                EncodingPolicy::Forced(encoding) => encoding,
                // no central directory to sniff over in a one-pass read,
                // CP-437 is the zip default
                EncodingPolicy::Detect => Encoding::Cp437,
            }
        };
        let name = encoding.decode(&self.name.0)?;
        let name_source = if flag_utf8(self.flags) {
            NameSource::NameWithEfsFlag
        } else {
            NameSource::Name
        };

        let settings = ExtraFieldSettings::local(self.uncompressed_size, self.compressed_size);
        let extra_fields = crate::parse::parse_extra_fields(
            &self.extra.0,
            settings,
            options.extra_field_mode,
        )?;

        let mut mode = Mode(0);
        if name.ends_with('/') {
            mode |= Mode::DIR;
        }

        let mut entry = Entry {
            name,
            raw_name: self.name.0.clone(),
            name_source,
            method: self.method,
            comment: None,
            raw_comment: Vec::new(),
            comment_source: CommentSource::Comment,
            modified: self
                .modified
                .to_datetime()
                .unwrap_or_else(super::zero_datetime),
            created: None,
            accessed: None,
            header_offset: 0,
            data_offset: None,
            creator_version: self.reader_version,
            reader_version: self.reader_version,
            flags: self.flags,
            uid: None,
            gid: None,
            crc32: self.crc32,
            compressed_size: self.compressed_size as u64,
            uncompressed_size: self.uncompressed_size as u64,
            mode,
            internal_attrs: 0,
            external_attrs: 0,
            disk_nbr_start: 0,
            is_zip64: false,
            extra_fields,
        };

        for field in entry.extra_fields.clone() {
            entry.set_extra_field(&field);
        }

        // 0xFFFFFFFF sizes on an entry without a data descriptor only make
        // sense if a zip64 extra resolved them
        let wants_zip64 = self.uncompressed_size == 0xFFFF_FFFF
            || self.compressed_size == 0xFFFF_FFFF;
        if wants_zip64 && !self.has_data_descriptor() && !entry.is_zip64 {
            return Err(FormatError::InvalidZip64ExtraField.into());
        }

        if options.use_unicode_extra_fields && !flag_utf8(self.flags) {
            entry.apply_unicode_overrides();
        }

        Ok(entry)
    }

    /// Serialize to on-disk bytes, including the signature.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LENGTH + self.name.0.len() + self.extra.0.len());
        out.extend_from_slice(Self::SIGNATURE.as_bytes());
        out.put_u16(self.reader_version.to_u16());
        out.put_u16(self.flags);
        out.put_u16(self.method.into());
        out.extend_from_slice(&self.modified.to_bytes());
        out.put_u32(self.crc32);
        out.put_u32(self.compressed_size);
        out.put_u32(self.uncompressed_size);
        out.put_u16(self.name.byte_len());
        out.put_u16(self.extra.byte_len());
        self.name.put(&mut out);
        self.extra.put(&mut out);
        out
    }
}

/// 4.3.9  Data descriptor:
#[derive(Debug, Clone, Copy)]
pub struct DataDescriptorRecord {
    /// CRC32 checksum
    pub crc32: u32,
    /// Compressed size
    pub compressed_size: u64,
    /// Uncompressed size
    pub uncompressed_size: u64,
}

impl DataDescriptorRecord {
    /// The (optional, but commonly adopted) signature for a data descriptor
    pub const SIGNATURE: &'static str = "PK\x07\x08";

    /// Create a parser for the data descriptor record.
    pub fn mk_parser(is_zip64: bool) -> impl FnMut(&mut Partial<&'_ [u8]>) -> PResult<Self> {
        use winnow::combinator::opt;
        move |i| {
            // From appnote.txt:
            //
            // 4.3.9.3 Although not originally assigned a signature, the value
            // 0x08074b50 has commonly been adopted as a signature value for the
            // data descriptor record.  Implementers SHOULD be aware that ZIP files
            // MAY be encountered with or without this signature marking data
            // descriptors and SHOULD account for either case when reading ZIP files
            // to ensure compatibility.
            let _ = opt(tag(Self::SIGNATURE)).parse_next(i)?;

            if is_zip64 {
                winnow::seq! {Self {
                    crc32: le_u32,
                    compressed_size: winnow::binary::le_u64,
                    uncompressed_size: winnow::binary::le_u64,
                }}
                .parse_next(i)
            } else {
                winnow::seq! {Self {
                    crc32: le_u32,
                    compressed_size: le_u32.map(|x| x as u64),
                    uncompressed_size: le_u32.map(|x| x as u64),
                }}
                .parse_next(i)
            }
        }
    }

    /// Serialize to on-disk bytes. The signature is always written; readers
    /// must accept its absence, writers have no reason to omit it.
    pub fn to_bytes(&self, is_zip64: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(24);
        out.extend_from_slice(Self::SIGNATURE.as_bytes());
        out.put_u32(self.crc32);
        if is_zip64 {
            out.put_u64(self.compressed_size);
            out.put_u64(self.uncompressed_size);
        } else {
            out.put_u32(self.compressed_size as u32);
            out.put_u32(self.uncompressed_size as u32);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_header_round_trips() {
        let header = LocalFileHeader {
            reader_version: Version::from(20),
            flags: 0x0800,
            method: Method::Deflate,
            modified: MsdosTimestamp {
                time: 0x7842,
                date: 0x4D71,
            },
            crc32: 0xCAFEBABE,
            compressed_size: 128,
            uncompressed_size: 1024,
            name: ZipString(b"hello.txt".to_vec()),
            extra: ZipBytes(vec![]),
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), 30 + 9);

        let mut input = Partial::new(&bytes[..]);
        let reparsed = LocalFileHeader::parser(&mut input).unwrap();
        assert_eq!(reparsed.flags, header.flags);
        assert_eq!(reparsed.method, header.method);
        assert_eq!(reparsed.crc32, header.crc32);
        assert_eq!(reparsed.compressed_size, header.compressed_size);
        assert_eq!(reparsed.name, header.name);
    }

    #[test]
    fn data_descriptor_round_trips_both_widths() {
        let record = DataDescriptorRecord {
            crc32: 0x12345678,
            compressed_size: 300,
            uncompressed_size: 700,
        };
        for is_zip64 in [false, true] {
            let bytes = record.to_bytes(is_zip64);
            assert_eq!(bytes.len(), if is_zip64 { 24 } else { 16 });
            let mut input = Partial::new(&bytes[..]);
            let reparsed = DataDescriptorRecord::mk_parser(is_zip64)(&mut input).unwrap();
            assert_eq!(reparsed.crc32, record.crc32);
            assert_eq!(reparsed.compressed_size, record.compressed_size);
            assert_eq!(reparsed.uncompressed_size, record.uncompressed_size);
        }
    }

    #[test]
    fn streaming_entry_decodes_utf8_flagged_names() {
        let header = LocalFileHeader {
            reader_version: Version::from(20),
            flags: 0x0800,
            method: Method::Store,
            modified: MsdosTimestamp { time: 0, date: 33 },
            crc32: 0,
            compressed_size: 0,
            uncompressed_size: 0,
            name: ZipString("日本語.txt".as_bytes().to_vec()),
            extra: ZipBytes(vec![]),
        };
        let entry = header.as_entry(&ReadOptions::default()).unwrap();
        assert_eq!(entry.name, "日本語.txt");
        assert_eq!(entry.name_source, NameSource::NameWithEfsFlag);
    }
}
