use tracing::trace;
use winnow::{
    binary::{le_u16, le_u32, le_u64, length_take},
    seq,
    token::tag,
    PResult, Parser, Partial,
};

use crate::error::{Error, FormatError};

use super::raw::PutLe;

/// 4.3.16  End of central directory record:
#[derive(Debug, Clone)]
pub struct EndOfCentralDirectoryRecord {
    /// number of this disk
    pub disk_nbr: u16,

    /// number of the disk with the start of the central directory
    pub dir_disk_nbr: u16,

    /// total number of entries in the central directory on this disk
    pub dir_records_this_disk: u16,

    /// total number of entries in the central directory
    pub directory_records: u16,

    /// size of the central directory
    pub directory_size: u32,

    /// offset of start of central directory with respect to the starting disk number
    pub directory_offset: u32,

    /// .ZIP file comment
    pub comment: Vec<u8>,
}

impl EndOfCentralDirectoryRecord {
    /// Does not include comment size & comment data
    pub const MIN_LENGTH: usize = 20;
    /// Signature for the end of central directory record
    pub const SIGNATURE: &'static str = "PK\x05\x06";

    /// Find the end of central directory record in a block of data
    pub fn find_in_block(b: &[u8]) -> Option<Located<Self>> {
        for i in (0..(b.len().saturating_sub(Self::MIN_LENGTH + 1))).rev() {
            let mut input = Partial::new(&b[i..]);
            if let Ok(directory) = Self::parser.parse_next(&mut input) {
                return Some(Located {
                    offset: i as u64,
                    inner: directory,
                });
            }
        }
        None
    }

    /// Parser for the end of central directory record
    pub fn parser(i: &mut Partial<&'_ [u8]>) -> PResult<Self> {
        let _ = tag(Self::SIGNATURE).parse_next(i)?;
        seq! {Self {
            disk_nbr: le_u16,
            dir_disk_nbr: le_u16,
            dir_records_this_disk: le_u16,
            directory_records: le_u16,
            directory_size: le_u32,
            directory_offset: le_u32,
            comment: length_take(le_u16).map(|s: &[u8]| s.to_vec()),
        }}
        .parse_next(i)
    }

    /// Serialize to on-disk bytes, including the signature.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(22 + self.comment.len());
        out.extend_from_slice(Self::SIGNATURE.as_bytes());
        out.put_u16(self.disk_nbr);
        out.put_u16(self.dir_disk_nbr);
        out.put_u16(self.dir_records_this_disk);
        out.put_u16(self.directory_records);
        out.put_u32(self.directory_size);
        out.put_u32(self.directory_offset);
        out.put_u16(self.comment.len() as u16);
        out.extend_from_slice(&self.comment);
        out
    }
}

/// 4.3.15 Zip64 end of central directory locator
#[derive(Debug, Clone, Copy)]
pub struct EndOfCentralDirectory64Locator {
    /// number of the disk with the start of the zip64 end of central directory
    pub dir_disk_number: u32,
    /// relative offset of the zip64 end of central directory record
    pub directory_offset: u64,
    /// total number of disks
    pub total_disks: u32,
}

impl EndOfCentralDirectory64Locator {
    /// Length of the locator
    pub const LENGTH: usize = 20;
    /// Signature for the zip64 end of central directory locator
    pub const SIGNATURE: &'static str = "PK\x06\x07";

    /// Parser for the zip64 end of central directory locator
    pub fn parser(i: &mut Partial<&'_ [u8]>) -> PResult<Self> {
        _ = tag(Self::SIGNATURE).parse_next(i)?;
        seq! {Self {
            dir_disk_number: le_u32,
            directory_offset: le_u64,
            total_disks: le_u32,
        }}
        .parse_next(i)
    }

    /// Serialize to on-disk bytes, including the signature.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LENGTH);
        out.extend_from_slice(Self::SIGNATURE.as_bytes());
        out.put_u32(self.dir_disk_number);
        out.put_u64(self.directory_offset);
        out.put_u32(self.total_disks);
        out
    }
}

/// 4.3.14  Zip64 end of central directory record
#[derive(Debug, Clone)]
pub struct EndOfCentralDirectory64Record {
    /// size of zip64 end of central directory record
    pub record_size: u64,

    /// version made by
    pub creator_version: u16,

    /// version needed to extract
    pub reader_version: u16,

    /// number of this disk
    pub disk_nbr: u32,

    /// number of the disk with the start of the central directory
    pub dir_disk_nbr: u32,

    /// total number of entries in the central directory on this disk
    pub dir_records_this_disk: u64,

    /// total number of entries in the central directory
    pub directory_records: u64,

    /// size of the central directory
    pub directory_size: u64,

    /// offset of the start of central directory with respect to the
    /// starting disk number
    pub directory_offset: u64,
}

impl EndOfCentralDirectory64Record {
    /// Signature for the zip64 end of central directory record
    pub const SIGNATURE: &'static str = "PK\x06\x06";

    /// Size of the fixed portion, including the signature
    pub const LENGTH: usize = 56;

    /// Parser for the zip64 end of central directory record
    pub fn parser(i: &mut Partial<&'_ [u8]>) -> PResult<Self> {
        _ = tag(Self::SIGNATURE).parse_next(i)?;
        seq! {Self {
            record_size: le_u64,
            creator_version: le_u16,
            reader_version: le_u16,
            disk_nbr: le_u32,
            dir_disk_nbr: le_u32,
            dir_records_this_disk: le_u64,
            directory_records: le_u64,
            directory_size: le_u64,
            directory_offset: le_u64,
        }}
        .parse_next(i)
    }

    /// Serialize to on-disk bytes, including the signature.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LENGTH);
        out.extend_from_slice(Self::SIGNATURE.as_bytes());
        // the record size counts everything after itself; with no
        // extensible data sector that's a fixed 44 bytes
        out.put_u64(44);
        out.put_u16(self.creator_version);
        out.put_u16(self.reader_version);
        out.put_u32(self.disk_nbr);
        out.put_u32(self.dir_disk_nbr);
        out.put_u64(self.dir_records_this_disk);
        out.put_u64(self.directory_records);
        out.put_u64(self.directory_size);
        out.put_u64(self.directory_offset);
        out
    }
}

/// A zip structure and its location in the input file
#[derive(Debug, Clone)]
pub struct Located<T> {
    /// Absolute byte offset from the start of the file
    pub offset: u64,

    /// The structure itself
    pub inner: T,
}

/// Coalesces zip and zip64 "end of central directory" record info
pub struct EndOfCentralDirectory {
    /// The end of central directory record
    pub dir: Located<EndOfCentralDirectoryRecord>,

    /// The zip64 end of central directory record
    pub dir64: Option<Located<EndOfCentralDirectory64Record>>,

    /// Zip files may be prepended by arbitrary data, this is how much
    /// data is at the beginning of the file that isn't part of the zip
    pub global_offset: i64,
}

impl EndOfCentralDirectory {
    pub(crate) fn new(
        size: u64,
        dir: Located<EndOfCentralDirectoryRecord>,
        dir64: Option<Located<EndOfCentralDirectory64Record>>,
    ) -> Result<Self, Error> {
        let mut res = Self {
            dir,
            dir64,
            global_offset: 0,
        };

        //
        // Pure .zip files look like this:
        // ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
        //                     <------directory_size----->
        // [ Data 1 ][ Data 2 ][    Central directory    ][ ??? ]
        // ^                   ^                          ^
        // 0                   directory_offset           directory_end_offset
        // ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
        //
        // But there exist some valid zip archives with padding at the beginning, like so:
        // ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
        // <--global_offset->                    <------directory_size----->
        // [    Padding     ][ Data 1 ][ Data 2 ][    Central directory    ][ ??? ]
        // ^                 ^                   ^                         ^
        // 0                 global_offset       computed_directory_offset directory_end_offset
        // ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
        //
        // (e.g. self-extracting archives are ELF or PE binaries with a .zip
        // appended; split archives start with a 4-byte marker)
        //
        // `directory_end_offset` is found by scanning the file (so it accounts for padding), but
        // `directory_offset` is found by reading a data structure (so it does not account for padding).
        // If we just trusted `directory_offset`, we'd be reading the central directory at the wrong place:
        // ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
        //                                       <------directory_size----->
        // [    Padding     ][ Data 1 ][ Data 2 ][    Central directory    ][ ??? ]
        // ^                   ^                                           ^
        // 0                   directory_offset - woops!                   directory_end_offset
        // ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~

        let computed_directory_offset = res
            .located_directory_offset()
            .checked_sub(res.directory_size())
            .ok_or(FormatError::DirectoryOffsetPointsOutsideFile)?;

        // did we find a valid offset?
        if (0..size).contains(&computed_directory_offset) {
            // that's different from the recorded one?
            if computed_directory_offset != res.directory_offset() {
                // then assume the whole file is offset
                res.global_offset =
                    computed_directory_offset as i64 - res.directory_offset() as i64;
                res.set_directory_offset(computed_directory_offset);
            }
        }

        // make sure directory_offset points to somewhere in our file
        trace!(
            "directory offset = {}, valid range = 0..{}",
            res.directory_offset(),
            size
        );
        if !(0..size).contains(&res.directory_offset()) {
            return Err(FormatError::DirectoryOffsetPointsOutsideFile.into());
        }

        Ok(res)
    }

    #[inline]
    pub(crate) fn located_directory_offset(&self) -> u64 {
        match self.dir64.as_ref() {
            Some(d64) => d64.offset,
            None => self.dir.offset,
        }
    }

    #[inline]
    pub(crate) fn directory_offset(&self) -> u64 {
        match self.dir64.as_ref() {
            Some(d64) => d64.inner.directory_offset,
            None => self.dir.inner.directory_offset as u64,
        }
    }

    #[inline]
    pub(crate) fn directory_size(&self) -> u64 {
        match self.dir64.as_ref() {
            Some(d64) => d64.inner.directory_size,
            None => self.dir.inner.directory_size as u64,
        }
    }

    #[inline]
    pub(crate) fn set_directory_offset(&mut self, offset: u64) {
        match self.dir64.as_mut() {
            Some(d64) => d64.inner.directory_offset = offset,
            None => self.dir.inner.directory_offset = offset as u32,
        };
    }

    #[inline]
    pub(crate) fn directory_records(&self) -> u64 {
        match self.dir64.as_ref() {
            Some(d64) => d64.inner.directory_records,
            None => self.dir.inner.directory_records as u64,
        }
    }

    #[inline]
    pub(crate) fn comment(&self) -> &[u8] {
        &self.dir.inner.comment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eocd_round_trips() {
        let record = EndOfCentralDirectoryRecord {
            disk_nbr: 0,
            dir_disk_nbr: 0,
            dir_records_this_disk: 3,
            directory_records: 3,
            directory_size: 150,
            directory_offset: 1000,
            comment: b"with comment".to_vec(),
        };
        let bytes = record.to_bytes();
        let mut input = Partial::new(&bytes[..]);
        let reparsed = EndOfCentralDirectoryRecord::parser(&mut input).unwrap();
        assert_eq!(reparsed.directory_records, 3);
        assert_eq!(reparsed.directory_offset, 1000);
        assert_eq!(reparsed.comment, record.comment);
    }

    #[test]
    fn find_in_block_scans_backwards() {
        let record = EndOfCentralDirectoryRecord {
            disk_nbr: 0,
            dir_disk_nbr: 0,
            dir_records_this_disk: 0,
            directory_records: 0,
            directory_size: 0,
            directory_offset: 0,
            comment: vec![],
        };
        let mut block = vec![0xAA; 37];
        block.extend_from_slice(&record.to_bytes());
        block.extend_from_slice(&[0u8; 40]);

        let located = EndOfCentralDirectoryRecord::find_in_block(&block).unwrap();
        assert_eq!(located.offset, 37);
    }

    #[test]
    fn eocd64_round_trips() {
        let record = EndOfCentralDirectory64Record {
            record_size: 44,
            creator_version: 45,
            reader_version: 45,
            disk_nbr: 0,
            dir_disk_nbr: 0,
            dir_records_this_disk: 70000,
            directory_records: 70000,
            directory_size: 0x1_0000_0000,
            directory_offset: 0x2_0000_0000,
        };
        let bytes = record.to_bytes();
        assert_eq!(bytes.len(), EndOfCentralDirectory64Record::LENGTH);
        let mut input = Partial::new(&bytes[..]);
        let reparsed = EndOfCentralDirectory64Record::parser(&mut input).unwrap();
        assert_eq!(reparsed.directory_records, 70000);
        assert_eq!(reparsed.directory_offset, 0x2_0000_0000);
    }

    #[test]
    fn locator_round_trips() {
        let locator = EndOfCentralDirectory64Locator {
            dir_disk_number: 0,
            directory_offset: 12345,
            total_disks: 1,
        };
        let bytes = locator.to_bytes();
        assert_eq!(bytes.len(), EndOfCentralDirectory64Locator::LENGTH);
        let mut input = Partial::new(&bytes[..]);
        let reparsed = EndOfCentralDirectory64Locator::parser(&mut input).unwrap();
        assert_eq!(reparsed.directory_offset, 12345);
    }
}
