use tracing::trace;
use winnow::{
    binary::le_u16,
    error::{ContextError, ErrMode},
    Parser, Partial,
};
use zipweld::{
    error::{Error, FormatError},
    fsm::{ArchiveFsm, EntryFsm, EntryOutcome, FsmResult},
    options::ReadOptions,
    parse::{Archive, Entry, LocalFileHeader},
};

use crate::entry_reader::EntryReader;
use crate::streaming_entry_reader::StreamingEntryReader;
use crate::writer::RawEntry;
use std::{io::Read, ops::Deref};

/// A trait for reading something as a zip archive
///
/// See also [ReadZip].
pub trait ReadZipWithSize {
    /// The type of the file to read from.
    type File: HasCursor;

    /// Reads self as a zip archive.
    fn read_zip_with_size(&self, size: u64) -> Result<SyncArchive<'_, Self::File>, Error> {
        self.read_zip_with_size_and_options(size, ReadOptions::default())
    }

    /// Reads self as a zip archive, with explicit reader options.
    fn read_zip_with_size_and_options(
        &self,
        size: u64,
        options: ReadOptions,
    ) -> Result<SyncArchive<'_, Self::File>, Error>;
}

/// A trait for reading something as a zip archive when we can tell size from
/// self.
///
/// See also [ReadZipWithSize].
pub trait ReadZip {
    /// The type of the file to read from.
    type File: HasCursor;

    /// Reads self as a zip archive.
    fn read_zip(&self) -> Result<SyncArchive<'_, Self::File>, Error> {
        self.read_zip_with_options(ReadOptions::default())
    }

    /// Reads self as a zip archive, with explicit reader options.
    fn read_zip_with_options(
        &self,
        options: ReadOptions,
    ) -> Result<SyncArchive<'_, Self::File>, Error>;
}

impl<F> ReadZipWithSize for F
where
    F: HasCursor,
{
    type File = F;

    fn read_zip_with_size_and_options(
        &self,
        size: u64,
        options: ReadOptions,
    ) -> Result<SyncArchive<'_, F>, Error> {
        trace!(%size, "read_zip_with_size");
        let mut fsm = ArchiveFsm::with_options(size, options);
        loop {
            if let Some(offset) = fsm.wants_read() {
                match self.cursor_at(offset).read(fsm.space()) {
                    Ok(read_bytes) => {
                        trace!(%read_bytes, %offset, "read_zip_with_size: read");
                        if read_bytes == 0 {
                            return Err(Error::IO(std::io::ErrorKind::UnexpectedEof.into()));
                        }
                        fsm.fill(read_bytes);
                    }
                    Err(err) => return Err(Error::IO(err)),
                }
            }

            fsm = match fsm.process()? {
                FsmResult::Done(archive) => {
                    trace!("read_zip_with_size: done");
                    return Ok(SyncArchive {
                        file: self,
                        archive,
                        options,
                    });
                }
                FsmResult::Continue(fsm) => fsm,
            }
        }
    }
}

impl ReadZip for &[u8] {
    type File = Self;

    fn read_zip_with_options(
        &self,
        options: ReadOptions,
    ) -> Result<SyncArchive<'_, Self::File>, Error> {
        self.read_zip_with_size_and_options(self.len() as u64, options)
    }
}

impl ReadZip for Vec<u8> {
    type File = Self;

    fn read_zip_with_options(
        &self,
        options: ReadOptions,
    ) -> Result<SyncArchive<'_, Self::File>, Error> {
        self.read_zip_with_size_and_options(self.len() as u64, options)
    }
}

/// A zip archive, read synchronously from a file or other I/O resource.
///
/// This only contains metadata for the archive and its entries. Separate
/// readers can be created for arbitrary entries on-demand using
/// [SyncEntry::reader].
pub struct SyncArchive<'a, F>
where
    F: HasCursor,
{
    file: &'a F,
    archive: Archive,
    options: ReadOptions,
}

impl<F> Deref for SyncArchive<'_, F>
where
    F: HasCursor,
{
    type Target = Archive;

    fn deref(&self) -> &Self::Target {
        &self.archive
    }
}

impl<F> SyncArchive<'_, F>
where
    F: HasCursor,
{
    /// Iterate over all files in this zip, read from the central directory.
    pub fn entries(&self) -> impl Iterator<Item = SyncEntry<'_, F>> {
        self.archive.entries().map(move |entry| SyncEntry {
            file: self.file,
            entry,
            options: self.options,
        })
    }

    /// Iterate over all files sorted by the physical location of their data.
    pub fn entries_in_physical_order(&self) -> Vec<SyncEntry<'_, F>> {
        self.archive
            .entries_in_physical_order()
            .into_iter()
            .map(|entry| SyncEntry {
                file: self.file,
                entry,
                options: self.options,
            })
            .collect()
    }

    /// Attempts to look up an entry by name. This is usually a bad idea,
    /// as names aren't necessarily normalized in zip archives.
    pub fn by_name<N: AsRef<str>>(&self, name: N) -> Option<SyncEntry<'_, F>> {
        self.archive.by_name(name).map(|entry| SyncEntry {
            file: self.file,
            entry,
            options: self.options,
        })
    }
}

/// A zip entry, read synchronously from a file or other I/O resource.
pub struct SyncEntry<'a, F> {
    file: &'a F,
    entry: &'a Entry,
    options: ReadOptions,
}

impl<F> Deref for SyncEntry<'_, F> {
    type Target = Entry;

    fn deref(&self) -> &Self::Target {
        self.entry
    }
}

impl<'a, F> SyncEntry<'a, F>
where
    F: HasCursor,
{
    /// Returns a reader for the entry, decompressing on the fly and
    /// validating the CRC-32 at the end.
    pub fn reader(&self) -> EntryReader<F::Cursor<'a>> {
        EntryReader::new(
            self.entry.clone(),
            self.file.cursor_at(self.entry.header_offset),
            self.options,
        )
    }

    /// Reads the entire entry into a vector.
    pub fn bytes(&self) -> std::io::Result<Vec<u8>> {
        let mut v = Vec::new();
        self.reader().read_to_end(&mut v)?;
        Ok(v)
    }

    /// Resolve the offset of the entry's data by reading its local file
    /// header.
    pub fn data_offset(&self) -> Result<u64, Error> {
        let mut fixed = [0u8; LocalFileHeader::LENGTH];
        read_exact_at(self.file, self.entry.header_offset, &mut fixed)?;
        if &fixed[..4] != LocalFileHeader::SIGNATURE.as_bytes() {
            return Err(FormatError::InvalidLocalHeader.into());
        }
        let mut input = Partial::new(&fixed[26..30]);
        let (name_len, extra_len) = (le_u16, le_u16)
            .parse_next(&mut input)
            .map_err(|_: ErrMode<ContextError>| Error::from(FormatError::InvalidLocalHeader))?;
        Ok(self.entry.header_offset
            + LocalFileHeader::LENGTH as u64
            + name_len as u64
            + extra_len as u64)
    }

    /// Returns a reader over the entry's *compressed* bytes, without
    /// decompressing them. Pair it with [Self::raw_entry] to copy an entry
    /// verbatim into another archive via
    /// [crate::ArchiveWriter::add_raw_entry].
    pub fn raw_reader(&self) -> Result<impl Read + 'a, Error> {
        let data_offset = self.data_offset()?;
        Ok(self
            .file
            .cursor_at(data_offset)
            .take(self.entry.compressed_size))
    }

    /// The metadata needed to copy this entry verbatim into another archive.
    pub fn raw_entry(&self) -> RawEntry {
        RawEntry::from(self.entry)
    }
}

fn read_exact_at<F: HasCursor>(file: &F, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
    let mut cursor = file.cursor_at(offset);
    let mut filled = 0;
    while filled < buf.len() {
        let n = cursor.read(&mut buf[filled..])?;
        if n == 0 {
            return Err(FormatError::TruncatedArchive.into());
        }
        filled += n;
    }
    Ok(())
}

/// A sliceable I/O resource: we can ask for a [Read] at a given offset.
pub trait HasCursor {
    /// The type of [Read] returned by [HasCursor::cursor_at].
    type Cursor<'a>: Read + 'a
    where
        Self: 'a;

    /// Returns a [Read] at the given offset.
    fn cursor_at(&self, offset: u64) -> Self::Cursor<'_>;
}

impl HasCursor for &[u8] {
    type Cursor<'a> = &'a [u8]
    where
        Self: 'a;

    fn cursor_at(&self, offset: u64) -> Self::Cursor<'_> {
        &self[offset.try_into().unwrap()..]
    }
}

impl HasCursor for Vec<u8> {
    type Cursor<'a> = &'a [u8]
    where
        Self: 'a;

    fn cursor_at(&self, offset: u64) -> Self::Cursor<'_> {
        &self[offset.try_into().unwrap()..]
    }
}

#[cfg(feature = "file")]
impl HasCursor for std::fs::File {
    type Cursor<'a> = positioned_io::Cursor<&'a std::fs::File>
    where
        Self: 'a;

    fn cursor_at(&self, offset: u64) -> Self::Cursor<'_> {
        positioned_io::Cursor::new_pos(self, offset)
    }
}

#[cfg(feature = "file")]
impl ReadZip for std::fs::File {
    type File = Self;

    fn read_zip_with_options(&self, options: ReadOptions) -> Result<SyncArchive<'_, Self>, Error> {
        let size = self.metadata()?.len();
        self.read_zip_with_size_and_options(size, options)
    }
}

/// Allows reading zip entries in a streaming fashion, without seeking,
/// based only on local headers. THIS IS NOT RECOMMENDED, as correctly
/// reading zip files requires reading the central directory (located at
/// the end of the file).
///
/// Using local headers only involves a lot of guesswork and is only really
/// useful if you have some level of control over your input.
pub trait ReadZipStreaming<R>
where
    R: Read,
{
    /// Get the first zip entry from the stream as a [StreamingEntryReader],
    /// or `None` when the archive holds no entries at all.
    ///
    /// See [ReadZip] or [ReadZipWithSize] for the recommended path.
    fn stream_zip_entries(self) -> Result<Option<StreamingEntryReader<R>>, Error>
    where
        Self: Sized,
    {
        self.stream_zip_entries_with_options(ReadOptions::default())
    }

    /// Like [Self::stream_zip_entries], with explicit reader options.
    fn stream_zip_entries_with_options(
        self,
        options: ReadOptions,
    ) -> Result<Option<StreamingEntryReader<R>>, Error>;
}

impl<R> ReadZipStreaming<R> for R
where
    R: Read,
{
    fn stream_zip_entries_with_options(
        mut self,
        options: ReadOptions,
    ) -> Result<Option<StreamingEntryReader<Self>>, Error> {
        let mut fsm = EntryFsm::new(None, options).at_archive_start();

        loop {
            if fsm.wants_read() {
                let n = self.read(fsm.space())?;
                trace!("read {} bytes into buf for first zip entry", n);
                fsm.fill(n);
            }

            match fsm.process_till_header()? {
                Some(EntryOutcome::Entry) => {
                    let entry = fsm.entry().expect("entry was just parsed").clone();
                    return Ok(Some(StreamingEntryReader::new(fsm, entry, self, options)));
                }
                Some(EntryOutcome::EndOfEntries) => return Ok(None),
                None => {
                    // needs more input
                }
            }
        }
    }
}
