use std::io::{self, Read};

use zipweld::error::{Error, FormatError};

use crate::read_zip::{HasCursor, ReadZip, ReadZipWithSize, SyncArchive};
use zipweld::options::ReadOptions;

/// The marker at the start of the first segment of a split archive: the
/// data-descriptor signature, recycled by PKZIP for this purpose.
const SPLIT_SIGNATURE: &[u8] = b"PK\x07\x08";

/// A read-only logical concatenation of the segments of a split archive
/// (`archive.z01`, `archive.z02`, …, `archive.zip`).
///
/// The channel exposes the raw concatenated bytes, split marker included;
/// the 4 bytes of marker are absorbed by the reader's leading-padding
/// detection, so reading the channel as a zip archive yields the same
/// entries as reading the stripped concatenation of all segments.
///
/// There is no write access: split archives are assembled by
/// [SplitSink](crate::SplitSink), never edited in place.
#[derive(Debug)]
pub struct MultiSegmentChannel<F> {
    segments: Vec<F>,
    /// per-segment sizes and their running sums
    sizes: Vec<u64>,
    starts: Vec<u64>,
    total: u64,
}

impl<F> MultiSegmentChannel<F>
where
    F: HasCursor,
{
    /// Assemble a channel from segments (in disk order) and their sizes.
    ///
    /// Fails with [FormatError::NotASplitArchive] unless the first segment
    /// starts with the 4-byte split marker.
    pub fn new(segments: Vec<(F, u64)>) -> Result<Self, Error> {
        if segments.is_empty() {
            return Err(FormatError::NotASplitArchive.into());
        }

        let mut sig = [0u8; 4];
        {
            let mut cursor = segments[0].0.cursor_at(0);
            let mut filled = 0;
            while filled < sig.len() {
                let n = cursor.read(&mut sig[filled..])?;
                if n == 0 {
                    return Err(FormatError::NotASplitArchive.into());
                }
                filled += n;
            }
        }
        if sig != SPLIT_SIGNATURE {
            return Err(FormatError::NotASplitArchive.into());
        }

        let mut starts = Vec::with_capacity(segments.len());
        let mut sizes = Vec::with_capacity(segments.len());
        let mut total = 0u64;
        for (_, size) in &segments {
            starts.push(total);
            sizes.push(*size);
            total += size;
        }

        Ok(Self {
            segments: segments.into_iter().map(|(f, _)| f).collect(),
            sizes,
            starts,
            total,
        })
    }

    /// Total size: the sum of all segment sizes.
    pub fn size(&self) -> u64 {
        self.total
    }

    /// Number of segments.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Translate a (segment index, offset within segment) pair to an offset
    /// into the logical concatenation.
    pub fn global_offset(&self, segment: usize, offset: u64) -> Result<u64, Error> {
        let start = *self
            .starts
            .get(segment)
            .ok_or(Error::BadArgument("segment index out of range"))?;
        if offset > self.sizes[segment] {
            return Err(Error::BadArgument("offset past the end of the segment"));
        }
        Ok(start + offset)
    }

    /// Which segment holds the byte at `global`, and where inside it.
    fn locate(&self, global: u64) -> Option<(usize, u64)> {
        if global >= self.total {
            return None;
        }
        // segments are few, a linear scan beats a binary search in practice
        let idx = self
            .starts
            .iter()
            .rposition(|&start| start <= global)
            .expect("starts[0] is always 0");
        Some((idx, global - self.starts[idx]))
    }

}

#[cfg(feature = "file")]
impl MultiSegmentChannel<std::fs::File> {
    /// Open segment files from their paths, in disk order.
    pub fn open_paths<P: AsRef<std::path::Path>>(paths: &[P]) -> Result<Self, Error> {
        let mut segments = Vec::with_capacity(paths.len());
        for path in paths {
            let file = std::fs::File::open(path)?;
            let size = file.metadata()?.len();
            segments.push((file, size));
        }
        Self::new(segments)
    }
}

impl<F> HasCursor for MultiSegmentChannel<F>
where
    F: HasCursor,
{
    type Cursor<'a> = MultiSegmentCursor<'a, F>
    where
        Self: 'a;

    fn cursor_at(&self, offset: u64) -> Self::Cursor<'_> {
        MultiSegmentCursor {
            channel: self,
            global: offset,
        }
    }
}

impl<F> ReadZip for MultiSegmentChannel<F>
where
    F: HasCursor,
{
    type File = Self;

    fn read_zip_with_options(
        &self,
        options: ReadOptions,
    ) -> Result<SyncArchive<'_, Self::File>, Error> {
        self.read_zip_with_size_and_options(self.total, options)
    }
}

/// A cursor over the logical concatenation of segments; slides past each
/// segment's end transparently.
pub struct MultiSegmentCursor<'a, F> {
    channel: &'a MultiSegmentChannel<F>,
    global: u64,
}

impl<F> Read for MultiSegmentCursor<'_, F>
where
    F: HasCursor,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some((segment, rel)) = self.channel.locate(self.global) else {
            return Ok(0);
        };
        let left_in_segment = self.channel.sizes[segment] - rel;
        let want = buf.len().min(left_in_segment as usize);
        if want == 0 {
            return Ok(0);
        }

        let mut cursor = self.channel.segments[segment].cursor_at(rel);
        let n = cursor.read(&mut buf[..want])?;
        self.global += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segments_of(sizes: &[usize]) -> Vec<(Vec<u8>, u64)> {
        let mut byte = 0u8;
        let mut out = Vec::new();
        for (idx, &size) in sizes.iter().enumerate() {
            let mut data = Vec::with_capacity(size);
            if idx == 0 {
                data.extend_from_slice(SPLIT_SIGNATURE);
            }
            while data.len() < size {
                data.push(byte);
                byte = byte.wrapping_add(1);
            }
            out.push((data, size as u64));
        }
        out
    }

    #[test]
    fn rejects_segments_without_split_marker() {
        let err = MultiSegmentChannel::new(vec![(vec![0u8; 100], 100)]).unwrap_err();
        assert!(matches!(
            err,
            Error::Format(FormatError::NotASplitArchive)
        ));
    }

    #[test]
    fn positions_translate_via_prefix_sums() {
        let channel = MultiSegmentChannel::new(segments_of(&[100, 100, 57])).unwrap();
        assert_eq!(channel.size(), 257);
        assert_eq!(channel.global_offset(0, 0).unwrap(), 0);
        assert_eq!(channel.global_offset(2, 10).unwrap(), 210);
        assert!(channel.global_offset(3, 0).is_err());
        assert!(channel.global_offset(2, 100).is_err());
    }

    #[test]
    fn reads_across_segment_boundaries() {
        let segments = segments_of(&[100, 100, 57]);
        let mut flat: Vec<u8> = Vec::new();
        for (data, _) in &segments {
            flat.extend_from_slice(data);
        }

        let channel = MultiSegmentChannel::new(segments).unwrap();
        let mut cursor = channel.cursor_at(210);
        let mut buf = vec![0u8; 50];
        cursor.read_exact(&mut buf).unwrap();
        assert_eq!(buf, &flat[210..260]);

        // reading to the end stops exactly at the total size
        let mut cursor = channel.cursor_at(0);
        let mut all = Vec::new();
        cursor.read_to_end(&mut all).unwrap();
        assert_eq!(all, flat);
    }
}
