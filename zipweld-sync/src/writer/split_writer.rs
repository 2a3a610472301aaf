use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;

use tracing::trace;
use zipweld::error::Error;

use super::Sink;

/// The marker written at the very start of the first segment.
const SPLIT_SIGNATURE: &[u8] = b"PK\x07\x08";

/// A [Sink] that rolls over to numbered segments (`archive.z01`,
/// `archive.z02`, …) once a segment reaches the configured size; the final
/// segment keeps the `.zip` name.
///
/// The segment being filled always lives at the target path; on rollover it
/// is renamed to its `.zNN` name and a fresh file takes its place. The
/// logical position excludes the 4-byte split marker, so header offsets stay
/// valid for the concatenation of all segments.
pub struct SplitSink {
    path: PathBuf,
    split_size: u64,
    current: File,
    disk: u32,
    bytes_on_disk: u64,
    logical: u64,
}

impl SplitSink {
    /// Smallest allowed segment size, 64 KiB.
    pub const MIN_SPLIT_SIZE: u64 = 64 * 1024;

    /// Largest allowed segment size.
    pub const MAX_SPLIT_SIZE: u64 = u32::MAX as u64;

    /// Create a split archive at `path` (the final `.zip`), rolling over
    /// every `split_size` bytes.
    pub fn create(path: impl Into<PathBuf>, split_size: u64) -> Result<Self, Error> {
        if !(Self::MIN_SPLIT_SIZE..=Self::MAX_SPLIT_SIZE).contains(&split_size) {
            return Err(Error::BadArgument(
                "split size must be between 64 KiB and 4 GiB - 1",
            ));
        }
        let path = path.into();
        let mut current = File::create(&path)?;
        current.write_all(SPLIT_SIGNATURE)?;
        Ok(Self {
            path,
            split_size,
            current,
            disk: 0,
            bytes_on_disk: SPLIT_SIGNATURE.len() as u64,
            logical: 0,
        })
    }

    fn segment_path(&self, disk: u32) -> PathBuf {
        // pkzip numbers segments from 1
        self.path.with_extension(format!("z{:02}", disk + 1))
    }

    fn rollover(&mut self) -> io::Result<()> {
        self.current.flush()?;
        let segment = self.segment_path(self.disk);
        trace!(?segment, "split rollover");
        std::fs::rename(&self.path, &segment)?;
        self.current = File::create(&self.path)?;
        self.disk += 1;
        self.bytes_on_disk = 0;
        Ok(())
    }

    fn room_on_disk(&self) -> u64 {
        self.split_size - self.bytes_on_disk
    }
}

impl Write for SplitSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut written = 0;
        let mut rest = buf;
        while !rest.is_empty() {
            if self.room_on_disk() == 0 {
                self.rollover()?;
            }
            let take = rest.len().min(self.room_on_disk() as usize);
            self.current.write_all(&rest[..take])?;
            self.bytes_on_disk += take as u64;
            self.logical += take as u64;
            written += take;
            rest = &rest[take..];
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.current.flush()
    }
}

impl Sink for SplitSink {
    fn position(&self) -> u64 {
        self.logical
    }

    fn disk(&self) -> u32 {
        self.disk
    }

    fn reserve(&mut self, len: u64) -> io::Result<()> {
        if len > self.split_size {
            return Err(io::Error::other(
                "record group larger than the split size",
            ));
        }
        if self.room_on_disk() < len {
            self.rollover()?;
        }
        Ok(())
    }
}
