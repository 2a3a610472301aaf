use std::io;

use zipweld::{
    fsm::{EntryFsm, FsmResult},
    options::ReadOptions,
    parse::Entry,
};

/// Reads a single entry out of a random-access archive, decompressing on
/// demand and validating CRC-32 and sizes at the end.
///
/// The reader starts at the entry's local file header; the central-directory
/// metadata it was created from is the source of truth for sizes and method.
pub struct EntryReader<R>
where
    R: io::Read,
{
    rd: R,
    fsm: Option<EntryFsm>,
    compressed_bytes: u64,
    uncompressed_bytes: u64,
}

impl<R> EntryReader<R>
where
    R: io::Read,
{
    pub(crate) fn new(entry: Entry, rd: R, options: ReadOptions) -> Self {
        Self {
            rd,
            fsm: Some(EntryFsm::new(Some(entry), options)),
            compressed_bytes: 0,
            uncompressed_bytes: 0,
        }
    }

    /// Number of compressed bytes consumed so far.
    pub fn compressed_bytes(&self) -> u64 {
        self.compressed_bytes
    }

    /// Number of uncompressed bytes produced so far.
    pub fn uncompressed_bytes(&self) -> u64 {
        self.uncompressed_bytes
    }
}

impl<R> io::Read for EntryReader<R>
where
    R: io::Read,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut fsm = match self.fsm.take() {
                Some(fsm) => fsm,
                None => return Ok(0),
            };

            if fsm.wants_read() {
                tracing::trace!("fsm wants read");
                let n = self.rd.read(fsm.space())?;
                tracing::trace!("read {} bytes", n);
                fsm.fill(n);
            }

            match fsm.process(buf)? {
                FsmResult::Continue((fsm, outcome)) => {
                    self.compressed_bytes = fsm.compressed_bytes();
                    self.uncompressed_bytes = fsm.uncompressed_bytes();
                    self.fsm = Some(fsm);
                    if outcome.bytes_written > 0 {
                        return Ok(outcome.bytes_written);
                    }
                    if outcome.bytes_read == 0 {
                        // neither input consumed nor output produced: the
                        // machine needs another spin with fresh input
                        continue;
                    }
                    // read some bytes, hopefully will write some on the
                    // next loop
                }
                FsmResult::Done(_remain) => {
                    // validated: checksum and size matched
                    return Ok(0);
                }
            }
        }
    }
}
