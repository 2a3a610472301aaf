use oval::Buffer;
use std::io::{self, Read};
use tracing::trace;
use zipweld::{
    error::Error,
    fsm::{EntryFsm, EntryOutcome, FsmResult},
    options::ReadOptions,
    parse::Entry,
};

/// Reads a zip entry based on a local header. Some information is missing
/// (sizes and checksum of entries that use data descriptors are only known
/// after the body was read), and only by reading an entry in its entirety
/// can you move on to the next one.
///
/// However, it only requires an [io::Read], and does not need to seek.
pub struct StreamingEntryReader<R> {
    entry: Entry,
    rd: R,
    options: ReadOptions,
    state: State,
}

impl<R> std::fmt::Debug for StreamingEntryReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingEntryReader").finish_non_exhaustive()
    }
}

#[derive(Default)]
#[allow(clippy::large_enum_variant)]
enum State {
    Reading {
        fsm: EntryFsm,
    },
    Finished {
        /// remaining buffer for the next entry
        remain: Buffer,
    },
    #[default]
    Transition,
}

impl<R> StreamingEntryReader<R>
where
    R: io::Read,
{
    pub(crate) fn new(fsm: EntryFsm, entry: Entry, rd: R, options: ReadOptions) -> Self {
        Self {
            entry,
            rd,
            options,
            state: State::Reading { fsm },
        }
    }

    /// Entry metadata, as read from the local file header. For entries with
    /// a data descriptor, sizes and checksum start out unknown (zero).
    #[inline(always)]
    pub fn entry(&self) -> &Entry {
        &self.entry
    }
}

impl<R> io::Read for StreamingEntryReader<R>
where
    R: io::Read,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        trace!("reading from streaming entry reader");

        match std::mem::take(&mut self.state) {
            State::Reading { mut fsm } => {
                if fsm.wants_read() {
                    trace!("fsm wants read");
                    let n = self.rd.read(fsm.space())?;
                    trace!("giving fsm {} bytes from rd", n);
                    fsm.fill(n);
                }

                match fsm.process(buf)? {
                    FsmResult::Continue((fsm, outcome)) => {
                        self.state = State::Reading { fsm };

                        if outcome.bytes_written > 0 {
                            Ok(outcome.bytes_written)
                        } else {
                            // loop, it happens
                            self.read(buf)
                        }
                    }
                    FsmResult::Done(remain) => {
                        self.state = State::Finished { remain };

                        // neat!
                        Ok(0)
                    }
                }
            }
            State::Finished { remain } => {
                // reading past the end is a permanent EOF
                self.state = State::Finished { remain };
                Ok(0)
            }
            State::Transition => unreachable!(),
        }
    }
}

impl<R> StreamingEntryReader<R>
where
    R: io::Read,
{
    /// Finish reading this entry (draining any unread body) and return the
    /// next streaming entry reader, if any.
    ///
    /// If this returns `None`, there are no entries left.
    pub fn finish(mut self) -> Result<Option<StreamingEntryReader<R>>, Error> {
        trace!("finishing streaming entry reader");

        if let State::Reading { fsm } = &mut self.state {
            // when the compressed size is known, the rest of the body is
            // skipped over instead of being decompressed
            fsm.request_skip();
        }

        while matches!(self.state, State::Reading { .. }) {
            let mut scratch = [0u8; 16 * 1024];
            if self.read(&mut scratch)? == 0 && matches!(self.state, State::Reading { .. }) {
                // read() only returns 0 while Reading when transitioning
                // states; a second 0 in a row means a stuck stream
                return Err(Error::IO(io::ErrorKind::UnexpectedEof.into()));
            }
        }

        match self.state {
            State::Reading { .. } => unreachable!(),
            State::Finished { remain } => {
                // parse the next entry, if any
                let mut fsm = EntryFsm::with_buffer(None, remain, self.options);

                loop {
                    if fsm.wants_read() {
                        let n = self.rd.read(fsm.space())?;
                        trace!("read {} bytes into buf for next zip entry", n);
                        fsm.fill(n);
                    }

                    match fsm.process_till_header()? {
                        Some(EntryOutcome::Entry) => {
                            let entry = fsm.entry().expect("entry was just parsed").clone();
                            return Ok(Some(StreamingEntryReader::new(
                                fsm,
                                entry,
                                self.rd,
                                self.options,
                            )));
                        }
                        Some(EntryOutcome::EndOfEntries) => return Ok(None),
                        None => {
                            // needs more turns
                        }
                    }
                }
            }
            State::Transition => unreachable!(),
        }
    }
}
