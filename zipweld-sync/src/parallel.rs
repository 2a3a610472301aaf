//! Scatter/gather parallel archive assembly: worker threads compress entries
//! into per-worker temp-file backing stores, and a final single-threaded
//! pass stitches them into one archive through the raw-copy path.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;

use cfg_if::cfg_if;
use tracing::trace;
use zipweld::{
    error::Error,
    parse::{EntrySpec, Method},
};

use crate::writer::{ArchiveWriter, RawEntry, Sink};

/// Opens an entry's content on the worker thread that compresses it. The
/// supplier is handed over across threads but never shared.
pub type ContentSupplier =
    Box<dyn FnOnce() -> io::Result<Box<dyn Read + Send>> + Send + 'static>;

struct Job {
    spec: EntrySpec,
    supplier: ContentSupplier,
}

struct ScatterEntry {
    spec: EntrySpec,
    crc32: u32,
    compressed_size: u64,
    uncompressed_size: u64,
    offset: u64,
}

/// What one worker produced: its backing store (a temp file, deleted on
/// drop) and the entries it compressed, in the order it handled them.
struct WorkerOutput {
    store: Option<File>,
    entries: Vec<ScatterEntry>,
}

/// Compresses many entries in parallel, then writes them out through an
/// [ArchiveWriter].
///
/// Entries are emitted worker by worker, in the order each worker finished
/// them: callers that need a specific global order must partition their work
/// accordingly.
pub struct ParallelZipCreator {
    tx: Option<mpsc::Sender<Job>>,
    handles: Vec<JoinHandle<Result<WorkerOutput, Error>>>,
    cancelled: Arc<AtomicBool>,
}

impl ParallelZipCreator {
    /// Spin up one worker per available core, with temp files in the
    /// system's temp directory and compression level 6.
    pub fn new() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        Self::with_config(workers, std::env::temp_dir(), 6)
    }

    /// Spin up `workers` threads, with backing stores under `dir`.
    pub fn with_config(workers: usize, dir: PathBuf, compression_level: u32) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let cancelled = Arc::new(AtomicBool::new(false));

        let handles = (0..workers)
            .map(|_| {
                let rx = Arc::clone(&rx);
                let cancelled = Arc::clone(&cancelled);
                let dir = dir.clone();
                std::thread::spawn(move || worker_loop(rx, dir, compression_level, cancelled))
            })
            .collect();

        Self {
            tx: Some(tx),
            handles,
            cancelled,
        }
    }

    /// Enqueue one entry. The supplier runs on whichever worker picks the
    /// job up.
    pub fn add(&mut self, spec: EntrySpec, supplier: ContentSupplier) -> Result<(), Error> {
        let tx = self
            .tx
            .as_ref()
            .ok_or(Error::BadArgument("the creator was already written out"))?;
        tx.send(Job { spec, supplier })
            .map_err(|_| Error::BadArgument("all workers have stopped"))?;
        Ok(())
    }

    /// Wait for every in-flight job, then gather all backing stores into
    /// `writer`, entry metadata intact, via the raw-copy path.
    ///
    /// A failure in any job cancels the remaining queue and is re-raised
    /// here. Backing stores are freed no matter what.
    pub fn write_to<S: Sink>(mut self, writer: &mut ArchiveWriter<S>) -> Result<(), Error> {
        // no more jobs: workers drain the queue and exit
        drop(self.tx.take());

        let mut outputs = Vec::with_capacity(self.handles.len());
        let mut first_error: Option<Error> = None;
        for handle in self.handles.drain(..) {
            match handle.join() {
                Ok(Ok(output)) => outputs.push(output),
                Ok(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(_) => {
                    if first_error.is_none() {
                        first_error =
                            Some(Error::IO(io::Error::other("worker thread panicked")));
                    }
                }
            }
        }
        if let Some(error) = first_error {
            // dropping the outputs closes (and deletes) every temp file
            return Err(error);
        }

        for output in outputs {
            let Some(mut store) = output.store else {
                continue;
            };
            for entry in output.entries {
                trace!(
                    name = entry.spec.name(),
                    compressed = entry.compressed_size,
                    "gathering scattered entry"
                );
                store.seek(SeekFrom::Start(entry.offset))?;
                let raw = RawEntry {
                    spec: entry.spec,
                    crc32: entry.crc32,
                    compressed_size: entry.compressed_size,
                    uncompressed_size: entry.uncompressed_size,
                    flags: 0,
                };
                let reader = (&store).take(entry.compressed_size);
                writer.add_raw_entry(&raw, reader)?;
            }
        }
        Ok(())
    }
}

impl Default for ParallelZipCreator {
    fn default() -> Self {
        Self::new()
    }
}

fn worker_loop(
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    dir: PathBuf,
    compression_level: u32,
    cancelled: Arc<AtomicBool>,
) -> Result<WorkerOutput, Error> {
    let mut output = WorkerOutput {
        store: None,
        entries: Vec::new(),
    };
    let mut offset = 0u64;

    loop {
        if cancelled.load(Ordering::Relaxed) {
            return Ok(output);
        }
        let job = match rx.lock().expect("job queue poisoned").recv() {
            Ok(job) => job,
            // queue closed and drained
            Err(_) => return Ok(output),
        };

        // the backing store is created on first use
        if output.store.is_none() {
            output.store = Some(tempfile::tempfile_in(&dir)?);
        }
        let store = output.store.as_mut().expect("store was just created");

        match compress_job(store, job, compression_level, offset) {
            Ok(entry) => {
                offset += entry.compressed_size;
                output.entries.push(entry);
            }
            Err(e) => {
                // make the other workers stop picking up queued jobs
                cancelled.store(true, Ordering::Relaxed);
                return Err(e);
            }
        }
    }
}

fn compress_job(
    store: &mut File,
    job: Job,
    compression_level: u32,
    offset: u64,
) -> Result<ScatterEntry, Error> {
    cfg_if! {
        if #[cfg(feature = "deflate")] {
            let fallback = Method::Deflate;
        } else {
            let fallback = Method::Store;
        }
    }
    let mut spec = job.spec;
    let method = spec.method().unwrap_or(fallback);
    spec.set_method(method);

    let mut content = (job.supplier)()?;
    let mut hasher = crc32fast::Hasher::new();
    let mut uncompressed = 0u64;

    let compressed_size = match method {
        Method::Store => {
            let mut buf = [0u8; 64 * 1024];
            let mut written = 0u64;
            loop {
                let n = content.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                uncompressed += n as u64;
                store.write_all(&buf[..n])?;
                written += n as u64;
            }
            written
        }
        #[cfg(feature = "deflate")]
        Method::Deflate => {
            let mut encoder = flate2::write::DeflateEncoder::new(
                &mut *store,
                flate2::Compression::new(compression_level),
            );
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = content.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                uncompressed += n as u64;
                encoder.write_all(&buf[..n])?;
            }
            encoder.finish()?;
            store.seek(SeekFrom::End(0))? - offset
        }
        other => return Err(Error::method_not_supported(other)),
    };

    Ok(ScatterEntry {
        spec,
        crc32: hasher.finalize(),
        compressed_size,
        uncompressed_size: uncompressed,
        offset,
    })
}
