use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Instant;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::chunk::{build_chunks, Chunk};
use crate::config::EngineConfig;
use crate::error::{CoreError, CoreResult};
use crate::net::{map_read_error, FetchRequest, NetClient};
use crate::rate::RateEstimator;
use crate::record::{now_millis, progress_percent};

const STOP_NONE: u8 = 0;
const STOP_PAUSED: u8 = 1;
const STOP_CANCELED: u8 = 2;
const STOP_FAILED: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Paused,
    Cancelled,
    Failed,
}

/// Cooperative stop flag shared between the scheduler and one engine run.
#[derive(Debug, Clone, Default)]
pub struct TransferControl {
    state: Arc<AtomicU8>,
}

impl TransferControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a pause. Returns false if the run is already stopping.
    pub fn pause(&self) -> bool {
        self.state
            .compare_exchange(STOP_NONE, STOP_PAUSED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Cancel wins over any earlier pause or failure.
    ///
    /// Workers check the flag between reads. A read that is stalled on the
    /// network keeps its worker and temp files until the request timeout
    /// fires.
    pub fn cancel(&self) {
        self.state.store(STOP_CANCELED, Ordering::SeqCst);
    }

    fn fail(&self) -> bool {
        self.state
            .compare_exchange(STOP_NONE, STOP_FAILED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn same_run(&self, other: &TransferControl) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    pub fn is_stopped(&self) -> bool {
        self.state.load(Ordering::SeqCst) != STOP_NONE
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        match self.state.load(Ordering::SeqCst) {
            STOP_PAUSED => Some(StopReason::Paused),
            STOP_CANCELED => Some(StopReason::Cancelled),
            STOP_FAILED => Some(StopReason::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferProgress {
    pub received_bytes: u64,
    /// Zero while the size is unknown.
    pub total_bytes: u64,
    pub speed_bytes_per_sec: f64,
    pub eta_seconds: f64,
}

impl TransferProgress {
    pub fn percent(&self) -> f64 {
        progress_percent(self.received_bytes, self.total_bytes)
    }
}

pub trait TransferObserver: Sync {
    fn on_progress(&self, progress: &TransferProgress);
}

impl<F> TransferObserver for F
where
    F: Fn(&TransferProgress) + Sync,
{
    fn on_progress(&self, progress: &TransferProgress) {
        self(progress)
    }
}

#[derive(Debug)]
pub enum TransferOutcome {
    Completed { total_bytes: u64 },
    Paused,
    Cancelled,
    Failed(CoreError),
}

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub url: String,
    pub destination: PathBuf,
    pub connections: u32,
}

/// Downloads one resource, in parallel byte ranges when the server allows it.
pub struct ChunkedTransfer {
    net: Arc<dyn NetClient>,
    config: EngineConfig,
    request: TransferRequest,
    control: TransferControl,
}

impl ChunkedTransfer {
    pub fn new(
        net: Arc<dyn NetClient>,
        config: EngineConfig,
        request: TransferRequest,
        control: TransferControl,
    ) -> Self {
        Self {
            net,
            config,
            request,
            control,
        }
    }

    pub fn control(&self) -> TransferControl {
        self.control.clone()
    }

    /// `observer` sees zero or more progress reports; the returned outcome is
    /// the only terminal signal.
    pub fn run(&self, observer: &dyn TransferObserver) -> TransferOutcome {
        let result = match self.probe() {
            Some(total) => self.run_chunked(total, observer),
            None => self.run_single(observer),
        };

        match (result, self.control.stop_reason()) {
            (Ok(Some(total_bytes)), _) => {
                info!(url = %self.request.url, total_bytes, "transfer complete");
                TransferOutcome::Completed { total_bytes }
            }
            (_, Some(StopReason::Paused)) => {
                info!(url = %self.request.url, "transfer paused");
                TransferOutcome::Paused
            }
            (_, Some(StopReason::Cancelled)) => {
                info!(url = %self.request.url, "transfer cancelled");
                TransferOutcome::Cancelled
            }
            (Err(err), _) => {
                error!(url = %self.request.url, %err, "transfer failed");
                TransferOutcome::Failed(err)
            }
            (Ok(None), _) => TransferOutcome::Failed(CoreError::Transfer(
                "transfer stopped without a reason".to_string(),
            )),
        }
    }

    fn probe(&self) -> Option<u64> {
        match self.net.head(&FetchRequest::new(self.request.url.as_str())) {
            Ok(resp) if resp.is_success() && resp.accept_ranges => match resp.total_bytes {
                Some(total) if total > 0 => Some(total),
                _ => {
                    debug!(url = %self.request.url, "size unknown, using single stream");
                    None
                }
            },
            Ok(resp) => {
                debug!(
                    url = %self.request.url,
                    status = resp.status_code,
                    accept_ranges = resp.accept_ranges,
                    "range requests unavailable, using single stream"
                );
                None
            }
            Err(err) => {
                warn!(url = %self.request.url, %err, "capability probe failed, using single stream");
                None
            }
        }
    }

    fn run_chunked(&self, total: u64, observer: &dyn TransferObserver) -> CoreResult<Option<u64>> {
        let temp_dir = self.temp_dir();
        fs::create_dir_all(&temp_dir)
            .map_err(|err| CoreError::Io(format!("{}: {}", temp_dir.display(), err)))?;
        let chunks = build_chunks(total, self.request.connections, &temp_dir);
        info!(
            url = %self.request.url,
            total_bytes = total,
            chunks = chunks.len(),
            "starting chunked transfer"
        );

        let result = self
            .fetch_chunks(&chunks, total, observer)
            .and_then(|fetched| {
                if fetched {
                    self.merge_chunks(&chunks, total)
                } else {
                    Ok(false)
                }
            })
            .map(|merged| merged.then_some(total));
        remove_temp_dir(&temp_dir);
        result
    }

    /// Returns false when the run was stopped before every chunk finished.
    fn fetch_chunks(
        &self,
        chunks: &[Chunk],
        total: u64,
        observer: &dyn TransferObserver,
    ) -> CoreResult<bool> {
        let counters: Vec<AtomicU64> = chunks.iter().map(|_| AtomicU64::new(0)).collect();
        let first_error: Mutex<Option<CoreError>> = Mutex::new(None);

        thread::scope(|scope| {
            let (done_tx, done_rx) = mpsc::channel::<()>();
            let counters_ref = &counters;
            scope.spawn(move || {
                self.report_progress(
                    done_rx,
                    total,
                    || counters_ref.iter().map(|c| c.load(Ordering::SeqCst)).sum(),
                    observer,
                )
            });

            let workers: Vec<_> = chunks
                .iter()
                .zip(counters.iter())
                .map(|(chunk, counter)| {
                    let first_error = &first_error;
                    scope.spawn(move || {
                        if let Err(err) = self.fetch_chunk(chunk, counter) {
                            self.record_failure(first_error, chunk.index, err);
                        }
                    })
                })
                .collect();

            for (index, worker) in workers.into_iter().enumerate() {
                if worker.join().is_err() {
                    self.record_failure(
                        &first_error,
                        index,
                        CoreError::Transfer(format!("chunk {} worker panicked", index)),
                    );
                }
            }
            drop(done_tx);
        });

        if let Some(err) = first_error.into_inner().ok().flatten() {
            return Err(err);
        }
        Ok(!self.control.is_stopped())
    }

    fn record_failure(&self, slot: &Mutex<Option<CoreError>>, index: usize, err: CoreError) {
        if self.control.fail() {
            warn!(url = %self.request.url, chunk = index, %err, "chunk failed, aborting transfer");
        }
        if let Ok(mut slot) = slot.lock() {
            if slot.is_none() {
                *slot = Some(err);
            }
        }
    }

    fn fetch_chunk(&self, chunk: &Chunk, counter: &AtomicU64) -> CoreResult<()> {
        let attempts = self.config.chunk_attempts.max(1);
        let mut last_error: Option<CoreError> = None;

        for attempt in 1..=attempts {
            if self.control.is_stopped() {
                return Ok(());
            }
            let written = counter.load(Ordering::SeqCst);
            if written >= chunk.len() {
                return Ok(());
            }
            match self.fetch_chunk_once(chunk, counter, written) {
                Ok(()) => return Ok(()),
                Err(_) if self.control.is_stopped() => return Ok(()),
                Err(err) => {
                    debug!(chunk = chunk.index, attempt, %err, "chunk attempt failed");
                    last_error = Some(err);
                    if attempt < attempts {
                        thread::sleep(self.config.retry_backoff);
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| CoreError::Transfer(format!("chunk {} failed", chunk.index))))
    }

    /// One ranged request, continuing after the `written` bytes already on disk.
    fn fetch_chunk_once(&self, chunk: &Chunk, counter: &AtomicU64, written: u64) -> CoreResult<()> {
        let start = chunk.start + written;
        let req = FetchRequest::ranged(self.request.url.as_str(), start, chunk.end);
        let resp = self.net.get(&req)?;
        if resp.status_code != 206 {
            let context = format!("chunk {} bytes {}-{}", chunk.index, start, chunk.end);
            return Err(if resp.is_success() {
                CoreError::Transfer(format!(
                    "{}: range request answered with status {}",
                    context, resp.status_code
                ))
            } else {
                CoreError::HttpStatus {
                    status: resp.status_code,
                    context,
                }
            });
        }

        let mut file = if written == 0 {
            File::create(&chunk.temp_path)
        } else {
            OpenOptions::new().append(true).open(&chunk.temp_path)
        }
        .map_err(|err| CoreError::Io(format!("{}: {}", chunk.temp_path.display(), err)))?;

        let remaining = chunk.len() - written;
        let mut body = resp.body.take(remaining);
        let copied = copy_until_stopped(
            &mut body,
            &mut file,
            self.config.buffer_size,
            &self.control,
            map_read_error,
            |bytes| {
                counter.fetch_add(bytes, Ordering::SeqCst);
            },
        )?;

        if self.control.is_stopped() {
            return Ok(());
        }
        if copied < remaining {
            return Err(CoreError::Transfer(format!(
                "chunk {} ended after {} of {} bytes",
                chunk.index,
                written + copied,
                chunk.len()
            )));
        }
        Ok(())
    }

    /// Concatenates chunk files in index order. Returns false if stopped midway.
    fn merge_chunks(&self, chunks: &[Chunk], total: u64) -> CoreResult<bool> {
        let dest = &self.request.destination;
        ensure_parent(dest)?;

        let merge = || -> CoreResult<bool> {
            let file = File::create(dest)
                .map_err(|err| CoreError::Io(format!("{}: {}", dest.display(), err)))?;
            let mut writer = BufWriter::with_capacity(self.config.buffer_size, file);
            let mut merged = 0u64;
            for chunk in chunks {
                if self.control.is_stopped() {
                    return Ok(false);
                }
                let mut reader = File::open(&chunk.temp_path).map_err(|err| {
                    CoreError::Io(format!("{}: {}", chunk.temp_path.display(), err))
                })?;
                merged += copy_until_stopped(
                    &mut reader,
                    &mut writer,
                    self.config.buffer_size,
                    &self.control,
                    |err| CoreError::Io(err.to_string()),
                    |_| {},
                )?;
            }
            if self.control.is_stopped() {
                return Ok(false);
            }
            writer
                .flush()
                .map_err(|err| CoreError::Io(format!("{}: {}", dest.display(), err)))?;
            if merged != total {
                return Err(CoreError::Transfer(format!(
                    "merged {} of {} bytes",
                    merged, total
                )));
            }
            Ok(true)
        };

        let result = merge();
        if !matches!(result, Ok(true)) {
            remove_partial(dest);
        }
        result
    }

    fn run_single(&self, observer: &dyn TransferObserver) -> CoreResult<Option<u64>> {
        let dest = &self.request.destination;
        let resp = self.net.get(&FetchRequest::new(self.request.url.as_str()))?;
        if !resp.is_success() {
            return Err(CoreError::HttpStatus {
                status: resp.status_code,
                context: "single-stream download".to_string(),
            });
        }
        let total = resp.content_length.unwrap_or(0);
        info!(url = %self.request.url, total_bytes = total, "starting single-stream transfer");

        ensure_parent(dest)?;
        let mut file =
            File::create(dest).map_err(|err| CoreError::Io(format!("{}: {}", dest.display(), err)))?;
        let mut body = resp.body;
        let received = AtomicU64::new(0);

        let copied = thread::scope(|scope| {
            let (done_tx, done_rx) = mpsc::channel::<()>();
            let received_ref = &received;
            scope.spawn(move || {
                self.report_progress(
                    done_rx,
                    total,
                    || received_ref.load(Ordering::SeqCst),
                    observer,
                )
            });
            let copied = copy_until_stopped(
                &mut body,
                &mut file,
                self.config.buffer_size,
                &self.control,
                map_read_error,
                |bytes| {
                    received.fetch_add(bytes, Ordering::SeqCst);
                },
            );
            drop(done_tx);
            copied
        });

        let result = match copied {
            Ok(_) if self.control.is_stopped() => Ok(None),
            Ok(copied) if total > 0 && copied != total => Err(CoreError::Transfer(format!(
                "connection closed after {} of {} bytes",
                copied, total
            ))),
            Ok(copied) => file
                .flush()
                .map(|_| Some(copied))
                .map_err(|err| CoreError::Io(format!("{}: {}", dest.display(), err))),
            Err(err) => Err(err),
        };
        drop(file);
        if !matches!(result, Ok(Some(_))) {
            remove_partial(dest);
        }
        result
    }

    fn report_progress(
        &self,
        done: mpsc::Receiver<()>,
        total: u64,
        received: impl Fn() -> u64,
        observer: &dyn TransferObserver,
    ) {
        let mut rate = RateEstimator::new(self.config.speed_window, self.config.min_sample_interval);
        rate.sample(Instant::now(), 0);
        loop {
            let finished = !matches!(
                done.recv_timeout(self.config.progress_interval),
                Err(mpsc::RecvTimeoutError::Timeout)
            );
            if self.control.is_stopped() {
                break;
            }
            let received_bytes = received();
            let speed = rate.sample(Instant::now(), received_bytes);
            let eta = if total > 0 {
                rate.eta(total.saturating_sub(received_bytes))
            } else {
                0.0
            };
            observer.on_progress(&TransferProgress {
                received_bytes,
                total_bytes: total,
                speed_bytes_per_sec: speed,
                eta_seconds: eta,
            });
            if finished {
                break;
            }
        }
    }

    /// `<dest dir>/.temp/<stem>_<millis>_<tag>`, exclusive to this run.
    fn temp_dir(&self) -> PathBuf {
        let dest = &self.request.destination;
        let parent = dest
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let stem = dest
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download".to_string());
        parent
            .join(&self.config.temp_dir_name)
            .join(format!(
                "{}_{}_{}",
                stem,
                now_millis(),
                &Uuid::new_v4().simple().to_string()[..8]
            ))
    }
}

fn copy_until_stopped<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    control: &TransferControl,
    read_error: impl Fn(io::Error) -> CoreError,
    mut on_bytes: impl FnMut(u64),
) -> CoreResult<u64>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buffer = vec![0u8; buffer_size.max(1)];
    let mut copied = 0u64;
    loop {
        if control.is_stopped() {
            break;
        }
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(read_error(err)),
        };
        if control.is_stopped() {
            break;
        }
        writer
            .write_all(&buffer[..read])
            .map_err(|err| CoreError::Io(err.to_string()))?;
        copied += read as u64;
        on_bytes(read as u64);
    }
    Ok(copied)
}

fn ensure_parent(path: &Path) -> CoreResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .map_err(|err| CoreError::Io(format!("{}: {}", parent.display(), err)))?;
        }
    }
    Ok(())
}

fn remove_partial(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), %err, "could not remove partial file");
        }
    }
}

fn remove_temp_dir(dir: &Path) {
    if let Err(err) = fs::remove_dir_all(dir) {
        if err.kind() != io::ErrorKind::NotFound {
            warn!(path = %dir.display(), %err, "could not remove temporary directory");
        }
    }
    if let Some(parent) = dir.parent() {
        let _ = fs::remove_dir(parent);
    }
}
