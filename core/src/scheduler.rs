use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::catalog::CatalogEntry;
use crate::config::{EngineConfig, Settings, SettingsPatch};
use crate::error::{CoreError, CoreResult};
use crate::events::{EventSink, NullSink, TransferEvent};
use crate::net::{NetClient, ReqwestNetClient};
use crate::postprocess::{
    ArchiveExtractor, ExternalConverter, ImageConverter, PostProcessOptions, PostProcessor,
    ZipExtractor,
};
use crate::queue::AdmissionQueue;
use crate::record::{RecordId, TransferRecord, TransferStatus};
use crate::storage::{MemoryStore, RecordStore};
use crate::transfer::{
    ChunkedTransfer, TransferControl, TransferOutcome, TransferProgress, TransferRequest,
};
use crate::validate::{filename_from_url, sanitize_filename, validate_url};

pub trait DirectoryPicker {
    fn pick_directory(&self, current: &Path) -> Option<PathBuf>;
}

impl<F> DirectoryPicker for F
where
    F: Fn(&Path) -> Option<PathBuf>,
{
    fn pick_directory(&self, current: &Path) -> Option<PathBuf> {
        self(current)
    }
}

pub struct SchedulerBuilder {
    config: EngineConfig,
    store: Option<Box<dyn RecordStore>>,
    net: Option<Arc<dyn NetClient>>,
    sink: Arc<dyn EventSink>,
    extractor: Arc<dyn ArchiveExtractor>,
    converter: Option<Arc<dyn ImageConverter>>,
    default_root: Option<PathBuf>,
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            store: None,
            net: None,
            sink: Arc::new(NullSink),
            extractor: Arc::new(ZipExtractor),
            converter: None,
            default_root: None,
        }
    }
}

impl SchedulerBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Box<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn net_client(mut self, net: Arc<dyn NetClient>) -> Self {
        self.net = Some(net);
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn extractor(mut self, extractor: Arc<dyn ArchiveExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    /// Overrides the converter otherwise built from `Settings::converter_path`.
    pub fn converter(mut self, converter: Arc<dyn ImageConverter>) -> Self {
        self.converter = Some(converter);
        self
    }

    /// Download root used while `Settings::download_root` is unset.
    pub fn default_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.default_root = Some(root.into());
        self
    }

    pub fn build(self) -> CoreResult<TransferScheduler> {
        let net: Arc<dyn NetClient> = match self.net {
            Some(net) => net,
            None => Arc::new(ReqwestNetClient::new(
                &self.config.user_agent,
                self.config.request_timeout,
            )?),
        };
        let mut store = self.store.unwrap_or_else(|| Box::new(MemoryStore::new()));
        let default_root = self
            .default_root
            .or_else(dirs::download_dir)
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));

        let mut state = State::default();
        let mut restored = store.list_records()?;
        restored.reverse();
        for mut record in restored {
            let interrupted = match record.status {
                TransferStatus::Pending | TransferStatus::Active => {
                    record.requeue();
                    true
                }
                status if status.is_post_processing() => {
                    let total = record.total_bytes;
                    record.complete(total);
                    true
                }
                _ => false,
            };
            if interrupted {
                debug!(id = %record.id, status = %record.status, "restored interrupted record");
                store.update_record(&record)?;
            }
            state.order.push(record.id);
            state.records.insert(record.id, record);
        }
        info!(records = state.records.len(), "scheduler ready");

        Ok(TransferScheduler {
            inner: Arc::new(Inner {
                config: self.config,
                state: Mutex::new(state),
                store: Mutex::new(store),
                idle: Condvar::new(),
                handles: Mutex::new(Vec::new()),
                net,
                sink: self.sink,
                post: PostProcessor::new(self.extractor),
                converter: self.converter,
                default_root,
            }),
        })
    }
}

struct ActiveTransfer {
    control: TransferControl,
    last_notify: Option<Instant>,
    last_persist: Instant,
}

#[derive(Default)]
struct State {
    records: HashMap<RecordId, TransferRecord>,
    order: Vec<RecordId>,
    queue: AdmissionQueue,
    active: HashMap<RecordId, ActiveTransfer>,
    workers: usize,
}

impl State {
    fn owns(&self, id: &RecordId, control: &TransferControl) -> bool {
        self.active
            .get(id)
            .map(|active| active.control.same_run(control))
            .unwrap_or(false)
    }

    fn forget(&mut self, id: &RecordId) -> Option<TransferRecord> {
        self.order.retain(|existing| existing != id);
        self.queue.remove(id);
        self.records.remove(id)
    }

    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.active.is_empty() && self.workers == 0
    }
}

struct Inner {
    config: EngineConfig,
    state: Mutex<State>,
    store: Mutex<Box<dyn RecordStore>>,
    idle: Condvar,
    handles: Mutex<Vec<JoinHandle<()>>>,
    net: Arc<dyn NetClient>,
    sink: Arc<dyn EventSink>,
    post: PostProcessor,
    converter: Option<Arc<dyn ImageConverter>>,
    default_root: PathBuf,
}

/// Owns every transfer record and decides which ones run.
///
/// Records wait in a FIFO queue until one of `max_concurrent_downloads` slots
/// is free; each admitted record runs one [`ChunkedTransfer`] on its own worker
/// thread, followed by post-processing while the slot is still held.
#[derive(Clone)]
pub struct TransferScheduler {
    inner: Arc<Inner>,
}

impl TransferScheduler {
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::default()
    }

    pub fn submit(&self, url: &str, filename: Option<&str>) -> CoreResult<TransferRecord> {
        let parsed = validate_url(url)?;
        let filename = match filename {
            Some(name) => sanitize_filename(name),
            None => sanitize_filename(&filename_from_url(&parsed)),
        };
        let root = self.download_root();
        let record = TransferRecord::new(url.trim().to_string(), filename.clone(), root.join(&filename));
        let id = record.id;

        let mut evicted = Vec::new();
        {
            let mut state = self.inner.lock_state()?;
            state.records.insert(id, record.clone());
            state.order.push(id);
            match self.inner.lock_store()?.add_record(&record) {
                Ok(oldest) => {
                    for old in oldest {
                        if state.records.get(&old).map(|r| r.status.is_terminal()).unwrap_or(false) {
                            state.forget(&old);
                            evicted.push(old);
                        }
                    }
                }
                Err(err) => warn!(%id, %err, "failed to persist new record"),
            }
            state.queue.push(id);
        }
        info!(%id, url = %record.url, destination = %record.destination.display(), "submitted");
        for old in evicted {
            debug!(id = %old, "evicted from history");
            self.inner.emit(TransferEvent::Removed { id: old });
        }

        self.inner.pump();
        self.announce_if_queued(&id);
        self.get(&id).or(Ok(record))
    }

    pub fn submit_entry(&self, entry: &CatalogEntry) -> CoreResult<TransferRecord> {
        self.submit(&entry.url, None)
    }

    /// Stops and deletes a record. Emits `cancelled` then `removed`.
    pub fn cancel(&self, id: &RecordId) -> CoreResult<()> {
        let snapshot = {
            let mut state = self.inner.lock_state()?;
            if !state.records.contains_key(id) {
                return Err(CoreError::NotFound(id.to_string()));
            }
            if let Some(active) = state.active.remove(id) {
                active.control.cancel();
            }
            let mut record = state
                .forget(id)
                .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
            record.cancel();
            self.inner.unpersist(id);
            self.inner.idle.notify_all();
            record
        };
        info!(%id, "cancelled");

        self.inner.emit(TransferEvent::Cancelled(snapshot));
        self.inner.emit(TransferEvent::Removed { id: *id });
        self.inner.pump();
        Ok(())
    }

    /// Deletes a record of any status. Files already on disk are left alone.
    pub fn remove(&self, id: &RecordId) -> CoreResult<()> {
        {
            let mut state = self.inner.lock_state()?;
            if state.forget(id).is_none() {
                return Err(CoreError::NotFound(id.to_string()));
            }
            if let Some(active) = state.active.remove(id) {
                active.control.cancel();
            }
            self.inner.unpersist(id);
            self.inner.idle.notify_all();
        }
        info!(%id, "removed");

        self.inner.emit(TransferEvent::Removed { id: *id });
        self.inner.pump();
        Ok(())
    }

    /// Stops a running or queued record. Its bytes are discarded; a later
    /// `resume` starts over from zero.
    pub fn pause(&self, id: &RecordId) -> CoreResult<()> {
        let snapshot = {
            let mut guard = self.inner.lock_state()?;
            let state = &mut *guard;
            let record = state
                .records
                .get_mut(id)
                .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
            match record.status {
                TransferStatus::Active => {
                    let stopping = state
                        .active
                        .get(id)
                        .map(|active| active.control.pause())
                        .unwrap_or(false);
                    if !stopping {
                        return Err(CoreError::InvalidState(format!(
                            "transfer {} is already stopping",
                            id
                        )));
                    }
                }
                TransferStatus::Pending => {
                    state.queue.remove(id);
                }
                other => {
                    return Err(CoreError::InvalidState(format!(
                        "cannot pause transfer in state {}",
                        other
                    )))
                }
            }
            record.pause();
            let snapshot = record.clone();
            self.inner.persist(&snapshot);
            self.inner.idle.notify_all();
            snapshot
        };
        info!(%id, "paused");

        self.inner.emit(TransferEvent::Paused(snapshot));
        Ok(())
    }

    /// Queues a `Paused` or `Failed` record for a fresh run.
    pub fn resume(&self, id: &RecordId) -> CoreResult<()> {
        {
            let mut guard = self.inner.lock_state()?;
            let state = &mut *guard;
            if state.active.contains_key(id) {
                return Err(CoreError::InvalidState(format!(
                    "transfer {} is still stopping",
                    id
                )));
            }
            let record = state
                .records
                .get_mut(id)
                .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
            if !matches!(record.status, TransferStatus::Paused | TransferStatus::Failed) {
                return Err(CoreError::InvalidState(format!(
                    "cannot resume transfer in state {}",
                    record.status
                )));
            }
            record.requeue();
            let snapshot = record.clone();
            self.inner.persist(&snapshot);
            state.queue.push(*id);
        }
        info!(%id, "resumed");

        self.inner.pump();
        self.announce_if_queued(id);
        Ok(())
    }

    /// Queues every `Pending` record restored from the store, oldest first.
    pub fn requeue_interrupted(&self) -> CoreResult<usize> {
        let count = {
            let mut guard = self.inner.lock_state()?;
            let state = &mut *guard;
            let pending: Vec<RecordId> = state
                .order
                .iter()
                .filter(|id| {
                    state
                        .records
                        .get(id)
                        .map(|r| r.status == TransferStatus::Pending)
                        .unwrap_or(false)
                        && !state.active.contains_key(id)
                })
                .copied()
                .collect();
            pending.into_iter().filter(|id| state.queue.push(*id)).count()
        };
        if count > 0 {
            info!(count, "requeued interrupted transfers");
        }
        self.inner.pump();
        Ok(count)
    }

    /// Removes every `Completed`, `Cancelled` and `Failed` record.
    pub fn clear_history(&self) -> CoreResult<usize> {
        let removed = {
            let mut state = self.inner.lock_state()?;
            let finished: Vec<RecordId> = state
                .records
                .values()
                .filter(|r| r.status.is_terminal())
                .map(|r| r.id)
                .collect();
            for id in &finished {
                state.forget(id);
                self.inner.unpersist(id);
            }
            finished
        };
        for id in &removed {
            self.inner.emit(TransferEvent::Removed { id: *id });
        }
        Ok(removed.len())
    }

    pub fn get(&self, id: &RecordId) -> CoreResult<TransferRecord> {
        self.inner
            .lock_state()?
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(id.to_string()))
    }

    pub fn list_all(&self) -> CoreResult<Vec<TransferRecord>> {
        let state = self.inner.lock_state()?;
        Ok(state
            .order
            .iter()
            .rev()
            .filter_map(|id| state.records.get(id).cloned())
            .collect())
    }

    pub fn queued_ids(&self) -> CoreResult<Vec<RecordId>> {
        Ok(self.inner.lock_state()?.queue.ids())
    }

    pub fn active_count(&self) -> CoreResult<usize> {
        Ok(self.inner.lock_state()?.active.len())
    }

    pub fn settings(&self) -> CoreResult<Settings> {
        self.inner.lock_store()?.settings()
    }

    /// Applies `patch`. A raised concurrency limit admits queued records at once;
    /// a lowered one never stops running transfers.
    pub fn update_settings(&self, patch: &SettingsPatch) -> CoreResult<Settings> {
        let settings = self.inner.lock_store()?.update_settings(patch)?;
        debug!(?patch, "settings updated");
        self.inner.pump();
        Ok(settings)
    }

    pub fn reset_settings(&self) -> CoreResult<Settings> {
        let settings = self.inner.lock_store()?.reset_settings()?;
        self.inner.pump();
        Ok(settings)
    }

    pub fn set_max_concurrent(&self, limit: usize) -> CoreResult<Settings> {
        self.update_settings(&SettingsPatch {
            max_concurrent_downloads: Some(limit),
            ..SettingsPatch::default()
        })
    }

    pub fn download_root(&self) -> PathBuf {
        self.settings()
            .ok()
            .and_then(|settings| settings.download_root)
            .unwrap_or_else(|| self.inner.default_root.clone())
    }

    pub fn set_download_root(&self, root: impl Into<PathBuf>) -> CoreResult<PathBuf> {
        let root = root.into();
        self.update_settings(&SettingsPatch {
            download_root: Some(Some(root.clone())),
            ..SettingsPatch::default()
        })?;
        Ok(root)
    }

    /// Lets `picker` choose a new download root; `None` when it declined.
    pub fn choose_download_root(&self, picker: &dyn DirectoryPicker) -> CoreResult<Option<PathBuf>> {
        let current = self.download_root();
        match picker.pick_directory(&current) {
            Some(root) => self.set_download_root(root).map(Some),
            None => Ok(None),
        }
    }

    /// Blocks until nothing is queued or running and every worker has exited.
    pub fn wait_idle(&self) -> CoreResult<()> {
        {
            let mut state = self.inner.lock_state()?;
            while !state.is_idle() {
                state = self
                    .inner
                    .idle
                    .wait(state)
                    .map_err(|_| CoreError::Storage("state lock poisoned".to_string()))?;
            }
        }
        self.inner.join_finished(true);
        Ok(())
    }

    /// Like [`wait_idle`](Self::wait_idle) with a deadline. Returns false on timeout.
    pub fn wait_idle_for(&self, timeout: Duration) -> CoreResult<bool> {
        let deadline = Instant::now() + timeout;
        {
            let mut state = self.inner.lock_state()?;
            while !state.is_idle() {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(false);
                }
                let (guard, _) = self
                    .inner
                    .idle
                    .wait_timeout(state, deadline - now)
                    .map_err(|_| CoreError::Storage("state lock poisoned".to_string()))?;
                state = guard;
            }
        }
        self.inner.join_finished(true);
        Ok(true)
    }

    fn announce_if_queued(&self, id: &RecordId) {
        let snapshot = match self.inner.lock_state() {
            Ok(state) if state.queue.contains(id) => state.records.get(id).cloned(),
            _ => None,
        };
        if let Some(record) = snapshot {
            debug!(id = %record.id, "queued");
            self.inner.emit(TransferEvent::Queued(record));
        }
    }
}

impl Inner {
    fn lock_state(&self) -> CoreResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| CoreError::Storage("state lock poisoned".to_string()))
    }

    fn lock_store(&self) -> CoreResult<MutexGuard<'_, Box<dyn RecordStore>>> {
        self.store
            .lock()
            .map_err(|_| CoreError::Storage("storage lock poisoned".to_string()))
    }

    fn emit(&self, event: TransferEvent) {
        self.sink.emit(event);
    }

    fn persist(&self, record: &TransferRecord) {
        let result = self
            .lock_store()
            .and_then(|mut store| store.update_record(record));
        if let Err(err) = result {
            warn!(id = %record.id, %err, "failed to persist record");
        }
    }

    fn unpersist(&self, id: &RecordId) {
        let result = self.lock_store().and_then(|mut store| store.remove_record(id));
        if let Err(err) = result {
            warn!(%id, %err, "failed to delete persisted record");
        }
    }

    fn current_settings(&self) -> Settings {
        match self.lock_store().and_then(|store| store.settings()) {
            Ok(settings) => settings,
            Err(err) => {
                warn!(%err, "falling back to default settings");
                Settings::default()
            }
        }
    }

    fn pump(self: &Arc<Self>) {
        let mut admitted = Vec::new();
        {
            let Ok(mut guard) = self.lock_state() else {
                return;
            };
            let state = &mut *guard;
            let settings = self.current_settings();
            let limit = settings.slot_limit();

            while state.active.len() < limit {
                let Some(id) = state.queue.pop() else {
                    break;
                };
                let Some(record) = state.records.get_mut(&id) else {
                    continue;
                };
                if record.status != TransferStatus::Pending {
                    continue;
                }
                record.start();
                let snapshot = record.clone();
                self.persist(&snapshot);

                let control = TransferControl::new();
                state.active.insert(
                    snapshot.id,
                    ActiveTransfer {
                        control: control.clone(),
                        last_notify: None,
                        last_persist: Instant::now(),
                    },
                );
                state.workers += 1;
                info!(id = %snapshot.id, active = state.active.len(), limit, "started");

                let request = TransferRequest {
                    url: snapshot.url.clone(),
                    destination: snapshot.destination.clone(),
                    connections: settings.connection_count(),
                };
                admitted.push((snapshot, request, control));
            }
        }
        self.join_finished(false);

        // Announce before the worker exists so `started` precedes its other events.
        for (snapshot, request, control) in admitted {
            let id = snapshot.id;
            self.emit(TransferEvent::Started(snapshot));
            let inner = Arc::clone(self);
            let handle = thread::spawn(move || inner.run_worker(id, request, control));
            if let Ok(mut handles) = self.handles.lock() {
                handles.push(handle);
            }
        }
    }

    fn run_worker(self: &Arc<Self>, id: RecordId, request: TransferRequest, control: TransferControl) {
        let transfer = ChunkedTransfer::new(
            Arc::clone(&self.net),
            self.config.clone(),
            request,
            control.clone(),
        );
        let observer = |progress: &TransferProgress| self.on_progress(&id, &control, progress);

        match transfer.run(&observer) {
            TransferOutcome::Completed { total_bytes } => {
                self.finish_completed(&id, &control, total_bytes)
            }
            TransferOutcome::Failed(err) => self.finish_failed(&id, &control, err),
            TransferOutcome::Paused | TransferOutcome::Cancelled => {}
        }

        if let Ok(mut state) = self.lock_state() {
            if state.owns(&id, &control) {
                state.active.remove(&id);
            }
        }
        self.pump();
        if let Ok(mut state) = self.lock_state() {
            state.workers = state.workers.saturating_sub(1);
            self.idle.notify_all();
        }
    }

    fn on_progress(&self, id: &RecordId, control: &TransferControl, progress: &TransferProgress) {
        let snapshot = {
            let Ok(mut guard) = self.lock_state() else {
                return;
            };
            let state = &mut *guard;
            let Some(active) = state.active.get_mut(id) else {
                return;
            };
            if !active.control.same_run(control) || control.is_stopped() {
                return;
            }
            let Some(record) = state.records.get_mut(id) else {
                return;
            };
            if record.status != TransferStatus::Active {
                return;
            }
            record.apply_progress(progress);

            let now = Instant::now();
            if now.duration_since(active.last_persist) >= self.config.persist_interval {
                active.last_persist = now;
                self.persist(record);
            }
            let notify = active
                .last_notify
                .map(|last| now.duration_since(last) >= self.config.notify_interval)
                .unwrap_or(true);
            if !notify {
                return;
            }
            active.last_notify = Some(now);
            record.clone()
        };
        self.emit(TransferEvent::Progress(snapshot));
    }

    fn finish_completed(&self, id: &RecordId, control: &TransferControl, total_bytes: u64) {
        let snapshot = {
            let Ok(mut state) = self.lock_state() else {
                return;
            };
            if !state.owns(id, control) {
                return;
            }
            let Some(record) = state.records.get_mut(id) else {
                return;
            };
            record.complete(total_bytes);
            let snapshot = record.clone();
            self.persist(&snapshot);
            snapshot
        };
        self.emit(TransferEvent::Completed(snapshot.clone()));

        let settings = self.current_settings();
        let options = PostProcessOptions::from(&settings);
        let converter: Option<Arc<dyn ImageConverter>> = self.converter.clone().or_else(|| {
            settings
                .converter_path
                .clone()
                .map(|path| Arc::new(ExternalConverter::new(path)) as Arc<dyn ImageConverter>)
        });

        let mut staged = false;
        let report = self.post.run(
            &snapshot.destination,
            &options,
            converter.as_deref(),
            &mut |stage: TransferStatus| {
                staged = true;
                self.enter_stage(id, control, stage);
            },
        );
        if !staged {
            return;
        }

        let finished = {
            let Ok(mut state) = self.lock_state() else {
                return;
            };
            if !state.owns(id, control) {
                return;
            }
            let Some(record) = state.records.get_mut(id) else {
                return;
            };
            if report.relocated {
                record.destination = report.final_path.clone();
            }
            record.complete(total_bytes);
            let snapshot = record.clone();
            self.persist(&snapshot);
            snapshot
        };
        info!(
            %id,
            path = %report.final_path.display(),
            warnings = report.warnings.len(),
            "post-processing finished"
        );
        self.emit(TransferEvent::Completed(finished));
    }

    fn enter_stage(&self, id: &RecordId, control: &TransferControl, stage: TransferStatus) {
        let snapshot = {
            let Ok(mut state) = self.lock_state() else {
                return;
            };
            if !state.owns(id, control) {
                return;
            }
            let Some(record) = state.records.get_mut(id) else {
                return;
            };
            record.enter_stage(stage);
            let snapshot = record.clone();
            self.persist(&snapshot);
            snapshot
        };
        debug!(%id, %stage, "post-processing stage");
        self.emit(TransferEvent::Progress(snapshot));
    }

    fn finish_failed(&self, id: &RecordId, control: &TransferControl, err: CoreError) {
        let snapshot = {
            let Ok(mut state) = self.lock_state() else {
                return;
            };
            if !state.owns(id, control) {
                return;
            }
            let Some(record) = state.records.get_mut(id) else {
                return;
            };
            record.fail(err.to_string());
            let snapshot = record.clone();
            self.persist(&snapshot);
            snapshot
        };
        self.emit(TransferEvent::Error(snapshot));
    }

    fn join_finished(&self, all: bool) {
        let finished: Vec<JoinHandle<()>> = match self.handles.lock() {
            Ok(mut handles) => {
                let mut done = Vec::new();
                let mut index = 0usize;
                while index < handles.len() {
                    if all || handles[index].is_finished() {
                        done.push(handles.remove(index));
                    } else {
                        index += 1;
                    }
                }
                done
            }
            Err(_) => return,
        };
        for handle in finished {
            if handle.join().is_err() {
                warn!("transfer worker panicked");
            }
        }
    }
}
