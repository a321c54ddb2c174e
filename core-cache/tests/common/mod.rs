//! Shared fakes for the cache integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bridge_desktop::TokioFileSystem;
use bridge_traits::error::{BridgeError, Result as BridgeResult};
use bridge_traits::storage::FileSystemAccess;
use bridge_traits::transfer::{
    BackgroundTransferSession, TransferClient, TransferEventSink, TransferProgress,
};
use bridge_traits::PlaybackMonitor;
use core_async::sync::{mpsc, watch};
use core_async::time::{sleep, timeout, Duration};
use core_cache::db::create_test_pool;
use core_cache::validator::{PayloadValidator, ValidatedPayload};
use core_cache::{CacheLayout, SqliteCacheRepository};
use core_runtime::events::{CoreEvent, DownloadEvent, PurgeEvent, Receiver};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// One second of 8kHz 16-bit mono silence.
pub fn wav_bytes() -> Vec<u8> {
    let sample_rate: u32 = 8_000;
    let data_len: u32 = sample_rate * 2;
    let mut bytes = Vec::with_capacity(44 + data_len as usize);
    bytes.extend_from_slice(b"RIFF");
    bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
    bytes.extend_from_slice(b"WAVE");
    bytes.extend_from_slice(b"fmt ");
    bytes.extend_from_slice(&16u32.to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes());
    bytes.extend_from_slice(&sample_rate.to_le_bytes());
    bytes.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    bytes.extend_from_slice(&2u16.to_le_bytes());
    bytes.extend_from_slice(&16u16.to_le_bytes());
    bytes.extend_from_slice(b"data");
    bytes.extend_from_slice(&data_len.to_le_bytes());
    bytes.resize(44 + data_len as usize, 0);
    bytes
}

/// Transfer client whose fetches block until the gate opens.
pub struct GatedClient {
    gate: watch::Sender<bool>,
    body: Vec<u8>,
    failing: Mutex<HashSet<String>>,
    started: Mutex<Vec<String>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl GatedClient {
    /// Fetches wait for [`release`](Self::release).
    pub fn closed(body: Vec<u8>) -> Arc<Self> {
        Arc::new(Self::with_gate(body, false))
    }

    pub fn open(body: Vec<u8>) -> Arc<Self> {
        Arc::new(Self::with_gate(body, true))
    }

    fn with_gate(body: Vec<u8>, open: bool) -> Self {
        let (gate, _) = watch::channel(open);
        Self {
            gate,
            body,
            failing: Mutex::new(HashSet::new()),
            started: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    pub fn fail(&self, locator: &str) {
        self.failing.lock().insert(locator.to_string());
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().clone()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransferClient for GatedClient {
    async fn fetch(
        &self,
        locator: &str,
        destination: &Path,
        progress: mpsc::UnboundedSender<TransferProgress>,
    ) -> BridgeResult<u64> {
        self.started.lock().push(locator.to_string());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _active = ActiveGuard(&self.active);

        let mut gate = self.gate.subscribe();
        loop {
            let open = *gate.borrow_and_update();
            if open {
                break;
            }
            if gate.changed().await.is_err() {
                break;
            }
        }

        if self.failing.lock().contains(locator) {
            return Err(BridgeError::OperationFailed("HTTP error: 503".to_string()));
        }

        std::fs::write(destination, &self.body)?;
        let len = self.body.len() as u64;
        let _ = progress.send(TransferProgress::new(len / 2, Some(len)));
        let _ = progress.send(TransferProgress::new(len, Some(len)));
        Ok(len)
    }
}

/// Background session that only records what it was asked to do.
pub struct RecordingSession {
    outstanding: Mutex<Vec<String>>,
    cancelled: Mutex<Vec<String>>,
    next: AtomicUsize,
}

impl RecordingSession {
    pub fn new() -> Arc<Self> {
        Self::with_outstanding(Vec::new())
    }

    /// A session that reports `outstanding` as surviving from a previous run.
    pub fn with_outstanding(outstanding: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            outstanding: Mutex::new(outstanding),
            cancelled: Mutex::new(Vec::new()),
            next: AtomicUsize::new(1),
        })
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().clone()
    }
}

#[async_trait]
impl BackgroundTransferSession for RecordingSession {
    fn session_id(&self) -> String {
        "recording".to_string()
    }

    async fn attach(&self, _sink: Arc<dyn TransferEventSink>) -> BridgeResult<()> {
        Ok(())
    }

    async fn submit_transfer(&self, _locator: &str) -> BridgeResult<String> {
        let task_id = format!("bg-{}", self.next.fetch_add(1, Ordering::SeqCst));
        self.outstanding.lock().push(task_id.clone());
        Ok(task_id)
    }

    async fn cancel_transfer(&self, task_id: &str) -> BridgeResult<()> {
        self.outstanding.lock().retain(|id| id != task_id);
        self.cancelled.lock().push(task_id.to_string());
        Ok(())
    }

    async fn list_outstanding(&self) -> BridgeResult<Vec<String>> {
        Ok(self.outstanding.lock().clone())
    }
}

/// Playback monitor with a settable set of open items.
#[derive(Default)]
pub struct OpenItems(Mutex<HashSet<String>>);

impl OpenItems {
    pub fn open(&self, item_id: &str) {
        self.0.lock().insert(item_id.to_string());
    }

    pub fn close(&self, item_id: &str) {
        self.0.lock().remove(item_id);
    }
}

impl PlaybackMonitor for OpenItems {
    fn is_open_for_playback(&self, item_id: &str) -> bool {
        self.0.lock().contains(item_id)
    }
}

pub struct AcceptAll;

#[async_trait]
impl PayloadValidator for AcceptAll {
    async fn validate(
        &self,
        _item_id: &str,
        _path: &Path,
    ) -> core_cache::Result<ValidatedPayload> {
        Ok(ValidatedPayload { duration_ms: None })
    }
}

/// Temp directory with a prepared layout, a file system and a repository.
pub struct Env {
    pub dir: tempfile::TempDir,
    pub layout: CacheLayout,
    pub fs: Arc<dyn FileSystemAccess>,
    pub repo: Arc<SqliteCacheRepository>,
}

impl Env {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let layout = CacheLayout::new(dir.path().join("cache"), dir.path().join("staging"));
        std::fs::create_dir_all(&layout.cache_dir).unwrap();
        std::fs::create_dir_all(&layout.staging_dir).unwrap();

        let fs: Arc<dyn FileSystemAccess> =
            Arc::new(TokioFileSystem::with_cache_directory(dir.path().to_path_buf()));
        let repo = Arc::new(SqliteCacheRepository::new(create_test_pool().await.unwrap()));
        repo.initialize().await.unwrap();

        Self {
            dir,
            layout,
            fs,
            repo,
        }
    }

    pub fn root(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }
}

pub fn file_count(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

/// Next download event other than `Started` and `Progress`.
pub async fn next_download_outcome(rx: &mut Receiver<CoreEvent>) -> DownloadEvent {
    loop {
        let event = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a download event")
            .unwrap();
        match event {
            CoreEvent::Download(DownloadEvent::Started { .. })
            | CoreEvent::Download(DownloadEvent::Progress { .. }) => continue,
            CoreEvent::Download(event) => return event,
            CoreEvent::Purge(_) => continue,
        }
    }
}

/// Next download event of any kind.
pub async fn next_download_event(rx: &mut Receiver<CoreEvent>) -> DownloadEvent {
    loop {
        let event = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a download event")
            .unwrap();
        if let CoreEvent::Download(event) = event {
            return event;
        }
    }
}

pub async fn next_purge_event(rx: &mut Receiver<CoreEvent>) -> PurgeEvent {
    loop {
        let event = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a purge event")
            .unwrap();
        if let CoreEvent::Purge(event) = event {
            return event;
        }
    }
}
