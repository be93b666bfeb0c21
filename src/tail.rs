//! Incremental log file tailing.
//!
//! A `TailSession` remembers how many bytes of a file have been delivered and
//! turns each look at the file into "new suffix", "file was truncated or
//! replaced", or "file is gone". When to look is decided by a
//! `FileChangeSource`; the portable one just sleeps for the poll interval.

use std::io::SeekFrom;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::TailConfig;
use crate::process_table::BoxFuture;
use crate::retry::{RetryDecision, RetryPolicy};

pub const ROTATED_MARKER: &str = "\n--- log file truncated or rotated, restarting from the beginning ---\n";

const CHANNEL_CAPACITY: usize = 64;

/// One piece of file content delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailChunk {
    pub content: String,
    /// False for the initial snapshot, true for everything after it.
    pub is_new: bool,
}

impl TailChunk {
    fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_new: true,
        }
    }
}

/// Tells the watcher when the file may have changed.
pub trait FileChangeSource: Send {
    fn changed(&mut self) -> BoxFuture<'_, ()>;
}

/// Fixed-interval polling; works everywhere.
#[derive(Debug, Clone)]
pub struct PollingSource {
    interval: Duration,
}

impl PollingSource {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl FileChangeSource for PollingSource {
    fn changed(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(tokio::time::sleep(self.interval))
    }
}

/// Outcome of a single look at the file.
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    Emit(Vec<TailChunk>),
    Idle,
    /// File missing; look again after the delay.
    Wait(Duration),
    /// File gone for good; final notice.
    Closed(TailChunk),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    len: u64,
    ino: u64,
}

pub struct TailSession {
    path: PathBuf,
    byte_offset: u64,
    last: Option<FileStamp>,
    retry: RetryPolicy,
    initial_cap: u64,
    closed: bool,
}

impl TailSession {
    pub fn new(path: impl Into<PathBuf>, config: &TailConfig) -> Self {
        Self {
            path: path.into(),
            byte_offset: 0,
            last: None,
            retry: RetryPolicy::new(
                config.max_retries,
                Duration::from_millis(config.retry_base_ms),
                Duration::from_millis(config.retry_max_ms),
            ),
            initial_cap: config.initial_cap_bytes,
            closed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn byte_offset(&self) -> u64 {
        self.byte_offset
    }

    pub async fn step(&mut self) -> Step {
        if self.closed {
            return Step::Idle;
        }

        let meta = match tokio::fs::metadata(&self.path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return self.missing(),
            Err(e) => {
                tracing::warn!(error = %e, path = %self.path.display(), "failed to stat log file");
                return Step::Idle;
            }
        };

        if self.retry.current_attempt() > 0 {
            tracing::info!(path = %self.path.display(), "log file reappeared");
            self.retry.reset();
        }

        let stamp = FileStamp {
            len: meta.len(),
            ino: meta.ino(),
        };

        let result = match self.last {
            None => self.read_initial(stamp).await,
            Some(prev) if prev.ino != stamp.ino || stamp.len < self.byte_offset => {
                tracing::info!(
                    path = %self.path.display(),
                    previous = self.byte_offset,
                    current = stamp.len,
                    "log file truncated or rotated"
                );
                self.read_rotated(stamp).await
            }
            Some(_) if stamp.len > self.byte_offset => self.read_growth(stamp).await,
            Some(_) => Ok(Step::Idle),
        };

        match result {
            Ok(step) => step,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => self.missing(),
            Err(e) => {
                tracing::warn!(error = %e, path = %self.path.display(), "failed to read log file");
                Step::Idle
            }
        }
    }

    async fn read_initial(&mut self, stamp: FileStamp) -> std::io::Result<Step> {
        let read = read_capped(&self.path, self.initial_cap).await?;
        self.last = Some(stamp);
        self.byte_offset = read.end_offset;

        let mut chunks = Vec::new();
        if let Some(notice) = read.notice() {
            chunks.push(TailChunk {
                content: notice,
                is_new: false,
            });
        }
        if !read.content.is_empty() {
            chunks.push(TailChunk {
                content: read.content,
                is_new: false,
            });
        }
        Ok(step_for(chunks))
    }

    async fn read_rotated(&mut self, stamp: FileStamp) -> std::io::Result<Step> {
        let read = read_capped(&self.path, self.initial_cap).await?;
        self.last = Some(stamp);
        self.byte_offset = read.end_offset;

        let mut chunks = vec![TailChunk::new(ROTATED_MARKER)];
        if let Some(notice) = read.notice() {
            chunks.push(TailChunk::new(notice));
        }
        if !read.content.is_empty() {
            chunks.push(TailChunk::new(read.content));
        }
        Ok(Step::Emit(chunks))
    }

    /// New bytes since the last look, at most `initial_cap` of them per poll.
    async fn read_growth(&mut self, stamp: FileStamp) -> std::io::Result<Step> {
        let read = read_window(&self.path, self.byte_offset, self.initial_cap).await?;
        self.last = Some(stamp);
        self.byte_offset = read.end_offset;

        let mut chunks = Vec::new();
        if let Some(notice) = read.notice() {
            chunks.push(TailChunk::new(notice));
        }
        if !read.content.is_empty() {
            chunks.push(TailChunk::new(read.content));
        }
        Ok(step_for(chunks))
    }

    fn missing(&mut self) -> Step {
        match self.retry.evaluate() {
            RetryDecision::Retry { attempt, delay } => {
                tracing::debug!(path = %self.path.display(), attempt, ?delay, "log file missing, retrying");
                Step::Wait(delay)
            }
            RetryDecision::GiveUp => {
                self.closed = true;
                let name = self
                    .path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| self.path.display().to_string());
                Step::Closed(TailChunk::new(format!("\n--- log file not found: {name} ---\n")))
            }
        }
    }
}

fn step_for(chunks: Vec<TailChunk>) -> Step {
    if chunks.is_empty() {
        Step::Idle
    } else {
        Step::Emit(chunks)
    }
}

/// Result of reading at most `cap` trailing bytes of a file.
#[derive(Debug)]
pub struct CappedRead {
    pub content: String,
    pub total_len: u64,
    pub truncated: bool,
    /// Byte offset just past the last delivered byte.
    pub end_offset: u64,
}

impl CappedRead {
    pub fn notice(&self) -> Option<String> {
        self.truncated.then(|| {
            format!(
                "[file is {} bytes, showing the last {} bytes]\n",
                self.total_len,
                self.content.len()
            )
        })
    }
}

/// Read the whole file, or only its trailing `cap` bytes when larger.
pub async fn read_capped(path: &Path, cap: u64) -> std::io::Result<CappedRead> {
    read_window(path, 0, cap).await
}

/// Read from `from` to end of file, skipping ahead so at most `cap` trailing
/// bytes are returned.
async fn read_window(path: &Path, from: u64, cap: u64) -> std::io::Result<CappedRead> {
    let mut file = tokio::fs::File::open(path).await?;
    let total_len = file.metadata().await?.len();
    let start = total_len.saturating_sub(cap).max(from);
    if start > 0 {
        file.seek(SeekFrom::Start(start)).await?;
    }
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).await?;

    // Skip a partial UTF-8 sequence at the start of the window.
    let skipped = start > from;
    let lead = if skipped {
        bytes
            .iter()
            .take(4)
            .take_while(|b| (**b & 0xC0) == 0x80)
            .count()
    } else {
        0
    };
    let (content, consumed) = split_utf8(&bytes[lead..]);
    Ok(CappedRead {
        content,
        total_len,
        truncated: skipped,
        end_offset: start + (lead + consumed) as u64,
    })
}

/// Decode as much as possible, holding back an incomplete trailing sequence.
/// Returns the text and the number of bytes it covers.
fn split_utf8(bytes: &[u8]) -> (String, usize) {
    match std::str::from_utf8(bytes) {
        Ok(s) => (s.to_string(), bytes.len()),
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            (String::from_utf8_lossy(&bytes[..valid]).into_owned(), valid)
        }
        Err(_) => (String::from_utf8_lossy(bytes).into_owned(), bytes.len()),
    }
}

/// A running watcher. Dropping it stops the watcher task.
pub struct TailHandle {
    path: PathBuf,
    rx: mpsc::Receiver<TailChunk>,
    task: JoinHandle<()>,
}

impl TailHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Next chunk, or `None` once the watcher has closed.
    pub async fn recv(&mut self) -> Option<TailChunk> {
        self.rx.recv().await
    }
}

impl Drop for TailHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Start tailing `path` with the polling change source.
pub fn spawn(path: impl Into<PathBuf>, config: &TailConfig) -> TailHandle {
    let source = PollingSource::new(config.poll_interval());
    spawn_with_source(path, config, Box::new(source))
}

pub fn spawn_with_source(
    path: impl Into<PathBuf>,
    config: &TailConfig,
    source: Box<dyn FileChangeSource>,
) -> TailHandle {
    let session = TailSession::new(path, config);
    let path = session.path().to_path_buf();
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tracing::debug!(path = %path.display(), "tail watcher started");
    let task = tokio::spawn(run(session, source, tx));
    TailHandle { path, rx, task }
}

async fn run(
    mut session: TailSession,
    mut source: Box<dyn FileChangeSource>,
    tx: mpsc::Sender<TailChunk>,
) {
    loop {
        match session.step().await {
            Step::Emit(chunks) => {
                for chunk in chunks {
                    if tx.send(chunk).await.is_err() {
                        return;
                    }
                }
            }
            Step::Idle => {}
            Step::Wait(delay) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = tx.closed() => return,
                }
                continue;
            }
            Step::Closed(notice) => {
                let _ = tx.send(notice).await;
                tracing::debug!(path = %session.path().display(), "tail watcher closed");
                return;
            }
        }

        tokio::select! {
            _ = source.changed() => {}
            _ = tx.closed() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn config() -> TailConfig {
        TailConfig {
            poll_interval_ms: 20,
            initial_cap_bytes: 1024,
            max_retries: 3,
            retry_base_ms: 10,
            retry_max_ms: 25,
        }
    }

    fn append(path: &Path, data: &[u8]) {
        let mut f = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        f.write_all(data).unwrap();
    }

    fn contents(step: Step) -> Vec<TailChunk> {
        match step {
            Step::Emit(chunks) => chunks,
            other => panic!("expected Emit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_growth_emits_only_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, "A").unwrap();

        let mut session = TailSession::new(&path, &config());
        let initial = contents(session.step().await);
        assert_eq!(
            initial,
            vec![TailChunk {
                content: "A".to_string(),
                is_new: false
            }]
        );

        append(&path, b"B");
        let chunks = contents(session.step().await);
        assert_eq!(chunks, vec![TailChunk::new("B")]);
        assert_eq!(session.byte_offset(), 2);

        assert_eq!(session.step().await, Step::Idle);
    }

    #[tokio::test]
    async fn test_shrink_emits_marker_then_full_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, "hello world\n").unwrap();

        let mut session = TailSession::new(&path, &config());
        session.step().await;
        assert_eq!(session.byte_offset(), 12);

        std::fs::write(&path, "new\n").unwrap();
        let chunks = contents(session.step().await);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].content, ROTATED_MARKER);
        assert_eq!(chunks[1], TailChunk::new("new\n"));
        assert_eq!(session.byte_offset(), 4);
    }

    #[tokio::test]
    async fn test_replaced_file_detected_by_inode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, "old\n").unwrap();

        let mut session = TailSession::new(&path, &config());
        session.step().await;

        // Keep the old inode alive so the new file cannot reuse it.
        std::fs::rename(&path, dir.path().join("a.log.1")).unwrap();
        std::fs::write(&path, "a much longer replacement\n").unwrap();

        let chunks = contents(session.step().await);
        assert_eq!(chunks[0].content, ROTATED_MARKER);
        assert_eq!(chunks[1].content, "a much longer replacement\n");
    }

    #[tokio::test]
    async fn test_missing_file_backs_off_then_closes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.log");
        let mut session = TailSession::new(&path, &config());

        assert_eq!(session.step().await, Step::Wait(Duration::from_millis(10)));
        assert_eq!(session.step().await, Step::Wait(Duration::from_millis(20)));
        assert_eq!(session.step().await, Step::Wait(Duration::from_millis(25)));
        match session.step().await {
            Step::Closed(notice) => assert!(notice.content.contains("not found: gone.log")),
            other => panic!("expected Closed, got {other:?}"),
        }
        assert!(session.closed);
        assert_eq!(session.step().await, Step::Idle);
    }

    #[tokio::test]
    async fn test_reappearing_file_resets_retries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late.log");
        let mut session = TailSession::new(&path, &config());

        assert!(matches!(session.step().await, Step::Wait(_)));
        assert!(matches!(session.step().await, Step::Wait(_)));
        std::fs::write(&path, "finally\n").unwrap();
        let chunks = contents(session.step().await);
        assert_eq!(chunks[0].content, "finally\n");

        std::fs::remove_file(&path).unwrap();
        assert_eq!(session.step().await, Step::Wait(Duration::from_millis(10)));
    }

    #[tokio::test]
    async fn test_initial_read_is_capped_with_notice() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.log");
        let body: String = (0..100).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        std::fs::write(&path, &body).unwrap();

        let mut session = TailSession::new(
            &path,
            &TailConfig {
                initial_cap_bytes: 10,
                ..config()
            },
        );
        let chunks = contents(session.step().await);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].content.contains("showing the last 10 bytes"));
        assert_eq!(chunks[1].content, &body[90..]);
        assert!(!chunks[1].is_new);
        assert_eq!(session.byte_offset(), 100);
    }

    #[tokio::test]
    async fn test_large_growth_is_capped_per_poll() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("burst.log");
        std::fs::write(&path, "start\n").unwrap();

        let mut session = TailSession::new(
            &path,
            &TailConfig {
                initial_cap_bytes: 10,
                ..config()
            },
        );
        session.step().await;
        assert_eq!(session.byte_offset(), 6);

        let burst: String = (0..100).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        append(&path, burst.as_bytes());
        let chunks = contents(session.step().await);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].content.contains("file is 106 bytes, showing the last 10 bytes"));
        assert!(chunks[0].is_new);
        assert_eq!(chunks[1], TailChunk::new(&burst[90..]));
        assert_eq!(session.byte_offset(), 106);

        append(&path, b"tail\n");
        assert_eq!(contents(session.step().await), vec![TailChunk::new("tail\n")]);
    }

    #[tokio::test]
    async fn test_partial_utf8_is_held_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("u.log");
        std::fs::write(&path, b"caf\xC3").unwrap();

        let mut session = TailSession::new(&path, &config());
        let chunks = contents(session.step().await);
        assert_eq!(chunks[0].content, "caf");
        assert_eq!(session.byte_offset(), 3);

        append(&path, b"\xA9!");
        let chunks = contents(session.step().await);
        assert_eq!(chunks, vec![TailChunk::new("é!")]);
    }

    #[tokio::test]
    async fn test_read_capped_small_file_not_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.log");
        std::fs::write(&path, "line1\n").unwrap();
        let read = read_capped(&path, 1024).await.unwrap();
        assert!(!read.truncated);
        assert!(read.notice().is_none());
        assert_eq!(read.content, "line1\n");
        assert_eq!(read.end_offset, 6);
    }

    #[tokio::test]
    async fn test_spawned_watcher_streams_appended_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("task-1.2-20250101-000000.log");
        std::fs::write(&path, "line1\n").unwrap();

        let mut handle = spawn(&path, &config());
        let first = tokio::time::timeout(Duration::from_secs(2), handle.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.content, "line1\n");
        assert!(!first.is_new);

        append(&path, b"line2\n");
        let next = tokio::time::timeout(Duration::from_secs(2), handle.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next, TailChunk::new("line2\n"));
    }

    #[tokio::test]
    async fn test_spawned_watcher_closes_after_retries() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = spawn(dir.path().join("never.log"), &config());
        let notice = tokio::time::timeout(Duration::from_secs(2), handle.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(notice.content.contains("not found"));
        let end = tokio::time::timeout(Duration::from_secs(2), handle.recv())
            .await
            .unwrap();
        assert!(end.is_none());
    }

    struct ManualSource(mpsc::Receiver<()>);

    impl FileChangeSource for ManualSource {
        fn changed(&mut self) -> BoxFuture<'_, ()> {
            Box::pin(async move {
                if self.0.recv().await.is_none() {
                    std::future::pending::<()>().await;
                }
            })
        }
    }

    #[tokio::test]
    async fn test_custom_change_source_drives_polls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("n.log");
        std::fs::write(&path, "one\n").unwrap();

        let (notify, rx) = mpsc::channel(4);
        let mut handle = spawn_with_source(&path, &config(), Box::new(ManualSource(rx)));
        assert_eq!(handle.recv().await.unwrap().content, "one\n");

        append(&path, b"two\n");
        notify.send(()).await.unwrap();
        let next = tokio::time::timeout(Duration::from_secs(2), handle.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.content, "two\n");
        assert_eq!(handle.path(), path.as_path());
    }
}
