//! Offline tile downloads.
//!
//! Each tile row carries a durable state machine:
//! `PENDING -> IN_PROGRESS -> {DOWNLOADED, FAILED}`, with `FAILED` and
//! `DOWNLOADED` (file missing on disk) both re-entering `IN_PROGRESS`.
//! The `IN_PROGRESS` marker is persisted before any byte is fetched, so an
//! interrupted job leaves a partial file that the next run resumes with a
//! byte-range request.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{stream, Stream, StreamExt};
use reqwest::{header, Client, StatusCode};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use std::io::SeekFrom;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use groundsync_common::{Error, Result, Tile, TileId, TileState};
use groundsync_storage::LocalStore;

use crate::config::SyncConfig;
use crate::job::JobOutcome;

/// Stream of body bytes.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// An open tile transfer.
pub struct TileFetch {
    /// Byte offset of the first body byte. Zero when the source ignored the
    /// requested range and sends the whole file.
    pub offset: u64,
    /// Full length of the remote file, when known.
    pub total: Option<u64>,
    pub body: ByteStream,
}

/// Where tile bytes come from.
#[async_trait]
pub trait TileSource: Send + Sync {
    /// Start fetching `url` from byte `offset` to the end.
    async fn fetch(&self, url: &str, offset: u64) -> Result<TileFetch>;
}

/// Progress notification emitted after each processed tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    pub tile: TileId,
    pub state: TileState,
    /// Tiles processed so far in this run.
    pub completed: usize,
    /// Tiles this run set out to process.
    pub total: usize,
}

/// Walks pending tiles and downloads them one after another.
pub struct TileDownloadManager {
    local: Arc<dyn LocalStore>,
    source: Arc<dyn TileSource>,
    tile_dir: PathBuf,
    chunk_size: usize,
    progress: broadcast::Sender<TransferProgress>,
}

impl TileDownloadManager {
    pub fn new(
        local: Arc<dyn LocalStore>,
        source: Arc<dyn TileSource>,
        config: &SyncConfig,
    ) -> Self {
        let (progress, _) = broadcast::channel(64);
        Self {
            local,
            source,
            tile_dir: config.tile_dir.clone(),
            chunk_size: config.tile_chunk_size.max(1),
            progress,
        }
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<TransferProgress> {
        self.progress.subscribe()
    }

    /// Local file of a tile.
    pub fn tile_path(&self, tile: &Tile) -> PathBuf {
        self.tile_dir.join(&tile.path)
    }

    /// Run one pass over every tile that needs work.
    ///
    /// Succeeds trivially when nothing is pending. Fails if any tile ended
    /// in `FAILED` or the local store could not be written; failed tiles
    /// keep their durable marker and partial bytes for the next run.
    /// Cancellation takes effect between tiles.
    pub async fn run(&self, cancel: &CancellationToken) -> JobOutcome {
        let tiles = match self.tiles_needing_work().await {
            Ok(tiles) => tiles,
            Err(e) => {
                error!("Failed to list pending tiles: {}", e);
                return JobOutcome::Failure;
            }
        };

        if tiles.is_empty() {
            debug!("No tiles to download");
            return JobOutcome::Success;
        }

        let total = tiles.len();
        let mut failed = 0;
        info!("Downloading {} tiles", total);

        for (index, tile) in tiles.into_iter().enumerate() {
            if cancel.is_cancelled() {
                info!("Tile download cancelled after {} of {} tiles", index, total);
                return JobOutcome::Failure;
            }

            let state = match self.process(&tile).await {
                Ok(state) => state,
                Err(e) => {
                    error!("Aborting tile download at {}: {}", tile.id, e);
                    return JobOutcome::Failure;
                }
            };
            if state == TileState::Failed {
                failed += 1;
            }

            let _ = self.progress.send(TransferProgress {
                tile: tile.id,
                state,
                completed: index + 1,
                total,
            });
        }

        if failed > 0 {
            warn!("{} of {} tiles failed to download", failed, total);
            JobOutcome::Failure
        } else {
            info!("Downloaded {} tiles", total);
            JobOutcome::Success
        }
    }

    /// Pending tiles plus downloaded tiles whose file has gone missing.
    async fn tiles_needing_work(&self) -> Result<Vec<Tile>> {
        let mut tiles = Vec::new();
        for tile in self.local.get_tiles().await? {
            if !tile.state.is_pending() {
                if fs::try_exists(self.tile_path(&tile)).await.unwrap_or(false) {
                    continue;
                }
                info!("Tile {} is marked downloaded but its file is missing", tile.id);
            }
            tiles.push(tile);
        }
        Ok(tiles)
    }

    /// Download one tile and persist its final state.
    ///
    /// Transfer and file errors are absorbed into a `FAILED` state; only
    /// local store errors are returned.
    async fn process(&self, tile: &Tile) -> Result<TileState> {
        let path = self.tile_path(tile);
        let partial_len = match fs::metadata(&path).await {
            Ok(metadata) => metadata.len(),
            Err(_) => 0,
        };
        let resumable = matches!(tile.state, TileState::InProgress | TileState::Failed);
        let offset = if resumable { partial_len } else { 0 };

        self.transition(tile.state, tile, TileState::InProgress).await?;

        let state = match self.download(tile, &path, offset).await {
            Ok(written) => {
                debug!("Tile {} complete, {} bytes", tile.id, written);
                TileState::Downloaded
            }
            Err(e) => {
                warn!("Tile {} failed: {}", tile.id, e);
                TileState::Failed
            }
        };

        self.transition(TileState::InProgress, tile, state).await?;
        Ok(state)
    }

    /// Persist `tile` in `next`, refusing steps outside the tile lifecycle.
    async fn transition(&self, from: TileState, tile: &Tile, next: TileState) -> Result<()> {
        if !from.can_transition_to(next) {
            return Err(Error::Validation(format!(
                "Tile {} cannot move from {} to {}",
                tile.id, from, next
            )));
        }
        self.local.insert_or_update_tile(&tile.with_state(next)).await
    }

    async fn download(&self, tile: &Tile, path: &Path, offset: u64) -> Result<u64> {
        fs::create_dir_all(&self.tile_dir).await?;

        if offset > 0 {
            debug!("Resuming tile {} at byte {}", tile.id, offset);
        }
        let fetch = self.source.fetch(&tile.url, offset).await?;

        if fetch.offset != 0 && fetch.offset != offset {
            return Err(Error::Network(format!(
                "Source resumed at byte {} instead of {}",
                fetch.offset, offset
            )));
        }

        // Bytes go to their absolute offset, so two runs on the same tile
        // rewrite identical data instead of appending it twice.
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await?;
        let existing = file.metadata().await?.len();
        if fetch.offset > existing {
            return Err(Error::Storage(format!(
                "Partial tile {} has {} bytes, cannot resume at {}",
                tile.id, existing, fetch.offset
            )));
        }
        file.seek(SeekFrom::Start(fetch.offset)).await?;

        let mut written = fetch.offset;
        let copied = self.copy_chunks(&mut file, fetch.body, &mut written).await;
        // Bytes already written must reach the file even when the transfer broke.
        file.flush().await?;
        if copied.is_ok() || fetch.offset == 0 {
            // Drop any stale tail left by an older, longer file.
            file.set_len(written).await?;
        }
        copied?;

        if let Some(total) = fetch.total {
            if written != total {
                return Err(Error::Network(format!(
                    "Incomplete tile: {} of {} bytes",
                    written, total
                )));
            }
        }
        let on_disk = fs::metadata(path).await?.len();
        if on_disk != written {
            return Err(Error::Storage(format!(
                "Tile {} file has {} bytes, expected {}",
                tile.id, on_disk, written
            )));
        }
        Ok(written)
    }

    /// Write `body` to `file` in `chunk_size` pieces.
    async fn copy_chunks(
        &self,
        file: &mut fs::File,
        mut body: ByteStream,
        written: &mut u64,
    ) -> Result<()> {
        let mut buffer = BytesMut::with_capacity(self.chunk_size);

        while let Some(piece) = body.next().await {
            let piece = match piece {
                Ok(piece) => piece,
                Err(e) => {
                    // Keep what arrived so the next run resumes after it.
                    file.write_all(&buffer).await?;
                    *written += buffer.len() as u64;
                    return Err(e);
                }
            };
            buffer.extend_from_slice(&piece);
            while buffer.len() >= self.chunk_size {
                let chunk = buffer.split_to(self.chunk_size);
                file.write_all(&chunk).await?;
                *written += chunk.len() as u64;
            }
        }
        if !buffer.is_empty() {
            file.write_all(&buffer).await?;
            *written += buffer.len() as u64;
        }
        Ok(())
    }
}

/// Parse `Content-Range: bytes <start>-<end>/<total>`.
///
/// Returns the start offset (None for `*`) and total (None for `*`).
fn parse_content_range(value: &str) -> Option<(Option<u64>, Option<u64>)> {
    let rest = value.trim().strip_prefix("bytes")?.trim();
    let (range, total) = rest.split_once('/')?;
    let start = match range.trim() {
        "*" => None,
        range => Some(range.split_once('-')?.0.trim().parse().ok()?),
    };
    let total = match total.trim() {
        "*" => None,
        total => Some(total.parse().ok()?),
    };
    Some((start, total))
}

/// Tile source over HTTP(S) with `Range` resume.
pub struct HttpTileSource {
    http: Client,
}

impl HttpTileSource {
    pub fn new() -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("groundsync/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { http })
    }

    async fn send(&self, url: &str, offset: u64) -> Result<reqwest::Response> {
        let mut request = self.http.get(url);
        if offset > 0 {
            request = request.header(header::RANGE, format!("bytes={}-", offset));
        }
        request
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to fetch tile: {}", e)))
    }
}

#[async_trait]
impl TileSource for HttpTileSource {
    async fn fetch(&self, url: &str, offset: u64) -> Result<TileFetch> {
        let mut response = self.send(url, offset).await?;

        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            // The partial file is no prefix of the remote file; start over.
            debug!("Range {}- not satisfiable for {}, refetching", offset, url);
            response = self.send(url, 0).await?;
        }

        let status = response.status();
        let (start, total) = if status == StatusCode::PARTIAL_CONTENT {
            let content_range = response
                .headers()
                .get(header::CONTENT_RANGE)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_content_range);
            match content_range {
                Some((Some(start), total)) => (start, total),
                _ => {
                    return Err(Error::Network(format!(
                        "Missing or invalid Content-Range from {}",
                        url
                    )))
                }
            }
        } else if status.is_success() {
            (0, response.content_length())
        } else {
            return Err(Error::Network(format!("Tile fetch failed: {} {}", status, url)));
        };

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| Error::Network(format!("Tile stream error: {}", e))));

        Ok(TileFetch {
            offset: start,
            total,
            body: Box::pin(body),
        })
    }
}

#[derive(Default)]
struct MemoryTiles {
    files: HashMap<String, Bytes>,
    interrupt_after: HashMap<String, usize>,
    unreachable: HashSet<String>,
    ignore_range: bool,
    piece_delay: Option<Duration>,
    requests: Vec<(String, u64)>,
}

/// In-memory tile source for testing.
///
/// Serves bodies in small pieces so chunked writes see split input.
#[derive(Clone, Default)]
pub struct MemoryTileSource {
    state: Arc<Mutex<MemoryTiles>>,
}

impl MemoryTileSource {
    const PIECE: usize = 7;

    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryTiles> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, url: impl Into<String>, data: impl Into<Bytes>) {
        self.lock().files.insert(url.into(), data.into());
    }

    /// Cut the next transfer of `url` after `bytes` bytes.
    pub fn interrupt_after(&self, url: impl Into<String>, bytes: usize) {
        self.lock().interrupt_after.insert(url.into(), bytes);
    }

    /// Fail every request for `url` until cleared.
    pub fn set_unreachable(&self, url: impl Into<String>, unreachable: bool) {
        let url = url.into();
        let mut state = self.lock();
        if unreachable {
            state.unreachable.insert(url);
        } else {
            state.unreachable.remove(&url);
        }
    }

    /// Answer range requests with the whole file.
    pub fn set_ignore_range(&self, ignore: bool) {
        self.lock().ignore_range = ignore;
    }

    /// Pause before every body piece.
    pub fn set_piece_delay(&self, delay: Duration) {
        self.lock().piece_delay = Some(delay);
    }

    /// Requests seen so far as `(url, offset)`.
    pub fn requests(&self) -> Vec<(String, u64)> {
        self.lock().requests.clone()
    }
}

#[async_trait]
impl TileSource for MemoryTileSource {
    async fn fetch(&self, url: &str, offset: u64) -> Result<TileFetch> {
        let mut state = self.lock();
        state.requests.push((url.to_string(), offset));

        if state.unreachable.contains(url) {
            return Err(Error::Network(format!("Host unreachable: {}", url)));
        }
        let data = state
            .files
            .get(url)
            .cloned()
            .ok_or_else(|| Error::Network(format!("Tile fetch failed: 404 {}", url)))?;

        let len = data.len() as u64;
        let start = if state.ignore_range || offset > len {
            0
        } else {
            offset
        };

        let mut remaining = data.slice(start as usize..);
        if let Some(limit) = state.interrupt_after.remove(url) {
            remaining = remaining.slice(..limit.min(remaining.len()));
        }
        let interrupted = (remaining.len() as u64) < len - start;

        let mut pieces: Vec<Result<Bytes>> = Vec::new();
        while !remaining.is_empty() {
            let piece = remaining.split_to(Self::PIECE.min(remaining.len()));
            pieces.push(Ok(piece));
        }
        if interrupted {
            pieces.push(Err(Error::Network("Connection reset".to_string())));
        }

        let body: ByteStream = match state.piece_delay {
            Some(delay) => Box::pin(stream::iter(pieces).then(move |piece| async move {
                tokio::time::sleep(delay).await;
                piece
            })),
            None => Box::pin(stream::iter(pieces)),
        };

        Ok(TileFetch {
            offset: start,
            total: Some(len),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use groundsync_storage::SqliteLocalStore;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        local: Arc<SqliteLocalStore>,
        source: MemoryTileSource,
        manager: TileDownloadManager,
    }

    fn fixture(chunk_size: usize) -> Fixture {
        let dir = TempDir::new().unwrap();
        let local = Arc::new(SqliteLocalStore::in_memory().unwrap());
        let source = MemoryTileSource::new();
        let config = SyncConfig {
            tile_dir: dir.path().join("tiles"),
            tile_chunk_size: chunk_size,
            ..SyncConfig::default()
        };
        let manager = TileDownloadManager::new(local.clone(), Arc::new(source.clone()), &config);
        Fixture {
            _dir: dir,
            local,
            source,
            manager,
        }
    }

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn add_tile(fixture: &Fixture, id: TileId, state: TileState, data: &[u8]) -> Tile {
        let url = format!("http://tiles/{}/{}/{}", id.z, id.x, id.y);
        fixture.source.insert(url.clone(), data.to_vec());
        let tile = Tile::new(id, url).with_state(state);
        fixture.local.insert_or_update_tile(&tile).await.unwrap();
        tile
    }

    #[tokio::test]
    async fn test_download_pending_tile() {
        let fixture = fixture(16);
        let data = content(100);
        let tile = add_tile(&fixture, TileId::new(1, 2, 3), TileState::Pending, &data).await;
        let mut progress = fixture.manager.subscribe_progress();

        let outcome = fixture.manager.run(&CancellationToken::new()).await;
        assert_eq!(outcome, JobOutcome::Success);

        let stored = fixture.local.get_tile(&tile.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TileState::Downloaded);
        assert_eq!(stored.path, "3-1-2.mbtiles");
        assert_eq!(std::fs::read(fixture.manager.tile_path(&stored)).unwrap(), data);

        let event = progress.recv().await.unwrap();
        assert_eq!((event.completed, event.total), (1, 1));
        assert_eq!(event.state, TileState::Downloaded);
    }

    #[tokio::test]
    async fn test_no_pending_tiles_succeeds_trivially() {
        let fixture = fixture(16);
        assert_eq!(
            fixture.manager.run(&CancellationToken::new()).await,
            JobOutcome::Success
        );
        assert!(fixture.source.requests().is_empty());
    }

    #[tokio::test]
    async fn test_interrupted_download_resumes_with_range() {
        let fixture = fixture(10);
        let data = content(95);
        let tile = add_tile(&fixture, TileId::new(4, 5, 6), TileState::Pending, &data).await;
        fixture.source.interrupt_after(tile.url.clone(), 40);

        let outcome = fixture.manager.run(&CancellationToken::new()).await;
        assert_eq!(outcome, JobOutcome::Failure);
        let stored = fixture.local.get_tile(&tile.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TileState::Failed);

        let path = fixture.manager.tile_path(&tile);
        let partial = std::fs::metadata(&path).unwrap().len();
        assert_eq!(partial, 40);

        let outcome = fixture.manager.run(&CancellationToken::new()).await;
        assert_eq!(outcome, JobOutcome::Success);
        assert_eq!(
            fixture.source.requests(),
            vec![(tile.url.clone(), 0), (tile.url.clone(), 40)]
        );
        assert_eq!(std::fs::read(&path).unwrap(), data);
    }

    #[tokio::test]
    async fn test_source_ignoring_range_restarts_file() {
        let fixture = fixture(8);
        let data = content(50);
        let tile = add_tile(&fixture, TileId::new(0, 0, 1), TileState::InProgress, &data).await;
        std::fs::create_dir_all(fixture.manager.tile_path(&tile).parent().unwrap()).unwrap();
        std::fs::write(fixture.manager.tile_path(&tile), &data[..20]).unwrap();
        fixture.source.set_ignore_range(true);

        assert_eq!(
            fixture.manager.run(&CancellationToken::new()).await,
            JobOutcome::Success
        );
        assert_eq!(
            std::fs::read(fixture.manager.tile_path(&tile)).unwrap(),
            data
        );
    }

    #[tokio::test]
    async fn test_pending_tile_ignores_stale_partial() {
        let fixture = fixture(8);
        let data = content(30);
        let tile = add_tile(&fixture, TileId::new(0, 0, 2), TileState::Pending, &data).await;
        std::fs::create_dir_all(fixture.manager.tile_path(&tile).parent().unwrap()).unwrap();
        std::fs::write(fixture.manager.tile_path(&tile), b"garbage").unwrap();

        fixture.manager.run(&CancellationToken::new()).await;
        assert_eq!(fixture.source.requests(), vec![(tile.url.clone(), 0)]);
        assert_eq!(
            std::fs::read(fixture.manager.tile_path(&tile)).unwrap(),
            data
        );
    }

    #[tokio::test]
    async fn test_downloaded_tile_with_missing_file_is_repaired() {
        let fixture = fixture(16);
        let data = content(20);
        let present = add_tile(&fixture, TileId::new(1, 1, 1), TileState::Downloaded, &data).await;
        let missing = add_tile(&fixture, TileId::new(2, 2, 2), TileState::Downloaded, &data).await;
        std::fs::create_dir_all(fixture.manager.tile_path(&present).parent().unwrap()).unwrap();
        std::fs::write(fixture.manager.tile_path(&present), &data).unwrap();

        assert_eq!(
            fixture.manager.run(&CancellationToken::new()).await,
            JobOutcome::Success
        );
        assert_eq!(fixture.source.requests(), vec![(missing.url.clone(), 0)]);
        assert!(fixture.manager.tile_path(&missing).exists());
    }

    #[tokio::test]
    async fn test_failed_tile_does_not_stop_others() {
        let fixture = fixture(16);
        let data = content(10);
        let bad = add_tile(&fixture, TileId::new(1, 0, 1), TileState::Pending, &data).await;
        let good = add_tile(&fixture, TileId::new(2, 0, 1), TileState::Pending, &data).await;
        fixture.source.set_unreachable(bad.url.clone(), true);

        assert_eq!(
            fixture.manager.run(&CancellationToken::new()).await,
            JobOutcome::Failure
        );
        let stored_bad = fixture.local.get_tile(&bad.id).await.unwrap().unwrap();
        let stored_good = fixture.local.get_tile(&good.id).await.unwrap().unwrap();
        assert_eq!(stored_bad.state, TileState::Failed);
        assert_eq!(stored_good.state, TileState::Downloaded);
    }

    #[tokio::test]
    async fn test_cancelled_run_touches_nothing() {
        let fixture = fixture(16);
        let tile = add_tile(&fixture, TileId::new(1, 0, 1), TileState::Pending, &content(10)).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(fixture.manager.run(&cancel).await, JobOutcome::Failure);
        let stored = fixture.local.get_tile(&tile.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TileState::Pending);
    }

    #[tokio::test]
    async fn test_interrupted_transfer_keeps_unflushed_bytes() {
        let fixture = fixture(64);
        let data = content(95);
        let tile = add_tile(&fixture, TileId::new(4, 5, 7), TileState::Pending, &data).await;
        fixture.source.interrupt_after(tile.url.clone(), 30);

        assert_eq!(
            fixture.manager.run(&CancellationToken::new()).await,
            JobOutcome::Failure
        );
        let path = fixture.manager.tile_path(&tile);
        assert_eq!(std::fs::read(&path).unwrap(), &data[..30]);

        assert_eq!(
            fixture.manager.run(&CancellationToken::new()).await,
            JobOutcome::Success
        );
        assert_eq!(fixture.source.requests()[1], (tile.url.clone(), 30));
        assert_eq!(std::fs::read(&path).unwrap(), data);
    }

    #[tokio::test]
    async fn test_overlapping_runs_leave_intact_tile() {
        let fixture = fixture(8);
        let data = content(30);
        let tile = add_tile(&fixture, TileId::new(3, 3, 3), TileState::InProgress, &data).await;
        let path = fixture.manager.tile_path(&tile);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, &data[..10]).unwrap();
        fixture.source.set_piece_delay(Duration::from_millis(5));

        let cancel = CancellationToken::new();
        let (first, second) = tokio::join!(
            fixture.manager.run(&cancel),
            fixture.manager.run(&cancel)
        );
        assert_eq!(first, JobOutcome::Success);
        assert_eq!(second, JobOutcome::Success);

        let stored = fixture.local.get_tile(&tile.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TileState::Downloaded);
        assert_eq!(std::fs::read(&path).unwrap(), data);
    }

    /// Serves one canned response per connection and records each request.
    struct TestServer {
        base: String,
        requests: Arc<Mutex<Vec<String>>>,
    }

    impl TestServer {
        async fn start(responses: Vec<Vec<u8>>) -> Self {
            use tokio::io::AsyncReadExt;

            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let base = format!("http://{}", listener.local_addr().unwrap());
            let requests = Arc::new(Mutex::new(Vec::new()));
            let log = requests.clone();

            tokio::spawn(async move {
                for response in responses {
                    let (mut socket, _) = listener.accept().await.unwrap();
                    let mut head = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                        let n = socket.read(&mut buf).await.unwrap();
                        if n == 0 {
                            break;
                        }
                        head.extend_from_slice(&buf[..n]);
                    }
                    log.lock()
                        .unwrap()
                        .push(String::from_utf8_lossy(&head).to_lowercase());
                    socket.write_all(&response).await.unwrap();
                    socket.shutdown().await.unwrap();
                }
            });

            Self { base, requests }
        }

        fn requests(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }
    }

    fn http_response(status: &str, headers: &[(&str, String)], body: &[u8]) -> Vec<u8> {
        let mut head = format!(
            "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n",
            status,
            body.len()
        );
        for (name, value) in headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str("\r\n");
        let mut response = head.into_bytes();
        response.extend_from_slice(body);
        response
    }

    async fn http_tile(
        server: &TestServer,
        partial: &[u8],
    ) -> (TempDir, Arc<SqliteLocalStore>, TileDownloadManager, Tile) {
        let dir = TempDir::new().unwrap();
        let local = Arc::new(SqliteLocalStore::in_memory().unwrap());
        let config = SyncConfig {
            tile_dir: dir.path().join("tiles"),
            tile_chunk_size: 8,
            ..SyncConfig::default()
        };
        let source = Arc::new(HttpTileSource::new().unwrap());
        let manager = TileDownloadManager::new(local.clone(), source, &config);

        let tile = Tile::new(TileId::new(1, 2, 3), format!("{}/3/1/2", server.base))
            .with_state(TileState::InProgress);
        local.insert_or_update_tile(&tile).await.unwrap();
        let path = manager.tile_path(&tile);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, partial).unwrap();
        (dir, local, manager, tile)
    }

    #[tokio::test]
    async fn test_http_resume_sends_range_and_appends() {
        let data = content(30);
        let server = TestServer::start(vec![http_response(
            "206 Partial Content",
            &[("Content-Range", "bytes 10-29/30".to_string())],
            &data[10..],
        )])
        .await;
        let (_dir, local, manager, tile) = http_tile(&server, &data[..10]).await;

        assert_eq!(manager.run(&CancellationToken::new()).await, JobOutcome::Success);
        assert!(server.requests()[0].contains("range: bytes=10-"));
        assert_eq!(std::fs::read(manager.tile_path(&tile)).unwrap(), data);
        let stored = local.get_tile(&tile.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TileState::Downloaded);
    }

    #[tokio::test]
    async fn test_http_full_body_replaces_partial() {
        let data = content(30);
        let server = TestServer::start(vec![http_response("200 OK", &[], &data)]).await;
        let (_dir, _local, manager, tile) = http_tile(&server, &[0xAA; 40]).await;

        assert_eq!(manager.run(&CancellationToken::new()).await, JobOutcome::Success);
        assert!(server.requests()[0].contains("range: bytes=40-"));
        assert_eq!(std::fs::read(manager.tile_path(&tile)).unwrap(), data);
    }

    #[tokio::test]
    async fn test_http_unsatisfiable_range_refetches() {
        let data = content(30);
        let server = TestServer::start(vec![
            http_response("416 Range Not Satisfiable", &[], b""),
            http_response("200 OK", &[], &data),
        ])
        .await;
        let (_dir, _local, manager, tile) = http_tile(&server, &[0xAA; 10]).await;

        assert_eq!(manager.run(&CancellationToken::new()).await, JobOutcome::Success);
        let requests = server.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].contains("range: bytes=10-"));
        assert!(!requests[1].contains("range:"));
        assert_eq!(std::fs::read(manager.tile_path(&tile)).unwrap(), data);
    }

    #[tokio::test]
    async fn test_http_partial_without_content_range_fails() {
        let data = content(30);
        let server =
            TestServer::start(vec![http_response("206 Partial Content", &[], &data[10..])]).await;
        let (_dir, local, manager, tile) = http_tile(&server, &data[..10]).await;

        assert_eq!(manager.run(&CancellationToken::new()).await, JobOutcome::Failure);
        let stored = local.get_tile(&tile.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TileState::Failed);
        assert_eq!(std::fs::read(manager.tile_path(&tile)).unwrap(), &data[..10]);
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(
            parse_content_range("bytes 100-199/200"),
            Some((Some(100), Some(200)))
        );
        assert_eq!(parse_content_range("bytes 0-9/*"), Some((Some(0), None)));
        assert_eq!(parse_content_range("bytes */200"), Some((None, Some(200))));
        assert_eq!(parse_content_range("items 0-1/2"), None);
    }
}
