//! Webseed downloads (BEP 19)
//!
//! A webseed URL serves the torrent's content over HTTP(S); pieces are
//! fetched with `Range` requests and fed into the same verify-and-write
//! path as peer pieces. Per-URL failure backoff starts at one minute and
//! doubles up to an hour. Source bookkeeping lives in the coordinator;
//! fetch tasks only perform the HTTP work.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::{Client, StatusCode};
use tokio::sync::mpsc;
use url::Url;

use crate::error::{EngineError, ProtocolErrorKind, Result, TransportErrorKind};
use crate::metainfo::Info;

/// Coordinator-side state of one webseed URL.
#[derive(Debug)]
pub struct WebseedSource {
    pub url: String,
    /// Piece currently being fetched from this URL
    pub active_piece: Option<u32>,
    /// Next failure backoff
    backoff: Duration,
    /// Disabled until this instant after a failure
    disabled_until: Option<Instant>,
}

impl WebseedSource {
    pub fn new(url: String, initial_backoff: Duration) -> Self {
        Self {
            url,
            active_piece: None,
            backoff: initial_backoff,
            disabled_until: None,
        }
    }

    /// Ready for a new assignment: idle and out of backoff.
    pub fn is_available(&self, now: Instant) -> bool {
        if self.active_piece.is_some() {
            return false;
        }
        match self.disabled_until {
            Some(until) => now >= until,
            None => true,
        }
    }

    /// Record an assignment.
    pub fn begin(&mut self, piece: u32) {
        self.active_piece = Some(piece);
    }

    /// A piece arrived intact: clear backoff.
    pub fn finish_success(&mut self, initial_backoff: Duration) {
        self.active_piece = None;
        self.backoff = initial_backoff;
        self.disabled_until = None;
    }

    /// The fetch failed: disable the URL for the current backoff window and
    /// double it, capped at `max_backoff`.
    pub fn finish_failure(&mut self, now: Instant, max_backoff: Duration) {
        self.active_piece = None;
        self.disabled_until = Some(now + self.backoff);
        self.backoff = (self.backoff * 2).min(max_backoff);
    }
}

/// Result of one webseed piece fetch.
#[derive(Debug)]
pub struct WebseedPieceResult {
    pub url: String,
    pub index: u32,
    pub result: Result<Vec<u8>>,
}

/// Build the shared HTTP client for webseed requests.
pub fn build_client(timeout: Duration, user_agent: &str) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(user_agent)
        .build()
        .map_err(|e| {
            EngineError::transport(
                TransportErrorKind::Other,
                format!("webseed client: {}", e),
            )
        })
}

/// Fetch one piece from a webseed and report it on `results`.
///
/// The buffer is not hash-checked here; the piece writer verifies every
/// buffer regardless of source.
pub async fn fetch_piece(
    client: Client,
    base_url: String,
    info: Arc<Info>,
    index: u32,
    results: mpsc::Sender<WebseedPieceResult>,
) {
    let result = fetch_piece_inner(&client, &base_url, &info, index).await;
    let _ = results
        .send(WebseedPieceResult {
            url: base_url,
            index,
            result,
        })
        .await;
}

async fn fetch_piece_inner(
    client: &Client,
    base_url: &str,
    info: &Info,
    index: u32,
) -> Result<Vec<u8>> {
    let piece_length = info
        .piece_length_at(index as usize)
        .ok_or_else(|| webseed_err(format!("piece {} out of range", index)))?;

    let mut buffer = Vec::with_capacity(piece_length as usize);

    for (file_idx, file_offset, length) in info.files_for_piece(index as usize) {
        let file = &info.files[file_idx];
        let url = file_url(base_url, info, file_idx)?;
        let range_end = file_offset + length - 1;

        tracing::debug!(
            "webseed GET {} range {}-{} for piece {}",
            url,
            file_offset,
            range_end,
            index
        );

        let response = client
            .get(url.clone())
            .header("Range", format!("bytes={}-{}", file_offset, range_end))
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
            return Err(EngineError::transport(
                TransportErrorKind::HttpStatus(status.as_u16()),
                format!("webseed returned {}", status),
            ));
        }

        let body = response.bytes().await?;
        if body.len() as u64 == length {
            buffer.extend_from_slice(&body);
        } else if status == StatusCode::OK && body.len() as u64 == file.length {
            // Server ignored the Range header and sent the whole file
            let start = file_offset as usize;
            let end = start + length as usize;
            buffer.extend_from_slice(&body[start..end]);
        } else {
            return Err(webseed_err(format!(
                "short body from {}: got {} of {} bytes",
                url,
                body.len(),
                length
            )));
        }
    }

    if buffer.len() as u64 != piece_length {
        return Err(webseed_err(format!(
            "assembled {} of {} bytes for piece {}",
            buffer.len(),
            piece_length,
            index
        )));
    }

    Ok(buffer)
}

fn webseed_err(message: String) -> EngineError {
    EngineError::protocol(ProtocolErrorKind::WebseedError, message)
}

/// Resolve the URL serving a file (BEP 19 GetRight convention): a URL
/// ending in `/` is a directory; single-file torrents append the name,
/// multi-file torrents append `name/` plus the file path.
fn file_url(base: &str, info: &Info, file_idx: usize) -> Result<Url> {
    let mut url = Url::parse(base)?;

    let is_dir = base.ends_with('/');
    if info.is_single_file {
        if is_dir {
            push_segments(&mut url, [info.name.as_str()])?;
        }
        return Ok(url);
    }

    let file = &info.files[file_idx];
    let mut segments: Vec<&str> = vec![info.name.as_str()];
    for component in file.path.iter() {
        segments.push(component.to_str().ok_or_else(|| {
            webseed_err(format!("non-UTF-8 path in file {}", file_idx))
        })?);
    }
    push_segments(&mut url, segments)?;
    Ok(url)
}

fn push_segments<'a>(url: &mut Url, segments: impl IntoIterator<Item = &'a str>) -> Result<()> {
    let mut path = url
        .path_segments_mut()
        .map_err(|_| webseed_err("webseed URL cannot carry a path".to_string()))?;
    path.pop_if_empty();
    for segment in segments {
        path.push(segment);
    }
    Ok(())
}
