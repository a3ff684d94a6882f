use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, RANGE, USER_AGENT};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::SkyDataError;
use crate::progress::{SpeedMeter, Throttle, TransferProgress};
use crate::task::CancelToken;

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub url: String,
    /// `.part` staging file, distinct from the final archive name.
    pub destination: PathBuf,
    pub resume_if_partial: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// `bytes` is the staging file length, resumed prefix included.
    Completed { bytes: u64 },
    Cancelled,
}

pub trait TransferClient: Send + Sync {
    /// Streams `request.url` into `request.destination`. An `Err` is the
    /// failed outcome; cancellation is reported as `Ok(Cancelled)`.
    fn fetch(
        &self,
        request: &TransferRequest,
        cancel: &CancelToken,
        on_progress: &mut dyn FnMut(TransferProgress),
    ) -> Result<TransferOutcome, SkyDataError>;
}

/// Continuations for a transfer started with [`begin`].
pub trait TransferListener: Send + 'static {
    fn on_progress(&self, _progress: TransferProgress) {}
    fn on_success(&self, bytes: u64);
    fn on_failure(&self, error: SkyDataError);
    fn on_cancelled(&self);
}

pub struct TransferHandle {
    cancel: CancelToken,
    worker: JoinHandle<()>,
}

impl TransferHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    pub fn join(self) -> Result<(), SkyDataError> {
        self.worker
            .join()
            .map_err(|_| SkyDataError::WorkerPanicked("transfer".to_string()))
    }
}

/// Runs `client.fetch` on a background thread and routes the outcome to
/// exactly one of the listener's terminal continuations.
pub fn begin<C>(
    client: Arc<C>,
    request: TransferRequest,
    listener: impl TransferListener,
) -> TransferHandle
where
    C: TransferClient + ?Sized + 'static,
{
    let cancel = CancelToken::new();
    let token = cancel.clone();
    let worker = thread::spawn(move || {
        let result = client.fetch(&request, &token, &mut |progress| {
            listener.on_progress(progress)
        });
        match result {
            Ok(TransferOutcome::Completed { bytes }) => listener.on_success(bytes),
            Ok(TransferOutcome::Cancelled) => listener.on_cancelled(),
            Err(err) => listener.on_failure(err),
        }
    });
    TransferHandle { cancel, worker }
}

#[derive(Debug)]
pub enum StreamError {
    Read(io::Error),
    Write(io::Error),
}

/// Copies `reader` into `writer` chunk by chunk, checking `cancel` before
/// every chunk. `offset` is the length already on disk.
pub fn stream_to_writer<R, W>(
    reader: &mut R,
    writer: &mut W,
    offset: u64,
    total: Option<u64>,
    cancel: &CancelToken,
    on_progress: &mut dyn FnMut(TransferProgress),
) -> Result<TransferOutcome, StreamError>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut position = offset;
    let mut throttle = Throttle::default();
    let mut speed = SpeedMeter::new(offset);
    let mut last_reported = None;

    loop {
        if cancel.is_cancelled() {
            writer.flush().map_err(StreamError::Write)?;
            return Ok(TransferOutcome::Cancelled);
        }
        let count = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(count) => count,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(StreamError::Read(err)),
        };
        writer
            .write_all(&buffer[..count])
            .map_err(StreamError::Write)?;
        position += count as u64;

        let bytes_per_sec = speed.update(position);
        if throttle.ready() {
            on_progress(TransferProgress::new(position, total, bytes_per_sec));
            last_reported = Some(position);
        }
    }

    writer.flush().map_err(StreamError::Write)?;
    if last_reported != Some(position) {
        on_progress(TransferProgress::new(position, total, speed.update(position)));
    }
    Ok(TransferOutcome::Completed { bytes: position })
}

#[derive(Clone)]
pub struct HttpTransferClient {
    client: Client,
}

impl HttpTransferClient {
    pub fn new(settings: &Settings) -> Result<Self, SkyDataError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&Settings::user_agent())
                .map_err(|err| SkyDataError::Http(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(settings.http_timeout)
            .build()
            .map_err(|err| SkyDataError::Http(err.to_string()))?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn request(
        &self,
        url: &str,
        offset: u64,
        cancel: &CancelToken,
    ) -> Result<Response, SkyDataError> {
        send_with_retries(cancel, || {
            let request = self.client.get(url);
            if offset > 0 {
                request.header(RANGE, format!("bytes={offset}-"))
            } else {
                request
            }
        })
    }

    fn fetch_http(
        &self,
        request: &TransferRequest,
        cancel: &CancelToken,
        on_progress: &mut dyn FnMut(TransferProgress),
    ) -> Result<TransferOutcome, SkyDataError> {
        let mut offset = partial_len(request);
        if offset > 0 {
            info!(
                "resuming download from byte {offset}: {}",
                request.destination.display()
            );
        }

        let mut response = self.request(&request.url, offset, cancel)?;
        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE && offset > 0 {
            debug!("range not satisfiable, restarting {}", request.url);
            remove_partial(&request.destination)?;
            offset = 0;
            response = self.request(&request.url, 0, cancel)?;
        }

        let status = response.status();
        if !status.is_success() {
            return Err(SkyDataError::HttpStatus {
                status: status.as_u16(),
                url: request.url.clone(),
            });
        }
        if offset > 0 && status != StatusCode::PARTIAL_CONTENT {
            debug!("server ignored range request, restarting {}", request.url);
            offset = 0;
        }

        let total = response.content_length().map(|len| len + offset);
        info!(
            "downloading {} ({} bytes)",
            request.url,
            total.map(|t| t.to_string()).unwrap_or_else(|| "unknown".to_string())
        );
        let mut file = open_staging(&request.destination, offset)?;
        stream_to_writer(&mut response, &mut file, offset, total, cancel, on_progress).map_err(
            |err| match err {
                StreamError::Read(err) => SkyDataError::Http(format!("{}: {err}", request.url)),
                StreamError::Write(err) => SkyDataError::Filesystem(format!(
                    "write {}: {err}",
                    request.destination.display()
                )),
            },
        )
    }
}

impl TransferClient for HttpTransferClient {
    fn fetch(
        &self,
        request: &TransferRequest,
        cancel: &CancelToken,
        on_progress: &mut dyn FnMut(TransferProgress),
    ) -> Result<TransferOutcome, SkyDataError> {
        if cancel.is_cancelled() {
            return Ok(TransferOutcome::Cancelled);
        }
        match request.url.strip_prefix("file://") {
            Some(source) => copy_local(Path::new(source), request, cancel, on_progress),
            None => self.fetch_http(request, cancel, on_progress),
        }
    }
}

/// Local mirrors: the source is copied with the same chunking, progress and
/// cancellation as a network transfer.
fn copy_local(
    source: &Path,
    request: &TransferRequest,
    cancel: &CancelToken,
    on_progress: &mut dyn FnMut(TransferProgress),
) -> Result<TransferOutcome, SkyDataError> {
    info!("using local file {}", source.display());
    let mut input = File::open(source)
        .map_err(|err| SkyDataError::Filesystem(format!("open {}: {err}", source.display())))?;
    let total = input
        .metadata()
        .map_err(|err| SkyDataError::Filesystem(err.to_string()))?
        .len();
    let mut output = open_staging(&request.destination, 0)?;
    stream_to_writer(&mut input, &mut output, 0, Some(total), cancel, on_progress).map_err(
        |err| match err {
            StreamError::Read(err) => {
                SkyDataError::Filesystem(format!("read {}: {err}", source.display()))
            }
            StreamError::Write(err) => SkyDataError::Filesystem(format!(
                "write {}: {err}",
                request.destination.display()
            )),
        },
    )
}

fn partial_len(request: &TransferRequest) -> u64 {
    if !request.resume_if_partial {
        return 0;
    }
    let is_part = request
        .destination
        .extension()
        .map(|ext| ext == "part")
        .unwrap_or(false);
    if !is_part {
        return 0;
    }
    fs::metadata(&request.destination)
        .map(|meta| meta.len())
        .unwrap_or(0)
}

fn open_staging(path: &Path, offset: u64) -> Result<File, SkyDataError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| SkyDataError::Filesystem(err.to_string()))?;
    }
    let file = if offset > 0 {
        OpenOptions::new().append(true).open(path)
    } else {
        File::create(path)
    };
    file.map_err(|err| SkyDataError::Filesystem(format!("open {}: {err}", path.display())))
}

fn remove_partial(path: &Path) -> Result<(), SkyDataError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(SkyDataError::Filesystem(err.to_string())),
    }
}

pub(crate) fn send_with_retries<F>(
    cancel: &CancelToken,
    mut make_req: F,
) -> Result<Response, SkyDataError>
where
    F: FnMut() -> RequestBuilder,
{
    const MAX_RETRIES: usize = 3;
    const BASE_DELAY_MS: u64 = 200;
    let mut attempt = 0usize;
    loop {
        let response = make_req().send();
        let retry = match &response {
            Ok(resp) => is_retryable_status(resp.status().as_u16()),
            Err(err) => is_retryable_error(err),
        };
        if retry && attempt < MAX_RETRIES && !cancel.is_cancelled() {
            let delay = BASE_DELAY_MS * (attempt as u64 + 1);
            warn!("request failed, retrying in {delay} ms (attempt {})", attempt + 1);
            thread::sleep(Duration::from_millis(delay));
            attempt += 1;
            continue;
        }
        return response.map_err(|err| SkyDataError::Http(err.to_string()));
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn stream_reports_final_total() {
        let data = vec![7u8; CHUNK_SIZE * 3 + 10];
        let mut reader = Cursor::new(data.clone());
        let mut sink = Vec::new();
        let mut reports = Vec::new();
        let outcome = stream_to_writer(
            &mut reader,
            &mut sink,
            0,
            Some(data.len() as u64),
            &CancelToken::new(),
            &mut |progress| reports.push(progress),
        )
        .unwrap();

        assert_eq!(outcome, TransferOutcome::Completed { bytes: data.len() as u64 });
        assert_eq!(sink, data);
        let last = reports.last().unwrap();
        assert_eq!(last.bytes_read, data.len() as u64);
        assert_eq!(last.percent, Some(100.0));
    }

    #[test]
    fn stream_stops_when_cancelled_up_front() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut reader = Cursor::new(vec![1u8; 1024]);
        let mut sink = Vec::new();
        let outcome =
            stream_to_writer(&mut reader, &mut sink, 0, None, &cancel, &mut |_| {}).unwrap();
        assert_eq!(outcome, TransferOutcome::Cancelled);
        assert!(sink.is_empty());
    }

    #[test]
    fn unknown_length_reports_bytes_only() {
        let data = vec![3u8; CHUNK_SIZE * 3 + 100];
        let mut reader = Cursor::new(data.clone());
        let mut sink = Vec::new();
        let mut reports = Vec::new();
        let outcome = stream_to_writer(
            &mut reader,
            &mut sink,
            0,
            None,
            &CancelToken::new(),
            &mut |progress| reports.push(progress),
        )
        .unwrap();

        assert_eq!(outcome, TransferOutcome::Completed { bytes: data.len() as u64 });
        assert!(reports.len() >= 2);
        assert!(
            reports
                .iter()
                .all(|progress| progress.bytes_total.is_none() && progress.percent.is_none())
        );
        assert_eq!(reports.last().unwrap().bytes_read, data.len() as u64);
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(404));
        assert!(!is_retryable_status(416));
    }
}
