//! Disk-backed image cache handler.
//!
//! Hits are streamed straight from disk. Misses are streamed from the origin to the
//! client while a background task copies the same chunks into the cache directory. The
//! writer is fed through an unbounded channel, so a slow disk never holds up delivery.
//! The entry only becomes visible (via rename) once the whole body arrived, and the
//! client body ends only after that rename happened.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt, TryStreamExt};
use http::header::{
    HeaderName, HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_EXPOSE_HEADERS,
    CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, X_CONTENT_TYPE_OPTIONS,
};
use http::{Method, StatusCode};
use reqwest::Client;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::error::{EdgeError, EdgeResult};
use crate::layout::{cache_path, image_mime_type};
use crate::origin::OriginHandle;
use crate::proxy::{mirror_headers, UpstreamTuning};
use crate::request::EdgeRequest;
use crate::response::EdgeResponse;
use crate::serve::{ensure_readable, ServeHandler};
use crate::validator::RequestValidator;

/// Fourteen days.
pub const CACHE_CONTROL_VALUE: &str = "public, max-age=1209600";

const X_CACHE: HeaderName = HeaderName::from_static("x-cache");
const TIMING_ALLOW_ORIGIN: HeaderName = HeaderName::from_static("timing-allow-origin");

static FILL_SEQUENCE: AtomicU64 = AtomicU64::new(0);

pub struct CacheHandler {
    root: PathBuf,
    origin: OriginHandle,
    validator: Arc<RequestValidator>,
    client: Client,
}

impl CacheHandler {
    pub fn new(
        root: impl Into<PathBuf>,
        origin: OriginHandle,
        validator: Arc<RequestValidator>,
        tuning: &UpstreamTuning,
    ) -> EdgeResult<Self> {
        Ok(Self {
            root: root.into(),
            origin,
            validator,
            client: tuning.build_client()?,
        })
    }

    async fn serve_hit(&self, request: &EdgeRequest, file: &Path) -> EdgeResult<EdgeResponse> {
        let reader = File::open(file).await.map_err(|err| {
            warn!(target: "cheetah::cache", path = %file.display(), error = %err, "failed to open cached image");
            EdgeError::Io(err)
        })?;
        let size = reader.metadata().await.map_err(|err| {
            warn!(target: "cheetah::cache", path = %file.display(), error = %err, "failed to access info of cached image");
            EdgeError::Io(err)
        })?;

        let mut response = EdgeResponse::ok();
        response.set_header(CONTENT_TYPE, HeaderValue::from_static(image_mime_type(file)));
        response.set_header(CONTENT_LENGTH, HeaderValue::from(size.len()));
        response.set_header(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        response.set_header(ACCESS_CONTROL_EXPOSE_HEADERS, HeaderValue::from_static("*"));
        response.set_header(CACHE_CONTROL, HeaderValue::from_static(CACHE_CONTROL_VALUE));
        response.set_header(TIMING_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        response.set_header(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
        response.set_header(X_CACHE, HeaderValue::from_static("HIT"));

        debug!(target: "cheetah::access", peer = %request.peer(), path = %file.display(), "cache hit");
        if request.method() == Method::HEAD {
            return Ok(response);
        }
        Ok(response.with_stream(ReaderStream::new(reader)))
    }

    async fn serve_miss(
        &self,
        request: &EdgeRequest,
        canonical_path: &str,
        file: &Path,
    ) -> EdgeResult<EdgeResponse> {
        let url = self.origin.url_for(canonical_path);
        let upstream = self
            .client
            .request(request.method().clone(), &url)
            .send()
            .await
            .map_err(|err| {
                warn!(target: "cheetah::cache", url = %url, error = %err, "failed to receive image from upstream server");
                EdgeError::Upstream(err)
            })?;

        let status = upstream.status();
        let mut response = EdgeResponse::new(status);
        mirror_headers(upstream.headers(), &mut response);
        response.set_header(X_CACHE, HeaderValue::from_static("MISS"));
        debug!(target: "cheetah::access", peer = %request.peer(), url = %url, "cache miss");
        if request.method() == Method::HEAD {
            return Ok(response);
        }

        let mut body: BoxStream<'static, io::Result<Bytes>> =
            upstream.bytes_stream().map_err(io::Error::other).boxed();
        if status == StatusCode::OK {
            match CacheFill::open(file).await {
                Ok(fill) => body = TeeStream::new(body, fill).boxed(),
                Err(err) => {
                    warn!(target: "cheetah::cache", path = %file.display(), error = %err, "failed to create cached image; serving without caching");
                }
            }
        }
        Ok(response.with_stream(body))
    }
}

#[async_trait]
impl ServeHandler for CacheHandler {
    async fn handle(&self, request: EdgeRequest) -> EdgeResult<EdgeResponse> {
        ensure_readable(&request)?;
        let validated = self.validator.authorize(&request)?;
        let file = cache_path(&self.root, &validated.content_key);

        match fs::metadata(&file).await {
            Ok(meta) if meta.is_file() => self.serve_hit(&request, &file).await,
            Ok(_) => Err(EdgeError::Internal(format!(
                "cache entry {} is not a regular file",
                file.display()
            ))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                self.serve_miss(&request, &validated.canonical_path, &file)
                    .await
            }
            Err(err) => {
                warn!(target: "cheetah::cache", path = %file.display(), error = %err, "failed to determine cached image status");
                Err(EdgeError::Io(err))
            }
        }
    }
}

enum FillEvent {
    Chunk(Bytes),
    Complete,
}

/// Feeds a background writer; dropping it without [`CacheFill::complete`] discards the
/// partial file.
struct CacheFill {
    sender: mpsc::UnboundedSender<FillEvent>,
    stored: oneshot::Receiver<bool>,
}

impl CacheFill {
    async fn open(target: &Path) -> io::Result<Self> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(target);
        let file = File::create(&partial).await?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let (stored_tx, stored) = oneshot::channel();
        tokio::spawn(write_fill(
            file,
            partial,
            target.to_path_buf(),
            receiver,
            stored_tx,
        ));
        Ok(Self { sender, stored })
    }

    fn push(&self, chunk: Bytes) {
        // A closed channel means the writer gave up; delivery carries on.
        let _ = self.sender.send(FillEvent::Chunk(chunk));
    }

    /// Resolves once the writer renamed the entry into place or gave up on it.
    fn complete(self) -> oneshot::Receiver<bool> {
        let _ = self.sender.send(FillEvent::Complete);
        self.stored
    }
}

fn partial_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let sequence = FILL_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    target.with_file_name(format!(".{name}.{}.{sequence}.part", std::process::id()))
}

async fn write_fill(
    mut file: File,
    partial: PathBuf,
    target: PathBuf,
    mut receiver: mpsc::UnboundedReceiver<FillEvent>,
    stored: oneshot::Sender<bool>,
) {
    let outcome = loop {
        match receiver.recv().await {
            Some(FillEvent::Chunk(chunk)) => {
                if let Err(err) = file.write_all(&chunk).await {
                    break Err(err);
                }
            }
            Some(FillEvent::Complete) => break finish_fill(&mut file, &partial, &target).await,
            None => {
                break Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "upstream body ended early",
                ))
            }
        }
    };
    drop(file);

    let committed = match outcome {
        Ok(()) => {
            debug!(target: "cheetah::cache", path = %target.display(), "cached image stored");
            true
        }
        Err(err) => {
            warn!(target: "cheetah::cache", path = %target.display(), error = %err, "discarding partial cached image");
            let _ = fs::remove_file(&partial).await;
            false
        }
    };
    // The body may already be gone.
    let _ = stored.send(committed);
}

async fn finish_fill(file: &mut File, partial: &Path, target: &Path) -> io::Result<()> {
    file.flush().await?;
    file.sync_data().await?;
    fs::rename(partial, target).await
}

/// Passes chunks through unchanged while copying them into a [`CacheFill`]. The end of
/// the stream is held back until the writer settled the entry.
struct TeeStream {
    inner: BoxStream<'static, io::Result<Bytes>>,
    fill: Option<CacheFill>,
    committing: Option<oneshot::Receiver<bool>>,
}

impl TeeStream {
    fn new(inner: BoxStream<'static, io::Result<Bytes>>, fill: CacheFill) -> Self {
        Self {
            inner,
            fill: Some(fill),
            committing: None,
        }
    }
}

impl Stream for TeeStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if let Some(committing) = this.committing.as_mut() {
            // A dropped sender counts as settled.
            let _ = ready!(Pin::new(committing).poll(cx));
            this.committing = None;
            return Poll::Ready(None);
        }
        match ready!(this.inner.as_mut().poll_next(cx)) {
            Some(Ok(chunk)) => {
                if let Some(fill) = &this.fill {
                    fill.push(chunk.clone());
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Some(Err(err)) => {
                this.fill.take();
                Poll::Ready(Some(Err(err)))
            }
            None => match this.fill.take() {
                Some(fill) => {
                    this.committing = Some(fill.complete());
                    self.poll_next(cx)
                }
                None => Poll::Ready(None),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::tests::{image_path, seal_token, test_key, HASH};
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use chrono::{Duration, Utc};
    use futures_util::stream;
    use http::Method;
    use tempfile::tempdir;

    fn handler(root: &Path, validator: Arc<RequestValidator>) -> CacheHandler {
        CacheHandler::new(
            root,
            OriginHandle::fixed("http://127.0.0.1:9"),
            validator,
            &UpstreamTuning::default(),
        )
        .expect("handler")
    }

    #[tokio::test]
    async fn valid_token_serves_prepopulated_entry() {
        let temp = tempdir().expect("tempdir");
        let validator = Arc::new(RequestValidator::new());
        validator
            .update(false, &STANDARD.encode(test_key()))
            .expect("key");
        let file = cache_path(temp.path(), &format!("{HASH}.png"));
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(&file, b"png-bytes").unwrap();

        let token = seal_token(&test_key(), Utc::now() + Duration::minutes(5));
        let response = handler(temp.path(), validator)
            .handle(EdgeRequest::new(Method::GET, &image_path(&token)))
            .await
            .expect("hit");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-cache").unwrap(), "HIT");
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "image/png");
        assert_eq!(response.headers().get(CONTENT_LENGTH).unwrap(), "9");
        assert_eq!(&response.into_bytes().await.unwrap()[..], b"png-bytes");
    }

    #[tokio::test]
    async fn expired_token_is_forbidden() {
        let temp = tempdir().expect("tempdir");
        let validator = Arc::new(RequestValidator::new());
        validator
            .update(false, &STANDARD.encode(test_key()))
            .expect("key");
        let token = seal_token(&test_key(), Utc::now() - Duration::minutes(5));
        let err = handler(temp.path(), validator)
            .handle(EdgeRequest::new(Method::GET, &image_path(&token)))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn tee_commits_only_completed_bodies() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("ab/cd/complete.png");
        let fill = CacheFill::open(&target).await.expect("fill");
        let chunks = vec![Ok(Bytes::from_static(b"ab")), Ok(Bytes::from_static(b"cd"))];
        let collected: Vec<Bytes> = TeeStream::new(stream::iter(chunks).boxed(), fill)
            .try_collect()
            .await
            .expect("stream");
        assert_eq!(collected.concat(), b"abcd");
        assert_eq!(std::fs::read(&target).expect("committed"), b"abcd");

        let aborted = temp.path().join("ab/cd/aborted.png");
        let fill = CacheFill::open(&aborted).await.expect("fill");
        let chunks = vec![
            Ok(Bytes::from_static(b"ab")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
        ];
        let result: io::Result<Vec<Bytes>> = TeeStream::new(stream::iter(chunks).boxed(), fill)
            .try_collect()
            .await;
        assert!(result.is_err());
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!aborted.exists());
        let leftovers: Vec<_> = std::fs::read_dir(temp.path().join("ab/cd"))
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".part"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
