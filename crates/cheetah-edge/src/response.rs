use std::io;

use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use http::{
    header::{HeaderName, HeaderValue},
    HeaderMap, StatusCode,
};
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Empty, Full, StreamBody};
use hyper::body::Frame;

use crate::error::EdgeError;

/// Body type shared by every edge response; file and upstream bodies are streamed.
pub type EdgeBody = UnsyncBoxBody<Bytes, io::Error>;

/// Represents a response produced by one of the edge handlers.
pub struct EdgeResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: EdgeBody,
}

impl EdgeResponse {
    /// Create a new response with the provided status code and empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: empty_body(),
        }
    }

    /// Convenience constructor for a 200 OK response.
    pub fn ok() -> Self {
        Self::new(StatusCode::OK)
    }

    /// Set the response body directly from bytes.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Full::new(body.into())
            .map_err(|never| match never {})
            .boxed_unsync();
        self
    }

    /// Stream the response body from a fallible byte stream.
    pub fn with_stream<S>(mut self, stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, io::Error>> + Send + 'static,
    {
        self.body = StreamBody::new(stream.map_ok(Frame::data)).boxed_unsync();
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Insert or replace a header value.
    pub fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.insert(name, value);
    }

    /// Append a header without removing existing values.
    pub fn append_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.append(name, value);
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Convert into a hyper response ready to be written to the connection.
    pub fn into_hyper(self) -> http::Response<EdgeBody> {
        let mut response = http::Response::new(self.body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }

    /// Drain the body into memory.
    pub async fn into_bytes(self) -> Result<Bytes, io::Error> {
        Ok(self.body.collect().await?.to_bytes())
    }
}

impl std::fmt::Debug for EdgeResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdgeResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Errors collapse to a bare status line; detail only goes to the log.
impl From<EdgeError> for EdgeResponse {
    fn from(err: EdgeError) -> Self {
        EdgeResponse::new(err.status_code())
    }
}

fn empty_body() -> EdgeBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::ValidationError;
    use futures_util::stream;

    #[tokio::test]
    async fn streamed_body_is_concatenated() {
        let chunks = vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ];
        let response = EdgeResponse::ok().with_stream(stream::iter(chunks));
        let body = response.into_bytes().await.expect("body");
        assert_eq!(&body[..], b"hello world");
    }

    #[tokio::test]
    async fn forbidden_error_has_no_body() {
        let response = EdgeResponse::from(EdgeError::Forbidden(ValidationError::PathPattern));
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(response.into_bytes().await.expect("body").is_empty());
    }
}
