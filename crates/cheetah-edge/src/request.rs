use std::net::SocketAddr;

use http::header::{HeaderName, HOST, REFERER};
use http::{HeaderMap, HeaderValue, Method, Uri};

/// Request metadata the edge handlers act on. Bodies are never read: the
/// node only serves `GET`/`HEAD` image requests.
#[derive(Clone, Debug)]
pub struct EdgeRequest {
    method: Method,
    path: String,
    headers: HeaderMap,
    peer: SocketAddr,
}

impl EdgeRequest {
    pub fn from_http_parts(
        method: Method,
        uri: &Uri,
        headers: HeaderMap,
        peer: SocketAddr,
    ) -> Self {
        Self {
            method,
            path: uri.path().to_string(),
            headers,
            peer,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Raw request path, without query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn host(&self) -> Option<&str> {
        self.headers.get(HOST).and_then(|value| value.to_str().ok())
    }

    pub fn referer(&self) -> Option<&str> {
        self.headers.get(REFERER).and_then(|value| value.to_str().ok())
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// `host + path` as written to the access log lines.
    pub fn display_target(&self) -> String {
        format!("{}{}", self.host().unwrap_or_default(), self.path)
    }

    /// A request from loopback with no headers; add them with [`EdgeRequest::with_header`].
    pub fn new(method: Method, path: &str) -> Self {
        Self {
            method,
            path: path.to_string(),
            headers: HeaderMap::new(),
            peer: SocketAddr::from(([127, 0, 0, 1], 0)),
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_string_is_not_part_of_path() {
        let uri: Uri = "/token/data/abc/file.png?x=1".parse().expect("uri");
        let request = EdgeRequest::from_http_parts(
            Method::GET,
            &uri,
            HeaderMap::new(),
            SocketAddr::from(([10, 0, 0, 1], 4000)),
        );
        assert_eq!(request.path(), "/token/data/abc/file.png");
        assert_eq!(request.peer().port(), 4000);
    }

    #[test]
    fn display_target_joins_host_and_path() {
        let request = EdgeRequest::new(Method::GET, "/a/b")
            .with_header(HOST, HeaderValue::from_static("edge.example"));
        assert_eq!(request.display_target(), "edge.example/a/b");
        assert!(request.referer().is_none());
    }
}
