use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use http::header::HeaderName;
use http::Method;
use reqwest::{Client, Url};
use tracing::{debug, warn};

use crate::error::{EdgeError, EdgeResult};
use crate::request::EdgeRequest;
use crate::response::EdgeResponse;
use crate::serve::{ensure_readable, ServeHandler};
use crate::validator::RequestValidator;

/// Connection settings for requests to the image origin.
#[derive(Debug, Clone)]
pub struct UpstreamTuning {
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub tcp_keepalive: Duration,
}

impl Default for UpstreamTuning {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(90),
            tcp_keepalive: Duration::from_secs(60),
        }
    }
}

impl UpstreamTuning {
    /// Build the shared upstream client. No overall response timeout is set since bodies
    /// are streamed to the client as they arrive.
    pub fn build_client(&self) -> EdgeResult<Client> {
        Client::builder()
            .pool_idle_timeout(Some(self.idle_timeout))
            .connect_timeout(self.connect_timeout)
            .tcp_keepalive(Some(self.tcp_keepalive))
            .build()
            .map_err(|err| EdgeError::Config(format!("failed to build upstream client: {err}")))
    }
}

/// Pass-through handler: authorizes, then streams the image from the first origin.
pub struct ProxyHandler {
    client: Client,
    origins: Vec<Url>,
    validator: Arc<RequestValidator>,
}

impl ProxyHandler {
    pub fn new(
        origins: &[String],
        validator: Arc<RequestValidator>,
        tuning: &UpstreamTuning,
    ) -> EdgeResult<Self> {
        let origins = origins
            .iter()
            .map(|origin| origin.trim())
            .filter(|origin| !origin.is_empty())
            .map(|origin| {
                Url::parse(origin).map_err(|err| {
                    EdgeError::Config(format!("invalid proxy origin '{origin}': {err}"))
                })
            })
            .collect::<EdgeResult<Vec<_>>>()?;
        if origins.is_empty() {
            return Err(EdgeError::Config(
                "proxy mode requires at least one origin".into(),
            ));
        }

        Ok(Self {
            client: tuning.build_client()?,
            origins,
            validator,
        })
    }

    /// Origin selection is always the first configured entry.
    fn origin(&self) -> &Url {
        &self.origins[0]
    }
}

#[async_trait]
impl ServeHandler for ProxyHandler {
    async fn handle(&self, request: EdgeRequest) -> EdgeResult<EdgeResponse> {
        ensure_readable(&request)?;
        let validated = self.validator.authorize(&request)?;

        let url = format!(
            "{}{}",
            self.origin().as_str().trim_end_matches('/'),
            validated.canonical_path
        );
        let upstream = self
            .client
            .request(request.method().clone(), &url)
            .send()
            .await
            .map_err(|err| {
                warn!(target: "cheetah::proxy", url = %url, error = %err, "failed to receive image from upstream server");
                EdgeError::Upstream(err)
            })?;

        let mut response = EdgeResponse::new(upstream.status());
        mirror_headers(upstream.headers(), &mut response);
        debug!(target: "cheetah::access", peer = %request.peer(), url = %url, "response proxied");
        if request.method() == Method::HEAD {
            return Ok(response);
        }
        Ok(response.with_stream(upstream.bytes_stream().map_err(io::Error::other)))
    }
}

/// Copy upstream headers onto the response, minus connection-scoped ones.
pub(crate) fn mirror_headers(upstream: &http::HeaderMap, response: &mut EdgeResponse) {
    for (name, value) in upstream.iter() {
        if is_hop_by_hop(name) {
            continue;
        }
        response.append_header(name.clone(), value.clone());
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    let name = name.as_str();
    name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("keep-alive")
        || name.eq_ignore_ascii_case("proxy-connection")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("upgrade")
        || name.eq_ignore_ascii_case("te")
        || name.eq_ignore_ascii_case("trailer")
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{CONNECTION, CONTENT_TYPE};
    use http::{HeaderMap, HeaderValue, StatusCode};

    #[test]
    fn rejects_empty_origin_list() {
        let validator = Arc::new(RequestValidator::disabled());
        let err = ProxyHandler::new(&[" ".to_string()], validator, &UpstreamTuning::default())
            .err()
            .expect("empty origins rejected");
        assert!(matches!(err, EdgeError::Config(_)));
    }

    #[test]
    fn first_origin_wins() {
        let validator = Arc::new(RequestValidator::disabled());
        let handler = ProxyHandler::new(
            &["https://a.example".to_string(), "https://b.example".to_string()],
            validator,
            &UpstreamTuning::default(),
        )
        .expect("handler");
        assert_eq!(handler.origin().host_str(), Some("a.example"));
    }

    #[test]
    fn mirrors_end_to_end_headers_only() {
        let mut upstream = HeaderMap::new();
        upstream.insert(CONTENT_TYPE, HeaderValue::from_static("image/png"));
        upstream.insert(CONNECTION, HeaderValue::from_static("close"));
        upstream.append("x-origin", HeaderValue::from_static("a"));
        upstream.append("x-origin", HeaderValue::from_static("b"));

        let mut response = EdgeResponse::new(StatusCode::OK);
        mirror_headers(&upstream, &mut response);
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "image/png");
        assert!(response.headers().get(CONNECTION).is_none());
        assert_eq!(response.headers().get_all("x-origin").iter().count(), 2);
    }
}
