use async_trait::async_trait;
use http::Method;
use tracing::warn;

use crate::error::{EdgeError, EdgeResult};
use crate::request::EdgeRequest;
use crate::response::EdgeResponse;

/// A request handler the edge server dispatches every request to.
///
/// Both the disk-backed cache and the pass-through proxy implement this trait; the
/// binary picks one at startup.
#[async_trait]
pub trait ServeHandler: Send + Sync {
    async fn handle(&self, request: EdgeRequest) -> EdgeResult<EdgeResponse>;
}

/// Run a handler and turn any error into its bare status response.
pub async fn respond(handler: &dyn ServeHandler, request: EdgeRequest) -> EdgeResponse {
    let peer = request.peer();
    match handler.handle(request).await {
        Ok(response) => response,
        Err(err) => {
            if !matches!(err, EdgeError::Forbidden(_) | EdgeError::MethodNotAllowed(_)) {
                warn!(target: "cheetah::server", %peer, error = %err, "request failed");
            }
            EdgeResponse::from(err)
        }
    }
}

/// Images are read-only resources.
pub(crate) fn ensure_readable(request: &EdgeRequest) -> EdgeResult<()> {
    let method = request.method();
    if method == Method::GET || method == Method::HEAD {
        Ok(())
    } else {
        Err(EdgeError::MethodNotAllowed(method.to_string()))
    }
}
