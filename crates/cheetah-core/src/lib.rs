//! Runtime pieces of the cheetah edge node.
//!
//! - [`tls::TlsIdentityProvider`] holds the rotating certificate and resolves it per
//!   handshake.
//! - [`server::EdgeServer`] accepts plain or TLS connections, dispatches them to a
//!   [`cheetah_edge::ServeHandler`] and drains them on shutdown.
//! - [`control::ControlSession`] talks to the control plane and feeds the origin, the
//!   TLS identity and the token key into the serving path.

pub mod control;
pub mod server;
pub mod tls;

pub use control::{
    normalize_cache_size, ControlError, ControlPlaneConfig, ControlSession, PingResponse,
    SessionConfig, SessionHandles, BUILD_VERSION, DEFAULT_CACHE_SIZE, DEFAULT_CONTROL_PLANE_URL,
    DEFAULT_UPSTREAM_URL, HEARTBEAT_INTERVAL, MIN_CACHE_SIZE,
};
pub use server::{
    DrainOutcome, DrainSettings, EdgeServer, ServerError, ServerSettings, ServerTimeouts,
};
pub use tls::{TlsError, TlsIdentityProvider, TlsMaterial};
