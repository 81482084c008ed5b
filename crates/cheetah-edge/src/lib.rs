//! Request handling for the cheetah image edge node: token validation, the disk-backed
//! cache and the pass-through proxy.

pub mod cache;
pub mod error;
pub mod layout;
pub mod origin;
pub mod proxy;
pub mod request;
pub mod response;
pub mod serve;
pub mod validator;

pub use cache::CacheHandler;
pub use error::{EdgeError, EdgeResult};
pub use origin::{OriginController, OriginHandle};
pub use proxy::{ProxyHandler, UpstreamTuning};
pub use request::EdgeRequest;
pub use response::{EdgeBody, EdgeResponse};
pub use serve::{respond, ServeHandler};
pub use validator::{
    AllowAnyReferer, KeyUpdateError, PathToken, RefererPolicy, RequestValidator, ValidatedPath,
    ValidationError, ValidatorState,
};
