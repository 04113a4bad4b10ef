mod classify;
mod dispatch;
mod error;
mod headers;
mod health;
mod stream;
mod upstream;
mod usage;

pub use classify::{FailureAction, classify_failure};
pub use dispatch::{
    AuthContext, ClientRequest, DispatchConfig, DispatchReply, Dispatcher, ReplyBody,
};
pub use error::{ClientFacingError, GatewayError};
pub use headers::{build_upstream_headers, build_upstream_url};
pub use health::{AdaptiveRpmConfig, HealthConfig, HealthMonitor};
pub use stream::{StreamOutcome, StreamProcessorConfig};
pub use upstream::{
    UpstreamBody, UpstreamClient, UpstreamClientConfig, UpstreamError, UpstreamRequest,
    UpstreamResponse, WreqUpstreamClient,
};
