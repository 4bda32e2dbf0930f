mod http_transport;

use std::future::Future;

use serde::Serialize;

use crate::config::BackendConfig;
use crate::error::RelayError;
use crate::protocol::canonical::CanonicalMessage;
use crate::wire::UnitSource;

pub use http_transport::HttpTransport;

/// Body POSTed to a framed backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendRequest {
    pub model: String,
    pub messages: Vec<CanonicalMessage>,
    pub prompt: String,
    pub stream: bool,
}

/// Opens one backend response as a queue of decoded units.
pub trait BackendTransport: Send + Sync {
    /// # Errors
    ///
    /// Returns [`RelayError::Transport`] when the request cannot be sent and
    /// [`RelayError::Backend`] for a non-2xx status.
    fn open(
        &self,
        backend: &BackendConfig,
        request: BackendRequest,
    ) -> impl Future<Output = Result<UnitSource, RelayError>> + Send;
}
