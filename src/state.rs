mod request_id;

use crate::config::AppConfig;
use crate::error::RelayError;
use crate::transport::HttpTransport;

use request_id::RequestIdGenerator;

/// Shared application state accessible to all handlers.
pub struct AppState {
    pub config: AppConfig,
    pub transport: HttpTransport,
    request_ids: RequestIdGenerator,
}

impl AppState {
    /// Build the state and the backend transport for `config`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Transport`] when an HTTP client cannot be built.
    pub fn new(config: AppConfig) -> Result<Self, RelayError> {
        let transport = HttpTransport::new(&config.server, &config.backends)?;
        Ok(Self {
            config,
            transport,
            request_ids: RequestIdGenerator::new(),
        })
    }

    /// Id used to correlate the log lines of one chat request.
    #[must_use]
    pub fn next_request_id(&self) -> uuid::Uuid {
        self.request_ids.next()
    }
}
