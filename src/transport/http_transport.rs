use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, warn};

use super::{BackendRequest, BackendTransport};
use crate::config::{BackendConfig, ServerConfig};
use crate::error::RelayError;
use crate::wire::UnitSource;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_ERROR_BODY_CHARS: usize = 2048;

fn build_reqwest_client(
    timeout: Duration,
    use_env_proxy: bool,
    proxy_url: Option<&str>,
) -> Result<reqwest::Client, RelayError> {
    let mut builder = reqwest::Client::builder()
        .tcp_nodelay(true)
        .connect_timeout(CONNECT_TIMEOUT)
        .redirect(reqwest::redirect::Policy::none())
        .timeout(timeout);

    if let Some(proxy_url) = proxy_url {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|err| RelayError::Transport(format!("Invalid proxy URL: {err}")))?;
        builder = builder.no_proxy().proxy(proxy);
    } else if !use_env_proxy {
        builder = builder.no_proxy();
    }

    builder
        .build()
        .map_err(|err| RelayError::Transport(format!("Failed to build HTTP client: {err}")))
}

/// reqwest-backed transport to framed backends.
///
/// Backends with their own `proxy` get a dedicated client built up front.
pub struct HttpTransport {
    client: reqwest::Client,
    proxy_clients: HashMap<String, reqwest::Client>,
}

impl HttpTransport {
    /// # Errors
    ///
    /// Returns [`RelayError::Transport`] when a client cannot be built.
    pub fn new(server: &ServerConfig, backends: &[BackendConfig]) -> Result<Self, RelayError> {
        let timeout = Duration::from_secs(server.timeout);
        let client = build_reqwest_client(timeout, server.http_use_env_proxy, None)?;

        let mut proxy_clients = HashMap::new();
        for proxy_url in backends.iter().filter_map(|backend| backend.proxy.as_deref()) {
            if proxy_url.is_empty() || proxy_clients.contains_key(proxy_url) {
                continue;
            }
            let proxied = build_reqwest_client(timeout, server.http_use_env_proxy, Some(proxy_url))?;
            proxy_clients.insert(proxy_url.to_string(), proxied);
        }

        Ok(Self {
            client,
            proxy_clients,
        })
    }

    fn client_for(&self, backend: &BackendConfig) -> &reqwest::Client {
        backend
            .proxy
            .as_deref()
            .and_then(|proxy_url| self.proxy_clients.get(proxy_url))
            .unwrap_or(&self.client)
    }
}

impl BackendTransport for HttpTransport {
    async fn open(
        &self,
        backend: &BackendConfig,
        request: BackendRequest,
    ) -> Result<UnitSource, RelayError> {
        let body = serde_json::to_vec(&request)
            .map_err(|err| RelayError::Internal(format!("Failed to encode backend request: {err}")))?;

        let mut builder = self
            .client_for(backend)
            .post(backend.base_url.as_str())
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(api_key) = backend.api_key.as_deref().filter(|key| !key.is_empty()) {
            builder = builder.bearer_auth(api_key);
        }

        debug!(
            backend = %backend.name,
            model = %request.model,
            stream = request.stream,
            messages = request.messages.len(),
            "opening backend stream"
        );
        let response = builder
            .send()
            .await
            .map_err(|err| RelayError::Transport(format!("Request to '{}' failed: {err}", backend.name)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message: String = text.chars().take(MAX_ERROR_BODY_CHARS).collect();
            warn!(backend = %backend.name, status = status.as_u16(), "backend rejected request");
            return Err(RelayError::Backend {
                status: status.as_u16(),
                message,
            });
        }

        Ok(UnitSource::from_byte_stream(response.bytes_stream()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(proxy: Option<&str>) -> BackendConfig {
        BackendConfig {
            name: "b".to_string(),
            base_url: "http://127.0.0.1:1/v1/stream".to_string(),
            api_key: None,
            models: vec!["m".to_string()],
            is_default: true,
            proxy: proxy.map(str::to_string),
        }
    }

    #[test]
    fn proxy_clients_are_built_per_distinct_url() {
        let backends = vec![
            backend(Some("http://127.0.0.1:3128")),
            backend(Some("http://127.0.0.1:3128")),
            backend(None),
        ];
        let transport = HttpTransport::new(&ServerConfig::default(), &backends).expect("transport");
        assert_eq!(transport.proxy_clients.len(), 1);
    }

    #[test]
    fn invalid_proxy_is_transport_error() {
        let result = HttpTransport::new(&ServerConfig::default(), &[backend(Some("::not a url::"))]);
        assert!(matches!(result, Err(RelayError::Transport(_))));
    }

    #[tokio::test]
    async fn unreachable_backend_is_transport_error() {
        let transport = HttpTransport::new(&ServerConfig::default(), &[]).expect("transport");
        let request = BackendRequest {
            model: "m".to_string(),
            messages: Vec::new(),
            prompt: "hi".to_string(),
            stream: false,
        };
        let result = transport.open(&backend(None), request).await;
        assert!(matches!(result, Err(RelayError::Transport(_))));
    }
}
