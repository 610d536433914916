//! Publishing staged values to the openHAB REST API.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::blocking::Client;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::error::FronmodError;
use crate::processor::SendValue;
use crate::registers::published_items;

/// Consumer of drained send-queue entries.
pub trait ValueSink {
    /// Publishes a drained batch of values.
    fn publish(&mut self, values: &[SendValue]) -> Result<(), FronmodError>;

    /// Pushes a NULL state for every known output name so displays do not
    /// go stale after shutdown.
    fn reset_all(&mut self) -> Result<(), FronmodError>;
}

/// openHAB REST gateway.
///
/// Numeric values go out as item commands, null values as NULL state
/// updates. Entries flagged publish-only-if-changed are skipped while the
/// last successfully sent state is identical.
pub struct OhGateway {
    base_url: String,
    api_token: Option<String>,
    client: Client,
    last_sent: HashMap<&'static str, String>,
}

impl OhGateway {
    /// Builds the HTTP client from the gateway configuration.
    ///
    /// # Errors
    ///
    /// Fails when the underlying client cannot be constructed.
    pub fn new(config: &GatewayConfig) -> Result<Self, FronmodError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|err| FronmodError::Gateway(err.to_string()))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
            client,
            last_sent: HashMap::new(),
        })
    }

    fn send(&self, item: &str, state: &str, as_command: bool) -> Result<(), FronmodError> {
        let request = if as_command {
            // POST /rest/items/{item} issues a command
            self.client
                .post(format!("{}/rest/items/{item}", self.base_url))
        } else {
            // PUT /rest/items/{item}/state forces a state update
            self.client
                .put(format!("{}/rest/items/{item}/state", self.base_url))
        };

        let request = request
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(state.to_string());
        let request = match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        let response = request
            .send()
            .map_err(|err| FronmodError::Gateway(err.to_string()))?;
        if !response.status().is_success() {
            return Err(FronmodError::Gateway(format!(
                "item {item}: status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Textual openHAB state for a value; unknown maps to `NULL`.
pub(crate) fn format_state(value: Option<f64>) -> String {
    match value {
        Some(value) => format!("{value}"),
        None => "NULL".to_string(),
    }
}

impl ValueSink for OhGateway {
    fn publish(&mut self, values: &[SendValue]) -> Result<(), FronmodError> {
        for value in values {
            let state = format_state(value.value);
            if value.only_if_changed && self.last_sent.get(value.name) == Some(&state) {
                debug!(item = value.name, state, "unchanged, not published");
                continue;
            }
            self.send(value.name, &state, value.value.is_some())?;
            debug!(item = value.name, state, "published");
            self.last_sent.insert(value.name, state);
        }
        Ok(())
    }

    fn reset_all(&mut self) -> Result<(), FronmodError> {
        info!("resetting all published items to NULL");
        for name in published_items() {
            // best effort on the shutdown path
            if let Err(err) = self.send(name, "NULL", false) {
                warn!(item = name, "reset failed: {err}");
            }
        }
        self.last_sent.clear();
        Ok(())
    }
}
