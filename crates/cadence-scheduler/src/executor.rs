//! Invocation of schedule actions against their targets.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header::CONTENT_TYPE, Client, Method};
use tracing::debug;

use cadence_core::config::ClientsConfig;
use cadence_core::{ActionTarget, CadenceError, CorrelationId, Result, ScheduleAction, ScheduleJob};

pub const CORRELATION_HEADER: &str = "X-Correlation-ID";

/// Performs one action. Retry semantics, if any, belong to the implementation.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(
        &self,
        job: &ScheduleJob,
        action: &ScheduleAction,
        correlation_id: &CorrelationId,
    ) -> Result<()>;
}

/// HTTP executor: REST targets go straight to their address, device control
/// targets become a `PUT` on the core-command service.
pub struct HttpActionExecutor {
    client: Client,
    core_command_url: String,
}

impl HttpActionExecutor {
    pub fn new(config: &ClientsConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| CadenceError::Server(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            core_command_url: config.core_command_url.trim_end_matches('/').to_string(),
        })
    }

    fn device_command_url(&self, device_name: &str, source_name: &str) -> String {
        format!(
            "{}/api/v3/device/name/{}/{}",
            self.core_command_url, device_name, source_name
        )
    }
}

#[async_trait]
impl ActionExecutor for HttpActionExecutor {
    async fn execute(
        &self,
        job: &ScheduleJob,
        action: &ScheduleAction,
        correlation_id: &CorrelationId,
    ) -> Result<()> {
        let request = match &action.target {
            ActionTarget::Rest {
                method,
                address,
                content_type,
            } => {
                let method = Method::from_bytes(method.to_uppercase().as_bytes()).map_err(|_| {
                    CadenceError::ContractInvalid(format!("unsupported HTTP method '{method}'"))
                })?;
                let mut request = self.client.request(method, address);
                match &action.payload {
                    serde_json::Value::Null => {}
                    // string payloads are sent verbatim
                    serde_json::Value::String(body) => {
                        let ct = content_type.as_deref().unwrap_or("text/plain");
                        request = request.header(CONTENT_TYPE, ct).body(body.clone());
                    }
                    other => {
                        let ct = content_type.as_deref().unwrap_or("application/json");
                        request = request
                            .header(CONTENT_TYPE, ct)
                            .body(serde_json::to_vec(other)?);
                    }
                }
                request
            }
            ActionTarget::DeviceControl {
                device_name,
                source_name,
            } => self
                .client
                .put(self.device_command_url(device_name, source_name))
                .json(&action.payload),
        };

        let response = request
            .header(CORRELATION_HEADER, correlation_id.as_str())
            .send()
            .await
            .map_err(|e| {
                CadenceError::Server(format!(
                    "action {} of job '{}' failed: {e}",
                    action.id, job.name
                ))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(CadenceError::Server(format!(
                "action {} of job '{}' returned HTTP {status}",
                action.id, job.name
            )));
        }
        debug!(
            job = %job.name,
            action = %action.id,
            %status,
            correlation_id = %correlation_id,
            "action executed"
        );
        Ok(())
    }
}
