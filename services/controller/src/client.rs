//! HTTP client for host agents.
//!
//! One client serves every machine: each call takes the resolved endpoint
//! explicitly. Responses map onto the [`AgentError`] taxonomy at the point
//! of occurrence, so callers branch on error class instead of status codes.

use async_trait::async_trait;
use faultline_address::Endpoint;
use faultline_wire::{
    AgentError, AgentErrorBody, ApplyFaultRequest, ApplyFaultResponse, AuthenticateRequest,
    AuthenticateResponse, FaultId, FaultSpec, FaultState, HealthResponse, RecoverFaultResponse,
    SessionToken, VerifyFaultResponse,
};
use tracing::debug;

use crate::config::ControllerConfig;

/// The remote operations the controller performs against an agent.
#[async_trait]
pub trait AgentApi: Send + Sync + 'static {
    /// Establishes a session, exchanging credentials for a bearer token.
    async fn authenticate(
        &self,
        endpoint: &Endpoint,
        credentials: Option<&str>,
    ) -> Result<SessionToken, AgentError>;

    /// Injects a fault. Not idempotent; callers verify before repeating.
    async fn apply_fault(
        &self,
        endpoint: &Endpoint,
        token: &SessionToken,
        fault: &FaultSpec,
    ) -> Result<FaultState, AgentError>;

    /// Reports whether the fault is present on the host.
    async fn verify_fault(
        &self,
        endpoint: &Endpoint,
        token: &SessionToken,
        id: FaultId,
    ) -> Result<FaultState, AgentError>;

    /// Removes a fault. Idempotent: recovering an absent fault succeeds.
    async fn recover_fault(
        &self,
        endpoint: &Endpoint,
        token: &SessionToken,
        id: FaultId,
    ) -> Result<FaultState, AgentError>;

    /// Session keep-alive probe.
    async fn health_check(
        &self,
        endpoint: &Endpoint,
        token: &SessionToken,
    ) -> Result<HealthResponse, AgentError>;
}

/// Agent client over HTTP/JSON.
pub struct HttpAgent {
    client: reqwest::Client,
    action_timeout_ms: u64,
}

impl HttpAgent {
    /// Builds the client with the configured connect and action timeouts.
    pub fn new(config: &ControllerConfig) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.action_timeout)
            .build()
            .map_err(|e| AgentError::Protocol(e.to_string()))?;

        Ok(Self {
            client,
            action_timeout_ms: config.action_timeout.as_millis() as u64,
        })
    }

    fn map_transport_error(&self, err: reqwest::Error) -> AgentError {
        if err.is_timeout() {
            AgentError::Timeout(self.action_timeout_ms)
        } else if err.is_connect() {
            AgentError::Connect(err.to_string())
        } else if err.is_decode() {
            AgentError::Protocol(err.to_string())
        } else {
            AgentError::TransportReset(err.to_string())
        }
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, AgentError> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| self.map_transport_error(e));
        }

        let code = status.as_u16();
        let body = response.text().await.unwrap_or_default();
        if let Ok(parsed) = serde_json::from_str::<AgentErrorBody>(&body) {
            return Err(parsed.into_error(code));
        }

        Err(match code {
            401 | 403 => AgentError::AuthRejected,
            409 => AgentError::Conflict { active_kind: None },
            400 => AgentError::InvalidRequest(body),
            422 => AgentError::UnsupportedFault(body),
            _ => AgentError::Remote {
                status: code,
                message: body,
            },
        })
    }
}

#[async_trait]
impl AgentApi for HttpAgent {
    async fn authenticate(
        &self,
        endpoint: &Endpoint,
        credentials: Option<&str>,
    ) -> Result<SessionToken, AgentError> {
        let url = format!("{}/api/session", endpoint.base_url());
        debug!(url = %url, "Establishing agent session");

        let request = AuthenticateRequest {
            credentials: credentials.unwrap_or_default().to_string(),
        };
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let auth: AuthenticateResponse = self.decode(response).await?;
        Ok(auth.token)
    }

    async fn apply_fault(
        &self,
        endpoint: &Endpoint,
        token: &SessionToken,
        fault: &FaultSpec,
    ) -> Result<FaultState, AgentError> {
        let url = format!("{}/api/faults", endpoint.base_url());
        debug!(url = %url, fault = %fault.id, kind = %fault.kind, "Applying fault");

        let request = ApplyFaultRequest {
            fault: fault.clone(),
        };
        let response = self
            .client
            .post(&url)
            .bearer_auth(token.reveal())
            .json(&request)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let applied: ApplyFaultResponse = self.decode(response).await?;
        Ok(applied.state)
    }

    async fn verify_fault(
        &self,
        endpoint: &Endpoint,
        token: &SessionToken,
        id: FaultId,
    ) -> Result<FaultState, AgentError> {
        let url = format!("{}/api/faults/{}", endpoint.base_url(), id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(token.reveal())
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        // An agent with no record of the fault answers 404.
        if response.status().as_u16() == 404 {
            return Ok(FaultState::Absent);
        }

        let verified: VerifyFaultResponse = self.decode(response).await?;
        Ok(verified.state)
    }

    async fn recover_fault(
        &self,
        endpoint: &Endpoint,
        token: &SessionToken,
        id: FaultId,
    ) -> Result<FaultState, AgentError> {
        let url = format!("{}/api/faults/{}", endpoint.base_url(), id);
        debug!(url = %url, fault = %id, "Recovering fault");

        let response = self
            .client
            .delete(&url)
            .bearer_auth(token.reveal())
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        if response.status().as_u16() == 404 {
            return Ok(FaultState::Absent);
        }

        let recovered: RecoverFaultResponse = self.decode(response).await?;
        Ok(recovered.state)
    }

    async fn health_check(
        &self,
        endpoint: &Endpoint,
        token: &SessionToken,
    ) -> Result<HealthResponse, AgentError> {
        let url = format!("{}/api/health", endpoint.base_url());
        let response = self
            .client
            .get(&url)
            .bearer_auth(token.reveal())
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        self.decode(response).await
    }
}
