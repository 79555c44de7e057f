use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use shared::{
    domain::ServiceIdKind,
    error::{ApiError, ApiException, ErrorCode},
    protocol::{PreKeyUploadRequest, VerifyAccountRequest, VerifyAccountResponse},
};
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

/// Status the server answers with once this client build is no longer accepted.
const DEPRECATED_CLIENT_STATUS: u16 = 499;

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("invalid server url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("request to {path} failed: {source}")]
    Transport {
        path: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{path} rejected with status {status}: {error}")]
    Rejected {
        path: String,
        status: u16,
        #[source]
        error: ApiException,
    },
    #[error("this client build is deprecated and must be updated")]
    Deprecated,
}

impl NetworkError {
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Rejected { error, .. } => Some(error.code),
            Self::Deprecated => Some(ErrorCode::Deprecated),
            _ => None,
        }
    }
}

#[async_trait]
pub trait RegistrationApi: Send + Sync {
    async fn verify_account(
        &self,
        request: &VerifyAccountRequest,
        credentials: &Credentials,
    ) -> Result<VerifyAccountResponse, NetworkError>;

    async fn set_pre_keys(
        &self,
        kind: ServiceIdKind,
        upload: &PreKeyUploadRequest,
        credentials: &Credentials,
    ) -> Result<(), NetworkError>;
}

pub struct HttpRegistrationApi {
    http: Client,
    base_url: Url,
    deprecated: AtomicBool,
}

impl HttpRegistrationApi {
    pub fn new(server_url: &str, timeout: Duration) -> Result<Self, NetworkError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| NetworkError::Transport {
                path: server_url.to_string(),
                source,
            })?;
        Ok(Self {
            http,
            base_url: Url::parse(server_url)?,
            deprecated: AtomicBool::new(false),
        })
    }

    /// Set once any response carried the deprecated-client status.
    pub fn is_deprecated(&self) -> bool {
        self.deprecated.load(Ordering::SeqCst)
    }

    async fn send(&self, path: &str, request: RequestBuilder) -> Result<Response, NetworkError> {
        let response = request
            .send()
            .await
            .map_err(|source| NetworkError::Transport {
                path: path.to_string(),
                source,
            })?;
        let status = response.status();
        if status.as_u16() == DEPRECATED_CLIENT_STATUS {
            if !self.deprecated.swap(true, Ordering::SeqCst) {
                warn!(path, "network: server reports this client build as deprecated");
            }
            return Err(NetworkError::Deprecated);
        }
        if status.is_success() {
            return Ok(response);
        }
        Err(NetworkError::Rejected {
            path: path.to_string(),
            status: status.as_u16(),
            error: Self::api_error(status, response).await.into(),
        })
    }

    async fn api_error(status: StatusCode, response: Response) -> ApiError {
        let body = response.text().await.unwrap_or_default();
        serde_json::from_str::<ApiError>(&body).unwrap_or_else(|_| {
            let message = if body.trim().is_empty() {
                status.canonical_reason().unwrap_or("request failed").to_string()
            } else {
                body
            };
            ApiError::new(ErrorCode::from_status(status.as_u16()), message)
        })
    }
}

#[async_trait]
impl RegistrationApi for HttpRegistrationApi {
    async fn verify_account(
        &self,
        request: &VerifyAccountRequest,
        credentials: &Credentials,
    ) -> Result<VerifyAccountResponse, NetworkError> {
        let path = "/v1/registration";
        let url = self.base_url.join(path)?;
        let response = self
            .send(
                path,
                self.http
                    .post(url)
                    .basic_auth(&credentials.username, Some(&credentials.password))
                    .json(request),
            )
            .await?;
        let verified = response
            .json::<VerifyAccountResponse>()
            .await
            .map_err(|source| NetworkError::Transport {
                path: path.to_string(),
                source,
            })?;
        info!(
            aci = %verified.aci.0,
            reregistration = verified.reregistration,
            "network: account verified"
        );
        Ok(verified)
    }

    async fn set_pre_keys(
        &self,
        kind: ServiceIdKind,
        upload: &PreKeyUploadRequest,
        credentials: &Credentials,
    ) -> Result<(), NetworkError> {
        let path = "/v2/keys";
        let mut url = self.base_url.join(path)?;
        url.query_pairs_mut().append_pair("identity", kind.as_str());
        self.send(
            path,
            self.http
                .put(url)
                .basic_auth(&credentials.username, Some(&credentials.password))
                .json(upload),
        )
        .await?;
        info!(
            namespace = %kind,
            signed_pre_key_id = upload.signed_pre_key.key_id.0,
            "network: prekeys uploaded"
        );
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/network_tests.rs"]
mod tests;
