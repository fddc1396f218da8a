//! Manager for models served by another service
//!
//! Operations become HTTP calls against `{base_url}/{resource}`. Responses
//! are mapped back onto the same typed errors a local manager raises, so a
//! caller cannot tell the two apart. Calls are never retried.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};
use uuid::Uuid;

use crate::config::HttpClientConfig;
use crate::data_access::DataAccess;
use crate::error::{Error, ErrorDetail, ErrorKind, Result};
use crate::models::filter::ListQuery;
use crate::models::record::{Attributes, PaginatedResponse, Record};
use crate::models::registry::{AuthStrategy, ModelInfo, RemoteConfig};

/// HTTP client shared by every remote manager.
///
/// reqwest only bounds the connections it keeps idle, so a semaphore caps
/// the requests in flight across all remote services.
#[derive(Debug, Clone)]
pub struct RemoteClient {
    http: Client,
    in_flight: Arc<Semaphore>,
}

impl RemoteClient {
    pub fn new(config: &HttpClientConfig) -> Result<Self> {
        if config.max_in_flight == 0 {
            return Err(Error::ConfigurationError(
                "http_client.max_in_flight must be at least 1".to_string(),
            ));
        }
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .connect_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .build()
            .map_err(|e| Error::ConfigurationError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight)),
        })
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    /// Wait for a request slot; the call holds it until its response is read
    pub async fn permit(&self) -> Result<SemaphorePermit<'_>> {
        self.in_flight
            .acquire()
            .await
            .map_err(|_| Error::Internal("HTTP client has been shut down".to_string()))
    }

    /// Request slots currently free
    pub fn available(&self) -> usize {
        self.in_flight.available_permits()
    }
}

/// CRUD over HTTP against the owning service
pub struct RemoteManager {
    info: Arc<ModelInfo>,
    remote: RemoteConfig,
    client: RemoteClient,
    credential: Option<String>,
}

impl RemoteManager {
    pub fn new(
        info: Arc<ModelInfo>,
        remote: RemoteConfig,
        client: RemoteClient,
        credential: Option<String>,
    ) -> Self {
        Self {
            info,
            remote,
            client,
            credential,
        }
    }

    pub fn info(&self) -> &ModelInfo {
        &self.info
    }

    fn collection_url(&self) -> String {
        format!(
            "{}/{}",
            self.remote.base_url.trim_end_matches('/'),
            self.info.resource
        )
    }

    fn item_url(&self, id: Uuid) -> String {
        format!("{}/{}", self.collection_url(), id)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.remote.auth {
            AuthStrategy::Forward => match &self.credential {
                Some(credential) => request.bearer_auth(credential),
                None => request,
            },
            AuthStrategy::ServiceToken { token } => request.bearer_auth(token),
            AuthStrategy::None => request,
        }
    }

    fn communication_error(&self, url: &str, status: Option<u16>, message: String) -> Error {
        Error::ServiceCommunication {
            message: format!("{}: {}", self.remote.service, message),
            status,
            url: url.to_string(),
        }
    }

    /// Send a request and map any non-2xx answer onto a typed error
    async fn send(
        &self,
        request: RequestBuilder,
        url: &str,
        id: Option<Uuid>,
        expected_lsn: Option<i64>,
    ) -> Result<Response> {
        tracing::debug!(service = %self.remote.service, %url, "Calling remote service");

        let response = self.authorize(request).send().await.map_err(|e| {
            let message = if e.is_timeout() {
                "request timed out".to_string()
            } else if e.is_connect() {
                format!("connection failed: {}", e)
            } else {
                e.to_string()
            };
            tracing::warn!(service = %self.remote.service, %url, error = %message, "Remote call failed");
            self.communication_error(url, None, message)
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let error = self.map_status(status, &body, url, id, expected_lsn);
        tracing::debug!(service = %self.remote.service, %url, status = status.as_u16(), error = %error, "Remote call rejected");
        Err(error)
    }

    fn map_status(
        &self,
        status: StatusCode,
        body: &str,
        url: &str,
        id: Option<Uuid>,
        expected_lsn: Option<i64>,
    ) -> Error {
        let detail: Option<ErrorDetail> = serde_json::from_str(body).ok();
        let message = detail
            .as_ref()
            .map(|d| d.message.clone())
            .unwrap_or_else(|| body.to_string());

        match (status, id) {
            (StatusCode::NOT_FOUND, Some(id)) => Error::NotFound {
                model: self.info.name.clone(),
                id,
            },
            (StatusCode::CONFLICT, _) => match detail {
                Some(detail) if detail.kind == ErrorKind::Duplicate => Error::Duplicate(message),
                Some(detail) if detail.kind == ErrorKind::Conflict => Error::Conflict {
                    model: self.info.name.clone(),
                    id: detail.id.or(id).unwrap_or_default(),
                    expected: detail.expected_lsn.or(expected_lsn).unwrap_or_default(),
                    actual: detail.actual_lsn.unwrap_or_default(),
                },
                _ => self.communication_error(url, Some(status.as_u16()), message),
            },
            (StatusCode::UNPROCESSABLE_ENTITY, _) => Error::Validation(message),
            (StatusCode::FORBIDDEN, _) => Error::PermissionDenied(message),
            _ => self.communication_error(url, Some(status.as_u16()), message),
        }
    }

    async fn decode<T: DeserializeOwned>(&self, response: Response, url: &str) -> Result<T> {
        let status = response.status().as_u16();
        response.json::<T>().await.map_err(|e| {
            self.communication_error(url, Some(status), format!("undecodable response: {}", e))
        })
    }
}

#[async_trait]
impl DataAccess for RemoteManager {
    fn model_name(&self) -> &str {
        &self.info.name
    }

    async fn list(&self, query: ListQuery) -> Result<PaginatedResponse> {
        let _permit = self.client.permit().await?;
        let url = self.collection_url();
        let request = self.client.http().get(&url).query(&query.to_query_pairs());
        let response = self.send(request, &url, None, None).await?;
        self.decode(response, &url).await
    }

    async fn get(&self, id: Uuid) -> Result<Record> {
        let _permit = self.client.permit().await?;
        let url = self.item_url(id);
        let response = self
            .send(self.client.http().get(&url), &url, Some(id), None)
            .await?;
        self.decode(response, &url).await
    }

    async fn create(&self, payload: Attributes) -> Result<Record> {
        let _permit = self.client.permit().await?;
        let url = self.collection_url();
        let request = self.client.http().post(&url).json(&payload);
        let response = self.send(request, &url, None, None).await?;
        self.decode(response, &url).await
    }

    async fn update(
        &self,
        id: Uuid,
        payload: Attributes,
        expected_lsn: Option<i64>,
    ) -> Result<Record> {
        let _permit = self.client.permit().await?;
        let url = self.item_url(id);
        let mut body = payload;
        if let Some(lsn) = expected_lsn {
            body.insert("expected_lsn".to_string(), Value::from(lsn));
        }
        let request = self.client.http().put(&url).json(&body);
        let response = self.send(request, &url, Some(id), expected_lsn).await?;
        self.decode(response, &url).await
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let _permit = self.client.permit().await?;
        let url = self.item_url(id);
        self.send(self.client.http().delete(&url), &url, Some(id), None)
            .await?;
        Ok(())
    }
}
