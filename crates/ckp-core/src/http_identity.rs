#![cfg(feature = "http-client")]

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Response, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::ServiceError;
use crate::queue::{PublishAck, RemoteIdentityService};
use crate::types::RemoteIdentityRecord;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Identity service client over HTTPS.
///
/// `GET  {base}/v1/identity-keys/{peer_id}` lists records for a peer.
/// `POST {base}/v1/identity-keys/{peer_id}` publishes an issued key.
///
/// The peer id is percent-encoded as a single path segment.
#[derive(Clone)]
pub struct HttpIdentityService {
    base_url: Url,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct PublishBody<'a> {
    #[serde(with = "hex")]
    identity_public_key: &'a [u8; 32],
    #[serde(with = "hex")]
    derived_public_key: &'a [u8; 32],
}

impl HttpIdentityService {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ServiceError> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ServiceError> {
        let base_url = Url::parse(&base_url.into())
            .map_err(|e| ServiceError::Transport(format!("invalid base url: {}", e)))?;
        if base_url.cannot_be_a_base() {
            return Err(ServiceError::Transport(format!(
                "invalid base url: {}",
                base_url
            )));
        }
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::Transport(e.to_string()))?;
        Ok(Self { base_url, client })
    }

    fn records_url(&self, peer_id: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["v1", "identity-keys", peer_id]);
        }
        url
    }

    async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, ServiceError> {
        let status = resp.status();
        if !status.is_success() {
            return Err(ServiceError::Rejected {
                status: status.as_u16(),
                message: resp.text().await.unwrap_or_default(),
            });
        }
        let body = resp
            .bytes()
            .await
            .map_err(|e| ServiceError::Transport(e.to_string()))?;
        serde_json::from_slice(&body).map_err(|e| ServiceError::BadResponse(e.to_string()))
    }
}

#[async_trait]
impl RemoteIdentityService for HttpIdentityService {
    async fn fetch_identity_records(
        &self,
        peer_id: &str,
    ) -> Result<Vec<RemoteIdentityRecord>, ServiceError> {
        let resp = self
            .client
            .get(self.records_url(peer_id))
            .send()
            .await
            .map_err(|e| ServiceError::Transport(e.to_string()))?;
        Self::decode(resp).await
    }

    async fn publish_identity_key(
        &self,
        peer_id: &str,
        identity_public_key: &[u8; 32],
        derived_public_key: &[u8; 32],
    ) -> Result<PublishAck, ServiceError> {
        let body = serde_json::to_vec(&PublishBody {
            identity_public_key,
            derived_public_key,
        })
        .map_err(|e| ServiceError::BadResponse(e.to_string()))?;

        let resp = self
            .client
            .post(self.records_url(peer_id))
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| ServiceError::Transport(e.to_string()))?;
        Self::decode(resp).await
    }
}
