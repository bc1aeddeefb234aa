//! CloudWatch Logs Insights client.
//!
//! Speaks the `Logs_20140328` JSON 1.1 protocol directly over reqwest with
//! SigV4-signed requests. Only the two calls the usage poller needs are
//! implemented.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use url::Url;

use super::sigv4::{AwsCredentials, SigV4Signer};
use super::{LogQuery, LogStore, LogStoreError, QueryResults};

const SERVICE: &str = "logs";
const CONTENT_TYPE: &str = "application/x-amz-json-1.1";
const TARGET_PREFIX: &str = "Logs_20140328";

/// Default request timeout for log store calls (30s)
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection settings for [`CloudWatchLogs`].
#[derive(Debug, Clone)]
pub struct CloudWatchConfig {
    pub region: String,
    /// Overrides the regional endpoint, e.g. for a local stack.
    pub endpoint: Option<String>,
    pub credentials: Option<AwsCredentials>,
}

impl Default for CloudWatchConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            endpoint: None,
            credentials: None,
        }
    }
}

impl CloudWatchConfig {
    /// `https://logs.<region>.amazonaws.com/` unless overridden.
    pub fn endpoint_url(&self) -> Result<Url, LogStoreError> {
        let raw = match &self.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => format!("https://logs.{}.amazonaws.com/", self.region),
        };
        let url = Url::parse(&raw).map_err(|e| LogStoreError::InvalidEndpoint(format!("{raw}: {e}")))?;
        if url.host_str().is_none() {
            return Err(LogStoreError::InvalidEndpoint(raw));
        }
        Ok(url)
    }
}

/// CloudWatch Logs client.
#[derive(Debug, Clone)]
pub struct CloudWatchLogs {
    client: reqwest::Client,
    endpoint: Url,
    host: String,
    signer: Option<SigV4Signer>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartQueryOutput {
    query_id: String,
}

impl CloudWatchLogs {
    pub fn new(config: &CloudWatchConfig) -> Result<Self, LogStoreError> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()?;
        Self::with_client(client, config)
    }

    pub fn with_client(client: reqwest::Client, config: &CloudWatchConfig) -> Result<Self, LogStoreError> {
        let endpoint = config.endpoint_url()?;
        let host = match (endpoint.host_str(), endpoint.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => return Err(LogStoreError::InvalidEndpoint(endpoint.to_string())),
        };
        let signer = config
            .credentials
            .clone()
            .map(|creds| SigV4Signer::new(creds, config.region.clone(), SERVICE));

        Ok(Self {
            client,
            endpoint,
            host,
            signer,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn call<T: DeserializeOwned>(
        &self,
        action: &str,
        body: &serde_json::Value,
    ) -> Result<T, LogStoreError> {
        let signer = self.signer.as_ref().ok_or(LogStoreError::MissingCredentials)?;
        let target = format!("{TARGET_PREFIX}.{action}");
        let body = serde_json::to_vec(body)?;

        let datetime = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
        let signed = signer.sign(
            "POST",
            &self.host,
            self.endpoint.path(),
            &[("content-type", CONTENT_TYPE), ("x-amz-target", &target)],
            &body,
            &datetime,
        );

        let mut request = self
            .client
            .post(self.endpoint.clone())
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .header("x-amz-target", &target);
        for (name, value) in signed {
            request = request.header(name, value);
        }

        let response = request.body(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::debug!(action, status = status.as_u16(), "log store call failed");
            return Err(LogStoreError::Api {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl LogStore for CloudWatchLogs {
    async fn start_query(&self, query: &LogQuery) -> Result<String, LogStoreError> {
        let output: StartQueryOutput = self.call("StartQuery", &serde_json::to_value(query)?).await?;
        Ok(output.query_id)
    }

    async fn get_query_results(&self, query_id: &str) -> Result<QueryResults, LogStoreError> {
        self.call("GetQueryResults", &json!({ "queryId": query_id }))
            .await
    }
}
