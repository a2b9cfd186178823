use async_trait::async_trait;
use serde_json::Value;

use super::signer::{self, QueryParams, SIGNATURE_PARAM};
use super::{ApiError, Job, JobSource, LIST_ASYNC_JOBS};
use crate::config::PlatformConfig;
use crate::log::*;

/// Longest slice of an unexpected response body kept in an error.
const MAX_ERROR_BODY: usize = 256;

/// Signed GET calls against the platform API.
#[derive(Debug, Clone)]
pub struct ApiClient {
    platform: PlatformConfig,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(platform: &PlatformConfig) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(*platform.insecure_tls())
            .timeout(platform.request_timeout())
            .build()?;
        Ok(Self {
            platform: platform.clone(),
            http,
        })
    }

    /// Build the full request URL for `command`: credentials and response
    /// format are added to `extra`, the set is signed, and the signature is
    /// appended.
    pub fn signed_url(&self, command: &str, extra: QueryParams) -> Result<reqwest::Url, ApiError> {
        let mut params: QueryParams = extra
            .into_iter()
            .filter(|(k, _)| !matches!(k.as_str(), "apikey" | "command" | "response" | SIGNATURE_PARAM))
            .collect();
        params.push(("apikey".into(), self.platform.api_key().clone()));
        params.push(("command".into(), command.to_string()));
        params.push(("response".into(), "json".into()));

        let signature = signer::sign(self.platform.secret_key(), &params)?;
        let url = format!(
            "{}?{}&{}={}",
            self.platform.base_url(),
            signer::canonical_query_string(&params),
            SIGNATURE_PARAM,
            signer::encode_component(&signature),
        );
        reqwest::Url::parse(&url).map_err(|e| ApiError::Url(format!("{}: {e}", self.platform.base_url())))
    }

    /// Perform one signed call and return the unwrapped payload.
    #[tracing::instrument(skip(self, extra))]
    pub async fn call(&self, command: &str, extra: QueryParams) -> Result<Value, ApiError> {
        let url = self.signed_url(command, extra)?;
        debug!("calling {} on {}", command, self.platform.base_url());

        let response = self.http.get(url).send().await?;
        let status = response.status();
        // Decodes using the charset the platform declares, so everything
        // downstream only ever sees UTF-8.
        let body = response.text().await?;

        let value = match serde_json::from_str::<Value>(&body) {
            Ok(value) => value,
            Err(_) if !status.is_success() => return Err(status_error(status, &body)),
            Err(e) => return Err(e.into()),
        };

        match unwrap_envelope(command, value) {
            Err(e @ ApiError::Platform { .. }) => Err(e),
            _ if !status.is_success() => Err(status_error(status, &body)),
            other => other,
        }
    }
}

#[async_trait]
impl JobSource for ApiClient {
    #[tracing::instrument(skip(self))]
    async fn list_jobs(&self) -> Result<Vec<Job>, ApiError> {
        let payload = self.call(LIST_ASYNC_JOBS, vec![]).await?;
        let records = match payload {
            Value::Array(records) => records,
            Value::Null => vec![],
            Value::Object(map) if map.is_empty() => vec![],
            other => {
                return Err(ApiError::InvalidJob(format!(
                    "expected a list of jobs, got {other}"
                )))
            }
        };
        let jobs = records
            .into_iter()
            .map(Job::from_value)
            .collect::<Result<Vec<_>, _>>()?;
        info!("platform reported {} async jobs", jobs.len());
        Ok(jobs)
    }
}

/// Strip the `<command>response` envelope from a platform answer.
///
/// Fails with [`ApiError::Platform`] when the payload carries an
/// `errorcode`. Otherwise returns the value of the first key that is not
/// `count`, or an empty list when there is none.
pub fn unwrap_envelope(command: &str, body: Value) -> Result<Value, ApiError> {
    let key = format!("{}response", command.to_lowercase());
    let payload = match body {
        Value::Object(mut root) => root.remove(&key),
        _ => None,
    }
    .ok_or_else(|| ApiError::MissingEnvelope(key.clone()))?;

    let payload = match payload {
        Value::Object(payload) => payload,
        other => return Ok(other),
    };

    if let Some(code) = payload.get("errorcode") {
        let code = code
            .as_i64()
            .or_else(|| code.as_str().and_then(|s| s.parse().ok()))
            .unwrap_or(-1);
        let text = payload
            .get("errortext")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        return Err(ApiError::Platform { code, text });
    }

    Ok(payload
        .into_iter()
        .find(|(k, _)| k != "count")
        .map(|(_, v)| v)
        .unwrap_or_else(|| Value::Array(vec![])))
}

fn status_error(status: reqwest::StatusCode, body: &str) -> ApiError {
    ApiError::Status {
        status: status.as_u16(),
        body: body.chars().take(MAX_ERROR_BODY).collect(),
    }
}
