// ── Upstream REST client ──
//
// Wraps `reqwest::Client` with bearer-token auth and upstream-specific
// URL construction. Command calls go through `POST /api/services`,
// state reads through `GET /api/states`. Transient failures (timeouts,
// connect errors, 5xx) are retried a bounded number of times; client
// errors surface immediately.

use std::time::Duration;

use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::Error;

const MAX_RETRIES: u32 = 2;
const RETRY_BACKOFF_INITIAL: Duration = Duration::from_secs(1);

/// HTTP client for the upstream home-automation REST API.
///
/// Cheap to clone via the inner `reqwest::Client`. The bearer
/// credential is baked into default headers at construction and marked
/// sensitive so it never appears in debug output.
#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: Url,
}

impl UpstreamClient {
    /// Build a client for `base_url` authenticating with `credential`.
    pub fn new(
        base_url: Url,
        credential: &SecretString,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth = reqwest::header::HeaderValue::from_str(&format!(
            "Bearer {}",
            credential.expose_secret()
        ))
        .map_err(|_| Error::Authentication {
            message: "credential contains characters not valid in a header".into(),
        })?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        Ok(Self { http, base_url })
    }

    /// The upstream base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    // ── Public API surface ───────────────────────────────────────────

    /// Fetch the full entity state list: `GET /api/states`.
    pub async fn get_states(&self) -> Result<Vec<Value>, Error> {
        let url = self.api_url("states")?;
        with_retry("get_states", || self.get_json(url.clone())).await
    }

    /// Invoke a service: `POST /api/services/{domain}/{service}`.
    ///
    /// The payload must already be scrubbed and entity-pinned by the
    /// caller; this layer forwards it verbatim.
    pub async fn call_service(
        &self,
        domain: &str,
        service: &str,
        payload: &Value,
    ) -> Result<Value, Error> {
        let url = self.api_url(&format!("services/{domain}/{service}"))?;
        with_retry("call_service", || self.post_json(url.clone(), payload)).await
    }

    /// Startup probe: `GET /api/`. Not retried -- a failing probe should
    /// surface immediately so the operator sees a broken configuration.
    pub async fn validate_connectivity(&self) -> Result<(), Error> {
        let url = self.api_url("")?;
        let _: Value = self.get_json(url).await?;
        info!("upstream connectivity validated");
        Ok(())
    }

    // ── Request plumbing ─────────────────────────────────────────────

    /// Build `{base}/api/{path}`.
    fn api_url(&self, path: &str) -> Result<Url, Error> {
        let base = self.base_url.as_str().trim_end_matches('/');
        let full = if path.is_empty() {
            format!("{base}/api/")
        } else {
            format!("{base}/api/{path}")
        };
        Ok(Url::parse(&full)?)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, Error> {
        debug!("GET {url}");
        let resp = self.http.get(url).send().await?;
        Self::decode(resp).await
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        url: Url,
        body: &(impl serde::Serialize + Sync),
    ) -> Result<T, Error> {
        debug!("POST {url}");
        let resp = self.http.post(url).json(body).send().await?;
        Self::decode(resp).await
    }

    /// Map the response status, then deserialize the body.
    async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, Error> {
        let status = resp.status();

        if status == StatusCode::UNAUTHORIZED {
            return Err(Error::Authentication {
                message: "invalid or expired access token (HTTP 401)".into(),
            });
        }

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Upstream {
                status: status.as_u16(),
                message: body.chars().take(200).collect(),
            });
        }

        let body = resp.text().await?;
        serde_json::from_str(&body).map_err(|e| Error::Deserialization {
            message: format!("{e} (body preview: {:?})", body.chars().take(200).collect::<String>()),
        })
    }
}

// ── Retry helper ─────────────────────────────────────────────────────

/// Run `op`, retrying transient failures up to [`MAX_RETRIES`] extra
/// times with a growing delay (1s, then 2s).
async fn with_retry<T, F, Fut>(op_name: &str, mut op: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < MAX_RETRIES => {
                let delay = RETRY_BACKOFF_INITIAL * (attempt + 1);
                warn!(
                    error = %e,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "transient upstream error in {op_name}, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
