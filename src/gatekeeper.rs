use std::time::Duration;

use actix_web::http::header::USER_AGENT;
use actix_web::HttpRequest;
use anyhow::Context;
use reqwest::Client;
use secrecy::ExposeSecret;
use secrecy::Secret;
use serde::Deserialize;
use serde::Serialize;

/// Client for the abuse-decision oracle. The service only consumes the
/// request/response contract; how the oracle reaches its verdict (traffic
/// heuristics, bot signatures, DNS lookups) is its own business.
///
/// Constructed once at startup and shared across requests via `web::Data`.
pub struct GatekeeperClient {
    http_client: Client,
    base_url: String,
    api_key: Secret<String>,
}

/// The request-scoped identity handed to the oracle alongside the candidate
/// email.
#[derive(Debug)]
pub struct RequestFingerprint {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl From<&HttpRequest> for RequestFingerprint {
    fn from(request: &HttpRequest) -> Self {
        let ip = request
            .connection_info()
            .realip_remote_addr()
            .map(str::to_owned);
        let user_agent = request
            .headers()
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        Self { ip, user_agent }
    }
}

/// Verdict returned by the oracle.
#[derive(Debug)]
pub enum Decision {
    Allow,
    Deny(DenialReason),
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DenialReason {
    /// Suspicious traffic pattern
    Shield,
    /// Automated-client signature
    Bot,
    RateLimit {
        /// Seconds until the window resets; absent when the oracle does not
        /// know
        reset_in_seconds: Option<u64>,
    },
    Email {
        email_kinds: Vec<EmailBlockKind>,
    },
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmailBlockKind {
    Invalid,
    Disposable,
    NoMxRecords,
    #[serde(other)]
    Other,
}

#[derive(Serialize)]
struct DecideRequest<'a> {
    email: &'a str,
    ip: Option<&'a str>,
    user_agent: Option<&'a str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum Conclusion {
    Allow,
    Deny,
}

#[derive(Deserialize)]
struct DecideResponse {
    conclusion: Conclusion,
    reason: Option<DenialReason>,
}

impl GatekeeperClient {
    pub fn new(
        base_url: String,
        api_key: Secret<String>,
        timeout: Duration,
    ) -> Self {
        // the oracle sits on the hot path of every submission; a stuck
        // connection must not hold the handler open indefinitely
        let http_client = Client::builder().timeout(timeout).build().unwrap();
        Self {
            http_client,
            base_url,
            api_key,
        }
    }

    /// Ask the oracle whether this (request, email) pair may proceed.
    ///
    /// A denial without a usable reason is reported as an error rather than
    /// mapped to some arbitrary denial kind; the caller treats it as
    /// unexpected.
    #[tracing::instrument(name = "Checking request against gatekeeper", skip(self, fingerprint))]
    pub async fn check(
        &self,
        fingerprint: &RequestFingerprint,
        email: &str,
    ) -> Result<Decision, anyhow::Error> {
        let url = format!("{}/decisions", self.base_url);
        let request_body = DecideRequest {
            email,
            ip: fingerprint.ip.as_deref(),
            user_agent: fingerprint.user_agent.as_deref(),
        };
        let response: DecideResponse = self
            .http_client
            .post(&url)
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .json(&request_body)
            .send()
            .await
            .context("failed to reach the gatekeeper")?
            .error_for_status()
            .context("gatekeeper returned an error status")?
            .json()
            .await
            .context("failed to parse the gatekeeper decision")?;

        match response.conclusion {
            Conclusion::Allow => Ok(Decision::Allow),
            Conclusion::Deny => {
                let reason = response
                    .reason
                    .context("gatekeeper denied the request without a reason")?;
                Ok(Decision::Deny(reason))
            }
        }
    }
}
