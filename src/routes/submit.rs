use actix_web::http::StatusCode;
use actix_web::web;
use actix_web::HttpRequest;
use actix_web::HttpResponse;
use actix_web::ResponseError;
use anyhow::Context;
use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::thread_rng;
use rand::Rng;
use serde::Deserialize;
use sqlx::PgPool;
use sqlx::Row;
use uuid::Uuid;

use crate::domain::SubscriberEmail;
use crate::email_client::EmailClient;
use crate::gatekeeper::Decision;
use crate::gatekeeper::DenialReason;
use crate::gatekeeper::EmailBlockKind;
use crate::gatekeeper::GatekeeperClient;
use crate::gatekeeper::RequestFingerprint;
use crate::startup::AppBaseUrl;
use crate::utils::error_chain_fmt;

/// Everything that can go wrong between receiving a candidate email and
/// reporting "Success". Each variant carries the exact message shown to the
/// user; `status_code` does the HTTP classification.
#[derive(thiserror::Error)]
pub enum SubmitError {
    #[error("Suspicious action detected!")]
    ShieldBlocked,
    #[error("Looks like you might be a bot!")]
    BotDetected,
    #[error("{0}")]
    RateLimited(String),
    #[error("{0}")]
    RejectedEmail(String),
    #[error("This email has already been registered.")]
    AlreadyRegistered,
    #[error(transparent)]
    UnexpectedError(#[from] anyhow::Error),
}

impl std::fmt::Debug for SubmitError {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

impl ResponseError for SubmitError {
    fn status_code(&self) -> StatusCode {
        match self {
            SubmitError::ShieldBlocked | SubmitError::BotDetected => StatusCode::FORBIDDEN,
            SubmitError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            SubmitError::RejectedEmail(_) => StatusCode::BAD_REQUEST,
            // a client-correctable condition, hence not a server error
            SubmitError::AlreadyRegistered => StatusCode::CONFLICT,
            SubmitError::UnexpectedError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code())
            .json(serde_json::json!({ "error": self.to_string() }))
    }
}

impl From<DenialReason> for SubmitError {
    fn from(reason: DenialReason) -> Self {
        match reason {
            DenialReason::Shield => Self::ShieldBlocked,
            DenialReason::Bot => Self::BotDetected,
            DenialReason::RateLimit { reset_in_seconds } => {
                Self::RateLimited(retry_after_message(reset_in_seconds))
            }
            DenialReason::Email { email_kinds } => {
                Self::RejectedEmail(email_denial_message(&email_kinds).to_owned())
            }
        }
    }
}

/// Turn the decision's reset window into something a human can act on:
/// plain seconds up to a minute, rounded-up minutes beyond that.
fn retry_after_message(reset_in_seconds: Option<u64>) -> String {
    match reset_in_seconds {
        None => "Too many requests. Try again later.".to_owned(),
        Some(s) if s <= 60 => format!("Too many requests. Try again in {s} seconds."),
        Some(s) => format!("Too many requests. Try again in {} minutes.", s.div_ceil(60)),
    }
}

/// First match wins; the oracle may flag several kinds at once.
fn email_denial_message(email_kinds: &[EmailBlockKind]) -> &'static str {
    if email_kinds.contains(&EmailBlockKind::Invalid) {
        "Invalid email format. Check your spelling."
    } else if email_kinds.contains(&EmailBlockKind::Disposable) {
        "Disposable email address. Check your spelling."
    } else if email_kinds.contains(&EmailBlockKind::NoMxRecords) {
        "Email without an MX record. Check your spelling."
    } else {
        "Invalid email. Check your spelling."
    }
}

#[derive(Deserialize)]
pub struct SubmitBody {
    email: String,
}

/// `POST /submit`
///
/// The full opt-in pipeline: gatekeeper verdict, email parsing, duplicate
/// check, pending insert, confirmation email. Success means the email was
/// actually dispatched; a failed dispatch surfaces as an error rather than
/// being fired and forgotten.
///
/// Not idempotent across confirmation: resubmitting an unconfirmed email
/// succeeds again, but reuses the stored token (see `insert_pending`).
///
/// # Request example
///
/// ```sh
///     curl --json '{"email": "john@foo.com"}' http://127.0.0.1:8000/submit
/// ```
#[tracing::instrument(
    name = "Handling subscription request",
    skip(body, pool, email_client, gatekeeper, base_url, request),
    fields(subscriber_email = %body.email)
)]
pub async fn submit(
    body: web::Json<SubmitBody>,
    // all subsequent args are injected via App.app_data; arg types must be unique
    pool: web::Data<PgPool>,
    email_client: web::Data<EmailClient>,
    gatekeeper: web::Data<GatekeeperClient>,
    base_url: web::Data<AppBaseUrl>,
    request: HttpRequest,
) -> Result<HttpResponse, SubmitError> {
    let fingerprint = RequestFingerprint::from(&request);

    // denied requests must not reach the store at all
    match gatekeeper.check(&fingerprint, &body.email).await? {
        Decision::Allow => {}
        Decision::Deny(reason) => return Err(reason.into()),
    }

    // the oracle already vets the address, but the parsed type is what the
    // store and the email client accept
    let email = SubscriberEmail::parse(body.0.email)
        .map_err(|_| SubmitError::RejectedEmail("Invalid email format. Check your spelling.".to_owned()))?;

    if find_subscriber_by_email(&pool, &email)
        .await
        .context("failed to look up existing subscriber")?
        .is_some()
    {
        return Err(SubmitError::AlreadyRegistered);
    }

    let token = generate_subscription_token();
    let token = insert_pending(&pool, &email, &token)
        .await
        .context("failed to store pending subscription")?;

    send_confirmation_email(&email_client, &email, &base_url.0, &token)
        .await
        .context("failed to send the confirmation email")?;

    Ok(HttpResponse::Ok().json(serde_json::json!({ "data": "Success" })))
}

#[derive(Deserialize)]
pub struct ProbeParameters {
    email: Option<String>,
}

/// `GET /submit`
///
/// Diagnostic probe for the gatekeeper: reports whether the calling traffic
/// would be let through. Only traffic-shaped denials (shield, bot) apply; the
/// probe carries no real submission, so rate-limit and email verdicts fall
/// through to the greeting. No store access.
#[tracing::instrument(name = "Probing gatekeeper", skip(params, gatekeeper, request))]
pub async fn submit_probe(
    params: web::Query<ProbeParameters>,
    gatekeeper: web::Data<GatekeeperClient>,
    request: HttpRequest,
) -> Result<HttpResponse, SubmitError> {
    let fingerprint = RequestFingerprint::from(&request);
    let email = params.0.email.unwrap_or_default();

    match gatekeeper.check(&fingerprint, &email).await? {
        Decision::Deny(DenialReason::Shield) => Err(SubmitError::ShieldBlocked),
        Decision::Deny(DenialReason::Bot) => Err(SubmitError::BotDetected),
        _ => Ok(HttpResponse::Ok().json(serde_json::json!({ "data": "Hello World!" }))),
    }
}

/// The sole credential binding a confirmation click back to its pending
/// record; 25 alphanumeric characters of crypto-backed randomness.
fn generate_subscription_token() -> String {
    let mut rng = thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(25)
        .collect()
}

/// Wrapper for `EmailClient.send_email` that renders the opt-in message.
#[tracing::instrument(
    name = "Sending confirmation email to new subscriber",
    skip(email_client, email, base_url, token)
)]
async fn send_confirmation_email(
    email_client: &EmailClient,
    email: &SubscriberEmail,
    base_url: &str,
    token: &str,
) -> Result<(), reqwest::Error> {
    let confirmation_link = format!("{base_url}/confirm?token={token}");
    let text = format!(
        "Welcome to our newsletter!\nVisit {confirmation_link} to confirm your subscription."
    );
    let html = format!(
        "Welcome to our newsletter!<br />Click <a href=\"{confirmation_link}\">here</a> to confirm your subscription."
    );
    email_client
        .send_email(email, "Confirm your subscription", &html, &text)
        .await
}

#[tracing::instrument(name = "Looking up subscriber by email", skip(pool, email))]
async fn find_subscriber_by_email(
    pool: &PgPool,
    email: &SubscriberEmail,
) -> Result<Option<Uuid>, sqlx::Error> {
    let row = sqlx::query("SELECT id FROM subscribers WHERE email = $1")
        .bind(email.as_ref())
        .fetch_optional(pool)
        .await
        .map_err(|e| {
            tracing::error!("bad query: {e:?}");
            e
        })?;
    Ok(row.map(|r| r.get("id")))
}

/// Persist the pending record, returning the token under which it is actually
/// stored.
///
/// UNIQUE(email) keeps at most one live pending record per address. On
/// conflict the resubmission is treated as an idempotent success: the stored
/// token wins over the freshly generated one, so the link from the earlier
/// email remains valid.
#[tracing::instrument(name = "Storing pending subscription", skip(pool, email, token))]
async fn insert_pending(
    pool: &PgPool,
    email: &SubscriberEmail,
    token: &str,
) -> Result<String, sqlx::Error> {
    let result = sqlx::query(
        "
    INSERT INTO pending_subscriptions (id, email, subscription_token, created_at)
    VALUES ($1, $2, $3, $4)
    ON CONFLICT (email) DO NOTHING
",
    )
    .bind(Uuid::new_v4())
    .bind(email.as_ref())
    .bind(token)
    .bind(Utc::now())
    .execute(pool)
    .await
    .map_err(|e| {
        tracing::error!("bad query: {e:?}");
        e
    })?;

    if result.rows_affected() == 1 {
        return Ok(token.to_owned());
    }

    let row = sqlx::query("SELECT subscription_token FROM pending_subscriptions WHERE email = $1")
        .bind(email.as_ref())
        .fetch_one(pool)
        .await
        .map_err(|e| {
            tracing::error!("bad query: {e:?}");
            e
        })?;
    Ok(row.get("subscription_token"))
}
