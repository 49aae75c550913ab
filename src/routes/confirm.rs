use actix_web::http::StatusCode;
use actix_web::web;
use actix_web::HttpResponse;
use actix_web::ResponseError;
use anyhow::Context;
use chrono::Utc;
use serde::Deserialize;
use sqlx::PgPool;
use sqlx::Postgres;
use sqlx::Row;
use sqlx::Transaction;
use uuid::Uuid;

use crate::startup::AppBaseUrl;
use crate::utils::error_chain_fmt;
use crate::utils::redirect;

type PgTransaction = Transaction<'static, Postgres>;

#[derive(thiserror::Error)]
pub enum ConfirmError {
    #[error("Invalid token")]
    MissingToken,
    /// Covers tokens that were never issued, already consumed, or expired
    #[error("Token not found")]
    UnknownToken,
    #[error(transparent)]
    UnexpectedError(#[from] anyhow::Error),
}

impl std::fmt::Debug for ConfirmError {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

impl ResponseError for ConfirmError {
    fn status_code(&self) -> StatusCode {
        match self {
            ConfirmError::MissingToken | ConfirmError::UnknownToken => StatusCode::BAD_REQUEST,
            ConfirmError::UnexpectedError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code())
            .json(serde_json::json!({ "error": self.to_string() }))
    }
}

#[derive(Deserialize)]
pub struct Parameters {
    token: Option<String>,
}

/// `GET /confirm?token=<token>`
///
/// Promote the pending subscription the token belongs to. On success the
/// visitor is redirected to the landing page with a success flag.
///
/// Promotion is a single transaction: insert the subscriber, then delete the
/// pending row. The delete doubles as the concurrency guard; if another
/// confirmation of the same token got there first, 0 rows are deleted, our
/// insert is rolled back, and the caller sees the same "Token not found" as
/// for a token that never existed. Confirming twice can therefore never
/// produce a duplicate subscriber.
#[tracing::instrument(name = "Confirming pending subscription", skip(params, pool, base_url))]
pub async fn confirm(
    params: web::Query<Parameters>,
    pool: web::Data<PgPool>,
    base_url: web::Data<AppBaseUrl>,
) -> Result<HttpResponse, ConfirmError> {
    // absent and empty tokens are rejected before touching the store
    let token = params
        .0
        .token
        .filter(|t| !t.is_empty())
        .ok_or(ConfirmError::MissingToken)?;

    let mut transaction = pool
        .begin()
        .await
        .context("failed to begin a transaction")?;

    let email = get_pending_email_by_token(&mut transaction, &token)
        .await
        .context("failed to look up pending subscription")?
        .ok_or(ConfirmError::UnknownToken)?;

    insert_subscriber(&mut transaction, &email)
        .await
        .context("failed to insert subscriber")?;

    let deleted = delete_pending(&mut transaction, &token)
        .await
        .context("failed to delete pending subscription")?;
    if deleted == 0 {
        // lost the race; dropping the transaction rolls back the insert
        return Err(ConfirmError::UnknownToken);
    }

    transaction
        .commit()
        .await
        .context("failed to commit the promotion")?;

    Ok(redirect(&format!("{}/?approved=true", base_url.0)))
}

#[tracing::instrument(name = "Looking up pending subscription by token", skip(transaction, token))]
async fn get_pending_email_by_token(
    transaction: &mut PgTransaction,
    token: &str,
) -> Result<Option<String>, sqlx::Error> {
    let row = sqlx::query("SELECT email FROM pending_subscriptions WHERE subscription_token = $1")
        .bind(token)
        .fetch_optional(&mut **transaction)
        .await
        .map_err(|e| {
            tracing::error!("bad query: {e:?}");
            e
        })?;
    Ok(row.map(|r| r.get("email")))
}

/// The conflict arm covers an address that was already confirmed through an
/// older pending record; promotion stays idempotent at the subscriber level.
#[tracing::instrument(name = "Inserting confirmed subscriber", skip(transaction, email))]
async fn insert_subscriber(
    transaction: &mut PgTransaction,
    email: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "
    INSERT INTO subscribers (id, email, subscribed_at)
    VALUES ($1, $2, $3)
    ON CONFLICT (email) DO NOTHING
",
    )
    .bind(Uuid::new_v4())
    .bind(email)
    .bind(Utc::now())
    .execute(&mut **transaction)
    .await
    .map_err(|e| {
        tracing::error!("bad query: {e:?}");
        e
    })?;
    Ok(())
}

#[tracing::instrument(name = "Deleting pending subscription", skip(transaction, token))]
async fn delete_pending(
    transaction: &mut PgTransaction,
    token: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM pending_subscriptions WHERE subscription_token = $1")
        .bind(token)
        .execute(&mut **transaction)
        .await
        .map_err(|e| {
            tracing::error!("bad query: {e:?}");
            e
        })?;
    Ok(result.rows_affected())
}
