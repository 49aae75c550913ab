use wiremock::matchers::any;
use wiremock::matchers::method;
use wiremock::matchers::path;
use wiremock::Mock;
use wiremock::ResponseTemplate;

use crate::helpers::allow_decision;
use crate::helpers::deny_decision;
use crate::helpers::mock_gatekeeper;
use crate::helpers::spawn_app;

/// A fresh, allowed email creates exactly one pending record and dispatches
/// exactly one confirmation email carrying its token
#[tokio::test]
async fn submit_ok_creates_pending_and_sends_confirmation() {
    let app = spawn_app().await;
    mock_gatekeeper(&app, allow_decision()).await;

    Mock::given(path("/email"))
        .and(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&app.email_server)
        .await;

    let resp = app.post_submit(serde_json::json!({ "email": "john@foo.com" })).await;

    assert_eq!(resp.status().as_u16(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["data"], "Success");

    // side-effect: pending record added, not yet a subscriber
    use sqlx::Row;
    let added = sqlx::query("SELECT email, subscription_token FROM pending_subscriptions")
        .fetch_one(&app.pool)
        .await
        .unwrap();
    assert_eq!(added.get::<String, _>("email"), "john@foo.com");
    let token: String = added.get("subscription_token");
    assert_eq!(token.len(), 25);
    assert_eq!(app.count_subscribers().await, 0);

    // side-effect: the emailed link carries that token
    let email_reqs = app.email_server.received_requests().await.unwrap();
    let links = app.get_confirmation_links(&email_reqs[0]);
    assert!(links.html.as_str().contains(&token));
    assert!(links.text.as_str().contains(&token));
}

/// Shield/bot denials are forbidden, with no store writes and no dispatch
#[tokio::test]
async fn submit_denied_by_shield_or_bot() {
    let app = spawn_app().await;

    for (reason, msg) in [
        (
            serde_json::json!({ "kind": "shield" }),
            "Suspicious action detected!",
        ),
        (
            serde_json::json!({ "kind": "bot" }),
            "Looks like you might be a bot!",
        ),
    ] {
        let _guard = Mock::given(path("/decisions"))
            .and(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(deny_decision(reason)))
            .mount_as_scoped(&app.gatekeeper_server)
            .await;

        let resp = app.post_submit(serde_json::json!({ "email": "john@foo.com" })).await;

        assert_eq!(resp.status().as_u16(), 403, "{msg}");
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["error"], msg);
    }

    assert_eq!(app.count_pending().await, 0);
    assert_eq!(app.count_subscribers().await, 0);
    assert!(app.email_server.received_requests().await.unwrap().is_empty());
}

/// The retry-after hint is seconds up to a minute, rounded-up minutes beyond
#[tokio::test]
async fn submit_rate_limited_reports_retry_after() {
    let app = spawn_app().await;

    for (reason, msg) in [
        (
            serde_json::json!({ "kind": "rate_limit", "reset_in_seconds": 30 }),
            "Too many requests. Try again in 30 seconds.",
        ),
        (
            serde_json::json!({ "kind": "rate_limit", "reset_in_seconds": 150 }),
            "Too many requests. Try again in 3 minutes.",
        ),
        (
            serde_json::json!({ "kind": "rate_limit" }),
            "Too many requests. Try again later.",
        ),
    ] {
        let _guard = Mock::given(path("/decisions"))
            .and(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(deny_decision(reason)))
            .mount_as_scoped(&app.gatekeeper_server)
            .await;

        let resp = app.post_submit(serde_json::json!({ "email": "john@foo.com" })).await;

        assert_eq!(resp.status().as_u16(), 429, "{msg}");
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["error"], msg);
    }

    assert_eq!(app.count_pending().await, 0);
}

/// Email-validation denials pick the first matching message in priority
/// order {INVALID, DISPOSABLE, NO_MX_RECORDS, fallback}
#[tokio::test]
async fn submit_denied_for_invalid_email() {
    let app = spawn_app().await;

    for (kinds, msg) in [
        (
            serde_json::json!(["DISPOSABLE", "INVALID"]),
            "Invalid email format. Check your spelling.",
        ),
        (
            serde_json::json!(["DISPOSABLE"]),
            "Disposable email address. Check your spelling.",
        ),
        (
            serde_json::json!(["NO_MX_RECORDS"]),
            "Email without an MX record. Check your spelling.",
        ),
        (
            serde_json::json!(["FREE"]), // unknown flag falls through
            "Invalid email. Check your spelling.",
        ),
    ] {
        let reason = serde_json::json!({ "kind": "email", "email_kinds": kinds });
        let _guard = Mock::given(path("/decisions"))
            .and(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(deny_decision(reason)))
            .mount_as_scoped(&app.gatekeeper_server)
            .await;

        let resp = app.post_submit(serde_json::json!({ "email": "john@mailinator.com" })).await;

        assert_eq!(resp.status().as_u16(), 400, "{msg}");
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["error"], msg);
    }

    assert_eq!(app.count_pending().await, 0);
}

/// An email that is already confirmed never creates a pending record and
/// never triggers a dispatch
#[tokio::test]
async fn submit_for_registered_email_is_a_conflict() {
    let app = spawn_app().await;
    mock_gatekeeper(&app, allow_decision()).await;

    sqlx::query("INSERT INTO subscribers (id, email, subscribed_at) VALUES ($1, $2, now())")
        .bind(uuid::Uuid::new_v4())
        .bind("john@foo.com")
        .execute(&app.pool)
        .await
        .unwrap();

    let resp = app.post_submit(serde_json::json!({ "email": "john@foo.com" })).await;

    assert_eq!(resp.status().as_u16(), 409);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "This email has already been registered.");

    assert_eq!(app.count_pending().await, 0);
    assert!(app.email_server.received_requests().await.unwrap().is_empty());
}

/// Resubmitting before confirming succeeds again, but keeps a single pending
/// record and re-sends the link with the originally issued token
#[tokio::test]
async fn resubmission_reuses_the_pending_token() {
    let app = spawn_app().await;
    mock_gatekeeper(&app, allow_decision()).await;

    Mock::given(path("/email"))
        .and(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&app.email_server)
        .await;

    app.post_submit(serde_json::json!({ "email": "john@foo.com" }))
        .await
        .error_for_status()
        .unwrap();
    app.post_submit(serde_json::json!({ "email": "john@foo.com" }))
        .await
        .error_for_status()
        .unwrap();

    assert_eq!(app.count_pending().await, 1);

    let email_reqs = app.email_server.received_requests().await.unwrap();
    assert_eq!(email_reqs.len(), 2);
    let first = app.get_confirmation_links(&email_reqs[0]);
    let second = app.get_confirmation_links(&email_reqs[1]);
    assert_eq!(first.html, second.html);
}

/// The parsed domain type is the last line of defence when the oracle waves
/// a malformed address through
#[tokio::test]
async fn submit_rejects_malformed_email_even_when_allowed() {
    let app = spawn_app().await;
    mock_gatekeeper(&app, allow_decision()).await;

    let resp = app.post_submit(serde_json::json!({ "email": "not-an-email" })).await;

    assert_eq!(resp.status().as_u16(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "Invalid email format. Check your spelling.");
    assert_eq!(app.count_pending().await, 0);
}

/// Dispatch success is a precondition for reporting success to the caller
#[tokio::test]
async fn submit_fails_if_confirmation_email_cannot_be_sent() {
    let app = spawn_app().await;
    mock_gatekeeper(&app, allow_decision()).await;

    Mock::given(any())
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&app.email_server)
        .await;

    let resp = app.post_submit(serde_json::json!({ "email": "john@foo.com" })).await;

    assert_eq!(resp.status().as_u16(), 500);
}

/// An unreachable oracle is an unexpected failure, not an open gate
#[tokio::test]
async fn submit_fails_when_the_gatekeeper_is_unreachable() {
    let app = spawn_app().await;
    // no /decisions mock mounted; the oracle double replies 404

    let resp = app.post_submit(serde_json::json!({ "email": "john@foo.com" })).await;

    assert_eq!(resp.status().as_u16(), 500);
    assert_eq!(app.count_pending().await, 0);
}

/// The probe only reacts to traffic-shaped denials
#[tokio::test]
async fn probe_greets_unless_shielded_or_bot() {
    let app = spawn_app().await;

    {
        let _guard = Mock::given(path("/decisions"))
            .and(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(allow_decision()))
            .mount_as_scoped(&app.gatekeeper_server)
            .await;
        let resp = app.get_submit_probe(Some("john@foo.com")).await;
        assert_eq!(resp.status().as_u16(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["data"], "Hello World!");
    }

    {
        let reason = serde_json::json!({ "kind": "bot" });
        let _guard = Mock::given(path("/decisions"))
            .and(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(deny_decision(reason)))
            .mount_as_scoped(&app.gatekeeper_server)
            .await;
        let resp = app.get_submit_probe(None).await;
        assert_eq!(resp.status().as_u16(), 403);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "Looks like you might be a bot!");
    }

    {
        // a rate-limit verdict doesn't block the probe
        let reason = serde_json::json!({ "kind": "rate_limit", "reset_in_seconds": 30 });
        let _guard = Mock::given(path("/decisions"))
            .and(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(deny_decision(reason)))
            .mount_as_scoped(&app.gatekeeper_server)
            .await;
        let resp = app.get_submit_probe(Some("john@foo.com")).await;
        assert_eq!(resp.status().as_u16(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["data"], "Hello World!");
    }
}
