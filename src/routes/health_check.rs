use actix_web::HttpResponse;

/// `GET /health_check`
///
/// Used by the hosting platform's liveness probe.
pub async fn health_check() -> HttpResponse { HttpResponse::Ok().finish() }
