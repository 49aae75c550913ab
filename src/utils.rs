use std::fmt;

use actix_web::http::header::LOCATION;
use actix_web::HttpResponse;

/// Walk the source chain so that `Debug` output for handler errors shows the
/// root cause, not just the outermost message.
pub fn error_chain_fmt(
    e: &impl std::error::Error,
    f: &mut fmt::Formatter<'_>,
) -> fmt::Result {
    writeln!(f, "{}\n", e)?;
    let mut current = e.source();
    while let Some(cause) = current {
        writeln!(f, "Caused by:\n\t{}", cause)?;
        current = cause.source();
    }
    Ok(())
}

pub fn redirect(location: &str) -> HttpResponse {
    HttpResponse::SeeOther()
        .insert_header((LOCATION, location))
        .finish()
}
