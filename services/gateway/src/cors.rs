//! CORS policy for browser clients
//!
//! Origins are matched against the configured list; there is no wildcard,
//! since credentialed requests are allowed.

use axum::http::{HeaderValue, Method, header};
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::error::ServerError;

/// How long browsers may cache a preflight response.
pub const PREFLIGHT_MAX_AGE: Duration = Duration::from_secs(12 * 60 * 60);

pub fn layer(allowed_origins: &[String]) -> Result<CorsLayer, ServerError> {
    let origins = allowed_origins
        .iter()
        .map(|origin| {
            if origin.trim() == "*" {
                return Err(ServerError::Configuration(
                    "wildcard origin is not allowed with credentials".into(),
                ));
            }
            HeaderValue::from_str(origin.trim())
                .map_err(|_| ServerError::Configuration(format!("invalid origin {:?}", origin)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::ORIGIN, header::CONTENT_TYPE, header::AUTHORIZATION])
        .expose_headers([header::CONTENT_LENGTH])
        .allow_credentials(true)
        .max_age(PREFLIGHT_MAX_AGE))
}
