//! Resource resolution
//!
//! Turns a chapter descriptor into page URLs and knows which mirrors serve
//! the same asset.

pub mod chapter;
pub mod servers;

pub use chapter::{format_number, ChapterResolver};
pub use servers::{ImageServers, MirrorSource};

use http::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, REFERER};
use tracing::warn;

use crate::config::ResolverConfig;

const API_ACCEPT: &str = "application/json, text/plain, */*";

/// Headers every API request carries
///
/// Values that are not valid header text are dropped with a warning.
pub fn api_headers(config: &ResolverConfig) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static(API_ACCEPT));

    let token = config.token.as_deref().and_then(normalize_token);
    let entries = [
        (AUTHORIZATION, token),
        (HeaderName::from_static("site-id"), config.site_id.clone()),
        (REFERER, config.referer.clone()),
    ];

    for (name, value) in entries {
        let Some(value) = value else { continue };
        match HeaderValue::from_str(&value) {
            Ok(mut value) => {
                if name == AUTHORIZATION {
                    value.set_sensitive(true);
                }
                headers.insert(name, value);
            }
            Err(_) => warn!(header = %name, "Skipping invalid header value"),
        }
    }

    headers
}

/// `Bearer <token>` unless the token already carries a scheme
pub fn normalize_token(token: &str) -> Option<String> {
    let token = token.trim();
    if token.is_empty() {
        return None;
    }
    let has_scheme = token
        .get(..7)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("bearer "));
    if has_scheme {
        Some(token.to_string())
    } else {
        Some(format!("Bearer {}", token))
    }
}
