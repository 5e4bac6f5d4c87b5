//! Endpoint derivation
//!
//! The push channel lives at a fixed path on the page origin, with the
//! WebSocket scheme matching the page scheme (`http` → `ws`, `https` → `wss`).

use url::Url;

use super::error::{SessionError, SessionResult};

/// Default path of the push channel
pub const DEFAULT_PATH: &str = "/ws";

/// Build the WebSocket URL for `path` on the page `origin`
pub fn websocket_url(origin: &str, path: &str) -> SessionResult<Url> {
    let mut url = Url::parse(origin)?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SessionError::Endpoint(format!(
                "unsupported origin scheme `{}`",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SessionError::Endpoint(format!("cannot switch `{}` to `{}`", origin, scheme)))?;

    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };
    url.set_path(&path);
    url.set_query(None);
    url.set_fragment(None);

    Ok(url)
}

/// Validate an explicit WebSocket URL
pub fn parse_websocket_url(raw: &str) -> SessionResult<Url> {
    let url = Url::parse(raw)?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(SessionError::Endpoint(format!(
            "expected ws:// or wss:// URL, got `{}`",
            other
        ))),
    }
}
