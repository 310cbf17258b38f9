pub mod health;
pub mod poll;
pub mod sessions;
pub mod sharing;
pub mod sse;
pub mod websocket;

use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};

use crate::AppState;
use crate::error::GatewayError;
use crate::manager::SessionHandle;
use crate::session::SessionId;
use crate::sharing::ClientId;

// Re-export all handlers for easy route registration
pub use health::{health_handler, health_live_handler, metrics_handler};
pub use poll::{get_update, long_poll, poll};
pub use sessions::{close_session, create_session, get_session};
pub use sharing::{invite_guest, join_session, list_guests, revoke_guest, update_guest};
pub use sse::event_stream;
pub use websocket::session_websocket;

/// Cookie carrying the browser's sticky client id.
pub const CLIENT_COOKIE: &str = "gw_client";

/// The caller's client id, minting and setting one if the browser has none.
pub fn ensure_client(jar: CookieJar) -> (CookieJar, ClientId) {
    if let Some(cookie) = jar.get(CLIENT_COOKIE).filter(|c| !c.value().is_empty()) {
        let client = ClientId::from(cookie.value());
        return (jar, client);
    }
    let client = ClientId::generate();
    let cookie = Cookie::build((CLIENT_COOKIE, client.as_str().to_string()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax);
    (jar.add(cookie), client)
}

/// The caller's client id. Requests without one cannot be participants.
pub fn require_client(jar: &CookieJar) -> Result<ClientId, GatewayError> {
    jar.get(CLIENT_COOKIE)
        .filter(|cookie| !cookie.value().is_empty())
        .map(|cookie| ClientId::from(cookie.value()))
        .ok_or(GatewayError::Forbidden("missing client cookie"))
}

pub async fn find_session(state: &AppState, id: &str) -> Result<SessionHandle, GatewayError> {
    let id: SessionId = id.parse().map_err(|_| GatewayError::SessionNotFound)?;
    state
        .registry
        .get(id)
        .await
        .ok_or(GatewayError::SessionNotFound)
}
