use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use tracing::info;

use super::{ensure_client, find_session, require_client};
use crate::AppState;
use crate::error::GatewayError;
use crate::sharing::{GuestId, GuestInfo};

#[derive(Debug, Default, Deserialize)]
pub struct GuestControlRequest {
    #[serde(default)]
    pub control: bool,
}

fn parse_guest(raw: &str) -> Result<GuestId, GatewayError> {
    raw.parse().map_err(|_| GatewayError::GuestNotFound)
}

/// Owner creates a single-use invitation.
pub async fn invite_guest(
    State(state): State<AppState>,
    Path(id): Path<String>,
    jar: CookieJar,
    Json(req): Json<GuestControlRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    let client = require_client(&jar)?;
    let handle = find_session(&state, &id).await?;
    let guest = handle.invite(&client, req.control).await?;
    Ok((StatusCode::CREATED, Json(guest)))
}

pub async fn list_guests(
    State(state): State<AppState>,
    Path(id): Path<String>,
    jar: CookieJar,
) -> Result<Json<Vec<GuestInfo>>, GatewayError> {
    let client = require_client(&jar)?;
    let handle = find_session(&state, &id).await?;
    Ok(Json(handle.list_guests(&client).await?))
}

pub async fn update_guest(
    State(state): State<AppState>,
    Path((id, guest)): Path<(String, String)>,
    jar: CookieJar,
    Json(req): Json<GuestControlRequest>,
) -> Result<Json<GuestInfo>, GatewayError> {
    let client = require_client(&jar)?;
    let handle = find_session(&state, &id).await?;
    let guest = parse_guest(&guest)?;
    Ok(Json(handle.update_guest(&client, guest, req.control).await?))
}

pub async fn revoke_guest(
    State(state): State<AppState>,
    Path((id, guest)): Path<(String, String)>,
    jar: CookieJar,
) -> Result<StatusCode, GatewayError> {
    let client = require_client(&jar)?;
    let handle = find_session(&state, &id).await?;
    let guest = parse_guest(&guest)?;
    handle.revoke_guest(&client, guest).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Claim an invitation. Browsers without a client cookie get one here.
pub async fn join_session(
    State(state): State<AppState>,
    Path((id, guest)): Path<(String, String)>,
    jar: CookieJar,
) -> Result<impl IntoResponse, GatewayError> {
    let handle = find_session(&state, &id).await?;
    let guest = parse_guest(&guest)?;
    let (jar, client) = ensure_client(jar);
    let info = handle.join(&client, guest).await?;
    info!(session = %handle.id(), guest = %guest, control = info.control, "guest joined over http");
    Ok((jar, Json(info)))
}
