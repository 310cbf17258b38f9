use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use axum_extra::extract::cookie::CookieJar;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{ensure_client, find_session, require_client};
use crate::AppState;
use crate::error::GatewayError;
use crate::manager::NewSession;
use crate::session::{ConnectionTarget, DisplaySettings, SessionId, SessionInfo, SessionState};
use crate::sharing::Role;

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    #[serde(flatten)]
    pub target: ConnectionTarget,
    #[serde(default)]
    pub display: DisplaySettings,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub id: SessionId,
    pub state: SessionState,
}

/// Session snapshot as seen by one participant.
#[derive(Serialize)]
pub struct SessionView {
    #[serde(flatten)]
    pub role: Role,
    #[serde(flatten)]
    pub info: SessionInfo,
}

pub async fn create_session(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(req): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    if req.target.host_address.trim().is_empty() {
        return Err(GatewayError::BadRequest("host_address is required".into()));
    }
    req.display
        .validate()
        .map_err(|e| GatewayError::BadRequest(format!("display settings: {e}")))?;
    let (jar, owner) = ensure_client(jar);
    let handle = state
        .registry
        .create(NewSession {
            owner,
            target: req.target,
            display: req.display,
        })
        .await;
    info!(session = %handle.id(), "session created");

    Ok((
        StatusCode::CREATED,
        jar,
        Json(CreateSessionResponse {
            id: handle.id(),
            state: handle.state(),
        }),
    ))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    jar: CookieJar,
) -> Result<Json<SessionView>, GatewayError> {
    let client = require_client(&jar)?;
    let handle = find_session(&state, &id).await?;
    let role = handle.authorize(&client).await?;
    Ok(Json(SessionView {
        role,
        info: handle.info(),
    }))
}

/// Owner close. The session ends once its host exits.
pub async fn close_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    jar: CookieJar,
) -> Result<StatusCode, GatewayError> {
    let client = require_client(&jar)?;
    let handle = find_session(&state, &id).await?;
    handle.close(&client).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::{body_json, json_request, request, send};
    use crate::test_helpers::test_app_state;
    use axum::http::header;

    fn cookie_value(response: &axum::http::Response<axum::body::Body>) -> String {
        let set_cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap();
        let pair = set_cookie.split(';').next().unwrap();
        let (name, value) = pair.split_once('=').unwrap();
        assert_eq!(name, crate::handlers::CLIENT_COOKIE);
        value.to_string()
    }

    #[tokio::test]
    async fn test_create_sets_cookie_and_connects() {
        let (state, launcher) = test_app_state();
        let app = crate::build_router(state);

        let resp = send(
            &app,
            json_request(
                "POST",
                "/api/sessions",
                None,
                serde_json::json!({"host_address": "10.0.0.5", "user_name": "alice", "password": "pw"}),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let owner = cookie_value(&resp);
        let created: CreateSessionResponse =
            serde_json::from_value(body_json(resp).await).unwrap();
        assert_eq!(created.state, SessionState::Connecting);

        let mut host = launcher.next_host().await;
        assert_eq!(host.request.session_id, created.id);
        assert_eq!(
            host.expect_handshake().await,
            vec!["SRV10.0.0.5", "USRalice", "PWDpw", "CON"]
        );

        let resp = send(
            &app,
            request("GET", &format!("/api/sessions/{}", created.id), Some(&owner)),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let view = body_json(resp).await;
        assert_eq!(view["role"], "owner");
        assert_eq!(view["target"]["host_address"], "10.0.0.5");
        assert!(view["target"].get("password").is_none());
    }

    #[tokio::test]
    async fn test_create_rejects_out_of_range_display() {
        let (state, _launcher) = test_app_state();
        let app = crate::build_router(state.clone());

        for display in [
            serde_json::json!({"quality": 200}),
            serde_json::json!({"width": 0, "height": 720}),
            serde_json::json!({"width": 1280}),
        ] {
            let resp = send(
                &app,
                json_request(
                    "POST",
                    "/api/sessions",
                    Some("browser-1"),
                    serde_json::json!({"host_address": "h", "display": display}),
                ),
            )
            .await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{display}");
            assert_eq!(body_json(resp).await["code"], "bad_request");
        }
        assert!(state.registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_cookie_gets_a_fresh_client() {
        let (state, _launcher) = test_app_state();
        let app = crate::build_router(state);
        let resp = send(
            &app,
            json_request(
                "POST",
                "/api/sessions",
                Some(""),
                serde_json::json!({"host_address": "h"}),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert!(!cookie_value(&resp).is_empty());
        let created: CreateSessionResponse =
            serde_json::from_value(body_json(resp).await).unwrap();

        let resp = send(
            &app,
            request("GET", &format!("/api/sessions/{}", created.id), Some("")),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_existing_cookie_is_kept() {
        let (state, _launcher) = test_app_state();
        let app = crate::build_router(state);
        let resp = send(
            &app,
            json_request(
                "POST",
                "/api/sessions",
                Some("browser-1"),
                serde_json::json!({"host_address": "h"}),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert!(resp.headers().get(header::SET_COOKIE).is_none());
    }

    #[tokio::test]
    async fn test_create_requires_host_address() {
        let (state, _launcher) = test_app_state();
        let app = crate::build_router(state);
        let resp = send(
            &app,
            json_request("POST", "/api/sessions", None, serde_json::json!({"host_address": " "})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["code"], "bad_request");
    }

    #[tokio::test]
    async fn test_unknown_session_and_strangers() {
        let (state, _launcher) = test_app_state();
        let handle = state
            .registry
            .create(NewSession {
                owner: "owner".into(),
                target: ConnectionTarget {
                    host_address: "h".into(),
                    ..Default::default()
                },
                ..Default::default()
            })
            .await;
        let app = crate::build_router(state);

        let resp = send(&app, request("GET", "/api/sessions/not-a-uuid", Some("owner"))).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let uri = format!("/api/sessions/{}", handle.id());
        let resp = send(&app, request("GET", &uri, Some("stranger"))).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = send(&app, request("GET", &uri, None)).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = send(&app, request("DELETE", &uri, Some("stranger"))).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_owner_delete_closes_host() {
        let (state, launcher) = test_app_state();
        let handle = state
            .registry
            .create(NewSession {
                owner: "owner".into(),
                target: ConnectionTarget {
                    host_address: "h".into(),
                    ..Default::default()
                },
                ..Default::default()
            })
            .await;
        let app = crate::build_router(state);
        let mut host = launcher.next_host().await;
        host.expect_handshake().await;

        let uri = format!("/api/sessions/{}", handle.id());
        let resp = send(&app, request("DELETE", &uri, Some("owner"))).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(host.next_command().await.as_deref(), Some("CLO"));

        host.exit(Some(0));
        let info = handle.wait_terminated().await;
        assert_eq!(info.exit_code, Some(0));
    }
}
