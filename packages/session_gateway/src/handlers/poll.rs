//! Pull transports: long-poll, plain poll and retrieve-by-index.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::CookieJar;
use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use super::{find_session, require_client};
use crate::AppState;
use crate::error::GatewayError;
use crate::manager::SessionHandle;
use crate::sharing::ClientId;
use crate::transport::Notice;
use crate::transport::wire::{update_to_binary, update_to_text};

/// Longest a long-poll waits on the cache before looking at its notice queue.
const NOTICE_CHECK_INTERVAL: Duration = Duration::from_millis(250);

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

#[derive(Debug, Default, Deserialize)]
pub struct LongPollParams {
    /// Last update index the client has.
    #[serde(default)]
    pub idx: u64,
    /// Window length in milliseconds.
    pub duration: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PollParams {
    /// Comma separated input units, already url-decoded.
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub idx: Option<u64>,
    /// Milliseconds to wait for an update when none is ready.
    pub wait: Option<u64>,
}

/// Long-poll transport. The body streams one line per update or notice
/// until the window closes, the session ends or the client goes away.
pub async fn long_poll(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<LongPollParams>,
    jar: CookieJar,
) -> Result<Response, GatewayError> {
    let client = require_client(&jar)?;
    let handle = find_session(&state, &id).await?;
    handle.open_queue(&client).await?;
    handle
        .record_progress(&client, Some(params.idx), None)
        .await;

    let limit = state.config.transport.long_poll_duration;
    let window = params
        .duration
        .map(Duration::from_millis)
        .map_or(limit, |d| d.min(limit));
    debug!(session = %handle.id(), client = %client, idx = params.idx, ?window, "long-poll opened");

    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(16);
    tokio::spawn(run_long_poll(handle, client, params.idx, window, tx));

    Ok((
        [
            (header::CONTENT_TYPE, TEXT_PLAIN),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response())
}

fn line(mut text: String) -> Result<Bytes, Infallible> {
    text.push('\n');
    Ok(Bytes::from(text))
}

/// Write queued notices. Returns false once nothing more should be written.
async fn drain_notices(
    handle: &SessionHandle,
    client: &ClientId,
    tx: &mpsc::Sender<Result<Bytes, Infallible>>,
) -> bool {
    loop {
        let notice = match handle.next_notice(client).await {
            Ok(Some(notice)) => notice,
            Ok(None) => return true,
            Err(_) => return false,
        };
        let last = matches!(notice, Notice::Disconnected { .. });
        if tx.send(line(notice.to_wire())).await.is_err() || last {
            return false;
        }
    }
}

async fn run_long_poll(
    handle: SessionHandle,
    client: ClientId,
    mut last_idx: u64,
    window: Duration,
    tx: mpsc::Sender<Result<Bytes, Infallible>>,
) {
    let deadline = Instant::now() + window;

    loop {
        if !drain_notices(&handle, &client, &tx).await {
            break;
        }
        let now = Instant::now();
        if now >= deadline || tx.is_closed() {
            break;
        }

        let slice = (deadline - now).min(NOTICE_CHECK_INTERVAL);
        match handle.wait_next(last_idx, slice).await {
            Some(update) => {
                last_idx = update.idx;
                if tx.send(line(update_to_text(&update))).await.is_err() {
                    break;
                }
            }
            None if handle.cache().is_closed() => {
                // Session over; hand out the final notice, if still queued
                drain_notices(&handle, &client, &tx).await;
                break;
            }
            None => {}
        }
    }

    handle.record_progress(&client, Some(last_idx), None).await;
    debug!(session = %handle.id(), client = %client, last_idx, "long-poll closed");
}

/// Plain poll: forward any inputs, then answer with one queued notice or
/// the next update. 204 when there is nothing to say.
pub async fn poll(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<PollParams>,
    jar: CookieJar,
) -> Result<Response, GatewayError> {
    let client = require_client(&jar)?;
    let handle = find_session(&state, &id).await?;
    handle.open_queue(&client).await?;

    if let Some(data) = params.data.as_deref().filter(|d| !d.is_empty()) {
        let outcome = handle.send_input(&client, data).await?;
        if outcome.dropped > 0 {
            debug!(session = %handle.id(), client = %client, dropped = outcome.dropped, "poll inputs dropped");
        }
    }
    if params.idx.is_some() {
        handle.record_progress(&client, params.idx, None).await;
    }

    if let Some(notice) = handle.next_notice(&client).await? {
        return Ok(([(header::CONTENT_TYPE, TEXT_PLAIN)], notice.to_wire()).into_response());
    }

    // never longer than a long-poll window
    let wait = params
        .wait
        .map(Duration::from_millis)
        .unwrap_or(state.config.transport.poll_wait)
        .min(state.config.transport.long_poll_duration);
    match handle.wait_next(params.idx.unwrap_or(0), wait).await {
        Some(update) => {
            Ok(([(header::CONTENT_TYPE, TEXT_PLAIN)], update_to_text(&update)).into_response())
        }
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

/// One cached update in binary form.
pub async fn get_update(
    State(state): State<AppState>,
    Path((id, idx)): Path<(String, u64)>,
    jar: CookieJar,
) -> Result<Response, GatewayError> {
    let client = require_client(&jar)?;
    let handle = find_session(&state, &id).await?;
    handle.authorize(&client).await?;

    let update = handle
        .get_update(idx)
        .await
        .ok_or(GatewayError::UpdateExpired(idx))?;
    debug!(session = %handle.id(), idx, "update retrieved by index");
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        update_to_binary(&update),
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::{body_bytes, body_json, request, send};
    use crate::manager::NewSession;
    use crate::session::ConnectionTarget;
    use crate::config::GatewayConfig;
    use crate::test_helpers::{FakeHost, FakeLauncher, test_app_state, test_app_state_with};
    use crate::transport::framing::HostText;

    async fn connected_session(state: &AppState, launcher: &FakeLauncher) -> (SessionHandle, FakeHost) {
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
        let mut host = launcher.next_host().await;
        host.expect_handshake().await;
        host.send_image(true).await;
        handle.wait_next(0, Duration::from_secs(5)).await.unwrap();
        (handle, host)
    }

    async fn body_text(response: Response) -> String {
        String::from_utf8(body_bytes(response).await.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_poll_forwards_inputs_and_returns_update() {
        let (state, launcher) = test_app_state();
        let (handle, mut host) = connected_session(&state, &launcher).await;
        let app = crate::build_router(state);

        let uri = format!("/api/sessions/{}/poll?data=KUC65-1%2CFSU&idx=0", handle.id());
        let resp = send(&app, request("GET", &uri, Some("owner"))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_text(resp).await.starts_with("1,0,0,64,48,"));

        assert_eq!(host.next_command().await.as_deref(), Some("KUC65-1"));
        assert_eq!(host.next_command().await.as_deref(), Some("FSU"));
    }

    #[tokio::test]
    async fn test_poll_drains_notices_before_updates() {
        let (state, launcher) = test_app_state();
        let (handle, mut host) = connected_session(&state, &launcher).await;
        let app = crate::build_router(state);
        let base = format!("/api/sessions/{}/poll", handle.id());

        // first poll opens the queue
        let resp = send(&app, request("GET", &format!("{base}?idx=1"), Some("owner"))).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        host.send_text(HostText::Terminal("$ l".into())).await;
        host.send_text(HostText::Terminal("s".into())).await;
        host.send_image(false).await;
        handle.wait_next(1, Duration::from_secs(5)).await.unwrap();

        let resp = send(&app, request("GET", &format!("{base}?idx=1"), Some("owner"))).await;
        assert_eq!(body_text(resp).await, "term|$ ls");

        let resp = send(&app, request("GET", &format!("{base}?idx=1"), Some("owner"))).await;
        assert!(body_text(resp).await.starts_with("2,"));

        let resp = send(&app, request("GET", &format!("{base}?idx=2&wait=0"), Some("owner"))).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_poll_wait_capped_by_long_poll_window() {
        let mut config = GatewayConfig::default();
        config.transport.long_poll_duration = Duration::from_millis(50);
        let (state, launcher) = test_app_state_with(config);
        let (handle, _host) = connected_session(&state, &launcher).await;
        let app = crate::build_router(state);

        let uri = format!(
            "/api/sessions/{}/poll?idx=1&wait={}",
            handle.id(),
            u64::MAX
        );
        let resp = tokio::time::timeout(
            Duration::from_secs(5),
            send(&app, request("GET", &uri, Some("owner"))),
        )
        .await
        .expect("poll should return within the long-poll window");
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let uri = format!(
            "/api/sessions/{}/longpoll?idx=1&duration={}",
            handle.id(),
            u64::MAX
        );
        let resp = send(&app, request("GET", &uri, Some("owner"))).await;
        let body = tokio::time::timeout(Duration::from_secs(5), body_text(resp))
            .await
            .expect("long-poll window should be capped");
        assert_eq!(body, "");
    }

    #[tokio::test]
    async fn test_poll_rejects_strangers() {
        let (state, launcher) = test_app_state();
        let (handle, _host) = connected_session(&state, &launcher).await;
        let app = crate::build_router(state);

        let uri = format!("/api/sessions/{}/poll?data=FSU", handle.id());
        let resp = send(&app, request("GET", &uri, Some("stranger"))).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_get_update_by_index() {
        let (state, launcher) = test_app_state();
        let (handle, _host) = connected_session(&state, &launcher).await;
        let app = crate::build_router(state);

        let uri = format!("/api/sessions/{}/updates/1", handle.id());
        let resp = send(&app, request("GET", &uri, Some("owner"))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/octet-stream"
        );
        let bytes = body_bytes(resp).await;
        assert_eq!(&bytes[4..8], &1i32.to_le_bytes());

        let uri = format!("/api/sessions/{}/updates/99", handle.id());
        let resp = send(&app, request("GET", &uri, Some("owner"))).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await["code"], "update_expired");
    }

    #[tokio::test]
    async fn test_long_poll_streams_until_disconnect() {
        let (state, launcher) = test_app_state();
        let (handle, host) = connected_session(&state, &launcher).await;
        let app = crate::build_router(state);

        let uri = format!("/api/sessions/{}/longpoll?idx=0&duration=5000", handle.id());
        let resp = send(&app, request("GET", &uri, Some("owner"))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        host.exit(Some(0));

        let body = body_text(resp).await;
        let lines: Vec<&str> = body.lines().collect();
        assert!(lines[0].starts_with("1,0,0,64,48,"), "{body}");
        assert_eq!(lines.last(), Some(&"disconnected|0"));
    }

    #[tokio::test]
    async fn test_long_poll_window_closes_without_updates() {
        let (state, launcher) = test_app_state();
        let (handle, _host) = connected_session(&state, &launcher).await;
        let app = crate::build_router(state);

        let uri = format!("/api/sessions/{}/longpoll?idx=1&duration=50", handle.id());
        let resp = send(&app, request("GET", &uri, Some("owner"))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_text(resp).await, "");
        assert!(!handle.is_terminated());
    }
}
