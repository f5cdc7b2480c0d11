//! `STREAM_SOURCE` handler (component H): the media server's trigger
//! callback, answering where to get a stream's bytes from. Owns the retry
//! budget around `catalyst_core::source::arbitrate_pull` since the retry
//! loop is a property of this one HTTP request, not of the arbitration
//! itself.
//!
//! Wired at `POST /api/mist/trigger` (SPEC_FULL.md 6): the media server
//! names the trigger in the `X-Trigger` header and sends trigger-specific
//! parameters as newline-separated body lines. For `STREAM_SOURCE` the
//! first line is the stream name; every other trigger name is not this
//! core's concern and is answered with an empty body.

use std::time::Duration;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;

use catalyst_core::source::{arbitrate_pull, is_internal_stream_name, mist_source, PullOutcome};
use catalyst_core::Error;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

const TRIGGER_HEADER: &str = "x-trigger";
const STREAM_SOURCE_TRIGGER: &str = "STREAM_SOURCE";

pub async fn handle_stream_source(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> AppResult<impl IntoResponse> {
    let trigger = headers.get(TRIGGER_HEADER).and_then(|v| v.to_str().ok()).unwrap_or("");
    if !trigger.eq_ignore_ascii_case(STREAM_SOURCE_TRIGGER) {
        return Ok(String::new());
    }

    let stream_id = body.lines().next().unwrap_or("").trim().to_string();
    resolve_stream_source(&state, &stream_id).await
}

/// `stream_id` is the raw media-server stream name, e.g. `video+abc` or
/// `catalyst_vod_123`; the playback id is whatever follows the last `+`.
async fn resolve_stream_source(state: &AppState, stream_id: &str) -> AppResult<String> {
    if is_internal_stream_name(stream_id) {
        // Keep the media server's own configured input; no further routing.
        return Ok(String::new());
    }

    if let Some(origin_node) = mist_source(&state.registry, stream_id) {
        return Ok(resolve_dtsc_url(state, &origin_node)?);
    }

    let playback_id = stream_id.rsplit('+').next().unwrap_or(stream_id).to_string();

    if !state.lookup_limiter.check_and_mark(&playback_id) {
        return Err(AppError::from(Error::RateLimited {
            retry_after_secs: state.config.timeouts.directory_lookup_rate_limit_secs,
        }));
    }

    let own_region = state.config.node.effective_region().to_string();
    let own_node_name = state.own_node_name().to_string();
    let lease_dur = Duration::from_secs(state.config.timeouts.pull_lease_secs);
    let retry_interval = Duration::from_secs(state.config.timeouts.stream_source_retry_interval_secs);
    let max_attempts = state.config.timeouts.stream_source_retries;
    let max_wrong_region_retries = state.config.timeouts.stream_source_max_wrong_region_retries;

    let http_client = state.http_client.clone();
    let bus = state.bus.clone();

    let mut wrong_region_retries = 0u32;
    let mut attempt = 0u32;
    loop {
        attempt += 1;

        let outcome = arbitrate_pull(
            state.directory.as_ref(),
            stream_id,
            &playback_id,
            &own_region,
            &own_node_name,
            lease_dur,
            bus.as_ref(),
            |peer| wake_peer(http_client.clone(), peer),
        )
        .await;

        match outcome {
            Ok(PullOutcome::Push) => return Ok("push://".to_string()),
            Ok(PullOutcome::Pull(url)) => return Ok(url),
            Err(err @ (Error::StreamDeleted | Error::StreamSuspended)) => {
                return Err(AppError::from(err));
            }
            Err(Error::WrongRegion { .. }) => {
                wrong_region_retries += 1;
                if wrong_region_retries > max_wrong_region_retries {
                    return Ok("push://".to_string());
                }
            }
            Err(err) if !err.is_retryable() => return Err(AppError::from(err)),
            Err(_) => {}
        }

        if attempt >= max_attempts {
            // Retry budget exhausted: tell the media server to expect a
            // push rather than failing the request (SPEC_FULL.md 4.H).
            return Ok("push://".to_string());
        }
        tokio::time::sleep(retry_interval).await;
    }
}

/// Maps an in-cluster node name to its advertised `dtsc` tag
/// (SPEC_FULL.md 4.H: "every non-error response is passed through node-URL
/// resolution"). A node missing its `dtsc` tag is internal state corruption,
/// not a retryable condition.
fn resolve_dtsc_url(state: &AppState, node_name: &str) -> AppResult<String> {
    let tags = state
        .registry
        .get_tags(node_name)
        .ok_or_else(|| AppError::internal(format!("unknown node {node_name}")))?;
    tags.get("dtsc")
        .cloned()
        .ok_or_else(|| AppError::internal(format!("node {node_name} has no dtsc tag")))
}

/// Fire-and-forget nudge to a peer node in the stream's pinned region,
/// asking it to attempt the pull itself. Best-effort: failures here just
/// mean the peer finds out from its own next poll instead.
fn wake_peer(client: reqwest::Client, peer_node_name: String) {
    tokio::spawn(async move {
        let url = format!("http://{peer_node_name}/admin/wake");
        let _ = client.post(url).send().await;
    });
}
