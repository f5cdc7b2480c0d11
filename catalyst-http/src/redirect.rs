//! HTTP redirect handler (component G): parses playback URL shapes,
//! applies CDN-offload policy and host pinning, then delegates to the
//! selector and rewrites the request to the chosen node.

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Redirect, Response};
use rand::Rng;
use std::collections::HashMap;

use catalyst_core::selector::{get_best_node, parse_coords};

use crate::error::{AppError, AppResult};
use crate::path::{parse_path, PathType};
use crate::state::AppState;

pub async fn handle_redirect(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> AppResult<Response> {
    let proto = request_proto(&headers);
    let parsed = parse_path(uri.path());
    let (lat, lon) = extract_coords(&query, &headers);

    // CDN offload (hls/webrtc only). Only reachable when the path matched a
    // known shape, since it needs the playback id.
    if let Some(parsed) = &parsed {
        if matches!(parsed.path_type, PathType::Hls | PathType::Webrtc) {
            if let Some(pct) = state.config.cdn.playback_pct.get(&parsed.playback_id) {
                let u: f64 = rand::thread_rng().gen_range(0.0..100.0);
                if u < f64::from(*pct) {
                    if parsed.path_type == PathType::Webrtc {
                        return Ok((StatusCode::NOT_ACCEPTABLE, "use hls").into_response());
                    }
                    return Ok(build_cdn_redirect(&state, &proto, parsed, lat, lon, uri.query())?);
                }
            }
        }
    }

    // Host pinning: only when `nodeHost` is explicitly configured (not the
    // advertise-host fallback chain used for building target URLs below) and
    // it differs from the incoming Host header, pin back to it regardless of
    // whether the path parsed — this is what terminates a CDN that rewrote
    // the host back to a fleet ingress even on a path it mangled.
    let configured_host = &state.config.node.host;
    if !configured_host.is_empty() {
        if let Some(host_header) = headers.get(header::HOST).and_then(|v| v.to_str().ok()) {
            if host_header != configured_host {
                let target = format!("{proto}://{configured_host}{}", full_path_and_query(&uri));
                return Ok(Redirect::temporary(&target).into_response());
            }
        }
    }

    let Some(parsed) = parsed else {
        return Err(AppError::not_found("unrecognized playback path"));
    };

    let selection = get_best_node(
        &state.registry,
        &state.config.redirect.prefixes,
        &parsed.playback_id,
        Some((lat, lon)).filter(|_| lat != 0.0 || lon != 0.0),
        state.own_node_name(),
        &state.config.redirect.fallback_prefix,
    );

    let target_node_url = resolve_node_url(&state, &selection.node_name, &proto)?;
    let path = parsed.build_path(&selection.full_playback_id);
    let query_suffix = uri.query().map(|q| format!("?{q}")).unwrap_or_default();

    let target = format!("{target_node_url}{path}{query_suffix}");
    Ok(Redirect::temporary(&target).into_response())
}

fn request_proto(headers: &HeaderMap) -> &'static str {
    let is_https = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("https"));
    if is_https {
        "https"
    } else {
        "http"
    }
}

/// `(lat, lon)` from `?lat`/`?lon` if valid, else `X-Latitude`/`X-Longitude`,
/// else `(0, 0)` — callers distinguish "no coords" from "(0,0) on purpose"
/// by checking both are exactly zero, matching `parse_coords`'s contract.
fn extract_coords(query: &HashMap<String, String>, headers: &HeaderMap) -> (f64, f64) {
    if let Some((lat, lon)) = parse_coords(query.get("lat").map(String::as_str), query.get("lon").map(String::as_str)) {
        return (lat, lon);
    }
    let header_str = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    if let Some((lat, lon)) = parse_coords(header_str("x-latitude"), header_str("x-longitude")) {
        return (lat, lon);
    }
    (0.0, 0.0)
}

fn full_path_and_query(uri: &Uri) -> String {
    uri.path_and_query().map(|pq| pq.to_string()).unwrap_or_else(|| uri.path().to_string())
}

fn resolve_node_url(state: &AppState, node_name: &str, proto: &str) -> AppResult<String> {
    if node_name == state.own_node_name() {
        let host = state.config.node.resolved_host();
        return Ok(format!("{proto}://{host}"));
    }

    let tags = state
        .registry
        .get_tags(node_name)
        .ok_or_else(|| AppError::internal(format!("unknown node {node_name}")))?;

    let tag_key = proto; // "https" or "http", matching the node tag map keys.
    tags.get(tag_key)
        .cloned()
        .map(|url| url.trim_end_matches('/').to_string())
        .ok_or_else(|| AppError::internal(format!("node {node_name} has no {tag_key} tag")))
}

fn build_cdn_redirect(
    state: &AppState,
    proto: &str,
    parsed: &crate::path::ParsedPath,
    lat: f64,
    lon: f64,
    raw_query: Option<&str>,
) -> AppResult<Response> {
    let selection = get_best_node(
        &state.registry,
        &state.config.redirect.prefixes,
        &parsed.playback_id,
        Some((lat, lon)).filter(|_| lat != 0.0 || lon != 0.0),
        state.own_node_name(),
        &state.config.redirect.fallback_prefix,
    );

    let cdn = &state.config.cdn;
    let host = if cdn.subdomain {
        format!("{}.{}", selection.node_name, cdn.redirect_prefix_host)
    } else {
        cdn.redirect_prefix_host.clone()
    };

    let built_path = parsed.build_path(&selection.full_playback_id);
    let query_suffix = raw_query.map(|q| format!("?{q}")).unwrap_or_default();
    let target = format!(
        "{proto}://{host}{}{built_path}{query_suffix}",
        cdn.redirect_prefix_path.trim_end_matches('/')
    );

    Ok(Redirect::temporary(&target).into_response())
}
