use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::channel::ChannelProxy;
use crate::config::GroupType;
use crate::error::ProxyError;
use crate::groups::Group;
use crate::headers::{apply_header_rules, HeaderVariableContext};
use crate::keypool::ApiKey;
use crate::logging::types::{RequestLog, REQ_TYPE_FINAL, REQ_TYPE_RETRY};
use crate::server::model_list::{filter_model_list, should_intercept_model_list};
use crate::server::relay::{parse_usage, relay_sse_stream, StreamEnd, TokenUsage};
use crate::server::upstream_error::{decompress_if_gzip, is_ignorable_error, parse_upstream_error};
use crate::server::AppState;

const MAX_REQUEST_BODY_BYTES: usize = 16 * 1024 * 1024;
/// Sentinel status recorded when the client went away (nginx convention).
const STATUS_CLIENT_CLOSED_REQUEST: u16 = 499;
const STREAM_CHANNEL_CAPACITY: usize = 32;

/// Client auth material never travels upstream; the channel injects its own.
const STRIPPED_AUTH_HEADERS: [&str; 3] = ["authorization", "x-api-key", "x-goog-api-key"];

/// Everything one attempt (and its log entry) needs to know about the
/// request, captured once before the retry loop.
#[derive(Clone)]
struct RequestContext {
    started: Instant,
    timestamp: DateTime<Utc>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    source_ip: String,
    user_agent: String,
    is_stream: bool,
    original_group: Arc<Group>,
    group: Arc<Group>,
    /// Model name from the pre-redirect body; drives premium handling.
    model: String,
    request_body: String,
}

pub async fn handle_proxy(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(params): Path<HashMap<String, String>>,
    req: Request,
) -> Response {
    let started = Instant::now();
    let group_name = params.get("group_name").cloned().unwrap_or_default();

    let original_group = match state.group_manager.get_group_by_name(&group_name) {
        Ok(found) => found,
        Err(e) => return e.into_response(),
    };

    let sub_group_name =
        match state
            .sub_groups
            .select(&original_group, &state.group_manager, &state.key_provider)
        {
            Ok(selected) => selected,
            Err(e) => {
                tracing::error!(
                    aggregate_group = %original_group.name,
                    "Failed to select sub-group from aggregate: {}",
                    e
                );
                return ProxyError::NoKeysAvailable("No available sub-groups".into())
                    .into_response();
            }
        };

    let group = match sub_group_name {
        Some(name) => match state.group_manager.get_group_by_name(&name) {
            Ok(found) => found,
            Err(e) => return e.into_response(),
        },
        None => original_group.clone(),
    };

    let channel = match state.channels.get_channel(&group) {
        Ok(found) => found,
        Err(e) => {
            return ProxyError::Internal(format!(
                "Failed to get channel for group '{}': {}",
                group_name, e
            ))
            .into_response()
        }
    };

    let (parts, body) = req.into_parts();
    let body_bytes = match axum::body::to_bytes(body, MAX_REQUEST_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!("Failed to read request body: {}", e);
            return ProxyError::BadRequest("Failed to read request body".into()).into_response();
        }
    };

    let final_body = match apply_param_overrides(&body_bytes, &group) {
        Ok(merged) => merged,
        Err(e) => {
            return ProxyError::Internal(format!("Failed to apply parameter overrides: {}", e))
                .into_response()
        }
    };

    // Stream classification looks at the body as the client sent it.
    let is_stream = channel.is_stream_request(&parts.headers, parts.uri.query(), &body_bytes);

    let user_agent = parts
        .headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let ctx = RequestContext {
        started,
        timestamp: Utc::now(),
        method: parts.method.clone(),
        uri: parts.uri.clone(),
        source_ip: client_ip(&parts.headers, peer),
        headers: parts.headers,
        user_agent,
        is_stream,
        original_group,
        group,
        model: channel.extract_model(&final_body),
        request_body: String::from_utf8_lossy(&final_body).into_owned(),
    };

    execute_with_retry(state, channel, ctx, final_body).await
}

/// The retry loop. Each attempt selects a fresh key and re-applies model
/// redirection to the original body; `max_retries` bounds the extra
/// attempts, so at most `max_retries + 1` upstream calls happen.
async fn execute_with_retry(
    state: Arc<AppState>,
    channel: Arc<dyn ChannelProxy>,
    ctx: RequestContext,
    body: Bytes,
) -> Response {
    let mut retry_count: u32 = 0;

    loop {
        let api_key = match state.key_provider.select_key(ctx.group.id) {
            Ok(key) => key,
            Err(e) => {
                tracing::error!(
                    group = %ctx.group.name,
                    attempt = retry_count + 1,
                    "Failed to select a key: {}",
                    e
                );
                log_attempt(
                    &state,
                    &ctx,
                    None,
                    StatusCode::SERVICE_UNAVAILABLE.as_u16(),
                    Some(e.to_string()),
                    "",
                    REQ_TYPE_FINAL,
                    None,
                );
                return ProxyError::NoKeysAvailable(e.to_string()).into_response();
            }
        };

        let upstream_url = match channel.build_upstream_url(&ctx.uri, &ctx.original_group.name) {
            Ok(url) => url,
            Err(e) => {
                return ProxyError::Internal(format!("Failed to build upstream URL: {}", e))
                    .into_response()
            }
        };

        // Redirection is reapplied each attempt against the original body.
        let attempt_body = match channel.apply_model_redirect(body.to_vec(), &ctx.group) {
            Ok(rewritten) => rewritten,
            Err(e) => {
                log_attempt(
                    &state,
                    &ctx,
                    Some(api_key.as_ref()),
                    StatusCode::BAD_REQUEST.as_u16(),
                    Some(e.to_string()),
                    &upstream_url,
                    REQ_TYPE_FINAL,
                    None,
                );
                return e.into_response();
            }
        };

        let requested_model = channel.extract_model(&attempt_body);
        check_model_permissions(&requested_model, &api_key, &ctx.group);

        let url = match reqwest::Url::parse(&upstream_url) {
            Ok(parsed) => parsed,
            Err(e) => {
                return ProxyError::Internal(format!("Invalid upstream URL: {}", e))
                    .into_response()
            }
        };

        let mut out_headers = ctx.headers.clone();
        sanitize_forward_headers(&mut out_headers);
        channel.modify_request(&mut out_headers, &url, &api_key, &ctx.group);
        if !ctx.group.header_rules.is_empty() {
            let var_ctx = HeaderVariableContext {
                api_key: api_key.key_value.clone(),
                group_name: ctx.group.name.clone(),
                client_ip: ctx.source_ip.clone(),
                user_agent: ctx.user_agent.clone(),
            };
            apply_header_rules(&mut out_headers, &ctx.group.header_rules, &var_ctx);
        }

        let client = if ctx.is_stream {
            channel.stream_client()
        } else {
            channel.http_client()
        };
        let mut request = client
            .request(ctx.method.clone(), url)
            .headers(out_headers)
            .body(attempt_body);
        if ctx.is_stream {
            request = request.header("x-accel-buffering", "no");
        } else {
            request = request.timeout(Duration::from_secs(ctx.group.config.request_timeout_secs));
        }

        match request.send().await {
            Err(e) => {
                if is_ignorable_error(&e) {
                    tracing::debug!(
                        key_id = api_key.id,
                        "Client-side ignorable error, aborting retries: {}",
                        e
                    );
                    log_attempt(
                        &state,
                        &ctx,
                        Some(api_key.as_ref()),
                        STATUS_CLIENT_CLOSED_REQUEST,
                        Some(e.to_string()),
                        &upstream_url,
                        REQ_TYPE_FINAL,
                        None,
                    );
                    return StatusCode::from_u16(STATUS_CLIENT_CLOSED_REQUEST)
                        .unwrap_or(StatusCode::BAD_REQUEST)
                        .into_response();
                }

                let parsed = e.to_string();
                tracing::debug!(
                    attempt = retry_count + 1,
                    max_retries = ctx.group.config.max_retries,
                    key_id = api_key.id,
                    "Request failed: {}",
                    e
                );
                match conclude_failure(
                    &state,
                    &ctx,
                    &api_key,
                    retry_count,
                    StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                    parsed.clone(),
                    parsed,
                    &upstream_url,
                ) {
                    Some(response) => return response,
                    None => {
                        retry_count += 1;
                        continue;
                    }
                }
            }
            Ok(resp) => {
                let status = resp.status().as_u16();

                // 404 is the upstream's answer, not a key problem: no retry,
                // no status update, forwarded as-is.
                if status >= 400 && status != 404 {
                    let encoding = resp
                        .headers()
                        .get(header::CONTENT_ENCODING)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    let raw = match resp.bytes().await {
                        Ok(bytes) => bytes.to_vec(),
                        Err(e) => {
                            tracing::error!("Failed to read error body: {}", e);
                            b"Failed to read error body".to_vec()
                        }
                    };
                    let error_body = decompress_if_gzip(encoding.as_deref(), raw);
                    let error_message = String::from_utf8_lossy(&error_body).into_owned();
                    let parsed = parse_upstream_error(&error_body);
                    tracing::debug!(
                        status,
                        attempt = retry_count + 1,
                        max_retries = ctx.group.config.max_retries,
                        key_id = api_key.id,
                        "Request failed upstream: {}",
                        parsed
                    );
                    match conclude_failure(
                        &state,
                        &ctx,
                        &api_key,
                        retry_count,
                        status,
                        error_message,
                        parsed,
                        &upstream_url,
                    ) {
                        Some(response) => return response,
                        None => {
                            retry_count += 1;
                            continue;
                        }
                    }
                }

                if status < 400 {
                    state
                        .key_provider
                        .update_status(ctx.group.id, api_key.id, true, None);
                    mark_organization_verified_on_success(&state, &ctx, &api_key);
                    tracing::debug!(
                        group = %ctx.group.name,
                        attempt = retry_count + 1,
                        key_id = api_key.id,
                        "Request succeeded"
                    );
                }

                return respond_success(state, ctx, api_key, resp, upstream_url).await;
            }
        }
    }
}

/// Shared failure bookkeeping. Returns the terminal response on the last
/// attempt, `None` when the caller should retry.
#[allow(clippy::too_many_arguments)]
fn conclude_failure(
    state: &AppState,
    ctx: &RequestContext,
    api_key: &ApiKey,
    retry_count: u32,
    status: u16,
    error_message: String,
    parsed_error: String,
    upstream_url: &str,
) -> Option<Response> {
    state
        .key_provider
        .update_status(ctx.group.id, api_key.id, false, Some(&parsed_error));

    let is_last = retry_count >= ctx.group.config.max_retries;
    let request_type = if is_last { REQ_TYPE_FINAL } else { REQ_TYPE_RETRY };
    log_attempt(
        state,
        ctx,
        Some(api_key),
        status,
        Some(parsed_error),
        upstream_url,
        request_type,
        None,
    );

    if !is_last {
        return None;
    }

    // The upstream body is forwarded verbatim when it is valid JSON;
    // anything else gets wrapped.
    let response = if serde_json::from_slice::<serde_json::Value>(error_message.as_bytes()).is_ok()
    {
        let mut response = Response::new(Body::from(error_message));
        *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        response
    } else {
        ProxyError::Upstream {
            status,
            message: error_message,
        }
        .into_response()
    };
    Some(response)
}

async fn respond_success(
    state: Arc<AppState>,
    ctx: RequestContext,
    api_key: Arc<ApiKey>,
    resp: reqwest::Response,
    upstream_url: String,
) -> Response {
    if should_intercept_model_list(ctx.uri.path(), &ctx.method) {
        return respond_model_list(state, ctx, api_key, resp, upstream_url).await;
    }

    let status = resp.status().as_u16();
    let mut headers = resp.headers().clone();
    sanitize_response_headers(&mut headers);

    if ctx.is_stream {
        headers.insert(
            header::CACHE_CONTROL,
            header::HeaderValue::from_static("no-cache"),
        );
        headers.insert(
            header::CONNECTION,
            header::HeaderValue::from_static("keep-alive"),
        );
        headers.insert(
            "x-accel-buffering",
            header::HeaderValue::from_static("no"),
        );

        let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let (usage, end) = relay_sse_stream(resp, tx).await;
            let (final_status, error) = match end {
                StreamEnd::Complete => (status, None),
                StreamEnd::ClientGone => (
                    STATUS_CLIENT_CLOSED_REQUEST,
                    Some("client disconnected during stream".to_string()),
                ),
                StreamEnd::UpstreamError(e) => (status, Some(e)),
            };
            log_attempt(
                &state,
                &ctx,
                Some(api_key.as_ref()),
                final_status,
                error,
                &upstream_url,
                REQ_TYPE_FINAL,
                usage,
            );
        });

        let mut response = Response::new(Body::from_stream(ReceiverStream::new(rx)));
        *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
        *response.headers_mut() = headers;
        return response;
    }

    let raw = match resp.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!("Failed to read upstream response body: {}", e);
            Bytes::new()
        }
    };
    let usage = parse_usage(&raw);
    log_attempt(
        &state,
        &ctx,
        Some(api_key.as_ref()),
        status,
        None,
        &upstream_url,
        REQ_TYPE_FINAL,
        usage,
    );

    let mut response = Response::new(Body::from(raw));
    *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
    *response.headers_mut() = headers;
    response
}

async fn respond_model_list(
    state: Arc<AppState>,
    ctx: RequestContext,
    api_key: Arc<ApiKey>,
    resp: reqwest::Response,
    upstream_url: String,
) -> Response {
    let status = resp.status().as_u16();
    let encoding = resp
        .headers()
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let raw = match resp.bytes().await {
        Ok(bytes) => bytes.to_vec(),
        Err(e) => {
            tracing::error!("Failed to read model list body: {}", e);
            Vec::new()
        }
    };
    let plain = decompress_if_gzip(encoding.as_deref(), raw);
    let body = filter_model_list(&plain, &ctx.group).unwrap_or(plain);

    log_attempt(
        &state,
        &ctx,
        Some(api_key.as_ref()),
        status,
        None,
        &upstream_url,
        REQ_TYPE_FINAL,
        None,
    );

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
}

#[allow(clippy::too_many_arguments)]
fn log_attempt(
    state: &AppState,
    ctx: &RequestContext,
    api_key: Option<&ApiKey>,
    status_code: u16,
    error_message: Option<String>,
    upstream_addr: &str,
    request_type: &str,
    usage: Option<TokenUsage>,
) {
    let entry = build_log_entry(
        ctx,
        status_code,
        error_message,
        upstream_addr,
        request_type,
        usage,
    );
    state
        .recorder
        .record(entry, api_key.map(|key| key.key_value.as_str()));
}

fn build_log_entry(
    ctx: &RequestContext,
    status_code: u16,
    error_message: Option<String>,
    upstream_addr: &str,
    request_type: &str,
    usage: Option<TokenUsage>,
) -> RequestLog {
    let (request_body, user_agent) = if ctx.group.config.enable_request_body_logging {
        (ctx.request_body.clone(), ctx.user_agent.clone())
    } else {
        (String::new(), String::new())
    };

    let delegated = ctx.original_group.group_type == GroupType::Aggregate
        && ctx.original_group.id != ctx.group.id;
    let (parent_group_id, parent_group_name) = if delegated {
        (
            Some(ctx.original_group.id),
            Some(ctx.original_group.name.clone()),
        )
    } else {
        (None, None)
    };

    RequestLog {
        id: None,
        timestamp: ctx.timestamp,
        group_id: ctx.group.id,
        group_name: ctx.group.name.clone(),
        parent_group_id,
        parent_group_name,
        is_success: error_message.is_none() && status_code < 400,
        source_ip: ctx.source_ip.clone(),
        status_code,
        request_path: ctx.uri.to_string(),
        duration_ms: ctx.started.elapsed().as_millis() as i64,
        user_agent,
        request_type: request_type.to_string(),
        is_stream: ctx.is_stream,
        upstream_addr: upstream_addr.to_string(),
        request_body,
        model: ctx.model.clone(),
        key_value: String::new(),
        key_hash: String::new(),
        error_message,
        prompt_tokens: usage.map(|u| u.prompt_tokens),
        completion_tokens: usage.map(|u| u.completion_tokens),
        total_tokens: usage.map(|u| u.total_tokens),
    }
}

/// Premium models prefer organization-verified keys; this is advisory only.
/// The upstream decides, and the retry machinery handles a rejection.
fn check_model_permissions(model: &str, api_key: &ApiKey, group: &Group) {
    if model.is_empty() || !group.config.premium_models.contains(model) {
        return;
    }
    if api_key.is_organization() {
        tracing::debug!(
            model,
            key_id = api_key.id,
            organization_id = ?api_key.organization_id,
            "Premium model access with organization key"
        );
    } else {
        tracing::warn!(
            model,
            key_id = api_key.id,
            "Using non-organization key for premium model - may fail and trigger retry"
        );
    }
}

/// A successful premium-model call is the only reliable signal that a key is
/// organization-verified; the promotion is in-memory now, persisted async.
fn mark_organization_verified_on_success(state: &AppState, ctx: &RequestContext, api_key: &ApiKey) {
    if ctx.model.is_empty()
        || !ctx.group.config.premium_models.contains(&ctx.model)
        || api_key.is_organization()
    {
        return;
    }
    state.key_provider.mark_organization_verified(api_key);
}

fn apply_param_overrides(body: &[u8], group: &Group) -> crate::error::Result<Bytes> {
    let overrides = &group.config.param_overrides;
    if overrides.is_empty() || body.is_empty() {
        return Ok(Bytes::copy_from_slice(body));
    }

    let mut value: serde_json::Value = serde_json::from_slice(body)?;
    let object = value.as_object_mut().ok_or_else(|| {
        ProxyError::Internal("parameter overrides require a JSON object body".into())
    })?;
    for (key, replacement) in overrides {
        object.insert(key.clone(), replacement.clone());
    }
    Ok(Bytes::from(serde_json::to_vec(&value)?))
}

fn sanitize_forward_headers(headers: &mut HeaderMap) {
    for name in [
        header::HOST,
        header::CONTENT_LENGTH,
        header::CONNECTION,
        header::TE,
        header::TRAILER,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
        header::PROXY_AUTHENTICATE,
        header::PROXY_AUTHORIZATION,
    ] {
        headers.remove(&name);
    }
    headers.remove("keep-alive");
    for name in STRIPPED_AUTH_HEADERS {
        headers.remove(name);
    }
}

fn sanitize_response_headers(headers: &mut HeaderMap) {
    for name in [
        header::CONNECTION,
        header::CONTENT_LENGTH,
        header::TRANSFER_ENCODING,
    ] {
        headers.remove(&name);
    }
    headers.remove("keep-alive");
}

fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string);
    if let Some(ip) = forwarded {
        return ip;
    }

    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| peer.ip().to_string())
}
