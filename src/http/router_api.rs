//! HTTP surface of the routing layer.
//!
//! `/asset_stream` resolves the entity's group, ensures its Dispatcher is
//! live and then either proxies the NDJSON stream (default) or answers with
//! a temporary redirect to the Dispatcher's `/group/{group}/asset_stream`.
//! Only whitelisted query parameters are forwarded. A Dispatcher that turns
//! out to serve another group answers 404, and the entry is marked stopped
//! so the next request re-provisions it.

use std::sync::Arc;

use axum::Json;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use futures::StreamExt;
use serde_json::json;

use super::dispatcher_api::LAST_EVENT_ID;
use super::stream::NDJSON_CONTENT_TYPE;
use super::{ApiResult, health, metrics_text, readiness_response};
use crate::config::{RouterConfig, RoutingMode, ServiceInfo};
use crate::controller::{Route, RoutingController};
use crate::deployment::group_url;
use crate::error::{Error, Result};
use crate::metrics;

/// Query parameters forwarded to a Dispatcher.
pub const STREAM_PARAMS: &[&str] = &["asset_uuid", "id", "start_time", "end_time", "after"];

/// Query parameters forwarded to the state service.
pub const STATE_PARAMS: &[&str] = &["asset_uuid", "id", "start_time", "end_time", "granularity"];

/// Header naming the group a proxied stream was routed to.
pub const GROUP_HEADER: &str = "x-asset-group";

#[derive(Clone)]
pub struct RouterAppState {
    controller: Arc<RoutingController>,
    routing_mode: RoutingMode,
    stream_http: reqwest::Client,
    state_http: reqwest::Client,
    state_api_url: Option<String>,
    info: Arc<ServiceInfo>,
}

impl RouterAppState {
    pub fn new(
        controller: Arc<RoutingController>,
        config: &RouterConfig,
        info: ServiceInfo,
    ) -> Result<Self> {
        // Streams are long-lived: bound the connect only.
        let stream_http = reqwest::Client::builder()
            .connect_timeout(config.proxy_connect_timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build proxy client: {e}")))?;
        let state_http = reqwest::Client::builder()
            .timeout(config.state_proxy_timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build state client: {e}")))?;
        Ok(Self {
            controller,
            routing_mode: config.routing_mode,
            stream_http,
            state_http,
            state_api_url: config
                .state_api_url
                .as_ref()
                .map(|url| url.trim_end_matches('/').to_string()),
            info: Arc::new(info),
        })
    }

    pub fn controller(&self) -> &Arc<RoutingController> {
        &self.controller
    }
}

/// Keep only `allowed` keys, preserving order.
pub fn whitelist(params: &[(String, String)], allowed: &[&str]) -> Vec<(String, String)> {
    params
        .iter()
        .filter(|(k, _)| allowed.contains(&k.as_str()))
        .cloned()
        .collect()
}

fn param<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.trim())
        .filter(|v| !v.is_empty())
}

fn upstream_url(base: &str, path: &str, params: &[(String, String)]) -> Result<reqwest::Url> {
    let url = format!("{}{path}", base.trim_end_matches('/'));
    if params.is_empty() {
        reqwest::Url::parse(&url)
    } else {
        reqwest::Url::parse_with_params(&url, params)
    }
    .map_err(|e| Error::Upstream(format!("invalid upstream URL '{url}': {e}")))
}

/// `/group/{group}/asset_stream` on the routed Dispatcher.
fn stream_url(route: &Route, params: &[(String, String)]) -> Result<reqwest::Url> {
    let mut url = group_url(&route.endpoint, &route.group, "asset_stream")?;
    if !params.is_empty() {
        url.query_pairs_mut().extend_pairs(params);
    }
    Ok(url)
}

/// Decrements the proxied stream gauge when the body is dropped.
struct ProxiedStream;

impl ProxiedStream {
    fn open() -> Self {
        metrics::inc_proxied_streams();
        Self
    }
}

impl Drop for ProxiedStream {
    fn drop(&mut self) {
        metrics::dec_proxied_streams();
    }
}

fn status_of(response: &reqwest::Response) -> StatusCode {
    StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY)
}

/// Relay a non-streaming upstream answer as-is.
async fn relay(response: reqwest::Response) -> ApiResult<Response> {
    let status = status_of(&response);
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();
    let body = response
        .bytes()
        .await
        .map_err(|e| Error::Upstream(format!("failed to read upstream response: {e}")))?;
    Ok((status, [(header::CONTENT_TYPE, content_type)], body).into_response())
}

async fn asset_stream(
    State(state): State<RouterAppState>,
    headers: HeaderMap,
    Query(params): Query<Vec<(String, String)>>,
) -> ApiResult<Response> {
    let entity_id = param(&params, "asset_uuid")
        .ok_or_else(|| Error::InvalidRequest("asset_uuid is required".into()))?;
    let route = state.controller.route(entity_id).await?;
    let forwarded = whitelist(&params, STREAM_PARAMS);
    let url = stream_url(&route, &forwarded)?;

    if state.routing_mode == RoutingMode::Redirect {
        tracing::debug!(entity_id, group = %route.group, %url, "Redirecting stream");
        return Ok(Redirect::temporary(url.as_str()).into_response());
    }

    let mut request = state
        .stream_http
        .get(url.clone())
        .header(reqwest::header::ACCEPT, NDJSON_CONTENT_TYPE);
    if let Some(token) = headers.get(LAST_EVENT_ID).and_then(|v| v.to_str().ok()) {
        request = request.header(LAST_EVENT_ID, token);
    }

    let upstream = request.send().await.map_err(|e| {
        if e.is_connect() {
            state.controller.registry().mark_unhealthy(&route.group);
        }
        tracing::warn!(entity_id, group = %route.group, %url, error = %e, "Failed to reach dispatcher");
        Error::Upstream(format!("failed to proxy request to group service: {e}"))
    })?;

    if upstream.status() == reqwest::StatusCode::NOT_FOUND {
        tracing::warn!(
            entity_id,
            group = %route.group,
            endpoint = %route.endpoint,
            "Endpoint does not serve the group, forcing re-provisioning"
        );
        state.controller.registry().mark_stopped(&route.group);
        return relay(upstream).await;
    }
    if !upstream.status().is_success() {
        tracing::warn!(
            entity_id,
            group = %route.group,
            status = upstream.status().as_u16(),
            "Dispatcher rejected stream"
        );
        return relay(upstream).await;
    }

    tracing::info!(entity_id, group = %route.group, endpoint = %route.endpoint, "Proxying stream");
    let guard = ProxiedStream::open();
    let body = upstream.bytes_stream().map(move |chunk| {
        let _open = &guard;
        chunk
    });

    let mut response = Response::new(Body::from_stream(body));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(NDJSON_CONTENT_TYPE));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    if let Ok(group) = HeaderValue::from_str(&route.group) {
        headers.insert(GROUP_HEADER, group);
    }
    Ok(response)
}

async fn asset_state(
    State(state): State<RouterAppState>,
    Query(params): Query<Vec<(String, String)>>,
) -> ApiResult<Response> {
    let base = state
        .state_api_url
        .as_deref()
        .ok_or_else(|| Error::NotFound("asset state API not available".into()))?;
    if param(&params, "asset_uuid").is_none() {
        return Err(Error::InvalidRequest("asset_uuid is required".into()).into());
    }
    let url = upstream_url(base, "/asset_state", &whitelist(&params, STATE_PARAMS))?;

    let response = state.state_http.get(url.clone()).send().await.map_err(|e| {
        tracing::warn!(%url, error = %e, "Failed to reach state API");
        Error::Upstream(format!("error contacting the state API: {e}"))
    })?;
    relay(response).await
}

async fn ready(State(state): State<RouterAppState>) -> Response {
    let issues = state.controller.readiness().await;
    readiness_response((!issues.is_empty()).then_some(issues))
}

async fn groups(State(state): State<RouterAppState>) -> impl IntoResponse {
    Json(state.controller.registry().snapshot())
}

async fn info(State(state): State<RouterAppState>) -> Json<serde_json::Value> {
    let controller = &state.controller;
    Json(json!({
        "service": "router",
        "version": state.info.version,
        "build_origin": state.info.build_origin,
        "openfactory_version": state.info.openfactory_version,
        "grouping_strategy": controller.resolver().strategy().name(),
        "deployment_platform": controller.platform().name(),
        "routing_mode": state.routing_mode,
        "groups": controller.registry().len(),
    }))
}

pub fn routing_router(state: RouterAppState) -> axum::Router {
    axum::Router::new()
        .route("/asset_stream", get(asset_stream))
        .route("/asset_state", get(asset_state))
        .route("/ready", get(ready))
        .route("/health", get(health))
        .route("/info", get(info))
        .route("/metrics", get(metrics_text))
        .route("/groups", get(groups))
        .with_state(state)
}
