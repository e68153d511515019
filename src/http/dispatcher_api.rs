//! HTTP surface of one group's Dispatcher.
//!
//! | Route | |
//! |-------|-|
//! | `GET /asset_stream?asset_uuid&id&after` | NDJSON subscription |
//! | `GET /group/:group/asset_stream?...` | same, checked against the served group |
//! | `GET /ready` | 200 once the log consumer is attached |
//! | `GET /group/:group/ready` | same, 404 unless `group` is the served group |
//! | `GET /health` | liveness |
//! | `GET /info` | build info and Dispatcher stats |
//! | `GET /metrics` | Prometheus text |
//!
//! `Last-Event-ID` is accepted as an alias for `after`.

use std::sync::Arc;

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Deserialize;
use serde_json::json;

use super::stream::{NDJSON_CONTENT_TYPE, ndjson_stream};
use super::{ApiResult, health, metrics_text, readiness_response};
use crate::config::ServiceInfo;
use crate::dispatcher::{Dispatcher, SessionFilter};
use crate::error::{Error, Result};
use crate::types::SequenceToken;

pub const LAST_EVENT_ID: &str = "last-event-id";

#[derive(Clone)]
pub struct DispatcherAppState {
    dispatcher: Dispatcher,
    info: Arc<ServiceInfo>,
}

impl DispatcherAppState {
    pub fn new(dispatcher: Dispatcher, info: ServiceInfo) -> Self {
        Self {
            dispatcher,
            info: Arc::new(info),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamParams {
    pub asset_uuid: Option<String>,
    pub id: Option<String>,
    pub after: Option<String>,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Session filter and resume token of a stream request.
pub fn parse_stream_request(
    params: &StreamParams,
    headers: &HeaderMap,
) -> Result<(SessionFilter, Option<SequenceToken>)> {
    let entity = non_empty(params.asset_uuid.as_deref())
        .ok_or_else(|| Error::InvalidRequest("asset_uuid is required".into()))?;
    let filter = match non_empty(params.id.as_deref()) {
        Some(item) => SessionFilter::item(entity, item),
        None => SessionFilter::entity(entity),
    };

    let header_token = headers
        .get(LAST_EVENT_ID)
        .and_then(|v| v.to_str().ok());
    let after = non_empty(params.after.as_deref())
        .or(non_empty(header_token))
        .map(str::parse::<SequenceToken>)
        .transpose()?;
    Ok((filter, after))
}

async fn asset_stream(
    State(state): State<DispatcherAppState>,
    headers: HeaderMap,
    Query(params): Query<StreamParams>,
) -> ApiResult<Response> {
    open_stream(&state, &params, &headers)
}

async fn group_asset_stream(
    State(state): State<DispatcherAppState>,
    Path(group): Path<String>,
    headers: HeaderMap,
    Query(params): Query<StreamParams>,
) -> ApiResult<Response> {
    check_group(&state, &group)?;
    open_stream(&state, &params, &headers)
}

fn check_group(state: &DispatcherAppState, group: &str) -> Result<()> {
    if group != state.dispatcher.group() {
        return Err(Error::NotFound(format!(
            "group '{group}' is not served here (serving '{}')",
            state.dispatcher.group()
        )));
    }
    Ok(())
}

fn open_stream(
    state: &DispatcherAppState,
    params: &StreamParams,
    headers: &HeaderMap,
) -> ApiResult<Response> {
    let (filter, after) = parse_stream_request(params, headers)?;
    let subscription = state.dispatcher.subscribe(filter, after)?;
    tracing::info!(
        group = %state.dispatcher.group(),
        session = %subscription.id(),
        entity_id = %subscription.filter().entity_id,
        item_id = ?subscription.filter().item_id,
        after = ?after,
        "Client subscribed"
    );

    let config = state.dispatcher.config();
    let body = Body::from_stream(ndjson_stream(
        subscription,
        config.keepalive_interval,
        config.session_idle_timeout,
    ));
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, NDJSON_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response())
}

async fn ready(State(state): State<DispatcherAppState>) -> Response {
    readiness_response(state.dispatcher.readiness_issue())
}

async fn group_ready(
    State(state): State<DispatcherAppState>,
    Path(group): Path<String>,
) -> ApiResult<Response> {
    check_group(&state, &group)?;
    Ok(readiness_response(state.dispatcher.readiness_issue()))
}

async fn info(State(state): State<DispatcherAppState>) -> Json<serde_json::Value> {
    Json(json!({
        "service": "dispatcher",
        "version": state.info.version,
        "build_origin": state.info.build_origin,
        "openfactory_version": state.info.openfactory_version,
        "dispatcher": state.dispatcher.stats(),
        "sessions": state.dispatcher.fanout().sessions(),
    }))
}

pub fn dispatcher_router(state: DispatcherAppState) -> axum::Router {
    axum::Router::new()
        .route("/asset_stream", get(asset_stream))
        .route("/group/:group/asset_stream", get(group_asset_stream))
        .route("/ready", get(ready))
        .route("/group/:group/ready", get(group_ready))
        .route("/health", get(health))
        .route("/info", get(info))
        .route("/metrics", get(metrics_text))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_parse_stream_request_entity_and_item() {
        let params = StreamParams {
            asset_uuid: Some("ASSET-42".into()),
            id: Some("temp".into()),
            after: None,
        };
        let (filter, after) = parse_stream_request(&params, &HeaderMap::new()).unwrap();
        assert_eq!(filter, SessionFilter::item("ASSET-42", "temp"));
        assert!(after.is_none());
    }

    #[test]
    fn test_parse_stream_request_requires_entity() {
        let params = StreamParams {
            asset_uuid: Some("  ".into()),
            ..Default::default()
        };
        let err = parse_stream_request(&params, &HeaderMap::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn test_last_event_id_is_alias_for_after() {
        let params = StreamParams {
            asset_uuid: Some("ASSET-42".into()),
            ..Default::default()
        };
        let mut headers = HeaderMap::new();
        headers.insert(LAST_EVENT_ID, HeaderValue::from_static("0:17"));
        let (_, after) = parse_stream_request(&params, &headers).unwrap();
        assert_eq!(after, Some(SequenceToken::new(0, 17)));

        // The query parameter wins over the header.
        let params = StreamParams {
            after: Some("0:20".into()),
            ..params
        };
        let (_, after) = parse_stream_request(&params, &headers).unwrap();
        assert_eq!(after, Some(SequenceToken::new(0, 20)));
    }

    #[test]
    fn test_malformed_token_is_invalid_request() {
        let params = StreamParams {
            asset_uuid: Some("ASSET-42".into()),
            after: Some("nope".into()),
            ..Default::default()
        };
        let err = parse_stream_request(&params, &HeaderMap::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }
}
