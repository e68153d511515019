//! HTTP surface of the state query service.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Deserialize;

use super::{ApiResult, health, metrics_text, readiness_response};
use crate::error::Error;
use crate::state::{AssetState, StateStore};

#[derive(Clone)]
pub struct StateAppState {
    store: Arc<dyn StateStore>,
}

impl StateAppState {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }
}

#[derive(Debug, Deserialize)]
pub struct StateParams {
    pub asset_uuid: Option<String>,
    pub id: Option<String>,
}

async fn asset_state(
    State(state): State<StateAppState>,
    Query(params): Query<StateParams>,
) -> ApiResult<Response> {
    let asset_uuid = params
        .asset_uuid
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::InvalidRequest("asset_uuid is required".into()))?;

    match params.id.as_deref().filter(|id| !id.is_empty()) {
        Some(id) => {
            let item = state.store.data_item(asset_uuid, id).await?.ok_or_else(|| {
                Error::NotFound("no data for the given asset_uuid and id".into())
            })?;
            Ok(Json(item).into_response())
        }
        None => {
            let data_items = state.store.asset(asset_uuid).await?;
            if data_items.is_empty() {
                return Err(Error::NotFound("no data for the given asset_uuid".into()).into());
            }
            Ok(Json(AssetState {
                asset_uuid: asset_uuid.to_string(),
                data_items,
            })
            .into_response())
        }
    }
}

async fn ready(State(state): State<StateAppState>) -> Response {
    readiness_response(state.store.readiness().await.err())
}

pub fn state_router(state: StateAppState) -> axum::Router {
    axum::Router::new()
        .route("/asset_state", get(asset_state))
        .route("/ready", get(ready))
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .with_state(state)
}
