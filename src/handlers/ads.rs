use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use crate::AppState;
use crate::error::AdError;
use crate::models::ad::{CreateAdRequest, GetAdRequest, GetAdsPage};

/// Create a targeted ad. Returns the ad id once the write is durable and
/// applied locally.
pub async fn create_ad(
    State(state): State<AppState>,
    Json(req): Json<CreateAdRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let ad_id = state.ads.create_ad(req).await.map_err(into_http)?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "msg": "ad created", "data": ad_id })),
    ))
}

/// Read ads matching the viewer profile, newest first.
pub async fn get_ads(
    State(state): State<AppState>,
    Query(req): Query<GetAdRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let (ads, total) = state.ads.get_ads(&req).await.map_err(into_http)?;
    Ok(Json(GetAdsPage { ads, total }))
}

/// Delete an ad by id. Deleting an ad that is already gone is success.
pub async fn delete_ad(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    state.ads.delete_ad(id).await.map_err(into_http)?;
    Ok(StatusCode::NO_CONTENT)
}

fn into_http(err: AdError) -> (StatusCode, String) {
    let status = match &err {
        AdError::Validation(_) => StatusCode::BAD_REQUEST,
        AdError::NoAdsFound | AdError::OffsetOutOfRange => StatusCode::NOT_FOUND,
        AdError::LockContention => StatusCode::TOO_MANY_REQUESTS,
        AdError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("request failed: {err}");
    }
    (status, err.to_string())
}
