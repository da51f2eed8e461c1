//! Bucket-level JSON API handlers.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::backend::types::BucketAttrs;
use crate::errors::ApiError;
use crate::resource::{BucketRequest, BucketResource, ListBucketsResponse};
use crate::AppState;

/// `GET /storage/v1/b` — list buckets.
pub async fn list_buckets(state: Arc<AppState>) -> Result<Response, ApiError> {
    let buckets = state.storage.list_buckets().await?;
    let base_url = state.config.public_url();
    let response = ListBucketsResponse {
        kind: "storage#buckets",
        items: buckets
            .iter()
            .map(|b| BucketResource::from_bucket(b, &base_url))
            .collect(),
    };
    Ok(Json(response).into_response())
}

/// `POST /storage/v1/b` — create bucket.
pub async fn insert_bucket(state: Arc<AppState>, body: &[u8]) -> Result<Response, ApiError> {
    let request: BucketRequest = if body.is_empty() {
        BucketRequest::default()
    } else {
        serde_json::from_slice(body)
            .map_err(|e| ApiError::Invalid(format!("malformed bucket resource: {e}")))?
    };
    let name = request
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ApiError::Invalid("bucket name is required".to_string()))?;

    let attrs = request.apply_to(BucketAttrs {
        location: state.config.location.clone(),
        ..Default::default()
    });
    let bucket = state.storage.create_bucket(&name, attrs).await?;
    Ok(Json(BucketResource::from_bucket(&bucket, &state.config.public_url())).into_response())
}

/// `GET /storage/v1/b/{bucket}` — bucket metadata.
pub async fn get_bucket(state: Arc<AppState>, bucket: &str) -> Result<Response, ApiError> {
    let record = state.storage.get_bucket(bucket).await?;
    Ok(Json(BucketResource::from_bucket(&record, &state.config.public_url())).into_response())
}

/// `PATCH /storage/v1/b/{bucket}` — update mutable attributes.
pub async fn patch_bucket(
    state: Arc<AppState>,
    bucket: &str,
    body: &[u8],
) -> Result<Response, ApiError> {
    let request: BucketRequest = if body.is_empty() {
        BucketRequest::default()
    } else {
        serde_json::from_slice(body)
            .map_err(|e| ApiError::Invalid(format!("malformed bucket resource: {e}")))?
    };

    let current = state.storage.get_bucket(bucket).await?;
    let attrs = request.apply_to(current.attrs);
    let updated = state.storage.update_bucket(bucket, attrs).await?;
    Ok(Json(BucketResource::from_bucket(&updated, &state.config.public_url())).into_response())
}

/// `DELETE /storage/v1/b/{bucket}` — delete an empty bucket and drop its
/// notification configs.
pub async fn delete_bucket(state: Arc<AppState>, bucket: &str) -> Result<Response, ApiError> {
    state.storage.delete_bucket(bucket).await?;
    state.notifications.drop_bucket(bucket).await;
    Ok(StatusCode::NO_CONTENT.into_response())
}
