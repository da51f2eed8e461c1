//! Notification config handlers.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::errors::ApiError;
use crate::resource::{ListNotificationsResponse, NotificationRequest, NotificationResource};
use crate::AppState;

/// `POST /storage/v1/b/{bucket}/notificationConfigs`.
pub async fn insert_notification(
    state: Arc<AppState>,
    bucket: &str,
    body: &[u8],
) -> Result<Response, ApiError> {
    // The owning bucket must exist.
    state.storage.get_bucket(bucket).await?;

    let request: NotificationRequest = serde_json::from_slice(body)
        .map_err(|e| ApiError::Invalid(format!("malformed notification config: {e}")))?;
    let config = state
        .notifications
        .insert(bucket, request.into_config()?)
        .await;

    Ok(Json(NotificationResource::from_config(
        &config,
        bucket,
        &state.config.public_url(),
    ))
    .into_response())
}

/// `GET /storage/v1/b/{bucket}/notificationConfigs`.
pub async fn list_notifications(state: Arc<AppState>, bucket: &str) -> Result<Response, ApiError> {
    state.storage.get_bucket(bucket).await?;

    let base_url = state.config.public_url();
    let items = state
        .notifications
        .list(bucket)
        .await
        .iter()
        .map(|config| NotificationResource::from_config(config, bucket, &base_url))
        .collect();

    Ok(Json(ListNotificationsResponse {
        kind: "storage#notifications",
        items,
    })
    .into_response())
}

/// `DELETE /storage/v1/b/{bucket}/notificationConfigs/{id}`.
pub async fn delete_notification(
    state: Arc<AppState>,
    bucket: &str,
    id: &str,
) -> Result<Response, ApiError> {
    state.notifications.delete(bucket, id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
