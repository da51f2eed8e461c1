//! Axum router construction and route mapping.
//!
//! The [`app`] function wires the JSON API (`/storage/v1`), the upload
//! API (`/upload/storage/v1`), the public XML surface, and the internal
//! endpoints to their handlers and returns a ready-to-serve
//! [`axum::Router`].
//!
//! The JSON API distinguishes copy, rewrite, and compose by path shape
//! (`{src}/copyTo/b/{destBucket}/o/{destObject}`), which a wildcard
//! route cannot express directly.  A single POST handler per path
//! dispatches internally, the same way the upload POST dispatches on
//! `uploadType`.

use axum::{
    extract::{DefaultBodyLimit, Path, RawQuery, State},
    http::{HeaderMap, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::{AllowHeaders, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::config::BackendKind;
use crate::errors::ApiError;
use crate::handlers;
use crate::AppState;

/// Build the axum [`Router`] with every surface wired up.
pub fn app(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config.cors_headers);

    Router::new()
        // Internal endpoints (not part of the emulated API).
        .route("/_internal/healthcheck", get(healthcheck))
        .route("/_internal/config", get(internal_config))
        .route("/_internal/reseed", post(reseed))
        // JSON API: buckets.
        .route(
            "/storage/v1/b",
            get(handle_list_buckets).post(handle_insert_bucket),
        )
        .route(
            "/storage/v1/b/:bucket",
            get(handle_get_bucket)
                .patch(handle_patch_bucket)
                .delete(handle_delete_bucket),
        )
        // JSON API: notification configs.
        .route(
            "/storage/v1/b/:bucket/notificationConfigs",
            get(handle_list_notifications).post(handle_insert_notification),
        )
        .route(
            "/storage/v1/b/:bucket/notificationConfigs/:id",
            delete(handle_delete_notification),
        )
        // JSON API: objects.
        .route("/storage/v1/b/:bucket/o", get(handle_list_objects))
        .route(
            "/storage/v1/b/:bucket/o/*object",
            get(handle_get_object)
                .patch(handle_patch_object)
                .put(handle_update_object)
                .delete(handle_delete_object)
                .post(handle_post_object),
        )
        // Media download alias used by mediaLink.
        .route(
            "/download/storage/v1/b/:bucket/o/*object",
            get(handle_download_object),
        )
        // Upload API.
        .route(
            "/upload/storage/v1/b/:bucket/o",
            post(handle_upload_insert)
                .put(handle_upload_chunk)
                .delete(handle_upload_abort),
        )
        // Public XML surface.
        .route("/:bucket", get(handle_xml_list))
        .route("/:bucket/*object", get(handle_xml_media))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        // Objects can be large; drop the default body cap.
        .layer(DefaultBodyLimit::disable())
}

/// Permissive CORS plus any extra allowlisted request headers from the
/// `cors-headers` flag.
fn cors_layer(extra_headers: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_origin(Any).allow_methods(Any);
    if extra_headers.is_empty() {
        return layer.allow_headers(Any);
    }

    let mut headers: Vec<HeaderName> = [
        "content-type",
        "authorization",
        "content-range",
        "x-upload-content-type",
        "x-upload-content-length",
    ]
    .into_iter()
    .map(HeaderName::from_static)
    .collect();
    for raw in extra_headers {
        match HeaderName::from_bytes(raw.trim().as_bytes()) {
            Ok(header) => headers.push(header),
            Err(_) => warn!("ignoring invalid cors header name {raw:?}"),
        }
    }
    layer.allow_headers(AllowHeaders::list(headers))
}

/// Parse a raw query string into a map, percent-decoding keys and values.
fn parse_query(raw: Option<String>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Some(qs) = raw {
        for part in qs.split('&') {
            if part.is_empty() {
                continue;
            }
            let (key, value) = part.split_once('=').unwrap_or((part, ""));
            let key = percent_encoding::percent_decode_str(key)
                .decode_utf8_lossy()
                .into_owned();
            let value = value.replace('+', " ");
            let value = percent_encoding::percent_decode_str(&value)
                .decode_utf8_lossy()
                .into_owned();
            map.insert(key, value);
        }
    }
    map
}

// -- Internal endpoints -------------------------------------------------------

/// `GET /_internal/healthcheck`.
async fn healthcheck() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// `GET /_internal/config` — the effective public configuration.
async fn internal_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let config = &state.config;
    Json(serde_json::json!({
        "backend": match config.backend {
            BackendKind::Memory => "memory",
            BackendKind::Filesystem => "filesystem",
        },
        "publicUrl": config.public_url(),
        "location": config.location,
        "seedDirectory": config.data.as_ref().map(|p| p.display().to_string()),
    }))
}

/// `POST /_internal/reseed` — re-run the startup seeder.
async fn reseed(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let Some(dir) = &state.config.data else {
        return Err(ApiError::Invalid(
            "no seed directory configured; start with --data".to_string(),
        ));
    };
    let summary =
        crate::seed::seed_from_directory(state.storage.as_ref(), dir, &state.config.location)
            .await?;
    Ok(Json(serde_json::json!({
        "buckets": summary.buckets,
        "objects": summary.objects,
    }))
    .into_response())
}

// -- Bucket routes ------------------------------------------------------------

async fn handle_list_buckets(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    handlers::bucket::list_buckets(state).await
}

async fn handle_insert_bucket(
    State(state): State<Arc<AppState>>,
    body: axum::body::Bytes,
) -> Result<Response, ApiError> {
    handlers::bucket::insert_bucket(state, &body).await
}

async fn handle_get_bucket(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
) -> Result<Response, ApiError> {
    handlers::bucket::get_bucket(state, &bucket).await
}

async fn handle_patch_bucket(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
    body: axum::body::Bytes,
) -> Result<Response, ApiError> {
    handlers::bucket::patch_bucket(state, &bucket, &body).await
}

async fn handle_delete_bucket(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
) -> Result<Response, ApiError> {
    handlers::bucket::delete_bucket(state, &bucket).await
}

// -- Notification routes ------------------------------------------------------

async fn handle_list_notifications(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
) -> Result<Response, ApiError> {
    handlers::notification::list_notifications(state, &bucket).await
}

async fn handle_insert_notification(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
    body: axum::body::Bytes,
) -> Result<Response, ApiError> {
    handlers::notification::insert_notification(state, &bucket, &body).await
}

async fn handle_delete_notification(
    State(state): State<Arc<AppState>>,
    Path((bucket, id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    handlers::notification::delete_notification(state, &bucket, &id).await
}

// -- Object routes ------------------------------------------------------------

async fn handle_list_objects(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let query = parse_query(raw_query);
    handlers::object::list_objects(state, &bucket, &query, &headers).await
}

async fn handle_get_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, object)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let query = parse_query(raw_query);
    handlers::object::get_object(state, &bucket, &object, &query, &headers).await
}

async fn handle_download_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, object)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let query = parse_query(raw_query);
    handlers::object::download_object(state, &bucket, &object, &query, &headers).await
}

async fn handle_patch_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, object)): Path<(String, String)>,
    body: axum::body::Bytes,
) -> Result<Response, ApiError> {
    handlers::object::patch_object(state, &bucket, &object, &body).await
}

async fn handle_update_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, object)): Path<(String, String)>,
    body: axum::body::Bytes,
) -> Result<Response, ApiError> {
    handlers::object::update_object(state, &bucket, &object, &body).await
}

async fn handle_delete_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, object)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
) -> Result<Response, ApiError> {
    let query = parse_query(raw_query);
    handlers::object::delete_object(state, &bucket, &object, &query).await
}

/// `POST /storage/v1/b/{bucket}/o/{...}` — dispatches on path shape:
/// - `{src}/copyTo/b/{destBucket}/o/{destObject}` — copy
/// - `{src}/rewriteTo/b/{destBucket}/o/{destObject}` — rewrite
/// - `{dest}/compose` — compose
async fn handle_post_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, rest)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
    body: axum::body::Bytes,
) -> Result<Response, ApiError> {
    let query = parse_query(raw_query);

    if let Some((src, dest)) = rest.split_once("/copyTo/b/") {
        let (dest_bucket, dest_object) = split_destination(dest)?;
        return handlers::object::copy_object(
            state,
            &bucket,
            src,
            dest_bucket,
            dest_object,
            &query,
            &body,
        )
        .await;
    }
    if let Some((src, dest)) = rest.split_once("/rewriteTo/b/") {
        let (dest_bucket, dest_object) = split_destination(dest)?;
        return handlers::object::rewrite_object(
            state,
            &bucket,
            src,
            dest_bucket,
            dest_object,
            &query,
            &body,
        )
        .await;
    }
    if let Some(dest) = rest.strip_suffix("/compose") {
        return handlers::object::compose_object(state, &bucket, dest, &query, &body).await;
    }

    Err(ApiError::Invalid(format!(
        "unrecognized object operation path {rest:?}"
    )))
}

fn split_destination(dest: &str) -> Result<(&str, &str), ApiError> {
    dest.split_once("/o/")
        .filter(|(bucket, object)| !bucket.is_empty() && !object.is_empty())
        .ok_or_else(|| {
            ApiError::Invalid(format!("malformed copy destination {dest:?}"))
        })
}

// -- Upload routes ------------------------------------------------------------

async fn handle_upload_insert(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Response, ApiError> {
    let query = parse_query(raw_query);
    handlers::upload::insert_object(state, &bucket, &query, &headers, body).await
}

async fn handle_upload_chunk(
    State(state): State<Arc<AppState>>,
    Path(_bucket): Path<String>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Response, ApiError> {
    let query = parse_query(raw_query);
    handlers::upload::put_chunk(state, &query, &headers, body).await
}

async fn handle_upload_abort(
    State(state): State<Arc<AppState>>,
    Path(_bucket): Path<String>,
    RawQuery(raw_query): RawQuery,
) -> Result<Response, ApiError> {
    let query = parse_query(raw_query);
    handlers::upload::delete_upload(state, &query).await
}

// -- XML surface --------------------------------------------------------------

async fn handle_xml_list(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
    RawQuery(raw_query): RawQuery,
) -> Result<Response, ApiError> {
    let query = parse_query(raw_query);
    let mut headers = HeaderMap::new();
    headers.insert(
        axum::http::header::ACCEPT,
        "application/xml".parse().expect("static header"),
    );
    handlers::object::list_objects(state, &bucket, &query, &headers).await
}

async fn handle_xml_media(
    State(state): State<Arc<AppState>>,
    Path((bucket, object)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let query = parse_query(raw_query);
    handlers::object::download_object(state, &bucket, &object, &query, &headers).await
}

// -- Tests --------------------------------------------------------------------
