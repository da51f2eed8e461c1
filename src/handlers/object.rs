//! Object-level handlers: listing, reads (metadata and media), metadata
//! mutation, delete, copy, rewrite, and compose.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::TryStreamExt;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::warn;

use super::{parse_i64_param, parse_preconditions, publish_put_events};
use crate::backend::types::{ListQuery, ObjectHandle, ObjectMeta};
use crate::errors::ApiError;
use crate::notify::EventType;
use crate::resource::{
    ComposeRequest, ListObjectsResponse, ObjectPatchRequest, ObjectRequest, ObjectResource,
    RewriteResponse,
};
use crate::AppState;

/// Default page size for object listings.
const DEFAULT_MAX_RESULTS: usize = 1000;

// -- Range parsing ------------------------------------------------------------

/// Parsed byte range from a `Range` header.
#[derive(Debug, Clone, PartialEq)]
enum ByteRange {
    /// bytes=start-end (inclusive both ends)
    StartEnd(u64, u64),
    /// bytes=start-  (from start to end)
    StartOpen(u64),
    /// bytes=-N  (last N bytes)
    Suffix(u64),
}

/// Parse a header value like "bytes=0-4", "bytes=5-", "bytes=-3".
fn parse_range_header(value: &str) -> Option<ByteRange> {
    let value = value.trim();
    let spec = value.strip_prefix("bytes=")?;

    // Multi-range requests are not supported.
    if spec.contains(',') {
        return None;
    }

    if let Some(suffix) = spec.strip_prefix('-') {
        let n: u64 = suffix.parse().ok()?;
        if n == 0 {
            return None;
        }
        Some(ByteRange::Suffix(n))
    } else if let Some(start) = spec.strip_suffix('-') {
        Some(ByteRange::StartOpen(start.parse().ok()?))
    } else if let Some((start, end)) = spec.split_once('-') {
        let start: u64 = start.parse().ok()?;
        let end: u64 = end.parse().ok()?;
        if start > end {
            return None;
        }
        Some(ByteRange::StartEnd(start, end))
    } else {
        None
    }
}

/// Resolve a range against the object size.  Returns inclusive (start,
/// end), or `None` when unsatisfiable.
fn resolve_range(range: &ByteRange, total: u64) -> Option<(u64, u64)> {
    if total == 0 {
        return None;
    }
    match range {
        ByteRange::StartEnd(start, end) => {
            if *start >= total {
                return None;
            }
            Some((*start, (*end).min(total - 1)))
        }
        ByteRange::StartOpen(start) => {
            if *start >= total {
                return None;
            }
            Some((*start, total - 1))
        }
        ByteRange::Suffix(n) => {
            if *n >= total {
                Some((0, total - 1))
            } else {
                Some((total - n, total - 1))
            }
        }
    }
}

// -- Listing ------------------------------------------------------------------

/// A listing entry in cursor order: an object or a common prefix.
enum Entry {
    Object(ObjectMeta),
    Prefix(String),
}

impl Entry {
    fn cursor(&self) -> &str {
        match self {
            Entry::Object(meta) => &meta.name,
            Entry::Prefix(prefix) => prefix,
        }
    }
}

/// `GET /storage/v1/b/{bucket}/o` — list objects with prefix, delimiter,
/// versions, and cursor pagination.  Renders XML when the client asks
/// for it.
pub async fn list_objects(
    state: Arc<AppState>,
    bucket: &str,
    query: &HashMap<String, String>,
    headers: &HeaderMap,
) -> Result<Response, ApiError> {
    let prefix = query.get("prefix").cloned().unwrap_or_default();
    let delimiter = query.get("delimiter").cloned().unwrap_or_default();
    let versions = query
        .get("versions")
        .is_some_and(|v| v == "true" || v == "1");
    let page_token = query.get("pageToken").cloned().unwrap_or_default();
    let max_results = match query.get("maxResults") {
        None => DEFAULT_MAX_RESULTS,
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| ApiError::Invalid(format!("malformed maxResults value {raw:?}")))?,
    };

    let listing = state
        .storage
        .list_objects(
            bucket,
            ListQuery {
                prefix: prefix.clone(),
                delimiter: delimiter.clone(),
                versions,
            },
        )
        .await?;

    if wants_xml(headers) {
        let xml = crate::xml::render_object_listing(bucket, &prefix, &delimiter, &listing);
        return Ok((
            [(header::CONTENT_TYPE, "application/xml")],
            xml,
        )
            .into_response());
    }

    // Merge objects and common prefixes into one cursor-ordered sequence,
    // then apply the page window.
    let mut entries: Vec<Entry> = listing
        .objects
        .into_iter()
        .map(Entry::Object)
        .chain(listing.prefixes.into_iter().map(Entry::Prefix))
        .collect();
    entries.sort_by(|a, b| a.cursor().cmp(b.cursor()));

    let mut page = Vec::new();
    let mut next_page_token = None;
    for entry in entries {
        if !page_token.is_empty() && entry.cursor() <= page_token.as_str() {
            continue;
        }
        if page.len() == max_results {
            next_page_token = page
                .last()
                .map(|last: &Entry| last.cursor().to_string());
            break;
        }
        page.push(entry);
    }

    let base_url = state.config.public_url();
    let mut items = Vec::new();
    let mut prefixes = Vec::new();
    for entry in page {
        match entry {
            Entry::Object(meta) => items.push(ObjectResource::from_meta(&meta, &base_url)),
            Entry::Prefix(prefix) => prefixes.push(prefix),
        }
    }

    Ok(Json(ListObjectsResponse {
        kind: "storage#objects",
        prefixes,
        items,
        next_page_token,
    })
    .into_response())
}

fn wants_xml(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| {
            accept.contains("application/xml") || accept.contains("text/xml")
        })
}

// -- Reads --------------------------------------------------------------------

/// `GET /storage/v1/b/{bucket}/o/{object}` — metadata by default, media
/// with `?alt=media` (honoring `Range`).
pub async fn get_object(
    state: Arc<AppState>,
    bucket: &str,
    object: &str,
    query: &HashMap<String, String>,
    headers: &HeaderMap,
) -> Result<Response, ApiError> {
    let generation = parse_i64_param(query, "generation")?;

    if query.get("alt").map(String::as_str) == Some("media") {
        let handle = state.storage.open_object(bucket, object, generation).await?;
        return serve_media(handle, headers).await;
    }

    let meta = match generation {
        Some(gen) => {
            state
                .storage
                .get_object_generation(bucket, object, gen)
                .await?
        }
        None => state.storage.get_object(bucket, object).await?,
    };
    Ok(Json(ObjectResource::from_meta(&meta, &state.config.public_url())).into_response())
}

/// `GET /download/storage/v1/b/{bucket}/o/{object}` and the XML surface's
/// `GET /{bucket}/{object}` — media, always.
pub async fn download_object(
    state: Arc<AppState>,
    bucket: &str,
    object: &str,
    query: &HashMap<String, String>,
    headers: &HeaderMap,
) -> Result<Response, ApiError> {
    let generation = parse_i64_param(query, "generation")?;
    let handle = state.storage.open_object(bucket, object, generation).await?;
    serve_media(handle, headers).await
}

/// Stream object content, slicing to the requested byte range.
async fn serve_media(handle: ObjectHandle, headers: &HeaderMap) -> Result<Response, ApiError> {
    let ObjectHandle { meta, mut reader } = handle;

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|raw| {
            parse_range_header(raw)
                .ok_or_else(|| ApiError::RangeNotSatisfiable(format!("malformed Range {raw:?}")))
        })
        .transpose()?;

    let (status, start, end) = match &range {
        None => (StatusCode::OK, 0, meta.size.saturating_sub(1)),
        Some(range) => {
            let (start, end) = resolve_range(range, meta.size).ok_or_else(|| {
                ApiError::RangeNotSatisfiable(format!(
                    "range out of bounds for a {}-byte object",
                    meta.size
                ))
            })?;
            (StatusCode::PARTIAL_CONTENT, start, end)
        }
    };

    let length = if meta.size == 0 { 0 } else { end - start + 1 };
    let mut response = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, meta.content_type.as_str())
        .header(header::CONTENT_LENGTH, length)
        .header(header::ETAG, meta.etag.as_str())
        .header(header::ACCEPT_RANGES, "bytes")
        .header(
            header::LAST_MODIFIED,
            httpdate::fmt_http_date(meta.updated.into()),
        )
        .header("x-goog-generation", meta.generation)
        .header("x-goog-metageneration", meta.metageneration)
        .header(
            "x-goog-hash",
            format!("crc32c={},md5={}", meta.crc32c, meta.md5_hash),
        )
        .header("x-goog-stored-content-length", meta.size);

    if status == StatusCode::PARTIAL_CONTENT && meta.size > 0 {
        response = response.header(
            header::CONTENT_RANGE,
            format!("bytes {start}-{end}/{}", meta.size),
        );
    }
    if let Some(encoding) = &meta.content_encoding {
        response = response.header(header::CONTENT_ENCODING, encoding.as_str());
    }
    if let Some(disposition) = &meta.content_disposition {
        response = response.header(header::CONTENT_DISPOSITION, disposition.as_str());
    }
    if let Some(cache) = &meta.cache_control {
        response = response.header(header::CACHE_CONTROL, cache.as_str());
    }

    if start > 0 {
        reader
            .seek(std::io::SeekFrom::Start(start))
            .await
            .map_err(|e| ApiError::Internal(e.into()))?;
    }
    // A mid-body read failure truncates the response; the connection is
    // closed without trailers.
    let stream = ReaderStream::new(reader.take(length))
        .inspect_err(|e| warn!("media stream truncated: {e}"));
    let body = Body::from_stream(stream);

    response
        .body(body)
        .map_err(|e| ApiError::Internal(e.into()))
}

// -- Metadata mutation --------------------------------------------------------

/// `PATCH /storage/v1/b/{bucket}/o/{object}` — merge patch.
pub async fn patch_object(
    state: Arc<AppState>,
    bucket: &str,
    object: &str,
    body: &[u8],
) -> Result<Response, ApiError> {
    let request: ObjectPatchRequest = if body.is_empty() {
        ObjectPatchRequest::default()
    } else {
        serde_json::from_slice(body)
            .map_err(|e| ApiError::Invalid(format!("malformed patch body: {e}")))?
    };

    let meta = state
        .storage
        .patch_object(bucket, object, request.into_patch())
        .await?;
    state
        .notifications
        .trigger(&meta, EventType::ObjectMetadataUpdate)
        .await;
    Ok(Json(ObjectResource::from_meta(&meta, &state.config.public_url())).into_response())
}

/// `PUT /storage/v1/b/{bucket}/o/{object}` — full metadata replace.
pub async fn update_object(
    state: Arc<AppState>,
    bucket: &str,
    object: &str,
    body: &[u8],
) -> Result<Response, ApiError> {
    let request: ObjectRequest = serde_json::from_slice(body)
        .map_err(|e| ApiError::Invalid(format!("malformed object resource: {e}")))?;

    let meta = state
        .storage
        .update_object(bucket, object, request.metadata.unwrap_or_default())
        .await?;
    state
        .notifications
        .trigger(&meta, EventType::ObjectMetadataUpdate)
        .await;
    Ok(Json(ObjectResource::from_meta(&meta, &state.config.public_url())).into_response())
}

/// `DELETE /storage/v1/b/{bucket}/o/{object}` — delete or tombstone.
pub async fn delete_object(
    state: Arc<AppState>,
    bucket: &str,
    object: &str,
    query: &HashMap<String, String>,
) -> Result<Response, ApiError> {
    let generation = parse_i64_param(query, "generation")?;
    let result = state.storage.delete_object(bucket, object, generation).await?;
    state
        .notifications
        .trigger(&result.meta, EventType::ObjectDelete)
        .await;
    Ok(StatusCode::NO_CONTENT.into_response())
}

// -- Copy, rewrite, compose ---------------------------------------------------

/// Shared pipeline for `copyTo` and `rewriteTo`: a generation checkout
/// piped into a fresh write on the destination.
async fn copy_generation(
    state: &AppState,
    src_bucket: &str,
    src_object: &str,
    dest_bucket: &str,
    dest_object: &str,
    query: &HashMap<String, String>,
    body: &[u8],
) -> Result<ObjectMeta, ApiError> {
    let source_generation = parse_i64_param(query, "sourceGeneration")?;
    let preconditions = parse_preconditions(query)?;

    let mut handle = state
        .storage
        .open_object(src_bucket, src_object, source_generation)
        .await?;

    // Optional destination resource overriding attributes.
    let request: ObjectRequest = if body.is_empty() {
        ObjectRequest::default()
    } else {
        serde_json::from_slice(body)
            .map_err(|e| ApiError::Invalid(format!("malformed destination resource: {e}")))?
    };
    let mut attrs = request.into_attrs();
    if attrs.content_type.is_none() {
        attrs.content_type = Some(handle.meta.content_type.clone());
    }
    if attrs.metadata.is_empty() {
        attrs.metadata = handle.meta.metadata.clone();
    }

    let mut content = Vec::with_capacity(handle.meta.size as usize);
    handle.reader.read_to_end(&mut content).await?;

    let result = state
        .storage
        .create_object(
            dest_bucket,
            dest_object,
            attrs,
            crate::backend::types::bytes_stream(content.into()),
            preconditions,
        )
        .await?;
    publish_put_events(state, &result).await;
    Ok(result.meta)
}

/// `POST .../o/{src}/copyTo/b/{destBucket}/o/{destObject}`.
#[allow(clippy::too_many_arguments)]
pub async fn copy_object(
    state: Arc<AppState>,
    src_bucket: &str,
    src_object: &str,
    dest_bucket: &str,
    dest_object: &str,
    query: &HashMap<String, String>,
    body: &[u8],
) -> Result<Response, ApiError> {
    let meta = copy_generation(
        &state,
        src_bucket,
        src_object,
        dest_bucket,
        dest_object,
        query,
        body,
    )
    .await?;
    Ok(Json(ObjectResource::from_meta(&meta, &state.config.public_url())).into_response())
}

/// `POST .../o/{src}/rewriteTo/b/{destBucket}/o/{destObject}`.  Completes
/// in a single call; the rewrite token is advisory.
#[allow(clippy::too_many_arguments)]
pub async fn rewrite_object(
    state: Arc<AppState>,
    src_bucket: &str,
    src_object: &str,
    dest_bucket: &str,
    dest_object: &str,
    query: &HashMap<String, String>,
    body: &[u8],
) -> Result<Response, ApiError> {
    let meta = copy_generation(
        &state,
        src_bucket,
        src_object,
        dest_bucket,
        dest_object,
        query,
        body,
    )
    .await?;
    let resource = ObjectResource::from_meta(&meta, &state.config.public_url());
    Ok(Json(RewriteResponse::completed(resource)).into_response())
}

/// `POST /storage/v1/b/{bucket}/o/{dest}/compose`.
pub async fn compose_object(
    state: Arc<AppState>,
    bucket: &str,
    dest: &str,
    query: &HashMap<String, String>,
    body: &[u8],
) -> Result<Response, ApiError> {
    let request: ComposeRequest = serde_json::from_slice(body)
        .map_err(|e| ApiError::Invalid(format!("malformed compose body: {e}")))?;
    let preconditions = parse_preconditions(query)?;

    let sources: Vec<String> = request
        .source_objects
        .iter()
        .map(|s| s.name.clone())
        .collect();
    let attrs = request
        .destination
        .map(ObjectRequest::into_attrs)
        .unwrap_or_default();

    let result = state
        .storage
        .compose_object(bucket, &sources, dest, attrs, preconditions)
        .await?;
    publish_put_events(&state, &result).await;
    Ok(Json(ObjectResource::from_meta(&result.meta, &state.config.public_url())).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_header_forms() {
        assert_eq!(parse_range_header("bytes=0-4"), Some(ByteRange::StartEnd(0, 4)));
        assert_eq!(parse_range_header("bytes=5-"), Some(ByteRange::StartOpen(5)));
        assert_eq!(parse_range_header("bytes=-3"), Some(ByteRange::Suffix(3)));
        assert_eq!(parse_range_header("bytes=4-2"), None);
        assert_eq!(parse_range_header("bytes=0-1,3-4"), None);
        assert_eq!(parse_range_header("items=0-4"), None);
    }

    #[test]
    fn range_resolution() {
        // bytes=N- runs to the end.
        assert_eq!(resolve_range(&ByteRange::StartOpen(4), 10), Some((4, 9)));
        // bytes=-N is the last N bytes.
        assert_eq!(resolve_range(&ByteRange::Suffix(3), 10), Some((7, 9)));
        // Over-long suffix clamps to the whole object.
        assert_eq!(resolve_range(&ByteRange::Suffix(99), 10), Some((0, 9)));
        // End clamps to size.
        assert_eq!(resolve_range(&ByteRange::StartEnd(8, 99), 10), Some((8, 9)));
        // Start past the end is unsatisfiable.
        assert_eq!(resolve_range(&ByteRange::StartOpen(10), 10), None);
        assert_eq!(resolve_range(&ByteRange::StartEnd(10, 12), 10), None);
    }
}
