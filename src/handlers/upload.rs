//! Upload API handlers.
//!
//! `POST /upload/storage/v1/b/{bucket}/o` dispatches on `uploadType`:
//! `media` and `multipart` feed the backend directly; `resumable` opens a
//! session whose URL comes back in the `Location` header.  Chunk PUTs and
//! session DELETEs address the session by its `upload_id` query
//! parameter.

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;

use super::{parse_preconditions, publish_put_events};
use crate::backend::types::{bytes_stream, ObjectAttrs};
use crate::errors::ApiError;
use crate::resource::{ObjectRequest, ObjectResource};
use crate::upload::{parse_content_range, ChunkOutcome, ContentRange};
use crate::AppState;

/// `POST /upload/storage/v1/b/{bucket}/o` — dispatch on `uploadType`.
pub async fn insert_object(
    state: Arc<AppState>,
    bucket: &str,
    query: &HashMap<String, String>,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    match query.get("uploadType").map(String::as_str) {
        Some("media") | None => simple_upload(state, bucket, query, headers, body).await,
        Some("multipart") => multipart_upload(state, bucket, query, headers, body).await,
        Some("resumable") => start_resumable(state, bucket, query, headers, body).await,
        Some(other) => Err(ApiError::Invalid(format!("unknown uploadType {other:?}"))),
    }
}

// -- Simple -------------------------------------------------------------------

async fn simple_upload(
    state: Arc<AppState>,
    bucket: &str,
    query: &HashMap<String, String>,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let name = query
        .get("name")
        .cloned()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ApiError::Invalid("object name is required".to_string()))?;

    let attrs = ObjectAttrs {
        content_type: headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        ..Default::default()
    };

    let result = state
        .storage
        .create_object(
            bucket,
            &name,
            attrs,
            bytes_stream(body),
            parse_preconditions(query)?,
        )
        .await?;
    publish_put_events(&state, &result).await;
    Ok(Json(ObjectResource::from_meta(&result.meta, &state.config.public_url())).into_response())
}

// -- Multipart ----------------------------------------------------------------

async fn multipart_upload(
    state: Arc<AppState>,
    bucket: &str,
    query: &HashMap<String, String>,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Invalid("multipart upload requires a Content-Type".to_string()))?;
    let boundary = extract_boundary(content_type)?;

    let parts = split_multipart(&body, &boundary)?;
    let [metadata_part, media_part] = parts.as_slice() else {
        return Err(ApiError::Invalid(format!(
            "multipart upload expects 2 parts (metadata, media), got {}",
            parts.len()
        )));
    };

    let request: ObjectRequest = serde_json::from_slice(&metadata_part.body)
        .map_err(|e| ApiError::Invalid(format!("malformed metadata part: {e}")))?;
    let name = request
        .name
        .clone()
        .or_else(|| query.get("name").cloned())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ApiError::Invalid("object name is required".to_string()))?;

    let mut attrs = request.into_attrs();
    if attrs.content_type.is_none() {
        attrs.content_type = media_part.content_type.clone();
    }

    let result = state
        .storage
        .create_object(
            bucket,
            &name,
            attrs,
            bytes_stream(Bytes::copy_from_slice(&media_part.body)),
            parse_preconditions(query)?,
        )
        .await?;
    publish_put_events(&state, &result).await;
    Ok(Json(ObjectResource::from_meta(&result.meta, &state.config.public_url())).into_response())
}

/// One MIME part: its declared content type and raw body.
struct MimePart {
    content_type: Option<String>,
    body: Vec<u8>,
}

fn extract_boundary(content_type: &str) -> Result<String, ApiError> {
    content_type
        .split(';')
        .map(str::trim)
        .find_map(|param| param.strip_prefix("boundary="))
        .map(|b| b.trim_matches('"').to_string())
        .filter(|b| !b.is_empty())
        .ok_or_else(|| {
            ApiError::Invalid("multipart Content-Type is missing its boundary".to_string())
        })
}

/// Minimal `multipart/related` splitter for the two-part upload body.
///
/// Only the structural newlines around boundaries and headers are
/// stripped, so binary payloads that begin or end with newline bytes
/// survive intact.
fn split_multipart(body: &[u8], boundary: &str) -> Result<Vec<MimePart>, ApiError> {
    let delimiter = format!("--{boundary}");
    let mut pieces = split_on(body, delimiter.as_bytes()).into_iter();

    // Everything before the first boundary is preamble.
    let _ = pieces.next();

    let mut parts = Vec::new();
    for raw in pieces {
        // The closing delimiter is `--{boundary}--`; a real part always
        // starts with the boundary line's newline instead.
        if raw.starts_with(b"--") {
            break;
        }

        // Part layout: <newline> [headers] <blank line> <content> <newline>.
        let (headers, content) = match find_header_separator(raw) {
            Some((end, start)) => (&raw[..end], &raw[start..]),
            None => (&raw[..0], raw),
        };
        let content = strip_trailing_newline(content);

        let content_type = std::str::from_utf8(headers)
            .ok()
            .and_then(|headers| {
                headers.lines().find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.trim()
                        .eq_ignore_ascii_case("content-type")
                        .then(|| value.trim().to_string())
                })
            });

        parts.push(MimePart {
            content_type,
            body: content.to_vec(),
        });
    }

    if parts.is_empty() {
        return Err(ApiError::Invalid("empty multipart body".to_string()));
    }
    Ok(parts)
}

fn split_on<'a>(haystack: &'a [u8], needle: &[u8]) -> Vec<&'a [u8]> {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i + needle.len() <= haystack.len() {
        if &haystack[i..i + needle.len()] == needle {
            pieces.push(&haystack[start..i]);
            i += needle.len();
            start = i;
        } else {
            i += 1;
        }
    }
    pieces.push(&haystack[start..]);
    pieces
}

/// Strip the single newline that separates content from the following
/// boundary line.
fn strip_trailing_newline(raw: &[u8]) -> &[u8] {
    raw.strip_suffix(b"\r\n")
        .or_else(|| raw.strip_suffix(b"\n"))
        .unwrap_or(raw)
}

/// Byte offsets of the blank line separating part headers from content:
/// (end of headers, start of content).
fn find_header_separator(raw: &[u8]) -> Option<(usize, usize)> {
    raw.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|idx| (idx, idx + 4))
        .or_else(|| raw.windows(2).position(|w| w == b"\n\n").map(|idx| (idx, idx + 2)))
}

// -- Resumable ----------------------------------------------------------------

async fn start_resumable(
    state: Arc<AppState>,
    bucket: &str,
    query: &HashMap<String, String>,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: ObjectRequest = if body.is_empty() {
        ObjectRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::Invalid(format!("malformed object resource: {e}")))?
    };
    let name = request
        .name
        .clone()
        .or_else(|| query.get("name").cloned())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ApiError::Invalid("object name is required".to_string()))?;

    let mut attrs = request.into_attrs();
    if attrs.content_type.is_none() {
        attrs.content_type = headers
            .get("x-upload-content-type")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
    }
    let declared_total = headers
        .get("x-upload-content-length")
        .and_then(|v| v.to_str().ok())
        .map(|raw| {
            raw.parse::<u64>()
                .map_err(|_| ApiError::Invalid(format!("malformed X-Upload-Content-Length {raw:?}")))
        })
        .transpose()?;

    let id = state
        .uploads
        .create(bucket, &name, attrs, parse_preconditions(query)?, declared_total)
        .await;

    let location = format!(
        "{}/upload/storage/v1/b/{}/o?uploadType=resumable&upload_id={id}",
        state.config.public_url(),
        crate::resource::escape_segment(bucket),
    );
    Ok((
        StatusCode::OK,
        [
            (header::LOCATION, location),
            (
                header::HeaderName::from_static("x-goog-upload-status"),
                "active".to_string(),
            ),
        ],
    )
        .into_response())
}

/// `PUT /upload/storage/v1/b/{bucket}/o?upload_id=...` — one chunk, a
/// progress query, or (without `Content-Range`) the whole payload.
pub async fn put_chunk(
    state: Arc<AppState>,
    query: &HashMap<String, String>,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let upload_id = query
        .get("upload_id")
        .cloned()
        .ok_or_else(|| ApiError::Invalid("upload_id is required".to_string()))?;

    let range = match headers.get(header::CONTENT_RANGE).and_then(|v| v.to_str().ok()) {
        Some(raw) => parse_content_range(raw)?,
        // No range declaration: the body is the entire payload.
        None => {
            if body.is_empty() {
                ContentRange::Query { total: Some(0) }
            } else {
                ContentRange::Chunk {
                    first: 0,
                    last: body.len() as u64 - 1,
                    total: Some(body.len() as u64),
                }
            }
        }
    };

    let session = state.uploads.get(&upload_id).await?;
    let outcome = {
        let mut session = session.lock().await;
        session.apply_chunk(range, &body)?
    };

    match outcome {
        ChunkOutcome::Incomplete { persisted } => {
            let mut response = Response::builder()
                .status(StatusCode::PERMANENT_REDIRECT)
                .header("x-goog-upload-status", "active");
            if persisted > 0 {
                response = response.header(header::RANGE, format!("bytes=0-{}", persisted - 1));
            }
            response
                .body(axum::body::Body::empty())
                .map_err(|e| ApiError::Internal(e.into()))
        }
        ChunkOutcome::Complete { content } => {
            let (bucket, name, attrs, preconditions) = {
                let session = session.lock().await;
                (
                    session.bucket.clone(),
                    session.name.clone(),
                    session.attrs.clone(),
                    session.preconditions,
                )
            };

            // The session is finished either way: a failed commit (for
            // example a precondition miss) does not leave it resumable.
            let commit = state
                .storage
                .create_object(&bucket, &name, attrs, bytes_stream(content), preconditions)
                .await;
            let _ = state.uploads.remove(&upload_id).await;
            let result = commit?;
            publish_put_events(&state, &result).await;

            let resource = ObjectResource::from_meta(&result.meta, &state.config.public_url());
            Ok((
                StatusCode::OK,
                [("x-goog-upload-status", "final")],
                Json(resource),
            )
                .into_response())
        }
    }
}

/// `DELETE /upload/storage/v1/b/{bucket}/o?upload_id=...` — abort.
pub async fn delete_upload(
    state: Arc<AppState>,
    query: &HashMap<String, String>,
) -> Result<Response, ApiError> {
    let upload_id = query
        .get("upload_id")
        .cloned()
        .ok_or_else(|| ApiError::Invalid("upload_id is required".to_string()))?;
    state.uploads.remove(&upload_id).await?;
    Ok(StatusCode::OK.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_extraction() {
        assert_eq!(
            extract_boundary("multipart/related; boundary=sep_123").unwrap(),
            "sep_123"
        );
        assert_eq!(
            extract_boundary("multipart/related; boundary=\"quoted\"; charset=UTF-8").unwrap(),
            "quoted"
        );
        assert!(extract_boundary("multipart/related").is_err());
    }

    #[test]
    fn splits_two_part_upload_body() {
        let body = b"--sep\r\n\
Content-Type: application/json; charset=UTF-8\r\n\
\r\n\
{\"name\": \"obj.txt\"}\r\n\
--sep\r\n\
Content-Type: text/plain\r\n\
\r\n\
hello body\r\n\
--sep--";

        let parts = split_multipart(body, "sep").unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(
            parts[0].content_type.as_deref(),
            Some("application/json; charset=UTF-8")
        );
        assert_eq!(parts[0].body, b"{\"name\": \"obj.txt\"}");
        assert_eq!(parts[1].content_type.as_deref(), Some("text/plain"));
        assert_eq!(parts[1].body, b"hello body");
    }

    #[test]
    fn split_tolerates_bare_newlines() {
        let body = b"--sep\nContent-Type: application/json\n\n{}\n--sep\n\npayload\n--sep--";
        let parts = split_multipart(body, "sep").unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].body, b"{}");
        assert_eq!(parts[1].body, b"payload");
    }
}
