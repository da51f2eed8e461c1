//! Request handlers for the JSON, upload, and XML surfaces.

pub mod bucket;
pub mod notification;
pub mod object;
pub mod upload;

use std::collections::HashMap;

use crate::backend::types::{Preconditions, PutResult};
use crate::errors::ApiError;
use crate::notify::EventType;
use crate::AppState;

/// Parse an optional int64 query parameter.
pub(crate) fn parse_i64_param(
    query: &HashMap<String, String>,
    key: &str,
) -> Result<Option<i64>, ApiError> {
    match query.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<i64>()
            .map(Some)
            .map_err(|_| ApiError::Invalid(format!("malformed {key} value {raw:?}"))),
    }
}

/// Preconditions carried in query parameters.
pub(crate) fn parse_preconditions(
    query: &HashMap<String, String>,
) -> Result<Preconditions, ApiError> {
    Ok(Preconditions {
        if_generation_match: parse_i64_param(query, "ifGenerationMatch")?,
        if_generation_not_match: parse_i64_param(query, "ifGenerationNotMatch")?,
        if_metageneration_match: parse_i64_param(query, "ifMetagenerationMatch")?,
        if_metageneration_not_match: parse_i64_param(query, "ifMetagenerationNotMatch")?,
    })
}

/// Fan out the events for a committed write: a finalize for the new
/// generation, plus an archive when the write shadowed the previous live
/// generation of a versioned bucket.
pub(crate) async fn publish_put_events(state: &AppState, result: &PutResult) {
    state
        .notifications
        .trigger(&result.meta, EventType::ObjectFinalize)
        .await;
    if let Some(archived) = &result.archived {
        state
            .notifications
            .trigger(archived, EventType::ObjectArchive)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preconditions_from_query() {
        let mut query = HashMap::new();
        query.insert("ifGenerationMatch".to_string(), "42".to_string());
        query.insert("ifMetagenerationNotMatch".to_string(), "3".to_string());

        let pre = parse_preconditions(&query).unwrap();
        assert_eq!(pre.if_generation_match, Some(42));
        assert_eq!(pre.if_generation_not_match, None);
        assert_eq!(pre.if_metageneration_not_match, Some(3));
    }

    #[test]
    fn malformed_precondition_is_invalid() {
        let mut query = HashMap::new();
        query.insert("ifGenerationMatch".to_string(), "latest".to_string());
        assert!(matches!(
            parse_preconditions(&query),
            Err(ApiError::Invalid(_))
        ));
    }
}
