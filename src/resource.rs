//! JSON API resource representations.
//!
//! Response shapes follow the production JSON API: camelCase field names,
//! int64 values (`generation`, `metageneration`, `size`) carried as
//! decimal strings, RFC 3339 timestamps, and `kind` discriminators.
//! Request shapes are deserialized leniently so the various client SDK
//! dialects all parse.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::types::{AclRule, Bucket, BucketAttrs, ObjectAttrs, ObjectMeta, ObjectPatch};
use crate::notify::{EventType, NotificationConfig, PayloadFormat};

/// Characters escaped in URL path segments.
const SEGMENT_SET: &percent_encoding::AsciiSet = &percent_encoding::NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Escape one URL path segment (object names may contain `/`).
pub fn escape_segment(name: &str) -> String {
    percent_encoding::utf8_percent_encode(name, SEGMENT_SET).to_string()
}

// -- int64-as-string helpers --------------------------------------------------

mod int64_string {
    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &i64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }
}

mod uint64_string {
    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }
}

// -- ACL ----------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectAccessControl {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub entity: String,
    pub role: String,
}

impl From<&AclRule> for ObjectAccessControl {
    fn from(rule: &AclRule) -> Self {
        Self {
            kind: Some("storage#objectAccessControl".to_string()),
            entity: rule.entity.clone(),
            role: rule.role.clone(),
        }
    }
}

impl From<&ObjectAccessControl> for AclRule {
    fn from(control: &ObjectAccessControl) -> Self {
        Self {
            entity: control.entity.clone(),
            role: control.role.clone(),
        }
    }
}

// -- Buckets ------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketResource {
    pub kind: &'static str,
    pub id: String,
    pub name: String,
    pub self_link: String,
    pub time_created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub location: String,
    pub storage_class: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub versioning: Option<BucketVersioning>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub default_event_based_hold: bool,
    pub etag: &'static str,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct BucketVersioning {
    pub enabled: bool,
}

impl BucketResource {
    pub fn from_bucket(bucket: &Bucket, base_url: &str) -> Self {
        Self {
            kind: "storage#bucket",
            id: bucket.name.clone(),
            name: bucket.name.clone(),
            self_link: format!(
                "{base_url}/storage/v1/b/{}",
                escape_segment(&bucket.name)
            ),
            time_created: bucket.time_created,
            updated: bucket.time_created,
            location: bucket.attrs.location.clone(),
            storage_class: "STANDARD",
            versioning: bucket.attrs.versioning.then_some(BucketVersioning { enabled: true }),
            default_event_based_hold: bucket.attrs.default_event_based_hold,
            etag: "RVRhZw==",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ListBucketsResponse {
    pub kind: &'static str,
    pub items: Vec<BucketResource>,
}

/// Bucket resource accepted by `POST /b` and `PATCH /b/{bucket}`.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct BucketRequest {
    pub name: Option<String>,
    pub location: Option<String>,
    pub versioning: Option<BucketVersioning>,
    pub default_event_based_hold: Option<bool>,
}

impl BucketRequest {
    /// Resolve to attributes, starting from the given defaults (creation)
    /// or the current attributes (patch).
    pub fn apply_to(&self, mut attrs: BucketAttrs) -> BucketAttrs {
        if let Some(location) = &self.location {
            attrs.location = location.clone();
        }
        if let Some(versioning) = &self.versioning {
            attrs.versioning = versioning.enabled;
        }
        if let Some(hold) = self.default_event_based_hold {
            attrs.default_event_based_hold = hold;
        }
        attrs
    }
}

// -- Objects ------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectResource {
    pub kind: &'static str,
    pub id: String,
    pub self_link: String,
    pub media_link: String,
    pub name: String,
    pub bucket: String,
    #[serde(with = "int64_string")]
    pub generation: i64,
    #[serde(with = "int64_string")]
    pub metageneration: i64,
    pub content_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_disposition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<String>,
    pub time_created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub storage_class: &'static str,
    #[serde(with = "uint64_string")]
    pub size: u64,
    pub md5_hash: String,
    pub crc32c: String,
    pub etag: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub acl: Vec<ObjectAccessControl>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_based_hold: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_deleted: Option<DateTime<Utc>>,
}

impl ObjectResource {
    pub fn from_meta(meta: &ObjectMeta, base_url: &str) -> Self {
        let escaped_bucket = escape_segment(&meta.bucket);
        let escaped_name = escape_segment(&meta.name);
        Self {
            kind: "storage#object",
            id: format!("{}/{}/{}", meta.bucket, meta.name, meta.generation),
            self_link: format!(
                "{base_url}/storage/v1/b/{escaped_bucket}/o/{escaped_name}"
            ),
            media_link: format!(
                "{base_url}/download/storage/v1/b/{escaped_bucket}/o/{escaped_name}?generation={}&alt=media",
                meta.generation
            ),
            name: meta.name.clone(),
            bucket: meta.bucket.clone(),
            generation: meta.generation,
            metageneration: meta.metageneration,
            content_type: meta.content_type.clone(),
            content_encoding: meta.content_encoding.clone(),
            content_disposition: meta.content_disposition.clone(),
            content_language: meta.content_language.clone(),
            cache_control: meta.cache_control.clone(),
            time_created: meta.time_created,
            updated: meta.updated,
            storage_class: "STANDARD",
            size: meta.size,
            md5_hash: meta.md5_hash.clone(),
            crc32c: meta.crc32c.clone(),
            etag: meta.etag.clone(),
            metadata: meta.metadata.clone(),
            acl: meta.acl.iter().map(ObjectAccessControl::from).collect(),
            custom_time: meta.custom_time,
            event_based_hold: meta.event_based_hold,
            time_deleted: meta.deleted.then_some(meta.updated),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListObjectsResponse {
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub prefixes: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<ObjectResource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

/// Object resource accepted on insert (resumable start body, multipart
/// metadata part) and on metadata update.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectRequest {
    pub name: Option<String>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub content_disposition: Option<String>,
    pub content_language: Option<String>,
    pub cache_control: Option<String>,
    pub metadata: Option<HashMap<String, String>>,
    pub acl: Option<Vec<ObjectAccessControl>>,
    pub custom_time: Option<DateTime<Utc>>,
    pub event_based_hold: Option<bool>,
}

impl ObjectRequest {
    pub fn into_attrs(self) -> ObjectAttrs {
        ObjectAttrs {
            content_type: self.content_type,
            content_encoding: self.content_encoding,
            content_disposition: self.content_disposition,
            content_language: self.content_language,
            cache_control: self.cache_control,
            metadata: self.metadata.unwrap_or_default(),
            acl: self
                .acl
                .unwrap_or_default()
                .iter()
                .map(AclRule::from)
                .collect(),
            custom_time: self.custom_time,
            event_based_hold: self.event_based_hold,
        }
    }
}

/// The merge-patch body of `PATCH .../o/{object}`.  `metadata` values of
/// JSON `null` remove the key.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectPatchRequest {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub content_disposition: Option<String>,
    pub content_language: Option<String>,
    pub cache_control: Option<String>,
    pub metadata: Option<HashMap<String, Option<String>>>,
    pub custom_time: Option<DateTime<Utc>>,
    pub event_based_hold: Option<bool>,
}

impl ObjectPatchRequest {
    pub fn into_patch(self) -> ObjectPatch {
        ObjectPatch {
            metadata: self.metadata.unwrap_or_default(),
            content_type: self.content_type,
            content_encoding: self.content_encoding,
            content_disposition: self.content_disposition,
            content_language: self.content_language,
            cache_control: self.cache_control,
            custom_time: self.custom_time,
            event_based_hold: self.event_based_hold,
        }
    }
}

/// Body of `POST .../o/{dest}/compose`.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ComposeRequest {
    pub source_objects: Vec<ComposeSource>,
    pub destination: Option<ObjectRequest>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ComposeSource {
    pub name: String,
}

/// Response of `POST .../rewriteTo/...`.  Rewrites complete in one call;
/// the token is advisory.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RewriteResponse {
    pub kind: &'static str,
    #[serde(with = "uint64_string")]
    pub total_bytes_rewritten: u64,
    #[serde(with = "uint64_string")]
    pub object_size: u64,
    pub done: bool,
    pub resource: ObjectResource,
}

impl RewriteResponse {
    pub fn completed(resource: ObjectResource) -> Self {
        Self {
            kind: "storage#rewriteResponse",
            total_bytes_rewritten: resource.size,
            object_size: resource.size,
            done: true,
            resource,
        }
    }
}

// -- Notifications ------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationResource {
    pub kind: &'static str,
    pub id: String,
    pub self_link: String,
    pub topic: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub event_types: Vec<EventType>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub object_name_prefix: String,
    pub payload_format: PayloadFormat,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub custom_attributes: HashMap<String, String>,
    pub etag: String,
}

impl NotificationResource {
    pub fn from_config(config: &NotificationConfig, bucket: &str, base_url: &str) -> Self {
        Self {
            kind: "storage#notification",
            id: config.id.clone(),
            self_link: format!(
                "{base_url}/storage/v1/b/{}/notificationConfigs/{}",
                escape_segment(bucket),
                config.id
            ),
            topic: config.topic.clone(),
            event_types: config.event_types.clone(),
            object_name_prefix: config.object_name_prefix.clone(),
            payload_format: config.payload_format,
            custom_attributes: config.custom_attributes.clone(),
            etag: config.id.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ListNotificationsResponse {
    pub kind: &'static str,
    pub items: Vec<NotificationResource>,
}

/// Body of `POST /b/{bucket}/notificationConfigs`.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationRequest {
    pub topic: Option<String>,
    pub event_types: Option<Vec<EventType>>,
    pub object_name_prefix: Option<String>,
    pub payload_format: Option<PayloadFormat>,
    pub custom_attributes: Option<HashMap<String, String>>,
}

impl NotificationRequest {
    pub fn into_config(self) -> Result<NotificationConfig, crate::errors::ApiError> {
        let topic = self
            .topic
            .filter(|t| !t.is_empty())
            .ok_or_else(|| crate::errors::ApiError::Invalid("notification topic is required".to_string()))?;
        Ok(NotificationConfig {
            id: String::new(),
            topic,
            event_types: self.event_types.unwrap_or_default(),
            object_name_prefix: self.object_name_prefix.unwrap_or_default(),
            payload_format: self.payload_format.unwrap_or_default(),
            custom_attributes: self.custom_attributes.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum;

    fn meta() -> ObjectMeta {
        let digests = checksum::digest(b"hello world");
        ObjectMeta::new(
            "my-bucket",
            "dir/file.txt",
            &ObjectAttrs::default(),
            &digests,
            1700000000000001,
        )
    }

    #[test]
    fn object_resource_serializes_int64_as_string() {
        let resource = ObjectResource::from_meta(&meta(), "http://localhost:4443");
        let json = serde_json::to_value(&resource).unwrap();

        assert_eq!(json["kind"], "storage#object");
        assert_eq!(json["generation"], "1700000000000001");
        assert_eq!(json["metageneration"], "1");
        assert_eq!(json["size"], "11");
        assert_eq!(
            json["selfLink"],
            "http://localhost:4443/storage/v1/b/my-bucket/o/dir%2Ffile.txt"
        );
        assert!(json["mediaLink"]
            .as_str()
            .unwrap()
            .contains("alt=media"));
        // Empty user metadata is omitted.
        assert!(json.get("metadata").is_none());
    }

    #[test]
    fn object_request_parses_sdk_insert_body() {
        let body = r#"{
            "name": "obj.txt",
            "contentType": "text/plain",
            "metadata": {"color": "red"},
            "cacheControl": "no-cache"
        }"#;
        let request: ObjectRequest = serde_json::from_str(body).unwrap();
        assert_eq!(request.name.as_deref(), Some("obj.txt"));

        let attrs = request.into_attrs();
        assert_eq!(attrs.content_type.as_deref(), Some("text/plain"));
        assert_eq!(attrs.metadata.get("color").map(String::as_str), Some("red"));
        assert_eq!(attrs.cache_control.as_deref(), Some("no-cache"));
    }

    #[test]
    fn patch_request_distinguishes_null_from_absent() {
        let body = r#"{"metadata": {"keep": "v", "drop": null}}"#;
        let request: ObjectPatchRequest = serde_json::from_str(body).unwrap();
        let patch = request.into_patch();
        assert_eq!(patch.metadata.get("keep"), Some(&Some("v".to_string())));
        assert_eq!(patch.metadata.get("drop"), Some(&None));
    }

    #[test]
    fn bucket_request_applies_partial_updates() {
        let body = r#"{"versioning": {"enabled": true}}"#;
        let request: BucketRequest = serde_json::from_str(body).unwrap();
        let attrs = request.apply_to(BucketAttrs {
            location: "US".to_string(),
            ..Default::default()
        });
        assert!(attrs.versioning);
        assert_eq!(attrs.location, "US");
    }

    #[test]
    fn compose_request_parses() {
        let body = r#"{
            "sourceObjects": [{"name": "a"}, {"name": "b"}],
            "destination": {"contentType": "text/plain"}
        }"#;
        let request: ComposeRequest = serde_json::from_str(body).unwrap();
        assert_eq!(request.source_objects.len(), 2);
        assert_eq!(request.source_objects[0].name, "a");
    }

    #[test]
    fn notification_request_requires_topic() {
        let missing: NotificationRequest = serde_json::from_str("{}").unwrap();
        assert!(missing.into_config().is_err());

        let body = r#"{
            "topic": "//pubsub.googleapis.com/projects/p/topics/t",
            "eventTypes": ["OBJECT_FINALIZE"],
            "payloadFormat": "NONE"
        }"#;
        let request: NotificationRequest = serde_json::from_str(body).unwrap();
        let config = request.into_config().unwrap();
        assert_eq!(config.event_types, vec![EventType::ObjectFinalize]);
        assert_eq!(config.payload_format, PayloadFormat::None);
    }

    #[test]
    fn tombstone_exposes_time_deleted() {
        let tombstone = meta().tombstone(99);
        let resource = ObjectResource::from_meta(&tombstone, "http://localhost:4443");
        assert!(resource.time_deleted.is_some());
    }
}
