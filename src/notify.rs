//! Notification registry and event fan-out.
//!
//! Each bucket owns a list of notification configs.  After a committed
//! object transition the dispatcher calls [`NotificationRegistry::trigger`];
//! every matching config gets exactly one publish, each on its own
//! background task with a per-publish timeout.  Publishes are best-effort:
//! failures are logged and never surfaced to the caller.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::backend::types::ObjectMeta;
use crate::errors::ApiError;

/// Per-publish timeout.
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

// -- Event model --------------------------------------------------------------

/// Object lifecycle events, with their wire tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// A new object (or new generation of an existing object) was created.
    ObjectFinalize,
    /// The metadata of an existing object changed.
    ObjectMetadataUpdate,
    /// An object was deleted or tombstoned.
    ObjectDelete,
    /// The live version became noncurrent on a versioned bucket.
    ObjectArchive,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ObjectFinalize => "OBJECT_FINALIZE",
            EventType::ObjectMetadataUpdate => "OBJECT_METADATA_UPDATE",
            EventType::ObjectDelete => "OBJECT_DELETE",
            EventType::ObjectArchive => "OBJECT_ARCHIVE",
        }
    }

    /// Parse a wire tag or its short back-compat alias (`finalize`,
    /// `delete`, ...), as accepted by the `event.list` flag.
    pub fn parse(value: &str) -> Result<Self, ApiError> {
        match value.to_ascii_uppercase().as_str() {
            "OBJECT_FINALIZE" | "FINALIZE" => Ok(EventType::ObjectFinalize),
            "OBJECT_METADATA_UPDATE" | "METADATAUPDATE" | "METADATA_UPDATE" => {
                Ok(EventType::ObjectMetadataUpdate)
            }
            "OBJECT_DELETE" | "DELETE" => Ok(EventType::ObjectDelete),
            "OBJECT_ARCHIVE" | "ARCHIVE" => Ok(EventType::ObjectArchive),
            other => Err(ApiError::Invalid(format!("unknown event type {other:?}"))),
        }
    }
}

/// The desired content of the publish payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayloadFormat {
    /// The object's JSON API resource representation.
    #[default]
    JsonApiV1,
    /// Attributes only, no payload.
    None,
}

/// A per-bucket subscription mapping filtered object events to a topic.
/// Immutable after insertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub id: String,
    /// Topic URN, e.g. `//pubsub.googleapis.com/projects/p/topics/t`.
    pub topic: String,
    /// Only these event types fire; empty means all.
    #[serde(default)]
    pub event_types: Vec<EventType>,
    /// Only object names with this prefix fire; empty means all.
    #[serde(default)]
    pub object_name_prefix: String,
    #[serde(default)]
    pub payload_format: PayloadFormat,
    /// Extra attributes attached to every published message.
    #[serde(default)]
    pub custom_attributes: HashMap<String, String>,
}

impl NotificationConfig {
    fn matches(&self, meta: &ObjectMeta, event: EventType) -> bool {
        (self.event_types.is_empty() || self.event_types.contains(&event))
            && meta.name.starts_with(&self.object_name_prefix)
    }
}

/// One message ready to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    /// JSON envelope bytes; empty for `PayloadFormat::None`.
    pub data: Vec<u8>,
    pub attributes: HashMap<String, String>,
}

/// Build the JSON event envelope for an object.
fn event_payload(meta: &ObjectMeta) -> Vec<u8> {
    let envelope = serde_json::json!({
        "kind": "storage#object",
        "bucket": meta.bucket,
        "name": meta.name,
        "generation": meta.generation.to_string(),
        "size": meta.size.to_string(),
        "contentType": meta.content_type,
        "timeCreated": meta.time_created.to_rfc3339(),
        "updated": meta.updated.to_rfc3339(),
        "md5Hash": meta.md5_hash,
        "crc32c": meta.crc32c,
        "metadata": meta.metadata,
    });
    serde_json::to_vec(&envelope).unwrap_or_default()
}

fn event_attributes(
    config: &NotificationConfig,
    meta: &ObjectMeta,
    event: EventType,
) -> HashMap<String, String> {
    let mut attributes = config.custom_attributes.clone();
    attributes.insert("eventType".to_string(), event.as_str().to_string());
    attributes.insert("bucketId".to_string(), meta.bucket.clone());
    attributes.insert("objectId".to_string(), meta.name.clone());
    attributes.insert(
        "objectGeneration".to_string(),
        meta.generation.to_string(),
    );
    let format = match config.payload_format {
        PayloadFormat::JsonApiV1 => "JSON_API_V1",
        PayloadFormat::None => "NONE",
    };
    attributes.insert("payloadFormat".to_string(), format.to_string());
    attributes
}

// -- Sink ---------------------------------------------------------------------

/// Destination for published events.
pub trait EventSink: Send + Sync + 'static {
    fn publish(
        &self,
        message: OutboundMessage,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;
}

/// Publishes to the Cloud Pub/Sub REST surface.
///
/// The base URL defaults to the production endpoint and follows
/// `PUBSUB_EMULATOR_HOST` when set, so events land on a local emulator
/// during tests.
pub struct PubsubSink {
    client: reqwest::Client,
    base_url: String,
}

impl PubsubSink {
    pub fn new() -> Self {
        let base_url = match std::env::var("PUBSUB_EMULATOR_HOST") {
            Ok(host) if !host.is_empty() => format!("http://{host}"),
            _ => "https://pubsub.googleapis.com".to_string(),
        };
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    /// Reduce a topic URN to the `projects/{p}/topics/{t}` path segment.
    fn topic_path(topic: &str) -> &str {
        topic
            .strip_prefix("//pubsub.googleapis.com/")
            .unwrap_or(topic)
    }
}

impl Default for PubsubSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for PubsubSink {
    fn publish(
        &self,
        message: OutboundMessage,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let url = format!(
                "{}/v1/{}:publish",
                self.base_url,
                Self::topic_path(&message.topic)
            );
            let body = serde_json::json!({
                "messages": [{
                    "data": BASE64.encode(&message.data),
                    "attributes": message.attributes,
                }]
            });
            let response = self.client.post(&url).json(&body).send().await?;
            if !response.status().is_success() {
                anyhow::bail!("publish to {url} failed with status {}", response.status());
            }
            Ok(())
        })
    }
}

// -- Registry -----------------------------------------------------------------

/// Per-bucket notification configs plus the shared sink.
pub struct NotificationRegistry {
    configs: RwLock<HashMap<String, Vec<NotificationConfig>>>,
    sink: Arc<dyn EventSink>,
    publish_timeout: Duration,
}

impl NotificationRegistry {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            configs: RwLock::new(HashMap::new()),
            sink,
            publish_timeout: PUBLISH_TIMEOUT,
        }
    }

    /// Insert a config, assigning an ID when the caller left it empty.
    pub async fn insert(&self, bucket: &str, mut config: NotificationConfig) -> NotificationConfig {
        if config.id.is_empty() {
            config.id = uuid::Uuid::new_v4().simple().to_string();
        }
        self.configs
            .write()
            .await
            .entry(bucket.to_string())
            .or_default()
            .push(config.clone());
        config
    }

    pub async fn list(&self, bucket: &str) -> Vec<NotificationConfig> {
        self.configs
            .read()
            .await
            .get(bucket)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn get(&self, bucket: &str, id: &str) -> Result<NotificationConfig, ApiError> {
        self.list(bucket)
            .await
            .into_iter()
            .find(|c| c.id == id)
            .ok_or_else(|| ApiError::NotFound(format!("notification config {id} not found")))
    }

    pub async fn delete(&self, bucket: &str, id: &str) -> Result<(), ApiError> {
        let mut configs = self.configs.write().await;
        let list = configs
            .get_mut(bucket)
            .ok_or_else(|| ApiError::NotFound(format!("notification config {id} not found")))?;
        let before = list.len();
        list.retain(|c| c.id != id);
        if list.len() == before {
            return Err(ApiError::NotFound(format!(
                "notification config {id} not found"
            )));
        }
        Ok(())
    }

    /// Drop every config owned by a deleted bucket.
    pub async fn drop_bucket(&self, bucket: &str) {
        self.configs.write().await.remove(bucket);
    }

    /// Messages that would be published for this transition.  One per
    /// matching config.
    pub async fn matching_messages(
        &self,
        meta: &ObjectMeta,
        event: EventType,
    ) -> Vec<OutboundMessage> {
        let configs = self.configs.read().await;
        let Some(list) = configs.get(&meta.bucket) else {
            return Vec::new();
        };
        list.iter()
            .filter(|config| config.matches(meta, event))
            .map(|config| OutboundMessage {
                topic: config.topic.clone(),
                data: match config.payload_format {
                    PayloadFormat::JsonApiV1 => event_payload(meta),
                    PayloadFormat::None => Vec::new(),
                },
                attributes: event_attributes(config, meta, event),
            })
            .collect()
    }

    /// Fan out one object transition.  Each publish runs on its own
    /// background task bounded by the publish timeout; the caller never
    /// waits on the sink.
    pub async fn trigger(&self, meta: &ObjectMeta, event: EventType) {
        for message in self.matching_messages(meta, event).await {
            let sink = Arc::clone(&self.sink);
            let timeout = self.publish_timeout;
            let topic = message.topic.clone();
            tokio::spawn(async move {
                match tokio::time::timeout(timeout, sink.publish(message)).await {
                    Ok(Ok(())) => debug!("published {} event to {topic}", event.as_str()),
                    Ok(Err(e)) => warn!("publish to {topic} failed: {e:#}"),
                    Err(_) => warn!("publish to {topic} timed out"),
                }
            });
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingSink;
    use super::*;
    use crate::checksum;

    fn sample_meta(bucket: &str, name: &str) -> ObjectMeta {
        let digests = checksum::digest(b"payload");
        ObjectMeta::new(
            bucket,
            name,
            &crate::backend::types::ObjectAttrs::default(),
            &digests,
            1234,
        )
    }

    fn config(prefix: &str, event_types: Vec<EventType>) -> NotificationConfig {
        NotificationConfig {
            id: String::new(),
            topic: "//pubsub.googleapis.com/projects/p/topics/t".to_string(),
            event_types,
            object_name_prefix: prefix.to_string(),
            payload_format: PayloadFormat::JsonApiV1,
            custom_attributes: HashMap::new(),
        }
    }

    fn registry() -> NotificationRegistry {
        NotificationRegistry::new(Arc::new(RecordingSink::default()))
    }

    #[tokio::test]
    async fn prefix_and_event_type_filters() {
        let registry = registry();
        registry
            .insert("b", config("uploads/", vec![EventType::ObjectFinalize]))
            .await;

        // Matching prefix and event type: exactly one message.
        let matching = sample_meta("b", "uploads/x");
        let messages = registry
            .matching_messages(&matching, EventType::ObjectFinalize)
            .await;
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0].attributes.get("eventType").map(String::as_str),
            Some("OBJECT_FINALIZE")
        );

        // Wrong prefix: no publish.
        let other = sample_meta("b", "other/x");
        assert!(registry
            .matching_messages(&other, EventType::ObjectFinalize)
            .await
            .is_empty());

        // Wrong event type: no publish.
        assert!(registry
            .matching_messages(&matching, EventType::ObjectMetadataUpdate)
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn empty_filters_match_everything() {
        let registry = registry();
        registry.insert("b", config("", vec![])).await;

        let meta = sample_meta("b", "anything");
        for event in [
            EventType::ObjectFinalize,
            EventType::ObjectMetadataUpdate,
            EventType::ObjectDelete,
            EventType::ObjectArchive,
        ] {
            assert_eq!(registry.matching_messages(&meta, event).await.len(), 1);
        }
    }

    #[tokio::test]
    async fn payload_carries_object_envelope() {
        let registry = registry();
        registry.insert("b", config("", vec![])).await;

        let meta = sample_meta("b", "doc.txt");
        let messages = registry
            .matching_messages(&meta, EventType::ObjectFinalize)
            .await;
        let payload: serde_json::Value = serde_json::from_slice(&messages[0].data).unwrap();
        assert_eq!(payload["bucket"], "b");
        assert_eq!(payload["name"], "doc.txt");
        assert_eq!(payload["generation"], "1234");
        assert_eq!(payload["size"], "7");
        assert_eq!(payload["md5Hash"], meta.md5_hash);
        assert_eq!(payload["crc32c"], meta.crc32c);

        assert_eq!(
            messages[0].attributes.get("objectGeneration").map(String::as_str),
            Some("1234")
        );
        assert_eq!(
            messages[0].attributes.get("bucketId").map(String::as_str),
            Some("b")
        );
    }

    #[tokio::test]
    async fn payload_format_none_sends_attributes_only() {
        let registry = registry();
        let mut cfg = config("", vec![]);
        cfg.payload_format = PayloadFormat::None;
        cfg.custom_attributes
            .insert("team".to_string(), "storage".to_string());
        registry.insert("b", cfg).await;

        let meta = sample_meta("b", "doc.txt");
        let messages = registry
            .matching_messages(&meta, EventType::ObjectDelete)
            .await;
        assert!(messages[0].data.is_empty());
        assert_eq!(
            messages[0].attributes.get("payloadFormat").map(String::as_str),
            Some("NONE")
        );
        assert_eq!(
            messages[0].attributes.get("team").map(String::as_str),
            Some("storage")
        );
    }

    #[tokio::test]
    async fn configs_scoped_per_bucket() {
        let registry = registry();
        registry.insert("a", config("", vec![])).await;

        let meta = sample_meta("b", "doc.txt");
        assert!(registry
            .matching_messages(&meta, EventType::ObjectFinalize)
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn insert_list_delete() {
        let registry = registry();
        let inserted = registry.insert("b", config("", vec![])).await;
        assert!(!inserted.id.is_empty());

        assert_eq!(registry.list("b").await.len(), 1);
        registry.delete("b", &inserted.id).await.unwrap();
        assert!(registry.list("b").await.is_empty());
        assert!(matches!(
            registry.delete("b", &inserted.id).await,
            Err(ApiError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn trigger_reaches_the_sink() {
        let sink = Arc::new(RecordingSink::default());
        let registry = NotificationRegistry::new(sink.clone());
        registry.insert("b", config("", vec![])).await;

        let meta = sample_meta("b", "doc.txt");
        registry.trigger(&meta, EventType::ObjectFinalize).await;

        // Publishes run on background tasks; give them a beat.
        for _ in 0..50 {
            if !sink.published.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(sink.published.lock().unwrap().len(), 1);
    }

    #[test]
    fn event_type_aliases() {
        assert_eq!(EventType::parse("finalize").unwrap(), EventType::ObjectFinalize);
        assert_eq!(EventType::parse("OBJECT_DELETE").unwrap(), EventType::ObjectDelete);
        assert_eq!(EventType::parse("archive").unwrap(), EventType::ObjectArchive);
        assert!(EventType::parse("nonsense").is_err());
    }
}
