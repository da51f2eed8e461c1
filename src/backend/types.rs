//! Records and request types shared by both storage backends.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncSeek};

use crate::errors::ApiError;

// -- Buckets ------------------------------------------------------------------

/// Mutable bucket attributes, settable at creation and via update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketAttrs {
    /// Whether object versioning is enabled.
    pub versioning: bool,
    /// Default event-based hold applied to new objects.
    pub default_event_based_hold: bool,
    /// Geographic location tag (opaque string).
    pub location: String,
}

/// A bucket record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub name: String,
    pub time_created: DateTime<Utc>,
    #[serde(flatten)]
    pub attrs: BucketAttrs,
}

// -- Objects ------------------------------------------------------------------

/// A single ACL entry on an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclRule {
    pub entity: String,
    pub role: String,
}

impl AclRule {
    /// The default full-control entry granted to the project owner.
    pub fn owner_full_control() -> Self {
        Self {
            entity: "projectOwner".to_string(),
            role: "OWNER".to_string(),
        }
    }
}

/// The persisted metadata of one object generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub bucket: String,
    pub name: String,
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_disposition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<String>,
    /// User-provided metadata, in key/value pairs.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// CRC32C of the content, base64 over the big-endian u32.
    pub crc32c: String,
    /// MD5 of the content, base64.
    pub md5_hash: String,
    /// Quoted base64 MD5.
    pub etag: String,
    pub size: u64,
    /// Strictly increasing per (bucket, name).
    pub generation: i64,
    /// Starts at 1, bumped on each metadata-only mutation.
    pub metageneration: i64,
    pub time_created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(default)]
    pub acl: Vec<AclRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_based_hold: Option<bool>,
    /// Tombstone marker: set on the generation recorded by a versioned
    /// delete.  Tombstones shadow the key but are surfaced by
    /// `versions=true` listings.
    #[serde(default)]
    pub deleted: bool,
}

impl ObjectMeta {
    /// Build the record for a newly committed generation.
    pub fn new(
        bucket: &str,
        name: &str,
        attrs: &ObjectAttrs,
        digests: &crate::checksum::Digests,
        generation: i64,
    ) -> Self {
        let now = Utc::now();
        let acl = if attrs.acl.is_empty() {
            vec![AclRule::owner_full_control()]
        } else {
            attrs.acl.clone()
        };
        Self {
            bucket: bucket.to_string(),
            name: name.to_string(),
            content_type: attrs
                .content_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            content_encoding: attrs.content_encoding.clone(),
            content_disposition: attrs.content_disposition.clone(),
            content_language: attrs.content_language.clone(),
            cache_control: attrs.cache_control.clone(),
            metadata: attrs.metadata.clone(),
            crc32c: digests.crc32c.clone(),
            md5_hash: digests.md5_hash.clone(),
            etag: digests.etag(),
            size: digests.size,
            generation,
            metageneration: 1,
            time_created: now,
            updated: now,
            acl,
            custom_time: attrs.custom_time,
            event_based_hold: attrs.event_based_hold,
            deleted: false,
        }
    }

    /// The delete marker recorded by a versioned delete: attributes
    /// preserved, content empty.
    pub fn tombstone(&self, generation: i64) -> Self {
        let digests = crate::checksum::digest(b"");
        let now = Utc::now();
        Self {
            crc32c: digests.crc32c.clone(),
            md5_hash: digests.md5_hash.clone(),
            etag: digests.etag(),
            size: 0,
            generation,
            metageneration: 1,
            time_created: now,
            updated: now,
            deleted: true,
            ..self.clone()
        }
    }

    /// Apply a metadata merge patch and bump the metageneration.
    pub fn apply_patch(&mut self, patch: &ObjectPatch) {
        for (key, value) in &patch.metadata {
            match value {
                Some(v) => {
                    self.metadata.insert(key.clone(), v.clone());
                }
                None => {
                    self.metadata.remove(key);
                }
            }
        }
        if let Some(v) = &patch.content_type {
            self.content_type = v.clone();
        }
        if let Some(v) = &patch.content_encoding {
            self.content_encoding = Some(v.clone());
        }
        if let Some(v) = &patch.content_disposition {
            self.content_disposition = Some(v.clone());
        }
        if let Some(v) = &patch.content_language {
            self.content_language = Some(v.clone());
        }
        if let Some(v) = &patch.cache_control {
            self.cache_control = Some(v.clone());
        }
        if let Some(v) = patch.custom_time {
            self.custom_time = Some(v);
        }
        if let Some(v) = patch.event_based_hold {
            self.event_based_hold = Some(v);
        }
        self.metageneration += 1;
        self.updated = Utc::now();
    }

    /// Replace user metadata wholesale and bump the metageneration.
    pub fn replace_metadata(&mut self, metadata: HashMap<String, String>) {
        self.metadata = metadata;
        self.metageneration += 1;
        self.updated = Utc::now();
    }
}

/// Client-declared attributes for an object about to be written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectAttrs {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub content_disposition: Option<String>,
    pub content_language: Option<String>,
    pub cache_control: Option<String>,
    pub metadata: HashMap<String, String>,
    pub acl: Vec<AclRule>,
    pub custom_time: Option<DateTime<Utc>>,
    pub event_based_hold: Option<bool>,
}

/// Metadata merge patch.  `metadata` entries with a `None` value remove
/// the key; built-in attributes are overwritten when present.
#[derive(Debug, Clone, Default)]
pub struct ObjectPatch {
    pub metadata: HashMap<String, Option<String>>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub content_disposition: Option<String>,
    pub content_language: Option<String>,
    pub cache_control: Option<String>,
    pub custom_time: Option<DateTime<Utc>>,
    pub event_based_hold: Option<bool>,
}

// -- Preconditions ------------------------------------------------------------

/// Request-carried assertions on the current live generation, evaluated
/// atomically at the write point.  A generation of 0 means "no live
/// generation".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Preconditions {
    pub if_generation_match: Option<i64>,
    pub if_generation_not_match: Option<i64>,
    pub if_metageneration_match: Option<i64>,
    pub if_metageneration_not_match: Option<i64>,
}

impl Preconditions {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Evaluate against the live generation (`None` when the key has no
    /// live generation).  Must be called under the backend writer lock.
    pub fn check(&self, live: Option<&ObjectMeta>) -> Result<(), ApiError> {
        let generation = live.map(|m| m.generation).unwrap_or(0);
        let metageneration = live.map(|m| m.metageneration).unwrap_or(0);

        if let Some(expected) = self.if_generation_match {
            if generation != expected {
                return Err(ApiError::PreconditionFailed(format!(
                    "generation precondition not met: live generation is {generation}, expected {expected}"
                )));
            }
        }
        if let Some(unexpected) = self.if_generation_not_match {
            if generation == unexpected {
                return Err(ApiError::PreconditionFailed(format!(
                    "generation precondition not met: live generation is {generation}"
                )));
            }
        }
        if let Some(expected) = self.if_metageneration_match {
            if metageneration != expected {
                return Err(ApiError::PreconditionFailed(format!(
                    "metageneration precondition not met: live metageneration is {metageneration}, expected {expected}"
                )));
            }
        }
        if let Some(unexpected) = self.if_metageneration_not_match {
            if metageneration == unexpected {
                return Err(ApiError::PreconditionFailed(format!(
                    "metageneration precondition not met: live metageneration is {metageneration}"
                )));
            }
        }
        Ok(())
    }
}

// -- Streams and handles ------------------------------------------------------

/// Incoming object content as an ordered chunk stream.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Wrap a fully buffered body as a single-chunk [`ByteStream`].
pub fn bytes_stream(data: Bytes) -> ByteStream {
    Box::pin(futures_util::stream::once(async move { Ok(data) }))
}

/// A checked-out content reader.  Lives independently of backend locks;
/// dropped on all exit paths by the dispatcher.
pub trait ObjectReader: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T: AsyncRead + AsyncSeek + Send + Unpin> ObjectReader for T {}

/// An object checked out for reading: its metadata plus a seekable
/// content reader.
pub struct ObjectHandle {
    pub meta: ObjectMeta,
    pub reader: Box<dyn ObjectReader>,
}

// -- Operation results --------------------------------------------------------

/// Result of a committed write.
#[derive(Debug, Clone)]
pub struct PutResult {
    /// The newly committed generation.
    pub meta: ObjectMeta,
    /// The previous live generation this write shadowed on a versioned
    /// bucket.  Drives the archive notification.
    pub archived: Option<ObjectMeta>,
}

/// Result of a delete.
#[derive(Debug, Clone)]
pub struct DeleteResult {
    /// The generation that was removed (or shadowed by a tombstone).
    pub meta: ObjectMeta,
    /// Whether a tombstone was appended instead of removing the record.
    pub tombstoned: bool,
}

// -- Listing ------------------------------------------------------------------

/// Listing parameters understood by the backends.  Pagination is layered
/// on top by the dispatcher.
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub prefix: String,
    pub delimiter: String,
    /// Include historical generations and tombstones.
    pub versions: bool,
}

/// A point-in-time listing snapshot.
#[derive(Debug, Clone, Default)]
pub struct Listing {
    /// Matching generations, ordered by (name asc, generation desc).
    pub objects: Vec<ObjectMeta>,
    /// Pseudo-directories cut at the delimiter, each ending with it.
    pub prefixes: Vec<String>,
}

// -- Generation counter -------------------------------------------------------

/// Monotonic generation source, scoped to a backend instance.
///
/// Seeded from the wall clock in microseconds so generations remain
/// strictly increasing across restarts of a filesystem-backed instance.
pub struct GenerationCounter(AtomicI64);

impl GenerationCounter {
    pub fn new() -> Self {
        let micros = Utc::now().timestamp_micros();
        Self(AtomicI64::new(micros))
    }

    pub fn next(&self) -> i64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Default for GenerationCounter {
    fn default() -> Self {
        Self::new()
    }
}
