//! In-memory storage backend.
//!
//! Buckets live in a `tokio::sync::RwLock`-guarded map; each bucket holds
//! an ordered map of object name to generation list, so listings are a
//! snapshot scan under the reader lock.  Content buffers are immutable
//! [`Bytes`] handed out without holding the lock.
//!
//! Structural mutations (bucket/object create and delete) take the writer
//! lock; byte ingestion happens before the lock is acquired.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::sync::RwLock;

use super::store::{check_compose_sources, delimiter_cut, Storage};
use super::types::{
    Bucket, BucketAttrs, ByteStream, DeleteResult, GenerationCounter, ListQuery, Listing,
    ObjectAttrs, ObjectHandle, ObjectMeta, ObjectPatch, Preconditions, PutResult,
};
use crate::checksum::{ChecksumTee, Digests};
use crate::errors::ApiError;

type OpFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ApiError>> + Send + 'a>>;

/// One generation: metadata plus its immutable content buffer.
#[derive(Clone)]
struct StoredObject {
    meta: ObjectMeta,
    content: Bytes,
}

/// A bucket and its objects.  Generation lists are append-ordered, so the
/// last element is the newest generation.
struct BucketEntry {
    bucket: Bucket,
    objects: BTreeMap<String, Vec<StoredObject>>,
}

impl BucketEntry {
    fn live(&self, name: &str) -> Option<&StoredObject> {
        self.objects
            .get(name)
            .and_then(|generations| generations.last())
            .filter(|stored| !stored.meta.deleted)
    }

    fn has_live_objects(&self) -> bool {
        self.objects
            .values()
            .any(|generations| generations.last().is_some_and(|s| !s.meta.deleted))
    }
}

/// In-memory storage backend.
pub struct MemoryBackend {
    buckets: RwLock<HashMap<String, BucketEntry>>,
    generations: GenerationCounter,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            generations: GenerationCounter::new(),
        }
    }

    /// Drain a content stream through the checksum tee.
    async fn collect(mut content: ByteStream) -> Result<(Bytes, Digests), ApiError> {
        let mut tee = ChecksumTee::new();
        let mut buf = BytesMut::new();
        while let Some(chunk) = content.next().await {
            let chunk = chunk?;
            tee.update(&chunk);
            buf.extend_from_slice(&chunk);
        }
        Ok((buf.freeze(), tee.finalize()))
    }

    /// Install a new generation under the writer lock: evaluate
    /// preconditions, assign the generation, and record what happened to
    /// the previous live generation.
    async fn commit(
        &self,
        bucket: &str,
        name: &str,
        attrs: &ObjectAttrs,
        content: Bytes,
        digests: &Digests,
        preconditions: Preconditions,
    ) -> Result<PutResult, ApiError> {
        let mut buckets = self.buckets.write().await;
        let entry = buckets
            .entry(bucket.to_string())
            .or_insert_with(|| BucketEntry {
                bucket: Bucket {
                    name: bucket.to_string(),
                    time_created: chrono::Utc::now(),
                    attrs: BucketAttrs::default(),
                },
                objects: BTreeMap::new(),
            });

        preconditions.check(entry.live(name).map(|s| &s.meta))?;

        let meta = ObjectMeta::new(bucket, name, attrs, digests, self.generations.next());
        let stored = StoredObject {
            meta: meta.clone(),
            content,
        };

        let versioning = entry.bucket.attrs.versioning;
        let generations = entry.objects.entry(name.to_string()).or_default();
        let archived = if versioning {
            let previous = generations.last().filter(|s| !s.meta.deleted);
            let archived = previous.map(|s| s.meta.clone());
            generations.push(stored);
            archived
        } else {
            *generations = vec![stored];
            None
        };

        Ok(PutResult { meta, archived })
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn bucket_not_found(name: &str) -> ApiError {
    ApiError::NotFound(format!("bucket {name} not found"))
}

fn object_not_found(bucket: &str, name: &str) -> ApiError {
    ApiError::NotFound(format!("object {bucket}/{name} not found"))
}

impl Storage for MemoryBackend {
    fn create_bucket(&self, name: &str, attrs: BucketAttrs) -> OpFuture<'_, Bucket> {
        let name = name.to_string();
        Box::pin(async move {
            let mut buckets = self.buckets.write().await;
            if let Some(entry) = buckets.get(&name) {
                if entry.bucket.attrs == attrs {
                    return Ok(entry.bucket.clone());
                }
                return Err(ApiError::AlreadyExists(format!(
                    "bucket {name} already exists with different attributes"
                )));
            }
            let bucket = Bucket {
                name: name.clone(),
                time_created: chrono::Utc::now(),
                attrs,
            };
            buckets.insert(
                name,
                BucketEntry {
                    bucket: bucket.clone(),
                    objects: BTreeMap::new(),
                },
            );
            Ok(bucket)
        })
    }

    fn list_buckets(&self) -> OpFuture<'_, Vec<Bucket>> {
        Box::pin(async move {
            let buckets = self.buckets.read().await;
            let mut all: Vec<Bucket> = buckets.values().map(|e| e.bucket.clone()).collect();
            all.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(all)
        })
    }

    fn get_bucket(&self, name: &str) -> OpFuture<'_, Bucket> {
        let name = name.to_string();
        Box::pin(async move {
            let buckets = self.buckets.read().await;
            buckets
                .get(&name)
                .map(|e| e.bucket.clone())
                .ok_or_else(|| bucket_not_found(&name))
        })
    }

    fn update_bucket(&self, name: &str, attrs: BucketAttrs) -> OpFuture<'_, Bucket> {
        let name = name.to_string();
        Box::pin(async move {
            let mut buckets = self.buckets.write().await;
            let entry = buckets.get_mut(&name).ok_or_else(|| bucket_not_found(&name))?;
            entry.bucket.attrs = attrs;
            Ok(entry.bucket.clone())
        })
    }

    fn delete_bucket(&self, name: &str) -> OpFuture<'_, ()> {
        let name = name.to_string();
        Box::pin(async move {
            let mut buckets = self.buckets.write().await;
            let entry = buckets.get(&name).ok_or_else(|| bucket_not_found(&name))?;
            if entry.has_live_objects() {
                return Err(ApiError::NotEmpty);
            }
            buckets.remove(&name);
            Ok(())
        })
    }

    fn create_object(
        &self,
        bucket: &str,
        name: &str,
        attrs: ObjectAttrs,
        content: ByteStream,
        preconditions: Preconditions,
    ) -> OpFuture<'_, PutResult> {
        let bucket = bucket.to_string();
        let name = name.to_string();
        Box::pin(async move {
            // Ingest outside the lock.
            let (buf, digests) = Self::collect(content).await?;
            self.commit(&bucket, &name, &attrs, buf, &digests, preconditions)
                .await
        })
    }

    fn get_object(&self, bucket: &str, name: &str) -> OpFuture<'_, ObjectMeta> {
        let bucket = bucket.to_string();
        let name = name.to_string();
        Box::pin(async move {
            let buckets = self.buckets.read().await;
            let entry = buckets.get(&bucket).ok_or_else(|| bucket_not_found(&bucket))?;
            entry
                .live(&name)
                .map(|s| s.meta.clone())
                .ok_or_else(|| object_not_found(&bucket, &name))
        })
    }

    fn get_object_generation(
        &self,
        bucket: &str,
        name: &str,
        generation: i64,
    ) -> OpFuture<'_, ObjectMeta> {
        let bucket = bucket.to_string();
        let name = name.to_string();
        Box::pin(async move {
            let buckets = self.buckets.read().await;
            let entry = buckets.get(&bucket).ok_or_else(|| bucket_not_found(&bucket))?;
            entry
                .objects
                .get(&name)
                .and_then(|generations| {
                    generations.iter().find(|s| s.meta.generation == generation)
                })
                .map(|s| s.meta.clone())
                .ok_or_else(|| object_not_found(&bucket, &name))
        })
    }

    fn open_object(
        &self,
        bucket: &str,
        name: &str,
        generation: Option<i64>,
    ) -> OpFuture<'_, ObjectHandle> {
        let bucket = bucket.to_string();
        let name = name.to_string();
        Box::pin(async move {
            let buckets = self.buckets.read().await;
            let entry = buckets.get(&bucket).ok_or_else(|| bucket_not_found(&bucket))?;
            let stored = match generation {
                Some(gen) => entry
                    .objects
                    .get(&name)
                    .and_then(|generations| generations.iter().find(|s| s.meta.generation == gen)),
                None => entry.live(&name),
            }
            .ok_or_else(|| object_not_found(&bucket, &name))?;

            // The cursor owns a cheap clone of the immutable buffer, so the
            // handle stays valid after the lock is released.
            Ok(ObjectHandle {
                meta: stored.meta.clone(),
                reader: Box::new(std::io::Cursor::new(stored.content.clone())),
            })
        })
    }

    fn list_objects(&self, bucket: &str, query: ListQuery) -> OpFuture<'_, Listing> {
        let bucket = bucket.to_string();
        Box::pin(async move {
            let buckets = self.buckets.read().await;
            let entry = buckets.get(&bucket).ok_or_else(|| bucket_not_found(&bucket))?;

            let mut objects = Vec::new();
            let mut prefixes = BTreeSet::new();

            for (name, generations) in entry.objects.range(query.prefix.clone()..) {
                if !name.starts_with(&query.prefix) {
                    break;
                }
                if let Some(common) = delimiter_cut(name, &query.prefix, &query.delimiter) {
                    prefixes.insert(common);
                    continue;
                }
                if query.versions {
                    // Append order is ascending generation; reverse for
                    // (name asc, generation desc).
                    objects.extend(generations.iter().rev().map(|s| s.meta.clone()));
                } else if let Some(live) = generations.last().filter(|s| !s.meta.deleted) {
                    objects.push(live.meta.clone());
                }
            }

            Ok(Listing {
                objects,
                prefixes: prefixes.into_iter().collect(),
            })
        })
    }

    fn delete_object(
        &self,
        bucket: &str,
        name: &str,
        generation: Option<i64>,
    ) -> OpFuture<'_, DeleteResult> {
        let bucket = bucket.to_string();
        let name = name.to_string();
        Box::pin(async move {
            let mut buckets = self.buckets.write().await;
            let entry = buckets
                .get_mut(&bucket)
                .ok_or_else(|| bucket_not_found(&bucket))?;

            if let Some(gen) = generation {
                let generations = entry
                    .objects
                    .get_mut(&name)
                    .ok_or_else(|| object_not_found(&bucket, &name))?;
                let idx = generations
                    .iter()
                    .position(|s| s.meta.generation == gen)
                    .ok_or_else(|| object_not_found(&bucket, &name))?;
                let removed = generations.remove(idx);
                if generations.is_empty() {
                    entry.objects.remove(&name);
                }
                return Ok(DeleteResult {
                    meta: removed.meta,
                    tombstoned: false,
                });
            }

            let live = entry
                .live(&name)
                .map(|s| s.meta.clone())
                .ok_or_else(|| object_not_found(&bucket, &name))?;

            if entry.bucket.attrs.versioning {
                let marker = live.tombstone(self.generations.next());
                entry
                    .objects
                    .get_mut(&name)
                    .expect("live generation implies entry")
                    .push(StoredObject {
                        meta: marker,
                        content: Bytes::new(),
                    });
                Ok(DeleteResult {
                    meta: live,
                    tombstoned: true,
                })
            } else {
                entry.objects.remove(&name);
                Ok(DeleteResult {
                    meta: live,
                    tombstoned: false,
                })
            }
        })
    }

    fn patch_object(
        &self,
        bucket: &str,
        name: &str,
        patch: ObjectPatch,
    ) -> OpFuture<'_, ObjectMeta> {
        let bucket = bucket.to_string();
        let name = name.to_string();
        Box::pin(async move {
            let mut buckets = self.buckets.write().await;
            let entry = buckets
                .get_mut(&bucket)
                .ok_or_else(|| bucket_not_found(&bucket))?;
            let stored = entry
                .objects
                .get_mut(&name)
                .and_then(|generations| generations.last_mut())
                .filter(|s| !s.meta.deleted)
                .ok_or_else(|| object_not_found(&bucket, &name))?;
            stored.meta.apply_patch(&patch);
            Ok(stored.meta.clone())
        })
    }

    fn update_object(
        &self,
        bucket: &str,
        name: &str,
        metadata: HashMap<String, String>,
    ) -> OpFuture<'_, ObjectMeta> {
        let bucket = bucket.to_string();
        let name = name.to_string();
        Box::pin(async move {
            let mut buckets = self.buckets.write().await;
            let entry = buckets
                .get_mut(&bucket)
                .ok_or_else(|| bucket_not_found(&bucket))?;
            let stored = entry
                .objects
                .get_mut(&name)
                .and_then(|generations| generations.last_mut())
                .filter(|s| !s.meta.deleted)
                .ok_or_else(|| object_not_found(&bucket, &name))?;
            stored.meta.replace_metadata(metadata);
            Ok(stored.meta.clone())
        })
    }

    fn compose_object(
        &self,
        bucket: &str,
        sources: &[String],
        dest: &str,
        attrs: ObjectAttrs,
        preconditions: Preconditions,
    ) -> OpFuture<'_, PutResult> {
        let bucket = bucket.to_string();
        let sources = sources.to_vec();
        let dest = dest.to_string();
        Box::pin(async move {
            check_compose_sources(&sources)?;

            // Concatenate under the reader lock so the composed content is
            // a consistent snapshot of its sources.
            let (content, digests) = {
                let buckets = self.buckets.read().await;
                let entry = buckets.get(&bucket).ok_or_else(|| bucket_not_found(&bucket))?;

                let mut tee = ChecksumTee::new();
                let mut buf = BytesMut::new();
                for source in &sources {
                    let stored = entry
                        .live(source)
                        .ok_or_else(|| object_not_found(&bucket, source))?;
                    tee.update(&stored.content);
                    buf.extend_from_slice(&stored.content);
                }
                (buf.freeze(), tee.finalize())
            };

            self.commit(&bucket, &dest, &attrs, content, &digests, preconditions)
                .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::types::bytes_stream;
    use tokio::io::{AsyncReadExt, AsyncSeekExt};

    fn backend() -> MemoryBackend {
        MemoryBackend::new()
    }

    async fn put(
        backend: &MemoryBackend,
        bucket: &str,
        name: &str,
        data: &[u8],
    ) -> Result<PutResult, ApiError> {
        backend
            .create_object(
                bucket,
                name,
                ObjectAttrs::default(),
                bytes_stream(Bytes::copy_from_slice(data)),
                Preconditions::default(),
            )
            .await
    }

    async fn read_all(handle: &mut ObjectHandle) -> Vec<u8> {
        let mut buf = Vec::new();
        handle.reader.read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn create_get_roundtrip() {
        let backend = backend();
        let result = put(&backend, "b", "hello.txt", b"hello world").await.unwrap();

        assert_eq!(result.meta.size, 11);
        assert_eq!(result.meta.md5_hash, crate::checksum::digest(b"hello world").md5_hash);
        assert_eq!(result.meta.crc32c, crate::checksum::digest(b"hello world").crc32c);
        assert_eq!(result.meta.etag, format!("\"{}\"", result.meta.md5_hash));
        assert_eq!(result.meta.metageneration, 1);

        let mut handle = backend.open_object("b", "hello.txt", None).await.unwrap();
        assert_eq!(read_all(&mut handle).await, b"hello world");
    }

    #[tokio::test]
    async fn zero_byte_object() {
        let backend = backend();
        let result = put(&backend, "b", "empty", b"").await.unwrap();
        assert_eq!(result.meta.size, 0);
        assert_eq!(result.meta.crc32c, "AAAAAA==");
        assert_eq!(result.meta.md5_hash, "1B2M2Y8AsgTpgAmY7PhCfg==");
    }

    #[tokio::test]
    async fn generations_strictly_increase() {
        let backend = backend();
        let first = put(&backend, "b", "o", b"v1").await.unwrap();
        let second = put(&backend, "b", "o", b"v2").await.unwrap();
        assert!(second.meta.generation > first.meta.generation);
    }

    #[tokio::test]
    async fn lazy_bucket_creation() {
        let backend = backend();
        put(&backend, "implicit", "o", b"data").await.unwrap();
        let bucket = backend.get_bucket("implicit").await.unwrap();
        assert_eq!(bucket.name, "implicit");
        assert!(!bucket.attrs.versioning);
    }

    #[tokio::test]
    async fn conditional_write() {
        let backend = backend();
        let current = put(&backend, "b", "o", b"v1").await.unwrap().meta.generation;

        // Stale generation fails.
        let stale = backend
            .create_object(
                "b",
                "o",
                ObjectAttrs::default(),
                bytes_stream(Bytes::from_static(b"v2")),
                Preconditions {
                    if_generation_match: Some(current - 1),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(stale, Err(ApiError::PreconditionFailed(_))));

        // Matching generation succeeds and advances.
        let fresh = backend
            .create_object(
                "b",
                "o",
                ObjectAttrs::default(),
                bytes_stream(Bytes::from_static(b"v2")),
                Preconditions {
                    if_generation_match: Some(current),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(fresh.meta.generation > current);
    }

    #[tokio::test]
    async fn if_generation_match_zero_means_must_not_exist() {
        let backend = backend();
        let pre = Preconditions {
            if_generation_match: Some(0),
            ..Default::default()
        };

        backend
            .create_object(
                "b",
                "new",
                ObjectAttrs::default(),
                bytes_stream(Bytes::from_static(b"x")),
                pre,
            )
            .await
            .unwrap();

        let clash = backend
            .create_object(
                "b",
                "new",
                ObjectAttrs::default(),
                bytes_stream(Bytes::from_static(b"y")),
                pre,
            )
            .await;
        assert!(matches!(clash, Err(ApiError::PreconditionFailed(_))));
    }

    #[tokio::test]
    async fn get_missing_is_not_found_not_precondition() {
        let backend = backend();
        put(&backend, "b", "present", b"x").await.unwrap();
        assert!(matches!(
            backend.get_object("b", "absent").await,
            Err(ApiError::NotFound(_))
        ));
        assert!(matches!(
            backend.get_object("nope", "absent").await,
            Err(ApiError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_with_prefix() {
        let backend = backend();
        for name in ["a.txt", "photos/x.jpg", "photos/y.jpg", "z.txt"] {
            put(&backend, "b", name, b"data").await.unwrap();
        }

        let listing = backend
            .list_objects(
                "b",
                ListQuery {
                    prefix: "photos/".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let names: Vec<&str> = listing.objects.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["photos/x.jpg", "photos/y.jpg"]);
        assert!(listing.prefixes.is_empty());
    }

    #[tokio::test]
    async fn list_with_delimiter_partitions() {
        let backend = backend();
        for name in [
            "index.html",
            "photos/2023/a.jpg",
            "photos/2024/b.jpg",
            "videos/c.mp4",
        ] {
            put(&backend, "b", name, b"data").await.unwrap();
        }

        let listing = backend
            .list_objects(
                "b",
                ListQuery {
                    delimiter: "/".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let names: Vec<&str> = listing.objects.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["index.html"]);
        assert_eq!(listing.prefixes, ["photos/", "videos/"]);

        // Every object name contains no delimiter after the prefix; every
        // common prefix ends with the delimiter.
        for name in names {
            assert!(!name.contains('/'));
        }
        for prefix in &listing.prefixes {
            assert!(prefix.ends_with('/'));
        }

        let nested = backend
            .list_objects(
                "b",
                ListQuery {
                    prefix: "photos/".to_string(),
                    delimiter: "/".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(nested.objects.is_empty());
        assert_eq!(nested.prefixes, ["photos/2023/", "photos/2024/"]);
    }

    #[tokio::test]
    async fn list_names_sorted_bytewise() {
        let backend = backend();
        for name in ["b", "a/c", "a!", "a"] {
            put(&backend, "b", name, b"x").await.unwrap();
        }
        let listing = backend.list_objects("b", ListQuery::default()).await.unwrap();
        let names: Vec<&str> = listing.objects.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["a", "a!", "a/c", "b"]);
    }

    #[tokio::test]
    async fn awkward_names_roundtrip() {
        let backend = backend();
        let names = [
            "dir/sub/file.txt",
            "with space.txt",
            "percent%20sign",
            "ünïcode-名前.bin",
        ];
        for name in names {
            put(&backend, "b", name, name.as_bytes()).await.unwrap();
        }
        let listing = backend.list_objects("b", ListQuery::default()).await.unwrap();
        assert_eq!(listing.objects.len(), names.len());
        for name in names {
            let mut handle = backend.open_object("b", name, None).await.unwrap();
            assert_eq!(read_all(&mut handle).await, name.as_bytes());
        }
    }

    #[tokio::test]
    async fn unversioned_delete_removes() {
        let backend = backend();
        put(&backend, "b", "o", b"data").await.unwrap();

        let result = backend.delete_object("b", "o", None).await.unwrap();
        assert!(!result.tombstoned);
        assert!(matches!(
            backend.get_object("b", "o").await,
            Err(ApiError::NotFound(_))
        ));
        assert!(matches!(
            backend.delete_object("b", "o", None).await,
            Err(ApiError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn versioned_delete_and_history() {
        let backend = backend();
        backend
            .create_bucket(
                "vb",
                BucketAttrs {
                    versioning: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let g1 = put(&backend, "vb", "k", b"v1").await.unwrap().meta.generation;
        let second = put(&backend, "vb", "k", b"v2").await.unwrap();
        let g2 = second.meta.generation;
        // Overwrite of the live generation on a versioned bucket archives it.
        assert_eq!(second.archived.as_ref().map(|m| m.generation), Some(g1));

        let result = backend.delete_object("vb", "k", None).await.unwrap();
        assert!(result.tombstoned);

        assert!(matches!(
            backend.get_object("vb", "k").await,
            Err(ApiError::NotFound(_))
        ));

        let mut h1 = backend.open_object("vb", "k", Some(g1)).await.unwrap();
        assert_eq!(read_all(&mut h1).await, b"v1");
        let mut h2 = backend.open_object("vb", "k", Some(g2)).await.unwrap();
        assert_eq!(read_all(&mut h2).await, b"v2");

        let listing = backend
            .list_objects(
                "vb",
                ListQuery {
                    versions: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(listing.objects.len(), 3);
        // Ordered by generation descending: tombstone first.
        assert!(listing.objects[0].deleted);
        assert_eq!(listing.objects[1].generation, g2);
        assert_eq!(listing.objects[2].generation, g1);

        // A fresh write shadows the tombstone.
        put(&backend, "vb", "k", b"v3").await.unwrap();
        let live = backend.get_object("vb", "k").await.unwrap();
        assert_eq!(live.size, 2);
        assert!(!live.deleted);
    }

    #[tokio::test]
    async fn delete_specific_generation() {
        let backend = backend();
        backend
            .create_bucket(
                "vb",
                BucketAttrs {
                    versioning: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let g1 = put(&backend, "vb", "k", b"v1").await.unwrap().meta.generation;
        let g2 = put(&backend, "vb", "k", b"v2").await.unwrap().meta.generation;

        backend.delete_object("vb", "k", Some(g1)).await.unwrap();
        assert!(matches!(
            backend.get_object_generation("vb", "k", g1).await,
            Err(ApiError::NotFound(_))
        ));
        assert_eq!(backend.get_object("vb", "k").await.unwrap().generation, g2);
    }

    #[tokio::test]
    async fn patch_merges_and_bumps_metageneration() {
        let backend = backend();
        let mut attrs = ObjectAttrs::default();
        attrs.metadata.insert("keep".into(), "old".into());
        attrs.metadata.insert("drop".into(), "old".into());
        backend
            .create_object(
                "b",
                "o",
                attrs,
                bytes_stream(Bytes::from_static(b"x")),
                Preconditions::default(),
            )
            .await
            .unwrap();

        let mut patch = ObjectPatch::default();
        patch.metadata.insert("keep".into(), Some("new".into()));
        patch.metadata.insert("drop".into(), None);
        patch.metadata.insert("added".into(), Some("yes".into()));
        patch.content_type = Some("text/plain".into());

        let updated = backend.patch_object("b", "o", patch).await.unwrap();
        assert_eq!(updated.metageneration, 2);
        assert_eq!(updated.metadata.get("keep").map(String::as_str), Some("new"));
        assert_eq!(updated.metadata.get("added").map(String::as_str), Some("yes"));
        assert!(!updated.metadata.contains_key("drop"));
        assert_eq!(updated.content_type, "text/plain");

        // Patch result matches a subsequent get.
        let fetched = backend.get_object("b", "o").await.unwrap();
        assert_eq!(fetched.metadata, updated.metadata);
        assert_eq!(fetched.metageneration, 2);
    }

    #[tokio::test]
    async fn update_replaces_metadata() {
        let backend = backend();
        let mut attrs = ObjectAttrs::default();
        attrs.metadata.insert("old".into(), "x".into());
        backend
            .create_object(
                "b",
                "o",
                attrs,
                bytes_stream(Bytes::from_static(b"x")),
                Preconditions::default(),
            )
            .await
            .unwrap();

        let mut replacement = HashMap::new();
        replacement.insert("only".to_string(), "this".to_string());
        let updated = backend.update_object("b", "o", replacement).await.unwrap();
        assert_eq!(updated.metageneration, 2);
        assert!(!updated.metadata.contains_key("old"));
        assert_eq!(updated.metadata.get("only").map(String::as_str), Some("this"));
    }

    #[tokio::test]
    async fn compose_concatenates() {
        let backend = backend();
        put(&backend, "b", "a", b"foo").await.unwrap();
        put(&backend, "b", "b", b"bar").await.unwrap();

        let composed = backend
            .compose_object(
                "b",
                &["a".to_string(), "b".to_string()],
                "c",
                ObjectAttrs::default(),
                Preconditions::default(),
            )
            .await
            .unwrap();

        assert_eq!(composed.meta.size, 6);
        let expected = crate::checksum::digest(b"foobar");
        assert_eq!(composed.meta.crc32c, expected.crc32c);
        assert_eq!(composed.meta.md5_hash, expected.md5_hash);

        let mut handle = backend.open_object("b", "c", None).await.unwrap();
        assert_eq!(read_all(&mut handle).await, b"foobar");
    }

    #[tokio::test]
    async fn compose_rejects_too_many_and_missing_sources() {
        let backend = backend();
        put(&backend, "b", "a", b"x").await.unwrap();

        let too_many: Vec<String> = (0..33).map(|i| format!("s{i}")).collect();
        assert!(matches!(
            backend
                .compose_object("b", &too_many, "c", ObjectAttrs::default(), Preconditions::default())
                .await,
            Err(ApiError::Invalid(_))
        ));

        assert!(matches!(
            backend
                .compose_object(
                    "b",
                    &["a".to_string(), "missing".to_string()],
                    "c",
                    ObjectAttrs::default(),
                    Preconditions::default(),
                )
                .await,
            Err(ApiError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn bucket_create_idempotent_or_conflict() {
        let backend = backend();
        let attrs = BucketAttrs {
            location: "EU".to_string(),
            ..Default::default()
        };
        backend.create_bucket("b", attrs.clone()).await.unwrap();
        // Same attrs: idempotent.
        backend.create_bucket("b", attrs).await.unwrap();
        // Conflicting attrs: rejected.
        let conflict = backend
            .create_bucket(
                "b",
                BucketAttrs {
                    location: "US".to_string(),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(conflict, Err(ApiError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn delete_bucket_requires_empty() {
        let backend = backend();
        put(&backend, "b", "o", b"x").await.unwrap();

        assert!(matches!(
            backend.delete_bucket("b").await,
            Err(ApiError::NotEmpty)
        ));

        backend.delete_object("b", "o", None).await.unwrap();
        backend.delete_bucket("b").await.unwrap();
        assert!(matches!(
            backend.get_bucket("b").await,
            Err(ApiError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn reader_survives_overwrite() {
        let backend = backend();
        put(&backend, "b", "o", b"original").await.unwrap();
        let mut handle = backend.open_object("b", "o", None).await.unwrap();

        put(&backend, "b", "o", b"replaced").await.unwrap();

        // The checked-out handle still reads the original content.
        assert_eq!(read_all(&mut handle).await, b"original");
    }

    #[tokio::test]
    async fn reader_is_seekable() {
        let backend = backend();
        put(&backend, "b", "o", b"0123456789").await.unwrap();
        let mut handle = backend.open_object("b", "o", None).await.unwrap();

        handle
            .reader
            .seek(std::io::SeekFrom::Start(4))
            .await
            .unwrap();
        let mut buf = [0u8; 3];
        handle.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"456");
    }
}
