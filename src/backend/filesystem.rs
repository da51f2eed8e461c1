//! Filesystem storage backend.
//!
//! Layout under the configured root:
//!
//! ```text
//! <root>/<escaped bucket>/                 bucket directory
//! <root>/<escaped bucket>.bucket_meta     bucket attributes (JSON)
//! <root>/<escaped bucket>/<escaped name>        object bytes
//! <root>/<escaped bucket>/<escaped name>.meta   object attributes (JSON)
//! ```
//!
//! Object names keep their forward-slash semantics through URL escaping:
//! there are no nested directories, the filename is the full escaped
//! object name.  Metadata always lives in the `.meta` sibling file (one
//! storage mode per root).
//!
//! Writes follow an atomic protocol: stream to a uniquely named temp file
//! in the bucket directory through the checksum tee, sync, then rename
//! content followed by its metadata sibling.  A crash between the two
//! renames leaves a partial write, which the read path treats as missing
//! and cleans up.
//!
//! Versioning is rejected: this layout keeps no historical generations.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use futures_util::StreamExt;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::warn;

use super::store::{check_compose_sources, delimiter_cut, Storage};
use super::types::{
    Bucket, BucketAttrs, ByteStream, DeleteResult, GenerationCounter, ListQuery, Listing,
    ObjectAttrs, ObjectHandle, ObjectMeta, ObjectPatch, Preconditions, PutResult,
};
use crate::checksum::{ChecksumTee, Digests};
use crate::errors::ApiError;

type OpFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ApiError>> + Send + 'a>>;

/// Everything outside `[A-Za-z0-9_~-]` is escaped, including `.` and `/`,
/// so content filenames can never collide with `.meta` siblings or
/// `.tmp-*` spool files.
const FILENAME_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'~');

const BUCKET_META_SUFFIX: &str = ".bucket_meta";
const OBJECT_META_SUFFIX: &str = ".meta";
const TEMP_PREFIX: &str = ".tmp-";

fn escape(name: &str) -> String {
    utf8_percent_encode(name, FILENAME_SET).to_string()
}

fn unescape(escaped: &str) -> Result<String, ApiError> {
    percent_decode_str(escaped)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| ApiError::Invalid(format!("malformed escaped name {escaped}")))
}

fn bucket_not_found(name: &str) -> ApiError {
    ApiError::NotFound(format!("bucket {name} not found"))
}

fn object_not_found(bucket: &str, name: &str) -> ApiError {
    ApiError::NotFound(format!("object {bucket}/{name} not found"))
}

/// Filesystem storage backend rooted at a local directory.
pub struct FilesystemBackend {
    root: PathBuf,
    /// Guards bucket-map structure and metadata installation.  Byte
    /// ingestion happens to temp files outside this lock.
    lock: RwLock<()>,
    generations: GenerationCounter,
}

impl FilesystemBackend {
    /// Open (and create if needed) a backend rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, ApiError> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| ApiError::Internal(anyhow::anyhow!("creating root {root:?}: {e}")))?;
        Ok(Self {
            root,
            lock: RwLock::new(()),
            generations: GenerationCounter::new(),
        })
    }

    // -- Path helpers ---------------------------------------------------------

    fn bucket_dir(&self, bucket: &str) -> PathBuf {
        self.root.join(escape(bucket))
    }

    fn bucket_meta_path(&self, bucket: &str) -> PathBuf {
        self.root.join(format!("{}{BUCKET_META_SUFFIX}", escape(bucket)))
    }

    fn object_path(&self, bucket: &str, name: &str) -> PathBuf {
        self.bucket_dir(bucket).join(escape(name))
    }

    fn object_meta_path(&self, bucket: &str, name: &str) -> PathBuf {
        self.bucket_dir(bucket)
            .join(format!("{}{OBJECT_META_SUFFIX}", escape(name)))
    }

    fn temp_path(&self, bucket: &str) -> PathBuf {
        self.bucket_dir(bucket)
            .join(format!("{TEMP_PREFIX}{}", uuid::Uuid::new_v4()))
    }

    // -- Bucket records -------------------------------------------------------

    async fn read_bucket(&self, name: &str) -> Result<Bucket, ApiError> {
        let dir = self.bucket_dir(name);
        if !tokio::fs::try_exists(&dir).await? {
            return Err(bucket_not_found(name));
        }
        match tokio::fs::read(self.bucket_meta_path(name)).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|e| ApiError::Internal(anyhow::anyhow!("bucket meta for {name}: {e}"))),
            // A directory dropped into the root without its sidecar is
            // still a bucket with default attributes.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Bucket {
                name: name.to_string(),
                time_created: chrono::Utc::now(),
                attrs: BucketAttrs::default(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_bucket(&self, bucket: &Bucket) -> Result<(), ApiError> {
        let raw = serde_json::to_vec(bucket)
            .map_err(|e| ApiError::Internal(anyhow::anyhow!("encoding bucket meta: {e}")))?;
        let tmp = self
            .root
            .join(format!("{TEMP_PREFIX}{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, raw).await?;
        rename_over(&tmp, &self.bucket_meta_path(&bucket.name)).await?;
        Ok(())
    }

    /// Create the bucket directory (with default attributes) if missing.
    /// Called by the lazy-creation path of `create_object`.
    async fn ensure_bucket(&self, name: &str) -> Result<(), ApiError> {
        let _guard = self.lock.write().await;
        let dir = self.bucket_dir(name);
        if !tokio::fs::try_exists(&dir).await? {
            tokio::fs::create_dir_all(&dir).await?;
            self.write_bucket(&Bucket {
                name: name.to_string(),
                time_created: chrono::Utc::now(),
                attrs: BucketAttrs::default(),
            })
            .await?;
        }
        Ok(())
    }

    // -- Object records -------------------------------------------------------

    /// Read the metadata sibling for `(bucket, name)`, cleaning up partial
    /// writes: content without metadata (or the reverse) is treated as
    /// missing.
    async fn read_meta(&self, bucket: &str, name: &str) -> Result<ObjectMeta, ApiError> {
        if !tokio::fs::try_exists(self.bucket_dir(bucket)).await? {
            return Err(bucket_not_found(bucket));
        }
        let meta_path = self.object_meta_path(bucket, name);
        let content_path = self.object_path(bucket, name);

        let raw = match tokio::fs::read(&meta_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if tokio::fs::try_exists(&content_path).await? {
                    warn!("cleaning up partial write {content_path:?}");
                    let _ = tokio::fs::remove_file(&content_path).await;
                }
                return Err(object_not_found(bucket, name));
            }
            Err(e) => return Err(e.into()),
        };

        if !tokio::fs::try_exists(&content_path).await? {
            warn!("cleaning up orphaned metadata {meta_path:?}");
            let _ = tokio::fs::remove_file(&meta_path).await;
            return Err(object_not_found(bucket, name));
        }

        serde_json::from_slice(&raw)
            .map_err(|e| ApiError::Internal(anyhow::anyhow!("object meta for {bucket}/{name}: {e}")))
    }

    async fn write_meta(&self, meta: &ObjectMeta) -> Result<(), ApiError> {
        let raw = serde_json::to_vec(meta)
            .map_err(|e| ApiError::Internal(anyhow::anyhow!("encoding object meta: {e}")))?;
        let tmp = self.temp_path(&meta.bucket);
        tokio::fs::write(&tmp, raw).await?;
        rename_over(&tmp, &self.object_meta_path(&meta.bucket, &meta.name)).await?;
        Ok(())
    }

    /// Spool a content stream to a temp file in the bucket directory,
    /// teeing it through the checksum engine.  Returns the temp path and
    /// the digests.  Runs outside the backend lock.
    async fn spool(
        &self,
        bucket: &str,
        mut content: ByteStream,
    ) -> Result<(PathBuf, Digests), ApiError> {
        let tmp = self.temp_path(bucket);
        let mut file = tokio::fs::File::create(&tmp).await?;
        let mut tee = ChecksumTee::new();

        while let Some(chunk) = content.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    // Aborted stream: discard the spool file.
                    drop(file);
                    let _ = tokio::fs::remove_file(&tmp).await;
                    return Err(e.into());
                }
            };
            tee.update(&chunk);
            if let Err(e) = file.write_all(&chunk).await {
                drop(file);
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(e.into());
            }
        }
        file.sync_all().await?;
        Ok((tmp, tee.finalize()))
    }

    /// Install a spooled temp file as the new generation of
    /// `(bucket, name)` under the writer lock.
    async fn commit(
        &self,
        bucket: &str,
        name: &str,
        attrs: &ObjectAttrs,
        spooled: PathBuf,
        digests: &Digests,
        preconditions: Preconditions,
    ) -> Result<PutResult, ApiError> {
        let _guard = self.lock.write().await;

        let live = match self.read_meta(bucket, name).await {
            Ok(meta) => Some(meta),
            Err(ApiError::NotFound(_)) => None,
            Err(e) => {
                let _ = tokio::fs::remove_file(&spooled).await;
                return Err(e);
            }
        };
        if let Err(e) = preconditions.check(live.as_ref()) {
            let _ = tokio::fs::remove_file(&spooled).await;
            return Err(e);
        }

        let meta = ObjectMeta::new(bucket, name, attrs, digests, self.generations.next());

        // Content first, then metadata; the read path treats the gap as a
        // partial write.
        rename_over(&spooled, &self.object_path(bucket, name)).await?;
        self.write_meta(&meta).await?;

        Ok(PutResult {
            meta,
            archived: None,
        })
    }

    /// Names of all objects in a bucket, unescaped and sorted byte-wise.
    async fn object_names(&self, bucket: &str) -> Result<Vec<String>, ApiError> {
        let dir = self.bucket_dir(bucket);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(bucket_not_found(bucket));
            }
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if file_name.ends_with(OBJECT_META_SUFFIX) || file_name.starts_with(TEMP_PREFIX) {
                continue;
            }
            match unescape(file_name) {
                Ok(name) => names.push(name),
                Err(_) => warn!("skipping unparseable entry {file_name} in bucket {bucket}"),
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Rename `src` over `dst`, replacing any existing file.  Where the
/// platform refuses to rename over an open destination, the old file is
/// first moved aside so concurrent readers keep their handle on the
/// original bytes, then unlinked.
async fn rename_over(src: &Path, dst: &Path) -> std::io::Result<()> {
    match tokio::fs::rename(src, dst).await {
        Ok(()) => Ok(()),
        Err(original) => {
            if !tokio::fs::try_exists(dst).await.unwrap_or(false) {
                return Err(original);
            }
            let parent = dst.parent().unwrap_or_else(|| Path::new("."));
            let aside = parent.join(format!("{TEMP_PREFIX}{}", uuid::Uuid::new_v4()));
            tokio::fs::rename(dst, &aside).await?;
            tokio::fs::rename(src, dst).await?;
            let _ = tokio::fs::remove_file(&aside).await;
            Ok(())
        }
    }
}

impl Storage for FilesystemBackend {
    fn create_bucket(&self, name: &str, attrs: BucketAttrs) -> OpFuture<'_, Bucket> {
        let name = name.to_string();
        Box::pin(async move {
            if attrs.versioning {
                return Err(ApiError::NotSupported(
                    "the filesystem backend does not support object versioning".to_string(),
                ));
            }
            let _guard = self.lock.write().await;

            let dir = self.bucket_dir(&name);
            if tokio::fs::try_exists(&dir).await? {
                let existing = self.read_bucket(&name).await?;
                if existing.attrs == attrs {
                    return Ok(existing);
                }
                return Err(ApiError::AlreadyExists(format!(
                    "bucket {name} already exists with different attributes"
                )));
            }

            tokio::fs::create_dir_all(&dir).await?;
            let bucket = Bucket {
                name: name.clone(),
                time_created: chrono::Utc::now(),
                attrs,
            };
            self.write_bucket(&bucket).await?;
            Ok(bucket)
        })
    }

    fn list_buckets(&self) -> OpFuture<'_, Vec<Bucket>> {
        Box::pin(async move {
            let _guard = self.lock.read().await;
            let mut entries = tokio::fs::read_dir(&self.root).await?;
            let mut buckets = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                if !entry.file_type().await?.is_dir() {
                    continue;
                }
                let file_name = entry.file_name();
                let Some(file_name) = file_name.to_str() else {
                    continue;
                };
                match unescape(file_name) {
                    Ok(name) => buckets.push(self.read_bucket(&name).await?),
                    Err(_) => warn!("skipping unparseable bucket directory {file_name}"),
                }
            }
            buckets.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(buckets)
        })
    }

    fn get_bucket(&self, name: &str) -> OpFuture<'_, Bucket> {
        let name = name.to_string();
        Box::pin(async move {
            let _guard = self.lock.read().await;
            self.read_bucket(&name).await
        })
    }

    fn update_bucket(&self, name: &str, attrs: BucketAttrs) -> OpFuture<'_, Bucket> {
        let name = name.to_string();
        Box::pin(async move {
            if attrs.versioning {
                return Err(ApiError::NotSupported(
                    "the filesystem backend does not support object versioning".to_string(),
                ));
            }
            let _guard = self.lock.write().await;
            let mut bucket = self.read_bucket(&name).await?;
            bucket.attrs = attrs;
            self.write_bucket(&bucket).await?;
            Ok(bucket)
        })
    }

    fn delete_bucket(&self, name: &str) -> OpFuture<'_, ()> {
        let name = name.to_string();
        Box::pin(async move {
            let _guard = self.lock.write().await;
            let names = self.object_names(&name).await?;
            if !names.is_empty() {
                return Err(ApiError::NotEmpty);
            }
            tokio::fs::remove_dir_all(self.bucket_dir(&name)).await?;
            let _ = tokio::fs::remove_file(self.bucket_meta_path(&name)).await;
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
            self.ensure_bucket(&bucket).await?;
            let (spooled, digests) = self.spool(&bucket, content).await?;
            self.commit(&bucket, &name, &attrs, spooled, &digests, preconditions)
                .await
        })
    }

    fn get_object(&self, bucket: &str, name: &str) -> OpFuture<'_, ObjectMeta> {
        let bucket = bucket.to_string();
        let name = name.to_string();
        Box::pin(async move {
            let _guard = self.lock.read().await;
            self.read_meta(&bucket, &name).await
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
            let _guard = self.lock.read().await;
            let meta = self.read_meta(&bucket, &name).await?;
            if meta.generation != generation {
                return Err(object_not_found(&bucket, &name));
            }
            Ok(meta)
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
            let meta = {
                let _guard = self.lock.read().await;
                let meta = self.read_meta(&bucket, &name).await?;
                if let Some(gen) = generation {
                    if meta.generation != gen {
                        return Err(object_not_found(&bucket, &name));
                    }
                }
                meta
            };

            // The open handle keeps reading the original inode even if the
            // object is renamed over afterwards.
            let file = match tokio::fs::File::open(self.object_path(&bucket, &name)).await {
                Ok(file) => file,
                // Deleted between the metadata read and the open.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(object_not_found(&bucket, &name));
                }
                Err(e) => return Err(e.into()),
            };
            Ok(ObjectHandle {
                meta,
                reader: Box::new(file),
            })
        })
    }

    fn list_objects(&self, bucket: &str, query: ListQuery) -> OpFuture<'_, Listing> {
        let bucket = bucket.to_string();
        Box::pin(async move {
            let _guard = self.lock.read().await;
            let names = self.object_names(&bucket).await?;

            let mut objects = Vec::new();
            let mut prefixes = BTreeSet::new();
            for name in names {
                if !name.starts_with(&query.prefix) {
                    continue;
                }
                if let Some(common) = delimiter_cut(&name, &query.prefix, &query.delimiter) {
                    prefixes.insert(common);
                    continue;
                }
                match self.read_meta(&bucket, &name).await {
                    Ok(meta) => objects.push(meta),
                    // Cleaned-up partial write racing the listing.
                    Err(ApiError::NotFound(_)) => continue,
                    Err(e) => return Err(e),
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
            let _guard = self.lock.write().await;
            let meta = self.read_meta(&bucket, &name).await?;
            if let Some(gen) = generation {
                if meta.generation != gen {
                    return Err(object_not_found(&bucket, &name));
                }
            }
            tokio::fs::remove_file(self.object_path(&bucket, &name)).await?;
            tokio::fs::remove_file(self.object_meta_path(&bucket, &name)).await?;
            Ok(DeleteResult {
                meta,
                tombstoned: false,
            })
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
            let _guard = self.lock.write().await;
            let mut meta = self.read_meta(&bucket, &name).await?;
            meta.apply_patch(&patch);
            self.write_meta(&meta).await?;
            Ok(meta)
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
            let _guard = self.lock.write().await;
            let mut meta = self.read_meta(&bucket, &name).await?;
            meta.replace_metadata(metadata);
            self.write_meta(&meta).await?;
            Ok(meta)
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

            {
                let _guard = self.lock.read().await;
                if !tokio::fs::try_exists(self.bucket_dir(&bucket)).await? {
                    return Err(bucket_not_found(&bucket));
                }
            }

            // Spool the concatenation outside the lock, holding the reader
            // lock only to resolve each source.
            let tmp = self.temp_path(&bucket);
            let mut out = tokio::fs::File::create(&tmp).await?;
            let mut tee = ChecksumTee::new();

            for source in &sources {
                let path = {
                    let _guard = self.lock.read().await;
                    self.read_meta(&bucket, source).await?;
                    self.object_path(&bucket, source)
                };
                let data = tokio::fs::read(&path).await?;
                tee.update(&data);
                if let Err(e) = out.write_all(&data).await {
                    drop(out);
                    let _ = tokio::fs::remove_file(&tmp).await;
                    return Err(e.into());
                }
            }
            out.sync_all().await?;
            drop(out);

            let digests = tee.finalize();
            self.commit(&bucket, &dest, &attrs, tmp, &digests, preconditions)
                .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::types::bytes_stream;
    use bytes::Bytes;
    use tokio::io::AsyncReadExt;

    fn backend() -> (tempfile::TempDir, FilesystemBackend) {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let backend = FilesystemBackend::new(dir.path()).expect("failed to create backend");
        (dir, backend)
    }

    async fn put(
        backend: &FilesystemBackend,
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
        let (_dir, backend) = backend();
        let result = put(&backend, "b", "hello.txt", b"hello world").await.unwrap();
        assert_eq!(result.meta.size, 11);
        assert_eq!(
            result.meta.md5_hash,
            crate::checksum::digest(b"hello world").md5_hash
        );

        let mut handle = backend.open_object("b", "hello.txt", None).await.unwrap();
        assert_eq!(read_all(&mut handle).await, b"hello world");
    }

    #[tokio::test]
    async fn flat_escaped_layout_on_disk() {
        let (dir, backend) = backend();
        put(&backend, "my-bucket", "nested/path/file.txt", b"x")
            .await
            .unwrap();

        let bucket_dir = dir.path().join("my-bucket");
        assert!(bucket_dir.is_dir());
        assert!(dir.path().join("my-bucket.bucket_meta").is_file());

        // No nested directories: the escaped full name is the filename.
        let escaped = "nested%2Fpath%2Ffile%2Etxt";
        assert!(bucket_dir.join(escaped).is_file());
        assert!(bucket_dir.join(format!("{escaped}.meta")).is_file());
    }

    #[tokio::test]
    async fn versioning_rejected() {
        let (_dir, backend) = backend();
        let attrs = BucketAttrs {
            versioning: true,
            ..Default::default()
        };
        assert!(matches!(
            backend.create_bucket("b", attrs).await,
            Err(ApiError::NotSupported(_))
        ));

        backend
            .create_bucket("b", BucketAttrs::default())
            .await
            .unwrap();
        let toggle = BucketAttrs {
            versioning: true,
            ..Default::default()
        };
        assert!(matches!(
            backend.update_bucket("b", toggle).await,
            Err(ApiError::NotSupported(_))
        ));
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let generation;
        {
            let backend = FilesystemBackend::new(dir.path()).unwrap();
            generation = put(&backend, "b", "keep.txt", b"persisted")
                .await
                .unwrap()
                .meta
                .generation;
        }

        let backend = FilesystemBackend::new(dir.path()).unwrap();
        let meta = backend.get_object("b", "keep.txt").await.unwrap();
        assert_eq!(meta.generation, generation);
        assert_eq!(meta.size, 9);

        let mut handle = backend.open_object("b", "keep.txt", None).await.unwrap();
        assert_eq!(read_all(&mut handle).await, b"persisted");

        // The generation counter stays strictly increasing across reopen.
        let next = put(&backend, "b", "keep.txt", b"again").await.unwrap();
        assert!(next.meta.generation > generation);
    }

    #[tokio::test]
    async fn partial_write_is_cleaned_up() {
        let (dir, backend) = backend();
        put(&backend, "b", "anchor", b"x").await.unwrap();

        // Simulate a crash between content rename and metadata rename.
        let orphan = dir.path().join("b").join(escape("orphan.bin"));
        std::fs::write(&orphan, b"partial").unwrap();

        assert!(matches!(
            backend.get_object("b", "orphan.bin").await,
            Err(ApiError::NotFound(_))
        ));
        assert!(!orphan.exists());

        // Partial writes do not appear in listings.
        let listing = backend.list_objects("b", ListQuery::default()).await.unwrap();
        let names: Vec<&str> = listing.objects.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["anchor"]);
    }

    #[tokio::test]
    async fn open_reader_survives_overwrite() {
        let (_dir, backend) = backend();
        put(&backend, "b", "o", b"original").await.unwrap();

        let mut handle = backend.open_object("b", "o", None).await.unwrap();
        put(&backend, "b", "o", b"replaced").await.unwrap();

        assert_eq!(read_all(&mut handle).await, b"original");

        let mut fresh = backend.open_object("b", "o", None).await.unwrap();
        assert_eq!(read_all(&mut fresh).await, b"replaced");
    }

    #[tokio::test]
    async fn preconditions_enforced() {
        let (_dir, backend) = backend();
        let current = put(&backend, "b", "o", b"v1").await.unwrap().meta.generation;

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

        // The stale write left no spool files behind.
        let listing = backend.list_objects("b", ListQuery::default()).await.unwrap();
        assert_eq!(listing.objects.len(), 1);

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
    async fn awkward_names_roundtrip() {
        let (_dir, backend) = backend();
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
        let mut listed: Vec<&str> = listing.objects.iter().map(|m| m.name.as_str()).collect();
        let mut expected: Vec<&str> = names.to_vec();
        expected.sort();
        listed.sort();
        assert_eq!(listed, expected);

        for name in names {
            let mut handle = backend.open_object("b", name, None).await.unwrap();
            assert_eq!(read_all(&mut handle).await, name.as_bytes());
        }
    }

    #[tokio::test]
    async fn list_with_delimiter() {
        let (_dir, backend) = backend();
        for name in ["index.html", "photos/a.jpg", "photos/b.jpg", "videos/c.mp4"] {
            put(&backend, "b", name, b"x").await.unwrap();
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
    }

    #[tokio::test]
    async fn delete_object_and_bucket() {
        let (_dir, backend) = backend();
        put(&backend, "b", "o", b"x").await.unwrap();

        assert!(matches!(
            backend.delete_bucket("b").await,
            Err(ApiError::NotEmpty)
        ));

        backend.delete_object("b", "o", None).await.unwrap();
        assert!(matches!(
            backend.get_object("b", "o").await,
            Err(ApiError::NotFound(_))
        ));

        backend.delete_bucket("b").await.unwrap();
        assert!(matches!(
            backend.get_bucket("b").await,
            Err(ApiError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_wrong_generation_is_not_found() {
        let (_dir, backend) = backend();
        let gen = put(&backend, "b", "o", b"x").await.unwrap().meta.generation;
        assert!(matches!(
            backend.delete_object("b", "o", Some(gen + 1)).await,
            Err(ApiError::NotFound(_))
        ));
        backend.delete_object("b", "o", Some(gen)).await.unwrap();
    }

    #[tokio::test]
    async fn patch_persists() {
        let (_dir, backend) = backend();
        put(&backend, "b", "o", b"x").await.unwrap();

        let mut patch = ObjectPatch::default();
        patch.metadata.insert("team".into(), Some("storage".into()));
        let patched = backend.patch_object("b", "o", patch).await.unwrap();
        assert_eq!(patched.metageneration, 2);

        let fetched = backend.get_object("b", "o").await.unwrap();
        assert_eq!(fetched.metadata.get("team").map(String::as_str), Some("storage"));
        assert_eq!(fetched.metageneration, 2);
    }

    #[tokio::test]
    async fn compose_concatenates() {
        let (_dir, backend) = backend();
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
    async fn bucket_meta_persists_attributes() {
        let (_dir, backend) = backend();
        let attrs = BucketAttrs {
            location: "EU".to_string(),
            default_event_based_hold: true,
            ..Default::default()
        };
        backend.create_bucket("tagged", attrs.clone()).await.unwrap();

        let bucket = backend.get_bucket("tagged").await.unwrap();
        assert_eq!(bucket.attrs, attrs);

        // Idempotent create with identical attrs.
        backend.create_bucket("tagged", attrs).await.unwrap();
    }
}
