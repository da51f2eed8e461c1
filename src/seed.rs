//! Startup seeder.
//!
//! Walks a local directory tree and primes the backend: each first-level
//! subdirectory becomes a bucket, and every file below it becomes one
//! object whose name is the `/`-joined path relative to the bucket
//! directory.  Empty subdirectories yield empty buckets.  Unreadable
//! entries are skipped with a warning.

use std::path::Path;

use bytes::Bytes;
use tracing::{info, warn};

use crate::backend::store::Storage;
use crate::backend::types::{bytes_stream, BucketAttrs, ObjectAttrs, Preconditions};
use crate::errors::ApiError;

/// What the seeder loaded.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SeedSummary {
    pub buckets: usize,
    pub objects: usize,
}

/// Prime `backend` from `dir`.  One-shot; also invoked by the internal
/// reseed endpoint.
pub async fn seed_from_directory(
    backend: &dyn Storage,
    dir: &Path,
    location: &str,
) -> Result<SeedSummary, ApiError> {
    let mut summary = SeedSummary::default();

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            return Err(ApiError::Internal(anyhow::anyhow!(
                "reading seed directory {}: {e}",
                dir.display()
            )))
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("skipping unreadable seed entry: {e}");
                continue;
            }
        };
        let path = entry.path();
        if !path.is_dir() {
            // Only first-level directories name buckets.
            continue;
        }
        let Some(bucket) = entry.file_name().to_str().map(str::to_string) else {
            warn!("skipping seed directory with non-UTF-8 name {path:?}");
            continue;
        };

        backend
            .create_bucket(
                &bucket,
                BucketAttrs {
                    location: location.to_string(),
                    ..Default::default()
                },
            )
            .await?;
        summary.buckets += 1;

        summary.objects += seed_bucket(backend, &bucket, &path).await?;
    }

    info!(
        "seeded {} buckets with {} objects from {}",
        summary.buckets,
        summary.objects,
        dir.display()
    );
    Ok(summary)
}

/// Recursively flatten one bucket directory into objects.
async fn seed_bucket(
    backend: &dyn Storage,
    bucket: &str,
    bucket_dir: &Path,
) -> Result<usize, ApiError> {
    let mut loaded = 0;
    let mut pending = vec![bucket_dir.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("skipping unreadable seed directory {dir:?}: {e}");
                continue;
            }
        };
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("skipping unreadable seed entry: {e}");
                    continue;
                }
            };
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
                continue;
            }

            // Dangling symlinks and unreadable files are skipped.
            let data = match std::fs::read(&path) {
                Ok(data) => data,
                Err(e) => {
                    warn!("skipping unreadable seed file {path:?}: {e}");
                    continue;
                }
            };

            let Some(name) = object_name(bucket_dir, &path) else {
                warn!("skipping seed file with non-UTF-8 path {path:?}");
                continue;
            };

            backend
                .create_object(
                    bucket,
                    &name,
                    ObjectAttrs::default(),
                    bytes_stream(Bytes::from(data)),
                    Preconditions::default(),
                )
                .await?;
            loaded += 1;
        }
    }

    Ok(loaded)
}

/// Object name: path relative to the bucket directory, with platform
/// separators normalized to `/`.
fn object_name(bucket_dir: &Path, file: &Path) -> Option<String> {
    let relative = file.strip_prefix(bucket_dir).ok()?;
    let parts: Option<Vec<&str>> = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect();
    Some(parts?.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::backend::types::ListQuery;

    fn write(path: &Path, content: &[u8]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn seeds_buckets_and_flattened_objects() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join("sample-bucket/some_file.txt"),
            b"Some amazing content to be loaded",
        );
        write(&dir.path().join("sample-bucket/nested/deep.txt"), b"deep");
        std::fs::create_dir_all(dir.path().join("empty-bucket")).unwrap();
        // Stray top-level file: not a bucket, ignored.
        write(&dir.path().join("stray.txt"), b"x");

        let backend = MemoryBackend::new();
        let summary = seed_from_directory(&backend, dir.path(), "US").await.unwrap();
        assert_eq!(summary, SeedSummary { buckets: 2, objects: 2 });

        let buckets = backend.list_buckets().await.unwrap();
        let names: Vec<&str> = buckets.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, ["empty-bucket", "sample-bucket"]);
        assert_eq!(buckets[0].attrs.location, "US");

        let listing = backend
            .list_objects("sample-bucket", ListQuery::default())
            .await
            .unwrap();
        let objects: Vec<&str> = listing.objects.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(objects, ["nested/deep.txt", "some_file.txt"]);

        let meta = backend
            .get_object("sample-bucket", "some_file.txt")
            .await
            .unwrap();
        assert_eq!(meta.size, 33);
    }

    #[tokio::test]
    async fn empty_directory_seeds_empty_bucket() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("lonely")).unwrap();

        let backend = MemoryBackend::new();
        let summary = seed_from_directory(&backend, dir.path(), "US").await.unwrap();
        assert_eq!(summary, SeedSummary { buckets: 1, objects: 0 });

        let listing = backend.list_objects("lonely", ListQuery::default()).await.unwrap();
        assert!(listing.objects.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dangling_symlink_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("b/ok.txt"), b"fine");
        std::os::unix::fs::symlink(
            dir.path().join("b/never-existed"),
            dir.path().join("b/dangling"),
        )
        .unwrap();

        let backend = MemoryBackend::new();
        let summary = seed_from_directory(&backend, dir.path(), "US").await.unwrap();
        assert_eq!(summary.objects, 1);
        assert!(backend.get_object("b", "ok.txt").await.is_ok());
    }

    #[tokio::test]
    async fn reseeding_is_idempotent_for_content() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("b/f.txt"), b"data");

        let backend = MemoryBackend::new();
        seed_from_directory(&backend, dir.path(), "US").await.unwrap();
        let first = backend.get_object("b", "f.txt").await.unwrap();

        seed_from_directory(&backend, dir.path(), "US").await.unwrap();
        let second = backend.get_object("b", "f.txt").await.unwrap();
        assert_eq!(first.md5_hash, second.md5_hash);
        assert!(second.generation > first.generation);
    }
}
