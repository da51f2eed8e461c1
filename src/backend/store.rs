//! Abstract storage backend trait.
//!
//! Both variants (`memory`, `filesystem`) satisfy this one capability
//! contract.  Methods return pinned futures so the trait stays
//! object-safe and can be shared behind `Arc<dyn Storage>`.
//!
//! Failure kinds are typed ([`ApiError`]): a precondition failure is
//! distinct from a missing object, and the dispatcher maps each kind to
//! its HTTP envelope without inspecting messages.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use super::types::{
    Bucket, BucketAttrs, ByteStream, DeleteResult, ListQuery, Listing, ObjectAttrs, ObjectHandle,
    ObjectMeta, ObjectPatch, Preconditions, PutResult,
};
use crate::errors::ApiError;

type OpFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ApiError>> + Send + 'a>>;

/// Async storage contract.
pub trait Storage: Send + Sync + 'static {
    // -- Buckets --------------------------------------------------------------

    /// Create a bucket.  Idempotent when the attributes match an existing
    /// bucket; `AlreadyExists` when they conflict.
    fn create_bucket(&self, name: &str, attrs: BucketAttrs) -> OpFuture<'_, Bucket>;

    /// All buckets, ordered by name.
    fn list_buckets(&self) -> OpFuture<'_, Vec<Bucket>>;

    fn get_bucket(&self, name: &str) -> OpFuture<'_, Bucket>;

    /// Replace the mutable bucket attributes.
    fn update_bucket(&self, name: &str, attrs: BucketAttrs) -> OpFuture<'_, Bucket>;

    /// Delete a bucket.  `NotEmpty` while live generations remain.
    fn delete_bucket(&self, name: &str) -> OpFuture<'_, ()>;

    // -- Objects --------------------------------------------------------------

    /// Stream `content` through the checksum tee and commit it as a new
    /// generation of `(bucket, name)`, evaluating `preconditions` against
    /// the live generation under the writer lock.  The bucket is created
    /// lazily when missing.
    fn create_object(
        &self,
        bucket: &str,
        name: &str,
        attrs: ObjectAttrs,
        content: ByteStream,
        preconditions: Preconditions,
    ) -> OpFuture<'_, PutResult>;

    /// Metadata of the live generation (newest non-tombstone).
    fn get_object(&self, bucket: &str, name: &str) -> OpFuture<'_, ObjectMeta>;

    /// Metadata of a specific generation.
    fn get_object_generation(
        &self,
        bucket: &str,
        name: &str,
        generation: i64,
    ) -> OpFuture<'_, ObjectMeta>;

    /// Check out content for reading.  `generation` of `None` resolves the
    /// live generation.  The returned reader is independent of backend
    /// locks and remains valid through concurrent overwrites.
    fn open_object(
        &self,
        bucket: &str,
        name: &str,
        generation: Option<i64>,
    ) -> OpFuture<'_, ObjectHandle>;

    /// Point-in-time listing snapshot, ordered by name (byte-wise
    /// ascending), ties broken by generation descending when versions are
    /// included.
    fn list_objects(&self, bucket: &str, query: ListQuery) -> OpFuture<'_, Listing>;

    /// Delete the live generation, or a specific one when `generation` is
    /// set.  Versioned buckets record a tombstone and retain history.
    fn delete_object(
        &self,
        bucket: &str,
        name: &str,
        generation: Option<i64>,
    ) -> OpFuture<'_, DeleteResult>;

    /// Merge-patch metadata on the live generation; bumps metageneration.
    fn patch_object(&self, bucket: &str, name: &str, patch: ObjectPatch)
        -> OpFuture<'_, ObjectMeta>;

    /// Full replace of user metadata on the live generation; bumps
    /// metageneration.
    fn update_object(
        &self,
        bucket: &str,
        name: &str,
        metadata: HashMap<String, String>,
    ) -> OpFuture<'_, ObjectMeta>;

    /// Concatenate up to 32 same-bucket sources into a new generation of
    /// `dest`, recomputing digests.
    fn compose_object(
        &self,
        bucket: &str,
        sources: &[String],
        dest: &str,
        attrs: ObjectAttrs,
        preconditions: Preconditions,
    ) -> OpFuture<'_, PutResult>;
}

/// Compose accepts at most this many source objects.
pub const MAX_COMPOSE_SOURCES: usize = 32;

/// Shared validation for compose source lists.
pub fn check_compose_sources(sources: &[String]) -> Result<(), ApiError> {
    if sources.is_empty() {
        return Err(ApiError::Invalid(
            "compose requires at least one source object".to_string(),
        ));
    }
    if sources.len() > MAX_COMPOSE_SOURCES {
        return Err(ApiError::Invalid(format!(
            "compose accepts at most {MAX_COMPOSE_SOURCES} source objects, got {}",
            sources.len()
        )));
    }
    Ok(())
}

/// Partition names matching `prefix` into (kept, common prefixes) at the
/// first `delimiter` occurrence after the prefix.  Returns `None` for a
/// name that folds into a common prefix, `Some(prefix)` being pushed by
/// the caller.
pub(crate) fn delimiter_cut(name: &str, prefix: &str, delimiter: &str) -> Option<String> {
    if delimiter.is_empty() {
        return None;
    }
    let rest = &name[prefix.len()..];
    rest.find(delimiter)
        .map(|idx| format!("{prefix}{}{delimiter}", &rest[..idx]))
}
