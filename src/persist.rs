//! Durable-state plumbing: small JSON documents on an object store.
//!
//! Ring topology, migration jobs and transaction decisions are all persisted
//! as individual JSON documents. Writers that race across processes go
//! through conditional puts (`Create` for first write, `Update` pinned to
//! the last seen etag) with conflicts mapped to [`Error::Conflict`] so the
//! caller can reload and retry.

use crate::{Error, Result};
use bytes::Bytes;
use futures::StreamExt;
use metrics::counter;
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Maximum number of CAS retries for atomic operations
pub(crate) const MAX_CAS_RETRIES: u32 = 5;

/// Base backoff duration in milliseconds for exponential backoff
pub(crate) const BASE_BACKOFF_MS: u64 = 100;

/// CAS retry loop with exponential backoff on conflict.
///
/// The body is an async block performing one load-modify-save cycle.
/// Return `Ok(value)` on success, `Err(Error::Conflict)` to trigger retry,
/// or any other `Err` to abort immediately.
macro_rules! cas_retry {
    ($body:block) => {{
        let mut __cas_result = Err($crate::Error::TooManyRetries);
        for __cas_attempt in 0..$crate::persist::MAX_CAS_RETRIES {
            match (async $body).await {
                Ok(value) => {
                    __cas_result = Ok(value);
                    break;
                }
                Err($crate::Error::Conflict) => {
                    let backoff_ms =
                        $crate::persist::BASE_BACKOFF_MS * 2_u64.pow(__cas_attempt);
                    metrics::counter!(
                        "ringmaster_cas_retries_total",
                        "service" => $crate::telemetry::service(),
                        "run_id" => $crate::telemetry::run_id()
                    )
                    .increment(1);
                    tracing::debug!(
                        attempt = __cas_attempt,
                        backoff_ms,
                        "CAS conflict, retrying"
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                }
                Err(e) => {
                    __cas_result = Err(e);
                    break;
                }
            }
        }
        __cas_result
    }};
}

pub(crate) use cas_retry;

pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(BASE_BACKOFF_MS * 2_u64.pow(attempt))
}

/// Unconditional JSON write (single-writer documents).
pub(crate) async fn put_json<T: Serialize>(
    store: &Arc<dyn ObjectStore>,
    path: &Path,
    value: &T,
) -> Result<()> {
    let json = serde_json::to_vec(value)?;
    store.put(path, PutPayload::from(Bytes::from(json))).await?;
    Ok(())
}

/// Conditional JSON write. `expected_etag == None` means the document must
/// not exist yet; otherwise the put is pinned to the last observed etag.
/// Losing the race maps to [`Error::Conflict`]; the caller reloads and
/// retries (usually via `cas_retry!`).
pub(crate) async fn put_json_cas<T: Serialize>(
    store: &Arc<dyn ObjectStore>,
    path: &Path,
    value: &T,
    expected_etag: Option<&str>,
    operation: &str,
) -> Result<Option<String>> {
    let json = serde_json::to_vec(value)?;
    let opts = match expected_etag {
        None => PutOptions {
            mode: PutMode::Create,
            ..Default::default()
        },
        Some(etag) => PutOptions {
            mode: PutMode::Update(object_store::UpdateVersion {
                e_tag: Some(etag.to_string()),
                version: None,
            }),
            ..Default::default()
        },
    };

    match store
        .put_opts(path, PutPayload::from(Bytes::from(json)), opts)
        .await
    {
        Ok(result) => {
            counter!(
                "ringmaster_cas_attempts_total",
                "service" => crate::telemetry::service(),
                "run_id" => crate::telemetry::run_id(),
                "operation" => operation.to_string(),
                "result" => "success"
            )
            .increment(1);
            Ok(result.e_tag)
        }
        Err(object_store::Error::AlreadyExists { .. }) => {
            counter!(
                "ringmaster_cas_attempts_total",
                "service" => crate::telemetry::service(),
                "run_id" => crate::telemetry::run_id(),
                "operation" => operation.to_string(),
                "result" => "conflict"
            )
            .increment(1);
            debug!(%path, operation, "create raced with another writer");
            Err(Error::Conflict)
        }
        Err(object_store::Error::Precondition { .. }) => {
            counter!(
                "ringmaster_cas_attempts_total",
                "service" => crate::telemetry::service(),
                "run_id" => crate::telemetry::run_id(),
                "operation" => operation.to_string(),
                "result" => "conflict"
            )
            .increment(1);
            debug!(%path, operation, "etag moved under conditional update");
            Err(Error::Conflict)
        }
        Err(e) => Err(e.into()),
    }
}

/// Load a JSON document; absent documents are `None`.
pub(crate) async fn load_json<T: DeserializeOwned>(
    store: &Arc<dyn ObjectStore>,
    path: &Path,
) -> Result<Option<T>> {
    match load_json_versioned(store, path).await? {
        Some((value, _etag)) => Ok(Some(value)),
        None => Ok(None),
    }
}

/// Load a JSON document together with its etag for a later conditional put.
pub(crate) async fn load_json_versioned<T: DeserializeOwned>(
    store: &Arc<dyn ObjectStore>,
    path: &Path,
) -> Result<Option<(T, Option<String>)>> {
    match store.get(path).await {
        Ok(result) => {
            let etag = result.meta.e_tag.clone();
            let bytes = result.bytes().await?;
            let value: T = serde_json::from_slice(&bytes)?;
            Ok(Some((value, etag)))
        }
        Err(object_store::Error::NotFound { .. }) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Delete a document, tolerating concurrent deletion.
pub(crate) async fn delete_quiet(store: &Arc<dyn ObjectStore>, path: &Path) -> Result<()> {
    match store.delete(path).await {
        Ok(_) | Err(object_store::Error::NotFound { .. }) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// All document paths under a prefix, sorted for deterministic iteration.
pub(crate) async fn list_prefix(
    store: &Arc<dyn ObjectStore>,
    prefix: &Path,
) -> Result<Vec<Path>> {
    let mut stream = store.list(Some(prefix));
    let mut paths = Vec::new();
    while let Some(meta) = stream.next().await {
        paths.push(meta?.location);
    }
    paths.sort();
    Ok(paths)
}
