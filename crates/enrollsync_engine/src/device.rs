//! Device identity and the last-sync watermark.
//!
//! Both live in the store's metadata area so they survive restarts. The
//! device identifier is written once; the watermark is written by the
//! reconciler inside its transaction.

use crate::store::{LocalStore, StoreError, StoreResult};
use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

/// Metadata key of the device identifier.
pub const DEVICE_ID_KEY: &str = "sync.device_id";

/// Metadata key of the last-sync watermark.
pub const LAST_SYNC_KEY: &str = "sync.last_sync";

/// Returns the persisted device identifier, generating it on first use.
pub fn load_or_create_device_id<S: LocalStore + ?Sized>(store: &S) -> StoreResult<String> {
    if let Some(existing) = store.get_meta(DEVICE_ID_KEY)? {
        return Ok(existing);
    }

    let device_id = Uuid::new_v4().to_string();
    store.put_meta(DEVICE_ID_KEY, &device_id)?;
    info!(%device_id, "generated device identifier");
    Ok(device_id)
}

/// Reads the watermark of the last successful sync.
pub fn last_sync<S: LocalStore + ?Sized>(store: &S) -> StoreResult<Option<DateTime<Utc>>> {
    store
        .get_meta(LAST_SYNC_KEY)?
        .map(|raw| parse_watermark(&raw))
        .transpose()
}

/// Formats a watermark for storage.
pub fn format_watermark(watermark: DateTime<Utc>) -> String {
    watermark.to_rfc3339()
}

fn parse_watermark(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidState(format!("bad sync watermark {raw:?}: {e}")))
}
