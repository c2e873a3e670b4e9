//! In-memory [`OutboxStore`], used by unit tests and single-process
//! wiring where a real database isn't available.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;

use super::{OutboxRow, OutboxStatus, OutboxStore};

#[derive(Default)]
pub struct InMemoryOutboxStore {
    rows: Mutex<Vec<OutboxRow>>,
}

#[async_trait::async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn enqueue(&self, row: OutboxRow) -> Result<(), StoreError> {
        self.rows.lock().unwrap().push(row);
        Ok(())
    }

    async fn claim_batch(&self, batch_size: usize, max_attempts: u32, now: DateTime<Utc>) -> Result<Vec<OutboxRow>, StoreError> {
        let mut rows = self.rows.lock().unwrap();
        let mut eligible: Vec<usize> = rows
            .iter()
            .enumerate()
            .filter(|(_, r)| r.status == OutboxStatus::Pending && r.delayed_until <= now && r.attempt_count < max_attempts)
            .map(|(i, _)| i)
            .collect();
        eligible.sort_by_key(|&i| rows[i].delayed_until);
        eligible.truncate(batch_size);

        // Flip each claimed row to `Claimed` and bump `version` before
        // releasing the lock, under the same mutex guard that did the
        // filtering, so the flip is indivisible from the selection: a
        // second `claim_batch` call can't observe the row as still
        // `Pending` once this one has picked it.
        let mut claimed = Vec::with_capacity(eligible.len());
        for i in eligible {
            rows[i].status = OutboxStatus::Claimed;
            rows[i].version += 1;
            claimed.push(rows[i].clone());
        }
        Ok(claimed)
    }

    async fn mark_sent(&self, id: Uuid, expected_version: i64) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap();
        let row = find_mut(&mut rows, id, expected_version)?;
        row.status = OutboxStatus::Sent;
        row.version += 1;
        Ok(())
    }

    async fn mark_retry(
        &self,
        id: Uuid,
        expected_version: i64,
        delayed_until: DateTime<Utc>,
        attempt_count: u32,
        last_error: String,
    ) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap();
        let row = find_mut(&mut rows, id, expected_version)?;
        row.status = OutboxStatus::Pending;
        row.delayed_until = delayed_until;
        row.attempt_count = attempt_count;
        row.last_error = Some(last_error);
        row.version += 1;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, expected_version: i64, last_error: String) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap();
        let row = find_mut(&mut rows, id, expected_version)?;
        row.status = OutboxStatus::Failed;
        row.last_error = Some(last_error);
        row.version += 1;
        Ok(())
    }

    async fn cleanup(&self, older_than: DateTime<Utc>, batch_size: usize) -> Result<u64, StoreError> {
        let mut rows = self.rows.lock().unwrap();
        let mut removed = 0u64;
        let mut i = 0;
        while i < rows.len() && (removed as usize) < batch_size {
            if rows[i].status == OutboxStatus::Sent && rows[i].delayed_until < older_than {
                rows.remove(i);
                removed += 1;
            } else {
                i += 1;
            }
        }
        Ok(removed)
    }
}

fn find_mut(rows: &mut [OutboxRow], id: Uuid, expected_version: i64) -> Result<&mut OutboxRow, StoreError> {
    let row = rows.iter_mut().find(|r| r.id == id).ok_or(StoreError::NotFound(id))?;
    if row.version != expected_version {
        return Err(StoreError::ConcurrencyConflict {
            expected: expected_version,
            actual: row.version,
        });
    }
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn claim_batch_skips_rows_not_yet_due() {
        let store = InMemoryOutboxStore::default();
        let now = Utc::now();
        store.enqueue(OutboxRow::new("later".into(), now + chrono::Duration::hours(1))).await.unwrap();
        store.enqueue(OutboxRow::new("now".into(), now)).await.unwrap();

        let claimed = store.claim_batch(10, 5, now).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].message, "now");
    }

    #[tokio::test]
    async fn settling_with_a_stale_version_is_a_conflict() {
        let store = InMemoryOutboxStore::default();
        let now = Utc::now();
        let row = OutboxRow::new("hi".into(), now);
        let id = row.id;
        store.enqueue(row).await.unwrap();
        store.claim_batch(10, 5, now).await.unwrap();

        let err = store.mark_sent(id, 0).await.unwrap_err();
        assert!(matches!(err, StoreError::ConcurrencyConflict { .. }));
    }
}
