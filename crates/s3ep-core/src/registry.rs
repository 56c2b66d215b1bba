//! Multipart upload registry
//!
//! A concurrency-safe map from upload id to [`UploadSession`]. Each session
//! sits behind its own mutex, so part N of one upload never waits on part M
//! or on another upload. Locks are only held while reading or mutating
//! session state, never across encryption of a full segment or backend I/O.

use crate::{
    CoreError, Result,
    envelope::Envelope,
    layout::PartGeometry,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use s3ep_backend::{CompletedPart, Metadata};
use s3ep_crypto::CtrCipher;
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A logical client part that finished uploading
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogicalPart {
    pub part_number: u32,
    pub generation: u32,
    /// Plaintext length in bytes
    pub size: u64,
    /// MD5 of the plaintext, hex encoded
    pub etag: String,
    pub last_modified: DateTime<Utc>,
}

/// State of one in-progress multipart upload
#[derive(Clone)]
pub struct UploadSession {
    /// Upload id shared with the client and the backend
    pub upload_id: String,
    pub bucket: String,
    pub key: String,
    pub content_type: Option<String>,
    pub user_metadata: Metadata,
    pub created_at: DateTime<Utc>,
    envelope: Envelope,
    cipher: CtrCipher,
    total_bytes_processed: i64,
    part_etags: BTreeMap<u32, String>,
    logical_parts: BTreeMap<u32, LogicalPart>,
    generations: BTreeMap<u32, u32>,
    /// Generation whose segments currently fill each logical part's block
    block_owners: BTreeMap<u32, u32>,
    closed: bool,
}

impl UploadSession {
    pub fn new(
        upload_id: impl Into<String>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        envelope: Envelope,
    ) -> Self {
        let cipher = envelope.cipher();
        Self {
            upload_id: upload_id.into(),
            bucket: bucket.into(),
            key: key.into(),
            content_type: None,
            user_metadata: Metadata::new(),
            created_at: Utc::now(),
            envelope,
            cipher,
            total_bytes_processed: 0,
            part_etags: BTreeMap::new(),
            logical_parts: BTreeMap::new(),
            generations: BTreeMap::new(),
            block_owners: BTreeMap::new(),
            closed: false,
        }
    }

    pub fn with_content_type(mut self, content_type: Option<String>) -> Self {
        self.content_type = content_type;
        self
    }

    pub fn with_user_metadata(mut self, metadata: Metadata) -> Self {
        self.user_metadata = metadata;
        self
    }

    /// Alias of the KEK provider that wrapped this session's DEK
    pub fn provider_alias(&self) -> &str {
        &self.envelope.provider_alias
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Advisory running total of plaintext bytes
    pub fn total_bytes_processed(&self) -> i64 {
        self.total_bytes_processed
    }

    /// Physical part number to backend ETag
    pub fn part_etags(&self) -> &BTreeMap<u32, String> {
        &self.part_etags
    }

    /// Completed logical parts by part number
    pub fn logical_parts(&self) -> &BTreeMap<u32, LogicalPart> {
        &self.logical_parts
    }

    /// Physical parts in ascending part-number order
    pub fn sorted_part_etags(&self) -> Vec<CompletedPart> {
        self.part_etags
            .iter()
            .map(|(n, etag)| CompletedPart::new(*n, etag.clone()))
            .collect()
    }

    /// Physical parts recorded inside a block, ascending
    pub fn part_etags_in(&self, block: RangeInclusive<u32>) -> Vec<CompletedPart> {
        self.part_etags
            .range(block)
            .map(|(n, etag)| CompletedPart::new(*n, etag.clone()))
            .collect()
    }

    fn current_generation(&self, part_number: u32) -> u32 {
        self.generations.get(&part_number).copied().unwrap_or(0)
    }

    /// Hand a part's physical block to the reservation's generation
    ///
    /// The first write of a new generation drops the block ETags and the
    /// logical entry of the attempt it replaces. Until then the earlier
    /// attempt stays complete and listable.
    fn claim_block(&mut self, reservation: &PartReservation) -> Result<()> {
        if self.current_generation(reservation.part_number) != reservation.generation {
            return Err(superseded(reservation));
        }
        if self.block_owners.get(&reservation.part_number) == Some(&reservation.generation) {
            return Ok(());
        }

        let stale: Vec<u32> = self
            .part_etags
            .range(reservation.physical.clone())
            .map(|(n, _)| *n)
            .collect();
        for n in stale {
            self.part_etags.remove(&n);
        }
        if self.logical_parts.remove(&reservation.part_number).is_some() {
            debug!(
                upload_id = %self.upload_id,
                part_number = reservation.part_number,
                generation = reservation.generation,
                "Re-upload replaced the earlier attempt"
            );
        }
        self.block_owners.insert(reservation.part_number, reservation.generation);
        Ok(())
    }
}

impl std::fmt::Debug for UploadSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadSession")
            .field("upload_id", &self.upload_id)
            .field("bucket", &self.bucket)
            .field("key", &self.key)
            .field("provider_alias", &self.envelope.provider_alias)
            .field("total_bytes_processed", &self.total_bytes_processed)
            .field("physical_parts", &self.part_etags.len())
            .field("logical_parts", &self.logical_parts.len())
            .finish_non_exhaustive()
    }
}

/// The counter window and physical block handed to one logical part upload
#[derive(Clone, Debug)]
pub struct PartReservation {
    pub upload_id: String,
    pub bucket: String,
    pub key: String,
    pub part_number: u32,
    pub generation: u32,
    /// First counter value of this part's window
    pub window_base: u64,
    /// Physical part numbers this part may use
    pub physical: RangeInclusive<u32>,
    /// Largest number of plaintext bytes the window holds
    pub limit: u64,
}

impl PartReservation {
    /// Physical part number for the `index`-th segment of this part
    pub fn physical_part(&self, index: u32) -> Result<u32> {
        self.physical
            .start()
            .checked_add(index)
            .filter(|n| self.physical.contains(n))
            .ok_or(CoreError::PartNumberOutOfRange {
                part_number: self.physical.start().saturating_add(index),
                max: *self.physical.end(),
            })
    }

    /// Counter for the plaintext byte at `offset` within this part
    pub fn counter_for(&self, offset: u64, len: usize) -> Result<u64> {
        let end = offset
            .checked_add(len as u64)
            .ok_or_else(|| CoreError::CounterOverflow(format!("offset {} + {}", offset, len)))?;
        if end > self.limit {
            return Err(CoreError::PartTooLarge {
                part_number: self.part_number,
                limit: self.limit,
            });
        }
        self.window_base
            .checked_add(offset)
            .ok_or_else(|| CoreError::CounterOverflow(format!("window {} + {}", self.window_base, offset)))
    }
}

/// Summary row for listing in-progress uploads
#[derive(Clone, Debug)]
pub struct UploadSummary {
    pub upload_id: String,
    pub bucket: String,
    pub key: String,
    pub initiated: DateTime<Utc>,
}

/// Registry of in-progress multipart uploads
pub struct MultipartRegistry {
    sessions: DashMap<String, Arc<Mutex<UploadSession>>>,
    geometry: PartGeometry,
}

impl MultipartRegistry {
    pub fn new(geometry: PartGeometry) -> Self {
        Self {
            sessions: DashMap::new(),
            geometry,
        }
    }

    pub fn geometry(&self) -> PartGeometry {
        self.geometry
    }

    /// Register a new session; an id may only be registered once
    pub fn create(&self, session: UploadSession) -> Result<()> {
        use dashmap::mapref::entry::Entry;

        let upload_id = session.upload_id.clone();
        match self.sessions.entry(upload_id.clone()) {
            Entry::Occupied(_) => Err(CoreError::SessionExists(upload_id)),
            Entry::Vacant(slot) => {
                info!(
                    upload_id = %upload_id,
                    bucket = %session.bucket,
                    key = %session.key,
                    provider = session.provider_alias(),
                    "Created upload session"
                );
                slot.insert(Arc::new(Mutex::new(session)));
                Ok(())
            }
        }
    }

    fn session(&self, upload_id: &str) -> Result<Arc<Mutex<UploadSession>>> {
        self.sessions
            .get(upload_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| CoreError::SessionNotFound(upload_id.to_string()))
    }

    fn with_session<T>(
        &self,
        upload_id: &str,
        f: impl FnOnce(&mut UploadSession) -> Result<T>,
    ) -> Result<T> {
        let session = self.session(upload_id)?;
        let mut guard = session.lock();
        if guard.closed {
            return Err(CoreError::SessionNotFound(upload_id.to_string()));
        }
        f(&mut guard)
    }

    /// Claim the counter window and physical block for a logical part
    ///
    /// Reserving a part number that was reserved before moves it to the next
    /// generation, so a re-upload never reuses counters. The earlier attempt's
    /// physical parts and logical entry survive until the new generation
    /// records its first segment.
    pub fn reserve_part(&self, upload_id: &str, part_number: u32) -> Result<PartReservation> {
        let geometry = self.geometry;
        let physical = geometry.physical_block(part_number)?;

        self.with_session(upload_id, |session| {
            let generation = match session.generations.get(&part_number) {
                Some(g) => g.checked_add(1).ok_or_else(|| {
                    CoreError::CounterOverflow(format!("part {} generation", part_number))
                })?,
                None => 0,
            };
            let window_base = geometry.window(part_number, generation)?;
            // the window's last byte must stay addressable as well
            window_base
                .checked_add(geometry.standard_part_size)
                .ok_or_else(|| CoreError::CounterOverflow(format!("part {} window", part_number)))?;

            session.generations.insert(part_number, generation);

            if generation > 0 {
                debug!(upload_id, part_number, generation, "Part re-upload moved to a new counter window");
            }

            Ok(PartReservation {
                upload_id: session.upload_id.clone(),
                bucket: session.bucket.clone(),
                key: session.key.clone(),
                part_number,
                generation,
                window_base,
                physical,
                limit: geometry.standard_part_size,
            })
        })
    }

    /// Encrypt plaintext that starts `offset` bytes into logical part `part_number`
    ///
    /// The counter is `window(part_number) + offset`, derived from the part
    /// number alone, so concurrent parts never share a mutable byte counter.
    pub fn encrypt_multipart_data(
        &self,
        upload_id: &str,
        part_number: u32,
        offset: u64,
        plaintext: &[u8],
    ) -> Result<Vec<u8>> {
        let geometry = self.geometry;
        geometry.check_part_number(part_number)?;
        let (cipher, generation) = self.with_session(upload_id, |session| {
            Ok((session.cipher.clone(), session.current_generation(part_number)))
        })?;

        let reservation = PartReservation {
            upload_id: upload_id.to_string(),
            bucket: String::new(),
            key: String::new(),
            part_number,
            generation,
            window_base: geometry.window(part_number, generation)?,
            physical: geometry.physical_block(part_number)?,
            limit: geometry.standard_part_size,
        };
        let counter = reservation.counter_for(offset, plaintext.len())?;
        Ok(cipher.encrypt_at(counter, plaintext)?)
    }

    /// Encrypt plaintext for a reserved part
    pub fn encrypt_reserved(
        &self,
        reservation: &PartReservation,
        offset: u64,
        plaintext: &[u8],
    ) -> Result<Vec<u8>> {
        let counter = reservation.counter_for(offset, plaintext.len())?;
        let cipher = self.with_session(&reservation.upload_id, |session| Ok(session.cipher.clone()))?;
        Ok(cipher.encrypt_at(counter, plaintext)?)
    }

    /// Record the backend ETag of a physical part; last write wins
    pub fn record_part_etag(&self, upload_id: &str, part_number: u32, etag: impl Into<String>) -> Result<()> {
        if !s3ep_backend::is_valid_part_number(part_number) {
            return Err(CoreError::PartNumberOutOfRange {
                part_number,
                max: s3ep_backend::MAX_PART_NUMBER,
            });
        }
        let etag = etag.into();
        self.with_session(upload_id, |session| {
            session.part_etags.insert(part_number, etag);
            Ok(())
        })
    }

    /// Record a segment uploaded under a reservation
    ///
    /// Fails if a newer upload of the same logical part has taken over.
    pub fn record_segment(
        &self,
        reservation: &PartReservation,
        physical_part: u32,
        etag: impl Into<String>,
    ) -> Result<()> {
        if !reservation.physical.contains(&physical_part) {
            return Err(CoreError::PartNumberOutOfRange {
                part_number: physical_part,
                max: *reservation.physical.end(),
            });
        }
        let etag = etag.into();
        self.with_session(&reservation.upload_id, |session| {
            session.claim_block(reservation)?;
            session.part_etags.insert(physical_part, etag);
            Ok(())
        })
    }

    /// Mark a logical part as complete
    pub fn record_logical_part(
        &self,
        reservation: &PartReservation,
        size: u64,
        etag: impl Into<String>,
    ) -> Result<LogicalPart> {
        let part = LogicalPart {
            part_number: reservation.part_number,
            generation: reservation.generation,
            size,
            etag: etag.into(),
            last_modified: Utc::now(),
        };
        self.with_session(&reservation.upload_id, |session| {
            session.claim_block(reservation)?;
            session.logical_parts.insert(part.part_number, part.clone());
            Ok(part)
        })
    }

    /// Read-only snapshot of a session
    pub fn get_state(&self, upload_id: &str) -> Result<UploadSession> {
        self.with_session(upload_id, |session| Ok(session.clone()))
    }

    /// Final snapshot for assembly; the session stays registered
    pub fn complete(&self, upload_id: &str) -> Result<UploadSession> {
        self.get_state(upload_id)
    }

    /// Release a session and its DEK
    ///
    /// Unknown ids are logged and ignored, so this is safe as best-effort
    /// cleanup after a partially failed create.
    pub fn abort(&self, upload_id: &str) -> Option<UploadSession> {
        match self.sessions.remove(upload_id) {
            Some((_, session)) => {
                let mut guard = session.lock();
                guard.closed = true;
                debug!(upload_id, "Released upload session");
                Some(guard.clone())
            }
            None => {
                warn!(upload_id, "Abort for unknown upload session ignored");
                None
            }
        }
    }

    /// Adjust the advisory byte total, rejecting negative or overflowing results
    pub fn update_total_bytes(&self, upload_id: &str, delta: i64) -> Result<i64> {
        self.with_session(upload_id, |session| {
            let total = session
                .total_bytes_processed
                .checked_add(delta)
                .ok_or_else(|| {
                    CoreError::CounterOverflow(format!(
                        "byte total {} + {} overflows",
                        session.total_bytes_processed, delta
                    ))
                })?;
            if total < 0 {
                return Err(CoreError::InvalidByteCount(format!(
                    "byte total {} + {} would be negative",
                    session.total_bytes_processed, delta
                )));
            }
            session.total_bytes_processed = total;
            Ok(total)
        })
    }

    /// Completed logical parts, ascending
    pub fn list_parts(&self, upload_id: &str) -> Result<Vec<LogicalPart>> {
        self.with_session(upload_id, |session| {
            Ok(session.logical_parts.values().cloned().collect())
        })
    }

    /// In-progress uploads, optionally restricted to one bucket, sorted by key
    pub fn list_uploads(&self, bucket: Option<&str>) -> Vec<UploadSummary> {
        let sessions: Vec<_> = self.sessions.iter().map(|e| Arc::clone(e.value())).collect();
        let mut uploads: Vec<UploadSummary> = sessions
            .iter()
            .filter_map(|s| {
                let s = s.lock();
                if s.closed || bucket.is_some_and(|b| b != s.bucket) {
                    return None;
                }
                Some(UploadSummary {
                    upload_id: s.upload_id.clone(),
                    bucket: s.bucket.clone(),
                    key: s.key.clone(),
                    initiated: s.created_at,
                })
            })
            .collect();
        uploads.sort_by(|a, b| a.key.cmp(&b.key).then(a.initiated.cmp(&b.initiated)));
        uploads
    }

    /// Remove sessions older than `max_age` and return them
    pub fn cleanup_expired(&self, max_age: Duration) -> Vec<UploadSession> {
        let now = Utc::now();
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| {
                let created_at = e.value().lock().created_at;
                (now - created_at).to_std().is_ok_and(|age| age >= max_age)
            })
            .map(|e| e.key().clone())
            .collect();

        let removed: Vec<UploadSession> = expired.iter().filter_map(|id| self.abort(id)).collect();
        if !removed.is_empty() {
            info!(count = removed.len(), "Expired stale upload sessions");
        }
        removed
    }

    /// Number of registered sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

fn superseded(reservation: &PartReservation) -> CoreError {
    CoreError::InvalidPart(format!(
        "part {} of upload {} was superseded by a newer upload",
        reservation.part_number, reservation.upload_id
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use s3ep_crypto::{DekKey, Iv, StreamAlgorithm};

    fn envelope() -> Envelope {
        Envelope {
            dek: DekKey::generate(),
            iv: Iv::generate(),
            encrypted_dek: vec![0; 44],
            provider_alias: "default".into(),
            kek_fingerprint: "fp".into(),
            algorithm: StreamAlgorithm::Aes256Ctr,
        }
    }

    fn geometry() -> PartGeometry {
        PartGeometry {
            standard_part_size: 100,
            segments_per_part: 4,
        }
    }

    fn registry_with(ids: &[&str]) -> MultipartRegistry {
        let registry = MultipartRegistry::new(geometry());
        for id in ids {
            registry
                .create(UploadSession::new(*id, "bucket", format!("key-{}", id), envelope()))
                .unwrap();
        }
        registry
    }

    #[test]
    fn test_duplicate_create_fails() {
        let registry = registry_with(&["u1"]);
        let err = registry
            .create(UploadSession::new("u1", "bucket", "key", envelope()))
            .unwrap_err();
        assert!(matches!(err, CoreError::SessionExists(_)));
    }

    #[test]
    fn test_abort_then_everything_is_not_found() {
        let registry = registry_with(&["u1"]);
        assert!(registry.abort("u1").is_some());

        assert!(matches!(registry.get_state("u1"), Err(CoreError::SessionNotFound(_))));
        assert!(matches!(registry.reserve_part("u1", 1), Err(CoreError::SessionNotFound(_))));
        assert!(matches!(
            registry.record_part_etag("u1", 1, "e"),
            Err(CoreError::SessionNotFound(_))
        ));
        assert!(matches!(
            registry.encrypt_multipart_data("u1", 1, 0, b"x"),
            Err(CoreError::SessionNotFound(_))
        ));
        assert!(matches!(registry.update_total_bytes("u1", 1), Err(CoreError::SessionNotFound(_))));
        assert!(matches!(registry.complete("u1"), Err(CoreError::SessionNotFound(_))));
        assert!(registry.abort("u1").is_none());
    }

    #[test]
    fn test_in_flight_reservation_fails_after_abort() {
        let registry = registry_with(&["u1"]);
        let reservation = registry.reserve_part("u1", 1).unwrap();
        registry.abort("u1");

        assert!(matches!(
            registry.encrypt_reserved(&reservation, 0, b"data"),
            Err(CoreError::SessionNotFound(_))
        ));
        assert!(matches!(
            registry.record_segment(&reservation, 1, "e"),
            Err(CoreError::SessionNotFound(_))
        ));
    }

    #[test]
    fn test_sorted_part_etags_for_any_insertion_order() {
        let registry = registry_with(&["u1"]);
        registry.record_part_etag("u1", 3, "e3").unwrap();
        registry.record_part_etag("u1", 1, "e1").unwrap();
        registry.record_part_etag("u1", 2, "e2").unwrap();

        let parts = registry.complete("u1").unwrap().sorted_part_etags();
        let numbers: Vec<u32> = parts.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(parts[0].etag, "e1");
        // complete does not remove the session
        assert!(registry.get_state("u1").is_ok());
    }

    #[test]
    fn test_record_part_etag_last_write_wins() {
        let registry = registry_with(&["u1"]);
        registry.record_part_etag("u1", 1, "first").unwrap();
        registry.record_part_etag("u1", 1, "second").unwrap();
        let state = registry.get_state("u1").unwrap();
        assert_eq!(state.part_etags().get(&1).map(String::as_str), Some("second"));
        assert!(registry.record_part_etag("u1", 0, "x").is_err());
        assert!(registry.record_part_etag("u1", 10_001, "x").is_err());
    }

    #[test]
    fn test_sessions_are_isolated_under_concurrency() {
        let registry = registry_with(&["u1", "u2"]);
        std::thread::scope(|scope| {
            for id in ["u1", "u2"] {
                let registry = &registry;
                scope.spawn(move || {
                    for i in 0..200 {
                        registry.record_part_etag(id, 1, format!("{}-etag-{}", id, i)).unwrap();
                    }
                });
            }
        });

        for id in ["u1", "u2"] {
            let state = registry.get_state(id).unwrap();
            assert_eq!(state.part_etags().len(), 1);
            assert!(state.part_etags()[&1].starts_with(&format!("{}-", id)));
        }
    }

    #[test]
    fn test_reupload_bumps_generation_and_clears_block() {
        let registry = registry_with(&["u1"]);
        let first = registry.reserve_part("u1", 2).unwrap();
        assert_eq!(first.generation, 0);
        assert_eq!(first.window_base, 100);
        assert_eq!(first.physical, 5..=8);

        registry.record_segment(&first, 5, "a").unwrap();
        registry.record_segment(&first, 6, "b").unwrap();
        registry.record_logical_part(&first, 150, "md5").unwrap();

        let second = registry.reserve_part("u1", 2).unwrap();
        assert_eq!(second.generation, 1);
        assert_ne!(second.window_base, first.window_base);

        // the committed attempt survives until the new one writes
        let state = registry.get_state("u1").unwrap();
        assert_eq!(state.part_etags().len(), 2);
        assert_eq!(state.logical_parts()[&2].generation, 0);

        // the older attempt can no longer write into the block
        assert!(matches!(registry.record_segment(&first, 5, "late"), Err(CoreError::InvalidPart(_))));
        registry.record_segment(&second, 5, "c").unwrap();

        let state = registry.get_state("u1").unwrap();
        assert_eq!(state.part_etags().len(), 1);
        assert_eq!(state.part_etags()[&5], "c");
        assert!(state.logical_parts().is_empty());

        registry.record_logical_part(&second, 10, "md5-2").unwrap();
        assert_eq!(registry.list_parts("u1").unwrap()[0].generation, 1);
    }

    #[test]
    fn test_failed_reupload_keeps_committed_part() {
        let registry = registry_with(&["u1"]);
        let first = registry.reserve_part("u1", 1).unwrap();
        registry.record_segment(&first, 1, "a").unwrap();
        registry.record_logical_part(&first, 40, "md5").unwrap();

        // a re-upload that fails before writing anything
        let retry = registry.reserve_part("u1", 1).unwrap();
        assert_eq!(retry.generation, 1);

        let parts = registry.list_parts("u1").unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].etag, "md5");
        assert_eq!(parts[0].generation, 0);
        assert_eq!(registry.get_state("u1").unwrap().part_etags_in(1..=4).len(), 1);
    }

    #[test]
    fn test_empty_reupload_replaces_block() {
        let registry = registry_with(&["u1"]);
        let first = registry.reserve_part("u1", 1).unwrap();
        registry.record_segment(&first, 1, "a").unwrap();
        registry.record_segment(&first, 2, "b").unwrap();
        registry.record_logical_part(&first, 150, "md5").unwrap();

        let second = registry.reserve_part("u1", 1).unwrap();
        registry.record_logical_part(&second, 0, "empty").unwrap();

        let state = registry.get_state("u1").unwrap();
        assert!(state.part_etags().is_empty());
        assert_eq!(state.logical_parts()[&1].etag, "empty");
    }

    #[test]
    fn test_part_larger_than_window_is_rejected() {
        let registry = registry_with(&["u1"]);
        let reservation = registry.reserve_part("u1", 1).unwrap();
        assert!(registry.encrypt_reserved(&reservation, 90, &[0u8; 10]).is_ok());
        assert!(matches!(
            registry.encrypt_reserved(&reservation, 95, &[0u8; 10]),
            Err(CoreError::PartTooLarge { part_number: 1, limit: 100 })
        ));
    }

    #[test]
    fn test_segment_outside_block_is_rejected() {
        let registry = registry_with(&["u1"]);
        let reservation = registry.reserve_part("u1", 1).unwrap();
        assert_eq!(reservation.physical_part(3).unwrap(), 4);
        assert!(reservation.physical_part(4).is_err());
        assert!(registry.record_segment(&reservation, 5, "e").is_err());
        assert!(matches!(
            registry.reserve_part("u1", 2501),
            Err(CoreError::PartNumberOutOfRange { max: 2500, .. })
        ));
    }

    #[test]
    fn test_encrypt_multipart_data_matches_offset_arithmetic() {
        let registry = registry_with(&["u1"]);
        let plaintext = b"0123456789";
        let whole = registry.encrypt_multipart_data("u1", 3, 0, plaintext).unwrap();
        let tail = registry.encrypt_multipart_data("u1", 3, 4, &plaintext[4..]).unwrap();
        assert_eq!(&whole[4..], tail.as_slice());

        let other_part = registry.encrypt_multipart_data("u1", 4, 0, plaintext).unwrap();
        assert_ne!(whole, other_part);
    }

    #[test]
    fn test_update_total_bytes_bounds() {
        let registry = registry_with(&["u1"]);
        assert_eq!(registry.update_total_bytes("u1", 10).unwrap(), 10);
        assert!(matches!(
            registry.update_total_bytes("u1", -11),
            Err(CoreError::InvalidByteCount(_))
        ));
        assert_eq!(registry.update_total_bytes("u1", -10).unwrap(), 0);
        registry.update_total_bytes("u1", i64::MAX).unwrap();
        assert!(matches!(
            registry.update_total_bytes("u1", 1),
            Err(CoreError::CounterOverflow(_))
        ));
        assert_eq!(registry.get_state("u1").unwrap().total_bytes_processed(), i64::MAX);
    }

    #[test]
    fn test_list_uploads_filters_by_bucket() {
        let registry = registry_with(&["u1", "u2"]);
        registry
            .create(UploadSession::new("u3", "other", "k", envelope()))
            .unwrap();
        let uploads = registry.list_uploads(Some("bucket"));
        assert_eq!(uploads.len(), 2);
        assert_eq!(uploads[0].key, "key-u1");
        assert_eq!(registry.list_uploads(None).len(), 3);
    }

    #[test]
    fn test_cleanup_expired() {
        let registry = registry_with(&["u1"]);
        assert!(registry.cleanup_expired(Duration::from_secs(3600)).is_empty());
        let removed = registry.cleanup_expired(Duration::ZERO);
        assert_eq!(removed.len(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_debug_omits_key_material() {
        let session = UploadSession::new("u1", "b", "k", envelope());
        let debug = format!("{:?}", session);
        assert!(debug.contains("u1"));
        assert!(!debug.contains("dek"));
    }

    proptest! {
        #[test]
        fn prop_concurrent_reservations_never_share_counters(
            threads in prop::collection::vec(prop::collection::vec(1u32..=6, 1..12), 2..6)
        ) {
            let registry = registry_with(&["u1"]);
            let reservations: Vec<PartReservation> = std::thread::scope(|scope| {
                let handles: Vec<_> = threads
                    .iter()
                    .map(|parts| {
                        let registry = &registry;
                        scope.spawn(move || {
                            parts
                                .iter()
                                .map(|n| registry.reserve_part("u1", *n).unwrap())
                                .collect::<Vec<_>>()
                        })
                    })
                    .collect();
                handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
            });

            // every racing re-upload of a part got its own generation
            let mut per_part: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
            for r in &reservations {
                per_part.entry(r.part_number).or_default().push(r.generation);
            }
            for generations in per_part.values_mut() {
                generations.sort_unstable();
                let expected: Vec<u32> = (0..generations.len() as u32).collect();
                prop_assert_eq!(generations.clone(), expected);
            }

            // the full windows handed out are pairwise disjoint
            let mut windows: Vec<(u64, u64)> = reservations
                .iter()
                .map(|r| {
                    let first = r.counter_for(0, 0).unwrap();
                    let last = r.counter_for(r.limit - 1, 1).unwrap();
                    (first, last + 1)
                })
                .collect();
            windows.sort_unstable();
            for pair in windows.windows(2) {
                prop_assert!(pair[0].1 <= pair[1].0, "overlap {:?} {:?}", pair[0], pair[1]);
            }
        }

        #[test]
        fn prop_counters_never_repeat(
            ops in prop::collection::vec((1u32..=20, 1u64..=100), 1..40)
        ) {
            let registry = registry_with(&["u1"]);
            let mut ranges: Vec<(u64, u64)> = Vec::new();

            for (part_number, len) in ops {
                let reservation = registry.reserve_part("u1", part_number).unwrap();
                // a part is encrypted as a sequence of increments from offset 0
                let mut offset = 0;
                while offset < len {
                    let step = (len - offset).min(7);
                    let start = reservation.counter_for(offset, step as usize).unwrap();
                    ranges.push((start, start + step));
                    offset += step;
                }
            }

            ranges.sort();
            for pair in ranges.windows(2) {
                prop_assert!(pair[0].1 <= pair[1].0, "overlap {:?} {:?}", pair[0], pair[1]);
            }
        }
    }
}
