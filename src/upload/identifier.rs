//! Public identifier allocation
//!
//! Two modes:
//! - Random: short ids over a URL-safe alphabet, one symbol longer after
//!   every collision
//! - Hashed: SHA-256 over (name, time, secret, fingerprint), optionally
//!   truncated to the shortest free prefix
//!
//! Ids handed out but not yet committed are held in an in-process
//! reservation set. The ledger's unique constraint stays the final arbiter.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

use super::crypto::Fingerprint;
use super::types::UploadError;
use crate::config::{Config, IdMode};
use crate::db::ArtifactRepository;

/// URL-safe alphabet (RFC 3986 unreserved characters)
const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_.~";

/// Length of the first random candidate and shortest hashed prefix
pub const MIN_ID_LEN: usize = 4;

/// Random ids never grow past this
pub const MAX_ID_LEN: usize = 64;

/// Random candidates tried before giving up
pub const MAX_ATTEMPTS: usize = 10;

// ============================================================================
// Ledger Seam
// ============================================================================

/// Read access to the set of taken identifiers
#[async_trait]
pub trait IdentifierLedger: Send + Sync {
    async fn identifier_exists(&self, id: &str) -> sqlx::Result<bool>;
}

#[async_trait]
impl IdentifierLedger for SqlitePool {
    async fn identifier_exists(&self, id: &str) -> sqlx::Result<bool> {
        ArtifactRepository::new(self).exists(id).await
    }
}

// ============================================================================
// Reservation
// ============================================================================

/// An allocated identifier, reserved until dropped
#[derive(Debug)]
pub struct Reservation {
    id: String,
    reserved: Arc<Mutex<HashSet<String>>>,
}

impl Reservation {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.reserved.lock().remove(&self.id);
    }
}

// ============================================================================
// Allocator
// ============================================================================

/// Inputs to the hashed mode
#[derive(Debug, Clone, Copy)]
pub struct HashSeed<'a> {
    pub original_name: &'a str,
    pub owner: &'a Fingerprint,
    pub at: DateTime<Utc>,
}

/// Allocates public identifiers for artifacts
#[derive(Clone)]
pub struct IdAllocator {
    mode: IdMode,
    short_hash: bool,
    secret: Arc<str>,
    reserved: Arc<Mutex<HashSet<String>>>,
}

impl IdAllocator {
    pub fn new(mode: IdMode, short_hash: bool, secret: &str) -> Self {
        Self {
            mode,
            short_hash,
            secret: Arc::from(secret),
            reserved: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.ids.mode, config.ids.short_hash, &config.server.secret)
    }

    /// Allocate a free identifier.
    ///
    /// Never writes to the ledger; the caller commits the id.
    pub async fn allocate<L>(&self, ledger: &L, seed: HashSeed<'_>) -> Result<Reservation, UploadError>
    where
        L: IdentifierLedger + ?Sized,
    {
        match self.mode {
            IdMode::Random => self.allocate_random(ledger).await,
            IdMode::Hashed => self.allocate_hashed(ledger, seed).await,
        }
    }

    async fn allocate_random<L>(&self, ledger: &L) -> Result<Reservation, UploadError>
    where
        L: IdentifierLedger + ?Sized,
    {
        for attempt in 0..MAX_ATTEMPTS {
            let length = (MIN_ID_LEN + attempt).min(MAX_ID_LEN);
            let candidate = random_id(length);

            if let Some(reservation) = self.claim(ledger, candidate).await? {
                return Ok(reservation);
            }
            tracing::debug!(attempt, length, "Identifier collision, growing");
        }

        tracing::warn!(attempts = MAX_ATTEMPTS, "Identifier allocation exhausted");
        Err(UploadError::AllocationExhausted)
    }

    async fn allocate_hashed<L>(&self, ledger: &L, seed: HashSeed<'_>) -> Result<Reservation, UploadError>
    where
        L: IdentifierLedger + ?Sized,
    {
        let digest = hashed_id(seed, &self.secret);

        if !self.short_hash {
            return match self.claim(ledger, digest.clone()).await? {
                Some(reservation) => Ok(reservation),
                None => Err(UploadError::DuplicateIdentifier(digest)),
            };
        }

        // Shortest free prefix, up to and including the full digest
        for length in MIN_ID_LEN..=digest.len() {
            if let Some(reservation) = self.claim(ledger, digest[..length].to_string()).await? {
                return Ok(reservation);
            }
        }

        tracing::warn!("Every hashed identifier prefix is taken");
        Err(UploadError::AllocationExhausted)
    }

    /// Reserve a candidate if neither a pending merge nor the ledger holds it
    async fn claim<L>(&self, ledger: &L, candidate: String) -> Result<Option<Reservation>, UploadError>
    where
        L: IdentifierLedger + ?Sized,
    {
        let Some(reservation) = self.reserve(candidate) else {
            return Ok(None);
        };

        if ledger.identifier_exists(reservation.id()).await? {
            // Dropping releases the reservation
            return Ok(None);
        }

        Ok(Some(reservation))
    }

    fn reserve(&self, candidate: String) -> Option<Reservation> {
        let mut reserved = self.reserved.lock();
        if !reserved.insert(candidate.clone()) {
            return None;
        }
        Some(Reservation {
            id: candidate,
            reserved: Arc::clone(&self.reserved),
        })
    }

    /// Number of ids currently reserved
    pub fn pending(&self) -> usize {
        self.reserved.lock().len()
    }
}

fn random_id(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

fn hashed_id(seed: HashSeed<'_>, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seed.original_name.as_bytes());
    hasher.update(seed.at.timestamp_millis().to_string().as_bytes());
    hasher.update(secret.as_bytes());
    hasher.update(seed.owner.as_str().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::validate;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    /// In-memory ledger that records every lookup
    #[derive(Default)]
    struct MemoryLedger {
        taken: Mutex<HashSet<String>>,
        lookups: Mutex<Vec<String>>,
        always_taken: bool,
    }

    impl MemoryLedger {
        fn seeded(ids: impl IntoIterator<Item = String>) -> Self {
            Self {
                taken: Mutex::new(ids.into_iter().collect()),
                ..Default::default()
            }
        }

        fn full() -> Self {
            Self {
                always_taken: true,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl IdentifierLedger for MemoryLedger {
        async fn identifier_exists(&self, id: &str) -> sqlx::Result<bool> {
            self.lookups.lock().push(id.to_string());
            Ok(self.always_taken || self.taken.lock().contains(id))
        }
    }

    fn seed<'a>(owner: &'a Fingerprint) -> HashSeed<'a> {
        HashSeed {
            original_name: "report.pdf",
            owner,
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_random_ids_use_alphabet() {
        let allocator = IdAllocator::new(IdMode::Random, true, SECRET);
        let ledger = MemoryLedger::default();
        let owner = Fingerprint::from_stored("unknown");

        let reservation = allocator.allocate(&ledger, seed(&owner)).await.unwrap();
        assert_eq!(reservation.id().len(), MIN_ID_LEN);
        assert!(validate::public_id(reservation.id()).is_ok());
    }

    #[test]
    fn test_random_id_symbols() {
        assert_eq!(ALPHABET.len(), 66);
        let unique: HashSet<&u8> = ALPHABET.iter().collect();
        assert_eq!(unique.len(), ALPHABET.len());

        for length in [MIN_ID_LEN, 16, MAX_ID_LEN] {
            let id = random_id(length);
            assert_eq!(id.len(), length);
            assert!(id.bytes().all(|b| ALPHABET.contains(&b)), "unexpected symbol in {id}");
            assert!(validate::public_id(&id).is_ok());
        }
    }

    #[tokio::test]
    async fn test_exhaustion_after_growing() {
        let allocator = IdAllocator::new(IdMode::Random, true, SECRET);
        let ledger = MemoryLedger::full();
        let owner = Fingerprint::from_stored("unknown");

        let result = allocator.allocate(&ledger, seed(&owner)).await;
        assert!(matches!(result, Err(UploadError::AllocationExhausted)));

        let lengths: Vec<usize> = ledger.lookups.lock().iter().map(|id| id.len()).collect();
        let expected: Vec<usize> = (MIN_ID_LEN..MIN_ID_LEN + MAX_ATTEMPTS).collect();
        assert_eq!(lengths, expected);
        // Failed attempts hold nothing
        assert_eq!(allocator.pending(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_allocations_are_unique() {
        // Seed a dense set of 4-character ids
        let seeded: Vec<String> = (0..64 * 64).map(|_| random_id(MIN_ID_LEN)).collect();
        let ledger = Arc::new(MemoryLedger::seeded(seeded.clone()));
        let allocator = IdAllocator::new(IdMode::Random, true, SECRET);

        let mut handles = Vec::new();
        for _ in 0..64 {
            let allocator = allocator.clone();
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                let owner = Fingerprint::from_stored("unknown");
                allocator
                    .allocate(ledger.as_ref(), seed(&owner))
                    .await
                    .unwrap()
            }));
        }

        let mut reservations = Vec::new();
        for handle in handles {
            reservations.push(handle.await.unwrap());
        }

        let ids: HashSet<&str> = reservations.iter().map(|r| r.id()).collect();
        assert_eq!(ids.len(), reservations.len());
        let seeded: HashSet<String> = seeded.into_iter().collect();
        assert!(ids.iter().all(|id| !seeded.contains(*id)));
        assert_eq!(allocator.pending(), 64);

        drop(reservations);
        assert_eq!(allocator.pending(), 0);
    }

    #[tokio::test]
    async fn test_reservation_blocks_reuse() {
        let allocator = IdAllocator::new(IdMode::Hashed, false, SECRET);
        let ledger = MemoryLedger::default();
        let owner = Fingerprint::from_stored("unknown");
        let seed = seed(&owner);

        let first = allocator.allocate(&ledger, seed).await.unwrap();
        assert_eq!(first.id().len(), 64);

        // Same inputs while the first id is pending
        let second = allocator.allocate(&ledger, seed).await;
        assert!(matches!(second, Err(UploadError::DuplicateIdentifier(_))));

        drop(first);
        assert!(allocator.allocate(&ledger, seed).await.is_ok());
    }

    #[tokio::test]
    async fn test_short_hash_takes_shortest_free_prefix() {
        let allocator = IdAllocator::new(IdMode::Hashed, true, SECRET);
        let owner = Fingerprint::from_stored("unknown");
        let seed = seed(&owner);
        let digest = hashed_id(seed, SECRET);

        let ledger = MemoryLedger::seeded([digest[..4].to_string(), digest[..5].to_string()]);
        let reservation = allocator.allocate(&ledger, seed).await.unwrap();
        assert_eq!(reservation.id(), &digest[..6]);
    }

    #[tokio::test]
    async fn test_short_hash_exhaustion() {
        let allocator = IdAllocator::new(IdMode::Hashed, true, SECRET);
        let ledger = MemoryLedger::full();
        let owner = Fingerprint::from_stored("unknown");

        let result = allocator.allocate(&ledger, seed(&owner)).await;
        assert!(matches!(result, Err(UploadError::AllocationExhausted)));
        // Every prefix through the full digest was tried
        assert_eq!(ledger.lookups.lock().len(), 64 - MIN_ID_LEN + 1);
    }
}
