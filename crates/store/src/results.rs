//! Persistent result store using sled.
//!
//! Two trees mirror the submitter-facing schema:
//! `global_aggregates(config_id, round)` and `proofs(config_id, round)`.
//! A finalized round writes both rows in one transaction. Keys are
//! big-endian `(config_id, round)` so a prefix scan per topic yields
//! rounds in ascending order.

use std::path::Path;
use std::time::Duration;

use sled::transaction::TransactionError;
use sled::Transactional;
use thiserror::Error;
use tracing::{debug, warn};

use pricemesh_core::{GlobalAggregate, Proof, SubmissionData};

/// Bounded retry for transient write failures.
const MAX_WRITE_ATTEMPTS: u32 = 5;
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),
    #[error("transaction aborted")]
    TransactionAborted,
}

pub struct ResultStore {
    db: sled::Db,
    globals: sled::Tree,
    proofs: sled::Tree,
}

fn row_key(config_id: i32, round: i32) -> [u8; 8] {
    let mut key = [0u8; 8];
    key[..4].copy_from_slice(&config_id.to_be_bytes());
    key[4..].copy_from_slice(&round.to_be_bytes());
    key
}

impl ResultStore {
    /// Open (or create) the store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        let globals = db.open_tree("global_aggregates")?;
        let proofs = db.open_tree("proofs")?;
        Ok(Self {
            db,
            globals,
            proofs,
        })
    }

    /// Write a finalized aggregate and its proof as one transaction.
    ///
    /// Returns `true` if the pair was inserted, `false` if a row for
    /// `(config_id, round)` already existed. Duplicate writes carry the
    /// same content, so the existing pair is left untouched.
    pub fn write_submission(
        &self,
        global: &GlobalAggregate,
        proof: &Proof,
    ) -> Result<bool, StoreError> {
        let key = row_key(global.config_id, global.round);
        let global_bytes = postcard::to_allocvec(global)?;
        let proof_bytes = postcard::to_allocvec(proof)?;

        let result: Result<bool, TransactionError<()>> =
            (&self.globals, &self.proofs).transaction(|(globals, proofs)| {
                if globals.get(key)?.is_some() {
                    return Ok(false);
                }
                globals.insert(&key[..], global_bytes.as_slice())?;
                proofs.insert(&key[..], proof_bytes.as_slice())?;
                Ok(true)
            });

        match result {
            Ok(inserted) => {
                if !inserted {
                    debug!(
                        config_id = global.config_id,
                        round = global.round,
                        "duplicate submission write, keeping existing row"
                    );
                }
                Ok(inserted)
            }
            Err(TransactionError::Storage(e)) => Err(StoreError::Sled(e)),
            Err(TransactionError::Abort(())) => Err(StoreError::TransactionAborted),
        }
    }

    /// [`write_submission`](Self::write_submission) with bounded backoff.
    /// After the final attempt the error surfaces to the caller, which
    /// treats it as fatal.
    pub async fn write_submission_with_retry(
        &self,
        global: &GlobalAggregate,
        proof: &Proof,
    ) -> Result<bool, StoreError> {
        let mut attempt = 1;
        loop {
            match self.write_submission(global, proof) {
                Ok(inserted) => return Ok(inserted),
                Err(e) if attempt < MAX_WRITE_ATTEMPTS => {
                    warn!(
                        attempt,
                        config_id = global.config_id,
                        round = global.round,
                        error = %e,
                        "result store write failed, retrying"
                    );
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The highest-round global aggregate for a topic.
    pub fn latest_global(&self, config_id: i32) -> Result<Option<GlobalAggregate>, StoreError> {
        match self.globals.scan_prefix(config_id.to_be_bytes()).last() {
            Some(entry) => {
                let (_, value) = entry?;
                Ok(Some(postcard::from_bytes(&value)?))
            }
            None => Ok(None),
        }
    }

    /// The finalized aggregate and proof pair for one round, as handed
    /// to the submitter.
    pub fn submission(
        &self,
        config_id: i32,
        round: i32,
    ) -> Result<Option<SubmissionData>, StoreError> {
        let key = row_key(config_id, round);
        let global = match self.globals.get(key)? {
            Some(bytes) => postcard::from_bytes(&bytes)?,
            None => return Ok(None),
        };
        let proof = match self.proofs.get(key)? {
            Some(bytes) => postcard::from_bytes(&bytes)?,
            None => return Ok(None),
        };
        Ok(Some(SubmissionData {
            global_aggregate: global,
            proof,
        }))
    }

    /// Number of finalized rounds for a topic.
    pub fn round_count(&self, config_id: i32) -> usize {
        self.globals.scan_prefix(config_id.to_be_bytes()).count()
    }

    /// Flush all pending writes.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}
