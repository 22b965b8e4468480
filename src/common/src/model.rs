//! Stream and blob records shared by every stage of a sweep.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Local bookkeeping for one blob of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobInfo {
    /// Row id of the blob in the reflector `blob_` table.
    pub blob_id: i64,
    /// Set once the object store confirmed the deletion. Never stored remotely.
    #[serde(default)]
    pub deleted: bool,
}

impl BlobInfo {
    pub fn new(blob_id: i64) -> Self {
        Self {
            blob_id,
            deleted: false,
        }
    }
}

/// Claim lifecycle state as reported by the claim index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BidState {
    Exists,
    Expired,
    Spent,
}

impl BidState {
    /// Map a raw `bid_state` column value. Only `Expired` and `Spent` are
    /// terminal; every other state (Active, Accepted, Controlling...) means
    /// the claim is live.
    pub fn from_raw(raw: &str) -> Self {
        match raw {
            "Expired" => BidState::Expired,
            "Spent" => BidState::Spent,
            _ => BidState::Exists,
        }
    }

    /// Fold terminal states back into `Exists` when their check is disabled.
    pub fn filtered(self, check_expired: bool, check_spent: bool) -> Self {
        match self {
            BidState::Expired if !check_expired => BidState::Exists,
            BidState::Spent if !check_spent => BidState::Exists,
            other => other,
        }
    }
}

/// Mutually exclusive classification of a stream, used for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamStatus {
    Valid,
    NotOnChain,
    Expired,
    Spent,
}

/// A stream known to the reflector, keyed by its sd blob hash.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRecord {
    pub sd_hash: String,
    pub stream_id: i64,
    #[serde(default)]
    pub exists: bool,
    #[serde(default)]
    pub expired: bool,
    #[serde(default)]
    pub spent: bool,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default)]
    pub claim_id: Option<String>,
    /// blob_hash -> blob info. `None` and an empty map mean the same thing.
    #[serde(default)]
    pub inventory: Option<HashMap<String, BlobInfo>>,
}

impl StreamRecord {
    /// A freshly enumerated, not yet classified stream.
    pub fn new(stream_id: i64, sd_hash: impl Into<String>) -> Self {
        Self {
            sd_hash: sd_hash.into(),
            stream_id,
            ..Default::default()
        }
    }

    pub fn is_valid(&self) -> bool {
        self.exists && !self.expired && !self.spent
    }

    /// Resolved and invalid: the only records whose blobs may be purged.
    pub fn is_purge_eligible(&self) -> bool {
        self.resolved && !self.is_valid()
    }

    pub fn status(&self) -> StreamStatus {
        if !self.exists {
            StreamStatus::NotOnChain
        } else if self.expired {
            StreamStatus::Expired
        } else if self.spent {
            StreamStatus::Spent
        } else {
            StreamStatus::Valid
        }
    }

    /// Apply an authoritative classification from the claim index.
    pub fn apply_classification(&mut self, state: Option<BidState>, claim_id: Option<String>) {
        self.resolved = true;
        match state {
            None => {
                self.exists = false;
                self.expired = false;
                self.spent = false;
            }
            Some(state) => {
                self.exists = true;
                self.expired = state == BidState::Expired;
                self.spent = state == BidState::Spent;
            }
        }
        self.claim_id = if self.is_valid() { None } else { claim_id };
    }

    /// Undo an invalid classification after the chain proved the claim live.
    /// The inventory goes with it so a stale copy can never be purged.
    pub fn mark_live(&mut self) {
        self.exists = true;
        self.expired = false;
        self.spent = false;
        self.resolved = true;
        self.claim_id = None;
        self.inventory = None;
    }

    pub fn blob_count(&self) -> usize {
        self.inventory.as_ref().map_or(0, HashMap::len)
    }

    /// Hashes of blobs not yet confirmed deleted.
    pub fn pending_blobs(&self) -> impl Iterator<Item = &str> + '_ {
        self.inventory
            .iter()
            .flat_map(|inventory| inventory.iter())
            .filter(|(_, info)| !info.deleted)
            .map(|(hash, _)| hash.as_str())
    }
}
