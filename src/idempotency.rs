//! Per-resource memo of reservation outcomes keyed by the caller's request token.
//!
//! Tokens are scoped to a `(requester_id, request_token)` pair inside one
//! resource. The guard lives inside `ResourceState`, so it is only ever read or
//! written under that resource's write lock, in the same step as the
//! allocation it describes.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use ulid::Ulid;

use crate::model::RequesterId;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TokenKey {
    requester_id: RequesterId,
    request_token: String,
}

/// What the first call with a token ended in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Granted {
        allocation_id: Ulid,
        units: u32,
        remaining: Option<u64>,
    },
    Rejected {
        units: u32,
    },
}

impl Outcome {
    pub fn units(&self) -> u32 {
        match self {
            Outcome::Granted { units, .. } | Outcome::Rejected { units, .. } => *units,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Token never seen for this requester.
    Fresh,
    /// Same token, same units: hand back the stored outcome.
    Replay(Outcome),
    /// Same token, different units: a client bug, not a retry.
    Conflict { original_units: u32 },
}

#[derive(Debug, Default)]
pub struct IdempotencyGuard {
    seen: HashMap<TokenKey, Outcome>,
    /// How many entries in `seen` are rejections.
    rejections: usize,
}

impl IdempotencyGuard {
    pub fn check(&self, requester_id: &str, request_token: &str, units: u32) -> Verdict {
        let key = TokenKey {
            requester_id: requester_id.to_string(),
            request_token: request_token.to_string(),
        };
        match self.seen.get(&key) {
            None => Verdict::Fresh,
            Some(outcome) if outcome.units() == units => Verdict::Replay(*outcome),
            Some(outcome) => Verdict::Conflict {
                original_units: outcome.units(),
            },
        }
    }

    /// Remember an outcome. The first outcome for a token wins; later records are ignored.
    pub fn record(&mut self, requester_id: &str, request_token: &str, outcome: Outcome) {
        let key = TokenKey {
            requester_id: requester_id.to_string(),
            request_token: request_token.to_string(),
        };
        if let Entry::Vacant(slot) = self.seen.entry(key) {
            if matches!(outcome, Outcome::Rejected { .. }) {
                self.rejections += 1;
            }
            slot.insert(outcome);
        }
    }

    pub fn rejection_count(&self) -> usize {
        self.rejections
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
