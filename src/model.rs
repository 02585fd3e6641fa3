use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::idempotency::IdempotencyGuard;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// External event identifier, owned by the host application.
pub type ResourceId = String;

/// External user identifier, issued by the identity collaborator.
pub type RequesterId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    Active,
    Released,
}

/// One grant of `units` seats on one resource to one requester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: Ulid,
    pub resource_id: ResourceId,
    pub requester_id: RequesterId,
    pub units: u32,
    pub status: AllocationStatus,
    pub request_token: String,
    pub note: Option<String>,
    pub created_at: Ms,
    pub released_at: Option<Ms>,
}

impl Allocation {
    pub fn is_active(&self) -> bool {
        self.status == AllocationStatus::Active
    }
}

#[derive(Debug)]
pub struct ResourceState {
    pub id: ResourceId,
    pub name: Option<String>,
    /// `None` means unlimited.
    pub capacity: Option<u32>,
    /// Sum of units over active allocations. Only `grant` and `release` touch it.
    allocated_total: u64,
    /// Every allocation ever granted, in admission order. Never shrinks.
    allocations: Vec<Allocation>,
    positions: HashMap<Ulid, usize>,
    pub guard: IdempotencyGuard,
}

impl ResourceState {
    pub fn new(id: ResourceId, name: Option<String>, capacity: Option<u32>) -> Self {
        Self {
            id,
            name,
            capacity,
            allocated_total: 0,
            allocations: Vec::new(),
            positions: HashMap::new(),
            guard: IdempotencyGuard::default(),
        }
    }

    pub fn allocated_total(&self) -> u64 {
        self.allocated_total
    }

    /// Seats left, clamped at zero. `None` for unlimited resources.
    pub fn remaining(&self) -> Option<u64> {
        self.capacity
            .map(|cap| u64::from(cap).saturating_sub(self.allocated_total))
    }

    /// Would `units` more fit under capacity right now?
    pub fn fits(&self, units: u32) -> bool {
        match self.capacity {
            None => true,
            Some(cap) => self.allocated_total + u64::from(units) <= u64::from(cap),
        }
    }

    pub fn allocation_count(&self) -> usize {
        self.allocations.len()
    }

    pub fn allocation(&self, id: &Ulid) -> Option<&Allocation> {
        self.positions.get(id).map(|&pos| &self.allocations[pos])
    }

    pub fn active_for<'a>(&'a self, requester_id: &'a str) -> impl Iterator<Item = &'a Allocation> {
        self.allocations
            .iter()
            .filter(move |a| a.is_active() && a.requester_id == requester_id)
    }

    /// Record a granted allocation. Capacity is the caller's check; this only books it.
    pub fn grant(&mut self, allocation: Allocation) {
        debug_assert!(allocation.is_active(), "granted allocations start active");
        self.allocated_total += u64::from(allocation.units);
        self.positions.insert(allocation.id, self.allocations.len());
        self.allocations.push(allocation);
        debug_assert_eq!(self.allocated_total, self.recount());
    }

    /// Flip an active allocation to released. Returns `None` if it is unknown or
    /// already released, leaving everything untouched.
    pub fn release(&mut self, id: &Ulid, released_at: Ms) -> Option<&Allocation> {
        let pos = *self.positions.get(id)?;
        let allocation = &mut self.allocations[pos];
        if !allocation.is_active() {
            return None;
        }
        allocation.status = AllocationStatus::Released;
        allocation.released_at = Some(released_at);
        self.allocated_total -= u64::from(allocation.units);
        debug_assert_eq!(self.allocated_total, self.recount());
        Some(&self.allocations[pos])
    }

    /// Recompute the allocated total from the allocation list.
    pub fn recount(&self) -> u64 {
        self.allocations
            .iter()
            .filter(|a| a.is_active())
            .map(|a| u64::from(a.units))
            .sum()
    }
}

/// The event types: flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    ResourceCreated {
        id: ResourceId,
        name: Option<String>,
        capacity: Option<u32>,
    },
    AllocationGranted {
        id: Ulid,
        resource_id: ResourceId,
        requester_id: RequesterId,
        units: u32,
        request_token: String,
        note: Option<String>,
        created_at: Ms,
    },
    /// Kept so a retried token replays the same rejection after a restart.
    ReservationRejected {
        resource_id: ResourceId,
        requester_id: RequesterId,
        request_token: String,
        units: u32,
    },
    AllocationReleased {
        id: Ulid,
        resource_id: ResourceId,
        released_at: Ms,
    },
}

impl Event {
    pub fn resource_id(&self) -> &str {
        match self {
            Event::ResourceCreated { id, .. } => id,
            Event::AllocationGranted { resource_id, .. }
            | Event::ReservationRejected { resource_id, .. }
            | Event::AllocationReleased { resource_id, .. } => resource_id,
        }
    }
}

// ── Request / result types ───────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveRequest {
    pub resource_id: ResourceId,
    pub requester_id: RequesterId,
    pub units: u32,
    pub request_token: String,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub allocation_id: Ulid,
    pub resource_id: ResourceId,
    pub units: u32,
    /// Seats left right after the grant; `None` for unlimited resources.
    pub remaining_capacity: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancellation {
    pub allocation_id: Ulid,
    pub resource_id: ResourceId,
    pub units: u32,
    pub released_at: Ms,
    pub remaining_capacity: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub id: ResourceId,
    pub name: Option<String>,
    pub capacity: Option<u32>,
    pub allocated_total: u64,
    pub available: Option<u64>,
}
