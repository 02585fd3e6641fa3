//! The two atomic ledger primitives. Each runs entirely under one resource's
//! write lock: re-read the total, check, WAL-append, apply. Nothing outside
//! this file changes an allocation total.

use std::sync::Arc;

use ulid::Ulid;

use crate::limits::MAX_ALLOCATIONS_PER_RESOURCE;
use crate::model::*;

use super::validate::validate_reserve;
use super::{Engine, EngineError};

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Ms
}

impl Engine {
    /// Grant `request.units` if they fit under capacity, as one indivisible step.
    /// Does not consult or update the idempotency memo; `reserve` layers that on top.
    pub async fn try_allocate(self: &Arc<Self>, request: ReserveRequest) -> Result<Allocation, EngineError> {
        validate_reserve(&request)?;
        self.detached(move |engine| async move {
            let mut rs = engine.lock_resource(&request.resource_id).await?;
            engine.allocate_locked(&mut rs, request).await
        })
        .await
    }

    /// Release an allocation regardless of who owns it. For collaborators acting
    /// on the resource as a whole; requesters go through `cancel`.
    pub async fn release(self: &Arc<Self>, allocation_id: Ulid) -> Result<Cancellation, EngineError> {
        self.detached(move |engine| async move { engine.release_checked(allocation_id, None).await })
            .await
    }

    /// Capacity check plus grant. Caller holds the write lock on `rs`.
    pub(super) async fn allocate_locked(
        &self,
        rs: &mut ResourceState,
        request: ReserveRequest,
    ) -> Result<Allocation, EngineError> {
        if rs.allocation_count() >= MAX_ALLOCATIONS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many allocations on resource"));
        }
        if !rs.fits(request.units) {
            return Err(EngineError::capacity_exceeded(&rs.id, request.units));
        }

        let allocation = Allocation {
            id: Ulid::new(),
            resource_id: rs.id.clone(),
            requester_id: request.requester_id,
            units: request.units,
            status: AllocationStatus::Active,
            request_token: request.request_token,
            note: request.note,
            created_at: now_ms(),
            released_at: None,
        };
        let event = Event::AllocationGranted {
            id: allocation.id,
            resource_id: allocation.resource_id.clone(),
            requester_id: allocation.requester_id.clone(),
            units: allocation.units,
            request_token: allocation.request_token.clone(),
            note: allocation.note.clone(),
            created_at: allocation.created_at,
        };
        self.persist_and_apply(rs, &event).await?;

        metrics::counter!(crate::observability::ALLOCATIONS_GRANTED_TOTAL).increment(1);
        metrics::counter!(crate::observability::UNITS_GRANTED_TOTAL).increment(u64::from(allocation.units));
        tracing::debug!(
            "granted {} units of {} to {} as {}",
            allocation.units,
            allocation.resource_id,
            allocation.requester_id,
            allocation.id
        );
        Ok(allocation)
    }

    /// Flip an allocation to released. With `owner` set, only that requester may do it.
    /// Checks run in order: unknown id, wrong owner, already released.
    pub(super) async fn release_checked(
        &self,
        allocation_id: Ulid,
        owner: Option<&str>,
    ) -> Result<Cancellation, EngineError> {
        let resource_id = self
            .resource_for_allocation(&allocation_id)
            .ok_or(EngineError::AllocationNotFound(allocation_id))?;
        let mut rs = self.lock_resource(&resource_id).await?;

        let allocation = rs
            .allocation(&allocation_id)
            .ok_or(EngineError::AllocationNotFound(allocation_id))?;
        if let Some(owner) = owner
            && allocation.requester_id != owner
        {
            return Err(EngineError::Forbidden(allocation_id));
        }
        if !allocation.is_active() {
            return Err(EngineError::AlreadyReleased(allocation_id));
        }
        let units = allocation.units;

        let released_at = now_ms();
        let event = Event::AllocationReleased {
            id: allocation_id,
            resource_id: resource_id.clone(),
            released_at,
        };
        self.persist_and_apply(&mut rs, &event).await?;

        metrics::counter!(crate::observability::ALLOCATIONS_RELEASED_TOTAL).increment(1);
        tracing::debug!("released {allocation_id} ({units} units) on {resource_id}");
        Ok(Cancellation {
            allocation_id,
            resource_id,
            units,
            released_at,
            remaining_capacity: rs.remaining(),
        })
    }
}
