use std::collections::BTreeSet;

use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub fn resource_count(&self) -> usize {
        self.state.len()
    }

    /// Capacity and current total of one resource, read under its lock.
    pub async fn get(&self, resource_id: &str) -> Result<ResourceSnapshot, EngineError> {
        let rs = self.read_resource(resource_id).await?;
        Ok(ResourceSnapshot {
            id: rs.id.clone(),
            name: rs.name.clone(),
            capacity: rs.capacity,
            allocated_total: rs.allocated_total(),
            available: rs.remaining(),
        })
    }

    /// Seats left for display: `capacity - allocated_total`, clamped at 0;
    /// `None` for unlimited. Advisory only: `reserve` never looks at it.
    pub async fn available_capacity(&self, resource_id: &str) -> Result<Option<u64>, EngineError> {
        Ok(self.read_resource(resource_id).await?.remaining())
    }

    /// A requester's active allocations on one resource, oldest first.
    pub async fn list_active(
        &self,
        requester_id: &str,
        resource_id: &str,
    ) -> Result<Vec<Allocation>, EngineError> {
        let rs = self.read_resource(resource_id).await?;
        let active = rs.active_for(requester_id).cloned().collect();
        Ok(active)
    }

    /// A requester's active allocations across every resource, oldest first.
    pub async fn list_for_requester(&self, requester_id: &str) -> Result<Vec<Allocation>, EngineError> {
        let ids: Vec<Ulid> = self
            .by_requester
            .get(requester_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let resource_ids: BTreeSet<ResourceId> = ids
            .iter()
            .filter_map(|id| self.resource_for_allocation(id))
            .collect();

        let mut out = Vec::new();
        for resource_id in resource_ids {
            let rs = self.read_resource(&resource_id).await?;
            out.extend(rs.active_for(requester_id).cloned());
        }
        out.sort_by_key(|a| (a.created_at, a.id));
        Ok(out)
    }

    /// One allocation in whatever state it is in.
    pub async fn get_allocation(&self, allocation_id: Ulid) -> Result<Allocation, EngineError> {
        let resource_id = self
            .resource_for_allocation(&allocation_id)
            .ok_or(EngineError::AllocationNotFound(allocation_id))?;
        let rs = self.read_resource(&resource_id).await?;
        let allocation = rs.allocation(&allocation_id).cloned();
        allocation.ok_or(EngineError::AllocationNotFound(allocation_id))
    }
}
