use std::sync::Arc;

use tokio::sync::RwLock;
use ulid::Ulid;

use crate::idempotency::{Outcome, Verdict};
use crate::limits::MAX_RESOURCES_PER_TENANT;
use crate::model::*;

use super::validate::{validate_id, validate_reserve, validate_resource};
use super::{Engine, EngineError};

fn replayed(resource_id: &str, outcome: Outcome) -> Result<Reservation, EngineError> {
    match outcome {
        Outcome::Granted {
            allocation_id,
            units,
            remaining,
        } => Ok(Reservation {
            allocation_id,
            resource_id: resource_id.to_string(),
            units,
            remaining_capacity: remaining,
        }),
        Outcome::Rejected { units } => Err(EngineError::capacity_exceeded(resource_id, units)),
    }
}

impl Engine {
    /// Register a resource. Capacity `None` means unlimited and is fixed from here on.
    pub async fn create_resource(
        self: &Arc<Self>,
        id: ResourceId,
        name: Option<String>,
        capacity: Option<u32>,
    ) -> Result<(), EngineError> {
        validate_resource(&id, name.as_deref())?;
        self.detached(move |engine| async move {
            let _serial = engine.create_lock.lock().await;
            if engine.state.len() >= MAX_RESOURCES_PER_TENANT {
                return Err(EngineError::LimitExceeded("too many resources"));
            }
            if engine.state.contains_key(&id) {
                return Err(EngineError::AlreadyExists(id));
            }

            let event = Event::ResourceCreated {
                id: id.clone(),
                name: name.clone(),
                capacity,
            };
            engine.wal_append(&event).await?;
            engine
                .state
                .insert(id.clone(), Arc::new(RwLock::new(ResourceState::new(id, name, capacity))));
            engine.notify.send(&event);
            Ok(())
        })
        .await
    }

    /// Claim `units` seats for a requester, at most once per request token.
    ///
    /// A token already seen for this requester on this resource returns the
    /// first call's result unchanged, whether that was a grant or a
    /// `CapacityExceeded`. Reusing a token with different units is a
    /// `TokenConflict`. Exactly one allocation exists after any successful call.
    pub async fn reserve(self: &Arc<Self>, request: ReserveRequest) -> Result<Reservation, EngineError> {
        validate_reserve(&request)?;
        self.detached(move |engine| async move { engine.reserve_locked(request).await })
            .await
    }

    async fn reserve_locked(&self, request: ReserveRequest) -> Result<Reservation, EngineError> {
        let mut rs = self.lock_resource(&request.resource_id).await?;

        match rs
            .guard
            .check(&request.requester_id, &request.request_token, request.units)
        {
            Verdict::Fresh => {}
            Verdict::Replay(outcome) => {
                metrics::counter!(crate::observability::RESERVATIONS_REPLAYED_TOTAL).increment(1);
                tracing::debug!(
                    "replaying token {} for {} on {}",
                    request.request_token,
                    request.requester_id,
                    rs.id
                );
                return replayed(&rs.id, outcome);
            }
            Verdict::Conflict { original_units } => {
                metrics::counter!(crate::observability::RESERVATIONS_REJECTED_TOTAL, "reason" => "token_conflict")
                    .increment(1);
                return Err(EngineError::TokenConflict {
                    request_token: request.request_token,
                    original_units,
                    requested_units: request.units,
                });
            }
        }

        let requester_id = request.requester_id.clone();
        let request_token = request.request_token.clone();
        match self.allocate_locked(&mut rs, request).await {
            Ok(allocation) => Ok(Reservation {
                allocation_id: allocation.id,
                resource_id: allocation.resource_id,
                units: allocation.units,
                remaining_capacity: rs.remaining(),
            }),
            Err(EngineError::CapacityExceeded {
                resource_id, requested, ..
            }) => {
                metrics::counter!(crate::observability::RESERVATIONS_REJECTED_TOTAL, "reason" => "capacity")
                    .increment(1);
                if rs.guard.rejection_count() >= self.config.max_remembered_rejections {
                    tracing::debug!("rejection memo on {resource_id} is full, not recording token {request_token}");
                    return Err(EngineError::capacity_exceeded(&resource_id, requested));
                }
                let event = Event::ReservationRejected {
                    resource_id: resource_id.clone(),
                    requester_id,
                    request_token,
                    units: requested,
                };
                // The rejection stands even if the memo can't be made durable;
                // a retry with this token is then simply evaluated again.
                if let Err(e) = self.persist_and_apply(&mut rs, &event).await {
                    tracing::warn!("could not record rejection on {resource_id}: {e}");
                }
                Err(EngineError::capacity_exceeded(&resource_id, requested))
            }
            Err(e) => Err(e),
        }
    }

    /// Give back a requester's own allocation. A second cancel of the same
    /// allocation reports `AlreadyReleased` and changes nothing.
    pub async fn cancel(
        self: &Arc<Self>,
        allocation_id: Ulid,
        requester_id: RequesterId,
    ) -> Result<Cancellation, EngineError> {
        validate_id("requester_id", &requester_id)?;
        self.detached(move |engine| async move {
            engine.release_checked(allocation_id, Some(&requester_id)).await
        })
        .await
    }
}
