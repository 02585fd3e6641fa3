use ulid::Ulid;

use crate::model::ResourceId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    InvalidRequest(String),
    ResourceNotFound(ResourceId),
    AllocationNotFound(Ulid),
    AlreadyExists(ResourceId),
    /// Nothing was allocated; the request sees no remaining capacity.
    /// `Engine::available_capacity` gives the advisory count of free seats.
    CapacityExceeded {
        resource_id: ResourceId,
        requested: u32,
        remaining_capacity: u64,
    },
    TokenConflict {
        request_token: String,
        original_units: u32,
        requested_units: u32,
    },
    Forbidden(Ulid),
    AlreadyReleased(Ulid),
    LimitExceeded(&'static str),
    /// Waited longer than the lock budget for a resource.
    Contention(ResourceId),
    WalError(String),
    /// The commit task died before reporting back.
    TaskFailed(String),
}

impl EngineError {
    pub fn capacity_exceeded(resource_id: &str, requested: u32) -> Self {
        EngineError::CapacityExceeded {
            resource_id: resource_id.to_string(),
            requested,
            remaining_capacity: 0,
        }
    }

    /// Stable machine-readable code for the wire protocol.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidRequest(_) => "invalid_request",
            EngineError::ResourceNotFound(_) => "resource_not_found",
            EngineError::AllocationNotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::CapacityExceeded { .. } => "capacity_exceeded",
            EngineError::TokenConflict { .. } => "token_conflict",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::AlreadyReleased(_) => "already_released",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Contention(_) => "contention",
            EngineError::WalError(_) => "store_unavailable",
            EngineError::TaskFailed(_) => "internal",
        }
    }

    /// Transient store trouble the caller may retry with the same token.
    /// Business outcomes like a full resource are never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Contention(_) | EngineError::WalError(_) | EngineError::TaskFailed(_)
        )
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            EngineError::ResourceNotFound(id) => write!(f, "resource not found: {id}"),
            EngineError::AllocationNotFound(id) => write!(f, "allocation not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "resource already exists: {id}"),
            EngineError::CapacityExceeded {
                resource_id,
                requested,
                remaining_capacity,
            } => write!(
                f,
                "capacity exceeded on {resource_id}: requested {requested}, remaining capacity {remaining_capacity}"
            ),
            EngineError::TokenConflict {
                request_token,
                original_units,
                requested_units,
            } => write!(
                f,
                "request token {request_token} was first used for {original_units} units, not {requested_units}"
            ),
            EngineError::Forbidden(id) => {
                write!(f, "allocation {id} belongs to another requester")
            }
            EngineError::AlreadyReleased(id) => write!(f, "allocation {id} already released"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Contention(id) => {
                write!(f, "resource {id} is busy, retry the request")
            }
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
            EngineError::TaskFailed(e) => write!(f, "commit task failed: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
