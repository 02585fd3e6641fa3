//! Hard caps. Anything past these is rejected before it reaches the ledger.

pub const MAX_RESOURCES_PER_TENANT: usize = 100_000;
pub const MAX_ALLOCATIONS_PER_RESOURCE: usize = 1_000_000;

/// Rejected tokens remembered per resource. Past this, rejections are still
/// answered but no longer persisted, so a retry is evaluated afresh.
pub const MAX_REMEMBERED_REJECTIONS: usize = 10_000;

pub const MAX_ID_LEN: usize = 256;
pub const MAX_TOKEN_LEN: usize = 256;
pub const MAX_NAME_LEN: usize = 512;
pub const MAX_NOTE_LEN: usize = 4096;

/// Largest party a single request may claim.
pub const MAX_UNITS_PER_REQUEST: u32 = 10_000;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

/// Longest JSON line accepted from a client.
pub const MAX_FRAME_LEN: usize = 64 * 1024;
