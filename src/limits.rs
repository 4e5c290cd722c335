use crate::model::Hours;

pub const MAX_RESOURCES: usize = 100_000;
pub const MAX_PROJECTS: usize = 100_000;
pub const MAX_ALLOCATIONS_PER_RESOURCE: usize = 10_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 8_192;

/// 7 × 24.
pub const MAX_HOURS_PER_WEEK: Hours = Hours::whole(168);

/// Widest date window a single query may span (about ten years).
pub const MAX_QUERY_WINDOW_DAYS: i64 = 3_660;

pub const MAX_REQUEST_LINE_LEN: usize = 8_192;
pub const MAX_HEADER_COUNT: usize = 64;
pub const MAX_REQUEST_BODY_LEN: usize = 64 * 1024;
