use crate::model::Ms;

const DAY_MS: Ms = 86_400_000;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

/// No single session or block may run longer than one day.
pub const MAX_SPAN_DURATION_MS: Ms = DAY_MS;

pub const MAX_NOTES_LEN: usize = 4_000;
pub const MAX_SUMMARY_LEN: usize = 20_000;
pub const MAX_TITLE_LEN: usize = 200;
pub const MAX_DESCRIPTION_LEN: usize = 4_000;
pub const MAX_IMAGE_REF_LEN: usize = 1_024;
pub const MAX_SESSION_HANDLE_LEN: usize = 512;

pub const MAX_GROUP_CAPACITY: u32 = 500;
pub const MAX_BLOCKS_PER_REQUEST: usize = 48;
pub const MAX_SLOTS_PER_OWNER: usize = 100_000;

/// Widest window accepted by `list_slots`.
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * DAY_MS;
