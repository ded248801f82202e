/// Number of messages requested per local or remote page.
pub const MESSAGE_PAGE_SIZE: usize = 50;

/// Maximum number of writes committed in one remote seen-status batch.
pub const SEEN_BATCH_LIMIT: usize = 500;

/// Maximum number of ids the remote store accepts in one "id in" query.
pub const REMOTE_IN_QUERY_LIMIT: usize = 10;

/// Quiet window before pending deletion checks are validated (milliseconds).
pub const DELETION_CHECK_DEBOUNCE_MS: u64 = 2_000;

/// Quiet window before coalesced unseen-counter deltas are pushed (milliseconds).
pub const UNSEEN_COUNTER_DEBOUNCE_MS: u64 = 750;

/// Capacity of the engine's event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the local store's change broadcast channel.
pub const STORE_CHANGE_CAPACITY: usize = 1024;
