use crate::time::TimestampMillis;

// Wire format version carried by every inter-node packet
pub const WIRE_VERSION: u32 = 3;

// Block format version written into every new block
pub const BLOCK_VERSION: u32 = 1;

// prevHash of a height-0 block
pub const GENESIS_PREV_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

// Reserved data key marking a transaction as a keyring public key entry
pub const PUBKEY_TAG_KEY: &str = "cc_tx";
pub const PUBKEY_TAG: &str = "system.v3.keyring.config.pubkey";

// Maximum serialized size of the user payload of a single transaction
pub const MAX_TX_DATA_SIZE: usize = 15 * 1024 * 1024;

// Scheduler tick and the jitter ceiling added to every interval so that
// nodes of a cluster do not fire their internal tasks in lockstep
pub const EVENT_TICK_MS: TimestampMillis = 1_000;
pub const EVENT_JITTER_MAX_MS: TimestampMillis = 60_000;

// How long the scheduler waits for in-flight events when unregistering
pub const EVENT_DRAIN_TIMEOUT_MS: TimestampMillis = 60_000;

// How long the REST layer waits for in-flight requests during shutdown
pub const REST_DRAIN_TIMEOUT_MS: TimestampMillis = 60_000;

// Startup gate: how many one-second ping rounds before giving up on peers
pub const DEFAULT_RPC_RETRY_BUDGET: u32 = 100;

// Default timeout of a single inter-node request
pub const DEFAULT_RPC_TIMEOUT_MS: TimestampMillis = 3_000;

// bind addresses
pub const DEFAULT_USERAPI_PORT: u16 = 9_000;
pub const DEFAULT_ADMINAPI_PORT: u16 = 9_001;
pub const DEFAULT_INTERNODE_PORT: u16 = 7_000;

// Block formation thresholds: a tenant becomes eligible once it holds this
// many delivered pool transactions, or once the oldest one is this old
pub const DEFAULT_BLOCK_MIN_TXS: usize = 2;
pub const DEFAULT_BLOCK_MAX_AGE_MS: TimestampMillis = 300_000;

// Format used for the human readable `settime` variant
pub const COMPAT_DATETIME_FORMAT: &str = "%Y/%m/%d %H:%M:%S";
