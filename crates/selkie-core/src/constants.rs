//! Limits for Selkie
//!
//! All limits are explicit, use big-endian naming (most significant first),
//! and include units in the name.

// =============================================================================
// Identity Limits
// =============================================================================

/// Maximum length of an agent type in bytes
pub const AGENT_TYPE_LENGTH_BYTES_MAX: usize = 128;

/// Maximum length of an agent key in bytes
pub const AGENT_KEY_LENGTH_BYTES_MAX: usize = 256;

/// Maximum length of a topic type in bytes
pub const TOPIC_TYPE_LENGTH_BYTES_MAX: usize = 128;

/// Maximum length of a topic source in bytes
pub const TOPIC_SOURCE_LENGTH_BYTES_MAX: usize = 256;

/// Maximum length of a worker ID in bytes
pub const WORKER_ID_LENGTH_BYTES_MAX: usize = 128;

// =============================================================================
// Queue Limits
// =============================================================================

/// Maximum depth of the runtime intake queue
pub const INTAKE_DEPTH_MAX: usize = 10_000;

/// Maximum depth of a per-agent mailbox
pub const MAILBOX_DEPTH_MAX: usize = 1_000;

/// Maximum number of registered agent types per runtime
pub const AGENT_TYPES_COUNT_MAX: usize = 10_000;

// =============================================================================
// Message Limits
// =============================================================================

/// Maximum size of a serialized message payload in bytes (1 MB)
pub const MESSAGE_SIZE_BYTES_MAX: usize = 1024 * 1024;

/// Maximum length of a message type name in bytes
pub const MESSAGE_TYPE_NAME_LENGTH_BYTES_MAX: usize = 256;

// =============================================================================
// Network Limits
// =============================================================================

/// Maximum size of a wire frame in bytes (4 MB)
pub const WIRE_FRAME_SIZE_BYTES_MAX: usize = 4 * 1024 * 1024;

/// Maximum number of workers connected to one host
pub const WORKERS_COUNT_MAX: usize = 1_000;

/// Default RPC timeout in milliseconds (30 sec)
pub const RPC_TIMEOUT_MS_DEFAULT: u64 = 30 * 1000;

/// Default connect timeout in milliseconds (5 sec)
pub const CONNECT_TIMEOUT_MS_DEFAULT: u64 = 5 * 1000;

/// Default drain timeout on graceful shutdown in milliseconds (10 sec)
pub const DRAIN_TIMEOUT_MS_DEFAULT: u64 = 10 * 1000;

// Compile-time assertions for constant validity
const _: () = {
    assert!(AGENT_TYPE_LENGTH_BYTES_MAX >= 64);
    assert!(MESSAGE_SIZE_BYTES_MAX <= WIRE_FRAME_SIZE_BYTES_MAX);
    assert!(MAILBOX_DEPTH_MAX <= INTAKE_DEPTH_MAX);
    assert!(RPC_TIMEOUT_MS_DEFAULT >= 1000);
    assert!(DRAIN_TIMEOUT_MS_DEFAULT >= 1000);
};
