//! Wire and timing constants.

use std::time::Duration;

/// Version string reported to pools asking `client.get_version`.
pub const PROXY_VERSION: &str = concat!("stratum-proxy/", env!("CARGO_PKG_VERSION"));

/// Upstream inactivity watchdog. Any inbound frame resets it; expiry forces
/// a reconnect.
pub const POOL_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Reconnect cycles with no inbound frame before the process gives up and
/// exits for an external supervisor to restart it. `--idle` disables the
/// kill and retries forever.
pub const DISCONNECT_STRIKES: u32 = 4;

/// Delay between upstream reconnect attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// While mining on the backup pool, swap back to the primary after this many
/// `mining.notify` frames.
pub const BACKUP_RETURN_NOTIFICATIONS: u32 = 50;

/// Default control-file check cadence, counted in notifications.
pub const CONTROL_FILE_INTERVAL: u32 = 10;

/// Failed worker authorizations are not retried upstream more often than
/// this.
pub const AUTHORIZE_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Cadence of the per-worker share statistics log line.
pub const STATS_PRINT_INTERVAL: Duration = Duration::from_secs(60);

/// Extranonce tail space: two bytes, slot 0 reserved for getwork clients.
pub const MAX_EXTRANONCE_TAILS: u16 = 0xffff;

/// Getwork padding appended to the 80-byte header to form the 128-byte
/// `data` field (SHA-256 length/terminator block for the second compression).
pub const GETWORK_DATA_PADDING: &str =
    "000000800000000000000000000000000000000000000000000000000000000000000000000000000000000080020000";

/// Fixed `hash1` field of a getwork response. Legacy miners feed it to their
/// second hashing stage; its value never changes.
pub const GETWORK_HASH1: &str =
    "00000000000000000000000000000000000000000000000000000000000000000000008000000000000000000000000000000000000000000000000000010000";

/// Backward-compatible `target` field for deprecated getwork miners
/// (`--old-target`).
pub const GETWORK_OLD_TARGET: &str =
    "ffffffffffffffffffffffffffffffffffffffffffffffffffffffff00000000";

/// Basic-auth realm on the getwork listener.
pub const GETWORK_AUTH_REALM: &str = "stratum-mining-proxy";
