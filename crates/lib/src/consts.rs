//! Shared constants.

pub const APP_NAME: &str = "converge";

/// Length of the truncated hex digest used for fingerprints.
pub const OBJ_HASH_PREFIX_LEN: usize = 20;

/// Version written into every persisted state record file.
pub const STATE_FORMAT_VERSION: u32 = 1;

/// Version of the serialized plan format.
pub const PLAN_FORMAT_VERSION: u32 = 1;

pub const LOCK_FILENAME: &str = ".lock";

pub const RESOURCES_DIR: &str = "resources";

/// Environment variable overriding the state directory.
pub const STATE_DIR_ENV: &str = "CONVERGE_STATE_DIR";

/// Environment variable overriding the per-operation provider timeout.
pub const OPERATION_TIMEOUT_ENV: &str = "CONVERGE_OPERATION_TIMEOUT";

/// Provider call timeout when none is configured.
pub const DEFAULT_OPERATION_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(300);
