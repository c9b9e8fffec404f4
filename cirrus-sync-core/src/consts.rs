use std::time::Duration;

pub const MAX_PARALLEL_DOWNLOADS: usize = 4;

/// New file bodies are admitted only while the outstanding byte backlog
/// (`bytes_total - bytes_downloaded`) stays under this threshold.
pub const START_NEW_DOWNLOADS_THRESHOLD: u64 = 16 * 1024 * 1024;

/// Below this size a file is fetched as one open-ended transfer; at or above
/// it the range planner consults block checksums and local candidates.
pub const MIN_SIZE_FOR_CHECKSUMS: u64 = 64 * 1024;

/// Files at least this large are offered to the peer accelerator first.
pub const MIN_SIZE_FOR_P2P: u64 = 1024 * 1024;

/// Block window of the delta planner.
pub const BLOCK_SIZE: u64 = 16 * 1024;

/// Read/write chunk for local copies and checksumming.
pub const COPY_BUFFER_SIZE: usize = 64 * 1024;

pub const SLEEP_ON_DISK_FULL: Duration = Duration::from_secs(10);
pub const SLEEP_ON_LOCKED_FILE: Duration = Duration::from_secs(10);
pub const SLEEP_ON_FAILED_DOWNLOAD: Duration = Duration::from_millis(200);
pub const SOCK_TIMEOUT_ON_EXCEPTION: Duration = Duration::from_secs(6);

/// Suffix of in-flight download bodies, next to the target name.
pub const APPEND_PARTIAL_FILES: &str = ".partial";

/// Inserted between a rescued previous partial and the partial suffix while a
/// new download is in flight (`<name>-old.partial`).
pub const OLD_PARTIAL_INFIX: &str = "-old";

/// Inserted before the extension when a user edit has to be moved aside.
pub const CONFLICT_MARKER: &str = " (conflicted)";
