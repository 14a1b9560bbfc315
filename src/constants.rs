/// Prefix every event record carries on the wire.
pub const DEFAULT_EVENT_PREFIX: &str = "data: ";

/// Explicit terminal tokens, equivalent to end of stream.
pub const TERMINAL_TOKENS: &[&str] = &["[DONE]"];

/// In-band sentinels and the marker each one maps to.
pub const LOADER_START_SENTINEL: &str = "<<LOADER_START>>";
pub const LOADER_END_SENTINEL: &str = "<<LOADER_END>>";
pub const AGENT_DELIBERATING_SENTINEL: &str = "<<PRO_AGENT_THINKING>>";
pub const IGNORE_SENTINELS: &[&str] = &["<<PROGRESS>>", "<<HEARTBEAT>>", ": keep-alive"];

/// Structured payload tags
pub const TAG_CITATIONS: &str = "citations";
pub const TAG_WEB_RESOURCES: &str = "web_resources";
pub const TAG_PAGE_SPEED: &str = "page_speed";
pub const TAG_IMAGES: &str = "images";
pub const TAG_VIDEO: &str = "video";
pub const KNOWN_PAYLOAD_TAGS: &[&str] = &[
    TAG_CITATIONS,
    TAG_WEB_RESOURCES,
    TAG_PAGE_SPEED,
    TAG_IMAGES,
    TAG_VIDEO,
];

/// Metadata key holding payloads whose tag nobody recognized.
pub const PROVIDER_EXTRA_KEY: &str = "provider_extra";

/// Records a straddling payload may span before it is given up as text.
pub const MAX_PENDING_PAYLOAD_RECORDS: usize = 64;
pub const MAX_RECORD_BYTES: usize = 1024 * 1024;

pub const SOURCES_HEADING: &str = "### Sources";

/// Placeholders substituted for unreadable persisted records
pub const DECRYPT_ERROR_PLACEHOLDER: &str = "Error decrypting message";
pub const PARSE_ERROR_PLACEHOLDER: &str = "Error parsing message";

/// Real-time and store defaults
pub const DEFAULT_REALTIME_CAPACITY: usize = 1024;
pub const STORE_COMMAND_CAPACITY: usize = 256;
pub const DEFAULT_HISTORY_PAGE_SIZE: u32 = 20;

/// Database defaults
pub const DB_CLEANUP_RETENTION_DAYS: i64 = 90;
pub const DB_PRAGMAS: &[&str] = &[
    "PRAGMA journal_mode = WAL",
    "PRAGMA synchronous = NORMAL",
    "PRAGMA busy_timeout = 5000",
];
