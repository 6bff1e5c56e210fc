/// Application name
pub const APP_NAME: &str = "murmur";

/// Avatar shown for the current user when the profile carries none
pub const DEFAULT_AVATAR_URL: &str =
    "https://cdn.pixabay.com/photo/2021/01/24/20/47/tabby-5946499_1280.jpg";

/// Base URL for avatars generated from a user name (`?seed=<name>` is appended)
pub const GENERATED_AVATAR_BASE: &str = "https://api.dicebear.com/5.x/avataaars/svg";

/// Default base URL of the data-fetch API
pub const DEFAULT_API_URL: &str = "http://localhost:8085";

/// Default event stream endpoint
pub const DEFAULT_STREAM_URL: &str = "ws://localhost:8085/ws";

/// Default timeout for a single fetch, in seconds
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// A typing entry without a refreshing start event is evicted after this many seconds
pub const DEFAULT_TYPING_TIMEOUT_SECS: u64 = 6;

/// Reconnect backoff bounds, in milliseconds
pub const DEFAULT_RECONNECT_MIN_MS: u64 = 500;
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 30_000;

/// Outbound events buffered while the stream is down; later emits are dropped
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;
