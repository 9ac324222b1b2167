//! Client configuration constants.
//!
//! Centralizes hardcoded values for easier configuration and documentation.

use std::time::Duration;

/// Default hub endpoint for local development.
pub const DEFAULT_HUB_URL: &str = "ws://localhost:5000/chathub";

/// Default REST API base for local development.
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:5000/api";

/// Query parameter carrying the user id on the hub URL.
pub const HUB_USER_QUERY_PARAM: &str = "userId";

/// Timeout for the WebSocket connect + hub handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Timeout for every request/response round trip (REST calls, hub invocations).
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// First reconnect delay.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(5);

/// Reconnect delays never exceed this.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Growth factor between consecutive reconnect delays.
pub const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Fraction of each delay randomized away (0.2 = up to ±20%).
pub const BACKOFF_JITTER: f64 = 0.2;

/// Interval between client keep-alive pings on an idle hub link.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Max distance between an optimistic send and its server echo.
pub const ECHO_TOLERANCE: Duration = Duration::from_secs(5);

/// Capacity of the connection status broadcast.
pub const STATUS_CHANNEL_CAPACITY: usize = 64;

/// Capacity of the inbound/outbound frame channels of one hub link.
pub const LINK_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the notification fan-out broadcast.
pub const NOTIFICATION_CHANNEL_CAPACITY: usize = 64;
