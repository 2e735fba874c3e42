/// Application name.
pub const APP_NAME: &str = "Estafette";

/// One minute, in epoch seconds.
pub const MINUTE: i64 = 60;

/// One hour, in epoch seconds.
pub const HOUR: i64 = 60 * MINUTE;

/// One day, in epoch seconds.
pub const DAY: i64 = 24 * HOUR;

/// One week, in epoch seconds.
pub const WEEK: i64 = 7 * DAY;

/// One month (30 days), in epoch seconds.
pub const MONTH: i64 = 30 * DAY;

/// Maximum message body size in bytes (256 KiB).
pub const MAX_MESSAGE_SIZE: usize = 262_144;
