// ABOUTME: Construction timestamps and the image/container names derived from them
// ABOUTME: One stamp per sandbox keeps names readable and distinct across runs

use chrono::{DateTime, Local, TimeZone};

/// Format of the construction stamp, e.g. `2015.06.17_14.03.09`
pub const TIME_FMT: &str = "%Y.%m.%d_%H.%M.%S";

pub const DEVAPPSERVER_CONTAINER: &str = "devappserver";
pub const DEVAPPSERVER_IMAGE_BASE: &str = "devappserver_image";
pub const APP_CONTAINER: &str = "test_app";
pub const APP_IMAGE_BASE: &str = "app_image";

/// Stamp for the current local time
pub fn current_stamp() -> String {
    stamp_for(&Local::now())
}

pub fn stamp_for<Tz: TimeZone>(time: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    time.format(TIME_FMT).to_string()
}

/// `<base>.<stamp>`
pub fn timestamped_name(base: &str, stamp: &str) -> String {
    format!("{}.{}", base, stamp)
}
