//! Backup filename conventions shared by the local export and the remote copy.

use crate::models::bucket::BucketName;
use chrono::{Datelike, NaiveDateTime, Timelike};

pub const BACKUP_EXTENSION: &str = "bak";
pub const ZIP_EXTENSION: &str = "zip";

/// Which wall-clock components are appended to a backup filename.
///
/// With no suffix every export overwrites the previous one; a day suffix keeps
/// one file per day of month, an hour suffix one per hour.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SuffixPolicy {
    pub day: bool,
    pub hour: bool,
}

/// `<bucket>[_DD][_HH].bak`, using the local wall-clock time `at`.
pub fn backup_file_name(bucket: &BucketName, suffix: SuffixPolicy, at: NaiveDateTime) -> String {
    let mut name = bucket.as_str().to_string();
    if suffix.day {
        name.push_str(&format!("_{:02}", at.day()));
    }
    if suffix.hour {
        name.push_str(&format!("_{:02}", at.hour()));
    }
    format!("{name}.{BACKUP_EXTENSION}")
}

pub fn zip_file_name(name: &str) -> String {
    format!("{name}.{ZIP_EXTENSION}")
}
