//! Timestamp formats shared by the data log and the replay loader.
//!
//! The CSV `time` column and the replay parser agree on a single ISO-8601
//! shape with centisecond precision; run directories use an
//! underscore-separated stamp safe for filenames.

use chrono::{DateTime, NaiveDateTime, Utc};

/// CSV timestamp format: `YYYY-MM-DDThh:mm:ss.SS`.
const CSV_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.2f";

/// Run-directory stamp format: `YYYY_MM_DD_hh_mm_ss`.
const RUN_DIR_FORMAT: &str = "%Y_%m_%d_%H_%M_%S";

/// Formats a timestamp for the CSV `time` column.
pub fn csv_timestamp(at: DateTime<Utc>) -> String {
    at.format(CSV_FORMAT).to_string()
}

/// Parses a CSV `time` column value. Accepts any sub-second precision.
pub fn parse_csv_timestamp(text: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(text.trim(), "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Formats the per-run data-log directory name.
pub fn run_dir_stamp(at: DateTime<Utc>) -> String {
    at.format(RUN_DIR_FORMAT).to_string()
}
