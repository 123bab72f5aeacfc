use std::convert::TryFrom;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};

use crate::db::models::IngestSource;
use crate::settings::SnapshotFormat;

pub fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("value {value} exceeds SQLite INTEGER range"))
}

pub fn to_u64(value: i64, field: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("{field} contains negative value {value}"))
}

pub fn to_u32(value: i64, field: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| anyhow!("{field} value {value} is out of range"))
}

pub fn parse_datetime(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("failed to parse {field}"))
}

pub fn format_as_str(format: SnapshotFormat) -> &'static str {
    match format {
        SnapshotFormat::Png => "png",
        SnapshotFormat::Jpeg => "jpeg",
    }
}

pub fn parse_format(value: &str) -> Result<SnapshotFormat> {
    match value {
        "png" => Ok(SnapshotFormat::Png),
        "jpeg" => Ok(SnapshotFormat::Jpeg),
        other => Err(anyhow!("unknown snapshot format {other}")),
    }
}

pub fn parse_source(value: &str) -> Result<IngestSource> {
    match value {
        "direct" => Ok(IngestSource::Direct),
        "spool" => Ok(IngestSource::Spool),
        other => Err(anyhow!("unknown ingest source {other}")),
    }
}
