//! Parsing boundary for loosely shaped comment records.
//!
//! Pages deliver comments as untyped JSON. [`parse_record`] turns one of them
//! into a typed [`CommentRecord`] or reports it as malformed; nothing past
//! this module touches raw JSON except to persist it verbatim.
//!
//! Accepted shapes, by field:
//!
//! | Field | Keys tried |
//! |-------|-----------|
//! | id | `id`, `commentId` |
//! | text | `content` |
//! | time | `createTime`, `create_time`, `time`, `timestamp` |
//! | author | `userInfo.nickname`, `user_info.nickname`, `nickname` |
//! | images | `pictures`, `images`, `pics` |
//!
//! Times may be epoch numbers (milliseconds, or seconds when small), numeric
//! strings, ISO-8601 strings, or relative phrases such as `3小时前`.

use chrono::{Datelike, DateTime, Local, NaiveDate, NaiveDateTime, TimeDelta, TimeZone, Utc};
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::storage::sha256_hex;

/// Author name used when a record names nobody.
pub const ANONYMOUS_AUTHOR: &str = "anonymous";

/// Epoch values below this are taken to be seconds.
const SECONDS_CUTOFF: i64 = 100_000_000_000;

static RELATIVE_TIME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)\s*(秒|分钟|小时|天|周)前").expect("static regex"));
static MONTH_DAY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{1,2})-(\d{1,2})$").expect("static regex"));

/// A comment record that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct CommentRecord {
    pub comment_id: Option<String>,
    pub author: String,
    pub author_id: Option<String>,
    pub timestamp_ms: i64,
    pub content: String,
    /// Image URLs in delivery order, duplicates removed.
    pub image_urls: Vec<String>,
    pub ip_location: Option<String>,
    pub like_count: Option<String>,
    pub reply_count: Option<String>,
    /// The record exactly as delivered.
    pub raw: Value,
}

impl CommentRecord {
    pub fn dedup_key(&self) -> String {
        dedup_key(&self.author, self.timestamp_ms, &self.content)
    }
}

/// Result of parsing one raw record.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedRecord {
    Comment(CommentRecord),
    Malformed(String),
}

/// Stable identity of a comment: hex SHA-256 over
/// `author \0 timestamp \0 sha256(content)`.
pub fn dedup_key(author: &str, timestamp_ms: i64, content: &str) -> String {
    let material = format!("{}\0{}\0{}", author, timestamp_ms, sha256_hex(content.as_bytes()));
    sha256_hex(material.as_bytes())
}

/// Parse one raw record. Relative times resolve against `reference`.
pub fn parse_record(raw: &Value, reference: DateTime<Local>) -> ParsedRecord {
    let Some(obj) = raw.as_object() else {
        return ParsedRecord::Malformed("record is not an object".into());
    };

    let content = obj
        .get("content")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default()
        .to_string();
    let image_urls = extract_image_urls(raw);
    if content.is_empty() && image_urls.is_empty() {
        return ParsedRecord::Malformed("record has neither text nor images".into());
    }

    let time_value = ["createTime", "create_time", "time", "timestamp"]
        .iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| !v.is_null());
    let Some(time_value) = time_value else {
        return ParsedRecord::Malformed("record has no timestamp".into());
    };
    let Some(timestamp_ms) = parse_timestamp(time_value, reference) else {
        return ParsedRecord::Malformed(format!("unparseable timestamp {time_value}"));
    };

    let user = obj.get("userInfo").or_else(|| obj.get("user_info"));
    let author = user
        .and_then(|u| u.get("nickname"))
        .or_else(|| obj.get("nickname"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(ANONYMOUS_AUTHOR)
        .to_string();
    let author_id = user
        .and_then(|u| u.get("userId").or_else(|| u.get("user_id")))
        .or_else(|| obj.get("userId"))
        .and_then(scalar_string);

    ParsedRecord::Comment(CommentRecord {
        comment_id: obj
            .get("id")
            .or_else(|| obj.get("commentId"))
            .and_then(scalar_string),
        author,
        author_id,
        timestamp_ms,
        content,
        image_urls,
        ip_location: obj.get("ipLocation").and_then(scalar_string),
        like_count: obj.get("likeCount").and_then(scalar_string),
        reply_count: obj.get("subCommentCount").and_then(scalar_string),
        raw: raw.clone(),
    })
}

/// Non-empty string form of a string or number.
fn scalar_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Interpret a timestamp field as epoch milliseconds.
pub fn parse_timestamp(v: &Value, reference: DateTime<Local>) -> Option<i64> {
    match v {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .filter(|ms| *ms > 0)
            .map(normalize_epoch),
        Value::String(s) => parse_time_string(s.trim(), reference),
        _ => None,
    }
}

fn normalize_epoch(value: i64) -> i64 {
    if value < SECONDS_CUTOFF {
        value * 1000
    } else {
        value
    }
}

/// Parse the string forms a page may show for a comment time.
pub fn parse_time_string(s: &str, reference: DateTime<Local>) -> Option<i64> {
    if s.is_empty() {
        return None;
    }
    if s == "刚刚" {
        return Some(reference.timestamp_millis());
    }
    if let Some(caps) = RELATIVE_TIME.captures(s) {
        let n: i64 = caps[1].parse().ok()?;
        let delta = match &caps[2] {
            "秒" => TimeDelta::try_seconds(n),
            "分钟" => TimeDelta::try_minutes(n),
            "小时" => TimeDelta::try_hours(n),
            "天" => TimeDelta::try_days(n),
            _ => TimeDelta::try_weeks(n),
        }?;
        return reference
            .checked_sub_signed(delta)
            .map(|dt| dt.timestamp_millis());
    }
    if let Some(rest) = s.strip_prefix("昨天") {
        let day = reference.date_naive().pred_opt()?;
        return local_millis(day, rest.trim());
    }
    if s.contains('T') {
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Some(dt.with_timezone(&Utc).timestamp_millis());
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
            return Local.from_local_datetime(&naive).earliest().map(|dt| dt.timestamp_millis());
        }
        return None;
    }
    if let Ok(n) = s.parse::<f64>() {
        return (n > 0.0).then(|| normalize_epoch(n as i64));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Local.from_local_datetime(&naive).earliest().map(|dt| dt.timestamp_millis());
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return local_millis(date, "");
    }
    if let Some(caps) = MONTH_DAY.captures(s) {
        let date = NaiveDate::from_ymd_opt(
            reference.year(),
            caps[1].parse().ok()?,
            caps[2].parse().ok()?,
        )?;
        return local_millis(date, "");
    }
    None
}

fn local_millis(date: NaiveDate, hhmm: &str) -> Option<i64> {
    let time = if hhmm.is_empty() {
        chrono::NaiveTime::MIN
    } else {
        chrono::NaiveTime::parse_from_str(hhmm, "%H:%M").ok()?
    };
    Local
        .from_local_datetime(&date.and_time(time))
        .earliest()
        .map(|dt| dt.timestamp_millis())
}

/// Image URLs attached to a record, in order, without repeats.
pub fn extract_image_urls(raw: &Value) -> Vec<String> {
    let list = ["pictures", "images", "pics"]
        .iter()
        .filter_map(|k| raw.get(*k))
        .find_map(Value::as_array);
    let Some(list) = list else {
        return Vec::new();
    };
    list.iter()
        .filter_map(image_url)
        .map(normalize_image_url)
        .filter(|u| u.starts_with("http://") || u.starts_with("https://"))
        .unique()
        .collect()
}

fn image_url(item: &Value) -> Option<String> {
    match item {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => ["urlDefault", "url_default", "url", "src", "urlPre"]
            .iter()
            .filter_map(|k| map.get(*k).and_then(Value::as_str))
            .find(|s| !s.trim().is_empty())
            .map(str::to_string),
        _ => None,
    }
}

fn normalize_image_url(url: String) -> String {
    let url = url.trim();
    match url.strip_prefix("//") {
        Some(rest) => format!("https://{rest}"),
        None => url.to_string(),
    }
}
