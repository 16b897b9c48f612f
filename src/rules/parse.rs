//! Rule Text Parser
//!
//! Turns one configuration entry (`key = value`) into typed limits. The key
//! selects the parser; any key that is not a known structural key is a rate
//! rule whose key is the rate type.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::admission::QueueKind;
use crate::error::RuleError;

pub const KEY_MAX_PROJECTS: &str = "maxProjects";
pub const KEY_MAX_REPO_SIZE: &str = "maxRepoSize";
pub const KEY_MAX_TOTAL_SIZE: &str = "maxTotalSize";
pub const KEY_MAX_START_FOR_QUEUE: &str = "maxStartForQueue";
pub const KEY_MAX_START_FOR_TASK: &str = "maxStartForTask";
pub const KEY_MAX_START_FOR_TASK_FOR_QUEUE: &str = "maxStartForTaskForQueue";
pub const KEY_MAX_START_FOR_TASK_FOR_USER_FOR_QUEUE: &str = "maxStartForTaskForUserForQueue";
pub const KEY_SOFT_MAX_START_PER_USER_FOR_QUEUE: &str = "softMaxStartPerUserForQueue";
pub const KEY_MIN_START_FOR_QUEUE: &str = "minStartForQueue";

lazy_static! {
    static ref RATE_EXPR: Regex =
        Regex::new(r"(?i)^\s*(\d+)\s*(?:/\s*([a-z]+))?\s*(?:burst\s+(\d+))?\s*$")
            .expect("valid rate regex");
    static ref SIZE_EXPR: Regex =
        Regex::new(r"(?i)^\s*(\d+)\s*(?:([kmgt])(?:i?b)?|b)?\s*$").expect("valid size regex");
}

/// Raw value of a rule entry as it appears in TOML
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleValue {
    Integer(i64),
    Text(String),
    List(Vec<RuleValue>),
}

impl RuleValue {
    fn as_text(&self, key: &str) -> Result<String, RuleError> {
        match self {
            RuleValue::Integer(n) => Ok(n.to_string()),
            RuleValue::Text(s) => Ok(s.clone()),
            RuleValue::List(_) => Err(RuleError::UnsupportedValue(key.to_string())),
        }
    }
}

/// Time unit of a rate expression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    pub fn parse(unit: &str) -> Result<Self, RuleError> {
        match unit.to_lowercase().as_str() {
            "s" | "sec" | "second" | "seconds" => Ok(TimeUnit::Second),
            "m" | "min" | "minute" | "minutes" => Ok(TimeUnit::Minute),
            "h" | "hr" | "hour" | "hours" => Ok(TimeUnit::Hour),
            "d" | "day" | "days" => Ok(TimeUnit::Day),
            other => Err(RuleError::UnknownUnit(other.to_string())),
        }
    }

    /// Length of the unit in seconds
    pub fn seconds(&self) -> f64 {
        match self {
            TimeUnit::Second => 1.0,
            TimeUnit::Minute => 60.0,
            TimeUnit::Hour => 3600.0,
            TimeUnit::Day => 86400.0,
        }
    }
}

/// Parsed `<type> = <N> / <unit> burst <B>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Rate type, e.g. `uploadpack` or `restapi`
    pub rate_type: String,
    /// Requests per unit
    pub count: u64,
    pub unit: TimeUnit,
    /// Maximum requests in a burst after idling
    pub burst: u64,
}

impl RateLimit {
    /// Steady-state permits per second
    pub fn permits_per_second(&self) -> f64 {
        self.count as f64 / self.unit.seconds()
    }

    /// Permits per hour, as shown to users
    pub fn permits_per_hour(&self) -> f64 {
        self.permits_per_second() * 3600.0
    }

    /// Idle seconds needed to accumulate a full burst
    pub fn max_burst_seconds(&self) -> f64 {
        let rate = self.permits_per_second();
        if rate > 0.0 {
            self.burst as f64 / rate
        } else {
            0.0
        }
    }

    /// Whether `self` admits less traffic than `other`
    pub fn is_stricter_than(&self, other: &RateLimit) -> bool {
        let (a, b) = (self.permits_per_second(), other.permits_per_second());
        a < b || (a == b && self.burst < other.burst)
    }
}

/// Soft-max concurrency rule text, one variant per configuration key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskQuotaSpec {
    /// `maxStartForQueue = <N> <queue>`
    ForQueue { permits: usize, queue: QueueKind },
    /// `maxStartForTask = <N> <taskGroup>`
    ForTask { permits: usize, task_group: String },
    /// `maxStartForTaskForQueue = <N> <taskGroup> <queue>`
    ForTaskForQueue {
        permits: usize,
        task_group: String,
        queue: QueueKind,
    },
    /// `maxStartForTaskForUserForQueue = <N> <taskGroup> <user> <queue>`
    ForTaskForUserForQueue {
        permits: usize,
        task_group: String,
        user: String,
        queue: QueueKind,
    },
    /// `softMaxStartPerUserForQueue = <N> <queue>`
    SoftMaxPerUser { soft_max: usize, queue: QueueKind },
}

/// `minStartForQueue = <N> <queue>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationSpec {
    pub capacity: usize,
    pub queue: QueueKind,
}

/// One typed limit carried by a rule
#[derive(Debug, Clone, PartialEq)]
pub enum Limit {
    Rate(RateLimit),
    MaxConcurrent(TaskQuotaSpec),
    ReservedSlots(ReservationSpec),
    MaxProjects(u64),
    MaxRepoSize(u64),
    MaxTotalSize(u64),
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} = {} / {:?} burst {}",
            self.rate_type, self.count, self.unit, self.burst
        )
    }
}

/// Parse one configuration entry. Multi-valued keys yield one result per
/// element so that a single bad element does not hide the others.
pub fn parse_entry(key: &str, value: &RuleValue) -> Vec<Result<Limit, RuleError>> {
    match value {
        RuleValue::List(values) => values
            .iter()
            .flat_map(|v| match v {
                RuleValue::List(_) => vec![Err(RuleError::UnsupportedValue(key.to_string()))],
                v => parse_entry(key, v),
            })
            .collect(),
        single => vec![parse_single(key, single)],
    }
}

fn parse_single(key: &str, value: &RuleValue) -> Result<Limit, RuleError> {
    let text = value.as_text(key)?;
    match key {
        KEY_MAX_PROJECTS => parse_count(&text).map(Limit::MaxProjects),
        KEY_MAX_REPO_SIZE => parse_size(&text).map(Limit::MaxRepoSize),
        KEY_MAX_TOTAL_SIZE => parse_size(&text).map(Limit::MaxTotalSize),
        KEY_MIN_START_FOR_QUEUE => {
            let [capacity, queue] = split_fields::<2>(key, &text, "<N> <queue>")?;
            Ok(Limit::ReservedSlots(ReservationSpec {
                capacity: parse_count(capacity)? as usize,
                queue: QueueKind::parse(queue)?,
            }))
        }
        KEY_MAX_START_FOR_QUEUE
        | KEY_MAX_START_FOR_TASK
        | KEY_MAX_START_FOR_TASK_FOR_QUEUE
        | KEY_MAX_START_FOR_TASK_FOR_USER_FOR_QUEUE
        | KEY_SOFT_MAX_START_PER_USER_FOR_QUEUE => {
            parse_task_quota(key, &text).map(Limit::MaxConcurrent)
        }
        rate_type => parse_rate(rate_type, &text).map(Limit::Rate),
    }
}

/// Parse `<N> [/ <unit>] [burst <B>]`; unit defaults to hour, burst to N
pub fn parse_rate(rate_type: &str, text: &str) -> Result<RateLimit, RuleError> {
    let caps = RATE_EXPR
        .captures(text)
        .ok_or_else(|| RuleError::InvalidRate(text.to_string()))?;

    let count = parse_count(&caps[1])?;
    let unit = match caps.get(2) {
        Some(unit) => TimeUnit::parse(unit.as_str())?,
        None => TimeUnit::Hour,
    };
    let burst = match caps.get(3) {
        Some(burst) => parse_count(burst.as_str())?,
        None => count,
    };

    Ok(RateLimit {
        rate_type: rate_type.to_string(),
        count,
        unit,
        burst,
    })
}

/// Parse a byte size with an optional binary suffix (`k`, `m`, `g`, `t`)
pub fn parse_size(text: &str) -> Result<u64, RuleError> {
    let caps = SIZE_EXPR
        .captures(text)
        .ok_or_else(|| RuleError::InvalidSize(text.to_string()))?;
    let base: u64 = caps[1]
        .parse()
        .map_err(|_| RuleError::InvalidSize(text.to_string()))?;
    let shift = match caps.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
        None => 0,
        Some(s) if s == "k" => 10,
        Some(s) if s == "m" => 20,
        Some(s) if s == "g" => 30,
        Some(_) => 40,
    };
    base.checked_mul(1u64 << shift)
        .ok_or_else(|| RuleError::InvalidSize(text.to_string()))
}

fn parse_count(text: &str) -> Result<u64, RuleError> {
    text.trim()
        .parse()
        .map_err(|_| RuleError::InvalidCount(text.to_string()))
}

fn parse_task_quota(key: &str, text: &str) -> Result<TaskQuotaSpec, RuleError> {
    match key {
        KEY_MAX_START_FOR_QUEUE => {
            let [n, queue] = split_fields::<2>(key, text, "<N> <queue>")?;
            Ok(TaskQuotaSpec::ForQueue {
                permits: parse_count(n)? as usize,
                queue: QueueKind::parse(queue)?,
            })
        }
        KEY_MAX_START_FOR_TASK => {
            let [n, group] = split_fields::<2>(key, text, "<N> <taskGroup>")?;
            Ok(TaskQuotaSpec::ForTask {
                permits: parse_count(n)? as usize,
                task_group: group.to_string(),
            })
        }
        KEY_MAX_START_FOR_TASK_FOR_QUEUE => {
            let [n, group, queue] =
                split_fields::<3>(key, text, "<N> <taskGroup> <queue>")?;
            Ok(TaskQuotaSpec::ForTaskForQueue {
                permits: parse_count(n)? as usize,
                task_group: group.to_string(),
                queue: QueueKind::parse(queue)?,
            })
        }
        KEY_MAX_START_FOR_TASK_FOR_USER_FOR_QUEUE => {
            let [n, group, user, queue] =
                split_fields::<4>(key, text, "<N> <taskGroup> <user> <queue>")?;
            Ok(TaskQuotaSpec::ForTaskForUserForQueue {
                permits: parse_count(n)? as usize,
                task_group: group.to_string(),
                user: user.to_string(),
                queue: QueueKind::parse(queue)?,
            })
        }
        _ => {
            let [n, queue] = split_fields::<2>(key, text, "<N> <queue>")?;
            Ok(TaskQuotaSpec::SoftMaxPerUser {
                soft_max: parse_count(n)? as usize,
                queue: QueueKind::parse(queue)?,
            })
        }
    }
}

fn split_fields<'a, const N: usize>(
    key: &str,
    text: &'a str,
    expected: &'static str,
) -> Result<[&'a str; N], RuleError> {
    let fields: Vec<&str> = text.split_whitespace().collect();
    fields.try_into().map_err(|_| RuleError::InvalidTaskQuota {
        key: key.to_string(),
        value: text.to_string(),
        expected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> RuleValue {
        RuleValue::Text(s.to_string())
    }

    #[test]
    fn test_rate_full_expression() {
        let rate = parse_rate("uploadpack", "10 / min burst 20").unwrap();
        assert_eq!(rate.count, 10);
        assert_eq!(rate.unit, TimeUnit::Minute);
        assert_eq!(rate.burst, 20);
        assert!((rate.permits_per_second() - 10.0 / 60.0).abs() < 1e-9);
        assert!((rate.max_burst_seconds() - 120.0).abs() < 1e-9);
    }

    #[test]
    fn test_rate_defaults() {
        let rate = parse_rate("restapi", "30").unwrap();
        assert_eq!(rate.unit, TimeUnit::Hour);
        assert_eq!(rate.burst, 30);

        let rate = parse_rate("restapi", "5/s").unwrap();
        assert_eq!(rate.unit, TimeUnit::Second);
    }

    #[test]
    fn test_rate_unit_aliases() {
        for (unit, expected) in [
            ("sec", TimeUnit::Second),
            ("minute", TimeUnit::Minute),
            ("hr", TimeUnit::Hour),
            ("d", TimeUnit::Day),
        ] {
            let rate = parse_rate("t", &format!("1 / {} burst 2", unit)).unwrap();
            assert_eq!(rate.unit, expected);
        }
    }

    #[test]
    fn test_rate_invalid() {
        assert!(matches!(
            parse_rate("t", "ten per hour"),
            Err(RuleError::InvalidRate(_))
        ));
        assert!(matches!(
            parse_rate("t", "10 / fortnight"),
            Err(RuleError::UnknownUnit(_))
        ));
    }

    #[test]
    fn test_zero_rate_has_no_burst_window() {
        let rate = parse_rate("t", "0 / hour burst 5").unwrap();
        assert_eq!(rate.max_burst_seconds(), 0.0);
    }

    #[test]
    fn test_stricter() {
        let slow = parse_rate("t", "1 / min").unwrap();
        let fast = parse_rate("t", "1 / s").unwrap();
        assert!(slow.is_stricter_than(&fast));
        assert!(!fast.is_stricter_than(&slow));
    }

    #[test]
    fn test_size_suffixes() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("2 k").unwrap(), 2048);
        assert_eq!(parse_size("2m").unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_size("1 GiB").unwrap(), 1 << 30);
        assert_eq!(parse_size("1t").unwrap(), 1 << 40);
        assert!(parse_size("lots").is_err());
    }

    #[test]
    fn test_parse_entry_sizes() {
        let limits = parse_entry(KEY_MAX_REPO_SIZE, &text("2 m"));
        assert_eq!(limits, vec![Ok(Limit::MaxRepoSize(2 << 20))]);

        let limits = parse_entry(KEY_MAX_PROJECTS, &RuleValue::Integer(7));
        assert_eq!(limits, vec![Ok(Limit::MaxProjects(7))]);
    }

    #[test]
    fn test_parse_entry_reservation() {
        let limits = parse_entry(KEY_MIN_START_FOR_QUEUE, &text("2 batch"));
        assert_eq!(
            limits,
            vec![Ok(Limit::ReservedSlots(ReservationSpec {
                capacity: 2,
                queue: QueueKind::Batch,
            }))]
        );
    }

    #[test]
    fn test_parse_entry_task_quotas() {
        let limits = parse_entry(
            KEY_MAX_START_FOR_TASK_FOR_USER_FOR_QUEUE,
            &text("3 uploadpack alice interactive"),
        );
        assert_eq!(
            limits,
            vec![Ok(Limit::MaxConcurrent(TaskQuotaSpec::ForTaskForUserForQueue {
                permits: 3,
                task_group: "uploadpack".to_string(),
                user: "alice".to_string(),
                queue: QueueKind::Interactive,
            }))]
        );

        let limits = parse_entry(KEY_SOFT_MAX_START_PER_USER_FOR_QUEUE, &text("2 batch"));
        assert_eq!(
            limits,
            vec![Ok(Limit::MaxConcurrent(TaskQuotaSpec::SoftMaxPerUser {
                soft_max: 2,
                queue: QueueKind::Batch,
            }))]
        );
    }

    #[test]
    fn test_parse_entry_wrong_arity() {
        let limits = parse_entry(KEY_MAX_START_FOR_TASK_FOR_QUEUE, &text("3 uploadpack"));
        assert!(matches!(
            limits[0],
            Err(RuleError::InvalidTaskQuota { .. })
        ));
    }

    #[test]
    fn test_parse_entry_list_keeps_good_elements() {
        let value = RuleValue::List(vec![text("1 batch"), text("x batch"), text("2 interactive")]);
        let limits = parse_entry(KEY_MIN_START_FOR_QUEUE, &value);
        assert_eq!(limits.len(), 3);
        assert!(limits[0].is_ok());
        assert!(limits[1].is_err());
        assert!(limits[2].is_ok());
    }

    #[test]
    fn test_unknown_key_is_rate() {
        let limits = parse_entry("uploadpack", &text("10 / min burst 20"));
        assert!(matches!(&limits[0], Ok(Limit::Rate(r)) if r.rate_type == "uploadpack"));
    }
}
