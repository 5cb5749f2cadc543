//! Lenient field decoders.
//!
//! The REST API and the mirror database disagree on primitive encodings: the API returns
//! account references as objects and timestamps as RFC 3339, MySQL returns plain account
//! names, `0000-00-00` sentinels and numbers rendered as strings. Raw records from both
//! sources pass through these helpers so Extract sees one shape.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Account reference: `"admin"`, `{"account": "admin", ...}` or null.
pub fn account_name<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Object(map)) => map
            .get("account")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
        _ => String::new(),
    })
}

pub fn datetime<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => parse_datetime(&s),
        _ => None,
    })
}

/// Parses the timestamp spellings seen across API versions and MySQL; zero dates are `None`.
pub fn parse_datetime(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() || text.starts_with("0000-00-00") {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// `true`, `1`, `"1"`, `"true"` are true; anything else is false.
pub fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Bool(b)) => b,
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
        Some(Value::String(s)) => matches!(s.trim(), "1" | "true" | "TRUE" | "True"),
        _ => false,
    })
}

pub fn float<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or_default(),
        Some(Value::String(s)) => s.trim().parse().unwrap_or_default(),
        _ => 0.0,
    })
}

pub fn int<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or_default(),
        Some(Value::String(s)) => s.trim().parse().unwrap_or_default(),
        Some(Value::Object(map)) => map.get("id").and_then(Value::as_i64).unwrap_or_default(),
        _ => 0,
    })
}

pub fn text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => s,
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct Sample {
        #[serde(default, deserialize_with = "account_name")]
        who: String,
        #[serde(default, deserialize_with = "datetime")]
        when: Option<DateTime<Utc>>,
        #[serde(default, deserialize_with = "flag")]
        deleted: bool,
        #[serde(default, deserialize_with = "float")]
        hours: f64,
        #[serde(default, deserialize_with = "int")]
        parent: i64,
    }

    #[test]
    fn api_and_database_spellings_agree() {
        let from_api: Sample = serde_json::from_value(json!({
            "who": {"id": 1, "account": "admin", "realname": "Admin"},
            "when": "2023-03-01T08:30:00Z",
            "deleted": false,
            "hours": 2.5,
            "parent": {"id": 7, "name": "parent task"}
        }))
        .unwrap();
        let from_db: Sample = serde_json::from_value(json!({
            "who": "admin",
            "when": "2023-03-01 08:30:00.000000",
            "deleted": "0",
            "hours": "2.5",
            "parent": "7"
        }))
        .unwrap();

        let expected = Utc.with_ymd_and_hms(2023, 3, 1, 8, 30, 0).single().unwrap();
        for sample in [from_api, from_db] {
            assert_eq!(sample.who, "admin");
            assert_eq!(sample.when, Some(expected));
            assert!(!sample.deleted);
            assert_eq!(sample.hours, 2.5);
            assert_eq!(sample.parent, 7);
        }
    }

    #[test]
    fn zero_dates_and_nulls_decode_to_defaults() {
        let sample: Sample = serde_json::from_value(json!({
            "who": null,
            "when": "0000-00-00 00:00:00",
            "deleted": "1",
            "hours": null
        }))
        .unwrap();
        assert_eq!(sample.who, "");
        assert_eq!(sample.when, None);
        assert!(sample.deleted);
        assert_eq!(sample.hours, 0.0);
        assert_eq!(sample.parent, 0);
    }

    #[test]
    fn plain_dates_parse_as_midnight() {
        let ts = parse_datetime("2024-01-31").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).single().unwrap());
    }
}
