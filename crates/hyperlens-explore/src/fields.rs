//! Parsing of `field=value` command-line arguments into typed values.

use chrono::{DateTime, NaiveDate, Utc};

use hyperlens_core::{
    EntityId, EntityType, FieldKind, FieldValue, Filter, Payload, Predicate, PrimitiveKind,
    ScalarValue,
};

use crate::error::{ExploreError, Result};

/// Split `name=value`. The value may itself contain `=`.
fn split(assignment: &str) -> Result<(&str, &str)> {
    assignment
        .split_once('=')
        .map(|(name, value)| (name.trim(), value))
        .filter(|(name, _)| !name.is_empty())
        .ok_or_else(|| ExploreError::InvalidAssignment {
            field: assignment.to_string(),
            reason: "expected name=value".to_string(),
        })
}

/// Parse a scalar of the declared primitive kind.
///
/// Dates accept RFC 3339 or a plain `YYYY-MM-DD` (midnight UTC).
pub fn parse_scalar(field: &str, primitive: PrimitiveKind, raw: &str) -> Result<ScalarValue> {
    let invalid = |reason: String| ExploreError::InvalidAssignment {
        field: field.to_string(),
        reason,
    };
    match primitive {
        PrimitiveKind::String => Ok(ScalarValue::String(raw.to_string())),
        PrimitiveKind::Number => raw
            .trim()
            .parse::<f64>()
            .map(ScalarValue::Number)
            .map_err(|e| invalid(format!("{raw:?} is not a number ({e})"))),
        PrimitiveKind::Boolean => match raw.trim() {
            "true" | "yes" | "1" => Ok(ScalarValue::Boolean(true)),
            "false" | "no" | "0" => Ok(ScalarValue::Boolean(false)),
            other => Err(invalid(format!("{other:?} is not a boolean"))),
        },
        PrimitiveKind::Date => parse_date(raw.trim())
            .map(ScalarValue::Date)
            .ok_or_else(|| invalid(format!("{raw:?} is not a date"))),
    }
}

fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Build a creation payload from `name=value` arguments.
///
/// Relation values are comma-separated entity ids. Names the type does not
/// declare are kept as strings, so schema validation reports them.
pub fn parse_payload(entity_type: &EntityType, assignments: &[String]) -> Result<Payload> {
    let mut payload = Payload::new();
    for assignment in assignments {
        let (name, raw) = split(assignment)?;
        let value = match entity_type.get(name).map(|f| &f.kind) {
            Some(FieldKind::Scalar { primitive, .. }) => {
                FieldValue::Scalar(parse_scalar(name, *primitive, raw)?)
            }
            Some(FieldKind::Relation { .. }) => FieldValue::Relation(
                raw.split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(EntityId::new)
                    .collect(),
            ),
            None => FieldValue::Scalar(ScalarValue::String(raw.to_string())),
        };
        payload.insert(name.to_string(), value);
    }
    Ok(payload)
}

/// Build an equality filter from `name=value` arguments.
pub fn parse_filter(entity_type: &EntityType, assignments: &[String]) -> Result<Filter> {
    let mut filter = Filter::new();
    for assignment in assignments {
        let (name, raw) = split(assignment)?;
        let value = match entity_type.get(name).map(|f| &f.kind) {
            Some(FieldKind::Scalar { primitive, .. }) => parse_scalar(name, *primitive, raw)?,
            _ => ScalarValue::String(raw.to_string()),
        };
        filter = filter.with(name, Predicate::Equals(value));
    }
    Ok(filter)
}
