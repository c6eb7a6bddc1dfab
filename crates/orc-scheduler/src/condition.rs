//! `lhs OP rhs` condition language (spec §4.6.1).

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Le,
    Ge,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConditionError {
    #[error("malformed condition '{0}': expected 'lhs OP rhs' with OP in {{==, !=, <=, >=}}")]
    Malformed(String),
    #[error("malformed rhs literal '{0}'")]
    BadLiteral(String),
}

/// Evaluate `condition` against `context`. A `None` condition (no
/// `condition` on the StepDef) is always true.
pub fn evaluate(condition: Option<&str>, context: &Value) -> Result<bool, ConditionError> {
    let Some(condition) = condition else {
        return Ok(true);
    };
    let (lhs_path, op, rhs_literal) = parse(condition)?;
    let lhs = resolve_path(context, &lhs_path);
    let rhs = parse_literal(&rhs_literal)?;

    // "any OP against null is false" (spec §4.6.1), including equality.
    if lhs.is_null() {
        return Ok(false);
    }

    Ok(match op {
        Op::Eq => lhs == rhs,
        Op::Ne => lhs != rhs,
        Op::Le => compare(&lhs, &rhs).map(|o| o != std::cmp::Ordering::Greater).unwrap_or(false),
        Op::Ge => compare(&lhs, &rhs).map(|o| o != std::cmp::Ordering::Less).unwrap_or(false),
    })
}

fn parse(condition: &str) -> Result<(String, Op, String), ConditionError> {
    for (token, op) in [("==", Op::Eq), ("!=", Op::Ne), ("<=", Op::Le), (">=", Op::Ge)] {
        if let Some(idx) = condition.find(token) {
            let lhs = condition[..idx].trim().to_string();
            let rhs = condition[idx + token.len()..].trim().to_string();
            if lhs.is_empty() || rhs.is_empty() {
                return Err(ConditionError::Malformed(condition.to_string()));
            }
            return Ok((lhs, op, rhs));
        }
    }
    Err(ConditionError::Malformed(condition.to_string()))
}

fn parse_literal(raw: &str) -> Result<Value, ConditionError> {
    if let Some(inner) = raw.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        return Ok(Value::String(inner.to_string()));
    }
    match raw {
        "true" => return Ok(Value::Bool(true)),
        "false" => return Ok(Value::Bool(false)),
        _ => {}
    }
    raw.parse::<i64>()
        .map(Value::from)
        .or_else(|_| raw.parse::<f64>().map(|f| serde_json::json!(f)))
        .map_err(|_| ConditionError::BadLiteral(raw.to_string()))
}

/// Resolve a `$.a.b.c` path. Leading `$.` is optional. Missing segments
/// resolve to `Value::Null`.
fn resolve_path(context: &Value, path: &str) -> Value {
    let path = path.strip_prefix("$.").or_else(|| path.strip_prefix('$')).unwrap_or(path);
    let mut current = context;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        match current.get(segment) {
            Some(next) => current = next,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn compare(lhs: &Value, rhs: &Value) -> Option<std::cmp::Ordering> {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_condition_is_true() {
        assert!(evaluate(None, &serde_json::json!({})).unwrap());
    }

    #[test]
    fn equality_against_step_output() {
        let ctx = serde_json::json!({"step_a": {"status": "ok"}});
        assert!(evaluate(Some("$.step_a.status == \"ok\""), &ctx).unwrap());
        assert!(!evaluate(Some("$.step_a.status == \"fail\""), &ctx).unwrap());
    }

    #[test]
    fn absent_path_compares_false_even_for_equality() {
        let ctx = serde_json::json!({});
        assert!(!evaluate(Some("$.missing == \"x\""), &ctx).unwrap());
        assert!(!evaluate(Some("$.missing != \"x\""), &ctx).unwrap());
    }

    #[test]
    fn numeric_comparisons() {
        let ctx = serde_json::json!({"variables": {"score": 7}});
        assert!(evaluate(Some("$.variables.score >= 5"), &ctx).unwrap());
        assert!(!evaluate(Some("$.variables.score <= 5"), &ctx).unwrap());
    }

    #[test]
    fn malformed_condition_rejected() {
        assert!(matches!(
            evaluate(Some("no operator here"), &serde_json::json!({})),
            Err(ConditionError::Malformed(_))
        ));
    }
}
