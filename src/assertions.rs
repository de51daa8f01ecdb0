//! Assertion evaluation against a captured response.
//!
//! Evaluation is pure. A malformed assertion yields a failed result carrying
//! an error message; it never stops the remaining assertions from running.

use std::time::Duration;

use crate::model::{
    Assertion, AssertionKind, AssertionResult, AssertionValue, CapturedResponse, Operator,
};

/// Result of a single evaluation before it is attached to a record.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub passed: bool,
    pub actual: AssertionValue,
    pub error: Option<String>,
}

impl Evaluation {
    fn failed(actual: AssertionValue, error: impl Into<String>) -> Self {
        Self {
            passed: false,
            actual,
            error: Some(error.into()),
        }
    }
}

/// Evaluate one rule against a response and the measured round-trip time.
pub fn evaluate(
    kind: AssertionKind,
    field: Option<&str>,
    operator: Operator,
    expected: &AssertionValue,
    response: &CapturedResponse,
    duration: Duration,
) -> Evaluation {
    match kind {
        AssertionKind::Status => {
            let actual = AssertionValue::from(response.status_code);
            compared(actual, operator, expected)
        }
        AssertionKind::ResponseTime => {
            let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
            compared(AssertionValue::from(ms), operator, expected)
        }
        AssertionKind::BodyContains => {
            let body = response.body_text();
            let passed = body.contains(&expected.to_text());
            Evaluation {
                passed,
                actual: AssertionValue::Text(body),
                error: None,
            }
        }
        AssertionKind::HeaderExists => {
            let Some(name) = field.filter(|f| !f.is_empty()) else {
                return Evaluation::failed(
                    AssertionValue::Null,
                    "header_exists assertion requires a field",
                );
            };
            match response.header(name) {
                Some(value) => Evaluation {
                    passed: true,
                    actual: AssertionValue::Text(value.to_string()),
                    error: None,
                },
                None => Evaluation {
                    passed: false,
                    actual: AssertionValue::Null,
                    error: None,
                },
            }
        }
        AssertionKind::JsonPath => {
            let Some(path) = field else {
                return Evaluation::failed(
                    AssertionValue::Null,
                    "json_path assertion requires a field",
                );
            };
            let actual = json_path(&response.body, path);
            compared(actual, operator, expected)
        }
        AssertionKind::SchemaValidation => Evaluation::failed(
            AssertionValue::Null,
            "schema_validation assertions are not supported",
        ),
    }
}

/// Evaluate every assertion in order.
pub fn evaluate_all(
    assertions: &[Assertion],
    response: &CapturedResponse,
    duration: Duration,
) -> Vec<AssertionResult> {
    assertions
        .iter()
        .map(|assertion| {
            let eval = evaluate(
                assertion.kind,
                assertion.field.as_deref(),
                assertion.operator,
                &assertion.expected,
                response,
                duration,
            );
            AssertionResult {
                kind: assertion.kind,
                description: assertion.description.clone(),
                passed: eval.passed,
                expected: assertion.expected.clone(),
                actual: eval.actual,
                error: eval.error,
            }
        })
        .collect()
}

/// Apply an operator to an actual/expected pair.
pub fn compare(actual: &AssertionValue, operator: Operator, expected: &AssertionValue) -> bool {
    match operator {
        Operator::Equals => actual.loose_eq(expected),
        Operator::NotEquals => !actual.loose_eq(expected),
        Operator::Contains => actual.to_text().contains(&expected.to_text()),
        Operator::NotContains => !actual.to_text().contains(&expected.to_text()),
        Operator::GreaterThan => actual.to_number() > expected.to_number(),
        Operator::LessThan => actual.to_number() < expected.to_number(),
        Operator::Exists => !actual.is_null(),
        Operator::NotExists => actual.is_null(),
    }
}

fn compared(actual: AssertionValue, operator: Operator, expected: &AssertionValue) -> Evaluation {
    Evaluation {
        passed: compare(&actual, operator, expected),
        actual,
        error: None,
    }
}

/// Walk a dot-separated path. Any missing segment yields null.
///
/// Numeric segments index into arrays (`items.0.id`).
pub fn json_path(body: &serde_json::Value, path: &str) -> AssertionValue {
    let mut current = body;
    for segment in path.split('.') {
        let next = match current {
            serde_json::Value::Object(map) => map.get(segment),
            serde_json::Value::Array(items) => segment
                .parse::<usize>()
                .ok()
                .and_then(|idx| items.get(idx)),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            None => return AssertionValue::Null,
        }
    }
    AssertionValue::from_json(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn response(status: u16, body: serde_json::Value) -> CapturedResponse {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        CapturedResponse {
            status_code: status,
            headers,
            size: body.to_string().len() as u64,
            body,
            response_time_ms: 120,
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_status_equals() {
        let ok = evaluate(
            AssertionKind::Status,
            None,
            Operator::Equals,
            &AssertionValue::Number(200.0),
            &response(200, json!(null)),
            ms(10),
        );
        assert!(ok.passed);
        assert_eq!(ok.actual, AssertionValue::Number(200.0));

        let missing = evaluate(
            AssertionKind::Status,
            None,
            Operator::Equals,
            &AssertionValue::Number(200.0),
            &response(404, json!(null)),
            ms(10),
        );
        assert!(!missing.passed);
        assert_eq!(missing.actual, AssertionValue::Number(404.0));
        assert!(missing.error.is_none());
    }

    #[test]
    fn test_operator_truth_table() {
        use AssertionValue as V;
        let cases: Vec<(V, Operator, V, bool)> = vec![
            (V::Number(200.0), Operator::GreaterThan, V::Number(199.0), true),
            (V::Number(199.0), Operator::GreaterThan, V::Number(199.0), false),
            (V::Number(150.0), Operator::LessThan, V::from("200"), true),
            (V::from("abc"), Operator::LessThan, V::Number(5.0), false),
            (V::Number(200.0), Operator::Equals, V::from("200"), true),
            (V::Number(200.0), Operator::NotEquals, V::Number(201.0), true),
            (V::Null, Operator::NotEquals, V::Null, false),
            (V::from("hello world"), Operator::Contains, V::from("world"), true),
            (V::Number(12345.0), Operator::Contains, V::Number(234.0), true),
            (V::from("hello"), Operator::NotContains, V::from("bye"), true),
            (V::Null, Operator::Exists, V::Null, false),
            (V::Bool(false), Operator::Exists, V::Null, true),
            (V::Null, Operator::NotExists, V::Null, true),
            (V::from(""), Operator::NotExists, V::Null, false),
        ];
        for (actual, op, expected, want) in cases {
            assert_eq!(
                compare(&actual, op, &expected),
                want,
                "{:?} {:?} {:?}",
                actual,
                op,
                expected
            );
            // deterministic
            assert_eq!(compare(&actual, op, &expected), want);
        }
    }

    #[test]
    fn test_response_time_uses_measured_duration() {
        let eval = evaluate(
            AssertionKind::ResponseTime,
            None,
            Operator::LessThan,
            &AssertionValue::Number(500.0),
            &response(200, json!(null)),
            ms(321),
        );
        assert!(eval.passed);
        assert_eq!(eval.actual, AssertionValue::Number(321.0));
    }

    #[test]
    fn test_body_contains() {
        let resp = response(200, json!({"status": "healthy"}));
        let eval = evaluate(
            AssertionKind::BodyContains,
            None,
            Operator::Equals,
            &AssertionValue::from("healthy"),
            &resp,
            ms(1),
        );
        assert!(eval.passed);
        assert_eq!(eval.actual, AssertionValue::from(r#"{"status":"healthy"}"#));

        let text = response(200, json!("plain text body"));
        let eval = evaluate(
            AssertionKind::BodyContains,
            None,
            Operator::Equals,
            &AssertionValue::from("missing"),
            &text,
            ms(1),
        );
        assert!(!eval.passed);
        assert_eq!(eval.actual, AssertionValue::from("plain text body"));
    }

    #[test]
    fn test_header_exists() {
        let resp = response(200, json!(null));
        let present = evaluate(
            AssertionKind::HeaderExists,
            Some("Content-Type"),
            Operator::Exists,
            &AssertionValue::Null,
            &resp,
            ms(1),
        );
        assert!(present.passed);
        assert_eq!(present.actual, AssertionValue::from("application/json"));

        let absent = evaluate(
            AssertionKind::HeaderExists,
            Some("X-Trace-Id"),
            Operator::Exists,
            &AssertionValue::Null,
            &resp,
            ms(1),
        );
        assert!(!absent.passed);
        assert_eq!(absent.actual, AssertionValue::Null);
    }

    #[test]
    fn test_json_path() {
        let body = json!({"data": {"items": [{"id": 7}], "count": 1, "ok": true}});
        assert_eq!(json_path(&body, "data.count"), AssertionValue::Number(1.0));
        assert_eq!(json_path(&body, "data.items.0.id"), AssertionValue::Number(7.0));
        assert_eq!(json_path(&body, "data.ok"), AssertionValue::Bool(true));
        assert_eq!(json_path(&body, "data.missing.deeper"), AssertionValue::Null);
        assert_eq!(json_path(&json!("text"), "a"), AssertionValue::Null);

        let eval = evaluate(
            AssertionKind::JsonPath,
            Some("data.count"),
            Operator::GreaterThan,
            &AssertionValue::Number(0.0),
            &response(200, body),
            ms(1),
        );
        assert!(eval.passed);
    }

    #[test]
    fn test_malformed_assertions_fail_without_aborting() {
        let assertions = vec![
            Assertion::new(AssertionKind::JsonPath, Operator::Equals, 1.0),
            Assertion::new(AssertionKind::SchemaValidation, Operator::Equals, AssertionValue::Null),
            Assertion::new(AssertionKind::Status, Operator::Equals, 200u16),
        ];
        let results = evaluate_all(&assertions, &response(200, json!({})), ms(5));
        assert_eq!(results.len(), 3);
        assert!(!results[0].passed);
        assert!(results[0].error.as_deref().unwrap().contains("requires a field"));
        assert!(!results[1].passed);
        assert!(results[1].error.as_deref().unwrap().contains("not supported"));
        assert!(results[2].passed);
        assert!(results[2].error.is_none());
    }
}
