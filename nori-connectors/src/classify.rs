use color_eyre::Report;
use nori_common::metrics::{
    ERROR_CONNECTION, ERROR_MISSING_FIELD, ERROR_MISSING_INDEX, ERROR_NEW_INDEX,
    ERROR_RESULT_WINDOW, ERROR_UNKNOWN,
};
use serde_json::Value;

use crate::ConnectorError;

/// Semantic fault behind an opaque store error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    ConnectionFailure(String),
    MissingIndex(String),
    /// The index exists but cannot serve searches yet.
    NewIndex,
    MissingField(String),
    ResultWindowOverflow(u64),
    Unclassified,
}

impl Fault {
    pub fn label(&self) -> &'static str {
        match self {
            Fault::ConnectionFailure(..) => ERROR_CONNECTION,
            Fault::MissingIndex(..) => ERROR_MISSING_INDEX,
            Fault::NewIndex => ERROR_NEW_INDEX,
            Fault::MissingField(..) => ERROR_MISSING_FIELD,
            Fault::ResultWindowOverflow(..) => ERROR_RESULT_WINDOW,
            Fault::Unclassified => ERROR_UNKNOWN,
        }
    }
}

pub fn classify(err: &Report) -> Fault {
    match err.downcast_ref::<ConnectorError>() {
        Some(ConnectorError::Http(e)) => Fault::ConnectionFailure(e.to_string()),
        Some(ConnectorError::ServerResp(_, body)) => classify_payload(body),
        None => Fault::Unclassified,
    }
}

struct Cause<'a> {
    kind: &'a str,
    reason: &'a str,
    index: Option<&'a str>,
}

fn collect_causes<'a>(error: &'a Value, causes: &mut Vec<Cause<'a>>) {
    match error {
        Value::String(reason) => causes.push(Cause {
            kind: "",
            reason,
            index: None,
        }),
        Value::Object(map) => {
            causes.push(Cause {
                kind: map.get("type").and_then(Value::as_str).unwrap_or_default(),
                reason: map.get("reason").and_then(Value::as_str).unwrap_or_default(),
                index: map
                    .get("index")
                    .or_else(|| map.get("resource.id"))
                    .and_then(Value::as_str),
            });
            for key in ["root_cause", "failed_shards"] {
                if let Some(Value::Array(nested)) = map.get(key) {
                    for cause in nested {
                        collect_causes(cause, causes);
                    }
                }
            }
            for key in ["reason", "caused_by"] {
                if let Some(nested @ Value::Object(_)) = map.get(key) {
                    collect_causes(nested, causes);
                }
            }
        }
        _ => {}
    }
}

/// The text between the brackets that follow `marker`, e.g. `[name]`.
fn bracketed_after<'a>(reason: &'a str, marker: &str) -> Option<&'a str> {
    let rest = &reason[reason.find(marker)? + marker.len()..];
    let rest = &rest[rest.find('[')? + 1..];
    Some(&rest[..rest.find(']')?])
}

/// Classifies an error payload as returned in the body of a failed search.
pub fn classify_payload(body: &str) -> Fault {
    let payload: Value = serde_json::from_str(body).unwrap_or_else(|_| Value::from(body));
    let error = payload.get("error").unwrap_or(&payload);

    let mut causes = Vec::new();
    collect_causes(error, &mut causes);

    if let Some(cause) = causes.iter().find(|c| c.kind == "index_not_found_exception") {
        let index = cause
            .index
            .or_else(|| bracketed_after(cause.reason, "no such index"))
            .unwrap_or_default();
        return Fault::MissingIndex(index.to_string());
    }

    for cause in &causes {
        if let Some(limit) = bracketed_after(cause.reason, "Result window is too large")
            .and_then(|limit| limit.parse().ok())
        {
            return Fault::ResultWindowOverflow(limit);
        }
    }

    for cause in &causes {
        for marker in ["No mapping found for", "Set fielddata=true on"] {
            if let Some(field) = bracketed_after(cause.reason, marker) {
                return Fault::MissingField(field.to_string());
            }
        }
    }

    if causes.iter().any(|c| {
        c.kind == "no_shard_available_action_exception"
            || c.reason.contains("primary shard is not active")
    }) {
        return Fault::NewIndex;
    }

    Fault::Unclassified
}

#[cfg(test)]
mod tests {
    use color_eyre::eyre::eyre;
    use serde_json::json;
    use test_case::test_case;

    use super::*;

    fn server_error(payload: Value) -> Report {
        eyre!(ConnectorError::ServerResp(400, payload.to_string()))
    }

    #[test]
    fn missing_index() {
        let err = server_error(json!({
            "error": {
                "root_cause": [{
                    "type": "index_not_found_exception",
                    "reason": "no such index [logs-2020]",
                    "index": "logs-2020"
                }],
                "type": "index_not_found_exception",
                "reason": "no such index [logs-2020]"
            },
            "status": 404
        }));
        assert_eq!(classify(&err), Fault::MissingIndex("logs-2020".to_string()));
    }

    #[test]
    fn result_window() {
        let err = server_error(json!({
            "error": {
                "root_cause": [{
                    "type": "illegal_argument_exception",
                    "reason": "Result window is too large, from + size must be less than or equal to: [10000] but was [10002]."
                }],
                "type": "search_phase_execution_exception",
                "reason": "all shards failed"
            }
        }));
        assert_eq!(classify(&err), Fault::ResultWindowOverflow(10000));
    }

    #[test_case("No mapping found for [host] in order to sort on", "host")]
    #[test_case(
        "Fielddata is disabled on text fields by default. Set fielddata=true on [message] in order to load fielddata",
        "message"
    )]
    fn missing_field(reason: &str, field: &str) {
        let err = server_error(json!({
            "error": {
                "type": "search_phase_execution_exception",
                "reason": "all shards failed",
                "failed_shards": [{
                    "shard": 0,
                    "reason": {"type": "illegal_argument_exception", "reason": reason}
                }]
            }
        }));
        assert_eq!(classify(&err), Fault::MissingField(field.to_string()));
    }

    #[test]
    fn new_index() {
        let err = server_error(json!({
            "error": {"type": "no_shard_available_action_exception", "reason": "No shard available"}
        }));
        assert_eq!(classify(&err), Fault::NewIndex);
    }

    #[test]
    fn unclassified() {
        assert_eq!(classify(&eyre!("boom")), Fault::Unclassified);
        assert_eq!(classify(&server_error(json!({"error": "weird"}))), Fault::Unclassified);
        assert_eq!(classify_payload("<html>bad gateway</html>"), Fault::Unclassified);
    }
}
