//! Pull tool calls out of a model response.
//!
//! Backends disagree on where calls live: some list them directly on the
//! candidate, others embed them in content parts, and some do both for the
//! same call. Each [`Strategy`] reads one location; the first strategy that
//! yields anything wins, so a call is never counted twice.
//!
//! Only the first candidate is read. The chat history keeps that candidate
//! alone, and every call read here must be answered in the next turn.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::model::{Candidate, FunctionCall, ModelResponse};

/// A tool call proposed by the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProposedCall {
    /// The fqn the model asked for.
    pub name: String,
    pub args: Map<String, Value>,
}

impl ProposedCall {
    pub fn new(name: impl Into<String>, args: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    fn from_function_call(call: &FunctionCall) -> Option<Self> {
        if call.name.is_empty() {
            return None;
        }
        let args = match &call.args {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        Some(Self::new(call.name.clone(), args))
    }

    /// Identity for deduplication: name plus key-sorted arguments.
    pub fn dedupe_key(&self) -> String {
        let args = canonical(&Value::Object(self.args.clone()));
        format!("{}\u{0}{}", self.name, args)
    }
}

/// Where to look for calls, in precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// `candidate.functionCalls[]`
    Direct,
    /// `candidate.content.parts[].functionCall`
    Parts,
}

impl Strategy {
    pub const PRECEDENCE: [Strategy; 2] = [Strategy::Direct, Strategy::Parts];

    pub fn extract(self, candidate: &Candidate) -> Vec<ProposedCall> {
        match self {
            Strategy::Direct => candidate
                .function_calls
                .iter()
                .filter_map(ProposedCall::from_function_call)
                .collect(),
            Strategy::Parts => candidate
                .content
                .iter()
                .flat_map(|content| content.parts.iter())
                .filter_map(|part| part.function_call.as_ref())
                .filter_map(ProposedCall::from_function_call)
                .collect(),
        }
    }
}

/// Every call in the first candidate, in proposal order.
pub fn extract_calls(response: &ModelResponse) -> Vec<ProposedCall> {
    let Some(candidate) = response.candidates.first() else {
        return Vec::new();
    };
    Strategy::PRECEDENCE
        .iter()
        .map(|strategy| strategy.extract(candidate))
        .find(|calls| !calls.is_empty())
        .unwrap_or_default()
}

/// Unique calls, plus where each proposed call's answer comes from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Deduped {
    pub unique: Vec<ProposedCall>,
    /// `slots[i]` indexes the entry of `unique` that answers proposed call `i`.
    pub slots: Vec<usize>,
}

impl Deduped {
    pub fn proposed(&self) -> usize {
        self.slots.len()
    }

    /// Spread one answer per unique call back over every proposed call.
    pub fn fan_out<T: Clone>(&self, answers: &[T]) -> Vec<T> {
        self.slots
            .iter()
            .filter_map(|&slot| answers.get(slot).cloned())
            .collect()
    }
}

/// Collapse repeats of the same (name, arguments); first occurrence wins.
pub fn dedupe_indexed(calls: Vec<ProposedCall>) -> Deduped {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut deduped = Deduped::default();

    for call in calls {
        let next = deduped.unique.len();
        let slot = *positions.entry(call.dedupe_key()).or_insert(next);
        if slot == next {
            deduped.unique.push(call);
        }
        deduped.slots.push(slot);
    }
    deduped
}

/// Drop repeats of the same (name, arguments); first occurrence wins.
pub fn dedupe_calls(calls: Vec<ProposedCall>) -> Vec<ProposedCall> {
    dedupe_indexed(calls).unique
}

/// JSON text with object keys sorted at every depth.
pub fn canonical(value: &Value) -> String {
    fn sorted(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut entries: Vec<_> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                Value::Object(
                    entries
                        .into_iter()
                        .map(|(k, v)| (k.clone(), sorted(v)))
                        .collect(),
                )
            }
            Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
            other => other.clone(),
        }
    }
    sorted(value).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Content, Part};
    use serde_json::json;

    fn candidate(direct: Vec<FunctionCall>, parts: Vec<Part>) -> Candidate {
        Candidate {
            function_calls: direct,
            content: Some(Content {
                role: Some("model".into()),
                parts,
            }),
            finish_reason: None,
        }
    }

    fn call(name: &str, args: Value) -> FunctionCall {
        FunctionCall {
            name: name.into(),
            args,
        }
    }

    #[test]
    fn test_direct_list_wins_over_parts() {
        let response = ModelResponse {
            candidates: vec![candidate(
                vec![call("s.add", json!({"a": 1}))],
                vec![Part::call("s.add", json!({"a": 1})), Part::text("thinking")],
            )],
            usage_metadata: None,
        };
        let calls = extract_calls(&response);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "s.add");
    }

    #[test]
    fn test_parts_used_when_direct_empty() {
        let response = ModelResponse {
            candidates: vec![candidate(
                vec![],
                vec![
                    Part::call("s.add", json!({"a": 1, "b": 2})),
                    Part::text("and"),
                    Part::call("s.divide", json!({"a": 1, "b": 0})),
                ],
            )],
            usage_metadata: None,
        };
        let names: Vec<_> = extract_calls(&response)
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, ["s.add", "s.divide"]);
    }

    #[test]
    fn test_missing_fields_and_bad_args() {
        let response: ModelResponse = serde_json::from_value(json!({
            "candidates": [
                {"content": {"parts": [
                    {"functionCall": {"name": "s.x", "args": "not an object"}},
                    {"functionCall": {"args": {"a": 1}}},
                    {"functionCall": {"name": "s.y"}}
                ]}}
            ]
        }))
        .unwrap();
        let calls = extract_calls(&response);
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|c| c.args.is_empty()));
        assert!(extract_calls(&ModelResponse::default()).is_empty());

        let bare: ModelResponse = serde_json::from_value(json!({"candidates": [{}]})).unwrap();
        assert!(extract_calls(&bare).is_empty());
    }

    #[test]
    fn test_only_first_candidate_is_read() {
        let response = ModelResponse {
            candidates: vec![
                candidate(vec![], vec![Part::call("s.add", json!({"a": 1}))]),
                candidate(vec![call("s.divide", json!({"a": 1, "b": 0}))], vec![]),
            ],
            usage_metadata: None,
        };
        let names: Vec<_> = extract_calls(&response)
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, ["s.add"]);
    }

    #[test]
    fn test_dedupe_indexed_maps_every_proposal() {
        let calls = vec![
            ProposedCall::new("s.add", serde_json::from_str(r#"{"a": 1, "b": 2}"#).unwrap()),
            ProposedCall::new("s.sub", Map::new()),
            ProposedCall::new("s.add", serde_json::from_str(r#"{"b": 2, "a": 1}"#).unwrap()),
        ];
        let deduped = dedupe_indexed(calls);
        assert_eq!(deduped.unique.len(), 2);
        assert_eq!(deduped.slots, [0, 1, 0]);
        assert_eq!(deduped.proposed(), 3);
        assert_eq!(deduped.fan_out(&["three", "zero"]), ["three", "zero", "three"]);
    }

    #[test]
    fn test_dedupe_ignores_key_order() {
        let a: Map<String, Value> =
            serde_json::from_str(r#"{"a": 1, "b": {"x": 1, "y": [2, {"q": 1, "p": 0}]}}"#).unwrap();
        let b: Map<String, Value> =
            serde_json::from_str(r#"{"b": {"y": [2, {"p": 0, "q": 1}], "x": 1}, "a": 1}"#).unwrap();

        let calls = vec![
            ProposedCall::new("s.add", a.clone()),
            ProposedCall::new("s.sub", a.clone()),
            ProposedCall::new("s.add", b),
        ];
        let unique = dedupe_calls(calls);
        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].name, "s.add");
        assert_eq!(unique[0].args, a);
        assert_eq!(unique[1].name, "s.sub");
    }

    #[test]
    fn test_canonical_sorts_nested_keys() {
        assert_eq!(
            canonical(&json!({"b": 1, "a": {"d": 2, "c": 3}})),
            r#"{"a":{"c":3,"d":2},"b":1}"#
        );
    }
}
