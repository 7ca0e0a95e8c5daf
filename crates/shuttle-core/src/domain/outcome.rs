//! Outcome model: what a processor returns for one run of a job.
//!
//! Architecture-agnostic: the same shape is produced by local pool workers
//! and by market workers.

use serde::{Deserialize, Serialize};

use super::job::Payload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeKind {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub kind: OutcomeKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Optional result payload forwarded to the producer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Payload>,
}

impl Outcome {
    pub fn success() -> Self {
        Self {
            kind: OutcomeKind::Success,
            reason: None,
            result: None,
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            kind: OutcomeKind::Failure,
            reason: Some(reason.into()),
            result: None,
        }
    }

    pub fn with_result(mut self, result: Payload) -> Self {
        self.result = Some(result);
        self
    }

    pub fn is_success(&self) -> bool {
        self.kind == OutcomeKind::Success
    }
}

/// `run(job) -> bool`: `false` is a failure with a generic reason.
impl From<bool> for Outcome {
    fn from(ok: bool) -> Self {
        if ok {
            Self::success()
        } else {
            Self::failure("processor returned false")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_kind_serializes_as_screaming_snake() {
        let s = serde_json::to_string(&OutcomeKind::Success).unwrap();
        assert_eq!(s, "\"SUCCESS\"");
    }

    #[test]
    fn bool_conversion() {
        assert!(Outcome::from(true).is_success());
        let failed = Outcome::from(false);
        assert_eq!(failed.kind, OutcomeKind::Failure);
        assert!(failed.reason.is_some());
    }

    #[test]
    fn result_payload_is_optional_in_json() {
        let s = serde_json::to_string(&Outcome::success()).unwrap();
        assert_eq!(s, r#"{"kind":"SUCCESS"}"#);

        let o = Outcome::success().with_result(serde_json::json!({"rows": 3}));
        let back: Outcome = serde_json::from_str(&serde_json::to_string(&o).unwrap()).unwrap();
        assert_eq!(back.result, Some(serde_json::json!({"rows": 3})));
    }
}
