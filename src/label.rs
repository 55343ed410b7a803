//! Labels that travel with work items so out-of-order results stay
//! identifiable, plus the wire form for failures raised inside workers.

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Caller-chosen tag attached to a work item.
///
/// Labels survive the round trip through a worker unchanged, so a result (or
/// a failure) arriving out of order can always be traced back to the input
/// that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Label {
    /// Position assigned by the pool when the caller asks for sequence numbering.
    Ordinal(u64),
    /// Arbitrary caller-supplied name.
    Name(String),
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Label::Ordinal(n) => write!(f, "{n}"),
            Label::Name(s) => write!(f, "{s}"),
        }
    }
}

impl From<u64> for Label {
    fn from(n: u64) -> Self {
        Label::Ordinal(n)
    }
}

impl From<&str> for Label {
    fn from(s: &str) -> Self {
        Label::Name(s.to_string())
    }
}

impl From<String> for Label {
    fn from(s: String) -> Self {
        Label::Name(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LabelError {
    /// A finished result must not be stripped and re-dispatched.
    #[error("item is already a result; its label cannot be stripped again")]
    AlreadyResult,
}

/// A payload wrapped together with its label.
///
/// The `is_result` flag flips exactly once, when [`Reapply::apply`] rewraps
/// the outcome of the work function; stripping a result again is an error.
#[derive(Debug, Clone)]
pub struct Labeled<T> {
    label: Label,
    value: T,
    is_result: bool,
}

impl<T> Labeled<T> {
    pub fn new(label: impl Into<Label>, value: T) -> Self {
        Labeled {
            label: label.into(),
            value,
            is_result: false,
        }
    }

    pub fn label(&self) -> &Label {
        &self.label
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn is_result(&self) -> bool {
        self.is_result
    }

    pub fn into_parts(self) -> (Label, T) {
        (self.label, self.value)
    }

    /// Detach the payload for the work function, keeping a [`Reapply`] that
    /// rewraps the outcome under the same label.
    pub fn strip(self) -> Result<(T, Reapply), LabelError> {
        if self.is_result {
            return Err(LabelError::AlreadyResult);
        }
        Ok((self.value, Reapply { label: self.label }))
    }
}

/// One-shot rewrapper produced by [`Labeled::strip`].
#[derive(Debug)]
pub struct Reapply {
    label: Label,
}

impl Reapply {
    /// Wrap `result` under the original label, flagged as a result.
    pub fn apply<R>(self, result: R) -> Labeled<R> {
        Labeled {
            label: self.label,
            value: result,
            is_result: true,
        }
    }
}

/// Whether a [`WorkerFailure`] came from a returned error or a trapped panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Error,
    Panic,
}

/// Transportable form of a failure raised inside a worker.
///
/// `message` and `trace` are plain strings so the failure can cross any
/// boundary (thread, log line, JSON). When the failure travels in-process the
/// original [`anyhow::Error`] rides along as well, so the pool manager can
/// re-surface it with the concrete error type intact.
#[derive(Debug, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct WorkerFailure {
    pub kind: FailureKind,
    /// Rendered error chain, or the panic payload.
    pub message: String,
    /// Backtrace rendering captured where the failure was trapped.
    pub trace: String,
    #[serde(skip)]
    original: Option<anyhow::Error>,
}

impl WorkerFailure {
    pub fn from_error(err: anyhow::Error) -> Self {
        let trace = err.backtrace().to_string();
        WorkerFailure {
            kind: FailureKind::Error,
            message: format!("{err:#}"),
            trace,
            original: Some(err),
        }
    }

    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        WorkerFailure {
            kind: FailureKind::Panic,
            message: panic_message(payload.as_ref()),
            trace: std::backtrace::Backtrace::force_capture().to_string(),
            original: None,
        }
    }

    /// Borrow the concrete error this failure was built from, if it is still
    /// attached and of type `E`.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.original.as_ref().and_then(|e| e.downcast_ref::<E>())
    }
}

/// Best-effort rendering of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_and_reapply_preserve_label() {
        let item = Labeled::new("alpha", 7u32);
        let (value, reapply) = item.strip().expect("fresh item strips");
        assert_eq!(value, 7);
        let result = reapply.apply(value * 2);
        assert_eq!(result.label(), &Label::Name("alpha".to_string()));
        assert_eq!(*result.value(), 14);
        assert!(result.is_result());
    }

    #[test]
    fn results_cannot_be_stripped_again() {
        let item = Labeled::new(3u64, "payload");
        let (value, reapply) = item.strip().unwrap();
        let result = reapply.apply(value);
        assert!(matches!(result.strip(), Err(LabelError::AlreadyResult)));
    }

    #[test]
    fn failure_keeps_downcastable_source() {
        #[derive(Debug, thiserror::Error)]
        #[error("boom")]
        struct Boom;

        let failure = WorkerFailure::from_error(anyhow::Error::new(Boom));
        assert_eq!(failure.kind, FailureKind::Error);
        assert!(failure.message.contains("boom"));
        assert!(failure.downcast_ref::<Boom>().is_some());
    }

    #[test]
    fn failure_wire_form_serializes_without_source() {
        let failure = WorkerFailure::from_error(anyhow::anyhow!("it broke"));
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["kind"], "error");
        assert_eq!(json["message"], "it broke");
        assert!(json.get("trace").is_some());
        assert!(json.get("original").is_none());
    }
}
