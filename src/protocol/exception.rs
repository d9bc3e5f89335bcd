//! Remote exception descriptors
//!
//! When a target method fails, the server packs the error into a
//! transport-neutral descriptor and sends it in the `failed` response. The
//! client unpacks it so the caller can distinguish a remote failure from
//! transport trouble and inspect the remote class name, message, traceback
//! and cause chain.

use std::fmt;

use crate::pyon::Value;

use super::message::MessageError;

/// A remote error in transport-neutral form.
#[derive(Debug, Clone, PartialEq)]
pub struct PackedException {
    /// Error class or type name on the remote side.
    pub class: String,
    /// Human-readable message.
    pub message: String,
    /// Remote traceback lines, outermost first. May be empty.
    pub traceback: Vec<String>,
    /// The error that caused this one, if any.
    pub cause: Option<Box<PackedException>>,
}

impl PackedException {
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        PackedException {
            class: class.into(),
            message: message.into(),
            traceback: Vec::new(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: PackedException) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn with_traceback(mut self, traceback: Vec<String>) -> Self {
        self.traceback = traceback;
        self
    }

    /// Packs a Rust error and its source chain.
    pub fn from_error(class: impl Into<String>, err: &(dyn std::error::Error + 'static)) -> Self {
        let mut packed = PackedException::new(class, err.to_string());
        if let Some(source) = err.source() {
            packed.cause = Some(Box::new(PackedException::from_error(
                "RuntimeError",
                source,
            )));
        }
        packed
    }

    pub fn to_value(&self) -> Value {
        Value::dict([
            (Value::str("class"), Value::str(self.class.clone())),
            (Value::str("message"), Value::str(self.message.clone())),
            (
                Value::str("traceback"),
                Value::list(self.traceback.iter().map(|l| Value::str(l.clone()))),
            ),
            (
                Value::str("cause"),
                match &self.cause {
                    Some(cause) => cause.to_value(),
                    None => Value::None,
                },
            ),
        ])
    }

    pub fn from_value(value: &Value) -> Result<Self, MessageError> {
        let class = super::message::str_field(value, "class")?;
        let message = super::message::str_field(value, "message")?;
        let traceback = match value.get("traceback") {
            None | Some(Value::None) => Vec::new(),
            Some(v) => v
                .as_slice()
                .ok_or(MessageError::FieldType {
                    field: "traceback",
                    expected: "list of strings",
                })?
                .iter()
                .map(|l| {
                    l.as_str().map(str::to_owned).ok_or(MessageError::FieldType {
                        field: "traceback",
                        expected: "list of strings",
                    })
                })
                .collect::<Result<_, _>>()?,
        };
        let cause = match value.get("cause") {
            None | Some(Value::None) => None,
            Some(v) => Some(Box::new(PackedException::from_value(v)?)),
        };
        Ok(PackedException {
            class,
            message,
            traceback,
            cause,
        })
    }
}

impl fmt::Display for PackedException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

impl std::error::Error for PackedException {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_round_trip() {
        let packed = PackedException::new("ValueError", "bad input")
            .with_traceback(vec!["frame 1".into(), "frame 2".into()])
            .with_cause(PackedException::new("OSError", "disk on fire"));
        let back = PackedException::from_value(&packed.to_value()).unwrap();
        assert_eq!(back, packed);
    }

    #[test]
    fn test_from_error_captures_chain() {
        #[derive(Debug, thiserror::Error)]
        #[error("outer failed")]
        struct Outer(#[source] std::io::Error);

        let err = Outer(std::io::Error::new(std::io::ErrorKind::Other, "inner"));
        let packed = PackedException::from_error("RuntimeError", &err);
        assert_eq!(packed.message, "outer failed");
        assert_eq!(packed.cause.as_ref().unwrap().message, "inner");
    }

    #[test]
    fn test_missing_fields_rejected() {
        let v = Value::dict([(Value::str("class"), Value::str("ValueError"))]);
        assert!(PackedException::from_value(&v).is_err());
    }
}
