//! Protocol message definitions
//!
//! Every message crosses the wire as a single encoded PYON line. The types
//! here give the handshake and request/response documents a typed shape and
//! centralize the `Value` conversions in both directions.

use thiserror::Error;

use crate::pyon::Value;

use super::exception::PackedException;

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("message is missing field {0:?}")]
    MissingField(&'static str),

    #[error("field {field:?} has the wrong type, expected {expected}")]
    FieldType {
        field: &'static str,
        expected: &'static str,
    },

    #[error("message is not a mapping")]
    NotAMapping,

    #[error("unknown action {0:?}")]
    UnknownAction(String),

    #[error("unknown response status {0:?}")]
    UnknownStatus(String),
}

pub(super) fn str_field(value: &Value, field: &'static str) -> Result<String, MessageError> {
    match value.get(field) {
        Some(Value::Str(s)) => Ok(s.clone()),
        Some(_) => Err(MessageError::FieldType {
            field,
            expected: "string",
        }),
        None => Err(MessageError::MissingField(field)),
    }
}

fn opt_str_field(value: &Value, field: &'static str) -> Result<Option<String>, MessageError> {
    match value.get(field) {
        None | Some(Value::None) => Ok(None),
        Some(Value::Str(s)) => Ok(Some(s.clone())),
        Some(_) => Err(MessageError::FieldType {
            field,
            expected: "string or null",
        }),
    }
}

fn str_list_field(value: &Value, field: &'static str) -> Result<Vec<String>, MessageError> {
    let items = value
        .get(field)
        .ok_or(MessageError::MissingField(field))?
        .as_slice()
        .ok_or(MessageError::FieldType {
            field,
            expected: "list of strings",
        })?;
    items
        .iter()
        .map(|v| {
            v.as_str().map(str::to_owned).ok_or(MessageError::FieldType {
                field,
                expected: "list of strings",
            })
        })
        .collect()
}

fn opt_str_value(s: &Option<String>) -> Value {
    match s {
        Some(s) => Value::str(s.clone()),
        None => Value::None,
    }
}

/// The line a server sends right after the banner: which targets it hosts
/// and which protocol features it understands.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerIdentification {
    /// Target names, sorted.
    pub targets: Vec<String>,
    pub description: Option<String>,
    pub features: Vec<String>,
}

impl ServerIdentification {
    pub fn to_value(&self) -> Value {
        Value::dict([
            (
                Value::str("targets"),
                Value::list(self.targets.iter().map(|t| Value::str(t.clone()))),
            ),
            (Value::str("description"), opt_str_value(&self.description)),
            (
                Value::str("features"),
                Value::list(self.features.iter().map(|f| Value::str(f.clone()))),
            ),
        ])
    }

    pub fn from_value(value: &Value) -> Result<Self, MessageError> {
        Ok(ServerIdentification {
            targets: str_list_field(value, "targets")?,
            description: opt_str_field(value, "description")?,
            features: str_list_field(value, "features")?,
        })
    }
}

/// A client request line.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Invoke a method on the selected target.
    Call {
        name: String,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    },

    /// Ask for the target's method documentation.
    MethodList,
}

impl Request {
    pub fn call(name: impl Into<String>, args: Vec<Value>, kwargs: Vec<(String, Value)>) -> Self {
        Request::Call {
            name: name.into(),
            args,
            kwargs,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Request::Call { name, args, kwargs } => Value::dict([
                (Value::str("action"), Value::str("call")),
                (Value::str("name"), Value::str(name.clone())),
                (Value::str("args"), Value::List(args.clone())),
                (
                    Value::str("kwargs"),
                    Value::dict(
                        kwargs
                            .iter()
                            .map(|(k, v)| (Value::str(k.clone()), v.clone())),
                    ),
                ),
            ]),
            Request::MethodList => Value::dict([(
                Value::str("action"),
                Value::str("get_rpc_method_list"),
            )]),
        }
    }

    pub fn from_value(value: &Value) -> Result<Self, MessageError> {
        if value.as_pairs().is_none() {
            return Err(MessageError::NotAMapping);
        }
        match str_field(value, "action")?.as_str() {
            "call" => {
                let name = str_field(value, "name")?;
                let args = match value.get("args") {
                    None => Vec::new(),
                    Some(v) => v
                        .as_slice()
                        .ok_or(MessageError::FieldType {
                            field: "args",
                            expected: "list",
                        })?
                        .to_vec(),
                };
                let kwargs = match value.get("kwargs") {
                    None => Vec::new(),
                    Some(v) => v
                        .as_pairs()
                        .ok_or(MessageError::FieldType {
                            field: "kwargs",
                            expected: "mapping",
                        })?
                        .iter()
                        .map(|(k, v)| {
                            k.as_str()
                                .map(|k| (k.to_owned(), v.clone()))
                                .ok_or(MessageError::FieldType {
                                    field: "kwargs",
                                    expected: "string-keyed mapping",
                                })
                        })
                        .collect::<Result<_, _>>()?,
                };
                Ok(Request::Call { name, args, kwargs })
            }
            "get_rpc_method_list" => Ok(Request::MethodList),
            other => Err(MessageError::UnknownAction(other.to_owned())),
        }
    }
}

/// A server response line.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Ok(Value),
    Failed(PackedException),
}

impl Response {
    pub fn to_value(&self) -> Value {
        match self {
            Response::Ok(ret) => Value::dict([
                (Value::str("status"), Value::str("ok")),
                (Value::str("ret"), ret.clone()),
            ]),
            Response::Failed(exception) => Value::dict([
                (Value::str("status"), Value::str("failed")),
                (Value::str("exception"), exception.to_value()),
            ]),
        }
    }

    pub fn from_value(value: &Value) -> Result<Self, MessageError> {
        match str_field(value, "status")?.as_str() {
            "ok" => Ok(Response::Ok(
                value
                    .get("ret")
                    .ok_or(MessageError::MissingField("ret"))?
                    .clone(),
            )),
            "failed" => {
                let exception = value
                    .get("exception")
                    .ok_or(MessageError::MissingField("exception"))?;
                Ok(Response::Failed(PackedException::from_value(exception)?))
            }
            other => Err(MessageError::UnknownStatus(other.to_owned())),
        }
    }
}

/// Calling convention of a single target method.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ArgSpec {
    /// Positional parameter names, in order.
    pub args: Vec<String>,
    /// Default values for the trailing parameters of `args`.
    pub defaults: Vec<Value>,
    /// Name of the variadic positional parameter, if the method takes one.
    pub varargs: Option<String>,
    /// Name of the variadic keyword parameter, if the method takes one.
    pub varkw: Option<String>,
}

impl ArgSpec {
    pub fn positional(args: &[&str]) -> Self {
        ArgSpec {
            args: args.iter().map(|a| (*a).to_owned()).collect(),
            ..Default::default()
        }
    }

    pub fn to_value(&self) -> Value {
        Value::dict([
            (
                Value::str("args"),
                Value::list(self.args.iter().map(|a| Value::str(a.clone()))),
            ),
            (
                Value::str("defaults"),
                if self.defaults.is_empty() {
                    Value::None
                } else {
                    Value::Tuple(self.defaults.clone())
                },
            ),
            (Value::str("varargs"), opt_str_value(&self.varargs)),
            (Value::str("varkw"), opt_str_value(&self.varkw)),
        ])
    }

    pub fn from_value(value: &Value) -> Result<Self, MessageError> {
        let defaults = match value.get("defaults") {
            None | Some(Value::None) => Vec::new(),
            Some(v) => v
                .as_slice()
                .ok_or(MessageError::FieldType {
                    field: "defaults",
                    expected: "sequence",
                })?
                .to_vec(),
        };
        Ok(ArgSpec {
            args: str_list_field(value, "args")?,
            defaults,
            varargs: opt_str_field(value, "varargs")?,
            varkw: opt_str_field(value, "varkw")?,
        })
    }
}

/// Documentation of one method: calling convention plus docstring.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodDoc {
    pub argspec: ArgSpec,
    pub doc: Option<String>,
}

impl MethodDoc {
    pub fn to_value(&self) -> Value {
        Value::tuple([self.argspec.to_value(), opt_str_value(&self.doc)])
    }

    pub fn from_value(value: &Value) -> Result<Self, MessageError> {
        let items = value.as_slice().ok_or(MessageError::FieldType {
            field: "methods",
            expected: "(argspec, doc) pair",
        })?;
        match items {
            [argspec, doc] => Ok(MethodDoc {
                argspec: ArgSpec::from_value(argspec)?,
                doc: match doc {
                    Value::None => None,
                    Value::Str(s) => Some(s.clone()),
                    _ => {
                        return Err(MessageError::FieldType {
                            field: "doc",
                            expected: "string or null",
                        })
                    }
                },
            }),
            _ => Err(MessageError::FieldType {
                field: "methods",
                expected: "(argspec, doc) pair",
            }),
        }
    }
}

/// The document returned by `get_rpc_method_list`.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetDoc {
    pub docstring: Option<String>,
    pub methods: Vec<(String, MethodDoc)>,
}

impl TargetDoc {
    pub fn to_value(&self) -> Value {
        Value::dict([
            (Value::str("docstring"), opt_str_value(&self.docstring)),
            (
                Value::str("methods"),
                Value::dict(
                    self.methods
                        .iter()
                        .map(|(name, doc)| (Value::str(name.clone()), doc.to_value())),
                ),
            ),
        ])
    }

    pub fn from_value(value: &Value) -> Result<Self, MessageError> {
        let methods = value
            .get("methods")
            .ok_or(MessageError::MissingField("methods"))?
            .as_pairs()
            .ok_or(MessageError::FieldType {
                field: "methods",
                expected: "mapping",
            })?
            .iter()
            .map(|(name, doc)| {
                let name = name.as_str().ok_or(MessageError::FieldType {
                    field: "methods",
                    expected: "string-keyed mapping",
                })?;
                Ok((name.to_owned(), MethodDoc::from_value(doc)?))
            })
            .collect::<Result<_, MessageError>>()?;
        Ok(TargetDoc {
            docstring: opt_str_field(value, "docstring")?,
            methods,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pyon::{decode, encode};

    #[test]
    fn test_request_round_trip() {
        let req = Request::call(
            "set_gain",
            vec![Value::Int(3)],
            vec![("channel".to_owned(), Value::Int(1))],
        );
        let line = encode(&req.to_value()).unwrap();
        let back = Request::from_value(&decode(&line).unwrap()).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn test_request_args_default_empty() {
        let v = Value::dict([
            (Value::str("action"), Value::str("call")),
            (Value::str("name"), Value::str("ping")),
        ]);
        match Request::from_value(&v).unwrap() {
            Request::Call { args, kwargs, .. } => {
                assert!(args.is_empty());
                assert!(kwargs.is_empty());
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn test_request_unknown_action() {
        let v = Value::dict([(Value::str("action"), Value::str("reboot"))]);
        assert!(matches!(
            Request::from_value(&v),
            Err(MessageError::UnknownAction(_))
        ));
    }

    #[test]
    fn test_response_round_trip() {
        let ok = Response::Ok(Value::tuple([Value::Int(1), Value::str("x")]));
        assert_eq!(Response::from_value(&ok.to_value()).unwrap(), ok);

        let failed = Response::Failed(PackedException::new("ValueError", "nope"));
        assert_eq!(Response::from_value(&failed.to_value()).unwrap(), failed);
    }

    #[test]
    fn test_identification_round_trip() {
        let ident = ServerIdentification {
            targets: vec!["laser".to_owned(), "motor".to_owned()],
            description: None,
            features: vec!["pyon_v2".to_owned()],
        };
        assert_eq!(
            ServerIdentification::from_value(&ident.to_value()).unwrap(),
            ident
        );
    }

    #[test]
    fn test_target_doc_round_trip() {
        let doc = TargetDoc {
            docstring: Some("An example target.".to_owned()),
            methods: vec![(
                "plus".to_owned(),
                MethodDoc {
                    argspec: ArgSpec {
                        args: vec!["a".to_owned(), "b".to_owned()],
                        defaults: vec![Value::Int(0)],
                        varargs: None,
                        varkw: None,
                    },
                    doc: Some("Adds two numbers.".to_owned()),
                },
            )],
        };
        assert_eq!(TargetDoc::from_value(&doc.to_value()).unwrap(), doc);
    }
}
