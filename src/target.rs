//! Target interface - the capability surface a server exposes
//!
//! A target is a named bundle of callable methods. The server dispatches
//! requests purely through the [`Target`] trait, so anything from a
//! hand-written device driver to a generated proxy can be served.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::{MethodDoc, PackedException, TargetDoc};
use crate::pyon::Value;

#[derive(Error, Debug)]
pub enum TargetError {
    #[error("invalid target name {0:?}: must be non-empty without whitespace")]
    InvalidName(String),

    #[error("target {0:?} is already registered")]
    DuplicateName(String),
}

/// A callable object served over the wire.
#[async_trait]
pub trait Target: Send + Sync {
    /// Documentation of the target as a whole.
    fn docstring(&self) -> Option<String> {
        None
    }

    /// Names of the callable methods.
    fn method_list(&self) -> Vec<String>;

    /// Calling convention and docstring of one method.
    fn document_method(&self, _name: &str) -> Option<MethodDoc> {
        None
    }

    /// Invokes a method. Failures are packed so they propagate to the
    /// remote caller with class, message and cause intact.
    async fn invoke(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, PackedException>;
}

/// The standard error for a method name the target does not have.
pub fn unknown_method(name: &str) -> PackedException {
    PackedException::new("AttributeError", format!("no method {:?}", name))
}

/// Builds the `get_rpc_method_list` document for a target.
pub fn document_target(target: &dyn Target) -> TargetDoc {
    let methods = target
        .method_list()
        .into_iter()
        .map(|name| {
            let doc = target.document_method(&name).unwrap_or(MethodDoc {
                argspec: Default::default(),
                doc: None,
            });
            (name, doc)
        })
        .collect();
    TargetDoc {
        docstring: target.docstring(),
        methods,
    }
}

/// How a named target is provided to connections.
pub enum TargetEntry {
    /// One shared instance serves every connection.
    Instance(Arc<dyn Target>),
    /// A fresh instance is created per connection.
    Factory(Box<dyn Fn() -> Arc<dyn Target> + Send + Sync>),
}

impl TargetEntry {
    pub(crate) fn instantiate(&self) -> Arc<dyn Target> {
        match self {
            TargetEntry::Instance(target) => target.clone(),
            TargetEntry::Factory(factory) => factory(),
        }
    }
}

/// The named targets a server hosts.
#[derive(Default)]
pub struct Targets {
    entries: Vec<(String, TargetEntry)>,
}

impl Targets {
    pub fn new() -> Self {
        Targets::default()
    }

    fn insert(&mut self, name: &str, entry: TargetEntry) -> Result<(), TargetError> {
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(TargetError::InvalidName(name.to_owned()));
        }
        if self.entries.iter().any(|(n, _)| n == name) {
            return Err(TargetError::DuplicateName(name.to_owned()));
        }
        self.entries.push((name.to_owned(), entry));
        Ok(())
    }

    /// Registers a shared target instance under `name`.
    pub fn add_instance(
        &mut self,
        name: &str,
        target: Arc<dyn Target>,
    ) -> Result<(), TargetError> {
        self.insert(name, TargetEntry::Instance(target))
    }

    /// Registers a per-connection target factory under `name`.
    pub fn add_factory<F>(&mut self, name: &str, factory: F) -> Result<(), TargetError>
    where
        F: Fn() -> Arc<dyn Target> + Send + Sync + 'static,
    {
        self.insert(name, TargetEntry::Factory(Box::new(factory)))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|(n, _)| n.clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn get(&self, name: &str) -> Option<&TargetEntry> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, entry)| entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    #[async_trait]
    impl Target for Nop {
        fn method_list(&self) -> Vec<String> {
            vec!["nop".to_owned()]
        }

        async fn invoke(
            &self,
            name: &str,
            _args: Vec<Value>,
            _kwargs: Vec<(String, Value)>,
        ) -> Result<Value, PackedException> {
            match name {
                "nop" => Ok(Value::None),
                other => Err(unknown_method(other)),
            }
        }
    }

    #[test]
    fn test_name_validation() {
        let mut targets = Targets::new();
        assert!(matches!(
            targets.add_instance("", Arc::new(Nop)),
            Err(TargetError::InvalidName(_))
        ));
        assert!(matches!(
            targets.add_instance("has space", Arc::new(Nop)),
            Err(TargetError::InvalidName(_))
        ));
        targets.add_instance("nop", Arc::new(Nop)).unwrap();
        assert!(matches!(
            targets.add_instance("nop", Arc::new(Nop)),
            Err(TargetError::DuplicateName(_))
        ));
    }

    #[test]
    fn test_names_sorted() {
        let mut targets = Targets::new();
        targets.add_instance("zeta", Arc::new(Nop)).unwrap();
        targets.add_instance("alpha", Arc::new(Nop)).unwrap();
        targets.add_factory("mid", || Arc::new(Nop)).unwrap();
        assert_eq!(targets.names(), ["alpha", "mid", "zeta"]);
    }

    #[tokio::test]
    async fn test_document_target() {
        let doc = document_target(&Nop);
        assert_eq!(doc.methods.len(), 1);
        assert_eq!(doc.methods[0].0, "nop");
    }
}
