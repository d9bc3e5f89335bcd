//! Custom type registry for the PYON codec
//!
//! Applications extend the codec with their own types by registering an
//! encoder/decoder pair under a unique tag name. Registered values travel
//! inside [`Value::Opaque`] and are consulted by `encode`/`decode` at the
//! point where a built-in variant does not apply.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};

use thiserror::Error;

use super::value::Value;

/// Tags owned by the built-in codec. User registrations may not shadow them.
pub const RESERVED_TAGS: &[&str] = &[
    "tuple",
    "dict",
    "set",
    "bytes",
    "complex",
    "fraction",
    "ordered_dict",
    "nparray",
    "npscalar",
];

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("tag {0:?} is reserved by the built-in codec")]
    ReservedTag(String),

    #[error("tag {0:?} is already registered")]
    DuplicateTag(String),

    #[error("type {0} is already registered")]
    DuplicateType(&'static str),

    #[error("type {0} is not registered")]
    NotRegistered(&'static str),

    #[error("type {ty} is registered under tag {actual:?}, not {requested:?}")]
    TagMismatch {
        ty: &'static str,
        actual: String,
        requested: String,
    },
}

/// A value of a type the codec does not know natively.
///
/// Carries the erased value together with monomorphized equality and debug
/// hooks so `Value` stays `PartialEq` and `Debug`.
#[derive(Clone)]
pub struct Opaque {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
    eq_fn: fn(&(dyn Any + Send + Sync), &(dyn Any + Send + Sync)) -> bool,
    fmt_fn: fn(&(dyn Any + Send + Sync), &mut fmt::Formatter<'_>) -> fmt::Result,
}

impl Opaque {
    pub fn new<T>(value: T) -> Self
    where
        T: Any + Send + Sync + PartialEq + fmt::Debug,
    {
        fn eq_any<T: Any + PartialEq>(
            a: &(dyn Any + Send + Sync),
            b: &(dyn Any + Send + Sync),
        ) -> bool {
            match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            }
        }
        fn fmt_any<T: Any + fmt::Debug>(
            v: &(dyn Any + Send + Sync),
            f: &mut fmt::Formatter<'_>,
        ) -> fmt::Result {
            match v.downcast_ref::<T>() {
                Some(v) => fmt::Debug::fmt(v, f),
                None => f.write_str("<opaque>"),
            }
        }
        Opaque {
            value: Arc::new(value),
            type_name: std::any::type_name::<T>(),
            eq_fn: eq_any::<T>,
            fmt_fn: fmt_any::<T>,
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    pub fn type_id(&self) -> TypeId {
        self.value.as_ref().type_id()
    }

    /// The Rust type name of the wrapped value, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl PartialEq for Opaque {
    fn eq(&self, other: &Opaque) -> bool {
        (self.eq_fn)(self.value.as_ref(), other.value.as_ref())
    }
}

impl fmt::Debug for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (self.fmt_fn)(self.value.as_ref(), f)
    }
}

/// Reconstructs a value from the decoded tag arguments. Errors are reported
/// as strings and surfaced by the decoder under the offending tag.
pub type DecodeFn = fn(&[Value]) -> Result<Value, String>;

type ErasedEncodeFn = Box<dyn Fn(&Opaque) -> Option<Vec<Value>> + Send + Sync>;

struct EncodeEntry {
    tag: String,
    encode: ErasedEncodeFn,
}

/// Plugin hook extending the codec without a per-type registration.
///
/// At encode, installed plugins are consulted in installation order for
/// opaque values no registered type claims; the first plugin returning
/// `Some` wins. At install, the plugin's decoders are added to the tag
/// table like ordinary registrations.
pub trait CodecPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Encodes an unclaimed opaque value as `(tag, args)`, or passes.
    fn encode(&self, value: &Opaque) -> Option<(String, Vec<Value>)>;

    /// Decoder tags this plugin contributes.
    fn decoders(&self) -> Vec<(String, DecodeFn)>;
}

/// Process-wide table of custom type encoders and decoders.
pub struct TypeRegistry {
    encoders: HashMap<TypeId, EncodeEntry>,
    decoders: HashMap<String, DecodeFn>,
    plugins: Vec<Box<dyn CodecPlugin>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        TypeRegistry {
            encoders: HashMap::new(),
            decoders: HashMap::new(),
            plugins: Vec::new(),
        }
    }

    fn check_tag(&self, tag: &str) -> Result<(), RegistryError> {
        if RESERVED_TAGS.contains(&tag) {
            return Err(RegistryError::ReservedTag(tag.to_owned()));
        }
        if self.decoders.contains_key(tag) {
            return Err(RegistryError::DuplicateTag(tag.to_owned()));
        }
        Ok(())
    }

    /// Registers a custom type under `tag`.
    ///
    /// `encode` converts a value of `T` into the tag arguments; `decode`
    /// reconstructs it. Both the type and the tag must be unregistered.
    pub fn register<T>(
        &mut self,
        tag: &str,
        encode: fn(&T) -> Vec<Value>,
        decode: DecodeFn,
    ) -> Result<(), RegistryError>
    where
        T: Any + Send + Sync,
    {
        self.check_tag(tag)?;
        if self.encoders.contains_key(&TypeId::of::<T>()) {
            return Err(RegistryError::DuplicateType(std::any::type_name::<T>()));
        }
        self.encoders.insert(
            TypeId::of::<T>(),
            EncodeEntry {
                tag: tag.to_owned(),
                encode: Box::new(move |o| o.downcast_ref::<T>().map(encode)),
            },
        );
        self.decoders.insert(tag.to_owned(), decode);
        Ok(())
    }

    /// Removes the registration of `T`, which must be held under `tag`.
    pub fn deregister<T: Any>(&mut self, tag: &str) -> Result<(), RegistryError> {
        let entry = self
            .encoders
            .get(&TypeId::of::<T>())
            .ok_or(RegistryError::NotRegistered(std::any::type_name::<T>()))?;
        if entry.tag != tag {
            return Err(RegistryError::TagMismatch {
                ty: std::any::type_name::<T>(),
                actual: entry.tag.clone(),
                requested: tag.to_owned(),
            });
        }
        self.decoders.remove(tag);
        self.encoders.remove(&TypeId::of::<T>());
        Ok(())
    }

    /// Installs a plugin, adding its decoder tags to the table.
    pub fn install_plugin(&mut self, plugin: Box<dyn CodecPlugin>) -> Result<(), RegistryError> {
        let decoders = plugin.decoders();
        for (tag, _) in &decoders {
            self.check_tag(tag)?;
        }
        for (tag, decode) in decoders {
            self.decoders.insert(tag, decode);
        }
        self.plugins.push(plugin);
        Ok(())
    }

    /// Encodes an opaque value via its registration or, failing that, the
    /// installed plugins.
    pub(crate) fn encode_opaque(&self, value: &Opaque) -> Option<(String, Vec<Value>)> {
        if let Some(entry) = self.encoders.get(&value.type_id()) {
            if let Some(args) = (entry.encode)(value) {
                return Some((entry.tag.clone(), args));
            }
        }
        self.plugins.iter().find_map(|p| p.encode(value))
    }

    pub(crate) fn decode_tag(&self, tag: &str, args: &[Value]) -> Option<Result<Value, String>> {
        self.decoders.get(tag).map(|decode| decode(args))
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        TypeRegistry::new()
    }
}

/// The process-wide registry used by the module-level `encode`/`decode`.
pub fn registry() -> &'static RwLock<TypeRegistry> {
    static REGISTRY: OnceLock<RwLock<TypeRegistry>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(TypeRegistry::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Meters(f64);

    #[derive(Debug, PartialEq)]
    struct Seconds(f64);

    fn encode_meters(m: &Meters) -> Vec<Value> {
        vec![Value::Float(m.0)]
    }

    fn decode_meters(args: &[Value]) -> Result<Value, String> {
        match args {
            [v] => {
                let f = v.as_f64().ok_or("meters argument must be numeric")?;
                Ok(Value::opaque(Meters(f)))
            }
            _ => Err(format!("expected 1 argument, got {}", args.len())),
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut reg = TypeRegistry::new();
        reg.register::<Meters>("meters", encode_meters, decode_meters)
            .unwrap();

        let (tag, args) = reg.encode_opaque(&Opaque::new(Meters(2.5))).unwrap();
        assert_eq!(tag, "meters");
        assert_eq!(args, vec![Value::Float(2.5)]);

        let back = reg.decode_tag("meters", &args).unwrap().unwrap();
        assert_eq!(back, Value::opaque(Meters(2.5)));
    }

    #[test]
    fn test_duplicate_type_rejected() {
        let mut reg = TypeRegistry::new();
        reg.register::<Meters>("meters", encode_meters, decode_meters)
            .unwrap();
        let err = reg
            .register::<Meters>("metres", encode_meters, decode_meters)
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateType(_)));
    }

    #[test]
    fn test_duplicate_tag_rejected() {
        let mut reg = TypeRegistry::new();
        reg.register::<Meters>("meters", encode_meters, decode_meters)
            .unwrap();
        let err = reg
            .register::<Seconds>("meters", |s| vec![Value::Float(s.0)], decode_meters)
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateTag(_)));
    }

    #[test]
    fn test_reserved_tag_rejected() {
        let mut reg = TypeRegistry::new();
        let err = reg
            .register::<Meters>("tuple", encode_meters, decode_meters)
            .unwrap_err();
        assert!(matches!(err, RegistryError::ReservedTag(_)));
    }

    #[test]
    fn test_deregister_requires_matching_tag() {
        let mut reg = TypeRegistry::new();
        reg.register::<Meters>("meters", encode_meters, decode_meters)
            .unwrap();
        assert!(matches!(
            reg.deregister::<Meters>("metres"),
            Err(RegistryError::TagMismatch { .. })
        ));
        reg.deregister::<Meters>("meters").unwrap();
        assert!(reg.encode_opaque(&Opaque::new(Meters(1.0))).is_none());
        assert!(matches!(
            reg.deregister::<Meters>("meters"),
            Err(RegistryError::NotRegistered(_))
        ));
    }

    #[test]
    fn test_opaque_equality_is_typed() {
        assert_eq!(Opaque::new(Meters(1.0)), Opaque::new(Meters(1.0)));
        assert_ne!(Opaque::new(Meters(1.0)), Opaque::new(Meters(2.0)));
        assert_ne!(Opaque::new(Meters(1.0)), Opaque::new(Seconds(1.0)));
    }
}
