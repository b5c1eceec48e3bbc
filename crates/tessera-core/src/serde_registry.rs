//! Serializer registry for values crossing a process boundary.
//!
//! Maps an annotation (a logical type name such as `"bytes"` or `"int"`) to
//! a pair of functions converting between a type-erased [`Value`] and raw
//! bytes. The registry is an ordinary object: build one, register what the
//! deployment needs, and hand it to the components that serialize.

use std::any::Any;

use rustc_hash::FxHashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

/// A type-erased value produced or consumed by a task.
pub type Value = Box<dyn Any + Send>;

/// Annotation used when a wiring or output does not name one.
pub const DEFAULT_ANNOTATION: &str = "bytes";

type EncodeFn = Box<dyn Fn(&(dyn Any + Send)) -> Result<Vec<u8>> + Send + Sync>;
type DecodeFn = Box<dyn Fn(&[u8]) -> Result<Value> + Send + Sync>;

struct Entry {
    encode: EncodeFn,
    decode: DecodeFn,
    type_name: &'static str,
}

/// Registry of encode/decode pairs keyed by annotation.
#[derive(Default)]
pub struct SerdeRegistry {
    entries: FxHashMap<String, Entry>,
}

impl SerdeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the built-in annotations.
    ///
    /// | annotation | Rust type           | encoding            |
    /// |------------|---------------------|---------------------|
    /// | `bytes`    | `Vec<u8>`           | identity            |
    /// | `str`      | `String`            | UTF-8               |
    /// | `int`      | `i64`               | 8 bytes, big-endian |
    /// | `float`    | `f64`               | 8 bytes, big-endian |
    /// | `bool`     | `bool`              | 1 byte              |
    /// | `unit`     | `()`                | empty               |
    /// | `json`     | `serde_json::Value` | JSON text           |
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .register::<Vec<u8>, _, _>("bytes", |v| Ok(v.clone()), |b| Ok(b.to_vec()))
            .register::<String, _, _>(
                "str",
                |v| Ok(v.as_bytes().to_vec()),
                |b| {
                    String::from_utf8(b.to_vec())
                        .map_err(|e| Error::Deserialization(format!("invalid UTF-8: {}", e)))
                },
            )
            .register::<i64, _, _>(
                "int",
                |v| Ok(v.to_be_bytes().to_vec()),
                |b| Ok(i64::from_be_bytes(fixed_width("int", b)?)),
            )
            .register::<f64, _, _>(
                "float",
                |v| Ok(v.to_be_bytes().to_vec()),
                |b| Ok(f64::from_be_bytes(fixed_width("float", b)?)),
            )
            .register::<bool, _, _>(
                "bool",
                |v| Ok(vec![u8::from(*v)]),
                |b| match b {
                    [0] => Ok(false),
                    [1] => Ok(true),
                    _ => Err(Error::Deserialization(format!(
                        "invalid bool encoding: {:?}",
                        b
                    ))),
                },
            )
            .register::<(), _, _>("unit", |_| Ok(Vec::new()), |_| Ok(()))
            .register_json::<serde_json::Value>("json");
        registry
    }

    /// Register an encode/decode pair for values of type `T`.
    ///
    /// A later registration under the same annotation replaces the earlier one.
    pub fn register<T, E, D>(&mut self, annotation: impl Into<String>, encode: E, decode: D) -> &mut Self
    where
        T: Any + Send,
        E: Fn(&T) -> Result<Vec<u8>> + Send + Sync + 'static,
        D: Fn(&[u8]) -> Result<T> + Send + Sync + 'static,
    {
        let annotation = annotation.into();
        let name = annotation.clone();
        let entry = Entry {
            encode: Box::new(move |value| {
                let value = value.downcast_ref::<T>().ok_or_else(|| Error::TypeMismatch {
                    annotation: name.clone(),
                    expected: std::any::type_name::<T>(),
                })?;
                encode(value)
            }),
            decode: Box::new(move |bytes| decode(bytes).map(|v| Box::new(v) as Value)),
            type_name: std::any::type_name::<T>(),
        };
        self.entries.insert(annotation, entry);
        self
    }

    /// Register a serde type, encoded as JSON.
    pub fn register_json<T>(&mut self, annotation: impl Into<String>) -> &mut Self
    where
        T: Serialize + DeserializeOwned + Any + Send,
    {
        self.register::<T, _, _>(
            annotation,
            |v| serde_json::to_vec(v).map_err(|e| Error::Serialization(e.to_string())),
            |b| serde_json::from_slice(b).map_err(|e| Error::Deserialization(e.to_string())),
        )
    }

    /// Encode a value under the given annotation.
    ///
    /// Pass the value itself (`boxed.as_ref()`), not a reference to its box.
    pub fn encode(&self, annotation: &str, value: &(dyn Any + Send)) -> Result<Vec<u8>> {
        (self.entry(annotation)?.encode)(value)
    }

    /// Decode raw bytes under the given annotation.
    pub fn decode(&self, annotation: &str, bytes: &[u8]) -> Result<Value> {
        (self.entry(annotation)?.decode)(bytes)
    }

    /// Check whether an annotation is registered.
    pub fn contains(&self, annotation: &str) -> bool {
        self.entries.contains_key(annotation)
    }

    /// Name of the Rust type registered under an annotation.
    pub fn type_name(&self, annotation: &str) -> Option<&'static str> {
        self.entries.get(annotation).map(|e| e.type_name)
    }

    fn entry(&self, annotation: &str) -> Result<&Entry> {
        self.entries
            .get(annotation)
            .ok_or_else(|| Error::UnknownAnnotation(annotation.to_string()))
    }
}

fn fixed_width<const N: usize>(annotation: &str, bytes: &[u8]) -> Result<[u8; N]> {
    bytes.try_into().map_err(|_| {
        Error::Deserialization(format!(
            "{} expects {} bytes, got {}",
            annotation,
            N,
            bytes.len()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_int_is_big_endian() {
        let registry = SerdeRegistry::with_builtins();
        let bytes = registry.encode("int", &1i64).unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 0, 0, 0, 0, 1]);

        let value = registry.decode("int", &bytes).unwrap();
        assert_eq!(*value.downcast::<i64>().unwrap(), 1);
    }

    #[test]
    fn test_boxed_value_encodes_inner_type() {
        let registry = SerdeRegistry::with_builtins();
        let value: Value = Box::new(String::from("hello"));
        assert_eq!(registry.encode("str", value.as_ref()).unwrap(), b"hello");
    }

    #[test]
    fn test_unknown_annotation() {
        let registry = SerdeRegistry::new();
        let err = registry.decode("grib", &[]).unwrap_err();
        assert!(matches!(err, Error::UnknownAnnotation(name) if name == "grib"));
    }

    #[test]
    fn test_type_mismatch() {
        let registry = SerdeRegistry::with_builtins();
        let err = registry.encode("int", &"not an int").unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
    }

    #[test]
    fn test_wrong_width_rejected() {
        let registry = SerdeRegistry::with_builtins();
        assert!(registry.decode("float", &[1, 2, 3]).is_err());
    }

    #[test]
    fn test_custom_json_type() {
        #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
        struct Grid {
            rows: u32,
            cols: u32,
        }

        let mut registry = SerdeRegistry::new();
        registry.register_json::<Grid>("grid");
        assert_eq!(registry.type_name("grid"), Some(std::any::type_name::<Grid>()));

        let bytes = registry.encode("grid", &Grid { rows: 2, cols: 3 }).unwrap();
        let decoded = registry.decode("grid", &bytes).unwrap();
        assert_eq!(*decoded.downcast::<Grid>().unwrap(), Grid { rows: 2, cols: 3 });
    }
}
