//! Callable resolution.
//!
//! A task names its callable either by an inline key (`func`) or by an
//! entrypoint string `"module.attribute"`. Both are looked up in one
//! [`CallableResolver`] built by the worker binary, so the set of callables
//! a deployment can run is fixed when that binary is built.

use std::any::Any;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::serde_registry::Value;
use crate::task::TaskUnit;

/// A task body. Reads its arguments from the [`Call`] and returns its output.
pub type TaskFn = Arc<dyn Fn(&mut Call) -> anyhow::Result<Value> + Send + Sync>;

/// Arguments assembled for one task invocation.
pub struct Call {
    task: String,
    args: Vec<Option<Value>>,
    kwargs: FxHashMap<String, Value>,
    package_dirs: Vec<PathBuf>,
}

impl Call {
    pub fn new(
        task: impl Into<String>,
        args: Vec<Option<Value>>,
        kwargs: FxHashMap<String, Value>,
        package_dirs: Vec<PathBuf>,
    ) -> Self {
        Self {
            task: task.into(),
            args,
            kwargs,
            package_dirs,
        }
    }

    /// Name of the task being invoked.
    pub fn task(&self) -> &str {
        &self.task
    }

    /// Number of positional arguments.
    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// Borrow a positional argument as `T`.
    pub fn arg<T: Any>(&self, position: usize) -> Result<&T> {
        self.args
            .get(position)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::ArgumentNotFound(format!("{}[{}]", self.task, position)))?
            .downcast_ref::<T>()
            .ok_or_else(|| type_mismatch::<T>(format!("argument {}", position)))
    }

    /// Move a positional argument out of the call.
    pub fn take_arg<T: Any>(&mut self, position: usize) -> Result<T> {
        let slot = self
            .args
            .get_mut(position)
            .ok_or_else(|| Error::ArgumentNotFound(format!("{}[{}]", self.task, position)))?;
        let value = slot
            .take()
            .ok_or_else(|| Error::ArgumentNotFound(format!("{}[{}]", self.task, position)))?;
        match value.downcast::<T>() {
            Ok(value) => Ok(*value),
            Err(value) => {
                *slot = Some(value);
                Err(type_mismatch::<T>(format!("argument {}", position)))
            }
        }
    }

    /// Borrow a keyword argument as `T`.
    pub fn kwarg<T: Any>(&self, name: &str) -> Result<&T> {
        self.kwargs
            .get(name)
            .ok_or_else(|| Error::ArgumentNotFound(format!("{}.{}", self.task, name)))?
            .downcast_ref::<T>()
            .ok_or_else(|| type_mismatch::<T>(format!("keyword {}", name)))
    }

    /// Borrow a keyword argument if it was supplied.
    pub fn kwarg_opt<T: Any>(&self, name: &str) -> Result<Option<&T>> {
        if self.kwargs.contains_key(name) {
            self.kwarg(name).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Isolated package directories visible to this task, highest priority first.
    pub fn package_dirs(&self) -> &[PathBuf] {
        &self.package_dirs
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.kwargs.keys().collect();
        keys.sort();
        f.debug_struct("Call")
            .field("task", &self.task)
            .field("args", &self.args.len())
            .field("kwargs", &keys)
            .finish()
    }
}

fn type_mismatch<T: Any>(what: String) -> Error {
    Error::TypeMismatch {
        annotation: what,
        expected: std::any::type_name::<T>(),
    }
}

/// How a task refers to its callable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallableRef {
    /// Key into the inline table.
    Inline(String),
    /// `"module.attribute"`, split on the last `.`.
    Attribute { module: String, attribute: String },
}

impl CallableRef {
    /// Parse an entrypoint string. `None` if it has no `.` separator.
    pub fn parse_entrypoint(entrypoint: &str) -> Option<Self> {
        let (module, attribute) = entrypoint.rsplit_once('.')?;
        if module.is_empty() || attribute.is_empty() {
            return None;
        }
        Some(CallableRef::Attribute {
            module: module.to_string(),
            attribute: attribute.to_string(),
        })
    }

    /// Candidate references for a task, highest priority first.
    pub fn candidates(task: &TaskUnit) -> Vec<Self> {
        let mut refs = Vec::with_capacity(2);
        if let Some(func) = &task.func {
            refs.push(CallableRef::Inline(func.clone()));
        }
        if let Some(parsed) = task.entrypoint.as_deref().and_then(Self::parse_entrypoint) {
            refs.push(parsed);
        }
        refs
    }
}

impl fmt::Display for CallableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallableRef::Inline(key) => write!(f, "inline {}", key),
            CallableRef::Attribute { module, attribute } => write!(f, "{}.{}", module, attribute),
        }
    }
}

/// Table of callables a worker can run.
#[derive(Clone, Default)]
pub struct CallableResolver {
    inline: FxHashMap<String, TaskFn>,
    modules: FxHashMap<String, FxHashMap<String, TaskFn>>,
}

impl CallableResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an inline callable under `key`.
    pub fn inline<F>(&mut self, key: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&mut Call) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.inline.insert(key.into(), Arc::new(f));
        self
    }

    /// Register `attribute` of `module`, reachable as `"module.attribute"`.
    pub fn attribute<F>(
        &mut self,
        module: impl Into<String>,
        attribute: impl Into<String>,
        f: F,
    ) -> &mut Self
    where
        F: Fn(&mut Call) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.modules
            .entry(module.into())
            .or_default()
            .insert(attribute.into(), Arc::new(f));
        self
    }

    /// Look up one reference.
    pub fn lookup(&self, reference: &CallableRef) -> Option<TaskFn> {
        match reference {
            CallableRef::Inline(key) => self.inline.get(key).cloned(),
            CallableRef::Attribute { module, attribute } => self
                .modules
                .get(module)
                .and_then(|attrs| attrs.get(attribute))
                .cloned(),
        }
    }

    /// Resolve a task's callable. The inline key wins over the entrypoint.
    pub fn resolve(&self, task: &TaskUnit) -> Result<TaskFn> {
        CallableRef::candidates(task)
            .iter()
            .find_map(|reference| self.lookup(reference))
            .ok_or_else(|| Error::NoCallable {
                task: task.name.clone(),
                reference: task.func.clone().or_else(|| task.entrypoint.clone()),
            })
    }

    /// Every registered name, sorted: inline keys, then `module.attribute`.
    pub fn entrypoints(&self) -> Vec<String> {
        let mut inline: Vec<String> = self.inline.keys().cloned().collect();
        inline.sort();
        let mut attrs: Vec<String> = self
            .modules
            .iter()
            .flat_map(|(module, attrs)| attrs.keys().map(move |a| format!("{}.{}", module, a)))
            .collect();
        attrs.sort();
        inline.extend(attrs);
        inline
    }
}

impl fmt::Debug for CallableResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallableResolver")
            .field("entrypoints", &self.entrypoints())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant(n: i64) -> impl Fn(&mut Call) -> anyhow::Result<Value> + Send + Sync + 'static {
        move |_| Ok(Box::new(n) as Value)
    }

    fn invoke(f: &TaskFn) -> i64 {
        let mut call = Call::new("t", Vec::new(), FxHashMap::default(), Vec::new());
        *f(&mut call).unwrap().downcast::<i64>().unwrap()
    }

    #[test]
    fn test_parse_entrypoint_splits_on_last_dot() {
        assert_eq!(
            CallableRef::parse_entrypoint("pkg.sub.run"),
            Some(CallableRef::Attribute {
                module: "pkg.sub".to_string(),
                attribute: "run".to_string(),
            })
        );
        assert_eq!(CallableRef::parse_entrypoint("run"), None);
        assert_eq!(CallableRef::parse_entrypoint("pkg."), None);
    }

    #[test]
    fn test_inline_takes_priority() {
        let mut resolver = CallableResolver::new();
        resolver.inline("closure", constant(1)).attribute("pkg", "run", constant(2));

        let both = TaskUnit::new("t")
            .with_func("closure")
            .with_entrypoint("pkg.run");
        assert_eq!(invoke(&resolver.resolve(&both).unwrap()), 1);

        let entry_only = TaskUnit::new("t").with_entrypoint("pkg.run");
        assert_eq!(invoke(&resolver.resolve(&entry_only).unwrap()), 2);

        // An unknown inline key falls back to the entrypoint.
        let stale = TaskUnit::new("t").with_func("gone").with_entrypoint("pkg.run");
        assert_eq!(invoke(&resolver.resolve(&stale).unwrap()), 2);
    }

    #[test]
    fn test_unresolvable() {
        let mut resolver = CallableResolver::new();
        resolver.attribute("pkg", "run", constant(2));

        for task in [
            TaskUnit::new("t"),
            TaskUnit::new("t").with_entrypoint("pkg.missing"),
            TaskUnit::new("t").with_entrypoint("other.run"),
            TaskUnit::new("t").with_entrypoint("run"),
        ] {
            let err = resolver.resolve(&task).err().unwrap();
            assert!(matches!(err, Error::NoCallable { .. }));
        }
    }

    #[test]
    fn test_entrypoints_listing() {
        let mut resolver = CallableResolver::new();
        resolver
            .attribute("sample", "writer", constant(0))
            .attribute("sample", "reader", constant(0))
            .inline("k", constant(0));
        assert_eq!(
            resolver.entrypoints(),
            vec!["k", "sample.reader", "sample.writer"]
        );
    }

    #[test]
    fn test_call_accessors() {
        let mut kwargs: FxHashMap<String, Value> = FxHashMap::default();
        kwargs.insert("fmt".to_string(), Box::new("x{}".to_string()));
        let first: Value = Box::new(5i64);
        let mut call = Call::new("t", vec![Some(first), None], kwargs, Vec::new());

        assert_eq!(*call.arg::<i64>(0).unwrap(), 5);
        assert!(matches!(call.arg::<String>(0), Err(Error::TypeMismatch { .. })));
        assert!(matches!(call.arg::<i64>(1), Err(Error::ArgumentNotFound(_))));
        assert_eq!(call.kwarg::<String>("fmt").unwrap(), "x{}");
        assert!(call.kwarg_opt::<String>("absent").unwrap().is_none());

        // A failed take leaves the value in place.
        assert!(call.take_arg::<String>(0).is_err());
        assert_eq!(call.take_arg::<i64>(0).unwrap(), 5);
        assert!(call.take_arg::<i64>(0).is_err());
    }
}
