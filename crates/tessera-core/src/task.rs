//! Task descriptors handed to the executor.
//!
//! A [`Subgraph`] is produced by an external planner and run as a unit in
//! one worker process. The executor never interprets a [`TaskUnit`] beyond
//! what is needed to resolve its callable, wire its inputs and store its
//! output.
//!
//! Descriptors derive both serde (JSON plans, CLI) and rkyv (the stdin
//! frame sent to the worker).

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::futures::DataFuture;
use crate::serde_registry::{DEFAULT_ANNOTATION, SerdeRegistry};

fn default_annotation() -> String {
    DEFAULT_ANNOTATION.to_string()
}

/// A static argument, already encoded through the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct EncodedValue {
    #[serde(default = "default_annotation")]
    pub annotation: String,
    pub bytes: Vec<u8>,
}

impl EncodedValue {
    /// Encode a value with the registry entry for `annotation`.
    pub fn encode<T: std::any::Any + Send>(
        registry: &SerdeRegistry,
        annotation: &str,
        value: T,
    ) -> Result<Self> {
        Ok(Self {
            annotation: annotation.to_string(),
            bytes: registry.encode(annotation, &value)?,
        })
    }
}

/// Where a wired value lands in the call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Archive, RkyvSerialize, RkyvDeserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireTarget {
    Position(usize),
    Kwarg(String),
}

/// Edge from another task's output into one of this task's inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct Wiring {
    pub source_task: String,
    pub source_output: String,
    pub target: WireTarget,
    #[serde(default = "default_annotation")]
    pub annotation: String,
}

impl Wiring {
    pub fn source(&self) -> DataFuture {
        DataFuture::new(&self.source_task, &self.source_output)
    }
}

/// A declared output of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct OutputDecl {
    pub name: String,
    #[serde(default = "default_annotation")]
    pub annotation: String,
}

/// A static keyword argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct KwArg {
    pub name: String,
    pub value: EncodedValue,
}

/// The atomic piece of work executed inside a worker process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct TaskUnit {
    pub name: String,

    /// Key of an inline closure registered with the resolver.
    #[serde(default)]
    pub func: Option<String>,

    /// `"module.attribute"` reference registered with the resolver.
    #[serde(default)]
    pub entrypoint: Option<String>,

    /// Static positional arguments; `None` is a slot filled by wiring.
    #[serde(default)]
    pub args: Vec<Option<EncodedValue>>,

    #[serde(default)]
    pub kwargs: Vec<KwArg>,

    #[serde(default)]
    pub outputs: Vec<OutputDecl>,

    #[serde(default)]
    pub wiring: Vec<Wiring>,
}

impl TaskUnit {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_entrypoint(mut self, entrypoint: impl Into<String>) -> Self {
        self.entrypoint = Some(entrypoint.into());
        self
    }

    pub fn with_func(mut self, key: impl Into<String>) -> Self {
        self.func = Some(key.into());
        self
    }

    /// Append a static positional argument.
    pub fn arg(mut self, value: EncodedValue) -> Self {
        self.args.push(Some(value));
        self
    }

    /// Append an empty positional slot to be filled by wiring.
    pub fn gap(mut self) -> Self {
        self.args.push(None);
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: EncodedValue) -> Self {
        self.kwargs.push(KwArg {
            name: name.into(),
            value,
        });
        self
    }

    pub fn output(mut self, name: impl Into<String>, annotation: impl Into<String>) -> Self {
        self.outputs.push(OutputDecl {
            name: name.into(),
            annotation: annotation.into(),
        });
        self
    }

    /// Wire `source_task.source_output` into `target`.
    pub fn wire(
        mut self,
        source_task: impl Into<String>,
        source_output: impl Into<String>,
        target: WireTarget,
        annotation: impl Into<String>,
    ) -> Self {
        self.wiring.push(Wiring {
            source_task: source_task.into(),
            source_output: source_output.into(),
            target,
            annotation: annotation.into(),
        });
        self
    }

    /// Data future of one of this task's outputs.
    pub fn output_future(&self, output: &str) -> DataFuture {
        DataFuture::new(&self.name, output)
    }
}

/// One or more task units run together, in order, in one worker process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct Subgraph {
    /// Planner-assigned label; may be empty.
    #[serde(default)]
    pub job_id: String,

    /// Packages to install into an isolated directory before spawning.
    #[serde(default)]
    pub packages: Vec<String>,

    pub tasks: Vec<TaskUnit>,
}

impl Subgraph {
    pub fn new(job_id: impl Into<String>, tasks: Vec<TaskUnit>) -> Self {
        Self {
            job_id: job_id.into(),
            packages: Vec::new(),
            tasks,
        }
    }

    pub fn with_packages(mut self, packages: Vec<String>) -> Self {
        self.packages = packages;
        self
    }

    /// Names of the tasks in this subgraph, joined for log lines.
    pub fn label(&self) -> String {
        self.tasks
            .iter()
            .map(|t| t.name.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}
