//! The body that runs inside every worker process.
//!
//! For each task of the subgraph, in order:
//!
//! 1. resolve the callable through the [`CallableResolver`]
//! 2. reject tasks declaring more than one output
//! 3. build the call from static arguments and wired inputs, reading wired
//!    inputs from shared memory through an [`ExecutionMemoryManager`]
//! 4. invoke, catching panics
//! 5. publish the single output, if one is declared, under the task's own
//!    data future
//!
//! Arguments and the result are dropped before the memory manager, and the
//! memory manager releases its handles when it goes out of scope, so every
//! path out of a task (success, error, panic) leaves nothing mapped.
//!
//! The first failing task stops the subgraph. Its error is written to the
//! report pipe and the process exits with status 1.

mod resolver;

use std::ffi::OsString;
use std::io::Read;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::ExitCode;

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::config::{DEFAULT_SEARCH_PATH_VAR, SEARCH_PATH_NAME_VAR};
use crate::error::{Error as CoreError, Result};
use crate::ipc::{self, ChildReport, WorkerPayload};
use crate::memory::ExecutionMemoryManager;
use crate::serde_registry::{SerdeRegistry, Value};
use crate::shm::ShmClient;
use crate::task::{Subgraph, TaskUnit, WireTarget};

pub use resolver::{Call, CallableRef, CallableResolver, TaskFn};

/// Why a subgraph stopped.
#[derive(Debug, Error)]
pub enum TaskFailure {
    #[error("task {task} failed: {source}")]
    Failed {
        task: String,
        #[source]
        source: CoreError,
    },

    #[error("task {task} panicked: {message}")]
    Panicked { task: String, message: String },
}

impl TaskFailure {
    pub fn task(&self) -> &str {
        match self {
            TaskFailure::Failed { task, .. } | TaskFailure::Panicked { task, .. } => task,
        }
    }

    pub fn to_report(&self) -> ChildReport {
        match self {
            TaskFailure::Failed { task, source } => ChildReport::Failed {
                task: Some(task.clone()),
                message: source.to_string(),
            },
            TaskFailure::Panicked { task, message } => ChildReport::Panicked {
                task: task.clone(),
                message: message.clone(),
            },
        }
    }
}

/// Executes subgraphs against one resolver, registry and shared-memory client.
pub struct WorkerRuntime<'a> {
    resolver: &'a CallableResolver,
    registry: &'a SerdeRegistry,
    client: &'a dyn ShmClient,
    package_dirs: Vec<PathBuf>,
}

impl<'a> WorkerRuntime<'a> {
    pub fn new(
        resolver: &'a CallableResolver,
        registry: &'a SerdeRegistry,
        client: &'a dyn ShmClient,
    ) -> Self {
        Self {
            resolver,
            registry,
            client,
            package_dirs: Vec::new(),
        }
    }

    /// Package directories handed to every task through [`Call::package_dirs`].
    pub fn with_package_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.package_dirs = dirs;
        self
    }

    /// Run every task of `subgraph` in order, stopping at the first failure.
    pub fn execute_subgraph(&self, subgraph: &Subgraph) -> std::result::Result<(), TaskFailure> {
        for task in &subgraph.tasks {
            tracing::debug!(job = %subgraph.label(), task = %task.name, "running task");
            match panic::catch_unwind(AssertUnwindSafe(|| self.execute_task(task))) {
                Ok(Ok(())) => {}
                Ok(Err(source)) => {
                    return Err(TaskFailure::Failed {
                        task: task.name.clone(),
                        source,
                    });
                }
                Err(payload) => {
                    return Err(TaskFailure::Panicked {
                        task: task.name.clone(),
                        message: panic_message(payload.as_ref()),
                    });
                }
            }
        }
        Ok(())
    }

    /// Run a single task.
    pub fn execute_task(&self, task: &TaskUnit) -> Result<()> {
        let callable = self.resolver.resolve(task)?;
        if task.outputs.len() > 1 {
            return Err(CoreError::MultipleOutputs {
                task: task.name.clone(),
                count: task.outputs.len(),
            });
        }

        let mut memory = ExecutionMemoryManager::new(self.client, self.registry);
        let result = {
            let mut call = self.build_call(task, &mut memory)?;
            callable(&mut call).map_err(|e| CoreError::Task {
                task: task.name.clone(),
                message: format!("{:#}", e),
            })?
        };

        if let Some(output) = task.outputs.first() {
            let shm_id = task.output_future(&output.name).as_shm_id();
            memory.put(&*result, &shm_id, &output.annotation)?;
            tracing::debug!(task = %task.name, output = %output.name, shm_id, "stored output");
        }
        drop(result);
        Ok(())
    }

    fn build_call(&self, task: &TaskUnit, memory: &mut ExecutionMemoryManager<'_>) -> Result<Call> {
        let mut args: Vec<Option<Value>> = Vec::with_capacity(task.args.len());
        for arg in &task.args {
            args.push(match arg {
                Some(encoded) => Some(self.registry.decode(&encoded.annotation, &encoded.bytes)?),
                None => None,
            });
        }

        let mut kwargs: FxHashMap<String, Value> = FxHashMap::default();
        for kwarg in &task.kwargs {
            let value = self
                .registry
                .decode(&kwarg.value.annotation, &kwarg.value.bytes)?;
            kwargs.insert(kwarg.name.clone(), value);
        }

        for wiring in &task.wiring {
            let shm_id = wiring.source().as_shm_id();
            let value = memory.get(&shm_id, &wiring.annotation)?;
            match &wiring.target {
                WireTarget::Position(position) => {
                    if args.len() <= *position {
                        args.resize_with(position + 1, || None);
                    }
                    args[*position] = Some(value);
                }
                WireTarget::Kwarg(name) => {
                    kwargs.insert(name.clone(), value);
                }
            }
        }

        if let Some(position) = args.iter().position(Option::is_none) {
            return Err(CoreError::MissingArgument {
                task: task.name.clone(),
                position,
            });
        }

        Ok(Call::new(
            task.name.clone(),
            args,
            kwargs,
            self.package_dirs.clone(),
        ))
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Package directories passed by the parent, in priority order.
///
/// Read from the variable named by [`SEARCH_PATH_NAME_VAR`], or from
/// [`DEFAULT_SEARCH_PATH_VAR`] when the parent did not name one.
pub fn inherited_package_dirs() -> Vec<PathBuf> {
    package_dirs_from(|key| std::env::var_os(key))
}

fn package_dirs_from(lookup: impl Fn(&str) -> Option<OsString>) -> Vec<PathBuf> {
    let var = lookup(SEARCH_PATH_NAME_VAR)
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| DEFAULT_SEARCH_PATH_VAR.to_string());
    lookup(&var)
        .map(|paths| std::env::split_paths(&paths).collect())
        .unwrap_or_default()
}

/// Complete worker process body.
///
/// Reads a [`WorkerPayload`] from stdin, runs its subgraph and, on failure,
/// writes a [`ChildReport`] to the report descriptor named by
/// [`REPORT_FD_VAR`](crate::ipc::REPORT_FD_VAR). Returns the exit code: 0 if
/// every task succeeded, 1 otherwise.
pub fn run_worker(
    resolver: &CallableResolver,
    registry: &SerdeRegistry,
    client: &dyn ShmClient,
) -> ExitCode {
    let mut report_channel = ipc::open_report_channel();

    let report = match read_payload() {
        Ok(payload) => {
            tracing::debug!(
                proc_id = payload.proc_id,
                job = %payload.subgraph.label(),
                tasks = payload.subgraph.tasks.len(),
                "worker started"
            );
            let runtime = WorkerRuntime::new(resolver, registry, client)
                .with_package_dirs(inherited_package_dirs());
            match runtime.execute_subgraph(&payload.subgraph) {
                Ok(()) => return ExitCode::SUCCESS,
                Err(failure) => {
                    tracing::error!("{}", failure);
                    failure.to_report()
                }
            }
        }
        Err(e) => {
            tracing::error!("failed to read worker payload: {}", e);
            ChildReport::Failed {
                task: None,
                message: e.to_string(),
            }
        }
    };

    if let Some(channel) = report_channel.as_mut()
        && let Err(e) = ipc::write_message(channel, &report)
    {
        tracing::warn!("failed to send failure report: {}", e);
    }
    ExitCode::FAILURE
}

fn read_payload() -> Result<WorkerPayload> {
    let mut bytes = Vec::new();
    std::io::stdin().lock().read_to_end(&mut bytes)?;
    ipc::read_message(&mut bytes.as_slice())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use anyhow::Context;

    use super::*;
    use crate::futures::DataFuture;
    use crate::shm::{InMemoryShmClient, SegmentStatus};
    use crate::task::EncodedValue;

    fn sample_resolver() -> CallableResolver {
        let mut resolver = CallableResolver::new();
        resolver
            .attribute("sample", "reader", |_| Ok(Box::new(vec![0u8, 0]) as Value))
            .attribute("sample", "processor", |call| {
                let bytes = call.take_arg::<Vec<u8>>(0)?;
                let raw: [u8; 2] = bytes
                    .as_slice()
                    .try_into()
                    .context("expected two bytes")?;
                let next = u16::from_be_bytes(raw) + 1;
                Ok(Box::new(next.to_be_bytes().to_vec()) as Value)
            })
            .attribute("sample", "writer", |call| {
                let bytes = call.arg::<Vec<u8>>(0)?;
                let n = u16::from_be_bytes([bytes[0], bytes[1]]);
                Ok(Box::new(format!("value is {}", n).into_bytes()) as Value)
            })
            .attribute("sample", "fail", |_| {
                Err(anyhow::anyhow!("inner cause")).context("task body failed")
            })
            .attribute("sample", "panic", |_| panic!("exploded"));
        resolver
    }

    fn chain() -> Subgraph {
        Subgraph::new(
            "job",
            vec![
                TaskUnit::new("reader")
                    .with_entrypoint("sample.reader")
                    .output("out", "bytes"),
                TaskUnit::new("processor")
                    .with_entrypoint("sample.processor")
                    .wire("reader", "out", WireTarget::Position(0), "bytes")
                    .output("out", "bytes"),
                TaskUnit::new("writer")
                    .with_entrypoint("sample.writer")
                    .wire("processor", "out", WireTarget::Position(0), "bytes")
                    .output("out", "bytes"),
            ],
        )
    }

    #[test]
    fn test_linear_chain() {
        let resolver = sample_resolver();
        let registry = SerdeRegistry::with_builtins();
        let client = InMemoryShmClient::new();

        WorkerRuntime::new(&resolver, &registry, &client)
            .execute_subgraph(&chain())
            .unwrap();

        let shm_id = DataFuture::new("writer", "out").as_shm_id();
        assert_eq!(client.status(&shm_id).unwrap(), SegmentStatus::Ready);
        assert_eq!(client.get(&shm_id).unwrap().as_bytes(), b"value is 1");
        assert_eq!(client.open_count(&DataFuture::new("reader", "out").as_shm_id()), 1);
    }

    #[test]
    fn test_static_args_and_kwargs() {
        let registry = SerdeRegistry::with_builtins();
        let client = InMemoryShmClient::new();
        client.insert(&DataFuture::new("src", "out").as_shm_id(), b"wired");

        let mut resolver = CallableResolver::new();
        resolver.inline("join", |call| {
            let sep = call.kwarg::<String>("sep")?;
            let left = call.arg::<String>(0)?;
            let right = call.arg::<Vec<u8>>(1)?;
            let tail = call.kwarg::<Vec<u8>>("tail")?;
            Ok(Box::new(format!(
                "{}{}{}{}{}",
                left,
                sep,
                String::from_utf8_lossy(right),
                sep,
                String::from_utf8_lossy(tail)
            )) as Value)
        });

        let task = TaskUnit::new("join")
            .with_func("join")
            .arg(EncodedValue::encode(&registry, "str", "static".to_string()).unwrap())
            .gap()
            .kwarg("sep", EncodedValue::encode(&registry, "str", "-".to_string()).unwrap())
            .wire("src", "out", WireTarget::Position(1), "bytes")
            .wire("src", "out", WireTarget::Kwarg("tail".to_string()), "bytes")
            .output("out", "str");

        WorkerRuntime::new(&resolver, &registry, &client)
            .execute_task(&task)
            .unwrap();

        let out = client.get(&task.output_future("out").as_shm_id()).unwrap();
        assert_eq!(out.as_bytes(), b"static-wired-wired");
        // Two wirings from the same source open it once.
        assert_eq!(client.open_count(&DataFuture::new("src", "out").as_shm_id()), 1);
    }

    #[test]
    fn test_unfilled_gap() {
        let registry = SerdeRegistry::with_builtins();
        let client = InMemoryShmClient::new();
        let mut resolver = CallableResolver::new();
        resolver.inline("f", |_| Ok(Box::new(()) as Value));

        let task = TaskUnit::new("t").with_func("f").gap();
        let err = WorkerRuntime::new(&resolver, &registry, &client)
            .execute_task(&task)
            .unwrap_err();
        assert!(matches!(err, CoreError::MissingArgument { position: 0, .. }));
    }

    #[test]
    fn test_missing_callable_touches_no_memory() {
        let registry = SerdeRegistry::with_builtins();
        let client = InMemoryShmClient::new();
        let resolver = CallableResolver::new();

        let task = TaskUnit::new("t")
            .with_entrypoint("nowhere.run")
            .wire("src", "out", WireTarget::Position(0), "bytes")
            .output("out", "bytes");
        let err = WorkerRuntime::new(&resolver, &registry, &client)
            .execute_task(&task)
            .unwrap_err();

        assert!(matches!(err, CoreError::NoCallable { .. }));
        assert_eq!(client.open_count(&DataFuture::new("src", "out").as_shm_id()), 0);
        assert_eq!(client.allocation_count(), 0);
    }

    #[test]
    fn test_multiple_outputs_fail_before_invocation() {
        let registry = SerdeRegistry::with_builtins();
        let client = InMemoryShmClient::new();
        let invoked = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&invoked);

        let mut resolver = CallableResolver::new();
        resolver.inline("f", move |_| {
            flag.store(true, Ordering::SeqCst);
            Ok(Box::new(Vec::<u8>::new()) as Value)
        });

        let task = TaskUnit::new("t")
            .with_func("f")
            .output("a", "bytes")
            .output("b", "bytes");
        let err = WorkerRuntime::new(&resolver, &registry, &client)
            .execute_task(&task)
            .unwrap_err();

        assert!(matches!(err, CoreError::MultipleOutputs { count: 2, .. }));
        assert!(!invoked.load(Ordering::SeqCst));
        assert_eq!(client.allocation_count(), 0);
    }

    #[test]
    fn test_no_output_declared_stores_nothing() {
        let registry = SerdeRegistry::with_builtins();
        let client = InMemoryShmClient::new();
        let mut resolver = CallableResolver::new();
        resolver.inline("f", |_| Ok(Box::new(()) as Value));

        WorkerRuntime::new(&resolver, &registry, &client)
            .execute_task(&TaskUnit::new("t").with_func("f"))
            .unwrap();
        assert!(client.names().is_empty());
    }

    #[test]
    fn test_failure_stops_subgraph() {
        let resolver = sample_resolver();
        let registry = SerdeRegistry::with_builtins();
        let client = InMemoryShmClient::new();

        let subgraph = Subgraph::new(
            "job",
            vec![
                TaskUnit::new("bad").with_entrypoint("sample.fail"),
                TaskUnit::new("reader")
                    .with_entrypoint("sample.reader")
                    .output("out", "bytes"),
            ],
        );
        let failure = WorkerRuntime::new(&resolver, &registry, &client)
            .execute_subgraph(&subgraph)
            .unwrap_err();

        assert_eq!(failure.task(), "bad");
        match failure.to_report() {
            ChildReport::Failed { task, message } => {
                assert_eq!(task.as_deref(), Some("bad"));
                assert!(message.contains("task body failed: inner cause"), "{}", message);
            }
            other => panic!("unexpected report {:?}", other),
        }
        assert!(client.names().is_empty());
    }

    #[test]
    fn test_panic_is_caught() {
        let resolver = sample_resolver();
        let registry = SerdeRegistry::with_builtins();
        let client = InMemoryShmClient::new();

        let subgraph = Subgraph::new("job", vec![TaskUnit::new("p").with_entrypoint("sample.panic")]);
        let failure = WorkerRuntime::new(&resolver, &registry, &client)
            .execute_subgraph(&subgraph)
            .unwrap_err();
        assert!(matches!(
            failure,
            TaskFailure::Panicked { ref message, .. } if message == "exploded"
        ));
    }

    #[test]
    fn test_missing_input_segment_propagates() {
        let resolver = sample_resolver();
        let registry = SerdeRegistry::with_builtins();
        let client = InMemoryShmClient::new();

        let task = TaskUnit::new("processor")
            .with_entrypoint("sample.processor")
            .wire("reader", "out", WireTarget::Position(0), "bytes")
            .output("out", "bytes");
        let err = WorkerRuntime::new(&resolver, &registry, &client)
            .execute_task(&task)
            .unwrap_err();
        assert!(matches!(err, CoreError::Shm(crate::shm::ShmError::NotFound(_))));
    }

    #[test]
    fn test_package_dirs_follow_named_variable() {
        let env: FxHashMap<&str, &str> = [
            (SEARCH_PATH_NAME_VAR, "SITE_PACKAGES_EXTRA"),
            ("SITE_PACKAGES_EXTRA", "/tmp/a:/tmp/b"),
            (DEFAULT_SEARCH_PATH_VAR, "/tmp/ignored"),
        ]
        .into_iter()
        .collect();

        let dirs = package_dirs_from(|key| env.get(key).map(OsString::from));
        assert_eq!(dirs, vec![PathBuf::from("/tmp/a"), PathBuf::from("/tmp/b")]);
    }

    #[test]
    fn test_package_dirs_default_variable() {
        let env: FxHashMap<&str, &str> = [(DEFAULT_SEARCH_PATH_VAR, "/tmp/pkgs")].into_iter().collect();
        let dirs = package_dirs_from(|key| env.get(key).map(OsString::from));
        assert_eq!(dirs, vec![PathBuf::from("/tmp/pkgs")]);
        assert!(package_dirs_from(|_| None).is_empty());
    }
}
