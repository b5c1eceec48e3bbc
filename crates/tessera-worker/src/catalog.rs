//! Built-in task catalog.
//!
//! Every callable this worker can run, keyed by entrypoint. Deployments with
//! their own task bodies build their own worker binary around
//! [`tessera_core::run_worker`] with a resolver of their own.

use std::time::Duration;

use anyhow::{Context, bail, ensure};
use tessera_core::{Call, CallableResolver, Value};

pub fn catalog() -> CallableResolver {
    let mut resolver = CallableResolver::new();
    resolver
        .attribute("sample", "reader", reader)
        .attribute("sample", "processor", processor)
        .attribute("sample", "writer", writer)
        .attribute("sample", "noop", |_| Ok(Box::new(()) as Value))
        .attribute("sample", "fail", fail)
        .attribute("sample", "sleep", sleep)
        .attribute("bytes", "concat", concat)
        .attribute("env", "locate", locate);
    resolver
}

fn two_bytes(bytes: &[u8]) -> anyhow::Result<u16> {
    let raw: [u8; 2] = bytes
        .try_into()
        .with_context(|| format!("expected 2 bytes, got {}", bytes.len()))?;
    Ok(u16::from_be_bytes(raw))
}

/// Emits a counter as two big-endian bytes, starting from kwarg `start` (default 0).
fn reader(call: &mut Call) -> anyhow::Result<Value> {
    let start = call.kwarg_opt::<i64>("start")?.copied().unwrap_or(0);
    let start = u16::try_from(start).context("start must fit in 16 bits")?;
    Ok(Box::new(start.to_be_bytes().to_vec()))
}

/// Increments a two-byte counter.
fn processor(call: &mut Call) -> anyhow::Result<Value> {
    let bytes = call.take_arg::<Vec<u8>>(0)?;
    let n = two_bytes(&bytes)?;
    let next = n.checked_add(1).context("counter overflow")?;
    Ok(Box::new(next.to_be_bytes().to_vec()))
}

/// Renders a two-byte counter as text.
fn writer(call: &mut Call) -> anyhow::Result<Value> {
    let n = two_bytes(call.arg::<Vec<u8>>(0)?)?;
    Ok(Box::new(format!("value is {}", n).into_bytes()))
}

fn fail(call: &mut Call) -> anyhow::Result<Value> {
    let message = call
        .kwarg_opt::<String>("message")?
        .cloned()
        .unwrap_or_else(|| "requested failure".to_string());
    bail!(message)
}

fn sleep(call: &mut Call) -> anyhow::Result<Value> {
    let millis = call.kwarg_opt::<i64>("millis")?.copied().unwrap_or(0);
    ensure!(millis >= 0, "millis must not be negative");
    std::thread::sleep(Duration::from_millis(millis as u64));
    Ok(Box::new(()))
}

fn concat(call: &mut Call) -> anyhow::Result<Value> {
    let mut out = Vec::new();
    for position in 0..call.arg_count() {
        out.extend_from_slice(call.arg::<Vec<u8>>(position)?);
    }
    Ok(Box::new(out))
}

/// Path of the package named by kwarg `name` in the task's package directories.
fn locate(call: &mut Call) -> anyhow::Result<Value> {
    let name = call.kwarg::<String>("name")?;
    let found = call
        .package_dirs()
        .iter()
        .map(|dir| dir.join(name))
        .find(|pkg| pkg.join("__init__.py").is_file())
        .with_context(|| format!("package {} is not installed for task {}", name, call.task()))?;
    Ok(Box::new(found.to_string_lossy().into_owned()))
}
