//! End-to-end tests running real `tessera-worker` processes over OS shared
//! memory.
//!
//! Task names carry a random suffix so that concurrent test runs never share
//! a segment name.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use tessera_core::{
    ChildReport, DataFuture, EncodedValue, Executor, ExecutorConfig, PosixShmClient, ProcId,
    SerdeRegistry, SpawnObserver, Subgraph, TaskUnit, UnitStatus, WireTarget, WorkerLauncher,
};

const WORKER: &str = env!("CARGO_BIN_EXE_tessera-worker");

fn unique(name: &str) -> String {
    format!("{}-{}", name, uuid::Uuid::new_v4().simple())
}

fn executor(config: ExecutorConfig) -> Executor<PosixShmClient, WorkerLauncher> {
    Executor::with_parts(config, PosixShmClient::new(), WorkerLauncher::new(WORKER))
}

fn config(pool_size: usize) -> ExecutorConfig {
    ExecutorConfig {
        pool_size,
        fetch_poll_interval_ms: 5,
        fetch_timeout_ms: Some(10_000),
        ..Default::default()
    }
}

/// Drive `wait_some` until nothing is running or queued.
fn drain(executor: &mut Executor<PosixShmClient, WorkerLauncher>) {
    while executor.procwatch().outstanding() > 0 {
        executor
            .procwatch_mut()
            .wait_some(Some(Duration::from_secs(30)))
            .unwrap();
    }
}

fn chain(reader: &str, processor: &str, writer: &str) -> [TaskUnit; 3] {
    [
        TaskUnit::new(reader)
            .with_entrypoint("sample.reader")
            .output("out", "bytes"),
        TaskUnit::new(processor)
            .with_entrypoint("sample.processor")
            .wire(reader, "out", WireTarget::Position(0), "bytes")
            .output("out", "bytes"),
        TaskUnit::new(writer)
            .with_entrypoint("sample.writer")
            .wire(processor, "out", WireTarget::Position(0), "bytes")
            .output("out", "bytes"),
    ]
}

#[test]
fn test_linear_chain_across_processes() {
    let (reader, processor, writer) = (unique("reader"), unique("processor"), unique("writer"));
    let mut executor = executor(config(2));

    // One stage per task: each consumer starts after its producer published.
    for task in chain(&reader, &processor, &writer) {
        let id = executor
            .run_at(Subgraph::new("chain", vec![task]), "localhost")
            .unwrap();
        drain(&mut executor);
        assert_eq!(
            executor.proc_status(&id).unwrap(),
            Some(UnitStatus::Succeeded),
            "{:?}",
            executor.failure_report(&id).unwrap()
        );
    }

    assert_eq!(executor.fetch_as_value(&writer, "out").unwrap(), b"value is 1");
    assert_eq!(executor.fetch_as_value(&processor, "out").unwrap(), vec![0, 1]);

    for task in [&reader, &processor, &writer] {
        executor.purge(task, "out", None).unwrap();
        let data = DataFuture::new(task.as_str(), "out").as_ctrl_id();
        assert!(!executor.is_done(&data).unwrap());
    }
}

#[test]
fn test_chain_in_one_subgraph() {
    let (reader, processor, writer) = (unique("reader"), unique("processor"), unique("writer"));
    let mut executor = executor(config(1));

    let id = executor
        .run_at(
            Subgraph::new("chain", chain(&reader, &processor, &writer).to_vec()),
            "localhost",
        )
        .unwrap();
    let ready = executor.wait_some(&[id.clone()], Some(Duration::from_secs(30))).unwrap();
    assert_eq!(ready, vec![id.clone()]);
    assert_eq!(executor.proc_status(&id).unwrap(), Some(UnitStatus::Succeeded));

    let output = executor.scatter(&writer, "out", &["localhost"]).unwrap();
    assert!(executor.is_done(&output).unwrap());
    assert_eq!(executor.fetch_as_value(&writer, "out").unwrap(), b"value is 1");

    for task in [&reader, &processor, &writer] {
        executor.purge(task, "out", Some(&["localhost"])).unwrap();
    }
}

#[derive(Default)]
struct Concurrency {
    running: usize,
    max_running: usize,
    spawned: Vec<ProcId>,
}

#[derive(Clone, Default)]
struct ConcurrencyRecorder(Rc<RefCell<Concurrency>>);

impl SpawnObserver for ConcurrencyRecorder {
    fn on_spawn(&self, id: ProcId, _pid: u32, running: usize) {
        let mut state = self.0.borrow_mut();
        state.running = running;
        state.max_running = state.max_running.max(running);
        state.spawned.push(id);
    }

    fn on_exit(&self, _id: ProcId, _status: UnitStatus, running: usize) {
        self.0.borrow_mut().running = running;
    }
}

#[test]
fn test_pool_bound_with_real_workers() {
    let registry = SerdeRegistry::with_builtins();
    let recorder = ConcurrencyRecorder::default();
    let mut executor = executor(config(2)).with_observer(recorder.clone());

    let ids: Vec<String> = (0..5)
        .map(|i| {
            let task = TaskUnit::new(format!("noop-{}", i))
                .with_entrypoint("sample.sleep")
                .kwarg(
                    "millis",
                    EncodedValue::encode(&registry, "int", 50i64).unwrap(),
                );
            executor
                .run_at(Subgraph::new("pool", vec![task]), "localhost")
                .unwrap()
        })
        .collect();
    assert_eq!(executor.procwatch().running_count(), 2);

    let summary = executor.join().unwrap();
    assert!(summary.all_succeeded());
    assert_eq!(summary.succeeded.len(), 5);

    let state = recorder.0.borrow();
    assert!(state.max_running <= 2);
    assert_eq!(state.spawned, vec![0, 1, 2, 3, 4]);
    assert_eq!(state.running, 0);
    for id in &ids {
        assert_eq!(executor.proc_status(id).unwrap(), Some(UnitStatus::Succeeded));
    }
}

#[test]
fn test_failure_report_reaches_parent() {
    let registry = SerdeRegistry::with_builtins();
    let produced = unique("produced");
    let mut executor = executor(config(1));

    let subgraph = Subgraph::new(
        "failing",
        vec![
            TaskUnit::new(produced.as_str())
                .with_entrypoint("sample.reader")
                .output("out", "bytes"),
            TaskUnit::new("bad")
                .with_entrypoint("sample.fail")
                .kwarg(
                    "message",
                    EncodedValue::encode(&registry, "str", "boom".to_string()).unwrap(),
                ),
            TaskUnit::new("never").with_entrypoint("sample.noop"),
        ],
    );
    let id = executor.run_at(subgraph, "localhost").unwrap();
    let summary = executor.join().unwrap();
    assert_eq!(summary.failed, vec![0]);
    assert_eq!(executor.proc_status(&id).unwrap(), Some(UnitStatus::Failed));
    assert_eq!(executor.procwatch().exit_code(0), Some(1));

    match executor.failure_report(&id).unwrap() {
        Some(ChildReport::Failed { task, message }) => {
            assert_eq!(task.as_deref(), Some("bad"));
            assert!(message.contains("boom"), "{}", message);
        }
        other => panic!("unexpected report: {:?}", other),
    }

    // Outputs written before the failure are left in place.
    assert_eq!(executor.fetch_as_value(&produced, "out").unwrap(), vec![0, 0]);
    executor.purge(&produced, "out", None).unwrap();
}

#[test]
fn test_unknown_entrypoint_fails_unit() {
    let mut executor = executor(config(1));
    let id = executor
        .run_at(
            Subgraph::new(
                "missing",
                vec![TaskUnit::new("t").with_entrypoint("nowhere.run")],
            ),
            "localhost",
        )
        .unwrap();
    executor.join().unwrap();

    match executor.failure_report(&id).unwrap() {
        Some(ChildReport::Failed { message, .. }) => {
            assert!(message.contains("no resolvable callable"), "{}", message)
        }
        other => panic!("unexpected report: {:?}", other),
    }
}

/// Fake installer: creates `<target>/<pkg>/__init__.py` for every package.
const FAKE_INSTALLER: &str = r#"
shift
target=""
while [ $# -gt 0 ]; do
    case "$1" in
        --target) target="$2"; shift 2 ;;
        --offline) shift ;;
        --cache-dir) shift 2 ;;
        *) mkdir -p "$target/$1" && : > "$target/$1/__init__.py"; shift ;;
    esac
done
"#;

fn fake_installer(dir: &Path) -> Vec<String> {
    let script = dir.join("installer.sh");
    std::fs::write(&script, FAKE_INSTALLER).unwrap();
    vec!["sh".to_string(), script.to_string_lossy().into_owned()]
}

/// Run a task that locates a package installed for its unit, with package
/// directories passed through `search_path_var`.
fn check_isolated_package(search_path_var: &str) {
    let temp = tempfile::TempDir::new().unwrap();
    let work = temp.path().join("work");
    std::fs::create_dir(&work).unwrap();

    let registry = SerdeRegistry::with_builtins();
    let locate = unique("locate");
    let mut executor = executor(ExecutorConfig {
        installer: fake_installer(temp.path()),
        work_dir: Some(work.clone()),
        search_path_var: search_path_var.to_string(),
        ..config(1)
    });

    let subgraph = Subgraph::new(
        "with-packages",
        vec![
            TaskUnit::new(locate.as_str())
                .with_entrypoint("env.locate")
                .kwarg(
                    "name",
                    EncodedValue::encode(&registry, "str", "examplepkg".to_string()).unwrap(),
                )
                .output("path", "str"),
        ],
    )
    .with_packages(vec!["examplepkg".to_string()]);

    let id = executor.run_at(subgraph, "localhost").unwrap();
    executor.join().unwrap();
    assert_eq!(
        executor.proc_status(&id).unwrap(),
        Some(UnitStatus::Succeeded),
        "{:?}",
        executor.failure_report(&id).unwrap()
    );

    let path = String::from_utf8(executor.fetch_as_value(&locate, "path").unwrap()).unwrap();
    let package = Path::new(&path);
    assert!(package.starts_with(&work));
    assert_eq!(package.file_name().unwrap(), "examplepkg");

    // The directory went away with the unit.
    assert!(!package.exists());
    assert_eq!(std::fs::read_dir(&work).unwrap().count(), 0);

    executor.purge(&locate, "path", None).unwrap();
}

#[test]
fn test_isolated_package_directory() {
    check_isolated_package(tessera_core::DEFAULT_SEARCH_PATH_VAR);
}

#[test]
fn test_isolated_package_directory_custom_variable() {
    check_isolated_package("TESSERA_TEST_SITE_PATH");
}
