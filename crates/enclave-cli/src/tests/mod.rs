//! Unit tests for the CLI runtime with an injected configuration loader.

use std::cell::RefCell;
use std::ffi::OsString;
use std::fs;
use std::path::Path;
use std::process::ExitCode;

use camino::Utf8PathBuf;
use enclave_config::Config;
use rstest::{fixture, rstest};
use serde_json::{Value, json};
use tempfile::TempDir;

use crate::config::ConfigLoader;
use crate::errors::AppError;
use crate::run_with_loader;

/// Returns a fixed configuration and records the arguments it was given.
struct StaticConfigLoader {
    config: Config,
    seen: RefCell<Vec<OsString>>,
}

impl StaticConfigLoader {
    fn new(config: Config) -> Self {
        Self {
            config,
            seen: RefCell::new(Vec::new()),
        }
    }
}

impl ConfigLoader for StaticConfigLoader {
    fn load(&self, args: &[OsString]) -> Result<Config, AppError> {
        self.seen.borrow_mut().extend_from_slice(args);
        Ok(self.config.clone())
    }
}

struct Outcome {
    exit: ExitCode,
    stdout: String,
    stderr: String,
}

impl Outcome {
    fn lines(&self) -> Vec<Value> {
        self.stdout
            .lines()
            .map(|line| serde_json::from_str(line).expect("JSON line"))
            .collect()
    }
}

fn run(loader: &StaticConfigLoader, args: &[&str]) -> Outcome {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let argv = std::iter::once("enclave")
        .chain(args.iter().copied())
        .map(OsString::from);
    let exit = run_with_loader(argv, &mut stdout, &mut stderr, loader);
    Outcome {
        exit,
        stdout: String::from_utf8(stdout).expect("stdout utf8"),
        stderr: String::from_utf8(stderr).expect("stderr utf8"),
    }
}

fn write_plugin(root: &Path, name: &str, quotas: Option<Value>, source: &str) -> Utf8PathBuf {
    let dir = root.join(name);
    fs::create_dir_all(&dir).expect("plugin dir");
    let mut manifest = json!({ "name": name, "version": "0.3.0", "entryPoint": "main.lua" });
    if let (Some(object), Some(limits)) = (manifest.as_object_mut(), quotas) {
        object.insert(String::from("quotas"), limits);
    }
    fs::write(dir.join("plugin.json"), manifest.to_string()).expect("write manifest");
    fs::write(dir.join("main.lua"), source).expect("write entry point");
    Utf8PathBuf::from_path_buf(dir).expect("utf8 temp path")
}

fn quotas() -> Option<Value> {
    Some(json!({ "cpuMs": 500, "memKb": 2048 }))
}

#[fixture]
fn root() -> TempDir {
    TempDir::new().expect("temp dir")
}

fn loader_for(root: &TempDir) -> StaticConfigLoader {
    let plugins_dir = Utf8PathBuf::from_path_buf(root.path().to_path_buf()).expect("utf8");
    StaticConfigLoader::new(Config {
        plugins_dir,
        ..Config::default()
    })
}

// ---------------------------------------------------------------------------
// list
// ---------------------------------------------------------------------------

#[rstest]
fn list_prints_plugins_then_failures(root: TempDir) {
    write_plugin(root.path(), "greeter", quotas(), "return { greet = function() end }");
    write_plugin(root.path(), "unbounded", None, "return {}");

    let outcome = run(&loader_for(&root), &["list"]);

    assert_eq!(outcome.exit, ExitCode::SUCCESS, "stderr: {}", outcome.stderr);
    let lines = outcome.lines();
    let [plugin, failure] = lines.as_slice() else {
        panic!("expected two lines, got {lines:?}");
    };
    assert_eq!(
        plugin,
        &json!({
            "name": "greeter",
            "version": "0.3.0",
            "exports": [{ "name": "greet", "function": true }],
        })
    );
    assert_eq!(failure.get("kind"), Some(&json!("quota")));
    assert!(
        failure
            .get("directory")
            .and_then(Value::as_str)
            .is_some_and(|directory| directory.ends_with("unbounded"))
    );
}

#[rstest]
fn list_flag_overrides_configured_directory(root: TempDir) {
    let other = TempDir::new().expect("other dir");
    write_plugin(other.path(), "elsewhere", quotas(), "return {}");
    let other_dir = other.path().to_str().expect("utf8 path");

    let outcome = run(&loader_for(&root), &["list", "--plugins-dir", other_dir]);

    assert_eq!(outcome.exit, ExitCode::SUCCESS);
    let names: Vec<Value> = outcome
        .lines()
        .iter()
        .filter_map(|line| line.get("name").cloned())
        .collect();
    assert_eq!(names, vec![json!("elsewhere")]);
}

#[rstest]
fn list_of_missing_directory_fails(root: TempDir) {
    let missing = root.path().join("absent");
    let outcome = run(
        &loader_for(&root),
        &["list", "--plugins-dir", missing.to_str().expect("utf8 path")],
    );
    assert_eq!(outcome.exit, ExitCode::FAILURE);
    assert!(outcome.stderr.starts_with("io: "), "stderr: {}", outcome.stderr);
}

// ---------------------------------------------------------------------------
// load and call
// ---------------------------------------------------------------------------

#[rstest]
fn load_prints_summary(root: TempDir) {
    let dir = write_plugin(root.path(), "answer", quotas(), "return { value = 42 }");
    let outcome = run(&loader_for(&root), &["load", dir.as_str()]);
    assert_eq!(outcome.exit, ExitCode::SUCCESS, "stderr: {}", outcome.stderr);
    assert_eq!(
        outcome.lines(),
        vec![json!({
            "name": "answer",
            "version": "0.3.0",
            "exports": [{ "name": "value", "function": false }],
        })]
    );
}

#[rstest]
#[case::no_quotas(None, "return {}", "quota: ")]
#[case::runaway(quotas(), "while true do end", "timeout: ")]
#[case::host_access(quotas(), "os.execute('true')", "capability_violation: ")]
fn load_failures_report_kind_on_stderr(
    root: TempDir,
    #[case] limits: Option<Value>,
    #[case] source: &str,
    #[case] prefix: &str,
) {
    let dir = write_plugin(root.path(), "failing", limits, source);
    let outcome = run(&loader_for(&root), &["load", dir.as_str()]);
    assert_eq!(outcome.exit, ExitCode::FAILURE);
    assert!(outcome.stdout.is_empty());
    assert!(outcome.stderr.starts_with(prefix), "stderr: {}", outcome.stderr);
}

#[rstest]
fn call_prints_the_result(root: TempDir) {
    let dir = write_plugin(
        root.path(),
        "math",
        quotas(),
        "return { add = function(a, b) return { sum = a + b } end }",
    );
    let outcome = run(&loader_for(&root), &["call", dir.as_str(), "add", "2", "-5"]);
    assert_eq!(outcome.exit, ExitCode::SUCCESS, "stderr: {}", outcome.stderr);
    assert_eq!(outcome.lines(), vec![json!({ "sum": -3 })]);
}

#[rstest]
fn call_rejects_malformed_json_arguments(root: TempDir) {
    let dir = write_plugin(root.path(), "math", quotas(), "return {}");
    let outcome = run(&loader_for(&root), &["call", dir.as_str(), "add", "{oops"]);
    assert_eq!(outcome.exit, ExitCode::FAILURE);
    assert!(
        outcome.stderr.contains("argument 1 is not valid JSON"),
        "stderr: {}",
        outcome.stderr
    );
}

// ---------------------------------------------------------------------------
// Argument handling
// ---------------------------------------------------------------------------

#[rstest]
fn config_flags_before_the_command_reach_the_loader(root: TempDir) {
    let loader = loader_for(&root);
    let outcome = run(&loader, &["--log-filter", "warn", "list"]);
    assert_eq!(outcome.exit, ExitCode::SUCCESS, "stderr: {}", outcome.stderr);
    assert_eq!(
        *loader.seen.borrow(),
        vec![
            OsString::from("enclave"),
            OsString::from("--log-filter"),
            OsString::from("warn"),
        ]
    );
}

#[test]
fn missing_command_is_a_usage_error() {
    let outcome = run(&StaticConfigLoader::new(Config::default()), &[]);
    assert_eq!(outcome.exit, ExitCode::FAILURE);
    assert!(outcome.stderr.contains("Usage: enclave"), "stderr: {}", outcome.stderr);
}

#[test]
fn help_goes_to_stdout() {
    let outcome = run(&StaticConfigLoader::new(Config::default()), &["--help"]);
    assert_eq!(outcome.exit, ExitCode::SUCCESS);
    assert!(outcome.stdout.contains("call"));
    assert!(outcome.stderr.is_empty());
}
