//! Crate-level integration and BDD tests.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tempfile::TempDir;

use crate::{ErrorKind, Export, LuaRunner, PluginError, PluginLoader, PluginRegistry};


/// Writes `plugin.json` and `main.lua` into `root/directory`.
fn write_plugin(root: &Path, directory: &str, manifest: &Value, source: &str) -> PathBuf {
    let dir = root.join(directory);
    fs::create_dir_all(&dir).expect("plugin dir");
    fs::write(dir.join("plugin.json"), manifest.to_string()).expect("write manifest");
    fs::write(dir.join("main.lua"), source).expect("write entry point");
    dir
}

fn bounded(name: &str) -> Value {
    json!({
        "name": name,
        "version": "1.0.0",
        "entryPoint": "main.lua",
        "quotas": { "cpuMs": 500, "memKb": 4096 },
    })
}

fn loader() -> PluginLoader<LuaRunner> {
    PluginLoader::new(LuaRunner::new(), Arc::new(PluginRegistry::new()))
}

#[test]
fn runaway_plugin_times_out_and_loader_stays_usable() {
    let root = TempDir::new().expect("temp dir");
    let spin = write_plugin(root.path(), "spin", &bounded("spin"), "while true do end");
    let fine = write_plugin(root.path(), "fine", &bounded("fine"), "return { ok = true }");
    let loader = loader();

    let started = Instant::now();
    let err = loader.load_plugin(&spin).expect_err("timeout");
    let elapsed = started.elapsed();

    assert!(
        matches!(err, PluginError::Timeout { cpu_ms: 500, ref name } if name == "spin"),
        "got {err:?}"
    );
    assert!(elapsed >= Duration::from_millis(500), "stopped early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "overran: {elapsed:?}");
    assert!(loader.registry().get("spin").is_none());
    loader.load_plugin(&fine).expect("later loads still work");
}

#[test]
fn host_files_never_reach_plugin_callers() {
    let root = TempDir::new().expect("temp dir");
    let secret = root.path().join("secret.txt");
    fs::write(&secret, "hunter2").expect("write secret");
    let source = format!(
        "local target = {:?}\n\
         return {{ peek = function() return io.open(target):read('a') end }}",
        secret.display().to_string()
    );
    let dir = write_plugin(root.path(), "snoop", &bounded("snoop"), &source);
    let loader = loader();

    let plugin = loader.load_plugin(&dir).expect("definition alone is harmless");
    let err = plugin.call("peek", &[]).expect_err("read denied");

    assert_eq!(err.kind(), ErrorKind::CapabilityViolation);
    assert!(!err.to_string().contains("hunter2"));
}

#[test]
fn invalid_manifest_does_not_block_valid_plugin() {
    let root = TempDir::new().expect("temp dir");
    write_plugin(root.path(), "valid", &bounded("valid"), "return { ok = true }");
    write_plugin(
        root.path(),
        "nameless",
        &json!({ "version": "1.0.0", "entryPoint": "main.lua",
                 "quotas": { "cpuMs": 500, "memKb": 4096 } }),
        "return {}",
    );
    let loader = loader();

    let report = loader.load_all_plugins(root.path()).expect("scan");

    let names: Vec<&str> = report.loaded().iter().map(|plugin| plugin.name()).collect();
    assert_eq!(names, vec!["valid"]);
    let [failure] = report.failures() else {
        panic!("expected exactly one failure, got {:?}", report.failures());
    };
    assert_eq!(failure.error().kind(), ErrorKind::InvalidManifest);
    assert_eq!(failure.directory(), root.path().join("nameless"));
    assert_eq!(loader.registry().get_all().len(), 1);
}

#[test]
fn plugin_console_is_captured_on_the_record() {
    let root = TempDir::new().expect("temp dir");
    let dir = write_plugin(
        root.path(),
        "chatty",
        &bounded("chatty"),
        "print('loading', 1) console.warn('careful') return {}",
    );

    let plugin = loader().load_plugin(&dir).expect("load");

    let texts: Vec<&str> = plugin.console().iter().map(|line| line.text()).collect();
    assert_eq!(texts, vec!["loading\t1", "careful"]);
}

#[test]
fn plugins_do_not_share_globals() {
    let root = TempDir::new().expect("temp dir");
    write_plugin(
        root.path(),
        "a-writer",
        &bounded("writer"),
        "shared = 'leaked' return { set = shared }",
    );
    write_plugin(
        root.path(),
        "b-reader",
        &bounded("reader"),
        "return { seen = shared == nil }",
    );
    let loader = loader();

    loader.load_all_plugins(root.path()).expect("scan");

    let reader = loader.registry().get("reader").expect("reader");
    assert_eq!(
        reader.exports().get("seen").and_then(Export::as_value),
        Some(&json!(true))
    );
}

#[test]
fn exported_functions_are_callable_from_other_threads() {
    let root = TempDir::new().expect("temp dir");
    let dir = write_plugin(
        root.path(),
        "counter",
        &bounded("counter"),
        "local n = 0 return { bump = function() n = n + 1 return n end }",
    );
    let loader = loader();
    loader.load_plugin(&dir).expect("load");
    let registry = Arc::clone(loader.registry());

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let shared = Arc::clone(&registry);
            thread::spawn(move || {
                let plugin = shared.get("counter").expect("registered");
                for _ in 0..10 {
                    plugin.call("bump", &[]).expect("bump");
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker");
    }

    let plugin = registry.get("counter").expect("registered");
    assert_eq!(plugin.call("bump", &[]).expect("bump"), json!(41));
}
