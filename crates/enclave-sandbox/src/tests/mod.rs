//! Crate-level isolate tests.

use std::fs;
use std::path::Path;
use std::time::Duration;

use rstest::{fixture, rstest};
use serde_json::json;
use tempfile::TempDir;

use crate::{
    ConsoleLevel, ExportSlot, Isolate, ModuleExports, ResourceBudget, SandboxError,
    SandboxProfile,
};


const ONE_MEGABYTE: usize = 1024 * 1024;

fn isolate_with(profile: &SandboxProfile, budget: ResourceBudget) -> Isolate {
    Isolate::new("test-plugin", profile, budget).expect("isolate")
}

#[fixture]
fn isolate() -> Isolate {
    isolate_with(
        &SandboxProfile::new(),
        ResourceBudget::new(Duration::from_secs(2), 4 * ONE_MEGABYTE),
    )
}

fn function_export<'a>(exports: &'a ModuleExports, name: &str) -> &'a crate::FunctionHandle {
    match exports.get(name) {
        Some(ExportSlot::Function(handle)) => handle,
        other => panic!("expected function export '{name}', got {other:?}"),
    }
}

fn write_module(root: &Path, relative: &str, source: &str) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create module directory");
    }
    fs::write(path, source).expect("write module");
}

// ---------------------------------------------------------------------------
// Exports
// ---------------------------------------------------------------------------

#[rstest]
fn evaluate_collects_data_and_functions(isolate: Isolate) {
    let exports = isolate
        .evaluate(
            "main.lua",
            "return { version = 3, tags = { 'a', 'b' }, greet = function(n) return 'hi ' .. n end }",
        )
        .expect("evaluate");

    assert_eq!(exports.len(), 3);
    assert!(matches!(exports.get("version"), Some(ExportSlot::Data(value)) if *value == json!(3)));
    assert!(
        matches!(exports.get("tags"), Some(ExportSlot::Data(value)) if *value == json!(["a", "b"]))
    );
    let greet = function_export(&exports, "greet");
    let reply = isolate.call(greet, &[json!("there")]).expect("call");
    assert_eq!(reply, json!("hi there"));
}

#[rstest]
fn evaluate_accepts_nil_as_empty_exports(isolate: Isolate) {
    let exports = isolate.evaluate("main.lua", "local x = 1").expect("evaluate");
    assert!(exports.is_empty());
}

#[rstest]
#[case::number("return 42")]
#[case::string("return 'exports'")]
#[case::numeric_key("return { [1] = 'first' }")]
fn evaluate_rejects_malformed_exports(isolate: Isolate, #[case] source: &str) {
    let error = isolate.evaluate("main.lua", source).expect_err("malformed exports");
    assert!(
        matches!(error, SandboxError::InvalidExports { .. }),
        "expected InvalidExports, got {error:?}"
    );
}

#[rstest]
fn script_errors_carry_the_message(isolate: Isolate) {
    let error = isolate
        .evaluate("main.lua", "error('boom')")
        .expect_err("script error");
    match error {
        SandboxError::Script { message } => assert!(message.contains("boom"), "{message}"),
        other => panic!("expected Script, got {other:?}"),
    }
}

#[rstest]
fn call_keeps_only_the_first_return_value(isolate: Isolate) {
    let exports = isolate
        .evaluate("main.lua", "return { pair = function() return 1, 2 end }")
        .expect("evaluate");
    let reply = isolate
        .call(function_export(&exports, "pair"), &[])
        .expect("call");
    assert_eq!(reply, json!(1));
}

#[rstest]
fn call_converts_table_arguments(isolate: Isolate) {
    let exports = isolate
        .evaluate(
            "main.lua",
            "return { total = function(order) return order.qty * order.price end }",
        )
        .expect("evaluate");
    let reply = isolate
        .call(
            function_export(&exports, "total"),
            &[json!({ "qty": 3, "price": 4 })],
        )
        .expect("call");
    assert_eq!(reply, json!(12));
}

#[test]
fn evaluate_file_reports_missing_entry_point() {
    let dir = TempDir::new().expect("temp dir");
    let isolate = isolate_with(
        &SandboxProfile::new(),
        ResourceBudget::from_quota(1_000, 1_024),
    );
    let error = isolate
        .evaluate_file(&dir.path().join("missing.lua"))
        .expect_err("missing file");
    assert!(matches!(error, SandboxError::EntryPoint { .. }));
}

// ---------------------------------------------------------------------------
// Quotas
// ---------------------------------------------------------------------------

#[test]
fn infinite_loop_hits_the_deadline() {
    let isolate = isolate_with(
        &SandboxProfile::new(),
        ResourceBudget::from_quota(50, 1_024),
    );
    let error = isolate
        .evaluate("main.lua", "while true do end")
        .expect_err("deadline");
    assert!(
        matches!(error, SandboxError::DeadlineExceeded { limit_ms: 50 }),
        "expected DeadlineExceeded, got {error:?}"
    );
}

#[rstest]
#[case::wrapped("coroutine.wrap(function() while true do end end)()")]
#[case::resumed("coroutine.resume(coroutine.create(function() while true do end end))")]
#[case::nested("coroutine.wrap(function() coroutine.wrap(function() while true do end end)() end)()")]
#[case::yielding(
    "local tick = coroutine.wrap(function() while true do coroutine.yield() end end) \
     while true do tick() end"
)]
#[case::caught_inside(
    "coroutine.wrap(function() while true do pcall(function() while true do end end) end end)()"
)]
#[case::status_ignored(
    "while true do coroutine.resume(coroutine.create(function() while true do end end)) end"
)]
fn runaway_coroutine_hits_the_deadline(#[case] source: &str) {
    let isolate = isolate_with(
        &SandboxProfile::new(),
        ResourceBudget::from_quota(50, 1_024),
    );
    let error = isolate.evaluate("main.lua", source).expect_err("deadline");
    assert!(
        matches!(error, SandboxError::DeadlineExceeded { limit_ms: 50 }),
        "expected DeadlineExceeded, got {error:?}"
    );
}

#[test]
fn backtracking_pattern_hits_the_deadline() {
    let isolate = isolate_with(
        &SandboxProfile::new(),
        ResourceBudget::from_quota(50, 1_024),
    );
    let error = isolate
        .evaluate("main.lua", "return string.rep('a', 3000):find('.-.-.-.-b')")
        .expect_err("deadline");
    assert!(
        matches!(error, SandboxError::DeadlineExceeded { limit_ms: 50 }),
        "expected DeadlineExceeded, got {error:?}"
    );
}

#[rstest]
#[case::module_body("require('spin')")]
#[case::module_function("require('spinner').spin()")]
#[case::module_function_in_coroutine("coroutine.wrap(require('spinner').spin)()")]
fn runaway_local_module_hits_the_deadline(#[case] source: &str) {
    let dir = TempDir::new().expect("temp dir");
    write_module(dir.path(), "spin.lua", "while true do end return {}");
    write_module(
        dir.path(),
        "spinner.lua",
        "return { spin = function() while true do end end }",
    );
    let profile = SandboxProfile::new().with_module_root(dir.path());
    let isolate = isolate_with(&profile, ResourceBudget::from_quota(50, 1_024));

    let error = isolate.evaluate("main.lua", source).expect_err("deadline");
    assert!(
        matches!(error, SandboxError::DeadlineExceeded { limit_ms: 50 }),
        "expected DeadlineExceeded, got {error:?}"
    );
}

#[test]
fn export_running_a_coroutine_hits_the_deadline() {
    let isolate = isolate_with(
        &SandboxProfile::new(),
        ResourceBudget::from_quota(50, 1_024),
    );
    let exports = isolate
        .evaluate(
            "main.lua",
            "return { \
               spin = function() return coroutine.wrap(function() while true do end end)() end, \
               ping = function() return coroutine.wrap(function() return 'pong' end)() end \
             }",
        )
        .expect("evaluate");

    let error = isolate
        .call(function_export(&exports, "spin"), &[])
        .expect_err("deadline");
    assert!(matches!(error, SandboxError::DeadlineExceeded { .. }), "got {error:?}");

    let reply = isolate
        .call(function_export(&exports, "ping"), &[])
        .expect("isolate still usable");
    assert_eq!(reply, json!("pong"));
}

#[rstest]
fn coroutines_still_yield_and_resume(isolate: Isolate) {
    let exports = isolate
        .evaluate(
            "main.lua",
            "local gen = coroutine.wrap(function(a) local b = coroutine.yield(a + 1) return a + b end) \
             local first = gen(1) \
             local co = coroutine.create(function() error('inner') end) \
             local ok, message = coroutine.resume(co) \
             return { first = first, second = gen(10), ok = ok, dead = coroutine.status(co), \
                      message = message:match('inner') }",
        )
        .expect("evaluate");
    let data = |name: &str| match exports.get(name) {
        Some(ExportSlot::Data(value)) => value.clone(),
        other => panic!("expected data export '{name}', got {other:?}"),
    };
    assert_eq!(data("first"), json!(2));
    assert_eq!(data("second"), json!(11));
    assert_eq!(data("ok"), json!(false));
    assert_eq!(data("dead"), json!("dead"));
    assert_eq!(data("message"), json!("inner"));
}

#[rstest]
fn wrapped_coroutine_errors_propagate(isolate: Isolate) {
    let error = isolate
        .evaluate("main.lua", "coroutine.wrap(function() error('from inside') end)()")
        .expect_err("error");
    match error {
        SandboxError::Script { message } => assert!(message.contains("from inside"), "{message}"),
        other => panic!("expected Script, got {other:?}"),
    }
}

#[test]
fn pcall_cannot_swallow_the_deadline() {
    let isolate = isolate_with(
        &SandboxProfile::new(),
        ResourceBudget::from_quota(50, 1_024),
    );
    let error = isolate
        .evaluate(
            "main.lua",
            "while true do pcall(function() while true do end end) end",
        )
        .expect_err("deadline");
    assert!(matches!(error, SandboxError::DeadlineExceeded { .. }));
}

#[test]
fn deadline_is_rearmed_for_each_call() {
    let isolate = isolate_with(
        &SandboxProfile::new(),
        ResourceBudget::from_quota(50, 1_024),
    );
    let exports = isolate
        .evaluate(
            "main.lua",
            "return { spin = function() while true do end end, ping = function() return 'pong' end }",
        )
        .expect("evaluate");

    let error = isolate
        .call(function_export(&exports, "spin"), &[])
        .expect_err("deadline");
    assert!(matches!(error, SandboxError::DeadlineExceeded { .. }));

    let reply = isolate
        .call(function_export(&exports, "ping"), &[])
        .expect("isolate still usable");
    assert_eq!(reply, json!("pong"));
}

#[test]
fn allocation_past_the_ceiling_is_memory_exhaustion() {
    let isolate = isolate_with(
        &SandboxProfile::new(),
        ResourceBudget::new(Duration::from_secs(5), 256 * 1024),
    );
    let error = isolate
        .evaluate(
            "main.lua",
            "local t = {} for i = 1, 10000000 do t[i] = string.rep('x', 64) .. i end",
        )
        .expect_err("memory ceiling");
    assert!(
        matches!(error, SandboxError::MemoryExhausted { limit_bytes: 262_144 }),
        "expected MemoryExhausted, got {error:?}"
    );
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

#[rstest]
#[case::io_open("return io.open('/etc/passwd')", "io.open")]
#[case::os_execute("os.execute('true')", "os.execute")]
#[case::debug("return debug.getinfo(1)", "debug.getinfo")]
#[case::package_path("return package.path", "package.path")]
#[case::load("return load('return 1')", "load")]
#[case::dofile("dofile('/etc/hosts')", "dofile")]
#[case::require_unknown("return require('socket')", "require:socket")]
fn forbidden_access_is_a_capability_violation(
    isolate: Isolate,
    #[case] source: &str,
    #[case] capability: &str,
) {
    let error = isolate.evaluate("main.lua", source).expect_err("violation");
    match error {
        SandboxError::CapabilityDenied { capability: denied } => assert_eq!(denied, capability),
        other => panic!("expected CapabilityDenied, got {other:?}"),
    }
}

#[rstest]
fn pcall_cannot_swallow_a_violation(isolate: Isolate) {
    let error = isolate
        .evaluate("main.lua", "pcall(function() return io.open('/etc/passwd') end) return {}")
        .expect_err("violation");
    assert!(matches!(error, SandboxError::CapabilityDenied { .. }));
}

#[rstest]
fn violation_does_not_leak_into_the_next_execution(isolate: Isolate) {
    let exports = isolate
        .evaluate(
            "main.lua",
            "return { bad = function() return os.time() end, good = function() return true end }",
        )
        .expect("evaluate");
    isolate
        .call(function_export(&exports, "bad"), &[])
        .expect_err("violation");
    let reply = isolate
        .call(function_export(&exports, "good"), &[])
        .expect("clean call");
    assert_eq!(reply, json!(true));
}

#[test]
fn denied_std_library_is_absent() {
    let profile = SandboxProfile::new().deny_std_library(crate::StdLibrary::Coroutine);
    let isolate = isolate_with(&profile, ResourceBudget::from_quota(1_000, 1_024));
    let exports = isolate
        .evaluate("main.lua", "return { present = coroutine ~= nil }")
        .expect("evaluate");
    assert!(matches!(exports.get("present"), Some(ExportSlot::Data(value)) if *value == json!(false)));
}

// ---------------------------------------------------------------------------
// Modules
// ---------------------------------------------------------------------------

#[rstest]
fn host_modules_are_usable(isolate: Isolate) {
    let exports = isolate
        .evaluate(
            "main.lua",
            r#"
            local json = require("json")
            local crypto = require("crypto")
            local path = require("path")
            return {
                encoded = json.encode({ ok = true }),
                digest = crypto.sha256("abc"),
                joined = path.join("lib", "util.lua"),
            }
            "#,
        )
        .expect("evaluate");
    assert!(
        matches!(exports.get("encoded"), Some(ExportSlot::Data(value)) if *value == json!("{\"ok\":true}"))
    );
    assert!(matches!(
        exports.get("digest"),
        Some(ExportSlot::Data(value))
            if *value == json!("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
    ));
    assert!(
        matches!(exports.get("joined"), Some(ExportSlot::Data(value)) if *value == json!("lib/util.lua"))
    );
}

#[test]
fn local_modules_resolve_beneath_the_root() {
    let dir = TempDir::new().expect("temp dir");
    write_module(dir.path(), "lib/strings.lua", "return { shout = function(s) return s:upper() end }");
    let profile = SandboxProfile::new().with_module_root(dir.path());
    let isolate = isolate_with(&profile, ResourceBudget::from_quota(1_000, 1_024));

    let exports = isolate
        .evaluate(
            "main.lua",
            "local strings = require('lib.strings') return { loud = strings.shout('hey') }",
        )
        .expect("evaluate");
    assert!(matches!(exports.get("loud"), Some(ExportSlot::Data(value)) if *value == json!("HEY")));
}

#[test]
fn local_modules_are_evaluated_once() {
    let dir = TempDir::new().expect("temp dir");
    write_module(dir.path(), "counter.lua", "print('loaded') return { n = 1 }");
    let profile = SandboxProfile::new().with_module_root(dir.path());
    let isolate = isolate_with(&profile, ResourceBudget::from_quota(1_000, 1_024));

    isolate
        .evaluate("main.lua", "require('counter') require('counter')")
        .expect("evaluate");
    assert_eq!(isolate.console_lines().len(), 1);
}

#[rstest]
#[case::parent_segment("require('..secret')")]
#[case::missing("require('absent')")]
fn local_module_escapes_are_denied(#[case] source: &str) {
    let dir = TempDir::new().expect("temp dir");
    let root = dir.path().join("plugin");
    fs::create_dir_all(&root).expect("plugin dir");
    write_module(dir.path(), "secret.lua", "return {}");
    let profile = SandboxProfile::new().with_module_root(&root);
    let isolate = isolate_with(&profile, ResourceBudget::from_quota(1_000, 1_024));

    let error = isolate.evaluate("main.lua", source).expect_err("denied");
    assert!(
        matches!(error, SandboxError::CapabilityDenied { .. }),
        "expected CapabilityDenied, got {error:?}"
    );
}

#[cfg(unix)]
#[test]
fn symlinked_module_outside_root_is_denied() {
    let dir = TempDir::new().expect("temp dir");
    let root = dir.path().join("plugin");
    fs::create_dir_all(&root).expect("plugin dir");
    write_module(dir.path(), "secret.lua", "return {}");
    std::os::unix::fs::symlink(dir.path().join("secret.lua"), root.join("link.lua"))
        .expect("symlink");
    let profile = SandboxProfile::new().with_module_root(&root);
    let isolate = isolate_with(&profile, ResourceBudget::from_quota(1_000, 1_024));

    let error = isolate
        .evaluate("main.lua", "require('link')")
        .expect_err("denied");
    assert!(matches!(error, SandboxError::CapabilityDenied { .. }));
}

// ---------------------------------------------------------------------------
// Console
// ---------------------------------------------------------------------------

#[rstest]
fn console_output_is_captured_and_drained(isolate: Isolate) {
    isolate
        .evaluate("main.lua", "print('hello') console.error('bad thing')")
        .expect("evaluate");

    let lines = isolate.drain_console();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines.first().map(|line| line.text()), Some("hello"));
    assert_eq!(
        lines.get(1).map(|line| line.level()),
        Some(ConsoleLevel::Error)
    );
    assert!(isolate.console_lines().is_empty());
}

#[test]
fn console_capacity_drops_oldest_lines() {
    let profile = SandboxProfile::new().with_console_capacity(2);
    let isolate = isolate_with(&profile, ResourceBudget::from_quota(1_000, 1_024));
    isolate
        .evaluate("main.lua", "for i = 1, 5 do print(i) end")
        .expect("evaluate");
    let texts: Vec<String> = isolate
        .console_lines()
        .iter()
        .map(|line| line.text().to_owned())
        .collect();
    assert_eq!(texts, vec![String::from("4"), String::from("5")]);
}
