// Command-line driver tests.
//
// These run the `dsplc` binary against files from `testdata/` and lock the
// exit-code contract: 0 on success, 1 when compilation or evaluation fails,
// 2 when the input can't be loaded or an argument can't be parsed.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn dsplc_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_dsplc"))
}

fn testdata(rel: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("testdata").join(rel)
}

fn dsplc(args: &[&str], file: &Path) -> Output {
    Command::new(dsplc_binary())
        .args(args)
        .arg(file)
        .output()
        .expect("failed to run dsplc")
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).into_owned()
}

#[test]
fn run_prints_the_returned_value() {
    let out = dsplc(&["--arg", "7"], &testdata("index/wrap_subscript.dsp"));
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out).trim(), "3");

    let out = dsplc(&["--arg", "-3"], &testdata("index/wrap_subscript.dsp"));
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out).trim(), "3");
}

#[test]
fn test_mode_runs_the_embedded_fixture() {
    let out = dsplc(&["--emit", "test"], &testdata("init/ctor_list.dsp"));
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert!(stdout(&out).trim_end().ends_with(": ok"));
}

#[test]
fn test_mode_reports_skips_for_missing_flags() {
    let out = dsplc(&["--emit", "test", "--flags", "None"], &testdata("index/loop_count.dsp"));
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert!(stdout(&out).contains("skipped (needs LoopOptimisation)"));
}

#[test]
fn compile_errors_exit_with_one() {
    let out = dsplc(&[], &testdata("errors/unresolved.dsp"));
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("Line 11(26): Can't resolve symbol y"));
}

#[test]
fn missing_input_exits_with_two() {
    let out = dsplc(&[], &testdata("does/not/exist.dsp"));
    assert_eq!(out.status.code(), Some(2));
    assert!(stderr(&out).contains("dsplc: error:"));
}

#[test]
fn unparseable_argument_exits_with_two() {
    let out = dsplc(&["--arg", "seven"], &testdata("index/wrap_subscript.dsp"));
    assert_eq!(out.status.code(), Some(2));
    assert!(stderr(&out).contains("can't parse argument 'seven'"));
}

#[test]
fn graph_output_is_json_with_provenance() {
    let out = dsplc(&["--emit", "graph"], &testdata("nodes/chain_reset.dsp"));
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let v: serde_json::Value = serde_json::from_str(&stdout(&out)).expect("valid json");
    assert_eq!(v["provenance"]["source_hash"].as_str().map(str::len), Some(64));
    assert!(v["graph"]["layouts"].is_array());
}

#[test]
fn node_entry_processes_an_impulse() {
    let out = dsplc(&["--entry", "{Gain}", "--channels", "2"], &testdata("nodes/gain_block.dsp"));
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let text = stdout(&out);
    assert!(text.starts_with("[[0.5, 0,"), "got {}", text);
    assert_eq!(text.matches("[0.5,").count(), 2);
}

#[test]
fn typed_listing_names_user_functions() {
    let out = dsplc(&["--emit", "typed"], &testdata("init/ctor_list.dsp"));
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let text = stdout(&out);
    assert!(text.lines().any(|l| l == "int main(int)"), "got {}", text);
    assert!(text.contains("struct X (1 fields)"));
}
