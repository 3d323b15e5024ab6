// Fixture corpus: every `.dsp` file under `testdata/` carries its own
// expectations in a BEGIN_TEST_DATA block and runs through the fixture
// runner with all optimisations enabled.

use std::path::{Path, PathBuf};

use dsplc::backend::CompileFlags;
use dsplc::fixture::{Outcome, Runner};

fn testdata() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("testdata")
}

fn collect(dir: &Path, out: &mut Vec<PathBuf>) {
    let entries = std::fs::read_dir(dir)
        .unwrap_or_else(|e| panic!("failed to read {}: {}", dir.display(), e));
    for entry in entries {
        let path = entry.expect("dir entry").path();
        if path.is_dir() {
            collect(&path, out);
        } else if path.extension().is_some_and(|e| e == "dsp") {
            out.push(path);
        }
    }
}

fn corpus() -> Vec<PathBuf> {
    let mut files = Vec::new();
    collect(&testdata(), &mut files);
    files.sort();
    files
}

#[test]
fn corpus_is_not_empty() {
    assert!(corpus().len() >= 10, "testdata corpus went missing");
}

#[test]
fn every_fixture_passes() {
    let runner = Runner::default();
    let mut failures = Vec::new();
    for path in corpus() {
        match runner.run_file(&path) {
            Ok(Outcome::Passed) => {}
            Ok(Outcome::Skipped(why)) => failures.push(format!("{}: skipped ({})", path.display(), why)),
            Err(e) => failures.push(format!("{}: {}", path.display(), e)),
        }
    }
    assert!(failures.is_empty(), "fixture failures:\n{}", failures.join("\n"));
}

#[test]
fn loop_fixtures_are_skipped_without_loop_optimisation() {
    let runner = Runner {
        active: CompileFlags::default(),
    };
    let path = testdata().join("index/loop_count.dsp");
    assert!(matches!(runner.run_file(&path), Ok(Outcome::Skipped(_))));
}

#[test]
fn fixture_filenames_match_their_location() {
    for path in corpus() {
        let source = std::fs::read_to_string(&path).expect("read fixture");
        let fixture = dsplc::fixture::Fixture::parse(&source)
            .unwrap_or_else(|e| panic!("{}: {}", path.display(), e));
        let Some(name) = fixture.filename else {
            continue;
        };
        let relative = path
            .strip_prefix(testdata())
            .expect("inside testdata")
            .with_extension("");
        assert_eq!(Path::new(&name), relative, "{}", path.display());
    }
}
