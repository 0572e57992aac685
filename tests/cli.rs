use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn kb_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_kb"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("alpha.md"),
        "# Alpha Document\n\nThis is the alpha document about Rust programming.\n\nIt contains information about cargo and crates.",
    )
    .unwrap();
    fs::write(
        files_dir.join("beta.md"),
        "# Beta Document\n\nThis document discusses Python and machine learning.\n\nDeep learning frameworks like PyTorch are covered.",
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
url = "sqlite://{}/data/kb.sqlite"

[embedding]
provider = "hashing"
dims = 128

[chunking]
chunk_size = 400
overlap = 40
"#,
        root.display()
    );

    let config_path = config_dir.join("kb.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_kb(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = kb_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path)
        .args(args)
        .env("KB_LOG", "warn")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run kb binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn file(tmp: &TempDir, name: &str) -> String {
    tmp.path().join("files").join(name).display().to_string()
}

#[test]
fn test_init_idempotent() {
    let (tmp, config) = setup_test_env();
    let (stdout, stderr, ok) = run_kb(&config, &["init", "acme"]);
    assert!(ok, "init failed: {}", stderr);
    assert!(stdout.contains("kb_acme"));
    assert!(tmp.path().join("data").join("kb.sqlite").exists());

    let (_, stderr, ok) = run_kb(&config, &["init", "acme"]);
    assert!(ok, "second init failed: {}", stderr);
}

#[test]
fn test_add_query_stats_delete() {
    let (tmp, config) = setup_test_env();

    let alpha = file(&tmp, "alpha.md");
    let (stdout, stderr, ok) = run_kb(
        &config,
        &["add", "acme", &alpha, "--source", "alpha.md", "--category", "docs"],
    );
    assert!(ok, "add failed: {}", stderr);
    assert!(stdout.contains("alpha.md"));

    let beta = file(&tmp, "beta.md");
    let (_, stderr, ok) = run_kb(&config, &["add", "acme", &beta, "--source", "beta.md"]);
    assert!(ok, "add failed: {}", stderr);

    let (stdout, stderr, ok) = run_kb(&config, &["query", "acme", "cargo crates", "--alpha", "0"]);
    assert!(ok, "query failed: {}", stderr);
    let first = stdout.lines().next().unwrap_or_default();
    assert!(first.contains("alpha.md"), "unexpected ranking:\n{}", stdout);

    let (stdout, _, ok) = run_kb(
        &config,
        &["query", "acme", "learning", "--category", "docs", "--json"],
    );
    assert!(ok);
    let hits: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert!(hits
        .as_array()
        .unwrap()
        .iter()
        .all(|h| h["metadata"]["category"] == "docs"));

    let (stdout, _, ok) = run_kb(&config, &["stats", "acme"]);
    assert!(ok);
    assert!(stdout.contains("kb_acme"));
    assert!(stdout.contains("embedding_dimension: 128"));

    let (stdout, _, ok) = run_kb(&config, &["delete", "acme", "--source", "beta.md"]);
    assert!(ok);
    assert!(stdout.contains("Deleted"));

    let (stdout, _, ok) = run_kb(&config, &["delete", "acme", "--source", "beta.md"]);
    assert!(ok);
    assert!(stdout.contains("Nothing to delete"));
}

#[test]
fn test_get_document() {
    let (tmp, config) = setup_test_env();
    let alpha = file(&tmp, "alpha.md");
    run_kb(&config, &["add", "acme", &alpha, "--source", "alpha.md"]);

    let (stdout, _, ok) = run_kb(&config, &["get", "acme", "alpha.md_0"]);
    assert!(ok);
    assert!(stdout.contains("# Alpha Document"));

    let (_, stderr, ok) = run_kb(&config, &["get", "acme", "missing_0"]);
    assert!(!ok);
    assert!(stderr.contains("No document"));
}

#[test]
fn test_invalid_tenant_fails() {
    let (_tmp, config) = setup_test_env();
    let (_, stderr, ok) = run_kb(&config, &["init", "not-valid"]);
    assert!(!ok);
    assert!(stderr.contains("invalid tenant key"));
}

#[test]
fn test_missing_config_fails() {
    let (stdout, stderr, ok) = run_kb(Path::new("/nonexistent/kb.toml"), &["stats", "acme"]);
    assert!(!ok);
    assert!(stdout.is_empty());
    assert!(stderr.contains("Failed to read config file"));
}
