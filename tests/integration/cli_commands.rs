#![allow(missing_docs)]

use std::path::Path;

use assert_cmd::Command;
use serde_json::Value as JsonValue;
use tempfile::TempDir;

struct Env {
    dir: TempDir,
}

impl Env {
    fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        std::fs::write(dir.path().join("engramdb.toml"), "sync_mode = \"immediate\"\n")
            .expect("config file");
        Self { dir }
    }

    fn data_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("data")
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("engramdb").expect("engramdb binary");
        cmd.env("RUST_LOG", "warn")
            .arg("--config")
            .arg(self.dir.path().join("engramdb.toml"))
            .arg("--data-dir")
            .arg(self.data_dir());
        cmd
    }

    fn json(&self, args: &[&str]) -> JsonValue {
        let output = self
            .cmd()
            .arg("--format")
            .arg("json")
            .args(args)
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        serde_json::from_slice(&output).expect("json output")
    }
}

fn as_path(value: &JsonValue) -> &Path {
    Path::new(value.as_str().expect("path string"))
}

#[test]
fn config_reports_file_and_flag_overrides() {
    let env = Env::new();
    let config = env.json(&["config"]);
    assert_eq!(config["sync_mode"], "immediate");
    assert_eq!(as_path(&config["data_dir"]), env.data_dir());

    let toml = env.cmd().arg("config").assert().success().get_output().stdout.clone();
    let toml = String::from_utf8(toml).expect("utf8");
    assert!(toml.contains("sync_mode = \"immediate\""), "{toml}");

    let overridden = env.json(&["--sync-mode", "none", "config"]);
    assert_eq!(overridden["sync_mode"], "none");
}

#[test]
fn query_writes_survive_between_invocations() {
    let env = Env::new();
    let created = env.json(&[
        "query",
        "CREATE (m:Memory {content: $content, weight: $weight}) RETURN m.weight AS w",
        "--param",
        "content=espresso notes",
        "--param",
        "weight=3",
    ]);
    assert_eq!(created["rows"], serde_json::json!([[3]]));
    assert_eq!(created["stats"]["nodes_created"], 1);

    let read = env.json(&["query", "MATCH (m:Memory) RETURN m.content AS content"]);
    assert_eq!(read["columns"], serde_json::json!(["content"]));
    assert_eq!(read["rows"], serde_json::json!([["espresso notes"]]));

    let stats = env.json(&["stats"]);
    assert_eq!(stats["graph"]["nodes"], 1);
    assert_eq!(stats["index"]["documents"], 1);
}

#[test]
fn text_query_output_lists_rows() {
    let env = Env::new();
    let output = env
        .cmd()
        .args(["query", "UNWIND [1, 2] AS x RETURN x"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    assert!(text.contains("(2 rows)"), "{text}");
}

#[test]
fn failing_query_exits_non_zero_with_status_code() {
    let env = Env::new();
    let output = env
        .cmd()
        .args(["query", "MATCH (n RETURN n"])
        .assert()
        .code(1)
        .get_output()
        .stderr
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    assert!(text.contains("Neo.ClientError.Statement.SyntaxError"), "{text}");
}

#[test]
fn checkpoint_and_verify_on_a_populated_store() {
    let env = Env::new();
    env.cmd()
        .args(["query", "CREATE (:A {name: 'a'})-[:LINKS]->(:B {name: 'b'})"])
        .assert()
        .success();

    let checkpoint = env.json(&["checkpoint"]);
    assert!(checkpoint["checkpoint_lsn"].as_u64().is_some());

    let report = env.json(&["verify"]);
    assert_eq!(report["success"], true);
    assert_eq!(report["counts"]["nodes_found"], 2);
    assert_eq!(report["counts"]["edges_found"], 1);

    let output = env.cmd().arg("verify").assert().success().get_output().stdout.clone();
    let text = String::from_utf8(output).expect("utf8");
    assert!(text.contains("success=true"), "{text}");
}

#[test]
fn missing_explicit_config_is_an_error() {
    let env = Env::new();
    Command::cargo_bin("engramdb")
        .expect("engramdb binary")
        .arg("--config")
        .arg(env.dir.path().join("absent.toml"))
        .arg("config")
        .assert()
        .failure();
}
