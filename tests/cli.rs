use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn planex(config_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("planex").unwrap();
    cmd.arg("--config")
        .arg(config_dir.path().join("config.toml"))
        .env_remove("OPENROUTER_API_KEY")
        .env_remove("OPENAI_API_KEY")
        .env("NO_COLOR", "1");
    cmd
}

#[test]
fn preview_prints_planning_prompt_with_catalog() {
    let dir = TempDir::new().unwrap();
    planex(&dir)
        .args(["preview", "list my markdown files", "--workdir"])
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("=== system ==="))
        .stdout(predicate::str::contains("- read_file(path: string)"))
        .stdout(predicate::str::contains("list my markdown files"))
        .stdout(predicate::str::contains("execute_command").not());
}

#[test]
fn preview_lists_commands_when_allowed() {
    let dir = TempDir::new().unwrap();
    planex(&dir)
        .args(["preview", "build it", "--allow-commands", "--workdir"])
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("execute_command"));
}

#[test]
fn replay_reports_phases_and_plan() {
    let dir = TempDir::new().unwrap();
    let transcript = dir.path().join("transcript.txt");
    fs::write(
        &transcript,
        r#"<question>save a greeting</question>
<plan>[{"tool": "search", "input": {"q": "hi"}}, {"tool": "create", "input": "{{step1.output.text}}"}]</plan>
<final_answer>done</final_answer>"#,
    )
    .unwrap();

    planex(&dir)
        .arg("replay")
        .arg(&transcript)
        .args(["--chunk-size", "3"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[question] save a greeting"))
        .stdout(predicate::str::contains("2 steps: search, create"))
        .stdout(predicate::str::contains("[final_answer] done"));
}

#[test]
fn replay_emits_json_lines() {
    let dir = TempDir::new().unwrap();
    let transcript = dir.path().join("transcript.txt");
    fs::write(&transcript, "<thought>hmm</thought><final_answer>ok</final_answer>").unwrap();

    planex(&dir)
        .arg("replay")
        .arg(&transcript)
        .args(["--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#"{"type":"phase","phase":"thought","content":"hmm"}"#))
        .stdout(predicate::str::contains(r#"{"type":"final_answer_complete","text":"ok"}"#));
}

#[test]
fn init_writes_config_once() {
    let dir = TempDir::new().unwrap();
    planex(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote configuration"));
    let written = fs::read_to_string(dir.path().join("config.toml")).unwrap();
    assert!(written.contains("active_provider = \"openrouter\""));
    assert!(written.contains("[orchestration]"));

    planex(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("already exists"));
}

#[test]
fn set_updates_config_file() {
    let dir = TempDir::new().unwrap();
    planex(&dir)
        .args(["set", "orchestration.tool_call_timeout_secs", "7"])
        .assert()
        .success();
    let written = fs::read_to_string(dir.path().join("config.toml")).unwrap();
    assert!(written.contains("tool_call_timeout_secs = 7"));

    planex(&dir)
        .args(["set", "orchestration.poll_interval_ms", "often"])
        .assert()
        .failure();
}

#[test]
fn status_reports_missing_key() {
    let dir = TempDir::new().unwrap();
    planex(&dir)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("openrouter: missing key (OPENROUTER_API_KEY)"));
}

#[test]
fn run_without_api_key_fails() {
    let dir = TempDir::new().unwrap();
    planex(&dir)
        .args(["run", "say hello", "--on-failure", "halt"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("OPENROUTER_API_KEY"));
}
