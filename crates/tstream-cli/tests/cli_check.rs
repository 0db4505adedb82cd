use assert_cmd::Command;
use predicates::prelude::*;

fn write_declaration(dir: &tempfile::TempDir, content: &str) -> std::path::PathBuf {
    let path = dir.path().join("declaration.json");
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn check_prints_expanded_components() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = write_declaration(
        &dir,
        r#"{
            "class": "Telemetry",
            "My_Listener": {"class": "Telemetry_Listener", "port": 40200},
            "My_Consumer": {"class": "Telemetry_Consumer", "type": "Generic_HTTP"}
        }"#,
    );

    Command::cargo_bin("tstream")
        .unwrap()
        .arg("check")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("f5telemetry_default::My_Listener"))
        .stdout(predicate::str::contains("Telemetry_Consumer"))
        .stdout(predicate::str::contains("2 components"));
}

#[test]
fn check_rejects_invalid_declaration() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = write_declaration(&dir, r#"{"class": "Telemetry", "Bad": {"class": "Nope"}}"#);

    Command::cargo_bin("tstream")
        .unwrap()
        .arg("check")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("declaration is invalid"));
}

#[test]
fn check_rejects_missing_file() {
    Command::cargo_bin("tstream")
        .unwrap()
        .arg("check")
        .arg("/nonexistent/declaration.json")
        .assert()
        .failure();
}
