//! The service and the CLI against real `--worker` child processes of the
//! built binary. With the `mock` feature the child serves the mock loader;
//! otherwise it reads the lexicon written here.

use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use offline_translate::{ProcessSpawner, ServiceConfig, TranslationService};

const BIN: &str = env!("CARGO_BIN_EXE_offline_translate");

fn expected(mock: &str, lexicon: &str) -> String {
    if cfg!(feature = "mock") {
        mock.to_string()
    } else {
        lexicon.to_string()
    }
}

struct ModelDir(PathBuf);

impl ModelDir {
    fn new(name: &str) -> Self {
        let dir = std::env::temp_dir().join(format!("ot-proc-{name}-{}", std::process::id()));
        let model = dir.join("opus-mt-en-fr");
        std::fs::create_dir_all(&model).unwrap();
        std::fs::write(model.join("lexicon.tsv"), "hello\tbonjour\nworld\tmonde\n").unwrap();
        Self(dir)
    }
}

impl Drop for ModelDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

#[tokio::test]
async fn child_process_worker_translates_and_survives_restart() {
    let dir = ModelDir::new("service");
    let spawner = ProcessSpawner::new(&dir.0).with_program(BIN);
    let service = TranslationService::new(Arc::new(spawner));
    let config = ServiceConfig {
        health_check_interval_ms: 0,
        model_dir: dir.0.to_string_lossy().into_owned(),
        ..ServiceConfig::default()
    };
    service.initialize(config).await.unwrap();
    assert!(service.check_health().await);

    let text = service.translate("Hello world", "en", "fr", None).await.unwrap();
    assert_eq!(text, expected("[fr] Hello world", "Bonjour monde"));

    // A replacement child process picks up where the first left off.
    service.restart_worker(true).await.unwrap();
    assert!(service.check_health().await);
    let text = service.translate("hello", "en", "fr", None).await.unwrap();
    assert_eq!(text, expected("[fr] hello", "bonjour"));

    service.destroy().await;
}

#[test]
fn cli_translates_positional_text() {
    let dir = ModelDir::new("cli");
    let output = Command::new(BIN)
        .arg("--to")
        .arg("fr")
        .arg("--model-dir")
        .arg(&dir.0)
        .arg("Hello world")
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.trim(), expected("[fr] Hello world", "Bonjour monde"));
}

#[test]
fn cli_rejects_unsupported_pair() {
    let dir = ModelDir::new("cli-bad");
    let output = Command::new(BIN)
        .arg("--to")
        .arg("en")
        .arg("--model-dir")
        .arg(&dir.0)
        .arg("Hello")
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("UNSUPPORTED_LANGUAGE_PAIR"));
}
