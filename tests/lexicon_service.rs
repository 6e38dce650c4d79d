//! Service end to end over the built-in lexicon loader on a worker thread.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use offline_translate::{
    ErrorKind, ProgressEvent, ProgressKind, ServiceConfig, ThreadSpawner, TranslationService,
};
use offline_translate_worker::{LexiconLoader, WorkerOptions};

struct ModelDir(PathBuf);

impl ModelDir {
    fn new(name: &str) -> Self {
        let dir = std::env::temp_dir().join(format!("ot-{name}-{}", std::process::id()));
        let model = dir.join("opus-mt-en-fr");
        std::fs::create_dir_all(&model).unwrap();
        std::fs::write(
            model.join("lexicon.tsv"),
            "hello\tbonjour\nworld\tmonde\ngood morning\tbonjour\n",
        )
        .unwrap();
        Self(dir)
    }
}

impl Drop for ModelDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

async fn start(dir: &ModelDir) -> TranslationService {
    let spawner = ThreadSpawner::new(
        Arc::new(LexiconLoader::new(&dir.0)),
        WorkerOptions {
            max_concurrency: 2,
            ..WorkerOptions::default()
        },
    );
    let service = TranslationService::new(Arc::new(spawner));
    let config = ServiceConfig {
        health_check_interval_ms: 0,
        model_dir: dir.0.to_string_lossy().into_owned(),
        ..ServiceConfig::default()
    };
    service.initialize(config).await.unwrap();
    service
}

#[tokio::test]
async fn translates_with_installed_lexicon() {
    let dir = ModelDir::new("installed");
    let service = start(&dir).await;
    let events: Arc<Mutex<Vec<ProgressEvent>>> = Arc::default();
    let sink = events.clone();
    service.on_progress(move |e| sink.lock().unwrap().push(e.clone()));

    let text = service
        .translate("Good morning, world!", "en-US", "FR", None)
        .await
        .unwrap();
    assert_eq!(text, "Bonjour, monde!");

    // Second request hits the cached model.
    let text = service.translate("hello", "en", "fr", None).await.unwrap();
    assert_eq!(text, "bonjour");

    let events = events.lock().unwrap();
    let mut loading: Vec<&str> = events
        .iter()
        .filter(|e| e.kind == ProgressKind::ModelLoading)
        .map(|e| e.request_id.as_str())
        .collect();
    loading.dedup();
    assert_eq!(loading.len(), 1);
    drop(events);

    service.destroy().await;
}

#[tokio::test]
async fn missing_lexicon_is_reported_not_retried() {
    let dir = ModelDir::new("missing");
    let service = start(&dir).await;

    let err = service
        .translate("bonjour", "fr", "en", None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ModelLoadFailed);

    let err = service.translate("hello", "en", "de", None).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::UnsupportedLanguagePair);

    let status = service.status();
    assert_eq!((status.queue_length, status.active_requests), (0, 0));
    service.destroy().await;
}
