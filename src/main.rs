use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use log::{error, info, LevelFilter};
use offline_translate::logging::{setup_logging, setup_worker_logging};
use offline_translate::{ProcessSpawner, ServiceConfig, TranslateOptions, TranslationService};
use offline_translate_worker::{run_stdio_worker, ModelLoader, WorkerOptions};

/// Command-line options for the `offline_translate` binary.
///
/// Flags override the matching fields of the JSON config file.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "offline_translate",
    version,
    about = "Translate text offline with an isolated compute worker"
)]
struct Cli {
    /// Text to translate. Reads one request per line from stdin when absent.
    text: Option<String>,

    /// Source language code (e.g. `en`).
    #[arg(long, default_value_t = String::from("en"))]
    from: String,

    /// Target language code (e.g. `fr`).
    #[arg(long)]
    to: Option<String>,

    /// JSON service config. Missing keys take their defaults.
    #[arg(long, env = "OFFLINE_TRANSLATE_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding the lexicon model files.
    #[arg(long, env = "OFFLINE_TRANSLATE_MODEL_DIR")]
    model_dir: Option<PathBuf>,

    /// Higher priorities are served first.
    #[arg(long, default_value_t = 0)]
    priority: i32,

    /// Per-request timeout in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Also write logs to a timestamped file in this directory.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[arg(long, default_value_t = LevelFilter::Warn)]
    log_level: LevelFilter,

    /// Run as the compute worker, speaking JSON Lines on stdin/stdout.
    #[arg(long, hide = true)]
    worker: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // The worker owns its threads and blocks on stdin, so it must not run
    // inside a tokio runtime.
    if cli.worker {
        if let Err(e) = setup_worker_logging(cli.log_level) {
            eprintln!("Failed to set up logging: {e}");
        }
        let model_dir = cli.model_dir.unwrap_or_else(|| PathBuf::from("models"));
        run_stdio_worker(worker_loader(model_dir), WorkerOptions::default());
        return Ok(());
    }

    if let Err(e) = setup_logging(cli.log_dir.as_deref(), cli.log_level) {
        eprintln!("Failed to set up logging: {e}");
    }

    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    runtime.block_on(run(cli))
}

#[cfg(not(feature = "mock"))]
fn worker_loader(model_dir: PathBuf) -> Arc<dyn ModelLoader> {
    Arc::new(offline_translate_worker::LexiconLoader::new(model_dir))
}

#[cfg(feature = "mock")]
fn worker_loader(_model_dir: PathBuf) -> Arc<dyn ModelLoader> {
    use offline_translate_worker::mock::{MockLoader, MockLoaderOptions};
    Arc::new(MockLoader::new(MockLoaderOptions {
        progress_steps: vec![25, 50, 75],
        ..MockLoaderOptions::default()
    }))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let Some(target) = cli.to.clone() else {
        bail!("--to <LANG> is required");
    };

    let mut config = match &cli.config {
        Some(path) => ServiceConfig::from_json_file(path)?,
        None => ServiceConfig::default(),
    };
    if let Some(dir) = &cli.model_dir {
        config.model_dir = dir.to_string_lossy().into_owned();
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.timeout_ms = timeout_ms;
    }

    let service = TranslationService::new(Arc::new(ProcessSpawner::new(&config.model_dir)));
    service.on_progress(|event| {
        eprintln!("[{:?}] {}% {}", event.kind, event.progress, event.message);
    });
    if let Err(e) = service.initialize(config).await {
        service.destroy().await;
        return Err(e.into());
    }
    info!("[CLI] Service ready: {:?}", service.status());

    let options = TranslateOptions {
        priority: Some(cli.priority),
        ..TranslateOptions::default()
    };
    let result = match &cli.text {
        Some(text) => translate_one(&service, text, &cli.from, &target, &options).await,
        None => translate_lines(&service, &cli.from, &target, &options).await,
    };

    service.destroy().await;
    result
}

async fn translate_one(
    service: &TranslationService,
    text: &str,
    from: &str,
    to: &str,
    options: &TranslateOptions,
) -> anyhow::Result<()> {
    let translated = service
        .translate(text, from, to, Some(options.clone()))
        .await?;
    println!("{translated}");
    Ok(())
}

async fn translate_lines(
    service: &TranslationService,
    from: &str,
    to: &str,
    options: &TranslateOptions,
) -> anyhow::Result<()> {
    let mut failures = 0usize;
    for line in io::stdin().lock().lines() {
        let line = line.context("failed to read stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        match service.translate(&line, from, to, Some(options.clone())).await {
            Ok(translated) => println!("{translated}"),
            Err(e) => {
                error!("[CLI] {e}");
                eprintln!("error: {e}");
                failures += 1;
            }
        }
    }
    if failures > 0 {
        bail!("{failures} line(s) failed to translate");
    }
    Ok(())
}
