//! Child-process worker transport.
//!
//! Spawns the worker as a child process (same binary with `--worker`),
//! speaks JSON Lines over its stdin/stdout, and kills it on teardown. The
//! child's stderr is inherited so worker logs land next to ours.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;

use crossbeam_channel::Receiver;
use log::{debug, info, warn};
use offline_translate_types::{TranslateError, WorkerRequest, WorkerResponse};
use tokio::sync::mpsc;

use super::transport::{spawn_failed, WorkerConnection, WorkerEvent, WorkerHandle, WorkerSpawner};

pub struct ProcessSpawner {
    program: Option<PathBuf>,
    model_dir: PathBuf,
    spawn_count: AtomicU32,
}

impl ProcessSpawner {
    /// Re-run the current executable in worker mode.
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: None,
            model_dir: model_dir.into(),
            spawn_count: AtomicU32::new(0),
        }
    }

    /// Use a different worker executable. It must accept
    /// `--worker --model-dir <dir>`.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }

    fn command(&self) -> Result<Command, TranslateError> {
        let exe = match &self.program {
            Some(program) => program.clone(),
            None => std::env::current_exe()
                .map_err(|e| spawn_failed(format!("Cannot find own executable: {e}")))?,
        };
        info!(
            "[PROCESS_MGR] Spawning worker: {} --worker --model-dir {}",
            exe.display(),
            self.model_dir.display()
        );
        let mut command = Command::new(exe);
        command
            .arg("--worker")
            .arg("--model-dir")
            .arg(&self.model_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()); // Worker logs go to parent's stderr
        Ok(command)
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self) -> Result<WorkerConnection, TranslateError> {
        let mut child = self
            .command()?
            .spawn()
            .map_err(|e| spawn_failed(format!("Failed to spawn worker: {e}")))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(spawn_failed("Worker stdio not available".to_string()));
        };

        let pid = child.id();
        let count = self.spawn_count.fetch_add(1, Ordering::Relaxed) + 1;
        info!("[PROCESS_MGR] Worker started (pid={pid}, spawn #{count})");

        let (requests, outgoing) = crossbeam_channel::unbounded::<WorkerRequest>();
        let (event_tx, events) = mpsc::unbounded_channel();

        thread::Builder::new()
            .name(format!("worker-{pid}-stdin"))
            .spawn(move || stdin_writer(outgoing, stdin))
            .map_err(|e| spawn_failed(format!("Failed to start stdin writer: {e}")))?;
        thread::Builder::new()
            .name(format!("worker-{pid}-stdout"))
            .spawn(move || stdout_reader(stdout, event_tx, pid))
            .map_err(|e| spawn_failed(format!("Failed to start stdout reader: {e}")))?;

        Ok(WorkerConnection {
            requests,
            events,
            handle: Box::new(ProcessHandle { child: Some(child) }),
        })
    }
}

struct ProcessHandle {
    child: Option<Child>,
}

impl WorkerHandle for ProcessHandle {
    /// Kill the worker process immediately. The OS reclaims its memory.
    fn terminate(&mut self) {
        if let Some(mut child) = self.child.take() {
            info!("[PROCESS_MGR] Killing worker process (pid={})", child.id());
            let _ = child.kill();
            let _ = child.wait(); // Reap
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Writes commands to the worker's stdin until the channel closes or the
/// pipe breaks.
fn stdin_writer(outgoing: Receiver<WorkerRequest>, mut stdin: ChildStdin) {
    for request in outgoing.iter() {
        let json = match serde_json::to_string(&request) {
            Ok(json) => json,
            Err(e) => {
                warn!("[PROCESS_MGR] Failed to serialize command {}: {e}", request.id);
                continue;
            }
        };
        if writeln!(stdin, "{json}").and_then(|()| stdin.flush()).is_err() {
            warn!("[PROCESS_MGR] Failed to write to worker stdin");
            break;
        }
    }
    debug!("[PROCESS_MGR] Stdin writer exiting");
}

/// Reads envelopes from the worker's stdout; reports EOF as fatal.
fn stdout_reader(stdout: ChildStdout, events: mpsc::UnboundedSender<WorkerEvent>, pid: u32) {
    let reader = BufReader::new(stdout);
    for line in reader.lines() {
        let line = match line {
            Ok(l) if l.trim().is_empty() => continue,
            Ok(l) => l,
            Err(e) => {
                warn!("[PROCESS_MGR] Worker stdout read error: {e}");
                break;
            }
        };
        match serde_json::from_str::<WorkerResponse>(&line) {
            Ok(response) => {
                if events.send(WorkerEvent::Envelope(response)).is_err() {
                    return;
                }
            }
            Err(e) => warn!("[PROCESS_MGR] Failed to parse worker response: {e}"),
        }
    }
    let _ = events.send(WorkerEvent::Fatal(format!(
        "Worker process {pid} closed its output"
    )));
}

#[cfg(test)]
mod tests {
    use super::*;
    use offline_translate_types::ErrorKind;

    #[test]
    fn test_missing_program_fails_to_spawn() {
        let spawner = ProcessSpawner::new("models")
            .with_program("/nonexistent/offline-translate-worker-binary");
        let err = spawner.spawn().err().unwrap();
        assert_eq!(err.kind, ErrorKind::WorkerInitializationFailed);
    }

    #[test]
    fn test_command_carries_worker_flags() {
        let spawner = ProcessSpawner::new("/tmp/models").with_program("/bin/worker");
        let command = spawner.command().unwrap();
        let args: Vec<String> = command
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, vec!["--worker", "--model-dir", "/tmp/models"]);
    }
}
