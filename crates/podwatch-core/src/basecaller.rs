//! Builds and runs the external basecalling command.
//!
//! The basecaller is long-running and monopolises the GPU, so it is run
//! exactly once per claimed marker and never retried here. Every way it can
//! go wrong (missing binary, spawn error, non-zero exit, signal, timeout) is
//! folded into [`InvocationResult::failure`] instead of an `Err`, so the
//! pipeline can still record the outcome and send a notification.
//!
//! # Command shape
//! - simplex: `<bin> basecaller <model> <raw dir> --kit-name <kit> [--input-type <type>] --output-dir <exp dir> [extra]`
//! - duplex:  `<bin> duplex <model> <raw dir> --kit-name <kit> [--input-type <type>] [--pairs <file>] --output-dir <exp dir> [extra]`
//!
//! The input-type flag name comes from `tool.input_type_flag`; an empty
//! value leaves it out.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use walkdir::WalkDir;

use crate::config::ToolConfig;
use crate::paths::STATE_DIR;
use crate::resolver::Resolution;
use crate::types::{Basecalling, DuplexPairing, ExperimentRequest};

/// Bytes of stdout/stderr kept per stream (the tail).
pub const MAX_CAPTURE_BYTES: usize = 64 * 1024;

/// How long to keep reading output after a timed-out child is killed.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// File endings of basecalled read sets.
const ARTIFACT_SUFFIXES: &[&str] = &[".bam", ".sam", ".fastq", ".fastq.gz", ".fq", ".fq.gz"];

// ---------------------------------------------------------------------------
// ToolFailure
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ToolFailure {
    #[error("'{0}' was not found or is not executable")]
    NotFound(String),

    #[error("failed to launch '{binary}': {reason}")]
    SpawnFailed { binary: String, reason: String },

    #[error("exited with code {0}")]
    NonZeroExit(i32),

    #[error("terminated by a signal")]
    Signalled,

    #[error("timed out after {}s and was killed", .0.as_secs())]
    TimedOut(Duration),

    #[error("lost track of the process: {0}")]
    Io(String),
}

// ---------------------------------------------------------------------------
// InvocationResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct InvocationResult {
    pub argv: Vec<String>,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Where the basecaller was told to write its output.
    pub output_dir: PathBuf,
    /// Read files the basecaller produced there, found after a clean exit.
    pub artifacts: Vec<PathBuf>,
    #[serde(serialize_with = "serialize_secs")]
    pub duration: Duration,
    pub failure: Option<ToolFailure>,
}

impl InvocationResult {
    fn new(argv: Vec<String>, output_dir: PathBuf) -> Self {
        Self {
            argv,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            output_dir,
            artifacts: Vec::new(),
            duration: Duration::ZERO,
            failure: None,
        }
    }

    fn failed(mut self, failure: ToolFailure) -> Self {
        self.failure = Some(failure);
        self
    }

    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    /// Space-joined command line, for logs and reports.
    pub fn command_line(&self) -> String {
        self.argv.join(" ")
    }
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}

// ---------------------------------------------------------------------------
// Basecaller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Basecaller {
    config: ToolConfig,
}

impl Basecaller {
    pub fn new(config: ToolConfig) -> Self {
        Self { config }
    }

    /// Full argv, binary first, for the given directory and request.
    pub fn build_argv(&self, resolution: &Resolution, request: &ExperimentRequest) -> Vec<String> {
        let mut argv = vec![self.config.binary.clone()];
        let pairing = match &request.basecalling {
            Basecalling::Simplex { model } => {
                argv.push("basecaller".into());
                argv.push(model.clone());
                None
            }
            Basecalling::Duplex { model, pairing } => {
                argv.push("duplex".into());
                argv.push(model.clone());
                Some(pairing)
            }
        };
        argv.push(resolution.raw_dir.display().to_string());
        argv.push("--kit-name".into());
        argv.push(request.kit.clone());
        if let Some(flag) = &self.config.input_type_flag {
            argv.push(flag.clone());
            argv.push(request.input_type.to_string());
        }
        if let Some(DuplexPairing::PairsFile { path }) = pairing {
            argv.push("--pairs".into());
            argv.push(path.display().to_string());
        }
        argv.push("--output-dir".into());
        argv.push(resolution.experiment_dir.display().to_string());
        argv.extend(self.config.extra_args.iter().cloned());
        argv
    }

    /// Run the basecaller to completion (or timeout) and classify the result.
    pub async fn run(&self, resolution: &Resolution, request: &ExperimentRequest) -> InvocationResult {
        let argv = self.build_argv(resolution, request);
        let mut result = InvocationResult::new(argv, resolution.experiment_dir.clone());
        let started = Instant::now();

        let program = match which::which(&self.config.binary) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(binary = %self.config.binary, error = %e, "basecaller binary not found");
                return result.failed(ToolFailure::NotFound(self.config.binary.clone()));
            }
        };

        tracing::info!(command = %result.command_line(), "starting basecaller");

        let mut cmd = Command::new(&program);
        cmd.args(&result.argv[1..])
            .current_dir(&resolution.experiment_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own process group: a timeout can take down helpers the tool
        // spawned, and a terminal Ctrl-C does not reach the basecaller.
        #[cfg(unix)]
        cmd.process_group(0);
        let wall_clock_start = SystemTime::now();

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(binary = %program.display(), error = %e, "failed to launch basecaller");
                return result.failed(ToolFailure::SpawnFailed {
                    binary: program.display().to_string(),
                    reason: e.to_string(),
                });
            }
        };

        let stdout_tail = Tail::default();
        let stderr_tail = Tail::default();
        let stdout_task = child
            .stdout
            .take()
            .map(|s| tokio::spawn(drain_tail(s, stdout_tail.clone(), false)));
        let stderr_task = child
            .stderr
            .take()
            .map(|s| tokio::spawn(drain_tail(s, stderr_tail.clone(), true)));

        let waited = match self.config.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status.map(Some),
                Err(_) => {
                    tracing::warn!(timeout_secs = limit.as_secs(), "basecaller timed out; killing it");
                    kill_process_group(&child).await;
                    if let Err(e) = child.kill().await {
                        tracing::error!(error = %e, "failed to kill timed-out basecaller");
                    }
                    Ok(None)
                }
            },
            None => child.wait().await.map(Some),
        };

        // After a kill, a descendant that escaped the group may still hold
        // the pipes open; stop reading after a grace period instead of
        // waiting for it.
        let grace = matches!(waited, Ok(None)).then_some(DRAIN_GRACE);
        result.stdout = finish_drain(stdout_task, &stdout_tail, grace).await;
        result.stderr = finish_drain(stderr_task, &stderr_tail, grace).await;
        result.duration = started.elapsed();

        let failure = match waited {
            Ok(Some(status)) => {
                result.exit_code = status.code();
                match status.code() {
                    Some(0) => None,
                    Some(code) => Some(ToolFailure::NonZeroExit(code)),
                    None => Some(ToolFailure::Signalled),
                }
            }
            Ok(None) => self.config.timeout.map(ToolFailure::TimedOut),
            Err(e) => Some(ToolFailure::Io(e.to_string())),
        };

        if failure.is_none() {
            result.artifacts = find_artifacts(&resolution.experiment_dir, wall_clock_start);
        }
        match &failure {
            None => tracing::info!(
                duration_secs = result.duration.as_secs(),
                output = %result.output_dir.display(),
                "basecaller finished"
            ),
            Some(f) => tracing::warn!(
                duration_secs = result.duration.as_secs(),
                exit_code = ?result.exit_code,
                "basecaller failed: {f}"
            ),
        }
        result.failure = failure;
        result
    }
}

/// Shared tail of one child stream, readable even if the reader is aborted.
type Tail = Arc<Mutex<Vec<u8>>>;

/// Read a child stream to EOF, keeping only the last `MAX_CAPTURE_BYTES`.
///
/// Reads raw bytes rather than lines so binary output cannot stall the pipe.
async fn drain_tail<R: AsyncRead + Unpin>(mut reader: R, tail: Tail, log_lines: bool) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if log_lines {
                    for line in String::from_utf8_lossy(&buf[..n]).lines() {
                        tracing::debug!("basecaller: {line}");
                    }
                }
                let Ok(mut tail) = tail.lock() else {
                    break;
                };
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > MAX_CAPTURE_BYTES {
                    let excess = tail.len() - MAX_CAPTURE_BYTES;
                    tail.drain(..excess);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "error reading basecaller output");
                break;
            }
        }
    }
}

/// Wait for a drain task (bounded by `grace` when set) and return what it
/// captured.
async fn finish_drain(task: Option<JoinHandle<()>>, tail: &Tail, grace: Option<Duration>) -> String {
    if let Some(mut task) = task {
        match grace {
            None => {
                let _ = task.await;
            }
            Some(limit) => {
                if tokio::time::timeout(limit, &mut task).await.is_err() {
                    tracing::warn!("basecaller output still open after kill; no longer reading it");
                    task.abort();
                }
            }
        }
    }
    let bytes = tail.lock().map(|t| t.clone()).unwrap_or_default();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Kill every process in the child's group.
#[cfg(unix)]
async fn kill_process_group(child: &Child) {
    let Some(pid) = child.id() else {
        return;
    };
    let status = Command::new("kill")
        .args(["-KILL", "--", &format!("-{pid}")])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = status {
        tracing::warn!(pid, error = %e, "failed to kill basecaller process group");
    }
}

#[cfg(not(unix))]
async fn kill_process_group(_child: &Child) {}

/// Files the basecaller wrote under `dir` since `since`, in path order.
/// The raw-signal folders and the podwatch state directory are skipped.
fn find_artifacts(dir: &Path, since: SystemTime) -> Vec<PathBuf> {
    // allow for coarse filesystem timestamps
    let since = since.checked_sub(Duration::from_secs(2)).unwrap_or(since);
    let mut found: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            e.depth() == 0 || !(name == "pod5" || name == "fast5" || name == STATE_DIR)
        })
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            let name = e.file_name().to_string_lossy();
            ARTIFACT_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
        })
        .filter(|e| {
            e.metadata().map_err(std::io::Error::from)
                .and_then(|m| m.modified())
                .is_ok_and(|t| t >= since)
        })
        .map(|e| e.into_path())
        .collect();
    found.sort();
    found
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InputType;
    use chrono::NaiveDate;
    use std::path::Path;
    use tempfile::TempDir;

    fn request(basecalling: Basecalling) -> ExperimentRequest {
        ExperimentRequest {
            root: PathBuf::from("/data"),
            date: NaiveDate::from_ymd_opt(2024, 4, 1).unwrap(),
            basecalling,
            kit: "SQK-NBD114-24".into(),
            input_type: InputType::Pod5,
            sample_type: None,
            amplification: None,
            recipients: vec!["lab@example.org".into()],
        }
    }

    fn resolution(dir: &Path) -> Resolution {
        Resolution {
            experiment_dir: dir.to_path_buf(),
            raw_dir: dir.join("pod5"),
            device_id: "devA".into(),
            flow_cell_id: "fcB".into(),
            experiment_id: "expC".into(),
            discarded: Vec::new(),
        }
    }

    fn tool(binary: &str) -> Basecaller {
        Basecaller::new(ToolConfig {
            binary: binary.into(),
            ..ToolConfig::default()
        })
    }

    #[test]
    fn simplex_argv() {
        let dir = Path::new("/data/20240401_run1/sub/20240401_1200_devA_fcB_expC");
        let argv = tool("dorado").build_argv(
            &resolution(dir),
            &request(Basecalling::Simplex {
                model: "sup".into(),
            }),
        );
        assert_eq!(
            argv,
            vec![
                "dorado",
                "basecaller",
                "sup",
                "/data/20240401_run1/sub/20240401_1200_devA_fcB_expC/pod5",
                "--kit-name",
                "SQK-NBD114-24",
                "--input-type",
                "pod5",
                "--output-dir",
                "/data/20240401_run1/sub/20240401_1200_devA_fcB_expC",
            ]
        );
    }

    #[test]
    fn duplex_argv_with_pairs_and_extra_args() {
        let dir = Path::new("/exp");
        let basecaller = Basecaller::new(ToolConfig {
            binary: "/opt/dorado/bin/dorado".into(),
            extra_args: vec!["--min-qscore".into(), "10".into()],
            input_type_flag: Some("--input-type".into()),
            timeout: None,
        });
        let argv = basecaller.build_argv(
            &resolution(dir),
            &request(Basecalling::Duplex {
                model: "sup".into(),
                pairing: DuplexPairing::PairsFile {
                    path: PathBuf::from("/pairs.txt"),
                },
            }),
        );
        assert_eq!(
            argv,
            vec![
                "/opt/dorado/bin/dorado",
                "duplex",
                "sup",
                "/exp/pod5",
                "--kit-name",
                "SQK-NBD114-24",
                "--input-type",
                "pod5",
                "--pairs",
                "/pairs.txt",
                "--output-dir",
                "/exp",
                "--min-qscore",
                "10",
            ]
        );
    }

    #[test]
    fn duplex_auto_pairing_adds_no_pairs_flag() {
        let argv = tool("dorado").build_argv(
            &resolution(Path::new("/exp")),
            &request(Basecalling::Duplex {
                model: "hac".into(),
                pairing: DuplexPairing::Auto,
            }),
        );
        assert_eq!(argv[1], "duplex");
        assert!(!argv.iter().any(|a| a == "--pairs"));
    }

    #[test]
    fn input_type_flag_can_be_renamed_or_dropped() {
        let mut req = request(Basecalling::Simplex {
            model: "sup".into(),
        });
        req.input_type = InputType::Fast5;
        let res = resolution(Path::new("/exp"));

        let renamed = Basecaller::new(ToolConfig {
            binary: "dorado".into(),
            input_type_flag: Some("--reads-format".into()),
            ..ToolConfig::default()
        })
        .build_argv(&res, &req);
        let at = renamed.iter().position(|a| a == "--reads-format").unwrap();
        assert_eq!(renamed[at + 1], "fast5");
        assert_eq!(renamed[3], "/exp/fast5");

        let dropped = Basecaller::new(ToolConfig {
            binary: "dorado".into(),
            input_type_flag: None,
            ..ToolConfig::default()
        })
        .build_argv(&res, &req);
        assert!(!dropped.iter().any(|a| a == "--input-type" || a == "fast5"));
    }

    #[tokio::test]
    async fn missing_binary_is_a_failed_result() {
        let dir = TempDir::new().unwrap();
        let result = tool("podwatch-no-such-basecaller")
            .run(
                &resolution(dir.path()),
                &request(Basecalling::Simplex {
                    model: "sup".into(),
                }),
            )
            .await;
        assert!(!result.succeeded());
        assert!(matches!(result.failure, Some(ToolFailure::NotFound(_))));
        assert_eq!(result.exit_code, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_stdout_on_success() {
        let dir = TempDir::new().unwrap();
        // `echo` prints its argv, which stands in for basecaller output.
        let result = tool("echo")
            .run(
                &resolution(dir.path()),
                &request(Basecalling::Simplex {
                    model: "sup".into(),
                }),
            )
            .await;
        assert!(result.succeeded(), "failure: {:?}", result.failure);
        assert_eq!(result.exit_code, Some(0));
        assert!(result.stdout.starts_with("basecaller sup "), "{}", result.stdout);
        assert_eq!(result.output_dir, dir.path());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_classified() {
        let dir = TempDir::new().unwrap();
        let result = tool("false")
            .run(
                &resolution(dir.path()),
                &request(Basecalling::Simplex {
                    model: "sup".into(),
                }),
            )
            .await;
        assert_eq!(result.failure, Some(ToolFailure::NonZeroExit(1)));
        assert_eq!(result.exit_code, Some(1));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_the_child() {
        let dir = TempDir::new().unwrap();
        // `sh basecaller ...` runs ./basecaller from the experiment directory.
        std::fs::write(dir.path().join("basecaller"), "exec sleep 30\n").unwrap();
        let started = Instant::now();
        let result = timed_sh(200)
            .run(
                &resolution(dir.path()),
                &request(Basecalling::Simplex {
                    model: "sup".into(),
                }),
            )
            .await;
        assert!(matches!(result.failure, Some(ToolFailure::TimedOut(_))));
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[cfg(unix)]
    fn timed_sh(millis: u64) -> Basecaller {
        Basecaller::new(ToolConfig {
            binary: "sh".into(),
            timeout: Some(Duration::from_millis(millis)),
            ..ToolConfig::default()
        })
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_does_not_wait_for_grandchildren() {
        let dir = TempDir::new().unwrap();
        // The shell forks `sleep`, which inherits the output pipes.
        std::fs::write(
            dir.path().join("basecaller"),
            "echo loading model\nsleep 30\necho never\n",
        )
        .unwrap();
        let started = Instant::now();
        let result = timed_sh(300)
            .run(
                &resolution(dir.path()),
                &request(Basecalling::Simplex {
                    model: "sup".into(),
                }),
            )
            .await;
        assert!(matches!(result.failure, Some(ToolFailure::TimedOut(_))));
        assert!(
            started.elapsed() < Duration::from_secs(10),
            "took {:?}",
            started.elapsed()
        );
        assert!(result.stdout.contains("loading model"), "{}", result.stdout);
        assert!(!result.stdout.contains("never"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn lists_reads_written_by_the_basecaller() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("pod5")).unwrap();
        std::fs::write(dir.path().join("pod5/old.bam"), "").unwrap();
        std::fs::write(
            dir.path().join("basecaller"),
            "mkdir -p calls\necho reads > calls/reads.bam\necho log > run.log\n",
        )
        .unwrap();
        let result = tool("sh")
            .run(
                &resolution(dir.path()),
                &request(Basecalling::Simplex {
                    model: "sup".into(),
                }),
            )
            .await;
        assert!(result.succeeded(), "failure: {:?}", result.failure);
        assert_eq!(result.artifacts, vec![dir.path().join("calls/reads.bam")]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_runs_list_no_reads() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("basecaller"), "echo x > partial.bam\nexit 3\n").unwrap();
        let result = tool("sh")
            .run(
                &resolution(dir.path()),
                &request(Basecalling::Simplex {
                    model: "sup".into(),
                }),
            )
            .await;
        assert_eq!(result.failure, Some(ToolFailure::NonZeroExit(3)));
        assert!(result.artifacts.is_empty());
    }

    #[test]
    fn failure_messages_are_readable() {
        assert_eq!(ToolFailure::NonZeroExit(2).to_string(), "exited with code 2");
        assert_eq!(
            ToolFailure::TimedOut(Duration::from_secs(60)).to_string(),
            "timed out after 60s and was killed"
        );
    }
}
