//! Local hook execution.
//!
//! A hook is any executable in the hooks directory whose file name starts
//! with `<event>-`. It runs with the flattened job merged over the inherited
//! environment. Hooks run one at a time and a failing hook never stops the
//! ones after it.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use bytes::BytesMut;
use derive_getters::Getters;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncRead;
use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::codec::{Decoder, FramedRead, LinesCodec, LinesCodecError};

use crate::config::HooksConfig;
use crate::log::*;
use crate::payload::FlattenedJob;

/// Longest hook output line relayed to the log.
const MAX_OUTPUT_LINE: usize = 8 * 1024;

/// How long output is still relayed once the hook itself has exited.
/// Processes it left in the background can keep its pipes open forever.
const OUTPUT_DRAIN: Duration = Duration::from_millis(500);

const SPAWN_BUSY_RETRIES: u32 = 5;

/// `ETXTBSY`: the executable is open for writing by some process.
#[cfg(unix)]
const TEXT_FILE_BUSY: i32 = 26;

#[derive(Error, Debug)]
pub enum HookError {
    #[error("failed spawning hook {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed waiting for hook {path}: {source}")]
    Wait {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("hook {path} exited with status {code}")]
    ExitStatus { path: PathBuf, code: i32 },
    #[error("hook {path} was terminated by a signal")]
    Signaled { path: PathBuf },
    #[error("hook {path} did not finish within {timeout:?} and was killed")]
    TimedOut { path: PathBuf, timeout: Duration },
}

/// What happened to the hooks of one event.
#[derive(Getters, Debug, Default)]
pub struct HookReport {
    succeeded: Vec<PathBuf>,
    failed: Vec<HookError>,
    /// Matching files that are not executable.
    skipped: Vec<PathBuf>,
}

impl HookReport {
    pub fn ran(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

/// A hook file found for an event.
#[derive(Getters, Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredHook {
    path: PathBuf,
    executable: bool,
}

#[derive(Getters, Debug, Clone)]
pub struct HookRunner {
    directory: PathBuf,
    timeout: Duration,
}

impl HookRunner {
    pub fn new(config: &HooksConfig) -> Self {
        Self {
            directory: config.directory().clone(),
            timeout: config.timeout(),
        }
    }

    /// Files in the hooks directory named `<event>-*`, sorted by name.
    #[tracing::instrument(skip(self))]
    pub async fn discover(&self, event: &str) -> Vec<DiscoveredHook> {
        let prefix = format!("{event}-");
        let mut entries = match fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(
                    "cannot read hooks directory {}: {}",
                    self.directory.display(),
                    e
                );
                return vec![];
            }
        };

        let mut hooks = vec![];
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("error listing hooks directory: {}", e);
                    break;
                }
            };
            if !entry.file_name().to_string_lossy().starts_with(&prefix) {
                continue;
            }
            // Follows symlinks so linked scripts count as hooks.
            let metadata = match fs::metadata(entry.path()).await {
                Ok(metadata) if metadata.is_file() => metadata,
                _ => continue,
            };
            hooks.push(DiscoveredHook {
                path: entry.path(),
                executable: is_executable(&metadata),
            });
        }
        hooks.sort_by(|a, b| a.path.cmp(&b.path));
        hooks
    }

    /// Run every executable hook for `event` with `job` in its environment.
    #[tracing::instrument(skip(self, job))]
    pub async fn dispatch(&self, event: &str, job: &FlattenedJob) -> HookReport {
        let mut report = HookReport::default();
        for hook in self.discover(event).await {
            if !hook.executable {
                warn!("skipping hook {}: not executable", hook.path.display());
                report.skipped.push(hook.path);
                continue;
            }
            info!("trigger: {}", hook.path.display());
            match self.run_hook(&hook.path, job).await {
                Ok(()) => {
                    debug!("hook {} finished", hook.path.display());
                    report.succeeded.push(hook.path);
                }
                Err(e) => {
                    error!("{}", e);
                    report.failed.push(e);
                }
            }
        }
        report
    }

    /// Run a single hook to completion, or kill it once the timeout expires.
    #[tracing::instrument(skip(self, job))]
    pub async fn run_hook(&self, path: &Path, job: &FlattenedJob) -> Result<(), HookError> {
        let mut builder = Command::new(path);
        builder
            .envs(job.iter().filter(|(k, v)| is_valid_env(k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = spawn(&mut builder).await.map_err(|source| HookError::Spawn {
            path: path.to_path_buf(),
            source,
        })?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let hook_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();

        let relay = tokio::spawn(relay_output(hook_name, stdout, stderr));
        let waited = tokio::time::timeout(self.timeout, child.wait()).await;

        let result = match waited {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => match status.code() {
                Some(code) => Err(HookError::ExitStatus {
                    path: path.to_path_buf(),
                    code,
                }),
                None => Err(HookError::Signaled {
                    path: path.to_path_buf(),
                }),
            },
            Ok(Err(source)) => Err(HookError::Wait {
                path: path.to_path_buf(),
                source,
            }),
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!("failed killing hook {}: {}", path.display(), e);
                }
                Err(HookError::TimedOut {
                    path: path.to_path_buf(),
                    timeout: self.timeout,
                })
            }
        };
        finish_relay(path, relay).await;
        result
    }
}

/// Let the relay catch up with output written just before exit, then stop it.
async fn finish_relay(path: &Path, mut relay: JoinHandle<()>) {
    if tokio::time::timeout(OUTPUT_DRAIN, &mut relay).await.is_err() {
        debug!(
            "output of {} is still held open, no longer relaying it",
            path.display()
        );
        relay.abort();
    }
}

/// Spawn, retrying briefly while the executable is busy. A hook that is
/// being installed while a run starts may still be open for writing.
async fn spawn(builder: &mut Command) -> std::io::Result<tokio::process::Child> {
    let mut attempt = 0;
    loop {
        match builder.spawn() {
            Err(e) if is_text_file_busy(&e) && attempt < SPAWN_BUSY_RETRIES => {
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(50 * attempt as u64)).await;
            }
            other => return other,
        }
    }
}

#[cfg(unix)]
fn is_text_file_busy(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(TEXT_FILE_BUSY)
}

#[cfg(not(unix))]
fn is_text_file_busy(_e: &std::io::Error) -> bool {
    false
}

/// One decoded line of hook output.
#[derive(Debug, PartialEq, Eq)]
enum OutputLine {
    Line(String),
    /// A line longer than [`MAX_OUTPUT_LINE`]; its bytes are dropped.
    Overlong,
}

/// [`LinesCodec`] that reports overlong lines as an item instead of an
/// error, so the pipe keeps being read after one.
#[derive(Debug)]
struct OutputCodec(LinesCodec);

impl OutputCodec {
    fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_OUTPUT_LINE))
    }

    fn lift(
        decoded: Result<Option<String>, LinesCodecError>,
    ) -> Result<Option<OutputLine>, LinesCodecError> {
        match decoded {
            Ok(line) => Ok(line.map(OutputLine::Line)),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(OutputLine::Overlong)),
            Err(e) => Err(e),
        }
    }
}

impl Decoder for OutputCodec {
    type Item = OutputLine;
    type Error = LinesCodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<OutputLine>, LinesCodecError> {
        Self::lift(self.0.decode(src))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<OutputLine>, LinesCodecError> {
        Self::lift(self.0.decode_eof(src))
    }
}

/// Forward a hook's stdout and stderr to the debug log line by line until
/// both are closed.
async fn relay_output(hook: String, stdout: Option<ChildStdout>, stderr: Option<ChildStderr>) {
    let mut stdout = stdout.map(|s| FramedRead::new(s, OutputCodec::new()));
    let mut stderr = stderr.map(|s| FramedRead::new(s, OutputCodec::new()));

    loop {
        tokio::select! {
            Some(next) = next_line(&mut stdout) => log_output(&hook, "stdout", next),
            Some(next) = next_line(&mut stderr) => log_output(&hook, "stderr", next),
            else => break,
        }
    }
}

fn log_output(hook: &str, stream: &str, next: Result<OutputLine, LinesCodecError>) {
    match next {
        Ok(OutputLine::Line(line)) => debug!("[{}] ({}) {}", hook, stream, line),
        Ok(OutputLine::Overlong) => debug!(
            "[{}] ({}) <line over {} bytes dropped>",
            hook, stream, MAX_OUTPUT_LINE
        ),
        Err(e) => debug!("[{}] unreadable {}: {}", hook, stream, e),
    }
}

async fn next_line<R: AsyncRead + Unpin>(
    stream: &mut Option<FramedRead<R, OutputCodec>>,
) -> Option<Result<OutputLine, LinesCodecError>> {
    match stream {
        Some(stream) => stream.next().await,
        None => None,
    }
}

/// Keys the OS cannot carry as environment variables are left out.
fn is_valid_env(key: &str, value: &str) -> bool {
    let valid = !key.is_empty() && !key.contains('=') && !key.contains('\0') && !value.contains('\0');
    if !valid {
        debug!("not exporting job field {:?} to hook environment", key);
    }
    valid
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    true
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    fn write_hook(dir: &Path, name: &str, body: &str, mode: u32) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    fn runner(dir: &Path, timeout: Duration) -> HookRunner {
        HookRunner {
            directory: dir.to_path_buf(),
            timeout,
        }
    }

    fn job(pairs: &[(&str, &str)]) -> FlattenedJob {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_discover_matches_event_prefix_only() {
        let dir = tempfile::tempdir().unwrap();
        write_hook(dir.path(), "vmdestroy-b", "true", 0o755);
        write_hook(dir.path(), "vmdestroy-a", "true", 0o755);
        write_hook(dir.path(), "vmdestroy-off", "true", 0o644);
        write_hook(dir.path(), "vmdestroyed", "true", 0o755);
        write_hook(dir.path(), "vmcreate-a", "true", 0o755);
        std::fs::create_dir(dir.path().join("vmdestroy-dir")).unwrap();

        let hooks = runner(dir.path(), Duration::from_secs(5))
            .discover("vmdestroy")
            .await;
        let names: Vec<_> = hooks
            .iter()
            .map(|h| (h.path().file_name().unwrap().to_string_lossy().to_string(), *h.executable()))
            .collect();
        assert_eq!(
            vec![
                ("vmdestroy-a".to_string(), true),
                ("vmdestroy-b".to_string(), true),
                ("vmdestroy-off".to_string(), false),
            ],
            names
        );
    }

    #[tokio::test]
    async fn test_missing_directory_has_no_hooks() {
        let dir = tempfile::tempdir().unwrap();
        let hooks = runner(&dir.path().join("missing"), Duration::from_secs(5))
            .discover("vmdestroy")
            .await;
        assert!(hooks.is_empty());
    }

    #[tokio::test]
    async fn test_hook_sees_job_and_inherited_environment() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        write_hook(
            dir.path(),
            "vmdestroy-record",
            &format!(
                "echo \"$jobresult_virtualmachine_id ${{PATH:+inherited}}\" > {}",
                out.display()
            ),
            0o755,
        );

        let report = runner(dir.path(), Duration::from_secs(5))
            .dispatch("vmdestroy", &job(&[("jobresult_virtualmachine_id", "5")]))
            .await;
        assert_eq!(1, report.succeeded().len());
        assert!(report.failed().is_empty());
        assert_eq!("5 inherited\n", std::fs::read_to_string(out).unwrap());
    }

    #[tokio::test]
    async fn test_job_values_override_inherited_environment() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        write_hook(
            dir.path(),
            "vmdestroy-home",
            &format!("echo \"$HOME\" > {}", out.display()),
            0o755,
        );

        let report = runner(dir.path(), Duration::from_secs(5))
            .dispatch("vmdestroy", &job(&[("HOME", "/from/the/job")]))
            .await;
        assert_eq!(1, report.succeeded().len());
        assert_eq!("/from/the/job\n", std::fs::read_to_string(out).unwrap());
    }

    #[tokio::test]
    async fn test_failing_hook_does_not_stop_the_others() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        write_hook(dir.path(), "vmcreate-1-fails", "exit 3", 0o755);
        write_hook(
            dir.path(),
            "vmcreate-2-works",
            &format!("touch {}", marker.display()),
            0o755,
        );
        write_hook(dir.path(), "vmcreate-3-skipped", "true", 0o600);

        let report = runner(dir.path(), Duration::from_secs(5))
            .dispatch("vmcreate", &FlattenedJob::new())
            .await;
        assert_eq!(2, report.ran());
        assert_eq!(1, report.succeeded().len());
        assert_eq!(1, report.skipped().len());
        assert!(matches!(
            report.failed()[0],
            HookError::ExitStatus { code: 3, .. }
        ));
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn test_hanging_hook_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_hook(dir.path(), "vmdestroy-slow", "exec sleep 30", 0o755);
        let started = std::time::Instant::now();
        let result = runner(dir.path(), Duration::from_millis(200))
            .run_hook(&path, &FlattenedJob::new())
            .await;
        assert!(matches!(result, Err(HookError::TimedOut { .. })));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_chatty_hook_output_is_drained() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_hook(
            dir.path(),
            "vmdestroy-chatty",
            "i=0; while [ $i -lt 2000 ]; do echo line $i; echo err $i >&2; i=$((i+1)); done",
            0o755,
        );
        let result = runner(dir.path(), Duration::from_secs(20))
            .run_hook(&path, &FlattenedJob::new())
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_background_child_does_not_hold_the_hook() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_hook(dir.path(), "vmdestroy-bg", "sleep 5 &\nexit 0", 0o755);
        let started = std::time::Instant::now();
        let result = runner(dir.path(), Duration::from_secs(3))
            .run_hook(&path, &FlattenedJob::new())
            .await;
        assert!(result.is_ok(), "{result:?}");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_overlong_line_does_not_stall_the_hook() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_hook(
            dir.path(),
            "vmdestroy-long",
            "head -c 10000 /dev/zero | tr '\\0' x\necho\ni=0; while [ $i -lt 5000 ]; do echo 0123456789012345678901234567890123456789; i=$((i+1)); done",
            0o755,
        );
        let result = runner(dir.path(), Duration::from_secs(20))
            .run_hook(&path, &FlattenedJob::new())
            .await;
        assert!(result.is_ok(), "{result:?}");
    }

    #[test]
    fn test_output_codec_skips_overlong_lines() {
        let mut codec = OutputCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&vec![b'x'; MAX_OUTPUT_LINE + 10]);
        buf.extend_from_slice(b"\nafter\n");

        assert_eq!(Some(OutputLine::Overlong), codec.decode(&mut buf).unwrap());
        assert_eq!(
            Some(OutputLine::Line("after".into())),
            codec.decode(&mut buf).unwrap()
        );
        assert_eq!(None, codec.decode(&mut buf).unwrap());
    }

    #[test]
    fn test_only_busy_executables_are_retried() {
        let busy = std::io::Error::from_raw_os_error(TEXT_FILE_BUSY);
        assert!(is_text_file_busy(&busy));
        let missing = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert!(!is_text_file_busy(&missing));
    }

    #[test]
    fn test_env_key_validation() {
        assert!(is_valid_env("jobid", "J1"));
        assert!(!is_valid_env("", "x"));
        assert!(!is_valid_env("a=b", "x"));
        assert!(!is_valid_env("a", "x\0y"));
    }
}
