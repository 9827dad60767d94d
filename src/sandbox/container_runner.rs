use std::collections::HashSet;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::timeout;

use crate::config::SandboxConfig;
use crate::error::EngineError;
use crate::language::{BUILD_DIR, Language, SOURCE_DIR};
use crate::workspace::Workspace;

use super::{CompileOutcome, RunOutcome, SandboxRunner, StaleSweep, SweepPolicy};

const MANAGED_LABEL: &str = "codejudge.managed=true";
const WORKSPACE_LABEL: &str = "codejudge.workspace";
const CONTAINER_PREFIX: &str = "codejudge";

// Exit statuses reserved by the engine for its own failures
const ENGINE_FAILURE_EXIT: i32 = 125;
const COMMAND_NOT_EXECUTABLE_EXIT: i32 = 126;
const COMMAND_NOT_FOUND_EXIT: i32 = 127;

const ENGINE_QUERY_TIMEOUT: Duration = Duration::from_secs(30);
const READ_CHUNK: usize = 8192;
// Enough to always hold the trailing meta line
const STDERR_TAIL: usize = 4096;

const START_MARKER: &str = "__CODEJUDGE_START__";
const META_MARKER: &str = "__CODEJUDGE_META__";

/// Marks where program stderr begins, runs the program, then reports the cgroup
/// peak memory on stderr
const MEMORY_WRAPPER: &str = r#"printf '__CODEJUDGE_START__\n' >&2; "$@"; status=$?; peak=$(cat /sys/fs/cgroup/memory.peak 2>/dev/null || cat /sys/fs/cgroup/memory/memory.max_usage_in_bytes 2>/dev/null || echo 0); printf '\n__CODEJUDGE_META__ %s\n' "$peak" >&2; exit $status"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Compile,
    Run,
}

/// Raw result of one engine invocation
#[derive(Debug, Default)]
struct Captured {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    /// Last bytes written to stderr, kept even past the output cap
    stderr_tail: Vec<u8>,
    truncated: bool,
    exit_code: Option<i32>,
    timed_out: bool,
    elapsed: Duration,
}

/// A sandbox backed by a container engine CLI (`docker` or a compatible one)
///
/// Every compile and run gets its own short-lived container with no network, a
/// read-only root filesystem, a small `noexec` tmpfs, an unprivileged user, no
/// capabilities and cgroup limits on memory, CPU and process count.
pub struct ContainerRunner {
    config: SandboxConfig,
    run_seq: AtomicU64,
}

impl ContainerRunner {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            run_seq: AtomicU64::new(0),
        }
    }

    /// Checks that the engine answers and returns its server version
    pub async fn probe(&self) -> Result<String, EngineError> {
        let version = self
            .engine_output(&["version", "--format", "{{.Server.Version}}"])
            .await
            .map_err(EngineError::RunnerUnavailable)?;
        log::info!("Container engine `{}` version {version}", self.config.engine);
        Ok(version)
    }

    /// Makes sure every language image is present locally, pulling it if allowed
    ///
    /// Containers are started with `--pull never`, so a missing image would otherwise
    /// surface on the first request.
    pub async fn ensure_images(&self) -> Result<(), EngineError> {
        let mut missing = Vec::new();

        for language in Language::ALL {
            let image = self.config.images.for_language(language);
            if self
                .engine_output(&["image", "inspect", "--format", "{{.Id}}", image])
                .await
                .is_ok()
            {
                log::debug!("Image {image} for {language} is present");
                continue;
            }

            if self.config.pull_missing_images {
                log::info!("Pulling image {image} for {language}");
                let status = Command::new(&self.config.engine)
                    .args(["pull", image])
                    .stdout(Stdio::null())
                    .stderr(Stdio::piped())
                    .status()
                    .await;
                match status {
                    Ok(status) if status.success() => continue,
                    Ok(status) => log::error!("Pulling {image} exited with {status}"),
                    Err(e) => return Err(self.launch_error(e)),
                }
            }

            log::error!("Image {image} for {language} is not available");
            missing.push(image.to_string());
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(EngineError::RunnerUnavailable(format!(
                "missing sandbox images: {}",
                missing.join(", ")
            )))
        }
    }

    fn container_name(&self, workspace: &Workspace, phase: Phase) -> String {
        match phase {
            Phase::Compile => format!("{CONTAINER_PREFIX}-{}-compile", workspace.id()),
            Phase::Run => format!(
                "{CONTAINER_PREFIX}-{}-run-{}",
                workspace.id(),
                self.run_seq.fetch_add(1, Ordering::Relaxed)
            ),
        }
    }

    /// Builds the full engine argument list for one container
    fn container_args(
        &self,
        workspace: &Workspace,
        name: &str,
        phase: Phase,
        command: &[&str],
    ) -> Vec<String> {
        let config = &self.config;
        let profile = workspace.profile();
        let memory_mb = match phase {
            Phase::Compile => config.compile_memory_limit_mb,
            Phase::Run => config.memory_limit_mb,
        };
        let build_mode = match phase {
            Phase::Compile => "rw",
            Phase::Run => "ro",
        };

        let mut args: Vec<String> = vec!["run".into(), "--rm".into()];
        if phase == Phase::Run {
            args.push("--interactive".into());
        }
        args.extend([
            "--name".into(),
            name.to_string(),
            "--label".into(),
            MANAGED_LABEL.into(),
            "--label".into(),
            format!("{WORKSPACE_LABEL}={}", workspace.id()),
            "--pull".into(),
            "never".into(),
            "--network".into(),
            "none".into(),
            "--read-only".into(),
            "--tmpfs".into(),
            format!("/tmp:rw,noexec,nosuid,size={}m", config.tmpfs_size_mb),
            "--user".into(),
            config.user.clone(),
            "--cap-drop".into(),
            "ALL".into(),
            "--security-opt".into(),
            "no-new-privileges".into(),
            "--memory".into(),
            format!("{memory_mb}m"),
            "--memory-swap".into(),
            format!("{memory_mb}m"),
            "--cpus".into(),
            config.cpus.to_string(),
            "--pids-limit".into(),
            config.pids_limit.to_string(),
            "--workdir".into(),
            "/tmp".into(),
            "--env".into(),
            "HOME=/tmp".into(),
            "--env".into(),
            "PYTHONDONTWRITEBYTECODE=1".into(),
            "--volume".into(),
            format!(
                "{}:{SOURCE_DIR}/{}:ro",
                workspace.source_path().display(),
                profile.source_name
            ),
            "--volume".into(),
            format!("{}:{BUILD_DIR}:{build_mode}", workspace.build_dir().display()),
            config.images.for_language(profile.language).to_string(),
        ]);

        if phase == Phase::Run {
            args.extend([
                "sh".into(),
                "-c".into(),
                MEMORY_WRAPPER.into(),
                "sh".into(),
            ]);
        }
        args.extend(command.iter().map(|s| s.to_string()));

        args
    }

    /// Starts one container and waits for it within `limit`
    ///
    /// Stdin is written and closed while stdout and stderr are drained, so neither
    /// side can block on a full pipe. On timeout the client process is killed and
    /// the container force-removed before returning.
    async fn execute(
        &self,
        args: Vec<String>,
        name: &str,
        input: Option<&str>,
        limit: Duration,
    ) -> Result<Captured, EngineError> {
        let mut cmd = Command::new(&self.config.engine);
        cmd.args(&args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut guard = ContainerGuard::new(&self.config.engine, name);
        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            guard.disarm();
            self.launch_error(e)
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let cap = self.config.output_limit_bytes;

        let io = async {
            let feed = async move {
                if let (Some(mut pipe), Some(input)) = (stdin, input) {
                    // The program may exit without reading all of its input
                    if let Err(e) = pipe.write_all(input.as_bytes()).await
                        && e.kind() != io::ErrorKind::BrokenPipe
                    {
                        log::debug!("Failed to write stdin of {name}: {e}");
                    }
                    let _ = pipe.shutdown().await;
                }
            };
            let (_, out, err, status) = tokio::join!(
                feed,
                read_capped(stdout, cap),
                read_capped(stderr, cap),
                child.wait()
            );
            (out, err, status)
        };

        match timeout(limit, io).await {
            Ok((stdout, stderr, status)) => {
                guard.disarm();
                let status: ExitStatus = status.map_err(|e| {
                    EngineError::RunnerUnavailable(format!("waiting for {name} failed: {e}"))
                })?;
                Ok(Captured {
                    truncated: stdout.truncated || stderr.truncated,
                    stdout: stdout.kept,
                    stderr: stderr.kept,
                    stderr_tail: stderr.tail,
                    exit_code: status.code(),
                    timed_out: false,
                    elapsed: start.elapsed(),
                })
            }
            Err(_) => {
                log::warn!("Container {name} exceeded {} ms, force-killing", limit.as_millis());
                let grace = self.config.kill_grace();
                let _ = child.start_kill();
                guard.force_remove(grace).await;
                if timeout(grace, child.wait()).await.is_err() {
                    log::error!("Engine client for {name} did not exit within the grace period");
                }
                Ok(Captured {
                    timed_out: true,
                    elapsed: start.elapsed(),
                    ..Default::default()
                })
            }
        }
    }

    /// Runs a short engine query and returns its trimmed stdout
    async fn engine_output(&self, args: &[&str]) -> Result<String, String> {
        let output = Command::new(&self.config.engine)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        match timeout(ENGINE_QUERY_TIMEOUT, output).await {
            Ok(Ok(output)) if output.status.success() => {
                Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
            }
            Ok(Ok(output)) => Err(format!(
                "`{} {}` failed: {}",
                self.config.engine,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )),
            Ok(Err(e)) => Err(self.launch_error(e).to_string()),
            Err(_) => Err(format!(
                "`{} {}` timed out",
                self.config.engine,
                args.join(" ")
            )),
        }
    }

    fn launch_error(&self, e: io::Error) -> EngineError {
        let message = if e.kind() == io::ErrorKind::NotFound {
            format!("container engine `{}` not found", self.config.engine)
        } else {
            format!("failed to launch `{}`: {e}", self.config.engine)
        };
        log::error!("{message}");
        EngineError::RunnerUnavailable(message)
    }
}

#[async_trait]
impl SandboxRunner for ContainerRunner {
    async fn compile(&self, workspace: &Workspace) -> Result<CompileOutcome, EngineError> {
        let profile = workspace.profile();
        let Some(command) = profile.compile_command else {
            return Ok(CompileOutcome::skipped());
        };

        let name = self.container_name(workspace, Phase::Compile);
        let args = self.container_args(workspace, &name, Phase::Compile, command);
        let limit = self.config.compile_time_limit();
        let captured = self.execute(args, &name, None, limit).await?;

        if captured.timed_out {
            return Ok(CompileOutcome {
                success: false,
                stderr: format!(
                    "Compilation exceeded the time limit of {} ms",
                    limit.as_millis()
                ),
            });
        }

        let diagnostics = combine_output(&captured.stdout, &captured.stderr);
        match captured.exit_code {
            Some(ENGINE_FAILURE_EXIT | COMMAND_NOT_EXECUTABLE_EXIT | COMMAND_NOT_FOUND_EXIT) => {
                log::error!("Compile container {name} could not start: {diagnostics}");
                Err(EngineError::RunnerUnavailable(format!(
                    "{} toolchain unavailable: {diagnostics}",
                    profile.tag
                )))
            }
            Some(0) => {
                if let Some(artifact) = profile.artifact_name
                    && !workspace.build_dir().join(artifact).exists()
                {
                    return Ok(CompileOutcome {
                        success: false,
                        stderr: format!("Compiler exited successfully but produced no {artifact}"),
                    });
                }
                Ok(CompileOutcome {
                    success: true,
                    stderr: diagnostics,
                })
            }
            _ => Ok(CompileOutcome {
                success: false,
                stderr: diagnostics,
            }),
        }
    }

    async fn run(
        &self,
        workspace: &Workspace,
        input: &str,
        time_limit: Duration,
    ) -> Result<RunOutcome, EngineError> {
        let name = self.container_name(workspace, Phase::Run);
        let args = self.container_args(workspace, &name, Phase::Run, workspace.profile().run_command);
        let captured = self.execute(args, &name, Some(input), time_limit).await?;

        if captured.timed_out {
            return Ok(RunOutcome::timed_out(time_limit.as_millis() as u64));
        }

        let raw_stderr = String::from_utf8_lossy(&captured.stderr);
        let stderr = match strip_engine_preamble(&raw_stderr) {
            Some((preamble, program_stderr)) => {
                if !preamble.is_empty() {
                    log::debug!("Engine notices for {name}: {preamble}");
                }
                program_stderr
            }
            // The wrapper never started, so no program code ran
            None if matches!(
                captured.exit_code,
                Some(ENGINE_FAILURE_EXIT | COMMAND_NOT_EXECUTABLE_EXIT | COMMAND_NOT_FOUND_EXIT)
            ) =>
            {
                log::error!("Run container {name} could not start: {}", raw_stderr.trim());
                return Err(EngineError::RunnerUnavailable(raw_stderr.trim().to_string()));
            }
            None => raw_stderr.as_ref(),
        };

        let (stderr, _) = split_meta(stderr);
        let (_, peak_bytes) = split_meta(&String::from_utf8_lossy(&captured.stderr_tail));
        Ok(RunOutcome {
            stdout: String::from_utf8_lossy(&captured.stdout).into_owned(),
            stderr: stderr.to_string(),
            exit_code: captured.exit_code,
            timed_out: false,
            output_truncated: captured.truncated,
            execution_time_ms: captured.elapsed.as_millis() as u64,
            memory_used_mb: peak_bytes.map(bytes_to_mb).unwrap_or(0.0),
        })
    }

    async fn sweep_stale(&self, active: &HashSet<String>, policy: &SweepPolicy) -> StaleSweep {
        let mut report = StaleSweep::default();
        let filter = format!("label={MANAGED_LABEL}");
        let format = format!("{{{{.Names}}}}\t{{{{.Label \"{WORKSPACE_LABEL}\"}}}}\t{{{{.CreatedAt}}}}");

        match self
            .engine_output(&["ps", "--all", "--filter", &filter, "--format", &format])
            .await
        {
            Ok(listing) => {
                let now = Utc::now();
                for entry in listing.lines().filter_map(parse_container_line) {
                    if active.contains(&entry.workspace) {
                        continue;
                    }
                    let old_enough = entry
                        .created
                        .and_then(|created| (now - created).to_std().ok())
                        .is_some_and(|age| age >= policy.container_retention);
                    if !old_enough {
                        continue;
                    }
                    match self.engine_output(&["rm", "--force", &entry.name]).await {
                        Ok(_) => report.containers_removed += 1,
                        Err(e) => report.errors.push(e),
                    }
                }
            }
            Err(e) => report.errors.push(e),
        }

        if let Some(retention) = policy.image_retention {
            let until = format!("until={}h", retention.as_secs() / 3600);
            match self
                .engine_output(&["image", "prune", "--force", "--filter", &until])
                .await
            {
                Ok(_) => report.images_pruned = true,
                Err(e) => report.errors.push(e),
            }
        }

        report
    }
}

/// Force-removes a named container unless it finished on its own
struct ContainerGuard {
    engine: String,
    name: String,
    armed: bool,
}

impl ContainerGuard {
    fn new(engine: &str, name: &str) -> Self {
        Self {
            engine: engine.to_string(),
            name: name.to_string(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }

    async fn force_remove(&mut self, grace: Duration) {
        self.armed = false;
        let removal = Command::new(&self.engine)
            .args(["rm", "--force", &self.name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();
        match timeout(grace, removal).await {
            Ok(Ok(status)) if status.success() => {
                log::info!("Force-removed container {}", self.name)
            }
            Ok(Ok(status)) => log::warn!("Removing container {} exited with {status}", self.name),
            Ok(Err(e)) => log::warn!("Failed to remove container {}: {e}", self.name),
            Err(_) => log::warn!("Removing container {} timed out", self.name),
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Reached when the request future is dropped mid-run
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            log::warn!("Container {} may be orphaned: no runtime to remove it", self.name);
            return;
        };
        let engine = std::mem::take(&mut self.engine);
        let name = std::mem::take(&mut self.name);
        handle.spawn(async move {
            let status = Command::new(&engine)
                .args(["rm", "--force", &name])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            if let Err(e) = status {
                log::warn!("Failed to remove abandoned container {name}: {e}");
            }
        });
    }
}

/// What was read from one output stream
#[derive(Debug, Default)]
struct Drained {
    /// The first `cap` bytes
    kept: Vec<u8>,
    /// The last [`STDERR_TAIL`] bytes, whether or not they were kept
    tail: Vec<u8>,
    truncated: bool,
}

/// Reads a stream to the end, keeping at most `cap` bytes plus a short tail
///
/// Bytes beyond the cap are drained and dropped so the writer never blocks.
async fn read_capped<R>(reader: Option<R>, cap: usize) -> Drained
where
    R: AsyncRead + Unpin,
{
    let mut drained = Drained::default();
    let Some(mut reader) = reader else {
        return drained;
    };

    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let room = cap.saturating_sub(drained.kept.len());
                if n > room {
                    drained.truncated = true;
                }
                drained.kept.extend_from_slice(&chunk[..n.min(room)]);

                drained.tail.extend_from_slice(&chunk[..n]);
                let excess = drained.tail.len().saturating_sub(STDERR_TAIL);
                drained.tail.drain(..excess);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::debug!("Stopped reading child output: {e}");
                break;
            }
        }
    }
    drained
}

fn combine_output(stdout: &[u8], stderr: &[u8]) -> String {
    let stdout = String::from_utf8_lossy(stdout);
    let stderr = String::from_utf8_lossy(stderr);
    match (stdout.trim(), stderr.trim()) {
        ("", err) => err.to_string(),
        (out, "") => out.to_string(),
        (out, err) => format!("{out}\n{err}"),
    }
}

/// Splits stderr into what the engine client printed before the wrapper started
/// and what came after
///
/// `None` means the start marker never appeared.
fn strip_engine_preamble(stderr: &str) -> Option<(&str, &str)> {
    let pos = stderr.find(START_MARKER)?;
    let rest = &stderr[pos + START_MARKER.len()..];
    Some((stderr[..pos].trim(), rest.strip_prefix('\n').unwrap_or(rest)))
}

/// Splits the wrapper's trailing meta line off stderr
///
/// Only the last marker counts; a program printing a fake one can at most skew its
/// own memory figure.
fn split_meta(stderr: &str) -> (&str, Option<u64>) {
    let Some(pos) = stderr.rfind(META_MARKER) else {
        return (stderr.trim(), None);
    };
    let peak = stderr[pos + META_MARKER.len()..]
        .split_whitespace()
        .next()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|&bytes| bytes > 0);
    (stderr[..pos].trim(), peak)
}

fn bytes_to_mb(bytes: u64) -> f64 {
    let mb = bytes as f64 / (1024.0 * 1024.0);
    (mb * 100.0).round() / 100.0
}

#[derive(Debug, PartialEq)]
struct ContainerEntry {
    name: String,
    workspace: String,
    created: Option<DateTime<Utc>>,
}

/// Parses one `name\tworkspace\tcreated` line of the container listing
fn parse_container_line(line: &str) -> Option<ContainerEntry> {
    let mut fields = line.split('\t');
    let name = fields.next()?.trim();
    let workspace = fields.next()?.trim();
    let created = fields.next().and_then(parse_engine_timestamp);
    if name.is_empty() || workspace.is_empty() {
        return None;
    }
    Some(ContainerEntry {
        name: name.to_string(),
        workspace: workspace.to_string(),
        created,
    })
}

/// Parses `2024-05-01 10:11:12 +0000 UTC`, with optional fractional seconds
fn parse_engine_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let stamp: Vec<&str> = raw.split_whitespace().take(3).collect();
    DateTime::parse_from_str(&stamp.join(" "), "%Y-%m-%d %H:%M:%S%.f %z")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
