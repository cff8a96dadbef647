use async_trait::async_trait;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};

use crate::config::ConverterConfig;
use crate::models::TargetFormat;

/// Characters escaped when a profile directory is turned into a `file://` URL
const FILE_URL_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'?')
    .add(b'<')
    .add(b'>');

/// Longest stderr excerpt carried into error messages
const STDERR_TAIL_LEN: usize = 512;

/// Upper bound on a `--version` check
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// One converter run: convert `input` into `format`, writing into `out_dir`
#[derive(Debug, Clone)]
pub struct ConversionJob {
    pub input: PathBuf,
    pub out_dir: PathBuf,
    pub format: TargetFormat,
    /// Private user profile for this run, if any
    pub profile_dir: Option<PathBuf>,
}

impl ConversionJob {
    /// Where the converter is expected to write its result:
    /// `<out_dir>/<input-stem>.<format>`
    pub fn expected_output(&self) -> PathBuf {
        let stem = self.input.file_stem().unwrap_or_default();
        let mut name = stem.to_os_string();
        name.push(".");
        name.push(self.format.extension());
        self.out_dir.join(name)
    }
}

/// Structured result of a finished converter process
#[derive(Debug, Clone)]
pub struct ConverterOutcome {
    pub exit_code: Option<i32>,
    pub success: bool,
    pub stderr: String,
    pub elapsed: Duration,
}

impl ConverterOutcome {
    /// Last few hundred characters of stderr, enough to explain a failure
    pub fn stderr_tail(&self) -> &str {
        let trimmed = self.stderr.trim();
        if trimmed.len() <= STDERR_TAIL_LEN {
            return trimmed;
        }
        let mut start = trimmed.len() - STDERR_TAIL_LEN;
        while !trimmed.is_char_boundary(start) {
            start += 1;
        }
        &trimmed[start..]
    }
}

#[derive(Error, Debug)]
pub enum ConverterError {
    #[error("Failed to start converter '{program}'")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Converter I/O error")]
    Io(#[from] std::io::Error),

    #[error("Converter timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
}

/// Trait for external document converters
#[async_trait]
pub trait DocumentConverter: Send + Sync {
    /// Run one conversion and report how the process ended.
    /// A non-zero exit is an `Ok` outcome; only failing to run at all is an error.
    async fn convert(&self, job: &ConversionJob) -> Result<ConverterOutcome, ConverterError>;

    /// Check if the converter is installed and runnable
    async fn health_check(&self) -> bool;
}

/// Headless LibreOffice (`soffice`) driven through its command line
pub struct SofficeConverter {
    program: String,
    leading_args: Vec<OsString>,
    timeout: Option<Duration>,
}

impl SofficeConverter {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
            timeout: None,
        }
    }

    pub fn from_config(config: &ConverterConfig) -> Self {
        Self::new(config.soffice_path.clone())
            .with_leading_args(config.soffice_extra_args.iter().map(OsString::from))
            .with_timeout(config.timeout())
    }

    /// Arguments placed before the conversion arguments on every run
    pub fn with_leading_args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<OsString>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// `[leading...] [-env:UserInstallation=...] --headless --convert-to <fmt> --outdir <dir> <input>`
    pub fn build_args(&self, job: &ConversionJob) -> Vec<OsString> {
        let mut args = self.leading_args.clone();
        if let Some(profile) = &job.profile_dir {
            args.push(OsString::from(format!(
                "-env:UserInstallation={}",
                file_url(profile)
            )));
        }
        args.push("--headless".into());
        args.push("--convert-to".into());
        args.push(job.format.extension().into());
        args.push("--outdir".into());
        args.push(job.out_dir.clone().into_os_string());
        args.push(job.input.clone().into_os_string());
        args
    }
}

fn file_url(path: &Path) -> String {
    let path = path.to_string_lossy().replace('\\', "/");
    let encoded = utf8_percent_encode(&path, FILE_URL_SET).to_string();
    if encoded.starts_with('/') {
        format!("file://{}", encoded)
    } else {
        format!("file:///{}", encoded)
    }
}

/// Drain a child pipe to the end so the process never blocks on a full buffer
async fn read_stream<R: AsyncRead + Unpin>(stream: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    if let Some(mut reader) = stream {
        reader.read_to_end(&mut buffer).await?;
    }
    Ok(buffer)
}

/// A running converter that leads its own process group.
///
/// `soffice` is a launcher that hands the document to worker processes, so
/// killing the direct child alone leaves the worker running. Dropping a
/// process that was not [`finish`](Self::finish)ed kills the whole group.
struct ConverterProcess {
    child: Child,
    pgid: Option<u32>,
}

impl ConverterProcess {
    fn spawn(command: &mut Command) -> std::io::Result<Self> {
        #[cfg(unix)]
        command.process_group(0);
        let child = command.kill_on_drop(true).spawn()?;
        let pgid = child.id();
        Ok(Self { child, pgid })
    }

    /// The run ended on its own; leave the group alone
    fn finish(&mut self) {
        self.pgid = None;
    }

    #[cfg(unix)]
    fn kill_group(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        let Ok(pgid) = libc::pid_t::try_from(pgid) else {
            return;
        };
        // SAFETY: killpg only sends a signal. The leader is our unreaped child,
        // so the group id cannot have been recycled.
        if unsafe { libc::killpg(pgid, libc::SIGKILL) } != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                tracing::warn!("Failed to kill converter process group {}: {}", pgid, err);
            }
        }
    }

    #[cfg(not(unix))]
    fn kill_group(&mut self) {
        self.pgid = None;
    }

    /// Kill the group, then the leader, and reap it
    async fn terminate(&mut self) {
        self.kill_group();
        if let Err(e) = self.child.kill().await {
            tracing::warn!("Failed to kill converter: {}", e);
        }
    }
}

impl Drop for ConverterProcess {
    fn drop(&mut self) {
        self.kill_group();
    }
}

#[async_trait]
impl DocumentConverter for SofficeConverter {
    async fn convert(&self, job: &ConversionJob) -> Result<ConverterOutcome, ConverterError> {
        let args = self.build_args(job);
        tracing::debug!(
            program = %self.program,
            args = ?args,
            "Starting converter"
        );

        let started = Instant::now();
        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut process =
            ConverterProcess::spawn(&mut command).map_err(|source| ConverterError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let stdout = process.child.stdout.take();
        let stderr = process.child.stderr.take();

        let run = async {
            let (stdout, stderr, status) = tokio::join!(
                read_stream(stdout),
                read_stream(stderr),
                process.child.wait()
            );
            Ok::<_, std::io::Error>((stdout?, stderr?, status?))
        };

        let finished = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result,
                Err(_) => {
                    process.terminate().await;
                    return Err(ConverterError::TimedOut(limit));
                }
            },
            None => run.await,
        };
        process.finish();
        let (stdout, stderr, status) = finished?;

        let outcome = ConverterOutcome {
            exit_code: status.code(),
            success: status.success(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            elapsed: started.elapsed(),
        };

        tracing::debug!(
            exit_code = ?outcome.exit_code,
            stdout_bytes = stdout.len(),
            stderr_bytes = stderr.len(),
            elapsed = ?outcome.elapsed,
            "Converter finished"
        );

        Ok(outcome)
    }

    async fn health_check(&self) -> bool {
        let mut command = Command::new(&self.program);
        command
            .args(&self.leading_args)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let mut process = match ConverterProcess::spawn(&mut command) {
            Ok(process) => process,
            Err(e) => {
                tracing::debug!("Converter health check failed to start: {}", e);
                return false;
            }
        };

        match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, process.child.wait()).await {
            Ok(Ok(status)) => {
                process.finish();
                status.success()
            }
            Ok(Err(e)) => {
                tracing::debug!("Converter health check failed: {}", e);
                false
            }
            Err(_) => {
                process.terminate().await;
                false
            }
        }
    }
}
