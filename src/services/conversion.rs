use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::ConverterConfig;
use crate::models::{ConversionRequest, ConvertedFile, Pipeline, SourceFormat, TargetFormat};
use crate::services::converter::{ConversionJob, ConverterError, DocumentConverter};
use crate::services::workspace::ConversionWorkspace;
use crate::utils::validation::{ValidationError, output_base_name, validate_upload};

/// Suffix marking the output of the XLSX round-trip
const CLEANED_SUFFIX: &str = "_nettoye";

/// Which converter run a failure belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionStep {
    Direct(TargetFormat),
    Intermediate,
    Final,
}

impl ConversionStep {
    fn missing_output_message(&self) -> String {
        match self {
            Self::Direct(target) => format!("Conversion to {} failed: no output was produced.", target),
            Self::Intermediate => "Round-trip failed: intermediate ODS was not produced.".to_string(),
            Self::Final => "Round-trip failed: final XLSX was not produced.".to_string(),
        }
    }
}

impl std::fmt::Display for ConversionStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct(target) => write!(f, "conversion to {}", target),
            Self::Intermediate => f.write_str("intermediate ODS conversion"),
            Self::Final => f.write_str("final XLSX conversion"),
        }
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    code.map_or_else(|| "killed by signal".to_string(), |c| format!("exit code {}", c))
}

#[derive(Error, Debug)]
pub enum ConversionError {
    #[error("{}", .0.message)]
    Validation(#[from] ValidationError),

    #[error("{}", .step.missing_output_message())]
    OutputMissing { step: ConversionStep },

    #[error("Converter failed during {step} ({}): {stderr}", describe_exit(.exit_code))]
    ConverterFailed {
        step: ConversionStep,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Converter timed out after {secs}s during {step}")]
    TimedOut { step: ConversionStep, secs: u64 },

    #[error("Failed to start converter '{program}'")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error during conversion")]
    Io(#[from] std::io::Error),
}

/// Runs uploads through the external converter inside throwaway workspaces
pub struct ConversionService {
    converter: Arc<dyn DocumentConverter>,
    config: ConverterConfig,
    /// Last availability check and when it ran
    health: tokio::sync::Mutex<Option<(Instant, bool)>>,
}

impl ConversionService {
    pub fn new(converter: Arc<dyn DocumentConverter>, config: ConverterConfig) -> Self {
        Self {
            converter,
            config,
            health: tokio::sync::Mutex::new(None),
        }
    }

    /// Whether the converter can be started.
    ///
    /// The check launches the converter, so its result is reused for
    /// `health_cache_secs`. Concurrent callers wait for a single check.
    pub async fn converter_available(&self) -> bool {
        let mut cached = self.health.lock().await;
        if let Some((checked_at, available)) = *cached {
            if checked_at.elapsed() < self.config.health_cache_ttl() {
                return available;
            }
        }

        let available = self.converter.health_check().await;
        *cached = Some((Instant::now(), available));
        available
    }

    /// Validate an upload, convert it and return the result.
    ///
    /// Nothing touches the filesystem until validation has passed. Once a
    /// workspace exists it is removed before this returns, whatever the outcome.
    pub async fn submit(&self, request: ConversionRequest) -> Result<ConvertedFile, ConversionError> {
        let (data, source, target) = validate_upload(
            request.content.as_deref(),
            &request.filename,
            request.format.as_deref(),
        )?;

        let pipeline = Pipeline::select(source, target);
        let base_name = output_base_name(&request.filename);
        info!(
            "Converting '{}' ({} bytes) via {} pipeline",
            request.filename,
            data.len(),
            pipeline
        );

        let started = Instant::now();
        let workspace = ConversionWorkspace::create(&self.config.temp_dir)?;
        let result = self.run_pipeline(&workspace, data, source, pipeline).await;
        workspace.cleanup().await;
        let output = result?;

        let filename = match pipeline {
            Pipeline::Direct(target) => format!("{}.{}", base_name, target.extension()),
            Pipeline::RoundTrip => format!("{}{}.xlsx", base_name, CLEANED_SUFFIX),
        };

        info!(
            "Converted '{}' -> '{}' ({} bytes) in {:?}",
            request.filename,
            filename,
            output.len(),
            started.elapsed()
        );

        Ok(ConvertedFile {
            data: output,
            filename,
            content_type: pipeline.target().mime_type(),
        })
    }

    async fn run_pipeline(
        &self,
        workspace: &ConversionWorkspace,
        data: &[u8],
        source: SourceFormat,
        pipeline: Pipeline,
    ) -> Result<Vec<u8>, ConversionError> {
        let staged = workspace.stage_input(data, source).await?;

        let output = match pipeline {
            Pipeline::Direct(target) => {
                self.run_step(workspace, 1, &staged, target, ConversionStep::Direct(target))
                    .await?
            }
            Pipeline::RoundTrip => {
                let intermediate = self
                    .run_step(
                        workspace,
                        1,
                        &staged,
                        TargetFormat::Ods,
                        ConversionStep::Intermediate,
                    )
                    .await?;
                self.run_step(
                    workspace,
                    2,
                    &intermediate,
                    TargetFormat::Xlsx,
                    ConversionStep::Final,
                )
                .await?
            }
        };

        Ok(tokio::fs::read(&output).await?)
    }

    /// One converter run into its own step directory; returns the produced file
    async fn run_step(
        &self,
        workspace: &ConversionWorkspace,
        index: usize,
        input: &Path,
        format: TargetFormat,
        step: ConversionStep,
    ) -> Result<PathBuf, ConversionError> {
        let job = ConversionJob {
            input: input.to_path_buf(),
            out_dir: workspace.step_dir(index).await?,
            format,
            profile_dir: self
                .config
                .isolated_profile
                .then(|| workspace.profile_dir()),
        };

        let outcome = match self.converter.convert(&job).await {
            Ok(outcome) => outcome,
            Err(ConverterError::TimedOut(limit)) => {
                warn!("Converter timed out after {:?} during {}", limit, step);
                return Err(ConversionError::TimedOut {
                    step,
                    secs: limit.as_secs(),
                });
            }
            Err(ConverterError::Spawn { program, source }) => {
                return Err(ConversionError::Spawn { program, source });
            }
            Err(ConverterError::Io(e)) => return Err(e.into()),
        };

        if !outcome.success {
            warn!(
                "Converter exited unsuccessfully during {} ({}) after {:?}",
                step,
                describe_exit(&outcome.exit_code),
                outcome.elapsed
            );
            return Err(ConversionError::ConverterFailed {
                step,
                exit_code: outcome.exit_code,
                stderr: outcome.stderr_tail().to_string(),
            });
        }

        let expected = job.expected_output();
        let produced = tokio::fs::metadata(&expected)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if !produced {
            warn!(
                "Converter reported success for {} but {} is missing",
                step,
                expected.display()
            );
            return Err(ConversionError::OutputMissing { step });
        }

        Ok(expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ODS_MIME_TYPE, XLSX_MIME_TYPE};
    use crate::services::converter::ConverterOutcome;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Clone, Copy)]
    enum Behaviour {
        /// Copy the input to the expected output and exit 0
        Copy,
        /// Exit 0 without writing anything on the given (1-based) call
        SkipOutputOnCall(usize),
        /// Exit with a code and stderr message
        Exit(i32),
        TimeOut,
    }

    struct ScriptedConverter {
        behaviour: Behaviour,
        calls: Mutex<Vec<ConversionJob>>,
        health_checks: AtomicUsize,
    }

    impl ScriptedConverter {
        fn new(behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                behaviour,
                calls: Mutex::new(Vec::new()),
                health_checks: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> Vec<ConversionJob> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DocumentConverter for ScriptedConverter {
        async fn convert(&self, job: &ConversionJob) -> Result<ConverterOutcome, ConverterError> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(job.clone());
                calls.len()
            };

            let ok = ConverterOutcome {
                exit_code: Some(0),
                success: true,
                stderr: String::new(),
                elapsed: Duration::from_millis(5),
            };

            match self.behaviour {
                Behaviour::Copy => {
                    let mut data = std::fs::read(&job.input)?;
                    data.extend_from_slice(format!("|{}", job.format).as_bytes());
                    std::fs::write(job.expected_output(), data)?;
                    Ok(ok)
                }
                Behaviour::SkipOutputOnCall(n) => {
                    if call != n {
                        std::fs::copy(&job.input, job.expected_output())?;
                    }
                    Ok(ok)
                }
                Behaviour::Exit(code) => Ok(ConverterOutcome {
                    exit_code: Some(code),
                    success: false,
                    stderr: "Error: source file could not be loaded".to_string(),
                    ..ok
                }),
                Behaviour::TimeOut => Err(ConverterError::TimedOut(Duration::from_secs(7))),
            }
        }

        async fn health_check(&self) -> bool {
            self.health_checks.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    fn service(converter: Arc<ScriptedConverter>, root: &Path) -> ConversionService {
        let config = ConverterConfig {
            temp_dir: root.to_path_buf(),
            ..ConverterConfig::default()
        };
        ConversionService::new(converter, config)
    }

    fn request(filename: &str, format: &str, content: &'static [u8]) -> ConversionRequest {
        ConversionRequest {
            content: Some(Bytes::from_static(content)),
            filename: filename.to_string(),
            format: Some(format.to_string()),
        }
    }

    fn is_empty_dir(path: &Path) -> bool {
        std::fs::read_dir(path).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn test_direct_ods_to_xlsx() {
        let root = tempfile::tempdir().unwrap();
        let converter = ScriptedConverter::new(Behaviour::Copy);
        let service = service(converter.clone(), root.path());

        let converted = service
            .submit(request("budget.ods", "xlsx", b"ods-bytes"))
            .await
            .unwrap();

        assert_eq!(converted.filename, "budget.xlsx");
        assert_eq!(converted.content_type, XLSX_MIME_TYPE);
        assert_eq!(converted.data, b"ods-bytes|xlsx");

        let calls = converter.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].format, TargetFormat::Xlsx);
        assert_eq!(calls[0].input.extension().unwrap(), "ods");
        assert!(calls[0].profile_dir.is_none());
        assert!(is_empty_dir(root.path()));
    }

    #[tokio::test]
    async fn test_direct_xlsx_to_ods() {
        let root = tempfile::tempdir().unwrap();
        let converter = ScriptedConverter::new(Behaviour::Copy);
        let service = service(converter.clone(), root.path());

        let converted = service
            .submit(request("Report.XLSX", "ODS", b"xlsx-bytes"))
            .await
            .unwrap();

        assert_eq!(converted.filename, "Report.ods");
        assert_eq!(converted.content_type, ODS_MIME_TYPE);
        assert_eq!(converter.calls().len(), 1);
        assert!(is_empty_dir(root.path()));
    }

    #[tokio::test]
    async fn test_round_trip_xlsx_to_xlsx() {
        let root = tempfile::tempdir().unwrap();
        let converter = ScriptedConverter::new(Behaviour::Copy);
        let service = service(converter.clone(), root.path());

        let converted = service
            .submit(request("ventes.xlsx", "xlsx", b"raw"))
            .await
            .unwrap();

        assert_eq!(converted.filename, "ventes_nettoye.xlsx");
        assert_eq!(converted.content_type, XLSX_MIME_TYPE);
        assert_eq!(converted.data, b"raw|ods|xlsx");

        let calls = converter.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].format, TargetFormat::Ods);
        assert_eq!(calls[1].format, TargetFormat::Xlsx);
        assert_eq!(calls[1].input, calls[0].expected_output());
        assert_ne!(calls[1].expected_output(), calls[0].input);
        assert!(is_empty_dir(root.path()));
    }

    #[tokio::test]
    async fn test_xls_to_xlsx_is_direct() {
        let root = tempfile::tempdir().unwrap();
        let converter = ScriptedConverter::new(Behaviour::Copy);
        let service = service(converter.clone(), root.path());

        let converted = service
            .submit(request("legacy.xls", "xlsx", b"biff"))
            .await
            .unwrap();

        assert_eq!(converted.filename, "legacy.xlsx");
        assert_eq!(converter.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_validation_never_touches_disk_or_converter() {
        let root = tempfile::tempdir().unwrap();
        let untouched = root.path().join("never-created");
        let converter = ScriptedConverter::new(Behaviour::Copy);
        let service = service(converter.clone(), &untouched);

        let cases = [
            request("a.xlsx", "pdf", b"x"),
            request("a.xlsx", "", b"x"),
            request("a.csv", "xlsx", b"x"),
            request("a", "ods", b"x"),
            request("a.xlsx", "xlsx", b""),
            ConversionRequest::default(),
        ];

        for case in cases {
            let err = service.submit(case).await.unwrap_err();
            assert!(matches!(err, ConversionError::Validation(_)), "{:?}", err);
        }

        assert!(converter.calls().is_empty());
        assert!(!untouched.exists());
    }

    #[tokio::test]
    async fn test_missing_intermediate_output() {
        let root = tempfile::tempdir().unwrap();
        let converter = ScriptedConverter::new(Behaviour::SkipOutputOnCall(1));
        let service = service(converter.clone(), root.path());

        let err = service
            .submit(request("a.xlsx", "xlsx", b"x"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ConversionError::OutputMissing {
                step: ConversionStep::Intermediate
            }
        ));
        assert!(err.to_string().contains("intermediate ODS"));
        assert_eq!(converter.calls().len(), 1);
        assert!(is_empty_dir(root.path()));
    }

    #[tokio::test]
    async fn test_missing_final_output() {
        let root = tempfile::tempdir().unwrap();
        let converter = ScriptedConverter::new(Behaviour::SkipOutputOnCall(2));
        let service = service(converter.clone(), root.path());

        let err = service
            .submit(request("a.xlsx", "xlsx", b"x"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ConversionError::OutputMissing {
                step: ConversionStep::Final
            }
        ));
        assert!(err.to_string().contains("final XLSX"));
        assert!(is_empty_dir(root.path()));
    }

    #[tokio::test]
    async fn test_missing_direct_output_names_format() {
        let root = tempfile::tempdir().unwrap();
        let converter = ScriptedConverter::new(Behaviour::SkipOutputOnCall(1));
        let service = service(converter, root.path());

        let err = service
            .submit(request("a.ods", "xlsx", b"x"))
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "Conversion to xlsx failed: no output was produced."
        );
        assert!(is_empty_dir(root.path()));
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_stderr() {
        let root = tempfile::tempdir().unwrap();
        let converter = ScriptedConverter::new(Behaviour::Exit(81));
        let service = service(converter, root.path());

        let err = service
            .submit(request("a.ods", "xlsx", b"x"))
            .await
            .unwrap_err();

        match &err {
            ConversionError::ConverterFailed {
                step,
                exit_code,
                stderr,
            } => {
                assert_eq!(*step, ConversionStep::Direct(TargetFormat::Xlsx));
                assert_eq!(*exit_code, Some(81));
                assert!(stderr.contains("could not be loaded"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(err.to_string().contains("exit code 81"));
        assert!(is_empty_dir(root.path()));
    }

    #[tokio::test]
    async fn test_timeout_is_reported_per_step() {
        let root = tempfile::tempdir().unwrap();
        let converter = ScriptedConverter::new(Behaviour::TimeOut);
        let service = service(converter, root.path());

        let err = service
            .submit(request("a.xlsx", "xlsx", b"x"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ConversionError::TimedOut {
                step: ConversionStep::Intermediate,
                secs: 7
            }
        ));
        assert!(is_empty_dir(root.path()));
    }

    #[tokio::test]
    async fn test_isolated_profile_lives_in_workspace() {
        let root = tempfile::tempdir().unwrap();
        let converter = ScriptedConverter::new(Behaviour::Copy);
        let config = ConverterConfig {
            temp_dir: root.path().to_path_buf(),
            isolated_profile: true,
            ..ConverterConfig::default()
        };
        let service = ConversionService::new(converter.clone(), config);

        service
            .submit(request("a.xlsx", "xlsx", b"x"))
            .await
            .unwrap();

        for job in converter.calls() {
            let profile = job.profile_dir.expect("profile dir");
            assert!(profile.starts_with(root.path()));
        }
    }

    #[tokio::test]
    async fn test_concurrent_submissions_do_not_collide() {
        let root = tempfile::tempdir().unwrap();
        let converter = ScriptedConverter::new(Behaviour::Copy);
        let service = Arc::new(service(converter.clone(), root.path()));

        let mut handles = Vec::new();
        for i in 0..8 {
            let service = service.clone();
            handles.push(tokio::spawn(async move {
                let content: &'static [u8] = if i % 2 == 0 { b"even" } else { b"odd" };
                service
                    .submit(request(&format!("sheet{}.ods", i), "xlsx", content))
                    .await
            }));
        }

        for (i, handle) in handles.into_iter().enumerate() {
            let converted = handle.await.unwrap().unwrap();
            assert_eq!(converted.filename, format!("sheet{}.xlsx", i));
            let expected: &[u8] = if i % 2 == 0 { b"even|xlsx" } else { b"odd|xlsx" };
            assert_eq!(converted.data, expected);
        }

        let mut inputs: Vec<PathBuf> = converter.calls().into_iter().map(|j| j.input).collect();
        inputs.sort();
        inputs.dedup();
        assert_eq!(inputs.len(), 8);
        assert!(is_empty_dir(root.path()));
    }

    #[tokio::test]
    async fn test_health_check_is_cached() {
        let root = tempfile::tempdir().unwrap();
        let converter = ScriptedConverter::new(Behaviour::Copy);
        let service = service(converter.clone(), root.path());

        for _ in 0..3 {
            assert!(service.converter_available().await);
        }
        assert_eq!(converter.health_checks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_health_check_uncached_with_zero_ttl() {
        let root = tempfile::tempdir().unwrap();
        let converter = ScriptedConverter::new(Behaviour::Copy);
        let config = ConverterConfig {
            temp_dir: root.path().to_path_buf(),
            health_cache_secs: 0,
            ..ConverterConfig::default()
        };
        let service = ConversionService::new(converter.clone(), config);

        service.converter_available().await;
        service.converter_available().await;
        assert_eq!(converter.health_checks.load(Ordering::SeqCst), 2);
    }
}
