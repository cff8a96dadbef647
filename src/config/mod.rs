use std::env;
use std::path::PathBuf;

/// Configuration for the external spreadsheet converter and the upload surface
#[derive(Debug, Clone)]
pub struct ConverterConfig {
    /// Converter executable, resolved through PATH when not absolute (default: "soffice")
    pub soffice_path: String,

    /// Extra arguments placed before the conversion arguments (default: none)
    pub soffice_extra_args: Vec<String>,

    /// Upper bound on a single converter run in seconds, 0 disables it (default: 300)
    pub timeout_secs: u64,

    /// Root under which per-request workspaces are created (default: OS temp dir)
    pub temp_dir: PathBuf,

    /// Maximum upload size in bytes (default: 50 MB)
    pub max_file_size: usize,

    /// Give every converter run its own user profile inside the workspace (default: false)
    pub isolated_profile: bool,

    /// Allowed CORS Origins (comma separated)
    pub allowed_origins: Vec<String>,

    /// How long a converter availability check is reused, 0 checks every time (default: 60)
    pub health_cache_secs: u64,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            soffice_path: "soffice".to_string(),
            soffice_extra_args: Vec::new(),
            timeout_secs: 300,
            temp_dir: env::temp_dir(),
            max_file_size: 50 * 1024 * 1024, // 50 MB
            isolated_profile: false,
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://127.0.0.1:3000".to_string(),
            ],
            health_cache_secs: 60,
        }
    }
}

impl ConverterConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            soffice_path: env::var("SOFFICE_PATH")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(default.soffice_path),

            soffice_extra_args: env::var("SOFFICE_EXTRA_ARGS")
                .map(|v| v.split_whitespace().map(str::to_string).collect())
                .unwrap_or(default.soffice_extra_args),

            timeout_secs: env::var("CONVERTER_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.timeout_secs),

            temp_dir: env::var("CONVERT_TEMP_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(default.temp_dir),

            max_file_size: env::var("MAX_FILE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_file_size),

            isolated_profile: env::var("SOFFICE_ISOLATED_PROFILE")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(default.isolated_profile),

            allowed_origins: env::var("ALLOWED_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or(default.allowed_origins),

            health_cache_secs: env::var("HEALTH_CACHE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.health_cache_secs),
        }
    }

    /// Create config for development (short timeout, shared profile)
    pub fn development() -> Self {
        Self {
            timeout_secs: 60,
            ..Self::default()
        }
    }

    /// Create config for production (isolated profiles so parallel runs don't clash)
    pub fn production() -> Self {
        Self {
            soffice_path: env::var("SOFFICE_PATH").unwrap_or_else(|_| "soffice".to_string()),
            isolated_profile: true,
            ..Self::default()
        }
    }

    /// Converter timeout, `None` when disabled
    pub fn timeout(&self) -> Option<std::time::Duration> {
        (self.timeout_secs > 0).then(|| std::time::Duration::from_secs(self.timeout_secs))
    }

    pub fn health_cache_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.health_cache_secs)
    }
}
