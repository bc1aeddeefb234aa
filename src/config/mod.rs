//! Configuration loading
//!
//! Settings are read once at startup. An optional JSON5 file (given with
//! `--config` or `FILEINFO_CONFIG`) is loaded first; environment variables
//! override individual keys.
//!
//! | key | env |
//! |---|---|
//! | `maxFileSize` | `MAX_FILE_SIZE` |
//! | `exiftoolBin` | `EXIFTOOL_BIN_PATH` |
//! | `ffprobeBin` | `FFPROBE_BIN_PATH` |
//! | `toolTimeoutMs` | `TOOL_TIMEOUT_MS` |
//! | `fetchTimeoutMs` | `FETCH_TIMEOUT_MS` |
//! | `logGroup` | `LOG_GROUP` |
//! | `aws.region` | `AWS_REGION`, `AWS_DEFAULT_REGION` |
//! | `aws.accessKeyId` | `AWS_ACCESS_KEY_ID` |
//! | `aws.secretAccessKey` | `AWS_SECRET_ACCESS_KEY` |
//! | `aws.sessionToken` | `AWS_SESSION_TOKEN` |
//! | `aws.endpoint` | `CLOUDWATCH_LOGS_ENDPOINT` |
//! | `bind` | `FILEINFO_BIND` |
//! | `logFormat` | `LOG_FORMAT` |
//! | `logLevel` | `LOG_LEVEL` |

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::logging::{LogConfig, LogFormat};
use crate::media::analyzers::DEFAULT_TOOL_TIMEOUT_MS;
use crate::media::{FetchConfig, ToolchainConfig, DEFAULT_FETCH_TIMEOUT_MS, DEFAULT_MAX_FILE_SIZE};
use crate::usage::{AwsCredentials, CloudWatchConfig, DEFAULT_LOG_GROUP};

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "FILEINFO_CONFIG";

pub const DEFAULT_BIND: &str = "127.0.0.1:8080";
pub const DEFAULT_REGION: &str = "us-east-1";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {message}")]
    Read { path: String, message: String },

    #[error("Failed to parse JSON5 at {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
}

/// On-disk shape. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileConfig {
    pub max_file_size: Option<u64>,
    pub exiftool_bin: Option<String>,
    pub ffprobe_bin: Option<String>,
    pub tool_timeout_ms: Option<u64>,
    pub fetch_timeout_ms: Option<u64>,
    pub log_group: Option<String>,
    pub aws: AwsFileConfig,
    pub bind: Option<String>,
    pub log_format: Option<String>,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AwsFileConfig {
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    pub endpoint: Option<String>,
}

/// Resolved configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub max_file_size: u64,
    pub exiftool_bin: PathBuf,
    pub ffprobe_bin: PathBuf,
    pub tool_timeout: Duration,
    pub fetch_timeout: Duration,
    pub log_group: String,
    pub cloudwatch: CloudWatchConfig,
    pub bind: SocketAddr,
    pub logging: LogConfig,
    /// Problems that fell back to defaults; logged once logging is up.
    pub warnings: Vec<String>,
}

impl AppConfig {
    /// Load from `path` (or `FILEINFO_CONFIG`) plus the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from);
        let file = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => read_file_config(&path)?,
            None => FileConfig::default(),
        };
        Self::resolve(file, |key| std::env::var(key).ok())
    }

    /// Merge file values with environment overrides from `env`.
    pub fn resolve<F>(file: FileConfig, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |key: &str| env(key).filter(|v| !v.trim().is_empty());
        let mut warnings = Vec::new();

        let max_file_size = match env("MAX_FILE_SIZE") {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                warnings.push(format!(
                    "MAX_FILE_SIZE '{raw}' is not a byte count, using {DEFAULT_MAX_FILE_SIZE}"
                ));
                DEFAULT_MAX_FILE_SIZE
            }),
            None => file.max_file_size.unwrap_or(DEFAULT_MAX_FILE_SIZE),
        };

        let tool_timeout_ms = match env("TOOL_TIMEOUT_MS") {
            Some(raw) => parse_number("TOOL_TIMEOUT_MS", &raw)?,
            None => file.tool_timeout_ms.unwrap_or(DEFAULT_TOOL_TIMEOUT_MS),
        };
        let fetch_timeout_ms = match env("FETCH_TIMEOUT_MS") {
            Some(raw) => parse_number("FETCH_TIMEOUT_MS", &raw)?,
            None => file.fetch_timeout_ms.unwrap_or(DEFAULT_FETCH_TIMEOUT_MS),
        };

        let region = env("AWS_REGION")
            .or_else(|| env("AWS_DEFAULT_REGION"))
            .or(file.aws.region)
            .unwrap_or_else(|| DEFAULT_REGION.to_string());
        let access_key_id = env("AWS_ACCESS_KEY_ID").or(file.aws.access_key_id);
        let secret_access_key = env("AWS_SECRET_ACCESS_KEY").or(file.aws.secret_access_key);
        let session_token = env("AWS_SESSION_TOKEN").or(file.aws.session_token);
        let credentials = match (access_key_id, secret_access_key) {
            (Some(id), Some(secret)) => {
                let creds = AwsCredentials::new(id, secret);
                Some(match session_token {
                    Some(token) => creds.with_session_token(token),
                    None => creds,
                })
            }
            _ => None,
        };

        let bind_raw = env("FILEINFO_BIND")
            .or(file.bind)
            .unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind = bind_raw.parse().map_err(|e| ConfigError::Invalid {
            key: "bind".to_string(),
            message: format!("{bind_raw}: {e}"),
        })?;

        let format = match env("LOG_FORMAT").or(file.log_format) {
            Some(raw) => raw
                .parse::<LogFormat>()
                .map_err(|message| ConfigError::Invalid {
                    key: "logFormat".to_string(),
                    message,
                })?,
            None => LogFormat::default(),
        };
        let level = env("LOG_LEVEL")
            .or(file.log_level)
            .unwrap_or_else(|| "info".to_string());

        Ok(Self {
            max_file_size,
            exiftool_bin: env("EXIFTOOL_BIN_PATH")
                .or(file.exiftool_bin)
                .unwrap_or_else(|| "exiftool".to_string())
                .into(),
            ffprobe_bin: env("FFPROBE_BIN_PATH")
                .or(file.ffprobe_bin)
                .unwrap_or_else(|| "ffprobe".to_string())
                .into(),
            tool_timeout: Duration::from_millis(tool_timeout_ms),
            fetch_timeout: Duration::from_millis(fetch_timeout_ms),
            log_group: env("LOG_GROUP")
                .or(file.log_group)
                .unwrap_or_else(|| DEFAULT_LOG_GROUP.to_string()),
            cloudwatch: CloudWatchConfig {
                region,
                endpoint: env("CLOUDWATCH_LOGS_ENDPOINT").or(file.aws.endpoint),
                credentials,
            },
            bind,
            logging: LogConfig { format, level },
            warnings,
        })
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig::default()
            .with_max_size(self.max_file_size)
            .with_timeout_ms(self.fetch_timeout.as_millis() as u64)
    }

    /// Deadline for one `read_file`: the fetch plus one timeout per
    /// external tool (exiftool, ffprobe).
    pub fn request_timeout(&self) -> Duration {
        self.fetch_timeout + self.tool_timeout * 2
    }

    pub fn toolchain_config(&self) -> ToolchainConfig {
        ToolchainConfig {
            exiftool_bin: self.exiftool_bin.clone(),
            ffprobe_bin: self.ffprobe_bin.clone(),
            timeout: self.tool_timeout,
        }
    }
}

/// Read and parse a JSON5 config file.
pub fn read_file_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    parse_json5(&content, path)
}

fn parse_json5(content: &str, path: &Path) -> Result<FileConfig, ConfigError> {
    json5::from_str(content).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

fn parse_number(key: &str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim().parse().map_err(|e| ConfigError::Invalid {
        key: key.to_string(),
        message: format!("'{raw}': {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn resolve_with(file: FileConfig, vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::resolve(file, |key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = resolve_with(FileConfig::default(), &[]).unwrap();
        assert_eq!(config.max_file_size, 11_000_000);
        assert_eq!(config.exiftool_bin, PathBuf::from("exiftool"));
        assert_eq!(config.ffprobe_bin, PathBuf::from("ffprobe"));
        assert_eq!(config.tool_timeout, Duration::from_secs(30));
        assert_eq!(config.fetch_timeout, Duration::from_secs(30));
        assert_eq!(config.log_group, "/aws/lambda/fileinfo");
        assert_eq!(config.cloudwatch.region, "us-east-1");
        assert!(config.cloudwatch.credentials.is_none());
        assert!(config.cloudwatch.endpoint.is_none());
        assert_eq!(config.bind, "127.0.0.1:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(config.logging, LogConfig::default());
        assert!(config.warnings.is_empty());
    }

    #[test]
    fn test_request_timeout_covers_fetch_and_tools() {
        let config = resolve_with(
            FileConfig::default(),
            &[("FETCH_TIMEOUT_MS", "1000"), ("TOOL_TIMEOUT_MS", "250")],
        )
        .unwrap();
        assert_eq!(config.request_timeout(), Duration::from_millis(1500));
    }

    #[test]
    fn test_env_overrides() {
        let config = resolve_with(
            FileConfig::default(),
            &[
                ("MAX_FILE_SIZE", "1024"),
                ("EXIFTOOL_BIN_PATH", "/opt/bin/exiftool"),
                ("FFPROBE_BIN_PATH", "/opt/bin/ffprobe"),
                ("TOOL_TIMEOUT_MS", "500"),
                ("LOG_GROUP", "/custom/group"),
                ("AWS_DEFAULT_REGION", "eu-west-1"),
                ("FILEINFO_BIND", "0.0.0.0:9000"),
                ("LOG_FORMAT", "json"),
                ("LOG_LEVEL", "debug"),
            ],
        )
        .unwrap();

        assert_eq!(config.max_file_size, 1024);
        assert_eq!(config.exiftool_bin, PathBuf::from("/opt/bin/exiftool"));
        assert_eq!(config.ffprobe_bin, PathBuf::from("/opt/bin/ffprobe"));
        assert_eq!(config.tool_timeout, Duration::from_millis(500));
        assert_eq!(config.log_group, "/custom/group");
        assert_eq!(config.cloudwatch.region, "eu-west-1");
        assert_eq!(config.bind.port(), 9000);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_aws_region_precedence() {
        let config = resolve_with(
            FileConfig::default(),
            &[("AWS_REGION", "ap-south-1"), ("AWS_DEFAULT_REGION", "eu-west-1")],
        )
        .unwrap();
        assert_eq!(config.cloudwatch.region, "ap-south-1");
    }

    #[test]
    fn test_unparsable_max_file_size_falls_back() {
        let config = resolve_with(FileConfig::default(), &[("MAX_FILE_SIZE", "ten megs")]).unwrap();
        assert_eq!(config.max_file_size, DEFAULT_MAX_FILE_SIZE);
        assert_eq!(config.warnings.len(), 1);
        assert!(config.warnings[0].contains("MAX_FILE_SIZE"));
    }

    #[test]
    fn test_invalid_timeout_is_an_error() {
        let err = resolve_with(FileConfig::default(), &[("TOOL_TIMEOUT_MS", "soon")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "TOOL_TIMEOUT_MS"));
    }

    #[test]
    fn test_invalid_bind_is_an_error() {
        let err = resolve_with(FileConfig::default(), &[("FILEINFO_BIND", "localhost")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "bind"));
    }

    #[test]
    fn test_credentials_need_both_halves() {
        let config = resolve_with(FileConfig::default(), &[("AWS_ACCESS_KEY_ID", "AKID")]).unwrap();
        assert!(config.cloudwatch.credentials.is_none());

        let config = resolve_with(
            FileConfig::default(),
            &[
                ("AWS_ACCESS_KEY_ID", "AKID"),
                ("AWS_SECRET_ACCESS_KEY", "secret"),
                ("AWS_SESSION_TOKEN", "token"),
            ],
        )
        .unwrap();
        let creds = config.cloudwatch.credentials.unwrap();
        assert_eq!(creds.access_key_id, "AKID");
        assert_eq!(creds.session_token.as_deref(), Some("token"));
    }

    #[test]
    fn test_parse_json5_file() {
        let content = r#"{
            // comments and unquoted keys are fine
            maxFileSize: 2048,
            ffprobeBin: "/usr/local/bin/ffprobe",
            logGroup: "/from/file",
            aws: { region: "us-west-2", endpoint: "http://127.0.0.1:4566" },
            logFormat: "json",
        }"#;
        let file = parse_json5(content, Path::new("fileinfo.json5")).unwrap();
        let config = resolve_with(file, &[("LOG_GROUP", "/from/env")]).unwrap();

        assert_eq!(config.max_file_size, 2048);
        assert_eq!(config.ffprobe_bin, PathBuf::from("/usr/local/bin/ffprobe"));
        assert_eq!(config.log_group, "/from/env", "env wins over file");
        assert_eq!(config.cloudwatch.region, "us-west-2");
        assert_eq!(
            config.cloudwatch.endpoint.as_deref(),
            Some("http://127.0.0.1:4566")
        );
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_parse_json5_error() {
        let result = parse_json5("{ maxFileSize: ", Path::new("bad.json5"));
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_read_missing_file() {
        let result = read_file_config(Path::new("/nonexistent/fileinfo.json5"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_fetch_and_toolchain_configs() {
        let config = resolve_with(
            FileConfig::default(),
            &[("MAX_FILE_SIZE", "10"), ("FETCH_TIMEOUT_MS", "250")],
        )
        .unwrap();
        let fetch = config.fetch_config();
        assert_eq!(fetch.max_size, 10);
        assert_eq!(fetch.timeout_ms, 250);
        assert_eq!(config.toolchain_config().timeout, Duration::from_secs(30));
    }
}
