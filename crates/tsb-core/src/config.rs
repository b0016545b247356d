use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    archive::ExtractLimits, errors::Error, staging::absolutize, transform::TransformConfig,
    validate::SupportedTypes, Result,
};

const DEFAULT_SLACK_BASE_URL: &str = "https://slack.com/api";
const DEFAULT_TRANSFORM_PROGRAM: &str = "./scripts/themer/themer.phar";

/// Typed configuration, read once at startup.
#[derive(Clone, Debug)]
pub struct Config {
    // Slack
    pub slack_oauth_token: String,
    pub slack_base_url: String,
    pub http_timeout: Duration,

    // External transform
    pub transform: TransformConfig,

    // Filesystem
    pub temp_dir: PathBuf,
    pub staging_dir: PathBuf,

    // Archives
    pub supported_types: SupportedTypes,
    pub extract_limits: ExtractLimits,

    // Audit
    pub audit_log_path: Option<PathBuf>,
    pub audit_log_json: bool,
}

impl Config {
    /// Load from `.env` (if present) and the process environment.
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. `load()` passes the environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).and_then(non_empty);

        let slack_oauth_token = get("SLACK_OAUTH_TOKEN").ok_or_else(|| {
            Error::Config("SLACK_OAUTH_TOKEN environment variable is required".to_string())
        })?;
        let slack_base_url = get("SLACK_BASE_URL")
            .unwrap_or_else(|| DEFAULT_SLACK_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        let http_timeout = Duration::from_secs(parse_num(&get, "HTTP_TIMEOUT_SECS")?.unwrap_or(5));

        // 0 disables the transform timeout.
        let transform_timeout = match parse_num::<u64>(&get, "TRANSFORM_TIMEOUT_SECS")? {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => Some(Duration::from_secs(600)),
        };
        let transform = TransformConfig {
            program: get("TRANSFORM_PROGRAM")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_TRANSFORM_PROGRAM)),
            args: parse_csv(get("TRANSFORM_ARGS")),
            working_dir: get("TRANSFORM_WORKING_DIR").map(PathBuf::from),
            timeout: transform_timeout,
        };

        let temp_dir = get("TEMP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(env::temp_dir);
        let temp_dir = absolutize(&temp_dir)?;
        let staging_dir = match get("STAGING_DIR") {
            Some(dir) => absolutize(Path::new(&dir))?,
            None => temp_dir.join("tsb-staging"),
        };

        let supported_types = match get("SUPPORTED_FILE_TYPES") {
            Some(v) => SupportedTypes::parse_csv(&v)?,
            None => SupportedTypes::default(),
        };

        let defaults = ExtractLimits::default();
        let extract_limits = ExtractLimits {
            max_files: parse_num(&get, "EXTRACT_MAX_FILES")?.unwrap_or(defaults.max_files),
            max_total_bytes: parse_num(&get, "EXTRACT_MAX_TOTAL_BYTES")?
                .unwrap_or(defaults.max_total_bytes),
            max_file_bytes: parse_num(&get, "EXTRACT_MAX_FILE_BYTES")?
                .unwrap_or(defaults.max_file_bytes),
        };

        let audit_log_path = get("AUDIT_LOG_PATH").map(PathBuf::from);
        let audit_log_json = get("AUDIT_LOG_JSON").map(|s| parse_bool(&s)).unwrap_or(false);

        Ok(Self {
            slack_oauth_token,
            slack_base_url,
            http_timeout,
            transform,
            temp_dir,
            staging_dir,
            supported_types,
            extract_limits,
            audit_log_path,
            audit_log_json,
        })
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        env::set_var(key, unquote(v.trim()));
    }
}

fn unquote(val: &str) -> &str {
    if val.len() >= 2
        && ((val.starts_with('"') && val.ends_with('"'))
            || (val.starts_with('\'') && val.ends_with('\'')))
    {
        return &val[1..val.len() - 1];
    }
    val
}

fn parse_bool(s: &str) -> bool {
    matches!(
        s.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_num<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    let Some(raw) = get(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|_| Error::Config(format!("{key} must be a non-negative integer, got {raw:?}")))
}

fn parse_csv(v: Option<String>) -> Vec<String> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
