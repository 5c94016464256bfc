use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_ADDR: &str = "127.0.0.1:8787";
pub const DEFAULT_DB_PATH: &str = ".speedwatch/speedwatch.db";
pub const DEFAULT_LOG_DIR: &str = ".speedwatch/logs";
pub const DEFAULT_TOOL: &str = "speedtest";
pub const DEFAULT_SERVER_ID: &str = "10493";
pub const DEFAULT_LOOKUP_URL: &str = "http://ip-api.com";

#[derive(Parser, Debug, Clone)]
#[command(name = "speedwatch-hub")]
pub struct Args {
    #[arg(long, default_value = "")]
    pub addr: String,
    #[arg(long, default_value = "")]
    pub db_path: String,
    /// JSON file of office records upserted at start.
    #[arg(long, default_value = "")]
    pub offices: String,
    #[arg(long, default_value = "")]
    pub tool_path: String,
    /// Fixed measurement server; pass an empty string to let the tool choose.
    #[arg(long)]
    pub server_id: Option<String>,
    #[arg(long, default_value_t = 300)]
    pub timeout_secs: u64,
    #[arg(long, default_value_t = 5)]
    pub kill_grace_secs: u64,
    #[arg(long, default_value_t = 500)]
    pub progress_interval_ms: u64,
    /// Provider commonly detected in place of the contracted one; empty disables.
    #[arg(long, default_value = "PLDT")]
    pub shared_infra_isp: String,
    #[arg(long, default_value = "")]
    pub lookup_url: String,
    #[arg(long, default_value_t = 5)]
    pub lookup_timeout_secs: u64,
    #[arg(long, default_value = "")]
    pub api_token: String,
    #[arg(long, default_value = "")]
    pub log_dir: String,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
}

/// How the external measurement tool is launched and bounded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolConfig {
    pub program: String,
    pub server_id: Option<String>,
    pub progress_interval_ms: u64,
    pub timeout: Duration,
    pub kill_grace: Duration,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_TOOL.to_string(),
            server_id: Some(DEFAULT_SERVER_ID.to_string()),
            progress_interval_ms: 500,
            timeout: Duration::from_secs(300),
            kill_grace: Duration::from_secs(5),
        }
    }
}

impl ToolConfig {
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--format=jsonl".to_string(),
            "--accept-license".to_string(),
            "--accept-gdpr".to_string(),
            "--progress=yes".to_string(),
            format!(
                "--progress-update-interval={}",
                self.progress_interval_ms.max(100)
            ),
        ];
        if let Some(server_id) = &self.server_id {
            args.push(format!("--server-id={server_id}"));
        }
        args
    }

    pub fn invocation(&self) -> ToolInvocation {
        ToolInvocation {
            program: self.program.clone(),
            args: self.args(),
        }
    }
}

/// A resolved program plus argument list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub program: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub addr: String,
    pub db_path: PathBuf,
    pub offices_path: Option<PathBuf>,
    pub tool: ToolConfig,
    pub shared_infra_isp: Option<String>,
    pub lookup_url: String,
    pub lookup_timeout: Duration,
    pub api_token: Option<String>,
    pub log_dir: String,
    pub debug: bool,
}

pub fn load_config() -> Config {
    config_from_args(Args::parse())
}

pub fn config_from_args(args: Args) -> Config {
    let server_id = match args.server_id {
        Some(value) => value,
        None => resolve_value("", "SPEEDWATCH_SERVER_ID", DEFAULT_SERVER_ID),
    };
    let offices = resolve_value(&args.offices, "SPEEDWATCH_OFFICES", "");
    let api_token = resolve_value(&args.api_token, "SPEEDWATCH_API_TOKEN", "");
    Config {
        addr: resolve_value(&args.addr, "SPEEDWATCH_ADDR", DEFAULT_ADDR),
        db_path: PathBuf::from(resolve_value(&args.db_path, "SPEEDWATCH_DB", DEFAULT_DB_PATH)),
        offices_path: non_empty(offices).map(PathBuf::from),
        tool: ToolConfig {
            program: resolve_value(&args.tool_path, "SPEEDWATCH_TOOL", DEFAULT_TOOL),
            server_id: non_empty(server_id),
            progress_interval_ms: args.progress_interval_ms,
            timeout: Duration::from_secs(args.timeout_secs.max(1)),
            kill_grace: Duration::from_secs(args.kill_grace_secs),
        },
        shared_infra_isp: non_empty(args.shared_infra_isp),
        lookup_url: resolve_value(&args.lookup_url, "SPEEDWATCH_LOOKUP_URL", DEFAULT_LOOKUP_URL)
            .trim_end_matches('/')
            .to_string(),
        lookup_timeout: Duration::from_secs(args.lookup_timeout_secs.max(1)),
        api_token: non_empty(api_token),
        log_dir: resolve_value(&args.log_dir, "SPEEDWATCH_LOG_DIR", DEFAULT_LOG_DIR),
        debug: args.debug || env_true("SPEEDWATCH_DEBUG"),
    }
}

fn resolve_value(flag: &str, env_key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.trim().to_string();
    }
    if let Ok(value) = std::env::var(env_key) {
        if !value.trim().is_empty() {
            return value.trim().to_string();
        }
    }
    default.to_string()
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

pub fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Config {
        let mut full = vec!["speedwatch-hub"];
        full.extend_from_slice(argv);
        config_from_args(Args::parse_from(full))
    }

    #[test]
    fn tool_args_pin_server_by_default() {
        let args = ToolConfig::default().args();
        assert!(args.contains(&"--format=jsonl".to_string()));
        assert!(args.contains(&"--accept-license".to_string()));
        assert!(args.contains(&"--progress-update-interval=500".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("--server-id=10493"));
    }

    #[test]
    fn empty_server_id_disables_selector() {
        let config = parse(&["--server-id", "", "--tool-path", "/opt/speedtest"]);
        assert_eq!(config.tool.server_id, None);
        assert_eq!(config.tool.program, "/opt/speedtest");
        assert!(!config
            .tool
            .args()
            .iter()
            .any(|arg| arg.starts_with("--server-id")));
    }

    #[test]
    fn flags_override_defaults() {
        let config = parse(&[
            "--addr",
            "127.0.0.1:9000",
            "--timeout-secs",
            "30",
            "--shared-infra-isp",
            "",
            "--lookup-url",
            "http://lookup.test/",
            "--api-token",
            "secret",
        ]);
        assert_eq!(config.addr, "127.0.0.1:9000");
        assert_eq!(config.tool.timeout, Duration::from_secs(30));
        assert_eq!(config.shared_infra_isp, None);
        assert_eq!(config.lookup_url, "http://lookup.test");
        assert_eq!(config.api_token.as_deref(), Some("secret"));
    }
}
