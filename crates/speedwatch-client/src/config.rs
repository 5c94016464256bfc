use clap::Parser;
use speedwatch_core::MeasurementRequest;
use std::time::Duration;

pub const DEFAULT_HUB_URL: &str = "http://127.0.0.1:8787";

#[derive(Parser, Debug, Clone)]
#[command(name = "speedwatch")]
pub struct Args {
    #[arg(long, default_value = "")]
    pub hub_url: String,
    #[arg(long)]
    pub office: String,
    /// Provider the office believes it is on.
    #[arg(long, default_value = "")]
    pub isp: String,
    #[arg(long, default_value = "")]
    pub section: String,
    /// The provider was already confirmed; skips pre-flight validation.
    #[arg(long, default_value_t = false)]
    pub isp_validated: bool,
    #[arg(long, default_value = "")]
    pub tz: String,
    #[arg(long, default_value = "")]
    pub api_token: String,
    /// On a provider mismatch, re-run as the detected provider when the office has it configured.
    #[arg(long, default_value_t = false)]
    pub accept_detected: bool,
    #[arg(long, default_value_t = 5)]
    pub validate_timeout_secs: u64,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub hub_url: String,
    pub office_id: String,
    pub claimed_isp: Option<String>,
    pub section: Option<String>,
    pub isp_validated: bool,
    pub time_zone: Option<String>,
    pub api_token: Option<String>,
    pub accept_detected: bool,
    pub validate_timeout: Duration,
    pub debug: bool,
}

impl Config {
    pub fn request(&self) -> MeasurementRequest {
        let mut request = MeasurementRequest::new(self.office_id.clone());
        if let Some(isp) = &self.claimed_isp {
            request = request.with_claimed_isp(isp.clone(), self.isp_validated);
        }
        if let Some(section) = &self.section {
            request = request.with_section(section.clone());
        }
        if let Some(tz) = &self.time_zone {
            request = request.with_time_zone(tz.clone());
        }
        request
    }
}

pub fn load_config() -> Config {
    config_from_args(Args::parse())
}

pub fn config_from_args(args: Args) -> Config {
    Config {
        hub_url: resolve_value(&args.hub_url, "SPEEDWATCH_HUB_URL", DEFAULT_HUB_URL)
            .trim_end_matches('/')
            .to_string(),
        office_id: args.office.trim().to_string(),
        claimed_isp: non_empty(args.isp),
        section: non_empty(args.section),
        isp_validated: args.isp_validated,
        time_zone: non_empty(resolve_value(&args.tz, "SPEEDWATCH_TZ", "")),
        api_token: non_empty(resolve_value(&args.api_token, "SPEEDWATCH_API_TOKEN", "")),
        accept_detected: args.accept_detected,
        validate_timeout: Duration::from_secs(args.validate_timeout_secs.max(1)),
        debug: args.debug || env_true("SPEEDWATCH_DEBUG"),
    }
}

fn resolve_value(flag: &str, env_key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.trim().to_string();
    }
    match std::env::var(env_key) {
        Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => default.to_string(),
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn env_true(key: &str) -> bool {
    std::env::var(key).is_ok_and(|value| {
        matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}
