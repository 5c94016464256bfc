use async_trait::async_trait;
use axum::http::HeaderMap;
use serde::Deserialize;
use speedwatch_core::{
    IdentityCatalog, IdentityResolution, MeasurementError, ValidationMode, UNKNOWN_IDENTITY,
};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::{debug, warn};

/// Address-to-organisation lookup used by pre-flight validation.
#[async_trait]
pub trait IdentityDetector: Send + Sync {
    /// The provider name for `caller`, or [`UNKNOWN_IDENTITY`].
    async fn detect(&self, caller: Option<IpAddr>) -> String;
}

/// ip-api compatible lookup.
pub struct HttpIdentityDetector {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    isp: Option<String>,
    #[serde(default)]
    org: Option<String>,
}

impl HttpIdentityDetector {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn lookup_url(&self, caller: Option<IpAddr>) -> String {
        match caller.filter(is_public) {
            Some(ip) => format!("{}/json/{ip}?fields=status,isp,org,query", self.base_url),
            None => format!("{}/json/?fields=status,isp,org,query", self.base_url),
        }
    }
}

#[async_trait]
impl IdentityDetector for HttpIdentityDetector {
    async fn detect(&self, caller: Option<IpAddr>) -> String {
        let url = self.lookup_url(caller);
        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(event = "identity_lookup_failed", error = %err);
                return UNKNOWN_IDENTITY.to_string();
            }
        };
        if !response.status().is_success() {
            warn!(event = "identity_lookup_failed", status = response.status().as_u16());
            return UNKNOWN_IDENTITY.to_string();
        }
        match response.json::<LookupResponse>().await {
            Ok(body) => {
                let detected = identity_from_lookup(&body);
                debug!(event = "identity_detected", caller = ?caller, detected = %detected);
                detected
            }
            Err(err) => {
                warn!(event = "identity_lookup_failed", error = %err);
                UNKNOWN_IDENTITY.to_string()
            }
        }
    }
}

fn identity_from_lookup(body: &LookupResponse) -> String {
    if body
        .status
        .as_deref()
        .is_some_and(|status| !status.eq_ignore_ascii_case("success"))
    {
        return UNKNOWN_IDENTITY.to_string();
    }
    [body.isp.as_deref(), body.org.as_deref()]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|name| !name.is_empty())
        .unwrap_or(UNKNOWN_IDENTITY)
        .to_string()
}

fn is_public(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast())
        }
        IpAddr::V6(v6) => {
            let unique_local = (v6.segments()[0] & 0xfe00) == 0xfc00;
            let link_local = (v6.segments()[0] & 0xffc0) == 0xfe80;
            !(v6.is_loopback() || v6.is_unspecified() || unique_local || link_local)
        }
    }
}

/// First `X-Forwarded-For` entry, then `X-Real-IP`, then the socket peer.
pub fn caller_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<IpAddr> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|value| value.trim().parse::<IpAddr>().ok());
    let real_ip = || {
        headers
            .get("x-real-ip")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<IpAddr>().ok())
    };
    forwarded
        .or_else(real_ip)
        .or_else(|| peer.map(|addr| addr.ip()))
}

/// Strict pre-flight check. A mismatch comes back as a resolution with
/// `proceed == false`; only an undetectable identity is an error.
pub async fn preflight_validate(
    detector: &dyn IdentityDetector,
    catalog: &IdentityCatalog,
    claimed: &str,
    caller: Option<IpAddr>,
) -> Result<IdentityResolution, MeasurementError> {
    let detected = detector.detect(caller).await;
    if detected.trim().is_empty() || detected.trim().eq_ignore_ascii_case(UNKNOWN_IDENTITY) {
        return Err(MeasurementError::DetectionFailed);
    }
    Ok(catalog.validate(claimed, &detected, ValidationMode::Strict))
}
