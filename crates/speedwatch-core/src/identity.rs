use serde::{Deserialize, Serialize};

/// Sentinel returned by detection facilities that could not name a provider.
pub const UNKNOWN_IDENTITY: &str = "Unknown";

pub const CONFIDENCE_EXACT: u8 = 100;
pub const CONFIDENCE_PARTIAL: u8 = 80;
pub const CONFIDENCE_SHARED_INFRA: u8 = 60;
pub const CONFIDENCE_RELAXED_MISMATCH: u8 = 30;
pub const CONFIDENCE_NONE: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    /// Gates measurement start; any mismatch blocks.
    Strict,
    /// Informational, post-hoc; always proceeds.
    Relaxed,
}

impl Default for ValidationMode {
    fn default() -> Self {
        Self::Strict
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityResolution {
    pub is_match: bool,
    pub confidence: u8,
    #[serde(default)]
    pub proceed: bool,
    #[serde(default)]
    pub claimed: String,
    #[serde(default)]
    pub detected: String,
    #[serde(default)]
    pub canonical_claimed: String,
    #[serde(default)]
    pub canonical_detected: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalIdentity {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl CanonicalIdentity {
    pub fn new(name: &str, aliases: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            aliases: aliases.iter().map(|alias| alias.to_lowercase()).collect(),
        }
    }
}

/// Alias table plus the regional shared-infrastructure heuristic.
#[derive(Debug, Clone)]
pub struct IdentityCatalog {
    entries: Vec<CanonicalIdentity>,
    shared_infrastructure: Option<String>,
}

impl Default for IdentityCatalog {
    fn default() -> Self {
        Self::new(
            vec![
                CanonicalIdentity::new(
                    "PLDT",
                    &[
                        "pldt",
                        "pldt inc",
                        "pldt inc.",
                        "pldt home",
                        "pldt fibr",
                        "philippine long distance telephone",
                        "philippine long distance telephone company",
                    ],
                ),
                CanonicalIdentity::new(
                    "Globe",
                    &[
                        "globe",
                        "globe telecom",
                        "globe telecom inc",
                        "globe telecom inc.",
                        "globe at home",
                        "innove communications",
                    ],
                ),
                CanonicalIdentity::new(
                    "Converge",
                    &[
                        "converge",
                        "converge ict",
                        "converge ict solutions",
                        "converge ict solutions inc",
                        "comclark",
                    ],
                ),
                CanonicalIdentity::new(
                    "Smart",
                    &["smart", "smart communications", "smart broadband"],
                ),
                CanonicalIdentity::new(
                    "DITO",
                    &["dito", "dito telecommunity", "dito telecommunity corp"],
                ),
                CanonicalIdentity::new(
                    "Sky Broadband",
                    &["sky broadband", "skycable", "sky cable", "sky fiber"],
                ),
                CanonicalIdentity::new(
                    "Eastern Communications",
                    &["eastern communications", "eastern telecom", "etpi"],
                ),
            ],
            Some("PLDT".to_string()),
        )
    }
}

impl IdentityCatalog {
    pub fn new(entries: Vec<CanonicalIdentity>, shared_infrastructure: Option<String>) -> Self {
        let shared_infrastructure = shared_infrastructure
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());
        Self {
            entries,
            shared_infrastructure,
        }
    }

    pub fn with_shared_infrastructure(mut self, name: Option<String>) -> Self {
        self.shared_infrastructure = name
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        self
    }

    pub fn entries(&self) -> &[CanonicalIdentity] {
        &self.entries
    }

    pub fn shared_infrastructure(&self) -> Option<&str> {
        self.shared_infrastructure.as_deref()
    }

    /// Canonical name, exact alias, substring alias, then the trimmed input itself.
    pub fn canonicalize(&self, raw: &str) -> String {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return String::new();
        }
        let lowered = trimmed.to_lowercase();

        if let Some(entry) = self
            .entries
            .iter()
            .find(|entry| entry.name.to_lowercase() == lowered)
        {
            return entry.name.clone();
        }

        if let Some(entry) = self
            .entries
            .iter()
            .find(|entry| entry.aliases.iter().any(|alias| *alias == lowered))
        {
            return entry.name.clone();
        }

        // Longest alias wins so "sky broadband" beats a bare "sky" style alias.
        let mut best: Option<(&CanonicalIdentity, usize)> = None;
        for entry in &self.entries {
            for alias in &entry.aliases {
                if alias.is_empty() || !lowered.contains(alias.as_str()) {
                    continue;
                }
                if best.map_or(true, |(_, len)| alias.len() > len) {
                    best = Some((entry, alias.len()));
                }
            }
        }
        if let Some((entry, _)) = best {
            return entry.name.clone();
        }

        trimmed.to_string()
    }

    pub fn validate(&self, claimed: &str, detected: &str, mode: ValidationMode) -> IdentityResolution {
        let canonical_claimed = self.canonicalize(claimed);
        let canonical_detected = self.canonicalize(detected);
        let mut resolution = IdentityResolution {
            is_match: false,
            confidence: CONFIDENCE_NONE,
            proceed: false,
            claimed: claimed.trim().to_string(),
            detected: detected.trim().to_string(),
            canonical_claimed: canonical_claimed.clone(),
            canonical_detected: canonical_detected.clone(),
            suggestion: None,
        };

        let claimed_lower = canonical_claimed.to_lowercase();
        let detected_lower = canonical_detected.to_lowercase();
        if claimed_lower.is_empty() || detected_lower.is_empty() {
            return self.mismatch(resolution, mode);
        }

        if claimed_lower == detected_lower {
            resolution.is_match = true;
            resolution.confidence = CONFIDENCE_EXACT;
            resolution.proceed = true;
            return resolution;
        }

        if claimed_lower.contains(&detected_lower) || detected_lower.contains(&claimed_lower) {
            resolution.is_match = true;
            resolution.confidence = CONFIDENCE_PARTIAL;
            resolution.proceed = true;
            return resolution;
        }

        self.mismatch(resolution, mode)
    }

    fn mismatch(&self, mut resolution: IdentityResolution, mode: ValidationMode) -> IdentityResolution {
        resolution.is_match = false;
        match mode {
            ValidationMode::Strict => {
                resolution.confidence = CONFIDENCE_NONE;
                resolution.proceed = false;
                resolution.suggestion = Some(format!(
                    "Connection detected as {} but {} was selected; switch networks or pick the matching provider",
                    display_or_unknown(&resolution.canonical_detected),
                    display_or_unknown(&resolution.canonical_claimed),
                ));
            }
            ValidationMode::Relaxed => {
                resolution.proceed = true;
                let shared = self.shared_infrastructure.as_deref().is_some_and(|shared| {
                    shared.eq_ignore_ascii_case(&resolution.canonical_detected)
                });
                if shared {
                    resolution.confidence = CONFIDENCE_SHARED_INFRA;
                    resolution.suggestion = Some(format!(
                        "{} often carries traffic for other providers; the result is recorded under {}",
                        resolution.canonical_detected,
                        display_or_unknown(&resolution.canonical_claimed),
                    ));
                } else {
                    resolution.confidence = CONFIDENCE_RELAXED_MISMATCH;
                    resolution.suggestion = Some(format!(
                        "Detected provider {} differs from the selected {}; verify the office connection",
                        display_or_unknown(&resolution.canonical_detected),
                        display_or_unknown(&resolution.canonical_claimed),
                    ));
                }
            }
        }
        resolution
    }

    /// Another configured provider of the office that matches the detected identity.
    pub fn alternative_for<'a>(
        &self,
        detected: &str,
        claimed: &str,
        configured: &'a [String],
    ) -> Option<&'a str> {
        let detected = self.canonicalize(detected);
        let claimed = self.canonicalize(claimed);
        if detected.is_empty() || detected.eq_ignore_ascii_case(UNKNOWN_IDENTITY) {
            return None;
        }
        configured
            .iter()
            .map(String::as_str)
            .filter(|candidate| !self.canonicalize(candidate).eq_ignore_ascii_case(&claimed))
            .find(|candidate| self.canonicalize(candidate).eq_ignore_ascii_case(&detected))
    }

    /// Picks the identity written with a result: pre-validated claim, resolved
    /// claim, resolved tool detection, then the office default.
    pub fn resolve_recorded(&self, inputs: &RecordedIdentityInputs<'_>) -> String {
        if let Some(claimed) = non_empty(inputs.claimed) {
            if inputs.claimed_validated {
                return claimed.to_string();
            }
            return self.canonicalize(claimed);
        }
        if let Some(detected) = non_empty(inputs.tool_detected) {
            if !detected.eq_ignore_ascii_case(UNKNOWN_IDENTITY) {
                return self.canonicalize(detected);
            }
        }
        inputs.office_default.trim().to_string()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RecordedIdentityInputs<'a> {
    pub claimed: Option<&'a str>,
    pub claimed_validated: bool,
    pub tool_detected: Option<&'a str>,
    pub office_default: &'a str,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn display_or_unknown(value: &str) -> &str {
    if value.trim().is_empty() {
        UNKNOWN_IDENTITY
    } else {
        value
    }
}
