//! Readiness markers: log-line patterns that satisfy readiness

use app_config::ServiceSpec;
use regex::Regex;
use tracing::warn;

/// Built-in banner patterns for the common dev servers
///
/// Deliberately conservative: a marker only short-circuits the health probe,
/// it never blocks readiness, so a missing pattern costs at most one probe
/// round. Per-service additions come from `ready_markers` in the manifest.
const BUILTIN_PATTERNS: &[&str] = &[
    // node/express and friends
    r"(?i)listening on\b",
    r"(?i)server (is )?running\b",
    // uvicorn / fastapi
    r"(?i)uvicorn running on\b",
    r"(?i)application startup complete",
    // flask / werkzeug
    r"(?i)running on http",
    // ASP.NET / Kestrel
    r"(?i)now listening on:",
    // vite / next / webpack dev servers
    r"(?i)\bready in \d+",
    r"(?i)compiled successfully",
    // Aspire apphost banner
    r"(?i)login to the dashboard at",
    // docker compose container lifecycle line
    r"(?i)container\s+\S+\s+started",
];

/// Compiled readiness matcher for one service
pub struct ReadyMatcher {
    patterns: Vec<Regex>,
}

impl ReadyMatcher {
    /// Built-in catalog plus the service's own markers
    ///
    /// An invalid user pattern is skipped with a warning rather than failing
    /// the start.
    pub fn for_service(spec: &ServiceSpec) -> Self {
        let mut patterns: Vec<Regex> = BUILTIN_PATTERNS
            .iter()
            .map(|p| Regex::new(p).expect("builtin pattern"))
            .collect();

        for raw in &spec.ready_markers {
            match Regex::new(raw) {
                Ok(re) => patterns.push(re),
                Err(e) => warn!(
                    service = %spec.name,
                    pattern = %raw,
                    "ignoring invalid ready marker: {}", e
                ),
            }
        }

        Self { patterns }
    }

    /// Whether a log line satisfies readiness
    pub fn matches(&self, line: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(line))
    }
}
