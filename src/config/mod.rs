//! Deploy invocation configuration
//!
//! Every knob that used to be ambient (log level aside, which the
//! subscriber owns) is carried explicitly on `DeployOptions` so the
//! pipeline has no process-wide singletons.

use std::path::PathBuf;
use std::time::Duration;

/// Default timeout for chart installs and upgrades.
pub const DEFAULT_CHART_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Default retry count for installs, upgrades and registry pushes.
pub const DEFAULT_RETRIES: u32 = 3;

/// Default worker count for image pulls and pushes.
pub const DEFAULT_IMAGE_WORKERS: usize = 10;

/// Options for one deploy invocation
#[derive(Debug, Clone)]
pub struct DeployOptions {
    /// Archive path or OCI reference
    pub source: String,
    /// CSV of component names / group picks; None selects defaults
    pub components: Option<String>,
    /// Variable overrides from repeated `--set KEY=VAL`
    pub set_variables: Vec<(String, String)>,
    /// Skip interactive confirmation and prompts
    pub confirm: bool,
    /// Public key for signature verification
    pub key: Option<PathBuf>,
    /// Expected archive sha256
    pub shasum: Option<String>,
    pub insecure_skip_tls_verify: bool,
    pub plain_http: bool,
    /// Chart install/upgrade timeout
    pub timeout: Duration,
    /// Install/upgrade/push retry count
    pub retries: u32,
    /// Skip all secondary readiness waits
    pub no_wait: bool,
    /// Layer cache directory; None disables the cache
    pub cache_dir: Option<PathBuf>,
    /// Bounded worker count for image pulls and pushes
    pub image_workers: usize,
    /// Disable progress rendering and prompts (CI mode)
    pub non_interactive: bool,
}

impl DeployOptions {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            components: None,
            set_variables: Vec::new(),
            confirm: false,
            key: None,
            shasum: None,
            insecure_skip_tls_verify: false,
            plain_http: false,
            timeout: DEFAULT_CHART_TIMEOUT,
            retries: DEFAULT_RETRIES,
            no_wait: false,
            cache_dir: None,
            image_workers: DEFAULT_IMAGE_WORKERS,
            non_interactive: false,
        }
    }

    /// Parse repeated `KEY=VAL` pairs from the CLI
    pub fn parse_set_pairs(pairs: &[String]) -> anyhow::Result<Vec<(String, String)>> {
        pairs
            .iter()
            .map(|pair| {
                pair.split_once('=')
                    .map(|(k, v)| (k.trim().to_string(), v.to_string()))
                    .filter(|(k, _)| !k.is_empty())
                    .ok_or_else(|| anyhow::anyhow!("invalid --set pair (expected KEY=VAL): {pair}"))
            })
            .collect()
    }
}

/// Facts about the deploying host, resolved once per invocation
#[derive(Debug, Clone)]
pub struct HostFacts {
    /// OCI-style architecture ("amd64", "arm64")
    pub arch: String,
    /// "linux", "darwin" or "windows"
    pub os: String,
}

impl HostFacts {
    pub fn detect() -> Self {
        let arch = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            other => other,
        };
        let os = match std::env::consts::OS {
            "macos" => "darwin",
            other => other,
        };
        Self {
            arch: arch.to_string(),
            os: os.to_string(),
        }
    }
}
