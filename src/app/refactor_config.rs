//! Configuration file for the `cdk-refactor` binary.
//!
//! Looked up, in order, at the `--config` path, `./cdk-refactor.json`, and
//! `cdk-refactor.json` in the platform config directory. A missing file means defaults; a
//! file that cannot be read or parsed also means defaults, plus a warning the binary logs
//! once logging is up.
//! Command line flags override every value.
//!
//! # cdk-refactor.json Format
//!
//! ```json
//! {
//!   "profile": "deploy",
//!   "region": "eu-west-1",
//!   "assembly_dir": "cdk.out",
//!   "schema_dir": "/opt/cfn-schemas",
//!   "exclude": ["StorageStack.LegacyBucket", "App/Network/Vpc"],
//!   "log_filter": "cdk_refactor=debug"
//! }
//! ```

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const CONFIG_FILE_NAME: &str = "cdk-refactor.json";

/// Defaults for the refactor command.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RefactorConfig {
    /// Named AWS profile
    pub profile: Option<String>,

    /// Region for stacks that do not pin one
    pub region: Option<String>,

    /// Synthesized cloud assembly directory
    pub assembly_dir: PathBuf,

    /// Directory of CloudFormation registry schemas (`aws-s3-bucket.json`, ...)
    pub schema_dir: Option<PathBuf>,

    /// `Stack.LogicalId` locations or construct paths never to refactor
    pub exclude: Vec<String>,

    /// `tracing_subscriber::EnvFilter` directives, used when `RUST_LOG` is unset
    pub log_filter: Option<String>,
}

impl Default for RefactorConfig {
    fn default() -> Self {
        Self {
            profile: None,
            region: None,
            assembly_dir: PathBuf::from("cdk.out"),
            schema_dir: None,
            exclude: Vec::new(),
            log_filter: None,
        }
    }
}

impl RefactorConfig {
    /// Resolve and load the configuration, falling back to defaults.
    ///
    /// Runs before logging is set up, so a file that cannot be read or parsed is returned
    /// as a warning message for the caller to report.
    pub fn load(explicit: Option<&Path>) -> (Self, Option<String>) {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => {
                let local = PathBuf::from(CONFIG_FILE_NAME);
                if local.exists() {
                    Some(local)
                } else {
                    Self::user_config_path()
                }
            }
        };

        match path.map(Self::load_from_path).transpose() {
            Ok(config) => (config.flatten().unwrap_or_default(), None),
            Err(e) => (Self::default(), Some(format!("{:#}; using defaults", e))),
        }
    }

    /// `cdk-refactor.json` inside the platform config directory.
    pub fn user_config_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "cdk-refactor", "cdk-refactor")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Load configuration from a specific path.
    ///
    /// Returns `Ok(None)` if the file doesn't exist.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let path = path.as_ref();

        if !path.exists() {
            debug!("No {} found at {:?}", CONFIG_FILE_NAME, path);
            return Ok(None);
        }

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {:?}", path))?;
        let config = serde_json::from_str::<RefactorConfig>(&contents)
            .with_context(|| format!("Failed to parse {:?}", path))?;
        debug!(
            "Loaded config from {:?}: profile={:?}, region={:?}, assembly_dir={:?}",
            path, config.profile, config.region, config.assembly_dir
        );
        Ok(Some(config))
    }
}
