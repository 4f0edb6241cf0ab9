//! Descriptor parser.
//!
//! Loads the descriptor from YAML, then applies `NLQ_DEPLOY_*` environment
//! overrides. A `.env` file next to the descriptor is loaded first when
//! present.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::spec::DeployDescriptor;
use crate::error::{ConfigError, DeployError, Result};

/// Environment variable overriding `project.name`.
pub const ENV_PROJECT_NAME: &str = "NLQ_DEPLOY_PROJECT_NAME";
/// Environment variable overriding `state.bucket`.
pub const ENV_STATE_BUCKET: &str = "NLQ_DEPLOY_STATE_BUCKET";
/// Environment variable overriding `state.prefix`.
pub const ENV_STATE_PREFIX: &str = "NLQ_DEPLOY_STATE_PREFIX";
/// Environment variable overriding `execution.max_parallelism`.
pub const ENV_MAX_PARALLELISM: &str = "NLQ_DEPLOY_MAX_PARALLELISM";

/// Descriptor parser.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Directory holding the descriptor and its `.env`.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the directory searched for `.env`.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads a descriptor from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<DeployDescriptor> {
        let path = path.as_ref();
        info!("Loading descriptor from: {}", path.display());

        if !path.exists() {
            return Err(DeployError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            DeployError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses a descriptor from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<DeployDescriptor> {
        debug!("Parsing YAML descriptor");

        let descriptor: DeployDescriptor = serde_yaml::from_str(content).map_err(|e| {
            DeployError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location: source.map(|p| p.display().to_string()),
            })
        })?;

        debug!(
            project = %descriptor.project.name,
            stacks = descriptor.stacks.len(),
            "Parsed descriptor"
        );
        Ok(descriptor)
    }

    /// Loads a descriptor and applies environment overrides read from the
    /// process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if an
    /// override is malformed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<DeployDescriptor> {
        let mut descriptor = self.load_file(path)?;
        Self::apply_env_overrides(&mut descriptor, |key| std::env::var(key).ok())?;
        Ok(descriptor)
    }

    /// Applies `NLQ_DEPLOY_*` overrides looked up through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns an error if `NLQ_DEPLOY_MAX_PARALLELISM` is not a number.
    pub fn apply_env_overrides(
        descriptor: &mut DeployDescriptor,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<()> {
        if let Some(name) = lookup(ENV_PROJECT_NAME) {
            debug!("Overriding project.name from environment");
            descriptor.project.name = name;
        }

        if let Some(bucket) = lookup(ENV_STATE_BUCKET) {
            debug!("Overriding state.bucket from environment");
            descriptor.state.bucket = Some(bucket);
        }

        if let Some(prefix) = lookup(ENV_STATE_PREFIX) {
            debug!("Overriding state.prefix from environment");
            descriptor.state.prefix = Some(prefix);
        }

        if let Some(raw) = lookup(ENV_MAX_PARALLELISM) {
            debug!("Overriding execution.max_parallelism from environment");
            descriptor.execution.max_parallelism = raw.trim().parse().map_err(|_| {
                ConfigError::validation(
                    format!("{ENV_MAX_PARALLELISM} must be a positive integer, got '{raw}'"),
                    "execution.max_parallelism",
                )
            })?;
        }

        Ok(())
    }

    /// Loads the `.env` file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the `.env` file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                DeployError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

/// Default descriptor file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &[
    "nlq.deploy.yaml",
    "nlq.deploy.yml",
    "deploy.yaml",
    "deploy.yml",
];

/// Finds the descriptor in `start_dir` or one of its parents.
///
/// # Errors
///
/// Returns an error if no descriptor is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found descriptor: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    warn!("No descriptor found from {}", start.display());
    Err(DeployError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const MINIMAL: &str = r"
project:
  name: nlq-chat
stacks:
  - name: AuthStack
    resources:
      - id: UserPool
        kind: identity.user-pool
";

    #[test]
    fn test_parse_minimal_descriptor() {
        let parser = ConfigParser::new();
        let descriptor = parser.parse_yaml(MINIMAL, None).unwrap();
        assert_eq!(descriptor.project.name, "nlq-chat");
        assert_eq!(descriptor.project.environment, "dev");
        assert_eq!(descriptor.stack_names(), vec!["AuthStack"]);
    }

    #[test]
    fn test_parse_error_carries_location() {
        let parser = ConfigParser::new();
        let err = parser
            .parse_yaml("project: [", Some(Path::new("broken.yaml")))
            .unwrap_err();
        assert!(matches!(
            err,
            DeployError::Config(ConfigError::ParseError { location: Some(ref l), .. }) if l == "broken.yaml"
        ));
    }

    #[test]
    fn test_env_overrides() {
        let parser = ConfigParser::new();
        let mut descriptor = parser.parse_yaml(MINIMAL, None).unwrap();
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_PROJECT_NAME, "nlq-prod"),
            (ENV_STATE_BUCKET, "nlq-state"),
            (ENV_MAX_PARALLELISM, "4"),
        ]);

        ConfigParser::apply_env_overrides(&mut descriptor, |k| env.get(k).map(|v| (*v).to_string()))
            .unwrap();

        assert_eq!(descriptor.project.name, "nlq-prod");
        assert_eq!(descriptor.state.bucket.as_deref(), Some("nlq-state"));
        assert_eq!(descriptor.state.prefix, None);
        assert_eq!(descriptor.execution.max_parallelism, 4);
    }

    #[test]
    fn test_bad_parallelism_override() {
        let parser = ConfigParser::new();
        let mut descriptor = parser.parse_yaml(MINIMAL, None).unwrap();
        let err = ConfigParser::apply_env_overrides(&mut descriptor, |k| {
            (k == ENV_MAX_PARALLELISM).then(|| "many".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, DeployError::Config(ConfigError::ValidationError { .. })));
    }

    #[test]
    fn test_find_config_file_walks_parents() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("nlq.deploy.yaml"), MINIMAL).unwrap();
        let nested = dir.path().join("infra").join("stacks");
        std::fs::create_dir_all(&nested).unwrap();

        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, dir.path().join("nlq.deploy.yaml"));

        let descriptor = ConfigParser::new().load_file(found).unwrap();
        assert_eq!(descriptor.project.name, "nlq-chat");
    }

    #[test]
    fn test_missing_file() {
        let err = ConfigParser::new().load_file("/nonexistent/nlq.deploy.yaml").unwrap_err();
        assert!(matches!(err, DeployError::Config(ConfigError::FileNotFound { .. })));
    }
}
