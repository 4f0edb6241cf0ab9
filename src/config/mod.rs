//! Configuration module for the NLQ deployment engine.
//!
//! This module handles the descriptor:
//! - Parsing and deserializing `nlq.deploy.yaml`
//! - Environment overrides and `.env` loading
//! - Validation of names, hooks, removal policies and graphs
//! - Hashing resolved properties and descriptors for change detection

mod hash;
mod parser;
mod spec;
mod validator;

pub use hash::ConfigHasher;
pub use parser::{
    ConfigParser, DEFAULT_CONFIG_FILES, ENV_MAX_PARALLELISM, ENV_PROJECT_NAME, ENV_STATE_BUCKET,
    ENV_STATE_PREFIX, find_config_file,
};
pub use spec::{
    DeployDescriptor, ExecutionConfig, ProjectConfig, ResourceSpec, StackSpec, StateBackend,
    StateConfig,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
