//! Configuration module for the bundle deployment engine.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `bundle.yaml`
//! - Validation of configuration values
//! - Fingerprinting resource configurations for change detection
//! - Resolving `${resources.<type>.<name>.id}` references

mod hash;
mod interpolate;
mod parser;
mod spec;
mod validator;

pub use hash::{canonical_json, ConfigHasher};
pub use interpolate::{find_references, substitute_references};
pub use parser::{find_config_file, ConfigParser, DEFAULT_CONFIG_FILES, TOKEN_ENV};
pub use spec::{
    BundleConfig, BundleInfo, DeploySettings, LockSettings, ResourceConfig, StateBackend,
    StateConfig, TargetConfig, WorkspaceConfig, DEFAULT_ROOT_PATH,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
