//! Image references and registry credentials

mod keychain;
mod reference;

pub use keychain::{build_env_var, default_helper, Authorization, Keychain};
pub use reference::{canonical_registry, registry_of, ImageRef, DEFAULT_REGISTRY, DEFAULT_TAG};
