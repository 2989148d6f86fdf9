//! Kiln apps: the dependent graphs and status bindings of the managed applications.
//!
//! Every app owns one primary kind in the `glasskube.eu/v1alpha1` group. All dependents
//! live in the primary's namespace and carry a controller owner reference back to it.

#![forbid(unsafe_code)]

mod common;
pub mod http_echo;
pub mod nextcloud;
pub mod odoo;
pub mod plane;
pub mod vault;

pub use common::{primary_type, SecretSeed, GROUP, VERSION};

use kiln_core::ConfigError;
use kiln_engine::AppDefinition;

/// Every known app definition. Fails only on a broken graph, which is a programming error.
/// `seed` keys the secrets apps generate for their primaries.
pub fn all_apps(seed: Option<&SecretSeed>) -> Result<Vec<AppDefinition>, ConfigError> {
    Ok(vec![
        http_echo::definition()?,
        plane::definition(seed.cloned())?,
        nextcloud::definition()?,
        vault::definition()?,
        odoo::definition()?,
    ])
}

/// Look an app up by name or primary kind, ignoring case.
pub fn find_app(name: &str, seed: Option<&SecretSeed>) -> Result<Option<AppDefinition>, ConfigError> {
    Ok(all_apps(seed)?
        .into_iter()
        .find(|a| a.name.eq_ignore_ascii_case(name) || a.primary_type.kind.eq_ignore_ascii_case(name)))
}
