//! Module list file.
//!
//! ```toml
//! [[module]]
//! kind = "health_monitor"
//! [module.settings]
//! connect_timeout_ms = 500
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// One enabled module: the catalog kind and its settings table.
#[derive(Debug, Clone, Deserialize)]
pub struct ModuleSpec {
    pub kind: String,
    #[serde(default)]
    pub settings: toml::Table,
}

#[derive(Debug, Deserialize)]
struct ModuleFile {
    #[serde(default, rename = "module")]
    modules: Vec<ModuleSpec>,
}

pub fn parse_modules(content: &str) -> Result<Vec<ModuleSpec>> {
    let file: ModuleFile = toml::from_str(content)?;
    Ok(file.modules)
}

pub fn load_modules(path: &Path) -> Result<Vec<ModuleSpec>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("cannot read module file {}: {e}", path.display()))
    })?;
    parse_modules(&content)
        .map_err(|e| Error::Config(format!("bad module file {}: {e}", path.display())))
}
