//! Dependency descriptions and `<(NAME)>` variable evaluation

use isolate_core::error::IoResultExt;
use isolate_core::fs::normalize_path;
use isolate_core::{Error, ReadOnly, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A description after condition evaluation, variables still unexpanded
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadedDescription {
    pub command: Vec<String>,
    /// Inputs relative to `base_dir`; directories end with `/`
    pub infiles: Vec<String>,
    pub touched: Vec<String>,
    pub read_only: Option<ReadOnly>,
    /// Directory the inputs are relative to
    pub base_dir: PathBuf,
}

/// Produces the dependency set of a description file
pub trait DescriptionSource {
    fn load(
        &self,
        path: &Path,
        config_variables: &BTreeMap<String, String>,
    ) -> Result<LoadedDescription>;
}

/// Plain JSON descriptions without conditions:
///
/// ```json
/// {"variables": {"command": [], "files": [], "touched": [], "read_only": 1}}
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDescription;

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct JsonDocument {
    variables: JsonVariables,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct JsonVariables {
    #[serde(default)]
    command: Vec<String>,
    #[serde(default)]
    files: Vec<String>,
    #[serde(default)]
    touched: Vec<String>,
    #[serde(default)]
    read_only: Option<ReadOnly>,
}

impl JsonDescription {
    pub fn parse(content: &[u8], base_dir: &Path) -> Result<LoadedDescription> {
        let doc: JsonDocument = serde_json::from_slice(content)
            .map_err(|e| {
                Error::description(format!("invalid description in {}: {}", base_dir.display(), e))
            })?;
        let vars = doc.variables;
        Ok(LoadedDescription {
            command: vars.command,
            infiles: vars.files,
            touched: vars.touched,
            read_only: vars.read_only,
            base_dir: normalize_path(base_dir),
        })
    }
}

impl DescriptionSource for JsonDescription {
    fn load(
        &self,
        path: &Path,
        _config_variables: &BTreeMap<String, String>,
    ) -> Result<LoadedDescription> {
        let content = std::fs::read(path).with_path(path)?;
        let base_dir = path
            .parent()
            .ok_or_else(|| Error::description(format!("{} has no parent", path.display())))?;
        JsonDescription::parse(&content, base_dir)
    }
}

/// Replace every `<(NAME)>` with its value
///
/// Names match `[A-Za-z_][A-Za-z_0-9]*`; anything else between the markers is
/// left as literal text. An unknown name is an error.
pub fn eval_variables(item: &str, variables: &BTreeMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(item.len());
    let mut rest = item;

    while let Some(start) = rest.find("<(") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find(")>") {
            Some(end) if is_variable_name(&after[..end]) => {
                let name = &after[..end];
                let value = variables.get(name).ok_or_else(|| {
                    Error::description(format!(
                        "Variable \"{}\" was not found in {:?}. Did you forget to specify --path-variable?",
                        name,
                        variables.keys().collect::<Vec<_>>()
                    ))
                })?;
                out.push_str(value);
                rest = &after[end + 2..];
            }
            _ => {
                out.push_str("<(");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

fn is_variable_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
