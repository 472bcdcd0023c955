//! Local mirror of environment variables.
//!
//! The mirror lives in the [`crate::Bridge`] context rather than in process
//! globals, so independent bridges never see each other's writes.

use std::collections::BTreeMap;

use sandbridge_shared::{Error, Result};
use serde::{Deserialize, Serialize};

/// Ordering of the local and host writes in `set_env`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvWrite {
    /// Update the mirror, then notify the host. A failed notification is
    /// reported but the mirror keeps the new value.
    #[default]
    LocalFirst,
    /// Notify the host and update the mirror only if it accepted.
    HostFirst,
}

/// Variable name to value
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: BTreeMap<String, String>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the mirror from the current process environment. Variables that
    /// are not valid UTF-8 are skipped.
    pub fn from_process() -> Self {
        std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Set (`Some`) or remove (`None`) a variable.
    pub(crate) fn apply(&mut self, key: &str, value: Option<&str>) {
        match value {
            Some(v) => {
                self.vars.insert(key.to_string(), v.to_string());
            }
            None => {
                self.vars.remove(key);
            }
        }
    }
}

impl FromIterator<(String, String)> for Environment {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            vars: iter.into_iter().collect(),
        }
    }
}

/// setenv(3) rules: non-empty, no `=`, no NUL.
pub fn validate_var(key: &str, value: Option<&str>) -> Result<()> {
    if key.is_empty() || key.contains('=') || key.contains('\0') {
        return Err(Error::invalid(format!("invalid environment variable name {:?}", key)));
    }
    if value.is_some_and(|v| v.contains('\0')) {
        return Err(Error::invalid(format!("value of {} contains a NUL byte", key)));
    }
    Ok(())
}
