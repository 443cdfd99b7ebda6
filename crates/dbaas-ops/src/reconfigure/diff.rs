//! Structural differences between two versions of a config and their reload classification.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};
use snafu::{ResultExt, Snafu};

use crate::{
    crd::{
        ConfigFormat,
        config_constraint::{ConfigFiles, ParameterClassification},
    },
    reconfigure::format,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to parse the previous version of config file {file:?}"))]
    ParseOld { source: format::Error, file: String },

    #[snafu(display("failed to parse the new version of config file {file:?}"))]
    ParseNew { source: format::Error, file: String },
}

/// The difference between two versions of a set of config files.
///
/// Updated files hold a JSON merge patch which turns the old content into the new one.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConfigDiffInformation {
    pub added: BTreeMap<String, Value>,
    pub deleted: BTreeMap<String, Value>,
    pub updated: BTreeMap<String, Value>,
}

impl ConfigDiffInformation {
    pub fn is_modified(&self) -> bool {
        !(self.added.is_empty() && self.deleted.is_empty() && self.updated.is_empty())
    }

    /// Names of all updated parameters across files, without section prefixes.
    pub fn updated_keys(&self) -> BTreeSet<String> {
        let mut keys = BTreeSet::new();
        for patch in self.updated.values() {
            collect_leaf_keys(patch, &mut keys);
        }
        keys
    }

    /// Whether the change can be applied by reloading the process instead of restarting it.
    ///
    /// Adding or removing files always needs a restart. Parameters not covered by the
    /// classification are assumed to need a restart as well.
    pub fn is_reloadable(&self, classification: &ParameterClassification) -> bool {
        if !self.added.is_empty() || !self.deleted.is_empty() {
            return false;
        }
        let updated = self.updated_keys();

        if !classification.static_parameters.is_empty() {
            if classification
                .static_parameters
                .iter()
                .any(|param| updated.contains(param))
            {
                return false;
            }
            if classification.dynamic_parameters.is_empty() {
                return true;
            }
        }

        if !classification.dynamic_parameters.is_empty() {
            let dynamic: BTreeSet<&String> = classification.dynamic_parameters.iter().collect();
            return updated.iter().all(|key| dynamic.contains(key));
        }

        false
    }
}

/// An added empty section has no parameters, so it is reported by its own name.
fn collect_leaf_keys(patch: &Value, keys: &mut BTreeSet<String>) {
    if let Value::Object(map) = patch {
        for (key, value) in map {
            match value {
                Value::Object(section) if !section.is_empty() => collect_leaf_keys(value, keys),
                _ => {
                    keys.insert(key.clone());
                }
            }
        }
    }
}

/// Computes the JSON merge patch turning `old` into `new`.
pub fn merge_patch_diff(old: &Value, new: &Value) -> Value {
    match (old, new) {
        (Value::Object(old), Value::Object(new)) => {
            let mut patch = Map::new();
            for key in old.keys().filter(|key| !new.contains_key(*key)) {
                patch.insert(key.clone(), Value::Null);
            }
            for (key, new_value) in new {
                match old.get(key) {
                    Some(old_value) if old_value == new_value => {}
                    Some(old_value @ Value::Object(_)) if new_value.is_object() => {
                        patch.insert(key.clone(), merge_patch_diff(old_value, new_value));
                    }
                    _ => {
                        patch.insert(key.clone(), new_value.clone());
                    }
                }
            }
            Value::Object(patch)
        }
        _ => new.clone(),
    }
}

/// Computes the per-file difference between two versions of a config.
pub fn create_config_diff(
    old: &ConfigFiles,
    new: &ConfigFiles,
    format: ConfigFormat,
) -> Result<ConfigDiffInformation, Error> {
    let mut diff = ConfigDiffInformation::default();

    for (file, content) in old.iter().filter(|(file, _)| !new.contains_key(*file)) {
        let value = format::parse(format, content).context(ParseOldSnafu { file })?;
        diff.deleted.insert(file.clone(), value);
    }

    for (file, new_content) in new {
        let new_value = format::parse(format, new_content).context(ParseNewSnafu { file })?;
        match old.get(file) {
            None => {
                diff.added.insert(file.clone(), new_value);
            }
            Some(old_content) if old_content == new_content => {}
            Some(old_content) => {
                let old_value = format::parse(format, old_content).context(ParseOldSnafu { file })?;
                let patch = merge_patch_diff(&old_value, &new_value);
                if patch.as_object().is_none_or(|map| !map.is_empty()) {
                    diff.updated.insert(file.clone(), patch);
                }
            }
        }
    }

    Ok(diff)
}
