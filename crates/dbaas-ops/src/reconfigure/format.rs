//! Reading, rendering and patching config files of the supported formats.
//!
//! Every format is mapped onto a JSON object so that diffs and parameter updates work the same
//! way for all of them. INI sections become nested objects, keys outside any section stay at the
//! top level.

use std::collections::BTreeMap;

use encoding_rs::UTF_8;
use java_properties::PropertiesIter;
use product_config::writer::{PropertiesWriterError, to_java_properties_string};
use serde_json::{Map, Value};
use snafu::{ResultExt, Snafu, ensure};

use crate::crd::{ConfigFormat, ops_request::ParameterPair};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to parse JSON config"))]
    ParseJson { source: serde_json::Error },

    #[snafu(display("failed to parse YAML config"))]
    ParseYaml { source: serde_yaml::Error },

    #[snafu(display("line {line}: malformed section header {text:?}"))]
    MalformedSection { line: usize, text: String },

    #[snafu(display("line {line}: parameter without a name"))]
    EmptyKey { line: usize },

    #[snafu(display("failed to parse properties config"))]
    ParseProperties {
        source: java_properties::PropertiesError,
    },

    #[snafu(display("failed to render properties config"))]
    RenderProperties { source: PropertiesWriterError },

    #[snafu(display("a {format} config must be an object at the top level"))]
    NotAnObject { format: ConfigFormat },

    #[snafu(display("failed to render JSON config"))]
    RenderJson { source: serde_json::Error },

    #[snafu(display("failed to render YAML config"))]
    RenderYaml { source: serde_yaml::Error },
}

pub fn parse(format: ConfigFormat, content: &str) -> Result<Value, Error> {
    let value = match format {
        ConfigFormat::Json => {
            if content.trim().is_empty() {
                Value::Object(Map::new())
            } else {
                serde_json::from_str(content).context(ParseJsonSnafu)?
            }
        }
        ConfigFormat::Yaml => match serde_yaml::from_str::<Value>(content).context(ParseYamlSnafu)? {
            Value::Null => Value::Object(Map::new()),
            value => value,
        },
        ConfigFormat::Ini => parse_ini(content)?,
        ConfigFormat::Properties => parse_properties(content)?,
    };
    ensure!(value.is_object(), NotAnObjectSnafu { format });
    Ok(value)
}

pub fn render(format: ConfigFormat, value: &Value) -> Result<String, Error> {
    let Value::Object(map) = value else {
        return NotAnObjectSnafu { format }.fail();
    };
    match format {
        ConfigFormat::Json => serde_json::to_string_pretty(value).context(RenderJsonSnafu),
        ConfigFormat::Yaml => serde_yaml::to_string(value).context(RenderYamlSnafu),
        ConfigFormat::Ini => Ok(render_ini(map)),
        ConfigFormat::Properties => render_properties(map),
    }
}

/// Applies parameter updates to a config file and renders it again.
pub fn apply_parameters(
    format: ConfigFormat,
    content: &str,
    parameters: &[ParameterPair],
) -> Result<String, Error> {
    let mut value = parse(format, content)?;
    let mut patch = Map::new();
    for parameter in parameters {
        let path = parameter_path(format, &value, &parameter.key);
        let new_value = match &parameter.value {
            None => Value::Null,
            Some(raw) => scalar(format, raw),
        };
        set_path(&mut patch, &path, new_value);
    }
    json_patch::merge(&mut value, &Value::Object(patch));
    render(format, &value)
}

fn scalar(format: ConfigFormat, raw: &str) -> Value {
    match format {
        ConfigFormat::Ini | ConfigFormat::Properties => Value::String(raw.to_owned()),
        ConfigFormat::Json | ConfigFormat::Yaml => match serde_yaml::from_str::<Value>(raw) {
            Ok(value @ (Value::Bool(_) | Value::Number(_) | Value::String(_))) => value,
            _ => Value::String(raw.to_owned()),
        },
    }
}

/// Resolves a parameter name such as `mysqld.max_connections` to a path in the parsed file.
fn parameter_path(format: ConfigFormat, value: &Value, key: &str) -> Vec<String> {
    let Value::Object(map) = value else {
        return vec![key.to_owned()];
    };
    match format {
        ConfigFormat::Properties => vec![key.to_owned()],
        ConfigFormat::Ini => {
            if let Some((section, name)) = key.split_once('.') {
                if map.get(section).is_some_and(Value::is_object) {
                    return vec![section.to_owned(), name.to_owned()];
                }
            }
            let sections: Vec<&String> = map
                .iter()
                .filter(|(_, v)| v.is_object())
                .map(|(k, _)| k)
                .collect();
            match sections.as_slice() {
                [section] if !map.contains_key(key) => vec![(*section).clone(), key.to_owned()],
                _ => vec![key.to_owned()],
            }
        }
        ConfigFormat::Json | ConfigFormat::Yaml => {
            if map.contains_key(key) {
                vec![key.to_owned()]
            } else {
                key.split('.').map(str::to_owned).collect()
            }
        }
    }
}

fn set_path(target: &mut Map<String, Value>, path: &[String], new_value: Value) {
    match path {
        [] => {}
        [last] => {
            target.insert(last.clone(), new_value);
        }
        [first, rest @ ..] => {
            let child = target
                .entry(first.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            if let Value::Object(child) = child {
                set_path(child, rest, new_value);
            }
        }
    }
}

fn parse_ini(content: &str) -> Result<Value, Error> {
    let mut root = Map::new();
    let mut section: Option<String> = None;

    for (index, raw_line) in content.lines().enumerate() {
        let line = raw_line.trim();
        let line_no = index + 1;
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(header) = line.strip_prefix('[') {
            let name = header
                .strip_suffix(']')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .ok_or_else(|| {
                    MalformedSectionSnafu {
                        line: line_no,
                        text: line,
                    }
                    .build()
                })?;
            root.entry(name.to_owned())
                .or_insert_with(|| Value::Object(Map::new()));
            section = Some(name.to_owned());
            continue;
        }

        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (line, ""),
        };
        ensure!(!key.is_empty(), EmptyKeySnafu { line: line_no });

        let target = match &section {
            Some(section) => root
                .get_mut(section)
                .and_then(Value::as_object_mut),
            None => Some(&mut root),
        };
        if let Some(target) = target {
            target.insert(key.to_owned(), Value::String(value.to_owned()));
        }
    }
    Ok(Value::Object(root))
}

/// Reads Java properties, including escapes, unicode escapes and continued lines.
fn parse_properties(content: &str) -> Result<Value, Error> {
    let mut root = Map::new();
    PropertiesIter::new_with_encoding(content.as_bytes(), UTF_8)
        .read_into(|key, value| {
            root.insert(key, Value::String(value));
        })
        .context(ParsePropertiesSnafu)?;
    Ok(Value::Object(root))
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn write_entry(out: &mut String, key: &str, value: &Value) {
    let value = scalar_to_string(value);
    if value.is_empty() {
        out.push_str(key);
    } else {
        out.push_str(key);
        out.push('=');
        out.push_str(&value);
    }
    out.push('\n');
}

fn sorted(map: &Map<String, Value>) -> Vec<(&String, &Value)> {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
}

fn render_ini(map: &Map<String, Value>) -> String {
    let mut out = String::new();
    for (key, value) in sorted(map).into_iter().filter(|(_, v)| !v.is_object()) {
        write_entry(&mut out, key, value);
    }
    for (name, section) in sorted(map)
        .into_iter()
        .filter_map(|(k, v)| v.as_object().map(|s| (k, s)))
    {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push('[');
        out.push_str(name);
        out.push_str("]\n");
        for (key, value) in sorted(section) {
            write_entry(&mut out, key, value);
        }
    }
    out
}

fn render_properties(map: &Map<String, Value>) -> Result<String, Error> {
    let properties: BTreeMap<String, Option<String>> = map
        .iter()
        .map(|(key, value)| (key.clone(), Some(scalar_to_string(value))))
        .collect();
    to_java_properties_string(properties.iter()).context(RenderPropertiesSnafu)
}
