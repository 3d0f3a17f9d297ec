//! Named register values with environment overrides and file persistence
//!
//! A register name is a sequence of dot-separated segments, e.g. `uavcan.node.id`. The
//! environment-variable encoding replaces the dots with double underscores and raises the
//! case: `UAVCAN__NODE__ID`. Reads honor environment overrides applied at node start; the
//! backing store is an ordered JSON file so diffs stay reviewable.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::{NodeId, ServiceId, SubjectId};

/// A register value: a tagged variant mirroring the protocol's register value union.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Empty,
    String(String),
    Unstructured(Vec<u8>),
    Bit(Vec<bool>),
    Integer(Vec<i64>),
    Natural(Vec<u64>),
    Real(Vec<f64>),
}

impl Value {
    /// Parses the environment encoding: numeric vectors are whitespace- or
    /// comma-separated; anything non-numeric is taken as a string verbatim.
    pub fn parse_environment(text: &str) -> Value {
        let fields: Vec<&str> = text
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|s| !s.is_empty())
            .collect();
        if fields.is_empty() {
            return Value::String(String::new());
        }
        if let Ok(naturals) = fields.iter().map(|f| f.parse::<u64>()).collect() {
            return Value::Natural(naturals);
        }
        if let Ok(integers) = fields.iter().map(|f| f.parse::<i64>()).collect() {
            return Value::Integer(integers);
        }
        if let Ok(reals) = fields.iter().map(|f| f.parse::<f64>()).collect() {
            return Value::Real(reals);
        }
        Value::String(text.to_string())
    }

    pub fn to_environment(&self) -> String {
        fn join<T: ToString>(items: &[T]) -> String {
            items
                .iter()
                .map(T::to_string)
                .collect::<Vec<_>>()
                .join(" ")
        }
        match self {
            Value::Empty => String::new(),
            Value::String(s) => s.clone(),
            Value::Unstructured(bytes) => join(bytes),
            Value::Bit(bits) => join(&bits.iter().map(|b| u8::from(*b)).collect::<Vec<_>>()),
            Value::Integer(items) => join(items),
            Value::Natural(items) => join(items),
            Value::Real(items) => join(items),
        }
    }

    /// The first element interpreted as an unsigned integer, if the shape permits.
    pub fn as_natural(&self) -> Option<u64> {
        match self {
            Value::Natural(items) => items.first().copied(),
            Value::Integer(items) => items.first().and_then(|v| u64::try_from(*v).ok()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

/// `uavcan.node.id` -> `UAVCAN__NODE__ID`
pub fn environment_variable_name(register_name: &str) -> String {
    register_name.replace('.', "__").to_uppercase()
}

/// `UAVCAN__NODE__ID` -> `uavcan.node.id`; `None` for variables that do not follow the
/// register encoding.
pub fn register_name_from_environment(variable: &str) -> Option<String> {
    if variable.is_empty() || !variable.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_') {
        return None;
    }
    let name = variable.replace("__", ".").to_lowercase();
    if name.contains('_') || name.split('.').any(str::is_empty) {
        return None;
    }
    Some(name)
}

pub const NODE_ID_REGISTER: &str = "uavcan.node.id";
pub const DIAGNOSTIC_SEVERITY_REGISTER: &str = "uavcan.diagnostic.severity";

/// An ordered key-value register store.
#[derive(Debug, Default)]
pub struct Registry {
    values: BTreeMap<String, Value>,
    path: Option<PathBuf>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the backing file (if it exists), then applies environment overrides, which
    /// take precedence per the register interface contract.
    pub fn load(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let mut registry = Self {
            values: BTreeMap::new(),
            path: Some(path.clone()),
        };
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                registry.values = serde_json::from_str(&contents).map_err(|e| {
                    std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
                })?;
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => return Err(error),
        }
        registry.apply_environment(std::env::vars());
        Ok(registry)
    }

    /// Applies overrides from an environment snapshot. Only variables following the
    /// `uavcan.*` register encoding are considered.
    pub fn apply_environment(&mut self, variables: impl Iterator<Item = (String, String)>) {
        for (variable, text) in variables {
            let Some(name) = register_name_from_environment(&variable) else {
                continue;
            };
            if !name.starts_with("uavcan.") {
                continue;
            }
            self.values.insert(name, Value::parse_environment(&text));
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    /// Register names in lexicographic order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Persists the store to its backing file, or the given path for a fresh registry.
    pub fn save_to(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let contents = serde_json::to_string_pretty(&self.values)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        std::fs::write(path, contents)
    }

    pub fn save(&self) -> std::io::Result<()> {
        match &self.path {
            Some(path) => self.save_to(path),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "the registry has no backing file",
            )),
        }
    }

    /// The configured local node-ID; absent or empty means anonymous.
    pub fn node_id(&self) -> Option<NodeId> {
        self.get(NODE_ID_REGISTER)
            .and_then(Value::as_natural)
            .and_then(|raw| u16::try_from(raw).ok())
            .and_then(NodeId::new)
    }

    pub fn subject_id(&self, name: &str) -> Option<SubjectId> {
        self.get(name)
            .and_then(Value::as_natural)
            .and_then(|raw| u16::try_from(raw).ok())
            .and_then(SubjectId::new)
    }

    pub fn service_id(&self, name: &str) -> Option<ServiceId> {
        self.get(name)
            .and_then(Value::as_natural)
            .and_then(|raw| u16::try_from(raw).ok())
            .and_then(ServiceId::new)
    }

    /// Minimum severity to re-emit over the diagnostic subject, as a log level filter.
    /// The register carries the protocol's 0..=7 severity scale.
    pub fn diagnostic_severity(&self) -> log::LevelFilter {
        match self
            .get(DIAGNOSTIC_SEVERITY_REGISTER)
            .and_then(Value::as_natural)
        {
            Some(0) => log::LevelFilter::Trace,
            Some(1) => log::LevelFilter::Debug,
            Some(2..=3) => log::LevelFilter::Info,
            Some(4) => log::LevelFilter::Warn,
            Some(5..) => log::LevelFilter::Error,
            None => log::LevelFilter::Info,
        }
    }
}
