//! Variable scope and `{name}` interpolation.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::Serialize;

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid placeholder regex")
});

/// A bound value: a single string, or the values an accumulator collected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Text(String),
    List(Vec<String>),
}

impl Value {
    /// Values contributed when folding into an accumulator.
    fn items(&self) -> Vec<String> {
        match self {
            Value::Text(value) => vec![value.clone()],
            Value::List(values) => values.clone(),
        }
    }
}

impl fmt::Display for Value {
    /// Lists render comma separated, ready for an `IN (...)` clause.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Text(value) => f.write_str(value),
            Value::List(values) => f.write_str(&values.join(",")),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

/// Name to value bindings visible at one point of the tree walk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct VariableScope {
    bindings: BTreeMap<String, Value>,
}

impl VariableScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name)
    }

    /// Bind `name`, replacing any earlier binding.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.bindings.insert(name.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.bindings.iter()
    }

    /// Scope for one loop iteration: everything visible here except the
    /// accumulator, which each iteration starts without. Steps inside the
    /// body therefore cannot read the values collected by earlier
    /// iterations; those become visible once the loop has finished.
    pub fn child(&self, accumulator: &str) -> Self {
        let mut child = self.clone();
        child.bindings.remove(accumulator);
        child
    }

    /// End an iteration: append the child's accumulator value, if it set
    /// one, to this scope's accumulator list. All other child bindings are
    /// dropped.
    pub fn absorb(&mut self, child: VariableScope, accumulator: &str) {
        let Some(value) = child.bindings.get(accumulator) else {
            return;
        };
        let mut collected = match self.bindings.remove(accumulator) {
            Some(Value::List(values)) => values,
            Some(Value::Text(value)) => vec![value],
            None => Vec::new(),
        };
        collected.extend(value.items());
        self.bindings
            .insert(accumulator.to_string(), Value::List(collected));
    }

    /// Replace each `{name}` with its bound value. Unbound names stay as
    /// written.
    pub fn interpolate(&self, text: &str) -> String {
        PLACEHOLDER_RE
            .replace_all(text, |caps: &Captures<'_>| match self.bindings.get(&caps[1]) {
                Some(value) => value.to_string(),
                None => caps[0].to_string(),
            })
            .into_owned()
    }

    /// Placeholders in `text` with no binding.
    pub fn unresolved(&self, text: &str) -> Vec<String> {
        PLACEHOLDER_RE
            .captures_iter(text)
            .map(|caps| caps[1].to_string())
            .filter(|name| !self.bindings.contains_key(name))
            .collect()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for VariableScope {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut scope = VariableScope::new();
        for (name, value) in iter {
            scope.set(name, value);
        }
        scope
    }
}
