//! Control script composition
//!
//! The robot-side control script ships as a template with `{{ NAME }}`
//! placeholders for the host ports, addresses and servo timing. Every
//! placeholder present in the template must resolve to a value; an
//! unknown placeholder aborts composition, since a half-rendered script
//! would fail on the robot in a much less obvious way.

use std::collections::HashMap;
use std::fmt;

use regex::Regex;

use crate::{EcdError, Result};

/// A typed substitution value.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

impl fmt::Display for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptValue::Int(v) => write!(f, "{}", v),
            // Floats always render with a decimal point.
            ScriptValue::Float(v) => write!(f, "{:.6}", v),
            ScriptValue::Str(v) => write!(f, "{}", v),
            ScriptValue::Bool(v) => write!(f, "{}", if *v { "True" } else { "False" }),
        }
    }
}

impl From<i64> for ScriptValue {
    fn from(v: i64) -> Self {
        ScriptValue::Int(v)
    }
}

impl From<u16> for ScriptValue {
    fn from(v: u16) -> Self {
        ScriptValue::Int(v as i64)
    }
}

impl From<i32> for ScriptValue {
    fn from(v: i32) -> Self {
        ScriptValue::Int(v as i64)
    }
}

impl From<f64> for ScriptValue {
    fn from(v: f64) -> Self {
        ScriptValue::Float(v)
    }
}

impl From<&str> for ScriptValue {
    fn from(v: &str) -> Self {
        ScriptValue::Str(v.to_string())
    }
}

impl From<String> for ScriptValue {
    fn from(v: String) -> Self {
        ScriptValue::Str(v)
    }
}

impl From<bool> for ScriptValue {
    fn from(v: bool) -> Self {
        ScriptValue::Bool(v)
    }
}

/// Renders a script template against a set of named values.
pub struct ScriptComposer {
    values: HashMap<String, ScriptValue>,
}

impl ScriptComposer {
    pub fn new() -> Self {
        Self {
            values: HashMap::new(),
        }
    }

    /// Add or replace a substitution value.
    pub fn value<V: Into<ScriptValue>>(mut self, name: &str, value: V) -> Self {
        self.values.insert(name.to_string(), value.into());
        self
    }

    /// Render `template`, substituting every `{{ NAME }}` placeholder.
    pub fn compose(&self, template: &str) -> Result<String> {
        // Unwrap is safe: the pattern is a literal.
        let placeholder = Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").unwrap();
        let mut output = String::with_capacity(template.len());
        let mut cursor = 0;
        for captures in placeholder.captures_iter(template) {
            let span = match captures.get(0) {
                Some(span) => span,
                None => continue,
            };
            let name = &captures[1];
            let value = self.values.get(name).ok_or_else(|| {
                EcdError::Script(format!(
                    "unhandled placeholder '{}' in control script template",
                    name
                ))
            })?;
            output.push_str(&template[cursor..span.start()]);
            output.push_str(&value.to_string());
            cursor = span.end();
        }
        output.push_str(&template[cursor..]);
        Ok(output)
    }
}

impl Default for ScriptComposer {
    fn default() -> Self {
        Self::new()
    }
}
