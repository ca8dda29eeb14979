use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Typed job parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ParameterValue {
    String(String),
    Long(i64),
    Double(f64),
    Date(DateTime<Utc>),
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::String(v) => f.write_str(v),
            ParameterValue::Long(v) => write!(f, "{v}"),
            ParameterValue::Double(v) => write!(f, "{v}"),
            ParameterValue::Date(v) => write!(f, "{}", v.to_rfc3339()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParameter {
    pub value: ParameterValue,
    pub identifying: bool,
}

/// Ordered name → parameter mapping handed to a launch.
///
/// Only identifying parameters contribute to the job instance identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobParameters {
    params: BTreeMap<String, JobParameter>,
}

impl JobParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_string(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.with(name, ParameterValue::String(value.into()), true)
    }

    pub fn with_long(self, name: impl Into<String>, value: i64) -> Self {
        self.with(name, ParameterValue::Long(value), true)
    }

    pub fn with_double(self, name: impl Into<String>, value: f64) -> Self {
        self.with(name, ParameterValue::Double(value), true)
    }

    pub fn with_date(self, name: impl Into<String>, value: DateTime<Utc>) -> Self {
        self.with(name, ParameterValue::Date(value), true)
    }

    pub fn with(mut self, name: impl Into<String>, value: ParameterValue, identifying: bool) -> Self {
        self.params
            .insert(name.into(), JobParameter { value, identifying });
        self
    }

    pub fn get(&self, name: &str) -> Option<&JobParameter> {
        self.params.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &JobParameter)> {
        self.params.iter()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn has_identifying(&self) -> bool {
        self.params.values().any(|p| p.identifying)
    }

    /// Canonical rendering of the identifying subset, e.g. `run.id=3,region=eu`.
    pub fn identifying_key(&self) -> String {
        self.params
            .iter()
            .filter(|(_, p)| p.identifying)
            .map(|(k, p)| format!("{k}={}", p.value))
            .collect::<Vec<_>>()
            .join(",")
    }
}
