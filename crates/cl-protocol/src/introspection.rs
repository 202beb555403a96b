//! The device introspection document.
//!
//! A Describe reply carries a JSON description of the device's exposed
//! variables and callable functions:
//!
//! ```json
//! {
//!   "v": { "temperature": "int32" },
//!   "f": [ { "name": "led", "args": ["string", "string"], "returns": "int32" } ]
//! }
//! ```

use crate::payload::VarType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One callable device function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_returns")]
    pub returns: String,
}

fn default_returns() -> String {
    "int32".to_owned()
}

/// Parsed introspection state, cached per session after the first
/// Describe round-trip.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFunctionState {
    /// Variable name → declared type name.
    #[serde(rename = "v", default)]
    pub variables: BTreeMap<String, String>,
    #[serde(rename = "f", default)]
    pub functions: Vec<FunctionSpec>,
}

impl DeviceFunctionState {
    pub fn from_payload(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    pub fn to_payload(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Declared type of a variable; `None` when undeclared or unknown.
    pub fn var_type(&self, name: &str) -> Option<VarType> {
        self.variables.get(name).and_then(|t| VarType::parse(t))
    }

    pub fn function(&self, name: &str) -> Option<&FunctionSpec> {
        self.functions.iter().find(|f| f.name == name)
    }
}
