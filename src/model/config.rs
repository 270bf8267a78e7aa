//! Graph configuration structs. Produced by an external toolchain and
//! consumed here; the executor only requires that every input tensor name
//! was declared as a prior operator's output and that output names are
//! unique.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    #[serde(default)]
    pub operators: Vec<OperatorConfig>,
}

impl ModelConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file =
            File::open(path).with_context(|| format!("open model config {}", path.display()))?;
        serde_json::from_reader(file)
            .with_context(|| format!("parse model config {}", path.display()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperatorConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub op_type: String,
    #[serde(default)]
    pub inputs: Vec<TensorConfig>,
    #[serde(default)]
    pub outputs: Vec<TensorConfig>,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
}

impl OperatorConfig {
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }
}

fn default_dtype() -> String {
    "fp32".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct TensorConfig {
    pub name: String,
    #[serde(default = "default_dtype")]
    pub dtype: String,
    /// Declared dims; -1 marks an axis whose concrete value arrives at
    /// Forward time.
    #[serde(default)]
    pub shape: Vec<i64>,
    /// Weight location in the flat blob: [byte offset, byte length].
    /// Empty for non-weight tensors.
    #[serde(default)]
    pub location: Vec<u64>,
    #[serde(default)]
    pub format: Option<String>,
}

impl TensorConfig {
    pub fn is_weight(&self) -> bool {
        !self.location.is_empty()
    }

    /// Concrete dims with dynamic axes resolved to 1 as a placeholder until
    /// the first Forward binds real data.
    pub fn initial_dims(&self) -> Vec<usize> {
        self.shape
            .iter()
            .map(|&d| if d < 0 { 1 } else { d as usize })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_graph() {
        let raw = r#"{
            "name": "g",
            "operators": [
                {
                    "name": "in", "type": "Input",
                    "outputs": [
                        {"name": "x", "dtype": "s8", "shape": [-1, 8]},
                        {"name": "w", "dtype": "fp32", "shape": [2], "location": [0, 8]}
                    ]
                },
                {
                    "name": "out", "type": "Output",
                    "inputs": [{"name": "x"}]
                }
            ]
        }"#;
        let conf: ModelConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(conf.operators.len(), 2);
        let input = &conf.operators[0];
        assert_eq!(input.op_type, "Input");
        assert!(!input.outputs[0].is_weight());
        assert!(input.outputs[1].is_weight());
        assert_eq!(input.outputs[0].initial_dims(), vec![1, 8]);
    }
}
