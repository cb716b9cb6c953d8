//! Model state snapshots
//!
//! A [`ModelState`] records the value of every free stochastic node. That is
//! all a chain needs to resume: constants and data come from the model
//! definition, and deterministic values follow from the rest.
//!
//! Snapshots encode to MessagePack for checkpoints and to JSON for
//! inspection.

use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ResourceError, Result, StructuralError};
use crate::graph::Model;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    pub model: String,
    pub generation: u64,
    pub values: IndexMap<String, Value>,
}

impl ModelState {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ResourceError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ResourceError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    pub fn to_json(&self) -> Result<String, ResourceError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, ResourceError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Write a binary checkpoint.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ResourceError> {
        let path = path.as_ref();
        std::fs::write(path, self.to_bytes()?).map_err(|source| ResourceError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    /// Read a binary checkpoint.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ResourceError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| ResourceError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_bytes(&bytes)
    }
}

impl Model {
    /// Capture the values of the free stochastic nodes.
    pub fn snapshot(&self, generation: u64) -> ModelState {
        let values = self
            .stochastic_nodes()
            .into_iter()
            .filter(|n| !n.is_clamped())
            .map(|n| (n.name().to_string(), n.current_value()))
            .collect();
        ModelState {
            model: self.name().to_string(),
            generation,
            values,
        }
    }

    /// Set the free stochastic nodes to the values in `state` and settle.
    ///
    /// Every name and value type is checked before anything changes, so a
    /// state that does not fit the model leaves it untouched.
    pub fn load_state(&self, state: &ModelState) -> Result<()> {
        let mut targets = Vec::with_capacity(state.values.len());
        for (name, value) in &state.values {
            let node = self.stochastic_node(name)?;
            if node.is_clamped() {
                return Err(StructuralError::Clamped(name.clone()).into());
            }
            if !node.value_type().accepts(value.value_type()) {
                return Err(StructuralError::TypeMismatch {
                    node: name.clone(),
                    expected: node.value_type(),
                    found: value.value_type(),
                }
                .into());
            }
            targets.push((node, value));
        }
        for (node, value) in targets {
            node.set_value(value.clone())?;
        }
        self.settle();
        debug!(model = %self.name(), generation = state.generation, "state loaded");
        Ok(())
    }
}
