//! Monitors
//!
//! A monitor observes the chain after every generation. [`TraceMonitor`]
//! keeps the sampled values in memory and writes them out as JSON lines,
//! one object per sample.

use std::io::Write;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::ResourceError;
use crate::graph::{Model, NodeKind};
use crate::value::Value;

/// Observer of a running chain.
pub trait Monitor: Send {
    /// Called once before the first generation.
    fn on_start(&mut self, _model: &Model) {}

    /// Called after every generation.
    fn on_sample(&mut self, generation: u64, model: &Model);
}

/// One sample of the trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRow {
    pub generation: u64,
    pub posterior: f64,
    pub likelihood: f64,
    pub prior: f64,
    pub values: IndexMap<String, Value>,
}

/// In-memory trace of node values every `every` generations.
#[derive(Debug, Clone)]
pub struct TraceMonitor {
    every: u64,
    nodes: Vec<String>,
    rows: Vec<TraceRow>,
}

impl TraceMonitor {
    /// Trace the named nodes. With no names, every free stochastic node of
    /// the model is traced.
    pub fn new(every: u64, nodes: &[&str]) -> Self {
        Self {
            every: every.max(1),
            nodes: nodes.iter().map(|n| n.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn rows(&self) -> &[TraceRow] {
        &self.rows
    }

    /// Values of one node across the trace. Samples where the node had no
    /// value are skipped.
    pub fn column(&self, node: &str) -> Vec<Value> {
        self.rows
            .iter()
            .filter_map(|row| row.values.get(node).cloned())
            .collect()
    }

    /// Every traced parameter as a column of reals. Vector nodes contribute
    /// one column per element, named `node[i]`.
    pub fn parameter_columns(&self) -> Vec<(String, Vec<f64>)> {
        let mut columns = Vec::new();
        for node in &self.nodes {
            let rows: Vec<Value> = self.column(node);
            match rows.first() {
                None => {}
                Some(Value::RealVector(first)) => {
                    for i in 0..first.len() {
                        let column = rows
                            .iter()
                            .filter_map(|v| v.to_reals().get(i).copied())
                            .collect();
                        columns.push((format!("{node}[{i}]"), column));
                    }
                }
                Some(_) => {
                    let column = rows
                        .iter()
                        .filter_map(|v| v.to_reals().first().copied())
                        .collect();
                    columns.push((node.clone(), column));
                }
            }
        }
        columns
    }

    pub fn to_json_lines(&self) -> Result<String, ResourceError> {
        let mut out = String::new();
        for row in &self.rows {
            out.push_str(&serde_json::to_string(row)?);
            out.push('\n');
        }
        Ok(out)
    }

    pub fn write_json_lines(&self, path: impl AsRef<Path>) -> Result<(), ResourceError> {
        let path = path.as_ref();
        let io = |source| ResourceError::Io {
            path: path.display().to_string(),
            source,
        };
        let mut file = std::fs::File::create(path).map_err(io)?;
        file.write_all(self.to_json_lines()?.as_bytes()).map_err(io)?;
        Ok(())
    }
}

impl Monitor for TraceMonitor {
    fn on_start(&mut self, model: &Model) {
        if self.nodes.is_empty() {
            self.nodes = model
                .nodes()
                .filter(|n| n.kind() == NodeKind::Stochastic && !n.is_clamped())
                .map(|n| n.name().to_string())
                .collect();
        }
    }

    fn on_sample(&mut self, generation: u64, model: &Model) {
        if generation % self.every != 0 {
            return;
        }
        let values = self
            .nodes
            .iter()
            .filter_map(|name| {
                let value = model.node(name)?.value().ok()?;
                Some((name.clone(), value))
            })
            .collect();
        let likelihood = model.ln_likelihood();
        let prior = model.ln_prior();
        self.rows.push(TraceRow {
            generation,
            posterior: likelihood + prior,
            likelihood,
            prior,
            values,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::Exponential;
    use crate::function::Exp;
    use crate::random::RandomNumberGenerator;

    fn model() -> Model {
        let mut rng = RandomNumberGenerator::new(1);
        let mut model = Model::new("m");
        model.constant("rate", 1.0).unwrap();
        model
            .stochastic("x", Exponential, &["rate"], &mut rng)
            .unwrap();
        model.deterministic("e", Exp, &["x"]).unwrap();
        model.observed("y", Exponential, &["x"], 0.3).unwrap();
        model
    }

    #[test]
    fn traces_free_stochastic_nodes_by_default() {
        let model = model();
        let mut monitor = TraceMonitor::new(2, &[]);
        monitor.on_start(&model);
        for generation in 0..5 {
            monitor.on_sample(generation, &model);
        }
        assert_eq!(monitor.rows().len(), 3);
        assert_eq!(monitor.column("x").len(), 3);
        assert!(monitor.column("y").is_empty());
        let row = &monitor.rows()[0];
        assert_eq!(row.posterior, row.likelihood + row.prior);
    }

    #[test]
    fn vector_nodes_give_one_column_per_element() {
        let mut rng = RandomNumberGenerator::new(2);
        let mut model = model();
        model
            .stochastic("v", crate::distribution::Iid::new(Exponential, 2), &["rate"], &mut rng)
            .unwrap();
        let mut monitor = TraceMonitor::new(1, &["x", "v"]);
        monitor.on_start(&model);
        for generation in 0..3 {
            monitor.on_sample(generation, &model);
        }

        let columns = monitor.parameter_columns();
        let names: Vec<&str> = columns.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["x", "v[0]", "v[1]"]);
        assert!(columns.iter().all(|(_, c)| c.len() == 3));
    }

    #[test]
    fn json_lines_have_one_row_per_sample() {
        let model = model();
        let mut monitor = TraceMonitor::new(1, &["x", "e"]);
        monitor.on_start(&model);
        monitor.on_sample(0, &model);
        monitor.on_sample(1, &model);

        let text = monitor.to_json_lines().unwrap();
        let rows: Vec<TraceRow> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].generation, 1);
        assert_eq!(rows[1].values.keys().collect::<Vec<_>>(), ["x", "e"]);
    }
}
