//! Inspection of fused output files
//!
//! Backs the `inspect` command: dimensions, variables and a finite-value
//! summary of every variable.

use crate::errors::Result;
use netcdf::{AttributeValue, File};
use std::path::Path;

/// Information about a dimension
#[derive(Debug, Clone)]
pub struct DimensionInfo {
    pub name: String,
    pub length: usize,
    pub is_unlimited: bool,
}

/// Finite-value statistics of one variable
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueSummary {
    pub min: f64,
    pub mean: f64,
    pub max: f64,
    pub valid: usize,
    pub total: usize,
}

impl ValueSummary {
    /// `None` when no value is finite
    #[must_use]
    pub fn from_values(values: &[f64]) -> Option<Self> {
        let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        if finite.is_empty() {
            return None;
        }
        Some(Self {
            min: finite.iter().copied().fold(f64::INFINITY, f64::min),
            max: finite.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            mean: finite.iter().sum::<f64>() / finite.len() as f64,
            valid: finite.len(),
            total: values.len(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct VariableInfo {
    pub name: String,
    pub dimensions: Vec<String>,
    pub shape: Vec<usize>,
    pub units: Option<String>,
    pub summary: Option<ValueSummary>,
}

#[derive(Debug, Clone)]
pub struct FileSummary {
    pub dimensions: Vec<DimensionInfo>,
    pub variables: Vec<VariableInfo>,
    pub history: Option<String>,
}

fn string_attribute(value: Option<AttributeValue>) -> Option<String> {
    match value? {
        AttributeValue::Str(s) => Some(s),
        _ => None,
    }
}

/// Summarize an open file.
pub fn summarize(file: &File) -> Result<FileSummary> {
    let mut dimensions: Vec<DimensionInfo> = file
        .dimensions()
        .map(|d| DimensionInfo {
            name: d.name().to_string(),
            length: d.len(),
            is_unlimited: d.is_unlimited(),
        })
        .collect();
    dimensions.sort_by(|a, b| a.name.cmp(&b.name));

    let mut variables = Vec::new();
    for var in file.variables() {
        let values = var.get_values::<f64, _>(..).ok();
        variables.push(VariableInfo {
            name: var.name().to_string(),
            dimensions: var.dimensions().iter().map(|d| d.name().to_string()).collect(),
            shape: var.dimensions().iter().map(|d| d.len()).collect(),
            units: string_attribute(var.attribute("units").and_then(|a| a.value().ok())),
            summary: values.as_deref().and_then(ValueSummary::from_values),
        });
    }
    variables.sort_by(|a, b| a.name.cmp(&b.name));

    let history = string_attribute(file.attribute("history").and_then(|a| a.value().ok()));
    Ok(FileSummary {
        dimensions,
        variables,
        history,
    })
}

/// Open and summarize `path`.
pub fn inspect(path: &Path) -> Result<FileSummary> {
    let file = netcdf::open(path)?;
    summarize(&file)
}

/// Print a summary in a human-readable layout.
pub fn print_summary(summary: &FileSummary) {
    println!("\n Dimensions");
    println!("==============");
    if summary.dimensions.is_empty() {
        println!("   (No dimensions found)");
    }
    for dim in &summary.dimensions {
        let length_info = if dim.is_unlimited {
            format!("{} (unlimited)", dim.length)
        } else {
            dim.length.to_string()
        };
        println!("    {} = {}", dim.name, length_info);
    }

    println!("\n Variables");
    println!("=============");
    for var in &summary.variables {
        let shape: Vec<String> = var.shape.iter().map(ToString::to_string).collect();
        let units = var.units.as_deref().map(|u| format!(" [{u}]")).unwrap_or_default();
        println!(
            "    {}{}: ({}) = ({})",
            var.name,
            units,
            var.dimensions.join(", "),
            shape.join(" x ")
        );
        match &var.summary {
            Some(s) => println!(
                "      min {:.4}  mean {:.4}  max {:.4}  valid {}/{}",
                s.min, s.mean, s.max, s.valid, s.total
            ),
            None => println!("      no finite values"),
        }
    }

    if let Some(history) = &summary.history {
        println!("\n History: {history}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_ignores_non_finite_values() {
        let s = ValueSummary::from_values(&[1.0, f64::NAN, 3.0]).unwrap();
        assert_eq!((s.min, s.mean, s.max), (1.0, 2.0, 3.0));
        assert_eq!((s.valid, s.total), (2, 3));
        assert!(ValueSummary::from_values(&[f64::NAN]).is_none());
    }
}
