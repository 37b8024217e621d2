//! Component health and diagnostics reporting.
//!
//! Every sensor, reading, and knob can report a JSON status fragment; the
//! device manager folds them into one tree for the `report_status` façade.

use serde_json::Value;

/// Two-level component health. Warnings never stop the tick loop; they are
/// surfaced so the service-level health aggregator can flag the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Health {
    Ok,
    Warning,
}

impl Health {
    pub fn name(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Warning => "WARNING",
        }
    }

    /// Most restrictive health wins.
    pub fn fold(iter: impl IntoIterator<Item = Health>) -> Health {
        iter.into_iter().max().unwrap_or(Health::Ok)
    }
}

/// Implemented by every component that shows up in diagnostics dumps.
pub trait StatusProvider {
    /// Merge this component's status fragment into `out`.
    fn report_status(&self, out: &mut Value);

    fn health(&self) -> Health;
}

/// Append `entry` to `out[section][key]`, creating the arrays on first use.
pub fn push_status(out: &mut Value, section: &str, key: &str, entry: Value) {
    let slot = &mut out[section][key];
    if slot.is_null() {
        *slot = Value::Array(vec![entry]);
    } else if let Some(list) = slot.as_array_mut() {
        list.push(entry);
    }
}
