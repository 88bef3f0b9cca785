use serde::{Deserialize, Serialize};

/// One input row's address together with the key it is cached under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
    pub address: String,
    pub normalized_key: String,
}

impl AddressRecord {
    pub fn new(address: impl Into<String>) -> Self {
        let address = address.into();
        let normalized_key = normalize_address(&address);
        Self {
            address,
            normalized_key,
        }
    }

    pub fn is_blank(&self) -> bool {
        self.normalized_key.is_empty()
    }
}

/// A parsed input row: its position, untouched fields, and address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputRow {
    pub index: usize,
    pub fields: Vec<String>,
    pub address: AddressRecord,
}

impl InputRow {
    pub fn new(index: usize, fields: Vec<String>, address: impl Into<String>) -> Self {
        Self {
            index,
            fields,
            address: AddressRecord::new(address),
        }
    }
}

/// Canonical cache key: trimmed, case-folded, whitespace collapsed, and
/// spaces before commas dropped.
pub fn normalize_address(address: &str) -> String {
    let collapsed = address
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    collapsed.replace(" ,", ",")
}
