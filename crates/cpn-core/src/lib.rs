//! Core domain model and record normalization for CPN.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "cpn-core";

/// One instance entry as published by a pricing feed: attribute name -> raw string value.
pub type RawRecord = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DimensionKind {
    Region,
    OperatingSystem,
    VcpuCoreCount,
}

impl fmt::Display for DimensionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DimensionKind::Region => "region",
            DimensionKind::OperatingSystem => "operating_system",
            DimensionKind::VcpuCoreCount => "vcpu_core_count",
        };
        f.write_str(name)
    }
}

/// A dimension value identified by its natural key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Dimension {
    Region(String),
    OperatingSystem(String),
    VcpuCoreCount(u32),
}

impl Dimension {
    pub fn kind(&self) -> DimensionKind {
        match self {
            Dimension::Region(_) => DimensionKind::Region,
            Dimension::OperatingSystem(_) => DimensionKind::OperatingSystem,
            Dimension::VcpuCoreCount(_) => DimensionKind::VcpuCoreCount,
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Region(name) | Dimension::OperatingSystem(name) => {
                write!(f, "{}={name}", self.kind())
            }
            Dimension::VcpuCoreCount(count) => write!(f, "{}={count}", self.kind()),
        }
    }
}

/// Attribute names used to pull each required field out of a [`RawRecord`].
///
/// Key casing differs between feeds (`price` vs `Price`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    #[serde(default = "default_instance_name")]
    pub instance_name: String,
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default = "default_storage")]
    pub storage: String,
    #[serde(default = "default_network_performance")]
    pub network_performance: String,
    #[serde(default = "default_operating_system")]
    pub operating_system: String,
    #[serde(default = "default_vcpu")]
    pub vcpu: String,
    #[serde(default = "default_price")]
    pub price: String,
}

fn default_instance_name() -> String {
    "Instance Name".to_string()
}
fn default_memory() -> String {
    "Memory".to_string()
}
fn default_storage() -> String {
    "Storage".to_string()
}
fn default_network_performance() -> String {
    "Network Performance".to_string()
}
fn default_operating_system() -> String {
    "Operating System".to_string()
}
fn default_vcpu() -> String {
    "vCPU".to_string()
}
fn default_price() -> String {
    "price".to_string()
}

impl Default for FieldMapping {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            memory: default_memory(),
            storage: default_storage(),
            network_performance: default_network_performance(),
            operating_system: default_operating_system(),
            vcpu: default_vcpu(),
            price: default_price(),
        }
    }
}

/// Typed, validated view of one feed entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingRecord {
    pub instance_name: String,
    pub memory_gib: f64,
    pub storage: String,
    pub network_performance: String,
    pub operating_system: String,
    pub vcpu_count: u32,
    pub price_per_hour: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizationError {
    #[error("missing required field `{field}`")]
    MissingField { field: String },
    #[error("malformed value for `{field}`: {raw:?}")]
    MalformedValue { field: String, raw: String },
}

impl NormalizationError {
    pub fn field(&self) -> &str {
        match self {
            NormalizationError::MissingField { field } => field,
            NormalizationError::MalformedValue { field, .. } => field,
        }
    }
}

/// Convert one raw attribute map into a [`PricingRecord`].
///
/// Empty or whitespace-only values count as missing. Storage and network
/// performance are passed through as published, surrounding whitespace included.
pub fn normalize(raw: &RawRecord, mapping: &FieldMapping) -> Result<PricingRecord, NormalizationError> {
    let instance_name = required(raw, &mapping.instance_name)?;
    let memory_raw = required(raw, &mapping.memory)?;
    let storage = required(raw, &mapping.storage)?;
    let network_performance = required(raw, &mapping.network_performance)?;
    let operating_system = required(raw, &mapping.operating_system)?;
    let vcpu_raw = required(raw, &mapping.vcpu)?;
    let price_raw = required(raw, &mapping.price)?;

    let memory_gib = parse_unit_suffixed(memory_raw.trim())
        .ok_or_else(|| malformed(&mapping.memory, memory_raw))?;
    let vcpu_count = vcpu_raw
        .trim()
        .parse::<u32>()
        .map_err(|_| malformed(&mapping.vcpu, vcpu_raw))?;
    let price_per_hour = parse_currency_prefixed(price_raw.trim())
        .ok_or_else(|| malformed(&mapping.price, price_raw))?;

    Ok(PricingRecord {
        instance_name: instance_name.trim().to_string(),
        memory_gib,
        storage: storage.to_string(),
        network_performance: network_performance.to_string(),
        operating_system: operating_system.trim().to_string(),
        vcpu_count,
        price_per_hour,
    })
}

fn required<'a>(raw: &'a RawRecord, field: &str) -> Result<&'a str, NormalizationError> {
    raw.get(field)
        .map(String::as_str)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| NormalizationError::MissingField {
            field: field.to_string(),
        })
}

fn malformed(field: &str, raw: &str) -> NormalizationError {
    NormalizationError::MalformedValue {
        field: field.to_string(),
        raw: raw.to_string(),
    }
}

const MEMORY_UNIT: &str = "GiB";

/// "3.75 GiB" -> 3.75, "3,904 GiB" -> 3904.0, bare "16" -> 16.0. Any unit
/// other than GiB is rejected.
fn parse_unit_suffixed(value: &str) -> Option<f64> {
    let number_end = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == ','))
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(number_end);
    let unit = unit.trim();
    if !unit.is_empty() && unit != MEMORY_UNIT {
        return None;
    }
    parse_non_negative(number)
}

/// "$0.0116" -> 0.0116. Anything after the number is rejected.
fn parse_currency_prefixed(value: &str) -> Option<f64> {
    let number = value.trim_start_matches(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-'));
    parse_non_negative(number.trim())
}

fn parse_non_negative(number: &str) -> Option<f64> {
    let cleaned = number.replace(',', "");
    if cleaned.is_empty() {
        return None;
    }
    cleaned
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
}
