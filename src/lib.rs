use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_human_bytes as hex_bytes;
use sha2::{Digest, Sha256};

pub use machine::Machine;

use util::{measure_log, measure_sha384};

mod acpi;
mod kernel;
mod machine;
mod num;
mod rtmr3;
mod tdvf;
mod util;

/// Contains all the measurement values for TDX.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TdxMeasurements {
    #[serde(with = "hex_bytes")]
    pub mrtd: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub rtmr0: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub rtmr1: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub rtmr2: Vec<u8>,
    /// Workload register; empty unless rootfs or compose inputs were given.
    #[serde(with = "hex_bytes")]
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub rtmr3: Vec<u8>,
}

impl TdxMeasurements {
    /// mr_aggregated = sha256(mrtd ‖ rtmr0 ‖ rtmr1 ‖ rtmr2 ‖ [rtmr3] ‖ mr_key_provider)
    pub fn mr_aggregated(&self, mr_key_provider: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.mrtd);
        hasher.update(&self.rtmr0);
        hasher.update(&self.rtmr1);
        hasher.update(&self.rtmr2);
        if !self.rtmr3.is_empty() {
            hasher.update(&self.rtmr3);
        }
        hasher.update(mr_key_provider);
        hex::encode(hasher.finalize())
    }

    /// mr_image = sha256(mrtd ‖ rtmr1 ‖ rtmr2 ‖ [rtmr3])
    pub fn mr_image(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.mrtd);
        hasher.update(&self.rtmr1);
        hasher.update(&self.rtmr2);
        if !self.rtmr3.is_empty() {
            hasher.update(&self.rtmr3);
        }
        hex::encode(hasher.finalize())
    }
}

/// Well-known key provider measurements addressable by name.
const KEY_PROVIDER_ALIASES: &[(&str, &str)] = &[
    (
        "none",
        "0000000000000000000000000000000000000000000000000000000000000000",
    ),
    (
        "sgx-v0",
        "4888fa84170cff49a280030dd2fedf238a637425adf6656e22cde7f2be31b2cc",
    ),
];

/// Resolves a key provider measurement from a known alias or a hex string
/// (with or without a `0x` prefix) into its 32 raw bytes.
pub fn resolve_key_provider(value: &str) -> Result<Vec<u8>> {
    let value = KEY_PROVIDER_ALIASES
        .iter()
        .find(|(name, _)| *name == value)
        .map(|(_, measurement)| *measurement)
        .unwrap_or(value);
    let value = value.strip_prefix("0x").unwrap_or(value);
    let measurement = hex::decode(value).context("invalid key provider measurement")?;
    if measurement.len() != 32 {
        bail!(
            "key provider measurement must be 32 bytes, got {}",
            measurement.len()
        );
    }
    Ok(measurement)
}
