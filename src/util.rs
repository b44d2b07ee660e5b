use anyhow::{bail, Context, Result};
use log::debug;
use sha2::{Digest, Sha384};

/// Computes a SHA384 hash of the given data.
pub(crate) fn measure_sha384(data: &[u8]) -> Vec<u8> {
    Sha384::new_with_prefix(data).finalize().to_vec()
}

pub(crate) fn utf16_encode(input: &str) -> Vec<u8> {
    input
        .encode_utf16()
        .flat_map(|c| c.to_le_bytes().into_iter())
        .collect()
}

pub(crate) fn debug_print_log(name: &str, log: &[Vec<u8>]) {
    debug!("{name} event log:");
    for (i, entry) in log.iter().enumerate() {
        debug!("[{i}] digest: {}", hex::encode(entry));
    }
}

/// Computes a measurement of the given RTMR event log.
pub(crate) fn measure_log(log: &[Vec<u8>]) -> Vec<u8> {
    let mut mr = [0u8; 48]; // SHA384 output size
    for entry in log {
        let mut hasher = Sha384::new();
        hasher.update(mr);
        hasher.update(entry);
        mr = hasher.finalize().into();
    }
    mr.to_vec()
}

/// Encodes a canonical five-field UEFI GUID into its 16-byte binary form.
/// The first three fields are little-endian, the last two big-endian.
pub(crate) fn encode_guid(guid: &str) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(16);
    for (idx, atom) in guid.split('-').enumerate() {
        let raw = hex::decode(atom).with_context(|| format!("bad GUID: {guid}"))?;
        if idx <= 2 {
            data.extend(raw.iter().rev());
        } else {
            data.extend_from_slice(&raw);
        }
    }
    if data.len() != 16 {
        bail!("bad GUID: {guid}");
    }
    Ok(data)
}

/// Measures an EFI variable event: the encoded vendor GUID, the name length
/// in characters, a zero data length, then the UTF-16LE name.
pub(crate) fn measure_efi_variable(vendor_guid: &str, var_name: &str) -> Result<Vec<u8>> {
    let mut data = encode_guid(vendor_guid)?;
    data.extend((var_name.len() as u64).to_le_bytes());
    data.extend(0u64.to_le_bytes());
    data.extend(utf16_encode(var_name));
    Ok(measure_sha384(&data))
}
