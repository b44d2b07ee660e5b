//! Workload measurements extended into RTMR3 by SecretVM-style guests.

use anyhow::{Context, Result};
use fs_err as fs;
use sha2::{Digest, Sha256, Sha384};

use crate::measure_log;
use crate::util::debug_print_log;
use crate::Machine;

/// Event type tag carried by every workload measurement record.
const EVENT_TYPE_WORKLOAD: u32 = 0x0800_0001;

/// Digest of one workload event record: the little-endian event type, the
/// event name and the payload, joined by ':' separators.
pub(crate) fn event_digest(event_type: u32, name: &str, payload: &[u8]) -> Vec<u8> {
    let mut hasher = Sha384::new();
    hasher.update(event_type.to_le_bytes());
    hasher.update(b":");
    hasher.update(name.as_bytes());
    hasher.update(b":");
    hasher.update(payload);
    hasher.finalize().to_vec()
}

fn file_sha256(path: &str) -> Result<Vec<u8>> {
    let data = fs::read(path)?;
    Ok(Sha256::digest(&data).to_vec())
}

/// Replays the RTMR3 event log from the machine's workload inputs: the rootfs
/// image, the compose file, then each Dockerfile in argument order. Returns
/// an empty register when no workload inputs are configured.
pub(crate) fn measure_rtmr3(machine: &Machine) -> Result<Vec<u8>> {
    let mut rtmr3_log = Vec::new();
    if let Some(rootfs) = machine.rootfs {
        let payload = file_sha256(rootfs).context("Failed to hash rootfs image")?;
        rtmr3_log.push(event_digest(EVENT_TYPE_WORKLOAD, "rootfs-hash", &payload));
    }
    if let Some(compose) = machine.docker_compose {
        let payload = file_sha256(compose).context("Failed to hash docker-compose file")?;
        rtmr3_log.push(event_digest(EVENT_TYPE_WORKLOAD, "compose-hash", &payload));
    }
    for dockerfile in &machine.dockerfiles {
        let payload = file_sha256(dockerfile).context("Failed to hash Dockerfile")?;
        rtmr3_log.push(event_digest(EVENT_TYPE_WORKLOAD, "dockerfile-hash", &payload));
    }

    if rtmr3_log.is_empty() {
        return Ok(Vec::new());
    }
    debug_print_log("RTMR3", &rtmr3_log);
    Ok(measure_log(&rtmr3_log))
}
