//! Reconstructs the ACPI artifacts QEMU places in guest memory: the patched
//! table stream, the RSDP, and the fw_cfg table-loader command blob.

use std::collections::HashMap;
use std::io::Read;

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use fs_err as fs;
use log::debug;

use crate::Machine;

const LDR_LENGTH: usize = 4096;
const FIXED_STRING_LEN: usize = 56;

/// Memory split boundary at 2816 MiB.
const MEMORY_SPLIT: u64 = 0xB000_0000;

/// The PCI memory window length field sits this far before the end of the
/// DSDT; the range minimum sits 12 bytes earlier.
const DSDT_WINDOW_LENGTH_OFFSET: u32 = 0x2AC;

/// Gzipped JSON catalog mapping decimal CPU counts to hex-encoded ACPI table
/// templates dumped from QEMU.
static TEMPLATE_CATALOG_GZ: &[u8] = include_bytes!("templates.json.gz");

#[derive(Debug)]
pub(crate) struct Tables {
    pub tables: Vec<u8>,
    pub rsdp: Vec<u8>,
    pub loader: Vec<u8>,
}

/// Location of one table within the template stream.
#[derive(Debug, Clone, Copy)]
struct AcpiTable {
    offset: u32,
    checksum_offset: u32,
    length: u32,
}

impl Machine<'_> {
    fn load_template(&self) -> Result<Vec<u8>> {
        if self.cpu_count == 0 {
            bail!("cpuCount must be greater than 0");
        }
        let tpl_hex = match self.templates_dir {
            Some(dir) => {
                let path = format!("{dir}/template_qemu_cpu{}.hex", self.cpu_count);
                debug!("loading ACPI table template from {path}");
                fs::read_to_string(&path).context("template for ACPI tables is not available")?
            }
            None => {
                let mut decoder = GzDecoder::new(TEMPLATE_CATALOG_GZ);
                let mut catalog_json = Vec::new();
                decoder
                    .read_to_end(&mut catalog_json)
                    .context("malformed embedded ACPI template catalog")?;
                let mut catalog: HashMap<String, String> =
                    serde_json::from_slice(&catalog_json)
                        .context("malformed embedded ACPI template catalog")?;
                catalog
                    .remove(&self.cpu_count.to_string())
                    .with_context(|| {
                        format!("template for {} CPUs is not available", self.cpu_count)
                    })?
            }
        };
        hex::decode(tpl_hex.trim()).context("malformed ACPI table template")
    }

    /// Builds the patched ACPI table stream, the RSDP, and the table-loader
    /// command blob for this machine configuration.
    pub(crate) fn build_tables(&self) -> Result<Tables> {
        let mut tpl = self.load_template()?;

        let dsdt = find_acpi_table(&tpl, "DSDT")?;
        let facp = find_acpi_table(&tpl, "FACP")?;
        let apic = find_acpi_table(&tpl, "APIC")?;
        let mcfg = find_acpi_table(&tpl, "MCFG")?;
        let waet = find_acpi_table(&tpl, "WAET")?;
        let rsdt = find_acpi_table(&tpl, "RSDT")?;

        patch_dsdt_memory_window(&mut tpl, dsdt, self.memory_size)?;

        let rsdp = generate_rsdp(rsdt.offset);
        let loader = generate_table_loader(dsdt, facp, apic, mcfg, waet, rsdt)?;
        debug!(
            "ACPI tables: {} bytes, RSDP: {} bytes, loader: {} bytes",
            tpl.len(),
            rsdp.len(),
            loader.len()
        );

        Ok(Tables {
            tables: tpl,
            rsdp,
            loader,
        })
    }
}

/// Rewrites the DSDT PCI memory window to match guest RAM.
fn patch_dsdt_memory_window(tpl: &mut [u8], dsdt: AcpiTable, memory_size: u64) -> Result<()> {
    if dsdt.length < DSDT_WINDOW_LENGTH_OFFSET + 12 {
        bail!("DSDT table is too short to hold the memory window");
    }
    let length_offset = (dsdt.offset + dsdt.length - DSDT_WINDOW_LENGTH_OFFSET) as usize;
    let range_minimum_offset = length_offset - 12;
    if length_offset + 4 > tpl.len() {
        bail!("DSDT memory window lies outside the template");
    }

    let (range_minimum, length) = if memory_size >= MEMORY_SPLIT {
        (0x8000_0000u32, 0x6000_0000u32)
    } else {
        let range_minimum = memory_size as u32;
        (range_minimum, 0xE000_0000 - range_minimum)
    };
    tpl[range_minimum_offset..range_minimum_offset + 4]
        .copy_from_slice(&range_minimum.to_le_bytes());
    tpl[length_offset..length_offset + 4].copy_from_slice(&length.to_le_bytes());
    Ok(())
}

fn generate_rsdp(rsdt_offset: u32) -> Vec<u8> {
    let mut rsdp = Vec::with_capacity(20);
    rsdp.extend_from_slice(b"RSD PTR "); // Signature
    rsdp.push(0x00); // Checksum, patched by the loader
    rsdp.extend_from_slice(b"BOCHS "); // OEM ID
    rsdp.push(0x00); // Revision
    rsdp.extend_from_slice(&rsdt_offset.to_le_bytes()); // RSDT address
    rsdp
}

fn generate_table_loader(
    dsdt: AcpiTable,
    facp: AcpiTable,
    apic: AcpiTable,
    mcfg: AcpiTable,
    waet: AcpiTable,
    rsdt: AcpiTable,
) -> Result<Vec<u8>> {
    let mut ldr = TableLoader::new();
    ldr.append(LoaderCmd::Allocate {
        file: "etc/acpi/rsdp",
        alignment: 16,
        zone: 2,
    });
    ldr.append(LoaderCmd::Allocate {
        file: "etc/acpi/tables",
        alignment: 64,
        zone: 1,
    });

    ldr.append(LoaderCmd::AddChecksum {
        file: "etc/acpi/tables",
        result_offset: dsdt.checksum_offset,
        start: dsdt.offset,
        length: dsdt.length,
    });
    // FACP links: DSDT, FIRMWARE_CTRL and X_DSDT pointers.
    for (pointer_offset, pointer_size) in [(36, 4), (40, 4), (140, 8)] {
        ldr.append(LoaderCmd::AddPtr {
            pointer_file: "etc/acpi/tables",
            pointee_file: "etc/acpi/tables",
            pointer_offset: facp.offset + pointer_offset,
            pointer_size,
        });
    }
    for table in [facp, apic, mcfg, waet] {
        ldr.append(LoaderCmd::AddChecksum {
            file: "etc/acpi/tables",
            result_offset: table.checksum_offset,
            start: table.offset,
            length: table.length,
        });
    }
    // RSDT entries for the four tables above.
    for pointer_offset in [36, 40, 44, 48] {
        ldr.append(LoaderCmd::AddPtr {
            pointer_file: "etc/acpi/tables",
            pointee_file: "etc/acpi/tables",
            pointer_offset: rsdt.offset + pointer_offset,
            pointer_size: 4,
        });
    }
    ldr.append(LoaderCmd::AddChecksum {
        file: "etc/acpi/tables",
        result_offset: rsdt.checksum_offset,
        start: rsdt.offset,
        length: rsdt.length,
    });

    ldr.append(LoaderCmd::AddPtr {
        pointer_file: "etc/acpi/rsdp",
        pointee_file: "etc/acpi/tables",
        pointer_offset: 16,
        pointer_size: 4,
    });
    ldr.append(LoaderCmd::AddChecksum {
        file: "etc/acpi/rsdp",
        result_offset: 8,
        start: 0,
        length: 20,
    });

    if ldr.buffer.len() > LDR_LENGTH {
        bail!(
            "table-loader command blob overruns {LDR_LENGTH} bytes ({} generated)",
            ldr.buffer.len()
        );
    }
    ldr.buffer.resize(LDR_LENGTH, 0);
    Ok(ldr.buffer)
}

/// A QEMU fw_cfg table-loader command. Each serializes to 128 bytes.
#[derive(Debug)]
enum LoaderCmd<'a> {
    Allocate {
        file: &'a str,
        alignment: u32,
        zone: u8,
    },
    AddPtr {
        pointer_file: &'a str,
        pointee_file: &'a str,
        pointer_offset: u32,
        pointer_size: u8,
    },
    AddChecksum {
        file: &'a str,
        result_offset: u32,
        start: u32,
        length: u32,
    },
}

struct TableLoader {
    buffer: Vec<u8>,
}

impl TableLoader {
    fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(LDR_LENGTH),
        }
    }

    fn append(&mut self, cmd: LoaderCmd) {
        qemu_loader_append(&mut self.buffer, cmd);
    }
}

/// Appends a fixed-length, null-padded string to the data buffer.
fn append_fixed_string(data: &mut Vec<u8>, s: &str) {
    let mut s_bytes = s.as_bytes().to_vec();
    s_bytes.resize(FIXED_STRING_LEN, 0);
    data.extend_from_slice(&s_bytes);
}

/// Appends a serialized QEMU loader command to the data buffer.
fn qemu_loader_append(data: &mut Vec<u8>, cmd: LoaderCmd) {
    match cmd {
        LoaderCmd::Allocate {
            file,
            alignment,
            zone,
        } => {
            data.extend_from_slice(&[0x01, 0x00, 0x00, 0x00]);
            append_fixed_string(data, file);
            data.extend_from_slice(&alignment.to_le_bytes());
            data.push(zone);
            data.resize(data.len() + 63, 0); // Padding
        }
        LoaderCmd::AddPtr {
            pointer_file,
            pointee_file,
            pointer_offset,
            pointer_size,
        } => {
            data.extend_from_slice(&[0x02, 0x00, 0x00, 0x00]);
            append_fixed_string(data, pointer_file);
            append_fixed_string(data, pointee_file);
            data.extend_from_slice(&pointer_offset.to_le_bytes());
            data.push(pointer_size);
            data.resize(data.len() + 7, 0); // Padding
        }
        LoaderCmd::AddChecksum {
            file,
            result_offset,
            start,
            length,
        } => {
            data.extend_from_slice(&[0x03, 0x00, 0x00, 0x00]);
            append_fixed_string(data, file);
            data.extend_from_slice(&result_offset.to_le_bytes());
            data.extend_from_slice(&start.to_le_bytes());
            data.extend_from_slice(&length.to_le_bytes());
            data.resize(data.len() + 56, 0); // Padding
        }
    }
}

/// Searches for an ACPI table with the given signature and returns its
/// location within the stream.
fn find_acpi_table(tables: &[u8], signature: &str) -> Result<AcpiTable> {
    let sig_bytes = signature.as_bytes();
    if sig_bytes.len() != 4 {
        bail!("Signature must be 4 bytes long, but got '{signature}'");
    }

    let mut offset = 0;
    while offset < tables.len() {
        if offset + 8 > tables.len() {
            bail!("Table not found: {signature}");
        }

        let tbl_sig = &tables[offset..offset + 4];
        let tbl_len_bytes: [u8; 4] = tables[offset + 4..offset + 8].try_into().unwrap();
        let tbl_len = u32::from_le_bytes(tbl_len_bytes) as usize;

        if tbl_sig == sig_bytes {
            return Ok(AcpiTable {
                offset: offset as u32,
                checksum_offset: (offset + 9) as u32,
                length: tbl_len as u32,
            });
        }

        if tbl_len == 0 {
            bail!("Found table with zero length at offset {offset}");
        }
        offset += tbl_len;
    }

    bail!("Table not found: {signature}");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_table(sig: &str, len: usize) -> Vec<u8> {
        let mut table = vec![0u8; len];
        table[..4].copy_from_slice(sig.as_bytes());
        table[4..8].copy_from_slice(&(len as u32).to_le_bytes());
        table
    }

    fn make_stream() -> Vec<u8> {
        let mut stream = Vec::new();
        stream.extend(make_table("DSDT", 0x2C0 + 36));
        stream.extend(make_table("FACP", 276));
        stream.extend(make_table("APIC", 120));
        stream.extend(make_table("MCFG", 60));
        stream.extend(make_table("WAET", 40));
        stream.extend(make_table("RSDT", 52));
        stream
    }

    #[test]
    fn finds_tables_by_signature() {
        let stream = make_stream();
        let dsdt = find_acpi_table(&stream, "DSDT").unwrap();
        assert_eq!(dsdt.offset, 0);
        assert_eq!(dsdt.checksum_offset, 9);
        assert_eq!(dsdt.length, 0x2C0 + 36);

        let facp = find_acpi_table(&stream, "FACP").unwrap();
        assert_eq!(facp.offset, dsdt.length);

        let rsdt = find_acpi_table(&stream, "RSDT").unwrap();
        assert_eq!(rsdt.offset as usize, stream.len() - 52);

        assert!(find_acpi_table(&stream, "SSDT").is_err());
    }

    #[test]
    fn zero_length_table_stops_the_walk() {
        let mut stream = make_table("DSDT", 64);
        stream[4..8].copy_from_slice(&0u32.to_le_bytes());
        let err = find_acpi_table(&stream, "FACP").unwrap_err();
        assert!(err.to_string().contains("zero length"));
    }

    #[test]
    fn dsdt_patch_below_split_boundary() {
        let mut stream = make_stream();
        let dsdt = find_acpi_table(&stream, "DSDT").unwrap();
        patch_dsdt_memory_window(&mut stream, dsdt, 2815 << 20).unwrap();

        let length_offset = (dsdt.length - DSDT_WINDOW_LENGTH_OFFSET) as usize;
        let range_minimum =
            u32::from_le_bytes(stream[length_offset - 12..length_offset - 8].try_into().unwrap());
        let length = u32::from_le_bytes(stream[length_offset..length_offset + 4].try_into().unwrap());
        assert_eq!(range_minimum, 2815 << 20);
        assert_eq!(length, 0xE000_0000 - (2815 << 20));
    }

    #[test]
    fn dsdt_patch_at_split_boundary() {
        let mut stream = make_stream();
        let dsdt = find_acpi_table(&stream, "DSDT").unwrap();
        patch_dsdt_memory_window(&mut stream, dsdt, 2816 << 20).unwrap();

        let length_offset = (dsdt.length - DSDT_WINDOW_LENGTH_OFFSET) as usize;
        let range_minimum =
            u32::from_le_bytes(stream[length_offset - 12..length_offset - 8].try_into().unwrap());
        let length = u32::from_le_bytes(stream[length_offset..length_offset + 4].try_into().unwrap());
        assert_eq!(range_minimum, 0x8000_0000);
        assert_eq!(length, 0x6000_0000);
    }

    #[test]
    fn dsdt_patch_rejects_short_tables() {
        let mut stream = make_table("DSDT", 64);
        let dsdt = find_acpi_table(&stream, "DSDT").unwrap();
        assert!(patch_dsdt_memory_window(&mut stream, dsdt, 2048 << 20).is_err());
    }

    #[test]
    fn rsdp_carries_the_rsdt_offset() {
        let rsdp = generate_rsdp(0x1234);
        assert_eq!(rsdp.len(), 20);
        assert_eq!(&rsdp[..8], b"RSD PTR ");
        assert_eq!(&rsdp[9..15], b"BOCHS ");
        assert_eq!(u32::from_le_bytes(rsdp[16..20].try_into().unwrap()), 0x1234);
    }

    #[test]
    fn loader_blob_layout() {
        let stream = make_stream();
        let dsdt = find_acpi_table(&stream, "DSDT").unwrap();
        let facp = find_acpi_table(&stream, "FACP").unwrap();
        let apic = find_acpi_table(&stream, "APIC").unwrap();
        let mcfg = find_acpi_table(&stream, "MCFG").unwrap();
        let waet = find_acpi_table(&stream, "WAET").unwrap();
        let rsdt = find_acpi_table(&stream, "RSDT").unwrap();

        let ldr = generate_table_loader(dsdt, facp, apic, mcfg, waet, rsdt).unwrap();
        assert_eq!(ldr.len(), LDR_LENGTH);

        // 17 commands of 128 bytes each, zero padding after.
        assert!(ldr[17 * 128..].iter().all(|&b| b == 0));

        // First command: ALLOCATE "etc/acpi/rsdp", align 16, zone 2.
        assert_eq!(&ldr[..4], &[0x01, 0, 0, 0]);
        assert_eq!(&ldr[4..17], b"etc/acpi/rsdp");
        assert!(ldr[17..60].iter().all(|&b| b == 0));
        assert_eq!(u32::from_le_bytes(ldr[60..64].try_into().unwrap()), 16);
        assert_eq!(ldr[64], 2);

        // Third command: ADD_CHECKSUM for the DSDT.
        let cmd = &ldr[2 * 128..3 * 128];
        assert_eq!(&cmd[..4], &[0x03, 0, 0, 0]);
        assert_eq!(&cmd[4..19], b"etc/acpi/tables");
        assert_eq!(
            u32::from_le_bytes(cmd[60..64].try_into().unwrap()),
            dsdt.checksum_offset
        );
        assert_eq!(u32::from_le_bytes(cmd[68..72].try_into().unwrap()), dsdt.length);

        // Last command: ADD_CHECKSUM over the 20-byte RSDP.
        let cmd = &ldr[16 * 128..17 * 128];
        assert_eq!(&cmd[..4], &[0x03, 0, 0, 0]);
        assert_eq!(&cmd[4..17], b"etc/acpi/rsdp");
        assert_eq!(u32::from_le_bytes(cmd[60..64].try_into().unwrap()), 8);
        assert_eq!(u32::from_le_bytes(cmd[64..68].try_into().unwrap()), 0);
        assert_eq!(u32::from_le_bytes(cmd[68..72].try_into().unwrap()), 20);
    }

    #[test]
    fn builds_tables_from_the_embedded_catalog() {
        let machine = Machine::builder()
            .cpu_count(1)
            .memory_size(2048 << 20)
            .build();
        let tables = machine.build_tables().unwrap();

        assert_eq!(tables.rsdp.len(), 20);
        assert_eq!(tables.loader.len(), LDR_LENGTH);

        let rsdt = find_acpi_table(&tables.tables, "RSDT").unwrap();
        assert_eq!(
            u32::from_le_bytes(tables.rsdp[16..20].try_into().unwrap()),
            rsdt.offset
        );

        // 2048 MiB sits below the split: the window starts at the end of RAM.
        let dsdt = find_acpi_table(&tables.tables, "DSDT").unwrap();
        let length_offset = (dsdt.offset + dsdt.length - DSDT_WINDOW_LENGTH_OFFSET) as usize;
        let range_minimum = u32::from_le_bytes(
            tables.tables[length_offset - 12..length_offset - 8]
                .try_into()
                .unwrap(),
        );
        assert_eq!(range_minimum, 0x8000_0000);
    }

    #[test]
    fn missing_cpu_count_template_is_an_error() {
        let machine = Machine::builder()
            .cpu_count(3)
            .memory_size(2048 << 20)
            .build();
        let err = machine.build_tables().unwrap_err();
        assert!(err.to_string().contains("template for 3 CPUs"));
    }

    #[test]
    fn loads_templates_from_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("template_qemu_cpu2.hex");
        std::fs::write(&path, hex::encode(make_stream())).unwrap();

        let dir_str = dir.path().display().to_string();
        let machine = Machine::builder()
            .cpu_count(2)
            .memory_size(2048 << 20)
            .templates_dir(&dir_str)
            .build();
        let tables = machine.build_tables().unwrap();
        assert_eq!(tables.tables.len(), make_stream().len());
    }
}
