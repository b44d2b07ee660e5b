//! TDVF metadata parsing and the measurements replayed from it.
//!
//! The metadata layout is described in Section 11 of the Intel TDX Virtual
//! Firmware Design Guide; the TD HOB layout follows QEMU's tdvf-hob.c.

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha384};

use crate::num::read_le;
use crate::util::{debug_print_log, encode_guid, measure_efi_variable};
use crate::Machine;
use crate::{measure_log, measure_sha384};

const TABLE_FOOTER_GUID: &str = "96b582de-1fb2-45f7-baea-a366c55a082d";
const TDX_METADATA_OFFSET_GUID: &str = "e47a6535-984a-4798-865e-4685a7bf8ec2";
const TDVF_SIGNATURE: &[u8; 4] = b"TDVF";
const TDX_METADATA_VERSION: u32 = 1;
const BYTES_AFTER_TABLE_FOOTER: usize = 32;

const PAGE_SIZE: u64 = 0x1000;
const MR_EXTEND_GRANULARITY: u64 = 0x100;

const ATTRIBUTE_MR_EXTEND: u32 = 1 << 0;
const ATTRIBUTE_PAGE_AUG: u32 = 1 << 1;

const SECTION_TD_HOB: u32 = 0x02;
const DEFAULT_TD_HOB_BASE: u64 = 0x809000;

/// Memory map split boundary at 2816 MiB.
const MEMORY_SPLIT: u64 = 0xB000_0000;

/// Measurement of the OVMF configuration firmware volume.
const CFV_IMAGE_HASH: &str = "344bc51c980ba621aaa00da3ed7436f7d6e549197dfe699515dfa2c6583d95e6412af21c097d473155875ffd561d6790";
/// Measurement of the Boot0000 variable on the direct-boot path.
const BOOT000_HASH: &str = "23ada07f5261f12f34a0bd8e46760962d6b4d576a416f1fea1c64bc656b1d28eacf7047ae6e967c58fd2a98bfa74c298";

const EFI_GLOBAL_VARIABLE: &str = "8BE4DF61-93CA-11D2-AA0D-00E098032B8C";
const EFI_IMAGE_SECURITY_DATABASE: &str = "D719B2CB-3D3A-4596-A3BC-DAD00E67656F";

#[derive(Debug, Clone, Copy)]
struct TdvfSection {
    data_offset: u32,
    raw_data_size: u32,
    memory_address: u64,
    memory_data_size: u64,
    sec_type: u32,
    attributes: u32,
}

/// Parsed TDVF metadata together with the firmware it was found in.
#[derive(Debug)]
pub(crate) struct Tdvf<'a> {
    fw: &'a [u8],
    sections: Vec<TdvfSection>,
}

impl<'a> Tdvf<'a> {
    pub(crate) fn parse(fw: &'a [u8]) -> Result<Self> {
        let footer_guid = encode_guid(TABLE_FOOTER_GUID)?;
        let offset = fw
            .len()
            .checked_sub(BYTES_AFTER_TABLE_FOOTER)
            .filter(|offset| *offset >= 18)
            .context("malformed OVMF table footer")?;
        if fw[offset - 16..offset] != footer_guid[..] {
            bail!("malformed OVMF table footer");
        }
        let tables_len = read_le::<u16>(fw, offset - 18, "OVMF table footer")? as usize;
        if tables_len == 0 || tables_len > offset - 18 {
            bail!("malformed OVMF table footer");
        }
        let tables = &fw[offset - 18 - tables_len..offset - 18];

        // Walk the GUIDed entry list backwards until the TDX metadata offset
        // entry turns up. Each entry is arbitrary data followed by a 2-byte
        // entry length and a trailing 16-byte GUID.
        let metadata_guid = encode_guid(TDX_METADATA_OFFSET_GUID)?;
        let mut offset = tables.len();
        let data = loop {
            if offset < 18 {
                bail!("missing TDVF metadata in firmware");
            }
            let guid = &tables[offset - 16..offset];
            let entry_len = read_le::<u16>(tables, offset - 18, "OVMF table entry")? as usize;
            if entry_len == 0 || offset < 18 + entry_len {
                bail!("malformed OVMF table in firmware at offset {offset}");
            }
            if guid == metadata_guid {
                break &tables[offset - 18 - entry_len..offset - 18];
            }
            offset -= entry_len;
        };

        // The last 4 bytes of the entry data hold the descriptor's offset
        // from the end of the firmware.
        if data.len() < 4 {
            bail!("missing TDVF metadata in firmware");
        }
        let meta_offset = read_le::<u32>(data, data.len() - 4, "TDX metadata offset")? as usize;
        let desc_offset = fw
            .len()
            .checked_sub(meta_offset)
            .context("malformed TDVF metadata descriptor in firmware")?;
        let desc = fw
            .get(desc_offset..desc_offset + 16)
            .context("malformed TDVF metadata descriptor in firmware")?;
        if &desc[..4] != TDVF_SIGNATURE {
            bail!("malformed TDVF metadata descriptor in firmware");
        }
        let version = read_le::<u32>(fw, desc_offset + 8, "TDVF metadata version")?;
        if version != TDX_METADATA_VERSION {
            bail!("unsupported TDVF metadata descriptor version in firmware");
        }
        let num_sections = read_le::<u32>(fw, desc_offset + 12, "TDVF section count")? as usize;

        let mut sections = Vec::with_capacity(num_sections);
        for section in 0..num_sections {
            let sec_offset = desc_offset + 16 + 32 * section;
            let s = TdvfSection {
                data_offset: read_le(fw, sec_offset, "TDVF section")?,
                raw_data_size: read_le(fw, sec_offset + 4, "TDVF section")?,
                memory_address: read_le(fw, sec_offset + 8, "TDVF section")?,
                memory_data_size: read_le(fw, sec_offset + 16, "TDVF section")?,
                sec_type: read_le(fw, sec_offset + 24, "TDVF section")?,
                attributes: read_le(fw, sec_offset + 28, "TDVF section")?,
            };

            if s.memory_address % PAGE_SIZE != 0 {
                bail!("TDVF metadata section {section} has non-aligned memory address");
            }
            if s.memory_data_size < s.raw_data_size as u64 {
                bail!("TDVF metadata section {section} memory data size is less than raw data size");
            }
            if s.memory_data_size % PAGE_SIZE != 0 {
                bail!("TDVF metadata section {section} has non-aligned memory data size");
            }
            if s.attributes & ATTRIBUTE_MR_EXTEND != 0
                && (s.raw_data_size as u64) < s.memory_data_size
            {
                bail!("TDVF metadata section {section} raw data size is less than memory data size");
            }

            sections.push(s);
        }
        Ok(Self { fw, sections })
    }
}

/// TDCALL [TDH.MEM.PAGE.ADD]: bytes 0..12 hold the ASCII tag, bytes 16..24
/// the page GPA, everything else zero. Pages with the PAGE_AUG attribute are
/// accepted rather than added and contribute no frame.
fn mem_page_add(hasher: &mut Sha384, s: &TdvfSection, page: u64) {
    if s.attributes & ATTRIBUTE_PAGE_AUG != 0 {
        return;
    }
    let mut buf = [0u8; 128];
    buf[..12].copy_from_slice(b"MEM.PAGE.ADD");
    buf[16..24].copy_from_slice(&(s.memory_address + page * PAGE_SIZE).to_le_bytes());
    hasher.update(buf);
}

impl Tdvf<'_> {
    /// Replays the TDX page-add / measurement-extend sequence over the
    /// firmware sections, producing the MRTD digest.
    ///
    /// Two TD initialization orders exist in the wild: TCB_SVN 6xx firmware
    /// adds all of a section's pages before extending any of them, while 7xx
    /// interleaves the add and the extend per page. The order changes the
    /// digest, so the machine configuration selects one.
    pub(crate) fn mrtd(&self, machine: &Machine) -> Result<Vec<u8>> {
        let mut hasher = Sha384::new();
        for s in &self.sections {
            let num_pages = s.memory_data_size / PAGE_SIZE;
            if machine.two_pass_add_pages {
                for page in 0..num_pages {
                    mem_page_add(&mut hasher, s, page);
                }
                for page in 0..num_pages {
                    self.mr_extend(&mut hasher, s, page)?;
                }
            } else {
                for page in 0..num_pages {
                    mem_page_add(&mut hasher, s, page);
                    self.mr_extend(&mut hasher, s, page)?;
                }
            }
        }
        Ok(hasher.finalize().to_vec())
    }

    /// TDCALL [TDH.MR.EXTEND]: for each 256-byte chunk of the page, a header
    /// frame carrying the tag and the chunk GPA, followed by the chunk content.
    fn mr_extend(&self, hasher: &mut Sha384, s: &TdvfSection, page: u64) -> Result<()> {
        if s.attributes & ATTRIBUTE_MR_EXTEND == 0 {
            return Ok(());
        }
        for chunk in 0..PAGE_SIZE / MR_EXTEND_GRANULARITY {
            let gpa_offset = page * PAGE_SIZE + chunk * MR_EXTEND_GRANULARITY;
            let mut buf = [0u8; 128];
            buf[..9].copy_from_slice(b"MR.EXTEND");
            buf[16..24].copy_from_slice(&(s.memory_address + gpa_offset).to_le_bytes());
            hasher.update(buf);

            let chunk_offset = s.data_offset as usize + gpa_offset as usize;
            let content = self
                .fw
                .get(chunk_offset..chunk_offset + MR_EXTEND_GRANULARITY as usize)
                .with_context(|| {
                    format!("TDVF section data out of bounds at offset {chunk_offset:#x}")
                })?;
            hasher.update(content);
        }
        Ok(())
    }

    fn td_hob_base(&self) -> u64 {
        self.sections
            .iter()
            .find(|s| s.sec_type == SECTION_TD_HOB)
            .map(|s| s.memory_address)
            .unwrap_or(DEFAULT_TD_HOB_BASE)
    }

    /// Builds the TD HOB list describing the guest memory map, the same way
    /// QEMU constructs it before launch. All fields are little-endian.
    pub(crate) fn build_td_hob(&self, memory_size: u64) -> Vec<u8> {
        // EFI_HOB_TYPE_HANDOFF; EfiEndOfHobList (bytes 48..56) is filled last.
        let mut hob = vec![
            0x01, 0x00, // Header.HobType (EFI_HOB_TYPE_HANDOFF)
            0x38, 0x00, // Header.HobLength (56 bytes)
            0x00, 0x00, 0x00, 0x00, // Header.Reserved
            0x09, 0x00, 0x00, 0x00, // Version (EFI_HOB_HANDOFF_TABLE_VERSION)
            0x00, 0x00, 0x00, 0x00, // BootMode
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // EfiMemoryTop
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // EfiMemoryBottom
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // EfiFreeMemoryTop
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // EfiFreeMemoryBottom
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // EfiEndOfHobList
        ];

        fn add_resource(
            hob: &mut Vec<u8>,
            remaining_memory: &mut u64,
            resource_type: u8,
            start: u64,
            length: u64,
        ) {
            hob.extend_from_slice(&[
                0x03, 0x00, // Header.HobType (EFI_HOB_TYPE_RESOURCE_DESCRIPTOR)
                0x30, 0x00, // Header.HobLength (48 bytes)
                0x00, 0x00, 0x00, 0x00, // Header.Reserved
            ]);
            hob.extend_from_slice(&[0u8; 16]); // Owner
            hob.extend_from_slice(&[resource_type, 0x00, 0x00, 0x00]); // ResourceType
            hob.extend_from_slice(&[0x07, 0x00, 0x00, 0x00]); // ResourceAttribute
            hob.extend_from_slice(&start.to_le_bytes()); // PhysicalStart
            hob.extend_from_slice(&length.to_le_bytes()); // ResourceLength
            *remaining_memory = remaining_memory.wrapping_sub(length);
        }

        let mut remaining = memory_size;
        add_resource(&mut hob, &mut remaining, 0x07, 0x0000_0000, 0x0080_0000);
        add_resource(&mut hob, &mut remaining, 0x00, 0x0080_0000, 0x0000_6000);
        add_resource(&mut hob, &mut remaining, 0x07, 0x0080_6000, 0x0000_3000);
        add_resource(&mut hob, &mut remaining, 0x00, 0x0080_9000, 0x0000_2000);
        add_resource(&mut hob, &mut remaining, 0x00, 0x0080_B000, 0x0000_2000);
        add_resource(&mut hob, &mut remaining, 0x07, 0x0080_D000, 0x0000_4000);
        add_resource(&mut hob, &mut remaining, 0x00, 0x0081_1000, 0x0000_F000);

        // The memory map splits at 2816 MiB.
        if memory_size >= MEMORY_SPLIT {
            add_resource(&mut hob, &mut remaining, 0x07, 0x0082_0000, 0x7F7E_0000);
            let high_memory = remaining;
            add_resource(&mut hob, &mut remaining, 0x07, 0x1_0000_0000, high_memory);
        } else {
            let low_memory = remaining;
            add_resource(&mut hob, &mut remaining, 0x07, 0x0082_0000, low_memory);
        }

        let end_of_hob_list = self.td_hob_base() + hob.len() as u64 + 8;
        hob[48..56].copy_from_slice(&end_of_hob_list.to_le_bytes());
        hob
    }

    /// Composes the RTMR0 event log and folds it into the register value.
    pub(crate) fn rtmr0(&self, machine: &Machine) -> Result<Vec<u8>> {
        let tables = machine.build_tables()?;

        let mut rtmr0_log = vec![
            measure_sha384(&self.build_td_hob(machine.memory_size)),
            hex::decode(CFV_IMAGE_HASH)?,
            measure_efi_variable(EFI_GLOBAL_VARIABLE, "SecureBoot")?,
            measure_efi_variable(EFI_GLOBAL_VARIABLE, "PK")?,
            measure_efi_variable(EFI_GLOBAL_VARIABLE, "KEK")?,
            measure_efi_variable(EFI_IMAGE_SECURITY_DATABASE, "db")?,
            measure_efi_variable(EFI_IMAGE_SECURITY_DATABASE, "dbx")?,
            measure_sha384(&[0x00, 0x00, 0x00, 0x00]), // Separator
            measure_sha384(&tables.loader),
            measure_sha384(&tables.rsdp),
            measure_sha384(&tables.tables),
            measure_sha384(&[0x00, 0x00]), // BootOrder
            hex::decode(BOOT000_HASH)?,    // Boot0000
        ];
        if machine.two_pass_add_pages {
            // TCB_SVN 6 firmware logs one more separator at the end.
            rtmr0_log.push(measure_sha384(&[0x00, 0x00, 0x00, 0x00]));
        }
        debug_print_log("RTMR0", &rtmr0_log);
        Ok(measure_log(&rtmr0_log))
    }
}
