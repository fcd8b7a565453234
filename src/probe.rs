//! MBR/GPT partition-table probe (§4.B). Out of the core's scope per the
//! spec — this module is the "external collaborator" the core consumes via
//! the `PartitionProbe` trait. The concrete `MbrGptProbe` backs the bundled
//! CLI demo; anything reading an already-open block device can supply its
//! own `PartitionProbe` instead.
//!
//! GPT layout constants and the `Guid` mixed-endian decode are grounded on
//! the teacher's `gpt.rs`. All GPT on-disk fields are little-endian, unlike
//! LDM's own big-endian structures.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::LdmError;
use crate::guid::Guid;

pub const MBR_PART_WINDOWS_LDM: u8 = 0x42;
pub const MBR_PART_EFI_PROTECTIVE: u8 = 0xee;

/// `AA-C8-08-58-8F-7E-E0-42-85-D2-E1-E9-04-34-CF-B3`, matched byte-for-byte.
pub const LDM_METADATA_PARTITION_GUID: [u8; 16] = [
    0xAA, 0xC8, 0x08, 0x58, 0x8F, 0x7E, 0xE0, 0x42, 0x85, 0xD2, 0xE1, 0xE9, 0x04, 0x34, 0xCF, 0xB3,
];

#[derive(Debug, Clone, Copy)]
pub enum ProbeResult {
    Mbr { first_partition_type: u8 },
    Gpt { ldm_metadata_pte_last_lba: u64 },
    NotLdm,
}

/// Returns either the MBR partition table's relevant entry, or (for GPT) the
/// LBA range of the LDM metadata partition.
pub trait PartitionProbe {
    fn probe(&mut self, sector_size: u64) -> Result<ProbeResult, LdmError>;
}

/// A minimal MBR/GPT reader good enough to locate PRIVHEAD.
pub struct MbrGptProbe {
    file: File,
}

impl MbrGptProbe {
    /// Opens `path` independently. Only suitable when no already-open
    /// descriptor is available (e.g. the bundled CLI demo's one-shot
    /// `Ldm::add`).
    pub fn open(path: &Path) -> Result<Self, LdmError> {
        Ok(Self {
            file: File::open(path)?,
        })
    }

    /// Probes over an already-open descriptor, as `Ldm::add_fd`'s contract
    /// requires: the caller's `fd` is the sole source of truth, never a
    /// fresh open of `path`.
    pub fn from_file(file: File) -> Self {
        Self { file }
    }

    fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, LdmError> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

impl PartitionProbe for MbrGptProbe {
    fn probe(&mut self, sector_size: u64) -> Result<ProbeResult, LdmError> {
        let mbr = self.read_at(0, 512)?;
        if mbr.len() < 512 || mbr[510] != 0x55 || mbr[511] != 0xAA {
            return Ok(ProbeResult::NotLdm);
        }
        // First partition-table entry starts at byte 446, type byte at +4.
        let first_partition_type = mbr[446 + 4];

        match first_partition_type {
            MBR_PART_WINDOWS_LDM => Ok(ProbeResult::Mbr {
                first_partition_type,
            }),
            MBR_PART_EFI_PROTECTIVE => self.probe_gpt(sector_size),
            _ => Ok(ProbeResult::NotLdm),
        }
    }
}

impl MbrGptProbe {
    fn probe_gpt(&mut self, sector_size: u64) -> Result<ProbeResult, LdmError> {
        let header = self.read_at(sector_size, 92)?;
        if &header[0..8] != b"EFI PART" {
            return Ok(ProbeResult::NotLdm);
        }
        let mut cur = std::io::Cursor::new(&header[72..92]);
        let starting_lba = cur.read_u64::<LittleEndian>()?;
        let num_entries = cur.read_u32::<LittleEndian>()?;
        let entry_size = cur.read_u32::<LittleEndian>()?;

        // Fetch PTE index `i` on each iteration. The original reference
        // implementation always re-fetched PTE 0 here; this crate does not
        // reproduce that defect (SPEC_FULL.md §9).
        for i in 0..num_entries {
            let offset = starting_lba * sector_size + (i as u64) * entry_size as u64;
            let entry = self.read_at(offset, entry_size as usize)?;
            if entry.len() < 48 {
                continue;
            }
            let mut type_guid_bytes = [0u8; 16];
            type_guid_bytes.copy_from_slice(&entry[0..16]);
            if type_guid_bytes == LDM_METADATA_PARTITION_GUID {
                // Partition-entry layout: type GUID (0..16), unique GUID
                // (16..32), starting LBA (32..40), ending LBA (40..48).
                let mut cur = std::io::Cursor::new(&entry[40..48]);
                let ending_lba = cur.read_u64::<LittleEndian>()?;
                return Ok(ProbeResult::Gpt {
                    ldm_metadata_pte_last_lba: ending_lba,
                });
            }
        }
        Ok(ProbeResult::NotLdm)
    }
}

/// Parses the ASCII-hex GPT partition-type GUID form, matching the
/// teacher's `lookup_partition_type` table entry for "Microsoft LDM
/// metadata".
pub fn ldm_metadata_guid() -> Guid {
    Guid::from_bytes(LDM_METADATA_PARTITION_GUID)
}
