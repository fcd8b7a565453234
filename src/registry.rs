//! `Ldm` registry and disk ingestion (§4.G, §5). Grounded on
//! `original_source/src/ldm.c`'s `ldm_add`/`ldm_add_fd`: sector-size ioctl
//! fallback with a warning, the `S_ISBLK`/`BLKGETSIZE64`-vs-`fstat` device-size
//! branch, GUID-based group dedup, `committed_seq` consistency check, and the
//! disk-geometry population pass that runs regardless of whether the group is
//! new.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use log::{debug, warn};

use crate::error::LdmError;
use crate::guid::Guid;
use crate::model::{DiskGroup, DiskLocation};
use crate::probe::{MbrGptProbe, PartitionProbe, ProbeResult};
use crate::record::{self, RawRecord};
use crate::resolve::{self, DraftGroup};

const DEFAULT_SECTOR_SIZE: u64 = 512;

/// Top-level registry of discovered disk groups, keyed by group GUID.
#[derive(Default)]
pub struct Ldm {
    groups: HashMap<Guid, DiskGroup>,
}

impl Ldm {
    pub fn new() -> Self {
        Self {
            groups: HashMap::new(),
        }
    }

    pub fn disk_groups(&self) -> impl Iterator<Item = &DiskGroup> {
        self.groups.values()
    }

    /// Opens `path`, probes it for an MBR/GPT LDM signature, determines its
    /// sector size, and ingests it.
    pub fn add(&mut self, path: &Path) -> Result<(), LdmError> {
        let file = File::open(path)?;
        let sector_size = query_sector_size(&file);
        self.add_fd(file.as_raw_fd(), sector_size, path)
    }

    /// Ingests one disk given an already-open descriptor and a known sector
    /// size, reusing `path` only to populate `Disk.device`.
    pub fn add_fd(&mut self, fd: RawFd, sector_size: u64, path: &Path) -> Result<(), LdmError> {
        let mut file = dup_file(fd)?;

        let privhead_offset = locate_privhead(&file, path, sector_size)?;
        let privhead_bytes = read_at(&mut file, privhead_offset, 512)?;
        let privhead = record::parse_privhead(&privhead_bytes)?;

        let config = read_config_blob(&mut file, &privhead, sector_size)?;
        let vmdb_sector = record::find_vmdb_offset(&config, sector_size)?;
        let vmdb_offset = (vmdb_sector * sector_size) as usize;
        let vmdb_bytes = config
            .get(vmdb_offset..)
            .ok_or_else(|| LdmError::Invalid("VMDB offset out of range of config blob".into()))?;
        let vmdb = record::parse_vmdb(vmdb_bytes)?;

        debug!(
            "disk {} contributes to group {} (committed_seq={})",
            privhead.disk_guid, privhead.disk_group_guid, vmdb.committed_seq
        );

        let group_guid = privhead.disk_group_guid;

        if !self.groups.contains_key(&group_guid) {
            let records = record::parse_vblk_stream(&config, vmdb_offset, &vmdb)?;
            let draft = draft_from_records(records);
            let group = resolve::resolve(draft, &vmdb, group_guid)?;
            self.groups.insert(group_guid, group);
        } else {
            let existing = self.groups.get(&group_guid).unwrap();
            if existing.sequence != vmdb.committed_seq {
                return Err(LdmError::Inconsistent(format!(
                    "disk {} has committed_seq {} but group {} is at {}",
                    privhead.disk_guid, vmdb.committed_seq, group_guid, existing.sequence
                )));
            }
        }

        let group = self.groups.get(&group_guid).expect("group just inserted or already present");
        let disk = group.disk_by_guid(&privhead.disk_guid).ok_or_else(|| {
            LdmError::Invalid(format!(
                "PRIVHEAD disk guid {} not found among group {}'s disk records",
                privhead.disk_guid, group_guid
            ))
        })?;
        disk.set_location(DiskLocation {
            device: path.to_path_buf(),
            data_start: privhead.logical_disk_start,
            data_size: privhead.logical_disk_size,
            metadata_start: privhead.ldm_config_start,
            metadata_size: privhead.ldm_config_size,
        });

        Ok(())
    }
}

fn draft_from_records(records: Vec<RawRecord>) -> DraftGroup {
    let mut draft = DraftGroup::default();
    for rec in records {
        match rec {
            RawRecord::Blank => {}
            RawRecord::Volume(v) => draft.volumes.push(v),
            RawRecord::Component(c) => draft.components.push(c),
            RawRecord::Partition(p) => draft.partitions.push(p),
            RawRecord::Disk(d) => draft.disks.push(d),
            RawRecord::DiskGroup(dg) => draft.disk_group = Some(dg),
        }
    }
    draft
}

/// Probes over `file` itself (a dup of the caller's `fd`), never by
/// reopening the path independently — `add_fd`'s contract is that the
/// caller's descriptor is the sole source of truth.
fn locate_privhead(file: &File, path: &Path, sector_size: u64) -> Result<u64, LdmError> {
    let mut probe = MbrGptProbe::from_file(file.try_clone()?);
    match probe.probe(sector_size)? {
        ProbeResult::Mbr { .. } => Ok(6 * sector_size),
        ProbeResult::Gpt {
            ldm_metadata_pte_last_lba,
        } => Ok(ldm_metadata_pte_last_lba * sector_size),
        ProbeResult::NotLdm => Err(LdmError::NotLdm(format!("{} has no LDM signature", path.display()))),
    }
}

fn read_config_blob(
    file: &mut File,
    privhead: &record::PrivHead,
    sector_size: u64,
) -> Result<Vec<u8>, LdmError> {
    let device_len = device_size(file)?;
    let start = privhead.ldm_config_start * sector_size;
    let size = privhead.ldm_config_size * sector_size;
    if start.checked_add(size).map(|end| end > device_len).unwrap_or(true) {
        return Err(LdmError::Invalid("LDM config area extends past end of device".into()));
    }
    read_at(file, start, size as usize)
}

/// Block-device nodes report `st_size == 0`; `fstat` alone only gives the
/// right answer for regular files (disk images). Mirrors `ldm.c`'s
/// `S_ISBLK` branch: block devices go through `BLKGETSIZE64`, everything
/// else falls back to `fstat`.
fn device_size(file: &File) -> Result<u64, LdmError> {
    if file.metadata()?.file_type().is_block_device() {
        blkgetsize64(file).ok_or_else(|| LdmError::Io(std::io::Error::last_os_error()))
    } else {
        Ok(file.metadata()?.len())
    }
}

fn read_at(file: &mut File, offset: u64, len: usize) -> Result<Vec<u8>, LdmError> {
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

fn query_sector_size(file: &File) -> u64 {
    match blkssz_get(file) {
        Some(size) => size,
        None => {
            warn!("BLKSSZGET unavailable, falling back to {DEFAULT_SECTOR_SIZE}-byte sectors");
            DEFAULT_SECTOR_SIZE
        }
    }
}

#[cfg(target_os = "linux")]
fn blkssz_get(file: &File) -> Option<u64> {
    const BLKSSZGET: libc::c_ulong = 0x1268;
    let mut size: libc::c_int = 0;
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKSSZGET, &mut size as *mut libc::c_int) };
    if ret == 0 && size > 0 {
        Some(size as u64)
    } else {
        None
    }
}

#[cfg(not(target_os = "linux"))]
fn blkssz_get(_file: &File) -> Option<u64> {
    None
}

/// `BLKGETSIZE64` returns the device size in bytes, unlike `BLKGETSIZE`
/// (512-byte sectors). Matches `ldm.c`'s `ioctl(fd, BLKGETSIZE64, &size)`.
#[cfg(target_os = "linux")]
fn blkgetsize64(file: &File) -> Option<u64> {
    const BLKGETSIZE64: libc::c_ulong = 0x80081272;
    let mut size: libc::c_ulonglong = 0;
    let ret = unsafe {
        libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size as *mut libc::c_ulonglong)
    };
    if ret == 0 {
        Some(size as u64)
    } else {
        None
    }
}

#[cfg(not(target_os = "linux"))]
fn blkgetsize64(_file: &File) -> Option<u64> {
    None
}

fn dup_file(fd: RawFd) -> Result<File, LdmError> {
    use std::mem::ManuallyDrop;
    use std::os::unix::io::FromRawFd;
    // `add_fd` borrows the descriptor from the caller in the original C
    // API; wrap it so dropping our local `File` on every exit path
    // (success or error) never closes the caller's fd out from under them.
    let borrowed = ManuallyDrop::new(unsafe { File::from_raw_fd(fd) });
    Ok(borrowed.try_clone()?)
}

