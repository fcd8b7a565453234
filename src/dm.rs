//! Device-mapper table generator (§4.H). Grounded on
//! `original_source/src/ldm.c`'s `_generate_dm_table_part`,
//! `_generate_dm_tables_mirrored`/`_spanned`/`_striped`/`_raid5`, and
//! `ldm_volume_generate_dm_tables`'s dispatch.

use std::rc::Rc;

use log::warn;

use crate::error::LdmError;
use crate::model::{Component, Partition, Volume};
use crate::record::{ComponentKind, VolumeKind};

/// One named, ordered activation table. Consumers activate `tables` in
/// list order so leaf tables precede the volumes that reference them.
#[derive(Debug, Clone)]
pub struct DmTable {
    pub name: String,
    pub line: String,
}

pub fn generate_dm_tables(volume: &Volume) -> Result<Vec<DmTable>, LdmError> {
    let comps = volume.components();
    match (volume.kind, comps.len()) {
        (VolumeKind::Gen, n) if n > 1 => generate_mirrored(volume, &comps),
        (VolumeKind::Gen, 1) => match comps[0].kind {
            ComponentKind::Spanned => generate_spanned(volume, &comps[0]),
            ComponentKind::Striped => generate_striped(volume, &comps[0]),
            ComponentKind::Raid => Err(LdmError::NotSupported(
                "GEN volume with a single RAID component is not supported".into(),
            )),
        },
        (VolumeKind::Gen, 0) => Err(LdmError::Invalid(format!(
            "volume {} has no components",
            volume.name
        ))),
        (VolumeKind::Raid5, _) => {
            let raid_comps: Vec<&Rc<Component>> = comps
                .iter()
                .filter(|c| c.kind == ComponentKind::Raid)
                .collect();
            if raid_comps.len() != 1 {
                return Err(LdmError::NotSupported(format!(
                    "RAID5 volume {} must have exactly one RAID component, found {}",
                    volume.name,
                    raid_comps.len()
                )));
            }
            generate_raid5(volume, raid_comps[0])
        }
    }
}

fn table_name(dgname: &str, name: &str) -> String {
    format!("ldm_{}_{}", percent_escape(dgname), percent_escape(name))
}

fn percent_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

fn leaf_table(dgname: &str, partition: &Partition) -> Option<DmTable> {
    let disk = partition.disk()?;
    let device = disk.device()?;
    let data_start = disk.data_start()?;
    Some(DmTable {
        name: table_name(dgname, &partition.name),
        line: format!(
            "0 {} linear {} {}\n",
            partition.size,
            device.display(),
            data_start + partition.start
        ),
    })
}

fn generate_mirrored(volume: &Volume, comps: &[Rc<Component>]) -> Result<Vec<DmTable>, LdmError> {
    let dgname = volume.dgname();
    let mut tables = Vec::new();
    let mut legs = Vec::new();
    let mut present = 0usize;

    for c in comps {
        if c.kind != ComponentKind::Spanned {
            return Err(LdmError::NotSupported(format!(
                "mirror leg component {} is not SPANNED",
                c.name
            )));
        }
        let parts = c.partitions();
        if parts.len() != 1 {
            return Err(LdmError::NotSupported(format!(
                "mirror leg component {} does not have exactly one partition",
                c.name
            )));
        }
        let partition = &parts[0];
        match leaf_table(&dgname, partition) {
            Some(leaf) => {
                present += 1;
                legs.push(format!("/dev/mapper/{}", leaf.name));
                tables.push(leaf);
            }
            None => {
                warn!(
                    "disk for partition {} is missing, substituting placeholder in mirror {}",
                    partition.name, volume.name
                );
                legs.push("- -".to_string());
            }
        }
    }

    if present == 0 {
        return Err(LdmError::MissingDisk(format!(
            "mirror volume {} has no legs with a present disk",
            volume.name
        )));
    }

    let legs_str: Vec<String> = legs
        .iter()
        .map(|l| {
            if l == "- -" {
                l.clone()
            } else {
                format!("- {l}")
            }
        })
        .collect();

    let top = DmTable {
        name: table_name(&dgname, &volume.name),
        line: format!(
            "0 {} raid raid1 1 128 {} {}\n",
            volume.size,
            comps.len(),
            legs_str.join(" ")
        ),
    };
    tables.push(top);
    Ok(tables)
}

fn generate_spanned(volume: &Volume, comp: &Component) -> Result<Vec<DmTable>, LdmError> {
    let dgname = volume.dgname();
    let parts = comp.partitions();
    let mut pos: u64 = 0;
    let mut segments = Vec::with_capacity(parts.len());

    for p in &parts {
        if p.vol_offset != pos {
            return Err(LdmError::Invalid(format!(
                "partition {} vol_offset {} does not match expected position {}",
                p.name, p.vol_offset, pos
            )));
        }
        let disk = p.disk().ok_or_else(|| {
            LdmError::MissingDisk(format!("disk for partition {} is not present", p.name))
        })?;
        let device = disk.device().ok_or_else(|| {
            LdmError::MissingDisk(format!("disk for partition {} is not present", p.name))
        })?;
        let data_start = disk
            .data_start()
            .expect("data_start is set whenever device is set");
        segments.push(format!(
            "{} {} linear {} {}",
            pos,
            pos + p.size,
            device.display(),
            data_start + p.start
        ));
        pos += p.size;
    }

    Ok(vec![DmTable {
        name: table_name(&dgname, &volume.name),
        line: format!("{}\n", segments.join("\n")),
    }])
}

fn generate_striped(volume: &Volume, comp: &Component) -> Result<Vec<DmTable>, LdmError> {
    let dgname = volume.dgname();
    let parts = comp.partitions();
    let stripe_size = comp
        .stripe_size
        .ok_or_else(|| LdmError::Invalid(format!("component {} has no stripe_size", comp.name)))?;
    let n_columns = comp
        .n_columns
        .ok_or_else(|| LdmError::Invalid(format!("component {} has no n_columns", comp.name)))?;

    let mut devices = Vec::with_capacity(parts.len());
    for p in &parts {
        let disk = p.disk().ok_or_else(|| {
            LdmError::MissingDisk(format!("disk for partition {} is not present", p.name))
        })?;
        let device = disk.device().ok_or_else(|| {
            LdmError::MissingDisk(format!("disk for partition {} is not present", p.name))
        })?;
        let data_start = disk
            .data_start()
            .expect("data_start is set whenever device is set");
        devices.push(format!("{} {}", device.display(), data_start + p.start));
    }

    Ok(vec![DmTable {
        name: table_name(&dgname, &volume.name),
        line: format!(
            "0 {} striped {} {} {}\n",
            volume.size,
            n_columns,
            stripe_size,
            devices.join(" ")
        ),
    }])
}

fn generate_raid5(volume: &Volume, comp: &Component) -> Result<Vec<DmTable>, LdmError> {
    let dgname = volume.dgname();
    let parts = comp.partitions();
    let stripe_size = comp
        .stripe_size
        .ok_or_else(|| LdmError::Invalid(format!("component {} has no stripe_size", comp.name)))?;
    let n_columns = comp
        .n_columns
        .ok_or_else(|| LdmError::Invalid(format!("component {} has no n_columns", comp.name)))?;

    let mut tables = Vec::new();
    let mut legs = Vec::new();
    let mut present = 0usize;

    for p in &parts {
        match leaf_table(&dgname, p) {
            Some(leaf) => {
                present += 1;
                legs.push(format!("/dev/mapper/{}", leaf.name));
                tables.push(leaf);
            }
            None => {
                warn!(
                    "disk for partition {} is missing, substituting placeholder in raid5 {}",
                    p.name, volume.name
                );
                legs.push("- -".to_string());
            }
        }
    }

    if (present as u32) < n_columns.saturating_sub(1) {
        return Err(LdmError::MissingDisk(format!(
            "raid5 volume {} is missing more than one leg ({} of {} present)",
            volume.name, present, n_columns
        )));
    }

    let legs_str: Vec<String> = legs
        .iter()
        .map(|l| {
            if l == "- -" {
                l.clone()
            } else {
                format!("- {l}")
            }
        })
        .collect();

    tables.push(DmTable {
        name: table_name(&dgname, &volume.name),
        line: format!(
            "0 {} raid raid5_ls 1 {} {} {}\n",
            volume.size,
            stripe_size,
            n_columns,
            legs_str.join(" ")
        ),
    });
    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guid::Guid;
    use crate::model::{build, DiskLocation};
    use std::path::PathBuf;

    fn present_disk(id: u32, name: &str, device: &str, data_start: u64) -> Rc<crate::model::Disk> {
        let disk = crate::model::Disk::new(id, name.to_string(), Guid::from_bytes([0u8; 16]));
        disk.set_location(DiskLocation {
            device: PathBuf::from(device),
            data_start,
            data_size: 1_000_000,
            metadata_start: 0,
            metadata_size: 0,
        });
        Rc::new(disk)
    }

    fn absent_disk(id: u32, name: &str) -> Rc<crate::model::Disk> {
        Rc::new(crate::model::Disk::new(
            id,
            name.to_string(),
            Guid::from_bytes([0u8; 16]),
        ))
    }

    fn make_volume(name: &str, kind: VolumeKind, size: u64, n_comps: u32) -> Rc<Volume> {
        let v = build::volume(1, name.to_string(), kind, size, 0x07, None, None, None, None, n_comps);
        build::set_dgname(&v, "dg1");
        Rc::new(v)
    }

    fn make_component(
        id: u32,
        name: &str,
        kind: ComponentKind,
        n_parts: u32,
        stripe: Option<(u64, u32)>,
    ) -> Rc<Component> {
        let (stripe_size, n_columns) = match stripe {
            Some((s, c)) => (Some(s), Some(c)),
            None => (None, None),
        };
        Rc::new(build::component(id, name.to_string(), kind, n_parts, stripe_size, n_columns))
    }

    fn attach_partition(
        component: &Rc<Component>,
        id: u32,
        name: &str,
        start: u64,
        vol_offset: u64,
        size: u64,
        index: u32,
        disk: Rc<crate::model::Disk>,
    ) {
        let p = Rc::new(build::partition(id, name.to_string(), start, vol_offset, size, index));
        build::set_partition_disk(&p, disk);
        build::set_partition_parent(&p, component);
        build::push_component_partition(component, p);
    }

    fn wire(volume: &Rc<Volume>, comp: &Rc<Component>) {
        build::set_component_parent(comp, volume);
        build::push_volume_component(volume, Rc::clone(comp));
        build::sort_component_partitions(comp);
    }

    #[test]
    fn single_spanned_volume_generates_one_linear_table() {
        let disk = present_disk(1, "disk1", "/dev/sdb", 128);
        let volume = make_volume("v1", VolumeKind::Gen, 2048, 1);
        let comp = make_component(1, "c1", ComponentKind::Spanned, 1, None);
        attach_partition(&comp, 1, "p1", 256, 0, 2048, 0, disk);
        wire(&volume, &comp);

        let tables = generate_dm_tables(&volume).unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].name, "ldm_dg1_v1");
        assert_eq!(tables[0].line, "0 2048 linear /dev/sdb 384\n");
    }

    #[test]
    fn striped_volume_generates_expected_table() {
        let disk_a = present_disk(1, "disk1", "/dev/sdb", 128);
        let disk_b = present_disk(2, "disk2", "/dev/sdc", 128);
        let volume = make_volume("v1", VolumeKind::Gen, 4096, 1);
        let comp = make_component(1, "c1", ComponentKind::Striped, 2, Some((128, 2)));
        attach_partition(&comp, 1, "p1", 256, 0, 2048, 0, disk_a);
        attach_partition(&comp, 2, "p2", 512, 2048, 2048, 1, disk_b);
        wire(&volume, &comp);

        let tables = generate_dm_tables(&volume).unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].line, "0 4096 striped 2 128 /dev/sdb 384 /dev/sdc 640\n");
    }

    #[test]
    fn spanned_volume_with_offset_gap_is_invalid() {
        let disk = present_disk(1, "disk1", "/dev/sdb", 0);
        let volume = make_volume("v1", VolumeKind::Gen, 2048, 1);
        let comp = make_component(1, "c1", ComponentKind::Spanned, 2, None);
        attach_partition(&comp, 1, "p1", 0, 0, 1024, 0, Rc::clone(&disk));
        // Second partition's vol_offset should be 1024 (the first partition's
        // size) but claims 2000 instead.
        attach_partition(&comp, 2, "p2", 1024, 2000, 1024, 1, disk);
        wire(&volume, &comp);

        let err = generate_dm_tables(&volume).unwrap_err();
        assert!(matches!(err, LdmError::Invalid(_)));
    }

    #[test]
    fn mirror_with_non_spanned_leg_is_not_supported() {
        let disk = present_disk(1, "disk1", "/dev/sdb", 0);
        let volume = make_volume("v1", VolumeKind::Gen, 1024, 2);
        let leg_a = make_component(1, "ca", ComponentKind::Spanned, 1, None);
        attach_partition(&leg_a, 1, "pa", 0, 0, 1024, 0, Rc::clone(&disk));
        wire(&volume, &leg_a);
        let leg_b = make_component(2, "cb", ComponentKind::Striped, 1, Some((128, 1)));
        attach_partition(&leg_b, 2, "pb", 0, 0, 1024, 0, disk);
        wire(&volume, &leg_b);

        let err = generate_dm_tables(&volume).unwrap_err();
        assert!(matches!(err, LdmError::NotSupported(_)));
    }

    #[test]
    fn raid5_degraded_by_one_leg_substitutes_placeholder() {
        let disk_a = present_disk(1, "d1", "/dev/sdb", 0);
        let disk_b = absent_disk(2, "d2");
        let disk_c = present_disk(3, "d3", "/dev/sdd", 0);
        let volume = make_volume("v1", VolumeKind::Raid5, 3072, 1);
        let comp = make_component(1, "c1", ComponentKind::Raid, 3, Some((64, 3)));
        attach_partition(&comp, 1, "pa", 0, 0, 1024, 0, disk_a);
        attach_partition(&comp, 2, "pb", 0, 1024, 1024, 1, disk_b);
        attach_partition(&comp, 3, "pc", 0, 2048, 1024, 2, disk_c);
        wire(&volume, &comp);

        let tables = generate_dm_tables(&volume).unwrap();
        assert_eq!(tables.len(), 3);
        let top = tables.last().unwrap();
        assert!(top.line.contains("raid5_ls 1 64 3"));
        assert_eq!(top.line.matches("- -").count(), 1);
    }

    #[test]
    fn raid5_with_two_missing_legs_is_missing_disk() {
        let disk_a = present_disk(1, "d1", "/dev/sdb", 0);
        let disk_b = absent_disk(2, "d2");
        let disk_c = absent_disk(3, "d3");
        let volume = make_volume("v1", VolumeKind::Raid5, 3072, 1);
        let comp = make_component(1, "c1", ComponentKind::Raid, 3, Some((64, 3)));
        attach_partition(&comp, 1, "pa", 0, 0, 1024, 0, disk_a);
        attach_partition(&comp, 2, "pb", 0, 1024, 1024, 1, disk_b);
        attach_partition(&comp, 3, "pc", 0, 2048, 1024, 2, disk_c);
        wire(&volume, &comp);

        let err = generate_dm_tables(&volume).unwrap_err();
        assert!(matches!(err, LdmError::MissingDisk(_)));
    }

    #[test]
    fn raid5_with_non_raid_component_is_not_supported() {
        let disk = present_disk(1, "d1", "/dev/sdb", 0);
        let volume = make_volume("v1", VolumeKind::Raid5, 1024, 1);
        let comp = make_component(1, "c1", ComponentKind::Spanned, 1, None);
        attach_partition(&comp, 1, "pa", 0, 0, 1024, 0, disk);
        wire(&volume, &comp);

        let err = generate_dm_tables(&volume).unwrap_err();
        assert!(matches!(err, LdmError::NotSupported(_)));
    }
}
