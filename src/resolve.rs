//! Topology resolver (§4.F). Grounded on `original_source/src/ldm.c`'s
//! `_parse_vblks` tail: count assertions, partition→disk/component linking,
//! `_cmp_component_parts` index sort, component→volume linking, dgname
//! propagation.

use std::collections::HashMap;
use std::rc::Rc;

use crate::error::LdmError;
use crate::guid::Guid;
use crate::model::{build, Component, DiskGroup, Disk};
use crate::record::{DraftComponent, DraftDisk, DraftDiskGroup, DraftPartition, DraftVolume, Vmdb};

/// Everything decoded off one disk's VBLK stream, before resolution.
#[derive(Default)]
pub struct DraftGroup {
    pub disk_group: Option<DraftDiskGroup>,
    pub disks: Vec<DraftDisk>,
    pub components: Vec<DraftComponent>,
    pub partitions: Vec<DraftPartition>,
    pub volumes: Vec<DraftVolume>,
}

pub fn resolve(draft: DraftGroup, vmdb: &Vmdb, guid: Guid) -> Result<DiskGroup, LdmError> {
    let dg = draft
        .disk_group
        .ok_or_else(|| LdmError::Invalid("no disk group record in VBLK stream".into()))?;
    let sequence = vmdb.committed_seq;

    // 1. Committed counts from the VMDB must match what was actually decoded.
    if draft.disks.len() as u32 != vmdb.n_committed_disk {
        return Err(LdmError::Invalid(format!(
            "disk count {} does not match VMDB committed count {}",
            draft.disks.len(),
            vmdb.n_committed_disk
        )));
    }
    if draft.components.len() as u32 != vmdb.n_committed_comp {
        return Err(LdmError::Invalid(format!(
            "component count {} does not match VMDB committed count {}",
            draft.components.len(),
            vmdb.n_committed_comp
        )));
    }
    if draft.partitions.len() as u32 != vmdb.n_committed_part {
        return Err(LdmError::Invalid(format!(
            "partition count {} does not match VMDB committed count {}",
            draft.partitions.len(),
            vmdb.n_committed_part
        )));
    }
    if draft.volumes.len() as u32 != vmdb.n_committed_vol {
        return Err(LdmError::Invalid(format!(
            "volume count {} does not match VMDB committed count {}",
            draft.volumes.len(),
            vmdb.n_committed_vol
        )));
    }

    let disks: Vec<Rc<Disk>> = draft
        .disks
        .iter()
        .map(|d| Rc::new(Disk::new(d.id, d.name.clone(), d.guid)))
        .collect();
    let disks_by_id: HashMap<u32, Rc<Disk>> = disks.iter().map(|d| (d.id, Rc::clone(d))).collect();

    let components: Vec<Rc<Component>> = draft
        .components
        .iter()
        .map(|c| {
            Rc::new(build::component(
                c.id,
                c.name.clone(),
                c.kind,
                c.n_parts,
                c.stripe_size,
                c.n_columns,
            ))
        })
        .collect();
    let components_by_id: HashMap<u32, Rc<Component>> =
        components.iter().map(|c| (c.id, Rc::clone(c))).collect();

    let volumes: Vec<Rc<crate::model::Volume>> = draft
        .volumes
        .iter()
        .map(|v| {
            Rc::new(build::volume(
                v.id,
                v.name.clone(),
                v.kind,
                v.size,
                v.part_type,
                v.hint.clone(),
                v.id1.clone(),
                v.id2.clone(),
                v.size2,
                v.n_comps,
            ))
        })
        .collect();
    let volumes_by_id: HashMap<u32, Rc<crate::model::Volume>> =
        volumes.iter().map(|v| (v.id, Rc::clone(v))).collect();

    // 2. Link partitions to their disk and parent component.
    let mut partitions = Vec::with_capacity(draft.partitions.len());
    for p in &draft.partitions {
        let disk = disks_by_id
            .get(&p.disk_id)
            .ok_or_else(|| LdmError::Invalid(format!("partition {} references unknown disk {}", p.id, p.disk_id)))?;
        let component = components_by_id.get(&p.parent_id).ok_or_else(|| {
            LdmError::Invalid(format!(
                "partition {} references unknown component {}",
                p.id, p.parent_id
            ))
        })?;

        let partition = Rc::new(build::partition(
            p.id,
            p.name.clone(),
            p.start,
            p.vol_offset,
            p.size,
            p.index,
        ));
        build::set_partition_disk(&partition, Rc::clone(disk));
        build::set_partition_parent(&partition, component);
        build::push_component_partition(component, Rc::clone(&partition));
        partitions.push(partition);
    }

    // 3. Sort each component's children by index.
    for c in &components {
        build::sort_component_partitions(c);
    }

    // 4. Assert child counts, link components to their parent volume.
    for c in &components {
        let observed = c.partitions().len() as u32;
        if observed != c.declared_n_parts {
            return Err(LdmError::Invalid(format!(
                "component {} declared {} partitions, observed {observed}",
                c.id, c.declared_n_parts
            )));
        }
        let draft_c = draft
            .components
            .iter()
            .find(|d| d.id == c.id)
            .expect("component present in both draft and resolved lists");
        let volume = volumes_by_id.get(&draft_c.parent_id).ok_or_else(|| {
            LdmError::Invalid(format!(
                "component {} references unknown volume {}",
                c.id, draft_c.parent_id
            ))
        })?;
        build::set_component_parent(c, volume);
        build::push_volume_component(volume, Rc::clone(c));
    }

    // 5. Assert volume child counts; propagate the group name.
    for v in &volumes {
        let observed = v.components().len() as u32;
        if observed != v.declared_n_comps {
            return Err(LdmError::Invalid(format!(
                "volume {} declared {} components, observed {observed}",
                v.id, v.declared_n_comps
            )));
        }
        build::set_dgname(v, &dg.name);
    }
    for d in &disks {
        d.set_dgname(&dg.name);
    }

    Ok(DiskGroup {
        id: dg.id,
        name: dg.name,
        guid,
        sequence,
        disks,
        components,
        partitions,
        volumes,
    })
}
