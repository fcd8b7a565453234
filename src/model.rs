//! In-memory domain model (§3). The decode phase (`record.rs`) produces
//! plain-data draft records keyed by `u32` id; the resolver (`resolve.rs`)
//! is the only place that allocates this module's `Rc<RefCell<_>>` graph
//! and wires cross-references, using `Weak` on every child→parent edge so
//! the group's ownership tree has no reference cycles (SPEC_FULL.md §9).

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::{Rc, Weak};

use crate::guid::Guid;
use crate::record::{ComponentKind, VolumeKind};

/// `Disk.device` and its accompanying geometry fields are the only fields
/// ever mutated after the resolver hands back a `DiskGroup`. Grouped behind
/// one `RefCell<Option<DiskLocation>>` so ingestion either sets the whole
/// bundle exactly once or leaves it `None`.
#[derive(Debug, Clone)]
pub struct DiskLocation {
    pub device: PathBuf,
    pub data_start: u64,
    pub data_size: u64,
    pub metadata_start: u64,
    pub metadata_size: u64,
}

#[derive(Debug)]
pub struct Disk {
    pub id: u32,
    pub name: String,
    pub guid: Guid,
    location: RefCell<Option<DiskLocation>>,
    dgname: RefCell<String>,
}

impl Disk {
    pub fn new(id: u32, name: String, guid: Guid) -> Self {
        Self {
            id,
            name,
            guid,
            location: RefCell::new(None),
            dgname: RefCell::new(String::new()),
        }
    }

    pub fn dgname(&self) -> String {
        self.dgname.borrow().clone()
    }

    pub fn set_dgname(&self, name: &str) {
        *self.dgname.borrow_mut() = name.to_string();
    }

    pub fn set_location(&self, location: DiskLocation) {
        *self.location.borrow_mut() = Some(location);
    }

    pub fn device(&self) -> Option<PathBuf> {
        self.location.borrow().as_ref().map(|l| l.device.clone())
    }

    pub fn data_start(&self) -> Option<u64> {
        self.location.borrow().as_ref().map(|l| l.data_start)
    }

    pub fn data_size(&self) -> Option<u64> {
        self.location.borrow().as_ref().map(|l| l.data_size)
    }

    pub fn metadata_start(&self) -> Option<u64> {
        self.location.borrow().as_ref().map(|l| l.metadata_start)
    }

    pub fn metadata_size(&self) -> Option<u64> {
        self.location.borrow().as_ref().map(|l| l.metadata_size)
    }

    pub fn is_present(&self) -> bool {
        self.location.borrow().is_some()
    }
}

#[derive(Debug)]
pub struct Partition {
    pub id: u32,
    pub name: String,
    pub start: u64,
    pub vol_offset: u64,
    pub size: u64,
    pub index: u32,
    disk: RefCell<Option<Rc<Disk>>>,
    parent: RefCell<Option<Weak<Component>>>,
}

impl Partition {
    pub fn disk(&self) -> Option<Rc<Disk>> {
        self.disk.borrow().clone()
    }

    pub fn parent(&self) -> Option<Rc<Component>> {
        self.parent.borrow().as_ref().and_then(Weak::upgrade)
    }
}

#[derive(Debug)]
pub struct Component {
    pub id: u32,
    pub name: String,
    pub kind: ComponentKind,
    pub declared_n_parts: u32,
    pub stripe_size: Option<u64>,
    pub n_columns: Option<u32>,
    parts: RefCell<Vec<Rc<Partition>>>,
    parent: RefCell<Option<Weak<Volume>>>,
}

impl Component {
    pub fn partitions(&self) -> Vec<Rc<Partition>> {
        self.parts.borrow().clone()
    }

    pub fn parent(&self) -> Option<Rc<Volume>> {
        self.parent.borrow().as_ref().and_then(Weak::upgrade)
    }
}

#[derive(Debug)]
pub struct Volume {
    pub id: u32,
    pub name: String,
    pub kind: VolumeKind,
    pub size: u64,
    pub part_type: u8,
    pub hint: Option<String>,
    pub id1: Option<String>,
    pub id2: Option<String>,
    pub size2: Option<u64>,
    pub declared_n_comps: u32,
    pub dgname: RefCell<String>,
    comps: RefCell<Vec<Rc<Component>>>,
}

impl Volume {
    pub fn components(&self) -> Vec<Rc<Component>> {
        self.comps.borrow().clone()
    }

    pub fn dgname(&self) -> String {
        self.dgname.borrow().clone()
    }

    /// Produces this volume's ordered device-mapper activation tables
    /// (§4.H). See [`crate::dm::generate_dm_tables`].
    pub fn generate_dm_tables(&self) -> Result<Vec<crate::dm::DmTable>, crate::error::LdmError> {
        crate::dm::generate_dm_tables(self)
    }
}

pub struct DiskGroup {
    pub id: u32,
    pub name: String,
    pub guid: Guid,
    pub sequence: u64,
    pub disks: Vec<Rc<Disk>>,
    pub components: Vec<Rc<Component>>,
    pub partitions: Vec<Rc<Partition>>,
    pub volumes: Vec<Rc<Volume>>,
}

impl DiskGroup {
    pub fn volumes(&self) -> &[Rc<Volume>] {
        &self.volumes
    }

    pub fn disk_by_guid(&self, guid: &Guid) -> Option<&Rc<Disk>> {
        self.disks.iter().find(|d| &d.guid == guid)
    }
}

/// Builder used exclusively by `resolve.rs`: constructs `Partition`,
/// `Component`, and `Volume` nodes with empty child lists/back-references,
/// then wires them once every node exists.
pub(crate) mod build {
    use super::*;

    pub fn partition(
        id: u32,
        name: String,
        start: u64,
        vol_offset: u64,
        size: u64,
        index: u32,
    ) -> Partition {
        Partition {
            id,
            name,
            start,
            vol_offset,
            size,
            index,
            disk: RefCell::new(None),
            parent: RefCell::new(None),
        }
    }

    pub fn component(
        id: u32,
        name: String,
        kind: ComponentKind,
        declared_n_parts: u32,
        stripe_size: Option<u64>,
        n_columns: Option<u32>,
    ) -> Component {
        Component {
            id,
            name,
            kind,
            declared_n_parts,
            stripe_size,
            n_columns,
            parts: RefCell::new(Vec::new()),
            parent: RefCell::new(None),
        }
    }

    pub fn volume(
        id: u32,
        name: String,
        kind: VolumeKind,
        size: u64,
        part_type: u8,
        hint: Option<String>,
        id1: Option<String>,
        id2: Option<String>,
        size2: Option<u64>,
        declared_n_comps: u32,
    ) -> Volume {
        Volume {
            id,
            name,
            kind,
            size,
            part_type,
            hint,
            id1,
            id2,
            size2,
            declared_n_comps,
            dgname: RefCell::new(String::new()),
            comps: RefCell::new(Vec::new()),
        }
    }

    pub fn set_partition_disk(partition: &Partition, disk: Rc<Disk>) {
        *partition.disk.borrow_mut() = Some(disk);
    }

    pub fn set_partition_parent(partition: &Partition, parent: &Rc<Component>) {
        *partition.parent.borrow_mut() = Some(Rc::downgrade(parent));
    }

    pub fn push_component_partition(component: &Component, partition: Rc<Partition>) {
        component.parts.borrow_mut().push(partition);
    }

    pub fn sort_component_partitions(component: &Component) {
        component.parts.borrow_mut().sort_by_key(|p| p.index);
    }

    pub fn set_component_parent(component: &Component, parent: &Rc<Volume>) {
        *component.parent.borrow_mut() = Some(Rc::downgrade(parent));
    }

    pub fn push_volume_component(volume: &Volume, component: Rc<Component>) {
        volume.comps.borrow_mut().push(component);
    }

    pub fn set_dgname(volume: &Volume, name: &str) {
        *volume.dgname.borrow_mut() = name.to_string();
    }
}
