//! Parses Windows LDM (Dynamic Disk) metadata across a set of block
//! devices, reconstructs disk-group/volume/component/partition topology,
//! and generates Linux device-mapper activation tables for the resulting
//! volumes.
//!
//! The MBR/GPT partition-table reader is an external collaborator exposed
//! through [`probe::PartitionProbe`]; this crate does not issue the
//! generated tables to the kernel itself.

pub mod byteio;
pub mod dm;
pub mod error;
pub mod guid;
pub mod model;
pub mod probe;
pub mod record;
pub mod resolve;
pub mod registry;

pub use dm::{generate_dm_tables, DmTable};
pub use error::{LdmError, Result};
pub use guid::Guid;
pub use model::{Component, Disk, DiskGroup, Partition, Volume};
pub use registry::Ldm;
