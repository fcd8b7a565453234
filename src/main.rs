use clap::Parser;
use prettytable::{row, Table};

use ldm::Ldm;

#[derive(Debug, Parser)]
struct Arguments {
    /// Block device or disk image paths contributing to the same disk group(s).
    paths: Vec<String>,
}

fn main() {
    env_logger::init();
    let args = Arguments::parse();
    let mut registry = Ldm::new();

    for path in &args.paths {
        if let Err(e) = registry.add(std::path::Path::new(path)) {
            eprintln!("Error adding {path}: {e}");
        }
    }

    for group in registry.disk_groups() {
        println!("Disk group {} ({})", group.name, group.guid);

        let mut disks = Table::new();
        disks.add_row(row!["Disk", "GUID", "Device"]);
        for disk in &group.disks {
            disks.add_row(row![
                disk.name,
                disk.guid,
                disk.device()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(absent)".to_string())
            ]);
        }
        disks.printstd();

        for volume in group.volumes() {
            println!("  Volume {}", volume.name);
            match volume.generate_dm_tables() {
                Ok(tables) => {
                    for table in tables {
                        print!("    {}: {}", table.name, table.line);
                    }
                }
                Err(e) => eprintln!("    cannot generate dm tables: {e}"),
            }
        }
        println!();
    }
}
