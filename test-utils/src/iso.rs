//! Minimal ISO 9660 image writer for installer tests.

use std::collections::BTreeMap;
use std::path::Path;

const SECTOR: usize = 2048;
const FIRST_DIR_SECTOR: usize = 18;

#[derive(Default)]
struct Dir {
    dirs: BTreeMap<String, Dir>,
    files: BTreeMap<String, Vec<u8>>,
}

impl Dir {
    fn insert(&mut self, path: &str, data: Vec<u8>) {
        match path.split_once('/') {
            Some((dir, rest)) => self.dirs.entry(dir.to_ascii_uppercase()).or_default().insert(rest, data),
            None => {
                self.files.insert(path.to_ascii_uppercase(), data);
            }
        }
    }
}

fn record(name: &[u8], lba: usize, size: usize, dir: bool) -> Vec<u8> {
    let len = 33 + name.len() + (name.len() + 1) % 2;
    let mut r = vec![0u8; len];
    r[0] = len as u8;
    r[2..6].copy_from_slice(&(lba as u32).to_le_bytes());
    r[6..10].copy_from_slice(&(lba as u32).to_be_bytes());
    r[10..14].copy_from_slice(&(size as u32).to_le_bytes());
    r[14..18].copy_from_slice(&(size as u32).to_be_bytes());
    r[25] = if dir { 0x02 } else { 0 };
    r[32] = name.len() as u8;
    r[33..33 + name.len()].copy_from_slice(name);
    r
}

/// Lay records out so none crosses a sector boundary.
fn layout(records: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for r in records {
        let used = out.len() % SECTOR;
        if used + r.len() > SECTOR {
            out.resize(out.len() + SECTOR - used, 0);
        }
        out.extend_from_slice(r);
    }
    out.resize(out.len().div_ceil(SECTOR).max(1) * SECTOR, 0);
    out
}

/// Placement of one directory.
struct Placed {
    lba: usize,
    size: usize,
}

/// Builds ISO 9660 images from in-memory files. Paths use `/` and are
/// stored upper-case with a `;1` version.
#[derive(Default)]
pub struct IsoBuilder {
    root: Dir,
}

impl IsoBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(mut self, path: &str, data: impl Into<Vec<u8>>) -> Self {
        self.root.insert(path.trim_start_matches('/'), data.into());
        self
    }

    pub fn build(&self) -> Vec<u8> {
        // Directory sizes only depend on names, so place directories first.
        let mut dirs: Vec<(&Dir, Placed)> = Vec::new();
        let mut next = FIRST_DIR_SECTOR;
        Self::place_dirs(&self.root, &mut dirs, &mut next);

        let mut file_lbas: Vec<usize> = Vec::new();
        for (dir, _) in &dirs {
            for data in dir.files.values() {
                file_lbas.push(next);
                next += data.len().div_ceil(SECTOR).max(1);
            }
        }

        let mut image = vec![0u8; next * SECTOR];
        let root = &dirs[0].1;
        let pvd = 16 * SECTOR;
        image[pvd] = 1;
        image[pvd + 1..pvd + 6].copy_from_slice(b"CD001");
        image[pvd + 6] = 1;
        let root_record = record(&[0], root.lba, root.size, true);
        image[pvd + 156..pvd + 156 + root_record.len()].copy_from_slice(&root_record);
        let terminator = 17 * SECTOR;
        image[terminator] = 255;
        image[terminator + 1..terminator + 6].copy_from_slice(b"CD001");

        let mut file_index = 0;
        for (index, (dir, placed)) in dirs.iter().enumerate() {
            let mut records = vec![
                record(&[0], placed.lba, placed.size, true),
                record(&[1], placed.lba, placed.size, true),
            ];
            // Children were placed in the same order they are walked here.
            let mut child = index + 1;
            for name in dir.dirs.keys() {
                let p = &dirs[child].1;
                records.push(record(name.as_bytes(), p.lba, p.size, true));
                child += Self::count_dirs(&dir.dirs[name]);
            }
            for (name, data) in &dir.files {
                let lba = file_lbas[file_index];
                file_index += 1;
                records.push(record(format!("{};1", name).as_bytes(), lba, data.len(), false));
                image[lba * SECTOR..lba * SECTOR + data.len()].copy_from_slice(data);
            }
            let bytes = layout(&records);
            image[placed.lba * SECTOR..placed.lba * SECTOR + bytes.len()].copy_from_slice(&bytes);
        }
        image
    }

    pub fn write_to(&self, path: &Path) -> std::io::Result<()> {
        std::fs::write(path, self.build())
    }

    fn dir_size(dir: &Dir) -> usize {
        let mut records = vec![record(&[0], 0, 0, true), record(&[1], 0, 0, true)];
        records.extend(dir.dirs.keys().map(|n| record(n.as_bytes(), 0, 0, true)));
        records.extend(dir.files.keys().map(|n| record(format!("{};1", n).as_bytes(), 0, 0, false)));
        layout(&records).len()
    }

    fn count_dirs(dir: &Dir) -> usize {
        1 + dir.dirs.values().map(Self::count_dirs).sum::<usize>()
    }

    /// Pre-order placement: a directory, then each subtree in name order.
    fn place_dirs<'a>(dir: &'a Dir, out: &mut Vec<(&'a Dir, Placed)>, next: &mut usize) {
        let size = Self::dir_size(dir);
        out.push((dir, Placed { lba: *next, size }));
        *next += size / SECTOR;
        for child in dir.dirs.values() {
            Self::place_dirs(child, out, next);
        }
    }
}
