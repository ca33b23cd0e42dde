//! Read-only access to ISO 9660 images.
//!
//! Only what installer media need: the primary volume descriptor, plain
//! directory records and file extents. No Joliet or Rock Ridge.

use guestctl_shared::errors::{GuestctlError, GuestctlResult};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

const SECTOR_SIZE: usize = 2048;
const PVD_SECTOR: u64 = 16;
const PVD_TYPE: u8 = 1;
const STANDARD_ID: &[u8] = b"CD001";
const ROOT_RECORD_OFFSET: usize = 156;
const MIN_RECORD_LEN: usize = 34;
const FLAG_DIRECTORY: u8 = 0x02;

/// A file or directory inside an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsoEntry {
    /// Name without version suffix.
    pub name: String,
    /// First sector of the extent.
    pub lba: u32,
    pub size: u32,
    pub is_dir: bool,
}

impl IsoEntry {
    fn parse(record: &[u8]) -> GuestctlResult<Self> {
        if record.len() < MIN_RECORD_LEN {
            return Err(malformed("directory record too short"));
        }
        let name_len = record[32] as usize;
        let name = record
            .get(33..33 + name_len)
            .ok_or_else(|| malformed("directory record name out of bounds"))?;
        Ok(Self {
            name: clean_name(name),
            lba: u32::from_le_bytes([record[2], record[3], record[4], record[5]]),
            size: u32::from_le_bytes([record[10], record[11], record[12], record[13]]),
            is_dir: record[25] & FLAG_DIRECTORY != 0,
        })
    }
}

/// Strip the `;1` version and the dot of extension-less names. The self
/// and parent records come out empty.
fn clean_name(raw: &[u8]) -> String {
    if raw == [0] || raw == [1] {
        return String::new();
    }
    let name = String::from_utf8_lossy(raw);
    let name = name.split(';').next().unwrap_or_default();
    name.strip_suffix('.').unwrap_or(name).to_string()
}

fn malformed(what: &str) -> GuestctlError {
    GuestctlError::InvalidArgument(format!("malformed ISO 9660 image: {}", what))
}

#[derive(Debug)]
pub struct IsoImage {
    path: PathBuf,
    file: File,
    root: IsoEntry,
}

impl IsoImage {
    pub fn open(path: impl AsRef<Path>) -> GuestctlResult<Self> {
        let path = path.as_ref();
        let mut file = File::open(path)?;

        let mut pvd = vec![0u8; SECTOR_SIZE];
        file.seek(SeekFrom::Start(PVD_SECTOR * SECTOR_SIZE as u64))?;
        file.read_exact(&mut pvd).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => malformed("no volume descriptor"),
            _ => GuestctlError::Io(e),
        })?;
        if pvd[0] != PVD_TYPE || &pvd[1..6] != STANDARD_ID {
            return Err(GuestctlError::InvalidArgument(format!(
                "\"{}\" is not an ISO 9660 image",
                path.display()
            )));
        }
        let root = IsoEntry::parse(&pvd[ROOT_RECORD_OFFSET..ROOT_RECORD_OFFSET + MIN_RECORD_LEN])?;

        tracing::debug!(path = %path.display(), root_lba = root.lba, "Opened ISO image");
        Ok(Self {
            path: path.to_path_buf(),
            file,
            root,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn root(&self) -> &IsoEntry {
        &self.root
    }

    fn read_extent(&mut self, lba: u32, size: u32) -> GuestctlResult<Vec<u8>> {
        let mut data = vec![0u8; size as usize];
        self.file.seek(SeekFrom::Start(lba as u64 * SECTOR_SIZE as u64))?;
        self.file.read_exact(&mut data)?;
        Ok(data)
    }

    /// Entries of a directory, without the self and parent records.
    pub fn list(&mut self, dir: &IsoEntry) -> GuestctlResult<Vec<IsoEntry>> {
        if !dir.is_dir {
            return Err(GuestctlError::InvalidArgument(format!("\"{}\" is not a directory", dir.name)));
        }
        let extent = self.read_extent(dir.lba, dir.size)?;

        let mut entries = Vec::new();
        let mut pos = 0;
        while pos < extent.len() {
            let len = extent[pos] as usize;
            if len == 0 {
                // Records never cross sectors; the rest of this one is padding.
                pos = (pos / SECTOR_SIZE + 1) * SECTOR_SIZE;
                continue;
            }
            let record = extent
                .get(pos..pos + len)
                .ok_or_else(|| malformed("directory record crosses extent end"))?;
            let entry = IsoEntry::parse(record)?;
            if !entry.name.is_empty() {
                entries.push(entry);
            }
            pos += len;
        }
        Ok(entries)
    }

    /// Find an entry by path. Components may be separated by `/` or `\`
    /// and match case-insensitively.
    pub fn lookup(&mut self, path: &str) -> GuestctlResult<Option<IsoEntry>> {
        let mut current = self.root.clone();
        for component in path.split(['/', '\\']).filter(|c| !c.is_empty()) {
            if !current.is_dir {
                return Ok(None);
            }
            let found = self
                .list(&current)?
                .into_iter()
                .find(|e| e.name.eq_ignore_ascii_case(component));
            match found {
                Some(entry) => current = entry,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    pub fn read_file(&mut self, entry: &IsoEntry) -> GuestctlResult<Vec<u8>> {
        if entry.is_dir {
            return Err(GuestctlError::InvalidArgument(format!("\"{}\" is a directory", entry.name)));
        }
        self.read_extent(entry.lba, entry.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn record(name: &[u8], lba: u32, size: u32, dir: bool) -> Vec<u8> {
        let len = 33 + name.len() + (name.len() + 1) % 2;
        let mut r = vec![0u8; len];
        r[0] = len as u8;
        r[2..6].copy_from_slice(&lba.to_le_bytes());
        r[10..14].copy_from_slice(&size.to_le_bytes());
        r[25] = if dir { FLAG_DIRECTORY } else { 0 };
        r[32] = name.len() as u8;
        r[33..33 + name.len()].copy_from_slice(name);
        r
    }

    /// Root at sector 18 holding `README.TXT;1`, its data at sector 19.
    fn tiny_image() -> tempfile::NamedTempFile {
        let mut image = vec![0u8; SECTOR_SIZE * 20];
        let pvd = 16 * SECTOR_SIZE;
        image[pvd] = PVD_TYPE;
        image[pvd + 1..pvd + 6].copy_from_slice(STANDARD_ID);
        let root = record(&[0], 18, SECTOR_SIZE as u32, true);
        image[pvd + ROOT_RECORD_OFFSET..pvd + ROOT_RECORD_OFFSET + root.len()].copy_from_slice(&root);

        let mut dir = Vec::new();
        dir.extend(record(&[0], 18, SECTOR_SIZE as u32, true));
        dir.extend(record(&[1], 18, SECTOR_SIZE as u32, true));
        dir.extend(record(b"README.TXT;1", 19, 5, false));
        image[18 * SECTOR_SIZE..18 * SECTOR_SIZE + dir.len()].copy_from_slice(&dir);
        image[19 * SECTOR_SIZE..19 * SECTOR_SIZE + 5].copy_from_slice(b"hello");

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&image).unwrap();
        file
    }

    #[test]
    fn test_clean_name() {
        assert_eq!(clean_name(b"VBOXWINDOWSADDITIONS.EXE;1"), "VBOXWINDOWSADDITIONS.EXE");
        assert_eq!(clean_name(b"CERT.;1"), "CERT");
        assert_eq!(clean_name(b"SUBDIR"), "SUBDIR");
        assert_eq!(clean_name(&[0]), "");
    }

    #[test]
    fn test_lookup_and_read() {
        let file = tiny_image();
        let mut iso = IsoImage::open(file.path()).unwrap();
        let root = iso.root().clone();
        assert_eq!(iso.list(&root).unwrap().len(), 1);

        let entry = iso.lookup("/readme.txt").unwrap().unwrap();
        assert_eq!(entry.size, 5);
        assert_eq!(iso.read_file(&entry).unwrap(), b"hello");
        assert!(iso.lookup("missing.bin").unwrap().is_none());
        assert!(iso.lookup("readme.txt/below").unwrap().is_none());
    }

    #[test]
    fn test_rejects_non_iso() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&vec![0u8; SECTOR_SIZE * 17]).unwrap();
        assert!(IsoImage::open(file.path()).is_err());
    }
}
