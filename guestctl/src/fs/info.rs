//! Filesystem object information.

use crate::process::stream::StreamBlock;
use chrono::{DateTime, Utc};
use guestctl_shared::errors::{GuestctlError, GuestctlResult};
use guestctl_shared::protocol::{FsObjRecord, FsObjType};
use serde::{Deserialize, Serialize};
use std::fs::Metadata;

/// Information about a file, directory or other object, on either side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsObjData {
    pub name: String,
    pub obj_type: FsObjType,
    pub size: u64,
    pub alloc_size: u64,
    /// Permission bits only; the type lives in `obj_type`.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub node_id: u64,
    pub access_time: DateTime<Utc>,
    pub modification_time: DateTime<Utc>,
    pub change_time: DateTime<Utc>,
    pub birth_time: DateTime<Utc>,
}

fn from_nanos(ns: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(ns)
}

fn to_nanos(time: &DateTime<Utc>) -> i64 {
    time.timestamp_nanos_opt().unwrap_or_default()
}

impl FsObjData {
    pub fn is_file(&self) -> bool {
        self.obj_type == FsObjType::File
    }

    pub fn is_directory(&self) -> bool {
        self.obj_type == FsObjType::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.obj_type == FsObjType::Symlink
    }

    pub fn from_record(record: &FsObjRecord) -> Self {
        Self {
            name: record.name.clone(),
            obj_type: record.obj_type,
            size: record.size,
            alloc_size: record.alloc_size,
            mode: record.mode & 0o7777,
            uid: record.uid,
            gid: record.gid,
            node_id: record.node_id,
            access_time: from_nanos(record.access_time_ns),
            modification_time: from_nanos(record.modification_time_ns),
            change_time: from_nanos(record.change_time_ns),
            birth_time: from_nanos(record.birth_time_ns),
        }
    }

    pub fn to_record(&self) -> FsObjRecord {
        FsObjRecord {
            name: self.name.clone(),
            obj_type: self.obj_type,
            size: self.size,
            alloc_size: self.alloc_size,
            mode: self.mode,
            uid: self.uid,
            gid: self.gid,
            node_id: self.node_id,
            access_time_ns: to_nanos(&self.access_time),
            modification_time_ns: to_nanos(&self.modification_time),
            change_time_ns: to_nanos(&self.change_time),
            birth_time_ns: to_nanos(&self.birth_time),
        }
    }

    /// Parse one block of `vbox_stat --machinereadable` output.
    ///
    /// `name` and `ftype` are mandatory; numeric keys default to zero when
    /// absent but must parse when present.
    pub fn from_stat_block(block: &StreamBlock) -> GuestctlResult<Self> {
        let name = block
            .get("name")
            .ok_or_else(|| GuestctlError::Protocol("stat output lacks \"name\"".into()))?;
        let ftype = block
            .get("ftype")
            .and_then(|t| t.chars().next())
            .ok_or_else(|| GuestctlError::Protocol("stat output lacks \"ftype\"".into()))?;

        fn number<T: std::str::FromStr + Default>(block: &StreamBlock, key: &str) -> GuestctlResult<T> {
            match block.get(key) {
                None => Ok(T::default()),
                Some(raw) => raw.trim().parse().map_err(|_| {
                    GuestctlError::Protocol(format!("stat value {}=\"{}\" is not a number", key, raw))
                }),
            }
        }

        let mode = match block.get("mode") {
            None => 0,
            Some(raw) => u32::from_str_radix(raw.trim(), 8).map_err(|_| {
                GuestctlError::Protocol(format!("stat mode \"{}\" is not octal", raw))
            })?,
        };

        Ok(Self {
            name: name.to_string(),
            obj_type: FsObjType::from_tag(ftype),
            size: number(block, "st_size")?,
            alloc_size: number(block, "alloc")?,
            mode: mode & 0o7777,
            uid: number(block, "uid")?,
            gid: number(block, "gid")?,
            node_id: number(block, "node_id")?,
            access_time: from_nanos(number(block, "st_atime")?),
            modification_time: from_nanos(number(block, "st_mtime")?),
            change_time: from_nanos(number(block, "st_ctime")?),
            birth_time: from_nanos(number(block, "st_birthtime")?),
        })
    }

    pub fn to_stat_block(&self) -> StreamBlock {
        let mut block = StreamBlock::default();
        block.insert("name", self.name.clone());
        block.insert("ftype", self.obj_type.tag().to_string());
        block.insert("st_size", self.size.to_string());
        block.insert("alloc", self.alloc_size.to_string());
        block.insert("mode", format!("{:o}", self.mode));
        block.insert("uid", self.uid.to_string());
        block.insert("gid", self.gid.to_string());
        block.insert("node_id", self.node_id.to_string());
        block.insert("st_atime", to_nanos(&self.access_time).to_string());
        block.insert("st_mtime", to_nanos(&self.modification_time).to_string());
        block.insert("st_ctime", to_nanos(&self.change_time).to_string());
        block.insert("st_birthtime", to_nanos(&self.birth_time).to_string());
        block
    }

    /// Describe a host object from its (not followed) metadata.
    pub fn from_metadata(name: impl Into<String>, meta: &Metadata) -> Self {
        let file_type = meta.file_type();
        let obj_type = if file_type.is_symlink() {
            FsObjType::Symlink
        } else if file_type.is_dir() {
            FsObjType::Directory
        } else if file_type.is_file() {
            FsObjType::File
        } else {
            special_type(&file_type)
        };

        let system_time = |t: std::io::Result<std::time::SystemTime>| {
            t.map(DateTime::<Utc>::from).unwrap_or_default()
        };
        let modification_time = system_time(meta.modified());

        let mut data = Self {
            name: name.into(),
            obj_type,
            size: meta.len(),
            alloc_size: meta.len(),
            mode: if meta.permissions().readonly() { 0o444 } else { 0o644 },
            uid: 0,
            gid: 0,
            node_id: 0,
            access_time: system_time(meta.accessed()),
            modification_time,
            change_time: modification_time,
            birth_time: system_time(meta.created()),
        };

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            data.mode = meta.mode() & 0o7777;
            data.uid = meta.uid();
            data.gid = meta.gid();
            data.node_id = meta.ino();
            data.alloc_size = meta.blocks() * 512;
            data.change_time = DateTime::from_timestamp(meta.ctime(), meta.ctime_nsec() as u32)
                .unwrap_or(modification_time);
        }

        data
    }
}

#[cfg(unix)]
fn special_type(file_type: &std::fs::FileType) -> FsObjType {
    use std::os::unix::fs::FileTypeExt;
    if file_type.is_fifo() {
        FsObjType::Fifo
    } else if file_type.is_socket() {
        FsObjType::Socket
    } else if file_type.is_char_device() {
        FsObjType::DevChar
    } else if file_type.is_block_device() {
        FsObjType::DevBlock
    } else {
        FsObjType::Unknown
    }
}

#[cfg(not(unix))]
fn special_type(_file_type: &std::fs::FileType) -> FsObjType {
    FsObjType::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stat_block_parsing() {
        let mut block = StreamBlock::default();
        block.insert("name", "/data/x.txt");
        block.insert("ftype", "-");
        block.insert("st_size", "10");
        block.insert("mode", "644");
        block.insert("st_mtime", "1700000000000000000");

        let data = FsObjData::from_stat_block(&block).unwrap();
        assert!(data.is_file());
        assert_eq!(data.size, 10);
        assert_eq!(data.mode, 0o644);
        assert_eq!(data.modification_time.timestamp(), 1_700_000_000);
        assert_eq!(data.uid, 0);
    }

    #[test]
    fn test_stat_block_missing_type_is_protocol_error() {
        let mut block = StreamBlock::default();
        block.insert("name", "x");
        assert!(matches!(
            FsObjData::from_stat_block(&block),
            Err(GuestctlError::Protocol(_))
        ));

        block.insert("ftype", "d");
        block.insert("st_size", "ten");
        assert!(matches!(
            FsObjData::from_stat_block(&block),
            Err(GuestctlError::Protocol(_))
        ));
    }

    #[test]
    fn test_stat_block_and_record_agree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"hello").unwrap();
        let meta = std::fs::symlink_metadata(&path).unwrap();

        let data = FsObjData::from_metadata("f", &meta);
        assert!(data.is_file());
        assert_eq!(data.size, 5);
        assert_eq!(FsObjData::from_stat_block(&data.to_stat_block()).unwrap(), data);
        assert_eq!(FsObjData::from_record(&data.to_record()), data);
    }
}
