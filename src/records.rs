//! Decoded catalog record shapes (C8): inode, directory entry, extended
//! attribute, and file extent values. Decoding only — finding the right
//! record is the navigator/resolver's job; this module turns matched
//! value bytes into typed structs.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use crate::error::{Error, Result};
use crate::families::{decode_obj_id_and_type, J_TYPE_DIR_REC, J_TYPE_INODE};

pub const ROOT_DIR_PARENT: u64 = 1;
pub const ROOT_DIR_RECORD: u64 = 2;

pub const INODE_DIR_TYPE: u16 = 0o040000;
pub const INODE_FILE_TYPE: u16 = 0o100000;
pub const INODE_SYMLINK_TYPE: u16 = 0o120000;

const INO_EXT_TYPE_DSTREAM: u8 = 8;

pub const DT_REG: u16 = 8;
pub const DT_DIR: u16 = 4;
pub const DT_LNK: u16 = 10;

/// Decoded `j_inode_val_t`.
#[derive(Debug, Clone)]
pub struct InodeRecord {
    pub parent_id: u64,
    pub private_id: u64,
    pub create_time: i64,
    pub modify_time: i64,
    pub change_time: i64,
    pub access_time: i64,
    pub internal_flags: u64,
    pub nchildren_or_nlink: i32,
    pub default_protection_class: u32,
    pub write_generation_counter: u32,
    pub bsd_flags: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u16,
    pub uncompressed_size: u64,
    pub dstream_size: Option<u64>,
}

impl InodeRecord {
    const FIXED_SIZE: usize = 92;

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::FIXED_SIZE {
            return Err(Error::Corrupt(format!(
                "inode value too short: {} bytes",
                data.len()
            )));
        }
        let mut cursor = Cursor::new(data);
        let parent_id = cursor.read_u64::<LittleEndian>()?;
        let private_id = cursor.read_u64::<LittleEndian>()?;
        let create_time = cursor.read_i64::<LittleEndian>()?;
        let modify_time = cursor.read_i64::<LittleEndian>()?;
        let change_time = cursor.read_i64::<LittleEndian>()?;
        let access_time = cursor.read_i64::<LittleEndian>()?;
        let internal_flags = cursor.read_u64::<LittleEndian>()?;
        let nchildren_or_nlink = cursor.read_i32::<LittleEndian>()?;
        let default_protection_class = cursor.read_u32::<LittleEndian>()?;
        let write_generation_counter = cursor.read_u32::<LittleEndian>()?;
        let bsd_flags = cursor.read_u32::<LittleEndian>()?;
        let uid = cursor.read_u32::<LittleEndian>()?;
        let gid = cursor.read_u32::<LittleEndian>()?;
        let mode = cursor.read_u16::<LittleEndian>()?;
        let _pad1 = cursor.read_u16::<LittleEndian>()?;
        let uncompressed_size = cursor.read_u64::<LittleEndian>()?;

        let dstream_size = parse_xfield_u64(&data[Self::FIXED_SIZE..], INO_EXT_TYPE_DSTREAM);

        Ok(InodeRecord {
            parent_id,
            private_id,
            create_time,
            modify_time,
            change_time,
            access_time,
            internal_flags,
            nchildren_or_nlink,
            default_protection_class,
            write_generation_counter,
            bsd_flags,
            uid,
            gid,
            mode,
            uncompressed_size,
            dstream_size,
        })
    }

    pub fn kind(&self) -> u16 {
        self.mode & 0o170000
    }

    pub fn size(&self) -> u64 {
        self.dstream_size.unwrap_or(self.uncompressed_size)
    }

    pub fn nlink(&self) -> u32 {
        self.nchildren_or_nlink as u32
    }
}

/// Walk an `xf_blob_t` extended-field list looking for the first field of
/// `wanted_type`, returning the leading 8 bytes of its data as a `u64`.
/// Shared by inode xfields (dstream size) and could be reused for any
/// other xfield whose value opens with a u64.
fn parse_xfield_u64(xfield_data: &[u8], wanted_type: u8) -> Option<u64> {
    if xfield_data.len() < 4 {
        return None;
    }
    let xf_num_exts = u16::from_le_bytes([xfield_data[0], xfield_data[1]]) as usize;
    if xf_num_exts == 0 {
        return None;
    }

    let entries_start = 4;
    let entries_end = entries_start + xf_num_exts * 4;
    if entries_end > xfield_data.len() {
        return None;
    }

    let mut data_offset = entries_end;
    for i in 0..xf_num_exts {
        let entry_off = entries_start + i * 4;
        let x_type = xfield_data[entry_off];
        let x_size =
            u16::from_le_bytes([xfield_data[entry_off + 2], xfield_data[entry_off + 3]]) as usize;

        if x_type == wanted_type && x_size >= 8 && data_offset + 8 <= xfield_data.len() {
            return Some(u64::from_le_bytes(
                xfield_data[data_offset..data_offset + 8].try_into().unwrap(),
            ));
        }

        let padded_size = (x_size + 7) & !7;
        data_offset += padded_size;
    }
    None
}

/// Decoded `j_drec_val_t`.
#[derive(Debug, Clone)]
pub struct DirEntryRecord {
    pub file_id: u64,
    pub date_added: i64,
    pub flags: u16,
}

impl DirEntryRecord {
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 18 {
            return Err(Error::Corrupt(format!(
                "drec value too short: {} bytes",
                data.len()
            )));
        }
        let mut cursor = Cursor::new(data);
        Ok(DirEntryRecord {
            file_id: cursor.read_u64::<LittleEndian>()?,
            date_added: cursor.read_i64::<LittleEndian>()?,
            flags: cursor.read_u16::<LittleEndian>()?,
        })
    }

    pub fn file_type(&self) -> u16 {
        self.flags & 0x000F
    }
}

/// Extract the name carried in a directory-record key: an 8-byte
/// `obj_id_and_type`, a 4-byte `name_len_and_hash` (hashed trees only;
/// unhashed trees skip straight to the name), then the nul-terminated
/// UTF-8 name itself.
pub fn decode_drec_name(key_bytes: &[u8], hashed: bool) -> Result<String> {
    let name_start = if hashed { 12 } else { 8 };
    if key_bytes.len() < name_start {
        return Err(Error::Corrupt("drec key too short for name".into()));
    }

    let name_bytes = if hashed {
        let name_len_and_hash = u32::from_le_bytes(
            key_bytes[8..12].try_into().unwrap(),
        );
        let name_len = (name_len_and_hash & 0x0000_03FF) as usize;
        let name_end = name_start + name_len;
        if name_end > key_bytes.len() {
            return Err(Error::Corrupt(format!(
                "drec name extends beyond key: name_end={name_end}, key_len={}",
                key_bytes.len()
            )));
        }
        &key_bytes[name_start..name_end]
    } else {
        &key_bytes[name_start..]
    };

    let nul_pos = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
    Ok(String::from_utf8_lossy(&name_bytes[..nul_pos]).to_string())
}

/// Decoded `j_file_extent_val_t`.
#[derive(Debug, Clone)]
pub struct FileExtentRecord {
    pub flags_and_length: u64,
    pub phys_block_num: u64,
    pub crypto_id: u64,
}

impl FileExtentRecord {
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 24 {
            return Err(Error::Corrupt(format!(
                "file extent value too short: {} bytes",
                data.len()
            )));
        }
        let mut cursor = Cursor::new(data);
        Ok(FileExtentRecord {
            flags_and_length: cursor.read_u64::<LittleEndian>()?,
            phys_block_num: cursor.read_u64::<LittleEndian>()?,
            crypto_id: cursor.read_u64::<LittleEndian>()?,
        })
    }

    pub fn length(&self) -> u64 {
        self.flags_and_length & 0x00FF_FFFF_FFFF_FFFF
    }
}

/// Where an extended attribute's data actually lives: small values ride
/// along inline in the record; larger ones are stored through a dstream
/// the same way file data is, and the record instead carries that
/// dstream's oid.
#[derive(Debug, Clone)]
pub enum XattrData {
    Inline(Vec<u8>),
    Dstream { oid: u64 },
}

/// Decoded `j_xattr_val_t`: `flags: u16, xdata_len: u16` followed by
/// either the inline bytes or an 8-byte dstream oid, chosen by
/// `XATTR_DATA_STREAM` in `flags`.
#[derive(Debug, Clone)]
pub struct XattrRecord {
    pub flags: u16,
    pub data: XattrData,
}

const XATTR_DATA_STREAM: u16 = 0x0001;

impl XattrRecord {
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::Corrupt(format!(
                "xattr value too short: {} bytes",
                data.len()
            )));
        }
        let mut cursor = Cursor::new(data);
        let flags = cursor.read_u16::<LittleEndian>()?;
        let xdata_len = cursor.read_u16::<LittleEndian>()? as usize;
        let tail = &data[4..];
        if tail.len() < xdata_len {
            return Err(Error::Corrupt("xattr data truncated".into()));
        }

        let xattr_data = if flags & XATTR_DATA_STREAM != 0 {
            if xdata_len < 8 {
                return Err(Error::Corrupt("xattr dstream reference too short".into()));
            }
            let oid = u64::from_le_bytes(tail[0..8].try_into().unwrap());
            XattrData::Dstream { oid }
        } else {
            XattrData::Inline(tail[..xdata_len].to_vec())
        };

        Ok(XattrRecord {
            flags,
            data: xattr_data,
        })
    }
}

/// Extract a name from a catalog key whose tail is a bare, unhashed,
/// nul-terminated string immediately after `obj_id_and_type` (xattr
/// keys use this shape, distinct from dirent keys which may be hashed).
pub fn decode_tail_name(key_bytes: &[u8]) -> Result<String> {
    if key_bytes.len() < 8 {
        return Err(Error::Corrupt("key too short for name tail".into()));
    }
    let tail = &key_bytes[8..];
    let nul_pos = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
    Ok(String::from_utf8_lossy(&tail[..nul_pos]).to_string())
}

/// Split a catalog key's leading `obj_id_and_type`, erroring on a
/// too-short key rather than silently truncating.
pub fn catalog_key_head(key_bytes: &[u8]) -> Result<(u64, u8)> {
    if key_bytes.len() < 8 {
        return Err(Error::Corrupt("catalog key too short".into()));
    }
    let raw = u64::from_le_bytes(key_bytes[0..8].try_into().unwrap());
    Ok(decode_obj_id_and_type(raw))
}

pub fn is_inode_key(key_bytes: &[u8]) -> bool {
    catalog_key_head(key_bytes)
        .map(|(_, kind)| kind == J_TYPE_INODE)
        .unwrap_or(false)
}

pub fn is_dir_record_key(key_bytes: &[u8]) -> bool {
    catalog_key_head(key_bytes)
        .map(|(_, kind)| kind == J_TYPE_DIR_REC)
        .unwrap_or(false)
}
