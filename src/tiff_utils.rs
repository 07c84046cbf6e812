//! Low-level TIFF structure access.
//!
//! The `tiff` crate decodes and encodes pixel data but cannot edit an
//! existing file. Rewriting the embedded metadata record in place needs the
//! raw IFD layout, which is read and patched here.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

pub type AnyResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub const TAG_IMAGE_DESCRIPTION: u16 = 270;

const FIELD_TYPE_ASCII: u16 = 2;
const IFD_ENTRY_LEN: u64 = 12;

#[derive(Debug)]
pub struct TiffHeader {
    pub little_endian: bool,
    pub first_ifd_offset: u32,
}

#[derive(Debug, Clone)]
pub struct IfdEntry {
    pub tag: u16,
    pub field_type: u16,
    pub count: u32,
    pub value_offset: u32,
    pub raw_value_bytes: [u8; 4],
    /// Absolute file position of this 12-byte entry
    pub entry_position: u64,
}

fn read_u16(bytes: [u8; 2], little_endian: bool) -> u16 {
    if little_endian {
        u16::from_le_bytes(bytes)
    } else {
        u16::from_be_bytes(bytes)
    }
}

fn read_u32(bytes: [u8; 4], little_endian: bool) -> u32 {
    if little_endian {
        u32::from_le_bytes(bytes)
    } else {
        u32::from_be_bytes(bytes)
    }
}

fn write_u32(value: u32, little_endian: bool) -> [u8; 4] {
    if little_endian {
        value.to_le_bytes()
    } else {
        value.to_be_bytes()
    }
}

pub fn read_tiff_header(file: &mut File) -> AnyResult<TiffHeader> {
    let mut header_bytes = [0u8; 8];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut header_bytes)?;

    let little_endian = match &header_bytes[0..2] {
        b"II" => true,
        b"MM" => false,
        _ => return Err("Invalid TIFF signature".into()),
    };

    let version = read_u16([header_bytes[2], header_bytes[3]], little_endian);
    if version == 43 {
        return Err("BigTIFF metadata rewriting is not supported".into());
    }
    if version != 42 {
        return Err("Invalid TIFF version".into());
    }

    let first_ifd_offset = read_u32(
        [header_bytes[4], header_bytes[5], header_bytes[6], header_bytes[7]],
        little_endian,
    );

    Ok(TiffHeader {
        little_endian,
        first_ifd_offset,
    })
}

/// Read the IFD starting at the file's current position.
pub fn read_ifd(file: &mut File, little_endian: bool) -> AnyResult<Vec<IfdEntry>> {
    let mut entry_count_bytes = [0u8; 2];
    file.read_exact(&mut entry_count_bytes)?;
    let entry_count = read_u16(entry_count_bytes, little_endian);

    let mut position = file.stream_position()?;
    let mut entries = Vec::with_capacity(entry_count as usize);

    for _ in 0..entry_count {
        let mut entry_bytes = [0u8; 12];
        file.read_exact(&mut entry_bytes)?;

        let raw_value_bytes = [
            entry_bytes[8],
            entry_bytes[9],
            entry_bytes[10],
            entry_bytes[11],
        ];

        entries.push(IfdEntry {
            tag: read_u16([entry_bytes[0], entry_bytes[1]], little_endian),
            field_type: read_u16([entry_bytes[2], entry_bytes[3]], little_endian),
            count: read_u32(
                [entry_bytes[4], entry_bytes[5], entry_bytes[6], entry_bytes[7]],
                little_endian,
            ),
            value_offset: read_u32(raw_value_bytes, little_endian),
            raw_value_bytes,
            entry_position: position,
        });
        position += IFD_ENTRY_LEN;
    }

    Ok(entries)
}

pub fn read_first_ifd(file: &mut File) -> AnyResult<(TiffHeader, Vec<IfdEntry>)> {
    let header = read_tiff_header(file)?;
    file.seek(SeekFrom::Start(u64::from(header.first_ifd_offset)))?;
    let entries = read_ifd(file, header.little_endian)?;
    Ok((header, entries))
}

pub fn read_tag_string_from_ifd(
    file: &mut File,
    entries: &[IfdEntry],
    little_endian: bool,
    tag: u16,
) -> AnyResult<String> {
    let entry = get_entry(entries, tag).ok_or_else(|| format!("Tag {tag} not found"))?;
    let total_bytes = entry.count as usize;
    let mut raw_bytes = vec![0u8; total_bytes];

    let inline = matches!(entry.field_type, 1 | 2 | 7) && total_bytes <= 4;

    if inline {
        if little_endian {
            raw_bytes.copy_from_slice(&entry.raw_value_bytes[..total_bytes]);
        } else {
            let start = 4 - total_bytes;
            raw_bytes.copy_from_slice(&entry.raw_value_bytes[start..]);
        }
    } else {
        let current_pos = file.stream_position()?;
        file.seek(SeekFrom::Start(u64::from(entry.value_offset)))?;
        file.read_exact(&mut raw_bytes)?;
        file.seek(SeekFrom::Start(current_pos))?;
    }

    if let Some(pos) = raw_bytes.iter().position(|&b| b == 0) {
        raw_bytes.truncate(pos);
    }

    Ok(String::from_utf8_lossy(&raw_bytes).to_string())
}

fn get_entry(entries: &[IfdEntry], tag: u16) -> Option<&IfdEntry> {
    entries.iter().find(|entry| entry.tag == tag)
}

/// `ImageDescription` of the first IFD.
pub fn read_image_description(path: &Path) -> AnyResult<String> {
    let mut file = File::open(path)?;
    let (header, entries) = read_first_ifd(&mut file)?;
    read_tag_string_from_ifd(
        &mut file,
        &entries,
        header.little_endian,
        TAG_IMAGE_DESCRIPTION,
    )
}

/// Replace the value of an existing ASCII tag in the first IFD.
///
/// Pixel data and every other entry stay byte-identical. The new value
/// overwrites the old value area when it fits; otherwise it is appended at a
/// word-aligned end-of-file offset and the entry is repointed.
pub fn rewrite_ascii_tag(path: &Path, tag: u16, value: &str) -> AnyResult<()> {
    if !value.is_ascii() || value.bytes().any(|b| b == 0) {
        return Err(format!("Tag {tag} value must be NUL-free ASCII").into());
    }

    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let (header, entries) = read_first_ifd(&mut file)?;
    let le = header.little_endian;
    let entry = get_entry(&entries, tag)
        .ok_or_else(|| format!("Tag {tag} not present in first IFD of {}", path.display()))?;
    if entry.field_type != FIELD_TYPE_ASCII {
        return Err(format!("Tag {tag} is not ASCII (type {})", entry.field_type).into());
    }

    let mut bytes = value.as_bytes().to_vec();
    bytes.push(0);
    let count = u32::try_from(bytes.len())?;

    let old_is_offset = entry.count > 4;
    let value_field = if bytes.len() <= 4 {
        let mut inline = [0u8; 4];
        inline[..bytes.len()].copy_from_slice(&bytes);
        inline
    } else if old_is_offset && bytes.len() <= entry.count as usize {
        file.seek(SeekFrom::Start(u64::from(entry.value_offset)))?;
        file.write_all(&bytes)?;
        write_u32(entry.value_offset, le)
    } else {
        let mut end = file.seek(SeekFrom::End(0))?;
        if end % 2 == 1 {
            file.write_all(&[0])?;
            end += 1;
        }
        let offset = u32::try_from(end).map_err(|_| "TIFF exceeds 4 GiB, cannot append")?;
        file.write_all(&bytes)?;
        write_u32(offset, le)
    };

    // count lives at +4, value/offset at +8 within the entry
    file.seek(SeekFrom::Start(entry.entry_position + 4))?;
    file.write_all(&write_u32(count, le))?;
    file.write_all(&value_field)?;
    file.flush()?;
    Ok(())
}

/// Raw state of an ASCII tag in the first IFD: the entry's count and value
/// field, the bytes it points at, and the file length when captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsciiTagSlot {
    pub tag: u16,
    pub count: u32,
    pub value_field: [u8; 4],
    pub value: Vec<u8>,
    pub file_len: u64,
}

pub fn capture_ascii_tag(path: &Path, tag: u16) -> AnyResult<AsciiTagSlot> {
    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let (_, entries) = read_first_ifd(&mut file)?;
    let entry = get_entry(&entries, tag)
        .ok_or_else(|| format!("Tag {tag} not present in first IFD of {}", path.display()))?;
    if entry.field_type != FIELD_TYPE_ASCII {
        return Err(format!("Tag {tag} is not ASCII (type {})", entry.field_type).into());
    }

    let value = if entry.count > 4 {
        let mut value = vec![0u8; entry.count as usize];
        file.seek(SeekFrom::Start(u64::from(entry.value_offset)))?;
        file.read_exact(&mut value)?;
        value
    } else {
        entry.raw_value_bytes[..entry.count as usize].to_vec()
    };

    Ok(AsciiTagSlot {
        tag,
        count: entry.count,
        value_field: entry.raw_value_bytes,
        value,
        file_len,
    })
}

/// Put a tag back exactly as [`capture_ascii_tag`] found it.
///
/// The captured bytes go back to their original offset, the entry gets its
/// original count and value field, and anything appended to the file since
/// the capture is truncated away.
pub fn restore_ascii_tag(path: &Path, slot: &AsciiTagSlot) -> AnyResult<()> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let (header, entries) = read_first_ifd(&mut file)?;
    let le = header.little_endian;
    let entry = get_entry(&entries, slot.tag).ok_or_else(|| {
        format!(
            "Tag {} not present in first IFD of {}",
            slot.tag,
            path.display()
        )
    })?;
    if entry.field_type != FIELD_TYPE_ASCII {
        return Err(format!("Tag {} is not ASCII (type {})", slot.tag, entry.field_type).into());
    }

    if slot.count > 4 {
        let offset = u64::from(read_u32(slot.value_field, le));
        if offset + slot.value.len() as u64 > slot.file_len {
            return Err(format!("Captured tag {} lies past the captured file end", slot.tag).into());
        }
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&slot.value)?;
    }
    file.seek(SeekFrom::Start(entry.entry_position + 4))?;
    file.write_all(&write_u32(slot.count, le))?;
    file.write_all(&slot.value_field)?;

    if file.metadata()?.len() > slot.file_len {
        file.set_len(slot.file_len)?;
    }
    file.flush()?;
    Ok(())
}
