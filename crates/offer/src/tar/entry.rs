//! Tar entry framing.
//!
//! Entries are written with plain ustar headers and short, generated entry
//! names, so an entry always occupies `[offset, offset + 512 + size + pad)`
//! and its payload starts exactly one header block past the recorded offset.
//! This is what makes positional reads out of a sealed (or still building)
//! tar possible without scanning the archive.

use std::io::{self, Read, Write};

/// Tar block and header size.
pub const BLOCK_LEN: u64 = 512;

/// Append one entry: header, payload, zero padding to the block boundary.
pub fn append_entry<W, R>(writer: &mut W, entry_name: &str, reader: &mut R, size: u64) -> io::Result<()>
where
    W: Write,
    R: Read,
{
    let mut header = tar::Header::new_ustar();
    header.set_path(entry_name)?;
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();
    writer.write_all(header.as_bytes())?;

    let copied = io::copy(&mut reader.take(size), writer)?;
    if copied != size {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("tar entry {entry_name}: expected {size} bytes, copied {copied}"),
        ));
    }

    let padding = (BLOCK_LEN - (size % BLOCK_LEN)) % BLOCK_LEN;
    if padding > 0 {
        writer.write_all(&vec![0u8; padding as usize])?;
    }
    Ok(())
}

/// Write the end-of-archive trailer (two zero blocks).
pub fn write_trailer<W: Write>(writer: &mut W) -> io::Result<()> {
    writer.write_all(&[0u8; 2 * BLOCK_LEN as usize])
}

/// Total on-disk footprint of an entry of the given payload size.
pub fn entry_footprint(size: u64) -> u64 {
    BLOCK_LEN + size.div_ceil(BLOCK_LEN) * BLOCK_LEN
}

/// Parse a raw header block into (entry name, payload size).
pub fn parse_header(block: &[u8; BLOCK_LEN as usize]) -> io::Result<(String, u64)> {
    let mut header = tar::Header::new_ustar();
    header.as_mut_bytes().copy_from_slice(block);

    let name = header
        .path()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
        .to_string_lossy()
        .into_owned();
    let size = header
        .entry_size()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok((name, size))
}

/// Verify a header block against the referential's entry description.
pub fn check_header(
    block: &[u8; BLOCK_LEN as usize],
    expected_name: &str,
    expected_size: u64,
) -> io::Result<()> {
    let (name, size) = parse_header(block)?;
    if name != expected_name {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("tar entry name mismatch: expected {expected_name}, found {name}"),
        ));
    }
    if size != expected_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("tar entry {expected_name} size mismatch: expected {expected_size}, found {size}"),
        ));
    }
    Ok(())
}
