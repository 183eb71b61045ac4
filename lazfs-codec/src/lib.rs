//! Codec facade for LazFS
//!
//! Two pure fd-to-fd transformations: [`decompress`] turns a `.laz` archive
//! into its uncompressed `.las` form and [`compress`] goes the other way.
//! Both read their source from offset 0 with positioned I/O, never touch any
//! global state, and are safe to run concurrently on distinct file pairs,
//! which is exactly what the worker pool does with them.
//!
//! The record body of a compressed file is an LZ4 frame with the
//! uncompressed size prepended, so the logical size of an archive can be
//! recovered from a four-byte peek without inflating anything.

pub mod header;

use std::fs::File;
use std::os::unix::fs::FileExt;

use lazfs_core::error::Errno;
use lz4_flex::block::DecompressError;
use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use thiserror::Error;

pub use header::{Header, HEADER_LEN, MAGIC};

/// Codec failure.
///
/// The errno mapping is part of the behavioural contract with the upcall
/// dispatcher: anything that goes wrong while constructing or interpreting
/// the container surfaces as `ENOMEM`, failures while writing point records
/// surface as `ENOSPC`.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("not a point-cloud file (bad magic)")]
    BadMagic,

    #[error("file truncated inside the {0}")]
    Truncated(&'static str),

    #[error("record body does not match the header")]
    BodyMismatch,

    #[error("corrupt compressed frame: {0}")]
    Frame(#[from] DecompressError),

    #[error("failed to read source: {0}")]
    Read(std::io::Error),

    #[error("failed to write records: {0}")]
    Write(std::io::Error),
}

impl CodecError {
    /// Flatten to the errno the upcall boundary reports.
    pub fn errno(&self) -> Errno {
        match self {
            CodecError::Write(_) => Errno::ENOSPC,
            _ => Errno::ENOMEM,
        }
    }
}

fn read_header(src: &File) -> Result<Header, CodecError> {
    let mut raw = [0u8; HEADER_LEN];
    src.read_exact_at(&mut raw, 0)
        .map_err(|_| CodecError::Truncated("header"))?;
    Header::parse(&raw)
}

fn read_body(src: &File) -> Result<Vec<u8>, CodecError> {
    let total = src.metadata().map_err(CodecError::Read)?.len();
    let body_len = total.saturating_sub(HEADER_LEN as u64) as usize;
    let mut body = vec![0u8; body_len];
    src.read_exact_at(&mut body, HEADER_LEN as u64)
        .map_err(CodecError::Read)?;
    Ok(body)
}

fn write_file(dst: &File, header: &Header, body: &[u8]) -> Result<(), CodecError> {
    dst.write_all_at(&header.encode(), 0)
        .map_err(CodecError::Write)?;
    dst.write_all_at(body, HEADER_LEN as u64)
        .map_err(CodecError::Write)?;
    dst.set_len((HEADER_LEN + body.len()) as u64)
        .map_err(CodecError::Write)?;
    Ok(())
}

/// Inflate `src` into `dst`, clearing the compressed flag on the copied
/// header. A source whose flag is already clear is copied through untouched,
/// records and all.
pub fn decompress(src: &File, dst: &File) -> Result<(), CodecError> {
    let mut header = read_header(src)?;
    let body = read_body(src)?;

    let records = if header.compressed() {
        decompress_size_prepended(&body)?
    } else {
        body
    };
    if records.len() as u64 != header.body_len() {
        return Err(CodecError::BodyMismatch);
    }

    header.set_compressed(false);
    write_file(dst, &header, &records)
}

/// Deflate `src` into `dst`, setting the compressed flag on the copied
/// header.
pub fn compress(src: &File, dst: &File) -> Result<(), CodecError> {
    let mut header = read_header(src)?;
    let body = read_body(src)?;

    let records = if header.compressed() {
        body
    } else {
        if body.len() as u64 != header.body_len() {
            return Err(CodecError::BodyMismatch);
        }
        compress_prepend_size(&body)
    };

    header.set_compressed(true);
    write_file(dst, &header, &records)
}

/// Logical (uncompressed) size of the file behind `src`, without inflating
/// it. For an uncompressed file this is simply its length; for a compressed
/// one the frame's size prefix is added to the header length.
pub fn expanded_size(src: &File) -> Result<u64, CodecError> {
    let header = read_header(src)?;
    if !header.compressed() {
        return src.metadata().map(|m| m.len()).map_err(CodecError::Read);
    }
    let mut prefix = [0u8; 4];
    src.read_exact_at(&mut prefix, HEADER_LEN as u64)
        .map_err(|_| CodecError::Truncated("frame size prefix"))?;
    Ok(HEADER_LEN as u64 + u64::from(u32::from_le_bytes(prefix)))
}
