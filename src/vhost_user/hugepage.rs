// Copyright (C) 2019 Alibaba Cloud Computing. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Discover the hugepage files backing the front-end's memory.
//!
//! The slave maps the same hugepage files as the front-end so that it can reach the vrings and
//! packet buffers. The memory table only needs the virtual address and length of every file,
//! which the kernel exposes in the process's memory mapping table. Hugepage files are recognized
//! by their name, `<prefix>map_<index>`.

use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use log::{error, info, warn};

use super::{Error, Result};

const PROC_SELF_MAPS: &str = "/proc/self/maps";

/// One hugepage file mapped into the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HugepageFile {
    /// Virtual address of the first mapping of the file.
    pub addr: u64,
    /// Size of the file.
    pub size: u64,
    /// Path to the backing file.
    pub path: PathBuf,
}

/// Source of the hugepage files to describe in a memory table.
pub trait HugepageSource {
    /// Return every distinct hugepage file mapped into the process, at most `max` of them.
    fn hugepage_files(&self, max: usize) -> Result<Vec<HugepageFile>>;
}

/// Reads the calling process's `/proc/self/maps`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcSelfMaps;

impl HugepageSource for ProcSelfMaps {
    fn hugepage_files(&self, max: usize) -> Result<Vec<HugepageFile>> {
        let file = File::open(PROC_SELF_MAPS).map_err(|e| {
            error!("cannot open {}", PROC_SELF_MAPS);
            Error::HugepageMapsOpen(e)
        })?;
        scan_hugepage_files(BufReader::new(file), max)
    }
}

/// Collect the hugepage files listed in a memory mapping table and size them from the
/// filesystem.
///
/// A file split over several mappings is reported once, at the address of its first mapping.
/// Its size comes from the file itself, since no single mapping needs to cover all of it.
///
/// # Return:
/// * - the hugepage files on success.
/// * - HugepageMapsRead: the table could not be read.
/// * - HugepageMapsParse: a line does not start with an address range.
/// * - TooManyHugepageFiles: more than `max` distinct files.
pub fn scan_hugepage_files<R: BufRead>(maps: R, max: usize) -> Result<Vec<HugepageFile>> {
    let mut huges = parse_maps(maps, max)?;
    for huge in huges.iter_mut() {
        match fs::metadata(&huge.path) {
            Ok(stats) => {
                huge.size = stats.len();
                info!("file {}, size {:x}", huge.path.display(), huge.size);
            }
            // Keep the mapping extent; opening the file for the slave will tell.
            Err(e) => warn!("Failed to stat {}, {}", huge.path.display(), e),
        }
    }
    Ok(huges)
}

/// Parse a memory mapping table without touching the filesystem.
///
/// Lines are handled as raw bytes since mapped file names need not be UTF-8.
/// `size` of every record is the extent of the recorded mapping.
fn parse_maps<R: BufRead>(mut maps: R, max: usize) -> Result<Vec<HugepageFile>> {
    let mut huges: Vec<HugepageFile> = Vec::new();
    let mut line = Vec::new();

    loop {
        line.clear();
        if maps
            .read_until(b'\n', &mut line)
            .map_err(Error::HugepageMapsRead)?
            == 0
        {
            break;
        }
        let (start, end) = parse_range(&line).ok_or_else(|| {
            error!("Failed to parse address");
            Error::HugepageMapsParse(String::from_utf8_lossy(trim_end(&line)).into_owned())
        })?;

        let path = match pathname(&line) {
            Some(path) if is_hugepage_file(path) => path,
            _ => continue,
        };

        // Skip files mapped to several regions.
        if huges.iter().any(|h| h.path.as_os_str().as_bytes() == path) {
            continue;
        }

        if huges.len() >= max {
            error!("Exceed maximum of {}", max);
            return Err(Error::TooManyHugepageFiles(max));
        }

        huges.push(HugepageFile {
            addr: start,
            size: end.wrapping_sub(start),
            path: PathBuf::from(OsStr::from_bytes(path)),
        });
    }

    Ok(huges)
}

fn trim_start(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    &bytes[start..]
}

fn trim_end(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |pos| pos + 1);
    &bytes[..end]
}

fn parse_hex(digits: &[u8]) -> Option<u64> {
    let digits = std::str::from_utf8(digits).ok()?;
    u64::from_str_radix(digits, 16).ok()
}

fn parse_range(line: &[u8]) -> Option<(u64, u64)> {
    let range = line
        .split(|b| b.is_ascii_whitespace())
        .find(|field| !field.is_empty())?;
    let dash = range.iter().position(|&b| b == b'-')?;
    let start = parse_hex(&range[..dash])?;
    let end = parse_hex(&range[dash + 1..])?;
    Some((start, end))
}

/// Everything after the address, perms, offset, dev and inode columns.
fn pathname(line: &[u8]) -> Option<&[u8]> {
    let mut rest = line;
    for _ in 0..5 {
        rest = trim_start(rest);
        let end = rest.iter().position(|b| b.is_ascii_whitespace())?;
        rest = &rest[end..];
    }
    let path = trim_end(trim_start(rest));
    if path.is_empty() {
        None
    } else {
        Some(path)
    }
}

/// Whether the last path component looks like `<prefix>map_<decimal digits>`.
fn is_hugepage_file(path: &[u8]) -> bool {
    let name = match Path::new(OsStr::from_bytes(path)).file_name() {
        Some(name) => name.as_bytes(),
        None => return false,
    };
    match name.windows(4).rposition(|w| w == b"map_") {
        Some(pos) => {
            let index = &name[pos + 4..];
            !index.is_empty() && index.iter().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}
