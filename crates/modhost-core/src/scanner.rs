//! Locating the verification record inside a library file.
//!
//! The file is memory mapped (or read, if mapping fails) and searched from
//! the end: release binaries keep read-only data near the end of the image,
//! debug binaries append symbol tables after it.

use std::ffi::CStr;
use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use modhost_sdk::abi::{QueryVerificationFn, QUERY_VERIFICATION_SYMBOL};
use modhost_sdk::VERIFICATION_PATTERN;
use tracing::debug;

use crate::error::{LoaderError, Result};
use crate::handle::LibraryHandle;
use crate::record::VerificationRecord;

/// Offset of the last occurrence of `needle` in `haystack`.
///
/// A rolling byte sum over the window is compared first; only windows with
/// the needle's sum get a full comparison.
pub fn find_pattern_backward(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    let n = needle.len();
    if n == 0 || haystack.len() < n {
        return None;
    }

    let target = byte_sum(needle);
    let mut start = haystack.len() - n;
    let mut sum = byte_sum(&haystack[start..]);
    loop {
        if sum == target && &haystack[start..start + n] == needle {
            return Some(start);
        }
        if start == 0 {
            return None;
        }
        start -= 1;
        sum = sum
            .wrapping_add(u32::from(haystack[start]))
            .wrapping_sub(u32::from(haystack[start + n]));
    }
}

fn byte_sum(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0u32, |acc, &b| acc.wrapping_add(u32::from(b)))
}

/// Find and parse the record in an in-memory image.
///
/// `Ok(None)` means the pattern is absent.
pub fn scan_bytes(data: &[u8]) -> std::result::Result<Option<VerificationRecord>, String> {
    match find_pattern_backward(data, VERIFICATION_PATTERN.as_bytes()) {
        Some(offset) => VerificationRecord::parse(&data[offset..])
            .map(Some)
            .map_err(|e| e.to_string()),
        None => Ok(None),
    }
}

/// Scan the file at `path` without loading it.
pub fn scan_file(path: &Path) -> Result<VerificationRecord> {
    let file = File::open(path).map_err(|e| LoaderError::NotFound {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    // Safety: the map is read-only and dropped before returning. A file
    // truncated underneath us is the same hazard the OS loader faces.
    let outcome = match unsafe { Mmap::map(&file) } {
        Ok(map) => scan_bytes(&map),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Memory map failed, reading file");
            let data = std::fs::read(path).map_err(|e| LoaderError::NotFound {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
            scan_bytes(&data)
        }
    };

    match outcome {
        Ok(Some(record)) => {
            debug!(path = %path.display(), %record, "Found verification record");
            Ok(record)
        }
        Ok(None) => Err(LoaderError::VerificationMismatch {
            path: path.to_path_buf(),
            reason: "no verification record".to_string(),
        }),
        Err(reason) => Err(LoaderError::VerificationMismatch {
            path: path.to_path_buf(),
            reason,
        }),
    }
}

/// Ask a mapped library for its record through the query symbol.
pub fn query_symbol(handle: &LibraryHandle) -> Result<VerificationRecord> {
    let path = handle.path().to_path_buf();
    let address = handle
        .resolve(QUERY_VERIFICATION_SYMBOL)
        .ok_or_else(|| LoaderError::VerificationMismatch {
            path: path.clone(),
            reason: handle
                .error_string()
                .unwrap_or_else(|| "library is not mapped".to_string()),
        })?;

    // Safety: the symbol has the exported query signature, returns a static
    // NUL-terminated string and has no side effects.
    let text = unsafe {
        let query: QueryVerificationFn = address.to_fn();
        let ptr = query();
        if ptr.is_null() {
            None
        } else {
            Some(CStr::from_ptr(ptr).to_bytes())
        }
    };

    let Some(text) = text else {
        return Err(LoaderError::VerificationMismatch {
            path,
            reason: "query symbol returned no record".to_string(),
        });
    };
    VerificationRecord::parse(text).map_err(|e| LoaderError::VerificationMismatch {
        path,
        reason: e.to_string(),
    })
}
