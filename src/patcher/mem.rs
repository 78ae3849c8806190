//! This module contains the protected-memory primitives: access checks, checked reads and writes that
//! temporarily lift write protection

use std::{ptr, slice};

use region::Protection;

use crate::error::MemoryError;

/// Maps a query failure onto the error taxonomy
fn query_error(address: usize, len: usize, error: region::Error) -> MemoryError {
    match error {
        region::Error::UnmappedRegion => MemoryError::Uncommitted { address, len },
        e => MemoryError::Region(e),
    }
}

/// Ensures `[address, address + len)` is entirely committed, readable and not a guard page
pub fn check_access(address: usize, len: usize) -> Result<(), MemoryError> {
    if len == 0 {
        return Ok(());
    }
    let end = address
        .checked_add(len)
        .ok_or(MemoryError::Uncommitted { address, len })?;

    let regions = region::query_range(address as *const u8, len)
        .map_err(|e| query_error(address, len, e))?;

    let mut cursor = address;
    for region in regions {
        let region = region.map_err(|e| query_error(address, len, e))?;
        let range = region.as_range();
        if range.start > cursor || !region.is_committed() {
            return Err(MemoryError::Uncommitted {
                address: cursor,
                len: end - cursor,
            });
        }
        if region.is_guarded() || !region.protection().contains(Protection::READ) {
            return Err(MemoryError::Protection {
                address: range.start,
                protection: region.protection(),
            });
        }
        cursor = cursor.max(range.end);
        if cursor >= end {
            return Ok(());
        }
    }

    Err(MemoryError::Uncommitted {
        address: cursor,
        len: end - cursor,
    })
}

/// Copies `len` bytes from `address` after checking they are readable
pub fn read_bytes(address: usize, len: usize) -> Result<Vec<u8>, MemoryError> {
    check_access(address, len)?;
    // SAFETY: the whole range was just reported as committed and readable
    Ok(unsafe { slice::from_raw_parts(address as *const u8, len) }.to_vec())
}

/// How far [`write_protected`] got before failing
#[derive(Debug)]
pub(crate) struct PartialWrite {
    /// Leading bytes already copied
    copied: usize,
    /// Failure that stopped the copy
    error: region::Error,
}

/// Copies `bytes` to `address`, making each region writable only for the duration of its copy.
///
/// Does not allocate on the write path; hook batches call it while other threads are suspended.
///
/// # Safety
///
/// The range must be committed (see [`check_access`]) and overwriting it must be sound for the program
pub(crate) unsafe fn write_protected(address: usize, bytes: &[u8]) -> Result<(), PartialWrite> {
    let len = bytes.len();
    if len == 0 {
        return Ok(());
    }

    let mut copied = 0;
    let regions = region::query_range(address as *const u8, len)
        .map_err(|error| PartialWrite { copied, error })?;
    for region in regions {
        let region = region.map_err(|error| PartialWrite { copied, error })?;
        let range = region.as_range();
        let start = range.start.max(address);
        let end = range.end.min(address + len);
        if start >= end {
            continue;
        }

        let old = region.protection();
        let unprotect = !old.contains(Protection::WRITE);
        if unprotect {
            region::protect(start as *const u8, end - start, old | Protection::WRITE)
                .map_err(|error| PartialWrite { copied, error })?;
        }
        ptr::copy_nonoverlapping(
            bytes.as_ptr().add(start - address),
            start as *mut u8,
            end - start,
        );
        copied = end - address;
        if unprotect {
            region::protect(start as *const u8, end - start, old)
                .map_err(|error| PartialWrite { copied, error })?;
        }
    }
    Ok(())
}

/// Writes `new` over `expected` without allocating or logging: checks access, asserts the old
/// bytes, writes, then verifies the read-back.
///
/// Any failure after the first byte is copied puts `expected` back. If that is impossible the
/// error is [`MemoryError::Torn`]. A mismatch is reported as [`MemoryError::Mismatch`], without
/// copying the bytes.
///
/// # Safety
///
/// Overwriting the range must be sound for the program
pub(crate) unsafe fn write_exact(
    address: usize,
    expected: &[u8],
    new: &[u8],
) -> Result<(), MemoryError> {
    write_exact_with(address, expected, new, |at, bytes| write_protected(at, bytes))
}

/// [`write_exact`] over an arbitrary copy routine
///
/// # Safety
///
/// Overwriting the range must be sound for the program, and `write` must behave like
/// [`write_protected`]
unsafe fn write_exact_with<W>(
    address: usize,
    expected: &[u8],
    new: &[u8],
    write: W,
) -> Result<(), MemoryError>
where
    W: Fn(usize, &[u8]) -> Result<(), PartialWrite>,
{
    debug_assert_eq!(expected.len(), new.len());
    let len = new.len();
    check_access(address, len)?;

    if slice::from_raw_parts(address as *const u8, len) != expected {
        return Err(MemoryError::Mismatch { address, len });
    }

    if let Err(partial) = write(address, new) {
        if partial.copied > 0 && write(address, &expected[..partial.copied]).is_err() {
            return Err(MemoryError::Torn { address });
        }
        return Err(MemoryError::Region(partial.error));
    }

    if slice::from_raw_parts(address as *const u8, len) != new {
        if write(address, expected).is_err() {
            return Err(MemoryError::Torn { address });
        }
        return Err(MemoryError::Verification { address });
    }
    Ok(())
}

/// [`write_exact`] with a detailed mismatch report
///
/// # Safety
///
/// Overwriting the range must be sound for the program
pub(crate) unsafe fn write_checked(
    address: usize,
    expected: &[u8],
    new: &[u8],
) -> Result<(), MemoryError> {
    write_exact(address, expected, new).map_err(|e| match e {
        MemoryError::Mismatch { address, len } => MemoryError::UnexpectedBytes {
            address,
            expected: expected.to_vec(),
            found: slice::from_raw_parts(address as *const u8, len).to_vec(),
        },
        MemoryError::Torn { address } => {
            log::error!("Write at {address:#x} failed part-way and could not be undone");
            e
        }
        e => e,
    })
}

#[cfg(test)]
mod tests {
    use std::hint::black_box;

    use super::*;

    /// Lives in a read-only section of the binary
    static READ_ONLY: [u8; 4] = [1, 2, 3, 4];

    #[test]
    fn test_read_bytes() {
        let data = vec![9u8, 8, 7, 6];
        let address = data.as_ptr() as usize;
        assert_eq!(read_bytes(address + 1, 2).unwrap(), vec![8, 7]);
        assert_eq!(read_bytes(address, 0).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_null_page_is_rejected() {
        assert!(read_bytes(0, 4).is_err());
        assert!(unsafe { write_checked(0, &[0], &[1]) }.is_err());
    }

    #[test]
    fn test_unexpected_bytes() {
        let mut data = vec![1u8, 2, 3, 4];
        let address = data.as_mut_ptr() as usize;
        let result = unsafe { write_checked(address, &[1, 2, 9, 9], &[0, 0, 0, 0]) };
        assert!(matches!(result, Err(MemoryError::UnexpectedBytes { .. })));
        assert_eq!(data, [1, 2, 3, 4]);
    }

    #[test]
    /// The allocation-free form reports a mismatch by address only and writes nothing
    fn test_exact_mismatch() {
        let mut data = vec![1u8, 2, 3, 4];
        let address = data.as_mut_ptr() as usize;
        let result = unsafe { write_exact(address, &[9, 9], &[0, 0]) };
        assert!(matches!(
            result,
            Err(MemoryError::Mismatch { len: 2, .. })
        ));
        assert_eq!(data, [1, 2, 3, 4]);
    }

    #[test]
    /// A write spanning into an unmapped page is refused before any byte is copied
    fn test_write_into_unmapped_tail() {
        let page = region::page::size();
        let mut map = region::alloc(2 * page, Protection::READ_WRITE).unwrap();
        let base = map.as_mut_ptr::<u8>() as usize;
        unsafe { region::protect((base + page) as *const u8, page, Protection::NONE).unwrap() };

        let address = base + page - 2;
        let result = unsafe { write_checked(address, &[0; 4], &[7; 4]) };
        assert!(result.is_err());
        assert_eq!(unsafe { slice::from_raw_parts(address as *const u8, 2) }, [0, 0]);
    }

    #[test]
    /// A copy cut short after the first region puts the copied prefix back
    fn test_partial_write_is_undone() {
        let mut data = vec![1u8, 2, 3, 4];
        let address = data.as_mut_ptr() as usize;

        let first_call = std::cell::Cell::new(true);
        let result = unsafe {
            write_exact_with(address, &[1, 2, 3, 4], &[9, 9, 9, 9], |at, bytes| {
                if first_call.replace(false) {
                    // copy half, then fail as a second region's protect would
                    write_protected(at, &bytes[..2]).unwrap();
                    return Err(PartialWrite {
                        copied: 2,
                        error: region::Error::UnmappedRegion,
                    });
                }
                write_protected(at, bytes)
            })
        };
        assert!(matches!(result, Err(MemoryError::Region(_))));
        assert_eq!(data, [1, 2, 3, 4]);
    }

    #[test]
    /// Tests to ensure permissions are lifted for the write and put back afterwards
    fn test_write_read_only() {
        let ptr = black_box(READ_ONLY.as_ptr());
        let address = ptr as usize;

        for region in region::query_range(ptr, 4).unwrap() {
            let region = region.unwrap();
            assert!(!region.protection().contains(Protection::WRITE));
        }

        unsafe { write_checked(address, &[1, 2, 3, 4], &[4, 3, 2, 1]).unwrap() };
        assert_eq!(unsafe { slice::from_raw_parts(ptr, 4) }, [4, 3, 2, 1]);

        // permissions reverted after the write
        for region in region::query_range(ptr, 4).unwrap() {
            let region = region.unwrap();
            assert!(!region.protection().contains(Protection::WRITE));
        }

        unsafe { write_checked(address, &[4, 3, 2, 1], &[1, 2, 3, 4]).unwrap() };
        assert_eq!(unsafe { slice::from_raw_parts(ptr, 4) }, [1, 2, 3, 4]);
    }
}
