//! Loaded module bounds and safe whole-image scanning

use std::ops::Range;

use region::Protection;

use super::Pattern;
use crate::error::ImageError;

/// Bounds of a loaded module image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleImage {
    /// First byte of the image
    base: usize,
    /// Image length in bytes
    size: usize,
}

impl ModuleImage {
    /// Image spanning `[base, base + size)`
    pub const fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    /// Image covering a buffer that is already in memory
    pub fn from_slice(data: &[u8]) -> Self {
        Self::new(data.as_ptr() as usize, data.len())
    }

    /// Image of the host executable
    pub fn host() -> Result<Self, ImageError> {
        let image = host_image()?;
        log::debug!(
            "Host image at {:#x} (+{:#x})",
            image.base,
            image.size
        );
        Ok(image)
    }

    /// First byte of the image
    pub fn base(&self) -> usize {
        self.base
    }

    /// Image length in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// One past the last byte of the image
    pub fn end(&self) -> usize {
        self.base + self.size
    }

    /// Whether `[address, address + len)` lies inside the image
    pub fn contains(&self, address: usize, len: usize) -> bool {
        address >= self.base
            && address
                .checked_add(len)
                .map_or(false, |end| end <= self.end())
    }

    /// Committed, readable, non-guard address ranges inside `window` (given as offsets from the
    /// image base), merged where they touch
    pub fn readable_ranges(&self, window: Range<usize>) -> Vec<Range<usize>> {
        let start = self.base + window.start.min(self.size);
        let end = self.base + window.end.min(self.size);
        if start >= end {
            return Vec::new();
        }

        let regions = match region::query_range(start as *const u8, end - start) {
            Ok(regions) => regions,
            Err(e) => {
                log::debug!("No mapped regions in {start:#x}..{end:#x}: {e}");
                return Vec::new();
            }
        };

        let mut ranges: Vec<Range<usize>> = Vec::new();
        for region in regions.flatten() {
            if !region.is_committed()
                || region.is_guarded()
                || !region.protection().contains(Protection::READ)
            {
                continue;
            }
            let range = region.as_range();
            let range = range.start.max(start)..range.end.min(end);
            if range.is_empty() {
                continue;
            }
            match ranges.last_mut() {
                Some(last) if last.end == range.start => last.end = range.end,
                _ => ranges.push(range),
            }
        }
        ranges
    }

    /// Address of the first match anywhere in the image
    pub fn scan(&self, pattern: &Pattern) -> Option<usize> {
        self.scan_within(pattern, 0..self.size)
    }

    /// Address of the first match inside `window` (offsets relative to the image base)
    pub fn scan_within(&self, pattern: &Pattern, window: Range<usize>) -> Option<usize> {
        self.readable_ranges(window)
            .into_iter()
            // SAFETY: every range was just reported as committed and readable
            .find_map(|range| unsafe { pattern.scan(range.start, range.end - range.start) })
    }
}

#[cfg(target_os = "linux")]
/// Collects the span of every mapping backed by the current executable
fn host_image() -> Result<ModuleImage, ImageError> {
    let exe = std::env::current_exe()?;
    let exe = exe.to_string_lossy();
    let maps = std::fs::read_to_string("/proc/self/maps")?;

    let mut span: Option<Range<usize>> = None;
    for line in maps.lines() {
        let Some(path) = line.find('/').map(|i| line[i..].trim_end()) else {
            continue;
        };
        if path.trim_end_matches(" (deleted)") != exe {
            continue;
        }
        let Some((start, end)) = line
            .split_whitespace()
            .next()
            .and_then(|range| range.split_once('-'))
        else {
            continue;
        };
        let (Ok(start), Ok(end)) = (
            usize::from_str_radix(start, 16),
            usize::from_str_radix(end, 16),
        ) else {
            continue;
        };
        span = Some(match span {
            Some(span) => span.start.min(start)..span.end.max(end),
            None => start..end,
        });
    }

    span.map(|span| ModuleImage::new(span.start, span.end - span.start))
        .ok_or(ImageError::NotMapped)
}

#[cfg(target_os = "windows")]
/// Queries the main module through the loader
fn host_image() -> Result<ModuleImage, ImageError> {
    use windows::core::PCWSTR;
    use windows::Win32::System::LibraryLoader::GetModuleHandleW;
    use windows::Win32::System::ProcessStatus::{GetModuleInformation, MODULEINFO};
    use windows::Win32::System::Threading::GetCurrentProcess;

    unsafe {
        let module = GetModuleHandleW(PCWSTR::null()).map_err(|_| ImageError::NotMapped)?;
        let mut info = MODULEINFO::default();
        GetModuleInformation(
            GetCurrentProcess(),
            module,
            &mut info,
            std::mem::size_of::<MODULEINFO>() as u32,
        )
        .map_err(|_| ImageError::NotMapped)?;
        Ok(ModuleImage::new(
            info.lpBaseOfDll as usize,
            info.SizeOfImage as usize,
        ))
    }
}

#[cfg(not(any(target_os = "linux", target_os = "windows")))]
fn host_image() -> Result<ModuleImage, ImageError> {
    Err(ImageError::Unsupported)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains() {
        let image = ModuleImage::new(0x1000, 0x100);
        assert!(image.contains(0x1000, 0x100));
        assert!(image.contains(0x10F0, 0x10));
        assert!(!image.contains(0x10F0, 0x11));
        assert!(!image.contains(0xFFF, 1));
        assert!(!image.contains(usize::MAX, 2));
    }

    #[test]
    fn test_scan_buffer_image() {
        let mut buffer = vec![0u8; 256];
        buffer[200..204].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        let image = ModuleImage::from_slice(&buffer);
        let pattern = Pattern::parse("DE AD ?? EF").unwrap();

        assert_eq!(image.scan(&pattern), Some(image.base() + 200));
        // window that ends before the match
        assert_eq!(image.scan_within(&pattern, 0..200), None);
        assert_eq!(
            image.scan_within(&pattern, 100..256),
            Some(image.base() + 200)
        );
    }

    #[test]
    fn test_readable_ranges_cover_buffer() {
        let buffer = vec![0u8; 64];
        let image = ModuleImage::from_slice(&buffer);
        let ranges = image.readable_ranges(0..64);
        assert_eq!(ranges, vec![image.base()..image.end()]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_host_image_contains_code() {
        let image = ModuleImage::host().unwrap();
        let here = test_host_image_contains_code as fn() as usize;
        assert!(image.contains(here, 1));
    }
}
