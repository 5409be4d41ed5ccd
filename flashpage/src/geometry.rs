//! Page layout of program memory

use core::ops::Range;

/// Sector table of a 1 MiB STM32F4 bank: four 16K sectors, one 64K sector and seven 128K sectors
pub const STM32F4_1M_SECTORS: &[u32] = &[
    16 * 1024,
    16 * 1024,
    16 * 1024,
    16 * 1024,
    64 * 1024,
    128 * 1024,
    128 * 1024,
    128 * 1024,
    128 * 1024,
    128 * 1024,
    128 * 1024,
    128 * 1024,
];

/// How the pages of program memory are sized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Every page has the same size
    Uniform {
        /// Size of each page in bytes
        page_size: u32,
        /// Number of pages
        page_count: u32,
    },
    /// Pages (sectors) of different sizes, listed from the start of program memory
    Sectored {
        /// Size of each sector in bytes
        sectors: &'static [u32],
    },
}

/// The page layout of a device's program memory.
///
/// This is fixed when the firmware is built and never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    base: u32,
    layout: Layout,
}

impl Geometry {
    /// Program memory of `page_count` pages of `page_size` bytes each, starting at `base`
    pub const fn uniform(base: u32, page_size: u32, page_count: u32) -> Self {
        Self {
            base,
            layout: Layout::Uniform {
                page_size,
                page_count,
            },
        }
    }

    /// Program memory made of the given sectors, starting at `base`
    pub const fn sectored(base: u32, sectors: &'static [u32]) -> Self {
        Self {
            base,
            layout: Layout::Sectored { sectors },
        }
    }

    /// The first address of program memory
    pub fn base(&self) -> u32 {
        self.base
    }

    /// The layout of the pages
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Returns `true` if all pages have the same size
    pub fn is_uniform(&self) -> bool {
        matches!(self.layout, Layout::Uniform { .. })
    }

    /// The total amount of pages
    pub fn page_count(&self) -> u32 {
        match self.layout {
            Layout::Uniform { page_count, .. } => page_count,
            Layout::Sectored { sectors } => sectors.len() as u32,
        }
    }

    /// The size of program memory in bytes
    pub fn total_size(&self) -> u64 {
        match self.layout {
            Layout::Uniform {
                page_size,
                page_count,
            } => page_size as u64 * page_count as u64,
            Layout::Sectored { sectors } => sectors.iter().map(|size| *size as u64).sum(),
        }
    }

    /// One past the last address of program memory. May be `1 << 32` for memory that ends at
    /// the top of the address space.
    pub fn end(&self) -> u64 {
        self.base as u64 + self.total_size()
    }

    /// The size of the given page, or `None` if the page doesn't exist
    pub fn page_size(&self, page: u32) -> Option<u32> {
        match self.layout {
            Layout::Uniform {
                page_size,
                page_count,
            } => (page < page_count).then_some(page_size),
            Layout::Sectored { sectors } => sectors.get(page as usize).copied(),
        }
    }

    /// The start address of the given page, or `None` if the page doesn't exist
    pub fn page_address(&self, page: u32) -> Option<u32> {
        match self.layout {
            Layout::Uniform {
                page_size,
                page_count,
            } => (page < page_count).then(|| self.base + page * page_size),
            Layout::Sectored { .. } => {
                if page >= self.page_count() {
                    return None;
                }
                if page == 0 {
                    return Some(self.base);
                }
                // Every sector starts where the previous one ends
                Some(self.page_address(page - 1)? + self.page_size(page - 1)?)
            }
        }
    }

    /// The index of the page that contains the address, or `None` if the address is not in program memory
    pub fn page_containing(&self, address: u32) -> Option<u32> {
        if address < self.base || address as u64 >= self.end() {
            return None;
        }
        let offset = address - self.base;

        match self.layout {
            Layout::Uniform { page_size, .. } => Some(offset / page_size),
            Layout::Sectored { sectors } => {
                let mut end = 0u64;
                for (page, size) in sectors.iter().enumerate() {
                    end += *size as u64;
                    if (offset as u64) < end {
                        return Some(page as u32);
                    }
                }
                None
            }
        }
    }

    /// The address range covered by the given page. Like [Geometry::end], the end may be `1 << 32`.
    pub fn page_range(&self, page: u32) -> Option<Range<u64>> {
        let start = self.page_address(page)? as u64;
        Some(start..start + self.page_size(page)? as u64)
    }

    /// Returns `true` if the range lies completely within program memory
    pub fn contains(&self, address: u32, len: usize) -> bool {
        let end = address as u64 + len as u64;
        address >= self.base && end <= self.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const UNIFORM: Geometry = Geometry::uniform(0x0800_0000, 2048, 128);
    const SECTORED: Geometry = Geometry::sectored(0x0800_0000, STM32F4_1M_SECTORS);

    #[test]
    fn uniform_pages() {
        assert_eq!(UNIFORM.page_count(), 128);
        assert_eq!(UNIFORM.total_size(), 256 * 1024);
        assert_eq!(UNIFORM.page_address(3), Some(0x0800_1800));
        assert_eq!(UNIFORM.page_size(127), Some(2048));
        assert_eq!(UNIFORM.page_address(128), None);
        assert_eq!(UNIFORM.page_containing(0x0800_17FF), Some(2));
        assert_eq!(UNIFORM.page_containing(0x0804_0000), None);
        assert_eq!(UNIFORM.page_containing(0x07FF_FFFF), None);
    }

    #[test]
    fn sectored_pages() {
        assert_eq!(SECTORED.page_count(), 12);
        assert_eq!(SECTORED.total_size(), 1024 * 1024);
        assert_eq!(SECTORED.page_address(4), Some(0x0801_0000));
        assert_eq!(SECTORED.page_size(4), Some(64 * 1024));
        assert_eq!(SECTORED.page_address(5), Some(0x0802_0000));
        assert_eq!(SECTORED.page_address(11), Some(0x080E_0000));
        assert_eq!(SECTORED.page_containing(0x0801_FFFF), Some(4));
        assert_eq!(SECTORED.page_containing(0x0804_0000), Some(6));
        assert_eq!(SECTORED.page_address(12), None);
    }

    #[test]
    fn page_containing_inverts_page_address() {
        for geometry in [UNIFORM, SECTORED, Geometry::uniform(0, 4096, 256)] {
            for page in 0..geometry.page_count() {
                let address = geometry.page_address(page).unwrap();
                assert_eq!(geometry.page_containing(address), Some(page));
                let last = address + geometry.page_size(page).unwrap() - 1;
                assert_eq!(geometry.page_containing(last), Some(page));
            }
        }
    }

    #[test]
    fn memory_may_end_at_the_top_of_the_address_space() {
        let top = Geometry::uniform(0xFFFF_0000, 0x4000, 4);
        assert_eq!(top.total_size(), 0x1_0000);
        assert_eq!(top.end(), 1 << 32);
        assert_eq!(top.page_address(3), Some(0xFFFF_C000));
        assert_eq!(top.page_containing(0xFFFF_FFFF), Some(3));
        assert_eq!(top.page_range(3), Some(0xFFFF_C000..1 << 32));
        assert!(top.contains(0xFFFF_FFF8, 8));
        assert!(!top.contains(0xFFFF_FFF8, 16));

        const SECTORS: &[u32] = &[0x8000_0000, 0x8000_0000];
        let sectored = Geometry::sectored(0, SECTORS);
        assert_eq!(sectored.end(), 1 << 32);
        assert_eq!(sectored.page_containing(0xFFFF_FFFF), Some(1));
        assert_eq!(sectored.page_address(1), Some(0x8000_0000));
    }

    #[test]
    fn contains_checks_the_end() {
        assert!(UNIFORM.contains(0x0803_FFF8, 8));
        assert!(!UNIFORM.contains(0x0803_FFF8, 16));
        assert!(!UNIFORM.contains(0x07FF_FFF8, 8));
    }
}
