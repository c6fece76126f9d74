//! EPT paging-structure entry bits.

use bitflags::bitflags;

/// Number of entries in every EPT paging structure.
pub const ENTRIES: usize = 512;

/// Bits 51:12 of an entry hold the physical address of the next level or page.
pub const ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

bitflags! {
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 29.3.2 EPT Translation Mechanism
    /// and Table 29-6. Format of an EPT Page-Table Entry that Maps a 4-KByte Page
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EptFlags: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        /// EPT memory type for leaf entries, write-back.
        const MEMORY_TYPE_WB = 6 << 3;
        const IGNORE_PAT = 1 << 6;
        const ACCESSED = 1 << 8;
        const DIRTY = 1 << 9;

        const READ_WRITE_EXECUTE = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

impl EptFlags {
    /// Flags for a leaf mapping ordinary guest RAM.
    pub const fn guest_ram() -> Self {
        Self::READ_WRITE_EXECUTE.union(Self::MEMORY_TYPE_WB)
    }

    /// An entry is present if any of read, write or execute is allowed.
    pub fn is_present(entry: u64) -> bool {
        entry & Self::READ_WRITE_EXECUTE.bits() != 0
    }
}

/// Builds the EPT pointer for a 4-level table rooted at `pml4`.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 25-9. Format of Extended-Page-Table Pointer
pub fn eptp_with_wb_and_4lvl_walk(pml4: u64) -> u64 {
    // "number of levels minus one" in bits 5:3.
    const EPT_PAGE_WALK_LENGTH_4: u64 = 3 << 3;
    const EPT_MEMORY_TYPE_WB: u64 = 6;

    (pml4 & ADDRESS_MASK) | EPT_PAGE_WALK_LENGTH_4 | EPT_MEMORY_TYPE_WB
}
