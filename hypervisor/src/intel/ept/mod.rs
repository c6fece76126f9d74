//! Extended Page Tables.
//!
//! The 4-level EPT hierarchy is kept in an arena of nodes addressed by index.
//! Each node owns one host page holding the hardware entries the processor
//! walks, plus the arena indices of its children, so lookups and teardown never
//! have to turn a physical address back into a virtual one.
//!
//! Guest physical address bits 47:39 index the PML4, 38:30 the PDPT, 29:21 the
//! PD and 20:12 the PT; bits 11:0 are the offset inside the 4 KiB page.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 29.3 THE EXTENDED PAGE TABLE MECHANISM (EPT)

pub mod access;

use {
    crate::{
        error::HypervisorError,
        hal::HostServices,
        intel::ept::access::{eptp_with_wb_and_4lvl_walk, EptFlags, ADDRESS_MASK, ENTRIES},
        utils::alloc::HostPages,
    },
    alloc::{sync::Arc, vec, vec::Vec},
};

/// Paging levels, from the root down to the table holding 4 KiB leaves.
const LEVELS: usize = 4;

/// Shift of the 9-bit table index for each level.
const LEVEL_SHIFT: [u32; LEVELS] = [39, 30, 21, 12];

/// First guest physical address a 4-level walk cannot reach.
pub const GUEST_PHYSICAL_LIMIT: u64 = 1 << 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NodeIndex(u32);

struct Node<H: HostServices> {
    table: HostPages<H>,
    /// Arena indices of the next-level tables; empty for page tables.
    children: Vec<Option<NodeIndex>>,
}

/// The nested page table of one virtual machine.
pub struct NestedPageTable<H: HostServices> {
    host: Arc<H>,
    nodes: Vec<Node<H>>,
}

/// Index into the table at `level` selected by `guest_pa`.
fn table_index(guest_pa: u64, level: usize) -> usize {
    ((guest_pa >> LEVEL_SHIFT[level]) & 0x1FF) as usize
}

impl<H: HostServices> NestedPageTable<H> {
    /// Allocates an empty PML4.
    pub fn new(host: &Arc<H>) -> Result<Self, HypervisorError> {
        let mut ept = Self { host: Arc::clone(host), nodes: Vec::new() };
        ept.allocate_node(0)?;
        Ok(ept)
    }

    /// Physical address of the PML4.
    pub fn root_physical(&self) -> u64 {
        self.nodes[0].table.phys()
    }

    /// The value to load into the EPTP VMCS field.
    pub fn eptp(&self) -> u64 {
        eptp_with_wb_and_4lvl_walk(self.root_physical())
    }

    /// Number of paging-structure pages currently owned.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn allocate_node(&mut self, level: usize) -> Result<NodeIndex, HypervisorError> {
        let table = HostPages::allocate(&self.host, 1)?;
        let children = if level < LEVELS - 1 { vec![None; ENTRIES] } else { Vec::new() };
        let index = NodeIndex(self.nodes.len() as u32);
        self.nodes.push(Node { table, children });
        Ok(index)
    }

    /// Returns the child of `parent` at `index`, allocating a zeroed table for
    /// it if the slot is empty.
    fn child_or_insert(&mut self, parent: NodeIndex, index: usize, child_level: usize) -> Result<NodeIndex, HypervisorError> {
        if let Some(child) = self.nodes[parent.0 as usize].children[index] {
            return Ok(child);
        }

        let child = self.allocate_node(child_level)?;
        let child_pa = self.nodes[child.0 as usize].table.phys();

        let node = &mut self.nodes[parent.0 as usize];
        node.table.entries_mut()[index] = (child_pa & ADDRESS_MASK) | EptFlags::READ_WRITE_EXECUTE.bits();
        node.children[index] = Some(child);

        Ok(child)
    }

    /// Walks down to the page table covering `guest_pa` without allocating.
    fn page_table(&self, guest_pa: u64) -> Option<NodeIndex> {
        let mut node = NodeIndex(0);
        for level in 0..LEVELS - 1 {
            node = self.nodes[node.0 as usize].children[table_index(guest_pa, level)]?;
        }
        Some(node)
    }

    /// Maps the 4 KiB guest page containing `guest_pa` to the host page at
    /// `host_pa`, creating missing tables. Remapping overwrites the leaf.
    pub fn map(&mut self, guest_pa: u64, host_pa: u64, flags: EptFlags) -> Result<(), HypervisorError> {
        if guest_pa >= GUEST_PHYSICAL_LIMIT {
            log::error!("Guest physical {:#x} is beyond the 48-bit EPT range", guest_pa);
            return Err(HypervisorError::InvalidArgument);
        }

        let mut node = NodeIndex(0);
        for level in 0..LEVELS - 1 {
            node = self.child_or_insert(node, table_index(guest_pa, level), level + 1)?;
        }

        let index = table_index(guest_pa, LEVELS - 1);
        self.nodes[node.0 as usize].table.entries_mut()[index] = (host_pa & ADDRESS_MASK) | flags.bits();

        log::trace!("EPT map {:#x} -> {:#x} ({:?})", guest_pa, host_pa, flags);

        Ok(())
    }

    /// Returns the page-aligned host physical address `guest_pa` is mapped to.
    pub fn translate(&self, guest_pa: u64) -> Option<u64> {
        let node = self.page_table(guest_pa)?;
        let entry = self.nodes[node.0 as usize].table.entries()[table_index(guest_pa, LEVELS - 1)];

        EptFlags::is_present(entry).then_some(entry & ADDRESS_MASK)
    }
}

impl<H: HostServices> Drop for NestedPageTable<H> {
    /// Releases every paging-structure page; guest memory pages are owned by
    /// whoever pinned them and are left alone.
    fn drop(&mut self) {
        log::debug!("Releasing {} EPT paging-structure pages", self.nodes.len());
        self.nodes.clear();
    }
}
