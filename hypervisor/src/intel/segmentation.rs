//! Segment state: access-rights encoding for the VMCS guest segment fields,
//! conversion from the controller's `kvm_segment` layout, and descriptor
//! lookup for the host TR base.

use {
    crate::kvm::KvmSegment,
    bit_field::BitField,
    bitflags::bitflags,
    x86::{dtables::DescriptorTablePointer, segmentation::SegmentSelector, vmx::vmcs::guest},
    x86_64::structures::gdt::DescriptorFlags,
};

bitflags! {
    /// Access rights for VMCS guest register states.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.4.1 Guest Register State
    /// and Table 25-2. Format of Access Rights.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentAccessRights: u32 {
        /// Segment type (bits 3:0).
        const TYPE_MASK = 0xF;

        /// Descriptor type (0 = system; 1 = code or data).
        const CODE_DATA = 1 << 4;

        /// Privilege level mask (bits 6:5).
        const DPL_MASK = 3 << 5;

        /// Segment present.
        const PRESENT = 1 << 7;

        /// Available for use by system software.
        const AVAILABLE = 1 << 12;

        /// 64-bit code segment (for CS only).
        const LONG_MODE = 1 << 13;

        /// Default operation size (0 = 16-bit segment; 1 = 32-bit segment).
        const DB = 1 << 14;

        /// Granularity.
        const GRANULARITY = 1 << 15;

        /// Segment unusable (0 = usable; 1 = unusable).
        const UNUSABLE = 1 << 16;
    }
}

impl SegmentAccessRights {
    /// Encodes a controller segment. Unusable or non-present segments carry
    /// only the unusable bit.
    pub fn from_kvm(segment: &KvmSegment) -> Self {
        if segment.unusable != 0 || segment.present == 0 {
            return Self::UNUSABLE;
        }

        let mut bits = 0u32;
        bits.set_bits(0..4, (segment.type_ & 0xF) as u32);
        bits.set_bit(4, segment.s != 0);
        bits.set_bits(5..7, (segment.dpl & 0x3) as u32);
        bits.set_bit(7, true);
        bits.set_bit(12, segment.avl != 0);
        bits.set_bit(13, segment.l != 0);
        bits.set_bit(14, segment.db != 0);
        bits.set_bit(15, segment.g != 0);

        Self::from_bits_truncate(bits)
    }

    /// Decodes the access-rights half of a controller segment.
    pub fn apply_to(self, segment: &mut KvmSegment) {
        let bits = self.bits();
        segment.type_ = bits.get_bits(0..4) as u8;
        segment.s = bits.get_bit(4) as u8;
        segment.dpl = bits.get_bits(5..7) as u8;
        segment.present = bits.get_bit(7) as u8;
        segment.avl = bits.get_bit(12) as u8;
        segment.l = bits.get_bit(13) as u8;
        segment.db = bits.get_bit(14) as u8;
        segment.g = bits.get_bit(15) as u8;
        segment.unusable = bits.get_bit(16) as u8;
    }
}

/// VMCS field encodings for one guest segment register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestSegmentFields {
    pub selector: u32,
    pub base: u32,
    pub limit: u32,
    pub access_rights: u32,
}

impl GuestSegmentFields {
    pub const CS: Self = Self { selector: guest::CS_SELECTOR, base: guest::CS_BASE, limit: guest::CS_LIMIT, access_rights: guest::CS_ACCESS_RIGHTS };
    pub const SS: Self = Self { selector: guest::SS_SELECTOR, base: guest::SS_BASE, limit: guest::SS_LIMIT, access_rights: guest::SS_ACCESS_RIGHTS };
    pub const DS: Self = Self { selector: guest::DS_SELECTOR, base: guest::DS_BASE, limit: guest::DS_LIMIT, access_rights: guest::DS_ACCESS_RIGHTS };
    pub const ES: Self = Self { selector: guest::ES_SELECTOR, base: guest::ES_BASE, limit: guest::ES_LIMIT, access_rights: guest::ES_ACCESS_RIGHTS };
    pub const FS: Self = Self { selector: guest::FS_SELECTOR, base: guest::FS_BASE, limit: guest::FS_LIMIT, access_rights: guest::FS_ACCESS_RIGHTS };
    pub const GS: Self = Self { selector: guest::GS_SELECTOR, base: guest::GS_BASE, limit: guest::GS_LIMIT, access_rights: guest::GS_ACCESS_RIGHTS };
    pub const TR: Self = Self { selector: guest::TR_SELECTOR, base: guest::TR_BASE, limit: guest::TR_LIMIT, access_rights: guest::TR_ACCESS_RIGHTS };
    pub const LDTR: Self = Self { selector: guest::LDTR_SELECTOR, base: guest::LDTR_BASE, limit: guest::LDTR_LIMIT, access_rights: guest::LDTR_ACCESS_RIGHTS };
}

/// Represents the details of a segment descriptor in the GDT.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 3.4.5 Segment Descriptors
pub struct SegmentDescriptor {
    pub selector: SegmentSelector,
    pub base_address: u64,
    pub segment_limit: u32,
}

impl SegmentDescriptor {
    pub const fn invalid() -> Self {
        Self { selector: SegmentSelector::empty(), base_address: 0, segment_limit: 0 }
    }

    /// Looks `selector` up in the GDT described by `gdtr`.
    pub fn from_selector(selector: SegmentSelector, gdtr: &DescriptorTablePointer<u64>) -> Self {
        let index = selector.index() as usize;
        let entries = (gdtr.limit as usize + 1) / core::mem::size_of::<u64>();
        if index == 0 || index >= entries {
            return Self::invalid();
        }

        let table = unsafe { core::slice::from_raw_parts(gdtr.base, entries) };
        let entry_value = table[index];
        let entry = DescriptorFlags::from_bits_truncate(entry_value);
        if !entry.contains(DescriptorFlags::PRESENT) {
            return Self::invalid();
        }

        let mut base_address = entry_value.get_bits(16..40) | (entry_value.get_bits(56..64) << 24);
        let mut segment_limit = entry_value.get_bits(0..16) | (entry_value.get_bits(48..52) << 16);

        // System descriptors (TSS, LDT) are 16 bytes with the upper base in the next slot.
        if !entry.contains(DescriptorFlags::USER_SEGMENT) && index + 1 < entries {
            base_address |= table[index + 1].get_bits(0..32) << 32;
        }

        if entry.contains(DescriptorFlags::GRANULARITY) {
            segment_limit = (segment_limit << 12) | 0xFFF;
        }

        Self { selector, base_address, segment_limit: segment_limit as u32 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code_segment() -> KvmSegment {
        KvmSegment {
            base: 0,
            limit: 0xFFFF_FFFF,
            selector: 0x8,
            type_: 0xB,
            present: 1,
            dpl: 0,
            db: 0,
            s: 1,
            l: 1,
            g: 1,
            avl: 0,
            unusable: 0,
            padding: 0,
        }
    }

    #[test]
    fn test_long_mode_code_segment_rights() {
        let rights = SegmentAccessRights::from_kvm(&code_segment());

        assert_eq!(rights.bits(), 0xA09B);
    }

    #[test]
    fn test_rights_decode_back_to_segment_fields() {
        let original = code_segment();
        let mut decoded = KvmSegment { base: original.base, limit: original.limit, selector: original.selector, ..Default::default() };

        SegmentAccessRights::from_kvm(&original).apply_to(&mut decoded);

        assert_eq!(decoded, original);
    }

    #[test]
    fn test_unusable_segment_only_sets_unusable() {
        let mut segment = code_segment();
        segment.present = 0;
        assert_eq!(SegmentAccessRights::from_kvm(&segment), SegmentAccessRights::UNUSABLE);

        segment.present = 1;
        segment.unusable = 1;
        assert_eq!(SegmentAccessRights::from_kvm(&segment), SegmentAccessRights::UNUSABLE);
    }

    #[test]
    fn test_tss_base_spans_two_gdt_slots() {
        // Null, code, then a 16-byte available 64-bit TSS at index 2.
        let base: u64 = 0xFFFF_8000_1234_5678;
        let low = 0x67 | ((base & 0xFF_FFFF) << 16) | (0x89 << 40) | (((base >> 24) & 0xFF) << 56);
        let gdt: [u64; 4] = [0, 0x00AF_9B00_0000_FFFF, low, base >> 32];
        let gdtr = DescriptorTablePointer { limit: (core::mem::size_of_val(&gdt) - 1) as u16, base: gdt.as_ptr() };

        let descriptor = SegmentDescriptor::from_selector(SegmentSelector::from_raw(0x10), &gdtr);

        assert_eq!(descriptor.base_address, base);
        assert_eq!(descriptor.segment_limit, 0x67);
    }
}
