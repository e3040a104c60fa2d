//! Portable executable data types.
//!
//! These types are a one-to-one mapping of the header data described in <https://docs.microsoft.com/en-us/windows/win32/debug/pe-format>

use alloc::string::{String, ToString};
use core::{mem, slice};

use zerocopy::{byteorder::little_endian::U32, FromBytes, Immutable, IntoBytes};

use crate::constants::SECTION_NAME_SIZE;

#[repr(C, packed(1))]
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, FromBytes, IntoBytes, Immutable, Default,
)]
pub struct VersionU8 {
    pub major: u8,
    pub minor: u8,
}
#[repr(C, packed(2))]
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, FromBytes, IntoBytes, Immutable, Default,
)]
pub struct VersionU16 {
    pub major: u16,
    pub minor: u16,
}
#[repr(C, packed(2))]
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, FromBytes, IntoBytes, Immutable, Default,
)]
pub struct CoffHeader {
    pub machine:                 u16,
    pub number_of_sections:      u16,
    pub time_date_stamp:         u32,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbols:       u32,
    pub size_of_optional_header: u16,
    pub characteristics:         u16,
}
#[repr(C, packed(2))]
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, FromBytes, IntoBytes, Immutable, Default,
)]
pub struct StandardHeader {
    pub magic:                      u16,
    pub linker_version:             VersionU8,
    pub size_of_code:               u32,
    pub size_of_initialized_data:   u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point:     u32,
    pub base_of_code:               u32,
}
#[repr(C)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, FromBytes, Default)]
pub struct WindowsHeader<UXX> {
    pub image_base:               UXX,
    pub section_alignment:        u32,
    pub file_alignment:           u32,
    pub operating_system_version: VersionU16,
    pub image_version:            VersionU16,
    pub subsystem_version:        VersionU16,
    pub win32_version_value:      u32,
    pub size_of_image:            u32,
    pub size_of_headers:          u32,
    pub check_sum:                u32,
    pub subsystem:                u16,
    pub dll_characteristics:      u16,
    pub size_of_stack_reserve:    UXX,
    pub size_of_stack_commit:     UXX,
    pub size_of_heap_reserve:     UXX,
    pub size_of_heap_commit:      UXX,
    pub loader_flags:             u32,
    pub number_of_rva_and_sizes:  u32,
}
impl<UXX> WindowsHeader<UXX>
where
    UXX: IntoBytes,
{
    pub fn as_bytes(&self) -> &[u8] {
        // manually implement this here because zerocopy doesn't support derive for generic types
        unsafe {
            let len = mem::size_of_val(self);
            slice::from_raw_parts(self as *const Self as *const u8, len)
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub enum GenericWindowsHeader {
    WindowsHeader32(WindowsHeader<u32>),
    WindowsHeader64(WindowsHeader<u64>),
}
impl GenericWindowsHeader {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            GenericWindowsHeader::WindowsHeader32(header) => header.as_bytes(),
            GenericWindowsHeader::WindowsHeader64(header) => header.as_bytes(),
        }
    }

    /// Image base widened to 64 bits regardless of the optional header flavour.
    pub const fn image_base(&self) -> u64 {
        match self {
            GenericWindowsHeader::WindowsHeader32(header) => header.image_base as u64,
            GenericWindowsHeader::WindowsHeader64(header) => header.image_base,
        }
    }

    pub const fn check_sum(&self) -> u32 {
        match self {
            GenericWindowsHeader::WindowsHeader32(header) => header.check_sum,
            GenericWindowsHeader::WindowsHeader64(header) => header.check_sum,
        }
    }

    pub fn set_check_sum(&mut self, check_sum: u32) {
        match self {
            GenericWindowsHeader::WindowsHeader32(header) => header.check_sum = check_sum,
            GenericWindowsHeader::WindowsHeader64(header) => header.check_sum = check_sum,
        }
    }

    pub const fn number_of_rva_and_sizes(&self) -> u32 {
        match self {
            GenericWindowsHeader::WindowsHeader32(header) => header.number_of_rva_and_sizes,
            GenericWindowsHeader::WindowsHeader64(header) => header.number_of_rva_and_sizes,
        }
    }
}

#[repr(C, packed(4))]
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, FromBytes, IntoBytes, Immutable, Default,
)]
pub struct ImageDataDirectory {
    pub virtual_address: u32,
    pub size:            u32,
}

#[repr(C, packed(4))]
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, FromBytes, IntoBytes, Immutable, Default,
)]
pub struct SectionHeader {
    pub name:                   u64,
    pub virtual_size:           u32,
    pub virtual_address:        u32,
    pub size_of_raw_data:       u32,
    pub pointer_to_raw_data:    u32,
    pub pointer_to_relocations: u32,
    pub pointer_to_linenumbers: u32,
    pub number_of_relocations:  u16,
    pub number_of_linenumbers:  u16,
    pub characteristics:        u32,
}

impl SectionHeader {
    pub fn name(&self) -> Option<String> {
        let name = self.name.to_le_bytes();
        let name = core::str::from_utf8(
            &name[0..name.iter().position(|&c| c == b'\0').unwrap_or(name.len())],
        )
        .ok();
        name.map(|name| name.to_string())
    }

    /// Compares the section name against `name` the way the section table stores it:
    /// at most the first eight bytes are significant and a shorter name ends at the first nul byte.
    pub fn name_matches(&self, name: &str) -> bool {
        let stored = self.name.to_le_bytes();
        let requested = name.as_bytes();
        for index in 0..SECTION_NAME_SIZE {
            let wanted = requested.get(index).copied().unwrap_or(0);
            if stored[index] != wanted {
                return false;
            }
            if wanted == 0 {
                return true;
            }
        }
        true
    }

    /// Encodes a section name into the packed form stored in the section table, truncating to eight bytes.
    pub fn encode_name(name: &str) -> u64 {
        let mut bytes = [0u8; SECTION_NAME_SIZE];
        for (target, source) in bytes.iter_mut().zip(name.as_bytes()) {
            *target = *source;
        }
        u64::from_le_bytes(bytes)
    }

    /// Start of the section's virtual extent for an image loaded at `image_base`.
    pub fn virtual_start(&self, image_base: u64) -> u64 {
        image_base.saturating_add(self.virtual_address as u64)
    }

    /// End of the section data present in the file, exclusive, as a virtual address.
    pub fn virtual_raw_end(&self, image_base: u64) -> u64 {
        self.virtual_start(image_base).saturating_add(self.size_of_raw_data as u64)
    }

    /// End of the section data present in the file, exclusive, as a file offset.
    pub fn raw_end(&self) -> u64 { self.pointer_to_raw_data as u64 + self.size_of_raw_data as u64 }
}

/// Header preceding every patch record payload in a patch section.
#[repr(C)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, FromBytes, IntoBytes, Immutable, Default)]
pub struct PatchRecordHeader {
    pub address: U32,
    pub length:  U32,
}
