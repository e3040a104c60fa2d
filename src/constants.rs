//! Windows API and binary constants.

#![allow(non_upper_case_globals)]

pub type DWORD = u32;
pub type WORD = u16;


// https://docs.microsoft.com/en-us/windows/win32/debug/pe-format

pub const PE_DOS_MAGIC: WORD = 0x5a4d; // MZ
pub const PE_PTR_OFFSET: DWORD = 0x03c;
pub const PE_NT_SIGNATURE: DWORD = 0x00004550; // PE00
pub const PE_32_MAGIC: WORD = 0x010b;
pub const PE_64_MAGIC: WORD = 0x020b;

pub const COFF_HEADER_SIZE: DWORD = 20;
pub const SECTION_HEADER_SIZE: DWORD = 40;
pub const SECTION_NAME_SIZE: usize = 8;

// offsets and minimum optional header sizes, relative to the start of the optional header
pub const PE_32_WINDOWS_HEADER_OFFSET: DWORD = 28;
pub const PE_64_WINDOWS_HEADER_OFFSET: DWORD = 24;
pub const PE_32_DATA_DIRECTORY_OFFSET: DWORD = 96;
pub const PE_64_DATA_DIRECTORY_OFFSET: DWORD = 112;


// https://docs.microsoft.com/en-us/windows/win32/debug/pe-format#section-flags

pub const IMAGE_SCN_CNT_INITIALIZED_DATA: DWORD = 0x00000040;
pub const IMAGE_SCN_MEM_READ: DWORD = 0x40000000;


/// Name of the section patch records are read from unless another one is requested.
pub const DEFAULT_PATCH_SECTION: &str = ".patch";

/// Size of a patch record header: a 32-bit virtual address followed by a 32-bit payload length.
pub const PATCH_RECORD_HEADER_SIZE: usize = 8;
