//! Portable executable image representation.
//!
//! See <https://learn.microsoft.com/en-us/windows/win32/debug/pe-format> for more information.

use alloc::{borrow::Cow, string::ToString, vec::Vec};

use ahash::RandomState;
use indexmap::IndexMap;
use log::{debug, warn};

use crate::{constants::*, errors::*, types::*, util::*};

/// Image data directory type enumeration.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum DataDirectoryType {
    ExportTable,
    ImportTable,
    ResourceTable,
    ExceptionTable,
    CertificateTable,
    BaseRelocationTable,
    Debug,
    Architecture,
    GlobalPtr,
    TLSTable,
    LoadConfigTable,
    BoundImport,
    IAT,
    DelayImportDescriptor,
    CLRRuntimeHeader,
    Reserved,
}

/// Location of a virtual address inside the file.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ResolvedAddress {
    /// Index of the containing section in the section table.
    pub section: usize,
    /// File offset corresponding to the virtual address.
    pub offset:  u64,
}

/// Portable executable image representation.
///
/// The image owns (or borrows until first modification) the complete file contents.
/// All modifications are made in place: the length of the image never changes.
#[derive(Debug, Clone)]
pub struct Image<'a> {
    pub(crate) image: Cow<'a, [u8]>,

    pub(crate) coff_header:           CoffHeader,
    pub(crate) standard_header:       StandardHeader,
    pub(crate) windows_header:        GenericWindowsHeader,
    pub(crate) header_data_directory: IndexMap<DataDirectoryType, ImageDataDirectory, RandomState>,
    pub(crate) section_table:         Vec<SectionHeader>,

    windows_header_offset: u64,
    section_table_offset:  u64,
}

impl<'a> Image<'a> {
    /// Parse a portable executable image from a byte slice.
    ///
    /// # Returns
    /// Returns the `Image`, or an error if the byte slice is not a valid portable executable image or is missing required headers.
    pub fn parse<R: Into<Cow<'a, [u8]>>>(image: R) -> Result<Self, ImageReadError> {
        let image = image.into();

        let pe_dos_magic = read_at::<u16>(&image, 0)?;
        debug!("pe_dos_magic: {:#x?}", pe_dos_magic);
        if pe_dos_magic != PE_DOS_MAGIC {
            return Err(ImageReadError::InvalidHeader("no dos magic".into()));
        }

        let pe_signature_offset = read_at::<u32>(&image, PE_PTR_OFFSET as u64)? as u64;
        debug!("pe_signature_offset: {:#x?}", pe_signature_offset);

        let pe_signature = read_at::<u32>(&image, pe_signature_offset)?;
        debug!("pe_signature: {:#x?}", pe_signature);
        if pe_signature != PE_NT_SIGNATURE {
            return Err(ImageReadError::InvalidHeader("no pe signature".into()));
        }

        let coff_header_offset = pe_signature_offset + 4;
        let coff_header = read_at::<CoffHeader>(&image, coff_header_offset)?;
        debug!("{:#x?}: {:#x?}", coff_header_offset, coff_header);
        if coff_header.size_of_optional_header < 24 {
            return Err(ImageReadError::InvalidHeader("optional header too small".into()));
        }

        let standard_header_offset = coff_header_offset + COFF_HEADER_SIZE as u64;
        let standard_header = read_at::<StandardHeader>(&image, standard_header_offset)?;
        debug!("{:#x?}: {:#x?}", standard_header_offset, standard_header);

        let (windows_header_offset, windows_header, optional_header_dd_offset) = {
            if standard_header.magic == PE_32_MAGIC
                && coff_header.size_of_optional_header as u32 >= PE_32_DATA_DIRECTORY_OFFSET
            {
                let windows_header_offset =
                    standard_header_offset + PE_32_WINDOWS_HEADER_OFFSET as u64;
                let windows_header = read_at::<WindowsHeader<u32>>(&image, windows_header_offset)?;
                (
                    windows_header_offset,
                    GenericWindowsHeader::WindowsHeader32(windows_header),
                    standard_header_offset + PE_32_DATA_DIRECTORY_OFFSET as u64,
                )
            } else if standard_header.magic == PE_64_MAGIC
                && coff_header.size_of_optional_header as u32 >= PE_64_DATA_DIRECTORY_OFFSET
            {
                let windows_header_offset =
                    standard_header_offset + PE_64_WINDOWS_HEADER_OFFSET as u64;
                let windows_header = read_at::<WindowsHeader<u64>>(&image, windows_header_offset)?;
                (
                    windows_header_offset,
                    GenericWindowsHeader::WindowsHeader64(windows_header),
                    standard_header_offset + PE_64_DATA_DIRECTORY_OFFSET as u64,
                )
            } else {
                return Err(ImageReadError::InvalidHeader("invalid optional header".into()));
            }
        };
        debug!("{:#x?}: {:#x?}", windows_header_offset, windows_header);

        if image.len() as u64 <= optional_header_dd_offset {
            return Err(ImageReadError::InvalidHeader(
                "image truncated after optional header".into(),
            ));
        }

        // only directories that fit into the declared optional header are read
        let available_directories = (standard_header_offset
            + coff_header.size_of_optional_header as u64
            - optional_header_dd_offset)
            / 8;
        let number_of_rva_and_sizes =
            (windows_header.number_of_rva_and_sizes() as u64).min(available_directories);

        debug!("optional_header_dd_offset: {:#x?}", optional_header_dd_offset);
        let mut header_data_directory =
            IndexMap::<DataDirectoryType, ImageDataDirectory, _>::with_hasher(RandomState::new());
        use DataDirectoryType::*;
        for (index, &header) in [
            ExportTable,
            ImportTable,
            ResourceTable,
            ExceptionTable,
            CertificateTable,
            BaseRelocationTable,
            Debug,
            Architecture,
            GlobalPtr,
            TLSTable,
            LoadConfigTable,
            BoundImport,
            IAT,
            DelayImportDescriptor,
            CLRRuntimeHeader,
            Reserved,
        ]
        .iter()
        .enumerate()
        {
            if (index as u64) < number_of_rva_and_sizes {
                let offset = optional_header_dd_offset + (index * 8) as u64;
                let data = read_at::<ImageDataDirectory>(&image, offset)?;
                header_data_directory.insert(header, data);
                debug!("{:#x?}: {:?}: {:#x?}", offset, header, data);
            }
        }

        let section_table_offset =
            standard_header_offset + coff_header.size_of_optional_header as u64;
        let mut section_table = Vec::with_capacity(coff_header.number_of_sections as usize);
        for index in 0..coff_header.number_of_sections as u64 {
            let section_header_offset = section_table_offset + index * SECTION_HEADER_SIZE as u64;
            let section_header = read_at::<SectionHeader>(&image, section_header_offset)?;
            debug!(
                "{:#x?}: {}: {:#x?}",
                section_header_offset,
                section_header.name().unwrap_or("?".to_string()),
                section_header
            );
            section_table.push(section_header);
        }

        Ok(Self {
            image,
            coff_header,
            standard_header,
            windows_header,
            header_data_directory,
            section_table,
            windows_header_offset,
            section_table_offset,
        })
    }

    #[cfg(feature = "std")]
    /// Parse a portable executable image from a file.
    ///
    /// # Returns
    /// Returns the `Image`, or an error if the file could not be read, is not a valid portable executable image or is missing required headers.
    pub fn parse_file<P: AsRef<std::path::Path>>(path: P) -> Result<Image<'static>, ImageReadError> {
        let data = std::fs::read(path)?;
        Image::parse(data)
    }

    #[cfg(feature = "std")]
    /// Parse a portable executable image from a reader.
    ///
    /// # Returns
    /// Returns the `Image`, or an error if the reader could not be read in full, is not a valid portable executable image or is missing required headers.
    pub fn parse_reader<R: std::io::Read>(
        reader: &mut R,
    ) -> Result<Image<'static>, ImageReadError> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        Image::parse(data)
    }

    #[cfg(feature = "std")]
    /// Write the portable executable image to a writer.
    ///
    /// # Returns
    /// Returns an error if the writer could not be written.
    pub fn write_writer<W: std::io::Write>(&self, writer: &mut W) -> Result<(), ImageWriteError> {
        writer.write_all(&self.image).map_err(|e| e.into())
    }

    /// Resolve a virtual address to the file offset backing it.
    ///
    /// Sections are searched in table order and the first section whose raw data covers the address wins.
    /// Addresses in the uninitialized tail of a section (past its raw data) have no file offset.
    pub fn resolve(&self, address: u64) -> Option<ResolvedAddress> {
        let image_base = self.image_base();
        self.section_table.iter().enumerate().find_map(|(index, section)| {
            let start = section.virtual_start(image_base);
            let end = section.virtual_raw_end(image_base);
            if start <= address && address < end {
                Some(ResolvedAddress {
                    section: index,
                    offset:  section.pointer_to_raw_data as u64 + (address - start),
                })
            } else {
                None
            }
        })
    }

    /// Returns the index and header of the section with the given name.
    /// If several sections share the name the last one in the table is returned.
    pub fn section_by_name(&self, name: &str) -> Option<(usize, &SectionHeader)> {
        self.section_table
            .iter()
            .enumerate()
            .filter(|(_, section)| section.name_matches(name))
            .last()
    }

    /// Returns the raw contents of a section, limited to its declared virtual size.
    ///
    /// # Returns
    /// Returns an error if the section data lies outside the image.
    pub fn section_data(&self, index: usize) -> Result<&[u8], ImageWriteError> {
        let section = self
            .section_table
            .get(index)
            .ok_or_else(|| ReadError("section index".to_string()))?;
        if section.raw_end() > self.image.len() as u64 {
            return Err(ImageWriteError::InvalidSectionRange(
                section.raw_end(),
                self.image.len() as u64,
            ));
        }
        let start = section.pointer_to_raw_data as usize;
        let length = section.virtual_size.min(section.size_of_raw_data) as usize;
        if section.virtual_size > section.size_of_raw_data {
            debug!(
                "{} section virtual size {:#x?} exceeds raw size {:#x?}, reading raw data only",
                section.name().unwrap_or("?".to_string()),
                section.virtual_size,
                section.size_of_raw_data
            );
        }
        Ok(&self.image[start..start + length])
    }

    /// Returns a copy of the patch records stored in the named section.
    ///
    /// The records are copied so the image can be written while they are read.
    /// See [`Image::section_data`] for the length of the stream.
    ///
    /// # Returns
    /// Returns [`PatchError::SectionNotFound`] if the image has no such section.
    pub fn patch_stream(&self, section: &str) -> Result<Vec<u8>, PatchError> {
        let index = match self.section_by_name(section) {
            Some((index, _)) => index,
            None => return Err(PatchError::SectionNotFound(section.to_string())),
        };
        let stream = self.section_data(index)?.to_vec();
        debug!("{} section holds {:#x?} bytes of patch records", section, stream.len());
        Ok(stream)
    }

    /// Set the virtual size of the section at the index.
    /// This will update the section table entry in the image.
    ///
    /// # Returns
    /// Returns the previous virtual size, or an error if the section does not exist.
    pub fn set_section_virtual_size(
        &mut self, index: usize, virtual_size: u32,
    ) -> Result<u32, ImageWriteError> {
        let section = self
            .section_table
            .get_mut(index)
            .ok_or_else(|| ReadError("section index".to_string()))?;
        let previous_virtual_size = section.virtual_size;
        section.virtual_size = virtual_size;
        let section = *section;

        let offset = self.section_table_offset + index as u64 * SECTION_HEADER_SIZE as u64;
        write_at(self.image.to_mut(), offset, &section)?;
        Ok(previous_virtual_size)
    }

    /// Raise the virtual size of every section not named `except` to its raw size,
    /// if it is nonzero and smaller than the raw size.
    ///
    /// Tools that strip sections down to their virtual size would otherwise drop initialized data.
    ///
    /// # Returns
    /// Returns the number of sections that were changed.
    pub fn normalize_virtual_sizes(&mut self, except: &str) -> Result<usize, ImageWriteError> {
        let mut changed = 0;
        for index in 0..self.section_table.len() {
            let section = self.section_table[index];
            if section.name_matches(except) {
                continue;
            }
            if section.virtual_size != 0 && section.size_of_raw_data > section.virtual_size {
                debug!(
                    "raising {} section virtual size {:#x?} to raw size {:#x?}",
                    section.name().unwrap_or("?".to_string()),
                    section.virtual_size,
                    section.size_of_raw_data
                );
                self.set_section_virtual_size(index, section.size_of_raw_data)?;
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Set the checksum field in the windows header.
    ///
    /// # Returns
    /// Returns the previous checksum.
    pub fn set_check_sum(&mut self, check_sum: u32) -> Result<u32, ImageWriteError> {
        let previous_check_sum = self.windows_header.check_sum();
        self.windows_header.set_check_sum(check_sum);
        write_bytes_at(
            self.image.to_mut(),
            self.windows_header_offset,
            self.windows_header.as_bytes(),
        )?;
        Ok(previous_check_sum)
    }

    /// Overwrite image bytes at a file offset.
    /// The write either happens in full or not at all.
    pub(crate) fn write_bytes(&mut self, offset: u64, bytes: &[u8]) -> Result<(), ImageWriteError> {
        if offset + bytes.len() as u64 > self.image.len() as u64 {
            warn!(
                "write of {} bytes at {:#x?} exceeds image size {:#x?}",
                bytes.len(),
                offset,
                self.image.len()
            );
            return Err(ImageWriteError::InvalidSectionRange(
                offset + bytes.len() as u64,
                self.image.len() as u64,
            ));
        }
        write_bytes_at(self.image.to_mut(), offset, bytes)?;
        Ok(())
    }

    /// Returns the raw image data with all changes applied.
    pub fn data(&self) -> &[u8] { &self.image }

    /// Consumes the image and returns the raw image data with all changes applied.
    pub fn into_data(self) -> Vec<u8> { self.image.into_owned() }

    /// Returns the parsed coff header.
    pub fn coff_header(&self) -> &CoffHeader { &self.coff_header }

    /// Returns the parsed standard header.
    pub fn standard_header(&self) -> &StandardHeader { &self.standard_header }

    /// Returns the parsed windows header.
    pub fn windows_header(&self) -> &GenericWindowsHeader { &self.windows_header }

    /// Returns the preferred load address of the image.
    pub fn image_base(&self) -> u64 { self.windows_header.image_base() }

    /// Returns the checksum stored in the windows header.
    pub fn check_sum(&self) -> u32 { self.windows_header.check_sum() }

    /// Returns the data directory for the requested header.
    pub fn data_directory(&self, directory: DataDirectoryType) -> Option<&ImageDataDirectory> {
        self.header_data_directory.get(&directory)
    }

    /// Returns all data directories existing in the image.
    pub fn data_directories(&self) -> Vec<DataDirectoryType> {
        self.header_data_directory.keys().copied().collect::<Vec<_>>()
    }

    /// Returns the section header for the section at the index.
    pub fn section_header<Index: Into<usize>>(&self, index: Index) -> Option<&SectionHeader> {
        self.section_table.get(index.into())
    }

    /// Returns all section tables existing in the image.
    pub fn section_table(&self) -> &Vec<SectionHeader> { &self.section_table }
}
