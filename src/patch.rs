//! Patch records and their application to an image.
//!
//! A patch section holds a sequence of records, each a little-endian 32-bit virtual address,
//! a little-endian 32-bit payload length and the payload itself.
//! A record with address zero ends the sequence.
//!
//! [`PatchReader`] walks the records of a patch stream without reading past its end,
//! [`Patcher`] resolves and writes them into an [`Image`] while tracking the ranges it has written,
//! and [`patch_image`] runs the whole pass over an image the way the command line tool does.

use alloc::{
    collections::BTreeMap,
    string::{String, ToString},
};
use core::{fmt, mem::size_of};

use log::{debug, error, info, warn};

use crate::{constants::*, errors::*, image::*, types::*, util::*};

/// A single patch record borrowed from a patch stream.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PatchRecord<'a> {
    /// Virtual address the payload is written to.
    pub address: u32,
    /// Bytes to write.
    pub payload: &'a [u8],
}
impl PatchRecord<'_> {
    /// Returns the virtual address range covered by the record.
    pub fn range(&self) -> PatchRange { PatchRange::new(self.address, self.payload.len() as u64) }
}

/// Bounded reader over the records of a patch stream.
///
/// Iteration ends at the end of the stream or at a record with address zero.
/// A record whose header or payload extends past the end of the stream yields [`PatchError::TruncatedPatch`]
/// and ends iteration.
#[derive(Debug, Clone)]
pub struct PatchReader<'a> {
    data:     &'a [u8],
    position: usize,
    sentinel: Option<usize>,
    finished: bool,
}
impl<'a> PatchReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            position: 0,
            sentinel: None,
            finished: false,
        }
    }

    /// Returns the stream offset of the zero address that ended iteration, if any.
    pub fn sentinel(&self) -> Option<usize> { self.sentinel }

    /// Returns the current offset into the stream.
    pub fn position(&self) -> usize { self.position }

    fn truncated(&mut self, offset: usize) -> Option<Result<PatchRecord<'a>, PatchError>> {
        self.finished = true;
        Some(Err(PatchError::TruncatedPatch { offset }))
    }
}
impl<'a> Iterator for PatchReader<'a> {
    type Item = Result<PatchRecord<'a>, PatchError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let data = self.data;
        let offset = self.position;
        let remaining = &data[offset..];
        if remaining.is_empty() {
            self.finished = true;
            return None;
        }

        if remaining.len() < size_of::<u32>() {
            // a short tail of zeros is padding, anything else is a cut off address
            self.finished = true;
            if remaining.iter().all(|&byte| byte == 0) {
                self.sentinel = Some(offset);
                return None;
            }
            return self.truncated(offset);
        }
        if remaining[..size_of::<u32>()].iter().all(|&byte| byte == 0) {
            self.finished = true;
            self.sentinel = Some(offset);
            return None;
        }

        let header = match read::<PatchRecordHeader>(remaining) {
            Ok(header) => header,
            Err(_) => return self.truncated(offset),
        };
        let address = header.address.get();
        let length = header.length.get() as usize;

        let payload = match PATCH_RECORD_HEADER_SIZE
            .checked_add(length)
            .and_then(|end| remaining.get(PATCH_RECORD_HEADER_SIZE..end))
        {
            Some(payload) => payload,
            None => return self.truncated(offset),
        };
        self.position += PATCH_RECORD_HEADER_SIZE + length;

        Some(Ok(PatchRecord { address, payload }))
    }
}

/// Half-open virtual address range `[start, end)` written by a patch.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct PatchRange {
    pub start: u64,
    pub end:   u64,
}
impl PatchRange {
    pub fn new(address: u32, length: u64) -> Self {
        Self {
            start: address as u64,
            end:   address as u64 + length,
        }
    }

    pub fn len(&self) -> u64 { self.end - self.start }

    pub fn is_empty(&self) -> bool { self.start >= self.end }

    /// Ranges that only touch do not overlap, and an empty range overlaps nothing.
    pub fn overlaps(&self, other: &PatchRange) -> bool {
        !self.is_empty() && !other.is_empty() && self.start < other.end && other.start < self.end
    }
}
impl fmt::Display for PatchRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "start = {:08X}, end = {:08X}, size = {} bytes", self.start, self.end, self.len())
    }
}

/// Set of ranges written during a patch run, used to detect overlapping patches.
///
/// Ranges are kept ordered by start address. Overlapping ranges are stored as well,
/// so a lookup only has to scan entries starting within the longest stored range before the query.
#[derive(Debug, Clone, Default)]
pub struct AppliedRanges {
    ranges:  BTreeMap<(u64, usize), u64>,
    longest: u64,
}
impl AppliedRanges {
    pub fn new() -> Self { Self::default() }

    /// Returns all stored ranges overlapping `range`, ordered by start address.
    pub fn overlapping(&self, range: PatchRange) -> impl Iterator<Item = PatchRange> + '_ {
        let lower = range.start.saturating_sub(self.longest);
        self.ranges
            .range((lower, 0)..(range.end, 0))
            .map(|(&(start, _), &end)| PatchRange { start, end })
            .filter(move |existing| existing.overlaps(&range))
    }

    /// Empty ranges cover no addresses and are not stored.
    pub fn insert(&mut self, range: PatchRange) {
        if range.is_empty() {
            return;
        }
        let sequence = self.ranges.len();
        self.ranges.insert((range.start, sequence), range.end);
        self.longest = self.longest.max(range.len());
    }

    pub fn len(&self) -> usize { self.ranges.len() }

    pub fn is_empty(&self) -> bool { self.ranges.is_empty() }

    pub fn iter(&self) -> impl Iterator<Item = PatchRange> + '_ {
        self.ranges.iter().map(|(&(start, _), &end)| PatchRange { start, end })
    }
}

/// Handling of patches that overlap a range already written in the same run.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum ConflictPolicy {
    /// Write the patch and log a warning for every overlapped range.
    #[default]
    Warn,
    /// Abort the run before writing the conflicting patch.
    Deny,
}

/// Result of a successfully applied patch.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Applied {
    pub range:     PatchRange,
    /// Index of the section the patch was written into.
    pub section:   usize,
    /// File offset the payload was written to.
    pub offset:    u64,
    /// Number of previously applied patches overlapping this one.
    pub conflicts: usize,
}

/// Totals of a patch run.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct PatchSummary {
    pub patches:             u32,
    pub bytes:               u64,
    pub empty:               u32,
    pub conflicts:           u32,
    pub normalized_sections: usize,
}

/// Applies patch records to an image and keeps track of the ranges written so far.
#[derive(Debug, Clone, Default)]
pub struct Patcher {
    policy:  ConflictPolicy,
    applied: AppliedRanges,
}
impl Patcher {
    pub fn new(policy: ConflictPolicy) -> Self {
        Self {
            policy,
            applied: AppliedRanges::new(),
        }
    }

    /// Returns the ranges written by this patcher.
    pub fn applied(&self) -> &AppliedRanges { &self.applied }

    /// Write `payload` to the file offset backing the virtual `address`.
    ///
    /// # Returns
    /// Returns an error without modifying the image in the following cases:
    /// - [`PatchError::AddressNotFound`] if no section contains the address in its raw data.
    /// - [`PatchError::PatchTooLong`] if the payload does not fit into the rest of the section's raw data.
    /// - [`PatchError::ConflictingPatch`] if the policy is [`ConflictPolicy::Deny`] and the patch overlaps a previous one.
    pub fn apply(
        &mut self, image: &mut Image<'_>, address: u32, payload: &[u8],
    ) -> Result<Applied, PatchError> {
        let length = payload.len() as u64;
        let resolved = match image.resolve(address as u64) {
            Some(resolved) => resolved,
            None => return Err(PatchError::AddressNotFound(address)),
        };
        let section = image.section_table()[resolved.section];
        if length > section.size_of_raw_data as u64 || resolved.offset + length > section.raw_end()
        {
            debug!(
                "patch {:08X} at offset {:#x?} exceeds {} section raw data ending at {:#x?}",
                address,
                resolved.offset,
                section.name().unwrap_or("?".to_string()),
                section.raw_end()
            );
            return Err(PatchError::PatchTooLong {
                address,
                length: u32::try_from(length).unwrap_or(u32::MAX),
            });
        }

        let range = PatchRange::new(address, length);
        let mut conflicts = 0;
        for existing in self.applied.overlapping(range) {
            if self.policy == ConflictPolicy::Deny {
                return Err(PatchError::ConflictingPatch {
                    first:  existing,
                    second: range,
                });
            }
            warn!("conflicting patches detected\n    patch 1 {}\n    patch 2 {}", range, existing);
            conflicts += 1;
        }

        image.write_bytes(resolved.offset, payload)?;
        debug!(
            "patch {:8} bytes -> {:08X} ({} section, offset {:#x?})",
            length,
            address,
            section.name().unwrap_or("?".to_string()),
            resolved.offset
        );

        self.applied.insert(range);
        Ok(Applied {
            range,
            section: resolved.section,
            offset: resolved.offset,
            conflicts,
        })
    }

    /// Apply every record of a patch stream.
    ///
    /// Records with an empty payload are skipped. The first record that cannot be applied aborts the run;
    /// records applied before it stay written to the image, which should then be discarded.
    pub fn run(&mut self, image: &mut Image<'_>, stream: &[u8]) -> Result<PatchSummary, PatchError> {
        let mut summary = PatchSummary::default();
        let mut reader = PatchReader::new(stream);
        for record in reader.by_ref() {
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    error!("reading patch records failed: {:?}", e);
                    return Err(e);
                }
            };
            if record.payload.is_empty() {
                warn!("empty patch detected\n    patch start = {:08X}, size = 0 bytes", record.address);
                summary.empty += 1;
                continue;
            }
            let applied = match self.apply(image, record.address, record.payload) {
                Ok(applied) => applied,
                Err(e) => {
                    error!(
                        "patch {:08X} ({} bytes) failed: {:?}",
                        record.address,
                        record.payload.len(),
                        e
                    );
                    return Err(e);
                }
            };
            summary.patches += 1;
            summary.bytes += applied.range.len();
            summary.conflicts += applied.conflicts as u32;
        }
        if let Some(offset) = reader.sentinel() {
            if offset + size_of::<u32>() <= stream.len() {
                warn!("trailing zero address at stream offset {:#x?}", offset);
            }
        }
        Ok(summary)
    }
}

/// Options for [`patch_image`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PatchOptions {
    /// Name of the section holding the patch records.
    pub section:                 String,
    pub conflict_policy:         ConflictPolicy,
    /// Raise the virtual size of every other section to its raw size, see [`Image::normalize_virtual_sizes`].
    pub normalize_virtual_sizes: bool,
    /// Zero the checksum in the windows header after patching. The checksum is not recomputed.
    pub reset_check_sum:         bool,
}
impl Default for PatchOptions {
    fn default() -> Self {
        Self {
            section:                 DEFAULT_PATCH_SECTION.to_string(),
            conflict_policy:         ConflictPolicy::default(),
            normalize_virtual_sizes: true,
            reset_check_sum:         true,
        }
    }
}

/// Apply the patch records stored in a section of the image to the image itself.
///
/// # Returns
/// Returns `None` without modifying the image if the patch section does not exist,
/// otherwise the totals of the run, or the error that aborted it.
/// On error the image may be partially patched and should be discarded.
pub fn patch_image(
    image: &mut Image<'_>, options: &PatchOptions,
) -> Result<Option<PatchSummary>, PatchError> {
    let stream = match image.patch_stream(&options.section) {
        Ok(stream) => stream,
        Err(PatchError::SectionNotFound(section)) => {
            warn!("no '{}' section in given PE image", section);
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    let normalized_sections = if options.normalize_virtual_sizes {
        image.normalize_virtual_sizes(&options.section)?
    } else {
        0
    };

    let mut patcher = Patcher::new(options.conflict_policy);
    let mut summary = patcher.run(image, &stream)?;
    summary.normalized_sections = normalized_sections;
    info!("applied {} patches ({} bytes)", summary.patches, summary.bytes);

    if options.reset_check_sum {
        image.set_check_sum(0)?;
    }
    Ok(Some(summary))
}

/// Set the virtual size of the named section.
///
/// # Returns
/// Returns the previous virtual size, or [`PatchError::SectionNotFound`] if the image has no such section.
pub fn set_section_virtual_size(
    image: &mut Image<'_>, section: &str, virtual_size: u32,
) -> Result<u32, PatchError> {
    let index = match image.section_by_name(section) {
        Some((index, _)) => index,
        None => return Err(PatchError::SectionNotFound(section.to_string())),
    };
    let previous = image.set_section_virtual_size(index, virtual_size)?;
    info!("{} section virtual size {:#x?} -> {:#x?}", section, previous, virtual_size);
    Ok(previous)
}
