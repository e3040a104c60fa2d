//! Errors specific to reading, writing or patching a PE image.

use alloc::string::String;

#[cfg(feature = "std")]
use std::io::Error as IOError;

use crate::PatchRange;

/// Error that can occur when reading and parsing bytes.
#[derive(Debug)]
#[cfg_attr(feature = "std", derive(thiserror::Error))]
#[cfg_attr(feature = "std", error("{0}"))]
pub struct ReadError(pub String);

/// Errors that can occur when reading a PE image.
#[derive(Debug)]
#[cfg_attr(feature = "std", derive(thiserror::Error))]
pub enum ImageReadError {
    #[cfg_attr(feature = "std", error("invalid bytes: {0}"))]
    InvalidBytes(ReadError),
    #[cfg_attr(feature = "std", error("invalid header: {0}"))]
    InvalidHeader(String),
    #[cfg(feature = "std")]
    #[error("io error: {0}")]
    IOError(IOError),
}
impl From<ReadError> for ImageReadError {
    fn from(error: ReadError) -> Self { ImageReadError::InvalidBytes(error) }
}
#[cfg(feature = "std")]
impl From<IOError> for ImageReadError {
    fn from(error: IOError) -> Self { ImageReadError::IOError(error) }
}

/// Errors that can occur when writing a PE image.
#[derive(Debug)]
#[cfg_attr(feature = "std", derive(thiserror::Error))]
pub enum ImageWriteError {
    #[cfg_attr(feature = "std", error("section points outside image: {0} > {1}"))]
    InvalidSectionRange(u64, u64),
    #[cfg_attr(feature = "std", error("invalid bytes: {0}"))]
    InvalidBytes(ReadError),
    #[cfg_attr(feature = "std", error("image size changed: {0} != {1}"))]
    SizeMismatch(u64, u64),
    #[cfg(feature = "std")]
    #[error("io error: {0}")]
    IOError(IOError),
}
impl From<ReadError> for ImageWriteError {
    fn from(error: ReadError) -> Self { ImageWriteError::InvalidBytes(error) }
}
#[cfg(feature = "std")]
impl From<IOError> for ImageWriteError {
    fn from(error: IOError) -> Self { ImageWriteError::IOError(error) }
}

/// Errors that can occur when applying patch records to an image.
#[derive(Debug)]
#[cfg_attr(feature = "std", derive(thiserror::Error))]
pub enum PatchError {
    #[cfg_attr(feature = "std", error("no '{0}' section in image"))]
    SectionNotFound(String),
    #[cfg_attr(feature = "std", error("memory address {0:08X} not found in image"))]
    AddressNotFound(u32),
    #[cfg_attr(feature = "std", error("patch '{address:08X}' is too long ({length} bytes)"))]
    PatchTooLong { address: u32, length: u32 },
    #[cfg_attr(feature = "std", error("truncated patch record at stream offset {offset:#x}"))]
    TruncatedPatch { offset: usize },
    #[cfg_attr(feature = "std", error("conflicting patches: {first} and {second}"))]
    ConflictingPatch { first: PatchRange, second: PatchRange },
    #[cfg_attr(feature = "std", error("invalid image: {0}"))]
    InvalidImage(ImageWriteError),
}
impl From<ImageWriteError> for PatchError {
    fn from(error: ImageWriteError) -> Self { PatchError::InvalidImage(error) }
}
impl From<ReadError> for PatchError {
    fn from(error: ReadError) -> Self { PatchError::InvalidImage(error.into()) }
}

/// Any error surfaced while patching an image file on disk.
#[cfg(feature = "std")]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{path}: {source}")]
    Read { path: String, source: ImageReadError },
    #[error("{path}: {source}")]
    Write { path: String, source: ImageWriteError },
    #[error("{path}: {source}")]
    Patch { path: String, source: PatchError },
}
