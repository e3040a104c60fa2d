//! Patching images stored in files.

use std::{
    fs::{File, OpenOptions},
    io::{Error as IOError, ErrorKind, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use log::debug;

use crate::{errors::*, image::*, patch::*};

/// An image file opened for in-place modification.
///
/// The file stays open until the `PatchFile` is flushed or dropped.
/// Dropping without flushing leaves the file untouched.
#[derive(Debug)]
pub struct PatchFile {
    path:   PathBuf,
    file:   File,
    length: u64,
    image:  Image<'static>,
}

impl PatchFile {
    /// Open and read a portable executable image file.
    ///
    /// # Returns
    /// Returns an error if the file could not be opened for reading and writing,
    /// could not be read in full, or is not a valid portable executable image.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ImageReadError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let length = file.metadata()?.len();
        let image = Image::parse_reader(&mut file)?;
        if image.data().len() as u64 != length {
            return Err(IOError::new(
                ErrorKind::UnexpectedEof,
                format!("read {} of {} bytes", image.data().len(), length),
            )
            .into());
        }
        debug!("read {} ({} bytes)", path.display(), length);
        Ok(Self {
            path,
            file,
            length,
            image,
        })
    }

    pub fn path(&self) -> &Path { &self.path }

    pub fn image(&self) -> &Image<'static> { &self.image }

    pub fn image_mut(&mut self) -> &mut Image<'static> { &mut self.image }

    /// Write the image back over the file, starting at offset zero.
    ///
    /// # Returns
    /// Returns an error if the image length changed or the file could not be written.
    pub fn flush(mut self) -> Result<(), ImageWriteError> {
        let length = self.image.data().len() as u64;
        if length != self.length {
            return Err(ImageWriteError::SizeMismatch(length, self.length));
        }
        self.file.seek(SeekFrom::Start(0))?;
        self.image.write_writer(&mut self.file)?;
        self.file.flush()?;
        debug!("wrote {} ({} bytes)", self.path.display(), length);
        Ok(())
    }
}

fn path_string(path: &Path) -> String { path.display().to_string() }

/// Apply the patch records stored in a section of an image file and write the result back to the file.
///
/// The file is only written if all records were applied.
///
/// # Returns
/// Returns `None` without writing the file if the patch section does not exist,
/// otherwise the totals of the run.
pub fn patch_file<P: AsRef<Path>>(
    path: P, options: &PatchOptions,
) -> Result<Option<PatchSummary>, Error> {
    let path = path.as_ref();
    let mut file = PatchFile::open(path).map_err(|source| Error::Read {
        path: path_string(path),
        source,
    })?;
    let summary = patch_image(file.image_mut(), options).map_err(|source| Error::Patch {
        path: path_string(path),
        source,
    })?;
    if summary.is_some() {
        file.flush().map_err(|source| Error::Write {
            path: path_string(path),
            source,
        })?;
    }
    Ok(summary)
}

/// Set the virtual size of a section in an image file.
///
/// # Returns
/// Returns the previous virtual size.
pub fn set_section_virtual_size_file<P: AsRef<Path>>(
    path: P, section: &str, virtual_size: u32,
) -> Result<u32, Error> {
    let path = path.as_ref();
    let mut file = PatchFile::open(path).map_err(|source| Error::Read {
        path: path_string(path),
        source,
    })?;
    let previous = set_section_virtual_size(file.image_mut(), section, virtual_size).map_err(
        |source| Error::Patch {
            path: path_string(path),
            source,
        },
    )?;
    file.flush().map_err(|source| Error::Write {
        path: path_string(path),
        source,
    })?;
    Ok(previous)
}
