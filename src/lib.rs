//! **P**ortable **e**xecutable **patch**er.
//!
//! Applies a set of binary patches stored inside a section of a portable executable to the image itself.
//!
//! Supports:
//! * Parsing and introspection of portable executable headers and section tables
//! * Resolving virtual addresses to file offsets
//! * Applying patch records with bounds checking and detection of overlapping patches
//!
//! See [`patch_image`] for applying the patch section of a parsed [`Image`],
//! and `patch_file` for patching an image file in place.
//!
//! # Examples
//!
//! ### Applying the `.patch` section
//! ```
//! use pepatch::{patch_image, Image, PatchOptions};
//!
//! let data = std::fs::read(BINARY_PATH)?;
//!
//! // parse the executable image
//! let mut image = Image::parse(&data)?;
//!
//! // apply the records from the `.patch` section
//! if let Some(summary) = patch_image(&mut image, &PatchOptions::default())? {
//!     println!("applied {} patches ({} bytes)", summary.patches, summary.bytes);
//! }
//!
//! // the patched image, same size as the original
//! let target = image.data();
//! ```
//!
//! ### Applying individual patches
//! ```
//! use pepatch::{ConflictPolicy, Image, Patcher};
//!
//! let mut image = Image::parse(&data)?;
//! let mut patcher = Patcher::new(ConflictPolicy::Warn);
//!
//! patcher.apply(&mut image, 0x401000, &[0xde, 0xad, 0xbe, 0xef])?;
//! ```

#![cfg_attr(not(feature = "std"), no_std)]
#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg_hide))]
#![cfg_attr(docsrs, doc(cfg_hide(doc)))]

extern crate alloc;

pub(crate) mod errors;
#[cfg(feature = "std")]
pub(crate) mod file;
pub(crate) mod image;
pub(crate) mod patch;
pub(crate) mod util;

pub mod constants;
pub mod types;

#[cfg(feature = "std")]
pub use crate::file::*;
pub use crate::{errors::*, image::*, patch::*};
