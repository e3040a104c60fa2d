use alloc::string::ToString;
use core::any::type_name;

use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::ReadError;

pub fn read<T: FromBytes + Copy>(data: &[u8]) -> Result<T, ReadError> {
    T::read_from_prefix(data)
        .map_err(|_| ReadError(type_name::<T>().to_string()))
        .map(|(value, _)| value)
}

/// Reads a `T` at `offset`, failing instead of panicking when the offset lies past the end of the data.
pub fn read_at<T: FromBytes + Copy>(data: &[u8], offset: u64) -> Result<T, ReadError> {
    let start = usize::try_from(offset).map_err(|_| ReadError(type_name::<T>().to_string()))?;
    match data.get(start..) {
        Some(data) => read::<T>(data),
        None => Err(ReadError(type_name::<T>().to_string())),
    }
}

/// Overwrites the bytes at `offset` with the in-memory representation of `value`.
pub fn write_at<T: IntoBytes + Immutable + ?Sized>(
    data: &mut [u8], offset: u64, value: &T,
) -> Result<(), ReadError> {
    write_bytes_at(data, offset, value.as_bytes())
}

pub fn write_bytes_at(data: &mut [u8], offset: u64, bytes: &[u8]) -> Result<(), ReadError> {
    let start = usize::try_from(offset).map_err(|_| ReadError("offset".to_string()))?;
    let end = start.checked_add(bytes.len()).ok_or_else(|| ReadError("offset".to_string()))?;
    match data.get_mut(start..end) {
        Some(target) => {
            target.copy_from_slice(bytes);
            Ok(())
        }
        None => Err(ReadError("write past end of image".to_string())),
    }
}
