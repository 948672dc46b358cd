//! Two-phase info queries: ask for the size, then fetch into a buffer of
//! that size. A failure at either phase is a [`KilnError::Query`].

use bytemuck::Pod;

use crate::error::{KilnError, Result};
use crate::runtime::Status;

pub(crate) fn read_bytes<F>(what: &str, mut query: F) -> Result<Vec<u8>>
where
    F: FnMut(Option<&mut [u8]>) -> std::result::Result<usize, Status>,
{
    let size = query(None).map_err(|status| KilnError::query(what, status))?;
    let mut buf = vec![0u8; size];
    let written = query(Some(&mut buf)).map_err(|status| KilnError::query(what, status))?;
    buf.truncate(written.min(size));
    Ok(buf)
}

/// String values come back NUL-terminated; everything from the first NUL
/// on is dropped.
pub(crate) fn read_string<F>(what: &str, query: F) -> Result<String>
where
    F: FnMut(Option<&mut [u8]>) -> std::result::Result<usize, Status>,
{
    let mut bytes = read_bytes(what, query)?;
    if let Some(nul) = bytes.iter().position(|&b| b == 0) {
        bytes.truncate(nul);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

pub(crate) fn read_pod<T: Pod, F>(what: &str, query: F) -> Result<T>
where
    F: FnMut(Option<&mut [u8]>) -> std::result::Result<usize, Status>,
{
    let bytes = read_bytes(what, query)?;
    let size = std::mem::size_of::<T>();
    if bytes.len() < size {
        return Err(KilnError::query(what, Status::INVALID_VALUE));
    }
    Ok(bytemuck::pod_read_unaligned(&bytes[..size]))
}

pub(crate) fn read_vec<T: Pod, F>(what: &str, query: F) -> Result<Vec<T>>
where
    F: FnMut(Option<&mut [u8]>) -> std::result::Result<usize, Status>,
{
    let bytes = read_bytes(what, query)?;
    Ok(bytes
        .chunks_exact(std::mem::size_of::<T>())
        .map(bytemuck::pod_read_unaligned)
        .collect())
}
