use std::marker::PhantomData;
use std::mem::size_of;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytemuck::Pod;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemAccess {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl MemAccess {
    /// Whether device code may write through this buffer.
    pub fn kernel_writable(&self) -> bool {
        !matches!(self, MemAccess::ReadOnly)
    }
}

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(0);

struct BufferInner {
    id: u64,
    size: usize,
    access: MemAccess,
    // u64 words keep every Pod element type we hand out aligned.
    words: RwLock<Vec<u64>>,
}

/// Fixed-size device memory region. Clones alias the same storage.
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
}

impl Buffer {
    pub(crate) fn new(access: MemAccess, size: usize) -> Self {
        let words = vec![0u64; size.div_ceil(8)];
        Self {
            inner: Arc::new(BufferInner {
                id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
                size,
                access,
                words: RwLock::new(words),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn access(&self) -> MemAccess {
        self.inner.access
    }

    /// Number of whole `T` elements the buffer holds.
    pub fn len_of<T: Pod>(&self) -> Result<usize> {
        element_count::<T>(self.inner.size)
    }

    pub fn read<T: Pod>(&self) -> Result<BufferRead<'_, T>> {
        let len = self.len_of::<T>()?;
        let guard = self.inner.words.read()?;
        Ok(BufferRead {
            guard,
            len,
            _element: PhantomData,
        })
    }

    pub fn write<T: Pod>(&self) -> Result<BufferWrite<'_, T>> {
        let len = self.len_of::<T>()?;
        let guard = self.inner.words.write()?;
        Ok(BufferWrite {
            guard,
            len,
            _element: PhantomData,
        })
    }

    pub(crate) fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.inner.size {
            return Err(Error::DeviceRuntime(format!(
                "write of {} bytes overflows buffer of {} bytes",
                bytes.len(),
                self.inner.size
            )));
        }
        let mut guard = self.inner.words.write()?;
        let storage: &mut [u8] = bytemuck::cast_slice_mut(guard.as_mut_slice());
        storage[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub(crate) fn copy_from(&self, source: &Buffer) -> Result<()> {
        if Arc::ptr_eq(&self.inner, &source.inner) {
            return Ok(());
        }
        if source.size() > self.size() {
            return Err(Error::DeviceRuntime(format!(
                "copy of {} bytes overflows buffer of {} bytes",
                source.size(),
                self.size()
            )));
        }
        let src = source.inner.words.read()?;
        let mut dst = self.inner.words.write()?;
        let src_bytes: &[u8] = bytemuck::cast_slice(src.as_slice());
        let dst_bytes: &mut [u8] = bytemuck::cast_slice_mut(dst.as_mut_slice());
        dst_bytes[..source.size()].copy_from_slice(&src_bytes[..source.size()]);
        Ok(())
    }

    pub fn same_storage(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.inner.id)
            .field("size", &self.inner.size)
            .field("access", &self.inner.access)
            .finish()
    }
}

fn element_count<T: Pod>(size: usize) -> Result<usize> {
    let element = size_of::<T>();
    if element == 0 || size % element != 0 || std::mem::align_of::<T>() > 8 {
        return Err(Error::DeviceRuntime(format!(
            "buffer of {} bytes is not a whole number of {}",
            size,
            std::any::type_name::<T>()
        )));
    }
    Ok(size / element)
}

pub struct BufferRead<'a, T> {
    guard: RwLockReadGuard<'a, Vec<u64>>,
    len: usize,
    _element: PhantomData<T>,
}

impl<T: Pod> Deref for BufferRead<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        let bytes: &[u8] = bytemuck::cast_slice(self.guard.as_slice());
        bytemuck::cast_slice(&bytes[..self.len * size_of::<T>()])
    }
}

pub struct BufferWrite<'a, T> {
    guard: RwLockWriteGuard<'a, Vec<u64>>,
    len: usize,
    _element: PhantomData<T>,
}

impl<T: Pod> Deref for BufferWrite<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        let bytes: &[u8] = bytemuck::cast_slice(self.guard.as_slice());
        bytemuck::cast_slice(&bytes[..self.len * size_of::<T>()])
    }
}

impl<T: Pod> DerefMut for BufferWrite<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        let len = self.len * size_of::<T>();
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(self.guard.as_mut_slice());
        bytemuck::cast_slice_mut(&mut bytes[..len])
    }
}

#[cfg(test)]
mod test {
    use crate::point::Point;

    use super::*;

    #[test]
    fn typed_views_share_storage() {
        let buffer = Buffer::new(MemAccess::ReadWrite, 3 * size_of::<Point>());
        {
            let mut points = buffer.write::<Point>().unwrap();
            points[1] = Point::new(1.0, 2.0, 3.0);
        }
        let floats = buffer.read::<f32>().unwrap();
        assert_eq!(floats.len(), 9);
        assert_eq!(&floats[3..6], &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn mismatched_element_size_is_rejected() {
        let buffer = Buffer::new(MemAccess::ReadOnly, 10);
        assert!(matches!(
            buffer.read::<f64>(),
            Err(Error::DeviceRuntime(_))
        ));
        assert_eq!(buffer.len_of::<u8>().unwrap(), 10);
    }

    #[test]
    fn copy_and_overflow() {
        let small = Buffer::new(MemAccess::ReadWrite, 8);
        let large = Buffer::new(MemAccess::ReadWrite, 16);
        small.write_bytes(&1.5f64.to_ne_bytes()).unwrap();
        large.copy_from(&small).unwrap();
        assert_eq!(large.read::<f64>().unwrap()[0], 1.5);
        assert!(small.copy_from(&large).is_err());
        assert!(small.write_bytes(&[0u8; 9]).is_err());
    }
}
