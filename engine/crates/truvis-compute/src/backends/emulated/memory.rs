use std::ptr::NonNull;

use crate::error::{GfxError, GfxResult};

/// 一块零初始化的 host 内存，模拟 GPU 资源的存储
///
/// host 端通过 map 得到的指针与执行线程同时访问同一块内存，
/// 两者之间的先后顺序由 fence 保证，这里不做同步。
pub(crate) struct HostBlock {
    ptr: NonNull<u8>,
    len: usize,
}

unsafe impl Send for HostBlock {}
unsafe impl Sync for HostBlock {}

impl HostBlock {
    pub fn new(len: usize) -> Self {
        let boxed = vec![0u8; len].into_boxed_slice();
        let ptr = Box::into_raw(boxed) as *mut u8;
        Self {
            // Box 的指针不会为空
            ptr: NonNull::new(ptr).unwrap_or(NonNull::dangling()),
            len,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    fn check_range(&self, offset: usize, len: usize) -> GfxResult<()> {
        if offset.checked_add(len).is_none_or(|end| end > self.len) {
            return Err(GfxError::Device(format!(
                "access [{offset}, {offset}+{len}) out of block of {} bytes",
                self.len
            )));
        }
        Ok(())
    }

    pub fn read(&self, offset: usize, dst: &mut [u8]) -> GfxResult<()> {
        self.check_range(offset, dst.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    pub fn write(&self, offset: usize, src: &[u8]) -> GfxResult<()> {
        self.check_range(offset, src.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.as_ptr().add(offset), src.len());
        }
        Ok(())
    }

    /// 两个 block 之间的拷贝，允许是同一个 block
    pub fn copy_from(&self, dst_offset: usize, src: &HostBlock, src_offset: usize, len: usize) -> GfxResult<()> {
        self.check_range(dst_offset, len)?;
        src.check_range(src_offset, len)?;
        unsafe {
            std::ptr::copy(src.ptr.as_ptr().add(src_offset), self.ptr.as_ptr().add(dst_offset), len);
        }
        Ok(())
    }
}

impl Drop for HostBlock {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write() {
        let block = HostBlock::new(16);
        block.write(4, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 6];
        block.read(3, &mut out).unwrap();
        assert_eq!(out, [0, 1, 2, 3, 4, 0]);
        assert!(block.write(14, &[0; 3]).is_err());
        assert!(block.read(usize::MAX, &mut out).is_err());
    }

    #[test]
    fn test_overlapping_copy() {
        let block = HostBlock::new(8);
        block.write(0, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        block.copy_from(2, &block, 0, 4).unwrap();
        let mut out = [0u8; 8];
        block.read(0, &mut out).unwrap();
        assert_eq!(out, [1, 2, 1, 2, 3, 4, 7, 8]);
    }
}
