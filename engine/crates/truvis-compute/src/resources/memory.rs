use std::{ptr::NonNull, rc::Rc};

use crate::{
    basic::align::{BUFFER_PLACEMENT_ALIGNMENT, align_up_pow2},
    commands::command_list::CommandList,
    error::{GfxError, GfxResult},
    foundation::gpu_device::{GpuDevice, ResourceDesc},
    resources::{
        allocation::{AllocationShape, GpuMemAllocation, MappedGpuMem, MappedGpuMemMut, MemoryKind},
        state::ResourceState,
        texture::TextureDesc,
    },
};

/// 按用途分配 GPU 内存
///
/// | 用途 | 放置 | 初始状态 |
/// |---|---|---|
/// | `allocate_buffer(rw = false)` | device-local | COMMON |
/// | `allocate_buffer(rw = true)` | device-local | UNORDERED_ACCESS |
/// | `allocate_upload` | upload | GENERIC_READ |
/// | `allocate_readback` | readback | COPY_DEST |
///
/// buffer 的大小总是向上对齐到 [`BUFFER_PLACEMENT_ALIGNMENT`]。
pub struct TypedMemoryAllocator<D: GpuDevice> {
    device: Rc<D>,
}

impl<D: GpuDevice> Clone for TypedMemoryAllocator<D> {
    fn clone(&self) -> Self {
        Self {
            device: self.device.clone(),
        }
    }
}

// 创建
impl<D: GpuDevice> TypedMemoryAllocator<D> {
    pub fn new(device: Rc<D>) -> Self {
        Self { device }
    }

    #[inline]
    pub fn device(&self) -> &Rc<D> {
        &self.device
    }
}

// 分配
impl<D: GpuDevice> TypedMemoryAllocator<D> {
    /// device-local buffer
    pub fn allocate_buffer(&self, size: u64, read_write: bool, debug_name: &str) -> GfxResult<GpuMemAllocation<D>> {
        let (kind, initial_state) = Self::device_kind(read_write);
        self.create_buffer(size, kind, initial_state, read_write, debug_name)
    }

    /// device-local 纹理；`desc.mip_count` 必须已经解析
    pub fn allocate_texture(
        &self,
        desc: &TextureDesc,
        read_write: bool,
        debug_name: &str,
    ) -> GfxResult<GpuMemAllocation<D>> {
        desc.validate()?;
        self.check_texture_support(desc, read_write)?;

        let (kind, initial_state) = Self::device_kind(read_write);
        let resource = self.device.create_committed_resource(
            kind.placement(),
            &ResourceDesc::Texture {
                desc: *desc,
                unordered_access: read_write,
            },
            initial_state,
            debug_name,
        )?;
        log::debug!(
            "allocated texture `{}`: {:?} {}x{}x{} mips={} {:?}",
            debug_name,
            desc.texture_type,
            desc.width,
            desc.height,
            desc.depth_or_array_size,
            desc.mip_count,
            kind
        );

        Ok(GpuMemAllocation {
            device: self.device.clone(),
            resource,
            kind,
            shape: AllocationShape::Texture(*desc),
            initial_state,
            debug_name: debug_name.to_string(),
        })
    }

    /// staging buffer，调用方需要保证其存活到 GPU 消费完成
    pub fn allocate_upload(&self, size: u64, debug_name: &str) -> GfxResult<GpuMemAllocation<D>> {
        self.create_buffer(size, MemoryKind::Upload, ResourceState::GENERIC_READ, false, debug_name)
    }

    pub fn allocate_readback(&self, size: u64, debug_name: &str) -> GfxResult<GpuMemAllocation<D>> {
        self.create_buffer(size, MemoryKind::Readback, ResourceState::COPY_DEST, false, debug_name)
    }

    /// 纹理的 readback：以紧密排列的 buffer 存放所有 mip
    pub fn allocate_readback_texture(&self, desc: &TextureDesc, debug_name: &str) -> GfxResult<GpuMemAllocation<D>> {
        desc.validate()?;
        self.check_texture_support(desc, false)?;

        let mut allocation =
            self.create_buffer(desc.packed_byte_size()?, MemoryKind::Readback, ResourceState::COPY_DEST, false, debug_name)?;
        let aligned_size = allocation.byte_size();
        allocation.shape = AllocationShape::LinearTexture {
            desc: *desc,
            aligned_size,
        };
        Ok(allocation)
    }

    fn create_buffer(
        &self,
        size: u64,
        kind: MemoryKind,
        initial_state: ResourceState,
        unordered_access: bool,
        debug_name: &str,
    ) -> GfxResult<GpuMemAllocation<D>> {
        if size == 0 {
            return Err(GfxError::ZeroSize);
        }
        let aligned_size = align_up_pow2(size, BUFFER_PLACEMENT_ALIGNMENT).ok_or_else(|| {
            GfxError::InvalidArgument(format!("buffer `{debug_name}` of {size} bytes overflows when aligned"))
        })?;

        let resource = self.device.create_committed_resource(
            kind.placement(),
            &ResourceDesc::Buffer {
                size: aligned_size,
                unordered_access,
            },
            initial_state,
            debug_name,
        )?;
        log::debug!("allocated buffer `{}`: {} bytes (requested {}) {:?}", debug_name, aligned_size, size, kind);

        Ok(GpuMemAllocation {
            device: self.device.clone(),
            resource,
            kind,
            shape: AllocationShape::Buffer {
                requested_size: size,
                aligned_size,
            },
            initial_state,
            debug_name: debug_name.to_string(),
        })
    }

    #[inline]
    fn device_kind(read_write: bool) -> (MemoryKind, ResourceState) {
        if read_write {
            (MemoryKind::DeviceReadWrite, ResourceState::UNORDERED_ACCESS)
        } else {
            (MemoryKind::DeviceReadOnly, ResourceState::COMMON)
        }
    }

    fn check_texture_support(&self, desc: &TextureDesc, read_write: bool) -> GfxResult<()> {
        if !self.device.check_format_support(desc.texture_type, desc.format, false) {
            return Err(GfxError::UnsupportedFormat {
                format: desc.format,
                texture_type: Some(desc.texture_type),
                usage: "texture",
            });
        }
        if read_write && !self.device.check_format_support(desc.texture_type, desc.format, true) {
            return Err(GfxError::UnsupportedFormat {
                format: desc.format,
                texture_type: Some(desc.texture_type),
                usage: "typed unordered access load/store",
            });
        }
        Ok(())
    }
}

// host 访问
impl<D: GpuDevice> TypedMemoryAllocator<D> {
    /// 只读映射；只有 upload / readback 内存可以 map
    pub fn map<'a>(&self, allocation: &'a GpuMemAllocation<D>) -> GfxResult<MappedGpuMem<'a, D>> {
        let (ptr, len) = self.map_raw(allocation)?;
        Ok(unsafe { MappedGpuMem::new(allocation, ptr, len) })
    }

    /// 可写映射，独占借用 `allocation`
    ///
    /// 同一块内存不能同时存在两个可写映射：
    ///
    /// ```compile_fail
    /// use std::rc::Rc;
    /// use truvis_compute::{backends::emulated::EmulatedDevice, resources::memory::TypedMemoryAllocator};
    ///
    /// let allocator = TypedMemoryAllocator::new(Rc::new(EmulatedDevice::new()));
    /// let mut upload = allocator.allocate_upload(16, "upload").unwrap();
    /// let mut a = allocator.map_mut(&mut upload).unwrap();
    /// let mut b = allocator.map_mut(&mut upload).unwrap();
    /// a.as_mut_slice()[0] = 1;
    /// b.as_mut_slice()[0] = 2;
    /// ```
    pub fn map_mut<'a>(&self, allocation: &'a mut GpuMemAllocation<D>) -> GfxResult<MappedGpuMemMut<'a, D>> {
        let (ptr, len) = self.map_raw(allocation)?;
        Ok(unsafe { MappedGpuMemMut::new(allocation, ptr, len) })
    }

    #[inline]
    pub fn unmap(&self, mapped: MappedGpuMem<'_, D>) {
        mapped.unmap();
    }

    fn map_raw(&self, allocation: &GpuMemAllocation<D>) -> GfxResult<(NonNull<u8>, usize)> {
        if !allocation.kind.is_host_visible() {
            return Err(GfxError::NotHostVisible {
                name: allocation.debug_name.clone(),
            });
        }
        let ptr = self.device.map(&allocation.resource)?;
        Ok((ptr, allocation.byte_size() as usize))
    }

    /// map，拷贝，unmap
    pub fn copy_to_gpu(&self, dst: &mut GpuMemAllocation<D>, src: &[u8]) -> GfxResult<()> {
        Self::check_copy_len(dst, src.len())?;
        let mut mapped = self.map_mut(dst)?;
        mapped.as_mut_slice()[..src.len()].copy_from_slice(src);
        Ok(())
    }

    pub fn copy_from_gpu(&self, dst: &mut [u8], src: &GpuMemAllocation<D>) -> GfxResult<()> {
        Self::check_copy_len(src, dst.len())?;
        let mapped = self.map(src)?;
        dst.copy_from_slice(&mapped.as_slice()[..dst.len()]);
        Ok(())
    }

    fn check_copy_len(allocation: &GpuMemAllocation<D>, len: usize) -> GfxResult<()> {
        if len == 0 {
            return Err(GfxError::ZeroSize);
        }
        if len as u64 > allocation.byte_size() {
            return Err(GfxError::CopyOutOfBounds {
                name: allocation.debug_name.clone(),
                requested: len as u64,
                available: allocation.byte_size(),
            });
        }
        Ok(())
    }
}

// 上传
impl<D: GpuDevice> TypedMemoryAllocator<D> {
    /// 分配与 `dst` 同样大小的 staging buffer，写入 `data`，并录制 staging -> `dst` 的拷贝
    ///
    /// 返回的 staging buffer 必须存活到这条拷贝命令完成，
    /// 可以交给 [`crate::commands::work_tracker::WorkCompletionTracker::retain_until_complete`] 托管。
    pub fn enqueue_upload(
        &self,
        list: &mut CommandList<D>,
        dst: &GpuMemAllocation<D>,
        data: &[u8],
    ) -> GfxResult<GpuMemAllocation<D>> {
        Self::check_copy_len(dst, data.len())?;

        let staging_size = match dst.shape {
            AllocationShape::Texture(desc) => desc.packed_byte_size()?,
            _ => dst.byte_size(),
        };
        let mut staging = self.allocate_upload(staging_size, &format!("{}-upload", dst.debug_name))?;
        self.copy_to_gpu(&mut staging, data)?;
        list.copy_resource(dst, &staging)?;

        Ok(staging)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backends::emulated::EmulatedDevice,
        resources::texture::{Format, TextureType},
    };

    fn allocator() -> TypedMemoryAllocator<EmulatedDevice> {
        TypedMemoryAllocator::new(Rc::new(EmulatedDevice::new()))
    }

    #[test]
    fn test_buffer_alignment() {
        let allocator = allocator();
        for size in [1, 4, 100, 255, 256] {
            let buffer = allocator.allocate_buffer(size, false, "small").unwrap();
            assert_eq!(buffer.aligned_size(), Some(256));
        }
        for size in [257, 300, 511, 512] {
            let buffer = allocator.allocate_buffer(size, true, "medium").unwrap();
            assert_eq!(buffer.aligned_size(), Some(512));
        }
    }

    #[test]
    fn test_zero_size_rejected() {
        let allocator = allocator();
        assert!(matches!(allocator.allocate_buffer(0, false, "zero"), Err(GfxError::ZeroSize)));
        assert!(matches!(allocator.allocate_upload(0, "zero"), Err(GfxError::ZeroSize)));
        assert!(matches!(allocator.allocate_readback(0, "zero"), Err(GfxError::ZeroSize)));
    }

    #[test]
    fn test_oversized_buffer_rejected() {
        let allocator = allocator();
        assert!(matches!(allocator.allocate_buffer(u64::MAX - 10, false, "huge"), Err(GfxError::InvalidArgument(_))));
        assert!(matches!(allocator.allocate_upload(u64::MAX, "huge"), Err(GfxError::InvalidArgument(_))));

        let huge = TextureDesc::new_2d(u32::MAX, u32::MAX, Format::R32G32B32A32Float);
        assert!(matches!(allocator.allocate_texture(&huge, false, "huge"), Err(GfxError::InvalidArgument(_))));
        assert!(matches!(allocator.allocate_readback_texture(&huge, "huge"), Err(GfxError::InvalidArgument(_))));
    }

    #[test]
    fn test_initial_states() {
        let allocator = allocator();
        let ro = allocator.allocate_buffer(16, false, "ro").unwrap();
        assert_eq!((ro.kind(), ro.initial_state()), (MemoryKind::DeviceReadOnly, ResourceState::COMMON));

        let rw = allocator.allocate_buffer(16, true, "rw").unwrap();
        assert_eq!((rw.kind(), rw.initial_state()), (MemoryKind::DeviceReadWrite, ResourceState::UNORDERED_ACCESS));

        let upload = allocator.allocate_upload(16, "upload").unwrap();
        assert_eq!(upload.initial_state(), ResourceState::GENERIC_READ);

        let readback = allocator.allocate_readback(16, "readback").unwrap();
        assert_eq!(readback.initial_state(), ResourceState::COPY_DEST);

        let texture = allocator.allocate_texture(&TextureDesc::new_2d(8, 8, Format::R32Float), true, "tex").unwrap();
        assert_eq!(texture.initial_state(), ResourceState::UNORDERED_ACCESS);
        assert_eq!(texture.texture_desc().map(|d| d.texture_type), Some(TextureType::Texture2D));
    }

    #[test]
    fn test_round_trip_copy() {
        let allocator = allocator();
        let data: Vec<u8> = (0..200u8).collect();

        let mut upload = allocator.allocate_upload(data.len() as u64, "upload").unwrap();
        allocator.copy_to_gpu(&mut upload, &data).unwrap();
        let mut out = vec![0u8; data.len()];
        allocator.copy_from_gpu(&mut out, &upload).unwrap();
        assert_eq!(out, data);

        // 比 data 更大的分配
        let mut readback = allocator.allocate_readback(1000, "readback").unwrap();
        allocator.copy_to_gpu(&mut readback, &data).unwrap();
        let mut out = vec![0u8; data.len()];
        allocator.copy_from_gpu(&mut out, &readback).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_copy_out_of_bounds() {
        let allocator = allocator();
        let mut upload = allocator.allocate_upload(10, "upload").unwrap();
        // 对齐之后是 256 字节，257 字节越界
        assert!(allocator.copy_to_gpu(&mut upload, &[0u8; 256]).is_ok());
        match allocator.copy_to_gpu(&mut upload, &[0u8; 257]) {
            Err(GfxError::CopyOutOfBounds { requested, available, .. }) => {
                assert_eq!((requested, available), (257, 256));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_map_device_local_rejected() {
        let allocator = allocator();
        let mut buffer = allocator.allocate_buffer(64, true, "device-local").unwrap();
        assert!(matches!(allocator.map(&buffer), Err(GfxError::NotHostVisible { .. })));
        assert!(matches!(allocator.map_mut(&mut buffer), Err(GfxError::NotHostVisible { .. })));
        assert!(matches!(allocator.copy_to_gpu(&mut buffer, &[1, 2, 3]), Err(GfxError::NotHostVisible { .. })));
    }

    #[test]
    fn test_scoped_mapping() {
        let allocator = allocator();
        let mut upload = allocator.allocate_upload(4, "upload").unwrap();
        {
            let mut mapped = allocator.map_mut(&mut upload).unwrap();
            assert_eq!(mapped.len(), 256);
            mapped.as_mut_slice()[..4].copy_from_slice(&7u32.to_le_bytes());
            // 可写映射同样可以读
            assert_eq!(&mapped.as_slice()[..4], &7u32.to_le_bytes());
        }

        // 只读映射可以同时存在多个，指向同一块内存
        let first = allocator.map(&upload).unwrap();
        let second = allocator.map(&upload).unwrap();
        assert_eq!(first.as_ptr(), second.as_ptr());
        assert_eq!(&first.as_slice()[..4], &7u32.to_le_bytes());
        assert_eq!(&second.as_slice()[..4], &7u32.to_le_bytes());
        allocator.unmap(first);
        second.unmap();

        // 所有映射释放之后可以再次写入
        allocator.copy_to_gpu(&mut upload, &9u32.to_le_bytes()).unwrap();
        let mut out = [0u8; 4];
        allocator.copy_from_gpu(&mut out, &upload).unwrap();
        assert_eq!(out, 9u32.to_le_bytes());
    }

    #[test]
    fn test_texture_preconditions() {
        let allocator = allocator();
        let unresolved = TextureDesc::new_2d(16, 16, Format::R32Float).mips(0);
        assert!(matches!(allocator.allocate_texture(&unresolved, false, "t"), Err(GfxError::UnresolvedMipChain)));

        let resolved = unresolved.with_resolved_mips();
        let texture = allocator.allocate_texture(&resolved, false, "t").unwrap();
        assert_eq!(texture.texture_desc().map(|d| d.mip_count), Some(5));
        assert_eq!(texture.byte_size(), resolved.packed_byte_size().unwrap());

        // emulated 设备不支持 R8G8B8A8Unorm 的 typed UAV
        let rgba = TextureDesc::new_2d(4, 4, Format::R8G8B8A8Unorm);
        assert!(allocator.allocate_texture(&rgba, false, "rgba").is_ok());
        assert!(matches!(allocator.allocate_texture(&rgba, true, "rgba"), Err(GfxError::UnsupportedFormat { .. })));
    }

    #[test]
    fn test_readback_texture_is_linear() {
        let allocator = allocator();
        let desc = TextureDesc::new_2d(8, 4, Format::R32Float).mips(2);
        let readback = allocator.allocate_readback_texture(&desc, "readback-tex").unwrap();
        assert!(readback.shape().is_linear());
        assert_eq!(readback.byte_size(), 256);
        assert_eq!(readback.initial_state(), ResourceState::COPY_DEST);
    }
}
