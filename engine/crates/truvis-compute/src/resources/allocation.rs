use std::{ptr::NonNull, rc::Rc};

use crate::{
    foundation::gpu_device::{GpuDevice, HeapPlacement},
    resources::{state::ResourceState, texture::TextureDesc},
};

/// 分配的用途，决定了放置位置与初始状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    /// CPU 可写、GPU 可读的临时 staging 内存
    Upload,
    DeviceReadOnly,
    /// 可以作为 unordered access 使用
    DeviceReadWrite,
    /// GPU 可写、CPU 同步之后可读
    Readback,
}

impl MemoryKind {
    #[inline]
    pub fn placement(self) -> HeapPlacement {
        match self {
            MemoryKind::Upload => HeapPlacement::Upload,
            MemoryKind::DeviceReadOnly | MemoryKind::DeviceReadWrite => HeapPlacement::DeviceLocal,
            MemoryKind::Readback => HeapPlacement::Readback,
        }
    }

    #[inline]
    pub fn is_host_visible(self) -> bool {
        self.placement().is_host_visible()
    }
}

/// 分配记录的形状
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationShape {
    /// `aligned_size` 是实际分配的大小，view 与拷贝都以它为准
    Buffer { requested_size: u64, aligned_size: u64 },
    Texture(TextureDesc),
    /// 以紧密排列的 buffer 存放的纹理数据（readback 纹理）
    LinearTexture { desc: TextureDesc, aligned_size: u64 },
}

impl AllocationShape {
    /// 是否以线性 buffer 作为底层资源
    #[inline]
    pub fn is_linear(&self) -> bool {
        !matches!(self, AllocationShape::Texture(_))
    }

    #[inline]
    pub fn texture_desc(&self) -> Option<&TextureDesc> {
        match self {
            AllocationShape::Buffer { .. } => None,
            AllocationShape::Texture(desc) | AllocationShape::LinearTexture { desc, .. } => Some(desc),
        }
    }
}

/// 一块 GPU 内存，独占底层资源
///
/// 由调用方独占，分配器在返回之后不再持有任何引用。
/// drop 时释放底层资源；如果 GPU 仍在使用该资源，需要先通过
/// [`crate::commands::work_tracker::WorkCompletionTracker`] 等待完成。
pub struct GpuMemAllocation<D: GpuDevice> {
    pub(crate) device: Rc<D>,
    pub(crate) resource: D::Resource,
    pub(crate) kind: MemoryKind,
    pub(crate) shape: AllocationShape,
    pub(crate) initial_state: ResourceState,
    pub(crate) debug_name: String,
}

// getters
impl<D: GpuDevice> GpuMemAllocation<D> {
    #[inline]
    pub fn resource(&self) -> &D::Resource {
        &self.resource
    }

    #[inline]
    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    #[inline]
    pub fn shape(&self) -> &AllocationShape {
        &self.shape
    }

    /// buffer 对齐之后的大小；纹理返回 None
    #[inline]
    pub fn aligned_size(&self) -> Option<u64> {
        match self.shape {
            AllocationShape::Buffer { aligned_size, .. } | AllocationShape::LinearTexture { aligned_size, .. } => {
                Some(aligned_size)
            }
            AllocationShape::Texture(_) => None,
        }
    }

    #[inline]
    pub fn texture_desc(&self) -> Option<&TextureDesc> {
        self.shape.texture_desc()
    }

    #[inline]
    pub fn is_buffer(&self) -> bool {
        matches!(self.shape, AllocationShape::Buffer { .. })
    }

    /// 可以通过 map 访问、以及作为拷贝边界的字节数
    pub fn byte_size(&self) -> u64 {
        self.aligned_size().unwrap_or_else(|| self.device.resource_byte_size(&self.resource))
    }

    #[inline]
    pub fn initial_state(&self) -> ResourceState {
        self.initial_state
    }

    #[inline]
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    #[inline]
    pub fn gpu_virtual_address(&self) -> u64 {
        self.device.gpu_virtual_address(&self.resource)
    }
}

impl<D: GpuDevice> std::fmt::Debug for GpuMemAllocation<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuMemAllocation")
            .field("name", &self.debug_name)
            .field("kind", &self.kind)
            .field("shape", &self.shape)
            .field("initial_state", &self.initial_state)
            .finish()
    }
}

/// map 期间的只读 host 地址，drop 时 unmap
///
/// 同一块内存可以同时存在多个只读映射
pub struct MappedGpuMem<'a, D: GpuDevice> {
    allocation: &'a GpuMemAllocation<D>,
    ptr: NonNull<u8>,
    len: usize,
}

impl<'a, D: GpuDevice> MappedGpuMem<'a, D> {
    /// # Safety
    /// `ptr` 必须是 `allocation` 的 map 结果，并且至少有 `len` 字节可读写
    pub(crate) unsafe fn new(allocation: &'a GpuMemAllocation<D>, ptr: NonNull<u8>, len: usize) -> Self {
        Self { allocation, ptr, len }
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    #[inline]
    pub fn unmap(self) {
        // 通过 drop 触发
    }
}

impl<D: GpuDevice> Drop for MappedGpuMem<'_, D> {
    fn drop(&mut self) {
        self.allocation.device.unmap(&self.allocation.resource);
    }
}

/// map 期间可写的 host 地址，drop 时 unmap
///
/// 构造时借用 `&mut GpuMemAllocation`，存活期间不会有其他映射指向同一块内存
pub struct MappedGpuMemMut<'a, D: GpuDevice> {
    mapped: MappedGpuMem<'a, D>,
}

impl<'a, D: GpuDevice> MappedGpuMemMut<'a, D> {
    /// # Safety
    /// 与 [`MappedGpuMem::new`] 相同
    pub(crate) unsafe fn new(allocation: &'a mut GpuMemAllocation<D>, ptr: NonNull<u8>, len: usize) -> Self {
        Self {
            mapped: unsafe { MappedGpuMem::new(allocation, ptr, len) },
        }
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.mapped.ptr.as_ptr()
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.mapped.ptr.as_ptr(), self.mapped.len) }
    }

    #[inline]
    pub fn unmap(self) {}
}

impl<'a, D: GpuDevice> std::ops::Deref for MappedGpuMemMut<'a, D> {
    type Target = MappedGpuMem<'a, D>;
    fn deref(&self) -> &Self::Target {
        &self.mapped
    }
}
