use std::{
    cell::{Cell, RefCell},
    ptr::NonNull,
    rc::Rc,
};

use ash::vk;
use itertools::Itertools;
use vk_mem::Alloc;

use crate::{
    backends::vulkan::{
        convert::{vk_format, vk_image_type},
        device::DeviceFunctions,
        mem_allocator::MemAllocator,
    },
    diagnostics::LiveToken,
    error::{GfxError, GfxResult, VkResultExt},
    foundation::gpu_device::{HeapPlacement, ResourceDesc},
    resources::texture::TextureDesc,
};

pub enum VulkanResourceKind {
    Buffer {
        buffer: vk::Buffer,
        device_addr: vk::DeviceAddress,
    },
    Image {
        image: vk::Image,
        desc: TextureDesc,
        /// 录制时追踪的 layout
        layout: Cell<vk::ImageLayout>,
    },
}

/// 一个 committed resource：buffer 或 image，以及独占的 vma allocation
pub struct VulkanResource {
    pub(crate) kind: VulkanResourceKind,
    /// buffer 的大小，或纹理紧密排列时的大小
    pub(crate) size: u64,
    pub(crate) placement: HeapPlacement,
    pub(crate) debug_name: String,

    allocation: RefCell<vk_mem::Allocation>,
    allocator: Rc<MemAllocator>,
    _live: LiveToken,
}

// 创建与销毁
impl VulkanResource {
    pub fn new(
        device_functions: &DeviceFunctions,
        allocator: Rc<MemAllocator>,
        queue_family_indices: &[u32],
        placement: HeapPlacement,
        desc: &ResourceDesc,
        debug_name: &str,
        live: LiveToken,
    ) -> GfxResult<Self> {
        let alloc_ci = Self::allocation_ci(placement);
        let sharing_mode =
            if queue_family_indices.len() > 1 { vk::SharingMode::CONCURRENT } else { vk::SharingMode::EXCLUSIVE };

        let (kind, size, allocation) = match desc {
            ResourceDesc::Buffer { size, .. } => {
                let buffer_ci = vk::BufferCreateInfo::default()
                    .size(*size)
                    .usage(Self::buffer_usage())
                    .sharing_mode(sharing_mode)
                    .queue_family_indices(queue_family_indices);
                let (buffer, allocation) =
                    unsafe { allocator.create_buffer(&buffer_ci, &alloc_ci).vk_op("vmaCreateBuffer")? };
                device_functions.set_object_debug_name(buffer, format!("Buffer::{}", debug_name));
                let device_addr = unsafe {
                    device_functions.get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(buffer))
                };

                (VulkanResourceKind::Buffer { buffer, device_addr }, *size, allocation)
            }
            ResourceDesc::Texture {
                desc,
                unordered_access,
            } => {
                let size = desc.packed_byte_size()?;
                let mut usage =
                    vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED;
                if *unordered_access {
                    usage |= vk::ImageUsageFlags::STORAGE;
                }
                let (width, height, depth) = desc.mip_extent(0);
                let image_ci = vk::ImageCreateInfo::default()
                    .image_type(vk_image_type(desc.texture_type))
                    .format(vk_format(desc.format))
                    .extent(vk::Extent3D { width, height, depth })
                    .mip_levels(desc.mip_count)
                    .array_layers(desc.array_layers())
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .tiling(vk::ImageTiling::OPTIMAL)
                    .usage(usage)
                    .sharing_mode(sharing_mode)
                    .queue_family_indices(queue_family_indices)
                    .initial_layout(vk::ImageLayout::UNDEFINED);
                let (image, allocation) =
                    unsafe { allocator.create_image(&image_ci, &alloc_ci).vk_op("vmaCreateImage")? };
                device_functions.set_object_debug_name(image, format!("Image::{}", debug_name));

                let kind = VulkanResourceKind::Image {
                    image,
                    desc: *desc,
                    layout: Cell::new(vk::ImageLayout::UNDEFINED),
                };
                (kind, size, allocation)
            }
        };

        Ok(Self {
            kind,
            size,
            placement,
            debug_name: debug_name.to_string(),
            allocation: RefCell::new(allocation),
            allocator,
            _live: live,
        })
    }

    /// 所有 buffer 都可以作为拷贝的两端，以及任意种类的 buffer view
    #[inline]
    fn buffer_usage() -> vk::BufferUsageFlags {
        vk::BufferUsageFlags::TRANSFER_SRC
            | vk::BufferUsageFlags::TRANSFER_DST
            | vk::BufferUsageFlags::UNIFORM_BUFFER
            | vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER
            | vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
    }

    fn allocation_ci(placement: HeapPlacement) -> vk_mem::AllocationCreateInfo {
        match placement {
            HeapPlacement::DeviceLocal => vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferDevice,
                ..Default::default()
            },
            HeapPlacement::Upload => vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferHost,
                flags: vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
                ..Default::default()
            },
            HeapPlacement::Readback => vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferHost,
                flags: vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM,
                ..Default::default()
            },
        }
    }
}

impl Drop for VulkanResource {
    fn drop(&mut self) {
        let allocation = self.allocation.get_mut();
        unsafe {
            match &self.kind {
                VulkanResourceKind::Buffer { buffer, .. } => self.allocator.destroy_buffer(*buffer, allocation),
                VulkanResourceKind::Image { image, .. } => self.allocator.destroy_image(*image, allocation),
            }
        }
    }
}

// getters
impl VulkanResource {
    #[inline]
    pub fn buffer(&self) -> Option<vk::Buffer> {
        match &self.kind {
            VulkanResourceKind::Buffer { buffer, .. } => Some(*buffer),
            VulkanResourceKind::Image { .. } => None,
        }
    }

    #[inline]
    pub fn device_addr(&self) -> vk::DeviceAddress {
        match &self.kind {
            VulkanResourceKind::Buffer { device_addr, .. } => *device_addr,
            VulkanResourceKind::Image { .. } => 0,
        }
    }

    pub(crate) fn expect_buffer(&self, op: &str) -> GfxResult<vk::Buffer> {
        self.buffer()
            .ok_or_else(|| GfxError::InvalidArgument(format!("`{op}` requires `{}` to be a buffer", self.debug_name)))
    }
}

// host 访问
impl VulkanResource {
    /// readback 内存在 map 之后 invalidate，保证读到 GPU 的写入
    pub fn map(&self) -> GfxResult<NonNull<u8>> {
        if !self.placement.is_host_visible() {
            return Err(GfxError::NotHostVisible {
                name: self.debug_name.clone(),
            });
        }

        let mut allocation = self.allocation.borrow_mut();
        let ptr = unsafe { self.allocator.map_memory(&mut allocation).vk_op("vmaMapMemory")? };
        if self.placement == HeapPlacement::Readback {
            self.allocator.invalidate_allocation(&allocation, 0, vk::WHOLE_SIZE).vk_op("vmaInvalidateAllocation")?;
        }
        NonNull::new(ptr)
            .ok_or_else(|| GfxError::Device(format!("vmaMapMemory returned null for `{}`", self.debug_name)))
    }

    /// upload 内存在 unmap 之前 flush，保证 GPU 读到 host 的写入
    pub fn unmap(&self) {
        let mut allocation = self.allocation.borrow_mut();
        if self.placement == HeapPlacement::Upload
            && let Err(e) = self.allocator.flush_allocation(&allocation, 0, vk::WHOLE_SIZE)
        {
            log::error!("failed to flush `{}`: {:?}", self.debug_name, e);
        }
        unsafe {
            self.allocator.unmap_memory(&mut allocation);
        }
    }
}

/// 紧密排列的 buffer 与纹理之间的拷贝区域
///
/// 排列顺序：array layer 在外，mip 在内，每个 subresource 紧密排列
pub fn packed_copy_regions(desc: &TextureDesc) -> Vec<vk::BufferImageCopy> {
    let texel = desc.format.byte_size() as u64;
    let mut offset = 0;
    (0..desc.array_layers())
        .cartesian_product(0..desc.mip_count)
        .map(|(layer, mip)| {
            let (width, height, depth) = desc.mip_extent(mip);
            let region = vk::BufferImageCopy {
                buffer_offset: offset,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: mip,
                    base_array_layer: layer,
                    layer_count: 1,
                },
                image_offset: vk::Offset3D::default(),
                image_extent: vk::Extent3D { width, height, depth },
            };
            offset += width as u64 * height as u64 * depth as u64 * texel;
            region
        })
        .collect_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::texture::Format;

    #[test]
    fn test_packed_copy_regions() {
        let mut desc = TextureDesc::new_2d(8, 4, Format::R32Float).mips(3);
        desc.depth_or_array_size = 2;
        let regions = packed_copy_regions(&desc);
        assert_eq!(regions.len(), 6);

        // layer 0: 8x4, 4x2, 2x1
        assert_eq!(regions[0].buffer_offset, 0);
        assert_eq!(regions[1].buffer_offset, 128);
        assert_eq!(regions[2].buffer_offset, 160);
        assert_eq!(regions[2].image_extent, vk::Extent3D { width: 2, height: 1, depth: 1 });
        // layer 1 紧接在 layer 0 之后
        assert_eq!(regions[3].buffer_offset, 168);
        assert_eq!(regions[3].image_subresource.base_array_layer, 1);

        let last = regions.last().map(|r| r.buffer_offset + 8);
        assert_eq!(last, Some(desc.packed_byte_size().unwrap()));
    }
}
