use std::rc::Rc;

use ash::vk;
use itertools::Itertools;

use crate::{
    backends::vulkan::{
        convert::{image_layout, state_mask},
        debug_messenger::DebugType,
        descriptor_heap::VulkanDescriptorHeap,
        device::DeviceFunctions,
        physical_device::QueueFamily,
        pipeline::VulkanPipeline,
        query::VulkanQueryHeap,
        resource::{VulkanResource, VulkanResourceKind, packed_copy_regions},
    },
    diagnostics::LiveToken,
    error::{GfxError, GfxResult, VkResultExt},
    foundation::gpu_device::QueueKind,
    resources::{state::ResourceTransition, texture::TextureDesc},
};

/// 独占一个 command pool 的 primary command buffer
///
/// 创建之后即处于录制状态
pub struct VulkanCommandList {
    command_buffer: vk::CommandBuffer,
    command_pool: vk::CommandPool,
    pub(crate) kind: QueueKind,
    /// 所属 queue family 的能力，transfer-only family 上部分 query 命令不可用
    queue_flags: vk::QueueFlags,
    closed: bool,

    device_functions: Rc<DeviceFunctions>,
    debug_name: String,
    _live: LiveToken,
}

impl DebugType for VulkanCommandList {
    fn debug_type_name() -> &'static str {
        "VulkanCommandList"
    }

    fn vk_handle(&self) -> impl vk::Handle {
        self.command_buffer
    }
}

// 创建与销毁
impl VulkanCommandList {
    pub fn new(
        device_functions: Rc<DeviceFunctions>,
        queue_family: &QueueFamily,
        kind: QueueKind,
        debug_name: &str,
        live: LiveToken,
    ) -> GfxResult<Self> {
        let pool_ci = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family.queue_family_index)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let command_pool =
            unsafe { device_functions.create_command_pool(&pool_ci, None).vk_op("create_command_pool")? };
        device_functions.set_object_debug_name(command_pool, format!("CommandPool::{}", debug_name));

        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer =
            match unsafe { device_functions.allocate_command_buffers(&allocate_info).vk_op("allocate_command_buffers") } {
                Ok(buffers) => buffers[0],
                Err(e) => {
                    unsafe { device_functions.destroy_command_pool(command_pool, None) };
                    return Err(e);
                }
            };

        let list = Self {
            command_buffer,
            command_pool,
            kind,
            queue_flags: queue_family.queue_flags,
            closed: false,
            device_functions,
            debug_name: debug_name.to_string(),
            _live: live,
        };
        list.device_functions.set_debug_name(&list, debug_name);
        list.begin()?;
        Ok(list)
    }

    fn begin(&self) -> GfxResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device_functions
                .begin_command_buffer(self.command_buffer, &begin_info)
                .vk_op("begin_command_buffer")
        }
    }
}

impl Drop for VulkanCommandList {
    fn drop(&mut self) {
        unsafe {
            // command buffer 随 pool 一起释放
            self.device_functions.destroy_command_pool(self.command_pool, None);
        }
    }
}

// getters
impl VulkanCommandList {
    #[inline]
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    #[inline]
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }
}

// 生命周期
impl VulkanCommandList {
    pub fn reset(&mut self) -> GfxResult<()> {
        unsafe {
            self.device_functions
                .reset_command_pool(self.command_pool, vk::CommandPoolResetFlags::empty())
                .vk_op("reset_command_pool")?;
        }
        self.closed = false;
        self.begin()
    }

    pub fn close(&mut self) -> GfxResult<()> {
        unsafe { self.device_functions.end_command_buffer(self.command_buffer).vk_op("end_command_buffer")? };
        self.closed = true;
        Ok(())
    }
}

// 拷贝
impl VulkanCommandList {
    /// buffer 与纹理之间按紧密排列的 subresource 顺序拷贝
    pub fn copy_resource(&mut self, dst: &VulkanResource, src: &VulkanResource) -> GfxResult<()> {
        match (&dst.kind, &src.kind) {
            (VulkanResourceKind::Buffer { .. }, VulkanResourceKind::Buffer { .. }) => {
                self.copy_buffer_region(dst, 0, src, 0, dst.size.min(src.size))
            }
            (VulkanResourceKind::Image { image, desc, .. }, VulkanResourceKind::Buffer { buffer, .. }) => {
                let layout = self.prepare_copy_layout(dst, true);
                let regions = packed_copy_regions(desc);
                unsafe {
                    self.device_functions.cmd_copy_buffer_to_image(self.command_buffer, *buffer, *image, layout, &regions);
                }
                Ok(())
            }
            (VulkanResourceKind::Buffer { buffer, .. }, VulkanResourceKind::Image { image, desc, .. }) => {
                let layout = self.prepare_copy_layout(src, false);
                let regions = packed_copy_regions(desc);
                unsafe {
                    self.device_functions.cmd_copy_image_to_buffer(self.command_buffer, *image, layout, *buffer, &regions);
                }
                Ok(())
            }
            (
                VulkanResourceKind::Image { image: dst_image, .. },
                VulkanResourceKind::Image {
                    image: src_image, desc, ..
                },
            ) => {
                let dst_layout = self.prepare_copy_layout(dst, true);
                let src_layout = self.prepare_copy_layout(src, false);
                let regions = Self::image_copy_regions(desc);
                unsafe {
                    self.device_functions.cmd_copy_image(
                        self.command_buffer,
                        *src_image,
                        src_layout,
                        *dst_image,
                        dst_layout,
                        &regions,
                    );
                }
                Ok(())
            }
        }
    }

    pub fn copy_buffer_region(
        &mut self,
        dst: &VulkanResource,
        dst_offset: u64,
        src: &VulkanResource,
        src_offset: u64,
        size: u64,
    ) -> GfxResult<()> {
        let dst_buffer = dst.expect_buffer("copy_buffer_region")?;
        let src_buffer = src.expect_buffer("copy_buffer_region")?;
        let region = vk::BufferCopy {
            src_offset,
            dst_offset,
            size,
        };
        unsafe {
            self.device_functions.cmd_copy_buffer(
                self.command_buffer,
                src_buffer,
                dst_buffer,
                std::slice::from_ref(&region),
            );
        }
        Ok(())
    }

    /// 纹理作为拷贝的一端时需要处于 GENERAL 或者对应的 TRANSFER layout，否则先切换到 GENERAL
    fn prepare_copy_layout(&mut self, resource: &VulkanResource, is_dst: bool) -> vk::ImageLayout {
        let VulkanResourceKind::Image { image, desc, layout } = &resource.kind else {
            return vk::ImageLayout::UNDEFINED;
        };

        let current = layout.get();
        let accepted = if is_dst { vk::ImageLayout::TRANSFER_DST_OPTIMAL } else { vk::ImageLayout::TRANSFER_SRC_OPTIMAL };
        if current == vk::ImageLayout::GENERAL || current == accepted {
            return current;
        }

        log::debug!("[{}] implicit layout transition of `{}`: {:?} -> GENERAL", self.debug_name, resource.debug_name, current);
        let barrier = vk::ImageMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags2::COPY)
            .dst_access_mask(vk::AccessFlags2::TRANSFER_READ | vk::AccessFlags2::TRANSFER_WRITE)
            .old_layout(current)
            .new_layout(vk::ImageLayout::GENERAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(*image)
            .subresource_range(Self::full_subresource_range(desc));
        unsafe {
            self.device_functions.cmd_pipeline_barrier2(
                self.command_buffer,
                &vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&barrier)),
            );
        }
        layout.set(vk::ImageLayout::GENERAL);
        vk::ImageLayout::GENERAL
    }

    fn image_copy_regions(desc: &TextureDesc) -> Vec<vk::ImageCopy> {
        (0..desc.mip_count)
            .map(|mip| {
                let (width, height, depth) = desc.mip_extent(mip);
                let subresource = vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: mip,
                    base_array_layer: 0,
                    layer_count: desc.array_layers(),
                };
                vk::ImageCopy {
                    src_subresource: subresource,
                    src_offset: vk::Offset3D::default(),
                    dst_subresource: subresource,
                    dst_offset: vk::Offset3D::default(),
                    extent: vk::Extent3D { width, height, depth },
                }
            })
            .collect_vec()
    }

    #[inline]
    fn full_subresource_range(desc: &TextureDesc) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: desc.mip_count,
            base_array_layer: 0,
            layer_count: desc.array_layers(),
        }
    }
}

// barrier
impl VulkanCommandList {
    /// 所有的切换合并为一次 vkCmdPipelineBarrier2
    pub fn resource_barrier(&mut self, barriers: &[(&VulkanResource, ResourceTransition)]) -> GfxResult<()> {
        let mut buffer_barriers = Vec::new();
        let mut image_barriers = Vec::new();

        for (resource, transition) in barriers {
            let src = state_mask(transition.before);
            let dst = state_mask(transition.after);
            match &resource.kind {
                VulkanResourceKind::Buffer { buffer, .. } => {
                    buffer_barriers.push(
                        vk::BufferMemoryBarrier2::default()
                            .src_stage_mask(src.stage)
                            .src_access_mask(src.access)
                            .dst_stage_mask(dst.stage)
                            .dst_access_mask(dst.access)
                            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                            .buffer(*buffer)
                            .offset(0)
                            .size(vk::WHOLE_SIZE),
                    );
                }
                VulkanResourceKind::Image { image, desc, layout } => {
                    let new_layout = image_layout(transition.after);
                    image_barriers.push(
                        vk::ImageMemoryBarrier2::default()
                            .src_stage_mask(src.stage)
                            .src_access_mask(src.access)
                            .dst_stage_mask(dst.stage)
                            .dst_access_mask(dst.access)
                            .old_layout(layout.get())
                            .new_layout(new_layout)
                            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                            .image(*image)
                            .subresource_range(Self::full_subresource_range(desc)),
                    );
                    layout.set(new_layout);
                }
            }
        }

        let dependency_info = vk::DependencyInfo::default()
            .buffer_memory_barriers(&buffer_barriers)
            .image_memory_barriers(&image_barriers);
        unsafe {
            self.device_functions.cmd_pipeline_barrier2(self.command_buffer, &dependency_info);
        }
        Ok(())
    }
}

// compute
impl VulkanCommandList {
    pub fn dispatch(
        &mut self,
        pipeline: &VulkanPipeline,
        heap: &VulkanDescriptorHeap,
        group_count: [u32; 3],
    ) -> GfxResult<()> {
        if self.kind != QueueKind::Compute {
            return Err(GfxError::InvalidArgument(format!("dispatch recorded into copy list `{}`", self.debug_name)));
        }
        let [x, y, z] = group_count;
        unsafe {
            self.device_functions.cmd_bind_pipeline(
                self.command_buffer,
                vk::PipelineBindPoint::COMPUTE,
                pipeline.handle(),
            );
            self.device_functions.cmd_bind_descriptor_sets(
                self.command_buffer,
                vk::PipelineBindPoint::COMPUTE,
                pipeline.layout(),
                0,
                std::slice::from_ref(&heap.descriptor_set()),
                &[],
            );
            self.device_functions.cmd_dispatch(self.command_buffer, x, y, z);
        }
        Ok(())
    }
}

// query
impl VulkanCommandList {
    #[inline]
    fn supports_query_commands(&self) -> bool {
        self.queue_flags.intersects(vk::QueueFlags::COMPUTE | vk::QueueFlags::GRAPHICS)
    }

    pub fn write_timestamp(&mut self, heap: &VulkanQueryHeap, index: u32) -> GfxResult<()> {
        heap.check_index(index)?;
        unsafe {
            // transfer-only queue 不支持 vkCmdResetQueryPool，此时依赖创建时的 host reset
            if self.supports_query_commands() {
                self.device_functions.cmd_reset_query_pool(self.command_buffer, heap.handle(), index, 1);
            }
            self.device_functions.cmd_write_timestamp2(
                self.command_buffer,
                vk::PipelineStageFlags2::ALL_COMMANDS,
                heap.handle(),
                index,
            );
        }
        Ok(())
    }

    pub fn resolve_timestamps(
        &mut self,
        heap: &VulkanQueryHeap,
        first: u32,
        count: u32,
        dst: &VulkanResource,
        dst_offset: u64,
    ) -> GfxResult<()> {
        heap.check_index(first + count - 1)?;
        if !self.supports_query_commands() {
            return Err(GfxError::InvalidArgument(format!(
                "`{}` is recorded for a transfer-only queue family, which cannot resolve timestamps",
                self.debug_name
            )));
        }
        let dst_buffer = dst.expect_buffer("resolve_timestamps")?;
        unsafe {
            self.device_functions.cmd_copy_query_pool_results(
                self.command_buffer,
                heap.handle(),
                first,
                count,
                dst_buffer,
                dst_offset,
                size_of::<u64>() as vk::DeviceSize,
                vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
            );
        }
        Ok(())
    }
}
