use std::{cell::RefCell, rc::Rc};

use ash::vk;

use crate::{
    backends::vulkan::{
        convert::vk_format,
        debug_messenger::DebugType,
        device::DeviceFunctions,
        resource::VulkanResource,
    },
    diagnostics::LiveToken,
    error::{GfxError, GfxResult, VkResultExt},
    foundation::gpu_device::{BufferViewDesc, ViewDesc},
};

/// 每一种 view 对应一个 binding，每个 binding 都有 `capacity` 个元素
///
/// 同一个槽位在四个 binding 中共用同一个下标，shader 中按 view 的种类选择 binding：
/// ```glsl
/// layout(set = 0, binding = 0) uniform Constants { ... } u_constants[];
/// layout(set = 0, binding = 1) uniform samplerBuffer u_typed_srv[];
/// layout(set = 0, binding = 2, r32f) uniform imageBuffer u_typed_uav[];
/// layout(set = 0, binding = 3) buffer Storage { uint data[]; } u_storage[];
/// ```
pub mod binding {
    pub const CONSTANT: u32 = 0;
    pub const TYPED_SRV: u32 = 1;
    pub const TYPED_UAV: u32 = 2;
    pub const STORAGE: u32 = 3;
}

/// shader 可见的描述符堆：一个 descriptor set，以及它独占的 pool 与 layout
pub struct VulkanDescriptorHeap {
    descriptor_set: vk::DescriptorSet,
    set_layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    capacity: u32,

    /// typed view 创建的 buffer view，随 heap 一起销毁
    buffer_views: RefCell<Vec<vk::BufferView>>,

    device_functions: Rc<DeviceFunctions>,
    _live: LiveToken,
}

impl DebugType for VulkanDescriptorHeap {
    fn debug_type_name() -> &'static str {
        "VulkanDescriptorHeap"
    }

    fn vk_handle(&self) -> impl vk::Handle {
        self.descriptor_set
    }
}

// 创建与销毁
impl VulkanDescriptorHeap {
    pub fn new(
        device_functions: Rc<DeviceFunctions>,
        capacity: u32,
        debug_name: &str,
        live: LiveToken,
    ) -> GfxResult<Self> {
        if capacity == 0 {
            return Err(GfxError::InvalidArgument("descriptor heap capacity must be greater than zero".to_string()));
        }

        let set_layout = Self::create_set_layout(&device_functions, capacity)?;
        device_functions.set_object_debug_name(set_layout, format!("DescriptorSetLayout::{}", debug_name));

        let pool_sizes = Self::binding_types()
            .map(|(_, ty)| vk::DescriptorPoolSize {
                ty,
                descriptor_count: capacity,
            })
            .collect::<Vec<_>>();
        let pool_ci = vk::DescriptorPoolCreateInfo::default().max_sets(1).pool_sizes(&pool_sizes);
        let pool = match unsafe { device_functions.create_descriptor_pool(&pool_ci, None).vk_op("create_descriptor_pool") } {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { device_functions.destroy_descriptor_set_layout(set_layout, None) };
                return Err(e);
            }
        };
        device_functions.set_object_debug_name(pool, format!("DescriptorPool::{}", debug_name));

        let alloc_info =
            vk::DescriptorSetAllocateInfo::default().descriptor_pool(pool).set_layouts(std::slice::from_ref(&set_layout));
        let descriptor_set =
            match unsafe { device_functions.allocate_descriptor_sets(&alloc_info).vk_op("allocate_descriptor_sets") } {
                Ok(sets) => sets[0],
                Err(e) => {
                    unsafe {
                        device_functions.destroy_descriptor_pool(pool, None);
                        device_functions.destroy_descriptor_set_layout(set_layout, None);
                    }
                    return Err(e);
                }
            };

        let heap = Self {
            descriptor_set,
            set_layout,
            pool,
            capacity,
            buffer_views: RefCell::new(Vec::new()),
            device_functions,
            _live: live,
        };
        heap.device_functions.set_debug_name(&heap, debug_name);
        Ok(heap)
    }

    fn binding_types() -> impl Iterator<Item = (u32, vk::DescriptorType)> {
        [
            (binding::CONSTANT, vk::DescriptorType::UNIFORM_BUFFER),
            (binding::TYPED_SRV, vk::DescriptorType::UNIFORM_TEXEL_BUFFER),
            (binding::TYPED_UAV, vk::DescriptorType::STORAGE_TEXEL_BUFFER),
            (binding::STORAGE, vk::DescriptorType::STORAGE_BUFFER),
        ]
        .into_iter()
    }

    fn create_set_layout(device_functions: &DeviceFunctions, capacity: u32) -> GfxResult<vk::DescriptorSetLayout> {
        let bindings = Self::binding_types()
            .map(|(binding, ty)| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding)
                    .descriptor_type(ty)
                    .descriptor_count(capacity)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
            })
            .collect::<Vec<_>>();
        // 只有写入过的槽位才需要有效
        let binding_flags = vec![vk::DescriptorBindingFlags::PARTIALLY_BOUND; bindings.len()];
        let mut binding_flags_ci = vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&binding_flags);

        let layout_ci = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings).push_next(&mut binding_flags_ci);
        unsafe { device_functions.create_descriptor_set_layout(&layout_ci, None).vk_op("create_descriptor_set_layout") }
    }
}

impl Drop for VulkanDescriptorHeap {
    fn drop(&mut self) {
        unsafe {
            for view in self.buffer_views.get_mut().drain(..) {
                self.device_functions.destroy_buffer_view(view, None);
            }
            // descriptor set 随 pool 一起释放
            self.device_functions.destroy_descriptor_pool(self.pool, None);
            self.device_functions.destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}

// getters
impl VulkanDescriptorHeap {
    #[inline]
    pub fn descriptor_set(&self) -> vk::DescriptorSet {
        self.descriptor_set
    }

    #[inline]
    pub fn set_layout(&self) -> vk::DescriptorSetLayout {
        self.set_layout
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

// 写入
impl VulkanDescriptorHeap {
    pub fn write(&self, slot: u32, resource: &VulkanResource, view: &ViewDesc) -> GfxResult<()> {
        if slot >= self.capacity {
            return Err(GfxError::InvalidArgument(format!(
                "descriptor slot {slot} out of heap (capacity {})",
                self.capacity
            )));
        }
        let buffer = resource.expect_buffer("write_descriptor")?;

        match view {
            ViewDesc::Constant { size } => {
                self.write_buffer(slot, binding::CONSTANT, vk::DescriptorType::UNIFORM_BUFFER, buffer, 0, *size);
            }
            ViewDesc::ShaderResource(desc) | ViewDesc::UnorderedAccess(desc) if Self::is_storage_view(desc) => {
                // structured / raw view 都是 storage buffer，只读由 shader 保证
                self.write_buffer(
                    slot,
                    binding::STORAGE,
                    vk::DescriptorType::STORAGE_BUFFER,
                    buffer,
                    desc.byte_offset(),
                    desc.byte_len(),
                );
            }
            ViewDesc::ShaderResource(desc) => {
                let buffer_view = self.create_buffer_view(buffer, desc, &resource.debug_name)?;
                self.write_texel(slot, binding::TYPED_SRV, vk::DescriptorType::UNIFORM_TEXEL_BUFFER, buffer_view);
            }
            ViewDesc::UnorderedAccess(desc) => {
                let buffer_view = self.create_buffer_view(buffer, desc, &resource.debug_name)?;
                self.write_texel(slot, binding::TYPED_UAV, vk::DescriptorType::STORAGE_TEXEL_BUFFER, buffer_view);
            }
        }
        Ok(())
    }

    #[inline]
    fn is_storage_view(desc: &BufferViewDesc) -> bool {
        desc.raw || desc.stride > 0
    }

    fn create_buffer_view(
        &self,
        buffer: vk::Buffer,
        desc: &BufferViewDesc,
        debug_name: &str,
    ) -> GfxResult<vk::BufferView> {
        let view_ci = vk::BufferViewCreateInfo::default()
            .buffer(buffer)
            .format(vk_format(desc.format))
            .offset(desc.byte_offset())
            .range(desc.byte_len());
        let view = unsafe { self.device_functions.create_buffer_view(&view_ci, None).vk_op("create_buffer_view")? };
        self.device_functions.set_object_debug_name(view, format!("BufferView::{}", debug_name));
        self.buffer_views.borrow_mut().push(view);
        Ok(view)
    }

    fn write_buffer(
        &self,
        slot: u32,
        binding: u32,
        ty: vk::DescriptorType,
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    ) {
        let buffer_info = vk::DescriptorBufferInfo {
            buffer,
            offset,
            range,
        };
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.descriptor_set)
            .dst_binding(binding)
            .dst_array_element(slot)
            .descriptor_type(ty)
            .buffer_info(std::slice::from_ref(&buffer_info));
        unsafe {
            self.device_functions.update_descriptor_sets(std::slice::from_ref(&write), &[]);
        }
    }

    fn write_texel(&self, slot: u32, binding: u32, ty: vk::DescriptorType, view: vk::BufferView) {
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.descriptor_set)
            .dst_binding(binding)
            .dst_array_element(slot)
            .descriptor_type(ty)
            .texel_buffer_view(std::slice::from_ref(&view));
        unsafe {
            self.device_functions.update_descriptor_sets(std::slice::from_ref(&write), &[]);
        }
    }
}
