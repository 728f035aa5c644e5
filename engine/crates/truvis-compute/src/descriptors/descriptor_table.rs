use std::rc::Rc;

use crate::{
    error::{GfxError, GfxResult},
    foundation::gpu_device::{BufferViewDesc, GpuDevice, ViewDesc},
    resources::{
        allocation::{GpuMemAllocation, MemoryKind},
        texture::Format,
    },
};

/// 描述符表中的一个槽位：GPU 可见地址与 CPU 可见地址
///
/// 只在所属的 [`DescriptorTable`] 存活期间有效
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Descriptor {
    pub gpu_handle: u64,
    pub cpu_handle: u64,
}

impl Descriptor {
    #[inline]
    fn offset(self, bytes: u64) -> Self {
        Self {
            gpu_handle: self.gpu_handle + bytes,
            cpu_handle: self.cpu_handle + bytes,
        }
    }
}

/// 固定容量、shader 可见的描述符表
///
/// 只能向后追加，不支持释放与回收。游标超过容量时返回
/// [`GfxError::DescriptorTableFull`]，不会写入设备。
///
/// 不是线程安全的，多线程使用需要外部加锁。
pub struct DescriptorTable<D: GpuDevice> {
    device: Rc<D>,
    heap: D::DescriptorHeap,

    capacity: u32,
    /// 已经使用的槽位数量
    used: u32,
    increment_size: u64,

    begin: Descriptor,
    current: Descriptor,

    debug_name: String,
}

// 创建
impl<D: GpuDevice> DescriptorTable<D> {
    pub fn new(device: Rc<D>, capacity: u32, debug_name: &str) -> GfxResult<Self> {
        if capacity == 0 {
            return Err(GfxError::InvalidArgument("descriptor table capacity must be greater than zero".to_string()));
        }

        let heap = device.create_descriptor_heap(capacity, debug_name)?;
        let begin = device.descriptor_heap_start(&heap);
        let increment_size = device.descriptor_increment_size();
        log::info!("created descriptor table `{}`: {} slots, increment {}", debug_name, capacity, increment_size);

        Ok(Self {
            device,
            heap,
            capacity,
            used: 0,
            increment_size,
            begin,
            current: begin,
            debug_name: debug_name.to_string(),
        })
    }
}

// getters
impl<D: GpuDevice> DescriptorTable<D> {
    #[inline]
    pub fn heap(&self) -> &D::DescriptorHeap {
        &self.heap
    }

    /// 创建时记录的起始槽位，`gpu_handle` 用于绑定
    #[inline]
    pub fn begin(&self) -> Descriptor {
        self.begin
    }

    /// 下一个将被分配的槽位
    #[inline]
    pub fn top(&self) -> Descriptor {
        self.current
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[inline]
    pub fn len(&self) -> u32 {
        self.used
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    #[inline]
    pub fn remaining(&self) -> u32 {
        self.capacity - self.used
    }

    #[inline]
    pub fn increment_size(&self) -> u64 {
        self.increment_size
    }
}

// 创建 view
impl<D: GpuDevice> DescriptorTable<D> {
    pub fn create_constant_view(&mut self, allocation: &GpuMemAllocation<D>, size: u64) -> GfxResult<Descriptor> {
        Self::ensure_buffer(allocation)?;
        if size == 0 {
            return Err(GfxError::ZeroSize);
        }
        if size > allocation.byte_size() {
            return Err(GfxError::InvalidArgument(format!(
                "constant view of {} bytes exceeds `{}` ({} bytes)",
                size,
                allocation.debug_name(),
                allocation.byte_size()
            )));
        }
        self.push_view(allocation, ViewDesc::Constant { size })
    }

    /// typed buffer view；`format` 不能是无类型格式
    pub fn create_typed_buffer_view(
        &mut self,
        allocation: &GpuMemAllocation<D>,
        format: Format,
        element_count: u32,
        read_write: bool,
    ) -> GfxResult<Descriptor> {
        if !format.is_typed() {
            return Err(GfxError::UnsupportedFormat {
                format,
                texture_type: None,
                usage: "typed buffer view",
            });
        }
        self.create_buffer_view(
            allocation,
            BufferViewDesc {
                format,
                first_element: 0,
                element_count,
                stride: 0,
                raw: false,
            },
            read_write,
        )
    }

    pub fn create_structured_buffer_view(
        &mut self,
        allocation: &GpuMemAllocation<D>,
        element_count: u32,
        stride: u32,
        read_write: bool,
    ) -> GfxResult<Descriptor> {
        if stride == 0 {
            return Err(GfxError::InvalidArgument("structured buffer view stride must be greater than zero".to_string()));
        }
        self.create_buffer_view(
            allocation,
            BufferViewDesc {
                format: Format::Unknown,
                first_element: 0,
                element_count,
                stride,
                raw: false,
            },
            read_write,
        )
    }

    /// 字节寻址的 raw view，以 4 字节为一个元素
    pub fn create_raw_buffer_view(
        &mut self,
        allocation: &GpuMemAllocation<D>,
        element_count: u32,
        read_write: bool,
    ) -> GfxResult<Descriptor> {
        self.create_buffer_view(
            allocation,
            BufferViewDesc {
                format: Format::R32Typeless,
                first_element: 0,
                element_count,
                stride: 0,
                raw: true,
            },
            read_write,
        )
    }

    /// 三种 buffer view 共用：按读写选择 SRV / UAV
    fn create_buffer_view(
        &mut self,
        allocation: &GpuMemAllocation<D>,
        desc: BufferViewDesc,
        read_write: bool,
    ) -> GfxResult<Descriptor> {
        Self::ensure_buffer(allocation)?;
        if desc.element_count == 0 {
            return Err(GfxError::ZeroSize);
        }
        if desc.byte_offset() + desc.byte_len() > allocation.byte_size() {
            return Err(GfxError::InvalidArgument(format!(
                "view of {} elements x {} bytes exceeds `{}` ({} bytes)",
                desc.element_count,
                desc.element_size(),
                allocation.debug_name(),
                allocation.byte_size()
            )));
        }

        let view = if read_write {
            if allocation.kind() != MemoryKind::DeviceReadWrite {
                return Err(GfxError::InvalidArgument(format!(
                    "`{}` was not allocated with unordered access",
                    allocation.debug_name()
                )));
            }
            ViewDesc::UnorderedAccess(desc)
        } else {
            ViewDesc::ShaderResource(desc)
        };
        self.push_view(allocation, view)
    }

    fn push_view(&mut self, allocation: &GpuMemAllocation<D>, view: ViewDesc) -> GfxResult<Descriptor> {
        if self.used >= self.capacity {
            return Err(GfxError::DescriptorTableFull {
                capacity: self.capacity,
            });
        }

        self.device.write_descriptor(&self.heap, self.used, allocation.resource(), &view)?;
        log::debug!("[{}] slot {}: {:?} -> `{}`", self.debug_name, self.used, view, allocation.debug_name());

        let descriptor = self.current;
        self.current = self.current.offset(self.increment_size);
        self.used += 1;
        Ok(descriptor)
    }

    fn ensure_buffer(allocation: &GpuMemAllocation<D>) -> GfxResult<()> {
        if !allocation.is_buffer() {
            return Err(GfxError::InvalidArgument(format!(
                "`{}` is not a buffer allocation",
                allocation.debug_name()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backends::emulated::EmulatedDevice,
        resources::{memory::TypedMemoryAllocator, texture::TextureDesc},
    };

    fn setup(capacity: u32) -> (TypedMemoryAllocator<EmulatedDevice>, DescriptorTable<EmulatedDevice>) {
        let device = Rc::new(EmulatedDevice::new());
        let table = DescriptorTable::new(device.clone(), capacity, "table").unwrap();
        (TypedMemoryAllocator::new(device), table)
    }

    #[test]
    fn test_cursor_advance() {
        let (allocator, mut table) = setup(4);
        let buffer = allocator.allocate_buffer(1024, true, "buffer").unwrap();
        let begin = table.begin();
        let stride = table.increment_size();

        let descriptors = vec![
            table.create_constant_view(&buffer, 256).unwrap(),
            table.create_typed_buffer_view(&buffer, Format::R32Float, 256, false).unwrap(),
            table.create_structured_buffer_view(&buffer, 16, 64, true).unwrap(),
            table.create_raw_buffer_view(&buffer, 256, true).unwrap(),
        ];

        for (n, d) in descriptors.iter().enumerate() {
            assert_eq!(d.cpu_handle, begin.cpu_handle + n as u64 * stride);
            assert_eq!(d.gpu_handle, begin.gpu_handle + n as u64 * stride);
        }
        assert_eq!(table.top().cpu_handle - begin.cpu_handle, 4 * stride);
        assert_eq!(table.remaining(), 0);
    }

    #[test]
    fn test_overflow_is_reported() {
        let (allocator, mut table) = setup(2);
        let buffer = allocator.allocate_buffer(256, false, "buffer").unwrap();
        table.create_typed_buffer_view(&buffer, Format::R32Uint, 64, false).unwrap();
        table.create_typed_buffer_view(&buffer, Format::R32Uint, 64, false).unwrap();

        let top = table.top();
        assert!(matches!(
            table.create_typed_buffer_view(&buffer, Format::R32Uint, 64, false),
            Err(GfxError::DescriptorTableFull { capacity: 2 })
        ));
        // 失败的调用不移动游标
        assert_eq!(table.top(), top);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_view_preconditions() {
        let (allocator, mut table) = setup(8);
        let ro = allocator.allocate_buffer(256, false, "ro").unwrap();
        let rw = allocator.allocate_buffer(256, true, "rw").unwrap();

        assert!(matches!(
            table.create_typed_buffer_view(&ro, Format::Unknown, 4, false),
            Err(GfxError::UnsupportedFormat { .. })
        ));
        assert!(table.create_structured_buffer_view(&ro, 4, 0, false).is_err());
        assert!(matches!(table.create_raw_buffer_view(&ro, 0, false), Err(GfxError::ZeroSize)));
        // 超出分配大小
        assert!(table.create_typed_buffer_view(&ro, Format::R32Float, 65, false).is_err());
        // 只读分配不能创建 UAV
        assert!(table.create_raw_buffer_view(&ro, 4, true).is_err());
        assert!(table.create_raw_buffer_view(&rw, 4, true).is_ok());

        let texture = allocator.allocate_texture(&TextureDesc::new_2d(4, 4, Format::R32Float), false, "tex").unwrap();
        assert!(table.create_constant_view(&texture, 64).is_err());

        // 所有失败的调用都不占用槽位
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let device = Rc::new(EmulatedDevice::new());
        assert!(DescriptorTable::new(device, 0, "empty").is_err());
    }
}
