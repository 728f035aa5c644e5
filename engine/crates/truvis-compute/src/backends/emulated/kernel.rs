use std::sync::Arc;

use bytemuck::Pod;

use crate::{
    backends::emulated::memory::HostBlock,
    diagnostics::LiveToken,
    error::{GfxError, GfxResult},
    foundation::gpu_device::ViewDesc,
    resources::texture::Format,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoundViewKind {
    Constant,
    ShaderResource,
    UnorderedAccess,
}

/// 写入描述符槽位的 view，kernel 通过它访问资源
#[derive(Clone)]
pub struct BoundView {
    block: Arc<HostBlock>,
    kind: BoundViewKind,
    format: Format,
    offset: usize,
    len: usize,
}

impl BoundView {
    pub(crate) fn new(block: Arc<HostBlock>, view: &ViewDesc) -> GfxResult<Self> {
        let (kind, format, offset, len) = match view {
            ViewDesc::Constant { size } => (BoundViewKind::Constant, Format::Unknown, 0, *size),
            ViewDesc::ShaderResource(desc) => {
                (BoundViewKind::ShaderResource, desc.format, desc.byte_offset(), desc.byte_len())
            }
            ViewDesc::UnorderedAccess(desc) => {
                (BoundViewKind::UnorderedAccess, desc.format, desc.byte_offset(), desc.byte_len())
            }
        };
        if offset + len > block.len() as u64 {
            return Err(GfxError::InvalidArgument(format!(
                "view [{offset}, {offset}+{len}) out of resource of {} bytes",
                block.len()
            )));
        }
        Ok(Self {
            block,
            kind,
            format,
            offset: offset as usize,
            len: len as usize,
        })
    }

    #[inline]
    pub fn kind(&self) -> BoundViewKind {
        self.kind
    }

    #[inline]
    pub fn format(&self) -> Format {
        self.format
    }

    /// view 覆盖的字节数
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.len
    }

    /// 以 `T` 为元素时的元素数量
    #[inline]
    pub fn element_count<T: Pod>(&self) -> usize {
        self.len / size_of::<T>()
    }

    pub fn load<T: Pod>(&self, index: usize) -> GfxResult<T> {
        let offset = self.element_offset::<T>(index)?;
        let mut value: T = bytemuck::Zeroable::zeroed();
        self.block.read(offset, bytemuck::bytes_of_mut(&mut value))?;
        Ok(value)
    }

    pub fn store<T: Pod>(&self, index: usize, value: T) -> GfxResult<()> {
        if self.kind != BoundViewKind::UnorderedAccess {
            return Err(GfxError::Device(format!("store through read-only {:?} view", self.kind)));
        }
        let offset = self.element_offset::<T>(index)?;
        self.block.write(offset, bytemuck::bytes_of(&value))
    }

    fn element_offset<T: Pod>(&self, index: usize) -> GfxResult<usize> {
        let size = size_of::<T>();
        if self.format.is_typed() && self.format.byte_size() as usize != size {
            return Err(GfxError::Device(format!(
                "element of {} bytes accessed through {:?} view",
                size, self.format
            )));
        }
        let offset = index * size;
        if offset + size > self.len {
            return Err(GfxError::Device(format!(
                "element {index} out of view of {} bytes",
                self.len
            )));
        }
        Ok(self.offset + offset)
    }
}

/// kernel 每个 thread group 调用一次时看到的上下文
pub struct DispatchContext<'a> {
    pub group_id: [u32; 3],
    pub group_count: [u32; 3],
    pub(crate) views: &'a [Option<BoundView>],
}

impl DispatchContext<'_> {
    /// 按描述符表中的槽位索引取得 view
    pub fn view(&self, slot: usize) -> GfxResult<&BoundView> {
        self.views
            .get(slot)
            .and_then(Option::as_ref)
            .ok_or_else(|| GfxError::Device(format!("descriptor slot {slot} is empty")))
    }
}

pub type Kernel = Arc<dyn Fn(&DispatchContext<'_>) -> GfxResult<()> + Send + Sync>;

/// emulated 设备的 pipeline：一个 host 函数
pub struct EmulatedPipeline {
    pub(crate) name: String,
    pub(crate) kernel: Kernel,
    pub(crate) _live: LiveToken,
}

impl EmulatedPipeline {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}
