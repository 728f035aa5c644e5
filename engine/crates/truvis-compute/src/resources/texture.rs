use serde::{Deserialize, Serialize};

use crate::error::{GfxError, GfxResult};

/// 像素格式
///
/// `Unknown` 表示无类型（structured / raw buffer view 使用），
/// `R32Typeless` 只用于 raw view（字节寻址）。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Format {
    Unknown,
    R32Typeless,
    R32Float,
    R32Uint,
    R32Sint,
    R16Float,
    R8G8B8A8Unorm,
    R32G32Float,
    R32G32B32A32Float,
}

impl Format {
    /// 单个 texel / element 的字节数，`Unknown` 为 0
    #[inline]
    pub const fn byte_size(self) -> u32 {
        match self {
            Format::Unknown => 0,
            Format::R16Float => 2,
            Format::R32Typeless | Format::R32Float | Format::R32Uint | Format::R32Sint | Format::R8G8B8A8Unorm => 4,
            Format::R32G32Float => 8,
            Format::R32G32B32A32Float => 16,
        }
    }

    /// 是否可以用于 typed view
    #[inline]
    pub const fn is_typed(self) -> bool {
        !matches!(self, Format::Unknown | Format::R32Typeless)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TextureType {
    Texture1D,
    Texture2D,
    Texture3D,
}

/// 纹理的形状描述
///
/// `mip_count == 0` 表示需要自动计算完整的 mip chain，
/// 必须在分配之前通过 [`TextureDesc::with_resolved_mips`] 解析。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureDesc {
    pub texture_type: TextureType,
    pub width: u32,
    pub height: u32,
    /// 3D 纹理表示深度，1D/2D 纹理表示 array size
    pub depth_or_array_size: u32,
    pub mip_count: u32,
    pub format: Format,
}

// 创建
impl TextureDesc {
    pub fn new_1d(width: u32, format: Format) -> Self {
        Self {
            texture_type: TextureType::Texture1D,
            width,
            height: 1,
            depth_or_array_size: 1,
            mip_count: 1,
            format,
        }
    }

    pub fn new_2d(width: u32, height: u32, format: Format) -> Self {
        Self {
            texture_type: TextureType::Texture2D,
            width,
            height,
            depth_or_array_size: 1,
            mip_count: 1,
            format,
        }
    }

    pub fn new_3d(width: u32, height: u32, depth: u32, format: Format) -> Self {
        Self {
            texture_type: TextureType::Texture3D,
            width,
            height,
            depth_or_array_size: depth,
            mip_count: 1,
            format,
        }
    }

    /// builder
    #[inline]
    pub fn mips(mut self, mip_count: u32) -> Self {
        self.mip_count = mip_count;
        self
    }
}

// tools
impl TextureDesc {
    /// 完整 mip chain 的层数：1 + floor(log2(最大边长))
    pub fn full_mip_chain_len(&self) -> u32 {
        let mut max_extent = self.width.max(self.height);
        if self.texture_type == TextureType::Texture3D {
            max_extent = max_extent.max(self.depth_or_array_size);
        }
        32 - max_extent.max(1).leading_zeros()
    }

    /// mip_count 为 0 时解析为完整 mip chain，其余情况保持不变
    pub fn with_resolved_mips(mut self) -> Self {
        if self.mip_count == 0 {
            self.mip_count = self.full_mip_chain_len();
        }
        self
    }

    #[inline]
    pub fn array_layers(&self) -> u32 {
        match self.texture_type {
            TextureType::Texture3D => 1,
            _ => self.depth_or_array_size,
        }
    }

    #[inline]
    pub fn depth(&self) -> u32 {
        match self.texture_type {
            TextureType::Texture3D => self.depth_or_array_size,
            _ => 1,
        }
    }

    /// 某一层 mip 的尺寸 (width, height, depth)
    pub fn mip_extent(&self, mip: u32) -> (u32, u32, u32) {
        ((self.width >> mip).max(1), (self.height >> mip).max(1), (self.depth() >> mip).max(1))
    }

    /// 紧密排列时，所有 mip 与所有 array layer 的总字节数
    ///
    /// 超出 u64 范围时返回 `InvalidArgument`
    pub fn packed_byte_size(&self) -> GfxResult<u64> {
        let texel = self.format.byte_size() as u64;
        (0..self.mip_count)
            .try_fold(0u64, |total, mip| {
                let (w, h, d) = self.mip_extent(mip);
                (w as u64).checked_mul(h as u64)?.checked_mul(d as u64)?.checked_mul(texel)?.checked_add(total)
            })
            .and_then(|layer| layer.checked_mul(self.array_layers() as u64))
            .ok_or_else(|| {
                GfxError::InvalidArgument(format!(
                    "texture {}x{}x{} {:?} with {} mips is too large",
                    self.width, self.height, self.depth_or_array_size, self.format, self.mip_count
                ))
            })
    }

    /// 分配前的形状检查
    pub fn validate(&self) -> GfxResult<()> {
        if self.mip_count == 0 {
            return Err(GfxError::UnresolvedMipChain);
        }
        if self.width == 0 || self.height == 0 || self.depth_or_array_size == 0 {
            return Err(GfxError::ZeroSize);
        }
        if self.texture_type == TextureType::Texture1D && self.height != 1 {
            return Err(GfxError::InvalidArgument(format!("1D texture must have height 1, got {}", self.height)));
        }
        if !self.format.is_typed() {
            return Err(GfxError::UnsupportedFormat {
                format: self.format,
                texture_type: Some(self.texture_type),
                usage: "texture",
            });
        }
        if self.mip_count > self.full_mip_chain_len() {
            return Err(GfxError::InvalidArgument(format!(
                "mip count {} exceeds full chain length {}",
                self.mip_count,
                self.full_mip_chain_len()
            )));
        }
        self.packed_byte_size()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_mip_chain_len() {
        assert_eq!(TextureDesc::new_2d(1, 1, Format::R32Float).full_mip_chain_len(), 1);
        assert_eq!(TextureDesc::new_2d(256, 256, Format::R32Float).full_mip_chain_len(), 9);
        assert_eq!(TextureDesc::new_2d(300, 17, Format::R32Float).full_mip_chain_len(), 9);
        // 3D 纹理的深度参与计算，array size 不参与
        assert_eq!(TextureDesc::new_3d(4, 4, 64, Format::R32Float).full_mip_chain_len(), 7);
        let mut array = TextureDesc::new_2d(4, 4, Format::R32Float);
        array.depth_or_array_size = 64;
        assert_eq!(array.full_mip_chain_len(), 3);
    }

    #[test]
    fn test_resolve_mips() {
        let desc = TextureDesc::new_2d(64, 32, Format::R8G8B8A8Unorm).mips(0);
        assert_eq!(desc.validate().unwrap_err().to_string(), GfxError::UnresolvedMipChain.to_string());

        let resolved = desc.with_resolved_mips();
        assert_eq!(resolved.mip_count, 7);
        assert!(resolved.validate().is_ok());

        // 非 0 的 mip 数量保持不变
        assert_eq!(TextureDesc::new_2d(64, 32, Format::R32Float).mips(3).with_resolved_mips().mip_count, 3);
    }

    #[test]
    fn test_packed_byte_size() {
        let desc = TextureDesc::new_2d(4, 4, Format::R32Float).mips(3);
        // 16 + 4 + 1 个 texel
        assert_eq!(desc.packed_byte_size().unwrap(), 21 * 4);

        let desc = TextureDesc::new_3d(4, 2, 2, Format::R16Float).mips(2);
        assert_eq!(desc.packed_byte_size().unwrap(), (16 + 2) * 2);
    }

    #[test]
    fn test_validate_rejects_bad_shapes() {
        assert!(matches!(TextureDesc::new_2d(0, 4, Format::R32Float).validate(), Err(GfxError::ZeroSize)));
        assert!(matches!(
            TextureDesc::new_2d(4, 4, Format::Unknown).validate(),
            Err(GfxError::UnsupportedFormat { .. })
        ));
        let mut one_d = TextureDesc::new_1d(16, Format::R32Float);
        one_d.height = 2;
        assert!(matches!(one_d.validate(), Err(GfxError::InvalidArgument(_))));
        assert!(TextureDesc::new_2d(4, 4, Format::R32Float).mips(4).validate().is_err());

        // 总字节数超出 u64
        let huge = TextureDesc::new_2d(u32::MAX, u32::MAX, Format::R32G32B32A32Float);
        assert!(matches!(huge.validate(), Err(GfxError::InvalidArgument(_))));
        let mut huge_array = TextureDesc::new_2d(1 << 20, 1 << 20, Format::R32G32B32A32Float);
        huge_array.depth_or_array_size = u32::MAX;
        assert!(matches!(huge_array.packed_byte_size(), Err(GfxError::InvalidArgument(_))));
    }

    #[test]
    fn test_format_classification() {
        assert!(Format::R32Float.is_typed());
        assert!(!Format::Unknown.is_typed());
        assert!(!Format::R32Typeless.is_typed());
        assert_eq!(Format::R32G32B32A32Float.byte_size(), 16);
    }
}
