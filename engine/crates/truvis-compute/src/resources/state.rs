use bitflags::bitflags;

bitflags! {
    /// 资源的使用状态，切换用途之前需要显式的 barrier
    ///
    /// `COMMON` 为空集合：任何队列都可以从该状态隐式开始拷贝
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ResourceState: u32 {
        const COMMON = 0;
        const VERTEX_AND_CONSTANT_BUFFER = 1 << 0;
        const UNORDERED_ACCESS = 1 << 1;
        const NON_PIXEL_SHADER_RESOURCE = 1 << 2;
        const COPY_DEST = 1 << 3;
        const COPY_SOURCE = 1 << 4;
        /// upload 内存的初始状态
        const GENERIC_READ = Self::VERTEX_AND_CONSTANT_BUFFER.bits()
            | Self::NON_PIXEL_SHADER_RESOURCE.bits()
            | Self::COPY_SOURCE.bits();
    }
}

impl ResourceState {
    /// 是否包含写入用途
    #[inline]
    pub fn is_write(self) -> bool {
        self.intersects(Self::UNORDERED_ACCESS | Self::COPY_DEST)
    }

    /// 是否只能在 compute 队列上进入该状态（copy 队列只能处理 COMMON / COPY_*）
    #[inline]
    pub fn requires_compute_queue(self) -> bool {
        !(Self::COPY_DEST | Self::COPY_SOURCE).contains(self)
    }
}

/// 一次状态切换
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceTransition {
    pub before: ResourceState,
    pub after: ResourceState,
}

impl ResourceTransition {
    #[inline]
    pub fn new(before: ResourceState, after: ResourceState) -> Self {
        Self { before, after }
    }

    /// 从 COMMON 出发的切换
    #[inline]
    pub fn from_common(after: ResourceState) -> Self {
        Self::new(ResourceState::COMMON, after)
    }

    #[inline]
    pub fn is_noop(&self) -> bool {
        self.before == self.after
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generic_read_is_read_only() {
        assert!(!ResourceState::GENERIC_READ.is_write());
        assert!(ResourceState::GENERIC_READ.contains(ResourceState::COPY_SOURCE));
        assert!(ResourceState::UNORDERED_ACCESS.is_write());
        assert!(ResourceState::COPY_DEST.is_write());
    }

    #[test]
    fn test_copy_queue_states() {
        assert!(!ResourceState::COMMON.requires_compute_queue());
        assert!(!ResourceState::COPY_DEST.requires_compute_queue());
        assert!(ResourceState::UNORDERED_ACCESS.requires_compute_queue());
        assert!(ResourceState::VERTEX_AND_CONSTANT_BUFFER.requires_compute_queue());
    }

    #[test]
    fn test_transition() {
        let t = ResourceTransition::from_common(ResourceState::NON_PIXEL_SHADER_RESOURCE);
        assert_eq!(t.before, ResourceState::COMMON);
        assert!(!t.is_noop());
        assert!(ResourceTransition::new(ResourceState::COPY_DEST, ResourceState::COPY_DEST).is_noop());
    }
}
