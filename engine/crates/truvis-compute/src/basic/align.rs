/// buffer 的大小需要对齐到该值（constant buffer 的放置对齐）
pub const BUFFER_PLACEMENT_ALIGNMENT: u64 = 256;

/// 向上对齐到 2 的幂，溢出时返回 None
#[inline]
pub const fn align_up_pow2(value: u64, alignment: u64) -> Option<u64> {
    debug_assert!(alignment.is_power_of_two());
    match value.checked_add(alignment - 1) {
        Some(v) => Some(v & !(alignment - 1)),
        None => None,
    }
}
