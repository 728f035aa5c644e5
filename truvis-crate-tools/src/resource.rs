use std::path::{Path, PathBuf};

/// 统一资源路径管理
///
/// 所有路径基于工作区根目录（通过 `CARGO_MANIFEST_DIR` 推导）。
///
/// # 使用示例
/// ```ignore
/// let config = TruvisPath::config_path("compute.toml");           // config/compute.toml
/// let shader = TruvisPath::shader_build_path("copy_through.comp"); // shader/.build/copy_through.comp.spv
/// ```
pub struct TruvisPath {}
// 核心路径
impl TruvisPath {
    /// 获取工作区根目录
    pub fn workspace_path() -> PathBuf {
        // 本 crate 位于工作区根目录下一级
        Path::new(env!("CARGO_MANIFEST_DIR")).parent().map(Path::to_path_buf).unwrap_or_default()
    }
}
// 根目录下
impl TruvisPath {
    /// 获取 `config/` 目录下的文件路径
    pub fn config_path(filename: &str) -> PathBuf {
        Self::workspace_path().join("config").join(filename)
    }

    pub fn shader_root_path() -> PathBuf {
        Self::workspace_path().join("shader")
    }

    /// 获取 `shader/.build/` 目录下的着色器路径（编译后的 SPIR-V）
    pub fn shader_build_path(filename: &str) -> PathBuf {
        Self::shader_root_path().join(".build").join(format!("{filename}.spv"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shader_build_path_has_spv_suffix() {
        let path = TruvisPath::shader_build_path("copy_through.comp");
        assert!(path.ends_with("shader/.build/copy_through.comp.spv"));
    }

    #[test]
    fn test_config_path_under_workspace() {
        let path = TruvisPath::config_path("compute.toml");
        assert!(path.starts_with(TruvisPath::workspace_path()));
        assert!(path.ends_with("config/compute.toml"));
    }
}
