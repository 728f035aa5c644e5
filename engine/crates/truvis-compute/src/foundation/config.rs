use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{GfxError, GfxResult};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// host 内存模拟的设备，不需要 GPU
    #[default]
    Emulated,
    Vulkan,
}

/// 计算层的运行时配置
///
/// 诊断相关的开关都是运行时的值，而不是编译期常量。
/// 所有字段都有默认值，toml 文件中可以只写需要覆盖的部分。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GfxConfig {
    pub app_name: String,
    pub backend: BackendKind,

    /// Vulkan: 开启 `VK_LAYER_KHRONOS_validation` 以及 debug messenger
    pub enable_validation: bool,
    /// Vulkan: 开启 validation layer 的 GPU-assisted 检查，依赖 `enable_validation`
    pub enable_gpu_based_validation: bool,
    /// 在 demo 前后插入 capture 区间
    pub enable_capture: bool,
    /// 创建队列时请求关闭 GPU 超时检测
    pub disable_gpu_timeout: bool,

    pub log_level: String,
}

impl Default for GfxConfig {
    fn default() -> Self {
        Self {
            app_name: "truvis-compute".to_string(),
            backend: BackendKind::Emulated,
            enable_validation: cfg!(debug_assertions),
            enable_gpu_based_validation: false,
            enable_capture: false,
            disable_gpu_timeout: true,
            log_level: "info".to_string(),
        }
    }
}

impl GfxConfig {
    pub fn from_toml_str(content: &str) -> GfxResult<Self> {
        let config: Self = toml::from_str(content).map_err(|e| GfxError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> GfxResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GfxError::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// 文件不存在时使用默认配置；文件存在但解析失败时返回错误
    pub fn load_or_default(path: &Path) -> GfxResult<Self> {
        if !path.exists() {
            log::warn!("config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn validate(&self) -> GfxResult<()> {
        if self.enable_gpu_based_validation && !self.enable_validation {
            return Err(GfxError::Config("enable_gpu_based_validation requires enable_validation".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml() {
        let config = GfxConfig::from_toml_str(
            r#"
            backend = "vulkan"
            enable_capture = true
            "#,
        )
        .unwrap();
        assert_eq!(config.backend, BackendKind::Vulkan);
        assert!(config.enable_capture);
        // 未写出的字段使用默认值
        assert_eq!(config.app_name, GfxConfig::default().app_name);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(GfxConfig::from_toml_str("backend = \"metal\""), Err(GfxError::Config(_))));
        assert!(matches!(
            GfxConfig::from_toml_str("enable_validation = false\nenable_gpu_based_validation = true"),
            Err(GfxError::Config(_))
        ));
    }

    #[test]
    fn test_missing_file_falls_back() {
        let path = std::env::temp_dir().join("truvis-compute-config-that-does-not-exist.toml");
        let config = GfxConfig::load_or_default(&path).unwrap();
        assert_eq!(config, GfxConfig::default());
        assert!(GfxConfig::load(&path).is_err());
    }
}
