//! Shader 编译工具
//!
//! 将 `shader/src` 下的所有 compute shader 用 glslc 编译为 SPIR-V，输出到 `shader/.build`，
//! 保持相对路径不变：`shader/src/copy_through.comp` -> `shader/.build/copy_through.comp.spv`

use std::path::{Path, PathBuf};

use anyhow::Context;
use rayon::prelude::*;
use truvis_crate_tools::{init_log, resource::TruvisPath};

/// 一个具体的编译任务
#[derive(Debug)]
struct ShaderCompileTask {
    shader_path: PathBuf,
    output_path: PathBuf,
}

impl ShaderCompileTask {
    /// 只接受 `.comp` 文件
    fn new(src_root: &Path, build_root: &Path, shader_path: &Path) -> Option<Self> {
        if shader_path.extension()? != "comp" {
            return None;
        }
        let relative_path = shader_path.strip_prefix(src_root).ok()?;

        let mut output_path = build_root.join(relative_path);
        let mut new_ext = output_path.extension()?.to_os_string();
        new_ext.push(".spv");
        output_path.set_extension(new_ext);

        Some(Self {
            shader_path: shader_path.to_path_buf(),
            output_path,
        })
    }

    fn compile(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.output_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let output = std::process::Command::new("glslc")
            .arg("-g") // 生成调试信息
            .arg("--target-env=vulkan1.3")
            .arg("-o")
            .arg(&self.output_path)
            .arg(&self.shader_path)
            .output()
            .context("failed to execute glslc, is the Vulkan SDK on PATH?")?;

        if !output.stdout.is_empty() {
            log::info!("stdout: {}", String::from_utf8_lossy(&output.stdout));
        }
        if !output.stderr.is_empty() {
            log::error!("stderr: {}", String::from_utf8_lossy(&output.stderr));
        }
        anyhow::ensure!(output.status.success(), "glslc failed on {}", self.shader_path.display());
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    init_log::init_log(log::LevelFilter::Info);

    let src_root = TruvisPath::shader_root_path().join("src");
    let build_root = TruvisPath::shader_root_path().join(".build");
    log::info!("Shader entry path: {:?}", src_root);
    log::info!("Shader output path: {:?}", build_root);

    let tasks = walkdir::WalkDir::new(&src_root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.path().is_file())
        .filter_map(|entry| ShaderCompileTask::new(&src_root, &build_root, entry.path()))
        .collect::<Vec<_>>();

    // 并行编译，收集全部失败
    let failures = tasks
        .par_iter()
        .filter_map(|task| {
            log::info!("Compiling shader: {:?}", task.shader_path);
            task.compile().err()
        })
        .collect::<Vec<_>>();

    for e in &failures {
        log::error!("{:#}", e);
    }
    anyhow::ensure!(failures.is_empty(), "{} of {} shaders failed to compile", failures.len(), tasks.len());

    log::info!("Shader compilation completed: {} shaders.", tasks.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_path_keeps_relative_layout() {
        let src = Path::new("/ws/shader/src");
        let build = Path::new("/ws/shader/.build");
        let task = ShaderCompileTask::new(src, build, Path::new("/ws/shader/src/demo/copy_through.comp")).unwrap();
        assert_eq!(task.output_path, Path::new("/ws/shader/.build/demo/copy_through.comp.spv"));
    }

    #[test]
    fn test_non_compute_shaders_skipped() {
        let src = Path::new("/ws/shader/src");
        let build = Path::new("/ws/shader/.build");
        assert!(ShaderCompileTask::new(src, build, Path::new("/ws/shader/src/a.frag")).is_none());
        assert!(ShaderCompileTask::new(src, build, Path::new("/ws/other/b.comp")).is_none());
    }
}
