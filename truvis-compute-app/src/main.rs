use std::{
    path::{Path, PathBuf},
    rc::Rc,
    time::Instant,
};

use anyhow::Context;
use serde::Deserialize;
use truvis_compute::{
    GfxResult,
    backends::{emulated::EmulatedDevice, vulkan::VulkanDevice},
    commands::{
        command_list::CommandList,
        command_queue::CommandQueue,
        timestamp::{TimestampQueryHeap, read_timestamps},
        work_tracker::WorkCompletionTracker,
    },
    descriptors::descriptor_table::DescriptorTable,
    diagnostics::{CaptureScope, report_live_objects},
    foundation::{
        config::{BackendKind, GfxConfig},
        gpu_device::GpuDevice,
    },
    resources::{
        memory::TypedMemoryAllocator,
        state::{ResourceState, ResourceTransition},
        texture::Format,
    },
};
use truvis_crate_tools::{init_log, resource::TruvisPath};

/// 与 `copy_through.comp` 的 `local_size_x` 一致
const GROUP_SIZE: u32 = 64;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AppConfig {
    gfx: GfxConfig,
    demo: DemoConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct DemoConfig {
    element_count: u32,
    iterations: u32,
    shader: String,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            element_count: 1024,
            iterations: 4,
            shader: "copy_through.comp".to_string(),
        }
    }
}

impl AppConfig {
    fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self = toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))?;
        config.gfx.validate()?;
        anyhow::ensure!(
            config.demo.element_count > 0 && config.demo.element_count % GROUP_SIZE == 0,
            "element_count must be a positive multiple of {GROUP_SIZE}"
        );
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    let config_path =
        std::env::args().nth(1).map(PathBuf::from).unwrap_or_else(|| TruvisPath::config_path("compute.toml"));
    let config = AppConfig::load(&config_path)?;
    init_log::init_log(init_log::parse_level(&config.gfx.log_level));
    log::info!("config: {}", config_path.display());

    match config.gfx.backend {
        BackendKind::Emulated => {
            let device = Rc::new(EmulatedDevice::new());
            let kernel_device = device.clone();
            run(device, &config, move |_| {
                Ok(kernel_device.create_compute_pipeline("copy_through", |ctx| {
                    let (src, dst) = (ctx.view(0)?, ctx.view(1)?);
                    let base = (ctx.group_id[0] * GROUP_SIZE) as usize;
                    for i in base..base + GROUP_SIZE as usize {
                        dst.store(i, src.load::<f32>(i)?)?;
                    }
                    Ok(())
                }))
            })
        }
        BackendKind::Vulkan => {
            let device = Rc::new(VulkanDevice::new(&config.gfx)?);
            log::info!("running on {:?}", device.device_name());
            let pipeline_device = device.clone();
            let spirv_path = TruvisPath::shader_build_path(&config.demo.shader);
            run(device, &config, move |table| {
                pipeline_device.create_compute_pipeline(table.heap(), &spirv_path, "copy_through")
            })
        }
    }
}

/// 上传一次输入，之后每轮 dispatch 一次 copy-through 并回读校验
fn run<D: GpuDevice>(
    device: Rc<D>,
    config: &AppConfig,
    create_pipeline: impl FnOnce(&DescriptorTable<D>) -> GfxResult<D::Pipeline>,
) -> anyhow::Result<()> {
    let demo = &config.demo;
    let allocator = TypedMemoryAllocator::new(device.clone());
    let queue = CommandQueue::new_compute(device.clone(), config.gfx.disable_gpu_timeout, "compute")?;
    let mut tracker = WorkCompletionTracker::new(&queue, "compute-tracker");
    let frequency = queue.timestamp_frequency()?;

    let capture = CaptureScope::begin(&queue, "copy-through", config.gfx.enable_capture);

    let byte_size = demo.element_count as u64 * size_of::<f32>() as u64;
    let input_data: Vec<f32> = (0..demo.element_count).map(|i| i as f32).collect();
    let input = allocator.allocate_buffer(byte_size, false, "input")?;
    let output = allocator.allocate_buffer(byte_size, true, "output")?;
    let readback = allocator.allocate_readback(byte_size, "output-readback")?;

    let mut table = DescriptorTable::new(device.clone(), 2, "copy-through-table")?;
    table.create_typed_buffer_view(&input, Format::R32Float, demo.element_count, false)?;
    table.create_typed_buffer_view(&output, Format::R32Float, demo.element_count, true)?;
    let pipeline = create_pipeline(&table)?;

    let timestamps = TimestampQueryHeap::new(&device, 2, "dispatch-timestamps")?;
    let timestamp_readback = allocator.allocate_readback(2 * size_of::<u64>() as u64, "timestamp-readback")?;

    // 上传
    let mut list = CommandList::new_compute(device.clone(), "copy-through")?;
    list.resource_barrier(&[(&input, ResourceTransition::new(ResourceState::COMMON, ResourceState::COPY_DEST))])?;
    let staging = allocator.enqueue_upload(&mut list, &input, bytemuck::cast_slice(&input_data))?;
    list.resource_barrier(&[(
        &input,
        ResourceTransition::new(ResourceState::COPY_DEST, ResourceState::NON_PIXEL_SHADER_RESOURCE),
    )])?;
    let upload_id = queue.execute_and_wait(&mut list, &mut tracker)?;
    tracker.retain_until_complete(upload_id, staging)?;

    let mut output_data = vec![0f32; demo.element_count as usize];
    for iteration in 0..demo.iterations {
        let cpu_begin = Instant::now();

        list.reset()?;
        list.write_timestamp(&timestamps, 0)?;
        list.dispatch(&pipeline, &table, [demo.element_count / GROUP_SIZE, 1, 1])?;
        list.write_timestamp(&timestamps, 1)?;
        list.resource_barrier(&[(
            &output,
            ResourceTransition::new(ResourceState::UNORDERED_ACCESS, ResourceState::COPY_SOURCE),
        )])?;
        list.copy_resource(&readback, &output)?;
        list.resolve_timestamps(&timestamps, 2, &timestamp_readback)?;
        list.resource_barrier(&[(
            &output,
            ResourceTransition::new(ResourceState::COPY_SOURCE, ResourceState::UNORDERED_ACCESS),
        )])?;
        let id = queue.execute_and_wait(&mut list, &mut tracker)?;

        let cpu_elapsed = cpu_begin.elapsed();
        allocator.copy_from_gpu(bytemuck::cast_slice_mut(&mut output_data), &readback)?;
        anyhow::ensure!(output_data == input_data, "iteration {iteration}: readback does not match input");

        let seconds = read_timestamps(&allocator, &timestamp_readback, 2, frequency)?;
        log::info!(
            "iteration {} (work {}): gpu {:.1} us, cpu {} us",
            iteration,
            id,
            (seconds[1] - seconds[0]) * 1e6,
            cpu_elapsed.as_micros()
        );
    }

    capture.end();

    drop((list, pipeline, table, timestamps));
    drop((input, output, readback, timestamp_readback));
    drop(tracker);
    drop(queue);
    let live = report_live_objects(device.as_ref());
    anyhow::ensure!(live == 0, "{live} device objects leaked");

    log::info!("{} iterations verified on {} backend", demo.iterations, device.backend_name());
    Ok(())
}
