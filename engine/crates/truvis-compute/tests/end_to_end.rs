use std::{rc::Rc, time::Duration};

use truvis_compute::{
    backends::emulated::EmulatedDevice,
    commands::{
        command_list::CommandList,
        command_queue::CommandQueue,
        timestamp::{TimestampQueryHeap, read_timestamps},
        work_tracker::{WaitOutcome, WorkCompletionTracker},
    },
    descriptors::descriptor_table::DescriptorTable,
    diagnostics::report_live_objects,
    resources::{
        memory::TypedMemoryAllocator,
        state::{ResourceState, ResourceTransition},
        texture::Format,
    },
};

const ELEMENT_COUNT: u32 = 1024;
const GROUP_SIZE: u32 = 64;

#[test]
fn test_upload_dispatch_readback() {
    truvis_crate_tools::init_log::init_test_log();

    let device = Rc::new(EmulatedDevice::new().with_execution_delay(Duration::from_millis(1)));
    let allocator = TypedMemoryAllocator::new(device.clone());
    let queue = CommandQueue::new_compute(device.clone(), true, "compute").unwrap();
    let mut tracker = WorkCompletionTracker::new(&queue, "compute-tracker");

    let byte_size = ELEMENT_COUNT as u64 * 4;
    let input_data: Vec<f32> = (0..ELEMENT_COUNT).map(|i| i as f32 * 0.5).collect();
    let input = allocator.allocate_buffer(byte_size, false, "input").unwrap();
    let output = allocator.allocate_buffer(byte_size, true, "output").unwrap();
    let readback = allocator.allocate_readback(byte_size, "output-readback").unwrap();

    let mut table = DescriptorTable::new(device.clone(), 4, "table").unwrap();
    table.create_typed_buffer_view(&input, Format::R32Float, ELEMENT_COUNT, false).unwrap();
    table.create_typed_buffer_view(&output, Format::R32Float, ELEMENT_COUNT, true).unwrap();
    assert_eq!(table.remaining(), 2);

    let pipeline = device.create_compute_pipeline("copy_through", |ctx| {
        let (src, dst) = (ctx.view(0)?, ctx.view(1)?);
        let base = (ctx.group_id[0] * GROUP_SIZE) as usize;
        for i in base..base + GROUP_SIZE as usize {
            dst.store(i, src.load::<f32>(i)?)?;
        }
        Ok(())
    });

    let timestamps = TimestampQueryHeap::new(&device, 2, "timestamps").unwrap();
    let timestamp_readback = allocator.allocate_readback(2 * 8, "timestamp-readback").unwrap();

    let mut list = CommandList::new_compute(device.clone(), "copy-through").unwrap();
    list.resource_barrier(&[(&input, ResourceTransition::new(ResourceState::COMMON, ResourceState::COPY_DEST))])
        .unwrap();
    let staging = allocator.enqueue_upload(&mut list, &input, bytemuck::cast_slice(&input_data)).unwrap();
    list.resource_barrier(&[(
        &input,
        ResourceTransition::new(ResourceState::COPY_DEST, ResourceState::NON_PIXEL_SHADER_RESOURCE),
    )])
    .unwrap();

    list.write_timestamp(&timestamps, 0).unwrap();
    list.dispatch(&pipeline, &table, [ELEMENT_COUNT / GROUP_SIZE, 1, 1]).unwrap();
    list.write_timestamp(&timestamps, 1).unwrap();

    list.resource_barrier(&[(
        &output,
        ResourceTransition::new(ResourceState::UNORDERED_ACCESS, ResourceState::COPY_SOURCE),
    )])
    .unwrap();
    list.copy_resource(&readback, &output).unwrap();
    list.resolve_timestamps(&timestamps, 2, &timestamp_readback).unwrap();

    queue.execute(&mut list).unwrap();
    let id = tracker.signal_work().unwrap();
    tracker.retain_until_complete(id, staging).unwrap();
    tracker.wait(id).unwrap();
    assert_eq!(tracker.retained_count(), 0);

    let mut result = vec![0f32; ELEMENT_COUNT as usize];
    allocator.copy_from_gpu(bytemuck::cast_slice_mut(&mut result), &readback).unwrap();
    assert_eq!(result, input_data);

    let frequency = queue.timestamp_frequency().unwrap();
    let seconds = read_timestamps(&allocator, &timestamp_readback, 2, frequency).unwrap();
    assert!(seconds[1] >= seconds[0]);

    drop((list, pipeline, table, timestamps));
    drop((input, output, readback, timestamp_readback));
    drop(tracker);
    drop(queue);
    assert_eq!(report_live_objects(device.as_ref()), 0);
}

#[test]
fn test_waits_across_several_submissions() {
    let device = Rc::new(EmulatedDevice::new().with_execution_delay(Duration::from_millis(20)));
    let allocator = TypedMemoryAllocator::new(device.clone());
    let queue = CommandQueue::new_copy(device.clone(), true, "copy").unwrap();
    let mut tracker = WorkCompletionTracker::new(&queue, "copy-tracker");

    let mut upload = allocator.allocate_upload(256, "upload").unwrap();
    allocator.copy_to_gpu(&mut upload, &[7u8; 256]).unwrap();
    let readback = allocator.allocate_readback(256, "readback").unwrap();

    let mut ids = Vec::new();
    for i in 0..3 {
        let mut list = CommandList::new_copy(device.clone(), &format!("copy-{i}")).unwrap();
        list.copy_buffer(&readback, &upload).unwrap();
        queue.execute(&mut list).unwrap();
        ids.push(tracker.signal_work().unwrap());
        // list 中没有需要保活的资源，执行线程持有自己的命令副本
    }
    assert_eq!(ids.iter().map(|id| id.value()).collect::<Vec<_>>(), vec![0, 1, 2]);

    // 最早的提交尚未完成
    assert_eq!(tracker.wait_timeout(ids[0], Some(Duration::ZERO)).unwrap(), WaitOutcome::TimedOut);

    // 等待最后一个提交之后，之前的提交都已完成
    tracker.wait(ids[2]).unwrap();
    assert!(tracker.poll(ids[0]).unwrap());
    assert!(tracker.poll(ids[1]).unwrap());

    let mut out = [0u8; 256];
    allocator.copy_from_gpu(&mut out, &readback).unwrap();
    assert!(out.iter().all(|&b| b == 7));
}
