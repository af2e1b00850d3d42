//! Ordering, wait lists and failure propagation across queues.

use kiln::driver::host::{HostDriver, WorkItem};
use kiln::prelude::*;
use std::sync::Arc;

const SOURCE: &str = "\
__kernel void add_one(__global uint *data) {}
__kernel void fail_at(__global uint *data, uint bad_index) {}
";

fn driver() -> Arc<HostDriver> {
    let driver = Arc::new(HostDriver::new());
    driver.register_kernel("add_one", |item: &mut WorkItem<'_>| {
        let i = item.global_id(0);
        let v: u32 = item.read_elem(0, i)?;
        item.write_elem(0, i, v + 1)
    });
    driver.register_kernel("fail_at", |item: &mut WorkItem<'_>| {
        let i = item.global_id(0);
        let bad: u32 = item.scalar(1)?;
        if i == bad as usize {
            return Err(Error::dispatch("synthetic payload failure"));
        }
        let v: u32 = item.read_elem(0, i)?;
        item.write_elem(0, i, v + 1)
    });
    driver
}

fn session(driver: Arc<HostDriver>) -> (Registry, Context, Program) {
    let registry = Registry::builder()
        .driver(driver)
        .config(
            Config::builder()
                .failure_policy(FailurePolicy::Propagate)
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();
    let ctx = Context::create_specific(&registry, DeviceKind::Cpu).unwrap();
    let program = Program::from_source(&ctx, SOURCE, None).unwrap();
    (registry, ctx, program)
}

#[test]
fn in_order_queue_serializes_dispatches() {
    let (_registry, ctx, program) = session(driver());
    let device = ctx.devices().unwrap()[0];
    let queue = Queue::create(&ctx, device, QueueProps::default()).unwrap();

    const N: usize = 128;
    let buffer = Buffer::create(
        &ctx,
        N * 4,
        Some(&vec![0u8; N * 4]),
        MemFlags::default(),
    )
    .unwrap();
    let mut kernel = Kernel::create(&program, "add_one").unwrap();
    kernel.set_arg_buffer(0, &buffer).unwrap();

    // Ten increments back to back with no explicit waits; in-order
    // semantics alone must make them cumulative.
    for _ in 0..10 {
        kernel.run(&queue, &[N], None, None, &[]).unwrap();
    }
    queue.finish().unwrap();

    let mut out = vec![0u8; N * 4];
    buffer.read(&queue, 0, &mut out, &[]).unwrap();
    assert!(bytemuck::cast_slice::<u8, u32>(&out).iter().all(|v| *v == 10));
}

#[test]
fn out_of_order_queue_honors_wait_lists() {
    let (_registry, ctx, program) = session(driver());
    let device = ctx.devices().unwrap()[0];
    let queue = Queue::create(&ctx, device, QueueProps::out_of_order()).unwrap();

    const N: usize = 64;
    let buffer = Buffer::create(&ctx, N * 4, None, MemFlags::default()).unwrap();
    let mut kernel = Kernel::create(&program, "add_one").unwrap();
    kernel.set_arg_buffer(0, &buffer).unwrap();

    // Chain: write, three increments, read back, each gated on the
    // previous event.
    let seed = vec![0u8; N * 4];
    let wrote = buffer.write(&queue, false, 0, &seed, &[]).unwrap();
    let first = kernel.run(&queue, &[N], None, None, &[wrote]).unwrap();
    let second = kernel.run(&queue, &[N], None, None, &[first]).unwrap();
    let third = kernel.run(&queue, &[N], None, None, &[second]).unwrap();

    let pending = buffer.read_async(&queue, 0, N * 4, &[third]).unwrap();
    let bytes = pending.wait().unwrap();
    assert!(bytemuck::cast_slice::<u8, u32>(&bytes).iter().all(|v| *v == 3));
}

#[test]
fn payload_failure_surfaces_on_the_event() {
    let (_registry, ctx, program) = session(driver());
    let device = ctx.devices().unwrap()[0];
    let queue = Queue::create(&ctx, device, QueueProps::default()).unwrap();

    const N: usize = 32;
    let buffer = Buffer::create(&ctx, N * 4, None, MemFlags::default()).unwrap();
    let mut kernel = Kernel::create(&program, "fail_at").unwrap();
    kernel.set_arg_buffer(0, &buffer).unwrap();
    kernel.set_arg(1, &7u32).unwrap();

    let event = kernel.run(&queue, &[N], None, None, &[]).unwrap();
    let err = event.wait().unwrap_err();
    assert!(matches!(err, Error::Dispatch(_)));
    assert!(err.to_string().contains("synthetic payload failure"));

    // Work items before the failing one still wrote through.
    let mut out = vec![0u8; N * 4];
    buffer.read(&queue, 0, &mut out, &[]).unwrap();
    let out: &[u32] = bytemuck::cast_slice(&out);
    assert!(out[..7].iter().all(|v| *v == 1));
    assert_eq!(out[7], 0);
}

#[test]
fn failed_dependency_fails_the_waiter() {
    let (_registry, ctx, program) = session(driver());
    let device = ctx.devices().unwrap()[0];
    let queue = Queue::create(&ctx, device, QueueProps::out_of_order()).unwrap();

    const N: usize = 16;
    let buffer = Buffer::create(&ctx, N * 4, None, MemFlags::default()).unwrap();
    let mut failing = Kernel::create(&program, "fail_at").unwrap();
    failing.set_arg_buffer(0, &buffer).unwrap();
    failing.set_arg(1, &0u32).unwrap();

    let doomed = failing.run(&queue, &[N], None, None, &[]).unwrap();
    let pending = buffer.read_async(&queue, 0, N * 4, &[doomed]).unwrap();

    let err = pending.wait().unwrap_err();
    assert!(err.to_string().contains("dependency failed"));
}

#[test]
fn dispatch_offset_shifts_global_ids() {
    let driver = Arc::new(HostDriver::new());
    driver.register_kernel("mark", |item: &mut WorkItem<'_>| {
        let i = item.global_id(0);
        item.write_elem(0, i, 1u32)
    });
    let registry = Registry::builder()
        .driver(driver)
        .config(
            Config::builder()
                .failure_policy(FailurePolicy::Propagate)
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();
    let ctx = Context::create_specific(&registry, DeviceKind::Cpu).unwrap();
    let device = ctx.devices().unwrap()[0];
    let queue = Queue::create(&ctx, device, QueueProps::default()).unwrap();
    let program =
        Program::from_source(&ctx, "__kernel void mark(__global uint *data) {}", None).unwrap();

    const N: usize = 16;
    let buffer = Buffer::create(&ctx, N * 4, None, MemFlags::default()).unwrap();
    let mut kernel = Kernel::create(&program, "mark").unwrap();
    kernel.set_arg_buffer(0, &buffer).unwrap();

    // Mark items 4..12 only.
    kernel
        .run(&queue, &[8], None, Some(&[4]), &[])
        .unwrap()
        .wait()
        .unwrap();

    let mut out = vec![0u8; N * 4];
    buffer.read(&queue, 0, &mut out, &[]).unwrap();
    let out: &[u32] = bytemuck::cast_slice(&out);
    assert!(out[..4].iter().all(|v| *v == 0));
    assert!(out[4..12].iter().all(|v| *v == 1));
    assert!(out[12..].iter().all(|v| *v == 0));
}
