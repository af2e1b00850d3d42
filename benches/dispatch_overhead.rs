//! Benchmarks for lifecycle and dispatch overhead on the host driver.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use kiln::driver::host::{HostDriver, WorkItem};
use kiln::prelude::*;
use std::sync::Arc;

const SOURCE: &str = "__kernel void add_one(__global uint *data) {}";

fn session() -> (Registry, Context, Queue, Program) {
    let driver = Arc::new(HostDriver::new());
    driver.register_kernel("add_one", |item: &mut WorkItem<'_>| {
        let i = item.global_id(0);
        let v: u32 = item.read_elem(0, i)?;
        item.write_elem(0, i, v + 1)
    });
    let registry = Registry::with_driver(driver).unwrap();
    let ctx = Context::create_specific(&registry, DeviceKind::Cpu).unwrap();
    let device = ctx.devices().unwrap()[0];
    let queue = Queue::create(&ctx, device, QueueProps::default()).unwrap();
    let program = Program::from_source(&ctx, SOURCE, None).unwrap();
    (registry, ctx, queue, program)
}

fn bench_dispatch_round_trip(c: &mut Criterion) {
    let (_registry, ctx, queue, program) = session();
    let buffer = Buffer::create(&ctx, 1024 * 4, None, MemFlags::default()).unwrap();
    let mut kernel = Kernel::create(&program, "add_one").unwrap();
    kernel.set_arg_buffer(0, &buffer).unwrap();

    c.bench_function("dispatch_1k_items", |b| {
        b.iter(|| {
            kernel
                .run(&queue, black_box(&[1024]), None, None, &[])
                .unwrap()
                .wait()
                .unwrap();
        });
    });
}

fn bench_transfer_round_trip(c: &mut Criterion) {
    let (_registry, ctx, queue, _program) = session();
    let buffer = Buffer::create(&ctx, 64 * 1024, None, MemFlags::default()).unwrap();
    let payload = vec![0x5Au8; 64 * 1024];
    let mut out = vec![0u8; 64 * 1024];

    c.bench_function("write_read_64k", |b| {
        b.iter(|| {
            buffer.write(&queue, true, 0, black_box(&payload), &[]).unwrap();
            buffer.read(&queue, 0, black_box(&mut out), &[]).unwrap();
        });
    });
}

fn bench_program_build(c: &mut Criterion) {
    let (_registry, ctx, _queue, _program) = session();

    c.bench_function("program_build", |b| {
        b.iter(|| {
            let program = Program::from_source(&ctx, black_box(SOURCE), None).unwrap();
            drop(program);
        });
    });
}

criterion_group!(
    benches,
    bench_dispatch_round_trip,
    bench_transfer_round_trip,
    bench_program_build
);
criterion_main!(benches);
