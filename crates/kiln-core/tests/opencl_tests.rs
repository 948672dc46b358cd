//! Integration tests against a real OpenCL platform.
//! Run with: cargo test -p kiln-core --features opencl-tests -- --nocapture

#![cfg(feature = "opencl-tests")]

use std::sync::Arc;

use kiln_core::runtime::OpenClRuntime;
use kiln_core::{Buffer, CommandQueue, Context, Device, Kernel, NdRange, Platform, Program, SharedRuntime};

const SCALE: &str = "
__kernel void scale(const float factor, __global float* data) {
    const size_t i = get_global_id(0);
    data[i] *= factor;
}
";

fn runtime() -> SharedRuntime {
    Arc::new(OpenClRuntime::load().expect("no OpenCL loader installed"))
}

#[test]
fn test_platform_and_device() {
    let rt = runtime();
    let platforms = Platform::all(&rt).unwrap();
    assert!(!platforms.is_empty());
    assert!(!platforms[0].name().unwrap().is_empty());

    let device = Device::new(&platforms[0], 0).unwrap();
    assert!(device.compute_units().unwrap() > 0);
    assert!(device.max_work_item_dimensions().unwrap() >= 1);
    println!("{} on {}", device.name().unwrap(), platforms[0].name().unwrap());
}

#[test]
fn test_round_trip_and_scale() {
    let rt = runtime();
    let device = Device::new(&Platform::new(&rt, 0).unwrap(), 0).unwrap();
    let context = Context::new(&device).unwrap();
    let queue = CommandQueue::new(&context, &device).unwrap();

    let data: Vec<f32> = (0..1024).map(|i| i as f32 * 0.5).collect();
    let buffer = Buffer::from_host(&context, &queue, &data).unwrap();
    assert_eq!(buffer.read_to_vec(&queue).unwrap(), data);

    let mut program = Program::from_source(&context, SCALE).unwrap();
    program.build(&device, &[]).unwrap();
    let mut kernel = Kernel::new(&program, "scale").unwrap();
    kernel.set_arguments(&[&2.0f32, &buffer]).unwrap();
    kernel.run(&queue, &NdRange::d1(data.len()), &[]).unwrap().wait().unwrap();

    let scaled = buffer.read_to_vec(&queue).unwrap();
    assert!(scaled.iter().zip(&data).all(|(s, d)| *s == d * 2.0));
}

#[test]
fn test_build_failure_log() {
    let rt = runtime();
    let device = Device::new(&Platform::new(&rt, 0).unwrap(), 0).unwrap();
    let context = Context::new(&device).unwrap();
    let mut program = Program::from_source(&context, "__kernel void broken( {").unwrap();
    let err = program.build(&device, &[]).unwrap_err();
    assert!(!err.build_log().unwrap_or_default().is_empty());
}
