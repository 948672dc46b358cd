//! Compile, transfer, bind and dispatch against the host runtime.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use kiln_core::{
    Buffer, CommandQueue, Context, Device, Event, EventStatus, HostArgs, HostRuntime, Kernel, KernelLibrary, KilnError,
    LocalMemory, NdRange, Platform, Program, SharedRuntime, Status,
};

const SOURCE: &str = r#"
// Element-wise helpers used by the dispatch tests.
#define WIDTH 4

__kernel void add(__global const float* a, __global const float* b, __global float* out) {
    const size_t i = get_global_id(0);
    out[i] = a[i] + b[i];
}

__kernel void group_sum(__global const int* in, __global int* out, __local int* scratch) {
    /* one partial sum per work-group */
}

__kernel void fail(__global float* x) {}
"#;

fn library() -> KernelLibrary {
    KernelLibrary::new()
        .with("add", |range: &NdRange, args: &mut HostArgs<'_>| {
            let a: &mut [f32] = args.buffer(0)?;
            let b: &mut [f32] = args.buffer(1)?;
            let out: &mut [f32] = args.buffer(2)?;
            for i in 0..range.global()[0] {
                out[i] = a[i] + b[i];
            }
            Ok(())
        })
        .with("group_sum", |range: &NdRange, args: &mut HostArgs<'_>| {
            let group = range.local().map(|l| l[0]).ok_or("group_sum needs a local size")?;
            if args.local_size(2)? < group * 4 {
                return Err("scratch too small".to_string());
            }
            let input: &mut [i32] = args.buffer(0)?;
            let out: &mut [i32] = args.buffer(1)?;
            for (g, chunk) in input[..range.global()[0]].chunks(group).enumerate() {
                out[g] = chunk.iter().sum();
            }
            Ok(())
        })
        .with("fail", |_: &NdRange, _: &mut HostArgs<'_>| Err("deliberate failure".to_string()))
}

struct Fixture {
    device: Device,
    context: Context,
    queue: CommandQueue,
    program: Program,
}

fn fixture() -> Fixture {
    let rt: SharedRuntime = Arc::new(HostRuntime::with_library(library()));
    let device = Device::new(&Platform::new(&rt, 0).unwrap(), 0).unwrap();
    let context = Context::new(&device).unwrap();
    let queue = CommandQueue::new(&context, &device).unwrap();
    let mut program = Program::from_source(&context, SOURCE).unwrap();
    program.build(&device, &["-cl-fast-relaxed-math"]).unwrap();
    Fixture { device, context, queue, program }
}

#[test]
fn test_round_trip_is_bit_exact() {
    let f = fixture();
    let mut rng = StdRng::seed_from_u64(0x6b696c6e);
    let host: Vec<f32> = (0..4099).map(|_| f32::from_bits(rng.gen())).collect();

    let buffer = Buffer::from_host(&f.context, &f.queue, &host).unwrap();
    let back = buffer.read_to_vec(&f.queue).unwrap();

    let bits = |v: &[f32]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
    assert_eq!(bits(&back), bits(&host));
}

#[test]
fn test_add_with_event_chain() {
    let f = fixture();
    let n = 256;
    let a: Vec<f32> = (0..n).map(|i| i as f32).collect();
    let b: Vec<f32> = (0..n).map(|i| (n - i) as f32).collect();
    let da = Buffer::<f32>::new(&f.context, n).unwrap();
    let db = Buffer::<f32>::new(&f.context, n).unwrap();
    let out = Buffer::<f32>::new(&f.context, n).unwrap();
    let mut result = vec![0.0f32; n];

    let mut kernel = Kernel::new(&f.program, "add").unwrap();
    kernel.set_arguments(&[&da, &db, &out]).unwrap();
    unsafe {
        let wa = da.copy_from_host_async(&f.queue, &a, 0, &[]).unwrap();
        let wb = db.copy_from_host_async(&f.queue, &b, 0, &[]).unwrap();
        let run = kernel.run(&f.queue, &NdRange::d1(n).with_local([64, 1, 1]), &[wa, wb]).unwrap();
        let read = out.copy_from_device_async(&f.queue, &mut result, 0, &[run]).unwrap();
        read.wait().unwrap();
    }
    assert!(result.iter().all(|&x| x == n as f32));
}

#[test]
fn test_local_memory_argument() {
    let f = fixture();
    let input: Vec<i32> = (1..=16).collect();
    let din = Buffer::from_host(&f.context, &f.queue, &input).unwrap();
    let dout = Buffer::<i32>::new(&f.context, 4).unwrap();
    let mut kernel = Kernel::new(&f.program, "group_sum").unwrap();
    kernel.set_arguments(&[&din, &dout, &LocalMemory::of::<i32>(4)]).unwrap();
    kernel.launch(&f.queue, None, &[16], Some(&[4]), &[]).unwrap();
    f.queue.finish().unwrap();
    assert_eq!(dout.read_to_vec(&f.queue).unwrap(), vec![10, 26, 42, 58]);
}

#[test]
fn test_invalid_work_group_is_dispatch_error() {
    let f = fixture();
    let n = 100;
    let a = Buffer::<f32>::new(&f.context, n).unwrap();
    let mut kernel = Kernel::new(&f.program, "add").unwrap();
    kernel.set_arguments(&[&a, &a, &a]).unwrap();
    // 100 is not a multiple of 64
    let err = kernel.run(&f.queue, &NdRange::d1(n).with_local([64, 1, 1]), &[]).unwrap_err();
    assert!(matches!(err, KilnError::Dispatch { .. }));
    assert_eq!(err.status(), Some(Status::INVALID_WORK_GROUP_SIZE));
    assert!(!f.device.is_thread_config_valid(&[2048]).unwrap());
}

#[test]
fn test_failed_kernel_poisons_dependents() {
    let f = fixture();
    let x = Buffer::<f32>::new(&f.context, 4).unwrap();
    let mut kernel = Kernel::new(&f.program, "fail").unwrap();
    kernel.set_arguments(&[&x]).unwrap();
    let run = kernel.run(&f.queue, &NdRange::d1(4), &[]).unwrap();

    let mut host = [0.0f32; 4];
    let read = unsafe { x.copy_from_device_async(&f.queue, &mut host, 0, &[run.clone()]).unwrap() };
    assert!(f.queue.finish().is_err());
    assert_eq!(run.status().unwrap(), EventStatus::Error(Status::OUT_OF_RESOURCES));
    assert_eq!(
        read.status().unwrap(),
        EventStatus::Error(Status::EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST)
    );
    assert!(Event::wait_all(&[run, read]).is_err());
}

#[test]
fn test_cross_queue_dependency() {
    let f = fixture();
    let other = CommandQueue::new(&f.context, &f.device).unwrap();
    let buffer = Buffer::<u32>::new(&f.context, 8).unwrap();
    let src = [5u32; 8];
    let mut dst = [0u32; 8];
    let written = unsafe { buffer.copy_from_host_async(&f.queue, &src, 0, &[]).unwrap() };
    // blocking read on the second queue drains the first up to `written`
    buffer.copy_from_device(&other, &mut dst, 0, &[written]).unwrap();
    assert_eq!(dst, src);
}

#[test]
fn test_invalid_source_build_error_has_log() {
    let f = fixture();
    let mut program =
        Program::from_source(&f.context, "__kernel void add(__global float* a) {\n  a[0] = 1;\n").unwrap();
    let err = program.build(&f.device, &[]).unwrap_err();
    let log = err.build_log().unwrap();
    assert!(!log.is_empty());
    assert!(log.contains("error"));
    assert!(matches!(err, KilnError::Build { status: Status::BUILD_PROGRAM_FAILURE, .. }));
}
