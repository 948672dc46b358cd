//! Handle ownership across the public wrapper types.

use std::sync::Arc;

use kiln_core::{Buffer, CommandQueue, Context, Device, HostRuntime, KilnError, Platform, SharedRuntime};

fn host() -> (Arc<HostRuntime>, SharedRuntime) {
    let host = Arc::new(HostRuntime::default());
    let rt: SharedRuntime = host.clone();
    (host, rt)
}

#[test]
fn test_copy_survives_original() {
    let (host, rt) = host();
    let device = Device::new(&Platform::new(&rt, 0).unwrap(), 0).unwrap();
    let context = Context::new(&device).unwrap();
    let queue = CommandQueue::new(&context, &device).unwrap();

    let original = Buffer::from_host(&context, &queue, &[1.0f32, 2.0, 3.0]).unwrap();
    let copy = original.clone();
    let raw = original.handle().get().unwrap();
    assert_eq!(host.reference_count(raw), Some(2));
    drop(original);

    assert_eq!(copy.read_to_vec(&queue).unwrap(), vec![1.0, 2.0, 3.0]);
    assert_eq!(host.reference_count(raw), Some(1));
}

#[test]
fn test_drop_after_explicit_release_is_noop() {
    let (host, rt) = host();
    let device = Device::new(&Platform::new(&rt, 0).unwrap(), 0).unwrap();
    let context = Context::new(&device).unwrap();
    let raw = context.handle().get().unwrap();

    let mut handle = context.handle().try_clone().unwrap();
    handle.release().unwrap();
    handle.release().unwrap();
    drop(handle);
    assert_eq!(host.reference_count(raw), Some(1));

    drop(context);
    assert_eq!(host.reference_count(raw), None);
    assert_eq!(host.release_failures(), 0);
}

#[test]
fn test_released_handle_is_unusable() {
    let (_host, rt) = host();
    let device = Device::new(&Platform::new(&rt, 0).unwrap(), 0).unwrap();
    let mut handle = device.handle().try_clone().unwrap();
    handle.release().unwrap();
    assert!(matches!(handle.get(), Err(KilnError::Released(_))));
    assert!(matches!(handle.runtime(), Err(KilnError::Released(_))));
}

#[test]
fn test_full_sequence_leaves_nothing_behind() {
    let (host, rt) = host();
    {
        let platform = Platform::new(&rt, 0).unwrap();
        let device = Device::new(&platform, 0).unwrap();
        let context = Context::new(&device).unwrap();
        let queue = CommandQueue::new(&context, &device).unwrap();
        let a = Buffer::<u32>::new(&context, 64).unwrap();
        let b = a.clone();
        let _events = vec![
            a.copy_from_host(&queue, &[9u32; 64], 0, &[]).unwrap(),
            b.copy_from_host(&queue, &[3u32; 32], 128, &[]).unwrap(),
        ];
        assert!(host.live_objects() > 0);
    }
    assert_eq!(host.live_objects(), 0);
    assert_eq!(host.release_failures(), 0);
}
