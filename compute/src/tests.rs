//! End-to-end scenarios on the host device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::*;

const INCREMENT: &[u8] = b"increment";
const COPY_AND_INDEX: &[u8] = b"copy-and-index";
const SUM_UNIFORM: &[u8] = b"sum-uniform";
const ADD_PARAM: &[u8] = b"add-param";
const PANIC: &[u8] = b"panic";

fn host_manager(families: &[u32]) -> (Arc<HostDevice>, Manager) {
    let _ = env_logger::builder().is_test(true).try_init();
    let host = Arc::new(HostDevice::with_queues(families));
    host.register_kernel(INCREMENT, [1, 1, 1], |inv| {
        let i = inv.global_id()[0] as usize;
        let v: u32 = inv.read(0, i);
        inv.write(0, i, v + 1);
    });
    host.register_kernel(COPY_AND_INDEX, [1, 1, 1], |inv| {
        let i = inv.global_id()[0] as usize;
        let a: f32 = inv.read(0, i);
        inv.write(1, i, a);
        inv.write(0, i, i as f32);
    });
    host.register_kernel(SUM_UNIFORM, [1, 1, 1], |inv| {
        let i = inv.global_id()[0] as usize;
        let sum: u32 = (0..inv.len::<u32>(1)).map(|j| inv.read::<u32>(1, j)).sum();
        inv.write(0, i, sum);
    });
    host.register_kernel(ADD_PARAM, [1, 1, 1], |inv| {
        let i = inv.global_id()[0] as usize;
        let v: u32 = inv.read(0, i);
        let add: u32 = inv.push_constant(0);
        inv.write(0, i, v + add);
    });
    host.register_kernel(PANIC, [1, 1, 1], |_| panic!("bad kernel"));
    let mgr = Manager::from_device(host.clone(), true);
    (host, mgr)
}

/// One invocation per element of the first buffer.
fn spec(buffers: Vec<Arc<Buffer>>, kernel: Kernel) -> AlgorithmSpec {
    let groups = Workgroup::new(buffers.first().map_or(1, |b| b.len() as u32), 1, 1);
    AlgorithmSpec::new(buffers, kernel).with_workgroup(groups)
}

fn increment(mgr: &Manager, buffer: &Arc<Buffer>) -> Arc<Algorithm> {
    mgr.algorithm(spec(vec![buffer.clone()], Kernel::new(INCREMENT, vec![BindingKind::Storage]))).unwrap()
}

#[test]
fn test_round_trip() {
    let (_host, mgr) = host_manager(&[0]);
    let data = [1.5f32, -2.0, 3.25];
    let b = mgr.buffer(&data).unwrap();
    let seq = mgr.sequence().unwrap();
    seq.eval_op(Operation::sync_device(vec![b.clone()])).unwrap();
    assert_eq!(b.authority(), Authority::Device);

    // Clobber the staging copy; syncing back must restore it from the device.
    b.write(&[0.0f32; 3]).unwrap();
    seq.eval_op(Operation::sync_local(vec![b.clone()])).unwrap();
    assert_eq!(b.authority(), Authority::Host);
    assert_eq!(b.read::<f32>().unwrap(), data);
}

#[test]
fn test_increment_in_recording_order() {
    let (_host, mgr) = host_manager(&[0]);
    let a = mgr.buffer(&[1u32, 2, 3]).unwrap();
    let alg = increment(&mgr, &a);
    let seq = mgr.sequence().unwrap();
    seq.begin().unwrap();
    seq.record(Operation::sync_device(vec![a.clone()]))
        .and_then(|s| s.record(Operation::dispatch(alg)))
        .and_then(|s| s.record(Operation::compute_barrier(vec![a.clone()])))
        .and_then(|s| s.record(Operation::sync_local(vec![a.clone()])))
        .unwrap();
    seq.end().unwrap();
    seq.eval().unwrap();
    assert_eq!(a.read::<u32>().unwrap(), vec![2, 3, 4]);
}

#[test]
fn test_copy_size_mismatch_copies_nothing() {
    let (_host, mgr) = host_manager(&[0]);
    let src = mgr.buffer(&[1u32, 2, 3]).unwrap();
    let dst = mgr.buffer(&[9u32, 9]).unwrap();
    let err = Operation::copy(src.clone(), dst.clone()).unwrap_err();
    assert!(matches!(err, ComputeError::SizeMismatch { expected: 8, actual: 12 }));

    let mut rec = CommandRecorder::new();
    assert!(dst.record_copy_from(&src, &mut rec).is_err());
    assert!(rec.is_empty());
    assert_eq!(dst.read::<u32>().unwrap(), vec![9, 9]);
}

#[test]
fn test_copy_between_buffers() {
    let (_host, mgr) = host_manager(&[0]);
    let src = mgr.buffer(&[4u32, 5, 6]).unwrap();
    let dst = mgr.buffer(&[0u32; 3]).unwrap();
    let seq = mgr.sequence().unwrap();
    seq.begin().unwrap();
    seq.record(Operation::sync_device(vec![src.clone(), dst.clone()])).unwrap();
    seq.record(Operation::copy(src.clone(), dst.clone()).unwrap()).unwrap();
    seq.record(Operation::sync_local(vec![dst.clone()])).unwrap();
    seq.end().unwrap();
    seq.eval().unwrap();
    assert_eq!(dst.read::<u32>().unwrap(), vec![4, 5, 6]);
}

#[test]
fn test_replay_runs_recording_again() {
    let (_host, mgr) = host_manager(&[0]);
    let a = mgr.buffer(&[10u32, 20, 30]).unwrap();
    let alg = increment(&mgr, &a);
    let seq = mgr.sequence().unwrap();
    seq.eval_op(Operation::sync_device(vec![a.clone()])).unwrap();

    seq.begin().unwrap();
    seq.record(Operation::dispatch(alg)).unwrap();
    seq.record(Operation::sync_local(vec![a.clone()])).unwrap();
    seq.end().unwrap();
    seq.eval().unwrap();
    assert_eq!(seq.state(), SequenceState::Idle);
    seq.eval().unwrap();
    assert_eq!(a.read::<u32>().unwrap(), vec![12, 22, 32]);
}

#[test]
fn test_copy_and_index() {
    let (_host, mgr) = host_manager(&[0]);
    let a = mgr.buffer(&[3.0f32, 4.0, 5.0]).unwrap();
    let b = mgr.buffer(&[0.0f32; 3]).unwrap();
    let alg = mgr
        .algorithm(spec(
            vec![a.clone(), b.clone()],
            Kernel::new(COPY_AND_INDEX, vec![BindingKind::Storage, BindingKind::Storage]),
        ))
        .unwrap();
    let seq = mgr.sequence().unwrap();
    seq.begin().unwrap();
    seq.record(Operation::sync_device(vec![a.clone(), b.clone()])).unwrap();
    seq.record(Operation::dispatch(alg)).unwrap();
    seq.record(Operation::sync_local(vec![a.clone(), b.clone()])).unwrap();
    seq.end().unwrap();
    seq.eval().unwrap();
    assert_eq!(a.read::<f32>().unwrap(), vec![0.0, 1.0, 2.0]);
    assert_eq!(b.read::<f32>().unwrap(), vec![3.0, 4.0, 5.0]);
}

#[test]
fn test_timeout_leaves_sequence_retriable() {
    let (host, mgr) = host_manager(&[0]);
    let gate = Arc::new(AtomicBool::new(false));
    let code: &[u8] = b"gated";
    let kernel_gate = gate.clone();
    host.register_kernel(code, [1, 1, 1], move |_| {
        while !kernel_gate.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(1));
        }
    });
    let a = mgr.buffer(&[0u32]).unwrap();
    let alg = mgr
        .algorithm(spec(vec![a.clone()], Kernel::new(code, vec![BindingKind::Storage])))
        .unwrap();
    let seq = mgr.sequence().unwrap();
    seq.begin().unwrap();
    seq.record(Operation::dispatch(alg)).unwrap();
    seq.end().unwrap();
    seq.eval_async().unwrap();

    let err = seq.eval_await(1_000_000).unwrap_err();
    assert!(matches!(err, ComputeError::Timeout(1_000_000)));
    assert_eq!(seq.state(), SequenceState::Submitted);
    assert!(seq.is_running());

    gate.store(true, Ordering::Release);
    seq.eval_await(u64::MAX).unwrap();
    assert_eq!(seq.state(), SequenceState::Idle);
    assert!(!seq.is_running());
}

#[test]
fn test_host_read_before_sync_local_is_stale() {
    let (_host, mgr) = host_manager(&[0]);
    let a = mgr.buffer(&[1u32, 2, 3]).unwrap();
    let alg = increment(&mgr, &a);
    let seq = mgr.sequence().unwrap();
    seq.begin().unwrap();
    seq.record(Operation::sync_device(vec![a.clone()])).unwrap();
    seq.record(Operation::dispatch(alg)).unwrap();
    seq.end().unwrap();
    seq.eval().unwrap();

    assert_eq!(a.authority(), Authority::Device);
    assert_eq!(a.read::<u32>().unwrap(), vec![1, 2, 3]);

    seq.eval_op(Operation::sync_local(vec![a.clone()])).unwrap();
    assert_eq!(a.read::<u32>().unwrap(), vec![2, 3, 4]);
}

#[test]
fn test_rebuild_rerecords_on_replay() {
    let (_host, mgr) = host_manager(&[0]);
    let a = mgr.buffer(&[1u32, 1]).unwrap();
    let b = mgr.buffer(&[5u32, 5]).unwrap();
    let alg = increment(&mgr, &a);
    let seq = mgr.sequence().unwrap();
    seq.begin().unwrap();
    seq.record(Operation::sync_device(vec![a.clone(), b.clone()])).unwrap();
    seq.record(Operation::dispatch(alg.clone())).unwrap();
    seq.record(Operation::sync_local(vec![a.clone(), b.clone()])).unwrap();
    seq.end().unwrap();
    seq.eval().unwrap();
    assert_eq!(a.read::<u32>().unwrap(), vec![2, 2]);

    let before = alg.generation();
    alg.rebuild(vec![b.clone()]).unwrap();
    assert!(alg.generation() > before);
    seq.eval().unwrap();
    assert_eq!(a.read::<u32>().unwrap(), vec![2, 2]);
    assert_eq!(b.read::<u32>().unwrap(), vec![6, 6]);
}

#[test]
fn test_rebuild_while_submitted_keeps_old_binding_alive() {
    let (host, mgr) = host_manager(&[0]);
    let gate = Arc::new(AtomicBool::new(false));
    let code: &[u8] = b"held";
    let kernel_gate = gate.clone();
    host.register_kernel(code, [1, 1, 1], move |_| {
        while !kernel_gate.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(1));
        }
    });
    let a = mgr.buffer(&[1u32, 1]).unwrap();
    let b = mgr.buffer(&[5u32, 5]).unwrap();
    let held = mgr.algorithm(spec(vec![a.clone()], Kernel::new(code, vec![BindingKind::Storage]))).unwrap();
    let inc = increment(&mgr, &a);
    let seq = mgr.sequence().unwrap();
    seq.begin().unwrap();
    seq.record(Operation::sync_device(vec![a.clone(), b.clone()])).unwrap();
    seq.record(Operation::dispatch(held)).unwrap();
    seq.record(Operation::dispatch(inc.clone())).unwrap();
    seq.record(Operation::sync_local(vec![a.clone(), b.clone()])).unwrap();
    seq.end().unwrap();
    seq.eval_async().unwrap();

    // The queued dispatch of `inc` still names the old binding table.
    let rebuilt = inc.rebuild(vec![b.clone()]);
    let tables_in_flight = host.live_counts().binding_tables;
    gate.store(true, Ordering::Release);
    rebuilt.unwrap();
    seq.eval_await(u64::MAX).unwrap();
    assert!(!host.is_lost());
    assert_eq!(tables_in_flight, 3);
    assert_eq!(host.live_counts().binding_tables, 2);
    assert_eq!(a.read::<u32>().unwrap(), vec![2, 2]);

    // The replay records again against the new binding.
    seq.eval().unwrap();
    assert_eq!(a.read::<u32>().unwrap(), vec![2, 2]);
    assert_eq!(b.read::<u32>().unwrap(), vec![6, 6]);
}

#[test]
fn test_binding_layout_mismatch() {
    let (_host, mgr) = host_manager(&[0]);
    let a = mgr.buffer(&[1u32]).unwrap();
    let u = mgr.buffer_with(&[1u32], MemoryKind::Device, BindingKind::Uniform).unwrap();

    let two = Kernel::new(INCREMENT, vec![BindingKind::Storage, BindingKind::Storage]);
    let err = mgr.algorithm(spec(vec![a.clone()], two)).unwrap_err();
    assert!(matches!(err, ComputeError::BindingLayoutMismatch(_)));

    let storage = Kernel::new(INCREMENT, vec![BindingKind::Storage]);
    let err = mgr.algorithm(spec(vec![u], storage)).unwrap_err();
    assert!(matches!(err, ComputeError::BindingLayoutMismatch(_)));

    let alg = increment(&mgr, &a);
    let other = mgr.buffer(&[1u32, 2]).unwrap();
    assert!(alg.rebuild(vec![a.clone(), other]).is_err());
    assert_eq!(alg.buffers().len(), 1);
}

#[test]
fn test_uniform_buffer_sum() {
    let (_host, mgr) = host_manager(&[0]);
    let result = mgr.buffer(&[0u32; 3]).unwrap();
    let values = mgr.buffer_with(&[3u32, 4, 5, 6], MemoryKind::Device, BindingKind::Uniform).unwrap();
    let alg = mgr
        .algorithm(spec(
            vec![result.clone(), values.clone()],
            Kernel::new(SUM_UNIFORM, vec![BindingKind::Storage, BindingKind::Uniform]),
        ))
        .unwrap();
    let seq = mgr.sequence().unwrap();
    seq.begin().unwrap();
    seq.record(Operation::sync_device(vec![result.clone(), values.clone()])).unwrap();
    seq.record(Operation::dispatch(alg)).unwrap();
    seq.record(Operation::sync_local(vec![result.clone()])).unwrap();
    seq.end().unwrap();
    seq.eval().unwrap();
    assert_eq!(result.read::<u32>().unwrap(), vec![18, 18, 18]);
    // Uniform bindings are read-only, so the dispatch leaves their authority alone.
    assert_eq!(values.authority(), Authority::Device);
}

#[test]
fn test_parameter_block_override() {
    let (_host, mgr) = host_manager(&[0]);
    let a = mgr.buffer(&[1u32, 2]).unwrap();
    let alg = mgr
        .algorithm(
            spec(vec![a.clone()], Kernel::new(ADD_PARAM, vec![BindingKind::Storage])).with_params(&[10u32]),
        )
        .unwrap();
    let seq = mgr.sequence().unwrap();
    seq.begin().unwrap();
    seq.record(Operation::sync_device(vec![a.clone()])).unwrap();
    seq.record(Operation::dispatch(alg.clone())).unwrap();
    seq.record(Operation::dispatch_with(alg.clone(), &[100u32]).unwrap()).unwrap();
    seq.record(Operation::sync_local(vec![a.clone()])).unwrap();
    seq.end().unwrap();
    seq.eval().unwrap();
    assert_eq!(a.read::<u32>().unwrap(), vec![111, 112]);
    assert!(matches!(
        Operation::dispatch_with(alg, &[1u32, 2]),
        Err(ComputeError::SizeMismatch { expected: 4, actual: 8 })
    ));
}

#[test]
fn test_timestamps_one_per_operation_plus_start() {
    let (_host, mgr) = host_manager(&[0]);
    let a = mgr.buffer(&[1u32; 8]).unwrap();
    let alg = increment(&mgr, &a);
    let seq = mgr.sequence_on(0, 10).unwrap();
    seq.begin().unwrap();
    seq.record(Operation::sync_device(vec![a.clone()])).unwrap();
    seq.record(Operation::dispatch(alg)).unwrap();
    seq.record(Operation::sync_local(vec![a.clone()])).unwrap();
    seq.end().unwrap();
    seq.eval().unwrap();

    let ts = seq.timestamps().unwrap();
    assert_eq!(ts.len(), 4);
    assert!(ts.windows(2).all(|w| w[0] <= w[1]));
    let durations = seq.operation_durations().unwrap();
    assert_eq!(durations.len(), 3);
    assert_eq!(seq.total_duration().unwrap(), durations.iter().sum::<Duration>());
}

#[test]
fn test_manager_teardown_order_and_idempotency() {
    let (host, mgr) = host_manager(&[0]);
    let a = mgr.buffer(&[1u32, 2]).unwrap();
    let b = mgr.buffer(&[3u32, 4]).unwrap();
    let alg = increment(&mgr, &a);
    let seq = mgr.sequence_on(0, 4).unwrap();
    seq.begin().unwrap();
    seq.record(Operation::sync_device(vec![a.clone()])).unwrap();
    seq.record(Operation::dispatch(alg.clone())).unwrap();
    seq.end().unwrap();
    seq.eval_async().unwrap();

    // Already released by its owner, so teardown skips it.
    b.destroy();
    let teardown = mgr.destroy();
    assert_eq!(teardown, Teardown { sequences: 1, algorithms: 1, buffers: 1 });
    assert!(!seq.is_init());
    assert!(!alg.is_init());
    assert!(!a.is_allocated());
    assert_eq!(host.live_counts(), device::host::HostCounts::default());

    seq.destroy();
    alg.destroy();
    a.destroy();
    assert_eq!(mgr.destroy(), Teardown::default());
    assert!(matches!(seq.eval_async(), Err(ComputeError::InvalidResource(_))));
}

#[test]
fn test_panicking_kernel_loses_device() {
    let (host, mgr) = host_manager(&[0]);
    let a = mgr.buffer(&[1u32]).unwrap();
    let alg = mgr
        .algorithm(spec(vec![a.clone()], Kernel::new(PANIC, vec![BindingKind::Storage])))
        .unwrap();
    let seq = mgr.sequence().unwrap();
    let err = seq.eval_op(Operation::dispatch(alg)).unwrap_err();
    assert!(matches!(err, ComputeError::DeviceLost(_)));
    assert!(host.is_lost());

    let other = mgr.sequence().unwrap();
    let err = other.eval_op(Operation::sync_device(vec![a])).unwrap_err();
    assert!(matches!(err, ComputeError::DeviceLost(_)));
}

#[test]
fn test_sequences_on_separate_queues() {
    let (_host, mgr) = host_manager(&[0, 0]);
    let a = mgr.buffer(&[0u32; 4]).unwrap();
    let b = mgr.buffer(&[100u32; 4]).unwrap();
    let run = |buffer: &Arc<Buffer>, queue: usize| {
        let alg = increment(&mgr, buffer);
        let seq = mgr.sequence_on(queue, 0).unwrap();
        assert_eq!(seq.queue().index, queue as u32);
        seq.begin().unwrap();
        seq.record(Operation::sync_device(vec![buffer.clone()])).unwrap();
        seq.record(Operation::dispatch(alg)).unwrap();
        seq.record(Operation::sync_local(vec![buffer.clone()])).unwrap();
        seq.end().unwrap();
        seq
    };
    let first = run(&a, 0);
    let second = run(&b, 1);
    first.eval_async().unwrap();
    second.eval_async().unwrap();
    second.eval_await(u64::MAX).unwrap();
    first.eval_await(u64::MAX).unwrap();
    assert_eq!(a.read::<u32>().unwrap(), vec![1; 4]);
    assert_eq!(b.read::<u32>().unwrap(), vec![101; 4]);
}

#[test]
fn test_manager_from_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("compute.json");
    std::fs::write(&path, r#"{ "backend": "host", "host_queues": 2, "log": { "level": "debug" } }"#).unwrap();
    let config = ComputeConfig::load(&path).unwrap();
    assert_eq!(config.log.level_filter().unwrap(), log::LevelFilter::Debug);
    let mgr = Manager::with_config(config).unwrap();
    assert_eq!(mgr.queues().len(), 2);
    assert!(mgr.registry().is_some());
}

#[test]
fn test_missing_memory_type() {
    let host = HostDevice::with_memory_types(&[0], &[MemoryLocation::DeviceLocal]);
    let dev: DeviceRef = Arc::new(host);
    let err = Buffer::from_slice(dev.clone(), &[1u32], MemoryKind::Device, BindingKind::Storage).unwrap_err();
    assert!(matches!(err, ComputeError::NoSuitableMemoryType { location: "host-visible memory", .. }));
    assert!(Buffer::zeroed(dev, 4, ElementType::U32, MemoryKind::Storage, BindingKind::Storage).is_ok());
}
