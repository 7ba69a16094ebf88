use std::sync::Arc;

use tessel_device::{ContextEntry, DevicePtr, FailurePoint, FftsContext, LaunchRecord, StreamOp};

use crate::addresses::{LogicalAddress, TaskAddresses, TensorBinding};
use crate::dump::DumpEntry;
use crate::error::Error;
use crate::task::{FftsContextDesc, FftsPlusTask, KernelTask, SingleOpTask, TaskState};
use crate::test::helpers::{Harness, atomic_addresses, atomic_op, atomic_tiling, device_bindings, plain_tiling, wide_op};
use crate::tiling::TilingResult;

fn word(bytes: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

fn ptr(addresses: &TaskAddresses, addr: LogicalAddress) -> u64 {
    addresses.device_ptr(addr).unwrap().addr()
}

fn copies(h: &Harness) -> usize {
    h.sim.ops().iter().filter(|(_, op)| matches!(op, StreamOp::CopyHtoD { .. })).count()
}

fn wide_addresses() -> TaskAddresses {
    TaskAddresses::builder().inputs(device_bindings(0x1000, 1)).outputs(device_bindings(0x2000, 1)).build()
}

// =============================================================================
// Kernel tasks
// =============================================================================

#[test]
fn test_kernel_task_with_atomic_clear() {
    let h = Harness::new(atomic_tiling());
    let addresses = atomic_addresses(&h);
    let task = KernelTask::build(h.ctx.clone(), Arc::new(atomic_op()), addresses).unwrap();

    assert_eq!(task.state(), TaskState::Assembled);
    assert_eq!(task.dump().unwrap().len(), 7);

    let clear = task.atomic_clear().unwrap();
    assert_eq!(clear.format().format.to_string(), "{o_instance0}{ws*}");
    assert_eq!(clear.subset().workspaces.as_slice(), &[0]);

    let args = task.args().unwrap();
    assert_eq!(args.segments().len(), 2);
    assert_eq!(args.segments()[0].offset, 0);
    assert_eq!(args.segments()[1].offset, 128);
    assert_eq!(args.segments()[1].assembled.dump.entries(), &[DumpEntry::Output(0), DumpEntry::Workspace(0)]);

    let reports = h.sink.reports();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].0, "matmul_atomic");
    assert_eq!((reports[0].2, reports[1].2), (7, 2));
}

#[test]
fn test_kernel_launch_order() {
    let h = Harness::new(atomic_tiling());
    let stream = h.stream();
    let addresses = atomic_addresses(&h);
    let mut task = KernelTask::build(h.ctx.clone(), Arc::new(atomic_op()), addresses.clone()).unwrap();

    task.launch(&stream).unwrap();
    assert_eq!(task.state(), TaskState::Dispatched);

    let launches = h.sim.launches();
    assert_eq!(launches.len(), 2);
    let LaunchRecord::Kernel { launch: clear, args: clear_args } = &launches[0] else {
        panic!("atomic clear must launch first, got {:?}", launches[0]);
    };
    assert_eq!(clear.config.block_dim, 1);
    assert_eq!(word(clear_args, 0), ptr(&addresses, LogicalAddress::Output(0)));
    assert_eq!(word(clear_args, 8), ptr(&addresses, LogicalAddress::Workspace(0)));

    let LaunchRecord::Handle { launch: main, args: main_args } = &launches[1] else {
        panic!("expected handle launch, got {:?}", launches[1]);
    };
    assert_eq!(main.tiling_key, 1001);
    assert_eq!(main.config.block_dim, 8);
    assert_eq!(main_args.as_slice(), task.args().unwrap().segments()[0].assembled.buffer.as_bytes());

    // Uploads precede both launches on the same stream.
    let ops = h.sim.ops();
    assert!(ops.iter().all(|(id, _)| *id == stream.id()));
    assert!(matches!(ops[0].1, StreamOp::CopyHtoD { len: 120, .. }));
    assert!(matches!(ops[1].1, StreamOp::CopyHtoD { len: 16, .. }));
    assert_eq!(ops[2].1, StreamOp::Launch(0));
    assert_eq!(ops[3].1, StreamOp::Launch(1));
}

#[test]
fn test_relaunch_skips_clean_upload() {
    let h = Harness::new(atomic_tiling());
    let stream = h.stream();
    let mut task = KernelTask::build(h.ctx.clone(), Arc::new(atomic_op()), atomic_addresses(&h)).unwrap();

    task.launch(&stream).unwrap();
    task.launch(&stream).unwrap();
    assert_eq!(copies(&h), 2);
    assert_eq!(h.sim.launches().len(), 4);
    assert_eq!(task.state(), TaskState::Dispatched);
}

#[test]
fn test_kernel_refresh() {
    let h = Harness::new(atomic_tiling());
    let stream = h.stream();
    let mut task = KernelTask::build(h.ctx.clone(), Arc::new(atomic_op()), atomic_addresses(&h)).unwrap();
    task.launch(&stream).unwrap();

    let next = atomic_addresses(&h);
    // Five address words in the kernel's own arguments, two in the clear's.
    assert_eq!(task.refresh(next.clone()).unwrap(), 7);
    assert_eq!(task.state(), TaskState::Resolved);
    assert_eq!(h.tiling.calls(), 1);

    task.launch(&stream).unwrap();
    assert_eq!(task.state(), TaskState::Dispatched);
    assert_eq!(copies(&h), 4);

    let launches = h.sim.launches();
    assert_eq!(word(launches[2].args(), 0), ptr(&next, LogicalAddress::Output(0)));
    assert_eq!(word(launches[3].args(), 0), ptr(&next, LogicalAddress::Input(0)));
    assert_eq!(word(launches[3].args(), 40), ptr(&next, LogicalAddress::Workspace(1)));
}

#[test]
fn test_rejected_refresh_keeps_task() {
    let h = Harness::new(atomic_tiling());
    let stream = h.stream();
    let mut task = KernelTask::build(h.ctx.clone(), Arc::new(atomic_op()), atomic_addresses(&h)).unwrap();
    task.launch(&stream).unwrap();
    let before = task.args().unwrap().segments()[0].assembled.buffer.clone();

    assert!(matches!(task.refresh(TaskAddresses::default()), Err(Error::ResolveMissingTensor { .. })));
    assert_eq!(task.state(), TaskState::Dispatched);
    assert_eq!(task.args().unwrap().segments()[0].assembled.buffer, before);
    assert!(task.launch(&stream).is_ok());
}

#[test]
fn test_tiling_failure_fails_task() {
    let h = Harness::new(atomic_tiling());
    h.tiling.push_failure("unknown shape");
    let addresses = atomic_addresses(&h);
    let mut task = KernelTask::new(h.ctx.clone(), Arc::new(atomic_op()));

    task.compile_format().unwrap();
    assert!(matches!(task.resolve(addresses.clone()), Err(Error::TilingFailed { .. })));
    assert_eq!(task.state(), TaskState::Failed);
    assert!(matches!(task.refresh(addresses), Err(Error::TaskFailed { .. })));
    assert!(matches!(task.compile_format(), Err(Error::TaskFailed { .. })));
}

#[test]
fn test_missing_clear_kernel_fails_task() {
    let h = Harness::new(atomic_tiling());
    let mut op = atomic_op();
    op.attrs.atomic_kernel = None;
    let mut task = KernelTask::new(h.ctx.clone(), Arc::new(op));

    task.compile_format().unwrap();
    assert!(matches!(task.resolve(atomic_addresses(&h)), Err(Error::MissingAtomicKernel { .. })));
    assert_eq!(task.state(), TaskState::Failed);
}

#[test]
fn test_out_of_order_steps_rejected() {
    let h = Harness::new(plain_tiling());
    let stream = h.stream();
    let mut task = KernelTask::new(h.ctx.clone(), Arc::new(wide_op(1)));

    assert!(matches!(task.resolve(wide_addresses()), Err(Error::InvalidTransition { .. })));
    assert!(matches!(task.launch(&stream), Err(Error::InvalidTransition { .. })));
    assert_eq!(task.state(), TaskState::Uninitialized);
    assert_eq!(h.tiling.calls(), 0);
}

#[test]
fn test_launch_failure_is_retryable() {
    let h = Harness::new(atomic_tiling());
    let stream = h.stream();
    let mut task = KernelTask::build(h.ctx.clone(), Arc::new(atomic_op()), atomic_addresses(&h)).unwrap();

    h.sim.fail_next(FailurePoint::Launch);
    assert!(matches!(task.launch(&stream), Err(Error::Device { .. })));
    assert_eq!(task.state(), TaskState::Assembled);

    task.launch(&stream).unwrap();
    assert_eq!(task.state(), TaskState::Dispatched);
}

#[test]
fn test_soft_sync_retiles_each_launch() {
    let h = Harness::new(plain_tiling());
    let stream = h.stream();
    let mut op = wide_op(1);
    op.attrs.soft_sync = true;
    let mut task = KernelTask::build(h.ctx.clone(), Arc::new(op), wide_addresses()).unwrap();
    assert_eq!(h.tiling.calls(), 1);
    assert_eq!(h.sink.reports().len(), 1);

    h.tiling.push(TilingResult { tiling_key: 8, data: vec![2; 16], ..plain_tiling() });
    task.launch(&stream).unwrap();
    assert_eq!(h.tiling.calls(), 2);
    assert_eq!(task.blob().unwrap().tiling_key, 8);

    // The re-tiled buffer is published again.
    let reports = h.sink.reports();
    assert_eq!(reports.len(), 2);
    assert_eq!(&reports[1].1[24..40], &[2; 16]);

    let launches = h.sim.launches();
    let LaunchRecord::Handle { launch, args } = &launches[0] else {
        panic!("expected handle launch");
    };
    assert_eq!(launch.tiling_key, 8);
    // {i*}{o*}{t}: the tiling region follows the three words.
    assert_eq!(&args[24..40], &[2; 16]);
    assert_eq!(word(args, 0), 0x1000);

    h.tiling.push_failure("shape unknown");
    assert!(matches!(task.launch(&stream), Err(Error::TilingFailed { .. })));
    assert_eq!(task.state(), TaskState::Dispatched);

    task.launch(&stream).unwrap();
    assert_eq!(task.blob().unwrap().tiling_key, 7);
}

#[test]
fn test_folded_task_reports_layout() {
    let h = Harness::new(plain_tiling());
    let addresses =
        TaskAddresses::builder().inputs(device_bindings(0x1000, 70)).outputs(device_bindings(0x9000, 1)).build();
    let task = KernelTask::build(h.ctx.clone(), Arc::new(wide_op(70)), addresses).unwrap();

    let segment = &task.args().unwrap().segments()[0];
    assert!(segment.assembled.layout.is_folded());
    let reports = h.sink.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].2, 72);
    assert!(reports[0].3);
}

// =============================================================================
// Single-op tasks
// =============================================================================

#[test]
fn test_single_op_first_launch_builds() {
    let h = Harness::new(atomic_tiling());
    let stream = h.stream();
    let mut task = SingleOpTask::new(h.ctx.clone(), Arc::new(atomic_op())).unwrap();
    assert_eq!(task.state(), TaskState::FormatCompiled);

    task.launch(&stream, device_bindings(0x1000, 2), device_bindings(0x2000, 1)).unwrap();
    assert_eq!(task.state(), TaskState::Dispatched);

    let workspaces: Vec<_> = task.workspaces().collect();
    assert_eq!(workspaces.iter().map(|&(_, size)| size).collect::<Vec<_>>(), vec![256, 1024]);

    let launches = h.sim.launches();
    assert_eq!(launches.len(), 2);
    assert_eq!(word(launches[0].args(), 0), 0x2000);
    assert_eq!(word(launches[0].args(), 8), workspaces[0].0.addr());
    assert_eq!(word(launches[1].args(), 0), 0x1000);
    assert_eq!(word(launches[1].args(), 32), workspaces[0].0.addr());
    assert_eq!(word(launches[1].args(), 40), workspaces[1].0.addr());
}

#[test]
fn test_single_op_relaunch_refreshes() {
    let h = Harness::new(atomic_tiling());
    let stream = h.stream();
    let mut task = SingleOpTask::new(h.ctx.clone(), Arc::new(atomic_op())).unwrap();

    task.launch(&stream, device_bindings(0x1000, 2), device_bindings(0x2000, 1)).unwrap();
    let allocations = h.sim.total_allocations();

    task.launch(&stream, device_bindings(0x5000, 2), device_bindings(0x6000, 1)).unwrap();
    assert_eq!(task.state(), TaskState::Dispatched);
    assert_eq!(h.tiling.calls(), 1);
    assert_eq!(h.sim.total_allocations(), allocations);

    let launches = h.sim.launches();
    assert_eq!(word(launches[2].args(), 0), 0x6000);
    assert_eq!(word(launches[3].args(), 0), 0x5000);
    assert_eq!(word(launches[3].args(), 8), 0x5100);
    assert_eq!(word(launches[3].args(), 24), 0x6000);
}

#[test]
fn test_single_op_grows_workspace() {
    let h = Harness::new(atomic_tiling());
    let stream = h.stream();
    let mut op = atomic_op();
    op.attrs.soft_sync = true;
    let mut task = SingleOpTask::new(h.ctx.clone(), Arc::new(op)).unwrap();

    task.launch(&stream, device_bindings(0x1000, 2), device_bindings(0x2000, 1)).unwrap();
    let first: Vec<_> = task.workspaces().collect();

    h.tiling.push(TilingResult { workspace_sizes: vec![4096, 1024], ..atomic_tiling() });
    task.launch(&stream, device_bindings(0x1000, 2), device_bindings(0x2000, 1)).unwrap();
    let second: Vec<_> = task.workspaces().collect();

    assert_eq!(second[0].1, 4096);
    assert_ne!(second[0].0, first[0].0);
    assert_eq!(second[1], first[1]);
    assert_eq!(h.tiling.calls(), 2);

    let launches = h.sim.launches();
    assert_eq!(word(launches[2].args(), 8), second[0].0.addr());
    assert_eq!(word(launches[3].args(), 32), second[0].0.addr());
}

#[test]
fn test_single_op_first_tiling_failure() {
    let h = Harness::new(atomic_tiling());
    let stream = h.stream();
    h.tiling.push_failure("bad shape");
    let mut task = SingleOpTask::new(h.ctx.clone(), Arc::new(atomic_op())).unwrap();

    let inputs = || device_bindings(0x1000, 2);
    let outputs = || device_bindings(0x2000, 1);
    assert!(matches!(task.launch(&stream, inputs(), outputs()), Err(Error::TilingFailed { .. })));
    assert_eq!(task.state(), TaskState::Failed);
    assert!(matches!(task.launch(&stream, inputs(), outputs()), Err(Error::TaskFailed { .. })));
    assert!(h.sim.launches().is_empty());
}

#[test]
fn test_single_op_bad_bindings_fail_build() {
    let h = Harness::new(atomic_tiling());
    let stream = h.stream();
    let mut task = SingleOpTask::new(h.ctx.clone(), Arc::new(atomic_op())).unwrap();

    let launched = task.launch(&stream, device_bindings(0x1000, 1), device_bindings(0x2000, 1));
    assert!(matches!(launched, Err(Error::ResolveInstanceRange { expected: 2, actual: 1, .. })));
    assert_eq!(task.state(), TaskState::Failed);
}

#[test]
fn test_single_op_overflow_address() {
    let h = Harness::new(plain_tiling());
    let stream = h.stream();
    let mut op = wide_op(1);
    op.attrs.overflow_check = true;
    let mut task = SingleOpTask::new(h.ctx.clone(), Arc::new(op)).unwrap();
    assert!(!task.overflow_addr().is_null());

    task.launch(&stream, device_bindings(0x1000, 1), device_bindings(0x2000, 1)).unwrap();
    // {i*}{o*}{ws*}{t}{overflow_addr}
    assert_eq!(word(h.sim.launches()[0].args(), 24), task.overflow_addr().addr());
}

// =============================================================================
// FFTS+ tasks
// =============================================================================

const CONTROL: DevicePtr = DevicePtr(0xffff_0000);

struct FftsFixture {
    descs: Vec<FftsContextDesc>,
    addresses: Vec<TaskAddresses>,
    /// Source and destination of the data-movement context.
    movement: (DevicePtr, DevicePtr),
}

fn ffts_fixture(h: &Harness) -> FftsFixture {
    let buffers = h.alloc(2, 64);
    let (src, dst) = (buffers[0], buffers[1]);
    let descs = vec![
        FftsContextDesc::Compute { op: Arc::new(atomic_op()), mixed: false },
        FftsContextDesc::DataMovement { src: LogicalAddress::Output(0), dst: LogicalAddress::Input(0), len: 64 },
        FftsContextDesc::Compute { op: Arc::new(wide_op(1)), mixed: true },
    ];
    let addresses = vec![
        atomic_addresses(h),
        TaskAddresses::builder()
            .inputs(vec![TensorBinding::device(dst)])
            .outputs(vec![TensorBinding::device(src)])
            .build(),
        TaskAddresses { ffts_addr: CONTROL, ..wide_addresses() },
    ];
    FftsFixture { descs, addresses, movement: (src, dst) }
}

#[test]
fn test_ffts_build_and_descriptor() {
    let h = Harness::new(plain_tiling());
    h.tiling.push(atomic_tiling());
    let fixture = ffts_fixture(&h);
    let task = FftsPlusTask::build(h.ctx.clone(), "ffts_graph", fixture.descs, fixture.addresses).unwrap();

    assert_eq!(task.state(), TaskState::Assembled);
    assert_eq!(task.context_count(), 3);
    assert_eq!(task.args().segments().len(), 3);

    let descriptor = task.descriptor().unwrap();
    assert_eq!(descriptor.contexts.len(), 4);
    assert!(matches!(
        descriptor.contexts[0],
        FftsContext::AiCore { entry: ContextEntry::Function(_), mixed: false, .. }
    ));
    assert!(matches!(
        descriptor.contexts[1],
        FftsContext::AiCore { entry: ContextEntry::Handle { tiling_key: 1001, .. }, mixed: false, .. }
    ));
    let (src, dst) = fixture.movement;
    assert_eq!(descriptor.contexts[2], FftsContext::DataMovement { src, dst, len: 64 });
    assert!(matches!(descriptor.contexts[3], FftsContext::AiCore { mixed: true, .. }));
}

#[test]
fn test_ffts_launch() {
    let h = Harness::new(plain_tiling());
    h.tiling.push(atomic_tiling());
    let stream = h.stream();
    let fixture = ffts_fixture(&h);
    let (src, dst) = fixture.movement;
    let mut task = FftsPlusTask::build(h.ctx.clone(), "ffts_graph", fixture.descs, fixture.addresses).unwrap();

    h.sim.write(src, &[0x5a; 64]).unwrap();
    task.launch(&stream).unwrap();
    assert_eq!(task.state(), TaskState::Dispatched);
    assert_eq!(h.sim.read(dst, 64).unwrap(), vec![0x5a; 64]);

    let launches = h.sim.launches();
    let LaunchRecord::FftsPlus { launch, args } = &launches[0] else {
        panic!("expected ffts+ launch");
    };
    assert_eq!(launch.contexts.len(), 4);
    assert_eq!(args.len(), 3);
    // Mixed context: control address first, then {i*}{o*}.
    assert_eq!(word(&args[2], 0), CONTROL.addr());
    assert_eq!(word(&args[2], 8), 0x1000);
    assert_eq!(word(&args[2], 16), 0x2000);
}

#[test]
fn test_ffts_refresh() {
    let h = Harness::new(plain_tiling());
    h.tiling.push(atomic_tiling());
    let stream = h.stream();
    let fixture = ffts_fixture(&h);
    let mut task = FftsPlusTask::build(h.ctx.clone(), "ffts_graph", fixture.descs, fixture.addresses).unwrap();
    task.launch(&stream).unwrap();

    let next = ffts_fixture(&h);
    let (src, dst) = next.movement;
    let patched = task.refresh(next.addresses.clone()).unwrap();
    // Clear: 2, atomic kernel: 5, mixed kernel: 2.
    assert_eq!(patched, 9);
    assert_eq!(task.state(), TaskState::Resolved);

    let descriptor = task.descriptor().unwrap();
    assert_eq!(descriptor.contexts[2], FftsContext::DataMovement { src, dst, len: 64 });

    task.launch(&stream).unwrap();
    let launches = h.sim.launches();
    let LaunchRecord::FftsPlus { args, .. } = &launches[1] else {
        panic!("expected ffts+ launch");
    };
    assert_eq!(word(&args[1], 0), ptr(&next.addresses[0], LogicalAddress::Input(0)));

    assert!(matches!(task.refresh(vec![TaskAddresses::default()]), Err(Error::ResolveIndexOutOfRange { .. })));
    assert_eq!(task.state(), TaskState::Dispatched);
}

#[test]
fn test_ffts_rejects_soft_sync() {
    let h = Harness::new(plain_tiling());
    let mut op = wide_op(1);
    op.attrs.soft_sync = true;
    let descs = vec![FftsContextDesc::Compute { op: Arc::new(op), mixed: false }];

    let built = FftsPlusTask::build(h.ctx.clone(), "soft", descs, vec![wide_addresses()]);
    assert!(matches!(built, Err(Error::UnsupportedKernel { .. })));
}

#[test]
fn test_ffts_address_count_mismatch() {
    let h = Harness::new(plain_tiling());
    let descs = vec![FftsContextDesc::Compute { op: Arc::new(wide_op(1)), mixed: false }];
    let built = FftsPlusTask::build(h.ctx.clone(), "short", descs, vec![]);
    assert!(matches!(built, Err(Error::ResolveIndexOutOfRange { .. })));
}
