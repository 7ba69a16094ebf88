use std::sync::Arc;

use test_case::test_case;

use crate::error::Error;
use crate::{DeviceBuffer, DevicePtr, Driver, MemoryKind, SimDriver, Stream, StreamOp};

fn driver() -> (Arc<SimDriver>, Arc<dyn Driver>) {
    let sim = Arc::new(SimDriver::new());
    let driver: Arc<dyn Driver> = sim.clone();
    (sim, driver)
}

#[test]
fn test_device_ptr_offset() {
    let ptr = DevicePtr(0x1000);
    assert_eq!(ptr.offset(8), Some(DevicePtr(0x1008)));
    assert_eq!(DevicePtr(u64::MAX).offset(1), None);
    assert!(DevicePtr::NULL.is_null());
    assert_eq!(ptr.to_string(), "0x1000");
}

#[test_case(MemoryKind::Device ; "device")]
#[test_case(MemoryKind::HostPinned ; "host pinned")]
fn test_buffer_allocate_and_copy(kind: MemoryKind) {
    let (sim, driver) = driver();
    let buffer = DeviceBuffer::allocate(&driver, 16, kind).unwrap();
    assert_eq!(buffer.size(), 16);
    assert_eq!(sim.allocation_kind(buffer.ptr()), Some(kind));

    buffer.copyin(4, &[1, 2, 3, 4]).unwrap();
    let mut out = [0u8; 8];
    buffer.copyout(0, &mut out).unwrap();
    assert_eq!(out, [0, 0, 0, 0, 1, 2, 3, 4]);
}

#[test_case(16, 1 ; "one past end")]
#[test_case(12, 8 ; "straddles end")]
#[test_case(usize::MAX, 1 ; "offset overflow")]
fn test_buffer_copy_out_of_bounds(offset: usize, len: usize) {
    let (_, driver) = driver();
    let buffer = DeviceBuffer::allocate(&driver, 16, MemoryKind::Device).unwrap();
    let result = buffer.copyin(offset, &vec![0u8; len]);
    assert!(matches!(result, Err(Error::OutOfBounds { .. })), "{result:?}");
}

#[test]
fn test_buffer_released_on_drop() {
    let (sim, driver) = driver();
    {
        let _a = DeviceBuffer::allocate(&driver, 64, MemoryKind::Device).unwrap();
        let _b = DeviceBuffer::allocate(&driver, 128, MemoryKind::Device).unwrap();
        assert_eq!(sim.live_allocations(), 2);
    }
    assert_eq!(sim.live_allocations(), 0);
    assert_eq!(sim.total_allocations(), 2);
}

#[test]
fn test_async_copy_logged_on_stream() {
    let (sim, driver) = driver();
    let stream = Stream::new(&driver).unwrap();
    let buffer = DeviceBuffer::allocate(&driver, 8, MemoryKind::Device).unwrap();

    buffer.copyin_async(0, &7u64.to_le_bytes(), stream.id()).unwrap();
    stream.synchronize().unwrap();

    assert_eq!(sim.read_u64(buffer.ptr()).unwrap(), 7);
    assert_eq!(sim.ops(), vec![(stream.id(), StreamOp::CopyHtoD { dst: buffer.ptr(), len: 8 })]);
}
