//! Allocation of typed tasks inside the shared region.

use quarry_shm::ShmRegion;

use crate::errors::RuntimeResult;
use crate::ids::{DomainId, TaskNode, TaskStateId};
use crate::task::{TaskAddr, TaskHeader, TaskPayload, TaskPrio, PAYLOAD_OFFSET};

/// Allocate a task with the given header fields and payload. Returns the
/// task's address; the payload is moved into the region.
#[allow(clippy::too_many_arguments)]
pub fn alloc_task<T: TaskPayload>(
    region: &ShmRegion,
    state: TaskStateId,
    task_node: TaskNode,
    domain: DomainId,
    prio: TaskPrio,
    lane_hash: u32,
    method: u32,
    flag_bits: u32,
    payload: T,
) -> RuntimeResult<TaskAddr> {
    let size = PAYLOAD_OFFSET + std::mem::size_of::<T>();
    let raw = region.alloc(size, 64)?;
    let shm = raw.cast::<TaskHeader>();
    let header_ptr = region.resolve(shm)?;
    unsafe {
        (*header_ptr).init(
            state,
            task_node,
            domain,
            prio,
            lane_hash,
            method,
            flag_bits,
            size as u32,
        );
        let payload_ptr = (header_ptr as *mut u8).add(PAYLOAD_OFFSET) as *mut T;
        std::ptr::write(payload_ptr, payload);
    }
    Ok(TaskAddr::new(header_ptr, shm))
}

/// Release a task allocation. Payloads are plain data; buffer fields the
/// task owns must have been freed by its state's `del` beforehand.
pub fn free_task(region: &ShmRegion, task: TaskAddr) {
    let size = task.header().alloc_size as usize;
    if size == 0 {
        tracing::error!(offset = task.offset(), "double free of task");
        return;
    }
    task.header_mut().alloc_size = 0;
    region.free(task.shm().cast(), size);
}

#[cfg(test)]
mod test_task_alloc {
    use super::*;
    use crate::ids::TaskId;

    #[repr(C)]
    struct TestPayload {
        input: u64,
        output: u64,
    }
    unsafe impl TaskPayload for TestPayload {}

    #[test]
    fn allocates_header_and_payload() {
        let dir = tempfile::tempdir().unwrap();
        let region = ShmRegion::create(dir.path(), "tasks", 4 << 20).unwrap();

        let addr = alloc_task(
            &region,
            TaskStateId::new(1, 3),
            TaskNode::root(TaskId::new(1, 1)),
            DomainId::local(),
            TaskPrio::LowLatency,
            5,
            2,
            0,
            TestPayload {
                input: 77,
                output: 0,
            },
        )
        .unwrap();

        assert_eq!(addr.header().state, TaskStateId::new(1, 3));
        assert_eq!(addr.header().lane_hash, 5);
        assert_eq!(addr.payload::<TestPayload>().input, 77);

        // The payload is reachable from another mapping through the offset.
        let view = ShmRegion::attach(dir.path(), "tasks").unwrap();
        let remote = TaskAddr::from_shm(&view, addr.shm()).unwrap();
        assert_eq!(remote.payload::<TestPayload>().input, 77);
        remote.payload::<TestPayload>().output = 99;
        assert_eq!(addr.payload::<TestPayload>().output, 99);

        free_task(&region, addr);
    }

    #[test]
    fn free_twice_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let region = ShmRegion::create(dir.path(), "tasks2", 4 << 20).unwrap();
        let addr = alloc_task(
            &region,
            TaskStateId::new(1, 3),
            TaskNode::null(),
            DomainId::local(),
            TaskPrio::LowLatency,
            0,
            0,
            0,
            (),
        )
        .unwrap();
        free_task(&region, addr);
        // Second free is rejected (alloc_size already zeroed).
        free_task(&region, addr);
    }
}
