//! The in-process submit/await surface. A `Client` needs only the shared
//! region and the queue directory; the admin verbs execute on the runtime's
//! worker 0.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use quarry_runtime::admin::{
    admin_methods, CreateTaskStatePayload, DestroyTaskStatePayload, FlushPayload,
    QueueSpec, RegisterTaskLibPayload, SetPolicyPayload, StateIdPayload,
};
use quarry_runtime::config::{ClientConfig, QueueManagerConfig};
use quarry_runtime::ids::{DomainId, QueueId, TaskId, TaskNode, TaskStateId};
use quarry_runtime::proc_queue::{proc_methods, ProcPushPayload};
use quarry_runtime::queue::QueueRef;
use quarry_runtime::queue_manager::QueueManager;
use quarry_runtime::task::{flags, TaskAddr, TaskPayload, TaskPrio};
use quarry_runtime::task_alloc;
use quarry_shm::{ShmBuf, ShmRegion, ShmString};

use crate::errors::{ClientError, ClientResult};

pub struct Client {
    region: Arc<ShmRegion>,
    queues: QueueManager,
    config: ClientConfig,
}

impl Client {
    /// Attach to a running runtime's region by name.
    pub fn connect(client_conf: &str, server_conf: &str) -> ClientResult<Self> {
        let config = ClientConfig::load(client_conf)?;
        let server = quarry_runtime::config::ServerConfig::load(server_conf)?;
        let qm = &server.queue_manager;
        let region = Self::wait_for_region(qm)?;
        let queues = QueueManager::client_init(region.clone())?;
        tracing::info!(region = %qm.shm_name, node = region.node_id(), "client attached");
        Ok(Self {
            region,
            queues,
            config,
        })
    }

    /// Wrap an already-initialized runtime (in-process submitters).
    #[must_use]
    pub fn from_parts(region: Arc<ShmRegion>, queues: QueueManager) -> Self {
        Self {
            region,
            queues,
            config: ClientConfig::default(),
        }
    }

    fn wait_for_region(qm: &QueueManagerConfig) -> ClientResult<Arc<ShmRegion>> {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            match ShmRegion::attach(Path::new(&qm.shm_dir), &qm.shm_name) {
                Ok(region) if region.is_ready() => return Ok(Arc::new(region)),
                Ok(_) | Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                Ok(_) => {
                    return Err(ClientError::NotReady {
                        name: qm.shm_name.clone(),
                    })
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    #[must_use]
    pub fn region(&self) -> &Arc<ShmRegion> {
        &self.region
    }

    #[must_use]
    pub fn queues(&self) -> &QueueManager {
        &self.queues
    }

    #[must_use]
    pub fn node_id(&self) -> u32 {
        self.region.node_id()
    }

    /// Allocate a fresh root task node from the shared counter.
    #[must_use]
    pub fn make_task_node_id(&self) -> TaskNode {
        TaskNode::root(TaskId::new(self.node_id(), self.region.next_unique()))
    }

    /// Allocate a fresh task-state id.
    #[must_use]
    pub fn make_task_state_id(&self, name: &str) -> TaskStateId {
        TaskStateId::with_hash(
            self.node_id(),
            quarry_runtime::ctx::name_hash(name),
            self.region.next_unique(),
        )
    }

    /// Allocate a typed task in the shared region.
    #[allow(clippy::too_many_arguments)]
    pub fn new_task<T: TaskPayload>(
        &self,
        state: TaskStateId,
        task_node: TaskNode,
        domain: DomainId,
        prio: TaskPrio,
        lane_hash: u32,
        method: u32,
        flag_bits: u32,
        payload: T,
    ) -> ClientResult<TaskAddr> {
        Ok(task_alloc::alloc_task(
            &self.region,
            state,
            task_node,
            domain,
            prio,
            lane_hash,
            method,
            flag_bits,
            payload,
        )?)
    }

    /// Allocate a typed task with a fresh root node.
    #[allow(clippy::too_many_arguments)]
    pub fn new_task_root<T: TaskPayload>(
        &self,
        state: TaskStateId,
        domain: DomainId,
        prio: TaskPrio,
        lane_hash: u32,
        method: u32,
        flag_bits: u32,
        payload: T,
    ) -> ClientResult<TaskAddr> {
        self.new_task(
            state,
            self.make_task_node_id(),
            domain,
            prio,
            lane_hash,
            method,
            flag_bits,
            payload,
        )
    }

    /// Destroy a task. Double destruction is detected and logged.
    pub fn del_task(&self, task: TaskAddr) {
        task_alloc::free_task(&self.region, task);
    }

    #[must_use]
    pub fn get_queue(&self, id: QueueId) -> Option<QueueRef<'_>> {
        self.queues.get_queue(id)
    }

    /// Buffers for task payload data (blob contents and the like), distinct
    /// from the task header allocation.
    pub fn allocate_buffer(&self, size: usize) -> ClientResult<ShmBuf> {
        Ok(ShmBuf::alloc(&self.region, size)?)
    }

    pub fn free_buffer(&self, buf: ShmBuf) {
        buf.free(&self.region);
    }

    /// Emplace a task on its state's queue.
    pub fn submit(&self, task: TaskAddr) -> ClientResult<()> {
        let header = task.header();
        let queue_id = QueueId::from(header.state);
        let queue = self
            .queues
            .get_queue(queue_id)
            .ok_or_else(|| ClientError::Submit(format!("no queue for state {}", header.state)))?;
        if !queue.emplace(
            TaskPrio::from_u32(header.prio),
            header.lane_hash,
            task.offset(),
        ) {
            return Err(ClientError::Submit(format!(
                "queue {queue_id} rejected the task"
            )));
        }
        Ok(())
    }

    /// Block until the task completes, honoring the configured thread
    /// model: "spin" busy-waits, anything else parks between probes.
    pub fn wait_task(&self, task: TaskAddr) {
        if self.config.thread_model == "spin" {
            while !task.header().is_complete() {
                std::hint::spin_loop();
            }
        } else {
            task.header().wait();
        }
    }

    /// Submit and block until the task completes.
    pub fn submit_and_wait(&self, task: TaskAddr) -> ClientResult<()> {
        self.submit(task)?;
        self.wait_task(task);
        Ok(())
    }

    /// Submit through the built-in process queue instead of the state's
    /// own queue. Completion is still observed on the wrapped task, which
    /// the caller keeps ownership of.
    pub fn submit_via_process_queue(&self, task: TaskAddr) -> ClientResult<()> {
        let proc_state = TaskStateId::from(self.queues.process_queue);
        let push = self.new_task(
            proc_state,
            task.header().task_node.child(1),
            DomainId::local(),
            TaskPrio::LowLatency,
            task.header().lane_hash,
            proc_methods::PUSH,
            flags::COROUTINE | flags::FIRE_AND_FORGET,
            ProcPushPayload {
                subtask: task.shm(),
            },
        )?;
        self.submit(push)
    }

    // --- admin verbs -----------------------------------------------------

    fn admin_state(&self) -> TaskStateId {
        self.queues.admin_state
    }

    /// Register a task library on the runtime.
    pub fn register_task_lib(&self, name: &str) -> ClientResult<()> {
        let payload = RegisterTaskLibPayload {
            lib_name: ShmString::copy_from(&self.region, name)?,
        };
        let task = self.new_task_root(
            self.admin_state(),
            DomainId::local(),
            TaskPrio::Admin,
            0,
            admin_methods::REGISTER_TASK_LIB,
            0,
            payload,
        )?;
        self.submit_and_wait(task)?;
        task.payload::<RegisterTaskLibPayload>()
            .lib_name
            .free(&self.region);
        self.del_task(task);
        Ok(())
    }

    /// Create (or look up) a task state. A null `id` consults the cluster
    /// naming authority.
    pub fn create_task_state(
        &self,
        lib_name: &str,
        state_name: &str,
        id: TaskStateId,
        queue: QueueSpec,
    ) -> ClientResult<TaskStateId> {
        let payload = CreateTaskStatePayload::new(
            ShmString::copy_from(&self.region, lib_name)?,
            ShmString::copy_from(&self.region, state_name)?,
            id,
            queue,
        );
        let task = self.new_task_root(
            self.admin_state(),
            DomainId::local(),
            TaskPrio::Admin,
            0,
            admin_methods::CREATE_TASK_STATE,
            flags::COROUTINE,
            payload,
        )?;
        self.submit_and_wait(task)?;
        let p = task.payload::<CreateTaskStatePayload>();
        let created = p.id;
        p.lib_name.free(&self.region);
        p.state_name.free(&self.region);
        self.del_task(task);
        if created.is_null() {
            return Err(ClientError::Submit(format!(
                "task state {state_name} was not created"
            )));
        }
        Ok(created)
    }

    pub fn get_or_create_task_state_id(&self, name: &str) -> ClientResult<TaskStateId> {
        self.state_id_call(name, admin_methods::GET_OR_CREATE_TASK_STATE_ID)
    }

    /// Returns the null id when the name is unknown.
    pub fn get_task_state_id(&self, name: &str) -> ClientResult<TaskStateId> {
        self.state_id_call(name, admin_methods::GET_TASK_STATE_ID)
    }

    fn state_id_call(&self, name: &str, method: u32) -> ClientResult<TaskStateId> {
        let payload = StateIdPayload {
            state_name: ShmString::copy_from(&self.region, name)?,
            id: TaskStateId::null(),
        };
        let task = self.new_task_root(
            self.admin_state(),
            DomainId::local(),
            TaskPrio::Admin,
            0,
            method,
            0,
            payload,
        )?;
        self.submit_and_wait(task)?;
        let p = task.payload::<StateIdPayload>();
        let id = p.id;
        p.state_name.free(&self.region);
        self.del_task(task);
        Ok(id)
    }

    pub fn destroy_task_state(&self, id: TaskStateId) -> ClientResult<()> {
        let task = self.new_task_root(
            self.admin_state(),
            DomainId::local(),
            TaskPrio::Admin,
            0,
            admin_methods::DESTROY_TASK_STATE,
            0,
            DestroyTaskStatePayload { id },
        )?;
        self.submit_and_wait(task)?;
        self.del_task(task);
        Ok(())
    }

    /// Ask the runtime to come down. Fire-and-forget: the worker reclaims
    /// the task.
    pub fn stop_runtime(&self) -> ClientResult<()> {
        let task = self.new_task_root(
            self.admin_state(),
            DomainId::local(),
            TaskPrio::Admin,
            0,
            admin_methods::STOP_RUNTIME,
            flags::FIRE_AND_FORGET,
            (),
        )?;
        self.submit(task)
    }

    /// Push the flush signal through the runtime and wait for it to drain.
    pub fn flush(&self) -> ClientResult<()> {
        let task = self.new_task_root(
            self.admin_state(),
            DomainId::local(),
            TaskPrio::Admin,
            0,
            admin_methods::FLUSH,
            flags::COROUTINE,
            FlushPayload::default(),
        )?;
        self.submit_and_wait(task)?;
        self.del_task(task);
        Ok(())
    }

    pub fn set_work_orch_queue_policy(&self, policy: TaskStateId) -> ClientResult<()> {
        self.set_policy(policy, admin_methods::SET_WORK_ORCH_QUEUE_POLICY)
    }

    pub fn set_work_orch_proc_policy(&self, policy: TaskStateId) -> ClientResult<()> {
        self.set_policy(policy, admin_methods::SET_WORK_ORCH_PROC_POLICY)
    }

    fn set_policy(&self, policy: TaskStateId, method: u32) -> ClientResult<()> {
        let task = self.new_task_root(
            self.admin_state(),
            DomainId::local(),
            TaskPrio::Admin,
            0,
            method,
            0,
            SetPolicyPayload { policy },
        )?;
        self.submit_and_wait(task)?;
        self.del_task(task);
        Ok(())
    }
}
