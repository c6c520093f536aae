//! Two-node loopback cluster scenarios: small-message round trips, bulk
//! transfers in both directions, and replica fan-out ordering.

mod common;

use common::{
    node_config, start_node, unique_port, IoPayload, MdPayload, XorPayload, IO_READ, IO_SIZE,
    IO_WRITE, MD, XOR, XOR_SIZE,
};
use quarry_client::Runtime;
use quarry_runtime::ids::{DomainId, TaskStateId};
use quarry_runtime::task::TaskPrio;
use serial_test::serial;

struct Cluster {
    _dir: tempfile::TempDir,
    node1: Runtime,
    node2: Runtime,
    state: TaskStateId,
}

impl Cluster {
    /// Two runtimes in this process, with explicit node ids and per-host
    /// ports on loopback. The ping state is created on both nodes under
    /// the same cluster-wide id.
    fn start(tag: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let port1 = unique_port();
        let port2 = unique_port();
        let hosts = vec![
            format!("127.0.0.1:{port1}"),
            format!("127.0.0.1:{port2}"),
        ];

        let mut config1 = node_config(dir.path(), &format!("{tag}_n1"), port1);
        config1.rpc.host_names = hosts.clone();
        config1.rpc.node_id = Some(1);

        let mut config2 = node_config(dir.path(), &format!("{tag}_n2"), port2);
        config2.rpc.host_names = hosts;
        config2.rpc.node_id = Some(2);

        let (node1, state1) = start_node(config1);
        let (node2, state2) = start_node(config2);
        assert_eq!(
            state1.node(),
            state2.node(),
            "nodes disagree on the naming authority"
        );
        assert_eq!(state1, state2, "nodes disagree on the ping state id");

        Self {
            _dir: dir,
            node1,
            node2,
            state: state1,
        }
    }

    fn stop(self) {
        self.node1.stop();
        self.node2.stop();
        self.node1.shutdown();
        self.node2.shutdown();
    }
}

#[test]
#[serial]
fn small_message_round_trip() {
    let cluster = Cluster::start("s1");
    let client = cluster.node1.client();

    // 256 metadata tasks from node 1 to node 2; each must return 1.
    let mut tasks = Vec::new();
    for i in 0..256u32 {
        let task = client
            .new_task_root(
                cluster.state,
                DomainId::node(2),
                TaskPrio::LowLatency,
                i,
                MD,
                0,
                MdPayload::new(client.region()),
            )
            .unwrap();
        client.submit(task).unwrap();
        tasks.push(task);
    }
    for task in tasks {
        task.header().wait();
        let p = task.payload::<MdPayload>();
        assert_eq!(p.ret.as_slice(client.region()).unwrap()[0], 1);
        p.ret.free(client.region());
        client.del_task(task);
    }
    cluster.stop();
}

#[test]
#[serial]
fn bulk_write_pushes_client_data() {
    let cluster = Cluster::start("s2w");
    let client = cluster.node1.client();

    // The client's 4 KiB of byte 10 travels to node 2, which verifies it.
    let task = client
        .new_task_root(
            cluster.state,
            DomainId::node(2),
            TaskPrio::LowLatency,
            3,
            IO_WRITE,
            0,
            IoPayload::filled(10),
        )
        .unwrap();
    client.submit(task).unwrap();
    task.header().wait();
    assert_eq!(task.payload::<IoPayload>().ret, 1);
    client.del_task(task);
    cluster.stop();
}

#[test]
#[serial]
fn bulk_read_fills_client_buffer() {
    let cluster = Cluster::start("s2r");
    let client = cluster.node1.client();

    // Node 2 fills 4 KiB with byte 10; the client's buffer receives it.
    let task = client
        .new_task_root(
            cluster.state,
            DomainId::node(2),
            TaskPrio::LowLatency,
            3,
            IO_READ,
            0,
            IoPayload::filled(0),
        )
        .unwrap();
    client.submit(task).unwrap();
    task.header().wait();
    let p = task.payload::<IoPayload>();
    assert_eq!(p.ret, 1);
    assert_eq!(p.data, [10u8; IO_SIZE]);
    client.del_task(task);
    cluster.stop();
}

#[test]
#[serial]
fn replica_outputs_preserve_target_order() {
    let cluster = Cluster::start("xor");
    let client = cluster.node1.client();

    let input = {
        let mut input = [0u8; XOR_SIZE];
        for (i, byte) in input.iter_mut().enumerate() {
            *byte = i as u8;
        }
        input
    };
    let key = 0x5A;

    // A global dispatch from node 1 replicates to nodes 1 and 2, in that
    // order; each replica's output lands in its own slot.
    let task = client
        .new_task_root(
            cluster.state,
            DomainId::global(),
            TaskPrio::LowLatency,
            0,
            XOR,
            0,
            XorPayload::new(input, key),
        )
        .unwrap();
    client.submit(task).unwrap();
    task.header().wait();

    let p = task.payload::<XorPayload>();
    assert_eq!(p.nreps, 2);
    for replica in 0..2usize {
        for i in 0..XOR_SIZE - 1 {
            assert_eq!(
                p.out[replica][i],
                input[i] ^ key,
                "replica {replica} byte {i}"
            );
        }
    }
    // The executing node stamps the last byte: replica order is the target
    // order (node 1, then node 2).
    assert_eq!(p.out[0][XOR_SIZE - 1], 1);
    assert_eq!(p.out[1][XOR_SIZE - 1], 2);

    client.del_task(task);
    cluster.stop();
}

#[test]
#[serial]
fn unknown_state_at_peer_completes_with_no_output() {
    let cluster = Cluster::start("ghost");
    let client = cluster.node1.client();

    // A state that exists on node 1 only: the peer's lookup fails, the
    // reply is empty, and the dispatch surfaces as a completed task with
    // untouched outputs.
    let solo = client
        .create_task_state(
            common::PING_LIB,
            "ping_solo",
            TaskStateId::null(),
            quarry_runtime::admin::QueueSpec::default_for_state(4, 64),
        )
        .unwrap();

    let task = client
        .new_task_root(
            solo,
            DomainId::node(2),
            TaskPrio::LowLatency,
            0,
            MD,
            0,
            MdPayload::new(client.region()),
        )
        .unwrap();
    client.submit(task).unwrap();
    task.header().wait();
    let p = task.payload::<MdPayload>();
    assert_eq!(
        p.ret.as_slice(client.region()).unwrap()[0],
        0,
        "no output expected"
    );
    p.ret.free(client.region());
    client.del_task(task);
    cluster.stop();
}
