//! The RPC server: ingress side of remote dispatch. Handler threads accept
//! serialized tasks, re-emplace them on the local queues, wait for
//! completion and ship the outputs back.

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use quarry_runtime::ctx::RuntimeCtx;
use quarry_runtime::ids::{DomainId, TaskStateId};
use quarry_runtime::state::{xfer_flags, DataTransfer, LoadArchive, SaveArchive};

use crate::errors::{RpcError, RpcResult};
use crate::hosts::HostTable;
use crate::proto::{
    read_bulk, read_frame, write_bulk, write_frame, IoType, RpcRequest, RpcResponse,
};

pub struct RpcServer {
    stop: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    local_addr: std::net::SocketAddr,
}

impl RpcServer {
    /// Bind this node's address from the host table and start the handler
    /// threads.
    pub fn start(
        ctx: Arc<RuntimeCtx>,
        hosts: &HostTable,
        num_threads: usize,
    ) -> RpcResult<Arc<Self>> {
        let addr = hosts.listen_addr();
        let listener = TcpListener::bind(addr).map_err(|source| RpcError::Connect {
            node: hosts.this_node(),
            source,
        })?;
        let local_addr = listener.local_addr().map_err(|source| RpcError::Connect {
            node: hosts.this_node(),
            source,
        })?;
        listener.set_nonblocking(true).ok();

        let stop = Arc::new(AtomicBool::new(false));
        let listener = Arc::new(listener);
        let mut threads = Vec::new();
        for thread_id in 0..num_threads.max(1) {
            let listener = listener.clone();
            let stop = stop.clone();
            let ctx = ctx.clone();
            threads.push(
                std::thread::Builder::new()
                    .name(format!("quarry_rpc_{thread_id}"))
                    .spawn(move || accept_loop(&listener, &stop, &ctx))
                    .expect("spawn rpc thread"),
            );
        }
        tracing::info!(%local_addr, num_threads, "rpc server listening");
        Ok(Arc::new(Self {
            stop,
            threads: Mutex::new(threads),
            local_addr,
        }))
    }

    #[must_use]
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn join(&self) {
        self.stop();
        for thread in self.threads.lock().drain(..) {
            let _ = thread.join();
        }
    }
}

fn accept_loop(listener: &TcpListener, stop: &AtomicBool, ctx: &Arc<RuntimeCtx>) {
    while !stop.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "rpc connection accepted");
                stream.set_nodelay(true).ok();
                handle_connection(stream, stop, ctx);
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
            Err(err) => {
                tracing::warn!(%err, "rpc accept failed");
                std::thread::sleep(std::time::Duration::from_millis(50));
            }
        }
    }
}

/// Serve one peer connection until it closes or the server stops.
fn handle_connection(mut stream: TcpStream, stop: &AtomicBool, ctx: &Arc<RuntimeCtx>) {
    stream
        .set_read_timeout(Some(std::time::Duration::from_millis(200)))
        .ok();
    while !stop.load(Ordering::Acquire) {
        let request: RpcRequest = match read_frame(&mut stream, 0) {
            Ok(request) => request,
            Err(RpcError::Io { source, .. })
                if matches!(
                    source.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue;
            }
            Err(RpcError::Io { source, .. })
                if source.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                tracing::debug!("rpc connection closed");
                return;
            }
            Err(err) => {
                tracing::warn!(%err, "dropping rpc connection");
                return;
            }
        };
        // Requests execute with blocking waits; lift the read timeout while
        // the task runs.
        stream.set_read_timeout(None).ok();
        let result = match request {
            RpcRequest::PushSmall {
                state,
                method,
                params,
            } => rpc_push_small(&mut stream, ctx, state, method, &params),
            RpcRequest::PushBulk {
                state,
                method,
                params,
                size,
                io,
            } => rpc_push_bulk(&mut stream, ctx, state, method, &params, size, io),
        };
        stream
            .set_read_timeout(Some(std::time::Duration::from_millis(200)))
            .ok();
        if let Err(err) = result {
            tracing::warn!(%err, "rpc request failed; dropping connection");
            return;
        }
    }
}

fn rpc_push_small(
    stream: &mut TcpStream,
    ctx: &Arc<RuntimeCtx>,
    state_id: TaskStateId,
    method: u32,
    params: &[u8],
) -> RpcResult<()> {
    tracing::debug!(state = %state_id, method, len = params.len(), "rpc small message");
    let out = match rpc_exec(ctx, state_id, method, None, params) {
        Ok(out) => out,
        Err(err) => {
            // Unknown state or bad inputs: empty reply, the client treats
            // it as fatal for the task.
            tracing::error!(%err, state = %state_id, "small push failed");
            Vec::new()
        }
    };
    write_frame(stream, 0, &RpcResponse { out, bulk_size: 0 })
}

fn rpc_push_bulk(
    stream: &mut TcpStream,
    ctx: &Arc<RuntimeCtx>,
    state_id: TaskStateId,
    method: u32,
    params: &[u8],
    size: u64,
    io: IoType,
) -> RpcResult<()> {
    tracing::debug!(state = %state_id, method, size, ?io, "rpc bulk message");
    let mut bulk = vec![0u8; size as usize];
    if io == IoType::Write {
        read_bulk(stream, 0, &mut bulk)?;
    }

    match rpc_exec(ctx, state_id, method, Some((&mut bulk, io)), params) {
        Ok(out) => {
            if io == IoType::Read {
                write_frame(
                    stream,
                    0,
                    &RpcResponse {
                        out,
                        bulk_size: bulk.len() as u64,
                    },
                )?;
                write_bulk(stream, 0, &bulk)
            } else {
                write_frame(stream, 0, &RpcResponse { out, bulk_size: 0 })
            }
        }
        Err(err) => {
            tracing::error!(%err, state = %state_id, "bulk push failed");
            write_frame(
                stream,
                0,
                &RpcResponse {
                    out: Vec::new(),
                    bulk_size: 0,
                },
            )
        }
    }
}

/// Materialize the task, run it through the local queues, and serialize its
/// outputs. For write-side bulk the buffer feeds `load_start`; for
/// read-side bulk the completed task's receiver-write transfer is copied
/// back into it.
fn rpc_exec(
    ctx: &Arc<RuntimeCtx>,
    state_id: TaskStateId,
    method: u32,
    mut bulk: Option<(&mut [u8], IoType)>,
    params: &[u8],
) -> RpcResult<Vec<u8>> {
    let registered = ctx
        .registry
        .get_state(state_id)
        .ok_or(quarry_runtime::RuntimeError::StateMissing(state_id))?;

    let task = {
        let bulk_in = bulk.as_mut().map(|(buf, _)| &mut **buf);
        let mut archive = LoadArchive::new(bulk_in, params);
        registered.state().load_start(method, &mut archive, ctx)?
    };

    // The task behaves as a fresh local submission on this node.
    let header = task.header();
    header.unset_fire_and_forget();
    header.unset_started();
    header.unset_data_owner();
    header.unset_long_running();
    task.header_mut().domain = DomainId::node(ctx.node_id());

    tracing::debug!(
        state = %state_id,
        method,
        task = %header.task_node,
        lane = header.lane_hash,
        "executing ingress task"
    );
    ctx.submit(task);
    header.wait();

    let mut out_ar = SaveArchive::new(DomainId::node(ctx.node_id()));
    registered.state().save_end(method, &mut out_ar, task)?;
    let (xfers, out) = out_ar.into_parts();

    if let Some((buf, IoType::Read)) = bulk {
        copy_read_bulk(&xfers, buf);
    }

    // The ingress task is owned by this handler; reclaim it now that the
    // outputs are serialized.
    registered.state().del(method, task, ctx);
    Ok(out)
}

/// Copy a completed read-side task's output transfer into the wire bulk
/// buffer.
fn copy_read_bulk(xfers: &[DataTransfer], bulk: &mut [u8]) {
    if let Some(xfer) = xfers
        .iter()
        .find(|xfer| xfer.flags & xfer_flags::RECEIVER_WRITE != 0)
    {
        let len = bulk.len().min(xfer.len);
        bulk[..len].copy_from_slice(&xfer.as_slice()[..len]);
    } else {
        tracing::warn!("read-side bulk reply without a receiver-write transfer");
    }
}
