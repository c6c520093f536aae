//! The RPC client: one lazily-opened connection per peer, synchronous
//! request/response, no retries.

use std::collections::HashMap;
use std::net::TcpStream;

use parking_lot::Mutex;

use quarry_runtime::ids::{NodeId, TaskStateId};

use crate::errors::{RpcError, RpcResult};
use crate::hosts::HostTable;
use crate::proto::{
    read_bulk, read_frame, write_bulk, write_frame, IoType, RpcRequest, RpcResponse,
};

pub struct RpcClient {
    hosts: HostTable,
    conns: Mutex<HashMap<NodeId, TcpStream>>,
}

impl RpcClient {
    #[must_use]
    pub fn new(hosts: HostTable) -> Self {
        Self {
            hosts,
            conns: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn hosts(&self) -> &HostTable {
        &self.hosts
    }

    fn connect(&self, node: NodeId) -> RpcResult<TcpStream> {
        let host = self.hosts.host(node)?;
        let stream = TcpStream::connect((host.addr, host.port))
            .map_err(|source| RpcError::Connect { node, source })?;
        stream.set_nodelay(true).ok();
        tracing::debug!(node, addr = %host.addr, "connected to peer");
        Ok(stream)
    }

    /// Run `body` against the node's connection, dropping the connection on
    /// failure so the next call reconnects.
    fn with_conn<T>(
        &self,
        node: NodeId,
        body: impl FnOnce(&mut TcpStream) -> RpcResult<T>,
    ) -> RpcResult<T> {
        let mut conns = self.conns.lock();
        if !conns.contains_key(&node) {
            let stream = self.connect(node)?;
            conns.insert(node, stream);
        }
        let stream = conns.get_mut(&node).expect("connection just inserted");
        match body(stream) {
            Ok(value) => Ok(value),
            Err(err) => {
                conns.remove(&node);
                Err(err)
            }
        }
    }

    /// `RpcPushSmall`: parameter bytes over, output bytes back.
    pub fn push_small(
        &self,
        node: NodeId,
        state: TaskStateId,
        method: u32,
        params: Vec<u8>,
    ) -> RpcResult<Vec<u8>> {
        self.with_conn(node, |stream| {
            write_frame(
                stream,
                node,
                &RpcRequest::PushSmall {
                    state,
                    method,
                    params,
                },
            )?;
            let response: RpcResponse = read_frame(stream, node)?;
            if response.out.is_empty() {
                return Err(RpcError::EmptyReply);
            }
            Ok(response.out)
        })
    }

    /// `RpcPushBulk`: parameters plus one bulk region. `IoType::Write`
    /// pushes `bulk` to the server before Run; `IoType::Read` fills `bulk`
    /// from the server after Run.
    #[allow(clippy::too_many_arguments)]
    pub fn push_bulk(
        &self,
        node: NodeId,
        state: TaskStateId,
        method: u32,
        params: Vec<u8>,
        bulk: &mut [u8],
        io: IoType,
    ) -> RpcResult<Vec<u8>> {
        self.with_conn(node, |stream| {
            write_frame(
                stream,
                node,
                &RpcRequest::PushBulk {
                    state,
                    method,
                    params,
                    size: bulk.len() as u64,
                    io,
                },
            )?;
            if io == IoType::Write {
                write_bulk(stream, node, bulk)?;
            }
            let response: RpcResponse = read_frame(stream, node)?;
            if io == IoType::Read {
                if response.bulk_size != bulk.len() as u64 {
                    return Err(RpcError::BadFrame(format!(
                        "bulk size mismatch: got {}, expected {}",
                        response.bulk_size,
                        bulk.len()
                    )));
                }
                read_bulk(stream, node, bulk)?;
            }
            if response.out.is_empty() {
                return Err(RpcError::EmptyReply);
            }
            Ok(response.out)
        })
    }
}
