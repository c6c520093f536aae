//! Wire protocol: length-prefixed bincode frames over TCP, with raw bulk
//! bytes following the frame that announces them.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use quarry_runtime::ids::TaskStateId;

use crate::errors::{RpcError, RpcResult};

/// Largest accepted frame; anything bigger is a protocol violation.
const MAX_FRAME: u32 = 64 << 20;

/// Bulk transfer direction, from the server's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoType {
    /// Server writes the client's bulk region after Run.
    Read,
    /// Server reads the client's bulk region before Run.
    Write,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum RpcRequest {
    /// Parameter bytes only.
    PushSmall {
        state: TaskStateId,
        method: u32,
        params: Vec<u8>,
    },
    /// Parameter bytes plus one bulk region of `size` bytes. For
    /// [`IoType::Write`] the bulk bytes follow this frame; for
    /// [`IoType::Read`] they follow the reply frame.
    PushBulk {
        state: TaskStateId,
        method: u32,
        params: Vec<u8>,
        size: u64,
        io: IoType,
    },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Serialized task outputs; empty when the peer did not know the state.
    pub out: Vec<u8>,
    /// Bulk bytes of `bulk_size` follow this frame (read-side calls).
    pub bulk_size: u64,
}

pub fn write_frame<T: Serialize>(stream: &mut impl Write, node: u32, value: &T) -> RpcResult<()> {
    let body = bincode::serialize(value)
        .map_err(|err| RpcError::BadFrame(err.to_string()))?;
    let len = body.len() as u32;
    stream
        .write_all(&len.to_le_bytes())
        .and_then(|()| stream.write_all(&body))
        .map_err(|source| RpcError::Io { node, source })
}

pub fn read_frame<T: serde::de::DeserializeOwned>(
    stream: &mut impl Read,
    node: u32,
) -> RpcResult<T> {
    let mut len_bytes = [0u8; 4];
    stream
        .read_exact(&mut len_bytes)
        .map_err(|source| RpcError::Io { node, source })?;
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_FRAME {
        return Err(RpcError::BadFrame(format!("frame of {len} bytes")));
    }
    let mut body = vec![0u8; len as usize];
    stream
        .read_exact(&mut body)
        .map_err(|source| RpcError::Io { node, source })?;
    bincode::deserialize(&body).map_err(|err| RpcError::BadFrame(err.to_string()))
}

pub fn write_bulk(stream: &mut impl Write, node: u32, bulk: &[u8]) -> RpcResult<()> {
    stream
        .write_all(bulk)
        .map_err(|source| RpcError::Io { node, source })
}

pub fn read_bulk(stream: &mut impl Read, node: u32, bulk: &mut [u8]) -> RpcResult<()> {
    stream
        .read_exact(bulk)
        .map_err(|source| RpcError::Io { node, source })
}

#[cfg(test)]
mod test_proto {
    use super::*;

    #[test]
    fn frames_roundtrip() {
        let mut wire = Vec::new();
        let request = RpcRequest::PushBulk {
            state: TaskStateId::new(2, 9),
            method: 3,
            params: vec![1, 2, 3],
            size: 4096,
            io: IoType::Write,
        };
        write_frame(&mut wire, 2, &request).unwrap();
        write_bulk(&mut wire, 2, &[9u8; 8]).unwrap();

        let mut cursor = std::io::Cursor::new(wire);
        match read_frame::<RpcRequest>(&mut cursor, 2).unwrap() {
            RpcRequest::PushBulk {
                state,
                method,
                params,
                size,
                io,
            } => {
                assert_eq!(state, TaskStateId::new(2, 9));
                assert_eq!(method, 3);
                assert_eq!(params, vec![1, 2, 3]);
                assert_eq!(size, 4096);
                assert_eq!(io, IoType::Write);
            }
            other => panic!("wrong frame: {other:?}"),
        }
        let mut bulk = [0u8; 8];
        read_bulk(&mut cursor, 2, &mut bulk).unwrap();
        assert_eq!(bulk, [9u8; 8]);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&(MAX_FRAME + 1).to_le_bytes());
        let mut cursor = std::io::Cursor::new(wire);
        assert!(matches!(
            read_frame::<RpcResponse>(&mut cursor, 1),
            Err(RpcError::BadFrame(_))
        ));
    }
}
