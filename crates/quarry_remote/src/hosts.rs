//! The cluster host table: one hostname per line, NodeId = 1-based index.

use std::net::{IpAddr, TcpListener, ToSocketAddrs};

use quarry_runtime::config::RpcConfig;
use quarry_runtime::ids::NodeId;

use crate::errors::{RpcError, RpcResult};

#[derive(Clone, Debug)]
pub struct HostInfo {
    pub node_id: NodeId,
    pub hostname: String,
    pub addr: IpAddr,
    pub port: u16,
}

#[derive(Clone, Debug)]
pub struct HostTable {
    hosts: Vec<HostInfo>,
    this_node: NodeId,
    pub port: u16,
}

impl HostTable {
    /// Build the table from config: the host file wins, the inline list is
    /// the fallback, and an empty configuration yields a single-node table.
    pub fn from_config(config: &RpcConfig) -> RpcResult<Self> {
        let names: Vec<String> = if !config.host_file.is_empty() {
            std::fs::read_to_string(&config.host_file)
                .map_err(|err| RpcError::HostFile {
                    path: config.host_file.clone(),
                    detail: err.to_string(),
                })?
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string)
                .collect()
        } else if !config.host_names.is_empty() {
            config.host_names.clone()
        } else {
            vec!["localhost".to_string()]
        };
        if names.is_empty() {
            return Err(RpcError::NoHosts);
        }

        let mut hosts = Vec::with_capacity(names.len());
        for (index, name) in names.iter().enumerate() {
            // A "host:port" entry overrides the cluster-wide port; needed
            // when several nodes share one machine.
            let (hostname, port) = match name.rsplit_once(':') {
                Some((host, port_str)) => match port_str.parse::<u16>() {
                    Ok(port) => (host.to_string(), port),
                    Err(_) => (name.clone(), config.port),
                },
                None => (name.clone(), config.port),
            };
            let addr = resolve_host(&hostname, port)?;
            hosts.push(HostInfo {
                node_id: index as NodeId + 1,
                hostname,
                addr,
                port,
            });
        }

        let this_node = match config.node_id {
            Some(forced) => {
                if forced == 0 || forced as usize > hosts.len() {
                    return Err(RpcError::UnknownSelf);
                }
                forced
            }
            None => find_this_host(&hosts)?,
        };

        tracing::info!(
            num_hosts = hosts.len(),
            this_node,
            "host table initialized"
        );
        Ok(Self {
            hosts,
            this_node,
            port: config.port,
        })
    }

    #[must_use]
    pub fn num_hosts(&self) -> usize {
        self.hosts.len()
    }

    #[must_use]
    pub fn this_node(&self) -> NodeId {
        self.this_node
    }

    pub fn host(&self, node: NodeId) -> RpcResult<&HostInfo> {
        if node == 0 || node as usize > self.hosts.len() {
            return Err(RpcError::UnknownNode(node));
        }
        Ok(&self.hosts[node as usize - 1])
    }

    /// The address this node's server should listen on.
    #[must_use]
    pub fn listen_addr(&self) -> (IpAddr, u16) {
        let host = &self.hosts[self.this_node as usize - 1];
        (host.addr, host.port)
    }
}

fn resolve_host(name: &str, port: u16) -> RpcResult<IpAddr> {
    let candidates = (name, port)
        .to_socket_addrs()
        .map_err(|err| RpcError::HostFile {
            path: name.to_string(),
            detail: err.to_string(),
        })?;
    for candidate in candidates {
        if candidate.is_ipv4() {
            return Ok(candidate.ip());
        }
    }
    Err(RpcError::HostFile {
        path: name.to_string(),
        detail: "no ipv4 address".to_string(),
    })
}

/// A host address is ours iff a listener can bind to it.
fn find_this_host(hosts: &[HostInfo]) -> RpcResult<NodeId> {
    for host in hosts {
        if host.addr.is_loopback() || TcpListener::bind((host.addr, 0)).is_ok() {
            return Ok(host.node_id);
        }
    }
    Err(RpcError::UnknownSelf)
}

#[cfg(test)]
mod test_hosts {
    use super::*;

    #[test]
    fn single_node_default() {
        let table = HostTable::from_config(&RpcConfig::default()).unwrap();
        assert_eq!(table.num_hosts(), 1);
        assert_eq!(table.this_node(), 1);
        assert!(table.host(1).unwrap().addr.is_loopback());
        assert!(table.host(2).is_err());
        assert!(table.host(0).is_err());
    }

    #[test]
    fn host_file_order_defines_node_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, "# cluster\nlocalhost\n127.0.0.1\n\n").unwrap();
        let config = RpcConfig {
            host_file: path.to_string_lossy().into_owned(),
            node_id: Some(2),
            ..Default::default()
        };
        let table = HostTable::from_config(&config).unwrap();
        assert_eq!(table.num_hosts(), 2);
        assert_eq!(table.this_node(), 2);
        assert_eq!(table.host(1).unwrap().hostname, "localhost");
    }

    #[test]
    fn node_id_override_is_validated() {
        let config = RpcConfig {
            node_id: Some(9),
            ..Default::default()
        };
        assert!(matches!(
            HostTable::from_config(&config),
            Err(RpcError::UnknownSelf)
        ));
    }
}
