//! [`EngineClient`] over the `redis` crate

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{
    Client, Cmd, ConnectionAddr, ConnectionInfo, FromRedisValue, RedisConnectionInfo,
};
use async_trait::async_trait;
use tracing::{debug, instrument};

use super::{
    parse_info, role_from_info, ClientError, ClientFactory, EngineClient, ReplicationRole,
    SlotRange,
};
use crate::node::NodeAddr;

/// Timeouts applied to client commands
#[derive(Debug, Clone)]
pub struct RedisClientConfig {
    /// Admin and metadata commands
    pub command_timeout: Duration,
    /// `RESTOREBACKUP`, which blocks until the backup is loaded
    pub restore_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for RedisClientConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(30),
            restore_timeout: Duration::from_secs(6 * 3600),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Client for one engine instance
pub struct RedisEngineClient {
    addr: NodeAddr,
    connection_manager: ConnectionManager,
    config: RedisClientConfig,
}

impl RedisEngineClient {
    /// Connect to `addr`
    pub async fn connect(
        addr: &NodeAddr,
        password: Option<&str>,
        config: RedisClientConfig,
    ) -> Result<Self, ClientError> {
        let info = ConnectionInfo {
            addr: ConnectionAddr::Tcp(addr.ip.clone(), addr.port),
            redis: RedisConnectionInfo {
                db: 0,
                username: None,
                password: password.filter(|p| !p.is_empty()).map(str::to_string),
                ..Default::default()
            },
        };
        let connect_error = |reason: String| ClientError::Connect {
            addr: addr.to_string(),
            reason,
        };

        let client = Client::open(info).map_err(|e| connect_error(e.to_string()))?;
        let connection_manager =
            tokio::time::timeout(config.connect_timeout, ConnectionManager::new(client))
                .await
                .map_err(|_| connect_error(format!("no answer within {:?}", config.connect_timeout)))?
                .map_err(|e| connect_error(e.to_string()))?;

        debug!(addr = %addr, "Connected to engine instance");
        Ok(Self {
            addr: addr.clone(),
            connection_manager,
            config,
        })
    }

    async fn exec<T: FromRedisValue>(
        &self,
        cmd: Cmd,
        name: &str,
        timeout: Duration,
    ) -> Result<T, ClientError> {
        let mut conn = self.connection_manager.clone();
        let reply: ::redis::RedisResult<T> =
            match tokio::time::timeout(timeout, cmd.query_async(&mut conn)).await {
                Ok(reply) => reply,
                Err(_) => {
                    return Err(ClientError::Timeout {
                        addr: self.addr.to_string(),
                        command: name.to_string(),
                        timeout,
                    })
                }
            };
        reply.map_err(|e| ClientError::Command {
            addr: self.addr.to_string(),
            command: name.to_string(),
            reason: e.to_string(),
        })
    }

    async fn exec_ok(&self, cmd: Cmd, name: &str) -> Result<(), ClientError> {
        let _: ::redis::Value = self.exec(cmd, name, self.config.command_timeout).await?;
        Ok(())
    }

    fn cluster(sub: &str) -> Cmd {
        let mut cmd = ::redis::cmd("CLUSTER");
        cmd.arg(sub);
        cmd
    }
}

#[async_trait]
impl EngineClient for RedisEngineClient {
    fn addr(&self) -> &NodeAddr {
        &self.addr
    }

    async fn ping(&self) -> Result<(), ClientError> {
        let reply: String = self
            .exec(::redis::cmd("PING"), "PING", self.config.command_timeout)
            .await?;
        if reply.eq_ignore_ascii_case("PONG") {
            Ok(())
        } else {
            Err(ClientError::UnexpectedReply {
                addr: self.addr.to_string(),
                command: "PING".to_string(),
                reply,
            })
        }
    }

    async fn role(&self) -> Result<ReplicationRole, ClientError> {
        let info = self.info("replication").await?;
        role_from_info(&info).ok_or_else(|| ClientError::UnexpectedReply {
            addr: self.addr.to_string(),
            command: "INFO replication".to_string(),
            reply: format!("{info:?}"),
        })
    }

    async fn info(&self, section: &str) -> Result<HashMap<String, String>, ClientError> {
        let mut cmd = ::redis::cmd("INFO");
        cmd.arg(section);
        let text: String = self.exec(cmd, "INFO", self.config.command_timeout).await?;
        Ok(parse_info(&text))
    }

    async fn flush_all(&self) -> Result<(), ClientError> {
        self.exec_ok(::redis::cmd("FLUSHALL"), "FLUSHALL").await
    }

    async fn cluster_nodes(&self) -> Result<String, ClientError> {
        self.exec(Self::cluster("NODES"), "CLUSTER NODES", self.config.command_timeout)
            .await
    }

    async fn cluster_myid(&self) -> Result<String, ClientError> {
        self.exec(Self::cluster("MYID"), "CLUSTER MYID", self.config.command_timeout)
            .await
    }

    async fn cluster_reset(&self, hard: bool) -> Result<(), ClientError> {
        let mut cmd = Self::cluster("RESET");
        cmd.arg(if hard { "HARD" } else { "SOFT" });
        self.exec_ok(cmd, "CLUSTER RESET").await
    }

    async fn cluster_add_slots(&self, ranges: &[SlotRange]) -> Result<(), ClientError> {
        if ranges.is_empty() {
            return Ok(());
        }
        let mut cmd = Self::cluster("ADDSLOTS");
        for range in ranges {
            for slot in range.slots() {
                cmd.arg(slot);
            }
        }
        self.exec_ok(cmd, "CLUSTER ADDSLOTS").await
    }

    async fn cluster_meet(&self, addr: &NodeAddr) -> Result<(), ClientError> {
        let mut cmd = Self::cluster("MEET");
        cmd.arg(&addr.ip).arg(addr.port);
        self.exec_ok(cmd, "CLUSTER MEET").await
    }

    async fn cluster_replicate(&self, node_id: &str) -> Result<(), ClientError> {
        let mut cmd = Self::cluster("REPLICATE");
        cmd.arg(node_id);
        self.exec_ok(cmd, "CLUSTER REPLICATE").await
    }

    #[instrument(skip(self), fields(addr = %self.addr))]
    async fn restore_backup(&self, dir: &Path) -> Result<(), ClientError> {
        let mut cmd = ::redis::cmd("RESTOREBACKUP");
        cmd.arg("all").arg(dir.display().to_string()).arg("force");
        let _: ::redis::Value = self
            .exec(cmd, "RESTOREBACKUP", self.config.restore_timeout)
            .await?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, ClientError> {
        let mut cmd = ::redis::cmd("HGETALL");
        cmd.arg(key);
        self.exec(cmd, "HGETALL", self.config.command_timeout).await
    }

    async fn config_rewrite(&self) -> Result<(), ClientError> {
        let mut cmd = ::redis::cmd("CONFIG");
        cmd.arg("REWRITE");
        self.exec_ok(cmd, "CONFIG REWRITE").await
    }
}

/// Opens [`RedisEngineClient`]s
#[derive(Debug, Clone, Default)]
pub struct RedisClientFactory {
    config: RedisClientConfig,
}

impl RedisClientFactory {
    pub fn new(config: RedisClientConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ClientFactory for RedisClientFactory {
    async fn connect(
        &self,
        addr: &NodeAddr,
        password: Option<&str>,
    ) -> Result<Arc<dyn EngineClient>, ClientError> {
        let client = RedisEngineClient::connect(addr, password, self.config.clone()).await?;
        Ok(Arc::new(client))
    }
}
