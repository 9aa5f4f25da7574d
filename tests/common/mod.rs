// Shared fixtures for integration tests: an in-memory cluster behind the
// engine client traits, a process runner that records instead of executing,
// and helpers that lay out backup artifacts the way the catalog reports them.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;

use pitr::catalog::{RawCatalogRecord, CATALOG_TIME_FORMAT};
use pitr::client::{
    ClientError, ClientFactory, EngineClient, ReplicationRole, SlotRange,
};
use pitr::process::{CommandOutput, CommandSpec, ProcessControl, ProcessError};
use pitr::{NodeAddr, RecoveryOptions};

pub const SOURCE_IP: &str = "10.0.0.1";
pub const PORT: u16 = 30000;

pub fn at(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
}

pub fn source() -> NodeAddr {
    NodeAddr::new(SOURCE_IP, PORT)
}

pub fn target() -> NodeAddr {
    NodeAddr::new("10.0.0.9", PORT)
}

pub fn replica(n: u8) -> NodeAddr {
    NodeAddr::new(format!("10.0.0.{}", 9 + n), PORT)
}

/// Options with every wait shrunk to milliseconds
pub fn fast_options() -> RecoveryOptions {
    RecoveryOptions {
        poll_interval_ms: 5,
        progress_log_every: 1,
        ping_max_attempts: 3,
        wipe_max_attempts: 3,
        wipe_initial_delay_ms: 5,
        topology_max_attempts: 5,
        topology_delay_ms: 5,
        traffic_sniff_ms: 10,
        traffic_allowance: 3,
        lease_timeout_secs: 1,
        max_shard_workers: 4,
        ..RecoveryOptions::default()
    }
}

// ---------------------------------------------------------------------------
// Fake cluster
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FakeNode {
    pub id: String,
    pub master_id: Option<String>,
    pub known: Vec<NodeAddr>,
    pub slots: Vec<SlotRange>,
    pub commands_processed: u64,
    /// Added to the command counter on every INFO call
    pub traffic_per_info: u64,
    pub hashes: HashMap<String, HashMap<String, String>>,
    /// Hashes a native restore brings back
    pub restore_payload: HashMap<String, HashMap<String, String>>,
    pub flushes: usize,
    pub resets: usize,
    pub restored: Vec<PathBuf>,
}

impl FakeNode {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            master_id: None,
            known: Vec::new(),
            slots: Vec::new(),
            commands_processed: 1_000,
            traffic_per_info: 0,
            hashes: HashMap::new(),
            restore_payload: HashMap::new(),
            flushes: 0,
            resets: 0,
            restored: Vec::new(),
        }
    }
}

#[derive(Default)]
struct ClusterState {
    nodes: HashMap<NodeAddr, FakeNode>,
    unreachable: HashSet<NodeAddr>,
}

impl ClusterState {
    fn addr_of(&self, id: &str) -> Option<NodeAddr> {
        self.nodes
            .iter()
            .find(|(_, n)| n.id == id)
            .map(|(addr, _)| addr.clone())
    }

    fn render_line(&self, addr: &NodeAddr, myself: bool) -> String {
        let node = &self.nodes[addr];
        let mut flags = Vec::new();
        if myself {
            flags.push("myself");
        }
        flags.push(if node.master_id.is_some() { "slave" } else { "master" });
        let slots: Vec<String> = node.slots.iter().map(|s| s.to_string()).collect();
        format!(
            "{} {}:{}@{} {} {} 0 0 1 connected {}",
            node.id,
            addr.ip,
            addr.port,
            addr.port as u32 + 10000,
            flags.join(","),
            node.master_id.as_deref().unwrap_or("-"),
            slots.join(" ")
        )
    }
}

/// Engine instances sharing one view of who is who
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, addr: &NodeAddr, id: &str) -> &Self {
        self.state
            .lock()
            .unwrap()
            .nodes
            .insert(addr.clone(), FakeNode::new(id));
        self
    }

    pub fn update(&self, addr: &NodeAddr, f: impl FnOnce(&mut FakeNode)) {
        let mut state = self.state.lock().unwrap();
        f(state.nodes.get_mut(addr).expect("unknown fake node"));
    }

    pub fn node(&self, addr: &NodeAddr) -> FakeNode {
        self.state.lock().unwrap().nodes[addr].clone()
    }

    pub fn set_unreachable(&self, addr: &NodeAddr) {
        self.state.lock().unwrap().unreachable.insert(addr.clone());
    }

    /// A master owning every slot with `replicas` attached to it
    pub fn with_primary(primary: &NodeAddr, replicas: &[NodeAddr]) -> Self {
        let cluster = Self::new();
        cluster.add_node(primary, "primary-0001");
        for (i, r) in replicas.iter().enumerate() {
            cluster.add_node(r, &format!("replica-{:04}", i + 1));
        }

        let everyone: Vec<NodeAddr> = std::iter::once(primary.clone())
            .chain(replicas.iter().cloned())
            .collect();
        cluster.update(primary, |n| {
            n.slots = vec![SlotRange::new(0, 16383)];
            n.known = replicas.to_vec();
        });
        for r in replicas {
            cluster.update(r, |n| {
                n.master_id = Some("primary-0001".to_string());
                n.known = everyone.iter().filter(|a| *a != r).cloned().collect();
            });
        }
        cluster
    }

    pub fn role_of(&self, addr: &NodeAddr) -> ReplicationRole {
        let state = self.state.lock().unwrap();
        role_in(&state, addr)
    }

    pub fn client(&self, addr: &NodeAddr) -> FakeEngine {
        FakeEngine {
            addr: addr.clone(),
            cluster: self.clone(),
        }
    }
}

fn role_in(state: &ClusterState, addr: &NodeAddr) -> ReplicationRole {
    match state.nodes[addr]
        .master_id
        .as_deref()
        .and_then(|id| state.addr_of(id))
    {
        Some(master) => ReplicationRole::Replica {
            master,
            link_up: true,
        },
        None => ReplicationRole::Master,
    }
}

/// One instance of a [`FakeCluster`]
pub struct FakeEngine {
    addr: NodeAddr,
    cluster: FakeCluster,
}

impl FakeEngine {
    fn with_state<T>(
        &self,
        command: &str,
        f: impl FnOnce(&mut ClusterState) -> Result<T, String>,
    ) -> Result<T, ClientError> {
        let mut state = self.cluster.state.lock().unwrap();
        if state.unreachable.contains(&self.addr) || !state.nodes.contains_key(&self.addr) {
            return Err(ClientError::Connect {
                addr: self.addr.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        f(&mut state).map_err(|reason| ClientError::Command {
            addr: self.addr.to_string(),
            command: command.to_string(),
            reason,
        })
    }
}

#[async_trait]
impl EngineClient for FakeEngine {
    fn addr(&self) -> &NodeAddr {
        &self.addr
    }

    async fn ping(&self) -> Result<(), ClientError> {
        self.with_state("PING", |_| Ok(()))
    }

    async fn role(&self) -> Result<ReplicationRole, ClientError> {
        self.with_state("INFO replication", |s| Ok(role_in(s, &self.addr)))
    }

    async fn info(&self, section: &str) -> Result<HashMap<String, String>, ClientError> {
        self.with_state("INFO", |s| {
            let node = s.nodes.get_mut(&self.addr).unwrap();
            node.commands_processed += node.traffic_per_info;
            let mut info = HashMap::new();
            if section == "stats" {
                info.insert(
                    "total_commands_processed".to_string(),
                    node.commands_processed.to_string(),
                );
            }
            Ok(info)
        })
    }

    async fn flush_all(&self) -> Result<(), ClientError> {
        self.with_state("FLUSHALL", |s| {
            let node = s.nodes.get_mut(&self.addr).unwrap();
            node.flushes += 1;
            node.hashes.clear();
            Ok(())
        })
    }

    async fn cluster_nodes(&self) -> Result<String, ClientError> {
        self.with_state("CLUSTER NODES", |s| {
            let mut lines = vec![s.render_line(&self.addr, true)];
            for peer in &s.nodes[&self.addr].known {
                if s.nodes.contains_key(peer) {
                    lines.push(s.render_line(peer, false));
                }
            }
            Ok(lines.join("\n"))
        })
    }

    async fn cluster_myid(&self) -> Result<String, ClientError> {
        self.with_state("CLUSTER MYID", |s| Ok(s.nodes[&self.addr].id.clone()))
    }

    async fn cluster_reset(&self, hard: bool) -> Result<(), ClientError> {
        self.with_state("CLUSTER RESET", |s| {
            let node = s.nodes.get_mut(&self.addr).unwrap();
            node.resets += 1;
            node.known.clear();
            node.slots.clear();
            node.master_id = None;
            if hard {
                node.id = format!("{}-reset{}", node.id, node.resets);
            }
            Ok(())
        })
    }

    async fn cluster_add_slots(&self, ranges: &[SlotRange]) -> Result<(), ClientError> {
        self.with_state("CLUSTER ADDSLOTS", |s| {
            let node = s.nodes.get_mut(&self.addr).unwrap();
            if !node.slots.is_empty() {
                return Err("ERR Slot is already busy".to_string());
            }
            node.slots = ranges.to_vec();
            Ok(())
        })
    }

    async fn cluster_meet(&self, addr: &NodeAddr) -> Result<(), ClientError> {
        self.with_state("CLUSTER MEET", |s| {
            let node = s.nodes.get_mut(&self.addr).unwrap();
            if !node.known.contains(addr) {
                node.known.push(addr.clone());
            }
            Ok(())
        })
    }

    async fn cluster_replicate(&self, node_id: &str) -> Result<(), ClientError> {
        self.with_state("CLUSTER REPLICATE", |s| {
            if s.addr_of(node_id).is_none() {
                return Err(format!("ERR Unknown node {node_id}"));
            }
            s.nodes.get_mut(&self.addr).unwrap().master_id = Some(node_id.to_string());
            Ok(())
        })
    }

    async fn restore_backup(&self, dir: &Path) -> Result<(), ClientError> {
        self.with_state("RESTOREBACKUP", |s| {
            let node = s.nodes.get_mut(&self.addr).unwrap();
            node.restored.push(dir.to_path_buf());
            node.hashes.extend(node.restore_payload.clone());
            Ok(())
        })
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, ClientError> {
        self.with_state("HGETALL", |s| {
            Ok(s.nodes[&self.addr].hashes.get(key).cloned().unwrap_or_default())
        })
    }

    async fn config_rewrite(&self) -> Result<(), ClientError> {
        self.with_state("CONFIG REWRITE", |_| Ok(()))
    }
}

pub struct FakeClientFactory {
    pub cluster: FakeCluster,
}

#[async_trait]
impl ClientFactory for FakeClientFactory {
    async fn connect(
        &self,
        addr: &NodeAddr,
        _password: Option<&str>,
    ) -> Result<Arc<dyn EngineClient>, ClientError> {
        let client = self.cluster.client(addr);
        client.ping().await?;
        Ok(Arc::new(client))
    }
}

// ---------------------------------------------------------------------------
// Process runner
// ---------------------------------------------------------------------------

/// Records every command; writes a small command stream wherever stdout is
/// redirected and copies `-i` to `-o` the way the block decompressor leaves output
#[derive(Default)]
pub struct RecordingProcess {
    calls: Mutex<Vec<CommandSpec>>,
    failing: Mutex<HashMap<String, String>>,
}

impl RecordingProcess {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every run of `program` print `stdout` and exit cleanly
    pub fn fail_with_output(&self, program: &str, stdout: &str) {
        self.failing
            .lock()
            .unwrap()
            .insert(program.to_string(), stdout.to_string());
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, program: &str) -> Vec<CommandSpec> {
        self.calls()
            .into_iter()
            .filter(|c| c.program_name() == program)
            .collect()
    }
}

#[async_trait]
impl ProcessControl for RecordingProcess {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ProcessError> {
        self.calls.lock().unwrap().push(spec.clone());

        if let Some(path) = &spec.stdout_file {
            std::fs::write(path, b"*1\r\n$4\r\nPING\r\n").map_err(|source| ProcessError::Io {
                path: path.clone(),
                source,
            })?;
        }
        if let (Some(input), Some(output)) = (flag_value(&spec.args, "-i"), flag_value(&spec.args, "-o")) {
            std::fs::copy(input, output).map_err(|source| ProcessError::Io {
                path: PathBuf::from(output),
                source,
            })?;
        }

        let stdout = self
            .failing
            .lock()
            .unwrap()
            .get(&spec.program_name())
            .cloned()
            .unwrap_or_else(|| "errors: 0, replies: 1".to_string());
        Ok(CommandOutput {
            code: Some(0),
            stdout,
            stderr: String::new(),
            elapsed: Duration::from_millis(1),
        })
    }
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

// ---------------------------------------------------------------------------
// Backup artifacts
// ---------------------------------------------------------------------------

/// A catalog record for a file already written under `remote`
pub fn record_for(remote: &Path, file_name: &str, uploaded: NaiveDateTime) -> RawCatalogRecord {
    let size = std::fs::metadata(remote.join(file_name)).unwrap().len();
    RawCatalogRecord {
        file_name: file_name.to_string(),
        task_id: 42,
        size: size as i64,
        source_ip: SOURCE_IP.to_string(),
        file_last_mtime: uploaded.format(CATALOG_TIME_FORMAT).to_string(),
    }
}

fn append_json(builder: &mut tar::Builder<std::fs::File>, name: &str, body: &serde_json::Value) {
    let bytes = serde_json::to_vec(body).unwrap();
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, bytes.as_slice()).unwrap();
}

/// A multi-shard full backup tar: manifest plus one metadata file per store
pub fn write_multishard_full(
    remote: &Path,
    created: NaiveDateTime,
    slots: &str,
    positions: &[u64],
) -> RawCatalogRecord {
    let name = format!(
        "100-TENDISPLUS-FULL-slave-{SOURCE_IP}-{PORT}-{}.tar",
        created.format("%Y%m%d-%H%M%S")
    );
    let file = std::fs::File::create(remote.join(&name)).unwrap();
    let mut builder = tar::Builder::new(file);
    append_json(
        &mut builder,
        "backup.manifest",
        &serde_json::json!({ "kvstore_count": positions.len(), "slots": slots }),
    );
    for (i, pos) in positions.iter().enumerate() {
        append_json(
            &mut builder,
            &format!("backup_meta.{i}"),
            &serde_json::json!({ "binlogpos": pos }),
        );
    }
    builder.into_inner().unwrap();
    record_for(remote, &name, created + chrono::Duration::minutes(20))
}

/// A single-store SSD engine backup tar with its manifest under `backup/`
pub fn write_ssd_full(
    remote: &Path,
    created: NaiveDateTime,
    slots: &str,
    position: u64,
) -> RawCatalogRecord {
    let name = format!(
        "100-TENDISSSD-FULL-slave-{SOURCE_IP}-{PORT}-{}.tar",
        created.format("%Y%m%d-%H%M%S")
    );
    let file = std::fs::File::create(remote.join(&name)).unwrap();
    let mut builder = tar::Builder::new(file);
    append_json(
        &mut builder,
        "backup/backup.manifest",
        &serde_json::json!({ "kvstore_count": 1, "slots": slots, "binlog_positions": [position] }),
    );
    builder.into_inner().unwrap();
    record_for(remote, &name, created + chrono::Duration::minutes(20))
}

/// A zstd-compressed cache engine RDB image
pub fn write_cache_full(remote: &Path, created: NaiveDateTime, image: &[u8]) -> RawCatalogRecord {
    let name = format!(
        "100-REDIS-FULL-slave-{SOURCE_IP}-{PORT}-{}.rdb.zst",
        created.format("%Y%m%d-%H%M%S")
    );
    let compressed = zstd::encode_all(image, 3).unwrap();
    std::fs::write(remote.join(&name), compressed).unwrap();
    record_for(remote, &name, created + chrono::Duration::minutes(5))
}

pub fn multishard_binlog_name(shard: i32, seq: u64, created: NaiveDateTime) -> String {
    format!(
        "100-TENDISPLUS-BINLOG-{SOURCE_IP}-{PORT}-{shard}-{seq:07}-{}.log",
        created.format("%Y%m%d%H%M%S")
    )
}

/// A block-compressed SSD engine binlog
pub fn ssd_binlog_name(seq: u64, created: NaiveDateTime) -> String {
    format!(
        "binlog-{SOURCE_IP}-{PORT}-{seq:07}-{}.log.blz",
        created.format("%Y%m%d%H%M%S")
    )
}

pub fn cache_binlog_name(seq: u64, created: NaiveDateTime) -> String {
    format!(
        "100-REDIS-BINLOG-{SOURCE_IP}-{PORT}-{seq:07}-{}.aof",
        created.format("%Y%m%d%H%M%S")
    )
}

/// Write a plain binlog and return its record, uploaded 30s after creation
pub fn write_binlog(remote: &Path, name: &str, created: NaiveDateTime) -> RawCatalogRecord {
    std::fs::write(remote.join(name), format!("binlog {name}\n")).unwrap();
    record_for(remote, name, created + chrono::Duration::seconds(30))
}

/// Binlog creation times around a 05:00:00 full backup and a 05:15:00 target:
/// 099 well before, 100 in force at the anchor, 101..=109 inside the window,
/// 110 uploaded after the window end and 111 beyond it.
pub fn binlog_schedule() -> Vec<(u64, NaiveDateTime)> {
    let mut schedule = vec![
        (99, at("2024-01-10 04:40:00")),
        (100, at("2024-01-10 04:59:50")),
    ];
    for k in 0..9 {
        schedule.push((101 + k, at("2024-01-10 05:01:00") + chrono::Duration::seconds(90 * k as i64)));
    }
    schedule.push((110, at("2024-01-10 05:30:10")));
    schedule.push((111, at("2024-01-10 05:45:00")));
    schedule
}

/// The `--logfile=` argument of a log reader call
pub fn logfile_arg(spec: &CommandSpec) -> String {
    spec.args
        .iter()
        .find_map(|a| a.strip_prefix("--logfile="))
        .map(|p| {
            Path::new(p)
                .file_name()
                .unwrap()
                .to_string_lossy()
                .into_owned()
        })
        .unwrap_or_default()
}
