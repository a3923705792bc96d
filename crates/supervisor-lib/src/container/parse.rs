//! Parsing of engine CLI output
//!
//! Docker, nerdctl and podman agree on the meaning of `inspect`, `stats` and
//! `events` output but not on its shape: field casing differs, podman
//! emits JSON arrays where docker emits one object per line, and stats are
//! human-formatted ("12.5MiB / 1GiB"). Everything is normalized here.

use crate::error::{Result, SupervisorError};
use crate::models::{ContainerInfo, ContainerStats, ContainerStatus};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

/// Split output that is either a JSON array or newline-delimited objects
pub(crate) fn parse_json_records<T: DeserializeOwned>(output: &str) -> Result<Vec<T>> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        return Ok(serde_json::from_str(trimmed)?);
    }

    trimmed
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(SupervisorError::from))
        .collect()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectRecord {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    created: Option<String>,
    #[serde(default)]
    image_name: Option<String>,
    #[serde(default)]
    config: Option<InspectConfig>,
    #[serde(default)]
    state: Option<InspectState>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    #[serde(default)]
    status: String,
    #[serde(default)]
    started_at: Option<String>,
    #[serde(default)]
    exit_code: Option<i64>,
    #[serde(default, rename = "OOMKilled")]
    oom_killed: bool,
}

/// Engines report "never" as the zero time
fn parse_engine_time(value: Option<&str>) -> Option<DateTime<Utc>> {
    let value = value?.trim();
    if value.is_empty() || value.starts_with("0001-01-01") {
        return None;
    }
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

impl From<InspectRecord> for ContainerInfo {
    fn from(record: InspectRecord) -> Self {
        let config = record.config.unwrap_or_default();
        let state = record.state.unwrap_or_default();
        let status = ContainerStatus::from_engine_state(&state.status);

        ContainerInfo {
            id: record.id,
            name: record.name.trim_start_matches('/').to_string(),
            image: config.image.or(record.image_name).unwrap_or_default(),
            status,
            created_at: parse_engine_time(record.created.as_deref()),
            started_at: parse_engine_time(state.started_at.as_deref()),
            exit_code: if status == ContainerStatus::Stopped {
                state.exit_code
            } else {
                None
            },
            oom_killed: state.oom_killed,
            labels: config.labels.unwrap_or_default(),
        }
    }
}

/// Parse `inspect --type container` output for one or more containers
pub fn parse_inspect(output: &str) -> Result<Vec<ContainerInfo>> {
    let records: Vec<InspectRecord> = parse_json_records(output)?;
    Ok(records.into_iter().map(ContainerInfo::from).collect())
}

/// `stats --no-stream` record; docker uses PascalCase, podman snake_case
#[derive(Debug, Deserialize)]
struct StatsRecord {
    #[serde(rename = "CPUPerc", alias = "cpu_percent")]
    cpu_perc: String,
    #[serde(rename = "MemUsage", alias = "mem_usage")]
    mem_usage: String,
    #[serde(rename = "MemPerc", alias = "mem_percent")]
    mem_perc: String,
    #[serde(rename = "NetIO", alias = "net_io", default)]
    net_io: String,
    #[serde(rename = "BlockIO", alias = "block_io", default)]
    block_io: String,
    #[serde(rename = "PIDs", alias = "pids", default)]
    pids: String,
}

fn parse_percent(value: &str) -> f64 {
    let value = value.trim().trim_end_matches('%').trim();
    if value == "--" {
        return 0.0;
    }
    value.parse().unwrap_or(0.0)
}

/// Parse a human byte size ("1.5kB", "12MiB", "0B", "--") into bytes
pub fn parse_byte_size(value: &str) -> u64 {
    let value = value.trim();
    if value.is_empty() || value == "--" {
        return 0;
    }

    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: f64 = number.parse().unwrap_or(0.0);

    let multiplier: f64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1.0,
        "kb" | "k" => 1e3,
        "mb" | "m" => 1e6,
        "gb" | "g" => 1e9,
        "tb" | "t" => 1e12,
        "kib" => 1024.0,
        "mib" => 1024.0 * 1024.0,
        "gib" => 1024.0 * 1024.0 * 1024.0,
        "tib" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => 1.0,
    };

    (number * multiplier).round() as u64
}

/// Split an "a / b" pair into two byte sizes
fn parse_pair(value: &str) -> (u64, u64) {
    let mut parts = value.splitn(2, '/');
    let first = parts.next().map(parse_byte_size).unwrap_or(0);
    let second = parts.next().map(parse_byte_size).unwrap_or(0);
    (first, second)
}

impl From<StatsRecord> for ContainerStats {
    fn from(record: StatsRecord) -> Self {
        let (memory_usage, memory_limit) = parse_pair(&record.mem_usage);
        let (network_rx_bytes, network_tx_bytes) = parse_pair(&record.net_io);
        let (block_read_bytes, block_write_bytes) = parse_pair(&record.block_io);

        ContainerStats {
            cpu_percent: parse_percent(&record.cpu_perc),
            memory_usage,
            memory_limit,
            memory_percent: parse_percent(&record.mem_perc),
            network_rx_bytes,
            network_tx_bytes,
            block_read_bytes,
            block_write_bytes,
            pids: record.pids.trim().parse().unwrap_or(0),
        }
    }
}

/// Parse `stats --no-stream` output for a single container
pub fn parse_stats(output: &str) -> Result<Option<ContainerStats>> {
    let mut records: Vec<StatsRecord> = parse_json_records(output)?;
    Ok(records.pop().map(ContainerStats::from))
}

/// One line of `events --format json` output, normalized
#[derive(Debug, Clone, PartialEq)]
pub struct EngineEvent {
    pub action: String,
    pub container_id: String,
    pub container_name: Option<String>,
    pub exit_code: Option<i64>,
    pub attributes: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawEngineEvent {
    // docker: {"status","id","Type","Action","Actor":{"ID","Attributes"}}
    #[serde(rename = "Action", default)]
    action: Option<String>,
    #[serde(rename = "status", default)]
    legacy_status: Option<String>,
    #[serde(rename = "id", default)]
    legacy_id: Option<String>,
    #[serde(rename = "Actor", default)]
    actor: Option<RawActor>,
    // podman: {"ID","Name","Status","ContainerExitCode","Attributes"}
    #[serde(rename = "Status", default)]
    status: Option<String>,
    #[serde(rename = "ID", default)]
    id: Option<String>,
    #[serde(rename = "Name", default)]
    name: Option<String>,
    #[serde(rename = "ContainerExitCode", default)]
    container_exit_code: Option<i64>,
    #[serde(rename = "Attributes", default)]
    attributes: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct RawActor {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "Attributes", default)]
    attributes: HashMap<String, String>,
}

/// Parse a single engine event line; `Ok(None)` for events without a container
pub fn parse_engine_event(line: &str) -> Result<Option<EngineEvent>> {
    let raw: RawEngineEvent = serde_json::from_str(line.trim())?;

    let (actor_id, mut attributes) = match raw.actor {
        Some(actor) => (Some(actor.id), actor.attributes),
        None => (None, HashMap::new()),
    };
    if let Some(extra) = raw.attributes {
        attributes.extend(extra);
    }

    let container_id = match actor_id
        .filter(|id| !id.is_empty())
        .or(raw.id)
        .or(raw.legacy_id)
    {
        Some(id) => id,
        None => return Ok(None),
    };
    let action = match raw.action.or(raw.status).or(raw.legacy_status) {
        Some(action) => action.to_ascii_lowercase(),
        None => return Ok(None),
    };

    let exit_code = raw.container_exit_code.or_else(|| {
        attributes
            .get("exitCode")
            .and_then(|code| code.parse().ok())
    });
    let container_name = raw.name.or_else(|| attributes.get("name").cloned());

    Ok(Some(EngineEvent {
        action,
        container_id,
        container_name,
        exit_code,
        attributes,
    }))
}
