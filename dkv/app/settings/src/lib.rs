// Copyright 2022-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Configuration, loaded entirely from environment variables in three
//! sections: `SERVER_*`, `ROUTER_*` and `SERVICE_*`. Durations are plain
//! seconds, e.g. `SERVICE_RAFT_TIMEOUT=20`.

use std::path::PathBuf;
use std::time::Duration;

use config::{builder::DefaultState, Config, ConfigBuilder, ConfigError, Environment};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};

#[serde_as]
#[derive(Debug, Deserialize)]
pub struct ServerSettings {
    /// Address the public HTTP API binds, `host:port`.
    pub address: String,
    /// How long in-flight requests get to drain on shutdown.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub shutdown_timeout: Duration,
}

#[serde_as]
#[derive(Debug, Deserialize)]
pub struct RouterSettings {
    /// Global deadline on any single request.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub request_timeout: Duration,
}

#[serde_as]
#[derive(Debug, Deserialize)]
pub struct ServiceSettings {
    pub key_max_len: usize,
    pub val_max_len: usize,
    pub max_map_size: usize,
    pub raft_node_id: u64,
    /// Address the replication transport binds, `host:port`.
    pub raft_addr: String,
    /// Directory the snapshots are kept under.
    pub raft_store_dir: PathBuf,
    /// Upper bound on any single consensus operation.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub raft_timeout: Duration,
    /// Whether this node bootstraps the cluster.
    pub raft_leader: bool,
    /// Public address of the leader to join; required on followers.
    pub raft_join_addr: Option<String>,
    /// Test mode: mutate the map directly, without consensus. Snapshots
    /// written in this mode must not seed a replicated deployment.
    pub debug: bool,
}

#[derive(Debug)]
pub struct Settings {
    pub server: ServerSettings,
    pub router: RouterSettings,
    pub service: ServiceSettings,
}

impl Settings {
    /// Load every section from the process environment.
    pub fn new() -> Result<Self, ConfigError> {
        let server = section("server", |b| b.set_default("shutdown_timeout", 5))?;
        let router = section("router", |b| b.set_default("request_timeout", 30))?;
        let service = section("service", |b| {
            b.set_default("key_max_len", 100)?
                .set_default("val_max_len", 200)?
                .set_default("max_map_size", 1000)?
                .set_default("raft_timeout", 20)?
                .set_default("debug", false)
        })?;

        let settings = Self {
            server,
            router,
            service,
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let service = &self.service;
        if !service.raft_leader && !service.debug && service.raft_join_addr.is_none() {
            return Err(ConfigError::Message(
                "SERVICE_RAFT_JOIN_ADDR is required on follower nodes".to_string(),
            ));
        }
        Ok(())
    }
}

/// One section: defaults first, then `<PREFIX>_*` from the environment.
fn section<T, F>(prefix: &str, defaults: F) -> Result<T, ConfigError>
where
    T: DeserializeOwned,
    F: FnOnce(ConfigBuilder<DefaultState>) -> Result<ConfigBuilder<DefaultState>, ConfigError>,
{
    defaults(Config::builder())?
        .add_source(Environment::with_prefix(prefix).try_parsing(true))
        .build()?
        .try_deserialize()
}
