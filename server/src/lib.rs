//! # Zone Server Library
//!
//! Authoritative simulation core for a partitioned MMO world. Each zone owns a
//! rectangle of the world and runs a fixed-rate tick over the entities inside
//! it: it validates client movement, resolves combat against rewound history,
//! replicates delta snapshots to the players who can see them, and hands
//! entities to neighbouring zones as they walk across a boundary.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative Simulation
//! Clients only send intents. Movement is integrated on the server, checked
//! against speed, acceleration and teleport limits, and corrected when a
//! client's claimed position disagrees with the server's.
//!
//! ### Lag-Compensated Combat
//! Every tick the positions of all combatants are recorded in a ring buffer.
//! An attack is resolved against the world as the attacker saw it, rewound by
//! their round trip time and interpolation delay, and each attack lands at
//! most once per target.
//!
//! ### Interest-Managed Replication
//! Entities are bucketed into a uniform spatial grid. Each viewer receives
//! only nearby entities, with far ones updated less often, delta-encoded
//! against the last snapshot the client acknowledged.
//!
//! ### Zone Migration
//! Entities near a boundary are projected into the neighbouring zone as read
//! only shadows. Crossing the boundary starts a handoff in which exactly one
//! zone owns the entity at any time, with a forced resolution when the
//! neighbour stops answering.
//!
//! ## Architecture Design
//!
//! ### Single Writer Per Zone
//! A zone's state is only ever touched by its own tick. Network tasks and
//! neighbour zones talk to it through bounded queues that are drained at the
//! start of each tick, so the simulation never waits on a lock.
//!
//! ### UDP-Based Communication
//! Snapshots are unreliable and superseded by the next one. Discrete events
//! such as hit confirmations and zone redirects travel on a small reliable
//! channel that resends until acknowledged.
//!
//! ## Module Organization
//!
//! - `world`, `components`: generational entity handles and component storage
//! - `spatial`: uniform grid for range and interest queries
//! - `movement`, `validation`, `physics`: intent integration and anti-cheat
//! - `history`, `combat`: rewind buffer and hit resolution
//! - `replication`: interest tiers, baselines and delta snapshots
//! - `zone`: the tick pipeline, world partition and migration protocol
//! - `client_manager`, `network`: connections, input queues and the UDP loop
//! - `persistence`: session cache and the batched combat event log
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::ZoneServer;
//! use server::persistence::{EventLog, InMemorySessionStore};
//! use server::zone::cluster::Cluster;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::load(None)?;
//!     let cluster = Cluster::new(&config, InMemorySessionStore::new(), EventLog::detached())?;
//!
//!     let mut handles = Vec::new();
//!     for zone in cluster.into_zones() {
//!         let addr = format!("127.0.0.1:{}", config.network.port + zone.id().0 as u16);
//!         let server = ZoneServer::bind(&addr, zone, &config).await?;
//!         handles.push(tokio::spawn(server.run(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })));
//!     }
//!     for handle in handles {
//!         handle.await??;
//!     }
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod combat;
pub mod components;
pub mod config;
pub mod error;
pub mod history;
pub mod movement;
pub mod network;
pub mod persistence;
pub mod physics;
pub mod replication;
pub mod spatial;
pub mod validation;
pub mod world;
pub mod zone;
