//! Every zone of a world partition, wired to its neighbours.

use super::migration::MigrationState;
use super::{WorldPartition, Zone, ZoneId};
use crate::components::GlobalId;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::persistence::{EventLog, InMemorySessionStore, ResilientSessionCache};
use std::sync::Arc;

pub struct Cluster {
    partition: Arc<WorldPartition>,
    zones: Vec<Zone>,
}

impl Cluster {
    /// Builds one zone per partition cell. All zones share `sessions`, the
    /// process-wide session cache, and write to clones of `events`.
    pub fn new(
        config: &ServerConfig,
        sessions: InMemorySessionStore,
        events: EventLog,
    ) -> Result<Self, ServerError> {
        let partition = Arc::new(WorldPartition::grid(&config.migration, &config.movement));
        let mut zones = partition
            .zones()
            .iter()
            .map(|definition| {
                Zone::new(
                    definition.id,
                    Arc::clone(&partition),
                    config.clone(),
                    ResilientSessionCache::in_memory(sessions.clone()),
                    events.clone(),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let senders: Vec<_> = zones.iter().map(Zone::zone_sender).collect();
        for zone in &mut zones {
            let neighbors = zone.definition().neighbors.clone();
            for neighbor in neighbors {
                if let Some(sender) = senders.get(neighbor.0 as usize) {
                    zone.connect_neighbor(neighbor, sender.clone());
                }
            }
        }

        Ok(Self { partition, zones })
    }

    pub fn partition(&self) -> &WorldPartition {
        &self.partition
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    pub fn zone(&self, id: ZoneId) -> Option<&Zone> {
        self.zones.get(id.0 as usize)
    }

    pub fn zone_mut(&mut self, id: ZoneId) -> Option<&mut Zone> {
        self.zones.get_mut(id.0 as usize)
    }

    /// Advances every zone by one tick, in zone order.
    pub fn step_all(&mut self) {
        for zone in &mut self.zones {
            zone.step();
        }
    }

    /// Zones that hold `global` as `Local`.
    pub fn local_owners(&self, global: GlobalId) -> Vec<ZoneId> {
        self.zones
            .iter()
            .filter(|zone| zone.migration_state(global) == Some(MigrationState::Local))
            .map(Zone::id)
            .collect()
    }

    /// Hands the zones over to run independently.
    pub fn into_zones(self) -> Vec<Zone> {
        self.zones
    }
}
