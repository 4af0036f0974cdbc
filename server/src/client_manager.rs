//! Per-connection session state owned by a zone's simulation.
//!
//! This module handles the zone-side bookkeeping for every joined client:
//! - Binding a connection to the entity it controls
//! - Input buffering in sequence order, one input consumed per tick
//! - Input rate limiting and malformed-input accounting
//! - The last processed input sequence echoed back for reconciliation
//!
//! Transport concerns (addresses, timeouts, reliable resends) live in
//! [`crate::network`]; the simulation only ever sees connection ids.

use crate::config::AntiCheatConfig;
use crate::world::EntityId;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use shared::InputRecord;
use std::collections::{HashMap, VecDeque};
use std::fmt;

/// Transport-assigned connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client {}", self.0)
    }
}

/// Sliding one-second window of accepted inputs.
#[derive(Debug, Clone)]
pub struct InputRateLimiter {
    accepted: VecDeque<u64>,
    limit: usize,
}

impl InputRateLimiter {
    const WINDOW_MS: u64 = 1_000;

    /// Creates a limiter allowing `per_second` inputs plus `burst` extra within one second
    pub fn new(per_second: u32, burst: u32) -> Self {
        Self {
            accepted: VecDeque::new(),
            limit: (per_second + burst) as usize,
        }
    }

    /// Counts one input at `now_ms`; false when it exceeds the limit
    pub fn allow(&mut self, now_ms: u64) -> bool {
        while let Some(oldest) = self.accepted.front() {
            if now_ms.saturating_sub(*oldest) >= Self::WINDOW_MS {
                self.accepted.pop_front();
            } else {
                break;
            }
        }
        if self.accepted.len() < self.limit {
            self.accepted.push_back(now_ms);
            true
        } else {
            false
        }
    }
}

/// What happened to an input handed to the client manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputDisposition {
    Queued,
    /// Already processed or already buffered.
    Stale,
    RateLimited,
    /// Buffer full; the oldest pending input was dropped to make room.
    Overflow { dropped: u32 },
    UnknownClient,
}

/// A joined client and its buffered inputs
#[derive(Debug)]
pub struct Client {
    /// Transport connection this client arrived on
    pub id: ConnectionId,
    /// Persistent player identity, stable across zones
    pub player_id: u64,
    /// Entity this client controls, if it has one in this zone.
    pub entity: Option<EntityId>,
    /// Highest input sequence we've processed
    pub last_processed_input: u32,
    /// Buffered inputs waiting to be processed, sorted by sequence
    pub pending_inputs: Vec<InputRecord>,
    /// Latest smoothed round trip time reported by the transport
    pub rtt_ms: u64,
    /// Protocol errors seen so far
    pub malformed: u32,
    rate: InputRateLimiter,
}

impl Client {
    /// Creates a client with an empty input queue and a rate limiter from `config`
    pub fn new(id: ConnectionId, player_id: u64, config: &AntiCheatConfig) -> Self {
        Self {
            id,
            player_id,
            entity: None,
            last_processed_input: 0,
            pending_inputs: Vec::new(),
            rtt_ms: 0,
            malformed: 0,
            rate: InputRateLimiter::new(config.input_rate_per_second, config.input_burst),
        }
    }

    /// Buffers an input in sequence order.
    ///
    /// Out-of-order arrivals are sorted into place; anything at or below the
    /// last processed sequence, or already buffered, is stale.
    pub fn add_input(&mut self, input: InputRecord, now_ms: u64, max_pending: usize) -> InputDisposition {
        if input.sequence <= self.last_processed_input {
            return InputDisposition::Stale;
        }
        let index = match self
            .pending_inputs
            .binary_search_by_key(&input.sequence, |pending| pending.sequence)
        {
            Ok(_) => return InputDisposition::Stale,
            Err(index) => index,
        };
        if !self.rate.allow(now_ms) {
            return InputDisposition::RateLimited;
        }

        self.pending_inputs.insert(index, input);
        if self.pending_inputs.len() > max_pending.max(1) {
            let dropped = self.pending_inputs.remove(0);
            return InputDisposition::Overflow {
                dropped: dropped.sequence,
            };
        }
        InputDisposition::Queued
    }

    /// Takes the oldest pending input and marks it processed.
    pub fn next_input(&mut self) -> Option<InputRecord> {
        if self.pending_inputs.is_empty() {
            return None;
        }
        let input = self.pending_inputs.remove(0);
        self.last_processed_input = self.last_processed_input.max(input.sequence);
        Some(input)
    }
}

/// Manages all clients joined to one zone
pub struct ClientManager {
    clients: HashMap<ConnectionId, Client>,
    max_clients: usize,
    config: AntiCheatConfig,
}

impl ClientManager {
    /// Creates an empty manager holding at most `max_clients` clients
    pub fn new(max_clients: usize, config: AntiCheatConfig) -> Self {
        Self {
            clients: HashMap::new(),
            max_clients,
            config,
        }
    }

    /// Registers a client. Returns false if the zone is at capacity.
    pub fn add_client(&mut self, id: ConnectionId, player_id: u64) -> bool {
        if self.clients.contains_key(&id) {
            return true;
        }
        if self.clients.len() >= self.max_clients {
            return false;
        }
        info!("{} joined as player {}", id, player_id);
        self.clients
            .insert(id, Client::new(id, player_id, &self.config));
        true
    }

    /// Removes a client, returning it so its entity can be despawned
    pub fn remove_client(&mut self, id: ConnectionId) -> Option<Client> {
        let client = self.clients.remove(&id)?;
        info!("{} left (player {})", id, client.player_id);
        Some(client)
    }

    /// Looks up a client by connection
    pub fn get(&self, id: ConnectionId) -> Option<&Client> {
        self.clients.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Client> {
        self.clients.get_mut(&id)
    }

    /// Connection currently logged in as `player_id`
    pub fn find_by_player(&self, player_id: u64) -> Option<ConnectionId> {
        self.clients
            .values()
            .find(|client| client.player_id == player_id)
            .map(|client| client.id)
    }

    /// Connection controlling `entity`
    pub fn find_by_entity(&self, entity: EntityId) -> Option<ConnectionId> {
        self.clients
            .values()
            .find(|client| client.entity == Some(entity))
            .map(|client| client.id)
    }

    /// Sets or clears the entity a client controls
    pub fn bind_entity(&mut self, id: ConnectionId, entity: Option<EntityId>) {
        if let Some(client) = self.clients.get_mut(&id) {
            client.entity = entity;
        }
    }

    /// Queues an input for the client on `id`
    ///
    /// Unknown connections are reported rather than created; clients only
    /// come into being through a join.
    pub fn add_input(&mut self, id: ConnectionId, input: InputRecord, now_ms: u64) -> InputDisposition {
        let max_pending = self.config.max_pending_inputs;
        match self.clients.get_mut(&id) {
            Some(client) => {
                let disposition = client.add_input(input, now_ms, max_pending);
                if let InputDisposition::Overflow { dropped } = disposition {
                    debug!("{} input buffer full, dropped input {}", id, dropped);
                }
                disposition
            }
            None => InputDisposition::UnknownClient,
        }
    }

    /// One input per client that controls an entity, for this tick.
    pub fn take_inputs(&mut self) -> Vec<(ConnectionId, EntityId, InputRecord)> {
        let mut inputs: Vec<_> = self
            .clients
            .values_mut()
            .filter_map(|client| {
                let entity = client.entity?;
                let input = client.next_input()?;
                Some((client.id, entity, input))
            })
            .collect();
        // Stable order regardless of hash map iteration
        inputs.sort_by_key(|(id, _, _)| *id);
        inputs
    }

    /// Counts a malformed record. Returns true once the client has sent
    /// more than the allowed number.
    pub fn record_malformed(&mut self, id: ConnectionId) -> bool {
        let limit = self.config.max_malformed;
        match self.clients.get_mut(&id) {
            Some(client) => {
                client.malformed = client.malformed.saturating_add(1);
                client.malformed > limit
            }
            None => false,
        }
    }

    /// Records the transport's latest RTT estimate for lag compensation
    pub fn set_rtt(&mut self, id: ConnectionId, rtt_ms: u64) {
        if let Some(client) = self.clients.get_mut(&id) {
            client.rtt_ms = rtt_ms;
        }
    }

    /// Highest input sequence simulated for a client, 0 if none or unknown
    pub fn last_processed_input(&self, id: ConnectionId) -> u32 {
        self.clients
            .get(&id)
            .map_or(0, |client| client.last_processed_input)
    }

    /// Every connected client's id
    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.clients.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Number of connected clients
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(max_clients: usize) -> ClientManager {
        ClientManager::new(max_clients, AntiCheatConfig::default())
    }

    fn input(sequence: u32) -> InputRecord {
        InputRecord::new(sequence, sequence as u64 * 16)
    }

    #[test]
    fn test_client_creation() {
        let client = Client::new(ConnectionId(1), 42, &AntiCheatConfig::default());
        assert_eq!(client.id, ConnectionId(1));
        assert_eq!(client.player_id, 42);
        assert_eq!(client.last_processed_input, 0);
        assert!(client.pending_inputs.is_empty());
    }

    #[test]
    fn test_client_add_input_sorts_by_sequence() {
        let mut client = Client::new(ConnectionId(1), 1, &AntiCheatConfig::default());
        client.add_input(input(2), 0, 16);
        client.add_input(input(1), 0, 16);

        assert_eq!(client.pending_inputs.len(), 2);
        assert_eq!(client.pending_inputs[0].sequence, 1);
        assert_eq!(client.pending_inputs[1].sequence, 2);
    }

    #[test]
    fn test_duplicate_and_processed_inputs_are_stale() {
        let mut client = Client::new(ConnectionId(1), 1, &AntiCheatConfig::default());
        assert_eq!(client.add_input(input(1), 0, 16), InputDisposition::Queued);
        assert_eq!(client.add_input(input(1), 0, 16), InputDisposition::Stale);

        assert_eq!(client.next_input().unwrap().sequence, 1);
        assert_eq!(client.last_processed_input, 1);
        assert_eq!(client.add_input(input(1), 0, 16), InputDisposition::Stale);
    }

    #[test]
    fn test_input_buffer_overflow_drops_oldest() {
        let mut client = Client::new(ConnectionId(1), 1, &AntiCheatConfig::default());
        for sequence in 1..=4 {
            client.add_input(input(sequence), 0, 4);
        }
        assert_eq!(
            client.add_input(input(5), 0, 4),
            InputDisposition::Overflow { dropped: 1 }
        );
        assert_eq!(client.pending_inputs.first().unwrap().sequence, 2);
    }

    #[test]
    fn test_rate_limit() {
        let mut limiter = InputRateLimiter::new(60, 5);
        let accepted = (0..100).filter(|_| limiter.allow(500)).count();
        assert_eq!(accepted, 65);
        // Window has moved on
        assert!(limiter.allow(1_500));
    }

    #[test]
    fn test_add_client_max_capacity() {
        let mut manager = manager(1);
        assert!(manager.add_client(ConnectionId(1), 1));
        assert!(!manager.add_client(ConnectionId(2), 2));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_remove_client() {
        let mut manager = manager(2);
        manager.add_client(ConnectionId(1), 7);
        assert!(manager.remove_client(ConnectionId(1)).is_some());
        assert!(manager.remove_client(ConnectionId(1)).is_none());
        assert!(manager.is_empty());
    }

    #[test]
    fn test_input_to_unknown_client() {
        let mut manager = manager(2);
        assert_eq!(
            manager.add_input(ConnectionId(9), input(1), 0),
            InputDisposition::UnknownClient
        );
    }

    #[test]
    fn test_take_inputs_one_per_bound_client() {
        let mut manager = manager(4);
        let mut world = crate::world::World::new(4);
        let entity = world.create().unwrap();

        manager.add_client(ConnectionId(1), 1);
        manager.add_client(ConnectionId(2), 2);
        manager.bind_entity(ConnectionId(1), Some(entity));
        for sequence in 1..=3 {
            manager.add_input(ConnectionId(1), input(sequence), 0);
            manager.add_input(ConnectionId(2), input(sequence), 0);
        }

        let taken = manager.take_inputs();
        // Client 2 has no entity and keeps its inputs
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].2.sequence, 1);
        assert_eq!(manager.last_processed_input(ConnectionId(1)), 1);
        assert_eq!(manager.take_inputs()[0].2.sequence, 2);
    }

    #[test]
    fn test_malformed_threshold() {
        let mut manager = ClientManager::new(
            2,
            AntiCheatConfig {
                max_malformed: 2,
                ..AntiCheatConfig::default()
            },
        );
        manager.add_client(ConnectionId(1), 1);
        assert!(!manager.record_malformed(ConnectionId(1)));
        assert!(!manager.record_malformed(ConnectionId(1)));
        assert!(manager.record_malformed(ConnectionId(1)));
    }
}
