//! Integration tests for the zone simulation core
//!
//! These tests drive several modules together: movement through the world and
//! validator, combat through the lag compensator, replication through the
//! state history, and migration across a cluster of real zones.

use assert_approx_eq::assert_approx_eq;
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use server::client_manager::ConnectionId;
use server::combat::{AttackKind, AttackOutcome, AttackRequest, CombatResolver, HitOutcome, PendingHit};
use server::components::{CombatState, EntityKind, GlobalId, HitKey, Transform, VelocityState};
use server::config::{
    AntiCheatConfig, CombatConfig, LagCompensationConfig, MigrationConfig, MovementConfig,
    ReplicationConfig, ServerConfig, SpatialConfig,
};
use server::history::LagCompensator;
use server::movement::MovementSystem;
use server::persistence::{EventLog, InMemorySessionStore, ResilientSessionCache};
use server::physics::{look_direction, ray_sphere, Vec3};
use server::replication::{ReplicationEngine, SnapshotKind};
use server::spatial::SpatialGrid;
use server::validation::{MovementValidator, StepVerdict};
use server::world::{EntityId, World};
use server::zone::cluster::Cluster;
use server::zone::migration::{MigrationState, RemoteHit, ZoneEnvelope, ZoneMessage};
use server::zone::{ClientEvent, Outbound, WorldPartition, Zone, ZoneId};
use shared::{ActionFlags, InputRecord, Packet, ReliableEvent};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const DT: f32 = 1.0 / 60.0;

fn spawn_mover(world: &mut World, at: Vec3) -> EntityId {
    let id = world.create().unwrap();
    world.set(id, Transform::at(at)).unwrap();
    world.set(id, VelocityState::default()).unwrap();
    id
}

fn spawn_fighter(world: &mut World, player: u64, at: Vec3, team: u8) -> EntityId {
    let id = world.create_with_global(GlobalId::player(player)).unwrap();
    world.set(id, Transform::at(at)).unwrap();
    world.set(id, CombatState::new(10_000, team)).unwrap();
    world.set(id, EntityKind::Player).unwrap();
    id
}

/// MOVEMENT TESTS
mod movement_tests {
    use super::*;

    /// One second of sustained forward input from the origin ends near (0, 0, -6)
    #[test]
    fn forward_for_sixty_ticks() {
        let system = MovementSystem::new(MovementConfig::default(), DT);
        let validator = MovementValidator::new(AntiCheatConfig::default());
        let mut world = World::new(8);
        let id = spawn_mover(&mut world, Vec3::ZERO);

        for tick in 1..=60 {
            let inputs = HashMap::from([(id, InputRecord::new(tick, 0).with_move(0.0, 1.0))]);
            let reports = system.run(&mut world, &validator, &inputs, tick, tick as u64 * 16);
            assert!(reports.is_empty(), "legal input flagged: {:?}", reports);
        }

        let end = world.get::<Transform>(id).unwrap().position;
        assert_approx_eq!(end.x, 0.0, 1e-3);
        assert_approx_eq!(end.y, 0.0, 1e-3);
        // Eased acceleration costs about half a unit over the first second
        assert_approx_eq!(end.z, -6.0, 0.6);
        assert!(end.z > -6.0);
    }

    /// Any single step longer than the teleport threshold is reverted
    #[test]
    fn teleport_step_is_reverted() {
        let validator = MovementValidator::new(AntiCheatConfig::default());
        let from = Vec3::new(10.0, 0.0, 10.0);
        let to = Vec3::new(150.0, 0.0, 10.0);

        let verdict = validator.check_step(from, to, 1_000.0, 1.0);
        assert!(matches!(verdict, StepVerdict::Teleport { .. }));
        assert_eq!(validator.resolve_step(from, to, verdict), from);
    }
}

/// LAG COMPENSATION TESTS
mod lag_compensation_tests {
    use super::*;

    struct Range {
        world: World,
        history: LagCompensator,
        resolver: CombatResolver,
        attacker: EntityId,
        target: EntityId,
        config: CombatConfig,
    }

    /// Target strafes across the attacker's line of fire at 6 u/s and sits
    /// exactly on it at t = 930ms. Frames are recorded every 10ms up to 1000ms.
    fn strafing_target() -> Range {
        let config = CombatConfig {
            hit_radius: 0.2,
            rng_seed: Some(1),
            ..CombatConfig::default()
        };
        let mut world = World::new(8);
        let attacker = spawn_fighter(&mut world, 1, Vec3::ZERO, 1);
        let target = spawn_fighter(&mut world, 2, Vec3::new(0.0, 0.0, -10.0), 2);
        let mut history = LagCompensator::new(&LagCompensationConfig::default());

        for step in 0..=100u64 {
            let timestamp = step * 10;
            let x = 6.0 * (timestamp as f32 - 930.0) / 1_000.0;
            world
                .set(target, Transform::at(Vec3::new(x, 0.0, -10.0)))
                .unwrap();
            history.record(step as u32, timestamp, &world);
        }

        Range {
            world,
            history,
            resolver: CombatResolver::new(config.clone(), SpatialConfig::default()),
            attacker,
            target,
            config,
        }
    }

    fn shot(attacker: EntityId, rtt_ms: u64) -> AttackRequest {
        AttackRequest {
            attacker,
            kind: AttackKind::Ranged,
            yaw: 0.0,
            pitch: 0.0,
            sequence: 1,
            ack_tick: 0,
            rtt_ms,
        }
    }

    /// RTT 100ms rewinds to now - (50ms + margin), where the target was on the line
    #[test]
    fn compensated_shot_hits_where_present_test_misses() {
        let mut range = strafing_target();
        let now = 1_000;

        assert_eq!(range.history.target_for(now, 100).unwrap(), 930);

        let present = range.world.get::<Transform>(range.target).unwrap().position;
        let aim = Vec3::new(0.0, range.config.aim_height, 0.0);
        let uncompensated = ray_sphere(
            aim,
            look_direction(0.0, 0.0),
            range.config.ranged_range,
            present + aim,
            range.config.hit_radius,
        );
        assert!(uncompensated.is_none(), "target at {:?} should be off the line", present);

        let outcome = range
            .resolver
            .resolve(&mut range.world, &range.history, &shot(range.attacker, 100), now);
        match outcome {
            AttackOutcome::Hits(hits) => {
                assert_eq!(hits.len(), 1);
                assert_eq!(hits[0].target, range.target);
            }
            other => panic!("expected a hit, got {:?}", other),
        }
    }

    /// The same shot from a client with no latency is judged against the
    /// newer position and misses
    #[test]
    fn zero_rtt_shot_misses_moving_target() {
        let mut range = strafing_target();
        let outcome = range
            .resolver
            .resolve(&mut range.world, &range.history, &shot(range.attacker, 0), 1_000);
        assert_eq!(outcome, AttackOutcome::Miss);
    }

    /// A latency beyond the rewind limit rejects the action instead of
    /// testing against present positions
    #[test]
    fn excessive_latency_is_unverifiable() {
        let mut range = strafing_target();
        let outcome = range
            .resolver
            .resolve(&mut range.world, &range.history, &shot(range.attacker, 1_000), 1_000);
        assert!(matches!(outcome, AttackOutcome::Unverifiable(_)));
    }

    /// A rejected attack does not start the cooldown; the next verifiable one does
    #[test]
    fn unverifiable_attack_leaves_cooldown_unused() {
        let mut range = strafing_target();
        let first = range
            .resolver
            .resolve(&mut range.world, &range.history, &shot(range.attacker, 5_000), 1_000);
        assert!(matches!(first, AttackOutcome::Unverifiable(_)));

        let second = range
            .resolver
            .resolve(&mut range.world, &range.history, &shot(range.attacker, 0), 1_001);
        assert_eq!(second, AttackOutcome::Miss);

        let third = range
            .resolver
            .resolve(&mut range.world, &range.history, &shot(range.attacker, 0), 1_002);
        assert_eq!(third, AttackOutcome::OnCooldown);
    }
}

/// REPLICATION TESTS
mod replication_tests {
    use super::*;

    const VIEWER: ConnectionId = ConnectionId(1);

    struct Stage {
        world: World,
        grid: SpatialGrid,
        engine: ReplicationEngine,
        movers: Vec<EntityId>,
    }

    fn stage(count: usize) -> Stage {
        let mut world = World::new(64);
        let viewer = spawn_fighter(&mut world, 1, Vec3::ZERO, 1);
        let movers = (0..count)
            .map(|i| spawn_fighter(&mut world, 10 + i as u64, Vec3::new(3.0 * i as f32, 0.0, 4.0), 2))
            .collect();
        let mut engine = ReplicationEngine::new(ReplicationConfig::default());
        engine.add_viewer(VIEWER, Some(viewer));
        Stage {
            world,
            grid: SpatialGrid::new(&SpatialConfig::default()),
            engine,
            movers,
        }
    }

    impl Stage {
        fn capture(&mut self, tick: u32) {
            self.engine.capture(tick, &self.world);
        }

        fn build(&mut self, tick: u32) -> server::replication::BuiltSnapshot {
            self.grid.clear();
            for (id, transform) in self.world.iter::<Transform>() {
                self.grid.insert(id, transform.position);
            }
            self.capture(tick);
            self.engine
                .build(VIEWER, tick, &self.world, &self.grid, 0)
                .unwrap()
        }
    }

    /// A baseline 40 ticks old is still held, so the viewer gets a delta
    #[test]
    fn baseline_within_history_gives_delta() {
        let mut s = stage(3);
        s.build(1);
        s.engine.acknowledge(VIEWER, 1).unwrap();

        for tick in 2..=40 {
            s.capture(tick);
        }
        let moved = s.movers[0];
        s.world.get_mut::<Transform>(moved).unwrap().position.x += 2.0;

        let built = s.build(41);
        assert_eq!(built.kind, SnapshotKind::Delta);
        assert_eq!(built.snapshot.baseline_tick, 1);
        assert_eq!(built.snapshot.entities.len(), 1);
        assert_eq!(built.snapshot.entities[0].entity, moved.to_raw());
    }

    /// A baseline 200 ticks old has left the 120-tick history: full state,
    /// baseline reset to the new snapshot
    #[test]
    fn expired_baseline_gives_full_snapshot() {
        let mut s = stage(3);
        s.build(1);
        s.engine.acknowledge(VIEWER, 1).unwrap();

        for tick in 2..=200 {
            s.capture(tick);
        }
        let built = s.build(201);
        assert_eq!(built.kind, SnapshotKind::Full);
        assert!(built.snapshot.full);
        assert!(built.snapshot.entities.iter().all(|record| record.is_full()));
        assert_eq!(built.snapshot.entities.len(), 4);
        assert_eq!(s.engine.viewer(VIEWER).unwrap().baseline(), Some(201));
    }
}

/// ZONE PIPELINE TESTS
mod zone_tests {
    use super::*;

    fn lone_zone(events: EventLog) -> Zone {
        let config = ServerConfig {
            migration: MigrationConfig {
                zones_x: 1,
                zones_z: 1,
                ..MigrationConfig::default()
            },
            ..ServerConfig::default()
        };
        let partition = Arc::new(WorldPartition::grid(&config.migration, &config.movement));
        Zone::new(
            ZoneId(0),
            partition,
            config,
            ResilientSessionCache::in_memory(InMemorySessionStore::new()),
            events,
        )
        .unwrap()
    }

    fn join(zone: &mut Zone, connection: u32, player_id: u64) -> EntityId {
        let now = zone.now_ms();
        zone.handle_client_event(
            ClientEvent::Join {
                connection: ConnectionId(connection),
                player_id,
            },
            now,
        );
        zone.clients()
            .get(ConnectionId(connection))
            .and_then(|client| client.entity)
            .unwrap()
    }

    fn hit_confirmations(outbound: &[Outbound]) -> Vec<ConnectionId> {
        outbound
            .iter()
            .filter_map(|out| match out {
                Outbound::Reliable {
                    connection,
                    event: ReliableEvent::HitConfirmed { .. },
                } => Some(*connection),
                _ => None,
            })
            .collect()
    }

    /// A melee swing lands, both players are told, and the hit is logged
    #[test]
    fn melee_hit_is_confirmed_and_logged() {
        let (events, mut log) = EventLog::new(16);
        let mut zone = lone_zone(events);
        join(&mut zone, 1, 100);
        let target = join(&mut zone, 2, 200);
        for _ in 0..5 {
            zone.step();
        }
        zone.drain_outbound();

        let swing = InputRecord::new(1, 0).with_actions(ActionFlags::default().with(ActionFlags::ATTACK));
        zone.client_sender()
            .try_send(ClientEvent::Input {
                connection: ConnectionId(1),
                input: swing,
            })
            .unwrap();
        zone.step();

        let outbound = zone.drain_outbound();
        let mut told = hit_confirmations(&outbound);
        told.sort();
        assert_eq!(told, vec![ConnectionId(1), ConnectionId(2)]);
        assert_eq!(zone.world().get::<CombatState>(target).unwrap().health, 7_500);

        let entry = log.try_recv().unwrap();
        assert_eq!(entry.attacker, GlobalId::player(100));
        assert_eq!(entry.target, GlobalId::player(200));
        assert_eq!(entry.damage, 2_500);
        assert!(!entry.killed);
    }

    /// A hit forwarded twice by a neighbour applies once
    #[test]
    fn forwarded_hit_applies_once() {
        let mut zone = lone_zone(EventLog::detached());
        let target = join(&mut zone, 1, 300);
        let hit = RemoteHit {
            key: HitKey {
                attacker: GlobalId::player(301),
                target: GlobalId::player(300),
                tick: 4,
                sequence: 9,
            },
            damage: 1_000,
            kind: AttackKind::Ranged,
            critical: false,
        };

        let sender = zone.zone_sender();
        for _ in 0..2 {
            sender
                .try_send(ZoneEnvelope {
                    from: ZoneId(1),
                    message: ZoneMessage::RemoteHit(hit.clone()),
                })
                .unwrap();
        }
        zone.step();

        assert_eq!(zone.stats().hits, 1);
        assert_eq!(zone.stats().duplicate_hits, 1);
        assert_eq!(zone.world().get::<CombatState>(target).unwrap().health, 9_000);
    }

    /// Snapshots carry the last processed input for reconciliation
    #[test]
    fn snapshot_reports_processed_input() {
        let mut zone = lone_zone(EventLog::detached());
        join(&mut zone, 1, 400);
        let sender = zone.client_sender();
        for sequence in 1..=3 {
            sender
                .try_send(ClientEvent::Input {
                    connection: ConnectionId(1),
                    input: InputRecord::new(sequence, 0).with_move(1.0, 0.0),
                })
                .unwrap();
            zone.step();
        }

        let last = zone
            .drain_outbound()
            .into_iter()
            .filter_map(|out| match out {
                Outbound::Unreliable {
                    packet: Packet::Snapshot(snapshot),
                    ..
                } => Some(snapshot.last_processed_input),
                _ => None,
            })
            .last();
        assert_eq!(last, Some(3));
    }
}

/// MIGRATION TESTS
mod migration_tests {
    use super::*;

    fn two_zone_config() -> ServerConfig {
        ServerConfig {
            migration: MigrationConfig {
                zones_x: 2,
                zones_z: 1,
                ..MigrationConfig::default()
            },
            ..ServerConfig::default()
        }
    }

    fn simulated_in(cluster: &Cluster, global: GlobalId) -> Vec<ZoneId> {
        cluster
            .zones()
            .iter()
            .filter(|zone| {
                zone.migration_state(global)
                    .map_or(false, |state| state.is_simulated())
            })
            .map(Zone::id)
            .collect()
    }

    /// Walks one NPC from zone 0 across x = 0. Every fourth trial zone 1
    /// stops ticking until zone 0 gives up waiting and forces the move.
    fn boundary_trial(trial: u64, config: &ServerConfig) {
        let mut rng = StdRng::seed_from_u64(trial);
        let silent = trial % 4 == 3;
        let mut cluster = Cluster::new(config, InMemorySessionStore::new(), EventLog::detached()).unwrap();
        let mut x = rng.gen_range(-45.0f32..-5.0);
        let z = rng.gen_range(-4_000.0f32..4_000.0);
        let speed = rng.gen_range(0.2f32..1.0);
        let bound = (config.migration.handoff_timeout_ms * config.tick.tick_rate as u64 / 1_000) as usize + 10;

        let zone0 = cluster.zone_mut(ZoneId(0)).unwrap();
        let npc = zone0.spawn_npc(Vec3::new(x, 0.0, z), 0).unwrap();
        let global = zone0.world().global(npc).unwrap();

        let mut offered_at = None;
        let mut resolved_at = None;
        for step in 0..600 {
            let zone0 = cluster.zone_mut(ZoneId(0)).unwrap();
            if zone0
                .migration_state(global)
                .map_or(false, |state| state.is_simulated())
            {
                if let Some(id) = zone0.world().find_global(global) {
                    x += speed;
                    zone0
                        .world_mut()
                        .set(id, Transform::at(Vec3::new(x, 0.0, z)))
                        .unwrap();
                }
            }

            let forced = cluster.zone(ZoneId(0)).unwrap().migration_stats().force_resolved > 0;
            if silent && !forced {
                cluster.zone_mut(ZoneId(0)).unwrap().step();
            } else {
                cluster.step_all();
            }

            let simulated = simulated_in(&cluster, global);
            assert!(simulated.len() <= 1, "trial {}: simulated in {:?}", trial, simulated);
            assert!(cluster.local_owners(global).len() <= 1, "trial {}: two Local copies", trial);

            let state0 = cluster.zone(ZoneId(0)).unwrap().migration_state(global);
            if offered_at.is_none()
                && matches!(state0, Some(MigrationState::Projected { offer: Some(_), .. }))
            {
                offered_at = Some(step);
            }
            if offered_at.is_some()
                && simulated == vec![ZoneId(1)]
                && !state0.map_or(false, |state| state.is_authoritative())
            {
                resolved_at = Some(step);
                break;
            }
        }

        let offered = offered_at.unwrap_or_else(|| panic!("trial {}: never offered", trial));
        let resolved = resolved_at.unwrap_or_else(|| panic!("trial {}: never resolved", trial));
        assert!(
            resolved - offered <= bound,
            "trial {}: took {} ticks, bound {}",
            trial,
            resolved - offered,
            bound
        );

        let stats = cluster.zone(ZoneId(0)).unwrap().migration_stats();
        assert_eq!(stats.completed + stats.force_resolved, 1, "trial {}", trial);
        if silent {
            assert_eq!(stats.force_resolved, 1, "trial {}", trial);
        }
    }

    /// 100 boundary crossings: never two authoritative copies, always resolved in bound
    #[test]
    fn hundred_boundary_crossings() {
        let config = two_zone_config();
        for trial in 0..100 {
            boundary_trial(trial, &config);
        }
    }

    /// Session state saved in one zone is visible to the other through the shared store
    #[test]
    fn sessions_shared_across_cluster() {
        let store = InMemorySessionStore::new();
        let mut cluster = Cluster::new(&two_zone_config(), store.clone(), EventLog::detached()).unwrap();
        let zone0 = cluster.zone_mut(ZoneId(0)).unwrap();
        let now = zone0.now_ms();
        zone0.handle_client_event(
            ClientEvent::Join {
                connection: ConnectionId(1),
                player_id: 55,
            },
            now,
        );
        zone0.handle_client_event(
            ClientEvent::Leave {
                connection: ConnectionId(1),
                reason: server::zone::LeaveReason::Disconnected,
            },
            now,
        );

        let zone1 = cluster.zone_mut(ZoneId(1)).unwrap();
        let record = zone1.sessions_mut().load(55).unwrap();
        assert_eq!(record.zone, 0);
    }
}

/// PROPERTY TESTS
mod property_tests {
    use super::*;

    fn input_strategy() -> impl Strategy<Value = (f32, f32, f32, bool, bool)> {
        (
            -1.0f32..=1.0,
            -1.0f32..=1.0,
            -3.14f32..3.14,
            any::<bool>(),
            any::<bool>(),
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Valid inputs never move an entity further than its mode allows
        #[test]
        fn displacement_stays_within_allowance(inputs in prop::collection::vec(input_strategy(), 1..120)) {
            let system = MovementSystem::new(MovementConfig::default(), DT);
            let validator = MovementValidator::new(AntiCheatConfig::default());
            let mut world = World::new(8);
            let id = spawn_mover(&mut world, Vec3::ZERO);

            for (index, (strafe, forward, yaw, sprint, jump)) in inputs.into_iter().enumerate() {
                let tick = index as u32 + 1;
                let mut actions = ActionFlags::default();
                if sprint {
                    actions = actions.with(ActionFlags::SPRINT);
                }
                if jump {
                    actions = actions.with(ActionFlags::JUMP);
                }
                let input = InputRecord::new(tick, 0)
                    .with_move(strafe, forward)
                    .with_look(yaw, 0.0)
                    .with_actions(actions);

                let before = *world.get::<Transform>(id).unwrap();
                let mode_before = world.get::<VelocityState>(id).unwrap().locomotion;
                let reports = system.run(&mut world, &validator, &HashMap::from([(id, input)]), tick, tick as u64 * 16);
                let after = *world.get::<Transform>(id).unwrap();
                let mode_after = world.get::<VelocityState>(id).unwrap().locomotion;

                let cap = system.max_speed(mode_before).max(system.max_speed(mode_after));
                let allowed = cap * DT * 1.2;
                prop_assert!(before.position.horizontal_distance(&after.position) <= allowed + 1e-4);
                prop_assert!(reports.iter().all(|report| !report.verdict.is_violation()));
            }
        }

        /// Steps beyond 100 units are teleports whatever speed is claimed
        #[test]
        fn long_steps_always_teleport(
            distance in 100.01f32..5_000.0,
            angle in 0.0f32..std::f32::consts::TAU,
            max_speed in 0.0f32..10_000.0,
            elapsed in 0.0f32..10.0,
        ) {
            let validator = MovementValidator::new(AntiCheatConfig::default());
            let from = Vec3::new(1.0, 0.0, -2.0);
            let to = from + Vec3::new(angle.cos() * distance, 0.0, angle.sin() * distance);
            let verdict = validator.check_step(from, to, max_speed, elapsed);
            prop_assert!(matches!(verdict, StepVerdict::Teleport { .. }), "expected Teleport, got {:?}", verdict);
        }

        /// Rewound positions lie between the two recorded frames around the target
        #[test]
        fn rewind_is_convex(
            positions in prop::collection::vec((-100.0f32..100.0, -100.0f32..100.0), 2..40),
            gaps in prop::collection::vec(1u64..40, 40),
            pick in 0.0f64..1.0,
        ) {
            let mut world = World::new(4);
            let id = spawn_mover(&mut world, Vec3::ZERO);
            let mut history = LagCompensator::new(&LagCompensationConfig::default());
            let mut recorded = Vec::new();
            let mut timestamp = 1_000;

            for (index, (x, z)) in positions.iter().enumerate() {
                timestamp += gaps[index];
                world.set(id, Transform::at(Vec3::new(*x, 0.0, *z))).unwrap();
                history.record(index as u32, timestamp, &world);
                recorded.push((timestamp, Vec3::new(*x, 0.0, *z)));
            }

            let (oldest, newest) = history.window().unwrap();
            let target = oldest + ((newest - oldest) as f64 * pick) as u64;
            let rewound = history.rewind_entity(id, target).unwrap().unwrap().position;

            let upper = recorded.iter().position(|(at, _)| *at > target).unwrap_or(recorded.len() - 1);
            let lower = if recorded[upper].0 > target { upper - 1 } else { upper };
            let (a, b) = (recorded[lower].1, recorded[upper].1);
            prop_assert!(rewound.x >= a.x.min(b.x) - 1e-3 && rewound.x <= a.x.max(b.x) + 1e-3);
            prop_assert!(rewound.z >= a.z.min(b.z) - 1e-3 && rewound.z <= a.z.max(b.z) + 1e-3);

            // Past the newest frame the answer is the newest frame, never extrapolated
            let late = history.rewind_entity(id, newest + 500).unwrap().unwrap().position;
            prop_assert_eq!(late, recorded[recorded.len() - 1].1);
        }

        /// Replaying a hit key applies its damage exactly once
        #[test]
        fn replayed_hit_keys_apply_once(
            distinct in 1usize..16,
            replays in prop::collection::vec(0usize..16, 1..48),
        ) {
            let resolver = CombatResolver::new(CombatConfig::default(), SpatialConfig::default());
            let mut world = World::new(4);
            spawn_fighter(&mut world, 1, Vec3::ZERO, 1);
            let target = spawn_fighter(&mut world, 2, Vec3::new(1.0, 0.0, 0.0), 2);

            let mut applied = HashSet::new();
            for pick in replays {
                let sequence = (pick % distinct) as u32;
                let hit = PendingHit {
                    key: HitKey {
                        attacker: GlobalId::player(1),
                        target: GlobalId::player(2),
                        tick: 7,
                        sequence,
                    },
                    target,
                    damage: 10,
                    kind: AttackKind::Melee,
                    critical: false,
                };
                match resolver.apply_hit(&mut world, &hit, 1_000) {
                    HitOutcome::Applied(_) => prop_assert!(applied.insert(sequence)),
                    HitOutcome::Duplicate => prop_assert!(applied.contains(&sequence)),
                    HitOutcome::TargetGone => prop_assert!(false, "target vanished"),
                }
            }
            let health = world.get::<CombatState>(target).unwrap().health;
            prop_assert_eq!(health as usize, 10_000 - 10 * applied.len());
        }

        /// Nothing changed since the acknowledged tick means no records
        #[test]
        fn unchanged_world_sends_empty_delta(
            spots in prop::collection::vec((-40.0f32..40.0, -40.0f32..40.0), 0..15),
        ) {
            let mut world = World::new(32);
            let viewer = spawn_fighter(&mut world, 1, Vec3::ZERO, 1);
            for (index, (x, z)) in spots.iter().enumerate() {
                spawn_fighter(&mut world, 10 + index as u64, Vec3::new(*x, 0.0, *z), 2);
            }
            let mut grid = SpatialGrid::new(&SpatialConfig::default());
            for (id, transform) in world.iter::<Transform>() {
                grid.insert(id, transform.position);
            }
            let viewer_connection = ConnectionId(1);
            let mut engine = ReplicationEngine::new(ReplicationConfig::default());
            engine.add_viewer(viewer_connection, Some(viewer));

            engine.capture(1, &world);
            let first = engine.build(viewer_connection, 1, &world, &grid, 0).unwrap();
            prop_assert_eq!(first.snapshot.entities.len(), spots.len() + 1);
            engine.acknowledge(viewer_connection, 1).unwrap();

            engine.capture(2, &world);
            let second = engine.build(viewer_connection, 2, &world, &grid, 0).unwrap();
            prop_assert_eq!(second.kind, SnapshotKind::Delta);
            prop_assert!(second.snapshot.entities.is_empty());
            prop_assert!(second.snapshot.removed.is_empty());
        }
    }
}
