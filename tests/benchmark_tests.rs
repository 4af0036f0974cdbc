//! Performance benchmarks for the hot paths of a zone tick
//!
//! The limits are loose enough for unoptimised test builds; they catch
//! accidental quadratic behaviour, not small regressions.

use server::client_manager::ConnectionId;
use server::components::{CombatState, EntityKind, GlobalId, Transform, VelocityState};
use server::config::{
    AntiCheatConfig, LagCompensationConfig, MigrationConfig, MovementConfig, ReplicationConfig,
    ServerConfig, SpatialConfig,
};
use server::history::LagCompensator;
use server::movement::MovementSystem;
use server::persistence::{EventLog, InMemorySessionStore, ResilientSessionCache};
use server::physics::Vec3;
use server::replication::ReplicationEngine;
use server::spatial::SpatialGrid;
use server::validation::MovementValidator;
use server::world::{EntityId, World};
use server::zone::{ClientEvent, WorldPartition, Zone, ZoneId};
use shared::{decode_packet, encode_packet, EntityRecord, FieldMask, InputRecord, Packet, Snapshot};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Deterministic scatter over a square of side `extent`.
fn scatter(index: usize, extent: f32) -> Vec3 {
    let golden = 0.618_034_f32;
    let u = (index as f32 * golden).fract();
    let v = (index as f32 * golden * golden).fract();
    Vec3::new((u - 0.5) * extent, 0.0, (v - 0.5) * extent)
}

fn populate(world: &mut World, count: usize, extent: f32) -> Vec<EntityId> {
    (0..count)
        .map(|i| {
            let id = world.create_with_global(GlobalId::player(i as u64 + 1)).unwrap();
            world.set(id, Transform::at(scatter(i, extent))).unwrap();
            world.set(id, VelocityState::default()).unwrap();
            world.set(id, CombatState::new(10_000, (i % 4) as u8)).unwrap();
            world.set(id, EntityKind::Player).unwrap();
            id
        })
        .collect()
}

/// Benchmarks spatial grid rebuild and radius queries
#[test]
fn benchmark_spatial_queries() {
    let mut world = World::new(10_000);
    let ids = populate(&mut world, 10_000, 2_000.0);
    let mut grid = SpatialGrid::new(&SpatialConfig::default());

    let iterations = 100;
    let start = Instant::now();
    let mut found = 0;

    for round in 0..iterations {
        grid.clear();
        for (id, transform) in world.iter::<Transform>() {
            grid.insert(id, transform.position);
        }
        for probe in 0..100 {
            let center = scatter(round * 100 + probe, 2_000.0);
            found += grid.query_radius(center, 50.0).len();
        }
    }

    let duration = start.elapsed();
    println!(
        "Spatial grid: {} rebuilds of {} entities + {} queries in {:?} ({} hits)",
        iterations,
        ids.len(),
        iterations * 100,
        duration,
        found
    );

    assert!(found > 0);
    assert!(duration.as_secs() < 10);
}

/// Benchmarks one second of movement for a thousand entities
#[test]
fn benchmark_movement_ticks() {
    let system = MovementSystem::new(MovementConfig::default(), 1.0 / 60.0);
    let validator = MovementValidator::new(AntiCheatConfig::default());
    let mut world = World::new(1_000);
    let ids = populate(&mut world, 1_000, 1_000.0);

    let start = Instant::now();
    for tick in 1..=60u32 {
        let inputs: HashMap<EntityId, InputRecord> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let strafe = if i % 2 == 0 { 1.0 } else { -1.0 };
                (*id, InputRecord::new(tick, 0).with_move(strafe, 1.0))
            })
            .collect();
        system.run(&mut world, &validator, &inputs, tick, tick as u64 * 16);
    }

    let duration = start.elapsed();
    println!(
        "Movement: {} entities × 60 ticks in {:?} ({:.2} μs/tick)",
        ids.len(),
        duration,
        duration.as_micros() as f64 / 60.0
    );

    assert!(duration.as_secs() < 5);
}

/// Benchmarks history recording and rewinds
#[test]
fn benchmark_lag_compensation() {
    let mut world = World::new(500);
    let ids = populate(&mut world, 500, 500.0);
    let mut history = LagCompensator::new(&LagCompensationConfig::default());

    let start = Instant::now();
    for tick in 0..120u32 {
        for id in &ids {
            if let Some(transform) = world.get_mut::<Transform>(*id) {
                transform.position.x += 0.1;
            }
        }
        history.record(tick, tick as u64 * 16 + 1_000, &world);
    }
    let recorded = start.elapsed();

    let rewinds = 1_000;
    let start = Instant::now();
    for i in 0..rewinds {
        let target = 1_000 + (i as u64 * 7) % (119 * 16);
        let id = ids[i % ids.len()];
        assert!(history.rewind_entity(id, target).unwrap().is_some());
    }
    let rewound = start.elapsed();

    println!(
        "Lag compensation: 120 frames of {} entities in {:?}, {} rewinds in {:?}",
        ids.len(),
        recorded,
        rewinds,
        rewound
    );

    assert!(recorded.as_secs() < 5);
    assert!(rewound.as_secs() < 5);
}

/// Benchmarks snapshot building for many viewers in a crowd
#[test]
fn benchmark_snapshot_building() {
    let mut world = World::new(500);
    let ids = populate(&mut world, 500, 300.0);
    let mut grid = SpatialGrid::new(&SpatialConfig::default());
    for (id, transform) in world.iter::<Transform>() {
        grid.insert(id, transform.position);
    }
    let mut engine = ReplicationEngine::new(ReplicationConfig::default());
    for (i, id) in ids.iter().take(50).enumerate() {
        engine.add_viewer(ConnectionId(i as u32 + 1), Some(*id));
    }

    let ticks = 60u32;
    let start = Instant::now();
    let mut bytes = 0;
    for tick in 1..=ticks {
        for id in ids.iter().step_by(3) {
            if let Some(transform) = world.get_mut::<Transform>(*id) {
                transform.position.z -= 0.1;
            }
        }
        engine.capture(tick, &world);
        for (connection, built) in engine.build_all(tick, &world, &grid, |_| 0) {
            bytes += built.estimated_bytes;
            engine.acknowledge(connection, tick).unwrap();
        }
    }

    let duration = start.elapsed();
    println!(
        "Replication: 50 viewers × {} ticks in {:?}, {} bytes estimated",
        ticks, duration, bytes
    );

    assert!(bytes > 0);
    assert!(duration.as_secs() < 10);
}

/// Benchmarks encoding and decoding a full snapshot packet
#[test]
fn benchmark_packet_serialization() {
    let entities: Vec<EntityRecord> = (0..25u32)
        .map(|i| EntityRecord {
            entity: i,
            mask: FieldMask::ALL,
            position: Some([i as i32 * 64, 0, -(i as i32) * 64]),
            rotation: Some([0, 0]),
            velocity: Some([256, 0, -256]),
            health: Some(10_000),
            locomotion: Some(0),
            kind: Some(0),
            team: Some(1),
        })
        .collect();
    let packet = Packet::Snapshot(Snapshot {
        server_tick: 12_345,
        baseline_tick: 12_345,
        full: true,
        last_processed_input: 99,
        entities,
        removed: Vec::new(),
    });

    let iterations = 10_000;
    let start = Instant::now();
    let mut size = 0;
    for _ in 0..iterations {
        let data = encode_packet(&packet).unwrap();
        size = data.len();
        let decoded = decode_packet(&data).unwrap();
        assert!(matches!(decoded, Packet::Snapshot(_)));
    }

    let duration = start.elapsed();
    println!(
        "Packet serialization: {} round trips of {} bytes in {:?} ({:.2} μs/iter)",
        iterations,
        size,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(size < 1_400);
    assert!(duration.as_secs() < 5);
}

/// Benchmarks full zone ticks with a hundred connected players
#[test]
fn benchmark_zone_tick() {
    let config = ServerConfig {
        migration: MigrationConfig {
            zones_x: 1,
            zones_z: 1,
            ..MigrationConfig::default()
        },
        ..ServerConfig::default()
    };
    let partition = Arc::new(WorldPartition::grid(&config.migration, &config.movement));
    let mut zone = Zone::new(
        ZoneId(0),
        partition,
        config,
        ResilientSessionCache::in_memory(InMemorySessionStore::new()),
        EventLog::detached(),
    )
    .unwrap();

    let players = 100u32;
    for connection in 1..=players {
        let now = zone.now_ms();
        zone.handle_client_event(
            ClientEvent::Join {
                connection: ConnectionId(connection),
                player_id: connection as u64,
            },
            now,
        );
    }

    let ticks = 120u32;
    let sender = zone.client_sender();
    let start = Instant::now();
    for sequence in 1..=ticks {
        for connection in 1..=players {
            let strafe = if connection % 2 == 0 { 1.0 } else { -1.0 };
            let _ = sender.try_send(ClientEvent::Input {
                connection: ConnectionId(connection),
                input: InputRecord::new(sequence, 0).with_move(strafe, 1.0),
            });
        }
        zone.step();
        zone.drain_outbound();
    }

    let duration = start.elapsed();
    println!(
        "Zone: {} players × {} ticks in {:?} ({:.2} ms/tick)",
        players,
        ticks,
        duration,
        duration.as_secs_f64() * 1_000.0 / ticks as f64
    );

    assert_eq!(zone.clients().len(), players as usize);
    assert!(duration.as_secs() < 20);
}
