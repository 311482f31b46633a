use std::collections::HashMap;

use glam::Vec2;

use flightline::{
    ControlState, EntityHandle, EntityState, FlightModel, InputSample, Integrator, Packet,
    PacketType, World,
};

const DT: f32 = 1.0 / 60.0;

fn maneuver(len: u32) -> Vec<InputSample> {
    (1..=len)
        .map(|seq| {
            let t = seq as f32 * DT;
            let control = ControlState::new(1.0, (t * 3.0).sin(), 0.0, (t * 1.7).cos());
            InputSample::new(seq, u64::from(seq) * 16, control, seq % 40 < 20, DT)
        })
        .collect()
}

/// Sends each sample through the wire format and applies it to a world
/// entity the way the authority does.
fn authoritative_run(samples: &[InputSample], spawn: Vec2) -> (World, EntityHandle) {
    let model = FlightModel::default();
    let mut world = World::new();
    let handle = world.spawn_ship(spawn);

    for sample in samples {
        let bytes = Packet::new(PacketType::PlayerInput(sample.to_wire(1)))
            .serialize()
            .unwrap();
        let PacketType::PlayerInput(input) = Packet::deserialize(&bytes).unwrap().payload else {
            panic!("input did not survive the wire");
        };
        let received = InputSample::from_wire(&input, DT);

        let entity = world.get_mut(handle).unwrap();
        entity.control = received.control;
        entity.flight_assist = received.flight_assist;
        model.integrate(&mut entity.state, &received.control, received.flight_assist, DT);
        world.advance_tick();
    }
    (world, handle)
}

#[test]
fn test_local_and_remote_integration_agree() {
    let spawn = Vec2::new(20.0, 0.0);
    let samples = maneuver(240);

    let model = FlightModel::default();
    let mut local = EntityState::at(spawn, 0.0);
    for sample in &samples {
        model.integrate(&mut local, &sample.control, sample.flight_assist, sample.dt);
    }

    let (world, handle) = authoritative_run(&samples, spawn);
    let remote = world.get(handle).unwrap().state;

    assert_eq!(world.tick(), 240);
    assert!(local.position_error(&remote) < 1e-4);
    assert!(local.rotation_error(&remote) < 1e-4);
    assert!(local.position.distance(spawn) > 1.0);
}

#[test]
fn test_snapshot_reports_the_acknowledged_sequence() {
    let samples = maneuver(30);
    let (world, handle) = authoritative_run(&samples, Vec2::ZERO);

    let owners: HashMap<u32, u32> = [(handle.id(), 30)].into_iter().collect();
    let snapshot = world.snapshot(&owners);
    let bytes = Packet::new(PacketType::WorldSnapshot(snapshot)).serialize().unwrap();

    let PacketType::WorldSnapshot(decoded) = Packet::deserialize(&bytes).unwrap().payload else {
        panic!("snapshot did not survive the wire");
    };
    let entity = decoded.entity(handle.id()).unwrap();
    let state = EntityState::from_snapshot(entity).unwrap();

    assert_eq!(decoded.tick, 30);
    assert_eq!(entity.last_processed_sequence, 30);
    assert!(state.position_error(&world.get(handle).unwrap().state) < 1e-6);
}
