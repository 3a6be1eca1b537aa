use std::collections::BTreeMap;
use std::f64::consts::FRAC_PI_4;
use std::thread;
use std::time::{Duration, Instant};

use stservo_controller::bus::{BusOp, ServoBus, SimulatedBus};
use stservo_controller::controller::Phase;
use stservo_controller::registers::{self, TORQUE_ENABLE};
use stservo_controller::{
    CommResult, Limit, MotionSettings, MultiServoController, OperatingMode, Orientation, Procedure,
    ServoError, ServoKinematics,
};

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn plain(ids: &[u8]) -> BTreeMap<u8, ServoKinematics> {
    ids.iter()
        .map(|&id| (id, ServoKinematics::default()))
        .collect()
}

fn controller(bus: &SimulatedBus, ids: &[u8]) -> MultiServoController<SimulatedBus> {
    MultiServoController::new(bus.clone(), plain(ids), MotionSettings::default()).unwrap()
}

#[test]
fn loop_count_follows_wraps_between_reads() {
    let bus = SimulatedBus::new().with_servo(1, 10);
    let controller = controller(&bus, &[1]);

    let mut loops = vec![controller.loop_count(1).unwrap()];
    for raw in [4090, 4085, 5, 4000] {
        bus.set_position(1, raw);
        controller.read_angles(&[1]).unwrap();
        loops.push(controller.loop_count(1).unwrap());
    }
    assert_eq!(loops, vec![0, -1, -1, 0, -1]);

    let angle = controller.read_angles(&[1]).unwrap()[&1].radians;
    let expected = (-4096.0 + 4000.0) / 4096.0 * std::f64::consts::TAU;
    assert!((angle - expected).abs() < 1e-9);
}

#[test]
fn startup_applies_position_mode_and_clears_limits() {
    let mut bus = SimulatedBus::new().with_servo(3, 0);
    bus.run_procedure(Procedure::ChangeMode {
        id: 3,
        mode: OperatingMode::Wheel,
    })
    .unwrap();
    bus.run_procedure(Procedure::ChangeLimit {
        id: 3,
        limit: Limit::Max,
        value: 4095,
    })
    .unwrap();

    let _controller = controller(&bus, &[3]);
    assert_eq!(bus.register_u8(3, registers::MODE), Some(0));
    assert_eq!(bus.register_u16(3, registers::MAX_ANGLE_LIMIT), Some(0));
    assert_eq!(bus.register_u16(3, registers::MIN_ANGLE_LIMIT), Some(0));
}

#[test]
fn absent_servo_fails_construction() {
    let bus = SimulatedBus::new().with_servo(1, 0);
    let result = MultiServoController::new(bus, plain(&[1, 2]), MotionSettings::default());
    assert!(matches!(
        result,
        Err(ServoError::Communication {
            id: 2,
            result: CommResult::NoResponse
        })
    ));
}

#[test]
fn geared_goal_reaches_the_bus() {
    let bus = SimulatedBus::new().with_servo(1, 0);
    let mut kinematics = BTreeMap::new();
    kinematics.insert(
        1,
        ServoKinematics::new(4096, 3.0, Orientation::Normal, 0.0, 0, 0).unwrap(),
    );
    let controller =
        MultiServoController::new(bus.clone(), kinematics, MotionSettings::default()).unwrap();

    controller.set_goal(1, FRAC_PI_4).unwrap();
    assert!(wait_until(|| controller.last_sent_ticks(1) == Some(1536)));
    assert_eq!(bus.register_u16(1, registers::GOAL_POSITION), Some(1536));
    assert_eq!(bus.register_u16(1, registers::GOAL_SPEED), Some(133));
    assert_eq!(bus.register_u8(1, registers::ACCELERATION), Some(50));

    let reading = controller.read_angles(&[1]).unwrap()[&1];
    assert!(!reading.stale);
    assert!((reading.radians - FRAC_PI_4).abs() < 1e-9);
}

#[test]
fn repeated_goal_is_written_once() {
    let bus = SimulatedBus::new().with_servo(1, 0);
    let controller = controller(&bus, &[1]);

    controller.set_goal(1, 0.5).unwrap();
    assert!(wait_until(|| controller.phase(1) == Some(Phase::Idle)
        && controller.last_sent_ticks(1).is_some()));
    controller.set_goal(1, 0.5).unwrap();
    thread::sleep(Duration::from_millis(50));

    assert_eq!(bus.goal_writes(1), 1);
    assert_eq!(controller.phase(1), Some(Phase::Idle));
}

#[test]
fn concurrent_goals_never_overlap_on_the_bus() {
    let ids = [1, 2, 3, 4, 5];
    let bus = ids
        .iter()
        .fold(SimulatedBus::new(), |bus, &id| bus.with_servo(id, 0))
        .with_latency(Duration::from_millis(5));
    let controller = controller(&bus, &ids);

    thread::scope(|scope| {
        for &id in &ids {
            let controller = &controller;
            scope.spawn(move || controller.set_goal(id, 0.1 * id as f64).unwrap());
        }
        scope.spawn(|| controller.read_angles(&ids).unwrap());
    });

    assert!(wait_until(|| ids.iter().all(|&id| bus.goal_writes(id) == 1)));

    let mut accesses = bus.accesses();
    accesses.sort_by_key(|a| a.started);
    for pair in accesses.windows(2) {
        assert!(pair[0].finished <= pair[1].started);
    }
    assert_eq!(bus.overlaps(), 0);
    assert!(accesses.iter().any(|a| a.op == BusOp::Read));
}

#[test]
fn failed_read_returns_last_known_angle() {
    let bus = SimulatedBus::new().with_servo(1, 1024);
    let controller = controller(&bus, &[1]);

    let fresh = controller.read_angles(&[1]).unwrap()[&1];
    bus.fail_reads(1, 1);
    bus.set_position(1, 2000);

    let stale = controller.read_angles(&[1]).unwrap()[&1];
    assert!(stale.stale);
    assert_eq!(stale.radians, fresh.radians);

    let recovered = controller.read_angles(&[1]).unwrap()[&1];
    assert!(!recovered.stale);
    assert!(recovered.radians > fresh.radians);
}

#[test]
fn failed_goal_write_is_retried_on_next_goal() {
    let bus = SimulatedBus::new().with_servo(1, 0);
    let controller = controller(&bus, &[1]);
    bus.fail_writes(1, 1);

    controller.set_goal(1, 0.5).unwrap();
    assert!(wait_until(
        || bus.goal_writes(1) == 1 && controller.phase(1) == Some(Phase::Idle)
    ));
    assert_eq!(controller.last_sent_ticks(1), None);

    controller.set_goal(1, 0.5).unwrap();
    assert!(wait_until(|| controller.last_sent_ticks(1).is_some()));
    assert_eq!(bus.goal_writes(1), 2);
}

#[test]
fn unknown_servo_and_bad_goals_are_rejected() {
    let bus = SimulatedBus::new().with_servo(1, 0);
    let controller = controller(&bus, &[1]);

    assert!(matches!(
        controller.set_goal(9, 0.0),
        Err(ServoError::InvalidArgument(_))
    ));
    assert!(matches!(
        controller.set_goal(1, f64::NAN),
        Err(ServoError::InvalidArgument(_))
    ));
    assert!(controller.read_angles(&[1, 9]).is_err());
    // A bad entry keeps the good one from being applied.
    assert!(controller.set_goals([(1, 0.3), (9, 0.3)]).is_err());
    thread::sleep(Duration::from_millis(50));
    assert_eq!(bus.goal_writes(1), 0);
}

#[test]
fn managed_ids_cannot_be_reassigned() {
    let bus = SimulatedBus::new().with_servo(1, 0).with_servo(7, 0);
    let controller = controller(&bus, &[1]);

    for procedure in [
        Procedure::ChangeId { old_id: 1, new_id: 9 },
        Procedure::ChangeId { old_id: 7, new_id: 1 },
    ] {
        assert!(matches!(
            controller.run_procedure(procedure),
            Err(ServoError::InvalidArgument(_))
        ));
    }
    assert!(bus.has_servo(1));
    let procedures_run = |bus: &SimulatedBus| {
        bus.accesses()
            .iter()
            .filter(|a| a.op == BusOp::Procedure && a.id != 1)
            .count()
    };
    assert_eq!(procedures_run(&bus), 0);

    controller
        .run_procedure(Procedure::ChangeId { old_id: 7, new_id: 8 })
        .unwrap();
    assert!(bus.has_servo(8));
    assert_eq!(procedures_run(&bus), 1);
}

#[test]
fn torque_goes_out_as_one_sync_write() {
    let bus = SimulatedBus::new().with_servo(1, 0).with_servo(2, 0);
    let controller = controller(&bus, &[1, 2]);

    controller.set_torque(true).unwrap();
    assert_eq!(bus.register_u8(1, TORQUE_ENABLE), Some(1));
    assert_eq!(bus.register_u8(2, TORQUE_ENABLE), Some(1));
    let sync_writes = bus
        .accesses()
        .iter()
        .filter(|a| a.op == BusOp::SyncWrite)
        .count();
    assert_eq!(sync_writes, 1);

    controller.set_torque(false).unwrap();
    assert_eq!(bus.register_u8(2, TORQUE_ENABLE), Some(0));
}

#[test]
fn shutdown_is_prompt_and_idempotent() {
    let bus = SimulatedBus::new().with_servo(1, 0).with_servo(2, 0);
    let mut controller = controller(&bus, &[1, 2]);

    let start = Instant::now();
    controller.shutdown();
    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(bus.is_closed());

    controller.shutdown();
    assert!(bus.is_closed());
}
