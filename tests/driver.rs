use std::collections::HashMap;
use std::thread;
use std::time::{Duration, Instant};

use stservo_controller::registers;
use stservo_controller::{DriverConfig, ServoArmDriver, ServoError, SimulatedBus};

const ARM: &str = r#"
    port = "/dev/null"
    joint_order = ["shoulder", "elbow"]
    motor_ids = [1, 2]

    [motor_orientations]
    "2" = -1
"#;

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

fn arm() -> (SimulatedBus, ServoArmDriver<SimulatedBus>) {
    let config = DriverConfig::from_toml_str(ARM).unwrap();
    let bus = SimulatedBus::new().with_servo(1, 0).with_servo(2, 0);
    let driver = ServoArmDriver::with_bus(&config, bus.clone()).unwrap();
    (bus, driver)
}

#[test]
fn joints_map_to_configured_ids() {
    let (_bus, driver) = arm();
    assert_eq!(driver.joint_names(), ["shoulder", "elbow"]);
    assert_eq!(driver.servo_id("elbow").unwrap(), 2);
    assert!(matches!(
        driver.servo_id("wrist"),
        Err(ServoError::InvalidArgument(_))
    ));
}

#[test]
fn reversed_joint_goes_below_zero_and_reads_back() {
    let (bus, driver) = arm();

    let goals = HashMap::from([("elbow".to_string(), 0.25)]);
    driver.send_joint_goals(&goals).unwrap();
    assert!(wait_until(|| bus.goal_writes(2) == 1));
    // -163 ticks wraps into the previous turn.
    assert_eq!(
        bus.register_u16(2, registers::PRESENT_POSITION),
        Some(4096 - 163)
    );

    let readings = driver.read_joint_positions(&["elbow"]).unwrap();
    assert!((readings["elbow"].radians - 0.25).abs() < 2e-3);
    assert_eq!(driver.controller().loop_count(2), Some(-1));
}

#[test]
fn unknown_joint_rejects_whole_command() {
    let (bus, driver) = arm();

    let goals = HashMap::from([("shoulder".to_string(), 0.4), ("wrist".to_string(), 0.1)]);
    assert!(driver.send_joint_goals(&goals).is_err());
    thread::sleep(Duration::from_millis(50));
    assert_eq!(bus.goal_writes(1), 0);
}

#[test]
fn all_joints_are_read_by_name() {
    let (bus, driver) = arm();
    bus.set_position(1, 1024);

    let readings = driver.read_all_joint_positions().unwrap();
    assert_eq!(readings.len(), 2);
    assert!((readings["shoulder"].radians - std::f64::consts::FRAC_PI_2).abs() < 1e-9);
    assert_eq!(readings["elbow"].radians, 0.0);
}
