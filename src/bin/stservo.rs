use std::collections::HashMap;
use std::f64::consts::PI;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand, ValueEnum};

use stservo_controller::bus::{ServoBus, StsBus};
use stservo_controller::registers::MAX_ID;
use stservo_controller::transport::DEFAULT_BAUD_RATE;
use stservo_controller::{DriverConfig, Limit, OperatingMode, Outcome, Procedure, ServoArmDriver};

const DEFAULT_PORTS: &[&str] = &["/dev/ttyACM0", "/dev/ttyUSB0", "/dev/tty.usbmodem58FA0959031"];

#[derive(Parser)]
#[command(name = "stservo", about = "Feetech STS servo bus tool")]
struct Cli {
    /// Serial port; the first existing default port is used when omitted.
    #[arg(short, long, global = true)]
    port: Option<String>,

    #[arg(short, long, global = true, default_value_t = DEFAULT_BAUD_RATE)]
    baudrate: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ping every id in a range and list the servos that answer.
    Scan {
        #[arg(long, default_value_t = 0)]
        first: u8,
        #[arg(long, default_value_t = MAX_ID)]
        last: u8,
    },
    ChangeId {
        #[arg(long)]
        id: u8,
        #[arg(long)]
        new_id: u8,
    },
    ChangeMode {
        #[arg(long)]
        id: u8,
        #[arg(long, value_enum)]
        mode: ModeArg,
    },
    SetLimit {
        #[arg(long)]
        id: u8,
        #[arg(long, value_enum)]
        limit: LimitArg,
        #[arg(long)]
        value: u16,
    },
    /// Make the current position the servo's mid point.
    DefineMiddle {
        #[arg(long)]
        id: u8,
    },
    /// Print every joint angle of a configured arm.
    Read {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Move every joint along a sine wave until Ctrl+C.
    Sweep {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long, default_value_t = 30.0)]
        amplitude_deg: f64,
        #[arg(long, default_value_t = 0.25)]
        freq: f64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Position,
    Wheel,
    Pwm,
    Step,
}

impl From<ModeArg> for OperatingMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Position => OperatingMode::Position,
            ModeArg::Wheel => OperatingMode::Wheel,
            ModeArg::Pwm => OperatingMode::Pwm,
            ModeArg::Step => OperatingMode::Step,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum LimitArg {
    Min,
    Max,
}

fn find_port(port: Option<String>) -> Result<String, Box<dyn std::error::Error>> {
    let port = port
        .or_else(|| {
            DEFAULT_PORTS
                .iter()
                .find(|port| Path::new(port).exists())
                .map(|s| s.to_string())
        })
        .ok_or("No serial port found. Please specify one with --port /dev/ttyUSB0")?;
    println!("Using serial port: {}", port);
    Ok(port)
}

fn load_config(
    path: &Path,
    port: Option<String>,
    baudrate: u32,
) -> Result<DriverConfig, Box<dyn std::error::Error>> {
    let mut config = DriverConfig::load(path)?;
    if let Some(port) = port {
        config.port = port;
    }
    if baudrate != DEFAULT_BAUD_RATE {
        config.baudrate = baudrate;
    }
    Ok(config)
}

fn run_procedure(
    port: Option<String>,
    baudrate: u32,
    procedure: Procedure,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut bus = StsBus::open(&find_port(port)?, baudrate)?;
    match bus.run_procedure(procedure)? {
        Outcome::Applied => println!("{} applied", procedure),
        Outcome::PartialSuccess { warning } => {
            println!("{} applied with warning: {}", procedure, warning)
        }
    }
    bus.close();
    Ok(())
}

fn sweep(
    config: DriverConfig,
    amplitude_deg: f64,
    freq: f64,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut driver = ServoArmDriver::open(&config)?;
    driver.set_torque(true)?;
    println!("Running sine wave motion. Press Ctrl+C to stop.");

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let t0 = Instant::now();
    let amp = amplitude_deg.to_radians();
    let joints = driver.joint_names().to_vec();

    while running.load(Ordering::SeqCst) {
        let t = t0.elapsed().as_secs_f64();
        let pos = (2.0 * PI * freq * t).sin() * amp;

        let goals: HashMap<String, f64> = joints.iter().map(|name| (name.clone(), pos)).collect();
        driver.send_joint_goals(&goals)?;

        let current = driver.read_all_joint_positions()?;
        let errors: Vec<f64> = current
            .values()
            .map(|reading| (reading.radians - pos).abs())
            .collect();
        let max_error = errors.iter().cloned().fold(0.0, f64::max);
        let mean_error = errors.iter().sum::<f64>() / errors.len().max(1) as f64;

        print!(
            "\rTime: {:6.2}s | Goal: {:6.1}° | Max Error: {:5.2}° | Mean Error: {:5.2}°",
            t,
            pos.to_degrees(),
            max_error.to_degrees(),
            mean_error.to_degrees()
        );
        io::stdout().flush()?;

        std::thread::sleep(Duration::from_millis(10));
    }

    println!("\n\nShutting down gracefully...");
    driver.set_torque(false)?;
    driver.shutdown();
    println!("Servos released. Goodbye!");
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Scan { first, last } => {
            let mut bus = StsBus::open(&find_port(cli.port)?, cli.baudrate)?;
            let found = bus.scan(first..=last);
            if found.is_empty() {
                println!("No servo answered between {} and {}", first, last);
            }
            for (id, model) in found {
                println!("id {:3}  model {}", id, model);
            }
            bus.close();
        }
        Command::ChangeId { id, new_id } => run_procedure(
            cli.port,
            cli.baudrate,
            Procedure::ChangeId { old_id: id, new_id },
        )?,
        Command::ChangeMode { id, mode } => run_procedure(
            cli.port,
            cli.baudrate,
            Procedure::ChangeMode {
                id,
                mode: mode.into(),
            },
        )?,
        Command::SetLimit { id, limit, value } => {
            let limit = match limit {
                LimitArg::Min => Limit::Min,
                LimitArg::Max => Limit::Max,
            };
            run_procedure(
                cli.port,
                cli.baudrate,
                Procedure::ChangeLimit { id, limit, value },
            )?
        }
        Command::DefineMiddle { id } => {
            run_procedure(cli.port, cli.baudrate, Procedure::DefineMiddle { id })?
        }
        Command::Read { config } => {
            let config = load_config(&config, cli.port, cli.baudrate)?;
            let mut driver = ServoArmDriver::open(&config)?;
            let readings = driver.read_all_joint_positions()?;
            for name in driver.joint_names() {
                if let Some(reading) = readings.get(name) {
                    let flag = if reading.stale { " (stale)" } else { "" };
                    println!("{:>12}: {:8.2}°{}", name, reading.radians.to_degrees(), flag);
                }
            }
            driver.shutdown();
        }
        Command::Sweep {
            config,
            amplitude_deg,
            freq,
        } => sweep(
            load_config(&config, cli.port, cli.baudrate)?,
            amplitude_deg,
            freq,
        )?,
    }

    Ok(())
}
