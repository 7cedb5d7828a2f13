use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use register_transport as rt;
use register_transport::{DeviceSession, RegWidth, RegisterBus};
use stage_motion::{registers, MachineConstants, MetricsHub, MotionController, StageConfig};

#[derive(Parser, Debug)]
#[command(
    name = "stage",
    version,
    about = "Single-axis stage controller",
    disable_help_subcommand = true
)]
struct Cli {
    /// Register backend
    #[arg(long, value_enum, default_value_t = Backend::Mock, global = true)]
    backend: Backend,
    /// Serial port for the RTU backend (name only for mock)
    #[arg(long, default_value = "/dev/ttyUSB0", global = true)]
    port: String,
    /// Override the configured baud rate
    #[arg(long, global = true)]
    baud: Option<u32>,
    /// Override the configured station id (1..=247)
    #[arg(long, global = true)]
    station: Option<u8>,
    /// Axis config YAML; built-in defaults when omitted
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Backend {
    Mock,
    Rtu,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List serial ports usable by the RTU backend
    Ports,
    /// List axis configs found in a directory
    Axes {
        #[arg(long, default_value = "configs/axes")]
        dir: String,
    },
    /// Print a status snapshot
    Status {
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
    },
    /// Absolute move in micrometers
    Move {
        #[arg(allow_hyphen_values = true)]
        um: f64,
        /// Poll for completion up to this many milliseconds (0 = return at once)
        #[arg(long, default_value_t = 0u64)]
        wait_ms: u64,
    },
    /// Move relative to the current target
    MoveRel {
        #[arg(allow_hyphen_values = true)]
        um: f64,
        #[arg(long, default_value_t = 0u64)]
        wait_ms: u64,
    },
    /// Jog at a signed speed in um/s; 0 stops
    Jog {
        #[arg(allow_hyphen_values = true)]
        um_s: f64,
    },
    /// Set the running speed used by absolute moves (um/s)
    Speed { um_s: f64 },
    /// Stop motion
    Stop,
    /// Emergency stop
    Estop,
    /// Enable the drive
    Enable,
    /// Disable the drive
    Disable,
    /// Start a homing cycle
    Home {
        /// Search toward the high side
        #[arg(long, action = ArgAction::SetTrue)]
        high: bool,
        #[arg(long, default_value_t = 0u64)]
        wait_ms: u64,
    },
    /// Drive to a limit switch
    Limit {
        /// Upper limit instead of lower
        #[arg(long, action = ArgAction::SetTrue)]
        upper: bool,
    },
    /// Set the current position as zero
    Zero,
    /// Dump every mapped register
    Regs {
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
    },
    /// Offline unit conversion using the configured machine constants
    Convert {
        #[arg(long, allow_hyphen_values = true)]
        um: Option<f64>,
        #[arg(long, allow_hyphen_values = true)]
        pulses: Option<i64>,
        #[arg(long)]
        rpm: Option<f64>,
        #[arg(long)]
        code: Option<u16>,
    },
    /// Read a status snapshot, then print Prometheus metrics
    Metrics,
}

fn main() -> Result<()> {
    setup_tracing();
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match &cli.command {
        Commands::Ports => return list_ports(cli.backend),
        Commands::Axes { dir } => return list_axes(dir),
        Commands::Convert {
            um,
            pulses,
            rpm,
            code,
        } => return convert(&config.machine, *um, *pulses, *rpm, *code),
        _ => {}
    }

    match cli.backend {
        Backend::Mock => {
            let bus = rt::MockBus::new(&cli.port);
            drive(bus, config, cli.command)
        }
        Backend::Rtu => {
            let bus = rt::RtuBus::open_with(&cli.port, config.serial)?;
            info!(port = %cli.port, baud = config.serial.baud_rate, "port opened");
            drive(bus, config, cli.command)
        }
    }
}

fn setup_tracing() {
    // Best-effort; avoid panics if already set
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn load_config(cli: &Cli) -> Result<StageConfig> {
    let mut config = match &cli.config {
        Some(path) => stage_motion::load_config_file(path)?,
        None => StageConfig::default(),
    };
    if let Some(baud) = cli.baud {
        config.serial.baud_rate = baud;
    }
    if let Some(id) = cli.station {
        config.station = rt::StationId::new(id)
            .ok_or_else(|| anyhow::anyhow!("station id must be 1..=247, got {id}"))?;
    }
    Ok(config)
}

fn list_ports(backend: Backend) -> Result<()> {
    match backend {
        Backend::Mock => {
            let bus = rt::MockBus::default();
            println!("{}\tmock", bus.name());
        }
        Backend::Rtu => {
            for port in rt::RtuBus::list()? {
                println!("{}\t{}", port.name, port.driver);
            }
        }
    }
    Ok(())
}

fn list_axes(dir: &str) -> Result<()> {
    let reg = stage_motion::load_configs_dir(dir)?;
    let mut names: Vec<_> = reg.axes.keys().cloned().collect();
    names.sort();
    for name in names {
        if let Some(a) = reg.axes.get(&name) {
            println!(
                "{name}\tstation={}\tpulses_per_um={}",
                a.station,
                a.machine.pulses_per_um()
            );
        }
    }
    Ok(())
}

fn convert(
    m: &MachineConstants,
    um: Option<f64>,
    pulses: Option<i64>,
    rpm: Option<f64>,
    code: Option<u16>,
) -> Result<()> {
    if um.is_none() && pulses.is_none() && rpm.is_none() && code.is_none() {
        return Err(anyhow::anyhow!(
            "provide at least one of --um, --pulses, --rpm, --code"
        ));
    }
    println!(
        "pulses_per_rev={} pulses_per_um={} rpm_per_code={}",
        m.pulses_per_rev(),
        m.pulses_per_um(),
        m.rpm_per_code()
    );
    if let Some(um) = um {
        println!("{um} um = {} pulses", m.um_to_pulses(um)?);
    }
    if let Some(p) = pulses {
        println!("{p} pulses = {} um", m.pulses_to_um(p));
    }
    if let Some(rpm) = rpm {
        println!(
            "{rpm} rpm = code {} ({} um/s)",
            m.rpm_to_code(rpm)?,
            m.rpm_to_um_per_s(rpm)
        );
    }
    if let Some(code) = code {
        let rpm = m.code_to_rpm(code);
        println!("code {code} = {rpm} rpm ({} um/s)", m.rpm_to_um_per_s(rpm));
    }
    Ok(())
}

fn drive<B>(bus: B, config: StageConfig, command: Commands) -> Result<()>
where
    B: RegisterBus + DeviceSession,
{
    let hub = MetricsHub::new().map_err(anyhow::Error::msg)?;
    let mut ctl = MotionController::new(bus, config).with_metrics(hub);
    ctl.connect()?;

    match command {
        Commands::Status { json } => print_status(&mut ctl, json)?,
        Commands::Move { um, wait_ms } => {
            ctl.set_target_position(um)?;
            wait_motion(&mut ctl, wait_ms)?;
        }
        Commands::MoveRel { um, wait_ms } => {
            ctl.set_relative_position(um)?;
            wait_motion(&mut ctl, wait_ms)?;
        }
        Commands::Jog { um_s } => ctl.set_velocity(um_s)?,
        Commands::Speed { um_s } => ctl.set_target_velocity(um_s)?,
        Commands::Stop => ctl.stop_motion()?,
        Commands::Estop => ctl.emergency_stop()?,
        Commands::Enable => ctl.set_enable(true)?,
        Commands::Disable => ctl.set_enable(false)?,
        Commands::Home { high, wait_ms } => {
            ctl.find_reference(high)?;
            wait_homing(&mut ctl, wait_ms)?;
        }
        Commands::Limit { upper } => ctl.move_to_limit(upper)?,
        Commands::Zero => ctl.set_curr_position_to_zero()?,
        Commands::Regs { json } => dump_registers(&mut ctl, json)?,
        Commands::Metrics => {
            let _ = ctl.status()?;
            if let Some(hub) = ctl.metrics() {
                print!("{}", hub.encode_text());
            }
        }
        Commands::Ports | Commands::Axes { .. } | Commands::Convert { .. } => {}
    }
    ctl.ensure_no_fault()?;
    ctl.disconnect();
    Ok(())
}

fn print_status<B: RegisterBus>(ctl: &mut MotionController<B>, json: bool) -> Result<()> {
    let s = ctl.status()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&s)?);
        return Ok(());
    }
    println!("axis:        {}", s.axis);
    println!("position:    {:.3} um (target {:.3})", s.position_um, s.target_um);
    println!(
        "velocity:    {:.3} um/s (set {:.3})",
        s.velocity_um_s, s.target_velocity_um_s
    );
    println!("fault:       {}", s.fault.code());
    println!(
        "done:        motion={} homing={}",
        s.motion_complete, s.homing_complete
    );
    println!("current:     {:.2} A", s.current_a);
    println!("cpu temp:    {} C", s.cpu_temp_c);
    Ok(())
}

fn wait_motion<B: RegisterBus>(ctl: &mut MotionController<B>, wait_ms: u64) -> Result<()> {
    poll_until(wait_ms, "motion", || Ok(ctl.is_motion_complete()?))
}

fn wait_homing<B: RegisterBus>(ctl: &mut MotionController<B>, wait_ms: u64) -> Result<()> {
    poll_until(wait_ms, "homing", || Ok(ctl.is_homing_complete()?))
}

fn poll_until(wait_ms: u64, what: &str, mut done: impl FnMut() -> Result<bool>) -> Result<()> {
    if wait_ms == 0 {
        return Ok(());
    }
    let deadline = Instant::now() + Duration::from_millis(wait_ms);
    while Instant::now() < deadline {
        if done()? {
            println!("{what}: complete");
            return Ok(());
        }
        thread::sleep(Duration::from_millis(20));
    }
    warn!(what, wait_ms, "not complete before deadline");
    println!("{what}: still running after {wait_ms} ms");
    Ok(())
}

#[derive(Serialize)]
struct RegisterValue {
    name: &'static str,
    address: u16,
    width: &'static str,
    value: i64,
}

fn dump_registers<B: RegisterBus>(ctl: &mut MotionController<B>, json: bool) -> Result<()> {
    let station = ctl.config().station;
    let timeout = ctl.config().timeout;
    let mut out = Vec::with_capacity(registers::ALL.len());
    for reg in registers::ALL {
        let bus = ctl.transport_mut();
        let value = match (reg.width, reg.signed) {
            (RegWidth::Word, false) => i64::from(bus.read_word(station, reg.address, timeout)?),
            (RegWidth::Word, true) => {
                i64::from(bus.read_word(station, reg.address, timeout)? as i16)
            }
            (RegWidth::DWord, false) => i64::from(bus.read_dword(station, reg.address, timeout)?),
            (RegWidth::DWord, true) => {
                i64::from(bus.read_dword(station, reg.address, timeout)? as i32)
            }
            (RegWidth::QWord, _) => bus.read_qword(station, reg.address, timeout)? as i64,
        };
        out.push(RegisterValue {
            name: reg.name,
            address: reg.address,
            width: reg.width.as_str(),
            value,
        });
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        for r in out {
            println!("{:#06x}\t{:<5}\t{:<22}\t{}", r.address, r.width, r.name, r.value);
        }
    }
    Ok(())
}
