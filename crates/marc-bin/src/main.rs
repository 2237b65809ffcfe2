//! MarcSLM control runtime entrypoint.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use core_clock::MonotonicClock;
use core_device::{CardPort, DeviceHandle, SimCard};
use core_geometry::encode;
use core_link::{MachineLink, PlcClient, SimPlc};
use core_slice::open_slice;
use core_styles::StyleTable;
use core_supervisor::{JobEvent, Supervisor, SupervisorDeps, SupervisorHandle};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use std::time::Duration;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "marcslm", version, about = "SLM machine control runtime")]
struct Args {
    /// Machine configuration file (defaults to `marcslm.toml` discovery).
    #[arg(long = "config")]
    config: Option<PathBuf>,
    /// Run against the in-process simulated card and PLC.
    #[arg(long)]
    simulate: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build the job described by a slice file and a style table.
    Run {
        /// Path to the `.marc` slice file.
        marc: PathBuf,
        /// Path to the build style table (JSON).
        styles: PathBuf,
    },
    /// Run the synthetic laser-off test pattern.
    Test {
        /// Layer thickness in millimetres.
        #[arg(long, default_value_t = 0.2)]
        thickness: f32,
        /// Number of layers to run.
        #[arg(long, default_value_t = 3)]
        layers: u32,
    },
    /// Parse and encode a slice offline, reporting per-layer command counts.
    Encode {
        marc: PathBuf,
        styles: PathBuf,
    },
}

fn main() -> Result<()> {
    let _log_guard = configure_logging();
    install_panic_hook();
    let args = Args::parse();
    info!(target: "runtime", simulate = args.simulate, "startup");

    let config = core_config::load_from(args.config.clone())?;
    match args.command {
        Command::Run { marc, styles } => {
            run_job(config, args.simulate, |handle| handle.start(marc, styles))
        }
        Command::Test { thickness, layers } => run_job(config, args.simulate, |handle| {
            handle.start_test(thickness, layers)
        }),
        Command::Encode { marc, styles } => encode_report(&config, &marc, &styles),
    }
}

fn configure_logging() -> Option<WorkerGuard> {
    let file_appender = tracing_appender::rolling::never(".", "marcslm.log");
    let (nb_writer, guard) = tracing_appender::non_blocking(file_appender);
    match tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(nb_writer)
        .with_ansi(false)
        .try_init()
    {
        Ok(_) => Some(guard),
        // Global subscriber already installed; drop the guard so the writer
        // shuts down.
        Err(_) => None,
    }
}

fn install_panic_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let default_panic = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            error!(target: "runtime.panic", ?info, "panic");
            default_panic(info);
        }));
    });
}

/// Pick the card and PLC client: simulated pair, or the vendor stack when
/// compiled in.
fn build_ports(simulate: bool) -> Result<(Arc<dyn CardPort>, Box<dyn PlcClient>)> {
    if simulate {
        let clock: Arc<dyn core_clock::Clock> = Arc::new(MonotonicClock);
        let card = SimCard::new(clock.clone());
        let plc = SimPlc::new(clock);
        plc.set_ready_delay(Duration::from_millis(100));
        return Ok((card, Box::new(plc)));
    }
    #[cfg(feature = "vendor-dsp")]
    return Ok((
        Arc::new(core_device::VendorCard::new()),
        vendor_plc_client()?,
    ));
    #[cfg(not(feature = "vendor-dsp"))]
    bail!("built without the vendor-dsp feature; use --simulate")
}

#[cfg(feature = "vendor-dsp")]
fn vendor_plc_client() -> Result<Box<dyn PlcClient>> {
    // The concrete automation client is deployment-specific; wire it here.
    bail!("no machine-controller client configured for this build")
}

fn run_job(
    config: core_config::Config,
    simulate: bool,
    start: impl FnOnce(&SupervisorHandle),
) -> Result<()> {
    let (card, plc) = build_ports(simulate)?;
    let device = DeviceHandle::new(card);
    let (link, link_events) = MachineLink::new(plc);
    let handle = Supervisor::spawn(SupervisorDeps {
        device,
        link,
        link_events,
        clock: Arc::new(MonotonicClock),
        config,
    });

    start(&handle);
    let result = drive(&handle);
    handle.shutdown();
    result
}

/// Print the event stream until the job reaches a terminal event.
fn drive(handle: &SupervisorHandle) -> Result<()> {
    loop {
        let event = handle
            .events()
            .recv()
            .context("supervisor exited without a terminal event")?;
        match event {
            JobEvent::Status(text) => println!("status: {text}"),
            JobEvent::Progress { current, total } if total > 0 => {
                println!("progress: {current}/{total}");
            }
            JobEvent::Progress { .. } => {}
            JobEvent::LayerCompleted { index } => println!("layer {index} complete"),
            JobEvent::ConnectionLost => println!("machine link lost"),
            JobEvent::Finished => {
                println!("finished");
                return Ok(());
            }
            JobEvent::Stopped => {
                println!("stopped");
                return Ok(());
            }
            JobEvent::EmergencyStopped => {
                println!("emergency stopped");
                return Ok(());
            }
            JobEvent::Failed { kind, detail } => {
                bail!("job failed ({kind}): {detail}");
            }
        }
    }
}

/// Offline encode: no hardware, no PLC — parse, encode, count.
fn encode_report(config: &core_config::Config, marc: &Path, styles: &Path) -> Result<()> {
    let styles = StyleTable::load_from(styles)?;
    let (header, reader) = open_slice(marc)?;
    let calibration = config.calibration();
    println!(
        "slice version {} with {} layer(s) declared",
        header.version, header.layer_count
    );
    let mut total_commands = 0usize;
    let mut total_clamped = 0u32;
    for layer in reader {
        let layer = layer?;
        let block = encode(&layer, &styles, &calibration)?;
        println!(
            "layer {:>5}  height {:>7.3} mm  {:>7} command(s)  {} clamped",
            layer.index,
            layer.height,
            block.commands.len(),
            block.clamp_warnings
        );
        total_commands += block.commands.len();
        total_clamped += block.clamp_warnings;
    }
    println!("total: {total_commands} command(s), {total_clamped} clamped coordinate(s)");
    Ok(())
}
