use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use bmflash_core::image::FirmwareImage;
use bmflash_core::session::{ProbeSession, ProbeTarget, SessionConfig};
use bmflash_core::TracingObserver;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Flash and inspect targets through a GDB RSP debug probe", long_about = None)]
struct Args {
    /// Serial port of a local probe (e.g. /dev/ttyACM0, COM3)
    #[arg(long, global = true, conflicts_with = "ip")]
    port: Option<String>,

    /// IP address of a networked probe, optionally with :port
    #[arg(long, global = true)]
    ip: Option<String>,

    /// Session configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show probe version, part id, monitor commands and flash layout
    Info,
    /// Program a raw binary into flash
    Flash {
        /// Binary image
        file: PathBuf,
        /// Load address
        #[arg(long, value_parser = parse_address)]
        address: u32,
        /// Verify after programming
        #[arg(long)]
        verify: bool,
        /// Power the target from the probe if it reads unpowered
        #[arg(long)]
        power: bool,
    },
    /// Compare a raw binary with flash contents
    Verify {
        file: PathBuf,
        #[arg(long, value_parser = parse_address)]
        address: u32,
    },
    /// Erase every flash region
    Erase {
        /// Erase at most this many bytes per region
        #[arg(long, value_parser = parse_address)]
        size: Option<u32>,
    },
    /// Check that flash is erased
    BlankCheck,
    /// Save the used part of flash to a file
    Dump { out: PathBuf },
    /// Run a probe monitor command
    Monitor {
        #[arg(required = true, trailing_var_arg = true)]
        words: Vec<String>,
    },
}

fn parse_address(text: &str) -> Result<u32, String> {
    let text = text.trim();
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{}': {}", text, e))
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {}", e);
    }

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => SessionConfig::default(),
    };

    let target = match (&args.port, &args.ip) {
        (Some(port), None) => ProbeTarget::Serial(port.clone()),
        (None, Some(ip)) => match ProbeTarget::parse(ip, config.network_port)? {
            target @ ProbeTarget::Network(_) => target,
            ProbeTarget::Serial(_) => bail!("--ip expects an IP address, got '{}'", ip),
        },
        _ => bail!("specify the probe with --port or --ip"),
    };

    let mut session = ProbeSession::new(config);
    session
        .connect(&target)
        .with_context(|| format!("connecting to {}", target))?;

    let result = execute(&mut session, args.command);
    if session.state().is_attached() {
        if let Err(e) = session.detach(false) {
            warn!("Detach failed: {}", e);
        }
    }
    session.disconnect();
    result
}

fn execute(session: &mut ProbeSession<TracingObserver>, command: Command) -> Result<()> {
    match command {
        Command::Info => {
            println!("Probe:    {}", session.check_version_string());
            match session.list_monitor_commands() {
                Ok(list) => println!("Commands: {}", list),
                Err(e) => warn!("Cannot list monitor commands: {}", e),
            }
            session.attach(false)?;
            let info = session.target_info().clone();
            println!(
                "Target:   {} {}",
                info.family.as_deref().unwrap_or("unknown"),
                info.architecture.as_deref().unwrap_or("")
            );
            if let Some(voltage) = info.voltage {
                println!("Voltage:  {:.2} V", voltage);
            }
            if let Some(id) = session.part_id() {
                println!("Part ID:  0x{:08x}", id);
            }
            for region in session.flash_map().iter() {
                println!(
                    "Flash:    0x{:08x}..0x{:08x} (block 0x{:x})",
                    region.address,
                    region.end(),
                    region.block_size
                );
            }
        }
        Command::Flash {
            file,
            address,
            verify,
            power,
        } => {
            let image = FirmwareImage::load_binary(&file, address)
                .with_context(|| format!("loading {}", file.display()))?;
            session.attach(power)?;
            session.download(&image)?;
            info!(bytes = image.size(), "Flash programmed");
            if verify && !session.verify(&image)? {
                bail!("verification failed");
            }
        }
        Command::Verify { file, address } => {
            let image = FirmwareImage::load_binary(&file, address)
                .with_context(|| format!("loading {}", file.display()))?;
            session.attach(false)?;
            if !session.verify(&image)? {
                bail!("flash does not match {}", file.display());
            }
            info!("Flash matches image");
        }
        Command::Erase { size } => {
            session.attach(false)?;
            session.full_erase(size.unwrap_or(u32::MAX))?;
            info!("Flash erased");
        }
        Command::BlankCheck => {
            session.attach(false)?;
            if !session.blank_check()? {
                bail!("flash is not blank");
            }
            info!("Flash is blank");
        }
        Command::Dump { out } => {
            session.attach(false)?;
            let written = session.dump(&out)?;
            info!(bytes = written, path = %out.display(), "Flash dumped");
        }
        Command::Monitor { words } => {
            let name = session
                .expand_command(&words[0])?
                .unwrap_or_else(|| words[0].clone());
            let line = std::iter::once(name)
                .chain(words[1..].iter().cloned())
                .collect::<Vec<_>>()
                .join(" ");
            for output in session.monitor_output(&line)? {
                println!("{}", output);
            }
        }
    }
    Ok(())
}
