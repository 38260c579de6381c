use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Parser;
use rivi::ivi::fgen::sequence;
use rivi::usbtmc::Context;
use rivi::Agilent33220;
use tracing::{error, warn, Level};

/// Configure an Agilent 33220A function generator over USBTMC and read back
/// its settings
#[derive(Parser, Debug)]
struct Args {
    /// VISA resource string of the instrument
    #[arg(long, default_value = "USB0::2391::1031::MY44035849::INSTR")]
    resource: String,

    /// libusb debug level, 0 (none) to 4 (debug)
    #[arg(long, default_value_t = 1)]
    debug_level: u8,

    /// USB transfer timeout in milliseconds
    #[arg(long, default_value_t = 2000)]
    timeout_ms: u64,

    /// Log SCPI traffic and USB setup steps
    #[arg(short, long)]
    verbose: bool,
}

fn drive(ctx: &Context, args: &Args) -> Result<()> {
    let mut dev = ctx
        .new_device(&args.resource)
        .context("NewDevice error")?;
    dev.set_timeout(Duration::from_millis(args.timeout_ms));

    let mut fgen = Agilent33220::new(&mut dev).context("IVI instrument error")?;

    // channels are selected with a 0-based index
    let mut ch = fgen.channel(0)?;
    let failed = sequence::configure(&mut ch);
    if failed > 0 {
        warn!("{} configuration step(s) failed", failed);
    }
    sequence::report(&mut ch);

    dev.close().context("closing device")?;
    Ok(())
}

fn run(args: &Args) -> Result<()> {
    let mut ctx = Context::new().context("Error creating new USB context")?;
    ctx.set_debug_level(args.debug_level);

    // the device is released inside drive on every path
    let result = drive(&ctx, args);
    ctx.close();
    result
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .init();

    if let Err(e) = run(&args) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
