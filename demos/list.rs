use clap::Parser;
use rivi::usbtmc::Context;
use tracing::{info, Level};

/// List the USBTMC instruments attached to this machine
#[derive(Parser, Debug)]
struct Args {
    /// libusb debug level, 0 (none) to 4 (debug)
    #[arg(long, default_value_t = 0)]
    debug_level: u8,

    /// Log library debug messages
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .init();

    let mut ctx = Context::new()?;
    ctx.set_debug_level(args.debug_level);

    let instruments = ctx.instruments()?;
    if instruments.is_empty() {
        info!("no usbtmc instruments found");
    }

    for instr in instruments {
        info!(
            "{} {} {}",
            instr.resource,
            instr.manufacturer.as_deref().unwrap_or("?"),
            instr.product.as_deref().unwrap_or("?")
        );
    }

    ctx.close();
    Ok(())
}
