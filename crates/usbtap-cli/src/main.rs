use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use usbtap::config::ProxyConfig;
use usbtap::gadget::GadgetSpeed;
use usbtap::inject::{RuleFileSpec, RuleSet};
use usbtap::ProxyOptions;

/// Transparent USB man-in-the-middle proxy.
///
/// Emulates the peripheral towards the host through /dev/raw-gadget while
/// forwarding all traffic to the real device, optionally rewriting it
/// according to a JSON rule file.
#[derive(Debug, Parser)]
#[command(name = "usbtap", version)]
struct Args {
    /// Vendor id of the peripheral (decimal, or hex with 0x prefix).
    #[arg(long, value_parser = parse_u16)]
    vendor_id: u16,

    /// Product id of the peripheral (decimal, or hex with 0x prefix).
    #[arg(long, value_parser = parse_u16)]
    product_id: u16,

    /// UDC driver name.
    #[arg(long, default_value = "dummy_udc")]
    driver: String,

    /// UDC device name.
    #[arg(long, default_value = "dummy_udc.0")]
    device: String,

    /// Advertise full speed instead of high speed to the host.
    #[arg(long)]
    full_speed: bool,

    /// Injection rule file (JSON with control/bulk/int sections).
    #[arg(long)]
    rules: Option<PathBuf>,

    /// Floor for the mirrored bMaxPacketSize0.
    #[arg(long, default_value_t = 64)]
    mps0_floor: u8,

    /// Seconds to keep scanning for the peripheral before giving up.
    #[arg(long, default_value_t = 5)]
    open_timeout: u64,

    /// Increase log verbosity (-v: debug, -vv: trace). RUST_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_u16(s: &str) -> std::result::Result<u16, String> {
    let t = s.trim();
    let parsed = if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16)
    } else {
        t.parse::<u16>()
    };
    parsed.map_err(|_| format!("{s:?} is not a decimal or 0x-prefixed integer"))
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "usbtap=debug,info",
        _ => "usbtap=trace,debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_rules(path: Option<&PathBuf>) -> Result<RuleSet> {
    let Some(path) = path else {
        return Ok(RuleSet::empty());
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read rule file {}", path.display()))?;
    let spec = RuleFileSpec::from_json(&json)
        .with_context(|| format!("failed to parse rule file {}", path.display()))?;
    let rules = RuleSet::compile(spec)
        .with_context(|| format!("failed to compile rule file {}", path.display()))?;
    if rules.is_empty() {
        tracing::warn!(path = %path.display(), "rule file contains no enabled rules");
    }
    Ok(rules)
}

fn main() {
    let args = Args::parse();
    init_tracing(args.verbose);

    let options = match build_options(&args) {
        Ok(options) => options,
        Err(err) => {
            eprintln!("usbtap: {err:#}");
            std::process::exit(2);
        }
    };

    if let Err(err) = usbtap::run(options) {
        eprintln!("usbtap: {err}");
        std::process::exit(1);
    }
}

fn build_options(args: &Args) -> Result<ProxyOptions> {
    let rules = load_rules(args.rules.as_ref())?;
    let config = ProxyConfig {
        mps0_floor: args.mps0_floor,
        open_deadline: std::time::Duration::from_secs(args.open_timeout),
        ..ProxyConfig::default()
    };
    Ok(ProxyOptions {
        vendor_id: args.vendor_id,
        product_id: args.product_id,
        driver: args.driver.clone(),
        device: args.device.clone(),
        speed: if args.full_speed {
            GadgetSpeed::Full
        } else {
            GadgetSpeed::High
        },
        rules,
        config,
    })
}
