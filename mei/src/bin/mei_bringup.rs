// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;
use mei::lifecycle::{self, PlatformFacts};
use mei::msg::{LinkFacts, MemoryFacts, Request, MAX_PORTS};
use mei::platform::ResetType;
use mei::policy::Policy;
use mei::sim::SimPlatform;
use mei::{BootMode, Function, Mei, Session};
use std::io::Write;
use std::path::PathBuf;

#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
enum BootModeArg {
    Normal,
    Resume,
    Recovery,
}

impl From<BootModeArg> for BootMode {
    fn from(m: BootModeArg) -> BootMode {
        match m {
            BootModeArg::Normal => BootMode::Normal,
            BootModeArg::Resume => BootMode::Resume,
            BootModeArg::Recovery => BootMode::Recovery,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
enum ResetArg {
    Warm,
    Cold,
    Global,
}

impl From<ResetArg> for ResetType {
    fn from(r: ResetArg) -> ResetType {
        match r {
            ResetArg::Warm => ResetType::Warm,
            ResetArg::Cold => ResetType::Cold,
            ResetArg::Global => ResetType::Global,
        }
    }
}

/// Misbehaviour to switch on in the simulated controller
#[derive(Debug, Parser)]
struct FaultArgs {
    /// Swallow this many responses
    #[clap(long, default_value_t = 0)]
    drop_responses: u32,
    /// Echo this command id in every response
    #[clap(long, value_parser = parse_int::parse::<u8>)]
    echo_command: Option<u8>,
    /// Never come back ready after an interface reset
    #[clap(long)]
    reset_refused: bool,
    /// Leave the drain indicator set
    #[clap(long)]
    drain_stuck: bool,
    #[clap(long)]
    refuse_global_reset: bool,
    /// Firmware status register value
    #[clap(long, value_parser = parse_int::parse::<u32>)]
    hfs: Option<u32>,
}

/// Facts from memory and link training
#[derive(Debug, Parser)]
struct FactArgs {
    #[clap(long, default_value_t = 0x18, value_parser = parse_int::parse::<u8>)]
    ratio: u8,
    #[clap(long, default_value_t = 133, value_parser = parse_int::parse::<u8>)]
    reference_clock: u8,
    #[clap(long, default_value_t = 2)]
    channels: u8,
    /// Trained port as PORT:WIDTH:SPEED; may be repeated
    #[clap(long = "port", value_parser = parse_port)]
    ports: Vec<LinkFacts>,
}

impl FactArgs {
    fn facts(&self) -> Result<PlatformFacts> {
        let mut facts = PlatformFacts {
            memory: MemoryFacts {
                ratio: self.ratio,
                reference_clock: self.reference_clock,
                channels: self.channels,
            },
            ..Default::default()
        };
        for link in &self.ports {
            let Some(slot) = facts.ports.get_mut(usize::from(link.port)) else {
                bail!("port {} out of range (max {})", link.port, MAX_PORTS - 1);
            };
            *slot = Some(*link);
        }
        Ok(facts)
    }
}

fn parse_port(s: &str) -> Result<LinkFacts, String> {
    let fields: Vec<&str> = s.split(':').collect();
    let &[port, width, speed] = fields.as_slice() else {
        return Err(format!("expected PORT:WIDTH:SPEED, got {s:?}"));
    };
    let field = |v: &str| parse_int::parse::<u8>(v).map_err(|e| format!("{v:?}: {e}"));
    Ok(LinkFacts {
        port: field(port)?,
        width: field(width)?,
        speed: field(speed)?,
    })
}

#[derive(Debug, Parser)]
enum Command {
    /// Run the end-of-boot sequence
    Boot {
        #[clap(flatten)]
        facts: FactArgs,
    },
    /// Send end-of-post only
    EndOfPost,
    /// Push memory and link telemetry
    Telemetry {
        #[clap(flatten)]
        facts: FactArgs,
    },
    /// Reset the platform, through the controller if it will
    GlobalReset {
        #[clap(long, value_enum, default_value = "global")]
        kind: ResetArg,
    },
    /// Read the interface registers through the window guard
    GuardedRead {
        /// Move the window here after capture, as untrusted code might
        #[clap(long, value_parser = parse_int::parse::<u64>)]
        tamper: Option<u64>,
        /// Make the moved window ignore rewrites
        #[clap(long, requires = "tamper")]
        locked: bool,
    },
    /// Show firmware and ring status
    Status,
}

#[derive(Debug, Parser)]
#[clap(name = "mei_bringup", max_term_width = 80)]
struct Args {
    /// Policy file (TOML)
    #[clap(long)]
    policy: Option<PathBuf>,

    #[clap(long, value_enum, default_value = "normal")]
    boot_mode: BootModeArg,

    #[clap(flatten)]
    faults: FaultArgs,

    #[clap(short, long)]
    verbose: bool,

    #[clap(subcommand)]
    cmd: Command,
}

fn init_logger(verbose: bool) {
    let mut builder = env_logger::Builder::from_default_env();
    builder
        .format(|buf, record| {
            let mut level_style = buf.style();
            level_style.set_color(match record.level() {
                log::Level::Error => env_logger::fmt::Color::Red,
                log::Level::Warn => env_logger::fmt::Color::Yellow,
                log::Level::Info => env_logger::fmt::Color::Cyan,
                log::Level::Debug => env_logger::fmt::Color::Green,
                log::Level::Trace => env_logger::fmt::Color::Blue,
            });
            writeln!(
                buf,
                "{: <5} | {}",
                level_style.value(record.level()),
                record.args().to_string().replace('\n', "\n      | ")
            )
        })
        .filter(
            None,
            if verbose {
                log::LevelFilter::Trace
            } else {
                log::LevelFilter::Info
            },
        )
        .init();
}

fn simulated(faults: &FaultArgs) -> SimPlatform {
    let mut sim = SimPlatform::new();
    sim.faults.drop_responses = faults.drop_responses;
    sim.faults.echo_command = faults.echo_command;
    sim.faults.reset_refused = faults.reset_refused;
    sim.faults.drain_stuck = faults.drain_stuck;
    sim.faults.refuse_global_reset = faults.refuse_global_reset;
    if let (Some(hfs), Some(f)) = (faults.hfs, sim.function_mut(Function::Heci1)) {
        f.hfs = hfs;
    }
    sim
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(args.verbose);

    let policy = match &args.policy {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("could not read {}", path.display()))?;
            Policy::from_toml(&text).with_context(|| format!("bad policy {}", path.display()))?
        }
        None => Policy::default(),
    };

    let mei = Mei::new(simulated(&args.faults), policy, args.boot_mode.into());
    let mut guard = mei.lock();
    let s: &mut Session<SimPlatform> = &mut guard;

    match args.cmd {
        Command::Boot { facts } => {
            let report = lifecycle::run_boot_phase(s, &facts.facts()?);
            println!("host capabilities: {}", report.host_capabilities);
            println!("bus owner:         {}", report.bus_owner);
            println!("telemetry:         {}", report.telemetry);
            println!("end-of-post:       {}", report.end_of_post);
            if let Some(path) = report.reset {
                println!(
                    "global reset:      controller {}",
                    if path.controller_accepted {
                        "accepted"
                    } else {
                        "refused"
                    }
                );
            }
        }
        Command::EndOfPost => {
            let outcome = lifecycle::end_of_post(s).context("end-of-post failed")?;
            println!("{outcome:?}");
        }
        Command::Telemetry { facts } => {
            let facts = facts.facts()?;
            let record = Request::PlatformTelemetry(facts.telemetry()).encode()?;
            info!("record: {}", hex::encode(&record));
            let done = lifecycle::push_telemetry(s, &facts).context("telemetry failed")?;
            println!("{done:?} ({} bytes)", record.len());
        }
        Command::GlobalReset { kind } => {
            let path = lifecycle::global_reset(s, kind.into());
            println!("{path:?}");
        }
        Command::GuardedRead { tamper, locked } => {
            s.capture_bar(Function::Heci1)
                .context("could not capture window base")?;
            if let Some(base) = tamper {
                s.platform_mut().relocate_bar(Function::Heci1, base, locked);
            }
            let (host, me) = s
                .guarded(|s| s.interface_status(Function::Heci1))
                .context("guarded access refused")?;
            println!("H_CSR     {:08x}", u32::from(host));
            println!("ME_CSR_HA {:08x}", u32::from(me));
        }
        Command::Status => {
            let hfs = s.firmware_status(Function::Heci1)?;
            println!(
                "HFS       {:08x} ({}, {})",
                u32::from(hfs),
                hfs.working_state()
                    .map_or_else(|| "unknown state".to_string(), |w| w.to_string()),
                hfs.operation_mode()
                    .map_or_else(|| "unknown mode".to_string(), |m| m.to_string()),
            );
            let (host, me) = s.interface_status(Function::Heci1)?;
            println!("H_CSR     {:08x}", u32::from(host));
            println!("ME_CSR_HA {:08x}", u32::from(me));
        }
    }

    for n in s.take_notifications() {
        info!("notification: {n:?}");
    }
    Ok(())
}
