//! Mock embedded controller
//!
//! Stands in for the access-control backend for local runs of the node.
//!
//! Protocol:
//! - Invoked as `mock_controller --park <PLATE>`
//! - Prints one diagnostic line, then the verdict line on stdout
//! - `approve` -> `APPROVED <PLATE>`, `deny` -> `DENIED <reason>`
//! - `garbage` -> an unparseable verdict, `fail` -> exit code 1
//!
//! Usage:
//!   cargo run --bin mock_controller -- --park KL-13-AB-9999 --mode deny
//!
//! Point the node at it with `[controller] binary = "target/debug/mock_controller"`.
//! Mode and delay can also come from MOCK_CONTROLLER_MODE / MOCK_CONTROLLER_DELAY_MS,
//! since the node only passes the park flag and the plate.

use clap::{Parser, ValueEnum};
use std::process::ExitCode;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    Approve,
    Deny,
    Garbage,
    Fail,
}

#[derive(Parser, Debug)]
#[command(name = "mock_controller")]
#[command(about = "Mock embedded access controller for local simulation")]
struct Args {
    /// Plate to authorize
    #[arg(long)]
    park: String,

    /// Verdict to produce
    #[arg(long, value_enum, env = "MOCK_CONTROLLER_MODE", default_value = "approve")]
    mode: Mode,

    /// Delay before answering (ms), to exercise the watchdog
    #[arg(long, env = "MOCK_CONTROLLER_DELAY_MS", default_value = "50")]
    delay_ms: u64,

    /// Reason printed with a denial
    #[arg(long, default_value = "no active permit")]
    reason: String,
}

fn main() -> ExitCode {
    let args = Args::parse();

    println!("[C-Backend] Received Request from AI Node.");
    println!("[C-Backend] Looking up plate {}", args.park);

    if args.delay_ms > 0 {
        std::thread::sleep(Duration::from_millis(args.delay_ms));
    }

    match args.mode {
        Mode::Approve => println!("APPROVED {}", args.park),
        Mode::Deny => println!("DENIED {}", args.reason),
        Mode::Garbage => println!("???"),
        Mode::Fail => {
            eprintln!("[C-Backend] database unavailable");
            return ExitCode::FAILURE;
        }
    }

    ExitCode::SUCCESS
}
