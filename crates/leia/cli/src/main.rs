//! Command-line interface for the LEIA smartcard reader

use std::error::Error;

use clap::{Parser, Subcommand};
use smartleia_core::{Protocol, TriggerPoint};
use smartleia_relay::{DEFAULT_HOST, DEFAULT_PORT};
use smartleia_transport_serial::SerialDeviceManager;

mod commands;

#[derive(Parser)]
#[command(version, about = "LEIA smartcard reader CLI")]
struct Cli {
    /// Serial device of the board (discovered by USB id if not specified)
    #[arg(short, long)]
    device: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List connected LEIA boards
    List,

    /// Reset the board
    Reset,

    /// Configure the smartcard interface
    Configure {
        /// Protocol: auto, t0 or t1
        #[arg(short, long, default_value = "auto")]
        protocol: Protocol,

        /// Elementary time unit, firmware default if not specified
        #[arg(long)]
        etu: Option<u32>,

        /// Clock frequency in Hz, firmware default if not specified
        #[arg(long)]
        freq: Option<u32>,

        /// Skip PTS negotiation
        #[arg(long)]
        no_pts: bool,

        /// Skip baudrate negotiation
        #[arg(long)]
        no_baudrate: bool,
    },

    /// Configure the smartcard interface for T=0
    T0,

    /// Configure the smartcard interface for T=1
    T1,

    /// Print the ATR of the inserted card
    Atr,

    /// Tell whether a card is inserted
    Inserted,

    /// Print the timers of the last exchange
    Timers,

    /// Send a raw APDU to the card
    Apdu {
        /// APDU as hex, spaces allowed
        apdu: String,
    },

    /// Print a trigger strategy
    GetTrigger {
        /// Strategy bank
        sid: u8,
    },

    /// Store a trigger strategy
    SetTrigger {
        /// Strategy bank
        sid: u8,

        /// Trigger points, by name (GET_ATR_PRE, POST_RESP, ...) or raw value
        #[arg(required = true, value_parser = parse_trigger_point)]
        points: Vec<TriggerPoint>,

        /// Delay applied before triggering
        #[arg(long, default_value_t = 0)]
        delay: u32,

        /// Disable the strategy after its first trigger
        #[arg(long)]
        single: bool,
    },

    /// Reboot the board into its DFU bootloader
    Dfu,

    /// Relay the card to a vpcd virtual reader until stdin is closed
    Relay {
        /// Host of the vpcd service
        #[arg(long, default_value = DEFAULT_HOST)]
        host: String,

        /// Port of the vpcd service
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
}

fn parse_trigger_point(value: &str) -> Result<TriggerPoint, String> {
    if let Some(point) = TriggerPoint::from_name(value) {
        return Ok(point);
    }
    let bits = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    };
    bits.map(TriggerPoint::from_bits)
        .map_err(|_| format!("unknown trigger point '{value}'"))
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let manager = SerialDeviceManager::new();

    if let Commands::List = cli.command {
        return commands::list_command(&manager);
    }

    let leia = manager.open(cli.device.as_deref())?;

    match cli.command {
        Commands::List => unreachable!(), // Already handled above
        Commands::Reset => commands::reset_command(&leia)?,
        Commands::Configure {
            protocol,
            etu,
            freq,
            no_pts,
            no_baudrate,
        } => commands::configure_command(&leia, protocol, etu, freq, !no_pts, !no_baudrate)?,
        Commands::T0 => commands::configure_command(&leia, Protocol::T0, None, None, true, true)?,
        Commands::T1 => commands::configure_command(&leia, Protocol::T1, None, None, true, true)?,
        Commands::Atr => commands::atr_command(&leia)?,
        Commands::Inserted => commands::inserted_command(&leia)?,
        Commands::Timers => commands::timers_command(&leia)?,
        Commands::Apdu { apdu } => commands::apdu_command(&leia, &apdu)?,
        Commands::GetTrigger { sid } => commands::get_trigger_command(&leia, sid)?,
        Commands::SetTrigger {
            sid,
            points,
            delay,
            single,
        } => commands::set_trigger_command(&leia, sid, &points, delay, single)?,
        Commands::Dfu => commands::dfu_command(&leia)?,
        Commands::Relay { host, port } => commands::relay_command(leia, host, port)?,
    }

    Ok(())
}

fn setup_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_ansi(true)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_trigger_point() {
        assert_eq!(
            parse_trigger_point("GET_ATR_PRE").unwrap(),
            TriggerPoint::GET_ATR_PRE
        );
        assert_eq!(
            parse_trigger_point("0x40").unwrap(),
            TriggerPoint::POST_RESP_T0
        );
        assert_eq!(parse_trigger_point("256").unwrap(), TriggerPoint::IRQ_PUTC);
        assert!(parse_trigger_point("SOMEWHERE").is_err());
    }

    #[test]
    fn test_set_trigger_arguments() {
        let cli = Cli::try_parse_from([
            "leia",
            "-d",
            "/dev/ttyACM0",
            "set-trigger",
            "1",
            "get_atr_pre",
            "POST_RESP",
            "--delay",
            "10",
            "--single",
        ])
        .unwrap();
        assert_eq!(cli.device.as_deref(), Some("/dev/ttyACM0"));
        match cli.command {
            Commands::SetTrigger {
                sid,
                points,
                delay,
                single,
            } => {
                assert_eq!(sid, 1);
                assert_eq!(points, [TriggerPoint::GET_ATR_PRE, TriggerPoint::POST_RESP]);
                assert_eq!(delay, 10);
                assert!(single);
            }
            _ => panic!("wrong subcommand"),
        }
    }

    #[test]
    fn test_configure_arguments() {
        let cli = Cli::try_parse_from(["leia", "configure", "-p", "t1", "--etu", "372", "--no-pts"])
            .unwrap();
        match cli.command {
            Commands::Configure {
                protocol,
                etu,
                freq,
                no_pts,
                no_baudrate,
            } => {
                assert_eq!(protocol, Protocol::T1);
                assert_eq!(etu, Some(372));
                assert_eq!(freq, None);
                assert!(no_pts);
                assert!(!no_baudrate);
            }
            _ => panic!("wrong subcommand"),
        }
    }

    #[test]
    fn test_relay_defaults() {
        let cli = Cli::try_parse_from(["leia", "relay"]).unwrap();
        match cli.command {
            Commands::Relay { host, port } => {
                assert_eq!(host, DEFAULT_HOST);
                assert_eq!(port, DEFAULT_PORT);
            }
            _ => panic!("wrong subcommand"),
        }
    }
}
