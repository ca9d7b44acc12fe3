//! Subcommand implementations

use std::error::Error;
use std::io::{self, Read};
use std::thread;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use smartleia_core::{
    Apdu, Leia, Protocol, SmartcardConfig, Transport, TriggerPoint, TriggerStrategy,
};
use smartleia_relay::{Relay, RelayConfig};
use smartleia_transport_serial::{SerialDeviceManager, SerialTransport};
use tracing::{debug, info, warn};

type Board = Leia<SerialTransport>;

/// Interval at which the relay command checks its worker
const WATCH_INTERVAL: Duration = Duration::from_millis(200);

/// List LEIA boards
pub(crate) fn list_command(manager: &SerialDeviceManager) -> Result<(), Box<dyn Error>> {
    let devices = manager.list_devices()?;

    if devices.is_empty() {
        println!("No LEIA board found!");
        return Ok(());
    }

    println!("Available boards:");
    for (i, device) in devices.iter().enumerate() {
        println!(
            "{}. {} (serial {})",
            i + 1,
            device.path(),
            device.serial_number().unwrap_or("unknown")
        );
    }

    Ok(())
}

pub(crate) fn reset_command(leia: &Board) -> Result<(), Box<dyn Error>> {
    leia.reset()?;
    println!("Board reset");
    Ok(())
}

pub(crate) fn configure_command(
    leia: &Board,
    protocol: Protocol,
    etu: Option<u32>,
    frequency: Option<u32>,
    negotiate_pts: bool,
    negotiate_baudrate: bool,
) -> Result<(), Box<dyn Error>> {
    let mut config = SmartcardConfig::new()
        .with_protocol(protocol)
        .with_negotiate_pts(negotiate_pts)
        .with_negotiate_baudrate(negotiate_baudrate);
    if let Some(etu) = etu {
        config = config.with_etu(etu);
    }
    if let Some(frequency) = frequency {
        config = config.with_frequency(frequency);
    }

    leia.configure_smartcard(&config)?;
    println!("Smartcard configured ({protocol})");
    Ok(())
}

pub(crate) fn atr_command(leia: &Board) -> Result<(), Box<dyn Error>> {
    let atr = leia.get_atr()?;
    if atr.is_empty() {
        println!("No ATR, is the smartcard configured?");
    } else {
        println!("{atr}");
        println!("{}", atr.pretty());
    }
    Ok(())
}

pub(crate) fn inserted_command(leia: &Board) -> Result<(), Box<dyn Error>> {
    if leia.is_card_inserted()? {
        println!("Card inserted");
    } else {
        println!("No card");
    }
    Ok(())
}

pub(crate) fn timers_command(leia: &Board) -> Result<(), Box<dyn Error>> {
    println!("{}", leia.get_timers()?);
    Ok(())
}

/// Send an APDU given as hex
pub(crate) fn apdu_command(leia: &Board, raw: &str) -> Result<(), Box<dyn Error>> {
    let apdu = Apdu::from_raw(&parse_hex(raw)?)?;
    debug!(%apdu, "Sending APDU");

    let resp = leia.send_apdu(&apdu)?;
    println!("{resp}");
    println!("{}", resp.status().description());
    Ok(())
}

fn parse_hex(raw: &str) -> Result<Vec<u8>, hex::FromHexError> {
    let digits: String = raw.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    hex::decode(digits)
}

pub(crate) fn get_trigger_command(leia: &Board, index: u8) -> Result<(), Box<dyn Error>> {
    println!("{}", leia.get_trigger_strategy(index)?);
    Ok(())
}

pub(crate) fn set_trigger_command(
    leia: &Board,
    index: u8,
    points: &[TriggerPoint],
    delay: u32,
    single: bool,
) -> Result<(), Box<dyn Error>> {
    let strategy = TriggerStrategy::new(points)?
        .with_delay(delay)
        .with_single(single);
    leia.set_trigger_strategy(index, &strategy)?;
    println!("Strategy {index} set: {strategy}");
    Ok(())
}

pub(crate) fn dfu_command(leia: &Board) -> Result<(), Box<dyn Error>> {
    leia.dfu()?;
    println!("Board rebooted into DFU mode");
    Ok(())
}

/// Relay the card until stdin is closed or the relay ends on its own
pub(crate) fn relay_command(leia: Board, host: String, port: u16) -> Result<(), Box<dyn Error>> {
    prepare_relay(&leia);

    let config = RelayConfig::new().with_host(host).with_port(port);
    let handle = Relay::new(leia, config).spawn()?;

    let (sender, receiver) = crossbeam_channel::bounded(1);
    thread::Builder::new()
        .name("stdin watcher".to_string())
        .spawn(move || {
            let mut sink = Vec::new();
            if let Err(err) = io::stdin().lock().read_to_end(&mut sink) {
                warn!(error = %err, "Cannot read stdin");
            }
            // the receiver is gone once the relay has ended
            let _ = sender.send(());
        })?;

    println!("Relay running, close stdin (Ctrl-D) to stop");
    loop {
        if handle.is_finished() {
            break;
        }
        match receiver.recv_timeout(WATCH_INTERVAL) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                info!("Stdin closed");
                handle.stop();
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }
    }

    handle.join()?;
    Ok(())
}

/// Configure the card with the defaults before handing the board to the relay
fn prepare_relay<T: Transport>(leia: &Leia<T>) {
    // the relay configures lazily as well, so a missing card is not fatal here
    if let Err(err) = leia.configure_smartcard(&SmartcardConfig::default()) {
        warn!(error = %err, "Cannot configure the smartcard before relaying");
    }
    leia.clear_reconfigured();
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use smartleia_core::mock::{MockBoard, MockLeia};
    use smartleia_core::{Atr, LinkConfig, Resp};

    use super::*;

    fn board() -> (MockBoard, Leia<MockLeia>) {
        let mut atr = Atr {
            ts: 0x3B,
            t0: 0x02,
            ..Default::default()
        };
        atr.h[..2].copy_from_slice(&[0xAA, 0xBB]);
        atr.h_num = 2;
        let board = MockBoard::new(atr, |_| Resp::status_only(0x90, 0x00));
        let config = LinkConfig::default().with_probe_delay(Duration::ZERO);
        let leia = Leia::open(MockLeia::with_board(board.clone()), config).unwrap();
        (board, leia)
    }

    #[test]
    fn test_prepare_relay_configures_the_card() {
        let (board, leia) = board();
        prepare_relay(&leia);
        let configured = board.configurations().len();
        assert!(configured > 0);
        assert!(!leia.is_reconfigured());

        // already configured, the relay does not configure again
        let atr = leia.current_atr().unwrap().unwrap();
        assert!(!atr.is_empty());
        assert_eq!(board.configurations().len(), configured);
    }

    #[test]
    fn test_prepare_relay_tolerates_configuration_failure() {
        let (board, leia) = board();
        board.set_reject_configure(true);
        prepare_relay(&leia);
        assert!(!board.configurations().is_empty());
        assert!(!leia.is_reconfigured());

        board.set_card_inserted(false);
        prepare_relay(&leia);
        assert!(!leia.is_reconfigured());
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(
            parse_hex("00 a4 04 00\t02 3F00").unwrap(),
            [0x00, 0xA4, 0x04, 0x00, 0x02, 0x3F, 0x00]
        );
        assert!(parse_hex("0").is_err());
        assert!(parse_hex("zz").is_err());
    }
}
