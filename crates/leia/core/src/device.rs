//! Device API of a LEIA board
//!
//! [`Leia`] is a cheap handle over a shared session. Every operation takes the
//! session lock for its whole round trip, so a foreground caller and a relay
//! worker can use clones of the same handle without interleaving frames.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{Level, debug, info, instrument, warn};

use crate::apdu::Apdu;
use crate::atr::Atr;
use crate::config::{LinkConfig, Protocol, SmartcardConfig};
use crate::error::{Error, Result, ResultExt};
use crate::protocol::{CommandId, Link};
use crate::response::Resp;
use crate::timers::Timers;
use crate::transport::Transport;
use crate::trigger::{SetTriggerStrategy, TriggerStrategy, check_strategy_index};

/// State shared between every clone of a [`Leia`] handle
#[derive(Debug)]
struct Session<T: Transport> {
    link: Link<T>,
    /// ATR of the current card, as last fetched for the relay
    cached_atr: Option<Atr>,
    /// Raised by every explicit smartcard configuration
    reconfigured: bool,
}

impl<T: Transport> Session<T> {
    fn configure(&mut self, config: &SmartcardConfig) -> Result<()> {
        match config.protocol {
            Protocol::Auto => {
                if let Err(err) = self
                    .link
                    .send_command(CommandId::ConfigureSmartcard, &config.encode_for(Protocol::T1))
                {
                    debug!(error = ?err, "T=1 negotiation failed, falling back to auto");
                    self.link.send_command(
                        CommandId::ConfigureSmartcard,
                        &config.encode_for(Protocol::Auto),
                    )?;
                }
                Ok(())
            }
            _ => self
                .link
                .send_command(CommandId::ConfigureSmartcard, &config.encode()),
        }
    }

    fn get_atr(&mut self) -> Result<Atr> {
        let response = self.link.transceive(CommandId::GetAtr, &[])?;
        Atr::decode(&response)
    }

    fn is_card_inserted(&mut self) -> Result<bool> {
        let response = self.link.transceive(CommandId::IsCardInserted, &[])?;
        match response.as_ref() {
            [flag] => Ok(*flag == 0x01),
            _ => Err(Error::Framing("invalid response size for is card inserted")),
        }
    }
}

/// Handle on a LEIA board
#[derive(Debug)]
pub struct Leia<T: Transport> {
    session: Arc<Mutex<Session<T>>>,
}

impl<T: Transport> Clone for Leia<T> {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
        }
    }
}

impl<T: Transport> Leia<T> {
    /// Wrap a transport that is already open and synchronized
    pub fn new(transport: T, config: LinkConfig) -> Self {
        Self::from_link(Link::new(transport, config))
    }

    /// Wrap an existing link
    pub fn from_link(link: Link<T>) -> Self {
        Self {
            session: Arc::new(Mutex::new(Session {
                link,
                cached_atr: None,
                reconfigured: false,
            })),
        }
    }

    /// Open the transport and synchronize with the board
    pub fn open(transport: T, config: LinkConfig) -> Result<Self> {
        let mut link = Link::new(transport, config);
        link.open().context("Failed to open LEIA")?;
        Ok(Self::from_link(link))
    }

    fn lock(&self) -> MutexGuard<'_, Session<T>> {
        self.session.lock()
    }

    /// Close the underlying transport
    pub fn close(&self) -> Result<()> {
        self.lock().link.close()
    }

    /// Reset the board
    #[instrument(level = "debug", skip(self))]
    pub fn reset(&self) -> Result<()> {
        self.lock().link.send_command(CommandId::Reset, &[])
    }

    /// Configure the smartcard connection
    ///
    /// This invalidates the cached ATR and tells a running relay to drop its
    /// connection. With [`Protocol::Auto`], T=1 is tried first.
    #[instrument(level = "debug", skip(self, config), fields(protocol = %config.protocol))]
    pub fn configure_smartcard(&self, config: &SmartcardConfig) -> Result<()> {
        let mut session = self.lock();
        session.reconfigured = true;
        session.cached_atr = None;
        session.configure(config)
    }

    /// Read back a trigger strategy bank
    #[instrument(level = "debug", skip(self))]
    pub fn get_trigger_strategy(&self, index: u8) -> Result<TriggerStrategy> {
        check_strategy_index(index)?;
        let response = self
            .lock()
            .link
            .transceive(CommandId::GetTriggerStrategy, &[index])?;
        Ok(TriggerStrategy::decode(&response))
    }

    /// Install and activate a trigger strategy
    #[instrument(level = "debug", skip(self, strategy))]
    pub fn set_trigger_strategy(&self, index: u8, strategy: &TriggerStrategy) -> Result<()> {
        let payload = SetTriggerStrategy::new(index, strategy.clone())?.encode();
        self.lock()
            .link
            .send_command(CommandId::SetTriggerStrategy, &payload)
    }

    /// Timers of the last APDU exchange
    #[instrument(level = "debug", skip(self))]
    pub fn get_timers(&self) -> Result<Timers> {
        let response = self.lock().link.transceive(CommandId::GetTimers, &[])?;
        Ok(Timers::decode(&response))
    }

    /// Answer-To-Reset of the card
    #[instrument(level = "debug", skip(self))]
    pub fn get_atr(&self) -> Result<Atr> {
        self.lock().get_atr()
    }

    /// Whether a card is inserted
    #[instrument(level = "trace", skip(self))]
    pub fn is_card_inserted(&self) -> Result<bool> {
        self.lock().is_card_inserted()
    }

    /// Reboot the board into firmware update mode
    ///
    /// The board drops off the bus while rebooting, so transport failures are
    /// expected and ignored.
    #[instrument(level = "debug", skip(self))]
    pub fn dfu(&self) -> Result<()> {
        match self.lock().link.send_command(CommandId::Dfu, &[]) {
            Err(Error::Transport(err)) => {
                debug!(error = ?err, "Transport went away while entering DFU");
                Ok(())
            }
            other => other,
        }
    }

    /// Forward an APDU to the card
    #[instrument(level = "debug", skip(self, apdu), fields(ins = apdu.ins))]
    pub fn send_apdu(&self, apdu: &Apdu) -> Result<Resp> {
        let response = self
            .lock()
            .link
            .transceive(CommandId::SendApdu, &apdu.encode())?;
        let resp = Resp::decode(&response)?;
        let status = resp.status();
        let level = status.tracing_level();
        if level == Level::WARN {
            warn!(status = %status, description = status.description(), "APDU response");
        } else if level == Level::INFO {
            info!(status = %status, description = status.description(), "APDU response");
        } else {
            debug!(status = %status, description = status.description(), "APDU response");
        }
        Ok(resp)
    }

    /// ATR to present to a virtual reader
    ///
    /// Returns `None` without a card. Otherwise the cached ATR is returned,
    /// fetched first if needed. A card that was never activated reports an
    /// empty ATR; it is then configured with defaults, ignoring failures, and
    /// the ATR fetched again. This configuration does not raise the
    /// reconfiguration flag.
    #[instrument(level = "debug", skip(self))]
    pub fn current_atr(&self) -> Result<Option<Atr>> {
        let mut session = self.lock();
        if !session.is_card_inserted()? {
            return Ok(None);
        }

        let mut atr = match session.cached_atr.take() {
            Some(atr) => atr,
            None => session.get_atr()?,
        };
        if atr.is_empty() {
            if let Err(err) = session.configure(&SmartcardConfig::default()) {
                debug!(error = ?err, "Lazy smartcard configuration failed");
            }
            atr = session.get_atr()?;
        }
        session.cached_atr = Some(atr.clone());
        Ok(Some(atr))
    }

    /// The cached ATR, if any
    pub fn cached_atr(&self) -> Option<Atr> {
        self.lock().cached_atr.clone()
    }

    /// Forget the cached ATR
    pub fn invalidate_atr(&self) {
        self.lock().cached_atr = None;
    }

    /// Whether the smartcard was reconfigured since the flag was last cleared
    pub fn is_reconfigured(&self) -> bool {
        self.lock().reconfigured
    }

    /// Clear the reconfiguration flag
    pub fn clear_reconfigured(&self) {
        self.lock().reconfigured = false;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::{PlatformError, StatusError};
    use crate::mock::{MockBoard, MockLeia, MockReply};
    use hex_literal::hex;

    fn config() -> LinkConfig {
        LinkConfig::default().with_probe_delay(Duration::ZERO)
    }

    fn card_atr() -> Atr {
        let mut atr = Atr {
            ts: 0x3B,
            t0: 0x02,
            ..Default::default()
        };
        atr.h[..2].copy_from_slice(&hex!("AA BB"));
        atr.h_num = 2;
        atr
    }

    fn board() -> (MockBoard, Leia<MockLeia>) {
        let board = MockBoard::new(card_atr(), |apdu| {
            Resp::new(0x90, 0x00, apdu.data().to_vec()).unwrap()
        });
        let leia = Leia::open(MockLeia::with_board(board.clone()), config()).unwrap();
        (board, leia)
    }

    #[test]
    fn test_open_fails_without_probe_answer() {
        let mock = MockLeia::with_handler(|_, _| MockReply::ok());
        mock.set_responsive(false);
        let err = Leia::open(mock, config()).unwrap_err();
        assert!(matches!(err.root(), Error::Connection));
    }

    #[test]
    fn test_send_apdu() {
        let (board, leia) = board();
        let apdu = Apdu::new(0x00, 0xA4, 0x04, 0x00)
            .with_data(hex!("A0 00 00 00 03").to_vec())
            .unwrap();
        let resp = leia.send_apdu(&apdu).unwrap();
        assert!(resp.status().is_success());
        assert_eq!(resp.data(), &hex!("A0 00 00 00 03"));
        assert_eq!(board.apdus(), vec![apdu]);
    }

    #[test]
    fn test_card_not_inserted_status() {
        let (board, leia) = board();
        board.set_card_inserted(false);
        let err = leia.send_apdu(&Apdu::new(0x00, 0xB0, 0x00, 0x00)).unwrap_err();
        assert!(matches!(
            err,
            Error::Status(StatusError::Platform(PlatformError::CardNotInserted))
        ));
    }

    #[test]
    fn test_is_card_inserted_is_idempotent() {
        let (board, leia) = board();
        leia.current_atr().unwrap();
        let cached = leia.cached_atr();
        assert!(cached.is_some());

        for _ in 0..3 {
            assert!(leia.is_card_inserted().unwrap());
        }
        assert_eq!(leia.cached_atr(), cached);

        board.set_card_inserted(false);
        assert!(!leia.is_card_inserted().unwrap());
        assert!(!leia.is_card_inserted().unwrap());
        assert_eq!(leia.cached_atr(), cached);
    }

    #[test]
    fn test_is_card_inserted_rejects_wrong_size() {
        let mock = MockLeia::with_handler(|_, _| MockReply::data([0x01, 0x01]));
        let leia = Leia::new(mock, config());
        assert!(matches!(leia.is_card_inserted(), Err(Error::Framing(_))));
    }

    #[test]
    fn test_auto_configuration_prefers_t1() {
        let (board, leia) = board();
        leia.configure_smartcard(&SmartcardConfig::default()).unwrap();
        assert_eq!(board.configurations().len(), 1);
        assert_eq!(board.configurations()[0][0], Protocol::T1.wire_value());
        assert!(leia.is_reconfigured());
        leia.clear_reconfigured();
        assert!(!leia.is_reconfigured());
    }

    #[test]
    fn test_auto_configuration_falls_back() {
        let (board, leia) = board();
        board.set_reject_t1(true);
        leia.configure_smartcard(&SmartcardConfig::default()).unwrap();
        let selectors: Vec<u8> = board.configurations().iter().map(|c| c[0]).collect();
        assert_eq!(selectors, vec![2, 0]);
    }

    #[test]
    fn test_explicit_protocol_does_not_fall_back() {
        let (board, leia) = board();
        board.set_reject_t1(true);
        let config = SmartcardConfig::default().with_protocol(Protocol::T1);
        assert!(leia.configure_smartcard(&config).is_err());
        assert_eq!(board.configurations().len(), 1);
    }

    #[test]
    fn test_current_atr_configures_lazily() {
        let (board, leia) = board();
        assert!(leia.get_atr().unwrap().is_empty());

        let atr = leia.current_atr().unwrap().unwrap();
        assert_eq!(atr.normalized().as_ref(), &hex!("3B 02 AA BB"));
        assert_eq!(board.configurations().len(), 1);
        assert!(!leia.is_reconfigured());

        // cached from now on
        leia.current_atr().unwrap();
        assert_eq!(board.configurations().len(), 1);
    }

    #[test]
    fn test_current_atr_survives_failed_configuration() {
        let (board, leia) = board();
        board.set_reject_configure(true);

        let atr = leia.current_atr().unwrap().unwrap();
        assert!(atr.is_empty());
        assert_eq!(atr.normalized().as_ref(), &hex!("00 00"));
        // T=1 first, then the auto selector
        let selectors: Vec<u8> = board.configurations().iter().map(|c| c[0]).collect();
        assert_eq!(selectors, vec![2, 0]);
        assert!(!leia.is_reconfigured());
    }

    #[test]
    fn test_current_atr_without_card() {
        let (board, leia) = board();
        board.set_card_inserted(false);
        assert_eq!(leia.current_atr().unwrap(), None);
        assert!(board.configurations().is_empty());
    }

    #[test]
    fn test_configure_invalidates_cache() {
        let (_board, leia) = board();
        leia.current_atr().unwrap();
        leia.configure_smartcard(&SmartcardConfig::default()).unwrap();
        assert_eq!(leia.cached_atr(), None);
    }

    #[test]
    fn test_trigger_strategy_round_trip() {
        let (_board, leia) = board();
        let strategy = TriggerStrategy::new(&crate::trigger::MULTI_TRIG_ATR)
            .unwrap()
            .with_delay(5);
        leia.set_trigger_strategy(1, &strategy).unwrap();
        assert_eq!(leia.get_trigger_strategy(1).unwrap(), strategy);
        assert!(matches!(leia.get_trigger_strategy(4), Err(Error::Construction(_))));
    }

    #[test]
    fn test_timers() {
        let (board, leia) = board();
        board.set_timers(Timers {
            delta_t: 42,
            delta_t_answer: 7,
        });
        assert_eq!(leia.get_timers().unwrap().delta_t, 42);
    }

    #[test]
    fn test_dfu_ignores_vanishing_transport() {
        let mock = MockLeia::with_handler(|_, _| MockReply::ok());
        let leia = Leia::new(mock.clone(), config());
        leia.dfu().unwrap();
        assert_eq!(mock.commands()[0].command(), Some(CommandId::Dfu));

        leia.close().unwrap();
        leia.dfu().unwrap();
    }
}
