//! Relay worker between a LEIA board and a vpcd virtual reader

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use smartleia_core::{Apdu, LeForm, Leia, Resp, Transport};
use tracing::{debug, error, info, trace, warn};

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::vpcd::{self, CONTROL_LENGTH, Control, LENGTH_SIZE};

/// GET RESPONSE instruction
const INS_GET_RESPONSE: u8 = 0xC0;

/// Send an APDU and apply the status word continuations
///
/// - `61 xx`: a GET RESPONSE for `xx` bytes is sent and its response used
/// - `6C xx`: the command is sent again with `Le = xx`
/// - `67 xx`: the command is sent again with `Le = 0`
///
/// Each rule applies at most once, in this order.
pub fn transmit<T: Transport>(leia: &Leia<T>, mut apdu: Apdu) -> smartleia_core::Result<Resp> {
    let mut resp = leia.send_apdu(&apdu)?;

    if let Some(remaining) = resp.status().remaining_bytes() {
        debug!(remaining, "Fetching remaining bytes with GET RESPONSE");
        let get_response = Apdu::new(apdu.cla, INS_GET_RESPONSE, 0x00, 0x00)
            .with_le_form(u32::from(remaining), LeForm::Short);
        resp = leia.send_apdu(&get_response)?;
    }

    if let Some(le) = resp.status().corrected_length() {
        debug!(le, "Reissuing command with corrected Le");
        apdu.le = u32::from(le);
        apdu.send_le = LeForm::Short;
        resp = leia.send_apdu(&apdu)?;
    }

    if resp.status().is_wrong_length() {
        debug!("Reissuing command with Le = 0");
        apdu.le = 0;
        apdu.send_le = LeForm::Short;
        resp = leia.send_apdu(&apdu)?;
    }

    Ok(resp)
}

/// Outcome of waiting for the next request
enum Request {
    Frame(u16),
    Interrupted,
    Closed,
}

/// Relay between a LEIA board and a virtual reader service
#[derive(Debug)]
pub struct Relay<T: Transport> {
    leia: Leia<T>,
    config: RelayConfig,
    stop: Arc<AtomicBool>,
}

impl<T: Transport + 'static> Relay<T> {
    /// Create a relay; nothing happens until [`Self::run`] or [`Self::spawn`]
    pub fn new(leia: Leia<T>, config: RelayConfig) -> Self {
        Self {
            leia,
            config,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run the relay on a background thread
    pub fn spawn(self) -> Result<RelayHandle, RelayError> {
        let stop = Arc::clone(&self.stop);
        let thread = thread::Builder::new()
            .name("LEIA PCSC relay".to_string())
            .spawn(move || self.run())?;
        Ok(RelayHandle { stop, thread })
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Run the relay on the current thread until stopped
    ///
    /// Failing to reach the virtual reader service ends the relay. A failing
    /// connection only ends that connection.
    pub fn run(&self) -> Result<(), RelayError> {
        info!(addr = %self.config.addr(), "Starting LEIA PCSC relay");

        while !self.stopped() {
            match self.leia.is_card_inserted() {
                Ok(true) => {}
                Ok(false) => {
                    self.leia.invalidate_atr();
                    thread::sleep(self.config.no_card_backoff);
                    continue;
                }
                Err(err) => {
                    warn!(error = %err, "Cannot check card presence");
                    thread::sleep(self.config.no_card_backoff);
                    continue;
                }
            }

            let addr = self.config.addr();
            let mut stream = TcpStream::connect(&addr).map_err(|source| {
                error!(%addr, error = %source, "Cannot connect to the virtual reader");
                RelayError::Connect {
                    addr: addr.clone(),
                    source,
                }
            })?;
            info!(%addr, "Connected to the virtual reader");

            if let Err(err) = self.serve(&mut stream) {
                warn!(error = %err, "Relay connection failed");
            }
            // the peer may already be gone
            let _ = stream.shutdown(Shutdown::Both);
            self.leia.clear_reconfigured();
            debug!("Virtual reader connection closed");
        }

        info!("End of the relay");
        Ok(())
    }

    fn serve(&self, stream: &mut TcpStream) -> Result<(), RelayError> {
        while !self.stopped() && !self.leia.is_reconfigured() && self.leia.is_card_inserted()? {
            let length = match self.next_request(stream)? {
                Request::Frame(length) => length,
                Request::Interrupted | Request::Closed => break,
            };

            stream.set_read_timeout(Some(self.config.read_timeout))?;
            let mut payload = vec![0u8; usize::from(length)];
            stream.read_exact(&mut payload)?;

            if length == CONTROL_LENGTH {
                self.handle_control(stream, payload[0])?;
            } else {
                self.handle_apdu(stream, &payload)?;
            }
        }
        Ok(())
    }

    /// Wait for a length prefix, checking the stop and reconfiguration flags
    /// while idle
    fn next_request(&self, stream: &mut TcpStream) -> Result<Request, RelayError> {
        stream.set_read_timeout(Some(self.config.poll_interval))?;
        let mut header = [0u8; LENGTH_SIZE];
        let mut filled = 0;
        while filled < LENGTH_SIZE {
            if self.stopped() || self.leia.is_reconfigured() {
                return Ok(Request::Interrupted);
            }
            match stream.read(&mut header[filled..]) {
                Ok(0) => {
                    debug!("Virtual reader closed the connection");
                    return Ok(Request::Closed);
                }
                Ok(n) => filled += n,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Request::Frame(u16::from_be_bytes(header)))
    }

    fn handle_control(&self, stream: &mut TcpStream, byte: u8) -> Result<(), RelayError> {
        match Control::from_byte(byte) {
            Some(Control::GetAtr) => {
                let atr = self.leia.current_atr()?;
                let normalized = atr.map(|atr| atr.normalized()).unwrap_or_default();
                trace!(atr = ?hex::encode(&normalized), "Sending ATR");
                stream.write_all(&vpcd::frame(&normalized))?;
            }
            Some(control) => debug!(%control, "Ignoring control command"),
            None => warn!(command = byte, "Received unknown control command"),
        }
        Ok(())
    }

    fn handle_apdu(&self, stream: &mut TcpStream, raw: &[u8]) -> Result<(), RelayError> {
        trace!(apdu = ?hex::encode(raw), "Received APDU");
        let apdu = Apdu::from_raw(raw)?;
        let resp = transmit(&self.leia, apdu)?;
        let normalized = resp.normalized();
        trace!(response = ?hex::encode(&normalized), "Sending response");
        stream.write_all(&vpcd::frame(&normalized))?;
        Ok(())
    }
}

/// Handle on a relay running in the background
#[derive(Debug)]
pub struct RelayHandle {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<Result<(), RelayError>>,
}

impl RelayHandle {
    /// Ask the relay to stop at its next checkpoint
    pub fn stop(&self) {
        info!("Stopping LEIA PCSC relay");
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Whether the worker has returned
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the worker to return
    pub fn join(self) -> Result<(), RelayError> {
        self.thread.join().map_err(|_| RelayError::Panicked)?
    }

    /// Stop the relay and wait for it
    pub fn shutdown(self) -> Result<(), RelayError> {
        self.stop();
        self.join()
    }
}
