//! Scripted LEIA firmware emulator
//!
//! [`MockLeia`] implements [`Transport`] and plays the firmware side of the
//! framing protocol: it answers probes, parses command frames and queues the
//! reply produced by a handler. Clones share state, so a test can keep a
//! handle to inspect what the host wrote.
//!
//! [`MockBoard`] is a ready-made handler emulating a board with a card.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;

use crate::apdu::Apdu;
use crate::atr::Atr;
use crate::protocol::{COMMAND_LEN_SIZE, CommandId, PROBE_BYTE, WAITING_FLAG, flag};
use crate::response::Resp;
use crate::timers::Timers;
use crate::transport::{Transport, TransportError};
use crate::trigger::{STRATEGY_MAX, TRIGGER_STRATEGY_LAYOUT_SIZE, TriggerStrategy};

/// Bytes queued by the emulator in answer to one command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockReply(BytesMut);

impl MockReply {
    /// Successful status and acknowledgement, no response
    pub fn ok() -> Self {
        Self::raw(&[flag::STATUS, 0x00, flag::ACK])
    }

    /// Successful status and acknowledgement followed by a length prefixed response
    pub fn data<T: AsRef<[u8]>>(data: T) -> Self {
        let data = data.as_ref();
        let mut reply = Self::ok();
        reply.0.put_u32(data.len() as u32);
        reply.0.put_slice(data);
        reply
    }

    /// Status phase bytes only, no acknowledgement
    pub fn status(bytes: &[u8]) -> Self {
        Self::raw(bytes)
    }

    /// Platform error code after the status flag
    pub fn platform_error(code: u8) -> Self {
        Self::raw(&[flag::STATUS, code])
    }

    /// Exact bytes
    pub fn raw(bytes: &[u8]) -> Self {
        Self(BytesMut::from(bytes))
    }

    /// Prefix the reply with `count` wait extensions
    pub fn with_wait_extensions(self, count: usize) -> Self {
        let mut buf = BytesMut::with_capacity(count + self.0.len());
        buf.put_bytes(flag::WAIT_EXTENSION, count);
        buf.put_slice(&self.0);
        Self(buf)
    }
}

/// A command frame received by the emulator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCommand {
    /// Command id byte
    pub id: u8,
    /// Command payload
    pub payload: Bytes,
}

impl MockCommand {
    /// The command id, if known
    pub const fn command(&self) -> Option<CommandId> {
        CommandId::from_byte(self.id)
    }
}

type Handler = Box<dyn FnMut(u8, &[u8]) -> MockReply + Send>;

struct MockState {
    handler: Handler,
    responsive: bool,
    open: bool,
    pending: BytesMut,
    outbound: VecDeque<u8>,
    written: Vec<u8>,
    commands: Vec<MockCommand>,
    timeouts: Vec<Duration>,
}

impl fmt::Debug for MockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockState")
            .field("responsive", &self.responsive)
            .field("open", &self.open)
            .field("pending", &self.pending.len())
            .field("outbound", &self.outbound.len())
            .field("commands", &self.commands.len())
            .finish()
    }
}

impl MockState {
    fn process(&mut self) {
        loop {
            match self.pending.first().copied() {
                None => return,
                Some(PROBE_BYTE) => {
                    self.pending.advance(1);
                    if self.responsive {
                        self.outbound.push_back(WAITING_FLAG);
                    }
                }
                Some(id) => {
                    let header = 1 + COMMAND_LEN_SIZE;
                    if self.pending.len() < header {
                        return;
                    }
                    let mut length = [0u8; COMMAND_LEN_SIZE];
                    length.copy_from_slice(&self.pending[1..header]);
                    let length = u32::from_be_bytes(length) as usize;
                    if self.pending.len() < header + length {
                        return;
                    }
                    self.pending.advance(header);
                    let payload = self.pending.split_to(length).freeze();
                    let reply = (self.handler)(id, &payload);
                    self.commands.push(MockCommand { id, payload });
                    self.outbound.extend(reply.0.iter().copied());
                }
            }
        }
    }
}

/// Emulated LEIA firmware
#[derive(Debug, Clone)]
pub struct MockLeia {
    state: Arc<Mutex<MockState>>,
}

impl MockLeia {
    /// Emulator answering every command with `handler(id, payload)`
    pub fn with_handler<F>(handler: F) -> Self
    where
        F: FnMut(u8, &[u8]) -> MockReply + Send + 'static,
    {
        Self {
            state: Arc::new(Mutex::new(MockState {
                handler: Box::new(handler),
                responsive: true,
                open: true,
                pending: BytesMut::new(),
                outbound: VecDeque::new(),
                written: Vec::new(),
                commands: Vec::new(),
                timeouts: Vec::new(),
            })),
        }
    }

    /// Emulator driven by a [`MockBoard`]
    pub fn with_board(board: MockBoard) -> Self {
        Self::with_handler(move |id, payload| board.handle(id, payload))
    }

    /// Whether the emulator answers the liveness probe
    pub fn set_responsive(&self, responsive: bool) {
        self.state.lock().responsive = responsive;
    }

    /// Queue bytes the host has not asked for
    pub fn push_unsolicited(&self, bytes: &[u8]) {
        self.state.lock().outbound.extend(bytes.iter().copied());
    }

    /// Every byte written by the host
    pub fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    /// Every command frame received
    pub fn commands(&self) -> Vec<MockCommand> {
        self.state.lock().commands.clone()
    }

    /// Timeouts set by the host, in order
    pub fn timeouts(&self) -> Vec<Duration> {
        self.state.lock().timeouts.clone()
    }

    /// Whether the channel is open
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }
}

impl Transport for MockLeia {
    fn open(&mut self) -> Result<(), TransportError> {
        self.state.lock().open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.state.lock().open = false;
        Ok(())
    }

    fn read(&mut self, len: usize) -> Result<Bytes, TransportError> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(TransportError::Closed);
        }
        let take = len.min(state.outbound.len());
        Ok(state.outbound.drain(..take).collect::<Vec<_>>().into())
    }

    fn read_available(&mut self) -> Result<Bytes, TransportError> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(TransportError::Closed);
        }
        Ok(state.outbound.drain(..).collect::<Vec<_>>().into())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(TransportError::Closed);
        }
        state.written.extend_from_slice(data);
        state.pending.extend_from_slice(data);
        state.process();
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
        self.state.lock().timeouts.push(timeout);
        Ok(())
    }
}

type Responder = Box<dyn FnMut(&Apdu) -> Resp + Send>;

struct BoardState {
    card_inserted: bool,
    configured: bool,
    reject_t1: bool,
    reject_configure: bool,
    atr: Atr,
    timers: Timers,
    strategies: [TriggerStrategy; STRATEGY_MAX as usize],
    configurations: Vec<Bytes>,
    apdus: Vec<Apdu>,
    responder: Responder,
}

/// Emulated board state: card presence, ATR, trigger banks and a card responder
///
/// The ATR reads back empty until a configure command succeeded, like a card
/// that was never activated.
#[derive(Clone)]
pub struct MockBoard {
    state: Arc<Mutex<BoardState>>,
}

impl fmt::Debug for MockBoard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockBoard")
            .field("card_inserted", &state.card_inserted)
            .field("configured", &state.configured)
            .field("apdus", &state.apdus.len())
            .finish()
    }
}

impl MockBoard {
    /// Board with an inserted, not yet configured card answering with `responder`
    pub fn new<F>(atr: Atr, responder: F) -> Self
    where
        F: FnMut(&Apdu) -> Resp + Send + 'static,
    {
        Self {
            state: Arc::new(Mutex::new(BoardState {
                card_inserted: true,
                configured: false,
                reject_t1: false,
                reject_configure: false,
                atr,
                timers: Timers::default(),
                strategies: Default::default(),
                configurations: Vec::new(),
                apdus: Vec::new(),
                responder: Box::new(responder),
            })),
        }
    }

    /// Insert or remove the card
    pub fn set_card_inserted(&self, inserted: bool) {
        let mut state = self.state.lock();
        state.card_inserted = inserted;
        if !inserted {
            state.configured = false;
        }
    }

    /// Fail every configure command while a card is inserted
    pub fn set_reject_configure(&self, reject: bool) {
        self.state.lock().reject_configure = reject;
    }

    /// Fail configure commands that select T=1
    pub fn set_reject_t1(&self, reject: bool) {
        self.state.lock().reject_t1 = reject;
    }

    /// Timers returned by the get timers command
    pub fn set_timers(&self, timers: Timers) {
        self.state.lock().timers = timers;
    }

    /// Payloads of every configure command, accepted or not
    pub fn configurations(&self) -> Vec<Bytes> {
        self.state.lock().configurations.clone()
    }

    /// APDUs forwarded to the card
    pub fn apdus(&self) -> Vec<Apdu> {
        self.state.lock().apdus.clone()
    }

    fn handle(&self, id: u8, payload: &[u8]) -> MockReply {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(command) = CommandId::from_byte(id) else {
            return MockReply::status(&[flag::UNSUPPORTED]);
        };
        match command {
            CommandId::Reset | CommandId::Dfu => MockReply::ok(),
            CommandId::IsCardInserted => MockReply::data([u8::from(state.card_inserted)]),
            CommandId::GetTimers => MockReply::data(state.timers.encode()),
            CommandId::GetTriggerStrategy => match payload
                .first()
                .and_then(|index| state.strategies.get(usize::from(*index)))
            {
                Some(strategy) => MockReply::data(strategy.encode()),
                None => MockReply::status(&[flag::ERROR]),
            },
            CommandId::SetTriggerStrategy => {
                let index = payload.first().copied().map(usize::from);
                match index {
                    Some(index)
                        if index < state.strategies.len()
                            && payload.len() == 1 + TRIGGER_STRATEGY_LAYOUT_SIZE =>
                    {
                        state.strategies[index] = TriggerStrategy::decode(&payload[1..]);
                        MockReply::ok()
                    }
                    _ => MockReply::status(&[flag::ERROR]),
                }
            }
            CommandId::ConfigureSmartcard => {
                state.configurations.push(Bytes::copy_from_slice(payload));
                if !state.card_inserted {
                    MockReply::platform_error(0x01)
                } else if state.reject_configure
                    || (state.reject_t1 && payload.first() == Some(&2))
                {
                    MockReply::status(&[flag::ERROR])
                } else {
                    state.configured = true;
                    MockReply::ok()
                }
            }
            CommandId::GetAtr => {
                if state.card_inserted && state.configured {
                    MockReply::data(state.atr.encode())
                } else {
                    MockReply::data(Atr::default().encode())
                }
            }
            CommandId::SendApdu => {
                if !state.card_inserted {
                    return MockReply::platform_error(0x01);
                }
                match Apdu::decode(payload) {
                    Ok(apdu) => {
                        let resp = (state.responder)(&apdu);
                        state.apdus.push(apdu);
                        MockReply::data(resp.encode())
                    }
                    Err(_) => MockReply::status(&[flag::ERROR]),
                }
            }
        }
    }
}
