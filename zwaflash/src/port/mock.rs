//! Scripted serial link for unit tests.

use crate::error::Result;
use crate::port::{ByteStream, ControlSignals, DisconnectSignal, SerialLink};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Something the link did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LinkEvent {
    Open(u32),
    Close,
    Signals(ControlSignals),
    Write(Vec<u8>),
}

/// Reaction attached to a trigger.
#[derive(Debug, Clone)]
pub(crate) enum Action {
    /// Fire the disconnect signal.
    Disconnect,
    /// Queue bytes for the next reads.
    Respond(Vec<u8>),
    /// Make the stream handles unavailable.
    LoseStream,
}

#[derive(Debug, Clone)]
enum When {
    Opened(u32),
    Wrote(Vec<u8>),
}

#[derive(Debug)]
struct Trigger {
    when: When,
    action: Action,
    spent: bool,
}

#[derive(Debug, Default)]
struct MockState {
    open: bool,
    baud: Option<u32>,
    events: Vec<LinkEvent>,
    reads: VecDeque<Vec<u8>>,
    written: Vec<u8>,
    triggers: Vec<Trigger>,
    stream_lost: bool,
}

impl MockState {
    fn run_triggers(&mut self, signal: &DisconnectSignal, matches: impl Fn(&When) -> bool) {
        let mut actions = Vec::new();
        for trigger in &mut self.triggers {
            if !trigger.spent && matches(&trigger.when) {
                trigger.spent = true;
                actions.push(trigger.action.clone());
            }
        }
        for action in actions {
            match action {
                Action::Disconnect => {
                    signal.fire();
                },
                Action::Respond(bytes) => self.reads.push_back(bytes),
                Action::LoseStream => self.stream_lost = true,
            }
        }
    }
}

/// Test-side view of a [`MockLink`].
#[derive(Clone)]
pub(crate) struct MockHandle {
    state: Arc<Mutex<MockState>>,
    signal: DisconnectSignal,
}

impl MockHandle {
    pub(crate) fn push_read(&self, bytes: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .reads
            .push_back(bytes.to_vec());
    }

    pub(crate) fn on_open(&self, baud: u32, action: Action) {
        self.add_trigger(When::Opened(baud), action);
    }

    pub(crate) fn on_write(&self, pattern: &[u8], action: Action) {
        self.add_trigger(When::Wrote(pattern.to_vec()), action);
    }

    fn add_trigger(&self, when: When, action: Action) {
        self.state
            .lock()
            .unwrap()
            .triggers
            .push(Trigger {
                when,
                action,
                spent: false,
            });
    }

    pub(crate) fn events(&self) -> Vec<LinkEvent> {
        self.state
            .lock()
            .unwrap()
            .events
            .clone()
    }

    pub(crate) fn written(&self) -> Vec<u8> {
        self.state
            .lock()
            .unwrap()
            .written
            .clone()
    }

    pub(crate) fn written_text(&self) -> String {
        String::from_utf8_lossy(&self.written()).into_owned()
    }

    pub(crate) fn signals(&self) -> Vec<ControlSignals> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                LinkEvent::Signals(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn opens(&self) -> Vec<u32> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                LinkEvent::Open(baud) => Some(baud),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn disconnect(&self) {
        self.signal.fire();
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .open
    }
}

struct MockStream {
    state: Arc<Mutex<MockState>>,
    signal: DisconnectSignal,
}

impl Read for MockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let next = self
            .state
            .lock()
            .unwrap()
            .reads
            .pop_front();
        match next {
            Some(mut chunk) => {
                let n = buf.len().min(chunk.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    let rest = chunk.split_off(n);
                    self.state
                        .lock()
                        .unwrap()
                        .reads
                        .push_front(rest);
                }
                Ok(n)
            },
            None => {
                thread::sleep(Duration::from_millis(2));
                Err(io::Error::new(io::ErrorKind::TimedOut, "no data"))
            },
        }
    }
}

impl Write for MockStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self
            .state
            .lock()
            .unwrap();
        state
            .written
            .extend_from_slice(buf);
        state
            .events
            .push(LinkEvent::Write(buf.to_vec()));
        state.run_triggers(&self.signal, |when| match when {
            When::Wrote(pattern) => buf
                .windows(pattern.len())
                .any(|w| w == pattern.as_slice()),
            When::Opened(_) => false,
        });
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Serial link whose behaviour is scripted through a [`MockHandle`].
pub(crate) struct MockLink {
    name: String,
    state: Arc<Mutex<MockState>>,
    stream: MockStream,
    signal: DisconnectSignal,
}

impl MockLink {
    pub(crate) fn new(name: &str) -> (Self, MockHandle) {
        let state = Arc::new(Mutex::new(MockState::default()));
        let signal = DisconnectSignal::new();
        let link = Self {
            name: name.to_string(),
            state: Arc::clone(&state),
            stream: MockStream {
                state: Arc::clone(&state),
                signal: signal.clone(),
            },
            signal: signal.clone(),
        };
        (link, MockHandle { state, signal })
    }

    /// A mock that is already open at `baud`, as a freshly selected port is.
    pub(crate) fn opened(name: &str, baud: u32) -> (Self, MockHandle) {
        let (link, handle) = Self::new(name);
        {
            let mut state = link
                .state
                .lock()
                .unwrap();
            state.open = true;
            state.baud = Some(baud);
        }
        (link, handle)
    }
}

impl SerialLink for MockLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self, baud_rate: u32) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .unwrap();
        state.open = true;
        state.baud = Some(baud_rate);
        state.stream_lost = false;
        state
            .events
            .push(LinkEvent::Open(baud_rate));
        state.run_triggers(&self.signal, |when| matches!(when, When::Opened(b) if *b == baud_rate));
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .unwrap();
        if state.open {
            state.open = false;
            state.baud = None;
            state
                .events
                .push(LinkEvent::Close);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .open
    }

    fn baud_rate(&self) -> Option<u32> {
        self.state
            .lock()
            .unwrap()
            .baud
    }

    fn set_signals(&mut self, signals: ControlSignals) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .events
            .push(LinkEvent::Signals(signals));
        Ok(())
    }

    fn stream(&mut self) -> Option<&mut dyn ByteStream> {
        let available = {
            let state = self
                .state
                .lock()
                .unwrap();
            state.open && !state.stream_lost
        };
        if available {
            Some(&mut self.stream)
        } else {
            None
        }
    }

    fn disconnect_signal(&self) -> DisconnectSignal {
        self.signal
            .clone()
    }
}
