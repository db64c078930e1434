//! Scripted transport for state machine tests.
//!
//! Each connect attempt consumes one [`Attempt`] from the script. Accepted
//! attempts replay their [`Step`]s in order on `recv` and then stay silent.
//! Attempts beyond the script are refused. Every send and receive is
//! recorded in a transcript keyed by connect attempt.
//!
//! `recv` is cancel safe: a step is only consumed when it is returned.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use parking_lot::Mutex;
use serde_json::Value;

use crate::application::ports::{Connector, RawFrame, Transport, TransportError};

/// One scripted inbound step.
#[derive(Debug, Clone)]
pub enum Step {
    /// Deliver a frame.
    Frame(RawFrame),
    /// Fail the receive.
    Fail(String),
    /// Peer close.
    Close,
    /// Hold further steps until this attempt has sent this many frames.
    AfterSent(usize),
    /// Hold further steps until the gate is opened.
    Until(Gate),
}

/// Switch a test flips to release a held script.
#[derive(Debug, Clone, Default)]
pub struct Gate(Arc<AtomicBool>);

impl Gate {
    pub fn open(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Step {
    pub fn text(text: &str) -> Self {
        Self::Frame(RawFrame::Text(text.to_owned()))
    }

    pub fn json(value: &Value) -> Self {
        Self::Frame(RawFrame::Text(value.to_string()))
    }

    pub fn gzip(text: &str) -> Self {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text.as_bytes()).unwrap();
        Self::Frame(RawFrame::Binary(encoder.finish().unwrap()))
    }
}

/// One scripted connect attempt.
#[derive(Debug, Clone)]
pub enum Attempt {
    /// The connect fails.
    Refuse,
    /// The connect succeeds and the transport replays these steps.
    Accept(Vec<Step>),
}

impl Attempt {
    pub const fn accept(steps: Vec<Step>) -> Self {
        Self::Accept(steps)
    }
}

/// Transcript entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    /// A frame the client sent.
    Sent(Value),
    /// A scripted step the client consumed.
    Received,
}

#[derive(Debug, Default)]
struct Log {
    entries: Vec<(usize, Entry)>,
    closed: Vec<usize>,
}

#[derive(Debug)]
pub struct ScriptedConnector {
    script: Mutex<VecDeque<Attempt>>,
    connects: AtomicUsize,
    log: Arc<Mutex<Log>>,
}

impl ScriptedConnector {
    pub fn new(script: Vec<Attempt>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            connects: AtomicUsize::new(0),
            log: Arc::new(Mutex::new(Log::default())),
        })
    }

    /// Connect attempts made so far, refused ones included.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Every frame sent, across all attempts.
    pub fn sent(&self) -> Vec<Value> {
        self.log
            .lock()
            .entries
            .iter()
            .filter_map(|(_, entry)| match entry {
                Entry::Sent(value) => Some(value.clone()),
                Entry::Received => None,
            })
            .collect()
    }

    /// Transcript of one connect attempt (0-based, refused ones included).
    pub fn transcript(&self, attempt: usize) -> Vec<Entry> {
        self.log
            .lock()
            .entries
            .iter()
            .filter(|(index, _)| *index == attempt)
            .map(|(_, entry)| entry.clone())
            .collect()
    }

    pub fn transport_closed(&self, attempt: usize) -> bool {
        self.log.lock().closed.contains(&attempt)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, _url: &str) -> Result<Box<dyn Transport>, TransportError> {
        let attempt = self.connects.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().pop_front();
        match next {
            Some(Attempt::Accept(steps)) => Ok(Box::new(ScriptedTransport {
                attempt,
                steps: steps.into(),
                log: Arc::clone(&self.log),
            })),
            Some(Attempt::Refuse) | None => Err(TransportError::Connect {
                message: "connection refused".to_owned(),
            }),
        }
    }
}

struct ScriptedTransport {
    attempt: usize,
    steps: VecDeque<Step>,
    log: Arc<Mutex<Log>>,
}

impl ScriptedTransport {
    fn sent_count(&self) -> usize {
        self.log
            .lock()
            .entries
            .iter()
            .filter(|(index, entry)| *index == self.attempt && matches!(entry, Entry::Sent(_)))
            .count()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&mut self, frame: RawFrame) -> Result<(), TransportError> {
        let RawFrame::Text(text) = frame else {
            return Err(TransportError::Send {
                message: "unexpected frame kind".to_owned(),
            });
        };
        let value: Value = serde_json::from_str(&text).map_err(|e| TransportError::Send {
            message: e.to_string(),
        })?;
        self.log
            .lock()
            .entries
            .push((self.attempt, Entry::Sent(value)));
        Ok(())
    }

    async fn recv(&mut self) -> Result<RawFrame, TransportError> {
        loop {
            let ready = match self.steps.front() {
                Some(Step::AfterSent(count)) => self.sent_count() >= *count,
                Some(Step::Until(gate)) => gate.is_open(),
                _ => break,
            };
            if ready {
                self.steps.pop_front();
            } else {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
        let Some(step) = self.steps.pop_front() else {
            return std::future::pending().await;
        };
        self.log.lock().entries.push((self.attempt, Entry::Received));
        match step {
            Step::Frame(frame) => Ok(frame),
            Step::Fail(message) => Err(TransportError::Receive { message }),
            Step::Close => Ok(RawFrame::Close(None)),
            Step::AfterSent(_) | Step::Until(_) => unreachable!("gates are consumed above"),
        }
    }

    async fn close(&mut self) {
        self.log.lock().closed.push(self.attempt);
    }
}
