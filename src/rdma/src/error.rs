use std::sync::{Arc, Mutex};

use crate::control::ControlType;

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("cannot resolve {host}:{port}")]
    Resolve { host: String, port: u16 },
    #[error("no usable route to the peer")]
    NoRoute,
    #[error("verbs failure: {0}")]
    Verbs(String),
    #[error("peer capability record is malformed or has the wrong version")]
    BadCapabilityRecord,
    #[error("peer is unreachable")]
    NetworkUnreachable,
    #[error("work completion failed with status {0}")]
    Completion(u32),
    #[error("completion carries an unknown work-request id {0:#x}")]
    UnknownWrId(u64),
    #[error("control message too large: {0} bytes")]
    ControlOverflow(usize),
    #[error("control batch too large: {0} records")]
    RepeatOverflow(u32),
    #[error("expected control message {expected:?}, got {got:?}")]
    UnexpectedMessage {
        expected: ControlType,
        got: ControlType,
    },
    #[error("malformed control payload")]
    Malformed,
    #[error("peer reported a fatal error")]
    PeerAbort,
    #[error("no RAM block registered at offset {0:#x}")]
    UnknownBlock(u64),
    #[error("block index {0} out of range")]
    BadBlockIndex(u16),
    #[error("range {offset:#x}+{len:#x} exceeds block bounds")]
    OutOfBlock { offset: u64, len: u64 },
    #[error("block table length mismatch: peer sent {got}, local has {expected}")]
    BlockTableMismatch { expected: usize, got: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Sticky fatal-error sentinel shared between the transfer worker and the
/// keepalive timers. One-way: once set, every public transport entry point
/// short-circuits with the recorded error until teardown.
#[derive(Clone, Default)]
pub struct ErrorState(Arc<Mutex<Option<Error>>>);

impl ErrorState {
    pub fn set(&self, err: &Error) {
        let mut slot = self.0.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err.clone());
        }
    }

    pub fn check(&self) -> Result<()> {
        match &*self.0.lock().unwrap() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    pub fn is_set(&self) -> bool {
        self.0.lock().unwrap().is_some()
    }
}
