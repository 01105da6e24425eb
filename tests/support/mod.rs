//! Message types and helpers shared by the integration suites.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use courier::{AnyEvent, CancellationToken, MessageHeader, MessageType, TypeDescriptor};
use serde::{Deserialize, Serialize};

// =============================================================================
// Events
// =============================================================================

/// Family of everything that happens to an account.
pub struct AccountEvent;

impl MessageType for AccountEvent {
    const NAME: &'static str = "bank.AccountEvent";

    fn parents() -> Vec<TypeDescriptor> {
        vec![AnyEvent::descriptor()]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, courier::Message)]
#[message(name = "bank.Deposited", event, parent = AccountEvent)]
pub struct Deposited {
    pub header: MessageHeader,
    pub account: String,
    pub amount: u64,
}

impl Deposited {
    pub fn new(account: &str, amount: u64) -> Self {
        Self {
            header: MessageHeader::new(),
            account: account.to_string(),
            amount,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, courier::Message)]
#[message(name = "bank.Withdrawn", event, parent = AccountEvent)]
pub struct Withdrawn {
    pub header: MessageHeader,
    pub account: String,
    pub amount: u64,
}

impl Withdrawn {
    pub fn new(account: &str, amount: u64) -> Self {
        Self {
            header: MessageHeader::new(),
            account: account.to_string(),
            amount,
        }
    }
}

/// Outside the account family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, courier::Message)]
#[message(name = "bank.Audited", event)]
pub struct Audited {
    pub header: MessageHeader,
    pub note: String,
}

impl Audited {
    pub fn new(note: &str) -> Self {
        Self {
            header: MessageHeader::new(),
            note: note.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, courier::Message)]
#[message(name = "bank.Tick", event)]
pub struct Tick {
    pub header: MessageHeader,
    pub producer: u32,
    pub seq: u32,
}

impl Tick {
    pub fn new(producer: u32, seq: u32) -> Self {
        Self {
            header: MessageHeader::new(),
            producer,
            seq,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, courier::Message)]
#[message(name = "bank.Statement", event)]
pub struct Statement {
    pub header: MessageHeader,
    pub lines: Vec<u8>,
}

impl Statement {
    /// A statement of `len` bytes with a recognisable pattern.
    pub fn of_len(len: usize) -> Self {
        Self {
            header: MessageHeader::new(),
            lines: (0..len).map(|i| (i % 251) as u8).collect(),
        }
    }
}

// =============================================================================
// Commands
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, courier::Message)]
#[message(name = "bank.Deposit", command)]
pub struct Deposit {
    pub header: MessageHeader,
    #[serde(skip)]
    #[message(cancel_token)]
    pub token: Option<CancellationToken>,
    pub account: String,
    pub amount: u64,
}

impl Deposit {
    pub fn new(account: &str, amount: u64) -> Self {
        Self {
            header: MessageHeader::new(),
            token: None,
            account: account.to_string(),
            amount,
        }
    }

    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }
}

/// Long-running command; a non-`Option` token means every instance is
/// cancelable, including ones decoded from the wire.
#[derive(Debug, Clone, Serialize, Deserialize, courier::Message)]
#[message(name = "bank.Reconcile", command)]
pub struct Reconcile {
    pub header: MessageHeader,
    #[serde(skip)]
    #[message(cancel_token)]
    pub token: CancellationToken,
    pub millis: u64,
}

impl Reconcile {
    pub fn new(millis: u64) -> Self {
        Self {
            header: MessageHeader::new(),
            token: CancellationToken::new(),
            millis,
        }
    }

    pub fn caused_by(parent: &Reconcile, millis: u64) -> Self {
        Self {
            header: MessageHeader::caused_by(parent),
            token: parent.token.clone(),
            millis,
        }
    }
}

/// Nobody handles this one.
#[derive(Debug, Clone, Serialize, Deserialize, courier::Message)]
#[message(name = "bank.CloseAccount", command)]
pub struct CloseAccount {
    pub header: MessageHeader,
    pub account: String,
}

impl CloseAccount {
    pub fn new(account: &str) -> Self {
        Self {
            header: MessageHeader::new(),
            account: account.to_string(),
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Shared, append-only log written by handlers and read by assertions.
#[derive(Debug)]
pub struct Recorder<T> {
    items: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self {
            items: Arc::clone(&self.items),
        }
    }
}

impl<T: Clone> Recorder<T> {
    pub fn new() -> Self {
        Self {
            items: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn push(&self, item: T) {
        self.items.lock().unwrap().push(item);
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn items(&self) -> Vec<T> {
        self.items.lock().unwrap().clone()
    }

    /// Wait until at least `count` items arrived.
    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        wait_until(timeout, || self.len() >= count)
    }
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

/// Sleep in small steps, returning early once `token` is canceled.
pub fn sleep_unless_canceled(token: &CancellationToken, total: Duration) -> bool {
    let deadline = Instant::now() + total;
    while Instant::now() < deadline {
        if token.is_canceled() {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
    !token.is_canceled()
}
