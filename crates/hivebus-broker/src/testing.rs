//! Test doubles shared by the unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use hivebus_client::{Connection, Connector};
use hivebus_common::model::{Endpoint, MessageEnvelope};
use hivebus_common::protocol::error::{BusError, Result};

/// Records every envelope it carries.
///
/// Transmits answer HTTP 500 for addresses in `failing` and for envelopes
/// whose payload has `"fail": true`. Addresses in `unreachable` fail at the
/// transport level.
#[derive(Default)]
pub struct RecordingConnector {
    pub opened: AtomicUsize,
    pub transmits: Arc<AtomicUsize>,
    pub delivered: Arc<Mutex<Vec<(String, MessageEnvelope)>>>,
    pub failing: Arc<Mutex<HashSet<String>>>,
    pub unreachable: Arc<Mutex<HashSet<String>>>,
}

impl RecordingConnector {
    pub fn fail_address(&self, address: &str) {
        self.failing.lock().insert(address.to_string());
    }

    pub fn heal_address(&self, address: &str) {
        self.failing.lock().remove(address);
    }

    pub fn cut_address(&self, address: &str) {
        self.unreachable.lock().insert(address.to_string());
    }

    pub fn restore_address(&self, address: &str) {
        self.unreachable.lock().remove(address);
    }

    pub fn delivered_to(&self, address: &str) -> Vec<MessageEnvelope> {
        self.delivered
            .lock()
            .iter()
            .filter(|(a, _)| a == address)
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn transmits(&self) -> usize {
        self.transmits.load(Ordering::SeqCst)
    }
}

struct RecordingConnection {
    address: String,
    transmits: Arc<AtomicUsize>,
    delivered: Arc<Mutex<Vec<(String, MessageEnvelope)>>>,
    failing: Arc<Mutex<HashSet<String>>>,
    unreachable: Arc<Mutex<HashSet<String>>>,
}

#[async_trait]
impl Connection for RecordingConnection {
    async fn transmit(&mut self, envelope: &MessageEnvelope) -> Result<()> {
        self.transmits.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.lock().contains(&self.address) {
            return Err(BusError::Transport(format!(
                "connection to {} refused",
                self.address
            )));
        }
        let marked = envelope.payload.get("fail").and_then(|v| v.as_bool()) == Some(true);
        if marked || self.failing.lock().contains(&self.address) {
            return Err(BusError::DeliveryFailure(format!(
                "{} answered HTTP 500",
                self.address
            )));
        }
        self.delivered
            .lock()
            .push((self.address.clone(), envelope.clone()));
        Ok(())
    }

    fn is_open(&self) -> bool {
        true
    }
}

#[async_trait]
impl Connector for RecordingConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RecordingConnection {
            address: endpoint.address.clone(),
            transmits: Arc::clone(&self.transmits),
            delivered: Arc::clone(&self.delivered),
            failing: Arc::clone(&self.failing),
            unreachable: Arc::clone(&self.unreachable),
        }))
    }
}
