//! # In-Memory Loopback Hub
//!
//! A process-local shared Ethernet segment. Every port bound to the same hub
//! name receives a copy of every frame any other port on that hub transmits,
//! like stations on one multicast VLAN. Used by the integration tests, the
//! CLI self-test and `NO_NET` operation.
//!
//! Delivery is bounded and best-effort: each endpoint owns a bounded queue
//! and a receiver that cannot drain fast enough sees drops, never blocks the
//! sender. This mirrors what a kernel capture socket does under overload.

use super::{InterfaceInfo, RawFramePort, SharedPort};
use crate::iec61850::common::MacAddress;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

/// Frames queued per endpoint before the hub starts dropping for that
/// receiver.
const ENDPOINT_QUEUE_DEPTH: usize = 512;

struct HubInner {
    name: String,
    endpoints: Mutex<Vec<(u64, SyncSender<Vec<u8>>)>>,
}

/// One shared segment, addressable by name.
pub struct LoopbackHub;

static HUBS: OnceLock<Mutex<HashMap<String, Arc<HubInner>>>> = OnceLock::new();
static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

fn hubs() -> &'static Mutex<HashMap<String, Arc<HubInner>>> {
    HUBS.get_or_init(|| Mutex::new(HashMap::new()))
}

impl LoopbackHub {
    /// Binds a new endpoint on the named hub, creating the hub on first use.
    pub fn bind(name: &str) -> SharedPort {
        let hub = {
            let mut map = hubs().lock().unwrap();
            map.entry(name.to_string())
                .or_insert_with(|| {
                    Arc::new(HubInner {
                        name: name.to_string(),
                        endpoints: Mutex::new(Vec::new()),
                    })
                })
                .clone()
        };

        let id = NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = sync_channel(ENDPOINT_QUEUE_DEPTH);
        hub.endpoints.lock().unwrap().push((id, tx));

        // Locally administered address derived from the endpoint id.
        let mac = MacAddress([
            0x02,
            0x1A,
            0x61,
            (id >> 16) as u8,
            (id >> 8) as u8,
            id as u8,
        ]);

        Arc::new(LoopbackPort {
            hub,
            endpoint_id: id,
            mac,
            rx: Mutex::new(rx),
        })
    }

    /// Lists the hubs currently alive in this process.
    pub fn interfaces() -> Vec<InterfaceInfo> {
        hubs()
            .lock()
            .unwrap()
            .values()
            .map(|hub| InterfaceInfo {
                name: hub.name.clone(),
                mac: "02:1A:61:00:00:00".to_string(),
                active: !hub.endpoints.lock().unwrap().is_empty(),
            })
            .collect()
    }
}

struct LoopbackPort {
    hub: Arc<HubInner>,
    endpoint_id: u64,
    mac: MacAddress,
    rx: Mutex<Receiver<Vec<u8>>>,
}

impl RawFramePort for LoopbackPort {
    fn send(&self, frame: &[u8]) -> io::Result<()> {
        if frame.len() < 14 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame of {} bytes has no Ethernet header", frame.len()),
            ));
        }
        let mut endpoints = self.hub.endpoints.lock().unwrap();
        // Prune endpoints whose receivers are gone; drop on full queues.
        endpoints.retain(|(id, tx)| {
            if *id == self.endpoint_id {
                return true;
            }
            match tx.try_send(frame.to_vec()) {
                Ok(()) => true,
                Err(std::sync::mpsc::TrySendError::Full(_)) => true,
                Err(std::sync::mpsc::TrySendError::Disconnected(_)) => false,
            }
        });
        Ok(())
    }

    fn recv(&self, timeout: Duration) -> io::Result<Option<Vec<u8>>> {
        let rx = self.rx.lock().unwrap();
        match rx.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "loopback hub closed",
            )),
        }
    }

    fn local_mac(&self) -> MacAddress {
        self.mac
    }

    fn interface_name(&self) -> String {
        self.hub.name.clone()
    }
}

impl Drop for LoopbackPort {
    fn drop(&mut self) {
        let mut endpoints = self.hub.endpoints.lock().unwrap();
        endpoints.retain(|(id, _)| *id != self.endpoint_id);
    }
}
