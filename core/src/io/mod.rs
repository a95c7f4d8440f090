//! # Raw-Frame I/O Port
//!
//! The single OS-facing seam of the core. Everything that touches Ethernet
//! goes through the `RawFramePort` trait: best-effort transmit of one full
//! layer-2 frame, and a blocking receive with a short timeout so capture
//! threads can observe stop requests within ~100 ms.
//!
//! The in-repo backend is the in-memory loopback hub (`loopback`), which the
//! tests, the CLI self-test and `NO_NET` operation use. OS packet backends
//! (AF_PACKET, BPF, Npcap) are collaborator-side: they implement this trait
//! out of tree and plug in through `bind`.

pub mod loopback;

use crate::iec61850::common::MacAddress;
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// A duplex raw Ethernet frame channel bound to one interface.
///
/// Implementations must be cheap to share between the publisher registry and
/// the sniffer thread; all methods take `&self`.
pub trait RawFramePort: Send + Sync {
    /// Transmits one full Ethernet frame (destination and source MAC
    /// included). Best effort; the caller counts failures.
    fn send(&self, frame: &[u8]) -> io::Result<()>;

    /// Blocks for at most `timeout` waiting for one frame.
    ///
    /// # Returns
    ///
    /// * `Ok(Some(frame))`: A captured frame.
    /// * `Ok(None)`: The timeout elapsed; callers use this to poll their
    ///   stop flags. Implementations must honor timeouts of 100 ms or less.
    /// * `Err(_)`: The channel failed.
    fn recv(&self, timeout: Duration) -> io::Result<Option<Vec<u8>>>;

    /// The hardware address of the bound interface.
    fn local_mac(&self) -> MacAddress;

    /// The interface name this port is bound to.
    fn interface_name(&self) -> String;
}

/// Shared handle to a bound port.
pub type SharedPort = Arc<dyn RawFramePort>;

/// Descriptor of one attachable interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceInfo {
    pub name: String,
    pub mac: String,
    pub active: bool,
}

/// Constructor for an OS packet backend, registered by the embedding
/// application.
pub type BackendFactory = fn(&str) -> io::Result<SharedPort>;

static BACKEND: std::sync::OnceLock<BackendFactory> = std::sync::OnceLock::new();

/// Registers the OS packet backend used by `bind` when `NO_NET` is unset.
/// May be called once per process, before the first `bind`; later calls are
/// ignored.
pub fn register_backend(factory: BackendFactory) {
    let _ = BACKEND.set(factory);
}

/// Binds a duplex raw frame channel on the named interface.
///
/// Resolution order:
/// 1. An empty name falls back to the `IF_NAME` environment variable, then
///    to `"lo0"`.
/// 2. With `NO_NET` set, or when no OS packet backend has been registered,
///    the name resolves onto the in-memory loopback hub: every port bound
///    to the same name sees every other port's frames.
pub fn bind(interface_name: &str) -> io::Result<SharedPort> {
    let name = if interface_name.is_empty() {
        std::env::var("IF_NAME").unwrap_or_else(|_| "lo0".to_string())
    } else {
        interface_name.to_string()
    };

    if std::env::var_os("NO_NET").is_some() {
        return Ok(loopback::LoopbackHub::bind(&name));
    }
    match BACKEND.get() {
        Some(factory) => factory(&name),
        None => Ok(loopback::LoopbackHub::bind(&name)),
    }
}

/// Lists the interfaces known to the in-process backends.
pub fn interfaces() -> Vec<InterfaceInfo> {
    loopback::LoopbackHub::interfaces()
}

/// The hardware address the backend would assign on `interface_name`.
pub fn local_mac(interface_name: &str) -> io::Result<MacAddress> {
    Ok(bind(interface_name)?.local_mac())
}
