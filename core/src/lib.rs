//! # Virtual Test Set Core
//!
//! Real-time protocol and test engine for IEC 61850 protection testing:
//! Sampled Values publishing, GOOSE subscription with a trip rule engine,
//! a multi-state sequence scheduler, protection test drivers (ramp,
//! distance, overcurrent, differential) and a live waveform analyzer.
//!
//! The only OS seam is the raw-frame port in [`io`]; everything else is
//! portable. Transport surfaces (HTTP/WebSocket) and recording-file parsers
//! live in collaborating crates and feed this core through its public types.

pub mod analyzer;
pub mod broadcaster;
pub mod iec61850;
pub mod io;
pub mod metrics;
pub mod publisher;
pub mod registry;
pub mod rules;
pub mod sequence;
pub mod sniffer;
pub mod synthesis;
pub mod testers;
pub mod timing;
pub mod trip;
