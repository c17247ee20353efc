//! Frame capture and the dispatch loop.
//!
//! Each opened interface gets a dedicated OS thread doing blocking reads on
//! its [`FrameSource`]. Raw frames are handed over a bounded channel to a
//! single async dispatch task that decodes, classifies and dispatches them.
//!
//! ```text
//! ┌──────────────┐
//! │ capture-eth0 │──┐
//! └──────────────┘  │  CapturedFrame   ┌───────────────┐     ┌──────────────────┐
//! ┌──────────────┐  ├─────────────────▶│ dispatch loop │────▶│ FrameDispatcher  │
//! │ capture-eth1 │──┘   (mpsc)         └───────────────┘     └──────────────────┘
//! └──────────────┘
//! ```
//!
//! A failing interface ends only its own thread. Decoding errors are counted
//! and dropped; they never stop the loop.

pub mod interfaces;
#[cfg(target_os = "linux")]
pub mod packet_socket;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use mop_core::Interface;
use mop_protocol::decode_frame;

use crate::classifier::{Action, FrameDispatcher};

/// Capacity of the capture → dispatch channel.
pub const FRAME_BUFFER: usize = 1024;

/// Receive buffer per capture thread (max Ethernet frame incl. VLAN tag).
const CAPTURE_BUFFER_LEN: usize = 1522;

// ============================================================================
// Frame Sources
// ============================================================================

/// A blocking supplier of raw link-layer frames for one interface.
pub trait FrameSource: Send {
    /// Reads the next frame into `buf`.
    ///
    /// Returns `Ok(Some(len))` for a frame, `Ok(None)` if nothing arrived
    /// within the source's poll interval, `Err(CaptureError::SourceClosed)`
    /// at end of stream.
    fn recv_frame(&mut self, buf: &mut [u8]) -> Result<Option<usize>, CaptureError>;
}

/// A raw frame tagged with the interface it arrived on.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub interface: Arc<Interface>,
    pub data: Vec<u8>,
}

/// Opens a source for each interface.
///
/// Interfaces that fail to open are reported and excluded.
///
/// # Errors
///
/// `CaptureError::NoUsableInterfaces` if none could be opened.
pub fn open_sources<S, F>(
    interfaces: Vec<Interface>,
    mut open: F,
) -> Result<Vec<(Interface, S)>, CaptureError>
where
    S: FrameSource,
    F: FnMut(&Interface) -> Result<S, CaptureError>,
{
    let requested = interfaces.len();
    let mut opened = Vec::with_capacity(requested);

    for iface in interfaces {
        match open(&iface) {
            Ok(source) => {
                info!(interface = %iface, "Capturing on interface");
                opened.push((iface, source));
            }
            Err(e) => {
                error!(interface = %iface.name(), error = %e, "Failed to open interface");
            }
        }
    }

    if opened.is_empty() {
        return Err(CaptureError::NoUsableInterfaces { requested });
    }
    if opened.len() < requested {
        warn!(
            opened = opened.len(),
            requested, "Running with a subset of the requested interfaces"
        );
    }
    Ok(opened)
}

// ============================================================================
// Capture Engine
// ============================================================================

/// Owns the per-interface capture threads.
///
/// Dropping the engine cancels its token; [`CaptureEngine::stop`] also
/// waits for the threads to finish.
pub struct CaptureEngine {
    cancel_token: CancellationToken,
    threads: Vec<JoinHandle<()>>,
}

impl CaptureEngine {
    /// Spawns one capture thread per source, all feeding `frames`.
    ///
    /// # Errors
    ///
    /// `CaptureError::Spawn` if a thread cannot be created; threads already
    /// started are cancelled.
    pub fn start<S>(
        sources: Vec<(Interface, S)>,
        frames: mpsc::Sender<CapturedFrame>,
        cancel_token: CancellationToken,
    ) -> Result<Self, CaptureError>
    where
        S: FrameSource + 'static,
    {
        let mut engine = Self {
            cancel_token,
            threads: Vec::with_capacity(sources.len()),
        };

        for (iface, source) in sources {
            let interface = Arc::new(iface);
            let name = interface.name().to_string();
            let frames = frames.clone();
            let token = engine.cancel_token.clone();

            let handle = std::thread::Builder::new()
                .name(format!("capture-{name}"))
                .spawn(move || capture_loop(source, interface, frames, token))
                .map_err(|e| CaptureError::Spawn {
                    interface: name,
                    error: e.to_string(),
                })?;
            engine.threads.push(handle);
        }

        Ok(engine)
    }

    /// Number of running capture threads.
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Cancels capture and joins every thread.
    pub fn stop(mut self) {
        self.cancel_token.cancel();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("Capture thread panicked");
            }
        }
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

fn capture_loop<S: FrameSource>(
    mut source: S,
    interface: Arc<Interface>,
    frames: mpsc::Sender<CapturedFrame>,
    cancel_token: CancellationToken,
) {
    let mut buf = vec![0u8; CAPTURE_BUFFER_LEN];
    debug!(interface = %interface.name(), "Capture thread started");

    while !cancel_token.is_cancelled() {
        match source.recv_frame(&mut buf) {
            Ok(Some(len)) => {
                let data = buf.get(..len).unwrap_or(&buf).to_vec();
                let captured = CapturedFrame {
                    interface: Arc::clone(&interface),
                    data,
                };
                if frames.blocking_send(captured).is_err() {
                    debug!(interface = %interface.name(), "Dispatch loop gone");
                    break;
                }
            }
            Ok(None) => {}
            Err(CaptureError::SourceClosed) => {
                debug!(interface = %interface.name(), "Frame source closed");
                break;
            }
            Err(e) => {
                error!(interface = %interface.name(), error = %e, "Capture failed, dropping interface");
                break;
            }
        }
    }

    debug!(interface = %interface.name(), "Capture thread stopped");
}

// ============================================================================
// Dispatch Loop
// ============================================================================

/// Counters reported when the dispatch loop ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub received: u64,
    pub malformed: u64,
    pub dispatched: u64,
    pub ignored: u64,
}

/// Decodes and dispatches captured frames until cancelled or until every
/// capture thread has stopped.
pub async fn run_dispatch_loop(
    mut frames: mpsc::Receiver<CapturedFrame>,
    dispatcher: FrameDispatcher,
    cancel_token: CancellationToken,
) -> DispatchStats {
    let mut stats = DispatchStats::default();

    loop {
        let captured = tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Dispatch loop cancelled");
                break;
            }
            next = frames.recv() => match next {
                Some(captured) => captured,
                None => {
                    info!("All capture sources stopped");
                    break;
                }
            },
        };

        stats.received += 1;
        let frame = match decode_frame(&captured.data) {
            Ok(frame) => frame,
            Err(e) => {
                trace!(interface = %captured.interface.name(), error = %e, "Dropping malformed frame");
                stats.malformed += 1;
                continue;
            }
        };

        match dispatcher.dispatch(&captured.interface, &frame) {
            Action::Ignore(_) => stats.ignored += 1,
            Action::DumpLoad | Action::RemoteConsole => stats.dispatched += 1,
        }
    }

    info!(
        received = stats.received,
        dispatched = stats.dispatched,
        ignored = stats.ignored,
        malformed = stats.malformed,
        "Dispatch loop stopped"
    );
    stats
}

// ============================================================================
// Errors
// ============================================================================

/// Errors from interface discovery and frame capture.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    #[error("Failed to enumerate interfaces in {path}: {error}")]
    Enumerate { path: PathBuf, error: String },

    #[error("Failed to read hardware address of {interface}: {error}")]
    Address { interface: String, error: String },

    #[error("Invalid interface {interface}: {error}")]
    InvalidInterface { interface: String, error: String },

    #[error("Failed to open {interface}: {error}")]
    Open { interface: String, error: String },

    #[error("Failed to read from {interface}: {error}")]
    Read { interface: String, error: String },

    #[error("Failed to start capture thread for {interface}: {error}")]
    Spawn { interface: String, error: String },

    #[error("No usable interfaces ({requested} requested)")]
    NoUsableInterfaces { requested: usize },

    #[error("Frame source closed")]
    SourceClosed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use mop_core::{HardwareAddr, Suppression};
    use std::collections::VecDeque;

    struct ScriptedSource(VecDeque<Vec<u8>>);

    impl FrameSource for ScriptedSource {
        fn recv_frame(&mut self, buf: &mut [u8]) -> Result<Option<usize>, CaptureError> {
            match self.0.pop_front() {
                Some(frame) => {
                    buf[..frame.len()].copy_from_slice(&frame);
                    Ok(Some(frame.len()))
                }
                None => Err(CaptureError::SourceClosed),
            }
        }
    }

    fn iface(name: &str) -> Interface {
        Interface::new(name, HardwareAddr::new([8, 0, 0x2b, 0, 0, 1]), Suppression::None).unwrap()
    }

    #[test]
    fn test_open_sources_skips_failures() {
        let opened = open_sources(vec![iface("eth0"), iface("eth1")], |i| {
            if i.name() == "eth0" {
                Err(CaptureError::Open {
                    interface: "eth0".to_string(),
                    error: "permission denied".to_string(),
                })
            } else {
                Ok(ScriptedSource(VecDeque::new()))
            }
        })
        .unwrap();

        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].0.name(), "eth1");
    }

    #[test]
    fn test_open_sources_all_failing_is_fatal() {
        let result = open_sources(vec![iface("eth0")], |i| {
            Err::<ScriptedSource, _>(CaptureError::Open {
                interface: i.name().to_string(),
                error: "no such device".to_string(),
            })
        });
        assert_eq!(
            result.err(),
            Some(CaptureError::NoUsableInterfaces { requested: 1 })
        );
    }

    #[test]
    fn test_capture_error_display() {
        let err = CaptureError::Open {
            interface: "eth0".to_string(),
            error: "Operation not permitted".to_string(),
        };
        assert_eq!(err.to_string(), "Failed to open eth0: Operation not permitted");
    }
}
