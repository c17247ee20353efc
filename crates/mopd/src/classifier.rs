//! Frame classification and dispatch.
//!
//! [`classify`] is a pure function of the receiving interface and the frame.
//! It never errors: foreign, malformed, suppressed and self-sent traffic all
//! come back as [`Action::Ignore`] with the reason attached for logging.
//!
//! [`FrameDispatcher`] runs the classifier and hands dispatchable frames to a
//! [`ProtocolHandler`] registered per protocol type.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, trace};

use mop_core::{Frame, Interface, MopVersion, ProtocolType};

// ============================================================================
// Classification
// ============================================================================

/// What the daemon does with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Route to the dump/load handler
    DumpLoad,
    /// Route to the remote-console handler
    RemoteConsole,
    /// Drop silently
    Ignore(IgnoreReason),
}

impl Action {
    pub fn is_ignore(&self) -> bool {
        matches!(self, Self::Ignore(_))
    }
}

/// Why a frame was not dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Sent by this interface
    SelfTraffic,
    /// Not a DEC protocol
    ForeignProtocol,
    /// Operator disabled this MOP version on the interface
    Suppressed(MopVersion),
    /// DEC protocol without a handler
    UnsupportedType,
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SelfTraffic => write!(f, "own transmission"),
            Self::ForeignProtocol => write!(f, "foreign protocol"),
            Self::Suppressed(version) => write!(f, "MOP {version} suppressed"),
            Self::UnsupportedType => write!(f, "unsupported MOP type"),
        }
    }
}

/// Decides whether and how to act on `frame` received on `iface`.
///
/// Checks run in a fixed order: self-traffic, family, suppression, type.
pub fn classify(iface: &Interface, frame: &Frame) -> Action {
    if frame.source == iface.hardware_address() {
        return Action::Ignore(IgnoreReason::SelfTraffic);
    }

    if !frame.protocol.is_in_family() {
        return Action::Ignore(IgnoreReason::ForeignProtocol);
    }

    if iface.suppression().suppresses(frame.protocol) {
        if let Some(version) = frame.protocol.mop_version() {
            return Action::Ignore(IgnoreReason::Suppressed(version));
        }
    }

    match frame.protocol {
        ProtocolType::DumpLoad => Action::DumpLoad,
        ProtocolType::RemoteConsole => Action::RemoteConsole,
        ProtocolType::Other(_) => Action::Ignore(IgnoreReason::UnsupportedType),
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Processes frames of one MOP protocol type.
///
/// Handlers are called from the dispatch task and must not block for long.
pub trait ProtocolHandler: Send + Sync {
    fn handle(&self, iface: &Interface, frame: &Frame);
}

/// Dump/load handler: logs requests against the load-image directory.
#[derive(Debug, Clone)]
pub struct DumpLoadHandler {
    mop_dir: PathBuf,
}

impl DumpLoadHandler {
    pub fn new(mop_dir: impl Into<PathBuf>) -> Self {
        Self {
            mop_dir: mop_dir.into(),
        }
    }

    pub fn mop_dir(&self) -> &std::path::Path {
        &self.mop_dir
    }
}

impl ProtocolHandler for DumpLoadHandler {
    fn handle(&self, iface: &Interface, frame: &Frame) {
        info!(
            interface = %iface.name(),
            source = %frame.source,
            destination = %frame.destination,
            framing = ?frame.framing,
            payload_len = frame.payload.len(),
            mop_dir = %self.mop_dir.display(),
            "MOP dump/load message"
        );
    }
}

/// Remote-console handler: logs console traffic.
#[derive(Debug, Clone, Default)]
pub struct RemoteConsoleHandler;

impl ProtocolHandler for RemoteConsoleHandler {
    fn handle(&self, iface: &Interface, frame: &Frame) {
        info!(
            interface = %iface.name(),
            source = %frame.source,
            destination = %frame.destination,
            framing = ?frame.framing,
            payload_len = frame.payload.len(),
            "MOP remote console message"
        );
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Classifier plus one handler per dispatch target.
///
/// Holds no mutable state; one dispatcher can serve every interface.
#[derive(Clone)]
pub struct FrameDispatcher {
    dump_load: Arc<dyn ProtocolHandler>,
    remote_console: Arc<dyn ProtocolHandler>,
}

impl FrameDispatcher {
    pub fn new(
        dump_load: Arc<dyn ProtocolHandler>,
        remote_console: Arc<dyn ProtocolHandler>,
    ) -> Self {
        Self {
            dump_load,
            remote_console,
        }
    }

    /// Dispatcher with the built-in logging handlers.
    pub fn with_default_handlers(mop_dir: impl Into<PathBuf>) -> Self {
        Self::new(
            Arc::new(DumpLoadHandler::new(mop_dir)),
            Arc::new(RemoteConsoleHandler),
        )
    }

    /// Classifies `frame` and runs the matching handler.
    ///
    /// Returns the action taken.
    pub fn dispatch(&self, iface: &Interface, frame: &Frame) -> Action {
        let action = classify(iface, frame);
        match action {
            Action::DumpLoad => self.dump_load.handle(iface, frame),
            Action::RemoteConsole => self.remote_console.handle(iface, frame),
            Action::Ignore(IgnoreReason::Suppressed(version)) => {
                debug!(
                    interface = %iface.name(),
                    source = %frame.source,
                    version = %version,
                    "Ignoring suppressed MOP message"
                );
            }
            Action::Ignore(reason) => {
                trace!(
                    interface = %iface.name(),
                    protocol = %frame.protocol,
                    reason = %reason,
                    "Ignoring frame"
                );
            }
        }
        action
    }
}

impl fmt::Debug for FrameDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameDispatcher").finish_non_exhaustive()
    }
}
