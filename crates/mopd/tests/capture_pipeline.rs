//! Integration tests for the capture → decode → classify → dispatch pipeline.
//!
//! Scripted frame sources stand in for raw sockets, so these tests run
//! without privileges while exercising the real capture threads, channel,
//! and dispatch loop.
//!
//! Tests CAN use `.unwrap()` and `.expect()` - this is allowed.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mop_core::{Frame, HardwareAddr, Interface, ProtocolType, Suppression};
use mopd::capture::interfaces::SysfsNet;
use mopd::capture::{
    open_sources, run_dispatch_loop, CaptureEngine, CaptureError, DispatchStats, FrameSource,
    FRAME_BUFFER,
};
use mopd::classifier::{FrameDispatcher, ProtocolHandler};
use mopd::config::InterfaceSelection;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Constants
// ============================================================================

/// Upper bound for a scripted pipeline run
const PIPELINE_TIMEOUT: Duration = Duration::from_secs(5);

const OWN_ETH0: HardwareAddr = HardwareAddr::new([0x08, 0x00, 0x2b, 0x00, 0x00, 0x01]);
const OWN_ETH1: HardwareAddr = HardwareAddr::new([0x08, 0x00, 0x2b, 0x00, 0x00, 0x02]);
const PEER: HardwareAddr = HardwareAddr::new([0x08, 0x00, 0x2b, 0x12, 0x34, 0x56]);
const MOP_DL_MCAST: HardwareAddr = HardwareAddr::new([0xab, 0x00, 0x00, 0x01, 0x00, 0x00]);

// ============================================================================
// Test Helpers
// ============================================================================

/// Replays a fixed list of frames, then reports end of stream.
struct ScriptedSource {
    frames: VecDeque<Vec<u8>>,
}

impl ScriptedSource {
    fn new(frames: Vec<Vec<u8>>) -> Self {
        Self {
            frames: frames.into(),
        }
    }
}

impl FrameSource for ScriptedSource {
    fn recv_frame(&mut self, buf: &mut [u8]) -> Result<Option<usize>, CaptureError> {
        match self.frames.pop_front() {
            Some(frame) => {
                buf[..frame.len()].copy_from_slice(&frame);
                Ok(Some(frame.len()))
            }
            None => Err(CaptureError::SourceClosed),
        }
    }
}

/// Records which interface and source each handled frame came from.
#[derive(Default)]
struct RecordingHandler {
    seen: Mutex<Vec<(String, HardwareAddr)>>,
}

impl RecordingHandler {
    fn seen(&self) -> Vec<(String, HardwareAddr)> {
        let mut seen = self.seen.lock().unwrap().clone();
        seen.sort();
        seen
    }
}

impl ProtocolHandler for RecordingHandler {
    fn handle(&self, iface: &Interface, frame: &Frame) {
        self.seen
            .lock()
            .unwrap()
            .push((iface.name().to_string(), frame.source));
    }
}

fn ethernet_ii(src: HardwareAddr, ethertype: u16) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&MOP_DL_MCAST.octets());
    frame.extend_from_slice(&src.octets());
    frame.extend_from_slice(&ethertype.to_be_bytes());
    frame.extend_from_slice(&[0x08, 0x00, 0x00, 0x00]);
    frame
}

fn ieee8023_snap(src: HardwareAddr, pid: u16) -> Vec<u8> {
    let body = [0xaa, 0xaa, 0x03, 0x08, 0x00, 0x2b];
    let payload = [0x08, 0x00];
    let len = (body.len() + 2 + payload.len()) as u16;

    let mut frame = Vec::new();
    frame.extend_from_slice(&MOP_DL_MCAST.octets());
    frame.extend_from_slice(&src.octets());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    frame.extend_from_slice(&pid.to_be_bytes());
    frame.extend_from_slice(&payload);
    frame
}

fn iface(name: &str, address: HardwareAddr, suppression: Suppression) -> Interface {
    Interface::new(name, address, suppression).unwrap()
}

/// Runs scripted sources through the full pipeline until they are exhausted.
async fn run_pipeline(
    sources: Vec<(Interface, ScriptedSource)>,
    dispatcher: FrameDispatcher,
) -> DispatchStats {
    let cancel_token = CancellationToken::new();
    let (frames_tx, frames_rx) = mpsc::channel(FRAME_BUFFER);
    let engine = CaptureEngine::start(sources, frames_tx, cancel_token.clone()).unwrap();

    let stats = timeout(
        PIPELINE_TIMEOUT,
        run_dispatch_loop(frames_rx, dispatcher, cancel_token),
    )
    .await
    .expect("pipeline drains scripted sources");

    engine.stop();
    stats
}

// ============================================================================
// Pipeline
// ============================================================================

#[tokio::test]
async fn test_pipeline_classifies_and_dispatches() {
    let dump_load = Arc::new(RecordingHandler::default());
    let console = Arc::new(RecordingHandler::default());
    let dispatcher = FrameDispatcher::new(dump_load.clone(), console.clone());

    let eth0 = iface("eth0", OWN_ETH0, Suppression::V4);
    let script = vec![
        ethernet_ii(PEER, 0x6001),      // dispatched: dump/load
        ethernet_ii(PEER, 0x6002),      // V4 suppressed on eth0
        ethernet_ii(OWN_ETH0, 0x6001),  // own transmission
        ethernet_ii(PEER, 0x0800),      // IPv4
        vec![0xab, 0x00, 0x00, 0x01],   // truncated
        ieee8023_snap(PEER, 0x6001),    // dispatched: dump/load over SNAP
    ];

    let stats = run_pipeline(vec![(eth0, ScriptedSource::new(script))], dispatcher).await;

    assert_eq!(
        stats,
        DispatchStats {
            received: 6,
            malformed: 1,
            dispatched: 2,
            ignored: 3,
        }
    );
    assert_eq!(
        dump_load.seen(),
        vec![("eth0".to_string(), PEER), ("eth0".to_string(), PEER)]
    );
    assert!(console.seen().is_empty());
}

#[tokio::test]
async fn test_suppression_is_per_interface() {
    let dump_load = Arc::new(RecordingHandler::default());
    let console = Arc::new(RecordingHandler::default());
    let dispatcher = FrameDispatcher::new(dump_load.clone(), console.clone());

    let eth0 = iface("eth0", OWN_ETH0, Suppression::V3);
    let eth1 = iface("eth1", OWN_ETH1, Suppression::V4);
    let traffic = || {
        vec![
            ethernet_ii(PEER, 0x6001),
            ethernet_ii(PEER, 0x6002),
        ]
    };

    let stats = run_pipeline(
        vec![
            (eth0, ScriptedSource::new(traffic())),
            (eth1, ScriptedSource::new(traffic())),
        ],
        dispatcher,
    )
    .await;

    assert_eq!(stats.received, 4);
    assert_eq!(stats.dispatched, 2);
    assert_eq!(dump_load.seen(), vec![("eth1".to_string(), PEER)]);
    assert_eq!(console.seen(), vec![("eth0".to_string(), PEER)]);
}

#[tokio::test]
async fn test_own_address_differs_per_interface() {
    let dump_load = Arc::new(RecordingHandler::default());
    let console = Arc::new(RecordingHandler::default());
    let dispatcher = FrameDispatcher::new(dump_load.clone(), console.clone());

    // eth1's address is foreign from eth0's point of view, and vice versa
    let eth0 = iface("eth0", OWN_ETH0, Suppression::None);
    let eth1 = iface("eth1", OWN_ETH1, Suppression::None);

    run_pipeline(
        vec![
            (eth0, ScriptedSource::new(vec![ethernet_ii(OWN_ETH1, 0x6002)])),
            (eth1, ScriptedSource::new(vec![ethernet_ii(OWN_ETH1, 0x6002)])),
        ],
        dispatcher,
    )
    .await;

    assert_eq!(console.seen(), vec![("eth0".to_string(), OWN_ETH1)]);
    assert!(dump_load.seen().is_empty());
}

#[tokio::test]
async fn test_cancellation_stops_idle_pipeline() {
    /// A source that never produces anything.
    struct IdleSource;

    impl FrameSource for IdleSource {
        fn recv_frame(&mut self, _buf: &mut [u8]) -> Result<Option<usize>, CaptureError> {
            std::thread::sleep(Duration::from_millis(10));
            Ok(None)
        }
    }

    let cancel_token = CancellationToken::new();
    let (frames_tx, frames_rx) = mpsc::channel(FRAME_BUFFER);
    let engine = CaptureEngine::start(
        vec![(iface("eth0", OWN_ETH0, Suppression::None), IdleSource)],
        frames_tx,
        cancel_token.clone(),
    )
    .unwrap();
    assert_eq!(engine.thread_count(), 1);

    let dispatcher = FrameDispatcher::with_default_handlers("/usr/local/mop");
    let dispatch = tokio::spawn(run_dispatch_loop(frames_rx, dispatcher, cancel_token.clone()));

    cancel_token.cancel();
    let stats = timeout(PIPELINE_TIMEOUT, dispatch)
        .await
        .expect("dispatch loop stops on cancel")
        .unwrap();
    assert_eq!(stats, DispatchStats::default());

    engine.stop();
}

// ============================================================================
// Interface Resolution
// ============================================================================

#[tokio::test]
async fn test_resolved_interfaces_feed_the_pipeline() {
    let sysfs_dir = tempfile::tempdir().unwrap();
    for (name, address) in [("eth0", "08:00:2b:00:00:01"), ("lo", "00:00:00:00:00:00")] {
        let dir = sysfs_dir.path().join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("address"), format!("{address}\n")).unwrap();
    }

    let interfaces = SysfsNet::new(sysfs_dir.path())
        .resolve(&InterfaceSelection::All, Suppression::None)
        .unwrap();
    assert_eq!(interfaces.len(), 1);
    assert_eq!(interfaces[0].hardware_address(), OWN_ETH0);

    let sources = open_sources(interfaces, |_| {
        Ok(ScriptedSource::new(vec![
            ethernet_ii(OWN_ETH0, 0x6001),
            ethernet_ii(PEER, 0x6001),
        ]))
    })
    .unwrap();

    let dump_load = Arc::new(RecordingHandler::default());
    let dispatcher = FrameDispatcher::new(dump_load.clone(), Arc::new(RecordingHandler::default()));
    let stats = run_pipeline(sources, dispatcher).await;

    assert_eq!(stats.dispatched, 1);
    assert_eq!(stats.ignored, 1);
    assert_eq!(dump_load.seen(), vec![("eth0".to_string(), PEER)]);
}

#[test]
fn test_no_usable_interfaces_is_an_error() {
    let result = open_sources(
        vec![iface("eth0", OWN_ETH0, Suppression::None)],
        |i| -> Result<ScriptedSource, CaptureError> {
            Err(CaptureError::Open {
                interface: i.name().to_string(),
                error: "Operation not permitted".to_string(),
            })
        },
    );
    assert!(matches!(
        result,
        Err(CaptureError::NoUsableInterfaces { requested: 1 })
    ));
}

#[test]
fn test_protocol_codes_cover_mop_family() {
    assert!(ProtocolType::from_code(0x6001).is_in_family());
    assert!(ProtocolType::from_code(0x6009).is_in_family());
    assert!(!ProtocolType::from_code(0x600a).is_in_family());
}
