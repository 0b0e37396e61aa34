pub mod attributes;
pub mod capability;
pub mod channel;
pub mod config;
pub mod error;
pub mod handle_table;
pub mod hydration;
pub mod offscreen;
pub mod operation;
pub mod protocol;
pub mod replay;
pub mod snapshot;
pub mod worklet;

use crate::protocol::{event_envelope, reader_loop, ready_envelope, writer_loop};
use serde_json::Value;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::thread;
use tracing::{debug, info, warn};

pub use crate::capability::{Capability, CapabilityGate, SdkVersion, SdkVersionGate, ThreadRole};
pub use crate::config::RuntimeConfig;
pub use crate::error::{
    CallError, CapabilityError, ChannelError, ProtocolError, RuntimeError, SnapshotError, TreeError,
};
pub use crate::handle_table::{Handle, HandleTable};
pub use crate::operation::{ElementOperation, OperationBatch};
pub use crate::protocol::{
    BACKGROUND_TO_MAIN_CAP, BackgroundEnvelope, MAIN_TO_BACKGROUND_CAP, MainEnvelope,
};
pub use crate::replay::{ElementTree, NullSink, RecordingSink, RendererSink, ROOT_HANDLE};
pub use serde_json;

use crate::worklet::WorkletRefMap;

/// Replica-side state rebuilt from the batch stream.
#[derive(Debug, Default)]
pub struct HostState {
    pub tree: ElementTree,
    pub worklet_refs: WorkletRefMap,
    pub last_rev: Option<u64>,
    pub last_ack: Option<u64>,
}

/// Sending half of the host's outbound queue.
///
/// Control envelopes (ack, resync, ready) are never dropped; events are
/// dropped when the queue is full.
#[derive(Clone)]
pub struct Outbound {
    tx: SyncSender<MainEnvelope>,
    sid: String,
    queue_capacity: usize,
    dropped_events: Arc<AtomicU64>,
}

impl Outbound {
    pub fn new(tx: SyncSender<MainEnvelope>, sid: impl Into<String>, queue_capacity: usize) -> Self {
        Self {
            tx,
            sid: sid.into(),
            queue_capacity,
            dropped_events: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Forwards a renderer event to the background thread.
    pub fn send_event(&self, uid: Handle, event_type: &str, bubbles: bool, detail: Value) {
        let envelope = event_envelope(self.sid.clone(), uid, event_type, bubbles, detail);

        match self.tx.try_send(envelope) {
            Ok(()) => {}
            Err(TrySendError::Full(_envelope)) => {
                let dropped = self.dropped_events.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped.is_power_of_two() {
                    warn!(
                        cap = self.queue_capacity,
                        dropped, "outbound queue full; dropping events"
                    );
                }
            }
            Err(TrySendError::Disconnected(_envelope)) => {
                warn!(event_type, uid, "failed to queue event");
            }
        }
    }

    fn control(&self, envelope: MainEnvelope) {
        match self.tx.try_send(envelope) {
            Ok(()) => {}
            Err(TrySendError::Full(envelope)) => {
                debug!(
                    cap = self.queue_capacity,
                    "outbound queue full; waiting to enqueue control envelope"
                );
                let tx = self.tx.clone();
                thread::spawn(move || {
                    if tx.send(envelope).is_err() {
                        warn!("failed to enqueue control envelope");
                    }
                });
            }
            Err(TrySendError::Disconnected(_envelope)) => {
                warn!("failed to enqueue control envelope");
            }
        }
    }
}

/// Applies background envelopes to the replica and answers with acks and
/// resync requests.
pub struct Host<S: RendererSink> {
    state: HostState,
    sink: S,
    outbound: Outbound,
    resync_pending: bool,
}

impl<S: RendererSink> Host<S> {
    pub fn new(sink: S, outbound: Outbound) -> Self {
        Self {
            state: HostState::default(),
            sink,
            outbound,
            resync_pending: false,
        }
    }

    pub fn state(&self) -> &HostState {
        &self.state
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn resync_pending(&self) -> bool {
        self.resync_pending
    }

    pub fn handle(&mut self, envelope: io::Result<BackgroundEnvelope>) {
        let envelope = match envelope {
            Ok(envelope) => envelope,
            Err(err) => {
                self.request_resync(&format!("failed to decode envelope: {err}"));
                return;
            }
        };

        match envelope {
            BackgroundEnvelope::Batch {
                sid,
                rev,
                ack,
                ops,
                worklet_ref_init,
            } => {
                if sid != self.outbound.sid {
                    self.request_resync("sid mismatch for batch envelope");
                    return;
                }

                if let Err(err) = validate_batch_rev(&self.state, rev) {
                    self.request_resync(&format!("invalid batch revision: {err}"));
                    return;
                }

                self.state
                    .worklet_refs
                    .update_init_value_changes(&worklet_ref_init);

                if let Err(err) = self.state.tree.apply_all(Some(rev), &ops, &mut self.sink) {
                    mark_applied_rev(&mut self.state, rev);
                    self.request_resync(&format!("batch apply failed: {err}"));
                    return;
                }

                mark_applied_rev(&mut self.state, rev);
                mark_applied_ack(&mut self.state, ack);
                self.resync_pending = false;
                self.outbound.control(MainEnvelope::Ack {
                    sid: self.outbound.sid.clone(),
                    rev,
                });
            }
            BackgroundEnvelope::Reset { sid } => {
                if sid != self.outbound.sid {
                    self.request_resync("sid mismatch for reset envelope");
                    return;
                }
                debug!(last_rev = ?self.state.last_rev, "resetting replica");
                reset_for_resync(&mut self.state);
            }
            BackgroundEnvelope::Error {
                sid,
                rev,
                code,
                message,
            } => {
                warn!(%sid, ?rev, %code, %message, "background reported error");
                if should_resync_for_error(&code) {
                    self.request_resync(&format!(
                        "background requested resync via error code '{code}'"
                    ));
                }
            }
        }
    }

    fn request_resync(&mut self, reason: &str) {
        if std::mem::replace(&mut self.resync_pending, true) {
            return;
        }

        warn!(last_rev = ?self.state.last_rev, "{reason}; requesting resync");
        self.outbound.control(MainEnvelope::Resync {
            sid: self.outbound.sid.clone(),
            last_rev: self.state.last_rev,
            reason: reason.to_string(),
        });
    }
}

/// Runs the host until `input` reaches EOF.
///
/// Frames are read on a dedicated thread and applied in arrival order on the
/// calling thread. `make_sink` receives the outbound queue so the renderer can
/// report events.
pub fn run<R, W, S, F>(
    config: &RuntimeConfig,
    mut input: R,
    mut output: W,
    make_sink: F,
) -> Result<(), Box<dyn std::error::Error>>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
    S: RendererSink,
    F: FnOnce(Outbound) -> S,
{
    let (tx, rx) = mpsc::sync_channel(config.outbound_queue_cap);
    let outbound = Outbound::new(tx.clone(), config.sid.clone(), config.outbound_queue_cap);
    let writer_handle = thread::spawn(move || writer_loop(&mut output, rx));

    tx.send(ready_envelope(config.sid.clone()))
        .map_err(|_| "failed to queue ready envelope")?;
    info!(sid = %config.sid, version = %config.sdk_version, "host ready");

    let (inbound_tx, inbound_rx) = mpsc::channel();
    let reader_handle = thread::spawn(move || {
        let read_result = reader_loop(&mut input, |envelope| {
            if inbound_tx.send(envelope).is_err() {
                debug!("apply loop gone; dropping envelope");
            }
        });

        if let Err(err) = &read_result {
            warn!("reader loop terminated with error: {err}");
        }

        read_result
    });

    let mut host = Host::new(make_sink(outbound.clone()), outbound);
    for envelope in inbound_rx {
        host.handle(envelope);
    }
    info!(last_rev = ?host.state().last_rev, "input closed; shutting down");

    // Every sender must be gone before the writer can drain and exit.
    drop(host);
    drop(tx);

    match reader_handle.join() {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!("reader thread returned error: {err}"),
        Err(err) => warn!("reader thread join failed: {err:?}"),
    }

    // Drains whatever is still queued, including parked control envelopes.
    match writer_handle.join() {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!("writer thread returned error: {err}"),
        Err(err) => warn!("writer thread join failed: {err:?}"),
    }

    Ok(())
}

/// Accepts only `last_rev + 1`; the first batch, or the first after a reset,
/// must be rev 1.
pub fn validate_batch_rev(state: &HostState, rev: u64) -> Result<(), String> {
    let expected = state.last_rev.map_or(1, |last_rev| last_rev.wrapping_add(1));
    if rev == expected {
        Ok(())
    } else {
        Err(format!("batch revision mismatch: rev={rev}, expected={expected}"))
    }
}

pub fn mark_applied_rev(state: &mut HostState, rev: u64) {
    state.last_rev = Some(rev);
}

pub fn mark_applied_ack(state: &mut HostState, ack: Option<u64>) {
    if let Some(next_ack) = ack {
        state.last_ack = Some(state.last_ack.map_or(next_ack, |current| current.max(next_ack)));
    }
}

pub fn reset_for_resync(state: &mut HostState) {
    *state = HostState::default();
}

fn should_resync_for_error(code: &str) -> bool {
    matches!(
        code,
        "decode_error"
            | "frame_too_large"
            | "invalid_envelope"
            | "resync_required"
            | "rev_mismatch"
            | "patch_apply_error"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode_frame, encode_frame};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::io::Cursor;
    use std::sync::Mutex;
    use std::sync::mpsc::Receiver;

    fn host(cap: usize) -> (Host<RecordingSink>, Receiver<MainEnvelope>) {
        let (tx, rx) = mpsc::sync_channel(cap);
        (Host::new(RecordingSink::default(), Outbound::new(tx, "S1", cap)), rx)
    }

    fn batch(rev: u64, ops: Vec<ElementOperation>) -> io::Result<BackgroundEnvelope> {
        Ok(BackgroundEnvelope::Batch {
            sid: "S1".into(),
            rev,
            ack: None,
            ops,
            worklet_ref_init: Vec::new(),
        })
    }

    fn create(uid: Handle) -> Vec<ElementOperation> {
        vec![
            ElementOperation::Create {
                uid,
                tag: "view".into(),
            },
            ElementOperation::Append {
                uid: ROOT_HANDLE,
                cid: vec![uid],
            },
        ]
    }

    #[test]
    fn send_event_drops_when_queue_is_full() {
        let (tx, rx) = mpsc::sync_channel(1);
        let outbound = Outbound::new(tx.clone(), "S1", 1);

        tx.send(ready_envelope("S1".to_string()))
            .expect("seed queue with one envelope");
        outbound.send_event(3, "tap", true, json!({}));

        assert_eq!(outbound.dropped_events(), 1);
        match rx.try_recv().expect("seed envelope remains queued") {
            MainEnvelope::Ready { sid, .. } => assert_eq!(sid, "S1"),
            other => panic!("expected ready envelope, got {other:?}"),
        }
    }

    #[test]
    fn resync_error_codes_are_explicit() {
        assert!(should_resync_for_error("decode_error"));
        assert!(should_resync_for_error("frame_too_large"));
        assert!(should_resync_for_error("invalid_envelope"));
        assert!(should_resync_for_error("resync_required"));
        assert!(should_resync_for_error("rev_mismatch"));
        assert!(!should_resync_for_error("validation_warning"));
    }

    #[test]
    fn batch_rev_starts_at_one_and_advances_by_one() {
        let mut state = HostState::default();
        assert!(validate_batch_rev(&state, 1).is_ok());
        assert!(validate_batch_rev(&state, 2).is_err());
        mark_applied_rev(&mut state, 1);
        assert!(validate_batch_rev(&state, 2).is_ok());
    }

    #[test]
    fn batch_rev_rejects_stale_or_skipped_revisions() {
        let mut state = HostState::default();
        mark_applied_rev(&mut state, 5);
        assert!(validate_batch_rev(&state, 5).is_err());
        assert!(validate_batch_rev(&state, 4).is_err());
        assert!(validate_batch_rev(&state, 7).is_err());
    }

    #[test]
    fn ack_tracking_uses_monotonic_high_watermark() {
        let mut state = HostState::default();
        mark_applied_ack(&mut state, None);
        assert_eq!(state.last_ack, None);

        mark_applied_ack(&mut state, Some(5));
        mark_applied_ack(&mut state, Some(3));
        assert_eq!(state.last_ack, Some(5));

        mark_applied_ack(&mut state, Some(8));
        assert_eq!(state.last_ack, Some(8));
    }

    #[test]
    fn applied_batches_are_forwarded_and_acked() {
        let (mut host, rx) = host(8);
        host.handle(batch(1, create(1)));
        host.handle(batch(2, create(2)));

        assert_eq!(host.state().tree.children(ROOT_HANDLE), &[1, 2]);
        assert_eq!(host.sink().applied.len(), 4);
        let acks: Vec<MainEnvelope> = rx.try_iter().collect();
        assert_eq!(
            acks,
            vec![
                MainEnvelope::Ack {
                    sid: "S1".into(),
                    rev: 1
                },
                MainEnvelope::Ack {
                    sid: "S1".into(),
                    rev: 2
                },
            ]
        );
    }

    #[test]
    fn resync_is_requested_once_until_a_batch_applies() {
        let (mut host, rx) = host(8);
        host.handle(batch(1, create(1)));
        host.handle(batch(3, create(2)));
        host.handle(batch(4, create(2)));
        assert!(host.resync_pending());

        let sent: Vec<MainEnvelope> = rx.try_iter().collect();
        assert_eq!(sent.len(), 2);
        match &sent[1] {
            MainEnvelope::Resync { last_rev, .. } => assert_eq!(*last_rev, Some(1)),
            other => panic!("expected resync, got {other:?}"),
        }

        host.handle(batch(2, create(2)));
        assert!(!host.resync_pending());
    }

    #[test]
    fn failing_op_keeps_prefix_and_requests_resync() {
        let (mut host, rx) = host(8);
        let mut ops = create(1);
        ops.push(ElementOperation::SetAttribute {
            uid: 42,
            key: "id".into(),
            value: "x".into(),
        });
        host.handle(batch(1, ops));

        assert!(host.state().tree.contains(1));
        assert!(matches!(
            rx.try_recv(),
            Ok(MainEnvelope::Resync { reason, .. }) if reason.contains("op #2")
        ));

        host.handle(batch(2, create(2)));
        assert!(host.state().tree.contains(2));
    }

    #[test]
    fn reset_restarts_the_revision_sequence() {
        let (mut host, _rx) = host(8);
        host.handle(batch(1, create(1)));
        host.handle(Ok(BackgroundEnvelope::Reset { sid: "S1".into() }));
        assert!(!host.state().tree.contains(1));

        host.handle(batch(1, create(1)));
        assert_eq!(host.state().last_rev, Some(1));
        assert!(!host.resync_pending());
    }

    #[test]
    fn worklet_ref_init_values_reach_the_ref_map() {
        let (mut host, _rx) = host(8);
        host.handle(Ok(BackgroundEnvelope::Batch {
            sid: "S1".into(),
            rev: 1,
            ack: Some(4),
            ops: Vec::new(),
            worklet_ref_init: vec![(7, json!(0))],
        }));

        assert_eq!(host.state().last_ack, Some(4));
        assert_eq!(
            host.state().worklet_refs.get(7).map(|r| r.current.clone()),
            Some(json!(0))
        );
    }

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().expect("buffer lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn split_frames(mut bytes: &[u8]) -> Vec<MainEnvelope> {
        let mut out = Vec::new();
        while bytes.len() >= 4 {
            let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
            let (frame, rest) = bytes.split_at(4 + len);
            out.push(decode_frame(frame, MAIN_TO_BACKGROUND_CAP).expect("decode"));
            bytes = rest;
        }
        out
    }

    #[test]
    fn run_replays_stdin_frames_and_acks_on_stdout() {
        let mut input = Vec::new();
        for envelope in [batch(1, create(1)), batch(2, create(2))] {
            let envelope = envelope.expect("envelope");
            input.extend(encode_frame(&envelope, BACKGROUND_TO_MAIN_CAP).expect("encode"));
        }
        let output = SharedBuffer::default();

        run(
            &RuntimeConfig::default(),
            Cursor::new(input),
            output.clone(),
            |_| NullSink,
        )
        .expect("run");

        let sent = split_frames(&output.0.lock().expect("buffer lock"));
        assert_eq!(sent.len(), 3);
        assert!(matches!(&sent[0], MainEnvelope::Ready { sid, .. } if sid == "S1"));
        assert_eq!(
            sent[2],
            MainEnvelope::Ack {
                sid: "S1".into(),
                rev: 2
            }
        );
    }
}
