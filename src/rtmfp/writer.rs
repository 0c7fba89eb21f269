// src/rtmfp/writer.rs - Per-flow reliable writer
//
// Drives one outbound flow: stages messages through the shared queue,
// advances on acknowledgements, repeats on reported gaps or timer expiry
// with a multiplicative backoff (x sqrt(2), capped at 10 s), and resets
// wholesale when the remote signals an unrecoverable state.

use crate::amf::{AmfWriter, MessageType};
use crate::rtmfp::sender::{FlowMessage, FlowQueue, RtmfpSender};
use bytes::Bytes;
use log::{debug, trace};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Repeat delay ceiling; beyond the growth threshold the delay pins here.
const REPEAT_DELAY_MAX_MS: u32 = 10_000;
/// Last delay that still grows multiplicatively (7072 * sqrt(2) > 10000).
const REPEAT_DELAY_GROW_LIMIT_MS: u32 = 7072;

/// Where a writer's sends go: id allocation and sender submission are owned
/// by the session output (the reactor side of an RTMFP session).
pub trait RtmfpOutput: Send + Sync {
    /// Current retransmission timeout estimate in milliseconds.
    fn rto(&self) -> u32;
    /// Allocate a fresh writer id.
    fn new_writer_id(&self) -> u64;
    /// Retire `old_id` and allocate its replacement.
    fn reset_writer(&self, old_id: u64) -> u64;
    /// Submit a send action for execution.
    fn send(&self, sender: RtmfpSender);
}

/// One message under construction in the pending batch.
struct Draft {
    reliable: bool,
    end: bool,
    writer: AmfWriter,
}

pub struct RtmfpWriter {
    output: Arc<dyn RtmfpOutput>,
    queue: Arc<Mutex<FlowQueue>>,
    stage_ack: u64,
    lost_count: u32,
    /// 0 disarms the repeat timer.
    repeat_delay: u32,
    repeat_time: Instant,
    /// Draft batch not yet handed to the reactor.
    pending: Option<Vec<Draft>>,
    closed: bool,
    /// Swallows writes once closed (the null sink).
    discard: AmfWriter,
}

impl RtmfpWriter {
    pub fn new(flow_id: u64, signature: Bytes, output: Arc<dyn RtmfpOutput>) -> RtmfpWriter {
        let id = output.new_writer_id();
        RtmfpWriter {
            output,
            queue: Arc::new(Mutex::new(FlowQueue::new(id, flow_id, signature))),
            stage_ack: 0,
            lost_count: 0,
            repeat_delay: 0,
            repeat_time: Instant::now(),
            pending: None,
            closed: false,
            discard: AmfWriter::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.queue.lock().unwrap().id
    }

    pub fn stage_ack(&self) -> u64 {
        self.stage_ack
    }

    pub fn repeat_delay(&self) -> u32 {
        self.repeat_delay
    }

    pub fn closed(&self) -> bool {
        self.closed
    }

    pub fn queue(&self) -> &Arc<Mutex<FlowQueue>> {
        &self.queue
    }

    pub fn queueing_stages(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Handle an acknowledgement `(stageAck, lostCount)` from the peer.
    ///
    /// Progress advances the window, resets the repeat timer to the RTO and
    /// trims the queue. Without progress, a *widening* gap report triggers an
    /// immediate repeat of the missing prefix; anything else is a duplicate.
    pub fn acquit(&mut self, stage_ack: u64, lost_count: u32) {
        trace!(
            "ack {stage_ack} on writer {} (lostCount={lost_count})",
            self.id()
        );
        // must continue to be consumed even when the writer is closed
        if stage_ack > self.stage_ack {
            self.stage_ack = stage_ack;
            self.lost_count = 0;
            // reset repeat cadence on progression
            self.repeat_delay = self.output.rto();
            self.repeat_time = Instant::now();
            self.output.send(RtmfpSender::Acquiter {
                queue: self.queue.clone(),
                stage_ack,
            });
            return;
        }
        if lost_count == 0 {
            debug!("ack {stage_ack} obsolete on writer {}", self.id());
            return;
        }
        if lost_count > self.lost_count {
            // the gap widened; repeat just the missing prefix once and let
            // the timer drive anything further (keeps congestion in check)
            self.lost_count = lost_count;
            self.repeat_messages(lost_count);
        }
    }

    /// Repeat path. `lost_count > 0` is the explicit-loss fast path; 0 is the
    /// timer-driven path, skipped while a send is in flight.
    pub fn repeat_messages(&mut self, lost_count: u32) {
        if lost_count > 0 {
            // something is known lost: repeat without waiting for the timer
            self.output.send(RtmfpSender::Repeater {
                queue: self.queue.clone(),
                count: lost_count.min(0xFF) as u8,
            });
            return;
        }
        {
            let queue = self.queue.lock().unwrap();
            if queue.sending {
                return; // wait for the in-flight send before repeating
            }
            if queue.is_empty() {
                self.repeat_delay = 0; // nothing to repeat, stop the timer
                return;
            }
        }
        if self.repeat_time.elapsed() < Duration::from_millis(u64::from(self.repeat_delay)) {
            return;
        }
        self.repeat_time = Instant::now();
        self.repeat_delay = if self.repeat_delay < REPEAT_DELAY_GROW_LIMIT_MS {
            (f64::from(self.repeat_delay) * std::f64::consts::SQRT_2) as u32
        } else {
            REPEAT_DELAY_MAX_MS
        };
        self.output.send(RtmfpSender::Repeater {
            queue: self.queue.clone(),
            count: 0,
        });
    }

    /// Reactor flush: piggyback a due repeat, then ship the pending batch.
    pub fn flushing(&mut self) {
        self.repeat_messages(0);
        let Some(drafts) = self.pending.take() else {
            return;
        };
        if self.repeat_delay == 0 {
            // first unacknowledged data arms the repeat timer
            self.repeat_delay = self.output.rto();
            self.repeat_time = Instant::now();
        }
        let messages = drafts
            .into_iter()
            .map(|draft| FlowMessage {
                reliable: draft.reliable,
                end: draft.end,
                payload: draft.writer.finish(),
            })
            .collect();
        self.queue.lock().unwrap().sending = true;
        self.output.send(RtmfpSender::Messenger {
            queue: self.queue.clone(),
            messages,
        });
    }

    /// Remote reported an unrecoverable state: retire the writer id and start
    /// over. Nothing queued is recoverable; only a close may follow.
    pub fn fail(&mut self) {
        self.stage_ack = 0;
        self.repeat_delay = 0;
        self.lost_count = 0;
        self.pending = None;
        let mut queue = self.queue.lock().unwrap();
        let id = self.output.reset_writer(queue.id);
        *queue = FlowQueue::new(id, queue.flow_id, queue.signature.clone());
    }

    /// Close the flow. If it ever carried data (acknowledged or armed), a
    /// terminal message-end frame is appended so a late receiver still
    /// observes the close.
    pub fn close(&mut self, code: i32, reason: &str) {
        if self.closed {
            return;
        }
        if !reason.is_empty() {
            debug!("writer {} closing ({code}): {reason}", self.id());
        }
        if code >= 0 && (self.stage_ack > 0 || self.repeat_delay > 0) {
            self.pending.get_or_insert_with(Vec::new).push(Draft {
                reliable: true,
                end: true,
                writer: AmfWriter::new(),
            });
        }
        self.flushing();
        self.closed = true;
    }

    /// Start a new message in the pending batch and return its body writer.
    /// A closed writer hands back a sink that discards everything.
    pub fn new_message(&mut self, reliable: bool) -> &mut AmfWriter {
        if self.closed {
            self.discard.clear();
            return &mut self.discard;
        }
        let drafts = self.pending.get_or_insert_with(Vec::new);
        drafts.push(Draft {
            reliable,
            end: false,
            writer: AmfWriter::new(),
        });
        &mut drafts.last_mut().expect("just pushed").writer
    }

    /// Frame and append one protocol message body.
    pub fn write_message(
        &mut self,
        ty: MessageType,
        time: u32,
        payload: &[u8],
        reliable: bool,
    ) -> &mut AmfWriter {
        // only media carries a meaningful time; anything else could get
        // dropped by time-window checks on the receiver
        let time = if ty.is_media() { time } else { 0 };
        let writer = self.new_message(reliable);
        writer.write_u8(ty as u8).write_u32(time);
        if ty == MessageType::DataAmf3 {
            writer.write_u8(0);
        }
        writer.write_raw(payload);
        writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Records submitted senders instead of executing them.
    struct MockOutput {
        rto: u32,
        next_id: AtomicU64,
        sent: Mutex<Vec<String>>,
    }

    impl MockOutput {
        fn new(rto: u32) -> Arc<MockOutput> {
            Arc::new(MockOutput {
                rto,
                next_id: AtomicU64::new(1),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn log(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl RtmfpOutput for MockOutput {
        fn rto(&self) -> u32 {
            self.rto
        }

        fn new_writer_id(&self) -> u64 {
            self.next_id.fetch_add(1, Ordering::Relaxed)
        }

        fn reset_writer(&self, old_id: u64) -> u64 {
            let id = self.new_writer_id();
            assert_ne!(id, old_id);
            id
        }

        fn send(&self, sender: RtmfpSender) {
            let entry = match &sender {
                RtmfpSender::Messenger { messages, .. } => {
                    format!("messenger:{}", messages.len())
                }
                RtmfpSender::Repeater { count, .. } => format!("repeater:{count}"),
                RtmfpSender::Acquiter { stage_ack, .. } => format!("acquiter:{stage_ack}"),
            };
            // execute queue mutations so writer state and queue stay coupled
            match sender {
                RtmfpSender::Messenger { queue, messages } => {
                    let mut queue = queue.lock().unwrap();
                    for message in &messages {
                        queue.push_message(message);
                    }
                    queue.sending = false;
                }
                RtmfpSender::Acquiter { queue, stage_ack } => {
                    queue.lock().unwrap().trim(stage_ack);
                }
                RtmfpSender::Repeater { .. } => {}
            }
            self.sent.lock().unwrap().push(entry);
        }
    }

    fn writer_with(output: &Arc<MockOutput>) -> RtmfpWriter {
        let _ = env_logger::builder().is_test(true).try_init();
        RtmfpWriter::new(42, Bytes::from_static(b"sig"), output.clone())
    }

    fn stage_messages(writer: &mut RtmfpWriter, count: usize) {
        for index in 0..count {
            writer
                .new_message(true)
                .write_string(&format!("message-{index}"));
        }
        writer.flushing();
    }

    #[test]
    fn test_progress_resets_cadence_and_trims() {
        let output = MockOutput::new(200);
        let mut writer = writer_with(&output);
        stage_messages(&mut writer, 10);
        assert_eq!(writer.repeat_delay(), 200);

        writer.acquit(5, 0);
        assert_eq!(writer.stage_ack(), 5);
        assert_eq!(writer.repeat_delay(), 200);
        assert_eq!(writer.queueing_stages(), 5);
        assert!(output.log().contains(&"acquiter:5".to_string()));
    }

    #[test]
    fn test_stage_ack_is_monotone() {
        let output = MockOutput::new(200);
        let mut writer = writer_with(&output);
        stage_messages(&mut writer, 10);

        writer.acquit(6, 0);
        let submissions = output.log().len();
        // obsolete ack: observable only in logs
        writer.acquit(4, 0);
        assert_eq!(writer.stage_ack(), 6);
        assert_eq!(output.log().len(), submissions, "no sender for a stale ack");
    }

    #[test]
    fn test_widening_gap_triggers_repeats() {
        let output = MockOutput::new(200);
        let mut writer = writer_with(&output);
        stage_messages(&mut writer, 10);

        writer.acquit(5, 0);
        writer.acquit(5, 2);
        writer.acquit(5, 3);
        // a repeated (not widened) gap must stay quiet
        writer.acquit(5, 2);
        writer.acquit(5, 3);

        let repeats: Vec<String> = output
            .log()
            .into_iter()
            .filter(|entry| entry.starts_with("repeater"))
            .collect();
        assert_eq!(repeats, vec!["repeater:2", "repeater:3"]);
    }

    #[test]
    fn test_lost_count_clamps_to_255() {
        let output = MockOutput::new(200);
        let mut writer = writer_with(&output);
        stage_messages(&mut writer, 1);
        writer.repeat_messages(300);
        assert!(output.log().contains(&"repeater:255".to_string()));
    }

    #[test]
    fn test_repeat_delay_growth_and_cap() {
        let output = MockOutput::new(1000);
        let mut writer = writer_with(&output);
        stage_messages(&mut writer, 1);

        // force due timers and walk the whole growth curve
        let mut delays = Vec::new();
        for _ in 0..12 {
            writer.repeat_time = Instant::now() - Duration::from_secs(60);
            writer.repeat_messages(0);
            delays.push(writer.repeat_delay());
        }
        for window in delays.windows(2) {
            assert!(window[1] >= window[0], "delay must not shrink: {delays:?}");
        }
        assert_eq!(*delays.last().unwrap(), 10_000);
        assert!(delays.iter().all(|d| *d <= 10_000));
    }

    #[test]
    fn test_repeat_delay_boundary() {
        let output = MockOutput::new(1000);
        let mut writer = writer_with(&output);
        stage_messages(&mut writer, 1);

        writer.repeat_delay = 7071;
        writer.repeat_time = Instant::now() - Duration::from_secs(60);
        writer.repeat_messages(0);
        assert_eq!(writer.repeat_delay(), 9999);

        writer.repeat_delay = 7072;
        writer.repeat_time = Instant::now() - Duration::from_secs(60);
        writer.repeat_messages(0);
        assert_eq!(writer.repeat_delay(), 10_000);
    }

    #[test]
    fn test_empty_queue_cancels_repeats() {
        let output = MockOutput::new(500);
        let mut writer = writer_with(&output);
        stage_messages(&mut writer, 2);
        writer.acquit(2, 0); // everything acknowledged, queue trimmed
        writer.repeat_time = Instant::now() - Duration::from_secs(60);
        writer.repeat_messages(0);
        assert_eq!(writer.repeat_delay(), 0, "empty queue must disarm repeats");
    }

    #[test]
    fn test_in_flight_send_blocks_timer_repeat() {
        let output = MockOutput::new(500);
        let mut writer = writer_with(&output);
        stage_messages(&mut writer, 1);
        writer.queue().lock().unwrap().sending = true;
        writer.repeat_time = Instant::now() - Duration::from_secs(60);
        let before = writer.repeat_delay();
        writer.repeat_messages(0);
        assert_eq!(writer.repeat_delay(), before);
        assert!(!output.log().iter().any(|e| e == "repeater:0"));
    }

    #[test]
    fn test_fail_resets_and_retires_writer_id() {
        let output = MockOutput::new(300);
        let mut writer = writer_with(&output);
        stage_messages(&mut writer, 4);
        writer.acquit(2, 0);
        let old_id = writer.id();

        writer.fail();
        assert_eq!(writer.stage_ack(), 0);
        assert_eq!(writer.repeat_delay(), 0);
        assert_ne!(writer.id(), old_id, "fail must produce a fresh writer id");
        assert_eq!(writer.queueing_stages(), 0, "no message is recoverable");
    }

    #[test]
    fn test_close_appends_message_end_when_flow_was_active() {
        let output = MockOutput::new(300);
        let mut writer = writer_with(&output);
        stage_messages(&mut writer, 1);
        writer.acquit(1, 0);

        writer.close(0, "done");
        assert!(writer.closed());
        // the terminal frame is a one-message messenger batch
        assert!(output.log().iter().any(|e| e == "messenger:1"));
        // and a closed writer only hands out the null sink
        writer.new_message(true).write_string("ignored");
        writer.flushing();
        assert!(!output.log().iter().skip(3).any(|e| e.starts_with("messenger")));
    }

    #[test]
    fn test_close_without_activity_stays_silent() {
        let output = MockOutput::new(300);
        let mut writer = writer_with(&output);
        writer.close(0, "");
        assert!(output.log().is_empty(), "nothing to close toward");
    }
}
