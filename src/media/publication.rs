// src/media/publication.rs - A live stream held by the server thread
//
// Owns the current media parameters (codec configs, metadata) and the
// subscriber list, and fans incoming frames out to every live subscription.
// External producers never touch this type directly; they queue actions
// through the Publish façade which the server thread resolves and runs.

use crate::error::{NetError, Result};
use crate::media::{AudioTag, DataKind, Subscription, VideoFrame, VideoTag};
use crate::media::EjectReason;
use bytes::Bytes;
use log::{debug, info, warn};
use std::cell::RefCell;
use std::rc::Rc;

/// Recording hand-off: consumes descriptor-framed media. The file format
/// behind it is not this layer's concern.
pub trait Recorder {
    fn write_audio(&mut self, track: u16, tag: &AudioTag, payload: &[u8]) -> Result<()>;
    fn write_video(&mut self, track: u16, tag: &VideoTag, payload: &[u8]) -> Result<()>;
    fn write_data(&mut self, track: u16, kind: DataKind, payload: &[u8]) -> Result<()>;
}

pub struct Publication {
    name: String,
    audio_config: Option<(AudioTag, Bytes)>,
    video_config: Option<(VideoTag, Bytes)>,
    /// Raw AMF metadata installed by @setDataFrame, replayed to joiners.
    metadata: Option<Bytes>,
    subscriptions: Vec<Rc<RefCell<Subscription>>>,
    recorder: Option<Box<dyn Recorder>>,
    on_recorder_error: Option<Box<dyn FnMut(&NetError)>>,
    has_video: bool,
    last_ping: u32,
}

impl Publication {
    pub fn new(name: &str) -> Publication {
        info!("publication {name} created");
        Publication {
            name: name.to_string(),
            audio_config: None,
            video_config: None,
            metadata: None,
            subscriptions: Vec::new(),
            recorder: None,
            on_recorder_error: None,
            has_video: false,
            last_ping: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn recording(&self) -> bool {
        self.recorder.is_some()
    }

    pub fn set_recorder(&mut self, recorder: Box<dyn Recorder>) {
        self.recorder = Some(recorder);
    }

    /// Install the handler fired when the recorder fails mid-stream.
    pub fn on_recorder_error(&mut self, handler: Box<dyn FnMut(&NetError)>) {
        self.on_recorder_error = Some(handler);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn has_video(&self) -> bool {
        self.has_video
    }

    pub fn metadata(&self) -> Option<&Bytes> {
        self.metadata.as_ref()
    }

    pub fn last_ping(&self) -> u32 {
        self.last_ping
    }

    /// Attach a subscriber and replay cached state (metadata, codec configs)
    /// so a late joiner can start decoding.
    pub(crate) fn subscribe(&mut self, subscription: Rc<RefCell<Subscription>>) {
        {
            let mut sub = subscription.borrow_mut();
            sub.attach(&self.name);
            if let Some(metadata) = &self.metadata {
                sub.push_data(DataKind::Amf, metadata.clone(), 0);
            }
            if let Some((tag, payload)) = &self.audio_config {
                sub.push_audio(tag, payload.clone(), self.has_video);
            }
            if let Some((tag, payload)) = &self.video_config {
                sub.push_video(tag, payload.clone());
            }
        }
        self.subscriptions.push(subscription);
    }

    pub(crate) fn unsubscribe(&mut self, subscription: &Rc<RefCell<Subscription>>) {
        self.subscriptions
            .retain(|existing| !Rc::ptr_eq(existing, subscription));
    }

    /// Eject every remaining subscriber; reasons recorded earlier win.
    pub(crate) fn evict_subscribers(&mut self, reason: EjectReason) {
        for subscription in &self.subscriptions {
            subscription.borrow_mut().eject(reason);
        }
    }

    pub fn write_audio(&mut self, track: u16, tag: &AudioTag, payload: Bytes, ping: u32) {
        self.last_ping = ping;
        if tag.is_config {
            self.audio_config = Some((*tag, payload.clone()));
        }
        self.record(|recorder| recorder.write_audio(track, tag, &payload));
        for subscription in &self.subscriptions {
            subscription
                .borrow_mut()
                .push_audio(tag, payload.clone(), self.has_video);
        }
    }

    pub fn write_video(&mut self, track: u16, tag: &VideoTag, payload: Bytes, ping: u32) {
        self.last_ping = ping;
        self.has_video = true;
        if tag.frame == VideoFrame::Config {
            self.video_config = Some((*tag, payload.clone()));
        }
        self.record(|recorder| recorder.write_video(track, tag, &payload));
        for subscription in &self.subscriptions {
            subscription.borrow_mut().push_video(tag, payload.clone());
        }
    }

    pub fn write_data(&mut self, track: u16, kind: DataKind, payload: Bytes, ping: u32) {
        self.last_ping = ping;
        self.record(|recorder| recorder.write_data(track, kind, &payload));
        for subscription in &self.subscriptions {
            subscription.borrow_mut().push_data(kind, payload.clone(), 0);
        }
    }

    /// Replace the stream metadata (the @setDataFrame map) and forward it.
    pub fn set_metadata(&mut self, payload: Bytes) {
        self.metadata = Some(payload.clone());
        self.record(|recorder| recorder.write_data(0, DataKind::Amf, &payload));
        for subscription in &self.subscriptions {
            subscription
                .borrow_mut()
                .push_data(DataKind::Amf, payload.clone(), 0);
        }
    }

    /// @clearDataFrame
    pub fn clear_metadata(&mut self) {
        self.metadata = None;
    }

    /// Forget cached parameters so the next configs re-prime joiners.
    pub fn reset(&mut self) {
        debug!("publication {} reset", self.name);
        self.audio_config = None;
        self.video_config = None;
        self.metadata = None;
    }

    /// Push queued bytes toward the subscribers' transports.
    pub fn flush(&mut self, ping: u32) {
        if ping > 0 {
            self.last_ping = ping;
        }
        for subscription in &self.subscriptions {
            let subscription = subscription.borrow();
            subscription.writer().borrow_mut().flush();
        }
    }

    fn record(&mut self, write: impl FnOnce(&mut Box<dyn Recorder>) -> Result<()>) {
        let Some(recorder) = self.recorder.as_mut() else {
            return;
        };
        if let Err(error) = write(recorder) {
            warn!("recording {} failed: {error}", self.name);
            // recording stops; the stream is told so it can report the loss
            self.recorder = None;
            if let Some(handler) = self.on_recorder_error.as_mut() {
                handler(&error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amf::MessageType;
    use crate::flash::MemoryFlashWriter;
    use crate::media::VIDEO_CODEC_AVC;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn init_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn subscriber() -> (Rc<RefCell<Subscription>>, Rc<RefCell<MemoryFlashWriter>>) {
        init_logs();
        let writer = Rc::new(RefCell::new(MemoryFlashWriter::new()));
        let subscription = Rc::new(RefCell::new(Subscription::new(writer.clone())));
        (subscription, writer)
    }

    fn key_frame(time: u32) -> VideoTag {
        VideoTag {
            codec: VIDEO_CODEC_AVC,
            frame: VideoFrame::Key,
            time,
        }
    }

    #[test]
    fn test_fan_out_preserves_order_and_timestamps() {
        let mut publication = Publication::new("live");
        let (subscription, writer) = subscriber();
        publication.subscribe(subscription);

        for time in [0u32, 40, 80, 120] {
            publication.write_video(0, &key_frame(time), Bytes::from_static(b"v"), 10);
        }
        let times: Vec<u32> = writer.borrow().messages.iter().map(|m| m.1).collect();
        assert_eq!(times, vec![0, 40, 80, 120]);
        assert_eq!(publication.last_ping(), 10);
    }

    #[test]
    fn test_late_joiner_gets_configs_and_metadata() {
        let mut publication = Publication::new("live");
        publication.set_metadata(Bytes::from_static(b"\x02\x00\x0aonMetaData"));
        publication.write_video(
            0,
            &VideoTag {
                codec: VIDEO_CODEC_AVC,
                frame: VideoFrame::Config,
                time: 0,
            },
            Bytes::from_static(b"avcc"),
            0,
        );
        publication.write_audio(
            0,
            &AudioTag {
                is_config: true,
                ..AudioTag::default()
            },
            Bytes::from_static(b"asc"),
            0,
        );

        let (subscription, writer) = subscriber();
        publication.subscribe(subscription);
        let kinds: Vec<MessageType> = writer.borrow().messages.iter().map(|m| m.0).collect();
        assert_eq!(
            kinds,
            vec![MessageType::Data, MessageType::Audio, MessageType::Video]
        );
    }

    #[test]
    fn test_unsubscribe_stops_fan_out() {
        let mut publication = Publication::new("live");
        let (subscription, writer) = subscriber();
        publication.subscribe(subscription.clone());
        publication.write_video(0, &key_frame(0), Bytes::from_static(b"v"), 0);
        publication.unsubscribe(&subscription);
        publication.write_video(0, &key_frame(40), Bytes::from_static(b"v"), 0);
        assert_eq!(writer.borrow().messages.len(), 1);
        assert_eq!(publication.subscriber_count(), 0);
    }

    #[test]
    fn test_evict_marks_subscribers_with_error() {
        let mut publication = Publication::new("live");
        let (subscription, _writer) = subscriber();
        publication.subscribe(subscription.clone());
        publication.evict_subscribers(EjectReason::Error);
        assert_eq!(
            subscription.borrow_mut().ejected(),
            Some(EjectReason::Error)
        );
    }

    struct FailingRecorder;

    impl Recorder for FailingRecorder {
        fn write_audio(&mut self, _: u16, _: &AudioTag, _: &[u8]) -> crate::error::Result<()> {
            Err(NetError::Other {
                code: 28,
                context: " (disk full)".into(),
            })
        }

        fn write_video(&mut self, _: u16, _: &VideoTag, _: &[u8]) -> crate::error::Result<()> {
            Ok(())
        }

        fn write_data(&mut self, _: u16, _: DataKind, _: &[u8]) -> crate::error::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_recorder_failure_fires_handler_and_stops_recording() {
        init_logs();
        let mut publication = Publication::new("clip.flv");
        publication.set_recorder(Box::new(FailingRecorder));
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        publication.on_recorder_error(Box::new(move |_error| {
            fired_clone.fetch_add(1, Ordering::Relaxed);
        }));
        assert!(publication.recording());

        publication.write_audio(0, &AudioTag::default(), Bytes::from_static(b"a"), 0);
        assert_eq!(fired.load(Ordering::Relaxed), 1);
        assert!(!publication.recording(), "failed recorder must be dropped");

        // further media must not re-fire
        publication.write_audio(0, &AudioTag::default(), Bytes::from_static(b"a"), 0);
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_reset_clears_cached_parameters() {
        let mut publication = Publication::new("live");
        publication.set_metadata(Bytes::from_static(b"meta"));
        publication.write_video(
            0,
            &VideoTag {
                frame: VideoFrame::Config,
                ..VideoTag::default()
            },
            Bytes::from_static(b"cfg"),
            0,
        );
        publication.reset();
        let (subscription, writer) = subscriber();
        publication.subscribe(subscription);
        assert!(writer.borrow().messages.is_empty(), "no stale replay after reset");
    }
}
