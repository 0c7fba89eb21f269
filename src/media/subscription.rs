// src/media/subscription.rs - Per-subscriber binding to a publication
//
// Owned by the playing stream, listed by the publication for fan-out. All
// access happens on the server thread. Ejection is recorded here and polled
// by the owning stream at flush time; the stream then disengages with the
// recorded reason.

use crate::amf::MessageType;
use crate::flash::FlashWriter;
use crate::media::{AudioTag, DataKind, VideoFrame, VideoTag};
use bytes::Bytes;
use log::{debug, warn};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Server-initiated termination reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EjectReason {
    Timeout,
    Bandwidth,
    Error,
}

/// Enable switch for one media channel of a subscription.
#[derive(Debug)]
pub struct TrackSwitch {
    enabled: bool,
}

impl TrackSwitch {
    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }
}

impl Default for TrackSwitch {
    fn default() -> TrackSwitch {
        TrackSwitch { enabled: true }
    }
}

/// Queued bytes on the target writer beyond which the subscriber counts as
/// congested; sustained congestion ejects it.
const CONGESTION_BYTES: usize = 2 * 1024 * 1024;
const CONGESTION_GRACE: Duration = Duration::from_secs(10);
/// Media silence tolerated before a live subscriber gets ejected.
const MEDIA_TIMEOUT: Duration = Duration::from_secs(60);

pub struct Subscription {
    /// Publication name; set when the directory attaches the subscription.
    name: Option<String>,
    writer: Rc<RefCell<dyn FlashWriter>>,
    pub audios: TrackSwitch,
    pub videos: TrackSwitch,
    pub datas: TrackSwitch,
    ejected: Option<EjectReason>,
    buffer_time: u32,
    /// A joiner must wait for a keyframe before inter-frames make sense.
    got_video_keyframe: bool,
    last_media: Instant,
    congested_since: Option<Instant>,
}

impl Subscription {
    pub fn new(writer: Rc<RefCell<dyn FlashWriter>>) -> Subscription {
        Subscription {
            name: None,
            writer,
            audios: TrackSwitch::default(),
            videos: TrackSwitch::default(),
            datas: TrackSwitch::default(),
            ejected: None,
            buffer_time: 0,
            got_video_keyframe: false,
            last_media: Instant::now(),
            congested_since: None,
        }
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }

    pub(crate) fn attach(&mut self, name: &str) {
        self.name = Some(name.to_string());
        self.last_media = Instant::now();
    }

    pub fn writer(&self) -> &Rc<RefCell<dyn FlashWriter>> {
        &self.writer
    }

    pub fn buffer_time(&self) -> u32 {
        self.buffer_time
    }

    pub fn set_buffer_time(&mut self, ms: u32) {
        self.buffer_time = ms;
    }

    /// Seek resets the keyframe gate so playback restarts clean.
    pub fn seek(&mut self, _position_ms: u32) {
        self.got_video_keyframe = false;
    }

    /// Recorded or detected eject reason; media silence counts as timeout.
    pub fn ejected(&mut self) -> Option<EjectReason> {
        if self.ejected.is_none()
            && self.name.is_some()
            && self.last_media.elapsed() > MEDIA_TIMEOUT
        {
            warn!("subscription {} timed out", self.name());
            self.ejected = Some(EjectReason::Timeout);
        }
        self.ejected
    }

    /// Record an eject unless one was recorded first.
    pub(crate) fn eject(&mut self, reason: EjectReason) {
        if self.ejected.is_none() {
            self.ejected = Some(reason);
        }
    }

    pub fn push_audio(&mut self, tag: &AudioTag, payload: Bytes, publication_has_video: bool) {
        if self.ejected.is_some() || !self.audios.enabled() {
            return;
        }
        self.last_media = Instant::now();
        // wait for the first video keyframe unless this is config data or
        // the publication carries no video at all
        if publication_has_video && !self.got_video_keyframe && !tag.is_config {
            return;
        }
        self.writer.borrow_mut().write_media(
            MessageType::Audio,
            tag.time,
            payload,
            tag.is_config,
        );
        self.watch_congestion();
    }

    pub fn push_video(&mut self, tag: &VideoTag, payload: Bytes) {
        if self.ejected.is_some() || !self.videos.enabled() {
            return;
        }
        self.last_media = Instant::now();
        match tag.frame {
            VideoFrame::Config => {}
            VideoFrame::Key | VideoFrame::GeneratedKey => self.got_video_keyframe = true,
            _ => {
                if !self.got_video_keyframe {
                    return; // inter-frame before any keyframe is garbage
                }
            }
        }
        let reliable = matches!(tag.frame, VideoFrame::Config | VideoFrame::Key);
        self.writer
            .borrow_mut()
            .write_media(MessageType::Video, tag.time, payload, reliable);
        self.watch_congestion();
    }

    pub fn push_data(&mut self, _kind: DataKind, payload: Bytes, time: u32) {
        if self.ejected.is_some() || !self.datas.enabled() {
            return;
        }
        self.writer
            .borrow_mut()
            .write_message(MessageType::Data, time, true, payload);
        self.watch_congestion();
    }

    fn watch_congestion(&mut self) {
        let queueing = self.writer.borrow().queueing();
        if queueing <= CONGESTION_BYTES {
            self.congested_since = None;
            return;
        }
        let since = *self.congested_since.get_or_insert_with(Instant::now);
        if since.elapsed() > CONGESTION_GRACE {
            debug!(
                "subscription {} congested ({queueing} bytes queued), ejecting",
                self.name()
            );
            self.eject(EjectReason::Bandwidth);
        }
    }

    #[cfg(test)]
    pub(crate) fn force_media_silence(&mut self, age: Duration) {
        self.last_media = Instant::now() - age;
    }

    #[cfg(test)]
    pub(crate) fn force_congested(&mut self, age: Duration) {
        self.congested_since = Some(Instant::now() - age);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::MemoryFlashWriter;
    use crate::media::VIDEO_CODEC_AVC;

    fn subscription() -> (Subscription, Rc<RefCell<MemoryFlashWriter>>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let writer = Rc::new(RefCell::new(MemoryFlashWriter::new()));
        let mut sub = Subscription::new(writer.clone());
        sub.attach("live");
        (sub, writer)
    }

    fn video(frame: VideoFrame, time: u32) -> VideoTag {
        VideoTag {
            codec: VIDEO_CODEC_AVC,
            frame,
            time,
        }
    }

    #[test]
    fn test_keyframe_gating() {
        let (mut sub, writer) = subscription();
        sub.push_video(&video(VideoFrame::Inter, 10), Bytes::from_static(b"p1"));
        assert!(writer.borrow().messages.is_empty(), "inter before keyframe");

        sub.push_video(&video(VideoFrame::Key, 20), Bytes::from_static(b"k"));
        sub.push_video(&video(VideoFrame::Inter, 30), Bytes::from_static(b"p2"));
        assert_eq!(writer.borrow().messages.len(), 2);
    }

    #[test]
    fn test_config_passes_before_keyframe() {
        let (mut sub, writer) = subscription();
        sub.push_video(&video(VideoFrame::Config, 0), Bytes::from_static(b"sps"));
        assert_eq!(writer.borrow().messages.len(), 1);
    }

    #[test]
    fn test_audio_waits_for_keyframe_only_with_video() {
        let (mut sub, writer) = subscription();
        let tag = AudioTag {
            time: 5,
            ..AudioTag::default()
        };
        sub.push_audio(&tag, Bytes::from_static(b"a"), true);
        assert!(writer.borrow().messages.is_empty());
        sub.push_audio(&tag, Bytes::from_static(b"a"), false);
        assert_eq!(writer.borrow().messages.len(), 1, "audio-only passes");
    }

    #[test]
    fn test_channel_disable() {
        let (mut sub, writer) = subscription();
        sub.audios.disable();
        sub.push_audio(&AudioTag::default(), Bytes::from_static(b"a"), false);
        assert!(writer.borrow().messages.is_empty());
        sub.audios.enable();
        sub.push_audio(&AudioTag::default(), Bytes::from_static(b"a"), false);
        assert_eq!(writer.borrow().messages.len(), 1);
    }

    #[test]
    fn test_eject_reason_is_sticky() {
        let (mut sub, _writer) = subscription();
        sub.eject(EjectReason::Bandwidth);
        sub.eject(EjectReason::Error);
        assert_eq!(sub.ejected(), Some(EjectReason::Bandwidth));
    }

    #[test]
    fn test_media_silence_becomes_timeout() {
        let (mut sub, _writer) = subscription();
        sub.force_media_silence(Duration::from_secs(120));
        assert_eq!(sub.ejected(), Some(EjectReason::Timeout));
    }

    #[test]
    fn test_sustained_congestion_ejects() {
        let (mut sub, writer) = subscription();
        writer.borrow_mut().queueing = CONGESTION_BYTES + 1;
        sub.force_congested(Duration::from_secs(11));
        sub.push_video(&video(VideoFrame::Key, 0), Bytes::from_static(b"k"));
        assert_eq!(sub.ejected(), Some(EjectReason::Bandwidth));
    }

    #[test]
    fn test_ejected_subscription_stops_writing() {
        let (mut sub, writer) = subscription();
        sub.eject(EjectReason::Error);
        sub.push_video(&video(VideoFrame::Key, 0), Bytes::from_static(b"k"));
        assert!(writer.borrow().messages.is_empty());
    }
}
