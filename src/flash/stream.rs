// src/flash/stream.rs - Per-NetStream protocol state machine
//
// One FlashStream per NetStream id within a session. At most one publication
// (publishing) and one subscription (playing) at a time. Status messages are
// written before the state change that could invalidate the name they borrow.

use crate::amf::{AmfReader, MessageType, ValueType};
use crate::error::NetError;
use crate::flash::writer::{FlashWriter, RAW_STREAM_BEGIN, RAW_STREAM_EOF};
use crate::media::{
    read_audio_header, read_video_header, AudioTag, DataKind, MediaKind, PeerInfo, Publication,
    ServerApi, Subscription, VideoTag,
};
use crate::media::EjectReason;
use bytes::Bytes;
use log::{debug, error, info, warn};
use std::cell::RefCell;
use std::rc::Rc;

pub struct FlashStream {
    pub id: u16,
    publication: Option<Rc<RefCell<Publication>>>,
    subscription: Option<Rc<RefCell<Subscription>>>,
    buffer_time: u32,
    /// Active track for data/manual publish.
    track: u16,
    /// Packed manual-publish target: data-kind | track | media kind.
    media: u32,
    /// Descriptor caches reused across packets of one stream.
    audio: AudioTag,
    video: VideoTag,
}

impl FlashStream {
    pub fn new(id: u16) -> FlashStream {
        debug!("FlashStream {id} created");
        FlashStream {
            id,
            publication: None,
            subscription: None,
            buffer_time: 0,
            track: 0,
            media: 0,
            audio: AudioTag::default(),
            video: VideoTag::default(),
        }
    }

    pub fn publishing(&self) -> bool {
        self.publication.is_some()
    }

    pub fn playing(&self) -> bool {
        self.subscription.is_some()
    }

    /// Per-stream buffer time; applied to the live subscription when any.
    pub fn set_buffer_time(&mut self, ms: u32) -> u32 {
        self.buffer_time = ms;
        info!("setBufferTime {ms}ms on stream {}", self.id);
        if let Some(subscription) = &self.subscription {
            subscription.borrow_mut().set_buffer_time(ms);
        }
        self.buffer_time
    }

    /// Flush-time hook: pushes publication media and polls the subscription
    /// for a recorded ejection, disengaging with the recorded reason.
    pub fn flush(
        &mut self,
        writer: &Rc<RefCell<dyn FlashWriter>>,
        api: &mut dyn ServerApi,
        peer: &PeerInfo,
    ) {
        if let Some(publication) = &self.publication {
            publication.borrow_mut().flush(peer.ping);
        }
        let ejected = self
            .subscription
            .as_ref()
            .is_some_and(|subscription| subscription.borrow_mut().ejected().is_some());
        if ejected {
            self.disengage(Some(writer), api, peer);
        }
    }

    /// Dispatch one AMF message; false closes the connection.
    pub fn process(
        &mut self,
        ty: u8,
        time: u32,
        packet: Bytes,
        writer: &Rc<RefCell<dyn FlashWriter>>,
        api: &mut dyn ServerApi,
        peer: &PeerInfo,
    ) -> bool {
        match MessageType::from_u8(ty) {
            Some(MessageType::Audio) => self.audio_handler(time, packet, peer),
            Some(MessageType::Video) => self.video_handler(time, packet, peer),
            Some(MessageType::DataAmf3) => {
                if !packet.is_empty() {
                    self.data_handler(time, packet.slice(1..), peer);
                }
            }
            Some(MessageType::Data) => self.data_handler(time, packet, peer),
            Some(MessageType::Invocation) | Some(MessageType::InvocationAmf3) => {
                let offset = usize::from(ty == MessageType::InvocationAmf3 as u8);
                let mut reader = AmfReader::new(&packet[offset.min(packet.len())..]);
                let Ok(name) = reader.read_string() else {
                    error!("invocation without name on stream {}", self.id);
                    return false;
                };
                let transaction = reader.read_number().unwrap_or(0.0);
                writer.borrow_mut().set_callback_handle(transaction);
                reader.read_null();
                self.message_handler(&name, &mut reader, writer, api, peer);
            }
            Some(MessageType::Raw) => {
                if packet.len() >= 2 {
                    let raw_type = u16::from_be_bytes([packet[0], packet[1]]);
                    self.raw_handler(raw_type);
                }
            }
            Some(MessageType::Empty) => {}
            _ => {
                error!("Unpacking type '{ty:02x}' unknown");
                writer.borrow_mut().set_callback_handle(0.0);
                return false;
            }
        }
        let mut writer = writer.borrow_mut();
        writer.set_callback_handle(0.0);
        !writer.closed()
    }

    fn message_handler(
        &mut self,
        name: &str,
        message: &mut AmfReader<'_>,
        writer: &Rc<RefCell<dyn FlashWriter>>,
        api: &mut dyn ServerApi,
        peer: &PeerInfo,
    ) {
        match name {
            "play" => {
                self.disengage(Some(writer), api, peer);

                let stream = message.read_string().unwrap_or_default();
                let subscription = Rc::new(RefCell::new(Subscription::new(writer.clone())));
                match api.subscribe(&stream, peer, &subscription) {
                    Err(NetError::Unfound(_)) => {
                        writer.borrow_mut().write_amf_status_error(
                            "NetStream.Play.StreamNotFound",
                            &format!("{stream} not found"),
                        );
                    }
                    Err(error) => {
                        writer
                            .borrow_mut()
                            .write_amf_status_error("NetStream.Play.Failed", &error.to_string());
                    }
                    Ok(()) => {
                        let mut writer_ref = writer.borrow_mut();
                        writer_ref.write_raw_event(RAW_STREAM_BEGIN, u32::from(self.id));
                        writer_ref.write_amf_status(
                            "NetStream.Play.Reset",
                            &format!("Playing and resetting {stream}"),
                        );
                        writer_ref.write_amf_status(
                            "NetStream.Play.Start",
                            &format!("Started playing {stream}"),
                        );
                        writer_ref.write_amf_data("|RtmpSampleAccess", &mut |amf| {
                            amf.write_boolean(true); // audioSampleAccess
                            amf.write_boolean(true); // videoSampleAccess
                        });
                        drop(writer_ref);
                        if self.buffer_time > 0 {
                            subscription.borrow_mut().set_buffer_time(self.buffer_time);
                        }
                        self.subscription = Some(subscription);
                    }
                }
            }

            "closeStream" => self.disengage(Some(writer), api, peer),

            "publish" => {
                self.disengage(Some(writer), api, peer);

                let mut stream = message.read_string().unwrap_or_default();
                if let Ok(mode) = message.read_string() {
                    if mode.eq_ignore_ascii_case("append") {
                        stream.push(if stream.contains('?') { '&' } else { '?' });
                        stream.push_str("append=true");
                    } else if mode.eq_ignore_ascii_case("record") {
                        // recording needs an extension; default to FLV
                        let stem_end = stream.find('?').unwrap_or(stream.len());
                        if !stream[..stem_end].contains('.') {
                            stream.insert_str(stem_end, ".flv");
                        }
                    }
                }

                match api.publish(peer, &stream) {
                    Ok((publication, record_problem)) => {
                        writer.borrow_mut().write_amf_status(
                            "NetStream.Publish.Start",
                            &format!("{stream} is now published"),
                        );
                        self.track = 0;
                        self.media = 0;
                        if publication.borrow().recording() {
                            let status_writer = writer.clone();
                            let record_name = publication.borrow().name().to_string();
                            publication.borrow_mut().on_recorder_error(Box::new(
                                move |error| {
                                    let mut writer = status_writer.borrow_mut();
                                    writer.write_amf_status_error(
                                        "NetStream.Record.Failed",
                                        &error.to_string(),
                                    );
                                    writer.write_amf_status(
                                        "NetStream.Record.Stop",
                                        &format!("{record_name} recording stopped"),
                                    );
                                    writer.flush();
                                },
                            ));
                            writer.borrow_mut().write_amf_status(
                                "NetStream.Record.Start",
                                &format!("{stream} recording started"),
                            );
                        } else if let Some(problem) = record_problem {
                            // recording could not start; the publication lives on
                            let code = match problem {
                                NetError::Unsupported(_) => "NetStream.Record.Failed",
                                _ => "NetStream.Record.NoAccess",
                            };
                            writer
                                .borrow_mut()
                                .write_amf_status_error(code, &problem.to_string());
                        }
                        self.publication = Some(publication);
                    }
                    Err(error) => {
                        writer
                            .borrow_mut()
                            .write_amf_status_error("NetStream.Publish.BadName", &error.to_string());
                    }
                }
            }

            "receiveAudio" if self.subscription.is_some() => {
                if let Ok(enable) = message.read_boolean() {
                    let subscription = self.subscription.as_ref().unwrap();
                    let mut subscription = subscription.borrow_mut();
                    if enable {
                        subscription.audios.enable();
                    } else {
                        subscription.audios.disable();
                    }
                }
            }

            "receiveVideo" if self.subscription.is_some() => {
                if let Ok(enable) = message.read_boolean() {
                    let subscription = self.subscription.as_ref().unwrap();
                    let mut subscription = subscription.borrow_mut();
                    if enable {
                        subscription.videos.enable();
                    } else {
                        subscription.videos.disable();
                    }
                }
            }

            "pause" if self.subscription.is_some() => {
                let paused = message.read_boolean().unwrap_or(true);
                if !paused {
                    // unpause with a position is a seek + stream begin
                    if let Ok(position) = message.read_number() {
                        let subscription = self.subscription.as_ref().unwrap();
                        subscription.borrow_mut().seek(position as u32);
                    }
                    writer
                        .borrow_mut()
                        .write_raw_event(RAW_STREAM_BEGIN, u32::from(self.id));
                }
            }

            "seek" if self.subscription.is_some() => {
                let subscription = self.subscription.as_ref().unwrap().clone();
                match message.read_number() {
                    Ok(position) => {
                        subscription.borrow_mut().seek(position as u32);
                        writer
                            .borrow_mut()
                            .write_raw_event(RAW_STREAM_BEGIN, u32::from(self.id));
                    }
                    Err(_) => {
                        writer.borrow_mut().write_amf_status_error(
                            "NetStream.Seek.InvalidTime",
                            &format!(
                                "{} seek operation must pass in argument a milliseconds position time",
                                subscription.borrow().name()
                            ),
                        );
                    }
                }
            }

            _ => error!("Message '{name}' unknown on stream {}", self.id),
        }
    }

    /// Stop the current role. Status messages go out before the API calls
    /// because the publication/subscription owns the name they mention.
    pub fn disengage(
        &mut self,
        writer: Option<&Rc<RefCell<dyn FlashWriter>>>,
        api: &mut dyn ServerApi,
        peer: &PeerInfo,
    ) {
        if let Some(publication) = self.publication.take() {
            if let Some(writer) = writer {
                let name = publication.borrow().name().to_string();
                let mut writer = writer.borrow_mut();
                if publication.borrow().recording() {
                    writer.write_amf_status(
                        "NetStream.Record.Stop",
                        &format!("{name} recording stopped"),
                    );
                }
                writer
                    .write_amf_status("NetStream.Unpublish.Success", &format!("{name} is now unpublished"));
            }
            api.unpublish(&publication, peer);
        }
        if let Some(subscription) = self.subscription.take() {
            let name = subscription.borrow().name().to_string();
            if let Some(writer) = writer {
                let mut writer = writer.borrow_mut();
                match subscription.borrow_mut().ejected() {
                    Some(EjectReason::Timeout) => writer.write_amf_status_error(
                        "NetStream.Play.StreamNotFound",
                        &format!("{name} not found"),
                    ),
                    Some(EjectReason::Bandwidth) => writer.write_amf_status_error(
                        "NetStream.Play.InsufficientBW",
                        &format!("Insufficient bandwidth to play {name}"),
                    ),
                    Some(EjectReason::Error) => writer.write_amf_status_error(
                        "NetStream.Play.Failed",
                        &format!("Unknown error to play {name}"),
                    ),
                    None => {}
                }
                writer.write_amf_status("NetStream.Play.Stop", &format!("Stopped playing {name}"));
                writer.write_raw_event(RAW_STREAM_EOF, u32::from(self.id));
            }
            api.unsubscribe(peer, &subscription);
        }
    }

    fn audio_handler(&mut self, time: u32, packet: Bytes, peer: &PeerInfo) {
        let Some(publication) = &self.publication else {
            warn!(
                "an audio packet has been received on a no publishing stream {}, certainly a publication currently closing",
                self.id
            );
            return;
        };
        let (mut tag, consumed) = read_audio_header(&packet);
        tag.time = time;
        self.audio = tag;
        publication
            .borrow_mut()
            .write_audio(self.track, &tag, packet.slice(consumed..), peer.ping);
    }

    fn video_handler(&mut self, time: u32, packet: Bytes, peer: &PeerInfo) {
        let Some(publication) = &self.publication else {
            warn!(
                "a video packet has been received on a no publishing stream {}, certainly a publication currently closing",
                self.id
            );
            return;
        };
        let (mut tag, consumed) = read_video_header(&packet);
        tag.time = time;
        self.video = tag;
        publication
            .borrow_mut()
            .write_video(self.track, &tag, packet.slice(consumed..), peer.ping);
    }

    fn raw_handler(&mut self, raw_type: u16) {
        if raw_type == 0x0022 {
            // flow sync signal, nothing to synchronize here
            return;
        }
        error!("Raw message {raw_type:04x} unknown on stream {}", self.id);
    }

    /// Data packets: manual publish (leading null), "@" control commands, or
    /// plain typed data forwarded on the active track.
    fn data_handler(&mut self, timestamp: u32, packet: Bytes, peer: &PeerInfo) {
        if packet.is_empty() {
            return; // recursion end for trailing bytes
        }
        let Some(publication) = self.publication.clone() else {
            error!(
                "a data packet has been received on a no publishing stream {}, certainly a publication currently closing",
                self.id
            );
            return;
        };

        if packet[0] == 0x05 {
            // NetStream.send(null, ...) => manual publish
            let mut reader = AmfReader::new(&packet);
            reader.read_null();

            let mut is_string = false;
            let content: Option<Vec<u8>> = match reader.next_type() {
                ValueType::Bytes => reader.read_bytes().ok().map(<[u8]>::to_vec),
                ValueType::String => {
                    is_string = true;
                    reader.read_string().ok().map(String::into_bytes)
                }
                _ => None,
            };

            if let Some(mut content) = content {
                if reader.next_type() == ValueType::Bytes && !content.is_empty() {
                    // the first value was a tag selecting track and type
                    self.unpack_media_tag(&content, is_string);
                    content = match reader.read_bytes() {
                        Ok(data) => data.to_vec(),
                        Err(_) => return,
                    };
                } // else keep the previous tag

                let track = (self.media >> 8 & 0xFFFF) as u16;
                let payload = Bytes::from(content);
                match self.media as u8 {
                    kind if kind == MediaKind::Audio as u8 => {
                        self.audio.time = timestamp;
                        publication
                            .borrow_mut()
                            .write_audio(track, &self.audio, payload, peer.ping);
                    }
                    kind if kind == MediaKind::Video as u8 => {
                        self.video.time = timestamp;
                        publication
                            .borrow_mut()
                            .write_video(track, &self.video, payload, peer.ping);
                    }
                    _ => {
                        publication.borrow_mut().write_data(
                            track,
                            DataKind::from_u8((self.media >> 24) as u8),
                            payload,
                            peer.ping,
                        );
                    }
                }
                // same packet may carry further values
                return self.data_handler(timestamp, packet.slice(reader.position()..), peer);
            }

            if reader.next_type() == ValueType::Null {
                // a null handler with a byte/string body following
                publication.borrow_mut().write_data(
                    self.track,
                    DataKind::Amf,
                    packet.slice(reader.position()..),
                    peer.ping,
                );
                return;
            }
        } else if packet[0] == 0x02 && packet.len() > 3 && packet[1] == 0 && packet[3] == b'@' {
            match packet[2] {
                15 if packet.len() >= 18 && &packet[3..18] == b"@clearDataFrame" => {
                    return publication.borrow_mut().clear_metadata();
                }
                13 if packet.len() >= 16 && &packet[3..16] == b"@setDataFrame" => {
                    let mut reader = AmfReader::new(&packet);
                    let _ = reader.next(); // @setDataFrame
                    publication.borrow_mut().clear_metadata();
                    // keep the handler name (onMetaData) with the map so the
                    // cached payload replays as received
                    publication
                        .borrow_mut()
                        .set_metadata(packet.slice(reader.position()..));
                    return;
                }
                6 if packet.len() >= 9 && &packet[3..9] == b"@track" => {
                    // select the track for this and all future packets
                    let mut reader = AmfReader::new(&packet);
                    let _ = reader.next(); // "@track"
                    if let Ok(track) = reader.read_number() {
                        self.track = track as u16;
                    }
                    return;
                }
                _ => {}
            }
        }

        publication
            .borrow_mut()
            .write_data(self.track, DataKind::Amf, packet, peer.ping);
    }

    /// Manual-publish tag: a string tag selects a data track, a byte tag an
    /// audio (even length) or video (odd length) track, with the track
    /// number in its trailing two bytes.
    fn unpack_media_tag(&mut self, tag: &[u8], is_string: bool) {
        if tag.len() < 3 {
            return;
        }
        let track = u32::from(u16::from_be_bytes([tag[tag.len() - 2], tag[tag.len() - 1]]));
        if is_string {
            self.media =
                u32::from(tag[0]) << 24 | track << 8 | MediaKind::Data as u32;
        } else if tag.len() % 2 == 1 {
            let (descriptor, _) = read_video_header(&tag[..tag.len() - 2]);
            self.video = descriptor;
            self.media = track << 8 | MediaKind::Video as u32;
        } else {
            let (descriptor, _) = read_audio_header(&tag[..tag.len() - 2]);
            self.audio = descriptor;
            self.media = track << 8 | MediaKind::Audio as u32;
        }
    }
}

impl Drop for FlashStream {
    fn drop(&mut self) {
        debug!("FlashStream {} deleted", self.id);
    }
}
