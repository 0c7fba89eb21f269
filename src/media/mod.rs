//! In-memory media model: tag descriptors unpacked from FLV media headers,
//! the publication/subscription pair, the name directory, and the
//! cross-thread publish façade.

mod hub;
mod publication;
mod publish;
mod subscription;

pub use hub::{PeerInfo, RecorderFactory, ServerApi, StreamHub};
pub use publication::{Publication, Recorder};
pub use publish::{Action, Publish};
pub use subscription::{EjectReason, Subscription, TrackSwitch};

/// Media kinds as carried in the manual-publish tag byte (low byte of the
/// packed track/type word).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MediaKind {
    Data = 1,
    Audio = 2,
    Video = 3,
}

/// Typed data payloads forwarded on a publication's data track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataKind {
    #[default]
    Amf,
    Json,
    Text,
}

impl DataKind {
    pub fn from_u8(value: u8) -> DataKind {
        match value {
            2 => DataKind::Json,
            3 => DataKind::Text,
            _ => DataKind::Amf,
        }
    }
}

/// Audio descriptor unpacked from an FLV audio tag header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AudioTag {
    pub codec: u8,
    pub rate: u32,
    pub channels: u8,
    /// AAC sequence header (decoder config), replayed to late subscribers.
    pub is_config: bool,
    pub time: u32,
}

/// Frame classification from an FLV video tag header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VideoFrame {
    Key,
    #[default]
    Inter,
    Disposable,
    GeneratedKey,
    Command,
    /// Codec configuration (AVC sequence header).
    Config,
}

/// Video descriptor unpacked from an FLV video tag header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VideoTag {
    pub codec: u8,
    pub frame: VideoFrame,
    pub time: u32,
}

pub const AUDIO_CODEC_AAC: u8 = 10;
pub const VIDEO_CODEC_AVC: u8 = 7;

const AUDIO_RATES: [u32; 4] = [5512, 11025, 22050, 44100];

/// Unpack an FLV audio tag header; returns the descriptor and the header
/// length consumed from the payload.
pub fn read_audio_header(data: &[u8]) -> (AudioTag, usize) {
    let Some(&first) = data.first() else {
        return (AudioTag::default(), 0);
    };
    let codec = first >> 4;
    let mut tag = AudioTag {
        codec,
        rate: AUDIO_RATES[usize::from(first >> 2 & 0x03)],
        channels: (first & 0x01) + 1,
        is_config: false,
        time: 0,
    };
    if codec == AUDIO_CODEC_AAC && data.len() >= 2 {
        tag.is_config = data[1] == 0;
        return (tag, 2);
    }
    (tag, 1)
}

/// Unpack an FLV video tag header; returns the descriptor and the header
/// length consumed (the AVC form carries packet type + composition offset).
pub fn read_video_header(data: &[u8]) -> (VideoTag, usize) {
    let Some(&first) = data.first() else {
        return (VideoTag::default(), 0);
    };
    let codec = first & 0x0F;
    let mut tag = VideoTag {
        codec,
        frame: match first >> 4 {
            1 => VideoFrame::Key,
            3 => VideoFrame::Disposable,
            4 => VideoFrame::GeneratedKey,
            5 => VideoFrame::Command,
            _ => VideoFrame::Inter,
        },
        time: 0,
    };
    if codec == VIDEO_CODEC_AVC && data.len() >= 5 {
        if data[1] == 0 {
            tag.frame = VideoFrame::Config;
        }
        return (tag, 5);
    }
    (tag, 1)
}
