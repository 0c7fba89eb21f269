// src/media/publish.rs - Cross-thread producer façade
//
// A producer thread holds a Publish handle and queues typed actions; the
// server thread drains the queue, resolves the publication by name and runs
// them. The publication itself never leaves the server thread.

use crate::media::{AudioTag, DataKind, Publication, VideoTag};
use bytes::Bytes;
use log::warn;

/// One unit of work against a server-owned publication.
#[derive(Debug)]
pub enum Action {
    /// Create the publication (sent by Publish::new).
    Publish { name: String },
    /// Forget cached parameters.
    Reset { name: String },
    /// Push queued media toward subscribers, refreshing the RTT estimate.
    Flush { name: String, ping: u32 },
    /// Tear the publication down (sent on Publish drop).
    Unpublish { name: String },
    Audio {
        name: String,
        track: u16,
        tag: AudioTag,
        payload: Bytes,
    },
    Video {
        name: String,
        track: u16,
        tag: VideoTag,
        payload: Bytes,
    },
    Data {
        name: String,
        track: u16,
        kind: DataKind,
        payload: Bytes,
    },
}

impl Action {
    pub fn name(&self) -> &str {
        match self {
            Action::Publish { name }
            | Action::Reset { name }
            | Action::Flush { name, .. }
            | Action::Unpublish { name }
            | Action::Audio { name, .. }
            | Action::Video { name, .. }
            | Action::Data { name, .. } => name,
        }
    }

    /// Run against the resolved publication (lifecycle variants are handled
    /// by the directory, not here).
    pub fn run(self, publication: &mut Publication) {
        match self {
            Action::Reset { .. } => publication.reset(),
            Action::Flush { ping, .. } => publication.flush(ping),
            Action::Audio {
                track, tag, payload, ..
            } => publication.write_audio(track, &tag, payload, 0),
            Action::Video {
                track, tag, payload, ..
            } => publication.write_video(track, &tag, payload, 0),
            Action::Data {
                track,
                kind,
                payload,
                ..
            } => publication.write_data(track, kind, payload, 0),
            Action::Publish { name } | Action::Unpublish { name } => {
                warn!("lifecycle action for {name} reached a publication");
            }
        }
    }
}

/// Producer handle: clonable into any thread, every method queues an action.
/// Dropping the last clone unpublishes.
pub struct Publish {
    name: String,
    sender: crossbeam_channel::Sender<Action>,
}

impl Publish {
    /// Queue the publication's creation and return the handle.
    pub(crate) fn open(name: &str, sender: crossbeam_channel::Sender<Action>) -> Publish {
        let publish = Publish {
            name: name.to_string(),
            sender,
        };
        publish.queue(Action::Publish {
            name: publish.name.clone(),
        });
        publish
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn queue(&self, action: Action) -> bool {
        if self.sender.send(action).is_err() {
            warn!("server gone, dropping action for {}", self.name);
            return false;
        }
        true
    }

    pub fn reset(&self) -> bool {
        self.queue(Action::Reset {
            name: self.name.clone(),
        })
    }

    pub fn flush(&self, ping: u32) -> bool {
        self.queue(Action::Flush {
            name: self.name.clone(),
            ping,
        })
    }

    pub fn audio(&self, track: u16, tag: AudioTag, payload: Bytes) -> bool {
        self.queue(Action::Audio {
            name: self.name.clone(),
            track,
            tag,
            payload,
        })
    }

    pub fn video(&self, track: u16, tag: VideoTag, payload: Bytes) -> bool {
        self.queue(Action::Video {
            name: self.name.clone(),
            track,
            tag,
            payload,
        })
    }

    pub fn data(&self, track: u16, kind: DataKind, payload: Bytes) -> bool {
        self.queue(Action::Data {
            name: self.name.clone(),
            track,
            kind,
            payload,
        })
    }
}

impl Drop for Publish {
    fn drop(&mut self) {
        self.queue(Action::Unpublish {
            name: self.name.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::hub::{PeerInfo, ServerApi};
    use crate::media::StreamHub;
    use crate::media::VideoFrame;

    fn init_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    /// Drive a hub from a Publish handle the way the server thread does.
    fn drain(hub: &mut StreamHub, receiver: &crossbeam_channel::Receiver<Action>) {
        while let Ok(action) = receiver.try_recv() {
            hub.run_action(action);
        }
    }

    #[test]
    fn test_publish_facade_lifecycle() {
        init_logs();
        let (sender, receiver) = crossbeam_channel::unbounded();
        let mut hub = StreamHub::new();

        let publish = Publish::open("feed", sender);
        assert!(publish.video(
            0,
            VideoTag {
                frame: VideoFrame::Key,
                ..VideoTag::default()
            },
            Bytes::from_static(b"frame"),
        ));
        assert!(publish.flush(20));

        drain(&mut hub, &receiver);
        let publication = hub.publication("feed").expect("created by the queue");
        assert!(publication.borrow().has_video());

        drop(publish);
        drain(&mut hub, &receiver);
        assert!(hub.publication("feed").is_none(), "drop unpublishes");
    }

    #[test]
    fn test_actions_from_another_thread() {
        init_logs();
        let (sender, receiver) = crossbeam_channel::unbounded();
        let mut hub = StreamHub::new();

        let producer = std::thread::spawn(move || {
            let publish = Publish::open("remote", sender);
            for time in 0..8u32 {
                publish.video(
                    0,
                    VideoTag {
                        frame: VideoFrame::Key,
                        time,
                        ..VideoTag::default()
                    },
                    Bytes::from_static(b"v"),
                );
            }
            // handle dropped here -> unpublish queued last
        });
        producer.join().expect("producer thread");

        drain(&mut hub, &receiver);
        assert!(hub.publication("remote").is_none());
    }

    #[test]
    fn test_queue_after_server_gone() {
        init_logs();
        let (sender, receiver) = crossbeam_channel::unbounded();
        let publish = Publish::open("feed", sender);
        drop(receiver);
        assert!(!publish.flush(0), "send into a dead queue reports failure");
    }

    #[test]
    fn test_hub_queue_round_trip() {
        init_logs();
        let (sender, receiver) = crossbeam_channel::unbounded();
        let mut hub = StreamHub::new();
        hub.set_action_queue(sender);
        hub.publish(&PeerInfo::internal(), "feed").expect("publish");
        assert!(hub.queue(Action::Reset {
            name: "feed".into()
        }));
        drain(&mut hub, &receiver);
    }
}
