//! **flashcast** is an embeddable live media-streaming server core for the
//! Flash protocol family: RTMP-like framing over TCP and the RTMFP reliable
//! transport over UDP.
//!
//! # Architecture
//!
//! Three subsystems carry the load:
//!
//! - **Socket layer** ([`net`]): non-blocking TCP/UDP endpoints with ordered
//!   per-socket send queues, flushed by a readiness reactor (epoll on Linux,
//!   kqueue on macOS/BSD) dispatching to a sticky worker pool.
//! - **RTMFP writer** ([`rtmfp`]): per-flow reliability over UDP with
//!   stage-indexed retransmission, acknowledgement-driven progress and a
//!   sqrt(2)-growing repeat backoff capped at 10 s.
//! - **Stream routing** ([`media`], [`flash`]): the publish/subscribe
//!   directory, the per-NetStream command state machine (play / publish /
//!   pause / seek), media fan-out with keyframe gating, optional recording
//!   hand-off, and the peer rendezvous directory ([`rendezvous`]).
//!
//! # Threading
//!
//! One poll thread and a small worker pool own all socket IO; callbacks for a
//! single socket are serialized. One *server thread* owns the directory and
//! every publication; producers in other threads reach it exclusively through
//! the [`media::Publish`] action queue.
//!
//! # Example
//!
//! ```rust,no_run
//! use flashcast::MediaServer;
//! use flashcast::media::VideoTag;
//! use bytes::Bytes;
//!
//! let server = MediaServer::new("0.0.0.0:1935").start().unwrap();
//!
//! // feed a live stream from any thread
//! let publish = server.publish("live").unwrap();
//! publish.video(0, VideoTag::default(), Bytes::from_static(b"..."));
//! publish.flush(0);
//!
//! // clients now play "live"; dropping the handle unpublishes
//! drop(publish);
//! server.stop();
//! ```

pub mod amf;
pub mod error;
pub mod flash;
pub mod media;
pub mod net;
pub mod rendezvous;
pub mod rtmfp;
mod server;

pub use error::NetError;
pub use server::{Ended, Initialization, MediaServer, Running};
