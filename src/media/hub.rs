// src/media/hub.rs - Publish/subscribe directory
//
// Maps live names to publications and wires subscriptions in. Owned by the
// server thread; nothing here locks. The published-names set is mirrored
// into a shared DashSet so front-end threads can answer existence checks
// without crossing into the server thread.

use crate::error::{NetError, Result};
use crate::media::publish::Action;
use crate::media::{Publication, Recorder, Subscription};
use crate::net::SocketAddress;
use dashmap::DashSet;
use log::{info, warn};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

/// The client identity a protocol layer carries into API calls.
#[derive(Debug, Clone, Copy)]
pub struct PeerInfo {
    pub address: SocketAddress,
    /// Round-trip estimate in milliseconds, forwarded with media writes.
    pub ping: u32,
}

impl PeerInfo {
    /// Identity used for server-internal producers (the Publish façade).
    pub fn internal() -> PeerInfo {
        PeerInfo {
            address: SocketAddress::wildcard(),
            ping: 0,
        }
    }
}

/// Builds a recorder for a publication whose name requests recording
/// (carries a file extension). `append` reflects an append-mode publish.
/// Send because the factory travels into the server thread.
pub type RecorderFactory = Box<dyn Fn(&str, bool) -> Result<Box<dyn Recorder>> + Send>;

/// The server API consumed by the protocol layers.
pub trait ServerApi {
    /// Create the publication for `name`, or fail when the name is taken.
    /// A recording setup problem is reported alongside a live publication.
    #[allow(clippy::type_complexity)]
    fn publish(
        &mut self,
        peer: &PeerInfo,
        name: &str,
    ) -> Result<(Rc<RefCell<Publication>>, Option<NetError>)>;

    fn unpublish(&mut self, publication: &Rc<RefCell<Publication>>, peer: &PeerInfo);

    fn subscribe(
        &mut self,
        name: &str,
        peer: &PeerInfo,
        subscription: &Rc<RefCell<Subscription>>,
    ) -> Result<()>;

    fn unsubscribe(&mut self, peer: &PeerInfo, subscription: &Rc<RefCell<Subscription>>);

    /// Queue an action for the server thread (cross-thread producers).
    fn queue(&mut self, action: Action) -> bool;
}

pub struct StreamHub {
    publications: HashMap<String, Rc<RefCell<Publication>>>,
    names: Arc<DashSet<String>>,
    recorder_factory: Option<RecorderFactory>,
    actions: Option<crossbeam_channel::Sender<Action>>,
}

/// Strip the query part: "clip.flv?append=true" -> ("clip.flv", "append=true").
pub(crate) fn split_query(name: &str) -> (&str, &str) {
    match name.split_once('?') {
        Some((base, query)) => (base, query),
        None => (name, ""),
    }
}

fn has_extension(base: &str) -> bool {
    base.rsplit('/').next().is_some_and(|segment| {
        segment
            .rfind('.')
            .is_some_and(|dot| dot + 1 < segment.len())
    })
}

impl StreamHub {
    pub fn new() -> StreamHub {
        StreamHub {
            publications: HashMap::new(),
            names: Arc::new(DashSet::new()),
            recorder_factory: None,
            actions: None,
        }
    }

    pub fn set_recorder_factory(&mut self, factory: RecorderFactory) {
        self.recorder_factory = Some(factory);
    }

    pub(crate) fn set_action_queue(&mut self, sender: crossbeam_channel::Sender<Action>) {
        self.actions = Some(sender);
    }

    /// Shared snapshot of live names, safe to read from any thread.
    pub fn names(&self) -> Arc<DashSet<String>> {
        self.names.clone()
    }

    pub fn publication(&self, name: &str) -> Option<Rc<RefCell<Publication>>> {
        self.publications.get(split_query(name).0).cloned()
    }

    /// Drain-side entry point: resolve and run one queued action.
    pub fn run_action(&mut self, action: Action) {
        let internal = PeerInfo::internal();
        match action {
            Action::Publish { name } => {
                if let Err(error) = self.publish(&internal, &name) {
                    warn!("queued publish {name} failed: {error}");
                }
            }
            Action::Unpublish { name } => {
                if let Some(publication) = self.publication(&name) {
                    self.unpublish(&publication, &internal);
                }
            }
            action => {
                let Some(publication) = self.publication(action.name()) else {
                    warn!("action for unpublished stream {}", action.name());
                    return;
                };
                action.run(&mut publication.borrow_mut());
            }
        }
    }

    /// Flush every publication's subscribers (server-thread tick).
    pub fn flush_all(&mut self) {
        for publication in self.publications.values() {
            publication.borrow_mut().flush(0);
        }
    }
}

impl Default for StreamHub {
    fn default() -> StreamHub {
        StreamHub::new()
    }
}

impl ServerApi for StreamHub {
    fn publish(
        &mut self,
        peer: &PeerInfo,
        name: &str,
    ) -> Result<(Rc<RefCell<Publication>>, Option<NetError>)> {
        let (base, query) = split_query(name);
        if self.publications.contains_key(base) {
            return Err(NetError::Other {
                code: 0,
                context: format!(" ({base} already published)"),
            });
        }

        let mut publication = Publication::new(base);
        let mut record_problem = None;
        if has_extension(base) {
            // an extension requests recording
            let append = query.split('&').any(|part| part == "append=true");
            match &self.recorder_factory {
                Some(factory) => match factory(base, append) {
                    Ok(recorder) => publication.set_recorder(recorder),
                    Err(error) => record_problem = Some(error),
                },
                None => {
                    record_problem = Some(NetError::Unsupported(format!("recording {base}")))
                }
            }
        }

        info!("{} publishes {base}", peer.address);
        let publication = Rc::new(RefCell::new(publication));
        self.publications.insert(base.to_string(), publication.clone());
        self.names.insert(base.to_string());
        Ok((publication, record_problem))
    }

    fn unpublish(&mut self, publication: &Rc<RefCell<Publication>>, peer: &PeerInfo) {
        let name = publication.borrow().name().to_string();
        info!("{} unpublishes {name}", peer.address);
        // subscribers that ejected for another reason first keep that reason
        publication
            .borrow_mut()
            .evict_subscribers(crate::media::EjectReason::Error);
        self.publications.remove(&name);
        self.names.remove(&name);
    }

    fn subscribe(
        &mut self,
        name: &str,
        peer: &PeerInfo,
        subscription: &Rc<RefCell<Subscription>>,
    ) -> Result<()> {
        let (base, _) = split_query(name);
        let Some(publication) = self.publications.get(base) else {
            return Err(NetError::Unfound(base.to_string()));
        };
        info!("{} subscribes to {base}", peer.address);
        publication.borrow_mut().subscribe(subscription.clone());
        Ok(())
    }

    fn unsubscribe(&mut self, peer: &PeerInfo, subscription: &Rc<RefCell<Subscription>>) {
        let name = subscription.borrow().name().to_string();
        if let Some(publication) = self.publications.get(&name) {
            info!("{} unsubscribes from {name}", peer.address);
            publication.borrow_mut().unsubscribe(subscription);
        }
    }

    fn queue(&mut self, action: Action) -> bool {
        match &self.actions {
            Some(sender) => sender.send(action).is_ok(),
            None => false,
        }
    }
}
