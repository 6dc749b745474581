//! The subscription client boundary.
//!
//! The client subscribes to list resources it hydrates and the server
//! pushes `Notification` documents to the `/notify` listener. This module
//! builds the subscription resources and dispatches incoming
//! notifications against the cache; the HTTP listener, TLS and connection
//! identity live behind the [`Connection`] trait.

use crate::{
    event::{Event, EventQueue},
    resource::ResourceCache,
    StubId,
};
use sep2::types::{self, Notification};
use sep2::{SeObject, Slot};

/// The connection layer as the dispatcher sees it.
pub trait Connection {
    fn secure(&self) -> bool;
    /// LFDI of the peer's client certificate.
    fn lfdi(&self) -> &[u8; 20];
    fn post(&mut self, uri: &str, type_id: u16, obj: &SeObject);
    fn close(&mut self);
}

/// The notification listener's URI as advertised in subscriptions.
pub fn notification_uri(secure: bool, host: &str, port: u16) -> String {
    let scheme = if secure { "https" } else { "http" };
    format!("{}://{}:{}/notify", scheme, host, port)
}

/// Subscribe to a hydrated resource unless already subscribed.
pub fn subscribe(
    cache: &mut ResourceCache,
    conn: &mut dyn Connection,
    stub: StubId,
    uri: &str,
    notification_uri: &str,
) {
    let s = cache.get_mut(stub);
    if s.subscribed {
        return;
    }
    let level = format!("-{}", types::SCHEMA_ID);
    let sub = types::new_subscription(&s.uri, &level, 10, notification_uri);
    conn.post(uri, types::type_id("Subscription"), &sub);
    s.subscribed = true;
}

/// What a notification asked the client to do next.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NotifyAction {
    /// The carried resource replaced the cached one.
    Updated(StubId),
    /// The resource moved; re-fetch it at the new location.
    Moved(StubId, String),
    /// The subscription ended; nothing further.
    Cancelled(StubId),
    /// The resource was deleted server-side.
    Removed(StubId),
    /// Resolved, but the notification carried nothing applicable.
    Ignored(StubId),
    /// Nothing matched; the caller should close the connection.
    Dropped,
}

/// Strip scheme and authority off an absolute URI.
fn uri_path(uri: &str) -> &str {
    match uri.find("://") {
        Some(at) => match uri[at + 3..].find('/') {
            Some(slash) => &uri[at + 3 + slash..],
            None => "/",
        },
        None => uri,
    }
}

/// Dispatch one notification against the cache.
pub fn notification(
    cache: &mut ResourceCache,
    mut notif: SeObject,
    now: i64,
    events: &mut EventQueue,
) -> NotifyAction {
    let Some(uri) = Notification(&notif).subscribed_resource().map(uri_path).map(str::to_owned)
    else {
        return NotifyAction::Dropped;
    };
    let Some(stub) = cache.find(&uri) else {
        log::debug!("notification for unknown resource {}", uri);
        return NotifyAction::Dropped;
    };
    let status = Notification(&notif).status();
    match status {
        0 => {
            // default status: the carried resource replaces ours
            if let Slot::Substitution(ty, obj) = notif.take(types::NOTIF_OBJECT) {
                if ty == cache.get(stub).type_id {
                    let s = cache.get_mut(stub);
                    s.data.replace(*obj);
                    s.time = now;
                    return NotifyAction::Updated(stub);
                }
            }
            NotifyAction::Ignored(stub)
        }
        2 => {
            // subscription cancelled, resource moved
            cache.get_mut(stub).subscribed = false;
            match Notification(&notif).new_resource_uri() {
                Some(new_uri) => NotifyAction::Moved(stub, new_uri.to_owned()),
                None => NotifyAction::Cancelled(stub),
            }
        }
        1 | 3 => {
            // cancelled outright, or the resource definition changed
            cache.get_mut(stub).subscribed = false;
            NotifyAction::Cancelled(stub)
        }
        4 => {
            // resource deleted
            events.push(Event::ResourceRemove { stub });
            NotifyAction::Removed(stub)
        }
        _ => NotifyAction::Ignored(stub),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sep2::Parser;

    struct FakeConn {
        posts: Vec<(String, u16, SeObject)>,
        lfdi: [u8; 20],
    }

    impl Connection for FakeConn {
        fn secure(&self) -> bool {
            true
        }

        fn lfdi(&self) -> &[u8; 20] {
            &self.lfdi
        }

        fn post(&mut self, uri: &str, type_id: u16, obj: &SeObject) {
            self.posts.push((uri.to_owned(), type_id, obj.clone()));
        }

        fn close(&mut self) {}
    }

    fn hydrate(cache: &mut ResourceCache, uri: &str, xml: &str) -> StubId {
        let doc = Parser::xml(types::schema(), xml.as_bytes()).parse().unwrap();
        let ty = doc.object.type_id();
        cache.insert(uri, ty, doc.object, 0)
    }

    #[test]
    fn uri_template() {
        assert_eq!(notification_uri(true, "192.0.2.7", 8443), "https://192.0.2.7:8443/notify");
        assert_eq!(notification_uri(false, "[::1]", 8080), "http://[::1]:8080/notify");
    }

    #[test]
    fn subscribe_posts_once() {
        let mut cache = ResourceCache::new();
        let stub = hydrate(&mut cache, "/derp/0/derc", r#"<DERControlList all="0" results="0"/>"#);
        let mut conn = FakeConn { posts: Vec::new(), lfdi: [0; 20] };

        let n_uri = notification_uri(true, "client", 8443);
        subscribe(&mut cache, &mut conn, stub, "/sub", &n_uri);
        subscribe(&mut cache, &mut conn, stub, "/sub", &n_uri);
        assert_eq!(conn.posts.len(), 1);

        let (uri, ty, sub) = &conn.posts[0];
        assert_eq!(uri, "/sub");
        assert_eq!(*ty, types::type_id("Subscription"));
        assert_eq!(sub.text(types::SUB_RESOURCE), Some("/derp/0/derc"));
        assert_eq!(sub.text(types::SUB_LEVEL), Some("-S1"));
        assert_eq!(sub.uint(types::SUB_LIMIT), Some(10));
        assert_eq!(sub.text(types::SUB_NOTIFICATION_URI), Some(n_uri.as_str()));
    }

    fn notif_doc(body: &str) -> SeObject {
        Parser::xml(types::schema(), body.as_bytes()).parse().unwrap().object
    }

    #[test]
    fn update_replaces_resource_data() {
        let mut cache = ResourceCache::new();
        let stub = hydrate(&mut cache, "/derpl", r#"<DERProgramList all="0" results="0"/>"#);
        let mut events = EventQueue::new();

        let notif = notif_doc(
            r#"<Notification>
  <subscribedResource>https://server:8443/derpl</subscribedResource>
  <Resource xsi:type="DERProgramList" all="1" results="1">
    <DERProgram><mRID>0A000000000000000000000000000001</mRID><primacy>3</primacy></DERProgram>
  </Resource>
  <status>0</status>
</Notification>"#,
        );
        let action = notification(&mut cache, notif, 42, &mut events);
        assert_eq!(action, NotifyAction::Updated(stub));
        assert_eq!(cache.get(stub).time, 42);
        assert_eq!(cache.get(stub).data.list(types::LIST_ITEMS).len(), 1);
        assert!(events.is_empty());
    }

    #[test]
    fn type_mismatch_is_dropped() {
        let mut cache = ResourceCache::new();
        hydrate(&mut cache, "/derpl", r#"<DERProgramList all="0" results="0"/>"#);
        let mut events = EventQueue::new();
        let notif = notif_doc(
            r#"<Notification>
  <subscribedResource>/derpl</subscribedResource>
  <Resource xsi:type="EndDevice"><sFDI>1</sFDI><changedTime>0</changedTime></Resource>
  <status>0</status>
</Notification>"#,
        );
        let stub = cache.find("/derpl").unwrap();
        assert_eq!(notification(&mut cache, notif, 0, &mut events), NotifyAction::Ignored(stub));
    }

    #[test]
    fn cancellation_statuses() {
        let mut cache = ResourceCache::new();
        let stub = hydrate(&mut cache, "/derpl", r#"<DERProgramList all="0" results="0"/>"#);
        cache.get_mut(stub).subscribed = true;
        let mut events = EventQueue::new();

        let moved = notif_doc(
            r#"<Notification>
  <subscribedResource>/derpl</subscribedResource>
  <newResourceURI>/derpl2</newResourceURI>
  <status>2</status>
</Notification>"#,
        );
        assert_eq!(
            notification(&mut cache, moved, 0, &mut events),
            NotifyAction::Moved(stub, "/derpl2".to_owned())
        );
        assert!(!cache.get(stub).subscribed);

        let cancelled = notif_doc(
            r#"<Notification>
  <subscribedResource>/derpl</subscribedResource>
  <status>1</status>
</Notification>"#,
        );
        assert_eq!(notification(&mut cache, cancelled, 0, &mut events), NotifyAction::Cancelled(stub));

        let deleted = notif_doc(
            r#"<Notification>
  <subscribedResource>/derpl</subscribedResource>
  <status>4</status>
</Notification>"#,
        );
        assert_eq!(notification(&mut cache, deleted, 0, &mut events), NotifyAction::Removed(stub));
        assert_eq!(events.pop(), Some(Event::ResourceRemove { stub }));
    }
}
