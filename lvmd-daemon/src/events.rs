//! Registry notifications fanned out to socket subscribers.

use serde::Serialize;
use tokio::sync::broadcast;

use lvmd_core::{EventSink, Handle, PropertyBag};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ObjectEvent {
    ObjectAdded { handle: Handle, properties: PropertyBag },
    ObjectRemoved { handle: Handle },
    PropertiesChanged { handle: Handle, changed: PropertyBag },
}

impl ObjectEvent {
    pub fn handle(&self) -> Handle {
        match self {
            ObjectEvent::ObjectAdded { handle, .. }
            | ObjectEvent::ObjectRemoved { handle }
            | ObjectEvent::PropertiesChanged { handle, .. } => *handle,
        }
    }
}

/// [`EventSink`] backed by a broadcast channel. Events with no subscriber
/// are only logged.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<ObjectEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ObjectEvent> {
        self.tx.subscribe()
    }

    fn publish(&self, event: ObjectEvent) {
        tracing::debug!(handle = %event.handle(), ?event, "object event");
        let _ = self.tx.send(event);
    }
}

impl EventSink for BroadcastSink {
    fn object_added(&self, handle: Handle, properties: &PropertyBag) {
        self.publish(ObjectEvent::ObjectAdded {
            handle,
            properties: properties.clone(),
        });
    }

    fn object_removed(&self, handle: Handle) {
        self.publish(ObjectEvent::ObjectRemoved { handle });
    }

    fn properties_changed(&self, handle: Handle, changed: &PropertyBag) {
        self.publish(ObjectEvent::PropertiesChanged {
            handle,
            changed: changed.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lvmd_core::{HandleKind, PropertyValue};

    #[test]
    fn subscribers_receive_events_as_tagged_json() {
        let sink = BroadcastSink::new(8);
        let mut rx = sink.subscribe();
        let handle = Handle::new(HandleKind::Vg, 0);
        let mut changed = PropertyBag::new();
        changed.insert("Name", PropertyValue::from("tank"));

        sink.properties_changed(handle, &changed);
        sink.object_removed(handle);

        let first = serde_json::to_value(rx.try_recv().expect("event")).expect("json");
        assert_eq!(first["event"], "properties_changed");
        assert_eq!(first["handle"], "/com/redhat/lvmdbus1/Vg/0");
        assert_eq!(first["changed"]["Name"], "tank");
        let second = rx.try_recv().expect("event");
        assert!(matches!(second, ObjectEvent::ObjectRemoved { .. }));
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        let sink = BroadcastSink::new(1);
        sink.object_removed(Handle::new(HandleKind::Pv, 1));
    }
}
