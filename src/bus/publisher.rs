//! Publishing seam for collaborators outside the messaging core.

use std::sync::Arc;

use crate::message::Message;

/// Anything that accepts messages for fan-out.
///
/// Implemented by [`Bus`](super::Bus). Persistence layers depend on this
/// trait, not on the bus, so they can publish committed events without
/// knowing how delivery works.
pub trait Publisher: Send + Sync {
    fn publish_message(&self, message: Arc<dyn Message>);

    /// Publish in order. Default publishes one at a time.
    fn publish_batch(&self, messages: Vec<Arc<dyn Message>>) {
        for message in messages {
            self.publish_message(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;
    use crate::message::{MessageHeader, MessageRegistry};
    use std::sync::Mutex;

    #[derive(Debug, courier::Message)]
    #[message(name = "publisher.Committed", event)]
    struct Committed {
        header: MessageHeader,
        version: u64,
    }

    fn commit_all(publisher: &dyn Publisher, versions: &[u64]) {
        publisher.publish_batch(
            versions
                .iter()
                .map(|&version| {
                    Arc::new(Committed {
                        header: MessageHeader::new(),
                        version,
                    }) as Arc<dyn Message>
                })
                .collect(),
        );
    }

    #[test]
    fn bus_is_a_publisher() {
        let bus = Bus::with_registry("publisher", Arc::new(MessageRegistry::new()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(move |c: &Committed| sink.lock().unwrap().push(c.version))
            .unwrap();

        commit_all(&bus, &[1, 2, 3]);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }
}
