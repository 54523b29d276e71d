use super::SourceMessage;
use crate::prelude::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

/// Messages queued per chat while the worker is busy relaying earlier ones
pub(crate) const CHAT_QUEUE_CAPACITY: usize = 100;

/// Routes new messages from the source to the subscribers of their chats.
///
/// There may be only one subscriber per chat. A new subscription for the
/// same chat replaces the previous one.
#[derive(Debug, Default)]
pub(crate) struct EventHub {
    subscribers: Mutex<HashMap<i64, Subscriber>>,
    next_id: AtomicU64,
}

#[derive(Debug)]
struct Subscriber {
    id: u64,
    send: mpsc::Sender<SourceMessage>,
}

/// Unregisters the subscriber when dropped
#[derive(Debug)]
pub(crate) struct Subscription {
    hub: Weak<EventHub>,
    chat_id: i64,
    id: u64,
}

impl EventHub {
    pub(crate) fn subscribe(
        self: &Arc<Self>,
        chat_id: i64,
    ) -> (Subscription, mpsc::Receiver<SourceMessage>) {
        let (send, recv) = mpsc::channel(CHAT_QUEUE_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let prev = self
            .subscribers
            .lock()
            .insert(chat_id, Subscriber { id, send });

        if prev.is_some() {
            debug!(chat_id, "Replaced the previous subscriber of the chat");
        }

        let subscription = Subscription {
            hub: Arc::downgrade(self),
            chat_id,
            id,
        };

        (subscription, recv)
    }

    /// Returns `false` if the message wasn't queued: nobody is subscribed to
    /// its chat, or the queue of the chat is full
    pub(crate) fn publish(&self, message: SourceMessage) -> bool {
        let mut subscribers = self.subscribers.lock();

        let Some(subscriber) = subscribers.get(&message.chat_id) else {
            trace!(chat_id = message.chat_id, "No subscribers for the chat");
            return false;
        };

        match subscriber.send.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(message)) => {
                warn!(
                    chat_id = message.chat_id,
                    message_id = message.id,
                    capacity = CHAT_QUEUE_CAPACITY,
                    "The queue of the chat is full, dropping the message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // The receiving side is gone, so the subscription is stale
                subscribers.retain(|_, subscriber| !subscriber.send.is_closed());
                false
            }
        }
    }

    pub(crate) fn subscribed_chats(&self) -> Vec<i64> {
        let mut chats: Vec<_> = self.subscribers.lock().keys().copied().collect();
        chats.sort_unstable();
        chats
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(hub) = self.hub.upgrade() else {
            return;
        };

        let mut subscribers = hub.subscribers.lock();

        // The subscriber may have already been replaced by a newer one
        if subscribers
            .get(&self.chat_id)
            .is_some_and(|subscriber| subscriber.id == self.id)
        {
            subscribers.remove(&self.chat_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(chat_id: i64, id: i32) -> SourceMessage {
        SourceMessage {
            chat_id,
            id,
            text: format!("message {id}"),
            media: None,
            forwarded: false,
        }
    }

    #[test_log::test(tokio::test)]
    async fn messages_are_routed_by_chat() {
        let hub = Arc::new(EventHub::default());

        let (_sub_a, mut recv_a) = hub.subscribe(1);
        let (_sub_b, mut recv_b) = hub.subscribe(2);

        assert!(hub.publish(message(1, 10)));
        assert!(hub.publish(message(2, 20)));
        assert!(hub.publish(message(1, 11)));
        assert!(!hub.publish(message(3, 30)));

        assert_eq!(recv_a.recv().await.unwrap().id, 10);
        assert_eq!(recv_a.recv().await.unwrap().id, 11);
        assert_eq!(recv_b.recv().await.unwrap().id, 20);
    }

    #[test_log::test(tokio::test)]
    async fn full_queue_drops_new_messages() {
        let hub = Arc::new(EventHub::default());
        let (_sub, mut recv) = hub.subscribe(1);

        let capacity = i32::try_from(CHAT_QUEUE_CAPACITY).unwrap();

        for id in 0..capacity {
            assert!(hub.publish(message(1, id)));
        }
        assert!(!hub.publish(message(1, capacity)));

        // The subscription survives the overflow
        assert_eq!(hub.subscribed_chats(), [1]);
        assert_eq!(recv.recv().await.unwrap().id, 0);
        assert!(hub.publish(message(1, capacity + 1)));

        let mut last = None;
        while let Ok(message) = recv.try_recv() {
            last = Some(message.id);
        }
        assert_eq!(last, Some(capacity + 1));
    }

    #[test]
    fn dropped_subscription_unregisters() {
        let hub = Arc::new(EventHub::default());

        let (sub, _recv) = hub.subscribe(1);
        assert_eq!(hub.subscribed_chats(), [1]);

        drop(sub);

        assert!(hub.subscribed_chats().is_empty());
        assert!(!hub.publish(message(1, 10)));
    }

    #[test]
    fn stale_subscription_doesnt_remove_its_replacement() {
        let hub = Arc::new(EventHub::default());

        let (old, _old_recv) = hub.subscribe(1);
        let (_new, mut new_recv) = hub.subscribe(1);

        drop(old);

        assert!(hub.publish(message(1, 10)));
        assert_eq!(new_recv.try_recv().unwrap().id, 10);
    }
}
