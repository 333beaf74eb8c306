use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use arc_swap::ArcSwap;
use log::{debug, warn};

use crate::{error::NetworkError, protocol::CONTROL_TYPE};

use super::{Message, MessageError, MessageKind};

type MessageKey = (u8, u8);
type Validator = dyn Fn(Message) -> Result<Message, MessageError> + Send + Sync;

/// Describes how an incoming (type, subtype) is turned into a [`Message`].
#[derive(Clone)]
pub struct MessageConstructor {
    kind: MessageKind,
    exclusive: bool,
    validator: Option<Arc<Validator>>,
}

impl fmt::Debug for MessageConstructor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageConstructor")
            .field("kind", &self.kind)
            .field("exclusive", &self.exclusive)
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

impl MessageConstructor {
    fn of(kind: MessageKind) -> Self {
        Self {
            kind,
            exclusive: false,
            validator: None,
        }
    }

    pub fn message() -> Self {
        Self::of(MessageKind::Message)
    }

    pub fn request() -> Self {
        Self::of(MessageKind::Request)
    }

    pub fn response() -> Self {
        Self::of(MessageKind::Response)
    }

    /// Routes the type through the exclusive lane.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Runs `validator` on every incoming message of this type before delivery. A rejected
    /// message is logged and dropped.
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(Message) -> Result<Message, MessageError> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub(crate) fn construct(&self, mut message: Message) -> Result<Message, MessageError> {
        message.kind = self.kind;
        message.exclusive = self.exclusive;
        match &self.validator {
            Some(validate) => validate(message),
            None => Ok(message),
        }
    }
}

/// Application callback for delivered messages.
pub trait MessageReceiver: Send + Sync {
    fn on_message(&self, message: Message);
}

impl<F> MessageReceiver for F
where
    F: Fn(Message) + Send + Sync,
{
    fn on_message(&self, message: Message) {
        self(message)
    }
}

/// Copy-on-write map. Reads take a snapshot without locking, writers serialize on a mutex and
/// publish a new snapshot.
struct SnapshotMap<V> {
    snapshot: ArcSwap<HashMap<MessageKey, V>>,
    write: Mutex<()>,
}

impl<V: Clone> SnapshotMap<V> {
    fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(HashMap::new()),
            write: Mutex::new(()),
        }
    }

    fn get(&self, key: &MessageKey) -> Option<V> {
        self.snapshot.load().get(key).cloned()
    }

    fn update<R>(&self, f: impl FnOnce(&mut HashMap<MessageKey, V>) -> R) -> R {
        let _guard = self.write.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = HashMap::clone(&self.snapshot.load_full());
        let result = f(&mut next);
        self.snapshot.store(Arc::new(next));
        result
    }
}

/// Registered message types of one engine.
pub struct MessageRegistry {
    types: SnapshotMap<Arc<MessageConstructor>>,
}

impl Default for MessageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self {
            types: SnapshotMap::new(),
        }
    }

    pub fn register(
        &self,
        msg_type: u8,
        subtype: u8,
        constructor: MessageConstructor,
    ) -> Result<(), NetworkError> {
        if msg_type == CONTROL_TYPE {
            warn!("type {msg_type} is reserved, rejecting registration of ({msg_type}, {subtype})");
            return Err(NetworkError::RegistrationConflict { msg_type, subtype });
        }

        self.types.update(|types| {
            if types.contains_key(&(msg_type, subtype)) {
                warn!("message type ({msg_type}, {subtype}) is already registered");
                return Err(NetworkError::RegistrationConflict { msg_type, subtype });
            }

            debug!("registered message type ({msg_type}, {subtype}): {constructor:?}");
            types.insert((msg_type, subtype), Arc::new(constructor));
            Ok(())
        })
    }

    pub fn lookup(&self, msg_type: u8, subtype: u8) -> Option<Arc<MessageConstructor>> {
        self.types.get(&(msg_type, subtype))
    }

    pub fn is_registered(&self, msg_type: u8, subtype: u8) -> bool {
        self.lookup(msg_type, subtype).is_some()
    }
}

/// Application receivers of one engine, at most one per (type, subtype).
pub struct ReceiverStore {
    receivers: SnapshotMap<Arc<dyn MessageReceiver>>,
}

impl Default for ReceiverStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiverStore {
    pub fn new() -> Self {
        Self {
            receivers: SnapshotMap::new(),
        }
    }

    pub fn register(
        &self,
        msg_type: u8,
        subtype: u8,
        receiver: Arc<dyn MessageReceiver>,
    ) -> Result<(), NetworkError> {
        self.receivers.update(|receivers| {
            if receivers.contains_key(&(msg_type, subtype)) {
                warn!("receiver for ({msg_type}, {subtype}) is already registered");
                return Err(NetworkError::RegistrationConflict { msg_type, subtype });
            }
            receivers.insert((msg_type, subtype), receiver);
            Ok(())
        })
    }

    /// Removes `receiver` if it is the one registered for the type.
    pub fn unregister(
        &self,
        msg_type: u8,
        subtype: u8,
        receiver: &Arc<dyn MessageReceiver>,
    ) -> bool {
        self.receivers.update(|receivers| match receivers.get(&(msg_type, subtype)) {
            Some(current) if Arc::ptr_eq(current, receiver) => {
                receivers.remove(&(msg_type, subtype));
                true
            }
            _ => false,
        })
    }

    pub fn get(&self, msg_type: u8, subtype: u8) -> Option<Arc<dyn MessageReceiver>> {
        self.receivers.get(&(msg_type, subtype))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::node::NodeId;

    use super::*;

    #[test]
    fn duplicate_and_reserved_types_are_rejected() {
        let registry = MessageRegistry::new();
        registry
            .register(5, 1, MessageConstructor::request())
            .unwrap();

        assert!(matches!(
            registry.register(5, 1, MessageConstructor::message()),
            Err(NetworkError::RegistrationConflict {
                msg_type: 5,
                subtype: 1
            })
        ));
        assert!(matches!(
            registry.register(CONTROL_TYPE, 3, MessageConstructor::message()),
            Err(NetworkError::RegistrationConflict { .. })
        ));

        assert_eq!(
            registry.lookup(5, 1).unwrap().kind(),
            MessageKind::Request
        );
        assert!(!registry.is_registered(5, 2));
    }

    #[test]
    fn constructor_sets_kind_and_lane() {
        let constructor = MessageConstructor::response().exclusive();
        let message = constructor
            .construct(Message::new(NodeId(1), 5, 1))
            .unwrap();

        assert_eq!(message.kind, MessageKind::Response);
        assert!(message.exclusive);
    }

    #[test]
    fn validator_rejects_messages() {
        let constructor = MessageConstructor::message().with_validator(|message| {
            if message.payload.len() == 8 {
                Ok(message)
            } else {
                Err(MessageError::Invalid {
                    msg_type: message.msg_type,
                    subtype: message.subtype,
                    reason: "expected 8 bytes".to_string(),
                })
            }
        });

        let short = Message::new(NodeId(1), 5, 1).with_payload(vec![1]);
        assert!(constructor.construct(short).is_err());

        let ok = Message::new(NodeId(1), 5, 1).with_payload(vec![0; 8]);
        assert!(constructor.construct(ok).is_ok());
    }

    #[test]
    fn one_receiver_per_type() {
        let store = ReceiverStore::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        let first: Arc<dyn MessageReceiver> = Arc::new(move |_: Message| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let second: Arc<dyn MessageReceiver> = Arc::new(|_: Message| {});

        store.register(5, 1, Arc::clone(&first)).unwrap();
        assert!(store.register(5, 1, Arc::clone(&second)).is_err());

        store.get(5, 1).unwrap().on_message(Message::default());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // only the registered receiver can remove itself
        assert!(!store.unregister(5, 1, &second));
        assert!(store.unregister(5, 1, &first));
        assert!(store.get(5, 1).is_none());
    }
}
