//! Operation descriptors.
//!
//! An [`Operation`] is the move-only record of one requested cache operation:
//! the [`Command`] (verb, key, payload, numeric operand) plus the completion
//! handler that will receive its outcome. It is created once per external
//! call, travels through the offload executor and the completion dispatcher,
//! and is consumed when its handler runs.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::key::{display_key, validate_key};

/// Verb of an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpKind {
    Get,
    Gets,
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    Incr,
    Decr,
    Cas,
    Delete,
    Flush,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Get => "GET",
            OpKind::Gets => "GETS",
            OpKind::Set => "SET",
            OpKind::Add => "ADD",
            OpKind::Replace => "REPLACE",
            OpKind::Append => "APPEND",
            OpKind::Prepend => "PREPEND",
            OpKind::Incr => "INCR",
            OpKind::Decr => "DECR",
            OpKind::Cas => "CAS",
            OpKind::Delete => "DELETE",
            OpKind::Flush => "FLUSH",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage verbs share one backend call; the mode selects the semantics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreMode {
    /// Store unconditionally.
    Set,
    /// Store only if the key is absent.
    Add,
    /// Store only if the key is present.
    Replace,
    /// Append to an existing value.
    Append,
    /// Prepend to an existing value.
    Prepend,
    /// Store only if the item's CAS token still equals this one.
    Cas(u64),
}

impl StoreMode {
    pub fn kind(&self) -> OpKind {
        match self {
            StoreMode::Set => OpKind::Set,
            StoreMode::Add => OpKind::Add,
            StoreMode::Replace => OpKind::Replace,
            StoreMode::Append => OpKind::Append,
            StoreMode::Prepend => OpKind::Prepend,
            StoreMode::Cas(_) => OpKind::Cas,
        }
    }
}

/// A fully specified cache operation with owned key and payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Get {
        key: Vec<u8>,
    },
    Gets {
        key: Vec<u8>,
    },
    Store {
        mode: StoreMode,
        key: Vec<u8>,
        value: Vec<u8>,
        expiration: u32,
    },
    Incr {
        key: Vec<u8>,
        offset: u64,
    },
    Decr {
        key: Vec<u8>,
        offset: u64,
    },
    Delete {
        key: Vec<u8>,
        expiration: u32,
    },
    Flush {
        expiration: u32,
    },
}

/// Convert a caller supplied expiration (seconds, or an absolute unix time
/// above 30 days) into the protocol's unsigned field.
pub fn expiration_from(seconds: i64) -> Result<u32> {
    if seconds < 0 {
        return Err(Error::ValidationError(format!(
            "expiration must not be negative, got {}",
            seconds
        )));
    }
    u32::try_from(seconds).map_err(|_| {
        Error::ValidationError(format!("expiration {} is out of range", seconds))
    })
}

impl Command {
    pub fn get(key: impl AsRef<[u8]>) -> Self {
        Command::Get {
            key: key.as_ref().to_vec(),
        }
    }

    pub fn gets(key: impl AsRef<[u8]>) -> Self {
        Command::Gets {
            key: key.as_ref().to_vec(),
        }
    }

    /// Storage command for any [`StoreMode`].
    ///
    /// # Errors
    /// Returns `Error::ValidationError` for a negative or out-of-range expiration.
    pub fn store(
        mode: StoreMode,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        expiration: i64,
    ) -> Result<Self> {
        Ok(Command::Store {
            mode,
            key: key.as_ref().to_vec(),
            value: value.as_ref().to_vec(),
            expiration: expiration_from(expiration)?,
        })
    }

    pub fn set(key: impl AsRef<[u8]>, value: impl AsRef<[u8]>, expiration: i64) -> Result<Self> {
        Command::store(StoreMode::Set, key, value, expiration)
    }

    pub fn incr(key: impl AsRef<[u8]>, offset: u64) -> Self {
        Command::Incr {
            key: key.as_ref().to_vec(),
            offset,
        }
    }

    pub fn decr(key: impl AsRef<[u8]>, offset: u64) -> Self {
        Command::Decr {
            key: key.as_ref().to_vec(),
            offset,
        }
    }

    pub fn cas(
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        expiration: i64,
        token: u64,
    ) -> Result<Self> {
        Command::store(StoreMode::Cas(token), key, value, expiration)
    }

    pub fn delete(key: impl AsRef<[u8]>, expiration: i64) -> Result<Self> {
        Ok(Command::Delete {
            key: key.as_ref().to_vec(),
            expiration: expiration_from(expiration)?,
        })
    }

    pub fn flush(expiration: i64) -> Result<Self> {
        Ok(Command::Flush {
            expiration: expiration_from(expiration)?,
        })
    }

    pub fn kind(&self) -> OpKind {
        match self {
            Command::Get { .. } => OpKind::Get,
            Command::Gets { .. } => OpKind::Gets,
            Command::Store { mode, .. } => mode.kind(),
            Command::Incr { .. } => OpKind::Incr,
            Command::Decr { .. } => OpKind::Decr,
            Command::Delete { .. } => OpKind::Delete,
            Command::Flush { .. } => OpKind::Flush,
        }
    }

    /// The key, for every verb except FLUSH.
    pub fn key(&self) -> Option<&[u8]> {
        match self {
            Command::Get { key }
            | Command::Gets { key }
            | Command::Store { key, .. }
            | Command::Incr { key, .. }
            | Command::Decr { key, .. }
            | Command::Delete { key, .. } => Some(key.as_slice()),
            Command::Flush { .. } => None,
        }
    }

    /// Reject the command before it is offloaded.
    ///
    /// # Errors
    /// Returns `Error::ValidationError` for an empty key, or, with
    /// `verify_key`, an overlong key or one containing whitespace/control bytes.
    pub fn validate(&self, verify_key: bool) -> Result<()> {
        match self.key() {
            Some(key) => validate_key(key, verify_key),
            None => Ok(()),
        }
    }

    /// Key rendered for log lines (`*` for FLUSH).
    pub fn target(&self) -> String {
        self.key().map(display_key).unwrap_or_else(|| "*".to_string())
    }
}

/// A stored item together with its CAS token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Item {
    pub value: Vec<u8>,
    /// `None` when the backend does not report CAS tokens.
    pub cas: Option<u64>,
}

/// Successful outcome of an offloaded call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    /// GET payload.
    Value(Vec<u8>),
    /// GETS payload and token.
    Item(Item),
    /// INCR/DECR resulting counter.
    Counter(u64),
    /// Confirmation for every mutation verb.
    Stored,
}

/// Conversion from a [`Reply`] into the value a verb hands its caller.
pub trait FromReply: Sized {
    /// # Errors
    /// Returns `Error::Other` when the reply does not fit the verb.
    fn from_reply(reply: Reply) -> Result<Self>;
}

impl FromReply for Reply {
    fn from_reply(reply: Reply) -> Result<Self> {
        Ok(reply)
    }
}

impl FromReply for Vec<u8> {
    fn from_reply(reply: Reply) -> Result<Self> {
        match reply {
            Reply::Value(value) => Ok(value),
            Reply::Item(item) => Ok(item.value),
            other => Err(unexpected("a value", &other)),
        }
    }
}

impl FromReply for Item {
    fn from_reply(reply: Reply) -> Result<Self> {
        match reply {
            Reply::Item(item) => Ok(item),
            Reply::Value(value) => Ok(Item { value, cas: None }),
            other => Err(unexpected("an item", &other)),
        }
    }
}

impl FromReply for u64 {
    fn from_reply(reply: Reply) -> Result<Self> {
        match reply {
            Reply::Counter(counter) => Ok(counter),
            other => Err(unexpected("a counter", &other)),
        }
    }
}

impl FromReply for () {
    fn from_reply(reply: Reply) -> Result<Self> {
        match reply {
            Reply::Stored => Ok(()),
            other => Err(unexpected("a confirmation", &other)),
        }
    }
}

fn unexpected(wanted: &str, got: &Reply) -> Error {
    Error::Other(format!("expected {} reply, got {:?}", wanted, got))
}

/// Boxed exactly-once completion handler.
pub(crate) type Handler = Box<dyn FnOnce(Result<Reply>) + Send + 'static>;

/// Wrap a verb-typed handler so it can be stored on an [`Operation`].
pub(crate) fn typed<T, F>(handler: F) -> Handler
where
    T: FromReply,
    F: FnOnce(Result<T>) + Send + 'static,
{
    Box::new(move |outcome: Result<Reply>| handler(outcome.and_then(T::from_reply)))
}

/// One in-flight operation.
pub struct Operation {
    id: u64,
    command: Arc<Command>,
    handler: Handler,
    issued_at: Instant,
}

impl Operation {
    pub(crate) fn new(id: u64, command: Command, handler: Handler) -> Self {
        Operation {
            id,
            command: Arc::new(command),
            handler,
            issued_at: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> OpKind {
        self.command.kind()
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    /// Shared handle to the command for the offloaded worker.
    pub(crate) fn command_handle(&self) -> Arc<Command> {
        Arc::clone(&self.command)
    }

    /// Time since the operation was issued.
    pub fn elapsed(&self) -> Duration {
        self.issued_at.elapsed()
    }

    /// Consume the operation and hand `outcome` to its handler.
    pub(crate) fn complete(self, outcome: Result<Reply>) {
        (self.handler)(outcome)
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("target", &self.command.target())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_expiration_validation() {
        assert_eq!(expiration_from(0).expect("Failed to convert"), 0);
        assert_eq!(expiration_from(300).expect("Failed to convert"), 300);
        assert!(matches!(
            expiration_from(-1),
            Err(Error::ValidationError(_))
        ));
        assert!(expiration_from(i64::from(u32::MAX) + 1).is_err());
    }

    #[test]
    fn test_command_kinds() {
        let set = Command::set("k", "v", 0).expect("Failed to build");
        assert_eq!(set.kind(), OpKind::Set);
        let cas = Command::cas("k", "v", 0, 7).expect("Failed to build");
        assert_eq!(cas.kind(), OpKind::Cas);
        let append =
            Command::store(StoreMode::Append, "k", "v", 0).expect("Failed to build");
        assert_eq!(append.kind(), OpKind::Append);
        assert_eq!(Command::incr("k", 1).kind(), OpKind::Incr);
        assert_eq!(Command::flush(0).expect("Failed to build").kind(), OpKind::Flush);
    }

    #[test]
    fn test_command_copies_key_and_payload() {
        let mut key = b"transient".to_vec();
        let mut value = b"payload".to_vec();
        let command = Command::set(&key, &value, 10).expect("Failed to build");
        key.clear();
        value.clear();

        match command {
            Command::Store {
                key, value, expiration, ..
            } => {
                assert_eq!(key, b"transient");
                assert_eq!(value, b"payload");
                assert_eq!(expiration, 10);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_command_validate() {
        assert!(Command::get("").validate(false).is_err());
        assert!(Command::get("bad key").validate(true).is_err());
        Command::get("good").validate(true).expect("Failed to validate");
        // FLUSH carries no key
        Command::flush(0)
            .expect("Failed to build")
            .validate(true)
            .expect("Failed to validate");
    }

    #[test]
    fn test_from_reply() {
        assert_eq!(
            Vec::<u8>::from_reply(Reply::Value(b"x".to_vec())).expect("Failed to convert"),
            b"x"
        );
        assert_eq!(u64::from_reply(Reply::Counter(11)).expect("Failed to convert"), 11);
        <()>::from_reply(Reply::Stored).expect("Failed to convert");
        assert!(u64::from_reply(Reply::Stored).is_err());
        let item = Item::from_reply(Reply::Item(Item {
            value: b"v".to_vec(),
            cas: Some(3),
        }))
        .expect("Failed to convert");
        assert_eq!(item.cas, Some(3));
    }

    #[test]
    fn test_operation_completes_typed_handler() {
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let op = Operation::new(
            1,
            Command::incr("hits", 2),
            typed(move |result: Result<u64>| {
                *sink.lock().expect("lock poisoned") = Some(result);
            }),
        );
        assert_eq!(op.kind(), OpKind::Incr);
        op.complete(Ok(Reply::Counter(12)));

        assert_eq!(*seen.lock().expect("lock poisoned"), Some(Ok(12)));
    }

    #[test]
    fn test_typed_handler_passes_errors_through() {
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let handler = typed(move |result: Result<Vec<u8>>| {
            *sink.lock().expect("lock poisoned") = Some(result);
        });
        handler(Err(Error::NotFound));

        assert_eq!(*seen.lock().expect("lock poisoned"), Some(Err(Error::NotFound)));
    }
}
