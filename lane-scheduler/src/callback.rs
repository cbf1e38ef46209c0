//! Typed message callbacks.
//!
//! A [`Callback`] bundles a decoder, a message handler and an optional error
//! handler for one payload type. The scheduler stores callbacks type-erased
//! and feeds them raw records; decoding happens per callback, so several
//! callbacks on one topic may read the same payload as different types.

use std::fmt;

use lane_broker::Record;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{self, CodecError};
use crate::lane::Lane;

/// Error type returned by message handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Turns a raw payload into a typed value.
pub type Decoder<T> = Box<dyn Fn(&[u8]) -> Result<T, CodecError> + Send + Sync>;

type MessageHandler<T> = Box<dyn Fn(&T, Lane) -> Result<(), HandlerError> + Send + Sync>;
type ErrorHandler<T> =
    Box<dyn Fn(Option<&T>, &CallbackError) -> Result<ErrorAction<Vec<u8>>, CodecError> + Send + Sync>;

/// What to do after a callback failed on a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorAction<E> {
    /// Log the failure and drop the message
    Suppress,
    /// Publish this payload to the error lane of the message's base topic
    Republish(E),
}

/// Why a callback failed on a message.
#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    /// The payload could not be decoded
    #[error("Failed to decode message: {0}")]
    Decode(#[source] CodecError),

    /// The message handler returned an error
    #[error("Message handler failed: {0}")]
    Handler(#[source] HandlerError),
}

/// Result of feeding one record to one callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    Handled,
    Dropped,
    Republish(Vec<u8>),
}

/// Type-erased view of a [`Callback`] used by the registry and dispatcher.
pub(crate) trait Dispatch: Send + Sync {
    fn dispatch(&self, record: &Record, lane: Lane) -> Outcome;
}

/// A typed subscriber for one payload type.
///
/// # Example
///
/// ```rust
/// use lane_scheduler::{Callback, ErrorAction, Lane};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Deserialize)]
/// struct Order {
///     id: u64,
/// }
///
/// #[derive(Serialize)]
/// struct FailedOrder {
///     id: Option<u64>,
///     reason: String,
/// }
///
/// let callback = Callback::json(|order: &Order, lane: Lane| {
///     println!("order {} on {lane}", order.id);
///     Ok(())
/// })
/// .on_error(|order: Option<&Order>, err| {
///     ErrorAction::Republish(FailedOrder {
///         id: order.map(|o| o.id),
///         reason: err.to_string(),
///     })
/// });
/// # drop(callback);
/// ```
pub struct Callback<T> {
    decoder: Decoder<T>,
    on_message: MessageHandler<T>,
    on_error: Option<ErrorHandler<T>>,
}

impl<T: DeserializeOwned + 'static> Callback<T> {
    /// Create a callback that decodes JSON payloads.
    pub fn json<F>(on_message: F) -> Self
    where
        F: Fn(&T, Lane) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        Self::with_decoder(|payload: &[u8]| codec::decode(payload), on_message)
    }
}

impl<T: 'static> Callback<T> {
    /// Create a callback with a custom decoder.
    pub fn with_decoder<D, F>(decoder: D, on_message: F) -> Self
    where
        D: Fn(&[u8]) -> Result<T, CodecError> + Send + Sync + 'static,
        F: Fn(&T, Lane) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        Self {
            decoder: Box::new(decoder),
            on_message: Box::new(on_message),
            on_error: None,
        }
    }

    /// Install an error handler.
    ///
    /// The handler receives the decoded value when decoding succeeded and the
    /// message handler failed, or `None` when decoding itself failed.
    pub fn on_error<E, H>(mut self, handler: H) -> Self
    where
        E: Serialize,
        H: Fn(Option<&T>, &CallbackError) -> ErrorAction<E> + Send + Sync + 'static,
    {
        self.on_error = Some(Box::new(move |value: Option<&T>, error: &CallbackError| {
            match handler(value, error) {
                ErrorAction::Suppress => Ok(ErrorAction::Suppress),
                ErrorAction::Republish(payload) => {
                    codec::encode(&payload).map(ErrorAction::Republish)
                }
            }
        }));
        self
    }

    /// Whether an error handler has been installed.
    pub fn has_error_handler(&self) -> bool {
        self.on_error.is_some()
    }

    fn fail(&self, record: &Record, value: Option<&T>, error: CallbackError) -> Outcome {
        let Some(handler) = &self.on_error else {
            log_unhandled(record, &error);
            return Outcome::Dropped;
        };

        match handler(value, &error) {
            Ok(ErrorAction::Suppress) => {
                log_unhandled(record, &error);
                Outcome::Dropped
            }
            Ok(ErrorAction::Republish(payload)) => Outcome::Republish(payload),
            Err(codec_error) => {
                tracing::error!(
                    topic = %record.topic,
                    offset = record.offset,
                    "Failed to encode error payload ({}), original failure: {}",
                    codec_error,
                    error
                );
                Outcome::Dropped
            }
        }
    }
}

impl<T: 'static> Dispatch for Callback<T> {
    fn dispatch(&self, record: &Record, lane: Lane) -> Outcome {
        let value = match (self.decoder)(&record.payload) {
            Ok(value) => value,
            Err(e) => return self.fail(record, None, CallbackError::Decode(e)),
        };

        match (self.on_message)(&value, lane) {
            Ok(()) => Outcome::Handled,
            Err(e) => self.fail(record, Some(&value), CallbackError::Handler(e)),
        }
    }
}

impl<T> fmt::Debug for Callback<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("type", &std::any::type_name::<T>())
            .field("has_error_handler", &self.on_error.is_some())
            .finish()
    }
}

fn log_unhandled(record: &Record, error: &CallbackError) {
    tracing::error!(
        topic = %record.topic,
        partition = record.partition,
        offset = record.offset,
        "Unhandled error when processing {}: {}",
        record.payload_lossy(),
        error
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
    struct Order {
        id: u64,
    }

    fn record(payload: &[u8]) -> Record {
        Record {
            topic: "orders-NORMAL".to_string(),
            partition: 0,
            offset: 0,
            key: None,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn test_successful_dispatch_passes_value_and_lane() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback = Callback::json(move |order: &Order, lane| {
            sink.lock().unwrap().push((order.clone(), lane));
            Ok(())
        });

        let outcome = callback.dispatch(&record(br#"{"id":7}"#), Lane::Priority);
        assert_eq!(outcome, Outcome::Handled);
        assert_eq!(*seen.lock().unwrap(), vec![(Order { id: 7 }, Lane::Priority)]);
    }

    #[test]
    fn test_failure_without_error_handler_is_dropped() {
        let callback = Callback::json(|_: &Order, _| Err("boom".into()));
        assert!(!callback.has_error_handler());
        assert_eq!(
            callback.dispatch(&record(br#"{"id":1}"#), Lane::Normal),
            Outcome::Dropped
        );
    }

    #[test]
    fn test_decode_failure_reaches_error_handler_without_value() {
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let callback = Callback::json(|_: &Order, _| Ok(())).on_error(
            move |value: Option<&Order>, err: &CallbackError| {
                *sink.lock().unwrap() = Some((value.cloned(), matches!(err, CallbackError::Decode(_))));
                ErrorAction::<()>::Suppress
            },
        );

        let outcome = callback.dispatch(&record(b"{not json"), Lane::Normal);
        assert_eq!(outcome, Outcome::Dropped);
        assert_eq!(*seen.lock().unwrap(), Some((None, true)));
    }

    #[test]
    fn test_handler_failure_republishes_with_value() {
        let callback = Callback::json(|_: &Order, _| Err("rejected".into())).on_error(
            |value: Option<&Order>, err: &CallbackError| {
                ErrorAction::Republish(serde_json::json!({
                    "id": value.map(|o| o.id),
                    "error": err.to_string(),
                }))
            },
        );

        let Outcome::Republish(payload) = callback.dispatch(&record(br#"{"id":3}"#), Lane::Normal)
        else {
            panic!("expected republish");
        };
        let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(json["id"], 3);
        assert_eq!(json["error"], "Message handler failed: rejected");
    }

    #[test]
    fn test_custom_decoder() {
        let callback = Callback::with_decoder(
            |payload: &[u8]| {
                std::str::from_utf8(payload)
                    .map(str::to_uppercase)
                    .map_err(|e| CodecError::Invalid(e.to_string()))
            },
            |text: &String, _| {
                assert_eq!(text, "HELLO");
                Ok(())
            },
        );
        assert_eq!(callback.dispatch(&record(b"hello"), Lane::Normal), Outcome::Handled);
        assert_eq!(
            callback.dispatch(&record(&[0xff, 0xfe]), Lane::Normal),
            Outcome::Dropped
        );
    }

    #[test]
    fn test_debug_shows_type() {
        let callback = Callback::json(|_: &Order, _| Ok(()));
        let debug = format!("{callback:?}");
        assert!(debug.contains("Order"));
        assert!(debug.contains("has_error_handler: false"));
    }
}
