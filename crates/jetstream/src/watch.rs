//! Live feeds of stored messages

use std::pin::Pin;

use futures::Stream as FuturesStream;
use serde::{Deserialize, Serialize};

use crate::message::StoredMessage;

/// Where a watch begins before following new messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchStart {
    /// Only messages stored after the watch started
    New,
    /// The latest stored message of every matching subject first
    #[default]
    LastPerSubject,
    /// Every stored matching message first
    All,
}

/// Boxed feed of stored messages
///
/// A watcher that falls more than the engine's watch buffer behind skips the
/// messages it missed; publishers never wait for watchers.
pub type MessageFeed = Pin<Box<dyn FuturesStream<Item = StoredMessage> + Send>>;
