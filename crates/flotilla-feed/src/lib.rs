//! flotilla-feed: the formation change feed.
//!
//! Formation writes go through [`FormationFeed`], which commits them to the
//! state store and fans the expanded result out to every subscriber. A
//! [`Subscription`] replays history since a timestamp, yields
//! [`FeedEvent::ReplayComplete`], then continues with live changes.

pub mod error;
pub mod feed;

pub use error::{FeedError, FeedResult};
pub use feed::{FormationFeed, Subscription};
pub use flotilla_core::FeedEvent;
