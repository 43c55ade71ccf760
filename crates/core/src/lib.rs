//! Domain layer for the account activity dashboard.
//!
//! Everything in this crate is synchronous and free of I/O: the classifier
//! turns provider payloads into [`types::ActivityEvent`] values, the renderer
//! turns those into display cards, and [`feed::EventFeed`] implements the
//! bounded display list shared by the transports.
pub mod classifier;
pub mod feed;
pub mod render;
pub mod types;

pub use classifier::classify;
pub use feed::{EventFeed, DEFAULT_FEED_CAPACITY};
pub use render::{render, EventCard};
pub use types::{ActivityEvent, Direction, UserRef};
