//! Live price streaming.

pub mod feed;
pub mod live;
pub mod throttle;

pub use feed::{parse_tick, FeedConnector, PriceFeed, WsFeedConnector};
pub use live::{LiveQuoteStream, LiveStreamConfig, StreamStats};
pub use throttle::Throttle;
