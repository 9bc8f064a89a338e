//! Timeframes: vector clocks keyed by feed.

pub mod timeframe;

pub use timeframe::{FeedRange, Position, Timeframe, MAX_SEQ, MAX_TIMEFRAME_ENTRIES};
