pub mod aggregator;
pub mod trade_stream;

pub use aggregator::CandleAggregator;
pub use trade_stream::{run_trade_stream_with_reconnect, FeedHandler};
