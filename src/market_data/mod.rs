pub mod candle_buffer;
pub mod depth;
pub mod gainers;
pub mod price_cache;

// Re-export the common handles (e.g. `use crate::market_data::PriceCache`).
pub use candle_buffer::{CandleBuffer, SeriesKey};
pub use depth::DepthBook;
pub use gainers::{build_gainers, TickerBoard};
pub use price_cache::{PriceCache, PriceEntry};
