//! Domain value types: bars, instruments, timeframes.

pub mod bar;
pub mod instrument;
pub mod timeframe;

pub use bar::Bar;
pub use instrument::{Instrument, InstrumentError};
pub use timeframe::{Timeframe, TimeframeError};
