//! External collaborators of the aggregation engine: where trades come from,
//! where candles go, and the loop that connects them.

pub mod error;
pub mod kraken;
pub mod pipeline;
pub mod replay;
pub mod sink;
pub mod source;

pub use error::{PipelineError, SourceError};
pub use pipeline::{RetryPolicy, RunSummary, run};
pub use source::TradeSource;
