//! Job market: matches submitted jobs with idle workers, per job type.
//!
//! Producers submit jobs; workers announce themselves idle for one type at a
//! time. Both sides queue FIFO, so the oldest job goes to the longest-idle
//! worker. Results and progress are routed back to the reply address carried
//! by each submission.

mod broker;
pub mod protocol;

pub use self::broker::{JobMarket, MarketHandle};
pub use self::protocol::{Assignment, MarketCommand, ProducerEvent, ReplyAddr, Submission};
