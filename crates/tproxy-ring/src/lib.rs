//! Lock-free multi-producer single-consumer ring channel.
//!
//! Each producer owns a dedicated SPSC [`Ring`], so producers never contend
//! with each other; the consumer round-robins (or batch-drains) across rings.
//! Used inside `tproxy-core` to hand items off from listener I/O threads to a
//! handler's sender-task pool without ever blocking the I/O thread.

mod backoff;
mod channel;
mod config;
mod invariants;
mod metrics;
mod reservation;
mod ring;

pub use backoff::Backoff;
pub use channel::{Channel, ChannelError, Producer};
pub use config::Config;
pub use metrics::{Metrics, MetricsSnapshot};
pub use reservation::Reservation;
pub use ring::Ring;
