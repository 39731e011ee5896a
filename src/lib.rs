//! A beanstalkd-style work queue broker.
//!
//! The scheduling core lives in [`tube`] and [`broker`]: jobs move between
//! the ready/delayed/reserved/buried states of a named tube, consumers
//! reserve them for a bounded time-to-run window, and [`sweeper`] returns
//! them to ready when deadlines pass. The remaining modules provide the
//! text-line protocol surface used by the `burrowd` binary.

pub mod broker;
pub mod error;
pub mod journal;
pub mod line_reader;
pub mod parser;
pub mod sweeper;
pub mod tube;
pub mod types;
pub mod util;
