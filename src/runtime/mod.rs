//! Reactor, timer queue, and fiber schedulers.

pub mod reactor;
pub mod scheduler;
pub mod timer;
