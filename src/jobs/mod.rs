//! Periodic background jobs. Each `spawn` starts a tokio interval loop that
//! runs one pass of its workflow step per tick.

pub mod executions;
pub mod expiry;
pub mod reminders;
