pub mod config;
pub mod escalation;
pub mod notify;
pub mod reminders;
pub mod shared;
pub mod storage;
pub mod tickets;
