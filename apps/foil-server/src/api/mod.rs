pub mod cases;
pub mod dlq;
pub mod events;
pub mod meta;
pub mod proposals;
pub mod reaper;
pub mod runs;
