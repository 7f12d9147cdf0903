pub mod command;
pub mod cycle;
pub mod measurement;
pub mod pipeline;
pub mod schedule;
pub mod service;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;
