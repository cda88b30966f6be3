//! Process and filesystem plumbing shared by checkout and the runners.

pub mod checkout;
pub mod runner;
pub mod sandbox;
