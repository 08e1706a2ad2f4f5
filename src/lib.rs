//! Finds which Farcaster follows are live Circles participants.
//!
//! The core is [`resolver::AddressResolver`]: an address goes in, a
//! confidence-scored identity with an activity classification comes out.
//! [`batch::BatchOrchestrator`] runs it over a whole follow list as a
//! cancellable stream.

pub mod activity;
pub mod batch;
pub mod cache;
pub mod circles;
pub mod config;
pub mod observe;
pub mod resolver;
pub mod social;
pub mod trust;
