//! Test support for tubeq: an in-memory broker with beanstalkd semantics,
//! scripted handlers and harness fixtures.

mod broker;
mod fixtures;
mod mock;

pub use broker::{InMemoryBroker, Op};
pub use fixtures::{envelope_body, payload, TestHarness};
pub use mock::{MockHandler, Scripted};
