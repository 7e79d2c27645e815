//! Test helpers shared across the teleconsole workspace.

pub mod mock_broker;
pub mod test_keys;

pub use mock_broker::MockBroker;
pub use test_keys::TestKeys;
