// mtr-test-utils: shared test harness for the exchange and interaction
// layers.
//
// Provides an in-process loopback transport with fault injection, a
// pass-through crypto, an in-memory data model and subscription store, and
// a pre-connected two-node pair.

pub mod data_model;
pub mod loopback;
pub mod pair;

pub use data_model::TestDataModel;
pub use loopback::{Faults, LoopbackChannel, NullCrypto};
pub use pair::{MemoryStore, NodePair, TestNode};
