//! Replay of recorded responses

mod replayer;

pub use replayer::{Located, Replayer, StoredResponse};
