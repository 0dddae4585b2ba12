pub mod properties;
pub mod proxy;
pub mod record_replay;
