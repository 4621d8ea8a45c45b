//! Configuration management
//!
//! Node addresses, mining settings and the data directory. A `Config` is a
//! plain value handed to whoever needs it.

pub mod settings;

pub use settings::Config;
