//! LibreSeed seeder daemon core: package catalog, embedded BitTorrent
//! engine, DHT announcer, package manager, and HTTP control plane.

pub mod announcer;
pub mod apikeys;
pub mod catalog;
pub mod config;
pub mod control_plane;
pub mod engine;
pub mod error;
pub mod keystore;
pub mod manager;
pub mod signing;
pub mod supervisor;

pub use config::Config;
pub use error::{LbsdError, Result};
pub use supervisor::Supervisor;
