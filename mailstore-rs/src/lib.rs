//! mailstore-rs: mailbox index and message metadata storage engine
//!
//! The storage core behind mail-access and mail-transfer servers: per-account
//! mailbox hierarchies, message metadata with IMAP UIDs and modification
//! sequences, and a separate blob store for message bodies.
//!
//! # Features
//!
//! - **Relational index**: SQLite or PostgreSQL through sqlx, one transaction
//!   per operation, UID/modseq counters persisted in the mailbox row
//! - **Blob store**: filesystem or memory, optional zlib/gzip compression
//! - **Address normalization**: selectable profiles for delivery and login
//! - **Mapping tables**: identity, static, file and regex lookups
//! - **Retention**: message expiry, unused-account cleanup, orphan reclaim
//!
//! # Example
//!
//! ```no_run
//! use mailstore_rs::config::Config;
//! use mailstore_rs::engine::Engine;
//! use mailstore_rs::retention::RetentionConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let engine = Engine::open(&config).await?;
//!
//!     let retention = engine
//!         .retention(RetentionConfig::from(&config.retention), None)
//!         .start();
//!
//!     engine.provision("alice@example.org").await?;
//!     engine.deliver("alice@example.org", b"Subject: hello\r\n\r\nhi", false).await?;
//!
//!     retention.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`engine`]: Facade consumed by protocol servers
//! - [`index`]: Relational mailbox and message index
//! - [`blob`]: Message body storage
//! - [`normalize`]: Username and address normalization
//! - [`mapping`]: Delivery and authentication mapping tables
//! - [`retention`]: Background retention sweeps
//! - [`auth`]: Credential store boundary used by retention
//! - [`config`]: Configuration management
//! - [`error`]: Error types and handling

pub mod auth;
pub mod blob;
pub mod config;
pub mod engine;
pub mod error;
pub mod index;
pub mod mapping;
pub mod normalize;
pub mod retention;

pub use engine::Engine;
pub use error::{Result, StoreError};
