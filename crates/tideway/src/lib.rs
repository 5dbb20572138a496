//! Async document-database client over a blocking driver
//!
//! Every call on [`Client`], [`Database`], [`Collection`] and [`Cursor`]
//! runs the matching blocking call from [`blocking`] on a bounded worker
//! pool and returns an [`Operation`]. An operation can be awaited:
//!
//! ```no_run
//! # async fn demo() -> tideway::Result<()> {
//! use tideway::bson::doc;
//!
//! let client = tideway::Client::connect("memory://default")?;
//! let people = client.database("app").collection("people");
//! people.insert(doc! { "name": "ada" }).await?;
//! let ada = people.find_one(doc! { "name": "ada" }).await?;
//! # Ok(()) }
//! ```
//!
//! or given a completion callback:
//!
//! ```no_run
//! # fn demo(db: tideway::Database) {
//! db.collection_names().with_callback(|result| match result {
//!     Ok(names) => println!("{:?}", names),
//!     Err(e) => eprintln!("{}", e),
//! });
//! # }
//! ```
//!
//! Arguments of the wrong shape are rejected before any I/O: the returned
//! operation has already resolved to `TidewayError::InvalidArgument`.

pub mod auth;
pub mod blocking;
mod client;
mod collection;
pub mod config;
mod cursor;
mod database;
pub mod dbref;
pub mod driver;
pub mod manipulator;
mod operation;
pub mod pool;

pub use bson;
pub use client::Client;
pub use collection::Collection;
pub use config::ClientConfig;
pub use cursor::Cursor;
pub use database::Database;
pub use dbref::DbRef;
pub use manipulator::{AutoReference, NamespaceInjector, ObjectIdInjector, SonManipulator};
pub use operation::Operation;
pub use pool::{PoolConfig, PoolStats, Request};
pub use tideway_common::{Result, TidewayError};
