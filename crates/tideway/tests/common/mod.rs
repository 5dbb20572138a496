//! Shared helpers for integration tests

#![allow(dead_code)]

use std::sync::Arc;

use tideway::bson::{Bson, Document};
use tideway::driver::MemoryServer;
use tideway::{Client, ClientConfig, Collection, Operation, PoolConfig};
use tokio::sync::oneshot;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Client over a fresh private server
pub fn client_for(server: &MemoryServer, pool: PoolConfig) -> Client {
    init_tracing();
    let config = ClientConfig::default().pool(pool).max_workers(Some(8));
    Client::new(Arc::new(server.clone()), config).expect("client")
}

pub fn fresh_client() -> (MemoryServer, Client) {
    let server = MemoryServer::new();
    let client = client_for(&server, PoolConfig::default());
    (server, client)
}

/// Values a test can assert as "truthy"
pub trait Truthy {
    fn truthy(&self) -> bool;
}

impl Truthy for bool {
    fn truthy(&self) -> bool {
        *self
    }
}

impl Truthy for () {
    fn truthy(&self) -> bool {
        true
    }
}

impl Truthy for u64 {
    fn truthy(&self) -> bool {
        *self != 0
    }
}

impl Truthy for String {
    fn truthy(&self) -> bool {
        !self.is_empty()
    }
}

impl Truthy for Document {
    fn truthy(&self) -> bool {
        !self.is_empty()
    }
}

impl Truthy for Bson {
    fn truthy(&self) -> bool {
        !matches!(self, Bson::Null | Bson::Boolean(false))
    }
}

impl Truthy for Collection {
    fn truthy(&self) -> bool {
        true
    }
}

impl<T> Truthy for Vec<T> {
    fn truthy(&self) -> bool {
        !self.is_empty()
    }
}

impl<T> Truthy for Option<T> {
    fn truthy(&self) -> bool {
        self.is_some()
    }
}

/// Run an operation once through a callback and once as a future
///
/// Both runs must succeed. With `check`, both results must be truthy.
/// Returns the future's result.
pub async fn check_optional_callback<T, F>(make_op: F, check: bool) -> T
where
    F: Fn() -> Operation<T>,
    T: Truthy + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    make_op().with_callback(move |result| {
        let _ = tx.send(result);
    });
    let via_callback = rx
        .await
        .expect("callback was never called")
        .expect("callback received an error");

    let via_future = make_op().await.expect("future resolved to an error");

    if check {
        assert!(via_callback.truthy(), "callback result is not truthy");
        assert!(via_future.truthy(), "future result is not truthy");
    }
    via_future
}
