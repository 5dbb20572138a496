//! Nonce challenge authentication
//!
//! A connection asks the server for a nonce and answers with
//! `sha256(nonce + user + password_digest)`. The server stores only the
//! password digest. Authentication state belongs to a connection, which is
//! why the two round trips must share one pinned connection.

use bson::doc;
use sha2::{Digest, Sha256};
use tideway_common::{Result, TidewayError};

use crate::pool::SocketInfo;

pub const AUTHENTICATION_FAILED: i32 = 18;

/// Credentials cached per database once authentication succeeds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub user: String,
    pub digest: String,
}

impl Credential {
    pub fn new(user: &str, password: &str) -> Self {
        Self {
            user: user.to_string(),
            digest: password_digest(user, password),
        }
    }
}

fn hex_sha256(input: &str) -> String {
    Sha256::digest(input.as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Digest stored server side for `user`
pub fn password_digest(user: &str, password: &str) -> String {
    hex_sha256(&format!("{}:mongo:{}", user, password))
}

/// Answer to a nonce challenge
pub fn auth_key(nonce: &str, user: &str, digest: &str) -> String {
    hex_sha256(&format!("{}{}{}", nonce, user, digest))
}

/// Run the nonce handshake for `db` on one connection
pub(crate) fn authenticate_socket(
    sock: &mut SocketInfo,
    db: &str,
    credential: &Credential,
) -> Result<()> {
    let reply = sock.run_command(db, doc! { "getnonce": 1 })?;
    let nonce = reply
        .get_str("nonce")
        .map_err(|_| TidewayError::operation_failure("getnonce returned no nonce", None))?
        .to_string();

    let key = auth_key(&nonce, &credential.user, &credential.digest);
    let reply = sock.run_command(
        db,
        doc! {
            "authenticate": 1,
            "user": credential.user.as_str(),
            "nonce": nonce.as_str(),
            "key": key,
        },
    )?;

    if !crate::blocking::reply_ok(&reply) {
        tracing::warn!(
            connection_id = sock.id(),
            db = %db,
            user = %credential.user,
            "authentication failed"
        );
        return Err(crate::blocking::reply_error(&reply));
    }

    sock.mark_authenticated(db, &credential.user);
    tracing::debug!(connection_id = sock.id(), db = %db, "connection authenticated");
    Ok(())
}

/// Log `db` out on one connection. A no-op when it was never authenticated.
pub(crate) fn logout_socket(sock: &mut SocketInfo, db: &str) -> Result<()> {
    if sock.authenticated_user(db).is_none() {
        return Ok(());
    }
    let reply = sock.run_command(db, doc! { "logout": 1 })?;
    if !crate::blocking::reply_ok(&reply) {
        return Err(crate::blocking::reply_error(&reply));
    }
    sock.mark_logged_out(db);
    Ok(())
}
