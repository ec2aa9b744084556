//! Random identifiers for databases, document bodies, attachments and
//! replication sessions.

use rand::Rng;

/// A fresh 128-bit identifier rendered as 32 lowercase hex digits.
pub(crate) fn random() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    hex::encode(bytes)
}
