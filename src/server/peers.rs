//! Rotation of peer replication passwords.

use anyhow::{Context, Error};
use async_trait::async_trait;
use sqlx::postgres::Postgres;
use sqlx::Transaction;

use stevedore_api_types::PeeringRequest;
use stevedore_db::{peers, PeerRow};

use crate::server::{Janitor, JobDesc, Task};
use crate::tools::to_chrono;

static PEER_ROTATION_DESC: JobDesc = JobDesc {
    name: "peer credential rotation",
    counter_name: "stevedore_peer_credential_rotations",
    counter_help: "Counter for peer credential rotation operations.",
};

/// Generates a fresh replication password: 20 random bytes, hex-encoded.
fn generate_replication_password() -> Result<String, Error> {
    let mut buf = [0u8; 20];
    openssl::rand::rand_bytes(&mut buf).context("cannot generate replication password")?;
    Ok(hex::encode(buf))
}

/// Unsalted SHA-256 is acceptable for these hashes: the passwords carry
/// 160 bits of entropy and live for at most two rotation periods.
pub(crate) fn hash_replication_password(password: &str) -> String {
    hex::encode(openssl::sha::sha256(password.as_bytes()))
}

pub struct DueRotation {
    tx: Transaction<'static, Postgres>,
    peer: PeerRow,
}

/// Periodically installs a fresh replication password for every peer
/// used for pull delegation.
pub struct PeerRotationTask {
    janitor: Janitor,
}

impl PeerRotationTask {
    pub fn new(janitor: Janitor) -> Self {
        Self { janitor }
    }
}

#[async_trait]
impl Task for PeerRotationTask {
    type Item = DueRotation;

    fn desc(&self) -> &'static JobDesc {
        &PEER_ROTATION_DESC
    }

    async fn discover(&self) -> Result<Option<DueRotation>, Error> {
        let cutoff = self.janitor.clock().now()
            - to_chrono(self.janitor.config().peer_rotation_interval);
        let mut tx = self.janitor.db().begin().await?;
        match peers::claim_due_rotation(&mut *tx, cutoff).await? {
            Some(peer) => Ok(Some(DueRotation { tx, peer })),
            None => Ok(None),
        }
    }

    async fn process(&self, item: DueRotation) -> Result<(), Error> {
        let DueRotation { mut tx, peer } = item;
        let now = self.janitor.clock().now();

        let new_password = generate_replication_password()?;
        let new_hash = hash_replication_password(&new_password);

        // Commit before the network call: the peer may authenticate back
        // with the new password the moment it receives it.
        peers::rotate_password(&mut *tx, &peer.hostname, &new_hash, now).await?;
        tx.commit().await?;

        let request = PeeringRequest {
            peer_hostname: self.janitor.own_hostname().to_string(),
            user_name: PeeringRequest::replication_user_name(&peer.hostname),
            password: new_password,
        };
        let client = self.janitor.peer_connector().connect(&peer.hostname)?;
        match client.post_peering(&request).await {
            Ok(()) => {
                log::info!("issued fresh replication password to peer {}", peer.hostname);
                Ok(())
            }
            Err(err) => {
                // The peer never saw the new password, so the committed
                // rotation must be rewound or inbound auth breaks.
                if let Err(revert_err) =
                    peers::restore_password(self.janitor.db().pool(), &peer).await
                {
                    log::error!(
                        "cannot revert password rotation for peer {}: {revert_err}",
                        peer.hostname,
                    );
                }
                Err(Error::new(err)
                    .context(format!("cannot peer with {}", peer.hostname)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_passwords_are_hex_and_distinct() {
        let first = generate_replication_password().unwrap();
        let second = generate_replication_password().unwrap();
        assert_eq!(first.len(), 40);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(first, second);
    }

    #[test]
    fn password_hashing_is_stable() {
        assert_eq!(
            hash_replication_password("password"),
            "5e884898da28047151d0e56f8dc6292773603d0d6aabbdd62a11ef721d1542d8",
        );
        assert_eq!(
            hash_replication_password("password"),
            hash_replication_password("password"),
        );
    }
}
