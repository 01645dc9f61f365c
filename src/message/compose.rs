//! Building an encrypted message from plaintext content

use super::{CatalogInfo, Header, HeaderFrom, HeaderTo, MessageArtifacts, MessageId};
use crate::address::AddressHash;
use crate::envelope::{
    checksums, seal_key, Catalog, EncryptedPart, EnvelopeError, CRYPTO_ALGORITHM,
};
use crate::pow::ProofOfWork;
use x25519_dalek::PublicKey;

/// Identity of the author of a message
#[derive(Debug, Clone)]
pub struct Sender {
    pub address: String,
    pub public_key: PublicKey,
    pub proof_of_work: ProofOfWork,
}

impl Sender {
    /// Create a sender, solving the address proof at `bits` difficulty
    pub fn new(address: impl Into<String>, public_key: PublicKey, bits: u32) -> Self {
        let address = address.into();
        let hash = AddressHash::from_address(&address);
        let mut proof_of_work = ProofOfWork::new(bits, hash.as_bytes().to_vec(), 0);
        proof_of_work.work();

        Self {
            address,
            public_key,
            proof_of_work,
        }
    }

    pub fn hash(&self) -> AddressHash {
        AddressHash::from_address(&self.address)
    }
}

/// Step-by-step construction of [`MessageArtifacts`]
///
/// ```
/// use relaymail::envelope::generate_keypair;
/// use relaymail::message::{MessageComposer, Sender};
///
/// let (_, john_pk) = generate_keypair();
/// let (_, jane_pk) = generate_keypair();
/// let sender = Sender::new("john@example!", john_pk, 4);
///
/// let artifacts = MessageComposer::new(sender, "jane@example!", jane_pk)
///     .subject("Hello")
///     .block("text/plain", b"hi jane")
///     .unwrap()
///     .build()
///     .unwrap();
/// assert_eq!(artifacts.parts.len(), 1);
/// ```
pub struct MessageComposer {
    sender: Sender,
    recipient: String,
    recipient_key: PublicKey,
    catalog: Catalog,
    parts: Vec<EncryptedPart>,
}

impl MessageComposer {
    pub fn new(sender: Sender, recipient: impl Into<String>, recipient_key: PublicKey) -> Self {
        let recipient = recipient.into();
        let catalog = Catalog::new(sender.address.clone(), recipient.clone(), "");
        Self {
            sender,
            recipient,
            recipient_key,
            catalog,
            parts: Vec::new(),
        }
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.catalog.subject = subject.into();
        self
    }

    pub fn thread(mut self, thread_id: impl Into<String>) -> Self {
        self.catalog.thread_id = Some(thread_id.into());
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.catalog.labels.push(label.into());
        self
    }

    pub fn block(mut self, kind: &str, content: &[u8]) -> Result<Self, EnvelopeError> {
        let part = self.catalog.add_block(kind, content)?;
        self.parts.push(part);
        Ok(self)
    }

    pub fn attachment(
        mut self,
        filename: &str,
        mimetype: &str,
        content: &[u8],
    ) -> Result<Self, EnvelopeError> {
        let part = self.catalog.add_attachment(filename, mimetype, content)?;
        self.parts.push(part);
        Ok(self)
    }

    /// Encrypt the catalog, seal its key and assemble the header
    pub fn build(self) -> Result<MessageArtifacts, EnvelopeError> {
        let (catalog_key, catalog) = self.catalog.encrypt()?;
        let encrypted_key = seal_key(&self.recipient_key, &catalog_key)?;

        let header = Header {
            from: HeaderFrom {
                address: self.sender.hash(),
                public_key: hex::encode(self.sender.public_key.as_bytes()),
                proof_of_work: self.sender.proof_of_work,
            },
            to: HeaderTo {
                address: AddressHash::from_address(&self.recipient),
            },
            catalog: CatalogInfo {
                size: catalog.len() as u64,
                checksum: checksums(&catalog),
                crypto: CRYPTO_ALGORITHM.to_string(),
                encrypted_key,
            },
        };

        tracing::debug!(
            to = %header.to.address,
            parts = self.parts.len(),
            "Composed message"
        );

        Ok(MessageArtifacts {
            id: MessageId::new(),
            header,
            catalog,
            parts: self.parts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{generate_keypair, open_key, verify_checksums};

    #[test]
    fn test_compose_and_read_back() {
        let (_, john_pk) = generate_keypair();
        let (jane_sk, jane_pk) = generate_keypair();
        let sender = Sender::new("john@example!", john_pk, 4);

        let big = vec![b'x'; 3000];
        let artifacts = MessageComposer::new(sender, "Jane@Example!", jane_pk)
            .subject("Quarterly numbers")
            .label("work")
            .block("text/plain", b"numbers attached")
            .unwrap()
            .attachment("q3.csv", "text/csv", &big)
            .unwrap()
            .build()
            .unwrap();

        let header = &artifacts.header;
        assert_eq!(header.to.address, AddressHash::from_address("jane@example!"));
        assert_eq!(header.catalog.crypto, "aes256-cfb");
        assert_eq!(header.catalog.size, artifacts.catalog.len() as u64);
        assert!(verify_checksums(&header.catalog.checksum, &artifacts.catalog));
        assert!(header.sender_proof_is_valid(4));

        let key = open_key(&jane_sk, &header.catalog.encrypted_key).unwrap();
        let catalog = Catalog::decrypt(&key, &artifacts.catalog).unwrap();
        assert_eq!(catalog.subject, "Quarterly numbers");
        assert_eq!(catalog.part_ids().len(), 2);

        let attachment = &artifacts.parts[1];
        assert_eq!(catalog.open_part(&attachment.id, &attachment.data).unwrap(), big);
    }
}
