use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use super::crypto::{hash, PeerId, SignatureRecord, SignatureScheme};

/// Kind of events that move balances between peers
pub const TRANSFER_KIND: &str = "transfer";

/// Kind of the event that seeds the local peer's balance in the genesis block
pub const GENESIS_KIND: &str = "genesis";

/// Payload of a `transfer` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferPayload {
    pub from: PeerId,
    pub to: PeerId,
    pub amount: u64,
}

/// Payload of the `genesis` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisPayload {
    pub peer: PeerId,
    pub amount: u64,
}

/// An immutable, signed ledger entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub kind: String,
    pub payload: Value,
    pub source_id: PeerId,
    pub timestamp: u64,

    /// Hash of the most recently sealed block when the event was created
    pub previous_hash: String,

    pub hash: String,
    pub signature: SignatureRecord,
}

impl Event {
    /// Builds, hashes and signs a new event
    pub fn new(
        kind: &str,
        payload: Value,
        previous_hash: &str,
        timestamp: u64,
        signer: &dyn SignatureScheme,
    ) -> Self {
        let mut event = Event {
            id: Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            payload,
            source_id: signer.peer_id().clone(),
            timestamp,
            previous_hash: previous_hash.to_string(),
            hash: String::new(),
            signature: SignatureRecord::unsigned(),
        };

        event.hash = event.calculate_hash();
        event.signature = signer.sign(event.hash.as_bytes());
        event
    }

    /// Hash over every field except the hash itself and the signature
    pub fn calculate_hash(&self) -> String {
        let data = json!({
            "id": self.id,
            "kind": self.kind,
            "payload": self.payload,
            "sourceId": self.source_id,
            "timestamp": self.timestamp,
            "previousHash": self.previous_hash,
        });

        hash(data.to_string().as_bytes())
    }

    /// Checks the stored hash and that the source signed it
    pub fn verify(&self, verifier: &dyn SignatureScheme) -> bool {
        self.hash == self.calculate_hash()
            && self.signature.signer == self.source_id
            && verifier.verify(self.hash.as_bytes(), &self.signature)
    }

    pub fn is_transfer(&self) -> bool {
        self.kind == TRANSFER_KIND
    }

    /// Decodes the payload of a `transfer` event
    pub fn transfer_payload(&self) -> Option<TransferPayload> {
        if !self.is_transfer() {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }

    /// Decodes the payload of a `genesis` event
    pub fn genesis_payload(&self) -> Option<GenesisPayload> {
        if self.kind != GENESIS_KIND {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::crypto::{Wallet, ZERO_HASH};

    #[test]
    fn test_new_event_is_hashed_and_signed() {
        let wallet = Wallet::new();
        let event = Event::new("note", json!({ "text": "hi" }), ZERO_HASH, 42, &wallet);

        assert_eq!(event.hash.len(), 64);
        assert_eq!(&event.source_id, wallet.peer_id());
        assert!(event.verify(&wallet));
    }

    #[test]
    fn test_hash_covers_every_field() {
        let wallet = Wallet::new();
        let event = Event::new("note", json!({ "text": "hi" }), ZERO_HASH, 42, &wallet);

        let mut tampered = event.clone();
        tampered.payload = json!({ "text": "bye" });
        assert!(!tampered.verify(&wallet));

        let mut tampered = event.clone();
        tampered.timestamp += 1;
        assert!(!tampered.verify(&wallet));

        let mut tampered = event.clone();
        tampered.previous_hash = "ff".repeat(32);
        assert!(!tampered.verify(&wallet));

        let mut tampered = event;
        tampered.kind = "other".to_string();
        assert!(!tampered.verify(&wallet));
    }

    #[test]
    fn test_transfer_payload_decoding() {
        let wallet = Wallet::new();
        let payload = TransferPayload {
            from: PeerId::from("alice"),
            to: PeerId::from("bob"),
            amount: 5,
        };
        let event = Event::new(
            TRANSFER_KIND,
            serde_json::to_value(&payload).unwrap(),
            ZERO_HASH,
            1,
            &wallet,
        );

        assert_eq!(event.transfer_payload(), Some(payload));
        assert!(event.genesis_payload().is_none());
    }

    #[test]
    fn test_wire_format_is_camel_case() {
        let wallet = Wallet::new();
        let event = Event::new("note", Value::Null, ZERO_HASH, 7, &wallet);
        let encoded = serde_json::to_value(&event).unwrap();

        assert!(encoded.get("sourceId").is_some());
        assert!(encoded.get("previousHash").is_some());
        assert!(encoded["signature"].get("signer").is_some());
    }
}
