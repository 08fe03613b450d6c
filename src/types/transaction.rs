//! Transaction drafts and nonce-assigned records

use super::Address;
use crate::error::{SequencerError, SequencerResult};

use serde::{Deserialize, Serialize};

/// Produces signatures over a record's signing payload.
///
/// Injected by the caller; the sequencer never holds key material.
pub trait TransactionSigner: Send + Sync {
    fn sign(&self, payload: &[u8]) -> SequencerResult<Vec<u8>>;
}

/// Caller-built transaction before a nonce has been assigned
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionDraft {
    pub receiver: String,
    pub value: String,
    pub data: Vec<u8>,
    pub gas_limit: u64,
    pub gas_price: u64,
    pub chain_id: String,
    pub version: u32,
    /// Nonce of an outstanding transaction this draft should replace
    pub nonce: Option<u64>,
}

impl TransactionDraft {
    pub fn new(receiver: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            receiver: receiver.into(),
            value: value.into(),
            version: 1,
            ..Default::default()
        }
    }

    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    pub fn with_gas_limit(mut self, gas_limit: u64) -> Self {
        self.gas_limit = gas_limit;
        self
    }

    pub fn with_gas_price(mut self, gas_price: u64) -> Self {
        self.gas_price = gas_price;
        self
    }

    pub fn with_chain_id(mut self, chain_id: impl Into<String>) -> Self {
        self.chain_id = chain_id.into();
        self
    }

    pub fn with_nonce(mut self, nonce: u64) -> Self {
        self.nonce = Some(nonce);
        self
    }
}

/// The unit handed to the ledger: a draft with sender, nonce and gas price
/// fixed, optionally carrying a signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    sender: Address,
    nonce: u64,
    gas_price: u64,
    gas_limit: u64,
    receiver: String,
    value: String,
    data: Vec<u8>,
    chain_id: String,
    version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signature: Option<Vec<u8>>,
}

/// Fields covered by the signature
#[derive(Serialize)]
struct SigningPayload<'a> {
    sender: &'a Address,
    nonce: u64,
    gas_price: u64,
    gas_limit: u64,
    receiver: &'a str,
    value: &'a str,
    data: String,
    chain_id: &'a str,
    version: u32,
}

impl TransactionRecord {
    /// Fix a draft at `nonce` and `gas_price` for `sender`
    pub fn new(sender: Address, nonce: u64, gas_price: u64, draft: TransactionDraft) -> Self {
        Self {
            sender,
            nonce,
            gas_price,
            gas_limit: draft.gas_limit,
            receiver: draft.receiver,
            value: draft.value,
            data: draft.data,
            chain_id: draft.chain_id,
            version: draft.version,
            signature: None,
        }
    }

    pub fn sender(&self) -> &Address {
        &self.sender
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn gas_price(&self) -> u64 {
        self.gas_price
    }

    pub fn gas_limit(&self) -> u64 {
        self.gas_limit
    }

    pub fn receiver(&self) -> &str {
        &self.receiver
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn signature(&self) -> Option<&[u8]> {
        self.signature.as_deref()
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    /// Canonical JSON of every field except the signature
    pub fn signing_payload(&self) -> SequencerResult<Vec<u8>> {
        let payload = SigningPayload {
            sender: &self.sender,
            nonce: self.nonce,
            gas_price: self.gas_price,
            gas_limit: self.gas_limit,
            receiver: &self.receiver,
            value: &self.value,
            data: hex::encode(&self.data),
            chain_id: &self.chain_id,
            version: self.version,
        };

        serde_json::to_vec(&payload).map_err(|e| SequencerError::Signing(e.to_string()))
    }

    /// Sign the record, consuming the unsigned form
    pub fn sign(mut self, signer: &dyn TransactionSigner) -> SequencerResult<Self> {
        if self.is_signed() {
            return Err(SequencerError::Signing(format!(
                "transaction with nonce {} is already signed",
                self.nonce
            )));
        }

        let payload = self.signing_payload()?;
        self.signature = Some(signer.sign(&payload)?);
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ReverseSigner;

    impl TransactionSigner for ReverseSigner {
        fn sign(&self, payload: &[u8]) -> SequencerResult<Vec<u8>> {
            Ok(payload.iter().rev().take(8).copied().collect())
        }
    }

    fn sender() -> Address {
        Address::from_bytes("test", vec![1u8; 32]).unwrap()
    }

    #[test]
    fn test_record_from_draft() {
        let draft = TransactionDraft::new("test1receiver", "1000")
            .with_data(b"transfer".to_vec())
            .with_gas_limit(50_000)
            .with_gas_price(10)
            .with_chain_id("T");

        let record = TransactionRecord::new(sender(), 4, 12, draft);
        assert_eq!(record.nonce(), 4);
        assert_eq!(record.gas_price(), 12);
        assert_eq!(record.gas_limit(), 50_000);
        assert_eq!(record.data(), b"transfer");
        assert_eq!(record.version(), 1);
        assert!(!record.is_signed());
    }

    #[test]
    fn test_sign_once() {
        let record = TransactionRecord::new(sender(), 0, 1, TransactionDraft::new("r", "1"));
        let payload = record.signing_payload().unwrap();

        let signed = record.sign(&ReverseSigner).unwrap();
        assert!(signed.is_signed());
        // the signature does not feed back into the payload
        assert_eq!(signed.signing_payload().unwrap(), payload);

        assert!(matches!(
            signed.sign(&ReverseSigner),
            Err(SequencerError::Signing(_))
        ));
    }
}
