use rlp_derive::{RlpDecodable, RlpEncodable};

use super::TxPoolError;
use crate::common::Bytes;
use crate::tx::Transaction;

/// Type URL of a host envelope that wraps a VM transaction.
pub const VM_TX_TYPE_URL: &str = "/evmhost.v1.WrappedVmTransaction";

/// The host's native transaction envelope.
#[derive(RlpEncodable, RlpDecodable, Clone, PartialEq, Eq, Debug)]
pub struct HostEnvelope {
    pub type_url: String,
    pub payload: Bytes,
}

impl HostEnvelope {
    pub fn encode(&self) -> Vec<u8> {
        rlp::encode(self).to_vec()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, TxPoolError> {
        Ok(rlp::decode(raw)?)
    }

    pub fn is_vm_tx(&self) -> bool {
        self.type_url == VM_TX_TYPE_URL
    }

    /// The wrapped VM transaction.
    pub fn unwrap_tx(&self) -> Result<Transaction, TxPoolError> {
        if !self.is_vm_tx() {
            return Err(TxPoolError::ForeignType(self.type_url.clone()))
        }
        Ok(Transaction::decode(&self.payload)?)
    }
}

pub trait TxSerializer: Send + Sync {
    fn to_host_envelope(&self, tx: &Transaction) -> Result<HostEnvelope, TxPoolError>;

    fn to_host_bytes(&self, tx: &Transaction) -> Result<Vec<u8>, TxPoolError> {
        Ok(self.to_host_envelope(tx)?.encode())
    }
}

/// Wraps signed VM transactions; unsigned ones are rejected since the host could not verify them.
#[derive(Clone, Copy, Default, Debug)]
pub struct EnvelopeSerializer;

impl TxSerializer for EnvelopeSerializer {
    fn to_host_envelope(&self, tx: &Transaction) -> Result<HostEnvelope, TxPoolError> {
        tx.recover_sender()
            .map_err(|e| TxPoolError::Serialize(e.to_string()))?;
        Ok(HostEnvelope {
            type_url: VM_TX_TYPE_URL.to_string(),
            payload: tx.encode().into(),
        })
    }
}

#[test]
fn test_envelope() {
    use crate::common::{Addr, Wei};
    let key = libsecp256k1::SecretKey::parse(&[5; 32]).unwrap();
    let tx = Transaction::legacy(
        1,
        0,
        10u64.into(),
        21_000,
        Some(Addr::from([1; 20])),
        Wei::from(3u64),
        Bytes::empty(),
    );
    assert!(matches!(
        EnvelopeSerializer.to_host_bytes(&tx),
        Err(TxPoolError::Serialize(_))
    ));
    let tx = tx.sign(&key).unwrap();
    let raw = EnvelopeSerializer.to_host_bytes(&tx).unwrap();
    let envelope = HostEnvelope::decode(&raw).unwrap();
    assert!(envelope.is_vm_tx());
    assert_eq!(envelope.unwrap_tx().unwrap(), tx);

    let foreign = HostEnvelope {
        type_url: "/bank.MsgSend".into(),
        payload: Bytes::empty(),
    };
    assert_eq!(
        foreign.unwrap_tx(),
        Err(TxPoolError::ForeignType("/bank.MsgSend".into()))
    );
    assert!(HostEnvelope::decode(&[0x01]).is_err());
}
