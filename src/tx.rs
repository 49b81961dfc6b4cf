//! The VM's transaction model: EIP-155 legacy and EIP-1559 dynamic-fee transactions, their
//! canonical encoding, hashing, signing and sender recovery.

use once_cell::sync::OnceCell;
use rlp_derive::{RlpDecodable, RlpEncodable};
use sha3::Digest;
use thiserror::Error;

use crate::common::{Addr, Bytes, Gas, Hash, NullableAddr, Wei, U256, U256RLP};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxError {
    #[error("malformed transaction encoding: {0}")]
    Decode(String),
    #[error("unsupported transaction type 0x{0:02x}")]
    UnsupportedType(u8),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("chain id mismatch: expected {expected}, got {got}")]
    ChainIdMismatch { expected: u64, got: u64 },
}

impl From<rlp::DecoderError> for TxError {
    fn from(e: rlp::DecoderError) -> Self {
        TxError::Decode(e.to_string())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TxType {
    Legacy = 0x0,
    DynamicFee = 0x2,
}

#[derive(RlpDecodable, RlpEncodable, Clone, PartialEq, Eq, Debug)]
pub struct AccessTuple {
    pub address: Addr,
    pub storage_keys: Vec<Hash>,
}

#[derive(RlpDecodable, RlpEncodable, Clone, PartialEq, Eq, Debug)]
pub struct TxLegacy {
    nonce: u64,
    gas_price: Wei,
    gas: Gas,
    to: NullableAddr,
    value: Wei,
    data: Bytes,
    v: U256RLP,
    r: U256RLP,
    s: U256RLP,
}

impl TxLegacy {
    fn is_signed(&self) -> bool {
        !(self.r.0.is_zero() && self.s.0.is_zero())
    }

    /// Chain id bound into `v`; `None` for unprotected (27/28) signatures.
    fn chain_id(&self) -> Option<u64> {
        let v = &self.v.0;
        if !self.is_signed() {
            // unsigned: `v` holds the chain id itself
            return if v.is_zero() { None } else { Some(v.low_u64()) }
        }
        if *v < U256::from(35u64) {
            return None
        }
        Some(((*v - U256::from(35u64)) / U256::from(2u64)).low_u64())
    }
}

#[derive(RlpDecodable, RlpEncodable, Clone, PartialEq, Eq, Debug)]
pub struct TxDynamicFee {
    chain_id: u64,
    nonce: u64,
    gas_tip_cap: Wei,
    gas_fee_cap: Wei,
    gas: Gas,
    to: NullableAddr,
    value: Wei,
    data: Bytes,
    access_list: Vec<AccessTuple>,
    v: U256RLP,
    r: U256RLP,
    s: U256RLP,
}

#[derive(Clone, PartialEq, Eq, Debug)]
enum TxInner {
    Legacy(TxLegacy),
    DynamicFee(TxDynamicFee),
}

/// A (possibly signed) VM transaction. The hash is derived from the canonical encoding and is
/// computed on first use.
#[derive(Clone, Debug)]
pub struct Transaction {
    inner: TxInner,
    hash: OnceCell<Hash>,
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner
    }
}

impl Eq for Transaction {}

impl Transaction {
    fn from_inner(inner: TxInner) -> Self {
        Self {
            inner,
            hash: OnceCell::new(),
        }
    }

    /// An unsigned EIP-155 legacy transaction. A zero `chain_id` builds an unprotected one.
    pub fn legacy(
        chain_id: u64, nonce: u64, gas_price: Wei, gas: Gas, to: Option<Addr>,
        value: Wei, data: Bytes,
    ) -> Self {
        Self::from_inner(TxInner::Legacy(TxLegacy {
            nonce,
            gas_price,
            gas,
            to: NullableAddr(to),
            value,
            data,
            // an unsigned EIP-155 transaction carries the chain id in `v`
            v: U256RLP(chain_id.into()),
            r: U256RLP(U256::zero()),
            s: U256RLP(U256::zero()),
        }))
    }

    /// An unsigned EIP-1559 transaction.
    pub fn dynamic_fee(
        chain_id: u64, nonce: u64, gas_tip_cap: Wei, gas_fee_cap: Wei,
        gas: Gas, to: Option<Addr>, value: Wei, data: Bytes,
    ) -> Self {
        Self::from_inner(TxInner::DynamicFee(TxDynamicFee {
            chain_id,
            nonce,
            gas_tip_cap,
            gas_fee_cap,
            gas,
            to: NullableAddr(to),
            value,
            data,
            access_list: Vec::new(),
            v: U256RLP(U256::zero()),
            r: U256RLP(U256::zero()),
            s: U256RLP(U256::zero()),
        }))
    }

    pub fn type_(&self) -> TxType {
        match &self.inner {
            TxInner::Legacy(_) => TxType::Legacy,
            TxInner::DynamicFee(_) => TxType::DynamicFee,
        }
    }

    pub fn hash(&self) -> &Hash {
        self.hash.get_or_init(|| Hash::hash(&self.encode()))
    }

    pub fn nonce(&self) -> u64 {
        match &self.inner {
            TxInner::Legacy(t) => t.nonce,
            TxInner::DynamicFee(t) => t.nonce,
        }
    }

    pub fn gas(&self) -> Gas {
        match &self.inner {
            TxInner::Legacy(t) => t.gas,
            TxInner::DynamicFee(t) => t.gas,
        }
    }

    pub fn gas_fee_cap(&self) -> &Wei {
        match &self.inner {
            TxInner::Legacy(t) => &t.gas_price,
            TxInner::DynamicFee(t) => &t.gas_fee_cap,
        }
    }

    pub fn gas_tip_cap(&self) -> &Wei {
        match &self.inner {
            TxInner::Legacy(t) => &t.gas_price,
            TxInner::DynamicFee(t) => &t.gas_tip_cap,
        }
    }

    pub fn to(&self) -> Option<&Addr> {
        match &self.inner {
            TxInner::Legacy(t) => t.to.0.as_ref(),
            TxInner::DynamicFee(t) => t.to.0.as_ref(),
        }
    }

    pub fn value(&self) -> &Wei {
        match &self.inner {
            TxInner::Legacy(t) => &t.value,
            TxInner::DynamicFee(t) => &t.value,
        }
    }

    pub fn data(&self) -> &Bytes {
        match &self.inner {
            TxInner::Legacy(t) => &t.data,
            TxInner::DynamicFee(t) => &t.data,
        }
    }

    /// Chain id the transaction is bound to, `None` for a pre-EIP-155 legacy transaction.
    pub fn chain_id(&self) -> Option<u64> {
        match &self.inner {
            TxInner::Legacy(t) => t.chain_id(),
            TxInner::DynamicFee(t) => Some(t.chain_id),
        }
    }

    /// The tip per gas the block producer receives under the given base fee. `None` means the
    /// fee cap does not even cover the base fee.
    pub fn effective_gas_tip(&self, base_fee: Option<&Wei>) -> Option<Wei> {
        let tip_cap = *self.gas_tip_cap();
        let base_fee = match base_fee {
            Some(b) => b,
            None => return Some(tip_cap),
        };
        let headroom = self.gas_fee_cap().checked_sub(base_fee)?;
        Some(std::cmp::min(tip_cap, headroom))
    }

    /// Canonical encoding: a plain RLP list for legacy transactions, `type || rlp(payload)` for
    /// typed ones.
    pub fn encode(&self) -> Vec<u8> {
        match &self.inner {
            TxInner::Legacy(t) => rlp::encode(t).to_vec(),
            TxInner::DynamicFee(t) => {
                let mut buff = vec![TxType::DynamicFee as u8];
                buff.extend_from_slice(&rlp::encode(t));
                buff
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TxError> {
        let first = *bytes
            .first()
            .ok_or_else(|| TxError::Decode("empty input".into()))?;
        let inner = if first >= 0xc0 {
            TxInner::Legacy(rlp::decode(bytes)?)
        } else if first == TxType::DynamicFee as u8 {
            TxInner::DynamicFee(rlp::decode(&bytes[1..])?)
        } else {
            return Err(TxError::UnsupportedType(first))
        };
        Ok(Self::from_inner(inner))
    }

    fn sig_hash(&self) -> Hash {
        match &self.inner {
            TxInner::Legacy(t) => {
                let chain_id = t.chain_id();
                let mut stream = rlp::RlpStream::new_list(match chain_id {
                    Some(_) => 9,
                    None => 6,
                });
                stream
                    .append(&t.nonce)
                    .append(&t.gas_price)
                    .append(&t.gas)
                    .append(&t.to)
                    .append(&t.value)
                    .append(&t.data);
                if let Some(chain_id) = chain_id {
                    stream.append(&chain_id).append(&0u8).append(&0u8);
                }
                Hash::hash(&stream.out())
            }
            TxInner::DynamicFee(t) => {
                let mut stream = rlp::RlpStream::new_list(9);
                stream
                    .append(&t.chain_id)
                    .append(&t.nonce)
                    .append(&t.gas_tip_cap)
                    .append(&t.gas_fee_cap)
                    .append(&t.gas)
                    .append(&t.to)
                    .append(&t.value)
                    .append(&t.data)
                    .append_list::<AccessTuple, AccessTuple>(&t.access_list);
                let mut hasher = sha3::Keccak256::new();
                hasher.update([TxType::DynamicFee as u8]);
                hasher.update(stream.out());
                Hash::from_slice(hasher.finalize().as_slice())
            }
        }
    }

    /// Sign the transaction with `key`, returning the signed copy.
    pub fn sign(
        mut self, key: &libsecp256k1::SecretKey,
    ) -> Result<Self, TxError> {
        let msg = libsecp256k1::Message::parse_slice(self.sig_hash().as_bytes())
            .map_err(|_| TxError::InvalidSignature)?;
        let (sig, recid) = libsecp256k1::sign(&msg, key);
        let raw = sig.serialize();
        let r = U256::from_big_endian(&raw[..32]);
        let s = U256::from_big_endian(&raw[32..]);
        let recid: u64 = recid.serialize().into();
        match &mut self.inner {
            TxInner::Legacy(t) => {
                let v = match t.chain_id() {
                    Some(chain_id) => eip155_offset(chain_id) + U256::from(recid),
                    None => U256::from(27 + recid),
                };
                t.v = U256RLP(v);
                t.r = U256RLP(r);
                t.s = U256RLP(s);
            }
            TxInner::DynamicFee(t) => {
                t.v = U256RLP(recid.into());
                t.r = U256RLP(r);
                t.s = U256RLP(s);
            }
        }
        self.hash = OnceCell::new();
        Ok(self)
    }

    /// Recover the sender from the signature.
    pub fn recover_sender(&self) -> Result<Addr, TxError> {
        let (v, r, s) = match &self.inner {
            TxInner::Legacy(t) => {
                let v = &t.v.0;
                let recid = match t.chain_id() {
                    Some(chain_id) => v
                        .checked_sub(eip155_offset(chain_id))
                        .ok_or(TxError::InvalidSignature)?,
                    None => v
                        .checked_sub(U256::from(27u64))
                        .ok_or(TxError::InvalidSignature)?,
                };
                (recid, t.r.0, t.s.0)
            }
            TxInner::DynamicFee(t) => (t.v.0, t.r.0, t.s.0),
        };
        recover_plain(&self.sig_hash(), r, s, v)
            .ok_or(TxError::InvalidSignature)
    }

    /// Recover the sender and check the transaction targets `chain_id`.
    pub fn recover_sender_for(&self, chain_id: u64) -> Result<Addr, TxError> {
        match self.chain_id() {
            Some(got) if got != chain_id => {
                Err(TxError::ChainIdMismatch {
                    expected: chain_id,
                    got,
                })
            }
            _ => self.recover_sender(),
        }
    }
}

/// `chain_id * 2 + 35`, the base of an EIP-155 `v` value.
fn eip155_offset(chain_id: u64) -> U256 {
    U256::from(chain_id) * U256::from(2u64) + U256::from(35u64)
}

#[inline]
fn secp256k1_half_n() -> &'static U256 {
    use std::str::FromStr;
    static V: OnceCell<U256> = OnceCell::new();
    V.get_or_init(|| {
        U256::from_str(
            "0x7fffffffffffffffffffffffffffffff5d576e7357a4501ddfe92f46681b20a0",
        )
        .unwrap_or_default()
    })
}

fn recover_plain(sig_hash: &Hash, r: U256, s: U256, v: U256) -> Option<Addr> {
    if v.bits() > 1 || r.is_zero() || s.is_zero() || &s > secp256k1_half_n() {
        return None
    }
    let mut raw = [0u8; 64];
    r.to_big_endian(&mut raw[..32]);
    s.to_big_endian(&mut raw[32..]);
    let sig = libsecp256k1::Signature::parse_standard(&raw).ok()?;
    let msg = libsecp256k1::Message::parse_slice(sig_hash.as_bytes()).ok()?;
    let recover_id = libsecp256k1::RecoveryId::parse(v.low_u64() as u8).ok()?;
    let pubkey = libsecp256k1::recover(&msg, &sig, &recover_id)
        .ok()?
        .serialize();
    Some(Addr::from_slice(
        &sha3::Keccak256::digest(&pubkey[1..]).as_slice()[12..],
    ))
}

/// Address controlled by a secret key.
pub fn key_to_addr(key: &libsecp256k1::SecretKey) -> Addr {
    let pubkey = libsecp256k1::PublicKey::from_secret_key(key).serialize();
    Addr::from_slice(&sha3::Keccak256::digest(&pubkey[1..]).as_slice()[12..])
}

#[cfg(test)]
fn test_key(seed: u8) -> libsecp256k1::SecretKey {
    libsecp256k1::SecretKey::parse(&[seed; 32]).unwrap()
}

#[test]
fn test_sign_and_recover() {
    let key = test_key(7);
    let sender = key_to_addr(&key);
    let tx = Transaction::dynamic_fee(
        1,
        3,
        2u64.into(),
        100u64.into(),
        21000,
        Some(Addr::from([1; 20])),
        5u64.into(),
        Bytes::empty(),
    )
    .sign(&key)
    .unwrap();
    assert_eq!(tx.recover_sender().unwrap(), sender);
    assert_eq!(tx.recover_sender_for(1).unwrap(), sender);
    assert_eq!(
        tx.recover_sender_for(2),
        Err(TxError::ChainIdMismatch {
            expected: 2,
            got: 1
        })
    );

    let legacy = Transaction::legacy(
        9,
        0,
        10u64.into(),
        21000,
        None,
        Wei::zero().clone(),
        vec![0x60, 0x00].into(),
    )
    .sign(&key)
    .unwrap();
    assert_eq!(legacy.chain_id(), Some(9));
    assert_eq!(legacy.recover_sender().unwrap(), sender);
}

#[test]
fn test_encoding_and_hash() {
    let key = test_key(9);
    let tx = Transaction::dynamic_fee(
        1,
        0,
        1u64.into(),
        50u64.into(),
        21000,
        None,
        Wei::zero().clone(),
        vec![1, 2, 3].into(),
    )
    .sign(&key)
    .unwrap();
    let raw = tx.encode();
    assert_eq!(raw[0], 0x02);
    let decoded = Transaction::decode(&raw).unwrap();
    assert_eq!(decoded, tx);
    assert_eq!(decoded.hash(), &Hash::hash(&raw));
    assert_eq!(Transaction::decode(&[0x05, 0xc0]), Err(TxError::UnsupportedType(5)));
    assert!(Transaction::decode(&[]).is_err());
}

#[test]
fn test_effective_gas_tip() {
    let tx = Transaction::dynamic_fee(
        1,
        0,
        5u64.into(),
        20u64.into(),
        21000,
        None,
        Wei::zero().clone(),
        Bytes::empty(),
    );
    assert_eq!(tx.effective_gas_tip(None), Some(5u64.into()));
    assert_eq!(tx.effective_gas_tip(Some(&10u64.into())), Some(5u64.into()));
    assert_eq!(tx.effective_gas_tip(Some(&18u64.into())), Some(2u64.into()));
    assert_eq!(tx.effective_gas_tip(Some(&21u64.into())), None);
}

#[test]
fn test_legacy_chain_ids() {
    let key = test_key(7);
    let sender = key_to_addr(&key);
    let transfer = |chain_id| {
        Transaction::legacy(
            chain_id,
            0,
            10u64.into(),
            21000,
            Some(Addr::from([2; 20])),
            1u64.into(),
            Bytes::empty(),
        )
    };

    // large ids stay intact through signing
    let tx = transfer(80085);
    assert_eq!(tx.chain_id(), Some(80085));
    let tx = tx.sign(&key).unwrap();
    assert_eq!(tx.chain_id(), Some(80085));
    assert_eq!(tx.recover_sender_for(80085).unwrap(), sender);
    let decoded = Transaction::decode(&tx.encode()).unwrap();
    assert_eq!(decoded.chain_id(), Some(80085));
    assert_eq!(decoded.recover_sender().unwrap(), sender);

    // 27 and 28 are chain ids, not unprotected `v` values
    for id in [27, 28] {
        let tx = transfer(id);
        assert_eq!(tx.chain_id(), Some(id));
        let tx = tx.sign(&key).unwrap();
        assert_eq!(tx.chain_id(), Some(id));
        assert_eq!(tx.recover_sender_for(id).unwrap(), sender);
        assert!(matches!(
            tx.recover_sender_for(1),
            Err(TxError::ChainIdMismatch { expected: 1, .. })
        ));
    }

    let unprotected = transfer(0).sign(&key).unwrap();
    assert_eq!(unprotected.chain_id(), None);
    assert_eq!(unprotected.recover_sender().unwrap(), sender);

    // an unsigned transaction has no sender
    assert_eq!(transfer(80085).recover_sender(), Err(TxError::InvalidSignature));
}
