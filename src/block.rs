//! Blocks, receipts and transaction lookups as the VM sees them once a block is committed.
//!
//! Only consensus fields are ever encoded. Receipts and logs carry a second set of *derived*
//! fields (block hash, transaction index, contract address, ...) that are recomputed from the
//! containing block by [derive_receipts] every time receipts are served, so the stored encoding
//! never needs to duplicate them.

use std::fmt;

use once_cell::sync::OnceCell;
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use thiserror::Error;

use crate::common::{create_addr, Addr, Bytes, Gas, Hash, Wei};
use crate::tx::{Transaction, TxError};

#[derive(Clone, Default, Debug)]
pub struct Header {
    parent_hash: Hash,
    coinbase: Addr,
    number: u64,
    gas_limit: Gas,
    gas_used: Gas,
    timestamp: u64,
    base_fee: Option<Wei>,
    cached_hash: OnceCell<Hash>,
}

impl PartialEq for Header {
    fn eq(&self, other: &Self) -> bool {
        self.parent_hash == other.parent_hash &&
            self.coinbase == other.coinbase &&
            self.number == other.number &&
            self.gas_limit == other.gas_limit &&
            self.gas_used == other.gas_used &&
            self.timestamp == other.timestamp &&
            self.base_fee == other.base_fee
    }
}

impl Eq for Header {}

impl Header {
    pub fn new(
        parent_hash: Hash, coinbase: Addr, number: u64, gas_limit: Gas,
        gas_used: Gas, timestamp: u64, base_fee: Option<Wei>,
    ) -> Self {
        Self {
            parent_hash,
            coinbase,
            number,
            gas_limit,
            gas_used,
            timestamp,
            base_fee,
            cached_hash: OnceCell::new(),
        }
    }

    pub fn parent_hash(&self) -> &Hash {
        &self.parent_hash
    }

    pub fn coinbase(&self) -> &Addr {
        &self.coinbase
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn gas_limit(&self) -> Gas {
        self.gas_limit
    }

    pub fn gas_used(&self) -> Gas {
        self.gas_used
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn base_fee(&self) -> Option<&Wei> {
        self.base_fee.as_ref()
    }

    /// The same header with `gas_used` replaced and the hash invalidated.
    pub fn with_gas_used(mut self, gas_used: Gas) -> Self {
        self.gas_used = gas_used;
        self.cached_hash = OnceCell::new();
        self
    }

    /// Keccak-256 of the encoded header; computed once.
    pub fn hash(&self) -> &Hash {
        self.cached_hash
            .get_or_init(|| Hash::hash(&rlp::encode(self)))
    }
}

impl Encodable for Header {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(if self.base_fee.is_some() { 7 } else { 6 });
        s.append(&self.parent_hash)
            .append(&self.coinbase)
            .append(&self.number)
            .append(&self.gas_limit)
            .append(&self.gas_used)
            .append(&self.timestamp);
        if let Some(base_fee) = &self.base_fee {
            s.append(base_fee);
        }
    }
}

impl Decodable for Header {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        let base_fee = match rlp.item_count()? {
            6 => None,
            7 => Some(rlp.val_at(6)?),
            _ => return Err(DecoderError::RlpIncorrectListLen),
        };
        Ok(Header::new(
            rlp.val_at(0)?,
            rlp.val_at(1)?,
            rlp.val_at(2)?,
            rlp.val_at(3)?,
            rlp.val_at(4)?,
            rlp.val_at(5)?,
            base_fee,
        ))
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Block {
    pub header: Header,
    pub txs: Vec<Transaction>,
}

impl Block {
    pub fn new(header: Header, txs: Vec<Transaction>) -> Self {
        Self { header, txs }
    }

    /// A block that only carries a header (e.g. the genesis block synthesized from the host).
    pub fn with_header(header: Header) -> Self {
        Self {
            header,
            txs: Vec::new(),
        }
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn hash(&self) -> &Hash {
        self.header.hash()
    }

    pub fn parent(&self) -> &Hash {
        &self.header.parent_hash
    }

    pub fn encode(&self) -> Vec<u8> {
        rlp::encode(self).to_vec()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, DecoderError> {
        rlp::decode(raw)
    }
}

impl Encodable for Block {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2);
        s.append(&self.header);
        s.begin_list(self.txs.len());
        for tx in &self.txs {
            s.append(&tx.encode());
        }
    }
}

impl Decodable for Block {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 2 {
            return Err(DecoderError::RlpIncorrectListLen)
        }
        let header = rlp.val_at(0)?;
        let mut txs = Vec::new();
        for raw in rlp.at(1)?.iter() {
            let raw: Vec<u8> = raw.as_val()?;
            txs.push(
                Transaction::decode(&raw)
                    .map_err(|_| DecoderError::Custom("invalid transaction"))?,
            );
        }
        Ok(Self { header, txs })
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[Block {}({})=>{} txs={}]",
            self.hash(),
            self.number(),
            self.parent(),
            self.txs.len()
        )
    }
}

#[derive(Clone, PartialEq, Eq, Default, Debug)]
pub struct Log {
    pub address: Addr,
    pub topics: Vec<Hash>,
    pub data: Bytes,
    // derived
    pub block_number: u64,
    pub block_hash: Hash,
    pub tx_hash: Hash,
    pub tx_index: u64,
    pub index: u64,
}

impl Log {
    pub fn new(address: Addr, topics: Vec<Hash>, data: Bytes) -> Self {
        Self {
            address,
            topics,
            data,
            ..Default::default()
        }
    }
}

impl Encodable for Log {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(3);
        s.append(&self.address)
            .append_list::<Hash, Hash>(&self.topics)
            .append(&self.data);
    }
}

impl Decodable for Log {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 3 {
            return Err(DecoderError::RlpIncorrectListLen)
        }
        Ok(Log::new(rlp.val_at(0)?, rlp.list_at(1)?, rlp.val_at(2)?))
    }
}

pub const RECEIPT_STATUS_FAILED: u64 = 0;
pub const RECEIPT_STATUS_SUCCESSFUL: u64 = 1;

#[derive(Clone, PartialEq, Eq, Default, Debug)]
pub struct Receipt {
    pub status: u64,
    pub cumulative_gas_used: Gas,
    pub gas_used: Gas,
    pub logs: Vec<Log>,
    // derived
    pub tx_hash: Hash,
    pub contract_address: Option<Addr>,
    pub block_hash: Hash,
    pub block_number: u64,
    pub tx_index: u64,
}

impl Receipt {
    pub fn new(
        status: u64, cumulative_gas_used: Gas, gas_used: Gas, logs: Vec<Log>,
    ) -> Self {
        Self {
            status,
            cumulative_gas_used,
            gas_used,
            logs,
            ..Default::default()
        }
    }
}

impl Encodable for Receipt {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(4);
        s.append(&self.status)
            .append(&self.cumulative_gas_used)
            .append(&self.gas_used)
            .append_list::<Log, Log>(&self.logs);
    }
}

impl Decodable for Receipt {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 4 {
            return Err(DecoderError::RlpIncorrectListLen)
        }
        Ok(Receipt::new(
            rlp.val_at(0)?,
            rlp.val_at(1)?,
            rlp.val_at(2)?,
            rlp.list_at(3)?,
        ))
    }
}

/// Location of an included transaction.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TxLookupEntry {
    pub block_hash: Hash,
    pub block_number: u64,
    pub index: u64,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeriveError {
    #[error("block has {txs} transactions but {receipts} receipts")]
    CountMismatch { txs: usize, receipts: usize },
    #[error("cannot derive contract address: {0}")]
    Sender(#[from] TxError),
}

/// Build the public receipt set of `block` from its stored receipts, filling in every field
/// that depends on the block. `stored` is never modified.
pub fn derive_receipts(
    stored: &[Receipt], block: &Block,
) -> Result<Vec<Receipt>, DeriveError> {
    if stored.len() != block.txs.len() {
        return Err(DeriveError::CountMismatch {
            txs: block.txs.len(),
            receipts: stored.len(),
        })
    }
    let block_hash = *block.hash();
    let block_number = block.number();
    let mut log_index = 0;
    let mut derived = Vec::with_capacity(stored.len());
    for (i, (receipt, tx)) in stored.iter().zip(block.txs.iter()).enumerate() {
        let mut r = receipt.clone();
        r.tx_hash = *tx.hash();
        r.block_hash = block_hash;
        r.block_number = block_number;
        r.tx_index = i as u64;
        r.contract_address = match tx.to() {
            None => Some(create_addr(&tx.recover_sender()?, tx.nonce())),
            Some(_) => None,
        };
        for log in r.logs.iter_mut() {
            log.block_number = block_number;
            log.block_hash = block_hash;
            log.tx_hash = r.tx_hash;
            log.tx_index = r.tx_index;
            log.index = log_index;
            log_index += 1;
        }
        derived.push(r);
    }
    Ok(derived)
}

/// Lookup entries for every transaction of `block`.
pub fn tx_lookup_entries(block: &Block) -> Vec<(Hash, TxLookupEntry)> {
    block
        .txs
        .iter()
        .enumerate()
        .map(|(i, tx)| {
            (
                *tx.hash(),
                TxLookupEntry {
                    block_hash: *block.hash(),
                    block_number: block.number(),
                    index: i as u64,
                },
            )
        })
        .collect()
}

#[cfg(test)]
fn sample_block() -> Block {
    let key = libsecp256k1::SecretKey::parse(&[3; 32]).unwrap();
    let call = Transaction::dynamic_fee(
        1,
        0,
        1u64.into(),
        10u64.into(),
        50_000,
        Some(Addr::from([9; 20])),
        *Wei::zero(),
        Bytes::empty(),
    )
    .sign(&key)
    .unwrap();
    let create = Transaction::legacy(
        1,
        1,
        10u64.into(),
        90_000,
        None,
        *Wei::zero(),
        vec![0x60, 0x00].into(),
    )
    .sign(&key)
    .unwrap();
    Block::new(
        Header::new(
            Hash::from([1; 32]),
            Addr::from([2; 20]),
            5,
            8_000_000,
            70_000,
            1_700_000_000,
            Some(7u64.into()),
        ),
        vec![call, create],
    )
}

#[test]
fn test_block_encoding() {
    let block = sample_block();
    let decoded = Block::decode(&block.encode()).unwrap();
    assert_eq!(decoded, block);
    assert_eq!(decoded.hash(), block.hash());
    assert_eq!(decoded.encode(), block.encode());

    let genesis = Block::with_header(Header::default());
    let decoded = Block::decode(&genesis.encode()).unwrap();
    assert_eq!(decoded.header.base_fee(), None);
    assert!(decoded.txs.is_empty());
}

#[test]
fn test_header_hash_follows_fields() {
    let header = sample_block().header;
    let before = *header.hash();
    let header = header.with_gas_used(21_000);
    assert_eq!(header.gas_used(), 21_000);
    assert_ne!(*header.hash(), before);
    let fresh = Header::new(
        *header.parent_hash(),
        *header.coinbase(),
        header.number(),
        header.gas_limit(),
        21_000,
        header.timestamp(),
        header.base_fee().cloned(),
    );
    assert_eq!(header.hash(), fresh.hash());
}

#[test]
fn test_derive_receipts() {
    let block = sample_block();
    let log = Log::new(Addr::from([9; 20]), vec![Hash::from([4; 32])], Bytes::empty());
    let stored = vec![
        Receipt::new(RECEIPT_STATUS_SUCCESSFUL, 30_000, 30_000, vec![log.clone(), log]),
        Receipt::new(RECEIPT_STATUS_SUCCESSFUL, 70_000, 40_000, Vec::new()),
    ];
    let derived = derive_receipts(&stored, &block).unwrap();
    assert_eq!(derived[0].block_hash, *block.hash());
    assert_eq!(derived[1].tx_index, 1);
    assert_eq!(derived[0].contract_address, None);
    let sender = block.txs[1].recover_sender().unwrap();
    assert_eq!(derived[1].contract_address, Some(create_addr(&sender, 1)));
    assert_eq!(derived[0].logs[1].index, 1);
    assert_eq!(derived[0].logs[1].tx_hash, *block.txs[0].hash());
    // stored values stay free of derived fields
    assert_eq!(stored[0].block_hash, Hash::default());
    // derived fields never reach the encoding
    assert_eq!(rlp::encode(&derived[0]), rlp::encode(&stored[0]));

    assert_eq!(
        derive_receipts(&stored[..1], &block),
        Err(DeriveError::CountMismatch {
            txs: 2,
            receipts: 1
        })
    );
}
