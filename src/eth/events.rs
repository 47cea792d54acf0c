// src/eth/events.rs
//! Decoding of the contract's event logs.
//!
//! Only three event shapes exist, so each one is read by direct slicing at
//! fixed offsets instead of going through a general ABI decoder. Every field
//! sits in a 32-byte word: integers are big-endian in the low bytes of their
//! word, addresses take the low 20 bytes, and roots arrive in the opposite
//! byte order to the one used inside the node and are reversed here.

use crate::types::{Hash, ProcessId, HASH_LEN};
use std::fmt;
use thiserror::Error;

const WORD: usize = 32;
const ADDRESS_LEN: usize = 20;

pub type Address = [u8; ADDRESS_LEN];

/// Data length of `EventProcessCreated` (9 words).
pub const PROCESS_CREATED_LEN: usize = 9 * WORD;
/// Data length of `EventResultPublished` (5 words).
pub const RESULT_PUBLISHED_LEN: usize = 5 * WORD;
/// Data length of `EventProcessClosed` (3 words).
pub const PROCESS_CLOSED_LEN: usize = 3 * WORD;

// EventProcessCreated word offsets
const PC_CREATOR: usize = 0;
const PC_PROCESS_ID: usize = WORD;
const PC_TX_HASH: usize = 2 * WORD;
const PC_CENSUS_ROOT: usize = 3 * WORD;
const PC_CENSUS_SIZE: usize = 4 * WORD;
const PC_RES_PUB_START: usize = 5 * WORD;
const PC_RES_PUB_WINDOW: usize = 6 * WORD;
const PC_MIN_PARTICIPATION: usize = 7 * WORD;
const PC_TYPE: usize = 8 * WORD;

// EventResultPublished word offsets
const RP_PUBLISHER: usize = 0;
const RP_PROCESS_ID: usize = WORD;
const RP_RECEIPTS_ROOT: usize = 2 * WORD;
const RP_RESULT: usize = 3 * WORD;
const RP_N_VOTES: usize = 4 * WORD;

// EventProcessClosed word offsets
const PCL_CALLER: usize = 0;
const PCL_PROCESS_ID: usize = WORD;
const PCL_SUCCESS: usize = 2 * WORD;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum EventKind {
    ProcessCreated,
    ResultPublished,
    ProcessClosed,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [
        EventKind::ProcessCreated,
        EventKind::ResultPublished,
        EventKind::ProcessClosed,
    ];

    /// Exact data length of a log of this kind.
    pub fn data_len(&self) -> usize {
        match self {
            EventKind::ProcessCreated => PROCESS_CREATED_LEN,
            EventKind::ResultPublished => RESULT_PUBLISHED_LEN,
            EventKind::ProcessClosed => PROCESS_CLOSED_LEN,
        }
    }

    /// Solidity signature, used to derive the log topic.
    pub fn signature(&self) -> &'static str {
        match self {
            EventKind::ProcessCreated => {
                "EventProcessCreated(address,uint256,uint256,uint256,uint64,uint64,uint64,uint8,uint8)"
            }
            EventKind::ResultPublished => {
                "EventResultPublished(address,uint256,uint256,uint64,uint64)"
            }
            EventKind::ProcessClosed => "EventProcessClosed(address,uint256,bool)",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("{kind:?} event log should be of length {expected}, current: {actual}")]
    LengthMismatch {
        kind: EventKind,
        expected: usize,
        actual: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessCreated {
    pub creator: Address,
    pub process_id: ProcessId,
    pub tx_hash: Hash,
    pub census_root: Hash,
    pub census_size: u64,
    pub res_pub_start_block: u64,
    pub res_pub_window: u64,
    pub min_participation: u8,
    pub typ: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultPublished {
    pub publisher: Address,
    pub process_id: ProcessId,
    pub receipts_root: Hash,
    pub result: u64,
    pub n_votes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessClosed {
    pub caller: Address,
    pub process_id: ProcessId,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    ProcessCreated(ProcessCreated),
    ResultPublished(ResultPublished),
    ProcessClosed(ProcessClosed),
}

impl ChainEvent {
    pub fn process_id(&self) -> ProcessId {
        match self {
            ChainEvent::ProcessCreated(e) => e.process_id,
            ChainEvent::ResultPublished(e) => e.process_id,
            ChainEvent::ProcessClosed(e) => e.process_id,
        }
    }
}

/// Decode a log payload of the given kind.
pub fn decode(kind: EventKind, data: &[u8]) -> Result<ChainEvent, DecodeError> {
    let expected = kind.data_len();
    if data.len() != expected {
        return Err(DecodeError::LengthMismatch {
            kind,
            expected,
            actual: data.len(),
        });
    }
    let ev = match kind {
        EventKind::ProcessCreated => ChainEvent::ProcessCreated(ProcessCreated {
            creator: address(data, PC_CREATOR),
            process_id: word_u64(data, PC_PROCESS_ID),
            tx_hash: word_hash(data, PC_TX_HASH),
            census_root: swapped_hash(data, PC_CENSUS_ROOT),
            census_size: word_u64(data, PC_CENSUS_SIZE),
            res_pub_start_block: word_u64(data, PC_RES_PUB_START),
            res_pub_window: word_u64(data, PC_RES_PUB_WINDOW),
            min_participation: word_u8(data, PC_MIN_PARTICIPATION),
            typ: word_u8(data, PC_TYPE),
        }),
        EventKind::ResultPublished => ChainEvent::ResultPublished(ResultPublished {
            publisher: address(data, RP_PUBLISHER),
            process_id: word_u64(data, RP_PROCESS_ID),
            receipts_root: swapped_hash(data, RP_RECEIPTS_ROOT),
            result: word_u64(data, RP_RESULT),
            n_votes: word_u64(data, RP_N_VOTES),
        }),
        EventKind::ProcessClosed => ChainEvent::ProcessClosed(ProcessClosed {
            caller: address(data, PCL_CALLER),
            process_id: word_u64(data, PCL_PROCESS_ID),
            // lenient: only an exact 1 is true
            success: word_u8(data, PCL_SUCCESS) == 1,
        }),
    };
    Ok(ev)
}

// The helpers below are only called after the length check, so every slice is in bounds.

fn word(data: &[u8], offset: usize) -> &[u8] {
    &data[offset..offset + WORD]
}

fn word_u64(data: &[u8], offset: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&word(data, offset)[WORD - 8..]);
    u64::from_be_bytes(b)
}

fn word_u8(data: &[u8], offset: usize) -> u8 {
    word(data, offset)[WORD - 1]
}

fn word_hash(data: &[u8], offset: usize) -> Hash {
    let mut h = [0u8; HASH_LEN];
    h.copy_from_slice(word(data, offset));
    h
}

fn swapped_hash(data: &[u8], offset: usize) -> Hash {
    let mut h = word_hash(data, offset);
    h.reverse();
    h
}

fn address(data: &[u8], offset: usize) -> Address {
    let mut a = [0u8; ADDRESS_LEN];
    a.copy_from_slice(&word(data, offset)[WORD - ADDRESS_LEN..]);
    a
}

impl fmt::Display for ChainEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainEvent::ProcessCreated(e) => write!(
                f,
                "[ProcessCreated]: Creator 0x{}, ProcessID: {}, TxHash: {}, CensusRoot: {}, \
                 Type: {}, CensusSize: {}, ResPubStartBlock: {}, ResPubWindow: {}, \
                 MinParticipation: {}",
                hex::encode(e.creator),
                e.process_id,
                hex::encode(e.tx_hash),
                hex::encode(e.census_root),
                e.typ,
                e.census_size,
                e.res_pub_start_block,
                e.res_pub_window,
                e.min_participation
            ),
            ChainEvent::ResultPublished(e) => write!(
                f,
                "[ResultPublished]: Publisher 0x{}, ProcessID: {}, ReceiptsRoot: {}, \
                 Result: {}, NVotes: {}",
                hex::encode(e.publisher),
                e.process_id,
                hex::encode(e.receipts_root),
                e.result,
                e.n_votes
            ),
            ChainEvent::ProcessClosed(e) => write!(
                f,
                "[ProcessClosed]: Caller 0x{}, ProcessID: {}, Success: {}",
                hex::encode(e.caller),
                e.process_id,
                e.success
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_u64(buf: &mut [u8], word_offset: usize, v: u64) {
        buf[word_offset + WORD - 8..word_offset + WORD].copy_from_slice(&v.to_be_bytes());
    }

    fn put_address(buf: &mut [u8], word_offset: usize, a: [u8; 20]) {
        buf[word_offset + 12..word_offset + WORD].copy_from_slice(&a);
    }

    fn ascending(start: u8) -> [u8; 32] {
        let mut h = [0u8; 32];
        for (i, b) in h.iter_mut().enumerate() {
            *b = start.wrapping_add(i as u8);
        }
        h
    }

    #[test]
    fn decode_process_created_fields() {
        let mut d = vec![0u8; PROCESS_CREATED_LEN];
        // garbage in the high bytes of an address word must be ignored
        d[0..12].copy_from_slice(&[0xEE; 12]);
        put_address(&mut d, 0, [0xAB; 20]);
        put_u64(&mut d, 32, 101);
        d[64..96].copy_from_slice(&ascending(0));
        d[96..128].copy_from_slice(&ascending(100));
        put_u64(&mut d, 128, 3);
        put_u64(&mut d, 160, 6_945_500);
        put_u64(&mut d, 192, 20);
        d[255] = 10;
        d[287] = 1;

        let ev = decode(EventKind::ProcessCreated, &d).unwrap();
        let ChainEvent::ProcessCreated(e) = ev else {
            panic!("wrong variant");
        };
        assert_eq!(e.creator, [0xAB; 20]);
        assert_eq!(e.process_id, 101);
        assert_eq!(e.tx_hash, ascending(0));
        let mut root = ascending(100);
        root.reverse();
        assert_eq!(e.census_root, root);
        assert_eq!(e.census_size, 3);
        assert_eq!(e.res_pub_start_block, 6_945_500);
        assert_eq!(e.res_pub_window, 20);
        assert_eq!(e.min_participation, 10);
        assert_eq!(e.typ, 1);
    }

    #[test]
    fn integer_fields_read_only_the_low_eight_bytes() {
        let mut d = vec![0u8; PROCESS_CREATED_LEN];
        // high bytes of the uint256 id word are outside the u64 window
        d[32..56].copy_from_slice(&[0xFF; 24]);
        put_u64(&mut d, 32, 42);
        let ChainEvent::ProcessCreated(e) = decode(EventKind::ProcessCreated, &d).unwrap() else {
            panic!("wrong variant");
        };
        assert_eq!(e.process_id, 42);
    }

    #[test]
    fn decode_result_published_fields() {
        let mut d = vec![0u8; RESULT_PUBLISHED_LEN];
        put_address(&mut d, 0, [0x11; 20]);
        put_u64(&mut d, 32, 7);
        d[64..96].copy_from_slice(&ascending(1));
        put_u64(&mut d, 96, 1);
        put_u64(&mut d, 128, 3);

        let ChainEvent::ResultPublished(e) = decode(EventKind::ResultPublished, &d).unwrap() else {
            panic!("wrong variant");
        };
        assert_eq!(e.publisher, [0x11; 20]);
        assert_eq!(e.process_id, 7);
        let mut rr = ascending(1);
        rr.reverse();
        assert_eq!(e.receipts_root, rr);
        assert_eq!(e.result, 1);
        assert_eq!(e.n_votes, 3);
    }

    #[test]
    fn process_closed_success_byte_is_lenient() {
        let mut d = vec![0u8; PROCESS_CLOSED_LEN];
        put_u64(&mut d, 32, 9);
        let closed = |d: &[u8]| match decode(EventKind::ProcessClosed, d).unwrap() {
            ChainEvent::ProcessClosed(e) => e,
            _ => panic!("wrong variant"),
        };

        assert!(!closed(&d).success);
        d[95] = 1;
        let e = closed(&d);
        assert!(e.success);
        assert_eq!(e.process_id, 9);
        d[95] = 2;
        assert!(!closed(&d).success);
        d[95] = 0xFF;
        assert!(!closed(&d).success);
        // bytes other than the trailing one do not count
        d[95] = 0;
        d[94] = 1;
        assert!(!closed(&d).success);
    }

    #[test]
    fn wrong_length_is_rejected_for_every_kind() {
        for kind in EventKind::ALL {
            let n = kind.data_len();
            for len in [0, n - 1, n + 1, n + 32] {
                let err = decode(kind, &vec![0u8; len]).unwrap_err();
                assert_eq!(
                    err,
                    DecodeError::LengthMismatch {
                        kind,
                        expected: n,
                        actual: len
                    }
                );
            }
        }
    }

    #[test]
    fn lengths_are_distinct() {
        assert_ne!(PROCESS_CREATED_LEN, RESULT_PUBLISHED_LEN);
        assert_ne!(RESULT_PUBLISHED_LEN, PROCESS_CLOSED_LEN);
        assert_ne!(PROCESS_CREATED_LEN, PROCESS_CLOSED_LEN);
    }
}
