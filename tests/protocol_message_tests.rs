//! Property tests for wire framing

use bytes::BytesMut;
use proptest::prelude::*;
use tokio_util::codec::Decoder;

use bllvm_harness::chain::{Hash256, OutPoint, Script, Transaction, TxIn, TxOut, COIN};
use bllvm_harness::network::error::DecodeError;
use bllvm_harness::network::protocol::{MESSAGE_HEADER_LEN, MSG_BLOCK, MSG_TX};
use bllvm_harness::network::{
    InventoryItem, MessageCodec, NetworkMagic, ProtocolMessage, ProtocolParser, RejectCode,
    RejectMessage,
};

fn hash() -> impl Strategy<Value = Hash256> {
    any::<[u8; 32]>().prop_map(Hash256)
}

fn inventory() -> impl Strategy<Value = InventoryItem> {
    (prop_oneof![Just(MSG_TX), Just(MSG_BLOCK)], hash())
        .prop_map(|(inv_type, hash)| InventoryItem { inv_type, hash })
}

fn transaction() -> impl Strategy<Value = Transaction> {
    let input = (hash(), any::<u32>(), prop::collection::vec(any::<u8>(), 0..40), any::<u32>())
        .prop_map(|(txid, vout, script, sequence)| TxIn {
            prevout: OutPoint::new(txid, vout),
            script_sig: Script::from_bytes(script),
            sequence,
        });
    let output = (0..21_000_000 * COIN, prop::collection::vec(any::<u8>(), 0..40)).prop_map(
        |(value, script)| TxOut {
            value,
            script_pubkey: Script::from_bytes(script),
        },
    );
    (
        any::<i32>(),
        prop::collection::vec(input, 1..4),
        prop::collection::vec(output, 1..4),
        any::<u32>(),
    )
        .prop_map(|(version, inputs, outputs, lock_time)| Transaction {
            version,
            inputs,
            outputs,
            lock_time,
        })
}

fn reject() -> impl Strategy<Value = RejectMessage> {
    (
        prop_oneof![Just("tx"), Just("block")],
        prop_oneof![
            Just(RejectCode::Invalid),
            Just(RejectCode::Duplicate),
            Just(RejectCode::Nonstandard),
            any::<u8>().prop_map(RejectCode::from_u8),
        ],
        "[a-z-]{0,40}",
        prop::option::of(hash()),
    )
        .prop_map(|(message, code, reason, data)| RejectMessage {
            message: message.to_string(),
            code,
            reason,
            data,
        })
}

fn message() -> impl Strategy<Value = ProtocolMessage> {
    prop_oneof![
        any::<u64>().prop_map(ProtocolMessage::Ping),
        any::<u64>().prop_map(ProtocolMessage::Pong),
        prop::collection::vec(inventory(), 0..20).prop_map(ProtocolMessage::Inv),
        prop::collection::vec(inventory(), 1..20).prop_map(ProtocolMessage::GetData),
        transaction().prop_map(ProtocolMessage::Tx),
        reject().prop_map(ProtocolMessage::Reject),
        any::<i64>().prop_map(ProtocolMessage::FeeFilter),
    ]
}

proptest! {
    #[test]
    fn test_frame_round_trip(msg in message()) {
        let frame = ProtocolParser::serialize_message(NetworkMagic::REGTEST, &msg).unwrap();
        let decoded = ProtocolParser::parse_message(NetworkMagic::REGTEST, &frame).unwrap();
        prop_assert_eq!(decoded, msg);
    }

    #[test]
    fn test_flipped_payload_byte_fails_checksum(
        tx in transaction(),
        position in any::<prop::sample::Index>(),
        mask in 1u8..=255,
    ) {
        let mut frame =
            ProtocolParser::serialize_message(NetworkMagic::REGTEST, &ProtocolMessage::Tx(tx)).unwrap();
        let offset = MESSAGE_HEADER_LEN + position.index(frame.len() - MESSAGE_HEADER_LEN);
        frame[offset] ^= mask;

        let result = ProtocolParser::parse_message(NetworkMagic::REGTEST, &frame);
        prop_assert!(
            matches!(result, Err(DecodeError::ChecksumMismatch { .. })),
            "expected checksum mismatch, got {:?}",
            result
        );
    }

    #[test]
    fn test_codec_reassembles_split_frames(
        messages in prop::collection::vec(message(), 1..5),
        chunk in 1usize..64,
    ) {
        let mut wire = Vec::new();
        for msg in &messages {
            wire.extend(ProtocolParser::serialize_message(NetworkMagic::REGTEST, msg).unwrap());
        }

        let mut codec = MessageCodec::new(NetworkMagic::REGTEST);
        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();
        for piece in wire.chunks(chunk) {
            buf.extend_from_slice(piece);
            while let Some(frame) = codec.decode(&mut buf).unwrap() {
                decoded.push(frame.unwrap());
            }
        }
        prop_assert!(buf.is_empty());
        prop_assert_eq!(decoded, messages);
    }

    #[test]
    fn test_foreign_magic_never_decodes(msg in message()) {
        let frame = ProtocolParser::serialize_message(NetworkMagic::MAINNET, &msg).unwrap();
        let result = ProtocolParser::parse_message(NetworkMagic::REGTEST, &frame);
        prop_assert!(matches!(result, Err(DecodeError::BadMagic { .. })), "got {:?}", result);
    }
}
