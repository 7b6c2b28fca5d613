//! Property-based and adversarial tests for the pinnet codecs
//!
//! These verify that every wire form round-trips and that malformed bytes
//! are rejected instead of producing half-parsed values.

use proptest::prelude::*;

use pinnet::chain::{LiteHeader, HEADER_WIRE_SIZE};
use pinnet::crypto::{compact_to_target, target_to_compact, work_from_value};
use pinnet::message::{
    ChainTag, GetHeadersMessage, InvItem, Message, Multihash, ObjectPayload, PowCertificate,
    PowKind, MAGIC_MAINNET,
};
use pinnet::pinboard::PinStore;
use pinnet::wire::{varint_size, Reader, Writer};
use pinnet::Hash;
use primitive_types::U256;

fn arb_hash() -> impl Strategy<Value = Hash> {
    any::<[u8; 32]>().prop_map(Hash::from_bytes)
}

fn arb_pow_kind() -> impl Strategy<Value = PowKind> {
    prop_oneof![
        Just(PowKind::Plain),
        Just(PowKind::Scrypt14_1_8),
        Just(PowKind::Scrypt10_1_1),
    ]
}

fn arb_chain_tag() -> impl Strategy<Value = ChainTag> {
    prop_oneof![
        Just(ChainTag::Unknown),
        Just(ChainTag::BitcoinMain),
        Just(ChainTag::BitcoinTest3),
        Just(ChainTag::LitecoinMain),
        Just(ChainTag::LitecoinTest4),
    ]
}

fn arb_certificate() -> impl Strategy<Value = PowCertificate> {
    (arb_pow_kind(), arb_chain_tag(), arb_hash(), any::<u64>())
        .prop_map(|(kind, tag, anchor, nonce)| PowCertificate::new(kind, tag, anchor, nonce))
}

proptest! {
    /// Varint encodings are minimal and reversible.
    #[test]
    fn prop_varint_roundtrip(value in any::<u64>()) {
        let mut writer = Writer::new();
        writer.write_varint(value);
        let bytes = writer.into_bytes();
        prop_assert_eq!(bytes.len(), varint_size(value));

        let mut reader = Reader::new(&bytes);
        prop_assert_eq!(reader.read_varint().unwrap(), value);
        prop_assert!(reader.is_exhausted());
    }

    /// Hash hex display order is self-inverse.
    #[test]
    fn prop_hash_hex_roundtrip(bytes in any::<[u8; 32]>()) {
        let hash = Hash::from_bytes(bytes);
        prop_assert_eq!(Hash::from_hex(&hash.to_hex()).unwrap(), hash);
    }

    /// 80-byte headers round-trip through the wire form.
    #[test]
    fn prop_header_roundtrip(
        version in any::<u32>(),
        prev in arb_hash(),
        merkle in arb_hash(),
        timestamp in any::<u32>(),
        bits in any::<u32>(),
        nonce in any::<u32>(),
    ) {
        let header = LiteHeader::new(version, prev, merkle, timestamp, bits, nonce);
        let bytes = header.to_bytes();
        prop_assert_eq!(bytes.len(), HEADER_WIRE_SIZE);
        prop_assert_eq!(LiteHeader::from_bytes(&bytes).unwrap(), header);
    }

    /// Certificates round-trip and their size accounting is exact.
    #[test]
    fn prop_certificate_roundtrip(cert in arb_certificate()) {
        let bytes = cert.to_bytes();
        prop_assert_eq!(bytes.len(), cert.serialized_size());
        let mut reader = Reader::new(&bytes);
        prop_assert_eq!(PowCertificate::read(&mut reader).unwrap(), cert);
        prop_assert!(reader.is_exhausted());
    }

    /// Multihashes round-trip for every digest length.
    #[test]
    fn prop_multihash_roundtrip(fn_code in 0u32..0xd6, digest in proptest::collection::vec(any::<u8>(), 0..64)) {
        let mh = Multihash::new(fn_code, digest);
        let bytes = mh.to_bytes();
        prop_assert_eq!(bytes.len(), mh.serialized_size());
        let mut reader = Reader::new(&bytes);
        prop_assert_eq!(Multihash::read(&mut reader).unwrap(), mh);
    }

    /// Valid payloads round-trip whether the body travels inline or by id.
    #[test]
    fn prop_object_payload_roundtrip(
        body in proptest::collection::vec(any::<u8>(), 0..512),
        cert in arb_certificate(),
        digest in any::<[u8; 32]>(),
    ) {
        // Empty bodies travel as a multihash instead.
        let mut payload = if body.is_empty() {
            ObjectPayload::from_body_id(Multihash::sha2_256(digest))
        } else {
            ObjectPayload::from_body(body)
        };
        payload.set_pow(cert);

        let bytes = payload.to_bytes();
        prop_assert_eq!(bytes.len(), payload.serialized_size());
        prop_assert_eq!(ObjectPayload::from_bytes(&bytes).unwrap(), payload);
    }

    /// The full envelope round-trips for header batches.
    #[test]
    fn prop_headers_message_roundtrip(
        count in 0usize..5,
        seed in any::<u32>(),
    ) {
        let headers: Vec<LiteHeader> = (0..count)
            .map(|i| {
                LiteHeader::new(
                    seed ^ i as u32,
                    Hash::from_bytes([i as u8; 32]),
                    Hash::from_bytes([seed as u8; 32]),
                    seed.wrapping_add(i as u32),
                    0x1d00ffff,
                    i as u32,
                )
            })
            .collect();
        let message = Message::Headers(headers);
        let wire = message.to_wire(MAGIC_MAINNET);

        let mut envelope = [0u8; 24];
        envelope.copy_from_slice(&wire[..24]);
        let parsed = pinnet::message::Envelope::parse(&envelope, MAGIC_MAINNET).unwrap();
        parsed.verify_payload(&wire[24..]).unwrap();
        let decoded = Message::decode_payload(parsed.command_str(), &wire[24..])
            .unwrap()
            .unwrap();
        prop_assert_eq!(decoded, message);
    }

    /// Compact targets round-trip through their canonical encodings
    /// (leading mantissa byte populated, sign bit clear).
    #[test]
    fn prop_compact_roundtrip(exponent in 4u32..=30, mantissa in 0x010000u32..0x800000) {
        let compact = (exponent << 24) | mantissa;
        if let Some(target) = compact_to_target(compact) {
            prop_assert_eq!(target_to_compact(target), compact);
        }
    }

    /// More work always corresponds to a smaller PoW value.
    #[test]
    fn prop_work_antitone(a in any::<u128>(), b in any::<u128>()) {
        let (small, large) = if a <= b { (a, b) } else { (b, a) };
        let work_small = work_from_value(U256::from(small));
        let work_large = work_from_value(U256::from(large));
        prop_assert!(work_small >= work_large);
    }

    /// Bucket ids are 256-aligned strict upper bounds on expiry.
    #[test]
    fn prop_bucket_bounds(expiry in 0u32..u32::MAX - 512) {
        let bucket = PinStore::calc_bucket_id(expiry);
        prop_assert!(bucket > expiry);
        prop_assert_eq!(bucket % 256, 0);
        prop_assert!(bucket - expiry <= 256);
    }
}

// ============================================================================
// ADVERSARIAL TESTS
// ============================================================================

/// Truncating a payload anywhere must fail the parse, never yield a value.
#[test]
fn test_truncated_object_rejected_everywhere() {
    let mut payload = ObjectPayload::from_body(b"truncate me".to_vec());
    payload.set_pow(PowCertificate::new(
        PowKind::Scrypt14_1_8,
        ChainTag::LitecoinMain,
        Hash::from_bytes([7; 32]),
        99,
    ));
    let bytes = payload.to_bytes();

    for cut in 0..bytes.len() {
        assert!(
            ObjectPayload::from_bytes(&bytes[..cut]).is_err(),
            "cut at {} parsed",
            cut
        );
    }
}

/// A flipped payload byte must fail the envelope checksum.
#[test]
fn test_checksum_detects_corruption() {
    let message = Message::GetHeaders(GetHeadersMessage::new(
        vec![Hash::from_bytes([1; 32])],
        Hash::zero(),
    ));
    let wire = message.to_wire(MAGIC_MAINNET);

    for position in 24..wire.len() {
        let mut corrupted = wire.clone();
        corrupted[position] ^= 0x01;

        let mut envelope = [0u8; 24];
        envelope.copy_from_slice(&corrupted[..24]);
        let parsed = pinnet::message::Envelope::parse(&envelope, MAGIC_MAINNET).unwrap();
        assert!(parsed.verify_payload(&corrupted[24..]).is_err());
    }
}

/// Inventory lists keep block entries usable even among unknown kinds.
#[test]
fn test_inv_roundtrip() {
    let items = vec![
        InvItem::block(Hash::from_bytes([3; 32])),
        InvItem::block(Hash::from_bytes([4; 32])),
    ];
    let message = Message::Inv(items.clone());
    let wire = message.to_wire(MAGIC_MAINNET);
    let decoded = Message::decode_payload("inv", &wire[24..]).unwrap().unwrap();
    assert_eq!(decoded, Message::Inv(items));
}
