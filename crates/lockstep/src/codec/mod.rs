//! Self-describing tagged byte format for [`WireValue`]s.
//!
//! Each value is a tag byte, an optional ASCII-decimal length and a payload:
//!
//! | tag | value | payload |
//! |-----|-------|---------|
//! | `n` | null | none |
//! | `b` | bool | `t` or `f` |
//! | `i` | 64-bit int | decimal digits |
//! | `I` | big int | decimal digits |
//! | `s` | text | char count, `:`, UTF-8 bytes |
//! | `l` / `t` | list / tuple | element count, elements |
//! | `z` / `f` | set / frozen set | element count, elements in canonical order |
//! | `d` | map | entry count, key/value pairs in canonical key order |
//! | `o` | object | type name as text, field count, `:`, name/value pairs |
//!
//! Every encoding is self-terminating, so containers are decoded by repeated
//! application rather than by skipping a byte length.

mod decode;
mod encode;
mod registry;
mod value;

use thiserror::Error;

pub use decode::{decode, decode_all, MAX_DEPTH};
pub use encode::{encode, encode_into};
pub(crate) use registry::expect_int;
pub use registry::{TypeRegistry, TypeSchema, WireEncodable};
pub use value::{BigInt, WireObject, WireValue};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("cannot encode object of unregistered type {type_name}")]
    UnregisteredType { type_name: String },
    #[error("unknown object type {type_name} at byte {position}")]
    UnknownType { type_name: String, position: usize },
    #[error("malformed input at byte {position}: {reason}")]
    Decode {
        position: usize,
        reason: &'static str,
    },
    #[error("object of type {type_name} is missing declared field {field}")]
    MissingField { type_name: String, field: String },
    #[error("type {type_name} is already registered")]
    DuplicateType { type_name: String },
    #[error("expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: String,
    },
    #[error("field {type_name}.{field} expected {expected}, found {found}")]
    FieldType {
        type_name: &'static str,
        field: &'static str,
        expected: &'static str,
        found: &'static str,
    },
    #[error("invalid big integer text {text:?}")]
    InvalidBigInt { text: String },
    #[error("value nests containers deeper than {limit} levels")]
    NestingTooDeep { limit: usize },
    #[error("type {type_name} declares field {field} more than once")]
    DuplicateField { type_name: String, field: String },
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use proptest::prelude::*;

    use super::*;

    fn plain() -> TypeRegistry {
        TypeRegistry::new()
    }

    fn unit_registry() -> TypeRegistry {
        let mut registry = TypeRegistry::new();
        registry
            .register_schema(TypeSchema::new("Unit", ["hp", "tags"]))
            .expect("register Unit");
        registry
    }

    fn unit(hp: i64, tags: &[&str]) -> WireValue {
        WireValue::Object(
            WireObject::new("Unit")
                .with_field("hp", hp)
                .with_field("tags", WireValue::set(tags.iter().map(|tag| WireValue::text(*tag)))),
        )
    }

    #[test]
    fn scalar_encodings_match_wire_format() {
        let registry = plain();
        assert_eq!(encode(&WireValue::Null, &registry).expect("null"), b"n");
        assert_eq!(encode(&WireValue::Int(42), &registry).expect("int"), b"i42");
        assert_eq!(encode(&WireValue::Int(-7), &registry).expect("neg"), b"i-7");
        assert_eq!(encode(&WireValue::text("hi"), &registry).expect("text"), b"s2:hi");
        assert_eq!(encode(&WireValue::Bool(true), &registry).expect("bool"), b"bt");
        assert_eq!(encode(&WireValue::Bool(false), &registry).expect("bool"), b"bf");
        assert_eq!(
            encode(&WireValue::list([WireValue::Int(1), WireValue::Int(2)]), &registry)
                .expect("list"),
            b"l2i1i2"
        );
        assert_eq!(decode(b"n", &registry).expect("decode null"), WireValue::Null);
    }

    #[test]
    fn big_integers_use_their_own_tag() {
        let registry = plain();
        let big: BigInt = "123456789012345678901234567890".parse().expect("bigint");
        let bytes = encode(&WireValue::BigInt(big.clone()), &registry).expect("encode");
        assert_eq!(bytes, b"I123456789012345678901234567890");
        assert_eq!(decode(&bytes, &registry).expect("decode"), WireValue::BigInt(big));
    }

    #[test]
    fn text_length_counts_characters_not_bytes() {
        let registry = plain();
        let value = WireValue::text("héé✓");
        let bytes = encode(&value, &registry).expect("encode");
        assert!(bytes.starts_with(b"s4:"));
        assert_eq!(decode(&bytes, &registry).expect("decode"), value);
    }

    #[test]
    fn sets_and_maps_encode_in_canonical_order() {
        let registry = plain();
        let forward = WireValue::set([WireValue::Int(3), WireValue::Int(1), WireValue::text("a")]);
        let backward = WireValue::set([WireValue::text("a"), WireValue::Int(1), WireValue::Int(3)]);
        let forward_bytes = encode(&forward, &registry).expect("encode");
        assert_eq!(forward_bytes, encode(&backward, &registry).expect("encode"));
        assert_eq!(forward_bytes, b"z3i1i3s1:a");

        let mut entries = BTreeMap::new();
        entries.insert(WireValue::text("b"), WireValue::Int(2));
        entries.insert(WireValue::text("a"), WireValue::Null);
        let bytes = encode(&WireValue::Map(entries), &registry).expect("encode");
        assert_eq!(bytes, b"d2s1:ans1:bi2");
    }

    #[test]
    fn nested_containers_roundtrip() {
        let registry = unit_registry();
        let mut frozen = BTreeSet::new();
        frozen.insert(WireValue::tuple([WireValue::Int(1), WireValue::Bool(false)]));
        let value = WireValue::map([
            (
                WireValue::text("units"),
                WireValue::list([unit(10, &["fast", "armored"]), unit(0, &[])]),
            ),
            (WireValue::Int(7), WireValue::FrozenSet(frozen)),
            (WireValue::Null, WireValue::List(Vec::new())),
        ]);
        let bytes = encode(&value, &registry).expect("encode");
        assert_eq!(decode(&bytes, &registry).expect("decode"), value);
    }

    #[test]
    fn object_encoding_lists_declared_fields_only() {
        let registry = unit_registry();
        let value = WireValue::Object(
            WireObject::new("Unit")
                .with_field("internal_cache", 99i64)
                .with_field("tags", WireValue::Set(BTreeSet::new()))
                .with_field("hp", 5i64),
        );
        let bytes = encode(&value, &registry).expect("encode");
        assert_eq!(bytes, b"os4:Unit2:s2:hpi5s4:tagsz0");
    }

    #[test]
    fn unregistered_object_type_fails_encode() {
        let error = encode(&unit(1, &[]), &plain()).expect_err("unregistered");
        assert_eq!(
            error,
            CodecError::UnregisteredType {
                type_name: "Unit".to_string()
            }
        );
    }

    #[test]
    fn missing_declared_field_fails_encode() {
        let value = WireValue::Object(WireObject::new("Unit").with_field("hp", 1i64));
        let error = encode(&value, &unit_registry()).expect_err("missing");
        assert!(matches!(error, CodecError::MissingField { field, .. } if field == "tags"));
    }

    #[test]
    fn unknown_type_name_fails_decode() {
        let bytes = encode(&unit(3, &["x"]), &unit_registry()).expect("encode");
        let error = decode(&bytes, &plain()).expect_err("unknown");
        assert_eq!(
            error,
            CodecError::UnknownType {
                type_name: "Unit".to_string(),
                position: 1
            }
        );
    }

    #[test]
    fn truncated_input_reports_position() {
        let registry = plain();
        let error = decode(b"l3i1i2", &registry).expect_err("truncated");
        assert_eq!(
            error,
            CodecError::Decode {
                position: 6,
                reason: "unexpected end of input"
            }
        );
        assert!(matches!(
            decode(b"s5:abc", &registry),
            Err(CodecError::Decode { position: 6, .. })
        ));
        assert!(matches!(decode(b"", &registry), Err(CodecError::Decode { position: 0, .. })));
    }

    #[test]
    fn malformed_input_is_rejected() {
        let registry = plain();
        for bad in [
            &b"x"[..],
            b"bx",
            b"i",
            b"i-",
            b"i007",
            b"i-0",
            b"i99999999999999999999",
            b"I01",
            b"s2hi",
            b"z2i2i1",
            b"z2i1i1",
            b"d2s1:bi1s1:ai2",
            b"ni1",
            b"s1:\xff",
        ] {
            assert!(
                matches!(decode(bad, &registry), Err(CodecError::Decode { .. })),
                "expected decode error for {:?}",
                String::from_utf8_lossy(bad)
            );
        }
    }

    #[test]
    fn object_fields_must_match_schema() {
        let registry = unit_registry();
        let swapped = b"os4:Unit2:s4:tagsz0s2:hpi5";
        assert!(matches!(
            decode(swapped, &registry),
            Err(CodecError::Decode { .. })
        ));
    }

    #[test]
    fn nesting_depth_is_bounded() {
        let registry = plain();
        let mut bytes = Vec::new();
        for _ in 0..(MAX_DEPTH + 1) {
            bytes.extend_from_slice(b"l1");
        }
        bytes.push(b'n');
        assert!(matches!(
            decode(&bytes, &registry),
            Err(CodecError::Decode {
                reason: "nesting too deep",
                ..
            })
        ));
    }

    #[test]
    fn encoding_refuses_what_decoding_would_refuse() {
        let registry = plain();
        let nested = |levels: usize| {
            (0..levels).fold(WireValue::Null, |inner, _| WireValue::List(vec![inner]))
        };

        let deepest = nested(MAX_DEPTH);
        let bytes = encode(&deepest, &registry).expect("encode at limit");
        assert_eq!(decode(&bytes, &registry).expect("decode at limit"), deepest);

        assert_eq!(
            encode(&nested(MAX_DEPTH + 1), &registry),
            Err(CodecError::NestingTooDeep { limit: MAX_DEPTH })
        );
    }

    #[test]
    fn decode_all_reads_concatenated_values() {
        let registry = plain();
        let values = decode_all(b"i1s2:hinl0", &registry).expect("decode all");
        assert_eq!(
            values,
            vec![
                WireValue::Int(1),
                WireValue::text("hi"),
                WireValue::Null,
                WireValue::List(Vec::new()),
            ]
        );
    }

    fn arb_value() -> impl Strategy<Value = WireValue> {
        let leaf = prop_oneof![
            Just(WireValue::Null),
            any::<bool>().prop_map(WireValue::Bool),
            any::<i64>().prop_map(WireValue::Int),
            any::<i128>().prop_map(|value| WireValue::BigInt(BigInt::from(value))),
            ".{0,8}".prop_map(WireValue::Text),
        ];
        leaf.prop_recursive(4, 48, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(WireValue::List),
                prop::collection::vec(inner.clone(), 0..6).prop_map(WireValue::Tuple),
                prop::collection::btree_set(inner.clone(), 0..6).prop_map(WireValue::Set),
                prop::collection::btree_set(inner.clone(), 0..6).prop_map(WireValue::FrozenSet),
                prop::collection::btree_map(inner.clone(), inner.clone(), 0..6)
                    .prop_map(WireValue::Map),
                (any::<i64>(), prop::collection::btree_set(inner, 0..4)).prop_map(|(hp, tags)| {
                    WireValue::Object(
                        WireObject::new("Unit")
                            .with_field("hp", hp)
                            .with_field("tags", WireValue::Set(tags)),
                    )
                }),
            ]
        })
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(value in arb_value()) {
            let registry = unit_registry();
            let bytes = encode(&value, &registry).expect("encode");
            prop_assert_eq!(decode(&bytes, &registry).expect("decode"), value);
        }

        #[test]
        fn encoding_is_deterministic(value in arb_value()) {
            let registry = unit_registry();
            let copy = value.clone();
            prop_assert_eq!(
                encode(&value, &registry).expect("first"),
                encode(&copy, &registry).expect("second")
            );
        }
    }
}
