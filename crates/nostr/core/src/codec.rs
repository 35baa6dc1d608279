//! Trust boundary between untrusted JSON and [`Event`].
//!
//! [`validate_event`] checks shape only. [`verify_event`] additionally
//! recomputes the id and checks the Schnorr signature. Neither panics on bad
//! input; failures come back as values whose `Display` is a human-readable
//! reason.

use std::sync::LazyLock;

use bitcoin::secp256k1::{Message, XOnlyPublicKey, schnorr};
use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::nip01::{Event, SECP, UnsignedEvent, get_event_hash};
use crate::tag_parsing::{tag_field, tag_name};

static HEX_32_BYTES: LazyLock<Regex> = LazyLock::new(|| hex_pattern(64));
static HEX_64_BYTES: LazyLock<Regex> = LazyLock::new(|| hex_pattern(128));

#[expect(clippy::unwrap_used, reason = "pattern is a compile-time constant")]
fn hex_pattern(len: usize) -> Regex {
    Regex::new(&format!("^[0-9a-f]{{{len}}}$")).unwrap()
}

/// Why a raw value is not a structurally valid event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvalidReason {
    #[error("event is NOT object")]
    MalformedContainer,
    #[error("id property is invalid")]
    BadId,
    #[error("pubkey property is invalid")]
    BadPubkey,
    #[error("created_at property is invalid")]
    BadTimestamp,
    #[error("kind property is invalid")]
    BadKind,
    #[error("tags property is invalid")]
    BadTags,
    #[error("content property is invalid")]
    BadContent,
    #[error("sig property is invalid")]
    BadSigFormat,
}

/// Why a raw value cannot be trusted as an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VerifyFailure {
    #[error("failed to verify event: {0}")]
    Invalid(InvalidReason),
    #[error("failed to verify event: id property is invalid")]
    IdMismatch,
    #[error("failed to verify event: sig property is invalid")]
    BadSignature,
}

/// Structural validation. Never checks the signature.
pub fn validate_event(raw: &Value) -> Result<Event, InvalidReason> {
    let object = raw.as_object().ok_or(InvalidReason::MalformedContainer)?;

    let id = hex_field(object, "id", &HEX_32_BYTES).ok_or(InvalidReason::BadId)?;
    let pubkey = hex_field(object, "pubkey", &HEX_32_BYTES).ok_or(InvalidReason::BadPubkey)?;
    let created_at = object
        .get("created_at")
        .and_then(whole_number)
        .ok_or(InvalidReason::BadTimestamp)?;
    let kind = object
        .get("kind")
        .and_then(whole_number)
        .and_then(|kind| u16::try_from(kind).ok())
        .ok_or(InvalidReason::BadKind)?;
    let tags = object
        .get("tags")
        .and_then(parse_tags)
        .ok_or(InvalidReason::BadTags)?;
    let content = object
        .get("content")
        .and_then(Value::as_str)
        .ok_or(InvalidReason::BadContent)?
        .to_string();
    let sig = hex_field(object, "sig", &HEX_64_BYTES).ok_or(InvalidReason::BadSigFormat)?;

    Ok(Event {
        id,
        pubkey,
        created_at,
        kind,
        tags,
        content,
        sig,
    })
}

/// Derive the canonical id of an event without id and signature.
pub fn derive_id(event: &UnsignedEvent) -> Option<String> {
    get_event_hash(event).ok()
}

/// Validate, recompute the id, and verify the signature over the id bytes.
pub fn verify_event(raw: &Value) -> Result<Event, VerifyFailure> {
    let event = validate_event(raw).map_err(VerifyFailure::Invalid)?;

    if derive_id(&event.unsigned()).as_deref() != Some(event.id.as_str()) {
        return Err(VerifyFailure::IdMismatch);
    }

    // Shapes were validated above; only curve-level problems remain.
    let mut digest = [0u8; 32];
    hex::decode_to_slice(&event.id, &mut digest).map_err(|_| VerifyFailure::IdMismatch)?;
    let signature = hex::decode(&event.sig)
        .ok()
        .and_then(|bytes| schnorr::Signature::from_slice(&bytes).ok())
        .ok_or(VerifyFailure::BadSignature)?;
    let pubkey = hex::decode(&event.pubkey)
        .ok()
        .and_then(|bytes| XOnlyPublicKey::from_slice(&bytes).ok())
        .ok_or(VerifyFailure::BadSignature)?;

    SECP.verify_schnorr(&signature, &Message::from_digest(digest), &pubkey)
        .map_err(|_| VerifyFailure::BadSignature)?;

    Ok(event)
}

/// A non-negative integer, also when written as a float like `1700000000.0`.
fn whole_number(value: &Value) -> Option<u64> {
    if let Some(number) = value.as_u64() {
        return Some(number);
    }
    let number = value.as_f64()?;
    (number >= 0.0 && number.fract() == 0.0 && number < u64::MAX as f64).then(|| number as u64)
}

fn hex_field(object: &Map<String, Value>, key: &str, pattern: &Regex) -> Option<String> {
    object
        .get(key)
        .and_then(Value::as_str)
        .filter(|value| pattern.is_match(value))
        .map(str::to_owned)
}

fn parse_tags(raw: &Value) -> Option<Vec<Vec<String>>> {
    raw.as_array()?
        .iter()
        .map(|raw_tag| {
            let tag = raw_tag
                .as_array()?
                .iter()
                .map(|element| element.as_str().map(str::to_owned))
                .collect::<Option<Vec<String>>>()?;
            if tag.len() < 2 {
                return None;
            }
            if matches!(tag_name(&tag), Some("e" | "p"))
                && !tag_field(&tag, 1).is_some_and(|value| HEX_32_BYTES.is_match(value))
            {
                return None;
            }
            Some(tag)
        })
        .collect()
}

#[cfg(all(test, feature = "full"))]
mod tests {
    use super::*;
    use crate::nip01::{EventTemplate, finalize_event};
    use quickcheck::{QuickCheck, TestResult};
    use serde_json::json;

    const SECRET: [u8; 32] = [0x11; 32];

    fn signed(content: &str, tags: Vec<Vec<String>>) -> Event {
        match finalize_event(
            &EventTemplate {
                created_at: 1_690_000_000,
                kind: 1,
                tags,
                content: content.to_string(),
            },
            &SECRET,
        ) {
            Ok(event) => event,
            Err(error) => panic!("signing fixture failed: {error}"),
        }
    }

    fn raw(event: &Event) -> Value {
        json!(event)
    }

    #[test]
    fn validate_accepts_well_formed_event() {
        let event = signed("hi", vec![vec!["p".to_string(), "b".repeat(64)]]);
        assert_eq!(validate_event(&raw(&event)), Ok(event));
    }

    #[test]
    fn validate_reports_first_failing_property() {
        let event = signed("hi", vec![]);
        let base = raw(&event);

        struct Case {
            name: &'static str,
            key: &'static str,
            value: Value,
            expected: InvalidReason,
        }

        let cases = vec![
            Case {
                name: "uppercase id",
                key: "id",
                value: json!(event.id.to_uppercase()),
                expected: InvalidReason::BadId,
            },
            Case {
                name: "short pubkey",
                key: "pubkey",
                value: json!("abcd"),
                expected: InvalidReason::BadPubkey,
            },
            Case {
                name: "fractional created_at",
                key: "created_at",
                value: json!(1.5),
                expected: InvalidReason::BadTimestamp,
            },
            Case {
                name: "negative created_at",
                key: "created_at",
                value: json!(-1),
                expected: InvalidReason::BadTimestamp,
            },
            Case {
                name: "kind as string",
                key: "kind",
                value: json!("1"),
                expected: InvalidReason::BadKind,
            },
            Case {
                name: "kind out of range",
                key: "kind",
                value: json!(70_000),
                expected: InvalidReason::BadKind,
            },
            Case {
                name: "tag with one element",
                key: "tags",
                value: json!([["t"]]),
                expected: InvalidReason::BadTags,
            },
            Case {
                name: "tag with number",
                key: "tags",
                value: json!([["t", 1]]),
                expected: InvalidReason::BadTags,
            },
            Case {
                name: "e tag without hex id",
                key: "tags",
                value: json!([["e", "not-hex"]]),
                expected: InvalidReason::BadTags,
            },
            Case {
                name: "content as object",
                key: "content",
                value: json!({}),
                expected: InvalidReason::BadContent,
            },
            Case {
                name: "sig too short",
                key: "sig",
                value: json!("ab".repeat(32)),
                expected: InvalidReason::BadSigFormat,
            },
        ];

        for case in cases {
            let mut candidate = base.clone();
            candidate[case.key] = case.value;
            assert_eq!(
                validate_event(&candidate),
                Err(case.expected),
                "{}",
                case.name
            );
        }

        assert_eq!(
            validate_event(&json!([1, 2, 3])),
            Err(InvalidReason::MalformedContainer)
        );
        assert_eq!(
            validate_event(&Value::Null),
            Err(InvalidReason::MalformedContainer)
        );
    }

    #[test]
    fn integral_floats_are_accepted_as_integers() {
        let event = signed("float", vec![]);
        let mut candidate = raw(&event);
        candidate["created_at"] = json!(1_690_000_000.0);
        candidate["kind"] = json!(1.0);

        assert_eq!(verify_event(&candidate), Ok(event));
        assert_eq!(whole_number(&json!(-0.5)), None);
        assert_eq!(whole_number(&json!(f64::MAX)), None);
    }

    #[test]
    fn verify_round_trips_signed_event() {
        let event = signed("round trip", vec![vec!["t".to_string(), "x".to_string()]]);
        let verified = verify_event(&raw(&event));
        assert_eq!(verified.as_ref().map(|e| e.id.clone()), Ok(event.id.clone()));
        assert_eq!(
            verified.ok().and_then(|e| derive_id(&e.unsigned())),
            Some(event.id)
        );
    }

    #[test]
    fn verify_detects_tampered_content() {
        let mut event = signed("original", vec![]);
        event.content = "tampered".to_string();
        let failure = verify_event(&raw(&event));
        assert_eq!(failure, Err(VerifyFailure::IdMismatch));
        assert_eq!(
            failure.err().map(|f| f.to_string()).as_deref(),
            Some("failed to verify event: id property is invalid")
        );
    }

    #[test]
    fn verify_wraps_structural_reason() {
        let mut candidate = raw(&signed("x", vec![]));
        candidate["kind"] = json!(-3);
        let rendered = verify_event(&candidate).err().map(|f| f.to_string());
        assert_eq!(
            rendered.as_deref(),
            Some("failed to verify event: kind property is invalid")
        );
    }

    fn flipped_signature_is_rejected(byte: usize, bit: u8) -> TestResult {
        let event = signed("flip me", vec![]);
        let mut sig = match hex::decode(&event.sig) {
            Ok(sig) => sig,
            Err(_) => return TestResult::error("fixture signature is not hex"),
        };
        let index = byte % sig.len();
        sig[index] ^= 1 << (bit % 8);

        let mut tampered = event;
        tampered.sig = hex::encode(sig);
        TestResult::from_bool(verify_event(&json!(tampered)) == Err(VerifyFailure::BadSignature))
    }

    #[test]
    fn every_signature_byte_is_covered() {
        for byte in 0..64 {
            assert!(
                !flipped_signature_is_rejected(byte, 0).is_failure(),
                "byte {byte}"
            );
        }
    }

    #[test]
    fn any_flipped_signature_bit_is_rejected() {
        QuickCheck::new()
            .tests(64)
            .quickcheck(flipped_signature_is_rejected as fn(usize, u8) -> TestResult);
    }
}
