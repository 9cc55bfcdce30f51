//! Property-based tests for the fingerprint module.
//!
//! Verifies identity invariants:
//! - Determinism: the same inputs always produce the same digests
//! - Discrimination: changing a recognized config field changes the digest
//! - Insensitivity: unrecognized config fields never affect the digest
//! - Shape: config fingerprints are 32 hex chars, identity hashes 16

use proptest::prelude::*;
use serde_json::json;
use tempfile::TempDir;

use memloom_core::fingerprint::{compute_file_checksum, config_fingerprint, identify_model};

// ────────────────────────────────────────────────────────────────────
// Strategies
// ────────────────────────────────────────────────────────────────────

fn arb_config() -> impl Strategy<Value = serde_json::Value> {
    (
        "[a-z][a-z0-9_]{2,12}",
        1000u64..200_000,
        128u64..8192,
        1u64..100,
        1u64..128,
    )
        .prop_map(|(model_type, vocab, hidden, layers, heads)| {
            json!({
                "model_type": model_type,
                "vocab_size": vocab,
                "hidden_size": hidden,
                "num_hidden_layers": layers,
                "num_attention_heads": heads,
            })
        })
}

fn arb_weight_bytes() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..512)
}

// ────────────────────────────────────────────────────────────────────
// Config fingerprint properties
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn fingerprint_is_deterministic(config in arb_config()) {
        prop_assert_eq!(config_fingerprint(&config), config_fingerprint(&config));
    }

    #[test]
    fn fingerprint_is_32_lowercase_hex(config in arb_config()) {
        let fp = config_fingerprint(&config).unwrap();
        prop_assert_eq!(fp.len(), 32);
        prop_assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn recognized_field_change_discriminates(config in arb_config()) {
        let base = config_fingerprint(&config).unwrap();
        let mut changed = config.clone();
        let vocab = changed["vocab_size"].as_u64().unwrap();
        changed["vocab_size"] = json!(vocab + 1);
        prop_assert_ne!(base, config_fingerprint(&changed).unwrap());
    }

    #[test]
    fn unrecognized_fields_are_ignored(config in arb_config(), extra in "[a-z]{1,10}", value in 0u64..1000) {
        let base = config_fingerprint(&config).unwrap();
        let mut extended = config.clone();
        extended[format!("x_{extra}")] = json!(value);
        prop_assert_eq!(base, config_fingerprint(&extended).unwrap());
    }
}

// ────────────────────────────────────────────────────────────────────
// File checksum and identity hash properties
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn checksum_is_deterministic(bytes in arb_weight_bytes()) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.bin");
        std::fs::write(&path, &bytes).unwrap();
        prop_assert_eq!(
            compute_file_checksum(&path).unwrap(),
            compute_file_checksum(&path).unwrap()
        );
    }

    #[test]
    fn checksum_discriminates_content(bytes in arb_weight_bytes()) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.bin");
        std::fs::write(&path, &bytes).unwrap();
        let base = compute_file_checksum(&path).unwrap();

        let mut flipped = bytes.clone();
        flipped[0] ^= 0xff;
        std::fs::write(&path, &flipped).unwrap();
        prop_assert_ne!(base, compute_file_checksum(&path).unwrap());
    }

    #[test]
    fn identity_hash_is_16_hex_and_stable(config in arb_config(), bytes in arb_weight_bytes()) {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            serde_json::to_string(&config).unwrap(),
        )
        .unwrap();
        std::fs::write(dir.path().join("model.safetensors"), &bytes).unwrap();

        let first = identify_model(dir.path()).unwrap();
        let second = identify_model(dir.path()).unwrap();
        prop_assert_eq!(&first.identity_hash, &second.identity_hash);
        prop_assert_eq!(first.identity_hash.len(), 16);
        prop_assert!(
            first
                .identity_hash
                .chars()
                .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        );
    }
}
