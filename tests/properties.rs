//! Property suites for the quantified invariants

use portal_platform::cache::registry::KeyRegistry;
use portal_platform::context::{RequestContext, RequestId, Session, TenantId};
use portal_platform::crypto::{self, KeyRing, MIN_CIPHERTEXT_LEN};
use portal_platform::metrics;
use portal_platform::ws;
use proptest::prelude::*;
use uuid::Uuid;

fn arb_tenant() -> impl Strategy<Value = TenantId> {
    any::<u128>().prop_map(|raw| TenantId::new(Uuid::from_u128(raw)))
}

fn arb_json_leaf() -> impl Strategy<Value = serde_json::Value> {
    prop_oneof![
        Just(serde_json::Value::Null),
        any::<bool>().prop_map(serde_json::Value::from),
        any::<i64>().prop_map(serde_json::Value::from),
        "[a-zA-Z0-9 ]{0,24}".prop_map(serde_json::Value::from),
    ]
}

proptest! {
    // Context attributes carry correlation, never identity.
    #[test]
    fn context_attrs_exclude_pii(
        tenant in arb_tenant(),
        mfa in any::<bool>(),
        with_session in any::<bool>(),
        session_id in "[a-z0-9]{8,16}",
        user_id in "[a-z0-9]{8,16}",
    ) {
        let mut ctx = RequestContext::system(RequestId::generate(), tenant);
        if with_session {
            ctx.session = Some(Session {
                id: session_id,
                user_id,
                app_id: tenant,
                mfa_enabled: mfa,
                verified_at: None,
            });
        }
        let attrs = ctx.to_attrs();
        prop_assert!(attrs.contains_key("request.id"));
        prop_assert_eq!(attrs.get("tenant.id").cloned(), Some(tenant.to_string()));
        prop_assert!(!attrs.contains_key("session.id"));
        prop_assert!(!attrs.contains_key("user.id"));
        if with_session {
            let mfa_attr = attrs.get("session.mfa").cloned();
            prop_assert!(mfa_attr == Some("true".into()) || mfa_attr == Some("false".into()));
            prop_assert_eq!(mfa_attr, Some(if mfa { "true" } else { "false" }.to_string()));
        } else {
            prop_assert!(!attrs.contains_key("session.mfa"));
        }
    }

    // Label sanitization: idempotent, bounded, control-free.
    #[test]
    fn label_sanitization_laws(value in ".*") {
        let once = metrics::sanitize_value(&value);
        prop_assert_eq!(metrics::sanitize_value(&once), once.clone());
        prop_assert!(once.len() <= 123);
        prop_assert!(once.bytes().all(|b| b > 0x1F && b != 0x7F));
    }

    // Crypto laws: roundtrip, length, nondeterminism, tamper detection.
    #[test]
    fn crypto_laws(plaintext in ".{0,128}", aad in proptest::option::of("[a-z]{0,16}")) {
        let ring = KeyRing::from_keys(vec![(1, [7u8; 32])]).unwrap();
        let aad_bytes = aad.as_ref().map(|a| a.as_bytes());

        let ciphertext = ring.encrypt(plaintext.as_bytes(), aad_bytes).unwrap();
        prop_assert_eq!(
            ring.decrypt(&ciphertext, aad_bytes).unwrap(),
            plaintext.as_bytes()
        );
        prop_assert_eq!(ciphertext.len(), MIN_CIPHERTEXT_LEN + plaintext.len());

        let again = ring.encrypt(plaintext.as_bytes(), aad_bytes).unwrap();
        prop_assert_ne!(&again, &ciphertext);
    }

    #[test]
    fn crypto_bit_flip_fails(
        plaintext in ".{1,64}",
        flip_bit in 0usize..8,
        offset_seed in any::<usize>(),
    ) {
        let ring = KeyRing::from_keys(vec![(1, [9u8; 32])]).unwrap();
        let mut ciphertext = ring.encrypt(plaintext.as_bytes(), None).unwrap();
        // Flip a bit anywhere past the version byte and IV.
        let span = ciphertext.len() - 13;
        let offset = 13 + offset_seed % span;
        ciphertext[offset] ^= 1 << flip_bit;
        prop_assert!(ring.decrypt(&ciphertext, None).is_err());
    }

    #[test]
    fn reencrypt_rotates_and_preserves(plaintext in ".{0,64}") {
        let old_ring = KeyRing::from_keys(vec![(1, [1u8; 32])]).unwrap();
        let ring = KeyRing::from_keys(vec![(1, [1u8; 32]), (2, [2u8; 32])]).unwrap();

        let v1 = old_ring.encrypt(plaintext.as_bytes(), None).unwrap();
        let v2 = ring.reencrypt(&v1).unwrap();
        prop_assert_eq!(v2[0], 2);
        prop_assert_eq!(ring.decrypt(&v2, None).unwrap(), plaintext.as_bytes());
    }

    // Codec symmetry for each message family.
    #[test]
    fn inbound_codec_roundtrip(room in "[a-z0-9]{1,16}", data in arb_json_leaf()) {
        let samples = vec![
            ws::Inbound::Join { room_id: room.clone() },
            ws::Inbound::Leave { room_id: room.clone() },
            ws::Inbound::Send { room_id: room.clone(), data: data.clone() },
            ws::Inbound::Direct { target: room.clone(), data: data.clone() },
            ws::Inbound::Pong,
            ws::Inbound::MetaGet,
            ws::Inbound::MetaSet { data },
        ];
        for message in samples {
            let encoded = ws::encode_inbound(&message).unwrap();
            prop_assert_eq!(ws::decode_inbound(&encoded).unwrap(), message);
        }
    }

    #[test]
    fn envelope_codec_roundtrip(
        tenant in arb_tenant(),
        node in "[a-z0-9-]{1,12}",
        room in "[a-z0-9]{1,12}",
        data in arb_json_leaf(),
    ) {
        let samples = vec![
            ws::Envelope::Room {
                tenant_id: tenant,
                node_id: node.clone(),
                room_id: room.clone(),
                data: data.clone(),
            },
            ws::Envelope::Direct {
                tenant_id: tenant,
                node_id: node.clone(),
                target_socket_id: room.clone(),
                data: data.clone(),
                from_socket_id: node.clone(),
            },
            ws::Envelope::Broadcast {
                tenant_id: tenant,
                node_id: node,
                data,
            },
        ];
        for envelope in samples {
            let encoded = ws::encode_envelope(&envelope).unwrap();
            prop_assert_eq!(ws::decode_envelope(&encoded).unwrap(), envelope);
        }
    }

    // Glob invalidation treats every metacharacter except `*` literally.
    #[test]
    fn glob_escape_property(prefix in "[a-z.$^()\\[\\]+?{}|]{1,8}", suffix in "[a-z0-9]{1,8}") {
        let registry = KeyRegistry::new();
        let matching = format!("{prefix}:{suffix}");
        registry.track("store", &matching);
        registry.track("store", &format!("unrelated:{suffix}"));

        let removed = registry.invalidate_local("store", &format!("{prefix}:*"));
        prop_assert_eq!(removed, 1);
    }

    // Route normalization is idempotent.
    #[test]
    fn route_normalization_idempotent(path in "(/[a-zA-Z0-9._-]{0,20}){0,6}") {
        let once = metrics::normalize_path(&path);
        prop_assert_eq!(metrics::normalize_path(&once), once);
    }
}

#[test]
fn sha256_and_hmac_vectors() {
    assert_eq!(
        crypto::hash(""),
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
    assert_eq!(
        crypto::hash("abc"),
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
    assert_eq!(
        crypto::hmac("Jefe", "what do ya want for nothing?"),
        "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
    );
}

#[test]
fn unknown_version_and_short_input() {
    let ring = KeyRing::from_keys(vec![(1, [7u8; 32])]).unwrap();
    let mut ciphertext = ring.encrypt(b"x", None).unwrap();
    ciphertext[0] = 42;
    assert!(matches!(
        ring.decrypt(&ciphertext, None).unwrap_err(),
        crypto::CryptoError::KeyNotFound { version: 42 }
    ));
    assert!(matches!(
        ring.decrypt(&[0u8; 28], None).unwrap_err(),
        crypto::CryptoError::InvalidFormat
    ));
}
