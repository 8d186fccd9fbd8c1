use eyre::Result as EyreResult;
use mixcomms_primitives::IdType;

use super::*;

const NODE_KEY: &[u8] = include_bytes!("../../../../testdata/node.key");
const NODE_CERT: &[u8] = include_bytes!("../../../../testdata/node.crt");
const CLIENT_CERT: &[u8] = include_bytes!("../../../../testdata/client.crt");

fn node_id() -> Id {
    Id::new([2; 32], IdType::Node)
}

fn gateway_id() -> Id {
    Id::new([1; 32], IdType::Gateway)
}

#[test]
fn test_sign_verify() -> EyreResult<()> {
    let key = PrivateKey::from_pem(NODE_KEY)?;
    let payload = b"assign token payload";

    let signature = sign(&key, payload, &node_id())?;

    verify(&key.public_key(), payload, &signature, &node_id())?;

    Ok(())
}

#[test]
fn test_signature_is_bound_to_recipient() -> EyreResult<()> {
    let key = PrivateKey::from_pem(NODE_KEY)?;
    let payload = b"assign token payload";

    let signature = sign(&key, payload, &node_id())?;

    assert!(
        matches!(
            verify(&key.public_key(), payload, &signature, &gateway_id()),
            Err(CryptoError::BadSignature)
        ),
        "signature must not verify for a different recipient"
    );

    Ok(())
}

#[test]
fn test_altered_payload_fails() -> EyreResult<()> {
    let key = PrivateKey::from_pem(NODE_KEY)?;
    let mut payload = b"assign token payload".to_vec();

    let signature = sign(&key, &payload, &node_id())?;
    payload[3] ^= 0x01;

    assert!(
        verify(&key.public_key(), &payload, &signature, &node_id()).is_err(),
        "altered payload must not verify"
    );

    Ok(())
}

#[test]
fn test_bootstrap_recipients_share_a_binding() -> EyreResult<()> {
    let key = PrivateKey::from_pem(NODE_KEY)?;
    let payload = b"first contact";

    let signature = sign(&key, payload, &Id::TEMP_GATEWAY)?;

    verify(&key.public_key(), payload, &signature, &Id::DUMMY_USER)?;
    assert_eq!(
        digest(payload, &Id::TEMP_GATEWAY),
        digest(payload, &Id::DUMMY_USER)
    );

    Ok(())
}

#[test]
fn test_certificate_public_key_matches_private_key() -> EyreResult<()> {
    let key = PrivateKey::from_pem(NODE_KEY)?;

    assert_eq!(PublicKey::from_pem(NODE_CERT)?, key.public_key());
    assert_ne!(PublicKey::from_pem(CLIENT_CERT)?, key.public_key());

    Ok(())
}

#[test]
fn test_rejects_wrong_pem_blocks() {
    assert!(
        matches!(
            PrivateKey::from_pem(NODE_CERT),
            Err(CryptoError::UnexpectedPemLabel { .. })
        ),
        "a certificate is not a private key"
    );
    assert!(
        matches!(
            PublicKey::from_pem(NODE_KEY),
            Err(CryptoError::UnexpectedPemLabel { .. })
        ),
        "a private key is not a certificate"
    );
    assert!(
        PrivateKey::from_pem(b"garbage").is_err(),
        "garbage is not PEM"
    );
}
