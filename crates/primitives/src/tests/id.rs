use super::*;

#[test]
fn test_id_roundtrips_through_string() {
    let id = Id::new([7; VALUE_LEN], IdType::Node);
    let encoded = id.to_string();

    assert_eq!(encoded.parse::<Id>().unwrap(), id);
    assert_eq!(id.id_type(), IdType::Node);
}

#[test]
fn test_id_rejects_bad_bytes() {
    assert_eq!(Id::from_bytes(&[0; 32]), Err(IdError::InvalidLength(32)));

    let mut bytes = [0; ID_LEN];
    bytes[VALUE_LEN] = 0x7f;
    assert_eq!(Id::from_bytes(&bytes), Err(IdError::UnknownType(0x7f)));

    assert_eq!("not base64!".parse::<Id>(), Err(IdError::InvalidEncoding));
}

#[test]
fn test_bootstrap_ids() {
    assert!(Id::DUMMY_USER.is_bootstrap(), "dummy user is a bootstrap id");
    assert!(Id::TEMP_GATEWAY.is_bootstrap(), "temp gateway is a bootstrap id");
    assert!(
        !Id::new([1; VALUE_LEN], IdType::Gateway).is_bootstrap(),
        "regular ids are not bootstrap ids"
    );

    assert_eq!(&Id::TEMP_GATEWAY[..3], b"tmp");
    assert_eq!(Id::TEMP_GATEWAY.id_type(), IdType::Gateway);
    assert_eq!(Id::DUMMY_USER.id_type(), IdType::User);
}

#[test]
fn test_derive_depends_on_key_and_salt() {
    let a = Id::derive(b"public key", b"salt", IdType::User);
    let b = Id::derive(b"public key", b"other salt", IdType::User);
    let c = Id::derive(b"public key", b"salt", IdType::User);

    assert_ne!(a, b);
    assert_eq!(a, c);
    assert_eq!(a.id_type(), IdType::User);
}

#[test]
fn test_dns_prefix_is_a_valid_label() {
    let prefix = Id::new([0xab; VALUE_LEN], IdType::Node).dns_prefix();

    assert_eq!(prefix.len(), 32);
    assert!(
        prefix.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()),
        "prefix must be lowercase hex"
    );
}

#[test]
fn test_id_serde_uses_base64_string() {
    let id = Id::new([3; VALUE_LEN], IdType::Gateway);
    let json = serde_json::to_string(&id).unwrap();

    assert_eq!(json, format!("\"{id}\""));
    assert_eq!(serde_json::from_str::<Id>(&json).unwrap(), id);
}
