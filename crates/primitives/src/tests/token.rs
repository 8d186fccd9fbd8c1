use rand::thread_rng;

use super::*;

#[test]
fn test_token_from_slice() {
    let token = Token::random(&mut thread_rng());

    assert_eq!(Token::try_from(&token[..]).unwrap(), token);
    assert_eq!(Token::try_from(&token[..31]), Err(TokenError(31)));
}

#[test]
fn test_random_tokens_differ() {
    let mut rng = thread_rng();

    assert_ne!(Token::random(&mut rng), Token::random(&mut rng));
}

#[test]
fn test_token_debug_is_redacted() {
    let token = Token::from_array([9; TOKEN_LEN]);

    assert_eq!(format!("{token:?}"), "Token(..)");
}

#[test]
fn test_nonce_validity_window() {
    let mut rng = thread_rng();

    assert!(
        Nonce::generate(&mut rng, DEFAULT_TOKEN_TTL).is_valid(),
        "fresh nonce must be valid"
    );
    assert!(
        !Nonce::generate(&mut rng, Duration::ZERO).is_valid(),
        "zero ttl nonce is never valid"
    );
}
