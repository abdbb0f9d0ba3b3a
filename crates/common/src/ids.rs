//! Random identifier helpers.

use rand::Rng;

const ID_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

fn random_string(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect()
}

/// Opaque 12-character entity id (users, sessions, SSH keys).
pub fn make_random_id() -> String {
    random_string(12)
}

/// 16-character sign-in request token.
pub fn make_signin_request_token() -> String {
    random_string(16)
}

/// Six decimal digit PIN for the cross-device sign-in flow.
pub fn make_signin_request_pin() -> String {
    let n: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{:06}", n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_shape() {
        let id = make_random_id();
        assert_eq!(id.len(), 12);
        assert!(id.bytes().all(|b| b.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_pin_shape() {
        let pin = make_signin_request_pin();
        assert_eq!(pin.len(), 6);
        assert!(pin.bytes().all(|b| b.is_ascii_digit()));
    }
}
