//! Entity identifiers: 26 characters from `[0-9A-Za-z]`.
//!
//! The subdomain proxy routes on `^([0-9A-Za-z]{26})-svc-...`, so every ID
//! must match that class exactly.

const ALPHABET: [char; 62] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I',
    'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', 'a', 'b',
    'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u',
    'v', 'w', 'x', 'y', 'z',
];

pub const ID_LEN: usize = 26;

pub fn new_id() -> String {
    nanoid::nanoid!(ID_LEN, &ALPHABET)
}

pub fn is_valid_id(value: &str) -> bool {
    value.len() == ID_LEN && value.chars().all(|c| c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_26_alphanumeric_chars() {
        for _ in 0..100 {
            let id = new_id();
            assert!(is_valid_id(&id), "bad id: {id}");
        }
    }

    #[test]
    fn rejects_wrong_shapes() {
        assert!(!is_valid_id(""));
        assert!(!is_valid_id("short"));
        assert!(!is_valid_id("with-hyphen-in-the-identifi"));
        assert!(!is_valid_id(&"x".repeat(27)));
    }
}
