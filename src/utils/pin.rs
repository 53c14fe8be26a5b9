use bcrypt::{hash, verify, BcryptError, DEFAULT_COST};

use crate::error::AppError;

pub const MIN_PIN_LEN: usize = 4;
pub const MAX_PIN_LEN: usize = 8;

pub fn validate_pin(pin: &str) -> Result<(), AppError> {
    if pin.len() < MIN_PIN_LEN || pin.len() > MAX_PIN_LEN {
        return Err(AppError::bad_request(format!(
            "PIN must be {} to {} digits",
            MIN_PIN_LEN, MAX_PIN_LEN
        )));
    }
    if !pin.chars().all(|c| c.is_ascii_digit()) {
        return Err(AppError::bad_request("PIN may only contain digits"));
    }
    Ok(())
}

pub fn hash_pin(pin: &str) -> Result<String, BcryptError> {
    hash(pin, DEFAULT_COST)
}

pub fn verify_pin(pin: &str, pin_hash: &str) -> Result<bool, BcryptError> {
    verify(pin, pin_hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pins_must_be_short_digit_strings() {
        assert!(validate_pin("1234").is_ok());
        assert!(validate_pin("12345678").is_ok());
        assert!(validate_pin("123").is_err());
        assert!(validate_pin("123456789").is_err());
        assert!(validate_pin("12a4").is_err());
        assert!(validate_pin("").is_err());
    }

    #[test]
    fn hashed_pin_verifies() {
        // Low cost keeps the test fast.
        let hashed = bcrypt::hash("4821", 4).unwrap();
        assert!(verify_pin("4821", &hashed).unwrap());
        assert!(!verify_pin("4822", &hashed).unwrap());
    }
}
