//! Checksum primitives used by the wire protocol.
//!
//! Two schemes exist, chosen per operation: a single XOR-parity byte over the
//! payload between opcode and trailer, and Adler-32 for the bulk sector
//! upload. Both are appended as trailing bytes of the request and validated
//! against trailing bytes of the reply where the operation defines one.

/// Adler-32 modulus.
const ADLER_MOD: u32 = 65_521;

/// XOR of all bytes in `payload`. The parity of an empty slice is 0.
pub fn xor_parity(payload: &[u8]) -> u8 {
    payload.iter().fold(0, |acc, byte| acc ^ byte)
}

/// Standard Adler-32 over `data`. The checksum of an empty slice is 1.
pub fn adler32(data: &[u8]) -> u32 {
    let mut a: u32 = 1;
    let mut b: u32 = 0;
    for &byte in data {
        a = (a + u32::from(byte)) % ADLER_MOD;
        b = (b + a) % ADLER_MOD;
    }
    (b << 16) | a
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_parity_of_empty_is_zero() {
        assert_eq!(xor_parity(&[]), 0);
    }

    #[test]
    fn xor_parity_of_single_byte_is_the_byte() {
        assert_eq!(xor_parity(&[0x03]), 0x03);
    }

    #[test]
    fn xor_parity_folds_all_bytes() {
        assert_eq!(xor_parity(&[0x0F, 0xF0, 0xAA]), 0x0F ^ 0xF0 ^ 0xAA);
    }

    #[test]
    fn adler32_of_empty_is_one() {
        assert_eq!(adler32(&[]), 1);
    }

    #[test]
    fn adler32_of_a() {
        assert_eq!(adler32(b"a"), 0x0062_0062);
    }

    #[test]
    fn adler32_reference_vector() {
        // Reference value from the RFC 1950 example string.
        assert_eq!(adler32(b"Wikipedia"), 0x11E6_0398);
    }

    #[test]
    fn adler32_wraps_at_modulus() {
        let data = vec![0xFF; 8192];
        let sum = adler32(&data);
        assert!(sum & 0xFFFF < ADLER_MOD);
        assert!(sum >> 16 < ADLER_MOD);
    }
}
