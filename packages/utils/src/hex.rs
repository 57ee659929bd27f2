//! Hex rendering for byte blobs in error messages.

use alloy_primitives::hex;

/// `0x`-prefixed lowercase hex of `data`; empty input renders as `0x0`.
pub fn to_hex<T: AsRef<[u8]>>(data: T) -> String {
    let data = data.as_ref();

    let encoded = if data.is_empty() {
        "0".to_string()
    } else {
        hex::encode(data)
    };

    format!("0x{encoded}")
}

#[cfg(test)]
mod test {
    use super::to_hex;

    #[test]
    fn empty_is_zero() {
        assert_eq!(to_hex([]), "0x0");
    }

    #[test]
    fn bytes_encode() {
        assert_eq!(to_hex([0xde, 0xad, 0xbe, 0xef]), "0xdeadbeef");
    }
}
