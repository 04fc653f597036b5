//! Primary-key-list codec for secondary-index values.
//!
//! A secondary-index entry stores its primary keys as a contiguous byte
//! string of `[len:u32_be | bytes]*` frames. The format is self-delimiting
//! so that recovery can decode entries straight out of log records.

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};

pub fn encode_pk_list<S: AsRef<str>>(list: &[S]) -> Vec<u8> {
    let mut out = Vec::with_capacity(list.iter().map(|pk| pk.as_ref().len() + 4).sum());
    for pk in list {
        let pk = pk.as_ref();
        out.put_u32(pk.len() as u32);
        out.put_slice(pk.as_bytes());
    }
    out
}

pub fn decode_pk_list(mut bytes: &[u8]) -> Result<Vec<String>> {
    let mut out = Vec::new();
    while bytes.has_remaining() {
        if bytes.remaining() < 4 {
            return Err(Error::Serialization(
                "primary-key list: truncated length field".to_string(),
            ));
        }
        let len = bytes.get_u32() as usize;
        if bytes.remaining() < len {
            return Err(Error::Serialization(
                "primary-key list: truncated payload".to_string(),
            ));
        }
        let pk = std::str::from_utf8(&bytes[..len])
            .map_err(|e| Error::Serialization(format!("primary-key list: {}", e)))?
            .to_string();
        bytes.advance(len);
        out.push(pk);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_list_encodes_to_nothing() {
        let encoded = encode_pk_list::<&str>(&[]);
        assert!(encoded.is_empty());
        assert!(decode_pk_list(&encoded).unwrap().is_empty());
    }

    #[test]
    fn round_trip_preserves_order_and_content() {
        let list = ["user#1", "user#2", ""];
        let encoded = encode_pk_list(&list);
        assert_eq!(decode_pk_list(&encoded).unwrap(), list);
    }

    #[test]
    fn lengths_are_big_endian() {
        let encoded = encode_pk_list(&["ab"]);
        assert_eq!(&encoded[..4], &[0, 0, 0, 2]);
        assert_eq!(&encoded[4..], b"ab");
    }

    #[test]
    fn truncated_input_is_rejected() {
        let mut encoded = encode_pk_list(&["user#1"]);
        encoded.truncate(encoded.len() - 1);
        assert!(decode_pk_list(&encoded).is_err());
        assert!(decode_pk_list(&[0, 0]).is_err());
    }
}
