//! List payload layout.
//!
//! List-style responses (`ListVolumesRsp`, `ListSnapshotsRsp`,
//! `ListClusterNodeUriRsp`) return a concatenation of NUL-terminated names
//! in the data iovec; the entry count travels in the header's `retval`.

use crate::{MsgError, Result};

/// Packs names back-to-back, each terminated by a NUL byte.
pub fn pack_names<S: AsRef<str>>(names: &[S]) -> Vec<u8> {
    let total: usize = names.iter().map(|n| n.as_ref().len() + 1).sum();
    let mut buf = Vec::with_capacity(total);
    for name in names {
        buf.extend_from_slice(name.as_ref().as_bytes());
        buf.push(0);
    }
    buf
}

/// Splits a NUL-terminated name list back into strings.
///
/// The buffer must be empty or end in a NUL byte, and every entry must be
/// valid UTF-8; anything else is [`MsgError::MalformedNameList`].
pub fn unpack_names(buf: &[u8]) -> Result<Vec<String>> {
    if buf.is_empty() {
        return Ok(Vec::new());
    }
    if *buf.last().unwrap() != 0 {
        return Err(MsgError::MalformedNameList);
    }
    buf[..buf.len() - 1]
        .split(|b| *b == 0)
        .map(|chunk| {
            std::str::from_utf8(chunk)
                .map(str::to_owned)
                .map_err(|_| MsgError::MalformedNameList)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let names = ["v1", "volume-two", ""];
        let buf = pack_names(&names);
        assert_eq!(buf.len(), 3 + 11 + 1);
        assert_eq!(unpack_names(&buf).unwrap(), names);
    }

    #[test]
    fn empty_list_is_empty_buffer() {
        assert!(pack_names::<&str>(&[]).is_empty());
        assert!(unpack_names(&[]).unwrap().is_empty());
    }

    #[test]
    fn missing_terminator_is_rejected() {
        assert!(unpack_names(b"v1\0v2").is_err());
    }
}
