//! On-disk representation of a persisted batch.
//!
//! A record file is named `<millis>-<sequence>-<random>.trn`, so sorting by name approximates
//! enqueue order. Its content is a single line JSON header carrying the routing attributes,
//! followed by the opaque payload:
//!
//! ```text
//! {"version":2,"instrumentationKey":"...","endpoint":"https://.../v2/track"}\n<payload>
//! ```
//!
//! Files written by older versions (a version byte followed by a bare instrumentation key and no
//! endpoint) do not parse and are purged.

use crate::{Batch, Destination};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::{borrow::Cow, convert::TryFrom, fs, path::Path, time::SystemTime};

pub(crate) const RECORD_EXTENSION: &str = "trn";
pub(crate) const TEMP_EXTENSION: &str = ".tmp";
const HEADER_TERMINATOR: u8 = b'\n';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
enum FormatVersion {
    V2 = 2,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordHeader<'a> {
    version: FormatVersion,
    #[serde(borrow)]
    instrumentation_key: Cow<'a, str>,
    #[serde(borrow)]
    endpoint: Cow<'a, str>,
}

/// Sort key and identity of a record. Ordered by enqueue time, then by sequence number.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct RecordKey {
    pub(crate) millis: i64,
    pub(crate) sequence: u64,
    pub(crate) file_name: String,
}

impl RecordKey {
    pub(crate) fn new(millis: i64, sequence: u64, suffix: u32) -> Self {
        RecordKey {
            millis,
            sequence,
            file_name: format!(
                "{:013}-{:010}-{:08x}.{}",
                millis, sequence, suffix, RECORD_EXTENSION
            ),
        }
    }

    /// Recover the key of a record file found on disk. Files that don't follow the naming scheme
    /// are ordered by their modification time.
    pub(crate) fn from_path(path: &Path) -> Option<Self> {
        if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
            return None;
        }
        let file_name = path.file_name()?.to_str()?.to_string();
        let stem = path.file_stem()?.to_str()?;

        let mut parts = stem.splitn(3, '-');
        let parsed = match (parts.next(), parts.next(), parts.next()) {
            (Some(millis), Some(sequence), Some(_)) => millis
                .parse::<i64>()
                .ok()
                .zip(sequence.parse::<u64>().ok()),
            _ => None,
        };
        let (millis, sequence) = match parsed {
            Some(parsed) => parsed,
            None => (modified_millis(path), 0),
        };

        Some(RecordKey {
            millis,
            sequence,
            file_name,
        })
    }

    pub(crate) fn temp_prefix(&self) -> &str {
        self.file_name
            .strip_suffix(RECORD_EXTENSION)
            .unwrap_or(&self.file_name)
    }
}

fn modified_millis(path: &Path) -> i64 {
    fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .ok()
        .and_then(|modified| modified.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map_or(0, |since_epoch| since_epoch.as_millis() as i64)
}

/// Why a record could not be decoded.
#[derive(thiserror::Error, Debug)]
pub(crate) enum DecodeError {
    #[error("missing header")]
    MissingHeader,
    #[error("invalid header: {0}")]
    InvalidHeader(serde_json::Error),
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(http::uri::InvalidUri),
    #[error("empty payload")]
    EmptyPayload,
}

pub(crate) fn encode(batch: &Batch) -> Result<Vec<u8>, serde_json::Error> {
    let endpoint = batch.endpoint().to_string();
    let header = RecordHeader {
        version: FormatVersion::V2,
        instrumentation_key: Cow::Borrowed(batch.instrumentation_key()),
        endpoint: Cow::Borrowed(&endpoint),
    };
    let mut encoded = serde_json::to_vec(&header)?;
    encoded.reserve(1 + batch.payload().len());
    encoded.push(HEADER_TERMINATOR);
    encoded.extend_from_slice(batch.payload());
    Ok(encoded)
}

pub(crate) fn decode(contents: Vec<u8>) -> Result<Batch, DecodeError> {
    let mut payload = Bytes::from(contents);
    let header_len = payload
        .iter()
        .position(|b| *b == HEADER_TERMINATOR)
        .ok_or(DecodeError::MissingHeader)?;
    let header_bytes = payload.split_to(header_len + 1);

    let header: RecordHeader<'_> = serde_json::from_slice(&header_bytes[..header_len])
        .map_err(DecodeError::InvalidHeader)?;
    let endpoint =
        http::Uri::try_from(header.endpoint.as_ref()).map_err(DecodeError::InvalidEndpoint)?;
    if payload.is_empty() {
        return Err(DecodeError::EmptyPayload);
    }

    Ok(Batch::new(
        Destination::new(header.instrumentation_key.into_owned(), endpoint),
        payload,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use test_case::test_case;

    fn batch() -> Batch {
        Batch::new(
            Destination::new(
                "0fdcec70-0ce5-4085-89d9-9ae8ead9af66",
                http::Uri::from_static("https://dc.services.visualstudio.com/v2/track"),
            ),
            &b"\x1f\x8b payload\nwith newline"[..],
        )
    }

    #[test]
    fn decode_restores_batch() {
        let encoded = encode(&batch()).unwrap();
        assert!(encoded.starts_with(
            b"{\"version\":2,\"instrumentationKey\":\"0fdcec70-0ce5-4085-89d9-9ae8ead9af66\",\"endpoint\":\"https://dc.services.visualstudio.com/v2/track\"}\n"
        ));
        assert_eq!(batch(), decode(encoded).unwrap());
    }

    #[test_case(b"" ; "empty file")]
    #[test_case(b"\x010fdcec70-0ce5-4085-89d9-9ae8ead9af66payload" ; "legacy format")]
    #[test_case(b"{\"version\":1,\"instrumentationKey\":\"k\",\"endpoint\":\"https://x\"}\npayload" ; "unknown version")]
    #[test_case(b"{\"version\":2,\"instrumentationKey\":\"k\"}\npayload" ; "missing endpoint")]
    #[test_case(b"{\"version\":2,\"instrumentationKey\":\"k\",\"endpoint\":\"https://x\"}\n" ; "empty payload")]
    #[test_case(b"{\"version\":2,\"instrumentationKey\":\"k\",\"endpoint\":\"not a uri\"}\npayload" ; "invalid endpoint")]
    fn decode_rejects(contents: &'static [u8]) {
        decode(contents.to_vec()).unwrap_err();
    }

    #[test]
    fn key_file_name_sorts_like_key() {
        let older = RecordKey::new(1_600_000_000_000, 9, 0xffff_ffff);
        let newer = RecordKey::new(1_600_000_000_001, 0, 0);
        assert!(older < newer);
        assert!(older.file_name < newer.file_name);
        assert_eq!("1600000000000-0000000009-ffffffff.trn", older.file_name);
        assert_eq!("1600000000000-0000000009-ffffffff.", older.temp_prefix());
    }

    #[test]
    fn key_from_path() {
        let key = RecordKey::new(1_600_000_000_000, 42, 0xabc);
        let path = PathBuf::from("/spool").join(&key.file_name);
        assert_eq!(Some(key), RecordKey::from_path(&path));
    }

    #[test]
    fn key_from_foreign_path() {
        let key = RecordKey::from_path(Path::new("/spool/Transmission123.trn")).unwrap();
        assert_eq!(0, key.sequence);
        assert_eq!("Transmission123.trn", key.file_name);
    }

    #[test]
    fn key_from_other_extension() {
        assert_eq!(None, RecordKey::from_path(Path::new("/spool/1-2-3.tmp")));
        assert_eq!(None, RecordKey::from_path(Path::new("/spool/notes")));
    }
}
