//! Request/reply shapes and query encodings of the RPC dialect spoken
//! between [RemoteDockerHost](crate::RemoteDockerHost) and the server facade
//! in [server](crate::server). Everything is GET with query parameters and
//! JSON replies: lists of ports are comma-joined, argument vectors are JSON
//! arrays, and key/value maps are `k=v` pairs joined by `&` (percent-encoded
//! in transit).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stacked_errors::{Result, StackableErr};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RunReply {
    #[serde(rename = "instanceID")]
    pub instance_id: u64,
    #[serde(rename = "containerName")]
    pub container_name: String,
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ExecReply {
    #[serde(rename = "instanceID")]
    pub instance_id: u64,
    #[serde(rename = "containerName")]
    pub container_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CommandReply {
    #[serde(rename = "instanceID")]
    pub instance_id: u64,
}

/// One `/stdout` or `/stderr` poll reply. After the process exits only
/// `running: false` is guaranteed; the other fields default to empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct PullReply {
    pub running: bool,
    #[serde(default)]
    pub length: u64,
    #[serde(default)]
    pub removed: u64,
    #[serde(default)]
    pub entries: Vec<Value>,
}

impl PullReply {
    pub fn lines(&self) -> Result<Vec<String>> {
        self.entries
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_owned)
                    .stack_err("non-string entry in line-mode pull reply")
            })
            .collect()
    }

    pub fn bytes(&self) -> Result<Vec<u8>> {
        self.entries
            .iter()
            .map(|v| {
                v.as_u64()
                    .and_then(|b| u8::try_from(b).ok())
                    .stack_err("non-byte entry in byte-mode pull reply")
            })
            .collect()
    }
}

/// `[(k, v)]` -> `"k=v&k2=v2"`, skipping empty keys
pub(crate) fn join_pairs(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .filter(|(k, _)| !k.is_empty())
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Inverse of [join_pairs]; pairs without a `=` get an empty value
pub(crate) fn parse_pairs(joined: &str) -> Vec<(String, String)> {
    joined
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((k, v)) => (k.to_owned(), v.to_owned()),
            None => (part.to_owned(), String::new()),
        })
        .collect()
}

pub(crate) fn join_csv(items: &[String]) -> String {
    items.join(",")
}

pub(crate) fn split_csv(joined: &str) -> Vec<String> {
    joined
        .split(',')
        .filter(|part| !part.is_empty())
        .map(str::to_owned)
        .collect()
}

pub(crate) fn encode_str_vec(items: &[String]) -> String {
    // serializing a Vec<String> cannot fail
    serde_json::to_string(items).unwrap_or_default()
}

pub(crate) fn decode_str_vec(encoded: &str) -> Result<Vec<String>> {
    if encoded.is_empty() {
        return Ok(vec![])
    }
    serde_json::from_str(encoded).stack_err("malformed JSON string array parameter")
}

/// The origin-side half of offset replication: given a stream snapshot
/// `(removed, entries)` and the puller's `real_offset` (logical index of the
/// next entry it expects), returns the suffix to send. An offset below
/// `removed` means the puller is behind the eviction horizon and receives
/// everything retained (it adopts the gap on its side).
pub(crate) fn entries_from_offset<T: Clone>(removed: u64, entries: &[T], real_offset: u64) -> Vec<T> {
    let start = real_offset
        .saturating_sub(removed)
        .min(entries.len() as u64) as usize;
    entries[start..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_maps_round_trip() {
        let pairs = vec![
            ("POSTGRES_PASSWORD".to_owned(), "p".to_owned()),
            ("EMPTY".to_owned(), String::new()),
        ];
        let joined = join_pairs(&pairs);
        assert_eq!(joined, "POSTGRES_PASSWORD=p&EMPTY=");
        assert_eq!(parse_pairs(&joined), pairs);
        assert_eq!(parse_pairs(""), vec![]);
    }

    #[test]
    fn empty_keys_are_skipped() {
        let pairs = vec![(String::new(), "v".to_owned())];
        assert_eq!(join_pairs(&pairs), "");
    }

    #[test]
    fn csv_round_trip() {
        let ports = vec!["80:80".to_owned(), "443:443".to_owned()];
        assert_eq!(split_csv(&join_csv(&ports)), ports);
        assert_eq!(split_csv(""), Vec::<String>::new());
    }

    #[test]
    fn str_vec_round_trip() {
        let args = vec!["-c".to_owned(), "echo hi".to_owned()];
        assert_eq!(decode_str_vec(&encode_str_vec(&args)).unwrap(), args);
        assert_eq!(decode_str_vec("").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn offset_slicing() {
        let entries: Vec<String> = (10..15).map(|i| format!("E{i}")).collect();
        // puller behind the eviction horizon gets everything retained
        assert_eq!(entries_from_offset(10, &entries, 0), entries);
        // puller in the middle gets the suffix
        assert_eq!(entries_from_offset(10, &entries, 13), ["E13", "E14"]);
        // puller caught up (or beyond) gets nothing
        assert!(entries_from_offset(10, &entries, 15).is_empty());
        assert!(entries_from_offset(10, &entries, 99).is_empty());
    }

    #[test]
    fn short_exit_reply_deserializes() {
        let reply: PullReply = serde_json::from_str(r#"{"running":false}"#).unwrap();
        assert!(!reply.running);
        assert_eq!(reply.length, 0);
        assert!(reply.entries.is_empty());
    }
}
