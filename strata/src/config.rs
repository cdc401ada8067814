// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Parameter-string parsing for transport bindings.
//!
//! Transports are selected by name plus a parameter string of
//! `key=value` pairs separated by `;` (a bare key is a flag and reads as
//! `1`). Values may be wrapped in single or double quotes. Each transport
//! validates its own recognised keys and warns on the rest.

use strata_core::{ErrorKind, StrataError};

/// Parsed `key=value;…` parameter string. Keys compare case-insensitively.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Params(Vec<(String, String)>);

impl Params {
    pub fn parse(text: &str) -> Params {
        let mut pairs = Vec::new();
        for piece in text.split(';') {
            let piece = piece.trim();
            if piece.is_empty() {
                continue;
            }
            let (key, value) = match piece.split_once('=') {
                Some((key, value)) => (key.trim(), unquote(value.trim())),
                None => (piece, "1"),
            };
            pairs.push((key.to_ascii_lowercase(), value.to_string()));
        }
        Params(pairs)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == &key.to_ascii_lowercase())
            .map(|(_, v)| v.as_str())
    }

    pub fn flag(&self, key: &str) -> bool {
        matches!(self.get(key), Some(v) if v != "0")
    }

    pub fn get_parsed<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, StrataError> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
                StrataError::record(
                    ErrorKind::InvalidData,
                    format!("parameter `{key}` has malformed value `{raw}`"),
                )
            }),
        }
    }

    /// Emit a warning for every key outside `known`.
    pub fn warn_unknown(&self, transport: &str, known: &[&str]) {
        for (key, _) in &self.0 {
            if !known.contains(&key.as_str()) {
                tracing::warn!(transport, key, "ignoring unrecognised transport parameter");
            }
        }
    }
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 && (bytes[0] == b'"' || bytes[0] == b'\'') && bytes[bytes.len() - 1] == bytes[0]
    {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn parses_pairs_flags_and_quotes() {
        let params = Params::parse("cm_host=node0; cm_port=59999; reverse_dim; name=\"a b\"");
        assert_eq!(params.get("cm_host"), Some("node0"));
        assert_eq!(params.get_parsed::<u16>("cm_port").unwrap(), Some(59999));
        assert!(params.flag("reverse_dim"));
        assert_eq!(params.get("name"), Some("a b"));
        assert_eq!(params.get("absent"), None);
    }

    #[test_case("cm_port=notaport")]
    #[test_case("cm_port=-1")]
    fn malformed_numeric_value_is_invalid_data(text: &str) {
        let params = Params::parse(text);
        let err = params.get_parsed::<u16>("cm_port").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn keys_are_case_insensitive() {
        let params = Params::parse("Max_Client=2");
        assert_eq!(params.get_parsed::<usize>("max_client").unwrap(), Some(2));
    }

    #[test]
    fn zero_flag_reads_false() {
        assert!(!Params::parse("reverse_dim=0").flag("reverse_dim"));
    }
}
