// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Deterministic join request names.
//!
//! The name hashes the private key, the subject and the requested usages so
//! that an identical retry lands on the same object while a new key never
//! collides with an older request.

use super::Subject;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use sha2::{Digest, Sha512_256};

const PREFIX: &str = "clusterjoin-";

pub fn join_request_name(key_der: &[u8], subject: &Subject, usages: &[&str]) -> String {
    let mut hasher = Sha512_256::new();
    let mut feed = |data: &[u8]| {
        hasher.update(URL_SAFE_NO_PAD.encode(data).as_bytes());
        hasher.update(b"|");
    };

    feed(key_der);
    feed(subject.common_name.as_bytes());
    for org in &subject.organizations {
        feed(org.as_bytes());
    }
    for usage in usages {
        feed(usage.as_bytes());
    }

    format!("{PREFIX}{}", URL_SAFE_NO_PAD.encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::{ClientKey, CLIENT_USAGES};

    #[test]
    fn test_same_inputs_same_name() {
        let key = ClientKey::generate().unwrap().der().unwrap();
        let subject = Subject::for_cluster("c1", "c1");
        let a = join_request_name(&key, &subject, &CLIENT_USAGES);
        let b = join_request_name(&key, &subject, &CLIENT_USAGES);
        assert_eq!(a, b);
        assert!(a.starts_with("clusterjoin-"));
    }

    #[test]
    fn test_different_key_different_name() {
        let subject = Subject::for_cluster("c1", "c1");
        let k1 = ClientKey::generate().unwrap().der().unwrap();
        let k2 = ClientKey::generate().unwrap().der().unwrap();
        assert_ne!(
            join_request_name(&k1, &subject, &CLIENT_USAGES),
            join_request_name(&k2, &subject, &CLIENT_USAGES)
        );
    }

    #[test]
    fn test_subject_changes_name() {
        let key = ClientKey::generate().unwrap().der().unwrap();
        assert_ne!(
            join_request_name(&key, &Subject::for_cluster("c1", "c1"), &CLIENT_USAGES),
            join_request_name(&key, &Subject::for_cluster("c2", "c1"), &CLIENT_USAGES)
        );
    }

    #[test]
    fn test_name_is_a_valid_object_name() {
        let key = ClientKey::generate().unwrap().der().unwrap();
        let name = join_request_name(&key, &Subject::for_cluster("c1", "c1"), &CLIENT_USAGES);
        // 12 prefix chars plus 43 chars of unpadded base64 for 32 bytes
        assert_eq!(name.len(), 55);
        assert!(name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}
