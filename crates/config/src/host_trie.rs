//! Hostname-to-certificate trie with wildcard SNI matching.
//!
//! Built once per running snapshot from the revision's SNI bindings and
//! never mutated afterwards; a configuration change rebuilds and swaps the
//! whole trie. Lookups on the TLS handshake path are plain map reads.

use bastion_common::CertId;
use std::collections::HashMap;

use crate::model::SniBinding;

#[derive(Debug, Default)]
struct TrieNode {
    children: HashMap<String, TrieNode>,
    id: Option<CertId>,
}

/// Immutable reversed-label hostname trie.
///
/// Hostnames are IDNA-mapped per label, split on `.`, and stored most
/// significant label first, so `www.example.com` becomes the path
/// `com → example → www`. A literal `*` label is preserved as-is and
/// matches exactly one label in the least significant position; an exact
/// match at that position always wins over the wildcard sibling.
#[derive(Debug)]
pub struct HostTrie {
    root: TrieNode,
}

impl HostTrie {
    /// Build a trie from a revision's SNI bindings.
    ///
    /// Construction is O(total labels). Bindings with unmappable labels
    /// are kept with the label lowercased, matching the lookup-side
    /// normalization so such entries remain self-consistent.
    pub fn new(bindings: &[SniBinding]) -> Self {
        let mut root = TrieNode::default();
        for binding in bindings {
            let mut node = &mut root;
            for label in split_hostname(&binding.host) {
                node = node.children.entry(label).or_default();
            }
            node.id = Some(binding.certificate_id);
        }
        Self { root }
    }

    /// Resolve `hostname` to a certificate id.
    ///
    /// Walks from the most significant label; at the final label an exact
    /// child is preferred, and only if absent is a sibling `*` child
    /// consulted. Multi-level wildcards are not supported.
    pub fn lookup(&self, hostname: &str) -> Option<CertId> {
        if hostname.is_empty() {
            return None;
        }
        let labels = split_hostname(hostname);
        let (last, prefix) = labels.split_last()?;

        let mut node = &self.root;
        for label in prefix {
            node = node.children.get(label)?;
        }

        if let Some(exact) = node.children.get(last) {
            if exact.id.is_some() {
                return exact.id;
            }
        }
        node.children.get("*").and_then(|wildcard| wildcard.id)
    }

    /// Whether the trie holds no bindings at all.
    pub fn is_empty(&self) -> bool {
        self.root.children.is_empty()
    }

    /// Every `(hostname, certificate id)` pair bound in the trie, with
    /// the hostname reassembled in display order.
    pub fn bindings(&self) -> Vec<(String, CertId)> {
        let mut out = Vec::new();
        let mut stack: Vec<(&TrieNode, Vec<&str>)> = vec![(&self.root, Vec::new())];
        while let Some((node, path)) = stack.pop() {
            if let Some(id) = node.id {
                let mut labels = path.clone();
                labels.reverse();
                out.push((labels.join("."), id));
            }
            for (label, child) in &node.children {
                let mut next = path.clone();
                next.push(label.as_str());
                stack.push((child, next));
            }
        }
        out
    }
}

/// Split into labels, reversed (most significant first), each label
/// IDNA-mapped to its ASCII (punycode) form. `*` passes through.
fn split_hostname(hostname: &str) -> Vec<String> {
    hostname
        .rsplit('.')
        .map(|label| {
            if label == "*" {
                label.to_string()
            } else {
                idna::domain_to_ascii(label).unwrap_or_else(|_| label.to_ascii_lowercase())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bind(host: &str, id: CertId) -> SniBinding {
        SniBinding {
            host: host.to_string(),
            certificate_id: id,
        }
    }

    #[test]
    fn test_exact_match() {
        let id = CertId::new();
        let trie = HostTrie::new(&[bind("www.example.com", id)]);

        assert_eq!(trie.lookup("www.example.com"), Some(id));
        assert_eq!(trie.lookup("example.com"), None);
        assert_eq!(trie.lookup("api.example.com"), None);
    }

    #[test]
    fn test_wildcard_match() {
        let id = CertId::new();
        let trie = HostTrie::new(&[bind("*.example.com", id)]);

        assert_eq!(trie.lookup("www.example.com"), Some(id));
        assert_eq!(trie.lookup("api.example.com"), Some(id));
        // wildcard covers exactly one label
        assert_eq!(trie.lookup("a.b.example.com"), None);
        assert_eq!(trie.lookup("example.com"), None);
    }

    #[test]
    fn test_exact_preferred_over_wildcard() {
        let wildcard_id = CertId::new();
        let exact_id = CertId::new();
        let trie = HostTrie::new(&[
            bind("*.example.com", wildcard_id),
            bind("www.example.com", exact_id),
        ]);

        assert_eq!(trie.lookup("www.example.com"), Some(exact_id));
        assert_eq!(trie.lookup("mail.example.com"), Some(wildcard_id));
    }

    #[test]
    fn test_case_insensitive() {
        let id = CertId::new();
        let trie = HostTrie::new(&[bind("WWW.Example.COM", id)]);

        assert_eq!(trie.lookup("www.example.com"), Some(id));
        assert_eq!(trie.lookup("WwW.eXaMpLe.CoM"), Some(id));
    }

    #[test]
    fn test_idna_mapped_labels() {
        let id = CertId::new();
        // Unicode binding, punycode lookup — and the reverse.
        let trie = HostTrie::new(&[bind("bücher.example", id)]);

        assert_eq!(trie.lookup("xn--bcher-kva.example"), Some(id));
        assert_eq!(trie.lookup("bücher.example"), Some(id));
    }

    #[test]
    fn test_empty_hostname() {
        let trie = HostTrie::new(&[bind("example.com", CertId::new())]);
        assert_eq!(trie.lookup(""), None);
    }

    #[test]
    fn test_empty_trie() {
        let trie = HostTrie::new(&[]);
        assert!(trie.is_empty());
        assert_eq!(trie.lookup("example.com"), None);
    }

    #[test]
    fn test_no_match_without_id_on_interior_node() {
        let id = CertId::new();
        let trie = HostTrie::new(&[bind("www.example.com", id)]);
        // "com" and "example.com" are interior nodes without bindings
        assert_eq!(trie.lookup("com"), None);
        assert_eq!(trie.lookup("example.com"), None);
    }

    #[test]
    fn test_bindings_round_trip() {
        let a = CertId::new();
        let b = CertId::new();
        let trie = HostTrie::new(&[bind("www.example.com", a), bind("*.example.org", b)]);

        let mut bindings = trie.bindings();
        bindings.sort();
        let mut expected = vec![
            ("www.example.com".to_string(), a),
            ("*.example.org".to_string(), b),
        ];
        expected.sort();
        assert_eq!(bindings, expected);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn test_exact_bindings_always_resolve(
                labels in proptest::collection::vec("[a-z]{1,8}", 1..4)
            ) {
                let host = labels.join(".");
                let id = CertId::new();
                let trie = HostTrie::new(&[bind(&host, id)]);
                prop_assert_eq!(trie.lookup(&host), Some(id));
            }

            #[test]
            fn test_wildcard_covers_exactly_one_label(
                sub in "[a-z]{1,8}",
                extra in "[a-z]{1,8}"
            ) {
                let id = CertId::new();
                let trie = HostTrie::new(&[bind("*.example.com", id)]);
                prop_assert_eq!(trie.lookup(&format!("{sub}.example.com")), Some(id));
                prop_assert_eq!(trie.lookup(&format!("{extra}.{sub}.example.com")), None);
            }
        }
    }
}
