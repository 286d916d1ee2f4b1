// Copyright 2026 Directory Services Engineering

//! Request model used for routing decisions.
//!
//! The full DN/RDN/schema subsystem is an external collaborator; the [`Dn`]
//! here is a deliberately minimal, routing-only model: a normalized sequence
//! of RDN strings ordered leaf-first, enough to answer ancestry questions and
//! to produce a canonical routing key.

/// A normalized distinguished name. RDNs are stored leaf-first, lowercased,
/// with surrounding whitespace trimmed.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Dn {
    rdns: Vec<String>,
}

impl Dn {
    /// Parse a DN from its string form. The empty string is the root DN.
    pub fn parse(value: &str) -> Dn {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Dn { rdns: Vec::new() };
        }
        let rdns = trimmed
            .split(',')
            .map(|rdn| rdn.trim().to_ascii_lowercase())
            .collect();
        Dn { rdns }
    }

    pub fn root() -> Dn {
        Dn { rdns: Vec::new() }
    }

    pub fn rdn_count(&self) -> usize {
        self.rdns.len()
    }

    pub fn is_root(&self) -> bool {
        self.rdns.is_empty()
    }

    /// The parent DN, or `None` for the root DN.
    pub fn parent(&self) -> Option<Dn> {
        if self.rdns.is_empty() {
            None
        } else {
            Some(Dn {
                rdns: self.rdns[1..].to_vec(),
            })
        }
    }

    /// True when `self` is strictly below `other`.
    pub fn is_descendant_of(&self, other: &Dn) -> bool {
        self.rdns.len() > other.rdns.len()
            && self.rdns[self.rdns.len() - other.rdns.len()..] == other.rdns[..]
    }

    pub fn is_equal_or_descendant_of(&self, other: &Dn) -> bool {
        self == other || self.is_descendant_of(other)
    }

    /// The ancestor of `self` with `depth` RDNs (or `self` when it already
    /// has that many or fewer).
    pub fn ancestor_or_self(&self, depth: usize) -> Dn {
        if depth >= self.rdns.len() {
            self.clone()
        } else {
            Dn {
                rdns: self.rdns[self.rdns.len() - depth..].to_vec(),
            }
        }
    }

    /// Canonical routing-key form: the normalized string representation with
    /// every byte outside the unreserved URL set percent-encoded.
    pub fn to_normalized_url_safe_string(&self) -> String {
        url_safe(&self.to_string())
    }
}

impl std::fmt::Display for Dn {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.write_str(&self.rdns.join(","))
    }
}

/// Percent-encode everything outside `[a-z0-9._~-]` plus `=` and `,`, which
/// keeps normalized DNs readable while staying URL safe.
pub(crate) fn url_safe(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.to_ascii_lowercase().bytes() {
        match byte {
            b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'~' | b'-' | b'='
            | b',' => out.push(byte as char),
            _ => out.push_str(&format!("%{:02x}", byte)),
        }
    }
    out
}

/// The scope of a search request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SearchScope {
    BaseObject,
    SingleLevel,
    WholeSubtree,
    Subordinates,
}

/// A request control. The only control this layer interprets is the affinity
/// control, an opaque token that pins correlated requests to one partition.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Control {
    Affinity(String),
}

/// A search request. The filter is carried opaquely; filter evaluation is an
/// external collaborator.
#[derive(Clone, Debug)]
pub struct SearchRequest {
    pub dn: Dn,
    pub scope: SearchScope,
    pub filter: String,
    pub controls: Vec<Control>,
}

impl SearchRequest {
    pub fn new(dn: Dn, scope: SearchScope, filter: &str) -> Self {
        SearchRequest {
            dn,
            scope,
            filter: filter.to_owned(),
            controls: Vec::new(),
        }
    }
}

/// The closed set of client operations. Adding a variant without handling it
/// at every dispatch site is a compile error.
#[derive(Clone, Debug)]
pub enum Request {
    Add { dn: Dn, controls: Vec<Control> },
    Bind { dn: Dn, controls: Vec<Control> },
    Compare { dn: Dn, controls: Vec<Control> },
    Delete { dn: Dn, controls: Vec<Control> },
    Extended { name: String, authz_id: Option<String>, controls: Vec<Control> },
    Modify { dn: Dn, controls: Vec<Control> },
    ModifyDn { dn: Dn, controls: Vec<Control> },
    Search(SearchRequest),
}

impl Request {
    pub fn add(dn: Dn) -> Self {
        Request::Add { dn, controls: Vec::new() }
    }

    pub fn bind(dn: Dn) -> Self {
        Request::Bind { dn, controls: Vec::new() }
    }

    pub fn compare(dn: Dn) -> Self {
        Request::Compare { dn, controls: Vec::new() }
    }

    pub fn delete(dn: Dn) -> Self {
        Request::Delete { dn, controls: Vec::new() }
    }

    pub fn extended(name: &str, authz_id: Option<&str>) -> Self {
        Request::Extended {
            name: name.to_owned(),
            authz_id: authz_id.map(str::to_owned),
            controls: Vec::new(),
        }
    }

    pub fn modify(dn: Dn) -> Self {
        Request::Modify { dn, controls: Vec::new() }
    }

    pub fn modify_dn(dn: Dn) -> Self {
        Request::ModifyDn { dn, controls: Vec::new() }
    }

    /// The target DN, when the operation has one.
    pub fn dn(&self) -> Option<&Dn> {
        match self {
            Request::Add { dn, .. }
            | Request::Bind { dn, .. }
            | Request::Compare { dn, .. }
            | Request::Delete { dn, .. }
            | Request::Modify { dn, .. }
            | Request::ModifyDn { dn, .. } => Some(dn),
            Request::Extended { .. } => None,
            Request::Search(search) => Some(&search.dn),
        }
    }

    /// The canonical routing key: the normalized target DN, or an
    /// authzid-style string for operations without one.
    pub fn routing_key(&self) -> String {
        match self {
            Request::Extended { name, authz_id, .. } => match authz_id {
                Some(authz_id) => url_safe(authz_id),
                None => url_safe(name),
            },
            _ => self
                .dn()
                .expect("non-extended requests always carry a DN")
                .to_normalized_url_safe_string(),
        }
    }

    pub fn controls(&self) -> &[Control] {
        match self {
            Request::Add { controls, .. }
            | Request::Bind { controls, .. }
            | Request::Compare { controls, .. }
            | Request::Delete { controls, .. }
            | Request::Extended { controls, .. }
            | Request::Modify { controls, .. }
            | Request::ModifyDn { controls, .. } => controls,
            Request::Search(search) => &search.controls,
        }
    }

    fn controls_mut(&mut self) -> &mut Vec<Control> {
        match self {
            Request::Add { controls, .. }
            | Request::Bind { controls, .. }
            | Request::Compare { controls, .. }
            | Request::Delete { controls, .. }
            | Request::Extended { controls, .. }
            | Request::Modify { controls, .. }
            | Request::ModifyDn { controls, .. } => controls,
            Request::Search(search) => &mut search.controls,
        }
    }

    pub fn with_control(mut self, control: Control) -> Self {
        self.controls_mut().push(control);
        self
    }

    /// Remove and return the affinity control token, if present. Routing
    /// controls are consumed by the dispatcher and never forwarded to a real
    /// connection.
    pub fn take_affinity(&mut self) -> Option<String> {
        let controls = self.controls_mut();
        let position = controls
            .iter()
            .position(|control| matches!(control, Control::Affinity(_)));
        position.map(|index| {
            let Control::Affinity(token) = controls.remove(index);
            token
        })
    }
}

/// An entry returned by a search operation.
#[derive(Clone, Debug)]
pub struct SearchEntry {
    pub dn: Dn,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dn_ancestry() {
        let base = Dn::parse("ou=people,dc=example,dc=com");
        let child = Dn::parse("uid=bjensen, OU=People, dc=Example,dc=com");
        assert!(child.is_descendant_of(&base));
        assert!(!base.is_descendant_of(&child));
        assert!(child.is_equal_or_descendant_of(&base));
        assert!(base.is_equal_or_descendant_of(&base));
        assert_eq!(child.parent().unwrap(), base);
    }

    #[test]
    fn ancestor_or_self_truncates_leaf_first() {
        let dn = Dn::parse("cn=a,uid=b,ou=people,dc=example,dc=com");
        let ancestor = dn.ancestor_or_self(3);
        assert_eq!(ancestor, Dn::parse("ou=people,dc=example,dc=com"));
        assert_eq!(dn.ancestor_or_self(10), dn);
    }

    #[test]
    fn url_safe_normalization() {
        let dn = Dn::parse("CN=J. Smith+Ext,DC=Example");
        assert_eq!(
            dn.to_normalized_url_safe_string(),
            "cn=j.%20smith%2bext,dc=example"
        );
    }

    #[test]
    fn take_affinity_strips_the_control() {
        let mut request = Request::modify(Dn::parse("dc=example"))
            .with_control(Control::Affinity("session-7".into()));
        assert_eq!(request.take_affinity().as_deref(), Some("session-7"));
        assert!(request.controls().is_empty());
        assert_eq!(request.take_affinity(), None);
    }

    #[test]
    fn routing_key_prefers_authz_id_for_extended_ops() {
        let request = Request::extended("1.3.6.1.4.1.4203.1.11.1", Some("u:JBloggs"));
        assert_eq!(request.routing_key(), "u%3ajbloggs");
    }
}
