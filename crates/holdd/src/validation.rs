//! Entry validation with direct or reconstructed validation packages
//!
//! A header is first checked on its own (shape, signature, entry address),
//! then against the author's chain as held locally (fork, link). If the
//! entry's rule needs the author's prior chain, a validation package is
//! resolved: from the author when it is reachable, otherwise rebuilt from
//! headers this node already holds. A gap in the held chain makes the
//! verdict INCOMPLETE rather than INVALID.

use crate::entry_store::{ChainPrefix, EntryStore, EntryStoreError, HoldOutcome};
use chainhold_core::crypto::{header_address, verify_entry_address, verify_header};
use chainhold_core::types::*;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Permanent reasons an (entry, header) pair is invalid
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationFailure {
    #[error("malformed: {0}")]
    Malformed(String),
    #[error("invalid header signature")]
    BadSignature,
    #[error("entry does not match header: {0}")]
    AddressMismatch(String),
    #[error("fork: {author} already has a different header at seq {seq}")]
    Fork { author: AgentKey, seq: u64 },
    #[error("header at seq {seq} does not link to its predecessor")]
    BrokenLink { seq: u64 },
    #[error("bad validation package: {0}")]
    BadPackage(String),
    #[error("rule violation: {0}")]
    Rule(String),
}

impl From<chainhold_core::Error> for ValidationFailure {
    fn from(e: chainhold_core::Error) -> Self {
        use chainhold_core::Error;
        match e {
            Error::InvalidSignature | Error::InvalidPublicKey(_) => ValidationFailure::BadSignature,
            Error::HashMismatch { .. } => ValidationFailure::AddressMismatch(e.to_string()),
            other => ValidationFailure::Malformed(other.to_string()),
        }
    }
}

/// Outcome of validating one (entry, header) pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Valid {
        origin: PackageOrigin,
        package: ValidationPackage,
    },
    Invalid(ValidationFailure),
    /// The author's chain is not held far enough back; retry later
    Incomplete { author: AgentKey, missing_seq: u64 },
}

/// Everything a rule gets to look at
pub struct ValidationData<'a> {
    pub entry: &'a Entry,
    pub header: &'a Header,
    pub package: &'a ValidationPackage,
}

/// Validation rule for one entry type
pub trait EntryValidator: Send + Sync {
    /// What the rule needs to see besides the entry itself
    fn package_definition(&self) -> ValidationPackageDefinition;

    fn validate(&self, data: &ValidationData<'_>) -> Result<(), String>;
}

type RuleFnBox = Box<dyn Fn(&ValidationData<'_>) -> Result<(), String> + Send + Sync>;

/// Rule built from a closure
pub struct FnRule {
    definition: ValidationPackageDefinition,
    check: RuleFnBox,
}

impl FnRule {
    pub fn new(
        definition: ValidationPackageDefinition,
        check: impl Fn(&ValidationData<'_>) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            definition,
            check: Box::new(check),
        }
    }

    /// Accept everything, requiring the given package
    pub fn accept_all(definition: ValidationPackageDefinition) -> Self {
        Self::new(definition, |_| Ok(()))
    }
}

impl EntryValidator for FnRule {
    fn package_definition(&self) -> ValidationPackageDefinition {
        self.definition
    }

    fn validate(&self, data: &ValidationData<'_>) -> Result<(), String> {
        (self.check)(data)
    }
}

/// Built-in rule for genesis entries: content is the author's key
struct AgentIdRule;

impl EntryValidator for AgentIdRule {
    fn package_definition(&self) -> ValidationPackageDefinition {
        ValidationPackageDefinition::Entry
    }

    fn validate(&self, data: &ValidationData<'_>) -> Result<(), String> {
        if data.header.seq() != 0 {
            return Err(format!("agent id at seq {}", data.header.seq()));
        }
        if data.entry.content != data.header.author().0 {
            return Err("agent id content is not the author key".into());
        }
        Ok(())
    }
}

/// Maps entry types to their validation rules
#[derive(Clone)]
pub struct RuleRegistry {
    rules: HashMap<String, Arc<dyn EntryValidator>>,
    fallback: Arc<dyn EntryValidator>,
    agent_id: Arc<dyn EntryValidator>,
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self {
            rules: HashMap::new(),
            fallback: Arc::new(FnRule::accept_all(ValidationPackageDefinition::Entry)),
            agent_id: Arc::new(AgentIdRule),
        }
    }
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the rule for an application entry type
    pub fn with_rule(mut self, type_name: impl Into<String>, rule: impl EntryValidator + 'static) -> Self {
        self.rules.insert(type_name.into(), Arc::new(rule));
        self
    }

    /// Rule for application types with no registered rule
    pub fn with_fallback(mut self, rule: impl EntryValidator + 'static) -> Self {
        self.fallback = Arc::new(rule);
        self
    }

    pub fn validator_for(&self, entry_type: &EntryType) -> Arc<dyn EntryValidator> {
        match entry_type {
            EntryType::AgentId => self.agent_id.clone(),
            EntryType::App(name) => self
                .rules
                .get(name)
                .cloned()
                .unwrap_or_else(|| self.fallback.clone()),
        }
    }

    pub fn definition_for(&self, entry_type: &EntryType) -> ValidationPackageDefinition {
        self.validator_for(entry_type).package_definition()
    }
}

/// Where validation packages come from when the author may be online
#[async_trait::async_trait]
pub trait PackageSource: Send + Sync {
    /// Whether the author can currently be asked directly
    fn author_reachable(&self, author: &AgentKey) -> bool;

    /// Ask the author for the package of one of its headers.
    /// None if the author did not answer.
    async fn request_package(&self, header: &Header) -> Option<ValidationPackage>;
}

/// Package source that never reaches anyone
pub struct LocalOnly;

#[async_trait::async_trait]
impl PackageSource for LocalOnly {
    fn author_reachable(&self, _author: &AgentKey) -> bool {
        false
    }

    async fn request_package(&self, _header: &Header) -> Option<ValidationPackage> {
        None
    }
}

enum Resolved {
    Package(ValidationPackage),
    Failed(ValidationFailure),
    Missing(u64),
}

/// Validates entries against the local store and the rule registry
pub struct ValidationEngine {
    store: Arc<EntryStore>,
    rules: Arc<RuleRegistry>,
    local_author: AgentKey,
}

impl ValidationEngine {
    pub fn new(store: Arc<EntryStore>, rules: Arc<RuleRegistry>, local_author: AgentKey) -> Self {
        Self {
            store,
            rules,
            local_author,
        }
    }

    pub fn rules(&self) -> &RuleRegistry {
        &self.rules
    }

    /// Validate an (entry, header) pair.
    ///
    /// Errors are local storage failures only; every verdict about the
    /// pair itself is in the returned [`Verdict`].
    pub async fn validate(
        &self,
        entry: &Entry,
        header: &Header,
        source: &dyn PackageSource,
    ) -> Result<Verdict, EntryStoreError> {
        if let Err(e) = verify_header(header) {
            return Ok(Verdict::Invalid(e.into()));
        }
        if let Err(e) = verify_entry_address(entry, header) {
            return Ok(Verdict::Invalid(e.into()));
        }
        if let Some(failure) = self.sequence_failure(header)? {
            return Ok(Verdict::Invalid(failure));
        }

        let validator = self.rules.validator_for(header.entry_type());
        let definition = validator.package_definition();

        let package = match self.resolve_package(header, definition, source).await? {
            Resolved::Package(package) => package,
            Resolved::Failed(failure) => return Ok(Verdict::Invalid(failure)),
            Resolved::Missing(missing_seq) => {
                return Ok(Verdict::Incomplete {
                    author: *header.author(),
                    missing_seq,
                })
            }
        };

        let data = ValidationData {
            entry,
            header,
            package: &package,
        };
        if let Err(reason) = validator.validate(&data) {
            return Ok(Verdict::Invalid(ValidationFailure::Rule(reason)));
        }

        Ok(Verdict::Valid {
            origin: package.origin,
            package,
        })
    }

    /// Package for a request from another node: only for our own headers
    /// that we hold.
    pub fn package_for_request(
        &self,
        header: &Header,
    ) -> Result<Option<ValidationPackage>, EntryStoreError> {
        if header.author() != &self.local_author {
            return Ok(None);
        }
        match self.store.header_at(header.author(), header.seq())? {
            Some(held) if &held == header => {}
            _ => return Ok(None),
        }

        let definition = self.rules.definition_for(header.entry_type());
        let package = if definition.requires_chain() {
            match self.build_local_package(header, definition)? {
                Ok(package) => package,
                Err(_) => return Ok(None),
            }
        } else {
            ValidationPackage::only_header(header.clone())
        };
        Ok(Some(ValidationPackage {
            origin: PackageOrigin::Author,
            ..package
        }))
    }

    /// Build a package from locally held headers and entries, or return the
    /// first seq that is missing.
    pub fn build_local_package(
        &self,
        header: &Header,
        definition: ValidationPackageDefinition,
    ) -> Result<Result<ValidationPackage, u64>, EntryStoreError> {
        let headers = match self.store.chain_prefix(header.author(), header.seq())? {
            ChainPrefix::Complete(headers) => headers,
            ChainPrefix::Gap { missing_seq } => return Ok(Err(missing_seq)),
        };
        let entries = if definition.requires_entries() {
            match self.store.chain_entries(&headers)? {
                Ok(entries) => Some(entries),
                Err(missing_seq) => return Ok(Err(missing_seq)),
            }
        } else {
            None
        };
        Ok(Ok(ValidationPackage {
            header: header.clone(),
            chain_headers: Some(headers),
            chain_entries: entries,
            origin: PackageOrigin::Reconstructed,
        }))
    }

    fn sequence_failure(&self, header: &Header) -> Result<Option<ValidationFailure>, EntryStoreError> {
        let addr = header_address(&header.unsigned)?;
        let author = header.author();

        if let Some(existing) = self.store.header_at(author, header.seq())? {
            if header_address(&existing.unsigned)? != addr {
                return Ok(Some(ValidationFailure::Fork {
                    author: *author,
                    seq: header.seq(),
                }));
            }
        }

        // A missing predecessor is a gap, not a failure
        if header.seq() > 0 {
            if let Some(prev) = self.store.header_at(author, header.seq() - 1)? {
                if Some(&header_address(&prev.unsigned)?) != header.prev_header() {
                    return Ok(Some(ValidationFailure::BrokenLink { seq: header.seq() }));
                }
            }
        }

        Ok(None)
    }

    async fn resolve_package(
        &self,
        header: &Header,
        definition: ValidationPackageDefinition,
        source: &dyn PackageSource,
    ) -> Result<Resolved, EntryStoreError> {
        if !definition.requires_chain() {
            // The header must still extend a held chain
            if let Some(missing_seq) = self.store.first_gap(header.author(), header.seq())? {
                return Ok(Resolved::Missing(missing_seq));
            }
            return Ok(Resolved::Package(ValidationPackage::only_header(header.clone())));
        }

        let author = header.author();
        if author == &self.local_author {
            return Ok(match self.build_local_package(header, definition)? {
                Ok(package) => Resolved::Package(ValidationPackage {
                    origin: PackageOrigin::SelfAuthored,
                    ..package
                }),
                Err(missing_seq) => Resolved::Missing(missing_seq),
            });
        }

        if source.author_reachable(author) {
            if let Some(package) = source.request_package(header).await {
                if let Err(failure) = verify_package(header, &package, definition) {
                    return Ok(Resolved::Failed(failure));
                }
                for chain_header in package.chain_headers.iter().flatten() {
                    if let HoldOutcome::Fork(_) = self.store.hold_header(chain_header)? {
                        return Ok(Resolved::Failed(ValidationFailure::Fork {
                            author: *author,
                            seq: chain_header.seq(),
                        }));
                    }
                }
                return Ok(Resolved::Package(ValidationPackage {
                    origin: PackageOrigin::Author,
                    ..package
                }));
            }
            debug!(author = %author, seq = header.seq(), "author gave no package, reconstructing");
        }

        match self.build_local_package(header, definition)? {
            Ok(package) => match verify_package(header, &package, definition) {
                Ok(()) => Ok(Resolved::Package(package)),
                Err(failure) => Ok(Resolved::Failed(failure)),
            },
            Err(missing_seq) => Ok(Resolved::Missing(missing_seq)),
        }
    }
}

/// Check that a package really is the author's chain up to `header`
pub fn verify_package(
    header: &Header,
    package: &ValidationPackage,
    definition: ValidationPackageDefinition,
) -> Result<(), ValidationFailure> {
    if &package.header != header {
        return Err(ValidationFailure::BadPackage(
            "package is for a different header".into(),
        ));
    }
    if !definition.requires_chain() {
        return Ok(());
    }

    let chain = package
        .chain_headers
        .as_ref()
        .ok_or_else(|| ValidationFailure::BadPackage("missing chain headers".into()))?;
    if chain.len() as u64 != header.seq() {
        return Err(ValidationFailure::BadPackage(format!(
            "expected {} chain headers, got {}",
            header.seq(),
            chain.len()
        )));
    }

    let mut prev: Option<HeaderAddress> = None;
    for (i, chain_header) in chain.iter().enumerate() {
        if chain_header.author() != header.author() || chain_header.seq() != i as u64 {
            return Err(ValidationFailure::BadPackage(format!(
                "chain header {} is out of place",
                i
            )));
        }
        verify_header(chain_header)
            .map_err(|e| ValidationFailure::BadPackage(format!("chain header {}: {}", i, e)))?;
        if chain_header.prev_header() != prev.as_ref() {
            return Err(ValidationFailure::BrokenLink { seq: i as u64 });
        }
        prev = Some(header_address(&chain_header.unsigned)?);
    }
    if header.prev_header() != prev.as_ref() {
        return Err(ValidationFailure::BrokenLink { seq: header.seq() });
    }

    if definition.requires_entries() {
        let entries = package
            .chain_entries
            .as_ref()
            .ok_or_else(|| ValidationFailure::BadPackage("missing chain entries".into()))?;
        if entries.len() != chain.len() {
            return Err(ValidationFailure::BadPackage(format!(
                "{} chain entries for {} headers",
                entries.len(),
                chain.len()
            )));
        }
        for (entry, chain_header) in entries.iter().zip(chain) {
            verify_entry_address(entry, chain_header).map_err(|e| {
                ValidationFailure::BadPackage(format!("chain entry {}: {}", chain_header.seq(), e))
            })?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry_store::tests::build_chain;
    use crate::storage::Storage;
    use chainhold_net::KeyPair;

    struct MockSource {
        reachable: bool,
        package: Option<ValidationPackage>,
    }

    #[async_trait::async_trait]
    impl PackageSource for MockSource {
        fn author_reachable(&self, _author: &AgentKey) -> bool {
            self.reachable
        }

        async fn request_package(&self, _header: &Header) -> Option<ValidationPackage> {
            self.package.clone()
        }
    }

    fn registry() -> RuleRegistry {
        RuleRegistry::new().with_rule(
            "post",
            FnRule::new(ValidationPackageDefinition::ChainFull, |data| {
                if data.entry.content.is_empty() {
                    return Err("empty post".into());
                }
                Ok(())
            }),
        )
    }

    fn engine_for(local: AgentKey) -> (ValidationEngine, Arc<EntryStore>) {
        let store = Arc::new(EntryStore::new(Arc::new(Storage::open_temporary().unwrap())));
        let engine = ValidationEngine::new(store.clone(), Arc::new(registry()), local);
        (engine, store)
    }

    fn stranger() -> AgentKey {
        AgentKey([0xee; 32])
    }

    #[tokio::test]
    async fn test_genesis_needs_only_header() {
        let chain = build_chain(&KeyPair::generate(), 1);
        let (engine, _store) = engine_for(stranger());

        let verdict = engine.validate(&chain[0].0, &chain[0].1, &LocalOnly).await.unwrap();
        assert!(matches!(
            verdict,
            Verdict::Valid {
                origin: PackageOrigin::HeaderOnly,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_tampered_signature_is_invalid() {
        let chain = build_chain(&KeyPair::generate(), 1);
        let (engine, _store) = engine_for(stranger());
        let mut header = chain[0].1.clone();
        header.signature[0] ^= 0xff;

        let verdict = engine.validate(&chain[0].0, &header, &LocalOnly).await.unwrap();
        assert_eq!(verdict, Verdict::Invalid(ValidationFailure::BadSignature));
    }

    #[tokio::test]
    async fn test_content_mismatch_is_invalid() {
        let chain = build_chain(&KeyPair::generate(), 2);
        let (engine, _store) = engine_for(stranger());
        let other = Entry::new(EntryType::App("post".into()), "something else");

        let verdict = engine.validate(&other, &chain[1].1, &LocalOnly).await.unwrap();
        assert!(matches!(verdict, Verdict::Invalid(ValidationFailure::AddressMismatch(_))));
    }

    #[tokio::test]
    async fn test_reconstructs_from_held_chain() {
        let chain = build_chain(&KeyPair::generate(), 3);
        let (engine, store) = engine_for(stranger());
        store.append(&chain[0].0, &chain[0].1).unwrap();
        store.append(&chain[1].0, &chain[1].1).unwrap();

        let verdict = engine.validate(&chain[2].0, &chain[2].1, &LocalOnly).await.unwrap();
        match verdict {
            Verdict::Valid { origin, package } => {
                assert_eq!(origin, PackageOrigin::Reconstructed);
                assert_eq!(package.chain_headers.unwrap().len(), 2);
                assert_eq!(package.chain_entries.unwrap().len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_gap_is_incomplete() {
        let keypair = KeyPair::generate();
        let chain = build_chain(&keypair, 3);
        let (engine, store) = engine_for(stranger());
        store.append(&chain[0].0, &chain[0].1).unwrap();

        let verdict = engine.validate(&chain[2].0, &chain[2].1, &LocalOnly).await.unwrap();
        assert_eq!(
            verdict,
            Verdict::Incomplete {
                author: keypair.agent_key(),
                missing_seq: 1
            }
        );
    }

    fn signed_at(keypair: &KeyPair, entry: &Entry, seq: u64, prev: &Header) -> Header {
        let unsigned = HeaderUnsigned {
            entry_type: entry.entry_type.clone(),
            entry_address: chainhold_core::crypto::entry_address(entry).unwrap(),
            author: keypair.agent_key(),
            seq,
            prev_header: Some(header_address(&prev.unsigned).unwrap()),
            timestamp_ms: 1_700_000_000_000 + seq,
        };
        keypair.sign_header(unsigned).unwrap()
    }

    #[tokio::test]
    async fn test_huge_seq_is_incomplete_not_a_crash() {
        let keypair = KeyPair::generate();
        let chain = build_chain(&keypair, 1);
        let (engine, store) = engine_for(stranger());
        store.append(&chain[0].0, &chain[0].1).unwrap();

        for type_name in ["post", "note"] {
            let entry = Entry::new(EntryType::App(type_name.into()), "far ahead");
            let header = signed_at(&keypair, &entry, u64::MAX, &chain[0].1);

            let verdict = engine.validate(&entry, &header, &LocalOnly).await.unwrap();
            assert_eq!(
                verdict,
                Verdict::Incomplete {
                    author: keypair.agent_key(),
                    missing_seq: 1
                }
            );
        }
    }

    #[tokio::test]
    async fn test_header_only_type_waits_for_missing_headers() {
        let keypair = KeyPair::generate();
        let chain = build_chain(&keypair, 3);
        let (engine, store) = engine_for(stranger());
        store.append(&chain[0].0, &chain[0].1).unwrap();

        // "note" falls back to the header-only rule
        let note = Entry::new(EntryType::App("note".into()), "seq 3");
        let header = signed_at(&keypair, &note, 3, &chain[2].1);

        let verdict = engine.validate(&note, &header, &LocalOnly).await.unwrap();
        assert!(matches!(verdict, Verdict::Incomplete { missing_seq: 1, .. }));

        store.hold_header(&chain[2].1).unwrap();
        let verdict = engine.validate(&note, &header, &LocalOnly).await.unwrap();
        assert!(matches!(verdict, Verdict::Incomplete { missing_seq: 1, .. }));

        store.hold_header(&chain[1].1).unwrap();
        let verdict = engine.validate(&note, &header, &LocalOnly).await.unwrap();
        assert!(matches!(
            verdict,
            Verdict::Valid {
                origin: PackageOrigin::HeaderOnly,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_held_header_without_entry_is_incomplete_for_chain_full() {
        let chain = build_chain(&KeyPair::generate(), 3);
        let (engine, store) = engine_for(stranger());
        store.append(&chain[0].0, &chain[0].1).unwrap();
        store.hold_header(&chain[1].1).unwrap();

        let verdict = engine.validate(&chain[2].0, &chain[2].1, &LocalOnly).await.unwrap();
        assert!(matches!(verdict, Verdict::Incomplete { missing_seq: 1, .. }));
    }

    #[tokio::test]
    async fn test_direct_package_from_author() {
        let keypair = KeyPair::generate();
        let chain = build_chain(&keypair, 3);

        let (author_engine, author_store) = engine_for(keypair.agent_key());
        for (entry, header) in &chain {
            author_store.append(entry, header).unwrap();
        }
        let package = author_engine.package_for_request(&chain[2].1).unwrap().unwrap();
        assert_eq!(package.origin, PackageOrigin::Author);

        let (engine, store) = engine_for(stranger());
        let source = MockSource {
            reachable: true,
            package: Some(package),
        };
        let verdict = engine.validate(&chain[2].0, &chain[2].1, &source).await.unwrap();
        assert!(matches!(
            verdict,
            Verdict::Valid {
                origin: PackageOrigin::Author,
                ..
            }
        ));
        // Package headers are now held for later reconstruction
        assert_eq!(store.header_count(), 2);
    }

    #[tokio::test]
    async fn test_unanswered_author_falls_back_to_reconstruction() {
        let chain = build_chain(&KeyPair::generate(), 2);
        let (engine, store) = engine_for(stranger());
        store.append(&chain[0].0, &chain[0].1).unwrap();

        let source = MockSource {
            reachable: true,
            package: None,
        };
        let verdict = engine.validate(&chain[1].0, &chain[1].1, &source).await.unwrap();
        assert!(matches!(
            verdict,
            Verdict::Valid {
                origin: PackageOrigin::Reconstructed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_bad_package_is_invalid() {
        let keypair = KeyPair::generate();
        let chain = build_chain(&keypair, 3);
        let (engine, _store) = engine_for(stranger());

        let package = ValidationPackage {
            header: chain[2].1.clone(),
            // Skips seq 1
            chain_headers: Some(vec![chain[0].1.clone(), chain[0].1.clone()]),
            chain_entries: Some(vec![chain[0].0.clone(), chain[0].0.clone()]),
            origin: PackageOrigin::Author,
        };
        let source = MockSource {
            reachable: true,
            package: Some(package),
        };
        let verdict = engine.validate(&chain[2].0, &chain[2].1, &source).await.unwrap();
        assert!(matches!(verdict, Verdict::Invalid(ValidationFailure::BadPackage(_))));
    }

    #[tokio::test]
    async fn test_fork_is_invalid() {
        let keypair = KeyPair::generate();
        let chain = build_chain(&keypair, 2);
        let (engine, store) = engine_for(stranger());
        store.append(&chain[0].0, &chain[0].1).unwrap();
        store.append(&chain[1].0, &chain[1].1).unwrap();

        let other = build_chain(&keypair, 2);
        let mut unsigned = other[1].1.unsigned.clone();
        unsigned.timestamp_ms += 7;
        let forked = chainhold_core::crypto::create_header(unsigned, |b| keypair.sign(b).to_vec()).unwrap();

        let verdict = engine.validate(&other[1].0, &forked, &LocalOnly).await.unwrap();
        assert!(matches!(verdict, Verdict::Invalid(ValidationFailure::Fork { seq: 1, .. })));
    }

    #[tokio::test]
    async fn test_rule_rejection() {
        let keypair = KeyPair::generate();
        let (engine, store) = engine_for(stranger());
        let chain = build_chain(&keypair, 1);
        store.append(&chain[0].0, &chain[0].1).unwrap();

        let entry = Entry::new(EntryType::App("post".into()), Vec::new());
        let unsigned = HeaderUnsigned {
            entry_type: entry.entry_type.clone(),
            entry_address: chainhold_core::crypto::entry_address(&entry).unwrap(),
            author: keypair.agent_key(),
            seq: 1,
            prev_header: Some(header_address(&chain[0].1.unsigned).unwrap()),
            timestamp_ms: 1,
        };
        let header = keypair.sign_header(unsigned).unwrap();

        let verdict = engine.validate(&entry, &header, &LocalOnly).await.unwrap();
        assert_eq!(
            verdict,
            Verdict::Invalid(ValidationFailure::Rule("empty post".into()))
        );
    }

    #[tokio::test]
    async fn test_self_authored_package() {
        let keypair = KeyPair::generate();
        let chain = build_chain(&keypair, 2);
        let (engine, store) = engine_for(keypair.agent_key());
        store.append(&chain[0].0, &chain[0].1).unwrap();

        let verdict = engine.validate(&chain[1].0, &chain[1].1, &LocalOnly).await.unwrap();
        assert!(matches!(
            verdict,
            Verdict::Valid {
                origin: PackageOrigin::SelfAuthored,
                ..
            }
        ));
    }

    #[test]
    fn test_agent_id_rule() {
        let keypair = KeyPair::generate();
        let chain = build_chain(&keypair, 1);
        let registry = RuleRegistry::new();
        let rule = registry.validator_for(&EntryType::AgentId);
        let package = ValidationPackage::only_header(chain[0].1.clone());

        let ok = ValidationData {
            entry: &chain[0].0,
            header: &chain[0].1,
            package: &package,
        };
        assert!(rule.validate(&ok).is_ok());

        let wrong = Entry::agent_id(&stranger());
        let bad = ValidationData {
            entry: &wrong,
            header: &chain[0].1,
            package: &package,
        };
        assert!(rule.validate(&bad).is_err());
        assert_eq!(
            registry.definition_for(&EntryType::App("unknown".into())),
            ValidationPackageDefinition::Entry
        );
    }
}
