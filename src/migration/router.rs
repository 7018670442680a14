//! Shard routing
//!
//! Pure mapping from a page id to the partition that owns it. The function
//! is part of the persisted contract (see `HASH_CONTRACT`): pages already
//! moved by a previous run were placed with it.

use crate::common::{shard_key, Error, Result, HASH_CONTRACT};
use crate::store::{PageId, Partition};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRouter {
    shard_count: u16,
}

impl ShardRouter {
    pub fn new(shard_count: u16) -> Result<Self> {
        if shard_count == 0 {
            return Err(Error::InvalidConfig("shard_count must be > 0".into()));
        }
        Ok(Self { shard_count })
    }

    pub fn shard_count(&self) -> u16 {
        self.shard_count
    }

    /// Legacy plus every shard
    pub fn partition_count(&self) -> u64 {
        self.shard_count as u64 + 1
    }

    pub fn contract(&self) -> &'static str {
        HASH_CONTRACT
    }

    /// Target partition for `id`. Index 0 keeps the page in legacy.
    pub fn target(&self, id: &PageId) -> Result<Partition> {
        if id.is_nil() {
            return Err(Error::InvalidIdentifier("nil page id".into()));
        }
        let canonical = id.hyphenated().to_string();
        Ok(Partition::from_index(shard_key(
            &canonical,
            self.partition_count(),
        )))
    }

    /// Route a textual id (as received from operators or the admin API).
    pub fn target_str(&self, id: &str) -> Result<Partition> {
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidIdentifier("empty page id".into()));
        }
        let parsed = PageId::parse_str(trimmed)
            .map_err(|e| Error::InvalidIdentifier(format!("{}: {}", trimmed, e)))?;
        self.target(&parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_target_is_stable() {
        let router = ShardRouter::new(2).unwrap();
        let id = Uuid::new_v4();
        let first = router.target(&id).unwrap();
        for _ in 0..10 {
            assert_eq!(router.target(&id).unwrap(), first);
        }
        // a fresh router (new process) agrees
        assert_eq!(ShardRouter::new(2).unwrap().target(&id).unwrap(), first);
    }

    #[test]
    fn test_target_matches_contract() {
        let router = ShardRouter::new(2).unwrap();
        let id = Uuid::parse_str("0f8fad5b-d9cb-469f-a165-70867728950e").unwrap();
        let expected = Partition::from_index(shard_key("0f8fad5b-d9cb-469f-a165-70867728950e", 3));
        assert_eq!(router.target(&id).unwrap(), expected);
        assert_eq!(router.contract(), "blake3-le64-v1");
    }

    #[test]
    fn test_target_str_accepts_any_case() {
        let router = ShardRouter::new(3).unwrap();
        let id = Uuid::new_v4();
        let upper = id.to_string().to_uppercase();
        assert_eq!(router.target_str(&upper).unwrap(), router.target(&id).unwrap());
    }

    #[test]
    fn test_invalid_identifiers() {
        let router = ShardRouter::new(2).unwrap();
        assert!(matches!(
            router.target(&Uuid::nil()),
            Err(Error::InvalidIdentifier(_))
        ));
        assert!(matches!(router.target_str("  "), Err(Error::InvalidIdentifier(_))));
        assert!(matches!(
            router.target_str("not-a-uuid"),
            Err(Error::InvalidIdentifier(_))
        ));
        assert!(ShardRouter::new(0).is_err());
    }

    #[test]
    fn test_every_partition_is_used() {
        let router = ShardRouter::new(2).unwrap();
        let mut hits = std::collections::HashSet::new();
        for _ in 0..200 {
            hits.insert(router.target(&Uuid::new_v4()).unwrap());
        }
        assert_eq!(hits.len(), 3);
    }
}
