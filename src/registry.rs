//! Algorithm name resolution.
//!
//! A process-wide registry maps canonical names and their deprecated
//! aliases to algorithm identifiers. Each deprecated alias triggers a
//! single warning per process, however many times it is used.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use log::warn;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{MvaError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecompositionAlgorithm {
    Svd,
    Mlpca,
    Rpca,
    Orpca,
    Ornmf,
}

impl DecompositionAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecompositionAlgorithm::Svd => "svd",
            DecompositionAlgorithm::Mlpca => "mlpca",
            DecompositionAlgorithm::Rpca => "rpca",
            DecompositionAlgorithm::Orpca => "orpca",
            DecompositionAlgorithm::Ornmf => "ornmf",
        }
    }

    /// The robust and online family cannot pick a dimension on its own.
    pub fn requires_output_dimension(&self) -> bool {
        !matches!(self, DecompositionAlgorithm::Svd)
    }

    pub fn parse(name: &str) -> Result<Self> {
        REGISTRY.resolve_decomposition(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterAlgorithm {
    KMeans,
    Agglomerative,
}

impl ClusterAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterAlgorithm::KMeans => "kmeans",
            ClusterAlgorithm::Agglomerative => "agglomerative",
        }
    }

    pub fn parse(name: &str) -> Result<Self> {
        REGISTRY.resolve_cluster(name)
    }
}

pub struct AlgorithmRegistry {
    decomposition: BTreeMap<&'static str, DecompositionAlgorithm>,
    decomposition_aliases: BTreeMap<&'static str, &'static str>,
    cluster: BTreeMap<&'static str, ClusterAlgorithm>,
}

pub static REGISTRY: Lazy<AlgorithmRegistry> = Lazy::new(|| {
    let mut decomposition = BTreeMap::new();
    decomposition.insert("svd", DecompositionAlgorithm::Svd);
    decomposition.insert("mlpca", DecompositionAlgorithm::Mlpca);
    decomposition.insert("rpca", DecompositionAlgorithm::Rpca);
    decomposition.insert("orpca", DecompositionAlgorithm::Orpca);
    decomposition.insert("ornmf", DecompositionAlgorithm::Ornmf);

    let mut decomposition_aliases = BTreeMap::new();
    decomposition_aliases.insert("fast_svd", "svd");
    decomposition_aliases.insert("fast_mlpca", "mlpca");
    decomposition_aliases.insert("RPCA_GoDec", "rpca");
    decomposition_aliases.insert("ORPCA", "orpca");
    decomposition_aliases.insert("ORNMF", "ornmf");

    let mut cluster = BTreeMap::new();
    cluster.insert("kmeans", ClusterAlgorithm::KMeans);
    cluster.insert("agglomerative", ClusterAlgorithm::Agglomerative);

    AlgorithmRegistry {
        decomposition,
        decomposition_aliases,
        cluster,
    }
});

static WARNED_ALIASES: Lazy<Mutex<HashSet<&'static str>>> =
    Lazy::new(|| Mutex::new(HashSet::new()));

impl AlgorithmRegistry {
    pub fn resolve_decomposition(&self, name: &str) -> Result<DecompositionAlgorithm> {
        let canonical = match self.decomposition_aliases.get_key_value(name) {
            Some((&alias, &canonical)) => {
                if let Ok(mut warned) = WARNED_ALIASES.lock() {
                    if warned.insert(alias) {
                        warn!(
                            "algorithm name '{alias}' is deprecated; use '{canonical}' instead"
                        );
                    }
                }
                canonical
            }
            None => name,
        };
        self.decomposition
            .get(canonical)
            .copied()
            .ok_or_else(|| MvaError::UnknownAlgorithm(name.to_string()))
    }

    pub fn resolve_cluster(&self, name: &str) -> Result<ClusterAlgorithm> {
        self.cluster
            .get(name)
            .copied()
            .ok_or_else(|| MvaError::UnknownAlgorithm(name.to_string()))
    }

    pub fn decomposition_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.decomposition.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_names_resolve() {
        assert_eq!(
            DecompositionAlgorithm::parse("svd").unwrap(),
            DecompositionAlgorithm::Svd
        );
        assert_eq!(
            DecompositionAlgorithm::parse("ornmf").unwrap(),
            DecompositionAlgorithm::Ornmf
        );
        assert_eq!(
            ClusterAlgorithm::parse("agglomerative").unwrap(),
            ClusterAlgorithm::Agglomerative
        );
    }

    #[test]
    fn deprecated_aliases_resolve_to_their_replacement() {
        assert_eq!(
            DecompositionAlgorithm::parse("fast_svd").unwrap(),
            DecompositionAlgorithm::Svd
        );
        assert_eq!(
            DecompositionAlgorithm::parse("RPCA_GoDec").unwrap(),
            DecompositionAlgorithm::Rpca
        );
        assert_eq!(
            DecompositionAlgorithm::parse("ORPCA").unwrap(),
            DecompositionAlgorithm::Orpca
        );
    }

    #[test]
    fn unknown_names_are_rejected() {
        assert!(matches!(
            DecompositionAlgorithm::parse("nmf_gpu"),
            Err(MvaError::UnknownAlgorithm(_))
        ));
        assert!(matches!(
            ClusterAlgorithm::parse("dbscan"),
            Err(MvaError::UnknownAlgorithm(_))
        ));
    }

    #[test]
    fn output_dimension_requirement_follows_the_family() {
        assert!(!DecompositionAlgorithm::Svd.requires_output_dimension());
        for alg in [
            DecompositionAlgorithm::Mlpca,
            DecompositionAlgorithm::Rpca,
            DecompositionAlgorithm::Orpca,
            DecompositionAlgorithm::Ornmf,
        ] {
            assert!(alg.requires_output_dimension());
        }
    }
}
