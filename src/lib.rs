// Multivariate analysis for hyperspectral datasets

#![doc = include_str!("../README.md")]

pub mod agglomerative;
pub mod bss;
pub mod clustering;
pub mod dataset;
pub mod decomposition;
pub mod elbow;
pub mod error;
pub mod estimator;
pub mod fastica;
pub mod kmeans;
pub mod linalg;
pub mod mask;
pub mod metrics;
pub mod mlpca;
pub mod ornmf;
pub mod orthomax;
pub mod registry;
pub mod results;
pub mod rpca;
pub mod scaling;
pub mod svd_pca;
pub mod whitening;

pub use bss::{BssAlgorithm, BssOptions, NormalizationTarget, ReverseCriterion};
pub use clustering::{ClusterMetric, ClusterOptions, ClusterSweepOptions};
pub use dataset::{ComponentSelection, Dataset};
pub use decomposition::{Algorithm, DecompositionOptions, Reproject};
pub use error::{MvaError, Result};
pub use estimator::{DecompositionOutput, Estimator};
pub use fastica::FastIca;
pub use registry::{ClusterAlgorithm, DecompositionAlgorithm};
pub use results::{ClusterCount, LearningResults};
pub use scaling::{Scaler, Scaling};
pub use svd_pca::Centre;
pub use whitening::WhitenMethod;
