//! Exclusion masks and the row/column selection they induce.
//!
//! Masks arrive in the native per-axis shape with `true` meaning "exclude
//! this position". Internally they become a [`Selector`]: either the
//! slice-everything sentinel or an explicit list of kept flat indices, so
//! the unmasked fast path never copies the data.

use ndarray::{Array2, ArrayD, ArrayView2, Axis};

use crate::error::{MvaError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// Nothing excluded; operate on the full axis.
    All,
    /// Flat indices (in native iteration order) to keep.
    Keep(Vec<usize>),
}

impl Selector {
    /// Builds a selector from an optional exclusion mask.
    ///
    /// The mask shape must equal `axis_shape` exactly; no broadcasting.
    pub fn from_mask(
        mask: Option<&ArrayD<bool>>,
        axis_shape: &[usize],
        name: &'static str,
    ) -> Result<Self> {
        let mask = match mask {
            Some(m) => m,
            None => return Ok(Selector::All),
        };
        if mask.shape() != axis_shape {
            return Err(MvaError::ShapeMismatch {
                name,
                expected: format!("{axis_shape:?}"),
                actual: format!("{:?}", mask.shape()),
            });
        }
        let kept: Vec<usize> = mask
            .iter()
            .enumerate()
            .filter_map(|(i, excluded)| (!excluded).then_some(i))
            .collect();
        Ok(Selector::Keep(kept))
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Selector::All)
    }

    /// Number of kept positions on an axis of the given extent.
    pub fn count(&self, extent: usize) -> usize {
        match self {
            Selector::All => extent,
            Selector::Keep(idx) => idx.len(),
        }
    }

    /// Kept flat indices, materialized.
    pub fn indices(&self, extent: usize) -> Vec<usize> {
        match self {
            Selector::All => (0..extent).collect(),
            Selector::Keep(idx) => idx.clone(),
        }
    }

    pub fn select_rows(&self, data: &ArrayView2<'_, f64>) -> Array2<f64> {
        match self {
            Selector::All => data.to_owned(),
            Selector::Keep(idx) => data.select(Axis(0), idx),
        }
    }

    pub fn select_cols(&self, data: &ArrayView2<'_, f64>) -> Array2<f64> {
        match self {
            Selector::All => data.to_owned(),
            Selector::Keep(idx) => data.select(Axis(1), idx),
        }
    }
}

/// Applies a navigation (row) and a signal (column) selector in one pass.
pub fn masked_submatrix(
    data: &ArrayView2<'_, f64>,
    navigation: &Selector,
    signal: &Selector,
) -> Array2<f64> {
    match (navigation, signal) {
        (Selector::All, Selector::All) => data.to_owned(),
        (Selector::Keep(rows), Selector::All) => data.select(Axis(0), rows),
        (Selector::All, Selector::Keep(cols)) => data.select(Axis(1), cols),
        (Selector::Keep(rows), Selector::Keep(cols)) => {
            data.select(Axis(0), rows).select(Axis(1), cols)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, ArrayD, IxDyn};

    #[test]
    fn missing_mask_selects_everything() {
        let sel = Selector::from_mask(None, &[4], "navigation_mask").unwrap();
        assert!(sel.is_all());
        assert_eq!(sel.count(4), 4);
    }

    #[test]
    fn mask_shape_must_match_axis_shape() {
        let mask = ArrayD::from_elem(IxDyn(&[3]), false);
        let err = Selector::from_mask(Some(&mask), &[4], "signal_mask").unwrap_err();
        assert!(matches!(err, MvaError::ShapeMismatch { name: "signal_mask", .. }));
    }

    #[test]
    fn true_means_exclude() {
        let mask = ArrayD::from_shape_vec(IxDyn(&[4]), vec![false, true, false, true]).unwrap();
        let sel = Selector::from_mask(Some(&mask), &[4], "navigation_mask").unwrap();
        assert_eq!(sel, Selector::Keep(vec![0, 2]));
    }

    #[test]
    fn doubly_masked_submatrix() {
        let data = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0], [7.0, 8.0, 9.0]];
        let rows = Selector::Keep(vec![0, 2]);
        let cols = Selector::Keep(vec![1]);
        let sub = masked_submatrix(&data.view(), &rows, &cols);
        assert_eq!(sub, array![[2.0], [8.0]]);
    }

    #[test]
    fn multidimensional_mask_flattens_in_native_order() {
        let mask =
            ArrayD::from_shape_vec(IxDyn(&[2, 2]), vec![false, true, true, false]).unwrap();
        let sel = Selector::from_mask(Some(&mask), &[2, 2], "navigation_mask").unwrap();
        assert_eq!(sel, Selector::Keep(vec![0, 3]));
    }
}
