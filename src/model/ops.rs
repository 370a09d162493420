use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

/// Lower bound on row norms so an all-zero row normalizes to zero instead of NaN.
pub const NORM_EPS: f32 = 1e-12;

/// L2-normalizes every row. Returns the normalized rows and the (clamped) norms.
pub fn l2_normalize_rows(x: ArrayView2<'_, f32>) -> (Array2<f32>, Array1<f32>) {
    let norms = x
        .map_axis(Axis(1), |row| row.dot(&row).sqrt())
        .mapv(|n| n.max(NORM_EPS));
    let normalized = &x / &norms.view().insert_axis(Axis(1));
    (normalized, norms)
}

/// Backward pass of [`l2_normalize_rows`].
///
/// For `u = a / |a|`: `da = (du - u (u . du)) / |a|`.
pub fn l2_normalize_backward(
    normalized: ArrayView2<'_, f32>,
    norms: ArrayView1<'_, f32>,
    grad: ArrayView2<'_, f32>,
) -> Array2<f32> {
    let projection = (&normalized * &grad).sum_axis(Axis(1)).insert_axis(Axis(1));
    (&grad - &(&normalized * &projection)) / &norms.insert_axis(Axis(1))
}

/// Dot-product similarity between two row sets: `u @ v^T`.
pub fn similarity(u: ArrayView2<'_, f32>, v: ArrayView2<'_, f32>) -> Array2<f32> {
    u.dot(&v.t())
}
