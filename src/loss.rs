//! Symmetric contrastive objective and retrieval accuracy over a similarity matrix.
//!
//! Row `i` of the similarity matrix scores image `i` against every embedding in
//! the batch; the ground truth is the identity permutation.

use ndarray::{Array2, ArrayView2, Axis};

use crate::error::{Error, Result};

/// Both halves of the symmetric loss and their mean.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContrastiveLoss {
    /// Mean of the two halves; the optimized value.
    pub loss: f32,
    /// Cross-entropy with images as queries (rows).
    pub vision_loss: f32,
    /// Cross-entropy with embeddings as queries (columns).
    pub location_loss: f32,
}

impl ContrastiveLoss {
    pub fn is_finite(&self) -> bool {
        self.loss.is_finite()
    }
}

fn check_square(similarity: &ArrayView2<'_, f32>) -> Result<usize> {
    let (rows, cols) = similarity.dim();
    if rows != cols {
        return Err(Error::ShapeMismatch {
            a: "similarity columns",
            b: "similarity rows",
            expected: rows,
            got: cols,
        });
    }
    if rows == 0 {
        return Err(Error::ShapeMismatch {
            a: "similarity rows",
            b: "minimum batch",
            expected: 1,
            got: 0,
        });
    }
    Ok(rows)
}

/// Mean cross-entropy of each row against label `row index`, plus the row softmax.
fn diagonal_cross_entropy(logits: ArrayView2<'_, f32>) -> (f32, Array2<f32>) {
    let n = logits.nrows();
    let mut probs = Array2::<f32>::zeros(logits.raw_dim());
    let mut total = 0.0f64;

    for (i, (row, mut out)) in logits
        .axis_iter(Axis(0))
        .zip(probs.axis_iter_mut(Axis(0)))
        .enumerate()
    {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        let sum: f32 = row.iter().map(|&v| (v - max).exp()).sum();
        let log_sum_exp = max + sum.ln();

        total += f64::from(log_sum_exp - row[i]);
        out.assign(&row.mapv(|v| (v - log_sum_exp).exp()));
    }

    ((total / n as f64) as f32, probs)
}

/// Symmetric cross-entropy: rows as queries and columns as queries, averaged.
pub fn contrastive_loss(similarity: ArrayView2<'_, f32>) -> Result<ContrastiveLoss> {
    Ok(contrastive_loss_with_grad(similarity)?.0)
}

/// The loss together with its gradient w.r.t. every similarity entry.
pub fn contrastive_loss_with_grad(
    similarity: ArrayView2<'_, f32>,
) -> Result<(ContrastiveLoss, Array2<f32>)> {
    let n = check_square(&similarity)?;

    let (vision_loss, row_probs) = diagonal_cross_entropy(similarity);
    let (location_loss, col_probs) = diagonal_cross_entropy(similarity.t());

    // d/dS of each half is (softmax - I) / N; the column half is transposed back.
    let eye = Array2::<f32>::eye(n);
    let scale = 0.5 / n as f32;
    let grad = ((row_probs - &eye) + (col_probs - &eye).t()) * scale;

    let loss = ContrastiveLoss {
        loss: 0.5 * (vision_loss + location_loss),
        vision_loss,
        location_loss,
    };
    Ok((loss, grad))
}

/// Fraction of rows whose argmax is the row's own index. Ties go to the lowest index.
pub fn accuracy(similarity: ArrayView2<'_, f32>) -> f32 {
    let n = similarity.nrows();
    if n == 0 {
        return 0.0;
    }

    let hits = similarity
        .axis_iter(Axis(0))
        .enumerate()
        .filter(|(i, row)| argmax(row.iter().copied()) == Some(*i))
        .count();

    hits as f32 / n as f32
}

fn argmax<I: Iterator<Item = f32>>(values: I) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (idx, v) in values.enumerate() {
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((idx, v)),
        }
    }
    best.map(|(idx, _)| idx)
}
