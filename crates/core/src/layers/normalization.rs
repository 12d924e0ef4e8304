use candle_core::{DType, Module, Result, Tensor, D};
use candle_nn::VarBuilder;

/// Root-mean-square normalization with an optional learned scale and shift.
///
/// `y = x * rsqrt(mean(x^2, last axis) + eps)`, then `y = y * weight + bias`
/// when the affine terms are present. The reduction runs in f32 and the
/// result is cast back to the input dtype. `eps` must be representable in the
/// compute dtype (fp16 needs `eps >= 6e-8`).
#[derive(Clone, Debug)]
pub struct AffineRmsNorm {
    affine: Option<(Tensor, Tensor)>,
    eps: f64,
}

impl AffineRmsNorm {
    pub fn new(weight: Tensor, bias: Tensor, eps: f64) -> Self {
        Self {
            affine: Some((weight, bias)),
            eps,
        }
    }

    /// Normalization without learned parameters.
    pub fn plain(eps: f64) -> Self {
        Self { affine: None, eps }
    }

    pub fn has_affine(&self) -> bool {
        self.affine.is_some()
    }

    pub fn eps(&self) -> f64 {
        self.eps
    }

    pub fn weight(&self) -> Option<&Tensor> {
        self.affine.as_ref().map(|(w, _)| w)
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.affine.as_ref().map(|(_, b)| b)
    }
}

impl Module for AffineRmsNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let dtype = xs.dtype();
        let xf = xs.to_dtype(DType::F32)?;
        let inv_rms = (xf.sqr()?.mean_keepdim(D::Minus1)? + self.eps)?
            .sqrt()?
            .recip()?;
        let normed = xf.broadcast_mul(&inv_rms)?.to_dtype(dtype)?;

        match &self.affine {
            Some((weight, bias)) => normed.broadcast_mul(weight)?.broadcast_add(bias),
            None => Ok(normed),
        }
    }
}

/// Load an affine normalizer (`weight`, `bias` of size `dim`) from `vb`.
pub fn affine_rms_norm(dim: usize, eps: f64, vb: VarBuilder) -> Result<AffineRmsNorm> {
    let weight = vb.get(dim, "weight")?;
    let bias = vb.get(dim, "bias")?;
    Ok(AffineRmsNorm::new(weight, bias, eps))
}
