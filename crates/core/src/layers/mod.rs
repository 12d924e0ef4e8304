pub mod normalization;

pub use normalization::{affine_rms_norm, AffineRmsNorm};
