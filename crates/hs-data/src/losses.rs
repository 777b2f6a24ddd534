//! Loss functions used by training routines, on candle tensors.
//!
//! VAE losses return the total alongside the reconstruction and KL terms.
//! Regression losses follow https://github.com/tuantle/regression-losses-pytorch
//! and average over elements. Every result is a rank-0 tensor, so gradients
//! flow back through it when the inputs are tracked variables.

use candle_core::Tensor;
use candle_nn as nn;
use hs_types::{DataError, HsError, HsResult};

/// Total loss with its reconstruction and KL-divergence terms.
#[derive(Debug, Clone)]
pub struct VaeLoss {
    pub total: Tensor,
    pub reconstruction: Tensor,
    pub kld: Tensor,
}

fn tensor_err(e: candle_core::Error) -> HsError {
    DataError::Tensor {
        message: e.to_string(),
    }
    .into()
}

fn check_shape(expected: &Tensor, actual: &Tensor) -> HsResult<()> {
    if expected.dims() != actual.dims() {
        return Err(DataError::ShapeMismatch {
            expected: format!("{:?}", expected.dims()),
            actual: format!("{:?}", actual.dims()),
        }
        .into());
    }
    Ok(())
}

fn bce_terms(recon: &Tensor, target: &Tensor) -> candle_core::Result<Tensor> {
    // log terms are clamped at -100
    let log_r = recon.log()?.maximum(-100.0)?;
    let log_1r = recon.affine(-1.0, 1.0)?.log()?.maximum(-100.0)?;
    let pos = target.mul(&log_r)?;
    let neg = target.affine(-1.0, 1.0)?.mul(&log_1r)?;
    pos.add(&neg)?.sum_all()?.neg()
}

/// Summed binary cross entropy.
pub fn bce_sum(recon: &Tensor, target: &Tensor) -> HsResult<Tensor> {
    check_shape(target, recon)?;
    bce_terms(recon, target).map_err(tensor_err)
}

/// Summed squared error.
pub fn mse_sum(recon: &Tensor, target: &Tensor) -> HsResult<Tensor> {
    check_shape(target, recon)?;
    recon
        .sub(target)
        .and_then(|diff| diff.sqr())
        .and_then(|sq| sq.sum_all())
        .map_err(tensor_err)
}

fn kld_terms(mu: &Tensor, logvar: &Tensor) -> candle_core::Result<Tensor> {
    let inner = logvar
        .affine(1.0, 1.0)?
        .sub(&mu.sqr()?)?
        .sub(&logvar.exp()?)?;
    inner.sum_all()?.affine(-0.5, 0.0)
}

/// KL divergence of N(mu, exp(logvar)) from N(0, 1), summed.
pub fn kl_divergence(mu: &Tensor, logvar: &Tensor) -> HsResult<Tensor> {
    check_shape(mu, logvar)?;
    kld_terms(mu, logvar).map_err(tensor_err)
}

fn weighted(reconstruction: Tensor, kld: Tensor, alpha: f64, kld_scale: f64) -> HsResult<VaeLoss> {
    let total = reconstruction
        .affine(alpha, 0.0)
        .and_then(|r| r.add(&kld.affine(kld_scale, 0.0)?))
        .map_err(tensor_err)?;
    Ok(VaeLoss {
        total,
        reconstruction,
        kld,
    })
}

/// BCE + KLD.
pub fn vae_loss(recon: &Tensor, target: &Tensor, mu: &Tensor, logvar: &Tensor) -> HsResult<VaeLoss> {
    let reconstruction = bce_sum(recon, target)?;
    let kld = kl_divergence(mu, logvar)?;
    weighted(reconstruction, kld, 1.0, 1.0)
}

/// `alpha * BCE + kld_weight * gamma * KLD`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SymmetricCe {
    pub alpha: f64,
    pub gamma: f64,
    pub kld_weight: f64,
}

impl SymmetricCe {
    pub fn new(alpha: f64, gamma: f64) -> Self {
        Self::with_kld_weight(alpha, gamma, 1.0)
    }

    pub fn with_kld_weight(alpha: f64, gamma: f64, kld_weight: f64) -> Self {
        tracing::info!(
            "Loaded Symmetric Cross Entropy loss with alpha = {}, gamma = {}, and kld_weight = {}",
            alpha,
            gamma,
            kld_weight
        );
        Self {
            alpha,
            gamma,
            kld_weight,
        }
    }

    pub fn loss(&self, recon: &Tensor, target: &Tensor, mu: &Tensor, logvar: &Tensor) -> HsResult<VaeLoss> {
        let reconstruction = bce_sum(recon, target)?;
        let kld = kl_divergence(mu, logvar)?;
        weighted(reconstruction, kld, self.alpha, self.kld_weight * self.gamma)
    }
}

/// `alpha * MSE + kld_weight * gamma * KLD`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SymmetricMse {
    pub alpha: f64,
    pub gamma: f64,
    pub kld_weight: f64,
}

impl SymmetricMse {
    pub fn new(alpha: f64, gamma: f64) -> Self {
        Self::with_kld_weight(alpha, gamma, 1.0)
    }

    pub fn with_kld_weight(alpha: f64, gamma: f64, kld_weight: f64) -> Self {
        tracing::info!(
            "Loaded Symmetric MSE loss with alpha = {}, gamma = {}, and kld_weight = {}",
            alpha,
            gamma,
            kld_weight
        );
        Self {
            alpha,
            gamma,
            kld_weight,
        }
    }

    pub fn loss(&self, recon: &Tensor, target: &Tensor, mu: &Tensor, logvar: &Tensor) -> HsResult<VaeLoss> {
        let reconstruction = mse_sum(recon, target)?;
        let kld = kl_divergence(mu, logvar)?;
        weighted(reconstruction, kld, self.alpha, self.kld_weight * self.gamma)
    }
}

fn mean_of_errors(
    y: &Tensor,
    y_hat: &Tensor,
    f: impl Fn(&Tensor) -> candle_core::Result<Tensor>,
) -> HsResult<Tensor> {
    check_shape(y, y_hat)?;
    y.sub(y_hat)
        .and_then(|e| f(&e))
        .and_then(|per_elem| per_elem.mean_all())
        .map_err(tensor_err)
}

/// mean(log(cosh(y - y_hat + 1e-12)))
pub fn log_cosh(y: &Tensor, y_hat: &Tensor) -> HsResult<Tensor> {
    mean_of_errors(y, y_hat, |e| {
        let e = e.affine(1.0, 1e-12)?;
        let cosh = e.exp()?.add(&e.neg()?.exp()?)?.affine(0.5, 0.0)?;
        cosh.log()
    })
}

/// mean(e * tanh(e))
pub fn xtanh(y: &Tensor, y_hat: &Tensor) -> HsResult<Tensor> {
    mean_of_errors(y, y_hat, |e| e.mul(&e.tanh()?))
}

/// mean(2e / (1 + exp(-e)) - e)
pub fn xsigmoid(y: &Tensor, y_hat: &Tensor) -> HsResult<Tensor> {
    mean_of_errors(y, y_hat, |e| {
        e.mul(&nn::ops::sigmoid(e)?)?.affine(2.0, 0.0)?.sub(e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    const EPS: f64 = 1e-9;

    fn t(values: &[f64]) -> Tensor {
        Tensor::new(values, &Device::Cpu).unwrap()
    }

    fn scalar(tensor: &Tensor) -> f64 {
        tensor.to_scalar::<f64>().unwrap()
    }

    #[test]
    fn bce_matches_hand_computation() {
        let loss = bce_sum(&t(&[0.5, 0.9]), &t(&[1.0, 0.0])).unwrap();
        let expected = -(0.5f64.ln()) - (0.1f64.ln());
        assert!((scalar(&loss) - expected).abs() < EPS);
    }

    #[test]
    fn bce_clamps_log_of_zero() {
        let loss = bce_sum(&t(&[0.0]), &t(&[1.0])).unwrap();
        assert!((scalar(&loss) - 100.0).abs() < EPS);
    }

    #[test]
    fn kld_vanishes_for_standard_normal() {
        let kld = kl_divergence(&t(&[0.0, 0.0]), &t(&[0.0, 0.0])).unwrap();
        assert!(scalar(&kld).abs() < EPS);
        let kld = kl_divergence(&t(&[1.0]), &t(&[0.0])).unwrap();
        assert!((scalar(&kld) - 0.5).abs() < EPS);
    }

    #[test]
    fn vae_loss_sums_terms() {
        let loss = vae_loss(&t(&[0.5]), &t(&[1.0]), &t(&[1.0]), &t(&[0.0])).unwrap();
        let sum = scalar(&loss.reconstruction) + scalar(&loss.kld);
        assert!((scalar(&loss.total) - sum).abs() < EPS);
    }

    #[test]
    fn symmetric_losses_weight_terms() {
        let ce = SymmetricCe::with_kld_weight(2.0, 3.0, 0.5);
        let loss = ce.loss(&t(&[0.5]), &t(&[1.0]), &t(&[1.0]), &t(&[0.0])).unwrap();
        let expected = 2.0 * 0.5f64.ln().abs() + 0.5 * 3.0 * 0.5;
        assert!((scalar(&loss.total) - expected).abs() < EPS);

        let mse = SymmetricMse::new(1.0, 2.0);
        let loss = mse
            .loss(&t(&[1.0, 2.0]), &t(&[0.0, 0.0]), &t(&[1.0]), &t(&[0.0]))
            .unwrap();
        assert!((scalar(&loss.reconstruction) - 5.0).abs() < EPS);
        assert!((scalar(&loss.total) - (5.0 + 2.0 * 0.5)).abs() < EPS);
    }

    #[test]
    fn regression_losses() {
        let y = t(&[1.0, -2.0, 0.5]);
        let y_hat = t(&[0.0, 0.0, 0.5]);

        let lc = |e: f64| (e + 1e-12).cosh().ln();
        let expected = (lc(1.0) + lc(-2.0) + lc(0.0)) / 3.0;
        assert!((scalar(&log_cosh(&y, &y_hat).unwrap()) - expected).abs() < EPS);

        let expected = (1.0f64.tanh() + 2.0 * 2.0f64.tanh()) / 3.0;
        assert!((scalar(&xtanh(&y, &y_hat).unwrap()) - expected).abs() < EPS);

        let xs = |e: f64| 2.0 * e / (1.0 + (-e).exp()) - e;
        let expected = (xs(1.0) + xs(-2.0) + xs(0.0)) / 3.0;
        assert!((scalar(&xsigmoid(&y, &y_hat).unwrap()) - expected).abs() < EPS);

        assert_eq!(scalar(&xtanh(&y, &y).unwrap()), 0.0);
    }

    #[test]
    fn batched_inputs_reduce_to_a_scalar() {
        let recon = Tensor::new(&[[0.2f64, 0.8], [0.6, 0.4]], &Device::Cpu).unwrap();
        let target = Tensor::new(&[[0.0f64, 1.0], [1.0, 0.0]], &Device::Cpu).unwrap();
        let loss = mse_sum(&recon, &target).unwrap();
        assert!(loss.dims().is_empty());
        assert!((scalar(&loss) - (0.04 + 0.04 + 0.16 + 0.16)).abs() < EPS);
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        assert!(matches!(
            log_cosh(&t(&[1.0, 2.0]), &t(&[1.0])),
            Err(HsError::Data(DataError::ShapeMismatch { .. }))
        ));
        assert!(kl_divergence(&t(&[1.0]), &t(&[])).is_err());
    }
}
