/// Gradient clipping by global L2 norm
use candle_core::backprop::GradStore;
use candle_core::{DType, Var};

/// Clip gradients by global norm
///
/// Computes the L2 norm over all parameter gradients together and, if it
/// exceeds `max_norm`, scales every gradient by `max_norm / total_norm`.
///
/// # Returns
/// The global norm before clipping
pub fn clip_grad_norm(
    params: &[(String, Var)],
    grads: &mut GradStore,
    max_norm: f64,
) -> crate::Result<f64> {
    let mut total_norm_sq = 0.0f64;
    for (_, var) in params {
        if let Some(grad) = grads.get(var.as_tensor()) {
            let sq = grad.sqr()?.sum_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
            total_norm_sq += sq;
        }
    }
    let total_norm = total_norm_sq.sqrt();

    if total_norm > max_norm {
        let clip_coef = max_norm / total_norm;
        for (_, var) in params {
            if let Some(grad) = grads.remove(var.as_tensor()) {
                grads.insert(var.as_tensor(), grad.affine(clip_coef, 0.0)?);
            }
        }
        log::debug!("Clipped gradient norm {:.3} to {:.3}", total_norm, max_norm);
    }

    Ok(total_norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};

    fn setup(coeffs: &[f32]) -> crate::Result<(Vec<(String, Var)>, GradStore)> {
        let device = Device::Cpu;
        let w = Var::zeros(coeffs.len(), DType::F32, &device)?;
        let c = Tensor::from_slice(coeffs, coeffs.len(), &device)?;
        // d/dw sum(w * c) = c
        let grads = w.as_tensor().mul(&c)?.sum_all()?.backward()?;
        Ok((vec![("w".to_string(), w)], grads))
    }

    fn grad_values(params: &[(String, Var)], grads: &GradStore) -> Vec<f32> {
        grads.get(params[0].1.as_tensor()).unwrap().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn test_clip_scales_to_max_norm() -> crate::Result<()> {
        // norm(1200, 1600) = 2000
        let (params, mut grads) = setup(&[1200.0, 1600.0])?;

        let norm = clip_grad_norm(&params, &mut grads, 1000.0)?;
        assert!((norm - 2000.0).abs() < 1e-6);

        let g = grad_values(&params, &grads);
        let clipped = ((g[0] as f64).powi(2) + (g[1] as f64).powi(2)).sqrt();
        assert!((clipped - 1000.0).abs() < 1e-3);
        // Uniform scaling keeps the direction
        assert!((g[0] - 600.0).abs() < 1e-3);
        assert!((g[1] - 800.0).abs() < 1e-3);
        Ok(())
    }

    #[test]
    fn test_clip_is_noop_below_threshold() -> crate::Result<()> {
        let (params, mut grads) = setup(&[3.0, 4.0])?;

        let norm = clip_grad_norm(&params, &mut grads, 1000.0)?;
        assert!((norm - 5.0).abs() < 1e-6);
        assert_eq!(grad_values(&params, &grads), vec![3.0, 4.0]);
        Ok(())
    }

    #[test]
    fn test_global_norm_spans_parameters() -> crate::Result<()> {
        let device = Device::Cpu;
        let a = Var::zeros(1, DType::F32, &device)?;
        let b = Var::zeros(1, DType::F32, &device)?;
        let loss = ((a.as_tensor() * 3.0)? + (b.as_tensor() * 4.0)?)?.sum_all()?;
        let mut grads = loss.backward()?;
        let params = vec![("a".to_string(), a), ("b".to_string(), b)];

        let norm = clip_grad_norm(&params, &mut grads, 1.0)?;
        assert!((norm - 5.0).abs() < 1e-6);

        let ga = grads.get(params[0].1.as_tensor()).unwrap().to_vec1::<f32>()?[0];
        let gb = grads.get(params[1].1.as_tensor()).unwrap().to_vec1::<f32>()?[0];
        assert!((ga - 0.6).abs() < 1e-6);
        assert!((gb - 0.8).abs() < 1e-6);
        Ok(())
    }
}
