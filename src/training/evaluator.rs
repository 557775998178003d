/// Mean absolute error under EMA weights
use candle_core::{DType, Device, Var};

use super::ema::ParameterShadow;
use crate::data::BatchDataLoader;
use crate::models::PropertyModel;
use crate::TrainError;

/// Sum of `|prediction - target|` over every molecule the loader yields,
/// with the model in evaluation mode and its current weights
pub fn absolute_error_sum<M: PropertyModel + ?Sized>(
    model: &M,
    loader: &mut dyn BatchDataLoader,
    device: &Device,
) -> crate::Result<f64> {
    loader.reset();
    let mut error = 0.0f64;
    while let Some(batch) = loader.next_batch(device)? {
        let output = model.forward_t(&batch, false)?.detach();
        let diff = output.sub(&batch.targets)?.abs()?.sum_all()?;
        error += diff.to_dtype(DType::F64)?.to_scalar::<f64>()?;
    }
    Ok(error)
}

/// Evaluate the model with its shadow weights swapped in
///
/// Live weights are restored before returning, on success or error. Neither
/// optimizer nor schedule state is touched.
///
/// # Returns
/// Total absolute error divided by the loader's dataset size
pub fn evaluate<M: PropertyModel + ?Sized>(
    model: &M,
    shadow: &mut ParameterShadow,
    params: &[(String, Var)],
    loader: &mut dyn BatchDataLoader,
    device: &Device,
) -> crate::Result<f64> {
    let len = loader.dataset_len();
    if len == 0 {
        return Err(TrainError::Data("cannot evaluate on an empty dataset".to_string()));
    }

    let guard = shadow.swap_in(params)?;
    let error = absolute_error_sum(model, loader, device);
    guard.finish()?;

    Ok(error? / len as f64)
}
