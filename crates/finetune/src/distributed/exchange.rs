use candle_core::{DType, Device, Tensor};

use super::ProcessContext;
use crate::TrainingError;

/// Concatenates every worker's `tensor` along dim 0 in rank order.
///
/// Floating tensors travel as f32 and integer tensors as i64; the result keeps
/// the input dtype and device. Workers may contribute different row counts but
/// must agree on the trailing dimensions. With a single worker the input is
/// returned unchanged.
pub fn all_gather_tensor(ctx: &ProcessContext, tensor: &Tensor) -> Result<Tensor, TrainingError> {
    if ctx.world_size() == 1 {
        return Ok(tensor.clone());
    }

    let dims = tensor.dims();
    if dims.is_empty() {
        return Err(TrainingError::distributed(
            "all-gather requires a tensor with a leading row dimension",
        ));
    }
    let row_shape = dims[1..].to_vec();
    let dtype = tensor.dtype();
    let device = tensor.device();

    let parts = if dtype.is_float() {
        let values = tensor
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        ctx.all_gather_f32(values)?
            .into_iter()
            .map(|values| rebuild(values, &row_shape, device))
            .collect::<Result<Vec<_>, _>>()?
    } else {
        let values = tensor
            .to_dtype(DType::I64)?
            .flatten_all()?
            .to_vec1::<i64>()?;
        ctx.all_gather_i64(values)?
            .into_iter()
            .map(|values| rebuild(values, &row_shape, device))
            .collect::<Result<Vec<_>, _>>()?
    };

    Ok(Tensor::cat(&parts, 0)?.to_dtype(dtype)?)
}

fn rebuild<T: candle_core::WithDType>(
    values: Vec<T>,
    row_shape: &[usize],
    device: &Device,
) -> Result<Tensor, TrainingError> {
    let row_len: usize = row_shape.iter().product();
    if row_len == 0 || values.len() % row_len != 0 {
        return Err(TrainingError::distributed(format!(
            "gathered {} values cannot be split into rows of shape {:?}",
            values.len(),
            row_shape
        )));
    }
    let mut shape = Vec::with_capacity(row_shape.len() + 1);
    shape.push(values.len() / row_len);
    shape.extend_from_slice(row_shape);
    Ok(Tensor::from_vec(values, shape, device)?)
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;
    use crate::distributed::LocalGroup;

    #[test]
    fn single_worker_gather_is_identity() {
        let ctx = ProcessContext::solo(0);
        let tensor = Tensor::new(&[[1.5f32, -2.0], [3.0, 4.25]], &Device::Cpu).unwrap();

        let gathered = all_gather_tensor(&ctx, &tensor).unwrap();

        assert_eq!(gathered.dims(), tensor.dims());
        assert_eq!(
            gathered.to_vec2::<f32>().unwrap(),
            tensor.to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn gather_concatenates_rows_in_rank_order() {
        let members = LocalGroup::create(2).unwrap();
        let handles: Vec<_> = members
            .into_iter()
            .map(|member| {
                thread::spawn(move || {
                    let ctx = ProcessContext::new(Arc::new(member), 0);
                    let base = ctx.rank() as i64 * 10;
                    let tokens =
                        Tensor::new(&[[base, base + 1], [base + 2, base + 3]], &Device::Cpu)
                            .unwrap();
                    let logps = Tensor::new(&[ctx.rank() as f32 - 0.5], &Device::Cpu).unwrap();
                    (
                        all_gather_tensor(&ctx, &tokens).unwrap(),
                        all_gather_tensor(&ctx, &logps).unwrap(),
                    )
                })
            })
            .collect();

        for handle in handles {
            let (tokens, logps) = handle.join().unwrap();
            assert_eq!(tokens.dtype(), DType::I64);
            assert_eq!(
                tokens.to_vec2::<i64>().unwrap(),
                vec![vec![0, 1], vec![2, 3], vec![10, 11], vec![12, 13]]
            );
            assert_eq!(logps.to_vec1::<f32>().unwrap(), vec![-0.5, 0.5]);
        }
    }
}
