use super::*;
use candle_core::{DType, Device, Result};

fn idx(b: usize, q: usize, k: usize, q_len: usize, k_len: usize) -> usize {
    (b * q_len + q) * k_len + k
}

#[test]
fn sentinel_depends_on_dtype() {
    assert_eq!(fp_min(DType::F16).unwrap(), -32752.0);
    assert_eq!(fp_min(DType::BF16).unwrap(), -32752.0);
    assert_eq!(fp_min(DType::F32).unwrap(), f64::from(f32::MIN) / 2.0);
    assert!(matches!(
        fp_min(DType::U8),
        Err(PerlinError::UnsupportedDType(DType::U8))
    ));
}

#[test]
fn causal_mask_respects_offsets() -> Result<()> {
    let device = Device::Cpu;
    let (q_len, k_len) = (3, 5);
    let mask = build_causal_mask(&device, DType::F32, 1, q_len, k_len).unwrap();
    assert_eq!(mask.dims(), &[1, 1, q_len, k_len]);

    let values = mask.flatten_all()?.to_vec1::<f32>()?;
    let sentinel = f32::MIN / 2.0;
    assert_eq!(values[idx(0, 0, 2, q_len, k_len)], 0.0);
    assert_eq!(values[idx(0, 0, 3, q_len, k_len)], sentinel);
    assert_eq!(values[idx(0, 2, 4, q_len, k_len)], 0.0);
    Ok(())
}

#[test]
fn padding_mask_from_lengths_masks_tail() -> Result<()> {
    let device = Device::Cpu;
    let lengths = [2, 5];
    let (q_len, k_len) = (3, 5);
    let mask = padding_mask_from_lengths(&device, DType::F16, &lengths, q_len, k_len).unwrap();
    assert_eq!(mask.dtype(), DType::F16);

    let values = mask.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(values[idx(0, 1, 1, q_len, k_len)], 0.0);
    assert_eq!(values[idx(0, 1, 2, q_len, k_len)], -32752.0);
    assert!(values[q_len * k_len..].iter().all(|&v| v == 0.0));
    assert_eq!(valid_key_counts(&mask)?, vec![2, 5]);
    Ok(())
}

#[test]
fn combining_masks_stays_two_valued() -> Result<()> {
    let device = Device::Cpu;
    let causal = build_causal_mask(&device, DType::F16, 2, 4, 4).unwrap();
    let padding = padding_mask_from_lengths(&device, DType::F16, &[4, 2], 4, 4).unwrap();
    let combined = combine_masks(&causal, &padding)?;

    let values = combined.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    assert!(values.iter().all(|&v| v == 0.0 || v == -32752.0));
    // Batch 1, last query: only the two unpadded keys stay open.
    let open = (0..4)
        .filter(|&k| values[idx(1, 3, k, 4, 4)] == 0.0)
        .count();
    assert_eq!(open, 2);

    let rebuilt = additive_from_open(&open_positions(&combined)?, DType::F16).unwrap();
    let diff = rebuilt
        .to_dtype(DType::F32)?
        .sub(&combined.to_dtype(DType::F32)?)?
        .abs()?
        .max_all()?
        .to_vec0::<f32>()?;
    assert_eq!(diff, 0.0);
    Ok(())
}
