//! Sample-rate conversion for captured audio.
//!
//! Input devices run at whatever rate the host picks (44.1/48 kHz are
//! common); clips go out at the configured capture rate. A sinc resampler
//! converts the whole recording in fixed-size segments before chunking.

use anyhow::{anyhow, Result};
use rubato::{InterpolationParameters, InterpolationType, Resampler, SincFixedIn, WindowFunction};

const SEGMENT: usize = 256;

/// Resample mono PCM from `source_rate` to `target_rate`. Matching rates
/// pass through untouched. The output length is pinned to the exact rate
/// ratio so downstream chunk timing stays predictable.
pub fn to_rate(input: &[f32], source_rate: u32, target_rate: u32) -> Result<Vec<f32>> {
    if input.is_empty() || source_rate == target_rate {
        return Ok(input.to_vec());
    }
    if source_rate == 0 || target_rate == 0 {
        return Err(anyhow!("sample rates must be nonzero"));
    }

    let ratio = target_rate as f64 / source_rate as f64;
    let params = InterpolationParameters {
        sinc_len: 64,
        f_cutoff: 0.90,
        interpolation: InterpolationType::Cubic,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, SEGMENT, 1)
        .map_err(|e| anyhow!("failed to construct resampler: {e:?}"))?;

    let expected = (input.len() as u64 * target_rate as u64 / source_rate as u64) as usize;
    let mut out = Vec::with_capacity(expected + SEGMENT);
    let mut seg = vec![0.0f32; SEGMENT];
    let mut idx = 0usize;
    while idx < input.len() {
        let end = (idx + SEGMENT).min(input.len());
        let len = end - idx;
        seg[..len].copy_from_slice(&input[idx..end]);
        if len < SEGMENT {
            // Pad the tail segment with its last sample.
            let pad = seg[len - 1];
            for s in &mut seg[len..] {
                *s = pad;
            }
        }
        let produced = resampler
            .process(std::slice::from_ref(&seg), None)
            .map_err(|e| anyhow!("resampling failed: {e:?}"))?;
        out.extend_from_slice(&produced[0]);
        idx = end;
    }

    out.resize(expected, out.last().copied().unwrap_or(0.0));
    Ok(out)
}
