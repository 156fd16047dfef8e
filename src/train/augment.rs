//! Random-shift image augmentation
//!
//! Image observations are stored flattened as `C * H * W` columns. A shift
//! pads every image by a few edge pixels and crops a window of the original
//! size at a random offset, so each sample moves by up to `pad` pixels in
//! both directions.

use rand::Rng;
use tch::Tensor;

/// Pixels of padding for an `h x w` image: 5% of the short side, at least 1
pub fn shift_padding(h: i64, w: i64) -> i64 {
    (h.min(w) / 20).max(1)
}

/// Randomly shifted copy of flattened `[C, H, W]` observations
///
/// `observations` has shape `[B, C * H * W]`; the result has the same shape
/// and device. Borders are filled by replicating the edge pixels.
pub fn random_shift<R: Rng + ?Sized>(observations: &Tensor, shape: [i64; 3], rng: &mut R) -> Tensor {
    let [c, h, w] = shape;
    let batch = observations.size()[0];
    let pad = shift_padding(h, w);
    let padded =
        observations.view([batch, c, h, w]).replication_pad2d([pad, pad, pad, pad].as_slice());

    let crops: Vec<Tensor> = (0..batch)
        .map(|i| {
            let dy = rng.gen_range(0..=2 * pad);
            let dx = rng.gen_range(0..=2 * pad);
            padded.get(i).narrow(1, dy, h).narrow(2, dx, w)
        })
        .collect();
    Tensor::stack(&crops, 0).view([batch, c * h * w])
}
