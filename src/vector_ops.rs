use crate::config::{Number, EPSILON};
use wide::f32x8;

const LANES: usize = 8;

/// Squared Euclidean distance using SIMD lanes of eight.
///
/// On unit vectors this equals `2 - 2 * cos(a, b)`, so ranking by it is the
/// same as ranking by cosine similarity. Returns `None` on a length mismatch.
pub fn squared_l2_distance_simd(a: &[Number], b: &[Number]) -> Option<Number> {
    if a.len() != b.len() {
        return None;
    }

    let a_lanes = a.chunks_exact(LANES);
    let b_lanes = b.chunks_exact(LANES);
    let tail: Number = a_lanes
        .remainder()
        .iter()
        .zip(b_lanes.remainder())
        .map(|(x, y)| (x - y) * (x - y))
        .sum();

    let mut acc = f32x8::splat(0.0);
    for (xa, xb) in a_lanes.zip(b_lanes) {
        let diff = f32x8::from(lanes(xa)) - f32x8::from(lanes(xb));
        acc += diff * diff;
    }

    Some(acc.reduce_add() + tail)
}

fn lanes(slice: &[Number]) -> [Number; LANES] {
    let mut out = [0.0; LANES];
    out.copy_from_slice(slice);
    out
}

pub fn l2_norm(vector: &[Number]) -> Number {
    vector.iter().map(|&x| x * x).sum::<Number>().sqrt()
}

/// Scales `vector` to unit length. Returns false, leaving it untouched, when
/// the magnitude is too small to normalize.
pub fn normalize_vector(vector: &mut [Number]) -> bool {
    let magnitude = l2_norm(vector);
    if magnitude > EPSILON {
        for x in vector.iter_mut() {
            *x /= magnitude;
        }
        true
    } else {
        false
    }
}
