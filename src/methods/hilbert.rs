// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The Hilbert transform: a 90 degree phase shift applied segment-wise
//! across a power-of-two DFT buffer.

use std::fmt;

use num_complex::Complex64;

use crate::spectral::{fft_forward, fft_inverse, next_pow2};
use crate::ts::{Segment, TimeSeries};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Hilbert;

impl Hilbert {
    pub fn apply(&self, ts: &mut TimeSeries) {
        for seg in ts.segments_mut() {
            self.apply_segment(seg);
        }
    }

    pub fn apply_segment(&self, seg: &mut Segment) {
        hilbert_in_place(seg.data_mut());
    }
}

impl fmt::Display for Hilbert {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Hilbert transform.")
    }
}

/// Replace `data` with its Hilbert transform: multiply the spectrum by
/// `-i*sign(f)`, which zeroes DC and Nyquist and shifts every other
/// component by 90 degrees.
fn hilbert_in_place(data: &mut [f32]) {
    let npts = data.len();
    if npts < 2 {
        return;
    }
    let np2 = next_pow2(npts);
    let n2 = np2 / 2;

    let mut buf = vec![Complex64::new(0.0, 0.0); np2];
    for (b, &d) in buf.iter_mut().zip(data.iter()) {
        b.re = f64::from(d);
    }
    fft_forward(&mut buf);

    buf[0] = Complex64::new(0.0, 0.0);
    buf[n2] = Complex64::new(0.0, 0.0);
    let minus_i = Complex64::new(0.0, -1.0);
    let plus_i = Complex64::new(0.0, 1.0);
    for j in 1..n2 {
        buf[j] *= minus_i;
        buf[np2 - j] *= plus_i;
    }

    fft_inverse(&mut buf);
    for (d, b) in data.iter_mut().zip(buf.iter()) {
        *d = b.re as f32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use crate::constants::PI;

    #[test]
    fn test_cosine_becomes_sine() {
        // H{cos} = sin for a periodic tone that fits the DFT length.
        let n = 256;
        let cycles = 8.0;
        let mut data: Vec<f32> = (0..n)
            .map(|i| (2.0 * PI * cycles * i as f64 / n as f64).cos() as f32)
            .collect();
        hilbert_in_place(&mut data);
        for (i, &v) in data.iter().enumerate() {
            let expect = (2.0 * PI * cycles * i as f64 / n as f64).sin();
            assert_abs_diff_eq!(f64::from(v), expect, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_dc_removed() {
        let mut data = vec![3.0f32; 128];
        hilbert_in_place(&mut data);
        for &v in &data {
            assert_abs_diff_eq!(f64::from(v), 0.0, epsilon = 1e-6);
        }
    }
}
