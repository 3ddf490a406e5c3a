// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Shared spectral plumbing: padded FFT conventions, the frequency-domain
//! subsample shift, and the little time-domain conditioners (linear
//! detrend, cosine edge taper) that precede every transform.

use num_complex::Complex64;
use rustfft::FftPlanner;

use crate::constants::PI;

/// Smallest power of two >= `n` (and >= 2).
pub(crate) fn next_pow2(n: usize) -> usize {
    let mut np2 = 2;
    while np2 < n {
        np2 *= 2;
    }
    np2
}

/// In-place forward complex FFT.
pub(crate) fn fft_forward(buf: &mut [Complex64]) {
    let mut planner = FftPlanner::new();
    planner.plan_fft_forward(buf.len()).process(buf);
}

/// In-place inverse complex FFT, scaled by 1/N so that
/// `fft_inverse(fft_forward(x)) == x`.
pub(crate) fn fft_inverse(buf: &mut [Complex64]) {
    let mut planner = FftPlanner::new();
    planner.plan_fft_inverse(buf.len()).process(buf);
    let scale = 1.0 / buf.len() as f64;
    for v in buf.iter_mut() {
        *v *= scale;
    }
}

/// Remove the least-squares line `c0 + c1*t` (t = i*dt) from `data`.
pub(crate) fn detrend_linear(data: &mut [f64], dt: f64) {
    let n = data.len();
    if n < 2 {
        return;
    }
    // Closed-form simple linear regression on the abscissae 0, dt, 2*dt, ...
    let nf = n as f64;
    let t_mean = dt * (nf - 1.0) / 2.0;
    let y_mean = data.iter().sum::<f64>() / nf;
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    for (i, y) in data.iter().enumerate() {
        let x = i as f64 * dt - t_mean;
        sxy += x * (y - y_mean);
        sxx += x * x;
    }
    let c1 = if sxx > 0.0 { sxy / sxx } else { 0.0 };
    let c0 = y_mean - c1 * t_mean;
    for (i, y) in data.iter_mut().enumerate() {
        *y -= c0 + c1 * (i as f64 * dt);
    }
}

/// Apply a cosine-squared ramp of `taper_len` samples to both ends.
pub(crate) fn cosine_edge_taper(data: &mut [f64], taper_len: usize) {
    let npts = data.len();
    if taper_len == 0 || 2 * taper_len > npts {
        return;
    }
    let ang = PI / (2.0 * taper_len as f64);
    for i in 0..taper_len {
        let cs = (i as f64 * ang).cos();
        let w = cs * cs;
        data[taper_len - 1 - i] *= w;
        data[npts - taper_len + i] *= w;
    }
}

/// Shift `data` by `tau` samples (`time_shift = tau * dt`) using a DFT:
/// multiply the positive-frequency bins by `exp(-i*2*PI*j*tau/N)` and
/// inverse transform. The signal is zero-padded to a power of two; energy
/// wrapping across the pad is the caller's concern (a prior edge taper).
pub(crate) fn shift_by_fft(data: &mut [f64], tau: f64) {
    let npts = data.len();
    if npts < 2 || tau == 0.0 {
        return;
    }
    let np2 = next_pow2(npts);
    let n2 = np2 / 2;

    let mut buf = vec![Complex64::new(0.0, 0.0); np2];
    for (b, &d) in buf.iter_mut().zip(data.iter()) {
        b.re = d;
    }
    fft_forward(&mut buf);

    // exp(-i*2*PI*j*tau/np2) applied incrementally, bin 0 untouched. The
    // conjugate mirror keeps the inverse transform real.
    let e1 = Complex64::from_polar(1.0, -2.0 * PI * tau / np2 as f64);
    let mut e = e1;
    for j in 1..n2 {
        buf[j] *= e;
        buf[np2 - j] *= e.conj();
        e *= e1;
    }
    buf[n2] = Complex64::new(buf[n2].re * e.re - buf[n2].im * e.im, 0.0);

    fft_inverse(&mut buf);
    for (d, b) in data.iter_mut().zip(buf.iter()) {
        *d = b.re;
    }
}
