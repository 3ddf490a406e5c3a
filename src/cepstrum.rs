// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Cepstral delay-peak estimation.
//!
//! The pipeline whitens the amplitude spectrum, optionally equalizes
//! against a separately smoothed noise spectrum, applies multi-pass
//! noise spectrum equalization over the analysis band, transforms back
//! to the quefrency domain and picks the dominant pulse delay.

use num_complex::Complex64;
use thiserror::Error;

use crate::constants::PI;
use crate::spectral::{fft_forward, fft_inverse, next_pow2};

#[derive(Error, Debug)]
pub enum CepstrumError {
    #[error("signal is empty")]
    EmptySignal,

    #[error("sample interval must be positive, got {0}")]
    BadSampleInterval(f64),

    #[error("smoothing width {width} Hz is unusable for {nf} frequency bins at df={df}")]
    SmoothingWidth { width: f64, nf: usize, df: f64 },

    #[error("analysis band [{flo}, {fhi}] Hz is empty")]
    BadBand { flo: f64, fhi: f64 },
}

/// Cepstrum analysis parameters.
#[derive(Clone, Debug)]
pub struct CepstrumParams {
    /// Spectrum smoothing box full width \[Hz\].
    pub smoothing_width: f64,
    /// Number of smoothing passes.
    pub smoothing_npass: usize,
    /// Analysis band low edge \[Hz\].
    pub flo: f64,
    /// Analysis band high edge \[Hz\].
    pub fhi: f64,
    /// NSE guard band for the spectral pass \[Hz\].
    pub guard1: f64,
    /// NSE averaging band for the spectral pass \[Hz\].
    pub aveband1: f64,
    /// NSE guard band for the quefrency pass \[s\].
    pub guard2: f64,
    /// NSE averaging band for the quefrency pass \[s\].
    pub aveband2: f64,
    /// NSE threshold, halved on every pass.
    pub tpass: f64,
    /// Number of NSE passes.
    pub npass: usize,
    /// Keep the local-mean spectrum instead of the ratio.
    pub noise_flag: bool,
    /// Smallest admissible pulse delay \[s\].
    pub pulse_delay_min: f64,
    /// Largest admissible pulse delay \[s\].
    pub pulse_delay_max: f64,
}

impl Default for CepstrumParams {
    fn default() -> CepstrumParams {
        CepstrumParams {
            smoothing_width: 1.0,
            smoothing_npass: 2,
            flo: 2.0,
            fhi: 40.0,
            guard1: 1.0,
            aveband1: 5.0,
            guard2: 0.05,
            aveband2: 0.25,
            tpass: 2.0,
            npass: 2,
            noise_flag: false,
            pulse_delay_min: 0.1,
            pulse_delay_max: 2.0,
        }
    }
}

/// The cepstral estimate: the dominant delay and its strength relative
/// to the cepstrum's spread over the admissible window.
#[derive(Clone, Debug)]
pub struct CepstrumOutput {
    /// Number of frequency (and quefrency) bins.
    pub nf: usize,
    /// Frequency bin width \[Hz\].
    pub df: f64,
    /// Sample interval \[s\].
    pub dt: f64,
    /// The picked pulse delay \[s\].
    pub delay_time: f64,
    /// Variance of the cepstrum over the admissible delay window.
    pub variance: f64,
    /// Peak amplitude over the window mean, in standard deviations.
    pub peak_std: f64,
    /// The processed cepstrum (quefrency domain).
    pub cepstrum: Vec<f32>,
}

fn log10_floor(a: f32) -> f32 {
    if a > 0.0 {
        a.log10()
    } else {
        1.0e-20
    }
}

/// Run the cepstrum pipeline on a signal window, optionally equalizing
/// with a noise window recorded before the signal.
pub fn cepstrum(
    signal: &[f32],
    noise: Option<&[f32]>,
    dt: f64,
    cp: &CepstrumParams,
) -> Result<CepstrumOutput, CepstrumError> {
    if signal.is_empty() {
        return Err(CepstrumError::EmptySignal);
    }
    if dt <= 0.0 {
        return Err(CepstrumError::BadSampleInterval(dt));
    }

    let npts = signal.len().max(noise.map(|n| n.len()).unwrap_or(0));
    let np2 = next_pow2(npts);
    let n2 = np2 / 2;
    let nf = n2 + 1;
    let df = 1.0 / (np2 as f64 * dt);

    let mut data = amplitude_spectrum(signal, np2);

    // Smooth and normalize by the peak magnitude.
    smooth_spectrum(&mut data, cp, df)?;
    let max = data.iter().cloned().fold(0.0f32, f32::max);
    if max > 0.0 {
        for v in data.iter_mut() {
            *v /= max;
        }
    }

    // Subtract the separately smoothed noise spectrum, clamping at zero.
    if let Some(noise) = noise {
        let mut noise_amp = amplitude_spectrum(noise, np2);
        smooth_spectrum(&mut noise_amp, cp, df)?;
        if max > 0.0 {
            for v in noise_amp.iter_mut() {
                *v /= max;
            }
        }
        for (d, n) in data.iter_mut().zip(noise_amp.iter()) {
            *d -= n;
            if *d < 0.0 {
                *d = 0.0;
            }
        }
    }

    for v in data.iter_mut() {
        *v = log10_floor(*v);
    }

    // Restrict to the analysis band and equalize.
    let if1 = ((cp.flo / df + 0.5) as usize).min(nf - 1);
    let if2 = ((cp.fhi / df + 0.5) as usize).min(nf - 1);
    if if2 < if1 {
        return Err(CepstrumError::BadBand {
            flo: cp.flo,
            fhi: cp.fhi,
        });
    }

    let guard = (cp.guard1 / df).round() as usize;
    let aveband = (cp.aveband1 / df).round() as usize;
    noise_spectrum_equalize(
        &mut data[if1..=if2],
        guard,
        aveband,
        cp.tpass,
        cp.npass,
        cp.noise_flag,
    );

    detrend(&mut data[if1..=if2]);
    if cp.noise_flag {
        taper_cosine(&mut data[if1..=if2], 0.1, 0.1);
    } else {
        taper_cosine(&mut data[if1..=if2], 0.2, 0.2);
    }

    // Extend the band edges flat over the rest of the spectrum.
    let edge1 = data[if1];
    let edge2 = data[if2];
    for v in data[..if1].iter_mut() {
        *v = edge1;
    }
    for v in data[if2..].iter_mut() {
        *v = edge2;
    }

    // Remove the mean to eliminate the DC component.
    let mean = data.iter().map(|&v| f64::from(v)).sum::<f64>() / nf as f64;
    for v in data.iter_mut() {
        *v -= mean as f32;
    }

    // Inverse transform of the real log spectrum to the quefrency
    // domain.
    let mut buf = vec![Complex64::new(0.0, 0.0); np2];
    for (i, &v) in data.iter().enumerate() {
        buf[i].re = f64::from(v) / dt;
        if i > 0 && i < n2 {
            buf[np2 - i].re = f64::from(v) / dt;
        }
    }
    fft_inverse(&mut buf);
    for (i, v) in data.iter_mut().enumerate() {
        *v = buf[i].re as f32;
    }

    // Suppress the DC start-up ahead of the admissible delays so the
    // second equalization is not dragged by it.
    let mut i1 = (cp.pulse_delay_min / dt).round() as usize + 1;
    let fhi_floor = (1.0 / (cp.fhi * dt)) as usize;
    if i1 < fhi_floor {
        i1 = fhi_floor;
    }
    i1 = i1.max(1).min(nf - 1);
    let mut i2 = (cp.pulse_delay_max / dt).round() as usize;
    if i2 > nf - 1 {
        i2 = nf - 1;
    }
    let i2 = i2.max(i1);

    let mut min = data[0];
    let mut num_min = 0;
    for (i, &v) in data[..i1].iter().enumerate() {
        if v <= min {
            num_min = i;
            min = v;
        }
    }
    for v in data[..num_min].iter_mut() {
        *v = min;
    }

    let min = data[..nf].iter().cloned().fold(f32::INFINITY, f32::min);
    for v in data.iter_mut() {
        *v -= min;
    }

    // Second equalization, in the quefrency domain.
    let guard = (cp.guard2 / dt).round() as usize;
    let aveband = (cp.aveband2 / dt).round() as usize;
    noise_spectrum_equalize(
        &mut data[..nf],
        guard,
        aveband,
        cp.tpass,
        cp.npass,
        cp.noise_flag,
    );

    detrend(&mut data[..nf]);
    for v in data.iter_mut() {
        *v = v.abs();
    }

    // Locate the peak within the admissible pulse-delay window.
    let mut max = data[i1];
    let mut imax = i1;
    let mut mean = 0.0f64;
    for (i, &v) in data.iter().enumerate().take(i2 + 1).skip(i1) {
        if v > max {
            max = v;
            imax = i;
        }
        mean += f64::from(v);
    }
    mean /= (i2 - i1 + 1) as f64;

    let mut sqerr = 0.0f64;
    for &v in data.iter().take(i2).skip(i1) {
        sqerr += (mean - f64::from(v)).powi(2);
    }
    let variance = sqerr / (i2 - i1 + 1) as f64;
    let peak_std = if variance > 0.0 {
        (f64::from(max) - mean) / variance.sqrt()
    } else {
        0.0
    };

    data.truncate(nf);
    Ok(CepstrumOutput {
        nf,
        df,
        dt,
        delay_time: imax as f64 * dt,
        variance,
        peak_std,
        cepstrum: data,
    })
}

/// Demean, Hann-taper and transform a padded window; return the
/// amplitude spectrum over the `np2/2 + 1` non-negative frequencies.
fn amplitude_spectrum(x: &[f32], np2: usize) -> Vec<f32> {
    let n2 = np2 / 2;
    let nf = n2 + 1;

    let mut r = vec![0.0f64; np2];
    for (v, &s) in r.iter_mut().zip(x.iter()) {
        *v = f64::from(s);
    }
    demean(&mut r[..x.len().min(np2)]);
    taper_hann(&mut r[..x.len().min(np2)]);

    let mut buf: Vec<Complex64> = r.iter().map(|&v| Complex64::new(v, 0.0)).collect();
    fft_forward(&mut buf);

    (0..nf).map(|i| buf[i].norm() as f32).collect()
}

fn demean(data: &mut [f64]) {
    if data.is_empty() {
        return;
    }
    let mean = data.iter().sum::<f64>() / data.len() as f64;
    for v in data.iter_mut() {
        *v -= mean;
    }
}

fn taper_hann(x: &mut [f64]) {
    let n = x.len();
    if n <= 1 {
        return;
    }
    let step = 2.0 * PI / (n - 1) as f64;
    for (i, v) in x.iter_mut().enumerate() {
        *v *= 0.5 * (1.0 - (i as f64 * step).cos());
    }
}

/// Moving-average box smoothing, repeated `smoothing_npass` times. The
/// box half-width is derived from the requested width in Hz.
fn smooth_spectrum(data: &mut [f32], cp: &CepstrumParams, df: f64) -> Result<(), CepstrumError> {
    let nf = data.len();
    let nbox = 2 * ((cp.smoothing_width / (2.0 * df)) as usize) + 1;
    if nbox < 3 || nf < 2 * nbox {
        return Err(CepstrumError::SmoothingWidth {
            width: cp.smoothing_width,
            nf,
            df,
        });
    }
    let nbox2 = (nbox - 1) / 2;
    let mut tmp = vec![0.0f32; nf];
    for _ in 0..cp.smoothing_npass {
        for i in 0..nf {
            let istart = i.saturating_sub(nbox);
            let iend = (i + nbox2 + 1).min(nf);
            let sum: f64 = data[istart..iend].iter().map(|&v| f64::from(v)).sum();
            tmp[i] = (sum / (iend - istart) as f64) as f32;
        }
        data.copy_from_slice(&tmp);
    }
    Ok(())
}

/// Noise spectrum equalization with a multi-pass split symmetric
/// window: each bin is compared against the average of its neighbours
/// outside a guard band and replaced by that local mean when it exceeds
/// `tpass` times it; the threshold decays by half every pass.
fn noise_spectrum_equalize(
    data: &mut [f32],
    guard: usize,
    aveband: usize,
    tpass: f64,
    npass: usize,
    noise: bool,
) {
    let nf = data.len();
    if nf == 0 {
        return;
    }
    let mut buff: Vec<f32> = data.to_vec();
    let mut snorm = vec![0.0f32; nf];
    let mut tpass = tpass;

    for _ in 0..npass {
        for j in (0..nf).rev() {
            let (tempu, dnomu) = if j + guard + 1 < nf {
                let k2 = (j + aveband + guard + 1).min(nf);
                let sum: f64 = buff[j + guard + 1..k2].iter().map(|&v| f64::from(v)).sum();
                (sum, (k2 - (j + guard + 1)) as f64)
            } else {
                (0.0, 0.0)
            };
            let (templ, dnoml) = if j > guard {
                let k1 = j.saturating_sub(aveband + guard);
                let sum: f64 = buff[k1..j - guard].iter().map(|&v| f64::from(v)).sum();
                (sum, (j - guard - k1) as f64)
            } else {
                (0.0, 0.0)
            };
            let denom = dnoml + dnomu;
            let anoise = if denom > 0.0 {
                ((templ + tempu) / denom) as f32
            } else {
                0.0
            };
            snorm[j] = anoise;
            if f64::from(buff[j]) > tpass * f64::from(anoise) {
                buff[j] = snorm[j];
            }
        }
        tpass /= 2.0;
    }

    if noise {
        for (d, &s) in data.iter_mut().zip(snorm.iter()) {
            *d = if s.abs() > 1.0e-13 { s } else { 1.0e-13 };
        }
    } else {
        for (d, &s) in data.iter_mut().zip(snorm.iter()) {
            let n = if d.abs() > 1.0e-11 { *d } else { 1.0e-11 };
            let den = if s.abs() > 1.0e-11 { s } else { 1.0e-11 };
            *d = n / den;
        }
    }
}

/// Remove a least-squares line using the closed form on the 1-based
/// sample index.
fn detrend(data: &mut [f32]) {
    let npts = data.len();
    if npts < 2 {
        return;
    }
    let n = npts as f64;
    let mut sum = 0.0f64;
    let mut sumi = 0.0f64;
    for (i, &v) in data.iter().enumerate() {
        sum += f64::from(v);
        sumi += (i + 1) as f64 * f64::from(v);
    }
    let slope = (12.0 * sumi - 6.0 * (n + 1.0) * sum) / (n * (n + 1.0) * (n - 1.0));
    let intercept = ((4.0 * n + 2.0) * sum - 6.0 * sumi) / (n * (n - 1.0));
    for (i, v) in data.iter_mut().enumerate() {
        *v -= (intercept + (i + 1) as f64 * slope) as f32;
    }
}

/// Cosine taper the leading `beg_frac` and trailing `end_frac` of the
/// window.
fn taper_cosine(data: &mut [f32], beg_frac: f64, end_frac: f64) {
    let n = data.len();
    let beg = (n as f64 * beg_frac) as usize;
    let end = (n as f64 * end_frac) as usize;
    if beg > 0 {
        let ang = PI / (2.0 * beg as f64);
        for i in 0..beg.min(n) {
            let cs = ((beg - 1 - i) as f64 * ang).cos();
            data[i] = (f64::from(data[i]) * cs * cs) as f32;
        }
    }
    if end > 0 {
        let ang = PI / (2.0 * end as f64);
        for i in 0..end.min(n) {
            let cs = ((end - 1 - i) as f64 * ang).cos();
            data[n - 1 - i] = (f64::from(data[n - 1 - i]) * cs * cs) as f32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// A signal followed by a scaled echo of itself: the classic
    /// cepstral test case, whose log spectrum ripples at the echo
    /// delay.
    fn echo_signal(n: usize, dt: f64, delay: f64, alpha: f32) -> Vec<f32> {
        let lag = (delay / dt).round() as usize;
        let mut base = vec![0.0f32; n];
        // A band-limited pulse.
        for (i, v) in base.iter_mut().enumerate() {
            let t = (i as f64 - 100.0) * dt;
            *v = ((-t * t / 0.01).exp() * (2.0 * PI * 12.0 * t).cos()) as f32;
        }
        let mut sig = base.clone();
        for i in lag..n {
            sig[i] += alpha * base[i - lag];
        }
        sig
    }

    #[test]
    fn test_echo_delay_recovered() {
        let dt = 0.01;
        let delay = 0.4;
        let sig = echo_signal(2048, dt, delay, 0.9);
        let cp = CepstrumParams {
            smoothing_width: 0.5,
            flo: 2.0,
            fhi: 45.0,
            pulse_delay_min: 0.1,
            pulse_delay_max: 0.8,
            ..CepstrumParams::default()
        };
        let out = cepstrum(&sig, None, dt, &cp).unwrap();
        assert_abs_diff_eq!(out.delay_time, delay, epsilon = 3.0 * dt);
        assert!(out.peak_std > 1.5, "peak_std = {}", out.peak_std);
    }

    #[test]
    fn test_output_shapes() {
        let dt = 0.01;
        let sig = echo_signal(1000, dt, 0.3, 0.5);
        let out = cepstrum(&sig, None, dt, &CepstrumParams::default()).unwrap();
        // 1000 pads to 1024.
        assert_eq!(out.nf, 513);
        assert_abs_diff_eq!(out.df, 1.0 / (1024.0 * dt), epsilon = 1e-12);
        assert_eq!(out.cepstrum.len(), out.nf);
    }

    #[test]
    fn test_noise_equalized_run() {
        let dt = 0.01;
        let sig = echo_signal(2048, dt, 0.4, 0.8);
        let noise: Vec<f32> = (0..1024)
            .map(|i| (((i * 2654435761usize) % 10007) as f32 / 5003.5 - 1.0) * 0.01)
            .collect();
        let out = cepstrum(&sig, Some(&noise), dt, &CepstrumParams::default()).unwrap();
        assert!(out.delay_time > 0.0);
        assert!(out.variance >= 0.0);
    }

    #[test]
    fn test_empty_signal_rejected() {
        assert!(matches!(
            cepstrum(&[], None, 0.01, &CepstrumParams::default()),
            Err(CepstrumError::EmptySignal)
        ));
        assert!(matches!(
            cepstrum(&[1.0], None, 0.0, &CepstrumParams::default()),
            Err(CepstrumError::BadSampleInterval(_))
        ));
    }
}
