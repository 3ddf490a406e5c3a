// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Delay-sum beamforming and the F-trace detection statistics.
//!
//! Calculates the beam and, in a moving window `2*spts+1` samples long,
//! the semblance, the F-statistic and the probability (using the
//! F-statistic) that a signal is present above band-limited noise with
//! SNR equal to sqrt(signal/noise power) (Douze and Laster, 1979,
//! Geophysics 44; Blandford, 1974, Geophysics 39).

mod recipe;

pub use recipe::{BeamGroup, BeamRecipe, BeamSta, BeamType};

use log::debug;
use rayon::prelude::*;
use thiserror::Error;

use crate::constants::DEG_TO_KM;
use crate::error::try_vec;
use crate::geom::dist_azimuth;
use crate::methods::{FilterType, IirFilter, MethodError};
use crate::spectral::{cosine_edge_taper, detrend_linear, shift_by_fft};
use crate::ts::{Coverage, CoverageError, Segment, TimeSeries, TsError};

#[derive(Error, Debug)]
pub enum BeamError {
    #[error("beamforming requires at least one channel")]
    NoChannels,

    #[error("{sta}: station coordinates are required to compute time lags")]
    MissingCoordinates { sta: String },

    #[error("ran out of memory; need {need} bytes for beam windows")]
    InsufficientMemory { need: usize },

    #[error(transparent)]
    Coverage(#[from] CoverageError),

    #[error(transparent)]
    Method(#[from] MethodError),

    #[error(transparent)]
    Ts(#[from] TsError),
}

/// The four traces produced by the F-trace pipeline. All share the
/// beam's sample rate and time origin.
#[derive(Debug)]
pub struct FtraceOutput {
    pub beam: TimeSeries,
    pub semblance: TimeSeries,
    pub fstat: TimeSeries,
    pub probability: TimeSeries,
}

/// Per-channel arrival delays \[s\] of a plane wave with the given
/// azimuth (degrees, direction the energy comes from) and horizontal
/// slowness \[s/km\], relative to the beam point. A channel co-located
/// with the beam point has lag 0; channels the wavefront reaches later
/// get positive lags.
pub fn time_lags(
    ts: &[&TimeSeries],
    beam_lat: f64,
    beam_lon: f64,
    azimuth: f64,
    slowness: f64,
) -> Result<Vec<f64>, BeamError> {
    let az = azimuth.to_radians();
    let skx = slowness * az.sin();
    let sky = slowness * az.cos();

    let mut lags = Vec::with_capacity(ts.len());
    for t in ts {
        let (lat, lon) = match (t.lat(), t.lon()) {
            (Some(lat), Some(lon)) => (lat, lon),
            _ => {
                return Err(BeamError::MissingCoordinates {
                    sta: t.sta().to_string(),
                })
            }
        };
        if lat == beam_lat && lon == beam_lon {
            lags.push(0.0);
            continue;
        }
        let (delta, az_to_sta, _) = dist_azimuth(beam_lat, beam_lon, lat, lon);
        let dist = delta * DEG_TO_KM;
        let ang = az_to_sta.to_radians();
        let x = dist * ang.sin();
        let y = dist * ang.cos();
        // The projection onto the slowness direction is the head start
        // this channel has on the beam point.
        lags.push(-(x * skx + y * sky));
    }
    Ok(lags)
}

/// Compute the F-trace of a set of channels with explicit per-channel
/// lags. Missing lags are taken as zero.
///
/// Per coverage window each channel is detrended, tapered with a 1%
/// cosine taper, advanced by its lag with a frequency-domain shift and
/// summed into the delay-sum beam. The beam and the aligned channels go
/// through the shared Butterworth filter before the semblance, the
/// F-statistic and the signal probability are computed in a sliding
/// window of `2*spts+1` samples.
#[allow(clippy::too_many_arguments)]
pub fn ftrace(
    ts: &[&TimeSeries],
    t_min: f64,
    t_max: f64,
    lags: &[f64],
    spts: usize,
    npols: usize,
    flow: f64,
    fhigh: f64,
    zero_phase: bool,
    snr: f64,
) -> Result<FtraceOutput, BeamError> {
    if ts.is_empty() {
        return Err(BeamError::NoChannels);
    }
    let cov = Coverage::new(ts, t_min, t_max)?;
    let dt = cov.dt();

    let mut lags = lags.to_vec();
    lags.resize(ts.len(), 0.0);
    let taus: Vec<f64> = lags.iter().map(|l| l / dt).collect();

    let mut out = FtraceOutput {
        beam: beam_header(ts[0]),
        semblance: beam_header(ts[0]),
        fstat: beam_header(ts[0]),
        probability: beam_header(ts[0]),
    };

    for w in cov.windows() {
        let npts = w.npts;
        debug!("ftrace window [{}, {}], {npts} samples", w.t_min, w.t_max);
        let aligned = w.aligned(ts);

        let mut chans: Vec<Vec<f64>> = Vec::new();
        for c in 0..ts.len() {
            let mut chan = try_vec(0.0f64, npts)
                .map_err(|need| BeamError::InsufficientMemory { need })?;
            for (v, &s) in chan.iter_mut().zip(aligned.row(c)) {
                *v = f64::from(s);
            }
            chans.push(chan);
        }

        // Remove linear trend, 1% cosine taper, time shift.
        chans.par_iter_mut().zip(taus.par_iter()).for_each(|(chan, &tau)| {
            detrend_linear(chan, dt);
            cosine_edge_taper(chan, npts / 100);
            shift_by_fft(chan, -tau);
        });

        // Delay-sum beam, scaled by the channel count.
        let mut beam = vec![0.0f64; npts];
        for chan in &chans {
            for (b, v) in beam.iter_mut().zip(chan.iter()) {
                *b += v;
            }
        }
        for b in beam.iter_mut() {
            *b /= ts.len() as f64;
        }

        let mut filter = IirFilter::new(npols, FilterType::BP, flow, fhigh, dt, zero_phase)?;
        let mut beam32: Vec<f32> = beam.iter().map(|&v| v as f32).collect();
        filter.apply_samples(&mut beam32, true);

        let filtered: Vec<Vec<f32>> = chans
            .iter()
            .map(|chan| {
                let mut f32s: Vec<f32> = chan.iter().map(|&v| v as f32).collect();
                let mut f = filter.clone();
                f.apply_samples(&mut f32s, true);
                f32s
            })
            .collect();

        let (mut semb, mut fst, mut prob) = fstuff(&filtered, dt, spts, snr, flow, fhigh);

        // Cosine taper the first/last 2*spts+1 samples of the detection
        // traces.
        let taper_len = 2 * spts + 1;
        for trace in [&mut semb, &mut fst, &mut prob] {
            edge_taper_f32(trace, taper_len);
        }

        out.beam
            .add_segment(Segment::new(beam32, w.t_min, dt, 1.0, 0.0)?)?;
        out.semblance
            .add_segment(Segment::new(semb, w.t_min, dt, 1.0, 0.0)?)?;
        out.fstat
            .add_segment(Segment::new(fst, w.t_min, dt, 1.0, 0.0)?)?;
        out.probability
            .add_segment(Segment::new(prob, w.t_min, dt, 1.0, 0.0)?)?;
    }
    Ok(out)
}

/// The F-trace for a plane wave described by azimuth and slowness: lags
/// are derived from the station coordinates, and the outputs carry the
/// beam point as their coordinates.
#[allow(clippy::too_many_arguments)]
pub fn ftrace_az_slow(
    ts: &[&TimeSeries],
    t_min: f64,
    t_max: f64,
    azimuth: f64,
    slowness: f64,
    beam_lat: f64,
    beam_lon: f64,
    spts: usize,
    npols: usize,
    flow: f64,
    fhigh: f64,
    zero_phase: bool,
    snr: f64,
) -> Result<FtraceOutput, BeamError> {
    let lags = time_lags(ts, beam_lat, beam_lon, azimuth, slowness)?;
    let mut out = ftrace(
        ts, t_min, t_max, &lags, spts, npols, flow, fhigh, zero_phase, snr,
    )?;
    for t in [
        &mut out.beam,
        &mut out.semblance,
        &mut out.fstat,
        &mut out.probability,
    ] {
        t.set_coordinates(beam_lat, beam_lon, 0.0);
    }
    Ok(out)
}

/// Form a beam series from a set of channels: the delay-sum mean
/// (coherent) or the mean of the rectified, aligned samples
/// (incoherent). As in [`ftrace`], lags are arrival delays and each
/// channel is advanced by its lag.
pub fn beam_timeseries(
    ts: &[&TimeSeries],
    lags: &[f64],
    beam_type: BeamType,
) -> Result<TimeSeries, BeamError> {
    if ts.is_empty() {
        return Err(BeamError::NoChannels);
    }
    let cov = Coverage::full(ts)?;
    let dt = cov.dt();
    let mut lags = lags.to_vec();
    lags.resize(ts.len(), 0.0);

    let mut out = beam_header(ts[0]);
    for w in cov.windows() {
        let aligned = w.aligned(ts);
        let mut beam = vec![0.0f64; w.npts];
        for (c, &lag) in lags.iter().enumerate() {
            let mut chan: Vec<f64> = aligned.row(c).iter().map(|&v| f64::from(v)).collect();
            if lag != 0.0 {
                shift_by_fft(&mut chan, -lag / dt);
            }
            match beam_type {
                BeamType::Coherent => {
                    for (b, v) in beam.iter_mut().zip(chan.iter()) {
                        *b += v;
                    }
                }
                BeamType::Incoherent => {
                    for (b, v) in beam.iter_mut().zip(chan.iter()) {
                        *b += v.abs();
                    }
                }
            }
        }
        for b in beam.iter_mut() {
            *b /= ts.len() as f64;
        }
        out.add_segment(Segment::from_f64(&beam, w.t_min, dt, 1.0, 0.0)?)?;
    }
    Ok(out)
}

/// A fresh output series carrying the network identity of the inputs.
fn beam_header(first: &TimeSeries) -> TimeSeries {
    let mut out = TimeSeries::new();
    out.set_channel(first.net(), "beam", first.net());
    out
}

/// Semblance, F-statistic and non-central F signal probability in a
/// moving `2*spts+1` sample window.
///
/// Degrees of freedom: `nn1 = 2*B*T` with `B = fhigh-flow` (Hz) and `T`
/// the window length (s); `nn2 = nn1*(C-1)`. The non-centrality is
/// `lambda = nn1*snr^2` (Blandford 1974), and the probability of a
/// non-central F-distribution follows Abramowitz and Stegun:
/// `P(F'|nn1,nn2,lambda) = P(F|nc1,nn2)` with
/// `F = nn1*F'/(nn1+lambda)` and `nc1 = (nn1+lambda)^2/(nn1+2*lambda)`.
fn fstuff(
    data: &[Vec<f32>],
    dt: f64,
    spts: usize,
    snr: f64,
    flow: f64,
    fhigh: f64,
) -> (Vec<f32>, Vec<f32>, Vec<f32>) {
    let num = data.len();
    let npts = data.first().map(|d| d.len()).unwrap_or(0);
    let mut semb = vec![0.0f32; npts];
    let mut fst = vec![0.0f32; npts];
    let mut prob = vec![0.0f32; npts];
    if num == 0 || npts == 0 {
        return (semb, fst, prob);
    }

    let nwin = 2 * spts;
    let fnn1 = 2.0 * (fhigh - flow) * nwin as f64 * dt;
    let nn1 = (fnn1 as i64).max(1);
    let nn2 = nn1 * (num as i64 - 1);
    let lambda = (fnn1 * snr * snr) as i64;
    let nc1 = (nn1 + lambda) * (nn1 + lambda) / (nn1 + 2 * lambda);

    for k in 0..npts.saturating_sub(nwin) {
        let smv = k + spts;

        // Numerator: sum over the window of the squared channel sum.
        // Denominator: the sum of the summed channel squares.
        let mut sum1 = 0.0f64;
        let mut sum3 = 0.0f64;
        for i in k..=k + nwin {
            let mut sum0 = 0.0f64;
            let mut sum2 = 0.0f64;
            for chan in data {
                let v = f64::from(chan[i]);
                sum0 += v;
                sum2 += v * v;
            }
            sum1 += sum0 * sum0;
            sum3 += sum2;
        }
        let s = if sum3 > 0.0 {
            sum1 / (num as f64 * sum3)
        } else {
            0.0
        };
        semb[smv] = s as f32;

        let f = s * (num as f64 - 1.0) / (1.0 - s).max(1e-10);
        fst[smv] = f as f32;

        if nn2 > 0 {
            let fprime = nn1 as f64 * f / (nn1 + lambda) as f64;
            let x = (nn2 as f64 / (nn2 as f64 + nc1 as f64 * fprime)).clamp(0.0, 1.0);
            let p = statrs::function::beta::beta_reg(0.5 * nn2 as f64, 0.5 * nc1 as f64, x);
            prob[smv] = (1.0 - p) as f32;
        }
    }
    (semb, fst, prob)
}

fn edge_taper_f32(data: &mut [f32], taper_len: usize) {
    let mut d: Vec<f64> = data.iter().map(|&v| f64::from(v)).collect();
    cosine_edge_taper(&mut d, taper_len);
    for (v, &t) in data.iter_mut().zip(d.iter()) {
        *v = t as f32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use crate::constants::PI;

    /// A band-limited wiggle plus a strong transient in the middle.
    fn signal(n: usize, dt: f64) -> Vec<f32> {
        (0..n)
            .map(|i| {
                let t = i as f64 * dt;
                let carrier = (2.0 * PI * 2.5 * t).sin();
                let envelope = (-((t - 12.5) / 1.5_f64).powi(2)).exp() * 8.0;
                (0.1 * carrier + envelope * carrier) as f32
            })
            .collect()
    }

    fn channel(data: Vec<f32>, t0: f64, dt: f64) -> TimeSeries {
        let mut ts = TimeSeries::new();
        ts.add_segment(Segment::new(data, t0, dt, 1.0, 1.0).unwrap())
            .unwrap();
        ts
    }

    #[test]
    fn test_beam_of_identical_channels_is_the_channel() {
        // A beam of identical copies of one channel equals that channel
        // (after the beam's own filter).
        let dt = 0.025;
        let sig = signal(1000, dt);
        let c1 = channel(sig.clone(), 0.0, dt);
        let c2 = channel(sig.clone(), 0.0, dt);
        let c3 = channel(sig.clone(), 0.0, dt);

        let out = ftrace(
            &[&c1, &c2, &c3],
            0.0,
            25.0,
            &[0.0, 0.0, 0.0],
            20,
            3,
            1.0,
            5.0,
            false,
            2.0,
        )
        .unwrap();

        // The reference: the same conditioning and filter applied to a
        // single copy.
        let single = ftrace(&[&c1], 0.0, 25.0, &[0.0], 20, 3, 1.0, 5.0, false, 2.0).unwrap();
        let beam = out.beam.segment(0).data();
        let reference = single.beam.segment(0).data();
        assert_eq!(beam.len(), reference.len());
        for (a, b) in beam.iter().zip(reference.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-5);
        }

        // Identical channels are perfectly coherent where there is
        // signal: the F-statistic away from the tapered edges is huge.
        let fst = out.fstat.segment(0).data();
        let mid = fst.len() / 2;
        assert!(fst[mid] > 10.0, "F at centre = {}", fst[mid]);
    }

    #[test]
    fn test_delayed_channel_beam_aligns() {
        // Two synthetic channels identical except for a 0.25 s delay at
        // 40 Hz, beamed with lags (0, 0.25): the beam equals channel 0
        // up to floating-point noise and the F-statistic in the aligned
        // region exceeds 10.
        let dt = 0.025;
        let n = 1000;
        let sig = signal(n + 10, dt);
        let c0 = channel(sig[..n].to_vec(), 0.0, dt);
        // The delayed channel: the same samples starting 10 samples
        // (0.25 s) later in time.
        let c1 = channel(sig[..n].to_vec(), 0.25, dt);

        let out = ftrace(
            &[&c0, &c1],
            0.25,
            24.0,
            &[0.0, 0.25],
            20,
            3,
            1.0,
            5.0,
            false,
            2.0,
        )
        .unwrap();

        let single = ftrace(&[&c0], 0.25, 24.0, &[0.0], 20, 3, 1.0, 5.0, false, 2.0).unwrap();

        let beam = out.beam.segment(0).data();
        let reference = single.beam.segment(0).data();
        // Skip the shift's wrap-around edges.
        let skip = 40;
        for i in skip..beam.len() - skip {
            assert_abs_diff_eq!(beam[i], reference[i], epsilon = 2e-2);
        }

        let fst = out.fstat.segment(0).data();
        let mid = fst.len() / 2;
        assert!(fst[mid] > 10.0, "F at centre = {}", fst[mid]);
    }

    #[test]
    fn test_semblance_bounded() {
        let dt = 0.025;
        let a = channel(signal(800, dt), 0.0, dt);
        let b = channel(
            (0..800).map(|i| ((i * 7919) % 1000) as f32 / 500.0 - 1.0).collect(),
            0.0,
            dt,
        );
        let out = ftrace(&[&a, &b], 0.0, 20.0, &[], 10, 3, 1.0, 5.0, false, 2.0).unwrap();
        for &s in out.semblance.segment(0).data() {
            assert!((0.0..=1.0 + 1e-6).contains(&f64::from(s)));
        }
        for &p in out.probability.segment(0).data() {
            assert!((0.0..=1.0 + 1e-6).contains(&f64::from(p)));
        }
    }

    #[test]
    fn test_incoherent_beam_rectifies() {
        let dt = 0.025;
        let c0 = channel(vec![1.0; 100], 0.0, dt);
        let c1 = channel(vec![-1.0; 100], 0.0, dt);
        let coh = beam_timeseries(&[&c0, &c1], &[], BeamType::Coherent).unwrap();
        let inc = beam_timeseries(&[&c0, &c1], &[], BeamType::Incoherent).unwrap();
        assert_abs_diff_eq!(coh.segment(0).data()[50], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(inc.segment(0).data()[50], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_time_lags_geometry() {
        // Two stations along the propagation path: the one the wave
        // reaches later carries the positive lag.
        let mut north = TimeSeries::new();
        north.set_channel("N1", "shz", "XX");
        north.set_coordinates(0.5, 0.0, 0.0);
        north
            .add_segment(Segment::new(vec![0.0; 10], 0.0, 0.025, 1.0, 1.0).unwrap())
            .unwrap();
        let mut south = TimeSeries::new();
        south.set_channel("S1", "shz", "XX");
        south.set_coordinates(-0.5, 0.0, 0.0);
        south
            .add_segment(Segment::new(vec![0.0; 10], 0.0, 0.025, 1.0, 1.0).unwrap())
            .unwrap();

        // Wave arriving from the north: the northern station leads
        // (negative lag), the southern trails.
        let lags = time_lags(&[&north, &south], 0.0, 0.0, 0.0, 0.05).unwrap();
        assert!(lags[0] < 0.0);
        assert!(lags[1] > 0.0);
        assert_abs_diff_eq!(lags[0], -lags[1], epsilon = 1e-6);
        // |lag| = dist * slowness = 0.5 deg * 111.19 km/deg * 0.05 s/km.
        assert_abs_diff_eq!(lags[1], 0.5 * DEG_TO_KM * 0.05, epsilon = 1e-3);
    }
}
