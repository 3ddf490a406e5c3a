// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Recipe-driven STA/LTA detection.
//!
//! Each recipe conditions a channel (or a summed horizontal pair) with
//! demean + taper + Butterworth, runs a short-term/long-term average
//! trigger over the rectified energy, and records candidates. The
//! candidates from all recipes and channels are then reconciled: nearby
//! candidates collapse to the highest-SNR one, which is compared against
//! the existing arrivals of the same station.

use log::debug;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use thiserror::Error;

use crate::beam::{beam_timeseries, BeamError, BeamType};
use crate::methods::{
    apply_methods, DataMethod, Demean, FilterType, IirFilter, MethodError, TaperData, TaperType,
};
use crate::ts::TimeSeries;

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("channel has no samples")]
    EmptyChannel,

    #[error(transparent)]
    Method(#[from] MethodError),

    #[error(transparent)]
    Beam(#[from] BeamError),
}

/// Which channels a recipe consumes.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
#[strum(ascii_case_insensitive)]
pub enum DetectorGroup {
    #[strum(serialize = "vertical")]
    #[serde(rename = "vertical")]
    Vertical,
    #[strum(serialize = "horizontal")]
    #[serde(rename = "horizontal")]
    Horizontal,
}

/// The filter column of a detector recipe.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct FilterDef {
    pub flow: f64,
    pub fhigh: f64,
    pub order: usize,
    pub zero_phase: bool,
    pub ftype: FilterType,
}

/// One row of the detector recipe table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StaLtaRecipe {
    pub name: String,
    pub beam_type: BeamType,
    pub group: DetectorGroup,
    /// Short-term average window \[s\].
    pub sta_sec: f64,
    /// Long-term average window \[s\].
    pub lta_sec: f64,
    /// Trigger-on ratio.
    pub htrig: f64,
    /// Trigger-off ratio.
    pub ltrig: f64,
    pub snr_threshold: f64,
    /// Triggers closer than this are merged \[s\].
    pub wtrig_sec: f64,
    /// Candidate reconciliation window \[s\].
    pub trgsep_sec: f64,
    pub buf_sec: f64,
    pub method: i32,
    pub filter: FilterDef,
}

impl Default for StaLtaRecipe {
    fn default() -> StaLtaRecipe {
        StaLtaRecipe {
            name: "Z0816".to_string(),
            beam_type: BeamType::Coherent,
            group: DetectorGroup::Vertical,
            sta_sec: 1.0,
            lta_sec: 60.0,
            htrig: 3.0,
            ltrig: 3.0,
            snr_threshold: 3.0,
            wtrig_sec: 1.0,
            trgsep_sec: 2.0,
            buf_sec: 0.1,
            method: 1,
            filter: FilterDef {
                flow: 0.8,
                fhigh: 1.6,
                order: 3,
                zero_phase: false,
                ftype: FilterType::BP,
            },
        }
    }
}

/// Candidate resolution state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CandidateState {
    /// Freshly detected, not yet reconciled.
    New,
    /// Best of its local group.
    Chosen,
    /// Supersedes an existing, weaker arrival.
    Replaces,
    /// A new arrival with no competing neighbour.
    Keep,
}

/// A detection produced by one recipe on one channel.
#[derive(Clone, Debug)]
pub struct DetectCandidate {
    pub time: f64,
    pub duration: f64,
    pub snr: f64,
    pub center_freq: f64,
    pub recipe_index: usize,
    pub channel_index: usize,
    pub sta: String,
    pub group: DetectorGroup,
    pub state: CandidateState,
    /// Arrival id superseded when `state == Replaces`.
    pub arid_to_replace: Option<i64>,
}

/// An already-catalogued arrival the candidates are compared against.
#[derive(Clone, Debug)]
pub struct ExistingArrival {
    pub sta: String,
    pub time: f64,
    pub snr: f64,
    pub arid: i64,
}

#[derive(Clone, Copy, Debug)]
struct Trigger {
    on: usize,
    off: usize,
    max_ratio: f64,
}

/// Run every recipe over every channel (horizontal recipes consume
/// channel pairs of one station) and reconcile the candidates. The
/// result is sorted by time. The progress callback is invoked at each
/// channel boundary; returning false stops the sweep there, keeping the
/// candidates found so far.
pub fn run_detector(
    channels: &[&TimeSeries],
    recipes: &[StaLtaRecipe],
    arrivals: &[ExistingArrival],
    mut progress: Option<&mut dyn FnMut(usize) -> bool>,
) -> Result<Vec<DetectCandidate>, DetectError> {
    let mut candidates = vec![];
    let mut i = 0;
    while i < channels.len() {
        if let Some(cb) = progress.as_mut() {
            if !cb(i) {
                debug!("detector cancelled at channel {i}");
                break;
            }
        }
        let results: Vec<(usize, Vec<DetectCandidate>)> = recipes
            .par_iter()
            .enumerate()
            .map(|(r_idx, recipe)| detect_with_recipe(channels, i, recipe, r_idx))
            .collect::<Result<_, DetectError>>()?;

        let mut n_used_max = 1;
        for (n_used, mut found) in results {
            n_used_max = n_used_max.max(n_used);
            candidates.append(&mut found);
        }
        i += n_used_max;
    }
    reconcile(&mut candidates, recipes, arrivals);
    Ok(candidates)
}

/// Apply a single recipe at channel `i`. Returns the number of channels
/// consumed and any candidates.
fn detect_with_recipe(
    channels: &[&TimeSeries],
    i: usize,
    recipe: &StaLtaRecipe,
    r_idx: usize,
) -> Result<(usize, Vec<DetectCandidate>), DetectError> {
    let (mut work, n_used) = match recipe.group {
        DetectorGroup::Vertical => (channels[i].clone(), 1),
        DetectorGroup::Horizontal => {
            let pair_ok = i + 1 < channels.len()
                && channels[i].sta() == channels[i + 1].sta()
                && is_horizontal(channels[i])
                && is_horizontal(channels[i + 1]);
            if !pair_ok {
                return Ok((1, vec![]));
            }
            let beam = beam_timeseries(
                &[channels[i], channels[i + 1]],
                &[0.0, 0.0],
                recipe.beam_type,
            )?;
            (beam, 2)
        }
    };
    if work.is_empty() {
        return Ok((n_used, vec![]));
    }
    let sta_name = if channels[i].sta().is_empty() {
        channels[i].net().to_string()
    } else {
        channels[i].sta().to_string()
    };

    let dt = work.dt().ok_or(DetectError::EmptyChannel)?;
    let f = &recipe.filter;
    let methods = [
        DataMethod::Demean(Demean),
        DataMethod::Taper(TaperData::new(TaperType::Cosine, 5, 5, 50)),
        DataMethod::IirFilter(IirFilter::new(
            f.order,
            f.ftype,
            f.flow,
            f.fhigh,
            dt,
            f.zero_phase,
        )?),
    ];
    apply_methods(&methods, &mut [&mut work])?;
    let cfreq = f.flow + (f.fhigh - f.flow) / 2.0;

    let nsta = ((recipe.sta_sec / dt).round() as usize).max(1);
    let nlta = ((recipe.lta_sec / dt).round() as usize).max(nsta + 1);
    let nwtrig = (recipe.wtrig_sec / dt).round() as usize;

    let mut found = vec![];
    for (si, seg) in work.segments().iter().enumerate() {
        // Bridge short gaps by prepending the tail of the previous
        // segment, so the long-term average does not restart cold.
        let mut data: Vec<f32> = vec![];
        let mut prepend = 0usize;
        if si > 0 {
            let prev = work.segment(si - 1);
            let rates_match = (prev.dt() - seg.dt()).abs() / seg.dt() < 0.02
                && (prev.calib() - seg.calib()).abs() / seg.calib().abs().max(1e-30) < 0.02
                && (prev.calper() - seg.calper()).abs() / seg.calper().abs().max(1e-30) < 0.02;
            let gap = seg.t_begin() - (prev.t_end() + prev.dt());
            if rates_match && gap < recipe.lta_sec {
                prepend = nlta.min(prev.len());
            } else if rates_match && gap < 4.0 * recipe.lta_sec {
                prepend = (nlta / 2).min(prev.len());
            }
            if prepend > 0 {
                data.extend_from_slice(&prev.data()[prev.len() - prepend..]);
            }
        }
        data.extend_from_slice(seg.data());

        let triggers = stalta_triggers(&data, nsta, nlta, nwtrig, recipe.htrig, recipe.ltrig);
        debug!(
            "{}: recipe {} segment {si}: {} triggers",
            sta_name,
            recipe.name,
            triggers.len()
        );
        for t in triggers {
            if t.max_ratio > recipe.snr_threshold && t.on >= prepend {
                found.push(DetectCandidate {
                    time: seg.t_begin() + (t.on - prepend) as f64 * dt,
                    duration: (t.off - t.on) as f64 * dt,
                    snr: t.max_ratio,
                    center_freq: cfreq,
                    recipe_index: r_idx,
                    channel_index: i,
                    sta: sta_name.clone(),
                    group: recipe.group,
                    state: CandidateState::New,
                    arid_to_replace: None,
                });
            }
        }
    }
    Ok((n_used, found))
}

fn is_horizontal(ts: &TimeSeries) -> bool {
    matches!(ts.vang(), Some(v) if (v - 90.0).abs() < 0.1)
}

/// The trigger state machine over one contiguous buffer.
///
/// The short-term average runs over the trailing `nsta` samples of the
/// squared signal; the long-term average over the up-to-`nlta` samples
/// that have left the short window, frozen while a trigger is on. A
/// trigger opens when the ratio reaches `htrig` and closes when it
/// falls below `ltrig`; triggers separated by fewer than `nwtrig`
/// samples are merged.
fn stalta_triggers(
    data: &[f32],
    nsta: usize,
    nlta: usize,
    nwtrig: usize,
    htrig: f64,
    ltrig: f64,
) -> Vec<Trigger> {
    let n = data.len();
    let mut triggers: Vec<Trigger> = vec![];
    if n < 2 * nsta {
        return triggers;
    }
    let sq: Vec<f64> = data.iter().map(|&v| f64::from(v) * f64::from(v)).collect();

    let mut sta_sum = 0.0f64;
    let mut lta: std::collections::VecDeque<f64> = std::collections::VecDeque::new();
    let mut lta_sum = 0.0f64;
    let mut on: Option<(usize, f64)> = None;

    for i in 0..n {
        sta_sum += sq[i];
        if i >= nsta {
            sta_sum -= sq[i - nsta];
            if on.is_none() {
                lta.push_back(sq[i - nsta]);
                lta_sum += sq[i - nsta];
                if lta.len() > nlta {
                    lta_sum -= lta.pop_front().unwrap();
                }
            }
        }
        // Need a full short window and enough long-term history for the
        // ratio to be stable.
        if i + 1 < 2 * nsta || lta.len() < nlta.min(5 * nsta) {
            continue;
        }
        let lta_mean = lta_sum / lta.len() as f64;
        if lta_mean <= 0.0 {
            continue;
        }
        let ratio = (sta_sum / nsta as f64) / lta_mean;

        match on {
            None => {
                if ratio >= htrig {
                    on = Some((i, ratio));
                }
            }
            Some((on_idx, max_ratio)) => {
                let max_ratio = max_ratio.max(ratio);
                if ratio < ltrig {
                    push_merged(&mut triggers, on_idx, i, max_ratio, nwtrig);
                    on = None;
                } else {
                    on = Some((on_idx, max_ratio));
                }
            }
        }
    }
    if let Some((on_idx, max_ratio)) = on {
        push_merged(&mut triggers, on_idx, n - 1, max_ratio, nwtrig);
    }
    triggers
}

fn push_merged(triggers: &mut Vec<Trigger>, on: usize, off: usize, max_ratio: f64, nwtrig: usize) {
    if let Some(last) = triggers.last_mut() {
        if on.saturating_sub(last.off) <= nwtrig {
            last.off = off;
            last.max_ratio = last.max_ratio.max(max_ratio);
            return;
        }
    }
    triggers.push(Trigger { on, off, max_ratio });
}

/// Reconcile candidates across recipes and channels, then against
/// existing arrivals. Candidates are sorted by time; within each
/// trigger-separation window the highest-SNR candidate of the leading
/// station becomes `Chosen`, and a chosen candidate becomes `Keep` when
/// no nearby arrival matches it, or `Replaces` when it beats one.
/// Already-resolved candidates are never reprocessed, so a second pass
/// is a no-op.
pub fn reconcile(
    candidates: &mut [DetectCandidate],
    recipes: &[StaLtaRecipe],
    arrivals: &[ExistingArrival],
) {
    candidates.sort_by(|a, b| a.time.partial_cmp(&b.time).unwrap());

    // Collapse nearby candidates to the best SNR of the same station.
    let n = candidates.len();
    let mut i = 0;
    while i < n {
        let sep = recipes[candidates[i].recipe_index].trgsep_sec;
        let max_time = candidates[i].time + sep;
        let mut j = 0;
        for k in i + 1..n {
            if candidates[k].time > max_time {
                break;
            }
            j += 1;
        }
        let mut best = i;
        for k in i + 1..=i + j {
            if candidates[k].snr > candidates[best].snr && candidates[k].sta == candidates[i].sta {
                best = k;
            }
        }
        if candidates[best].state == CandidateState::New {
            candidates[best].state = CandidateState::Chosen;
        }
        i += 1 + j;
    }

    // Compare the chosen candidates with the existing arrivals.
    if arrivals.is_empty() {
        for c in candidates.iter_mut() {
            if c.state == CandidateState::Chosen {
                c.state = CandidateState::Keep;
            }
        }
        return;
    }
    for c in candidates.iter_mut() {
        if c.state != CandidateState::Chosen {
            continue;
        }
        let sep = recipes[c.recipe_index].trgsep_sec;
        let min_time = c.time - sep;
        let max_time = c.time + sep;
        let mut found_larger = false;
        for a in arrivals {
            if a.time < min_time || a.time > max_time || a.sta != c.sta {
                continue;
            }
            if !found_larger && c.snr > a.snr && c.state == CandidateState::Chosen {
                c.state = CandidateState::Replaces;
                c.arid_to_replace = Some(a.arid);
            } else if c.snr <= a.snr {
                found_larger = true;
            }
        }
        if c.state == CandidateState::Chosen && !found_larger {
            c.state = CandidateState::Keep;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts::Segment;
    use approx::assert_abs_diff_eq;
    use rand::{Rng, SeedableRng};

    /// Deterministic N(0,1) noise via Box-Muller.
    fn gaussian_noise(n: usize, seed: u64) -> Vec<f32> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                let u1: f64 = rng.gen_range(1e-12..1.0);
                let u2: f64 = rng.gen();
                ((-2.0 * u1.ln()).sqrt() * (2.0 * crate::constants::PI * u2).cos()) as f32
            })
            .collect()
    }

    fn spike_recipe() -> StaLtaRecipe {
        StaLtaRecipe {
            // A pass-through filter keeps the scenario exact.
            filter: FilterDef {
                flow: 0.0,
                fhigh: 0.0,
                order: 0,
                zero_phase: false,
                ftype: FilterType::NA,
            },
            ..StaLtaRecipe::default()
        }
    }

    #[test]
    fn test_single_spike_single_candidate() {
        // 60 s of N(0,1) noise at 20 Hz with one spike of amplitude 10
        // at t = 30 s: exactly one candidate within one sample of it.
        let dt = 0.05;
        let mut data = gaussian_noise(1200, 7);
        data[600] = 10.0;
        let mut ts = TimeSeries::new();
        ts.set_channel("STA1", "shz", "XX");
        ts.add_segment(Segment::new(data, 0.0, dt, 1.0, 1.0).unwrap())
            .unwrap();

        let recipes = [spike_recipe()];
        let out = run_detector(&[&ts], &recipes, &[], None).unwrap();
        assert_eq!(out.len(), 1, "candidates: {out:?}");
        assert_abs_diff_eq!(out[0].time, 30.0, epsilon = dt);
        assert!(out[0].snr > 3.0);
        assert_eq!(out[0].state, CandidateState::Keep);
    }

    #[test]
    fn test_noise_only_no_candidates() {
        let dt = 0.05;
        let data = gaussian_noise(1200, 19);
        let mut ts = TimeSeries::new();
        ts.set_channel("STA1", "shz", "XX");
        ts.add_segment(Segment::new(data, 0.0, dt, 1.0, 1.0).unwrap())
            .unwrap();
        let out = run_detector(&[&ts], &[spike_recipe()], &[], None).unwrap();
        assert!(out.is_empty(), "false triggers: {out:?}");
    }

    fn candidate(time: f64, snr: f64, sta: &str) -> DetectCandidate {
        DetectCandidate {
            time,
            duration: 1.0,
            snr,
            center_freq: 1.2,
            recipe_index: 0,
            channel_index: 0,
            sta: sta.to_string(),
            group: DetectorGroup::Vertical,
            state: CandidateState::New,
            arid_to_replace: None,
        }
    }

    #[test]
    fn test_reconcile_picks_best_snr() {
        let recipes = [StaLtaRecipe::default()];
        let mut c = vec![
            candidate(100.0, 4.0, "A"),
            candidate(100.5, 9.0, "A"),
            candidate(101.0, 5.0, "A"),
            candidate(200.0, 6.0, "A"),
        ];
        reconcile(&mut c, &recipes, &[]);
        // Within the 2 s separation the 9.0 wins; the isolated one also
        // survives.
        assert_eq!(c[0].state, CandidateState::New);
        assert_eq!(c[1].state, CandidateState::Keep);
        assert_eq!(c[2].state, CandidateState::New);
        assert_eq!(c[3].state, CandidateState::Keep);
    }

    #[test]
    fn test_reconcile_idempotent() {
        let recipes = [StaLtaRecipe::default()];
        let arrivals = [ExistingArrival {
            sta: "A".to_string(),
            time: 100.4,
            snr: 5.0,
            arid: 11,
        }];
        let mut c = vec![
            candidate(100.0, 4.0, "A"),
            candidate(100.5, 9.0, "A"),
            candidate(200.0, 6.0, "A"),
        ];
        reconcile(&mut c, &recipes, &arrivals);
        let first: Vec<(CandidateState, Option<i64>)> =
            c.iter().map(|x| (x.state, x.arid_to_replace)).collect();
        reconcile(&mut c, &recipes, &arrivals);
        let second: Vec<(CandidateState, Option<i64>)> =
            c.iter().map(|x| (x.state, x.arid_to_replace)).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_reconcile_against_arrivals() {
        let recipes = [StaLtaRecipe::default()];
        // The chosen candidate beats the nearby arrival: it replaces it.
        let arrivals = [ExistingArrival {
            sta: "A".to_string(),
            time: 100.2,
            snr: 5.0,
            arid: 42,
        }];
        let mut c = vec![candidate(100.0, 9.0, "A")];
        reconcile(&mut c, &recipes, &arrivals);
        assert_eq!(c[0].state, CandidateState::Replaces);
        assert_eq!(c[0].arid_to_replace, Some(42));

        // A stronger arrival nearby: the candidate is not kept.
        let arrivals = [ExistingArrival {
            sta: "A".to_string(),
            time: 100.2,
            snr: 50.0,
            arid: 43,
        }];
        let mut c = vec![candidate(100.0, 9.0, "A")];
        reconcile(&mut c, &recipes, &arrivals);
        assert_eq!(c[0].state, CandidateState::Chosen);
        assert_eq!(c[0].arid_to_replace, None);

        // A different station's arrival does not interfere.
        let arrivals = [ExistingArrival {
            sta: "B".to_string(),
            time: 100.2,
            snr: 50.0,
            arid: 44,
        }];
        let mut c = vec![candidate(100.0, 9.0, "A")];
        reconcile(&mut c, &recipes, &arrivals);
        assert_eq!(c[0].state, CandidateState::Keep);
    }

    #[test]
    fn test_horizontal_pair_consumed_together() {
        let dt = 0.05;
        let mut e = TimeSeries::new();
        e.set_channel("STA1", "she", "XX");
        e.set_orientation(90.0, 90.0);
        let mut n = TimeSeries::new();
        n.set_channel("STA1", "shn", "XX");
        n.set_orientation(0.0, 90.0);
        let mut noise_e = gaussian_noise(1200, 3);
        let mut noise_n = gaussian_noise(1200, 5);
        noise_e[600] = 10.0;
        noise_n[600] = 10.0;
        e.add_segment(Segment::new(noise_e, 0.0, dt, 1.0, 1.0).unwrap())
            .unwrap();
        n.add_segment(Segment::new(noise_n, 0.0, dt, 1.0, 1.0).unwrap())
            .unwrap();

        let recipe = StaLtaRecipe {
            group: DetectorGroup::Horizontal,
            beam_type: BeamType::Incoherent,
            ..spike_recipe()
        };
        let out = run_detector(&[&e, &n], &[recipe], &[], None).unwrap();
        assert_eq!(out.len(), 1, "candidates: {out:?}");
        assert_abs_diff_eq!(out[0].time, 30.0, epsilon = dt);
    }

    #[test]
    fn test_progress_callback_cancels() {
        let dt = 0.05;
        let mut channels = vec![];
        for k in 0..3u64 {
            let mut ts = TimeSeries::new();
            ts.set_channel(&format!("S{k}"), "shz", "XX");
            let mut data = gaussian_noise(1200, k);
            data[600] = 10.0;
            ts.add_segment(Segment::new(data, 0.0, dt, 1.0, 1.0).unwrap())
                .unwrap();
            channels.push(ts);
        }
        let refs: Vec<&TimeSeries> = channels.iter().collect();
        let mut calls = 0;
        let mut cb = |_i: usize| {
            calls += 1;
            calls <= 1
        };
        let out = run_detector(&refs, &[spike_recipe()], &[], Some(&mut cb)).unwrap();
        // Only the first channel was processed.
        assert_eq!(out.len(), 1);
    }
}
