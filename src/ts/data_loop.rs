// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! A bounded ring of segments per channel for realtime feeds.
//!
//! The loop stores segments in the order they arrive. Its capacity grows
//! until the held duration reaches `min_duration`; after that, adding a
//! segment drops the oldest one, but only when the remaining duration
//! still covers `min_duration`. The current wall-clock is always passed
//! in by the caller.

use std::collections::VecDeque;
use std::sync::Arc;

use log::debug;

use super::Segment;

/// A named ring buffer of shared segments for one channel.
#[derive(Clone, Debug)]
pub struct DataLoop {
    net: String,
    sta: String,
    chan: String,
    min_duration: f64,
    duration: f64,
    beg_time: f64,
    end_time: f64,
    max_overlap: f64,
    max_future_time: f64,
    max_age: f64,
    capacity: usize,
    segments: VecDeque<Arc<Segment>>,
}

impl DataLoop {
    /// A new loop that will grow from `initial_capacity` segments until
    /// at least `min_duration` seconds of data are held. Station and
    /// network names are stored uppercased, channels lowercased.
    pub fn new(
        net: &str,
        sta: &str,
        chan: &str,
        initial_capacity: usize,
        min_duration: f64,
    ) -> DataLoop {
        DataLoop {
            net: net.to_uppercase(),
            sta: sta.to_uppercase(),
            chan: chan.to_lowercase(),
            min_duration,
            duration: 0.0,
            beg_time: 0.0,
            end_time: 0.0,
            max_overlap: -1.0,
            max_future_time: -1.0,
            max_age: -1.0,
            capacity: initial_capacity.max(1),
            segments: VecDeque::new(),
        }
    }

    pub fn net(&self) -> &str {
        &self.net
    }

    pub fn sta(&self) -> &str {
        &self.sta
    }

    pub fn chan(&self) -> &str {
        &self.chan
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Seconds of data currently held.
    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn beg_time(&self) -> f64 {
        self.beg_time
    }

    pub fn end_time(&self) -> f64 {
        self.end_time
    }

    /// Maximum amount a new segment may overlap the loop's end time.
    /// Negative disables the check (the initial state).
    pub fn set_max_overlap(&mut self, max_overlap: f64) {
        self.max_overlap = max_overlap;
    }

    /// Maximum amount a segment's begin time may lie beyond `now`.
    /// Negative disables the check.
    pub fn set_max_future_time(&mut self, max_future_time: f64) {
        self.max_future_time = max_future_time.abs();
    }

    /// Maximum value allowed for `now - segment begin time`. Negative
    /// disables the check.
    pub fn set_max_age(&mut self, max_age: f64) {
        self.max_age = max_age;
    }

    /// Change the minimum held duration. Shrinking may drop the oldest
    /// segments immediately.
    pub fn set_min_duration(&mut self, min_duration: f64) {
        if min_duration == self.min_duration {
            return;
        }
        let shrink = min_duration < self.min_duration;
        self.min_duration = min_duration;
        if !shrink || self.segments.len() < 2 {
            return;
        }
        // Keep the newest run of segments that still covers the new
        // minimum duration.
        let mut d = 0.0;
        let mut keep = 0;
        for s in self.segments.iter().rev() {
            d += s.t_end() - s.t_begin();
            keep += 1;
            if d > min_duration {
                break;
            }
        }
        while self.segments.len() > keep {
            let s = self.segments.pop_front().unwrap();
            self.duration -= s.t_end() - s.t_begin();
        }
        self.capacity = self.segments.len().max(1);
        if let Some(s) = self.segments.front() {
            self.beg_time = s.t_begin();
        }
    }

    /// Add a segment to the loop. Returns false when the segment is
    /// rejected by the overlap, future-time or age rules.
    pub fn add_segment(&mut self, seg: Arc<Segment>, now: f64) -> bool {
        if self.max_overlap >= 0.0 {
            if let Some(tail) = self.segments.back() {
                if seg.t_begin() < tail.t_end() - self.max_overlap {
                    debug!(
                        "data loop {}/{}: rejecting overlapping segment at {}",
                        self.sta,
                        self.chan,
                        seg.t_begin()
                    );
                    return false;
                }
            }
        }
        if self.max_future_time > 0.0 && seg.t_begin() > now + self.max_future_time {
            debug!(
                "data loop {}/{}: rejecting future segment at {}",
                self.sta,
                self.chan,
                seg.t_begin()
            );
            return false;
        }
        if self.max_age >= 0.0 && now - seg.t_begin() > self.max_age {
            debug!(
                "data loop {}/{}: rejecting old segment at {}",
                self.sta,
                self.chan,
                seg.t_begin()
            );
            return false;
        }

        let seg_dur = seg.t_end() - seg.t_begin();
        if self.segments.len() == self.capacity {
            let oldest_dur = self
                .segments
                .front()
                .map(|s| s.t_end() - s.t_begin())
                .unwrap_or(0.0);
            let new_duration = if self.segments.len() > 1 {
                self.duration + seg_dur - oldest_dur
            } else {
                self.duration + seg_dur
            };
            if self.duration < self.min_duration || new_duration < self.min_duration {
                // Dropping the oldest would fall below the minimum
                // duration, so grow instead.
                self.capacity += 1;
                debug!(
                    "data loop {}/{}: increasing capacity to {}",
                    self.sta, self.chan, self.capacity
                );
            } else {
                let old = self.segments.pop_front().unwrap();
                self.duration -= old.t_end() - old.t_begin();
                if let Some(front) = self.segments.front() {
                    self.beg_time = front.t_begin();
                } else {
                    self.beg_time = seg.t_begin();
                }
            }
        }
        if self.segments.is_empty() {
            self.beg_time = seg.t_begin();
        }
        self.end_time = seg.t_end();
        self.duration += seg_dur;
        self.segments.push_back(seg);
        true
    }

    /// Segments received after `last_seg` in insertion order. `None`
    /// returns everything in the loop.
    pub fn get_data(&self, last_seg: Option<&Arc<Segment>>) -> Vec<Arc<Segment>> {
        let start = match last_seg {
            Some(last) => match self
                .segments
                .iter()
                .rposition(|s| Arc::ptr_eq(s, last))
            {
                Some(i) => i + 1,
                // Marker already rotated out; everything is new.
                None => 0,
            },
            None => 0,
        };
        self.segments.iter().skip(start).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(t_begin: f64, n: usize) -> Arc<Segment> {
        Arc::new(Segment::new(vec![0.0; n], t_begin, 1.0, 1.0, 1.0).unwrap())
    }

    #[test]
    fn test_grows_until_min_duration() {
        let mut dl = DataLoop::new("IM", "abc", "SHZ", 1, 25.0);
        assert_eq!(dl.sta(), "ABC");
        assert_eq!(dl.chan(), "shz");
        // Each segment covers 9 s; the loop keeps growing until it holds
        // at least 25 s (three segments).
        for k in 0..3 {
            assert!(dl.add_segment(seg(k as f64 * 10.0, 10), 1000.0));
        }
        assert_eq!(dl.len(), 3);
        // A swap now keeps 27 s >= 25 s held, so the oldest is dropped
        // instead of growing further.
        assert!(dl.add_segment(seg(30.0, 10), 1000.0));
        assert_eq!(dl.len(), 3);
        assert_eq!(dl.beg_time(), 10.0);
    }

    #[test]
    fn test_rejects_by_rules() {
        let mut dl = DataLoop::new("IM", "ABC", "shz", 4, 100.0);
        dl.add_segment(seg(0.0, 11), 20.0);

        dl.set_max_overlap(0.5);
        // Tail ends at t=10; a segment starting before 9.5 is rejected.
        assert!(!dl.add_segment(seg(5.0, 10), 20.0));
        assert!(dl.add_segment(seg(9.8, 10), 20.0));

        dl.set_max_future_time(30.0);
        assert!(!dl.add_segment(seg(100.0, 10), 20.0));

        dl.set_max_age(50.0);
        assert!(!dl.add_segment(seg(20.0, 10), 200.0));
    }

    #[test]
    fn test_get_data_since_marker() {
        let mut dl = DataLoop::new("IM", "ABC", "shz", 8, 100.0);
        let s1 = seg(0.0, 10);
        let s2 = seg(10.0, 10);
        let s3 = seg(20.0, 10);
        dl.add_segment(Arc::clone(&s1), 30.0);
        dl.add_segment(Arc::clone(&s2), 30.0);
        dl.add_segment(Arc::clone(&s3), 30.0);

        assert_eq!(dl.get_data(None).len(), 3);
        let newer = dl.get_data(Some(&s2));
        assert_eq!(newer.len(), 1);
        assert!(Arc::ptr_eq(&newer[0], &s3));
        assert!(dl.get_data(Some(&s3)).is_empty());
    }
}
