use crate::common::ExtractedFrame;
use std::cmp::Ordering;

/// Share of the limit filled by motion ranking; the rest strides the timeline.
const MOTION_NUMERATOR: usize = 7;
const MOTION_DENOMINATOR: usize = 10;

/// Picks a bounded, motion-prioritized subset of a video's frames that still
/// covers the whole gesture. Deterministic: no randomness, and input order
/// does not matter because every comparison ends on the frame id.
#[derive(Debug, Clone, Copy)]
pub struct FrameSelector {
    max_frames: usize,
}

impl FrameSelector {
    pub fn new(max_frames: usize) -> Self {
        Self { max_frames }
    }

    /// Returns at most `max_frames` frames sorted by `(timestamp, id)`.
    pub fn select(&self, candidates: &[ExtractedFrame]) -> Vec<ExtractedFrame> {
        let mut timeline: Vec<&ExtractedFrame> = candidates.iter().collect();
        timeline.sort_by(|a, b| temporal_order(a, b));

        let n = timeline.len();
        let limit = self.max_frames;
        if n <= limit {
            return timeline.into_iter().cloned().collect();
        }

        let mut selected = vec![false; n];
        let mut taken = 0;

        let motion_quota = limit * MOTION_NUMERATOR / MOTION_DENOMINATOR;
        let mut ranked: Vec<usize> = (0..n).collect();
        ranked.sort_by(|&a, &b| motion_rank(timeline[a], timeline[b]).then(a.cmp(&b)));
        for &index in ranked.iter().take(motion_quota) {
            selected[index] = true;
            taken += 1;
        }

        let fill = limit - motion_quota;
        for step in 0..fill {
            let index = step * n / fill;
            if !selected[index] {
                selected[index] = true;
                taken += 1;
            }
        }

        // Stride hits on already-ranked frames leave gaps; earliest frames fill them.
        for flag in selected.iter_mut() {
            if taken >= limit {
                break;
            }
            if !*flag {
                *flag = true;
                taken += 1;
            }
        }

        tracing::debug!(
            "Selected {} of {} frames ({} by motion)",
            taken,
            n,
            motion_quota
        );

        timeline
            .into_iter()
            .zip(selected)
            .filter_map(|(frame, keep)| keep.then(|| frame.clone()))
            .collect()
    }
}

fn temporal_order(a: &ExtractedFrame, b: &ExtractedFrame) -> Ordering {
    a.timestamp_seconds
        .total_cmp(&b.timestamp_seconds)
        .then_with(|| a.id.cmp(&b.id))
}

/// Motion desc (unknown last), keyframes first, then earliest.
fn motion_rank(a: &ExtractedFrame, b: &ExtractedFrame) -> Ordering {
    let motion = |frame: &ExtractedFrame| frame.motion_score.filter(|m| m.is_finite());
    let by_motion = match (motion(a), motion(b)) {
        (Some(x), Some(y)) => y.total_cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    let keyframe = |frame: &ExtractedFrame| frame.is_keyframe.unwrap_or(false);
    by_motion
        .then_with(|| keyframe(b).cmp(&keyframe(a)))
        .then_with(|| temporal_order(a, b))
}
