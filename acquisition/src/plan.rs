//! Multi-dimensional acquisition plans.
//!
//! A [`SequencePlan`] expands into steps in time, position, channel, z order:
//! z varies fastest, then channel, then position, then time point.

use serde::{Deserialize, Serialize};
use shared::Step;

/// Nested loops over time points, stage positions, channels and z offsets.
///
/// Fields left out of a JSON plan take their [`Default`] values, so a plan
/// naming only channels images them once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencePlan {
    /// Number of time points
    pub loops: usize,
    /// Lateral offsets in µm; empty means no stage moves
    pub positions: Vec<(f64, f64)>,
    /// Channels imaged at every position
    pub channels: Vec<String>,
    /// Focus offsets in µm; empty means no focus change
    pub z_positions: Vec<f64>,
    /// Exposure override in seconds for every step
    pub exposure: Option<f64>,
}

impl Default for SequencePlan {
    fn default() -> Self {
        Self {
            loops: 1,
            positions: Vec::new(),
            channels: Vec::new(),
            z_positions: Vec::new(),
            exposure: None,
        }
    }
}

impl SequencePlan {
    /// One time point of `channels`.
    pub fn new<S: Into<String>>(channels: impl IntoIterator<Item = S>) -> Self {
        Self {
            channels: channels.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_loops(mut self, loops: usize) -> Self {
        self.loops = loops;
        self
    }

    pub fn with_positions(mut self, positions: Vec<(f64, f64)>) -> Self {
        self.positions = positions;
        self
    }

    pub fn with_z_positions(mut self, z_positions: Vec<f64>) -> Self {
        self.z_positions = z_positions;
        self
    }

    /// Evenly spaced z offsets from `start` to `stop` inclusive.
    ///
    /// A non-positive `step` yields just `start`.
    pub fn with_z_range(self, start: f64, stop: f64, step: f64) -> Self {
        let z = if step > 0.0 && stop >= start {
            let count = ((stop - start) / step + 1e-9).floor() as usize + 1;
            (0..count).map(|i| start + i as f64 * step).collect()
        } else {
            vec![start]
        };
        self.with_z_positions(z)
    }

    pub fn with_exposure(mut self, exposure_s: f64) -> Self {
        self.exposure = Some(exposure_s);
        self
    }

    /// Number of steps the plan expands to.
    pub fn len(&self) -> usize {
        self.loops * self.positions.len().max(1) * self.channels.len() * self.z_positions.len().max(1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lazily expand the plan into indexed steps.
    pub fn steps(&self) -> impl Iterator<Item = Step> + '_ {
        let positions: Vec<Option<(f64, f64)>> = if self.positions.is_empty() {
            vec![None]
        } else {
            self.positions.iter().copied().map(Some).collect()
        };
        let z_positions: Vec<Option<f64>> = if self.z_positions.is_empty() {
            vec![None]
        } else {
            self.z_positions.iter().copied().map(Some).collect()
        };

        (0..self.loops)
            .flat_map(move |_| {
                let z_positions = z_positions.clone();
                positions.clone().into_iter().flat_map(move |xy| {
                    let z_positions = z_positions.clone();
                    self.channels.iter().flat_map(move |channel| {
                        z_positions.clone().into_iter().map(move |z| (xy, channel, z))
                    })
                })
            })
            .enumerate()
            .map(move |(index, (xy, channel, z))| {
                let mut step = Step::new(index, channel.as_str());
                step.xy = xy;
                step.z = z;
                step.exposure = self.exposure;
                step
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_order_is_time_position_channel_z() {
        let plan = SequencePlan::new(["488", "561"])
            .with_loops(2)
            .with_positions(vec![(0.0, 0.0), (100.0, 0.0)])
            .with_z_positions(vec![-1.0, 1.0]);

        let steps: Vec<Step> = plan.steps().collect();

        assert_eq!(steps.len(), plan.len());
        assert_eq!(steps.len(), 16);
        assert!(steps.iter().enumerate().all(|(i, s)| s.index == i));

        assert_eq!(steps[0].channel, "488");
        assert_eq!(steps[0].z, Some(-1.0));
        assert_eq!(steps[1].z, Some(1.0));
        assert_eq!(steps[2].channel, "561");
        assert_eq!(steps[4].xy, Some((100.0, 0.0)));
        assert_eq!(steps[8].xy, Some((0.0, 0.0)));
        assert_eq!(steps[8].channel, "488");
    }

    #[test]
    fn test_empty_axes_are_skipped() {
        let plan = SequencePlan::new(["LED"]).with_loops(3).with_exposure(0.05);
        let steps: Vec<Step> = plan.steps().collect();

        assert_eq!(steps.len(), 3);
        assert!(steps.iter().all(|s| s.z.is_none() && s.xy.is_none()));
        assert!(steps.iter().all(|s| s.exposure == Some(0.05)));
    }

    #[test]
    fn test_no_channels_means_no_steps() {
        let plan = SequencePlan::new(Vec::<String>::new()).with_loops(5);
        assert!(plan.is_empty());
        assert_eq!(plan.steps().count(), 0);
    }

    #[test]
    fn test_z_range_is_inclusive() {
        let plan = SequencePlan::new(["488"]).with_z_range(-1.0, 1.0, 0.5);
        assert_eq!(plan.z_positions.len(), 5);
        assert_relative_eq!(plan.z_positions[4], 1.0);

        let single = SequencePlan::new(["488"]).with_z_range(2.0, 1.0, 0.5);
        assert_eq!(single.z_positions, vec![2.0]);
    }

    #[test]
    fn test_plan_without_loops_images_once() {
        let plan: SequencePlan = serde_json::from_str(r#"{"channels": ["488"]}"#).unwrap();
        assert_eq!(plan.loops, 1);
        assert_eq!(plan.steps().count(), 1);

        let plan: SequencePlan =
            serde_json::from_str(r#"{"channels": ["488", "561"], "z_positions": [0.0, 2.0]}"#)
                .unwrap();
        assert_eq!(plan.len(), 4);
        assert_eq!(plan.steps().count(), 4);
    }
}
