// heapdbg - Heap origin debugger
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


use crate::BdhsConfig;

/// What a step means for the run, given whether its heap search matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDecision {
    /// Nothing found yet; keep stepping
    Searching,
    /// First step with a match; keep stepping to fill the window
    FirstMatch,
    /// Inside the window after the first match; keep stepping
    Finalising,
    /// Report the result now
    Finalise,
}

/// Steps collected around the first match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToleranceWindow {
    /// Steps reported before the first match
    pub before: usize,
    /// Steps run after the first match
    pub after: usize,
    /// Finalise as soon as a step after the first match finds nothing
    pub stop_on_match_loss: bool,
}

impl From<&BdhsConfig> for ToleranceWindow {
    fn from(config: &BdhsConfig) -> Self {
        Self {
            before: config.before,
            after: config.after,
            stop_on_match_loss: config.stop_on_match_loss,
        }
    }
}

impl ToleranceWindow {
    /// Number of history entries covered by a report
    pub fn span(&self) -> usize {
        self.before + self.after + 1
    }

    /// Classify `step`. `first_match` records the step of the first match.
    pub fn decide(&self, first_match: &mut Option<u64>, step: u64, found: bool) -> StepDecision {
        let Some(first) = *first_match else {
            if !found {
                return StepDecision::Searching;
            }
            *first_match = Some(step);
            return if self.after == 0 { StepDecision::Finalise } else { StepDecision::FirstMatch };
        };

        if !found && self.stop_on_match_loss {
            return StepDecision::Finalise;
        }
        if step.saturating_sub(first) >= self.after as u64 {
            StepDecision::Finalise
        } else {
            StepDecision::Finalising
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(window: ToleranceWindow, matches: impl Fn(u64) -> bool) -> (u64, Option<u64>) {
        let mut first = None;
        for step in 1..=100 {
            if window.decide(&mut first, step, matches(step)) == StepDecision::Finalise {
                return (step, first);
            }
        }
        (0, first)
    }

    fn window(stop_on_match_loss: bool) -> ToleranceWindow {
        ToleranceWindow { before: 2, after: 3, stop_on_match_loss }
    }

    #[test]
    fn test_lone_match_fills_the_window() {
        assert_eq!(run(window(false), |step| step == 7), (10, Some(7)));
    }

    #[test]
    fn test_persistent_match_fills_the_window() {
        assert_eq!(run(window(false), |step| step >= 5), (8, Some(5)));
        assert_eq!(run(window(true), |step| step >= 5), (8, Some(5)));
    }

    #[test]
    fn test_match_loss_finalises_early() {
        assert_eq!(run(window(true), |step| step == 7), (8, Some(7)));
    }

    #[test]
    fn test_zero_after_finalises_on_first_match() {
        let window = ToleranceWindow { before: 0, after: 0, stop_on_match_loss: false };
        assert_eq!(run(window, |step| step == 3), (3, Some(3)));
        assert_eq!(window.span(), 1);
    }

    #[test]
    fn test_decisions_in_order() {
        let window = window(false);
        let mut first = None;
        let decisions: Vec<_> = [false, true, false, true, false]
            .iter()
            .zip(1..)
            .map(|(found, step)| window.decide(&mut first, step, *found))
            .collect();
        assert_eq!(
            decisions,
            vec![
                StepDecision::Searching,
                StepDecision::FirstMatch,
                StepDecision::Finalising,
                StepDecision::Finalising,
                StepDecision::Finalise,
            ]
        );
    }
}
