use crate::logging::{Id, LogError, StatsLogger};
use std::ops::AddAssign;

/// Per-minibatch averages of the PPO loss terms over one update.
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct UpdateStats {
    pub value_loss: f64,
    pub action_loss: f64,
    /// Weighted entropy bonus, scaled by the global entropy coefficient.
    pub entropy_loss: f64,
    pub pano_entropy: f64,
    pub offset_entropy: f64,
    pub distance_entropy: f64,
}

impl UpdateStats {
    /// Divide every accumulated value by `count`.
    #[must_use]
    pub fn averaged(self, count: usize) -> Self {
        #[allow(clippy::cast_precision_loss)]
        let n = count.max(1) as f64;
        Self {
            value_loss: self.value_loss / n,
            action_loss: self.action_loss / n,
            entropy_loss: self.entropy_loss / n,
            pano_entropy: self.pano_entropy / n,
            offset_entropy: self.offset_entropy / n,
            distance_entropy: self.distance_entropy / n,
        }
    }

    /// Log all statistics as one group.
    pub fn log(&self, logger: &mut dyn StatsLogger) -> Result<(), LogError> {
        logger.group_start();
        let result = self.group_log(logger);
        logger.group_end();
        result
    }

    fn group_log(&self, logger: &mut dyn StatsLogger) -> Result<(), LogError> {
        logger.group_log(Id::new("value_loss"), self.value_loss.into())?;
        logger.group_log(Id::new("action_loss"), self.action_loss.into())?;
        logger.group_log(Id::new("entropy_loss"), self.entropy_loss.into())?;
        logger.group_log(Id::new("pano_entropy"), self.pano_entropy.into())?;
        logger.group_log(Id::new("offset_entropy"), self.offset_entropy.into())?;
        logger.group_log(Id::new("distance_entropy"), self.distance_entropy.into())
    }
}

impl AddAssign for UpdateStats {
    fn add_assign(&mut self, other: Self) {
        self.value_loss += other.value_loss;
        self.action_loss += other.action_loss;
        self.entropy_loss += other.entropy_loss;
        self.pano_entropy += other.pano_entropy;
        self.offset_entropy += other.offset_entropy;
        self.distance_entropy += other.distance_entropy;
    }
}
