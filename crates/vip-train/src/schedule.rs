//! Per-epoch schedules for the relaxation temperature and learning rate.

/// Linear temperature anneal from `start` to `end` over `epochs` epochs
/// (both endpoints included).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TemperatureSchedule {
    pub start: f32,
    pub end: f32,
    pub epochs: usize,
}

impl TemperatureSchedule {
    pub fn new(start: f32, end: f32, epochs: usize) -> Self {
        Self { start, end, epochs }
    }

    /// Temperature for 0-based `epoch`; epochs past the end hold `end`.
    pub fn at(&self, epoch: usize) -> f32 {
        if self.epochs <= 1 {
            return self.start;
        }
        let t = epoch.min(self.epochs - 1) as f32 / (self.epochs - 1) as f32;
        self.start + (self.end - self.start) * t
    }
}

/// Cosine annealing from `base_lr` at epoch 0 towards 0 at `total_epochs`.
pub fn cosine_lr(epoch: usize, total_epochs: usize, base_lr: f32) -> f32 {
    if total_epochs == 0 {
        return base_lr;
    }
    let progress = epoch.min(total_epochs) as f32 / total_epochs as f32;
    base_lr * 0.5 * (1.0 + (std::f32::consts::PI * progress).cos())
}
