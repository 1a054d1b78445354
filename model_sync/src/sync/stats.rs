use std::fmt;

/// Loss and accuracy bookkeeping shared by every worker of a process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainStats {
    pub frames: u64,
    pub correct: u64,
    pub loss: f64,
    pub merges: u64,
}

impl TrainStats {
    /// Adds the results of one batch.
    ///
    /// # Arguments
    /// * `frames` - The amount of samples in the batch.
    /// * `loss` - The summed loss over the batch.
    /// * `correct` - The amount of correctly predicted samples.
    pub fn add_batch(&mut self, frames: usize, loss: f64, correct: usize) {
        self.frames += frames as u64;
        self.loss += loss;
        self.correct += correct as u64;
        self.merges += 1;
    }

    pub fn mean_loss(&self) -> f64 {
        if self.frames == 0 {
            return 0.;
        }

        self.loss / self.frames as f64
    }

    pub fn accuracy(&self) -> f64 {
        if self.frames == 0 {
            return 0.;
        }

        self.correct as f64 / self.frames as f64
    }
}

impl fmt::Display for TrainStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "frames {} merges {} loss {:.6} accuracy {:.2}%",
            self.frames,
            self.merges,
            self.mean_loss(),
            self.accuracy() * 100.
        )
    }
}
