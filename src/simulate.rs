//! Rehearsal backend that never touches the network.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::upload::{UploadError, Uploader};

/// Message reported for simulated rejections.
pub const SIMULATED_ERROR: &str = "Error!";

/// Shape of the simulated endpoint: response latency and rejection rate.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationProfile {
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Probability in `0.0..=1.0` that a request is rejected.
    pub error_rate: f64,
    /// Fixed seed for reproducible runs; entropy when unset.
    pub seed: Option<u64>,
}

impl Default for SimulationProfile {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(2),
            error_rate: 0.1,
            seed: None,
        }
    }
}

impl SimulationProfile {
    pub(crate) fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    /// `error_rate` clamped to `0.0..=1.0`; NaN and infinities never reject.
    pub fn rejection_probability(&self) -> f64 {
        if self.error_rate.is_finite() {
            self.error_rate.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    /// Draws the latency and verdict of one request.
    pub(crate) fn draw(&self, rng: &mut StdRng) -> (Duration, bool) {
        let min = self.min_delay.as_millis() as u64;
        let max = (self.max_delay.as_millis() as u64).max(min);
        let delay = Duration::from_millis(rng.gen_range(min..=max));
        let rejected = rng.gen_bool(self.rejection_probability());
        (delay, rejected)
    }
}

/// [`Uploader`] that sleeps and randomly rejects instead of sending bytes.
#[derive(Debug)]
pub struct SimulatedUploader {
    profile: SimulationProfile,
    rng: Mutex<StdRng>,
}

impl SimulatedUploader {
    pub fn new(profile: SimulationProfile) -> Self {
        let rng = Mutex::new(profile.rng());
        Self { profile, rng }
    }

    pub fn profile(&self) -> &SimulationProfile {
        &self.profile
    }

    async fn simulate(&self, path: &Path) -> Result<(), UploadError> {
        // Still touch the file so missing inputs fail like a real upload
        tokio::fs::metadata(path).await.map_err(|source| UploadError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let (delay, rejected) = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            self.profile.draw(&mut rng)
        };
        tokio::time::sleep(delay).await;

        if rejected {
            tracing::debug!(file = %path.display(), "simulated rejection");
            Err(UploadError::Rejected {
                errors: vec![SIMULATED_ERROR.to_string()],
            })
        } else {
            Ok(())
        }
    }
}

impl Uploader for SimulatedUploader {
    fn upload<'a>(
        &'a self,
        path: &'a Path,
        _query: &'a BTreeMap<String, String>,
    ) -> BoxFuture<'a, Result<(), UploadError>> {
        Box::pin(self.simulate(path))
    }
}
