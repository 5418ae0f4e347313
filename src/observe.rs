use crate::{evaluate::CellKey, grid::TrimCombo};
use log::{info, warn};

/// Receives the milestones of a sweep. The denoise phase reports from
/// worker threads, hence `Sync`.
pub trait SweepObserver: Sync {
    fn combo_started(&self, _combo: TrimCombo) {}
    fn cache_hit(&self, _combo: TrimCombo) {}
    fn combo_denoised(&self, _combo: TrimCombo) {}
    fn combo_failed(&self, _combo: TrimCombo, _error: &anyhow::Error) {}
    fn combo_skipped(&self, _combo: TrimCombo, _reason: &str) {}
    fn search_complete(&self, _combo: TrimCombo, _perc_identity: &str, _num_hits: usize) {}
    fn cell_complete(&self, _cell: &CellKey) {}
}

/// Forwards every milestone to the `log` facade
#[derive(Debug, Default)]
pub struct LogObserver;

impl SweepObserver for LogObserver {
    fn combo_started(&self, combo: TrimCombo) {
        info!("Denoising {combo}");
    }

    fn cache_hit(&self, combo: TrimCombo) {
        info!("Found denoised outputs for {combo}, skipping");
    }

    fn combo_denoised(&self, combo: TrimCombo) {
        info!("Finished denoising {combo}");
    }

    fn combo_failed(&self, combo: TrimCombo, error: &anyhow::Error) {
        warn!("Denoising failed for {combo}: {error:#}");
    }

    fn combo_skipped(&self, combo: TrimCombo, reason: &str) {
        warn!("Skipping {combo}: {reason}");
    }

    fn search_complete(&self, combo: TrimCombo, perc_identity: &str, num_hits: usize) {
        info!("{combo}, perc_identity={perc_identity}: {num_hits} hits");
    }

    fn cell_complete(&self, cell: &CellKey) {
        info!("Evaluated {cell}");
    }
}
