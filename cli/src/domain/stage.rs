//! Pipeline stages and the progress bar rendered for each of them.

use std::fmt;

/// Width of the `[####----]` bar in characters.
const BAR_WIDTH: usize = 20;

/// The ordered stages of a build run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    PrepareArchive,
    CreateInstance,
    WaitRunning,
    WaitPortOpen,
    WaitStable,
    StageSource,
    RunBuild,
    CollectArtifacts,
    DownloadArtifacts,
    PublishArtifacts,
}

impl Stage {
    pub const ALL: [Stage; 10] = [
        Stage::PrepareArchive,
        Stage::CreateInstance,
        Stage::WaitRunning,
        Stage::WaitPortOpen,
        Stage::WaitStable,
        Stage::StageSource,
        Stage::RunBuild,
        Stage::CollectArtifacts,
        Stage::DownloadArtifacts,
        Stage::PublishArtifacts,
    ];

    /// 1-based position in the pipeline.
    #[must_use]
    pub fn number(self) -> usize {
        Self::ALL.iter().position(|s| *s == self).map_or(0, |i| i + 1)
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::PrepareArchive => "prepare source archive",
            Self::CreateInstance => "create build server",
            Self::WaitRunning => "wait for server to be running",
            Self::WaitPortOpen => "wait for ssh port",
            Self::WaitStable => "wait for final boot",
            Self::StageSource => "stage source on server",
            Self::RunBuild => "run build",
            Self::CollectArtifacts => "collect artifacts",
            Self::DownloadArtifacts => "download artifacts",
            Self::PublishArtifacts => "publish release",
        }
    }

    /// Renders `[#####---------------] 3/10  30% <label>` for a run of `total` stages.
    #[must_use]
    pub fn progress_line(self, total: usize) -> String {
        let total = total.max(1);
        let n = self.number().min(total);
        let filled = n * BAR_WIDTH / total;
        let pct = n * 100 / total;
        format!(
            "[{}{}] {n}/{total} {pct:>3}% {}",
            "#".repeat(filled),
            "-".repeat(BAR_WIDTH - filled),
            self.label()
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
