use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Stage name → integer progress counter.
pub type ProgressMap = HashMap<String, i64>;

/// Stage name → per-file progress detail.
pub type ProgressDetailMap = HashMap<String, StageProgressDetail>;

/// Progress of one stage, broken down by input file index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageProgressDetail {
    #[serde(default)]
    pub file_progress: BTreeMap<u32, FileProgressDetail>,
}

impl StageProgressDetail {
    pub fn totals(&self) -> EntityCounts {
        self.file_progress
            .values()
            .fold(EntityCounts::default(), |acc, f| acc.merge(&f.entities))
    }

    /// Any file with failed entities, or one that could not be read at all.
    pub fn has_failures(&self) -> bool {
        self.file_progress.values().any(FileProgressDetail::is_failed)
    }
}

/// What happened to the entities of a single input file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileProgressDetail {
    #[serde(default)]
    pub entities: EntityCounts,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<String>,
}

impl FileProgressDetail {
    /// Marker for a file whose contents could not be read.
    pub const UNREADABLE: i64 = -1;

    pub fn unreadable(failure: impl Into<String>) -> Self {
        Self {
            entities: EntityCounts {
                total: 0,
                successful: Self::UNREADABLE,
                failed: 0,
            },
            duration_ms: 0,
            failures: vec![failure.into()],
        }
    }

    pub fn is_failed(&self) -> bool {
        self.entities.failed > 0 || self.entities.successful < 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCounts {
    pub total: i64,
    pub successful: i64,
    pub failed: i64,
}

impl EntityCounts {
    pub fn merge(self, other: &EntityCounts) -> Self {
        Self {
            total: self.total + other.total,
            successful: self.successful + other.successful,
            failed: self.failed + other.failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_sum_every_file() {
        let mut detail = StageProgressDetail::default();
        detail.file_progress.insert(
            0,
            FileProgressDetail {
                entities: EntityCounts { total: 10, successful: 9, failed: 1 },
                ..Default::default()
            },
        );
        detail.file_progress.insert(
            3,
            FileProgressDetail {
                entities: EntityCounts { total: 5, successful: 5, failed: 0 },
                ..Default::default()
            },
        );
        assert_eq!(
            detail.totals(),
            EntityCounts { total: 15, successful: 14, failed: 1 }
        );
    }

    #[test]
    fn unreadable_file_counts_as_failure() {
        let mut detail = StageProgressDetail::default();
        detail.file_progress.insert(0, FileProgressDetail::default());
        assert!(!detail.has_failures());
        detail
            .file_progress
            .insert(1, FileProgressDetail::unreadable("object not found"));
        assert!(detail.has_failures());
        assert_eq!(detail.file_progress[&1].entities.successful, -1);
    }

    #[test]
    fn detail_map_survives_json_with_integer_keys() {
        let mut detail = StageProgressDetail::default();
        detail.file_progress.insert(7, FileProgressDetail::default());
        let json = serde_json::to_value(&detail).unwrap();
        assert!(json["file_progress"].get("7").is_some());
        let back: StageProgressDetail = serde_json::from_value(json).unwrap();
        assert_eq!(back, detail);
    }
}
