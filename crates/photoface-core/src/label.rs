//! Labeling orchestration: single faces, whole clusters and interactive
//! cluster-by-cluster sessions.
//!
//! The store is checkpointed after every decision, so an interrupted session
//! keeps everything labeled so far.

use crate::cluster::cluster_store;
use crate::provider::EmbeddingSpace;
use crate::store::{Checkpointer, LabelError, StoreHandle};
use crate::types::{FaceId, UnlabeledFace};

/// What to do with one cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelDecision {
    /// Label every face in the cluster with this name.
    Name(String),
    /// Leave the cluster unlabeled and move on.
    Skip,
    /// End the session.
    Stop,
}

/// Source of names for an interactive session (terminal, GUI, script).
pub trait NamePrompt {
    /// `sample` holds up to `max_faces_per_prompt` faces of the cluster.
    fn ask(
        &mut self,
        cluster_no: usize,
        total: usize,
        cluster_size: usize,
        sample: &[UnlabeledFace],
    ) -> LabelDecision;
}

#[derive(Debug, Clone)]
pub struct LabelOptions {
    /// Clustering threshold; `None` uses the space's calibrated default.
    pub tolerance: Option<f32>,
    pub min_samples: usize,
    pub max_faces_per_prompt: usize,
}

impl Default for LabelOptions {
    fn default() -> Self {
        Self {
            tolerance: None,
            min_samples: 1,
            max_faces_per_prompt: 5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSessionReport {
    pub clusters: usize,
    pub labeled_clusters: usize,
    pub labeled_faces: usize,
    pub skipped_clusters: usize,
    pub stopped_early: bool,
    pub remaining: usize,
}

/// Label the unlabeled face at display `index`.
pub fn label_single(
    handle: &StoreHandle,
    checkpointer: &mut Checkpointer,
    index: usize,
    name: &str,
) -> Result<FaceId, LabelError> {
    let id = handle.with(|store| {
        let id = store.face_id_at(index).ok_or(LabelError::IndexOutOfRange {
            index,
            len: store.unlabeled_len(),
        })?;
        store.label_faces(&[id], name)?;
        Ok::<_, LabelError>(id)
    })?;

    tracing::info!(index, face = %id, name = name.trim(), "face labeled");
    checkpointer.checkpoint(handle, true);
    Ok(id)
}

/// Label every face of a cluster in one atomic step.
pub fn label_cluster(
    handle: &StoreHandle,
    checkpointer: &mut Checkpointer,
    ids: &[FaceId],
    name: &str,
) -> Result<usize, LabelError> {
    let labeled = handle.with(|store| store.label_faces(ids, name))?;
    tracing::info!(faces = labeled, name = name.trim(), "cluster labeled");
    checkpointer.checkpoint(handle, true);
    Ok(labeled)
}

/// Cluster the backlog in `space` and ask `prompt` for a name for each
/// cluster, largest first.
pub fn interactive_label<S, N>(
    handle: &StoreHandle,
    checkpointer: &mut Checkpointer,
    space: &S,
    prompt: &mut N,
    options: &LabelOptions,
) -> LabelSessionReport
where
    S: EmbeddingSpace + ?Sized,
    N: NamePrompt + ?Sized,
{
    let tolerance = options.tolerance.unwrap_or_else(|| space.default_tolerance());
    let clusters = handle.with(|store| cluster_store(store, space, tolerance, options.min_samples));
    let mut report = LabelSessionReport {
        clusters: clusters.len(),
        ..LabelSessionReport::default()
    };
    tracing::info!(clusters = clusters.len(), tolerance, "labeling: clusters built");

    for (i, ids) in clusters.iter().enumerate() {
        let sample: Vec<UnlabeledFace> = handle.with(|store| {
            ids.iter()
                .take(options.max_faces_per_prompt.max(1))
                .filter_map(|id| store.unlabeled_face(*id).cloned())
                .collect()
        });

        match prompt.ask(i + 1, clusters.len(), ids.len(), &sample) {
            LabelDecision::Stop => {
                report.stopped_early = true;
                break;
            }
            LabelDecision::Skip => {
                tracing::debug!(cluster = i + 1, "labeling: cluster skipped");
                report.skipped_clusters += 1;
            }
            LabelDecision::Name(name) => match label_cluster(handle, checkpointer, ids, &name) {
                Ok(n) => {
                    report.labeled_clusters += 1;
                    report.labeled_faces += n;
                }
                Err(e) => {
                    tracing::warn!(cluster = i + 1, error = %e, "labeling: cluster not labeled");
                    report.skipped_clusters += 1;
                }
            },
        }
    }

    report.remaining = handle.with(|store| store.unlabeled_len());
    tracing::info!(
        labeled = report.labeled_faces,
        remaining = report.remaining,
        "labeling: session complete"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Euclidean;
    use crate::store::FaceStore;
    use crate::types::{FaceEncoding, FaceLocation};
    use std::time::Duration;

    struct Scripted {
        answers: Vec<LabelDecision>,
        asked: Vec<(usize, usize)>,
    }

    impl NamePrompt for Scripted {
        fn ask(&mut self, cluster_no: usize, _total: usize, size: usize, _sample: &[UnlabeledFace]) -> LabelDecision {
            self.asked.push((cluster_no, size));
            if self.answers.is_empty() {
                LabelDecision::Stop
            } else {
                self.answers.remove(0)
            }
        }
    }

    fn setup(points: &[f32]) -> (tempfile::TempDir, StoreHandle, Checkpointer) {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FaceStore::new();
        for (i, p) in points.iter().enumerate() {
            store.add_unlabeled(format!("{i}.jpg"), FaceEncoding::new(vec![*p]), FaceLocation::new(0, 8, 8, 0));
        }
        let checkpointer = Checkpointer::new(dir.path().join("faces.json"), Duration::from_secs(3600));
        (dir, StoreHandle::new(store), checkpointer)
    }

    #[test]
    fn test_label_single_persists() {
        let (_dir, handle, mut checkpointer) = setup(&[0.0, 5.0]);
        let id = label_single(&handle, &mut checkpointer, 1, "Alice").unwrap();
        assert_eq!(id, FaceId(1));
        assert!(checkpointer.path().exists());

        let saved = FaceStore::load(checkpointer.path()).store;
        assert_eq!(saved.encodings_for("Alice").len(), 1);
        assert_eq!(saved.unlabeled_len(), 1);
    }

    #[test]
    fn test_label_single_out_of_range() {
        let (_dir, handle, mut checkpointer) = setup(&[0.0]);
        let err = label_single(&handle, &mut checkpointer, 3, "Alice").unwrap_err();
        assert_eq!(err, LabelError::IndexOutOfRange { index: 3, len: 1 });
        assert!(!checkpointer.path().exists());
    }

    #[test]
    fn test_label_cluster_removes_exact_members() {
        let (_dir, handle, mut checkpointer) = setup(&[0.0, 1.0, 2.0, 3.0, 4.0]);
        let ids: Vec<FaceId> = handle.with(|s| [4, 0, 2].iter().filter_map(|&i| s.face_id_at(i)).collect());

        assert_eq!(label_cluster(&handle, &mut checkpointer, &ids, "Bob"), Ok(3));
        let left: Vec<String> = handle.with(|s| s.unlabeled().map(|(_, f)| f.photo.clone()).collect());
        assert_eq!(left, ["1.jpg", "3.jpg"]);
    }

    #[test]
    fn test_interactive_session() {
        // Clusters at tolerance 0.6: {0,1,2} around 0, {3,4} around 10, {5} at 20.
        let (_dir, handle, mut checkpointer) = setup(&[0.0, 0.3, 0.5, 10.0, 10.2, 20.0]);
        let mut prompt = Scripted {
            answers: vec![
                LabelDecision::Name("Alice".into()),
                LabelDecision::Skip,
                LabelDecision::Name("Carol".into()),
            ],
            asked: Vec::new(),
        };

        let report = interactive_label(&handle, &mut checkpointer, &Euclidean, &mut prompt, &LabelOptions::default());

        assert_eq!(prompt.asked, vec![(1, 3), (2, 2), (3, 1)]);
        assert_eq!(report.clusters, 3);
        assert_eq!(report.labeled_clusters, 2);
        assert_eq!(report.labeled_faces, 4);
        assert_eq!(report.skipped_clusters, 1);
        assert_eq!(report.remaining, 2);
        assert!(!report.stopped_early);
        handle.with(|s| {
            assert_eq!(s.encodings_for("Alice").len(), 3);
            assert_eq!(s.encodings_for("Carol").len(), 1);
        });
    }

    #[test]
    fn test_interactive_stop_keeps_earlier_decisions() {
        let (_dir, handle, mut checkpointer) = setup(&[0.0, 10.0]);
        let mut prompt = Scripted {
            answers: vec![LabelDecision::Name("Dana".into()), LabelDecision::Stop],
            asked: Vec::new(),
        };

        let report = interactive_label(&handle, &mut checkpointer, &Euclidean, &mut prompt, &LabelOptions::default());
        assert!(report.stopped_early);
        assert_eq!(report.remaining, 1);

        let saved = FaceStore::load(checkpointer.path()).store;
        assert_eq!(saved.encodings_for("Dana").len(), 1);
    }

    #[test]
    fn test_interactive_blank_name_leaves_cluster() {
        let (_dir, handle, mut checkpointer) = setup(&[0.0]);
        let mut prompt = Scripted {
            answers: vec![LabelDecision::Name("  ".into())],
            asked: Vec::new(),
        };
        let report = interactive_label(&handle, &mut checkpointer, &Euclidean, &mut prompt, &LabelOptions::default());
        assert_eq!(report.labeled_faces, 0);
        assert_eq!(report.skipped_clusters, 1);
        assert_eq!(report.remaining, 1);
    }

    /// Same metric, wider default threshold.
    struct Wide;

    impl EmbeddingSpace for Wide {
        fn default_tolerance(&self) -> f32 {
            2.0
        }
    }

    #[test]
    fn test_interactive_uses_space_tolerance_unless_set() {
        let (_dir, handle, mut checkpointer) = setup(&[0.0, 1.5, 3.0]);
        let mut prompt = Scripted {
            answers: vec![LabelDecision::Skip],
            asked: Vec::new(),
        };
        let report = interactive_label(&handle, &mut checkpointer, &Wide, &mut prompt, &LabelOptions::default());
        assert_eq!(report.clusters, 1);
        assert_eq!(prompt.asked, vec![(1, 3)]);

        let narrow = LabelOptions {
            tolerance: Some(1.0),
            ..LabelOptions::default()
        };
        let report = interactive_label(&handle, &mut checkpointer, &Wide, &mut prompt, &narrow);
        assert_eq!(report.clusters, 3);
    }
}
