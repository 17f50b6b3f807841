//! Ordered background writes to the persistence backend.
//!
//! [`AnnotationWriter::run`] drains a queue of [`WriteJob`]s one at a
//! time, so a `clear_labels` queued after a `save_points` for the same
//! label always lands after it. Failures are logged and the next job
//! runs; nothing is retried. The loop exits once every sender is
//! dropped and the queue is empty.

use std::sync::Arc;

use segmark_core::annotation::Point;
use segmark_core::types::{FrameNumber, LabelId};
use segmark_persistence::{AnnotationPersistence, MaskCreate, PersistenceError};
use tokio::sync::mpsc;

/// One persistence write, in submission order.
#[derive(Debug, Clone)]
pub enum WriteJob {
    SavePoints {
        frame_number: FrameNumber,
        label_id: LabelId,
        points: Vec<Point>,
    },
    SaveMask {
        frame_number: FrameNumber,
        label_id: LabelId,
        mask: MaskCreate,
    },
    /// `None` clears every label on the frame.
    ClearLabels {
        frame_number: FrameNumber,
        label_id: Option<LabelId>,
    },
}

impl WriteJob {
    fn kind(&self) -> &'static str {
        match self {
            Self::SavePoints { .. } => "save_points",
            Self::SaveMask { .. } => "save_mask",
            Self::ClearLabels { .. } => "clear_labels",
        }
    }

    fn frame_number(&self) -> FrameNumber {
        match self {
            Self::SavePoints { frame_number, .. }
            | Self::SaveMask { frame_number, .. }
            | Self::ClearLabels { frame_number, .. } => *frame_number,
        }
    }

    fn label_id(&self) -> Option<LabelId> {
        match self {
            Self::SavePoints { label_id, .. } | Self::SaveMask { label_id, .. } => {
                Some(*label_id)
            }
            Self::ClearLabels { label_id, .. } => *label_id,
        }
    }
}

/// Background service applying [`WriteJob`]s sequentially.
pub struct AnnotationWriter;

impl AnnotationWriter {
    /// Run the write loop until `jobs` is closed and drained.
    pub async fn run<P: AnnotationPersistence>(
        persistence: Arc<P>,
        mut jobs: mpsc::UnboundedReceiver<WriteJob>,
    ) {
        while let Some(job) = jobs.recv().await {
            let kind = job.kind();
            let frame_number = job.frame_number();
            let label_id = job.label_id();

            match Self::apply(persistence.as_ref(), job).await {
                Ok(()) => {
                    tracing::debug!(
                        kind,
                        frame_number,
                        label_id = ?label_id,
                        "Persisted annotation write",
                    );
                }
                Err(e) => {
                    tracing::error!(
                        kind,
                        frame_number,
                        label_id = ?label_id,
                        error = %e,
                        "Failed to persist annotation write",
                    );
                }
            }
        }
        tracing::debug!("Annotation write queue closed");
    }

    async fn apply<P: AnnotationPersistence>(
        persistence: &P,
        job: WriteJob,
    ) -> Result<(), PersistenceError> {
        match job {
            WriteJob::SavePoints {
                frame_number,
                label_id,
                points,
            } => {
                persistence
                    .save_points(frame_number, label_id, points)
                    .await?;
            }
            WriteJob::SaveMask {
                frame_number,
                label_id,
                mask,
            } => {
                persistence.save_mask(frame_number, label_id, mask).await?;
            }
            WriteJob::ClearLabels {
                frame_number,
                label_id,
            } => {
                let cleared = persistence.clear_labels(frame_number, label_id).await?;
                tracing::debug!(
                    frame_number,
                    points_deleted = cleared.points_deleted,
                    masks_deleted = cleared.masks_deleted,
                    "Cleared persisted labels",
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use segmark_persistence::memory::MemoryPersistence;

    fn point(label_id: LabelId) -> Point {
        Point {
            id: uuid::Uuid::new_v4(),
            x: 0.5,
            y: 0.5,
            include: true,
            label_id,
        }
    }

    #[tokio::test]
    async fn clear_after_save_wins() {
        let persistence = Arc::new(MemoryPersistence::new().with_frame(0, 4, 4));
        let label = uuid::Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        tx.send(WriteJob::SavePoints {
            frame_number: 0,
            label_id: label,
            points: vec![point(label)],
        })
        .unwrap();
        tx.send(WriteJob::ClearLabels {
            frame_number: 0,
            label_id: Some(label),
        })
        .unwrap();
        drop(tx);

        AnnotationWriter::run(Arc::clone(&persistence), rx).await;
        assert!(persistence.stored_points(0, label).await.is_empty());
        assert_eq!(persistence.write_count(), 2);
    }

    #[tokio::test]
    async fn failed_job_does_not_stop_the_queue() {
        let persistence = Arc::new(MemoryPersistence::new().with_frame(0, 4, 4));
        persistence.set_fail_writes(true);
        let label = uuid::Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        for _ in 0..3 {
            tx.send(WriteJob::SavePoints {
                frame_number: 0,
                label_id: label,
                points: vec![point(label)],
            })
            .unwrap();
        }
        drop(tx);

        AnnotationWriter::run(Arc::clone(&persistence), rx).await;
        assert_eq!(persistence.write_count(), 3);
    }
}
