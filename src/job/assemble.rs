use chrono::Utc;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::checkpoint::Checkpoint;
use super::error::JobError;
use super::state::JobRun;
use crate::db::audio_files;
use crate::db::{NewSegment, SessionFactory, segments, speakers};
use crate::transcribe::diarize::SPEAKER_PALETTE;
use crate::transcribe::{ProgressTracker, RawSpan, SpeakerTurn, Stage, assign_speakers, speaker_styles};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssemblyReport {
    /// Segments written by this call
    pub appended: usize,
    /// Segments committed for the file afterwards
    pub committed: i64,
}

/// Turns engine spans into persisted segments, in batches.
///
/// Each batch is one transaction: the segment inserts and the cursor advance
/// commit together, so a crash leaves neither duplicates nor gaps.
#[derive(Debug, Clone)]
pub struct SegmentAssembler {
    sessions: SessionFactory,
    batch_size: usize,
}

impl SegmentAssembler {
    pub fn new(sessions: SessionFactory, batch_size: usize) -> Self {
        Self {
            sessions,
            batch_size: batch_size.max(1),
        }
    }

    /// Append the spans past the record's cursor. `spans` must be the full,
    /// sanitized list for the file; span `n` always becomes segment `n`.
    pub async fn assemble(
        &self,
        run: &JobRun,
        spans: &[RawSpan],
        checkpoint: &mut Checkpoint,
        tracker: &ProgressTracker,
    ) -> Result<AssemblyReport, JobError> {
        let (cursor, mut sequence) = {
            let mut conn = self.sessions.session().await?;
            let file = audio_files::fetch(&mut conn, run.file_id)
                .await?
                .ok_or(JobError::NotFound(run.file_id))?;
            if !run.owns(&file) {
                return Err(JobError::Superseded);
            }
            let next = segments::next_sequence(&mut conn, run.file_id).await?;
            (file.last_processed_segment, next)
        };

        if sequence != cursor {
            warn!(
                "File {} has cursor {} but next sequence {}; continuing after the highest sequence",
                run.file_id, cursor, sequence
            );
        }

        let total = spans.len() as i64;
        let start = cursor.clamp(0, total) as usize;
        if start > 0 {
            info!("File {}: {} segments already committed, resuming at span {}", run.file_id, cursor, start);
        }

        let mut committed = cursor;
        let mut appended = 0;

        for batch in spans[start..].chunks(self.batch_size) {
            let mut tx = self.sessions.transaction().await?;
            if !audio_files::fence(&mut *tx, run.file_id, run.generation, Utc::now()).await? {
                return Err(JobError::Superseded);
            }

            for span in batch {
                segments::insert(
                    &mut *tx,
                    &NewSegment {
                        audio_file_id: run.file_id,
                        sequence,
                        start_time: span.start,
                        end_time: span.end,
                        original_text: &span.text,
                    },
                )
                .await?;
                sequence += 1;
            }

            let next_cursor = committed + batch.len() as i64;
            let mut next_checkpoint = checkpoint.clone();
            next_checkpoint.last_segment_index = next_cursor;
            let rows = audio_files::advance_cursor(
                &mut *tx,
                run.file_id,
                run.generation,
                next_cursor,
                &next_checkpoint.to_json()?,
            )
            .await?;
            if rows == 0 {
                return Err(JobError::Superseded);
            }
            tx.commit().await?;

            *checkpoint = next_checkpoint;
            committed = next_cursor;
            appended += batch.len();
            debug!("File {}: committed segments up to {}", run.file_id, committed);

            tracker.emit_in(Stage::SavingSegments, committed as f64 / total.max(1) as f64);
        }

        tracker.emit_in(Stage::SavingSegments, 1.0);

        Ok(AssemblyReport { appended, committed })
    }

    /// Attach speakers to the file's segments. Only the speaker reference of
    /// each segment changes. Returns how many distinct speakers were used.
    pub async fn apply_speakers(
        &self,
        run: &JobRun,
        project_id: i64,
        turns: &[SpeakerTurn],
    ) -> Result<usize, JobError> {
        let mut tx = self.sessions.transaction().await?;
        if !audio_files::fence(&mut *tx, run.file_id, run.generation, Utc::now()).await? {
            return Err(JobError::Superseded);
        }

        let records = segments::list_for_file(&mut *tx, run.file_id).await?;
        let ranges: Vec<(f64, f64)> = records.iter().map(|s| (s.start_time, s.end_time)).collect();
        let labels = assign_speakers(&ranges, turns);
        let styles = speaker_styles(turns);

        let mut speaker_ids: HashMap<&str, i64> = HashMap::new();
        for (record, label) in records.iter().zip(labels) {
            let speaker_id = match label {
                Some(label) => match speaker_ids.get(label) {
                    Some(id) => Some(*id),
                    None => {
                        let (name, color) = styles
                            .get(label)
                            .map(|(name, color)| (name.clone(), *color))
                            .unwrap_or_else(|| (label.to_string(), SPEAKER_PALETTE[0]));
                        let id = speakers::ensure(&mut *tx, project_id, run.file_id, label, &name, color).await?;
                        speaker_ids.insert(label, id);
                        Some(id)
                    }
                },
                None => None,
            };
            segments::set_speaker(&mut *tx, record.id, speaker_id).await?;
        }

        tx.commit().await?;
        info!(
            "File {}: attributed {} segments to {} speakers",
            run.file_id,
            records.len(),
            speaker_ids.len()
        );
        Ok(speaker_ids.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::state::JobOptions;
    use crate::job::testing::{Harness, recording_tracker};
    use crate::transcribe::WhisperModel;
    use std::path::Path;

    fn spans(n: usize) -> Vec<RawSpan> {
        (0..n)
            .map(|i| RawSpan::new(i as f64, i as f64 + 1.0, format!("span {}", i)))
            .collect()
    }

    #[tokio::test]
    async fn test_batches_advance_cursor_with_segments() {
        let harness = Harness::new(vec![]).await;
        let file_id = harness.add_wav_file("a.wav").await;
        let claim = harness
            .state()
            .start(file_id, &JobOptions::new(WhisperModel::Tiny))
            .await
            .unwrap();
        let assembler = SegmentAssembler::new(harness.sessions(), 2);
        let mut checkpoint = Checkpoint::new(Path::new("/tmp/x.wav"), "tiny", None, false);
        let (tracker, _sink) = recording_tracker(0.0);

        let all = spans(5);
        let report = assembler.assemble(&claim.run, &all[..3], &mut checkpoint, &tracker).await.unwrap();
        assert_eq!(report, AssemblyReport { appended: 3, committed: 3 });
        assert_eq!(checkpoint.last_segment_index, 3);

        // The full list again only appends what is past the cursor.
        let report = assembler.assemble(&claim.run, &all, &mut checkpoint, &tracker).await.unwrap();
        assert_eq!(report, AssemblyReport { appended: 2, committed: 5 });

        let records = harness.segments(file_id).await;
        let sequences: Vec<i64> = records.iter().map(|s| s.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3, 4]);
        assert_eq!(records[3].original_text, "span 3");

        let file = harness.state().fetch(file_id).await.unwrap();
        assert_eq!(file.last_processed_segment, 5);
        let stored = Checkpoint::parse(file.processing_checkpoint.as_deref().unwrap()).unwrap();
        assert_eq!(stored.last_segment_index, 5);
    }

    #[tokio::test]
    async fn test_cancelled_run_stops_at_batch_boundary() {
        let harness = Harness::new(vec![]).await;
        let file_id = harness.add_wav_file("a.wav").await;
        let claim = harness
            .state()
            .start(file_id, &JobOptions::new(WhisperModel::Tiny))
            .await
            .unwrap();
        harness.state().cancel(file_id).await.unwrap();

        let assembler = SegmentAssembler::new(harness.sessions(), 2);
        let mut checkpoint = Checkpoint::new(Path::new("/tmp/x.wav"), "tiny", None, false);
        let (tracker, _sink) = recording_tracker(0.0);

        let err = assembler.assemble(&claim.run, &spans(3), &mut checkpoint, &tracker).await.unwrap_err();
        assert!(matches!(err, JobError::Superseded));
        assert!(harness.segments(file_id).await.is_empty());
    }

    #[tokio::test]
    async fn test_apply_speakers_reuses_labels() {
        let harness = Harness::new(vec![]).await;
        let file_id = harness.add_wav_file("a.wav").await;
        let claim = harness
            .state()
            .start(file_id, &JobOptions::new(WhisperModel::Tiny))
            .await
            .unwrap();
        let assembler = SegmentAssembler::new(harness.sessions(), 10);
        let mut checkpoint = Checkpoint::new(Path::new("/tmp/x.wav"), "tiny", None, true);
        let (tracker, _sink) = recording_tracker(0.0);
        assembler.assemble(&claim.run, &spans(4), &mut checkpoint, &tracker).await.unwrap();

        let turns = vec![
            SpeakerTurn::new("SPEAKER_00", 0.0, 2.0),
            SpeakerTurn::new("SPEAKER_01", 2.0, 3.0),
        ];
        let file = harness.state().fetch(file_id).await.unwrap();
        let used = assembler.apply_speakers(&claim.run, file.project_id, &turns).await.unwrap();
        assert_eq!(used, 2);

        let records = harness.segments(file_id).await;
        let names: Vec<Option<&str>> = records.iter().map(|s| s.speaker_name.as_deref()).collect();
        assert_eq!(names, vec![Some("Speaker 1"), Some("Speaker 1"), Some("Speaker 2"), None]);
        assert_eq!(records[0].original_text, "span 0");
        assert_eq!(records[0].end_time, 1.0);
    }
}
